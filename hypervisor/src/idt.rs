//! The host-mode IDT this VMM runs on once it is in root mode. Every vector
//! lands on one of 256 small stubs (`idt_stubs.S`) that capture the vector,
//! the error code, and the general-purpose registers, then call
//! [`common_interrupt_handler`]. An NMI arms NMI-window-exiting on the
//! current VMCS and returns to the interrupted host code; anything else is
//! a VMM bug and bugchecks with a full register dump.

use crate::{
    bugcheck::{bugcheck, BugcheckCode},
    per_cpu::PerCpuData,
    vcpu::{vmread, vmwrite},
};
use core::arch::global_asm;
use x86::{dtables::DescriptorTablePointer, irq::NONMASKABLE_INTERRUPT_VECTOR, segmentation::SegmentSelector, vmx::vmcs};

global_asm!(include_str!("idt_stubs.S"));

extern "efiapi" {
    /// The 256 stub entry points, emitted by `idt_stubs.S` in vector order.
    static isr_stub_table: [u64; 256];
}

const GATE_PRESENT: u16 = 1 << 15;
const GATE_TYPE_INTERRUPT: u16 = 0xE << 8;

/// A single 64-bit mode interrupt-gate descriptor (Intel SDM Figure 7-8).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist_and_flags: u16,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    fn new(handler: u64, selector: SegmentSelector) -> Self {
        Self {
            offset_low: handler as u16,
            selector: selector.bits(),
            ist_and_flags: GATE_PRESENT | GATE_TYPE_INTERRUPT,
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }
}

/// The 256-entry host IDT, owned by a [`crate::vcpu::Vcpu`] for its whole
/// life. Built once against that core's own host CS selector, since the
/// gate descriptor's `selector` field must name the code segment the stub
/// actually runs under.
#[derive(Debug)]
pub(crate) struct HostIdt {
    entries: alloc::boxed::Box<[IdtEntry; 256]>,
    idtr: DescriptorTablePointer<u64>,
}

impl Default for HostIdt {
    fn default() -> Self {
        Self { entries: alloc::boxed::Box::new([IdtEntry::default(); 256]), idtr: DescriptorTablePointer::default() }
    }
}

impl HostIdt {
    /// Fills every gate against `host_cs` and records the table's base and
    /// limit for [`Self::idtr`]. Must run after the host GDT carrying
    /// `host_cs` is already live, since the gate's selector is meaningless
    /// otherwise.
    pub(crate) fn initialize(&mut self, host_cs: SegmentSelector) {
        for vector in 0..256usize {
            // Safety: `isr_stub_table` is emitted by `idt_stubs.S` with
            // exactly 256 entries, one per vector, in order.
            let handler = unsafe { isr_stub_table[vector] };
            self.entries[vector] = IdtEntry::new(handler, host_cs);
        }

        self.idtr.base = self.entries.as_ptr().cast::<u64>();
        self.idtr.limit = u16::try_from(core::mem::size_of::<[IdtEntry; 256]>() - 1).unwrap();
    }

    pub(crate) fn idtr(&self) -> DescriptorTablePointer<u64> {
        self.idtr
    }
}

/// Every general-purpose register the common stub pushed, in the order the
/// stub pushed them (`isr_common_stub` in `idt_stubs.S`), used only to
/// print a bugcheck dump.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct SavedRegisters {
    rax: u64,
    rbx: u64,
    rcx: u64,
    rdx: u64,
    rsi: u64,
    rdi: u64,
    rbp: u64,
    r8: u64,
    r9: u64,
    r10: u64,
    r11: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

/// Called from `isr_common_stub` for every host-mode interrupt or
/// exception. An NMI is expected during normal operation (the platform can
/// deliver one at any time) and is handled by arming NMI-window-exiting on
/// the currently loaded VMCS so the next VM-exit re-injects it into the
/// guest; every other vector means host code itself faulted, which this
/// VMM has no recovery story for.
#[no_mangle]
extern "efiapi" fn common_interrupt_handler(vector: u64, error_code: u64, registers: *const SavedRegisters) {
    if vector == u64::from(NONMASKABLE_INTERRUPT_VECTOR) {
        const NMI_WINDOW_EXITING_FLAG: u64 = 1 << 22;
        let pin_based = vmread(vmcs::control::PINBASED_EXEC_CONTROLS);
        vmwrite(vmcs::control::PINBASED_EXEC_CONTROLS, pin_based | NMI_WINDOW_EXITING_FLAG);
        return;
    }

    // Safety: the stub always passes a pointer to the 15 GPRs it just
    // pushed, still live on this same stack; the hardware interrupt frame
    // (rip first) sits directly above them, past the vector and error
    // code the stub also pushed.
    let faulting_rip = unsafe { *(registers as *const u64).add(core::mem::size_of::<SavedRegisters>() / 8 + 2) };
    // Safety: a VMCS is loaded on this core by the time its IDT can fire.
    let core_id = unsafe { PerCpuData::current().core_id() };
    bugcheck(BugcheckCode::KmodeExceptionNotHandled, [vector, error_code, faulting_rip, u64::from(core_id)]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_descriptor_splits_the_handler_address_across_three_fields() {
        let handler = 0x1122_3344_5566_7788u64;
        let entry = IdtEntry::new(handler, SegmentSelector::from_raw(0x10));
        assert_eq!(entry.offset_low, 0x7788);
        assert_eq!(entry.offset_mid, 0x5566);
        assert_eq!(entry.offset_high, 0x1122_3344);
        assert_eq!(entry.selector, 0x10);
        assert_ne!(entry.ist_and_flags & GATE_PRESENT, 0);
    }
}
