//! The per-vCPU VMX lifecycle: VMXON/VMCS regions, the host GDT/TSS this VMM
//! runs on once in root mode, the MSR bitmap, and the "virtualize in place"
//! first entry that turns the currently executing core into a guest without
//! it ever noticing.

use crate::{
    bugcheck::{bugcheck, BugcheckCode},
    config::{MSR_HIGH_RANGE, MSR_LOW_RANGE, VMM_VPID},
    idt::HostIdt,
    x86_instructions::{cr0, cr0_write, cr3, cr4, cr4_write, rdmsr, sgdt, sidt, wrmsr},
};
use alloc::{boxed::Box, vec::Vec};
use core::{
    arch::{asm, global_asm},
    fmt,
};
use x86::{
    controlregs::{Cr0, Cr4},
    current::rflags::RFlags,
    dtables::DescriptorTablePointer,
    irq,
    msr::IA32_FEATURE_CONTROL,
    segmentation::{BuildDescriptor, Descriptor, DescriptorBuilder, GateDescriptorBuilder, SegmentSelector},
    vmx::vmcs,
};

const VMM_STACK_SIZE: usize = 32 * 1024;
/// Bytes reserved at the very top of the VMM stack: `[top - 8]` holds
/// `&mut GuestRegisters`, stashed once at setup so [`run_vm_host_resume`]
/// (see `vcpu_run_vm.S`) can recover it after the stack switch a VM-exit
/// performs. HOST_RSP is programmed to `top - 16` so nothing else collides
/// with the stashed pointer.
const VMM_STACK_RESERVED: usize = 16;

/// The collection of guest general-purpose register values not carried by
/// the VMCS. Laid out to match the field offsets `vcpu_run_vm.S` and
/// `vcpu_virtualize.S` index into directly.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub(crate) struct GuestRegisters {
    pub(crate) rax: u64,
    pub(crate) rbx: u64,
    pub(crate) rcx: u64,
    pub(crate) rdx: u64,
    pub(crate) rdi: u64,
    pub(crate) rsi: u64,
    pub(crate) rbp: u64,
    pub(crate) r8: u64,
    pub(crate) r9: u64,
    pub(crate) r10: u64,
    pub(crate) r11: u64,
    pub(crate) r12: u64,
    pub(crate) r13: u64,
    pub(crate) r14: u64,
    pub(crate) r15: u64,
}

const _: () = assert!(core::mem::offset_of!(GuestRegisters, rcx) == 16);
const _: () = assert!(core::mem::offset_of!(GuestRegisters, r15) == 112);

extern "efiapi" {
    /// Loads `*registers` into the real GPRs and executes VMLAUNCH (if
    /// `launched == 0`) or VMRESUME; on VM-exit, saves the guest's GPRs back
    /// into `*registers` and returns normally.
    fn run_vm(registers: *mut GuestRegisters, launched: u64) -> u64;

    /// The VM-exit continuation `run_vm` programs as HOST_RIP.
    static run_vm_host_resume: u8;

    /// Captures the calling context and performs the first VMLAUNCH;
    /// see `vcpu_virtualize.S`.
    fn vcpu_virtualize(vcpu: *mut Vcpu, populate: PopulateFn) -> u64;
}
global_asm!(include_str!("vcpu_run_vm.S"));
global_asm!(include_str!("vcpu_virtualize.S"));

type PopulateFn = extern "efiapi" fn(*mut Vcpu, u64, u64, u64) -> u64;

/// The basic VM-exit reasons this VMM distinguishes at the vCPU layer; the
/// dispatcher (`crate::vmexit`) maps these onto policy.
#[derive(Debug, Clone, Copy)]
pub(crate) enum VmExitReason {
    ExceptionOrNmi,
    TripleFault,
    InitSignal,
    StartupIpi,
    CrAccess,
    Rdmsr,
    Wrmsr,
    Cpuid,
    Xsetbv,
    Hlt,
    Vmcall,
    EptViolation,
    EptMisconfig,
    MonitorTrapFlag,
    NmiWindow,
    /// VMCLEAR/VMLAUNCH/VMPTRLD/VMPTRST/VMREAD/VMRESUME/VMWRITE/VMXOFF/VMXON/
    /// INVEPT/INVVPID executed by the guest: this VMM never lets a guest
    /// nest a second hypervisor under it, so every one of these fails the
    /// same way (`crate::vmexit::handle_vmx_instruction`).
    VmxInstruction,
    Unknown(u16),
}

impl From<u16> for VmExitReason {
    fn from(basic_exit_reason: u16) -> Self {
        match basic_exit_reason {
            0 => Self::ExceptionOrNmi,
            2 => Self::TripleFault,
            3 => Self::InitSignal,
            4 => Self::StartupIpi,
            8 => Self::NmiWindow,
            10 => Self::Cpuid,
            12 => Self::Hlt,
            18 => Self::Vmcall,
            19..=27 | 50 | 53 => Self::VmxInstruction,
            28 => Self::CrAccess,
            31 => Self::Rdmsr,
            32 => Self::Wrmsr,
            37 => Self::MonitorTrapFlag,
            48 => Self::EptViolation,
            49 => Self::EptMisconfig,
            55 => Self::Xsetbv,
            _ => Self::Unknown(basic_exit_reason),
        }
    }
}

/// The per-vCPU VMX state: the VMXON/VMCS regions, the MSR bitmap, the host
/// GDT/TSS this core uses while in root mode, the guest GPR cache, and the
/// dedicated VMM stack VM-exits land on.
pub(crate) struct Vcpu {
    vmxon_region: Box<Vmxon>,
    vmcs_region: Box<Vmcs>,
    msr_bitmap: Box<MsrBitmap>,
    host_gdt: HostGdt,
    host_idt: HostIdt,
    vmm_stack: Box<[u8; VMM_STACK_SIZE]>,
    registers: GuestRegisters,
    launched: bool,
    /// Set by a handler that emulated an instruction in place (CR/MSR
    /// access, CPUID, XSETBV); read and cleared by the exit-dispatch loop,
    /// which then advances guest RIP by `VMEXIT_INSTRUCTION_LEN`.
    skip_instruction: bool,
    /// Set by [`crate::hook::HookEngine::begin_single_step`] while this
    /// core's guest single-steps the original instruction at a hooked
    /// page; consumed by the following MTF exit via
    /// [`crate::hook::HookEngine::finish_single_step`].
    mtf_restore_point: Option<u64>,
}

impl fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vcpu").field("launched", &self.launched).field("registers", &self.registers).finish_non_exhaustive()
    }
}

impl Vcpu {
    pub(crate) fn new() -> Self {
        let vmxon_region = unsafe { Box::<Vmxon>::new_zeroed().assume_init() };
        let vmcs_region = unsafe { Box::<Vmcs>::new_zeroed().assume_init() };
        let msr_bitmap = Box::new(MsrBitmap::new());
        let vmm_stack = unsafe { Box::<[u8; VMM_STACK_SIZE]>::new_zeroed().assume_init() };

        Self {
            vmxon_region,
            vmcs_region,
            msr_bitmap,
            host_gdt: HostGdt::default(),
            host_idt: HostIdt::default(),
            vmm_stack,
            registers: GuestRegisters::default(),
            launched: false,
            skip_instruction: false,
            mtf_restore_point: None,
        }
    }

    /// Entering VMX root operation: CR4.VMXE, the `IA32_FEATURE_CONTROL` and
    /// CR0 fixups every VMXON caller needs, then VMXON itself.
    pub(crate) fn enable(&mut self) {
        cr4_write(cr4() | Cr4::CR4_ENABLE_VMX);
        adjust_feature_control_msr();
        adjust_cr0();

        let revision_id = rdmsr(x86::msr::IA32_VMX_BASIC) as u32;
        self.vmxon_region.revision_id = revision_id;
        vmxon(&mut self.vmxon_region);
    }

    /// Programs every VMCS field that does not depend on the specific
    /// instant virtualization happens: host state, VPID, EPT, MSR bitmap,
    /// and the exception bitmap. Guest RIP/RSP/RFLAGS and general-purpose
    /// registers are filled in by [`Vcpu::virtualize_current_context`].
    pub(crate) fn initialize(&mut self, eptp: u64) {
        const SECONDARY_CONTROLS_FLAG: u64 = 1 << 31;
        const HOST_ADDRESS_SPACE_SIZE_FLAG: u64 = 1 << 9;
        const IA32E_MODE_GUEST_FLAG: u64 = 1 << 9;
        const ENABLE_EPT_FLAG: u64 = 1 << 1;
        const ENABLE_VPID_FLAG: u64 = 1 << 5;
        const ENABLE_RDTSCP_FLAG: u64 = 1 << 3;
        const ENABLE_INVPCID_FLAG: u64 = 1 << 12;
        const ENABLE_XSAVES_XRSTORS_FLAG: u64 = 1 << 20;
        const USE_MSR_BITMAPS_FLAG: u64 = 1 << 28;

        vmclear(&mut self.vmcs_region);
        self.vmcs_region.revision_id = self.vmxon_region.revision_id;
        vmptrld(&mut self.vmcs_region);

        self.host_gdt.initialize_from_current();
        self.host_idt.initialize(self.host_gdt.cs);
        let idtr = self.host_idt.idtr();
        vmwrite(vmcs::host::CS_SELECTOR, self.host_gdt.cs.bits());
        vmwrite(vmcs::host::TR_SELECTOR, self.host_gdt.tr.bits());
        vmwrite(vmcs::host::CR0, cr0().bits() as u64);
        vmwrite(vmcs::host::CR3, cr3());
        vmwrite(vmcs::host::CR4, cr4().bits() as u64);
        vmwrite(vmcs::host::TR_BASE, self.host_gdt.tss.0.as_ptr() as u64);
        vmwrite(vmcs::host::GDTR_BASE, self.host_gdt.gdtr.base as u64);
        vmwrite(vmcs::host::IDTR_BASE, idtr.base as u64);

        let stack_base = self.vmm_stack.as_ptr() as u64;
        let stack_top = stack_base + VMM_STACK_SIZE as u64;
        let host_rsp = stack_top - VMM_STACK_RESERVED as u64;
        // Safety: `host_rsp + 8` lands inside `self.vmm_stack`, which outlives
        // this vCPU; `run_vm_host_resume` reads it back the same way.
        unsafe { (host_rsp as *mut u64).add(1).write(core::ptr::addr_of_mut!(self.registers) as u64) };
        vmwrite(vmcs::host::RSP, host_rsp);
        // Safety: `run_vm_host_resume` is a real symbol defined in `vcpu_run_vm.S`.
        vmwrite(vmcs::host::RIP, unsafe { core::ptr::addr_of!(run_vm_host_resume) } as u64);

        vmwrite(vmcs::control::VMEXIT_CONTROLS, adjust_vmx_control(VmxControl::VmExit, HOST_ADDRESS_SPACE_SIZE_FLAG));
        vmwrite(vmcs::control::VMENTRY_CONTROLS, adjust_vmx_control(VmxControl::VmEntry, IA32E_MODE_GUEST_FLAG));
        vmwrite(vmcs::control::PINBASED_EXEC_CONTROLS, adjust_vmx_control(VmxControl::PinBased, 0));
        vmwrite(
            vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
            adjust_vmx_control(VmxControl::ProcessorBased, SECONDARY_CONTROLS_FLAG | USE_MSR_BITMAPS_FLAG),
        );
        vmwrite(
            vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS,
            adjust_vmx_control(
                VmxControl::ProcessorBased2,
                ENABLE_EPT_FLAG | ENABLE_VPID_FLAG | ENABLE_RDTSCP_FLAG | ENABLE_INVPCID_FLAG | ENABLE_XSAVES_XRSTORS_FLAG,
            ),
        );
        vmwrite(vmcs::control::EPTP_FULL, eptp);
        vmwrite(vmcs::control::VPID, u64::from(VMM_VPID));

        // Trap every MSR the exit dispatcher is prepared to filter: the
        // full low and high ranges (an MSR outside both unconditionally
        // VM-exits on real hardware, so the reserved range needs no bitmap
        // entry of its own). IA32_FEATURE_CONTROL already falls inside the
        // low range; intercepted again explicitly to name it.
        for msr in MSR_LOW_RANGE {
            self.intercept_msr(msr);
        }
        for msr in MSR_HIGH_RANGE {
            self.intercept_msr(msr);
        }
        self.intercept_msr(IA32_FEATURE_CONTROL);

        vmwrite(vmcs::control::MSR_BITMAPS_ADDR_FULL, core::ptr::addr_of!(*self.msr_bitmap) as u64);

        // Intercept only #DE; every other guest exception passes through
        // untouched (see `crate::vmexit::handle_exception_or_nmi`).
        vmwrite(vmcs::control::EXCEPTION_BITMAP, 1u64 << irq::DIVIDE_ERROR_VECTOR);

        vmwrite(vmcs::guest::LINK_PTR_FULL, u64::MAX);
    }

    /// Marks an MSR so RDMSR/WRMSR on it causes a VM-exit instead of
    /// executing directly; used for the filtered ranges `spec.md` §4.7
    /// requires plus `IA32_FEATURE_CONTROL`.
    pub(crate) fn intercept_msr(&mut self, msr: u32) {
        self.msr_bitmap.set_intercept_read(msr);
        self.msr_bitmap.set_intercept_write(msr);
    }

    /// Captures the calling context and becomes the guest running it,
    /// turning the currently executing core into a virtualized copy of
    /// itself. On success this returns normally, exactly once, with the
    /// machine now running the guest: the caller cannot tell the
    /// difference from an ordinary call. On failure it bugchecks instead
    /// of returning an error, since there is no sane fallback once VMXON
    /// has already committed this core to VMX root operation.
    pub(crate) fn virtualize_current_context(&mut self) {
        let status = unsafe { vcpu_virtualize(core::ptr::addr_of_mut!(*self), populate_guest_state_in_place) };
        if status != 0 {
            bugcheck(BugcheckCode::VmxError, [status, 0, 0, 0]);
        }
    }

    /// Runs the guest until the next VM-exit and returns its basic reason.
    /// Must only be called after [`Vcpu::virtualize_current_context`] has
    /// successfully entered the guest once.
    pub(crate) fn run(&mut self) -> VmExitReason {
        let flags = unsafe { run_vm(core::ptr::addr_of_mut!(self.registers), u64::from(self.launched)) };
        if let Err(err) = vm_succeed(RFlags::from_raw(flags)) {
            bugcheck(BugcheckCode::VmxError, [err, 0, 0, 0]);
        }
        self.launched = true;

        VmExitReason::from(vmread(vmcs::ro::EXIT_REASON) as u16)
    }

    pub(crate) fn registers(&mut self) -> &mut GuestRegisters {
        &mut self.registers
    }

    /// Requests that the dispatch loop advance guest RIP by
    /// `VMEXIT_INSTRUCTION_LEN` after the current handler returns, because
    /// it fully emulated the trapping instruction rather than re-executing it.
    pub(crate) fn request_instruction_skip(&mut self) {
        self.skip_instruction = true;
    }

    /// Clears and returns whether [`Vcpu::request_instruction_skip`] was
    /// called since the last time this was read.
    pub(crate) fn take_instruction_skip(&mut self) -> bool {
        core::mem::take(&mut self.skip_instruction)
    }

    pub(crate) fn mtf_restore_point(&mut self) -> &mut Option<u64> {
        &mut self.mtf_restore_point
    }
}

/// Fills in the guest-state VMCS fields (RIP/RSP/RFLAGS plus the control
/// registers, segments and descriptor tables this core is actually running
/// with) so VMLAUNCH resumes exactly where `vcpu_virtualize` was called.
/// Returns 0 on success, a nonzero `VM_INSTRUCTION_ERROR`-shaped status on
/// failure (surfaced by `vcpu_virtualize` if VMLAUNCH itself later fails).
extern "efiapi" fn populate_guest_state_in_place(vcpu: *mut Vcpu, resume_rip: u64, resume_rsp: u64, rflags: u64) -> u64 {
    // Safety: `vcpu` is the object `vcpu_virtualize` was called on; it is
    // still alive and uniquely borrowed for the duration of this callback.
    let vcpu = unsafe { &mut *vcpu };

    let cs = x86::segmentation::cs();
    let ss = x86::segmentation::SegmentSelector::from_raw(unsafe { current_segment_selector(Segment::Ss) });
    let ds = x86::segmentation::SegmentSelector::from_raw(unsafe { current_segment_selector(Segment::Ds) });
    let es = x86::segmentation::SegmentSelector::from_raw(unsafe { current_segment_selector(Segment::Es) });
    let fs = x86::segmentation::SegmentSelector::from_raw(unsafe { current_segment_selector(Segment::Fs) });
    let gs = x86::segmentation::SegmentSelector::from_raw(unsafe { current_segment_selector(Segment::Gs) });
    let ldtr = x86::dtables::ldtr();
    let tr = x86::task::tr();

    let mut gdtr = DescriptorTablePointer::<u64>::default();
    sgdt(&mut gdtr);
    let mut idtr = DescriptorTablePointer::<u64>::default();
    sidt(&mut idtr);

    vmwrite(vmcs::guest::ES_SELECTOR, es.bits());
    vmwrite(vmcs::guest::CS_SELECTOR, cs.bits());
    vmwrite(vmcs::guest::SS_SELECTOR, ss.bits());
    vmwrite(vmcs::guest::DS_SELECTOR, ds.bits());
    vmwrite(vmcs::guest::FS_SELECTOR, fs.bits());
    vmwrite(vmcs::guest::GS_SELECTOR, gs.bits());
    vmwrite(vmcs::guest::LDTR_SELECTOR, ldtr.bits());
    vmwrite(vmcs::guest::TR_SELECTOR, tr.bits());

    let gdt_base = gdtr.base as u64;
    vmwrite(vmcs::guest::ES_ACCESS_RIGHTS, get_segment_access_right(gdt_base, es.bits()));
    vmwrite(vmcs::guest::CS_ACCESS_RIGHTS, get_segment_access_right(gdt_base, cs.bits()));
    vmwrite(vmcs::guest::SS_ACCESS_RIGHTS, get_segment_access_right(gdt_base, ss.bits()));
    vmwrite(vmcs::guest::DS_ACCESS_RIGHTS, get_segment_access_right(gdt_base, ds.bits()));
    vmwrite(vmcs::guest::FS_ACCESS_RIGHTS, get_segment_access_right(gdt_base, fs.bits()));
    vmwrite(vmcs::guest::GS_ACCESS_RIGHTS, get_segment_access_right(gdt_base, gs.bits()));
    vmwrite(vmcs::guest::LDTR_ACCESS_RIGHTS, get_segment_access_right(gdt_base, ldtr.bits()));
    vmwrite(vmcs::guest::TR_ACCESS_RIGHTS, get_segment_access_right(gdt_base, tr.bits()));

    vmwrite(vmcs::guest::ES_LIMIT, get_segment_limit(gdt_base, es.bits()));
    vmwrite(vmcs::guest::CS_LIMIT, get_segment_limit(gdt_base, cs.bits()));
    vmwrite(vmcs::guest::SS_LIMIT, get_segment_limit(gdt_base, ss.bits()));
    vmwrite(vmcs::guest::DS_LIMIT, get_segment_limit(gdt_base, ds.bits()));
    vmwrite(vmcs::guest::FS_LIMIT, get_segment_limit(gdt_base, fs.bits()));
    vmwrite(vmcs::guest::GS_LIMIT, get_segment_limit(gdt_base, gs.bits()));
    vmwrite(vmcs::guest::LDTR_LIMIT, get_segment_limit(gdt_base, ldtr.bits()));
    vmwrite(vmcs::guest::TR_LIMIT, get_segment_limit(gdt_base, tr.bits()));
    vmwrite(vmcs::guest::GDTR_LIMIT, u64::from(gdtr.limit));
    vmwrite(vmcs::guest::IDTR_LIMIT, u64::from(idtr.limit));

    vmwrite(vmcs::guest::FS_BASE, rdmsr(x86::msr::IA32_FS_BASE));
    vmwrite(vmcs::guest::GS_BASE, rdmsr(x86::msr::IA32_GS_BASE));
    vmwrite(vmcs::guest::TR_BASE, 0);
    vmwrite(vmcs::guest::LDTR_BASE, 0);
    vmwrite(vmcs::guest::GDTR_BASE, gdtr.base as u64);
    vmwrite(vmcs::guest::IDTR_BASE, idtr.base as u64);

    vmwrite(vmcs::guest::IA32_SYSENTER_CS, rdmsr(x86::msr::IA32_SYSENTER_CS));
    vmwrite(vmcs::guest::IA32_SYSENTER_ESP, rdmsr(x86::msr::IA32_SYSENTER_ESP));
    vmwrite(vmcs::guest::IA32_SYSENTER_EIP, rdmsr(x86::msr::IA32_SYSENTER_EIP));
    vmwrite(vmcs::guest::IA32_EFER_FULL, rdmsr(x86::msr::IA32_EFER));

    vmwrite(vmcs::guest::CR0, cr0().bits() as u64);
    vmwrite(vmcs::guest::CR3, cr3());
    vmwrite(vmcs::guest::CR4, cr4().bits() as u64);
    vmwrite(vmcs::guest::RIP, resume_rip);
    vmwrite(vmcs::guest::RSP, resume_rsp);
    vmwrite(vmcs::guest::RFLAGS, rflags);

    vcpu.registers.rflags_unused_marker();
    0
}

impl GuestRegisters {
    /// No field for RFLAGS exists here: it lives in the VMCS, not the GPR
    /// cache. This no-op exists only so `populate_guest_state_in_place`
    /// reads as symmetrical with the VMCS writes above it.
    fn rflags_unused_marker(&self) {}
}

#[derive(Clone, Copy)]
enum Segment {
    Ss,
    Ds,
    Es,
    Fs,
    Gs,
}

/// Reads a segment selector the `x86` crate does not expose an accessor for.
///
/// # Safety
///
/// Always safe at CPL0; these are ordinary MOV-from-segment-register reads.
unsafe fn current_segment_selector(segment: Segment) -> u16 {
    let value: u16;
    match segment {
        Segment::Ss => asm!("mov {0:x}, ss", out(reg) value, options(nomem, nostack, preserves_flags)),
        Segment::Ds => asm!("mov {0:x}, ds", out(reg) value, options(nomem, nostack, preserves_flags)),
        Segment::Es => asm!("mov {0:x}, es", out(reg) value, options(nomem, nostack, preserves_flags)),
        Segment::Fs => asm!("mov {0:x}, fs", out(reg) value, options(nomem, nostack, preserves_flags)),
        Segment::Gs => asm!("mov {0:x}, gs", out(reg) value, options(nomem, nostack, preserves_flags)),
    }
    value
}

/// The region of memory the logical processor uses to support VMX operation.
///
/// See: 25.11.5 VMXON Region
#[repr(C, align(4096))]
struct Vmxon {
    revision_id: u32,
    data: [u8; 4092],
}
const _: () = assert!(size_of::<Vmxon>() == 0x1000);

/// The region of memory representing a virtual CPU (VMCS).
///
/// See: 25.2 FORMAT OF THE VMCS REGION
#[repr(C, align(4096))]
struct Vmcs {
    revision_id: u32,
    abort_indicator: u32,
    data: [u8; 4088],
}
const _: () = assert!(size_of::<Vmcs>() == 0x1000);

/// RDMSR/WRMSR intercept bitmap: four 1-KiB regions (read-low, read-high,
/// write-low, write-high), covering MSRs `0..0x1FFF` and `0xC000_0000..0xC000_1FFF`.
///
/// See: 25.6.9 MSR-Bitmap Address
#[repr(C, align(4096))]
struct MsrBitmap {
    read_low: [u8; 1024],
    read_high: [u8; 1024],
    write_low: [u8; 1024],
    write_high: [u8; 1024],
}
const _: () = assert!(size_of::<MsrBitmap>() == 0x1000);

impl MsrBitmap {
    fn new() -> Self {
        Self { read_low: [0; 1024], read_high: [0; 1024], write_low: [0; 1024], write_high: [0; 1024] }
    }

    fn set_intercept_read(&mut self, msr: u32) {
        Self::set_bit(&mut self.read_low, &mut self.read_high, msr);
    }

    fn set_intercept_write(&mut self, msr: u32) {
        Self::set_bit(&mut self.write_low, &mut self.write_high, msr);
    }

    fn set_bit(low: &mut [u8; 1024], high: &mut [u8; 1024], msr: u32) {
        let (region, index) = if msr < 0x2000 {
            (low, msr)
        } else if (0xC000_0000..0xC000_2000).contains(&msr) {
            (high, msr - 0xC000_0000)
        } else {
            return;
        };
        region[(index / 8) as usize] |= 1 << (index % 8);
    }
}

/// The host GDT/TSS this VMM runs on while in root mode: a clone of the
/// current GDT with one extra TSS descriptor appended, since the UEFI
/// DXE-phase TR is zero and VMX host state requires a nonzero one.
///
/// "The selector fields for CS and TR cannot be 0000H."
/// See: 27.2.3 Checks on Host Segment and Descriptor-Table Registers
#[repr(C, align(16))]
struct HostGdt {
    gdt: Vec<u64>,
    gdtr: DescriptorTablePointer<u64>,
    tss: TaskStateSegment,
    tr: SegmentSelector,
    cs: SegmentSelector,
}

impl Default for HostGdt {
    fn default() -> Self {
        Self {
            gdt: Vec::new(),
            gdtr: DescriptorTablePointer::<u64>::default(),
            tss: TaskStateSegment([0; 104]),
            tr: SegmentSelector::from_raw(0),
            cs: SegmentSelector::from_raw(0),
        }
    }
}

impl HostGdt {
    fn initialize_from_current(&mut self) {
        let mut current_gdtr = DescriptorTablePointer::<u64>::default();
        sgdt(&mut current_gdtr);
        let current_gdt = unsafe {
            core::slice::from_raw_parts(current_gdtr.base.cast::<u64>(), usize::from(current_gdtr.limit + 1) / 8)
        };
        self.gdt = current_gdt.to_vec();
        self.gdt.push(task_segment_descriptor(&self.tss));

        self.gdtr.base = self.gdt.as_ptr();
        self.gdtr.limit = u16::try_from(self.gdt.len() * 8 - 1).unwrap();

        let tr_index = self.gdt.len() as u16 - 1;
        self.tr = SegmentSelector::new(tr_index, x86::Ring::Ring0);
        self.cs = x86::segmentation::cs();
    }
}

/// See: Figure 8-11. 64-Bit TSS Format
struct TaskStateSegment([u8; 104]);

fn task_segment_descriptor(tss: &TaskStateSegment) -> u64 {
    let tss_size = size_of::<TaskStateSegment>() as u64;
    let tss_base = core::ptr::from_ref::<TaskStateSegment>(tss) as u64;
    let tss_descriptor =
        <DescriptorBuilder as GateDescriptorBuilder<u32>>::tss_descriptor(tss_base, tss_size - 1, true)
            .present()
            .dpl(x86::Ring::Ring0)
            .finish();
    unsafe { core::mem::transmute::<Descriptor, u64>(tss_descriptor) }
}

#[derive(Clone, Copy)]
enum VmxControl {
    PinBased,
    ProcessorBased,
    ProcessorBased2,
    VmExit,
    VmEntry,
}

/// Returns an adjusted value for a VMX control field according to its
/// capability MSR's allowed-0/allowed-1 fixup rule (Intel SDM Appendix A.3).
fn adjust_vmx_control(control: VmxControl, requested_value: u64) -> u64 {
    const VMX_CONTROLS_FLAG: u64 = 1 << 55;

    let vmx_basic = rdmsr(x86::msr::IA32_VMX_BASIC);
    let true_cap_msr_supported = (vmx_basic & VMX_CONTROLS_FLAG) != 0;

    let cap_msr = match (control, true_cap_msr_supported) {
        (VmxControl::PinBased, true) => x86::msr::IA32_VMX_TRUE_PINBASED_CTLS,
        (VmxControl::PinBased, false) => x86::msr::IA32_VMX_PINBASED_CTLS,
        (VmxControl::ProcessorBased, true) => x86::msr::IA32_VMX_TRUE_PROCBASED_CTLS,
        (VmxControl::ProcessorBased, false) => x86::msr::IA32_VMX_PROCBASED_CTLS,
        (VmxControl::VmExit, true) => x86::msr::IA32_VMX_TRUE_EXIT_CTLS,
        (VmxControl::VmExit, false) => x86::msr::IA32_VMX_EXIT_CTLS,
        (VmxControl::VmEntry, true) => x86::msr::IA32_VMX_TRUE_ENTRY_CTLS,
        (VmxControl::VmEntry, false) => x86::msr::IA32_VMX_ENTRY_CTLS,
        (VmxControl::ProcessorBased2, _) => x86::msr::IA32_VMX_PROCBASED_CTLS2,
    };

    let capabilities = rdmsr(cap_msr);
    let allowed0 = capabilities as u32;
    let allowed1 = (capabilities >> 32) as u32;
    let mut effective_value = u32::try_from(requested_value).unwrap();
    effective_value |= allowed0;
    effective_value &= allowed1;
    u64::from(effective_value)
}

fn adjust_feature_control_msr() {
    const LOCK_BIT_FLAG: u64 = 1 << 0;
    const ENABLE_VMX_OUTSIDE_SMX_FLAG: u64 = 1 << 2;

    let feature_control = rdmsr(x86::msr::IA32_FEATURE_CONTROL);
    if (feature_control & LOCK_BIT_FLAG) == 0 {
        wrmsr(x86::msr::IA32_FEATURE_CONTROL, feature_control | ENABLE_VMX_OUTSIDE_SMX_FLAG | LOCK_BIT_FLAG);
    }
}

fn adjust_cr0() {
    let fixed0cr0 = rdmsr(x86::msr::IA32_VMX_CR0_FIXED0);
    let fixed1cr0 = rdmsr(x86::msr::IA32_VMX_CR0_FIXED1);
    let mut new_cr0 = cr0().bits() as u64;
    new_cr0 &= fixed1cr0;
    new_cr0 |= fixed0cr0;
    cr0_write(Cr0::from_bits_truncate(new_cr0 as usize));
}

fn get_segment_descriptor_value(table_base: u64, selector: u16) -> u64 {
    let sel = SegmentSelector::from_raw(selector);
    let descriptor_addr = table_base + u64::from(sel.index() * 8);
    unsafe { *(descriptor_addr as *const u64) }
}

fn get_segment_access_right(table_base: u64, selector: u16) -> u32 {
    const UNUSABLE_FLAG: u32 = 1 << 16;
    let sel = SegmentSelector::from_raw(selector);
    if sel.index() == 0 && (sel.bits() >> 2) == 0 {
        return UNUSABLE_FLAG;
    }
    let descriptor_value = get_segment_descriptor_value(table_base, selector);
    let ar = (descriptor_value >> 40) as u32;
    ar & 0b1111_0000_1111_1111
}

fn get_segment_limit(table_base: u64, selector: u16) -> u32 {
    let sel = SegmentSelector::from_raw(selector);
    if sel.index() == 0 && (sel.bits() >> 2) == 0 {
        return 0;
    }
    let descriptor_value = get_segment_descriptor_value(table_base, selector);
    let limit_low = descriptor_value & 0xffff;
    let limit_high = (descriptor_value >> (32 + 16)) & 0xF;
    let mut limit = limit_low | (limit_high << 16);
    if ((descriptor_value >> (32 + 23)) & 0x01) != 0 {
        limit = ((limit + 1) << 12) - 1;
    }
    limit as u32
}

fn vmxon(vmxon_region: &mut Vmxon) {
    unsafe { x86::bits64::vmx::vmxon(core::ptr::from_mut(vmxon_region) as u64).unwrap() };
}

fn vmclear(vmcs_region: &mut Vmcs) {
    unsafe { x86::bits64::vmx::vmclear(core::ptr::from_mut(vmcs_region) as u64).unwrap() };
}

fn vmptrld(vmcs_region: &mut Vmcs) {
    unsafe { x86::bits64::vmx::vmptrld(core::ptr::from_mut(vmcs_region) as u64).unwrap() }
}

/// Reads a field of the VMCS currently loaded on this core (`vmexit`'s
/// handlers call this directly; exactly one VMCS is ever loaded per core,
/// set up once by [`Vcpu::initialize`] and never swapped).
pub(crate) fn vmread(field: u32) -> u64 {
    unsafe { x86::bits64::vmx::vmread(field) }.unwrap_or(0)
}

/// Writes a field of the VMCS currently loaded on this core.
pub(crate) fn vmwrite<T: Into<u64>>(field: u32, val: T)
where
    u64: From<T>,
{
    unsafe { x86::bits64::vmx::vmwrite(field, u64::from(val)) }.unwrap();
}

/// The type of invalidation the INVEPT/INVVPID instruction performs.
///
/// See: 29.4.3.1 Operations that Invalidate Cached Mappings
#[repr(u64)]
enum InveptType {
    SingleContext = 1,
    AllContext = 2,
}

#[repr(u64)]
enum InvvpidType {
    IndividualAddress = 0,
    SingleContext = 1,
    AllContexts = 2,
}

#[repr(C)]
struct InveptDescriptor {
    eptp: u64,
    _reserved: u64,
}

#[repr(C)]
struct InvvpidDescriptor {
    vpid: u64,
    _reserved: u64,
    linear_address: u64,
}

fn invept(invalidation: InveptType, eptp: u64) {
    let descriptor = InveptDescriptor { eptp, _reserved: 0 };
    let flags = unsafe {
        let flags: u64;
        asm!("invept {0}, [{1}]", "pushfq", "pop {2}", in(reg) invalidation as u64, in(reg) &descriptor, lateout(reg) flags);
        flags
    };
    if let Err(err) = vm_succeed(RFlags::from_raw(flags)) {
        bugcheck(BugcheckCode::VmxError, [err, 0, 0, 0]);
    }
}

fn invvpid(invalidation: InvvpidType, vpid: u16) {
    let descriptor = InvvpidDescriptor { vpid: u64::from(vpid), _reserved: 0, linear_address: 0 };
    let flags = unsafe {
        let flags: u64;
        asm!("invvpid {0}, [{1}]", "pushfq", "pop {2}", in(reg) invalidation as u64, in(reg) &descriptor, lateout(reg) flags);
        flags
    };
    if let Err(err) = vm_succeed(RFlags::from_raw(flags)) {
        bugcheck(BugcheckCode::VmxError, [err, 0, 0, 0]);
    }
}

/// Single-context INVEPT for `eptp`; called by [`crate::ept::Ept`] after
/// every PML1 rewrite so stale translations never survive a hook flip.
pub(crate) fn invept_single_context(eptp: u64) {
    invept(InveptType::SingleContext, eptp);
}

/// All-context INVEPT; used by hypercall #3.
pub(crate) fn invept_all_contexts() {
    invept(InveptType::AllContext, 0);
}

/// Single-context INVVPID for the one VPID tag this VMM ever uses.
pub(crate) fn invvpid_single_context() {
    invvpid(InvvpidType::SingleContext, VMM_VPID);
}

fn vm_succeed(flags: RFlags) -> Result<(), u64> {
    if flags.contains(RFlags::FLAGS_ZF) {
        Err(vmread(vmcs::ro::VM_INSTRUCTION_ERROR))
    } else if flags.contains(RFlags::FLAGS_CF) {
        Err(u64::MAX)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msr_bitmap_sets_the_matching_low_or_high_region() {
        let mut bitmap = MsrBitmap::new();
        bitmap.set_intercept_read(0x17A); // IA32_FEATURE_CONTROL
        assert_ne!(bitmap.read_low[(0x17A / 8)], 0);
        assert_eq!(bitmap.read_high, [0u8; 1024]);

        bitmap.set_intercept_write(0xC000_0080); // IA32_EFER
        assert_ne!(bitmap.write_high[0], 0);
    }

    #[test]
    fn guest_registers_layout_matches_the_trampoline_offsets() {
        assert_eq!(core::mem::offset_of!(GuestRegisters, rax), 0);
        assert_eq!(core::mem::offset_of!(GuestRegisters, rbx), 8);
        assert_eq!(core::mem::offset_of!(GuestRegisters, rdx), 24);
    }

    #[test]
    fn every_nested_vmx_instruction_reason_maps_to_vmx_instruction() {
        for reason in [19u16, 20, 21, 22, 23, 24, 25, 26, 27, 50, 53] {
            assert!(matches!(VmExitReason::from(reason), VmExitReason::VmxInstruction));
        }
        assert!(matches!(VmExitReason::from(18), VmExitReason::Vmcall));
        assert!(matches!(VmExitReason::from(999), VmExitReason::Unknown(999)));
    }
}
