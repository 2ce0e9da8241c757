//! The VM-exit dispatch policy: one handler per basic exit reason, default
//! = fatal. Each handler receives the current vCPU, the shared global
//! state, and decides whether to advance guest RIP or let it re-execute
//! the trapping instruction.

use crate::{
    bugcheck::{bugcheck, BugcheckCode},
    config::{MSR_HIGH_RANGE, MSR_LOW_RANGE, MSR_RESERVED_RANGE},
    global_state::GlobalState,
    hypercall,
    interrupt::{divide_error, general_protection, nmi},
    per_cpu::PerCpuData,
    vcpu::{vmread, vmwrite, Vcpu, VmExitReason},
    x86_instructions::{rdmsr, wrmsr, xsetbv},
};
use bitfield::bitfield;
use x86::{msr::IA32_FEATURE_CONTROL, vmx::vmcs};

bitfield! {
    /// Exit qualification for a CR-access exit (Table 27-3).
    struct CrAccessQualification(u64);
    impl Debug;
    cr_number, _: 3, 0;
    access_type, _: 5, 4;
    gpr, _: 11, 8;
}

bitfield! {
    /// Exit qualification for an EPT violation (Table 27-7).
    struct EptViolationQualification(u64);
    impl Debug;
    data_read, _: 0;
    data_write, _: 1;
    instruction_fetch, _: 2;
}

const CR_ACCESS_MOV_TO_CR: u64 = 0;
const CR_ACCESS_MOV_FROM_CR: u64 = 1;

/// Runs `vcpu` through one exit, then drains this core's posted-callback
/// queue and decides whether VMRESUME re-enters the guest at the current
/// RIP or at `current + VMEXIT_INSTRUCTION_LEN`.
pub(crate) fn handle_exit(vcpu: &mut Vcpu, reason: VmExitReason, global: &GlobalState, per_cpu: &PerCpuData) {
    match reason {
        VmExitReason::TripleFault => bugcheck(BugcheckCode::CorruptedMachineState, [0; 4]),
        VmExitReason::CrAccess => handle_cr_access(vcpu),
        VmExitReason::Rdmsr => handle_rdmsr(vcpu),
        VmExitReason::Wrmsr => handle_wrmsr(vcpu),
        VmExitReason::Cpuid => handle_cpuid(vcpu),
        VmExitReason::Xsetbv => handle_xsetbv(vcpu),
        VmExitReason::InitSignal => handle_init(vcpu),
        VmExitReason::StartupIpi => handle_sipi(vcpu),
        VmExitReason::NmiWindow => handle_nmi_window(vcpu),
        VmExitReason::ExceptionOrNmi => handle_exception_or_nmi(vcpu, global),
        VmExitReason::EptViolation => handle_ept_violation(vcpu, global),
        VmExitReason::MonitorTrapFlag => handle_mtf(vcpu, global),
        VmExitReason::Vmcall => handle_vmcall(vcpu, global),
        VmExitReason::VmxInstruction => handle_vmx_instruction(vcpu),
        VmExitReason::Hlt => bugcheck(BugcheckCode::CorruptedMachineState, [vmread(vmcs::guest::RIP), 0, 0, 0]),
        VmExitReason::EptMisconfig => bugcheck(BugcheckCode::CorruptedMachineState, [vmread(vmcs::ro::GUEST_PHYSICAL_ADDR_FULL), 0, 0, 0]),
        VmExitReason::Unknown(code) => bugcheck(BugcheckCode::UnknownExitReason, [u64::from(code), 0, 0, 0]),
    }

    if per_cpu.callback_ready() {
        while let Some(callback) = per_cpu.pop_callback() {
            callback(vcpu);
        }
    }

    if vcpu.take_instruction_skip() {
        let len = vmread(vmcs::ro::VMEXIT_INSTRUCTION_LEN);
        let rip = vmread(vmcs::guest::RIP);
        vmwrite(vmcs::guest::RIP, rip + len);
    }
}

/// MOV-to/from-CR0/CR3/CR4, implemented by hand so the guest's belief that
/// VT-x is off (CR4.VMXE always reads 0) survives.
fn handle_cr_access(vcpu: &mut Vcpu) {
    let qualification = CrAccessQualification(vmread(vmcs::ro::EXIT_QUALIFICATION));
    let cr_number = qualification.cr_number();
    let access_type = qualification.access_type();
    let gpr_index = qualification.gpr();

    match access_type {
        CR_ACCESS_MOV_TO_CR => {
            let value = read_gpr(vcpu, gpr_index);
            match cr_number {
                0 => write_guest_cr0(vcpu, value),
                3 => vmwrite(vmcs::guest::CR3, value & !(1u64 << 63)),
                4 => {
                    // Clear VMXE before storing: the guest must never see
                    // its own request to enable VT-x take effect.
                    const CR4_VMXE: u64 = 1 << 13;
                    vmwrite(vmcs::guest::CR4, value & !CR4_VMXE);
                }
                _ => bugcheck(BugcheckCode::CorruptedMachineState, [cr_number, 0, 0, 0]),
            }
        }
        CR_ACCESS_MOV_FROM_CR => {
            let value = match cr_number {
                0 => vmread(vmcs::guest::CR0),
                3 => vmread(vmcs::guest::CR3),
                4 => vmread(vmcs::guest::CR4),
                _ => bugcheck(BugcheckCode::CorruptedMachineState, [cr_number, 0, 0, 0]),
            };
            write_gpr(vcpu, gpr_index, value);
        }
        _ => bugcheck(BugcheckCode::CorruptedMachineState, [access_type, 0, 0, 0]),
    }

    vcpu.request_instruction_skip();
}

/// A CR0 write that toggles `PG` has to run through this path rather than
/// a plain `vmwrite`: switching paging mode changes `EFER.LMA` and the
/// VM-entry `IA32E_MODE_GUEST` control, and stale EPT/VPID translations
/// for the old mode must be dropped.
fn write_guest_cr0(vcpu: &mut Vcpu, new_cr0: u64) {
    const CR0_PG: u64 = 1 << 31;
    const IA32E_MODE_GUEST_FLAG: u64 = 1 << 9;

    let old_cr0 = vmread(vmcs::guest::CR0);
    vmwrite(vmcs::guest::CR0, new_cr0);

    if (old_cr0 ^ new_cr0) & CR0_PG != 0 {
        let paging_enabled = new_cr0 & CR0_PG != 0;
        let efer = vmread(vmcs::guest::IA32_EFER_FULL);
        const EFER_LME: u64 = 1 << 8;
        const EFER_LMA: u64 = 1 << 10;
        let new_efer = if paging_enabled && efer & EFER_LME != 0 {
            efer | EFER_LMA
        } else {
            efer & !EFER_LMA
        };
        vmwrite(vmcs::guest::IA32_EFER_FULL, new_efer);

        let entry_controls = vmread(vmcs::control::VMENTRY_CONTROLS);
        let new_entry_controls = if new_efer & EFER_LMA != 0 {
            entry_controls | IA32E_MODE_GUEST_FLAG
        } else {
            entry_controls & !IA32E_MODE_GUEST_FLAG
        };
        vmwrite(vmcs::control::VMENTRY_CONTROLS, new_entry_controls);

        crate::vcpu::invvpid_single_context();
    }

    let _ = vcpu;
}

/// Traps on the filtered MSR ranges (`spec.md` §4.7); `IA32_FEATURE_CONTROL`
/// is made opaque (always reports VMXON disabled) so the guest never
/// believes it could re-enter VMX root itself. Every other trapped MSR
/// passes straight through, per spec: being filtered only means the access
/// is visible to the VMM, not that its value changes.
fn handle_rdmsr(vcpu: &mut Vcpu) {
    let msr = read_gpr(vcpu, 1) as u32; // ECX
    debug_assert!(is_filtered_msr(msr), "rdmsr trapped for msr {msr:#x}, outside every bitmap-intercepted range");

    let value = if msr == IA32_FEATURE_CONTROL {
        const LOCK_BIT: u64 = 1 << 0;
        const ENABLE_VMXON_OUTSIDE_SMX: u64 = 1 << 2;
        (rdmsr(msr) | LOCK_BIT) & !ENABLE_VMXON_OUTSIDE_SMX
    } else {
        rdmsr(msr)
    };
    write_gpr(vcpu, 0, value & 0xFFFF_FFFF); // RAX low 32
    write_gpr(vcpu, 3, value >> 32); // RDX high 32
    vcpu.request_instruction_skip();
}

fn handle_wrmsr(vcpu: &mut Vcpu) {
    let msr = read_gpr(vcpu, 1) as u32; // ECX
    debug_assert!(is_filtered_msr(msr), "wrmsr trapped for msr {msr:#x}, outside every bitmap-intercepted range");
    let value = (read_gpr(vcpu, 0) & 0xFFFF_FFFF) | (read_gpr(vcpu, 3) << 32);

    if msr == IA32_FEATURE_CONTROL {
        const LOCK_BIT: u64 = 1 << 0;
        const ENABLE_VMXON_OUTSIDE_SMX: u64 = 1 << 2;
        wrmsr(msr, value);
        wrmsr(msr, rdmsr(msr) | LOCK_BIT | ENABLE_VMXON_OUTSIDE_SMX);
    } else {
        wrmsr(msr, value);
    }
    vcpu.request_instruction_skip();
}

fn is_filtered_msr(msr: u32) -> bool {
    MSR_LOW_RANGE.contains(&msr) || MSR_HIGH_RANGE.contains(&msr) || MSR_RESERVED_RANGE.contains(&msr)
}

/// Leaf 1: clear the hypervisor-present bit so guest code doing the
/// standard detection check believes it is running on real hardware.
/// Leaves 0x8000_0002..4: return a fabricated brand string instead of this
/// host's own, so the guest never learns it runs inside a VM this way either.
fn handle_cpuid(vcpu: &mut Vcpu) {
    const HYPERVISOR_PRESENT_BIT: u32 = 1 << 31;
    const BRAND_STRING: &[u8; 48] = b"Intel(R) Core(TM) Processor                    ";

    let leaf = read_gpr(vcpu, 0) as u32; // EAX
    let subleaf = read_gpr(vcpu, 3) as u32; // ECX

    let result = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
    let (eax, ebx, ecx, edx) = match leaf {
        1 => (result.eax, result.ebx, result.ecx & !HYPERVISOR_PRESENT_BIT, result.edx),
        0x8000_0002..=0x8000_0004 => {
            let chunk = (leaf - 0x8000_0002) as usize * 16;
            let read_u32 = |offset: usize| u32::from_le_bytes(BRAND_STRING[offset..offset + 4].try_into().unwrap());
            (read_u32(chunk), read_u32(chunk + 4), read_u32(chunk + 8), read_u32(chunk + 12))
        }
        _ => (result.eax, result.ebx, result.ecx, result.edx),
    };

    write_gpr(vcpu, 0, u64::from(eax));
    write_gpr(vcpu, 1, u64::from(ebx));
    write_gpr(vcpu, 3, u64::from(ecx));
    write_gpr(vcpu, 2, u64::from(edx));
    vcpu.request_instruction_skip();
}

fn handle_xsetbv(vcpu: &mut Vcpu) {
    const CR4_OSXSAVE: u64 = 1 << 18;
    let cr4 = vmread(vmcs::guest::CR4);
    vmwrite(vmcs::guest::CR4, cr4 | CR4_OSXSAVE);

    let index = read_gpr(vcpu, 1) as u32; // ECX
    let eax = read_gpr(vcpu, 0) & 0xFFFF_FFFF;
    let edx = read_gpr(vcpu, 2) & 0xFFFF_FFFF;
    xsetbv(index, eax | (edx << 32));
    vcpu.request_instruction_skip();
}

/// Reconstructs the architectural post-INIT register file (Intel SDM
/// Table 9-1) and sets activity state to wait-for-SIPI.
fn handle_init(vcpu: &mut Vcpu) {
    const CR0_ET: u64 = 1 << 4;
    const ACTIVITY_WAIT_FOR_SIPI: u64 = 3;
    const IA32E_MODE_GUEST_FLAG: u64 = 1 << 9;

    vmwrite(vmcs::guest::CR0, CR0_ET);
    vmwrite(vmcs::guest::CR3, 0u64);
    vmwrite(vmcs::guest::CR4, 0u64);
    vmwrite(vmcs::guest::IA32_EFER_FULL, 0u64);
    vmwrite(vmcs::control::VMENTRY_CONTROLS, vmread(vmcs::control::VMENTRY_CONTROLS) & !IA32E_MODE_GUEST_FLAG);

    vmwrite(vmcs::guest::DR7, 0x400u64);
    vmwrite(vmcs::guest::GDTR_LIMIT, 0xFFFFu64);
    vmwrite(vmcs::guest::IDTR_LIMIT, 0xFFFFu64);

    let cpuid1 = unsafe { core::arch::x86_64::__cpuid(1) };
    let registers = vcpu.registers();
    registers.rax = 0;
    registers.rbx = 0;
    registers.rcx = 0;
    registers.rdx = u64::from(cpuid1.eax);
    registers.rsi = 0;
    registers.rdi = 0;
    registers.rbp = 0;
    registers.r8 = 0;
    registers.r9 = 0;
    registers.r10 = 0;
    registers.r11 = 0;
    registers.r12 = 0;
    registers.r13 = 0;
    registers.r14 = 0;
    registers.r15 = 0;

    vmwrite(vmcs::guest::ACTIVITY_STATE, ACTIVITY_WAIT_FOR_SIPI);
}

/// A startup IPI arriving after INIT brings an AP's guest to life at the
/// vector the BSP sent.
fn handle_sipi(vcpu: &mut Vcpu) {
    const ACTIVITY_ACTIVE: u64 = 0;
    let qualification = vmread(vmcs::ro::EXIT_QUALIFICATION);
    let vector = qualification & 0xFF;

    vmwrite(vmcs::guest::CS_SELECTOR, vector << 8);
    vmwrite(vmcs::guest::CS_BASE, vector << 12);
    vmwrite(vmcs::guest::RIP, 0u64);
    vmwrite(vmcs::guest::ACTIVITY_STATE, ACTIVITY_ACTIVE);

    crate::vcpu::invvpid_single_context();
    let _ = vcpu; // RIP is not advanced; the guest starts exactly at the vector.
}

/// A pending virtual NMI finally has a window to be delivered.
fn handle_nmi_window(vcpu: &mut Vcpu) {
    const VIRTUAL_NMI_PENDING_FLAG: u64 = 1 << 22;
    let event = nmi();
    vmwrite(vmcs::control::VMENTRY_INTERRUPT_INFO_FIELD, u64::from(event.info.0));
    let pin_based = vmread(vmcs::control::PINBASED_EXEC_CONTROLS);
    vmwrite(vmcs::control::PINBASED_EXEC_CONTROLS, pin_based & !VIRTUAL_NMI_PENDING_FLAG);
    let _ = vcpu; // RIP is not advanced.
}

/// NMI re-injection request, and `#DE` re-injection.
///
/// The kernel-base-scan/agent-load handshake this exit is also specified to
/// drive is not wired up: it depends on the PE loader and guest agent,
/// which `win_driver` only exposes the hypercall-facing boundary of (see
/// its module docs). Every `#DE` is therefore re-injected unconditionally
/// rather than ever treated as the one-shot bootstrap trigger.
fn handle_exception_or_nmi(vcpu: &mut Vcpu, global: &GlobalState) {
    const NMI_WINDOW_EXITING_FLAG: u64 = 1 << 22;
    const INTERRUPTION_TYPE_NMI: u32 = 2;
    const INTERRUPTION_TYPE_MASK: u32 = 0b111 << 8;
    const VECTOR_DIVIDE_ERROR: u32 = 0;
    const VECTOR_MASK: u32 = 0xFF;

    let info = vmread(vmcs::ro::VMEXIT_INTERRUPTION_INFO) as u32;
    let interruption_type = (info & INTERRUPTION_TYPE_MASK) >> 8;
    let vector = info & VECTOR_MASK;

    if interruption_type == INTERRUPTION_TYPE_NMI {
        let pin_based = vmread(vmcs::control::PINBASED_EXEC_CONTROLS);
        vmwrite(vmcs::control::PINBASED_EXEC_CONTROLS, pin_based | NMI_WINDOW_EXITING_FLAG);
        return;
    }

    if vector == VECTOR_DIVIDE_ERROR {
        let event = divide_error();
        vmwrite(vmcs::control::VMENTRY_INTERRUPT_INFO_FIELD, u64::from(event.info.0));
        return;
    }

    bugcheck(BugcheckCode::KmodeExceptionNotHandled, [u64::from(vector), 0, 0, 0]);
    let _ = (vcpu, global);
}

/// An access to a hooked 4-KiB page: engage the execute-one-original-
/// instruction protocol. An EPT violation for any other page is a VMM bug
/// (every other page is either identity-mapped RWX or not hooked at all).
fn handle_ept_violation(vcpu: &mut Vcpu, global: &GlobalState) {
    let qualification = EptViolationQualification(vmread(vmcs::ro::EXIT_QUALIFICATION));
    let guest_physical = vmread(vmcs::ro::GUEST_PHYSICAL_ADDR_FULL);

    if !qualification.instruction_fetch() && !qualification.data_read() && !qualification.data_write() {
        bugcheck(BugcheckCode::CorruptedMachineState, [guest_physical, 0, 0, 0]);
    }

    let hooks = global.hook_engine();
    let ept = global.ept();
    if !hooks.begin_single_step(&ept, guest_physical, vcpu.mtf_restore_point()) {
        bugcheck(BugcheckCode::CorruptedMachineState, [guest_physical, 0, 0, 0]);
    }

    const MONITOR_TRAP_FLAG: u64 = 1 << 27;
    let procbased = vmread(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS);
    vmwrite(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, procbased | MONITOR_TRAP_FLAG);
}

/// The single-stepped original instruction retired; restore the shadowed
/// PML1 entry and stop single-stepping.
fn handle_mtf(vcpu: &mut Vcpu, global: &GlobalState) {
    const MONITOR_TRAP_FLAG: u64 = 1 << 27;
    let hooks = global.hook_engine();
    let ept = global.ept();
    hooks.finish_single_step(&ept, vcpu.mtf_restore_point());

    let procbased = vmread(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS);
    vmwrite(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, procbased & !MONITOR_TRAP_FLAG);
}

/// A guest executing any VMX instruction other than VMCALL: this VMM hides
/// VT-x from the guest (CR4.VMXE always reads 0, `IA32_FEATURE_CONTROL`
/// reports VMXON disabled), so a guest that reaches one of these anyway
/// gets the architectural "operation failed" outcome — RFLAGS.CF=1 with no
/// VM-instruction-error field to read, since there is no VMCS for it to
/// name — rather than crashing the host underneath it.
fn handle_vmx_instruction(vcpu: &mut Vcpu) {
    const RFLAGS_CF: u64 = 1 << 0;
    let rflags = vmread(vmcs::guest::RFLAGS);
    vmwrite(vmcs::guest::RFLAGS, rflags | RFLAGS_CF);
    vcpu.request_instruction_skip();
}

fn handle_vmcall(vcpu: &mut Vcpu, global: &GlobalState) {
    hypercall::dispatch(vcpu, global);
    vcpu.request_instruction_skip();
}

fn read_gpr(vcpu: &mut Vcpu, index: u64) -> u64 {
    let r = vcpu.registers();
    match index {
        0 => r.rax,
        1 => r.rcx,
        2 => r.rdx,
        3 => r.rbx,
        5 => r.rbp,
        6 => r.rsi,
        7 => r.rdi,
        8 => r.r8,
        9 => r.r9,
        10 => r.r10,
        11 => r.r11,
        12 => r.r12,
        13 => r.r13,
        14 => r.r14,
        15 => r.r15,
        _ => bugcheck(BugcheckCode::CorruptedMachineState, [index, 0, 0, 0]),
    }
}

fn write_gpr(vcpu: &mut Vcpu, index: u64, value: u64) {
    let r = vcpu.registers();
    match index {
        0 => r.rax = value,
        1 => r.rcx = value,
        2 => r.rdx = value,
        3 => r.rbx = value,
        5 => r.rbp = value,
        6 => r.rsi = value,
        7 => r.rdi = value,
        8 => r.r8 = value,
        9 => r.r9 = value,
        10 => r.r10 = value,
        11 => r.r11 = value,
        12 => r.r12 = value,
        13 => r.r13 = value,
        14 => r.r14 = value,
        15 => r.r15 = value,
        _ => bugcheck(BugcheckCode::CorruptedMachineState, [index, 0, 0, 0]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cr_access_qualification_decodes_number_type_and_register() {
        // MOV RAX, CR3: cr_number=3, access_type=1 (mov from cr), gpr=0
        let q = CrAccessQualification(0x3 | (1 << 4));
        assert_eq!(q.cr_number(), 3);
        assert_eq!(q.access_type(), CR_ACCESS_MOV_FROM_CR);
        assert_eq!(q.gpr(), 0);
    }

    #[test]
    fn ept_violation_qualification_decodes_access_kind() {
        let q = EptViolationQualification(0b100);
        assert!(q.instruction_fetch());
        assert!(!q.data_read());
        assert!(!q.data_write());
    }
}
