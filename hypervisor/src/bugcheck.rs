//! The fatal-error ("bugcheck") path: host-mode conditions that are always a
//! VMM bug rather than a guest fault are reported here and halt the core.

use crate::x86_instructions::{cli, hlt};
use log::error;

/// The taxonomy of fatal conditions this VMM can hit, matching the
/// abstract error taxonomy in the design: every fatal path funnels through
/// one of these codes rather than an ad-hoc `panic!()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub(crate) enum BugcheckCode {
    /// A host-mode exception other than NMI reached the common IDT stub.
    KmodeExceptionNotHandled = 1,
    /// The allocator's arena (boot-services pool or heap) is exhausted.
    InstallMoreMemory = 2,
    /// A VMX instruction (VMXON/VMCLEAR/VMPTRLD/VMLAUNCH/VMRESUME/VMXOFF)
    /// failed; `args[0]` carries `VM_INSTRUCTION_ERROR` when available.
    VmxError = 3,
    /// Boot services were invoked after `ExitBootServices` with no heap
    /// arena installed.
    BootServicesUnavailable = 4,
    /// An invariant the dispatcher relies on (e.g. an exit reason outside
    /// the 64-entry table, a hook record referencing a freed split) did
    /// not hold.
    CorruptedMachineState = 5,
    /// The CPU is missing a feature this VMM requires to virtualize safely
    /// (EPT, VPID, unrestricted guest, or a required INVEPT/INVVPID type).
    CpuFeatureShortfall = 6,
    /// The basic exit reason read from the VMCS has no entry in the
    /// dispatch table.
    UnknownExitReason = 7,
}

/// Prints diagnostics to the serial console and halts the current logical
/// processor forever. This is the only way a host-mode fault is reported;
/// there is no recovery.
pub(crate) fn bugcheck(code: BugcheckCode, args: [u64; 4]) -> ! {
    error!("*** BUGCHECK: {code:?} ({:#x} {:#x} {:#x} {:#x}) ***", args[0], args[1], args[2], args[3]);
    loop {
        cli();
        hlt();
    }
}
