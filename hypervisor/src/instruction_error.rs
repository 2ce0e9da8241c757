//! The VM-instruction-error taxonomy (Intel SDM §31.4), used to annotate a
//! bugcheck when a VMX instruction reports `VmFailValid`.

/// `VM_INSTRUCTION_ERROR` values that matter for diagnostics. Unknown
/// values are preserved numerically rather than mapped to a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstructionError {
    NoError,
    VmcallInVmxRootOperation,
    VmclearInvalidPhysicalAddress,
    VmclearInvalidVmxonPointer,
    VmlaunchNonClearVmcs,
    VmresumeNonLaunchedVmcs,
    VmresumeAfterVmxoff,
    VmentryInvalidControlFields,
    VmentryInvalidHostState,
    VmptrldInvalidPhysicalAddress,
    VmptrldVmxonPointer,
    VmptrldIncorrectVmcsRevisionId,
    VmreadVmwriteInvalidComponent,
    VmwriteReadonlyComponent,
    VmxonInVmxRootOp,
    VmentryInvalidVmcsExecutivePointer,
    VmentryNonLaunchedExecutiveVmcs,
    VmentryExecutiveVmcsPtr,
    VmcallNonClearVmcs,
    VmcallInvalidVmexitFields,
    VmcallInvalidMsegRevisionId,
    VmxoffDualMonitor,
    VmcallInvalidSmmMonitor,
    VmentryInvalidVmExecutionControl,
    VmentryMovSs,
    InveptInvvpidInvalidOperand,
    Unknown(u32),
}

impl From<u32> for InstructionError {
    fn from(value: u32) -> Self {
        match value {
            0 => Self::NoError,
            1 => Self::VmcallInVmxRootOperation,
            2 => Self::VmclearInvalidPhysicalAddress,
            3 => Self::VmclearInvalidVmxonPointer,
            4 => Self::VmlaunchNonClearVmcs,
            5 => Self::VmresumeNonLaunchedVmcs,
            6 => Self::VmresumeAfterVmxoff,
            7 => Self::VmentryInvalidControlFields,
            8 => Self::VmentryInvalidHostState,
            9 => Self::VmptrldInvalidPhysicalAddress,
            10 => Self::VmptrldVmxonPointer,
            11 => Self::VmptrldIncorrectVmcsRevisionId,
            12 => Self::VmreadVmwriteInvalidComponent,
            13 => Self::VmwriteReadonlyComponent,
            15 => Self::VmxonInVmxRootOp,
            16 => Self::VmentryInvalidVmcsExecutivePointer,
            17 => Self::VmentryNonLaunchedExecutiveVmcs,
            18 => Self::VmentryExecutiveVmcsPtr,
            19 => Self::VmcallNonClearVmcs,
            20 => Self::VmcallInvalidVmexitFields,
            22 => Self::VmcallInvalidMsegRevisionId,
            23 => Self::VmxoffDualMonitor,
            24 => Self::VmcallInvalidSmmMonitor,
            25 => Self::VmentryInvalidVmExecutionControl,
            26 => Self::VmentryMovSs,
            28 => Self::InveptInvvpidInvalidOperand,
            other => Self::Unknown(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::InstructionError;

    #[test]
    fn known_codes_decode_to_named_variants() {
        assert_eq!(InstructionError::from(4), InstructionError::VmlaunchNonClearVmcs);
        assert_eq!(InstructionError::from(5), InstructionError::VmresumeNonLaunchedVmcs);
    }

    #[test]
    fn unrecognized_codes_are_preserved() {
        assert_eq!(InstructionError::from(14), InstructionError::Unknown(14));
    }
}
