//! VM-entry event-injection templates: the three events this VMM ever
//! injects into the guest (NMI re-injection, the divide-error re-injection
//! used by the kernel-base-scan trick, and a general-protection fault for
//! CR/MSR accesses a real CPU would fault on).

use bitfield::bitfield;

/// VM-entry interruption-information field type, bits 10:8.
///
/// See Intel SDM §25.8.3, Table 25-17.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum InterruptType {
    HardwareException = 3,
    Nmi = 2,
}

bitfield! {
    /// The VM-entry interruption-information field (`VMENTRY_INTERRUPTION_INFO_FIELD`).
    #[derive(Clone, Copy)]
    pub(crate) struct InterruptInfo(u32);
    impl Debug;
    pub vector, set_vector: 7, 0;
    pub interrupt_type, set_interrupt_type: 10, 8;
    pub error_code_valid, set_error_code_valid: 11;
    pub valid, set_valid: 31;
}

/// An event ready to be written to the VM-entry interruption fields.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Interrupt {
    pub(crate) info: InterruptInfo,
    pub(crate) error_code: u32,
}

const DIVIDE_ERROR_VECTOR: u8 = 0;
const NMI_VECTOR: u8 = 2;
const GENERAL_PROTECTION_VECTOR: u8 = 13;

/// A non-maskable interrupt, re-injected after the NMI-window the
/// dispatcher requested opens up.
pub(crate) fn nmi() -> Interrupt {
    let mut info = InterruptInfo(0);
    info.set_vector(u32::from(NMI_VECTOR));
    info.set_interrupt_type(InterruptType::Nmi as u32);
    info.set_valid(true);
    Interrupt { info, error_code: 0 }
}

/// A `#DE` divide-error, re-injected on every kernel-base-scan trick
/// exit after the first (`spec.md` §4.7).
pub(crate) fn divide_error() -> Interrupt {
    let mut info = InterruptInfo(0);
    info.set_vector(u32::from(DIVIDE_ERROR_VECTOR));
    info.set_interrupt_type(InterruptType::HardwareException as u32);
    info.set_valid(true);
    Interrupt { info, error_code: 0 }
}

/// A `#GP` with error code 0, delivered for CR/MSR accesses this VMM
/// chooses to fault rather than emulate.
pub(crate) fn general_protection() -> Interrupt {
    let mut info = InterruptInfo(0);
    info.set_vector(u32::from(GENERAL_PROTECTION_VECTOR));
    info.set_interrupt_type(InterruptType::HardwareException as u32);
    info.set_error_code_valid(true);
    info.set_valid(true);
    Interrupt { info, error_code: 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nmi_template_is_valid_and_typed_as_nmi() {
        let event = nmi();
        assert!(event.info.valid());
        assert_eq!(event.info.interrupt_type(), InterruptType::Nmi as u32);
        assert_eq!(event.info.vector(), u32::from(NMI_VECTOR));
    }

    #[test]
    fn general_protection_carries_an_error_code() {
        let event = general_protection();
        assert!(event.info.error_code_valid());
        assert_eq!(event.error_code, 0);
    }
}
