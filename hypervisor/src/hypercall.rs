//! The VMCALL hypercall ABI the guest-side agent uses to request hooks and
//! query VMM state: request number in RCX, parameters in RDX/R8/R9, a
//! 2-valued status returned in RAX and (for calls that produce data) a
//! result in RDX.

use crate::{
    global_state::GlobalState,
    guest_memory::{translate_guest_virtual_to_physical, GuestMemoryDescriptor},
    hook::HookAttributes,
    per_cpu::push_to_all_cores,
    vcpu::{invept_all_contexts, invept_single_context, vmread, Vcpu},
};
use x86::vmx::vmcs;

/// The twelve defined hypercall numbers (`spec.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub(crate) enum HypercallNumber {
    Test = 1,
    ChangePageAttrib = 2,
    InveptAllContexts = 3,
    InveptSingleContext = 4,
    UnhookAllPages = 5,
    UnhookSinglePage = 6,
    GetWinDriverPoolAddress = 7,
    GetNtoskrnlBaseAddress = 8,
    GetWinDriverPoolSize = 9,
    GetPhysicalAddressForVirtual = 10,
    NotifyAllToInvalidateEpt = 11,
    Panic = 12,
}

impl TryFrom<u64> for HypercallNumber {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Test,
            2 => Self::ChangePageAttrib,
            3 => Self::InveptAllContexts,
            4 => Self::InveptSingleContext,
            5 => Self::UnhookAllPages,
            6 => Self::UnhookSinglePage,
            7 => Self::GetWinDriverPoolAddress,
            8 => Self::GetNtoskrnlBaseAddress,
            9 => Self::GetWinDriverPoolSize,
            10 => Self::GetPhysicalAddressForVirtual,
            11 => Self::NotifyAllToInvalidateEpt,
            12 => Self::Panic,
            _ => return Err(()),
        })
    }
}

/// Status value returned to the guest in RAX.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub(crate) enum HypercallStatus {
    Success = 0,
    Unsuccessful = 1,
}

/// The decoded `guest_hook_request_info` structure the guest passes a
/// pointer to for `change_page_attrib` (40 bytes, little-endian, packed:
/// `target_page_va`, `hooked_page_va`, `target_cr3`, then a one-byte
/// attribute bitfield and padding out to 40 bytes).
#[derive(Debug, Clone, Copy)]
pub(crate) struct GuestHookRequestInfo {
    pub(crate) target_page_va: u64,
    pub(crate) hooked_page_va: u64,
    pub(crate) target_cr3: u64,
    pub(crate) attributes: HookAttributes,
}

const GUEST_HOOK_REQUEST_INFO_SIZE: u64 = 40;

impl GuestHookRequestInfo {
    /// The on-the-wire size of this structure, for sizing the guest-memory
    /// descriptor that maps it.
    pub(crate) const SIZE: u64 = GUEST_HOOK_REQUEST_INFO_SIZE;

    /// Decodes the structure from its 40-byte little-endian wire layout.
    pub(crate) fn decode(bytes: &[u8; 40]) -> Self {
        let target_page_va = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let hooked_page_va = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let target_cr3 = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
        let raw_attributes = bytes[24];

        let attributes = if raw_attributes & 0b100 != 0 {
            // Execute requested: the execute-interception convention always
            // wins over any read/write bits also set, per `spec.md` §4.5
            // step 4.
            HookAttributes::execute_only()
        } else {
            HookAttributes {
                read: raw_attributes & 0b001 != 0,
                write: raw_attributes & 0b010 != 0,
                execute: false,
            }
        };

        Self { target_page_va, hooked_page_va, target_cr3, attributes }
    }
}

/// Services the VMCALL the guest just made: decodes the request from
/// `vcpu`'s register cache, performs the effect against `global`, and
/// writes the 2-valued status (plus RDX for data-returning calls) back.
/// The dispatcher advances RIP past this instruction afterward.
pub(crate) fn dispatch(vcpu: &mut Vcpu, global: &GlobalState) {
    let guest_cr3 = vmread(vmcs::guest::CR3);
    let request = vcpu.registers().rcx;
    let rdx = vcpu.registers().rdx;
    let r8 = vcpu.registers().r8;

    let status = match HypercallNumber::try_from(request) {
        Ok(HypercallNumber::Test) => HypercallStatus::Success,
        Ok(HypercallNumber::ChangePageAttrib) => change_page_attrib(global, guest_cr3, rdx),
        Ok(HypercallNumber::InveptAllContexts) => {
            invept_all_contexts();
            HypercallStatus::Success
        }
        Ok(HypercallNumber::InveptSingleContext) => {
            invept_single_context(rdx);
            HypercallStatus::Success
        }
        Ok(HypercallNumber::UnhookAllPages) => {
            global.hook_engine().unhook_all_pages(&global.ept());
            HypercallStatus::Success
        }
        Ok(HypercallNumber::UnhookSinglePage) => unhook_single_page(global, guest_cr3, rdx),
        Ok(HypercallNumber::GetWinDriverPoolAddress) => {
            vcpu.registers().rdx = global.win_driver().pool_address().unwrap_or(0);
            HypercallStatus::Success
        }
        Ok(HypercallNumber::GetNtoskrnlBaseAddress) => {
            vcpu.registers().rdx = global.win_driver().ntoskrnl_base().unwrap_or(0);
            HypercallStatus::Success
        }
        Ok(HypercallNumber::GetWinDriverPoolSize) => {
            vcpu.registers().rdx = global.win_driver().pool_size().unwrap_or(0);
            HypercallStatus::Success
        }
        Ok(HypercallNumber::GetPhysicalAddressForVirtual) => get_physical_address_for_virtual(vcpu, guest_cr3, rdx),
        Ok(HypercallNumber::NotifyAllToInvalidateEpt) => {
            global.with_cores(|cores| {
                push_to_all_cores(cores, || {
                    let eptp = global.ept().eptp();
                    alloc::boxed::Box::new(move |_: &mut Vcpu| invept_single_context(eptp)) as crate::per_cpu::RootModeCallback
                });
            });
            HypercallStatus::Success
        }
        Ok(HypercallNumber::Panic) => crate::bugcheck::bugcheck(crate::bugcheck::BugcheckCode::CorruptedMachineState, [request, rdx, r8, 0]),
        Err(()) => HypercallStatus::Unsuccessful,
    };

    vcpu.registers().rax = status as u64;
}

fn change_page_attrib(global: &GlobalState, guest_cr3: u64, request_info_va: u64) -> HypercallStatus {
    let mut host_page_table = global.host_page_table();
    let Some(mut descriptor) = GuestMemoryDescriptor::map(&mut host_page_table, guest_cr3, request_info_va, GuestHookRequestInfo::SIZE)
    else {
        return HypercallStatus::Unsuccessful;
    };

    let mut bytes = [0u8; 40];
    for (i, byte) in bytes.iter_mut().enumerate() {
        // Safety: `descriptor` maps exactly `SIZE` readable bytes starting
        // at `request_info_va`.
        *byte = unsafe { *descriptor.byte_ptr(i as u64) };
    }
    let info = GuestHookRequestInfo::decode(&bytes);
    drop(descriptor);
    drop(host_page_table);

    match global
        .hook_engine()
        .perform_page_hook(&mut global.ept(), info.target_cr3, info.target_page_va, info.hooked_page_va, info.attributes)
    {
        Some(()) => HypercallStatus::Success,
        None => HypercallStatus::Unsuccessful,
    }
}

fn unhook_single_page(global: &GlobalState, guest_cr3: u64, target_va: u64) -> HypercallStatus {
    let Some(target_phys) = translate_guest_virtual_to_physical(guest_cr3, target_va) else {
        return HypercallStatus::Unsuccessful;
    };
    global.hook_engine().unhook_page(&global.ept(), target_phys);
    HypercallStatus::Success
}

fn get_physical_address_for_virtual(vcpu: &mut Vcpu, guest_cr3: u64, va: u64) -> HypercallStatus {
    match translate_guest_virtual_to_physical(guest_cr3, va) {
        Some(phys) => {
            vcpu.registers().rdx = phys;
            HypercallStatus::Success
        }
        None => HypercallStatus::Unsuccessful,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_reads_little_endian_fields_in_order() {
        let mut bytes = [0u8; 40];
        bytes[0..8].copy_from_slice(&0x1000u64.to_le_bytes());
        bytes[8..16].copy_from_slice(&0x2000u64.to_le_bytes());
        bytes[16..24].copy_from_slice(&0x3000u64.to_le_bytes());
        bytes[24] = 0b100;

        let decoded = GuestHookRequestInfo::decode(&bytes);
        assert_eq!(decoded.target_page_va, 0x1000);
        assert_eq!(decoded.hooked_page_va, 0x2000);
        assert_eq!(decoded.target_cr3, 0x3000);
        assert!(decoded.attributes.execute);
    }

    #[test]
    fn hypercall_numbers_round_trip() {
        for raw in 1u64..=12 {
            assert_eq!(HypercallNumber::try_from(raw).unwrap() as u64, raw);
        }
        assert!(HypercallNumber::try_from(0).is_err());
        assert!(HypercallNumber::try_from(13).is_err());
    }
}
