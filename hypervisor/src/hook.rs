//! The shadow-page hook engine: a mapping from guest physical 4-KiB frame to
//! a hook record, plus the "execute-one-original-instruction" protocol that
//! makes a hook invisible to guest reads/writes while still active on
//! instruction fetch.

use crate::{
    bugcheck::{bugcheck, BugcheckCode},
    ept::{Ept, Pml1Entry},
    guest_memory::translate_guest_virtual_to_physical,
};
use alloc::collections::BTreeMap;

const PAGE_SHIFT: u32 = 12;
const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Which accesses a hook should let through on the shadowed page. The
/// normal case (execute interception) clears read/write entirely so any
/// data access traps; a caller may instead ask for an arbitrary mask.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HookAttributes {
    pub(crate) read: bool,
    pub(crate) write: bool,
    pub(crate) execute: bool,
}

impl HookAttributes {
    /// The normal stealth-hook attribute set: execute-only.
    pub(crate) fn execute_only() -> Self {
        Self { read: false, write: false, execute: true }
    }
}

/// One active hook: the live PML1 entry it owns, and the two values that
/// get swapped in and out of it.
#[derive(Debug, Clone, Copy)]
struct HookRecord {
    pml1_entry: *mut Pml1Entry,
    original_entry: Pml1Entry,
    shadowed_entry: Pml1Entry,
}

// Safety: `pml1_entry` always points into the `Ept` this `HookEngine` was
// constructed against, which outlives it.
unsafe impl Send for HookRecord {}

/// Tracks every installed hook, keyed by the page-aligned guest physical
/// address it covers. Shared across every core (the EPT it governs is
/// shared too); the MTF restore point for an in-flight single-step lives on
/// the initiating [`crate::vcpu::Vcpu`] instead, one per core, since more
/// than one core can be mid-single-step at once.
#[derive(Debug, Default)]
pub(crate) struct HookEngine {
    hooks: BTreeMap<u64, HookRecord>,
}

impl HookEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Installs a stealth hook: guest VA `target_va` (translated against
    /// `guest_cr3`) is hidden behind the content at `hooked_va`.
    ///
    /// `spec.md` §4.5 steps 1-6. Returns `None` if either address fails to
    /// translate against the guest's own page tables — a guest-controlled
    /// input, so this is reported back to the caller rather than taken
    /// down with the whole host (`spec.md` §7).
    pub(crate) fn perform_page_hook(
        &mut self,
        ept: &mut Ept,
        guest_cr3: u64,
        target_va: u64,
        hooked_va: u64,
        attributes: HookAttributes,
    ) -> Option<()> {
        let target_phys = translate_guest_virtual_to_physical(guest_cr3, target_va)?;
        let hooked_phys = translate_guest_virtual_to_physical(guest_cr3, hooked_va)?;
        let target_phys = target_phys & !(PAGE_SIZE - 1);
        let hooked_phys = hooked_phys & !(PAGE_SIZE - 1);

        ept.split_large_page(target_phys);
        let pml1_entry = ept.pml1_entry_mut(target_phys);
        // Safety: `split_large_page` guarantees this address is now
        // governed by a live PML1 table.
        let original_entry = unsafe { *pml1_entry };

        let mut shadowed_entry = original_entry;
        shadowed_entry.set_read(attributes.read);
        shadowed_entry.set_write(attributes.write);
        shadowed_entry.set_execute(attributes.execute);
        shadowed_entry.set_pfn(hooked_phys >> PAGE_SHIFT);

        ept.set_pml1_and_invalidate(pml1_entry, shadowed_entry);

        self.hooks.insert(
            target_phys,
            HookRecord { pml1_entry, original_entry, shadowed_entry },
        );
        Some(())
    }

    /// Restores the original content at the page containing guest-physical
    /// `target_phys` and forgets the hook.
    pub(crate) fn unhook_page(&mut self, ept: &Ept, target_phys: u64) {
        let key = target_phys & !(PAGE_SIZE - 1);
        if let Some(record) = self.hooks.remove(&key) {
            ept.set_pml1_and_invalidate(record.pml1_entry, record.original_entry);
        }
    }

    /// Restores every active hook; used on shutdown and by hypercall #5.
    pub(crate) fn unhook_all_pages(&mut self, ept: &Ept) {
        for record in self.hooks.values() {
            ept.set_pml1_and_invalidate(record.pml1_entry, record.original_entry);
        }
        self.hooks.clear();
    }

    /// Looks up the hook record governing page-aligned `physical_address`,
    /// if any.
    pub(crate) fn hook_for_physical_address(&self, physical_address: u64) -> Option<&HookRecord> {
        self.hooks.get(&(physical_address & !(PAGE_SIZE - 1)))
    }

    /// Begins the execute-one-original-instruction sequence for the hook
    /// governing `physical_address`: swaps the live PML1 back to
    /// `original_entry` and writes `restore_point` (the calling core's own
    /// `Vcpu::mtf_restore_point`) so [`HookEngine::finish_single_step`] knows
    /// which hook to re-arm once the guest retires one instruction.
    ///
    /// Returns `false` if no hook governs this address (an unexpected EPT
    /// violation per `spec.md` §4.7).
    pub(crate) fn begin_single_step(&self, ept: &Ept, physical_address: u64, restore_point: &mut Option<u64>) -> bool {
        let key = physical_address & !(PAGE_SIZE - 1);
        let Some(record) = self.hooks.get(&key) else {
            return false;
        };
        ept.set_pml1_and_invalidate(record.pml1_entry, record.original_entry);
        *restore_point = Some(key);
        true
    }

    /// Completes the execute-one-original-instruction sequence: swaps the
    /// PML1 back to `shadowed_entry`. Must only be called from the MTF
    /// exit handler immediately following [`HookEngine::begin_single_step`],
    /// with the same `restore_point` that call wrote into.
    pub(crate) fn finish_single_step(&self, ept: &Ept, restore_point: &mut Option<u64>) {
        let Some(key) = restore_point.take() else {
            bugcheck(BugcheckCode::CorruptedMachineState, [0; 4]);
        };
        let Some(record) = self.hooks.get(&key) else {
            bugcheck(BugcheckCode::CorruptedMachineState, [key, 0, 0, 0]);
        };
        ept.set_pml1_and_invalidate(record.pml1_entry, record.shadowed_entry);
    }
}

#[cfg(test)]
mod tests {
    use super::HookAttributes;

    #[test]
    fn execute_only_clears_read_and_write() {
        let attrs = HookAttributes::execute_only();
        assert!(!attrs.read);
        assert!(!attrs.write);
        assert!(attrs.execute);
    }
}
