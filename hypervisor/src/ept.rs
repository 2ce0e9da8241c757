//! The Extended Page Table engine: the identity map every guest physical
//! address translates through, with on-demand 2-MiB → 4-KiB splitting so a
//! single 4-KiB frame can be hooked without the cost of a fully 4-KiB
//! granular table.

use crate::{
    bugcheck::{bugcheck, BugcheckCode},
    config::{MAX_SPLIT_COUNT, MTRR_RANGE_CEILING},
    spinlock::Spinlock,
    x86_instructions::rdmsr,
};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use bitfield::bitfield;
use x86::msr::{
    IA32_MTRRCAP, IA32_MTRR_DEF_TYPE, IA32_MTRR_FIX4K_C0000, IA32_MTRR_FIX4K_E0000,
    IA32_MTRR_FIX16K_80000, IA32_MTRR_FIX16K_A0000, IA32_MTRR_FIX64K_00000, IA32_MTRR_PHYSBASE0,
    IA32_MTRR_PHYSMASK0, IA32_VMX_EPT_VPID_CAP,
};

const PAGE_SHIFT: u32 = 12;
const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
const LARGE_PAGE_SHIFT: u32 = 21;
const LARGE_PAGE_SIZE: u64 = 1 << LARGE_PAGE_SHIFT;
const ENTRIES_PER_TABLE: usize = 512;

/// EPT paging-structure and leaf-page memory type, `spec.md` §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MemoryType {
    Uncacheable = 0,
    WriteCombining = 1,
    WriteThrough = 4,
    WriteProtected = 5,
    WriteBack = 6,
}

bitfield! {
    #[derive(Clone, Copy)]
    pub(crate) struct Pml4Entry(u64);
    impl Debug;
    pub read, set_read: 0;
    pub write, set_write: 1;
    pub execute, set_execute: 2;
    pub pfn, set_pfn: 47, 12;
}

bitfield! {
    /// PML3 entry pointing at a PML2 table.
    #[derive(Clone, Copy)]
    pub(crate) struct Pml3PointerEntry(u64);
    impl Debug;
    pub read, set_read: 0;
    pub write, set_write: 1;
    pub execute, set_execute: 2;
    pub pfn, set_pfn: 47, 12;
}

bitfield! {
    /// PML2 entry: either a 2-MiB leaf (`large_page` = 1) or a pointer to a
    /// split PML1 table.
    #[derive(Clone, Copy)]
    pub(crate) struct Pml2Entry(u64);
    impl Debug;
    pub read, set_read: 0;
    pub write, set_write: 1;
    pub execute, set_execute: 2;
    pub memory_type, set_memory_type: 5, 3;
    pub large_page, set_large_page: 7;
    pub pfn, set_pfn: 47, 12;
}

bitfield! {
    /// The 4-KiB leaf entry a hook flips between the original and the
    /// shadowed frame.
    #[derive(Clone, Copy)]
    pub(crate) struct Pml1Entry(u64);
    impl Debug;
    pub read, set_read: 0;
    pub write, set_write: 1;
    pub execute, set_execute: 2;
    pub memory_type, set_memory_type: 5, 3;
    pub pfn, set_pfn: 47, 12;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub(crate) struct Eptp(u64);
    impl Debug;
    pub memory_type, set_memory_type: 2, 0;
    pub page_walk_length_minus_one, set_page_walk_length_minus_one: 5, 3;
    pub enable_accessed_and_dirty, set_enable_accessed_and_dirty: 6;
    pub pfn, set_pfn: 47, 12;
}

#[repr(C, align(4096))]
struct Table<T>([T; ENTRIES_PER_TABLE]);

/// One BIOS-described MTRR range, used to assign memory types to the
/// identity map (`spec.md` §4.4).
#[derive(Debug, Clone, Copy)]
struct MttrRange {
    physical_base: u64,
    physical_end: u64,
    memory_type: MemoryType,
}

/// A live 2-MiB → 4-KiB split: the replacement PML1 table plus the PML2
/// entry it services. Reference-counted because more than one hook can
/// land on pages carved out of the same split.
struct DynamicSplit {
    pml1: Box<Table<Pml1Entry>>,
    pml2_entry: *mut Pml2Entry,
}

// Safety: `pml2_entry` always points into `Ept::pml2`, which outlives
// every `DynamicSplit` referencing it.
unsafe impl Send for DynamicSplit {}
unsafe impl Sync for DynamicSplit {}

/// The EPT engine. One instance is shared (read-mostly) by every vCPU; the
/// identity map never moves once built, so only the PML1-entry-rewrite
/// path needs synchronization.
pub(crate) struct Ept {
    pml4: Box<Table<Pml4Entry>>,
    pml3: Box<Table<Pml3PointerEntry>>,
    pml2: Box<Table<Pml2Entry>>,
    mtrr_ranges: Vec<MttrRange>,
    eptp: Eptp,
    splits: Spinlock<Vec<Arc<Spinlock<DynamicSplit>>>>,
}

// Safety: every mutable access to a `Pml1Entry`/`Pml2Entry` happens under
// `Ept::splits`' lock or during single-threaded setup.
unsafe impl Send for Ept {}
unsafe impl Sync for Ept {}

impl Ept {
    /// Verifies the processor advertises every EPT/VPID feature this VMM
    /// relies on (execute-only pages, 4-level walk, write-back paging
    /// structures, 2-MiB pages, single-context INVEPT and INVVPID).
    ///
    /// Fatal if any is missing: there is no degraded-feature fallback.
    fn check_ept_features_supported() {
        let cap = rdmsr(IA32_VMX_EPT_VPID_CAP);
        let execute_only = cap & (1 << 0) != 0;
        let walk_length_4 = cap & (1 << 6) != 0;
        let write_back = cap & (1 << 14) != 0;
        let pde_2mb = cap & (1 << 16) != 0;
        let invept_single_context = cap & (1 << 25) != 0;
        let invvpid_single_context = cap & (1 << 41) != 0;

        if !(execute_only && walk_length_4 && write_back && pde_2mb && invept_single_context && invvpid_single_context) {
            bugcheck(BugcheckCode::CpuFeatureShortfall, [cap, 0, 0, 0]);
        }
    }

    /// Reads the fixed and variable-range MTRRs and produces the memory-type
    /// ranges the identity map will honor. Caps at [`MTRR_RANGE_CEILING`]
    /// entries: the collapsed fixed-range runs below 1 MiB, plus the
    /// variable ranges the BIOS enabled.
    fn build_mtrr_map() -> Vec<MttrRange> {
        let mut ranges = Vec::with_capacity(MTRR_RANGE_CEILING);

        let default_type = rdmsr(IA32_MTRR_DEF_TYPE);
        if default_type & (1 << 10) != 0 {
            // Fixed MTRRs enabled: every fixed-range MSR packs 8 one-byte
            // memory types, each covering an equal slice of that MSR's
            // range. Decode byte by byte and collapse adjacent same-typed
            // slices into one run, in ascending physical-address order.
            push_fixed_sub_ranges(&mut ranges, rdmsr(IA32_MTRR_FIX64K_00000), 0x0000_0000, 0x10000);
            push_fixed_sub_ranges(&mut ranges, rdmsr(IA32_MTRR_FIX16K_80000), 0x0008_0000, 0x4000);
            push_fixed_sub_ranges(&mut ranges, rdmsr(IA32_MTRR_FIX16K_A0000), 0x000A_0000, 0x4000);
            push_fixed_sub_ranges(&mut ranges, rdmsr(IA32_MTRR_FIX4K_C0000), 0x000C_0000, 0x1000);
            push_fixed_sub_ranges(&mut ranges, rdmsr(IA32_MTRR_FIX4K_E0000), 0x000E_0000, 0x1000);
            ranges.truncate(MTRR_RANGE_CEILING);
        }

        let cap = rdmsr(IA32_MTRRCAP);
        let variable_count = (cap & 0xFF) as u32;
        for i in 0..variable_count.min(MTRR_RANGE_CEILING.saturating_sub(ranges.len()) as u32) {
            let base = rdmsr(IA32_MTRR_PHYSBASE0 + 2 * i);
            let mask = rdmsr(IA32_MTRR_PHYSMASK0 + 2 * i);
            if mask & (1 << 11) == 0 {
                continue;
            }
            let physical_base = base & !0xFFF;
            let mask_bits = mask & !0xFFF;
            let range_size = (!mask_bits).wrapping_add(1) & 0x000F_FFFF_FFFF_F000;
            ranges.push(MttrRange {
                physical_base,
                physical_end: physical_base + range_size - 1,
                memory_type: decode_memory_type(base as u8),
            });
        }
        ranges
    }

    /// Looks up the memory type `physical_address` falls under, defaulting
    /// to write-back (the common case for RAM) when no MTRR range covers
    /// it.
    fn memory_type_for(&self, physical_address: u64) -> MemoryType {
        self.mtrr_ranges
            .iter()
            .find(|range| (range.physical_base..=range.physical_end).contains(&physical_address))
            .map_or(MemoryType::WriteBack, |range| range.memory_type)
    }

    /// Builds the 2-MiB identity map covering the low 512 GiB of physical
    /// address space and the EPTP naming it.
    pub(crate) fn new() -> Self {
        Self::check_ept_features_supported();
        let mtrr_ranges = Self::build_mtrr_map();

        let mut pml4: Box<Table<Pml4Entry>> = Box::new(Table([Pml4Entry(0); ENTRIES_PER_TABLE]));
        let mut pml3: Box<Table<Pml3PointerEntry>> = Box::new(Table([Pml3PointerEntry(0); ENTRIES_PER_TABLE]));
        let mut pml2: Box<Table<Pml2Entry>> = Box::new(Table([Pml2Entry(0); ENTRIES_PER_TABLE]));

        let mut this = Self {
            pml4,
            pml3,
            pml2,
            mtrr_ranges,
            eptp: Eptp(0),
            splits: Spinlock::new(Vec::new()),
        };

        for i in 0..ENTRIES_PER_TABLE {
            let physical_address = (i as u64) * LARGE_PAGE_SIZE;
            let memory_type = this.memory_type_for(physical_address);
            let mut entry = Pml2Entry(0);
            entry.set_read(true);
            entry.set_write(true);
            entry.set_execute(true);
            entry.set_large_page(true);
            entry.set_memory_type(memory_type as u64);
            entry.set_pfn(physical_address >> PAGE_SHIFT);
            this.pml2.0[i] = entry;
        }

        let mut pml3_entry = Pml3PointerEntry(0);
        pml3_entry.set_read(true);
        pml3_entry.set_write(true);
        pml3_entry.set_execute(true);
        pml3_entry.set_pfn(core::ptr::addr_of!(*this.pml2) as u64 >> PAGE_SHIFT);
        this.pml3.0[0] = pml3_entry;

        let mut pml4_entry = Pml4Entry(0);
        pml4_entry.set_read(true);
        pml4_entry.set_write(true);
        pml4_entry.set_execute(true);
        pml4_entry.set_pfn(core::ptr::addr_of!(*this.pml3) as u64 >> PAGE_SHIFT);
        this.pml4.0[0] = pml4_entry;

        let mut eptp = Eptp(0);
        eptp.set_memory_type(MemoryType::WriteBack as u64);
        eptp.set_page_walk_length_minus_one(3);
        eptp.set_pfn(core::ptr::addr_of!(*this.pml4) as u64 >> PAGE_SHIFT);
        this.eptp = eptp;

        this
    }

    /// The EPTP to program into the VMCS.
    pub(crate) fn eptp(&self) -> u64 {
        self.eptp.0
    }

    /// Returns a pointer to the live PML2 entry governing `physical_address`.
    fn pml2_entry_mut(&mut self, physical_address: u64) -> *mut Pml2Entry {
        let index = ((physical_address >> LARGE_PAGE_SHIFT) & 0x1FF) as usize;
        core::ptr::addr_of_mut!(self.pml2.0[index])
    }

    /// Splits the 2-MiB page covering `physical_address` into a 4-KiB
    /// granular table, unless it is already split. After this call,
    /// [`Ept::pml1_entry_mut`] can address the individual frame.
    ///
    /// Fatal (bugcheck `install_more_memory`) once [`MAX_SPLIT_COUNT`]
    /// splits are live: the split pool is fixed-size by design
    /// (`spec.md` §4.4).
    pub(crate) fn split_large_page(&mut self, physical_address: u64) {
        let pml2_entry = self.pml2_entry_mut(physical_address);
        // Safety: `pml2_entry` points into `self.pml2`, alive for `self`'s
        // lifetime.
        if unsafe { (*pml2_entry).large_page() } {
            let mut splits = self.splits.lock();
            if splits.len() >= MAX_SPLIT_COUNT {
                bugcheck(BugcheckCode::InstallMoreMemory, [physical_address, 0, 0, 0]);
            }

            let base = physical_address & !(LARGE_PAGE_SIZE - 1);
            // Safety: reading the entry being replaced, before it changes.
            let source = unsafe { *pml2_entry };
            let memory_type = source.memory_type();

            let mut pml1: Box<Table<Pml1Entry>> = Box::new(Table([Pml1Entry(0); ENTRIES_PER_TABLE]));
            for i in 0..ENTRIES_PER_TABLE {
                let frame = base + (i as u64) * PAGE_SIZE;
                let mut entry = Pml1Entry(0);
                entry.set_read(true);
                entry.set_write(true);
                entry.set_execute(true);
                entry.set_memory_type(memory_type);
                entry.set_pfn(frame >> PAGE_SHIFT);
                pml1.0[i] = entry;
            }

            let mut pointer = Pml2Entry(0);
            pointer.set_read(true);
            pointer.set_write(true);
            pointer.set_execute(true);
            pointer.set_large_page(false);
            pointer.set_pfn(core::ptr::addr_of!(*pml1) as u64 >> PAGE_SHIFT);
            // Safety: see above.
            unsafe { *pml2_entry = pointer };

            splits.push(Arc::new(Spinlock::new(DynamicSplit { pml1, pml2_entry })));
        }
    }

    /// Returns a pointer to the live PML1 entry governing `physical_address`.
    /// The caller must have already called [`Ept::split_large_page`] on
    /// this address (or a prior call must have).
    ///
    /// Fatal if the page is not split: `spec.md` §4.4/§4.5 never calls this
    /// without splitting first.
    pub(crate) fn pml1_entry_mut(&self, physical_address: u64) -> *mut Pml1Entry {
        let splits = self.splits.lock();
        let large_page_base = physical_address & !(LARGE_PAGE_SIZE - 1);
        for split in splits.iter() {
            let guard = split.lock();
            // Safety: `pml2_entry` points into `self.pml2`.
            let governs = unsafe { (*guard.pml2_entry).pfn() << PAGE_SHIFT } == large_page_base;
            if governs {
                let pt_index = ((physical_address >> PAGE_SHIFT) & 0x1FF) as usize;
                return core::ptr::addr_of!(guard.pml1.0[pt_index]) as *mut Pml1Entry;
            }
        }
        bugcheck(BugcheckCode::CorruptedMachineState, [physical_address, 0, 0, 0]);
    }

    /// Writes `value` into `*entry`, then flushes the translations this
    /// change invalidates: a single-context INVEPT (this EPTP) followed by
    /// a single-context INVVPID (the fixed tag every guest VMCS uses).
    ///
    /// This is the only way a PML1 entry is ever mutated after setup,
    /// which is what lets the hook/unhook path stay race-free with a
    /// spinlock rather than needing every core to pause.
    pub(crate) fn set_pml1_and_invalidate(&self, entry: *mut Pml1Entry, value: Pml1Entry) {
        let _guard = self.splits.lock();
        // Safety: `entry` was produced by `pml1_entry_mut` and still points
        // into a live split's table.
        unsafe { entry.write(value) };
        self.invalidate();
    }

    fn invalidate(&self) {
        use crate::vcpu::{invept_single_context, invvpid_single_context};
        invept_single_context(self.eptp.0);
        invvpid_single_context();
    }
}

/// Splits one fixed-range MTRR MSR's 8 type bytes into sub-ranges of
/// `sub_range_size` starting at `base`, merging a sub-range into the
/// previous entry in `ranges` when it is adjacent and shares the same
/// memory type.
fn push_fixed_sub_ranges(ranges: &mut Vec<MttrRange>, msr_value: u64, base: u64, sub_range_size: u64) {
    for byte_index in 0..8u64 {
        let memory_type = decode_memory_type((msr_value >> (byte_index * 8)) as u8);
        let physical_base = base + byte_index * sub_range_size;
        let physical_end = physical_base + sub_range_size - 1;

        if let Some(last) = ranges.last_mut() {
            if last.memory_type == memory_type && last.physical_end + 1 == physical_base {
                last.physical_end = physical_end;
                continue;
            }
        }
        ranges.push(MttrRange { physical_base, physical_end, memory_type });
    }
}

fn decode_memory_type(raw: u8) -> MemoryType {
    match raw {
        0 => MemoryType::Uncacheable,
        1 => MemoryType::WriteCombining,
        4 => MemoryType::WriteThrough,
        5 => MemoryType::WriteProtected,
        6 => MemoryType::WriteBack,
        _ => MemoryType::WriteBack,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pml2_entry_encodes_a_2mib_identity_frame() {
        let mut entry = Pml2Entry(0);
        entry.set_large_page(true);
        entry.set_pfn(0x1234);
        assert!(entry.large_page());
        assert_eq!(entry.pfn(), 0x1234);
    }

    #[test]
    fn fixed_range_bytes_of_the_same_type_collapse_into_one_run() {
        let mut ranges = Vec::new();
        push_fixed_sub_ranges(&mut ranges, 0x0606_0606_0606_0606, 0, 0x10000);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].physical_base, 0);
        assert_eq!(ranges[0].physical_end, 8 * 0x10000 - 1);
        assert_eq!(ranges[0].memory_type, MemoryType::WriteBack);
    }

    #[test]
    fn fixed_range_bytes_of_different_types_stay_separate() {
        let mut ranges = Vec::new();
        // byte 0 = uncacheable (0x00), bytes 1..8 = write-back (0x06)
        push_fixed_sub_ranges(&mut ranges, 0x0606_0606_0606_0600, 0, 0x10000);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].physical_base, 0);
        assert_eq!(ranges[0].physical_end, 0xFFFF);
        assert_eq!(ranges[0].memory_type, MemoryType::Uncacheable);
        assert_eq!(ranges[1].physical_base, 0x10000);
        assert_eq!(ranges[1].memory_type, MemoryType::WriteBack);
    }

    #[test]
    fn eptp_rejects_anything_but_a_four_level_walk() {
        let mut eptp = Eptp(0);
        eptp.set_page_walk_length_minus_one(3);
        assert_eq!(eptp.page_walk_length_minus_one(), 3);
    }
}
