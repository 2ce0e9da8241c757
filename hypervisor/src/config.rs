//! The module containing various constants that may be modified by developers.

use core::ops::RangeInclusive;

/// The logging level.
pub(crate) const LOGGING_LEVEL: log::LevelFilter = log::LevelFilter::Trace;

/// The fixed VPID tag used for every VMCS this VMM owns. VPID 0 is reserved
/// by the architecture for VMX root mode, so every guest context uses 1.
pub(crate) const VMM_VPID: u16 = 1;

/// The spinlock backoff ceiling: `pause` is issued this many times at most
/// before re-checking the lock word again.
pub(crate) const SPINLOCK_MAX_WAIT: u32 = 65536;

/// The number of 4-KiB PTEs held in the host page table's free pool (one
/// PML3 of 32 PML2 entries, each pointing at a 512-entry PML1 block).
pub(crate) const FREE_PTE_POOL_SIZE: usize = 32 * 512;

/// The maximum number of MTRR range descriptors the EPT engine keeps: the
/// collapsed fixed-range runs below 1 MiB plus up to eight variable ranges.
pub(crate) const MTRR_RANGE_CEILING: usize = 9;

/// The number of preallocated EPT page-table pages available for on-demand
/// large-page splitting.
pub(crate) const MAX_SPLIT_COUNT: usize = 512;

/// RDMSR/WRMSR "low" filtered range (architectural MSRs).
pub(crate) const MSR_LOW_RANGE: RangeInclusive<u32> = 0..=0x1FFF;

/// RDMSR/WRMSR "high" filtered range (APIC/extended-feature MSRs).
pub(crate) const MSR_HIGH_RANGE: RangeInclusive<u32> = 0xC000_0000..=0xC000_1FFF;

/// RDMSR/WRMSR reserved filtered range.
pub(crate) const MSR_RESERVED_RANGE: RangeInclusive<u32> = 0x4000_0000..=0x4000_00F0;

/// Size, in bytes, of the arena handed to the heap allocator once it is
/// brought up (see [`crate::allocator`]).
pub(crate) const HEAP_ARENA_SIZE: usize = 16 * 1024 * 1024;
