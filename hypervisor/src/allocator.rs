//! The global allocator façade: a [`BootTimeAllocator`] is used until a heap
//! arena is carved out of boot-services memory and handed to
//! [`linked_list_allocator`], at which point every allocation is served from
//! that arena instead. Attempting to fall back to boot services after they
//! have been exited, with no heap installed, is a bugcheck.

use crate::{
    bugcheck::{bugcheck, BugcheckCode},
    config::HEAP_ARENA_SIZE,
    size_to_pages,
    system_table::system_table,
};
use core::{
    alloc::{GlobalAlloc, Layout},
    sync::atomic::{AtomicBool, Ordering},
};
use linked_list_allocator::LockedHeap;
use uefi::table::boot::{AllocateType, MemoryType};

/// Set once boot services have been exited. After this point, falling
/// through to [`BootTimeAllocator`] without a heap installed is a bug.
static BOOT_SERVICES_LIVE: AtomicBool = AtomicBool::new(true);

/// Set once [`init_heap`] has handed an arena to [`HEAP`].
static HEAP_READY: AtomicBool = AtomicBool::new(false);

static HEAP: LockedHeap = LockedHeap::empty();

/// Carves [`HEAP_ARENA_SIZE`] bytes out of the boot-services pool and hands
/// them to the heap allocator. Must run once, before `ExitBootServices`,
/// while boot services are still callable.
pub(crate) fn init_heap() {
    let arena = system_table()
        .boot_services()
        .allocate_pool(MemoryType::BOOT_SERVICES_DATA, HEAP_ARENA_SIZE)
        .expect("boot-services pool exhausted while carving the heap arena");
    // Safety: `arena` is a fresh, uniquely-owned allocation of exactly
    // `HEAP_ARENA_SIZE` bytes that nothing else references.
    unsafe { HEAP.lock().init(arena.as_ptr(), HEAP_ARENA_SIZE) };
    HEAP_READY.store(true, Ordering::Release);
}

/// Records that boot services are no longer callable. Called from the
/// `ExitBootServices` notification (an out-of-scope UEFI boundary; see
/// `spec.md` §1).
pub(crate) fn mark_boot_services_exited() {
    BOOT_SERVICES_LIVE.store(false, Ordering::Release);
}

/// The global allocator based on the UEFI boot services, used only before
/// [`init_heap`] installs the real heap.
struct BootTimeAllocator;

#[allow(clippy::cast_ptr_alignment)]
unsafe impl GlobalAlloc for BootTimeAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if !BOOT_SERVICES_LIVE.load(Ordering::Acquire) {
            bugcheck(BugcheckCode::BootServicesUnavailable, [0; 4]);
        }

        let size = layout.size();
        let align = layout.align();

        // If the requested alignment is a multiple of 4KB, use `allocate_pages`
        // which allocates 4KB aligned memory with 4KB granularity.
        if (align % 0x1000) == 0 {
            system_table()
                .boot_services()
                .allocate_pages(
                    AllocateType::AnyPages,
                    MemoryType::BOOT_SERVICES_DATA,
                    size_to_pages(size),
                )
                .unwrap_or(0) as *mut u8
        } else if align > 8 {
            // Allocate more space for alignment.
            let Ok(ptr) = system_table()
                .boot_services()
                .allocate_pool(MemoryType::BOOT_SERVICES_DATA, size + align)
            else {
                return core::ptr::null_mut();
            };
            // Calculate align offset.
            let ptr = ptr.as_ptr();
            let mut offset = ptr.align_offset(align);
            if offset == 0 {
                offset = align;
            }
            let return_ptr = unsafe { ptr.add(offset) };
            // Store allocated pointer before the struct.
            unsafe { return_ptr.cast::<*mut u8>().sub(1).write(ptr) };
            return_ptr
        } else {
            system_table()
                .boot_services()
                .allocate_pool(MemoryType::BOOT_SERVICES_DATA, size)
                .map_or(core::ptr::null_mut(), core::ptr::NonNull::as_ptr)
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if (layout.align() % 0x1000) == 0 {
            unsafe {
                system_table()
                    .boot_services()
                    .free_pages(ptr as u64, size_to_pages(layout.size()))
                    .unwrap();
            };
        } else if layout.align() > 8 {
            let ptr = unsafe { ptr.cast::<*mut u8>().sub(1).read() };
            unsafe { system_table().boot_services().free_pool(ptr).unwrap() };
        } else {
            unsafe { system_table().boot_services().free_pool(ptr).unwrap() };
        }
    }
}

/// Dispatches to the heap allocator once installed, or to boot services
/// before that point.
struct TwoPhaseAllocator;

unsafe impl GlobalAlloc for TwoPhaseAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if HEAP_READY.load(Ordering::Acquire) {
            unsafe { HEAP.alloc(layout) }
        } else {
            unsafe { BootTimeAllocator.alloc(layout) }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if HEAP_READY.load(Ordering::Acquire) {
            unsafe { HEAP.dealloc(ptr, layout) };
        } else {
            unsafe { BootTimeAllocator.dealloc(ptr, layout) };
        }
    }
}

#[global_allocator]
static ALLOCATOR: TwoPhaseAllocator = TwoPhaseAllocator;
