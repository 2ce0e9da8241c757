//! The module containing the [`GlobalState`] type: everything every core's
//! vCPU shares — the EPT identity map, the hook table, the host page
//! table's free-PTE pool, the win_driver boundary, and the list of every
//! core's [`PerCpuData`] block used to broadcast callbacks.

use crate::{ept::Ept, hook::HookEngine, host_page_table::HostPageTable, per_cpu::PerCpuData, win_driver::WinDriverState};
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

/// The singleton data structure shared across all logical processors.
/// Every field that can be touched by more than one core is lock-guarded;
/// `cores` is populated once during boot and read-only thereafter.
pub(crate) struct GlobalState {
    ept: Mutex<Ept>,
    hook_engine: Mutex<HookEngine>,
    host_page_table: Mutex<HostPageTable>,
    win_driver: Mutex<WinDriverState>,
    cores: Mutex<Vec<&'static PerCpuData>>,
}

impl GlobalState {
    pub(crate) fn new(ept: Ept) -> Self {
        Self {
            ept: Mutex::new(ept),
            hook_engine: Mutex::new(HookEngine::new()),
            host_page_table: Mutex::new(HostPageTable::new()),
            win_driver: Mutex::new(WinDriverState::new()),
            cores: Mutex::new(Vec::new()),
        }
    }

    /// Records a core's data block so broadcast hypercalls (e.g.
    /// `notify_all_to_invalidate_ept`) can reach it later. Every core calls
    /// this for itself once, during its own boot, before its guest runs.
    pub(crate) fn register_core(&self, core: &'static PerCpuData) {
        self.cores.lock().push(core);
    }

    pub(crate) fn ept(&self) -> MutexGuard<'_, Ept> {
        self.ept.lock()
    }

    pub(crate) fn hook_engine(&self) -> MutexGuard<'_, HookEngine> {
        self.hook_engine.lock()
    }

    pub(crate) fn host_page_table(&self) -> MutexGuard<'_, HostPageTable> {
        self.host_page_table.lock()
    }

    pub(crate) fn win_driver(&self) -> MutexGuard<'_, WinDriverState> {
        self.win_driver.lock()
    }

    /// Runs `f` against a snapshot of every registered core's data block.
    /// Takes a callback rather than returning a guard or a borrowed slice
    /// since the lock only needs to be held long enough to copy the
    /// (small, `Copy`) list of `&'static` references out.
    pub(crate) fn with_cores<R>(&self, f: impl FnOnce(&[&'static PerCpuData]) -> R) -> R {
        f(&self.cores.lock())
    }
}
