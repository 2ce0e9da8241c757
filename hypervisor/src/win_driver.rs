//! The guest-side agent boundary: the handful of facts hypercalls #7-#9
//! expose about the Windows driver the bootstrap handshake is meant to
//! load. The PE loader and import-resolution logic that would populate
//! these (`spec.md` §4.9) sit outside this repo's scope; this module only
//! carries the storage and accessors the hypercall surface needs, so the
//! ABI is total even before a loader is wired up.

/// What this VMM currently knows about the loaded guest agent. All three
/// fields start `None` and stay that way until something populates them;
/// querying an unset field is a normal, non-fatal "not yet installed", not
/// an error.
#[derive(Debug, Default)]
pub(crate) struct WinDriverState {
    pool_address: Option<u64>,
    pool_size: Option<u64>,
    ntoskrnl_base: Option<u64>,
}

impl WinDriverState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The guest virtual address of the pool reserved for the agent's
    /// allocator.
    pub(crate) fn pool_address(&self) -> Option<u64> {
        self.pool_address
    }

    /// The size in bytes of that pool.
    pub(crate) fn pool_size(&self) -> Option<u64> {
        self.pool_size
    }

    /// The guest kernel base the bootstrap handshake detected.
    pub(crate) fn ntoskrnl_base(&self) -> Option<u64> {
        self.ntoskrnl_base
    }

    pub(crate) fn set_pool(&mut self, address: u64, size: u64) {
        self.pool_address = Some(address);
        self.pool_size = Some(size);
    }

    pub(crate) fn set_ntoskrnl_base(&mut self, base: u64) {
        self.ntoskrnl_base = Some(base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_fields_report_none_rather_than_a_bogus_address() {
        let state = WinDriverState::new();
        assert_eq!(state.pool_address(), None);
        assert_eq!(state.ntoskrnl_base(), None);
    }

    #[test]
    fn set_pool_populates_both_address_and_size() {
        let mut state = WinDriverState::new();
        state.set_pool(0x1000, 0x2000);
        assert_eq!(state.pool_address(), Some(0x1000));
        assert_eq!(state.pool_size(), Some(0x2000));
    }
}
