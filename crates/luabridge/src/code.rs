use std::collections::BTreeMap;
use std::fmt;

use luabridge_guest_core::{GuestApi, Ptr};

use crate::ledger::{scratch_string, Ledger};
use crate::Result;

/// Source text prepared in guest memory, runnable on any instance.
///
/// The handle is the address of the source. Persistent code is interned, so
/// preparing the same persistent source twice yields the same handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodeHandle(Ptr);

impl CodeHandle {
    pub fn ptr(self) -> Ptr {
        self.0
    }
}

impl fmt::Display for CodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code@{}", self.0)
    }
}

#[derive(Default)]
pub(crate) struct CodeManager {
    /// Live handles and whether each one is persistent.
    delivered: BTreeMap<Ptr, bool>,
    persistent: Ledger,
}

impl CodeManager {
    pub(crate) fn prepare(
        &mut self,
        guest: &mut dyn GuestApi,
        source: &str,
        persistent: bool,
    ) -> Result<CodeHandle> {
        let ptr = if persistent {
            self.persistent.intern_string(guest, source)?
        } else {
            scratch_string(guest, source)?
        };
        self.delivered.insert(ptr, persistent);
        Ok(CodeHandle(ptr))
    }

    /// `Some(persistent)` for a live handle.
    pub(crate) fn lookup(&self, code: CodeHandle) -> Option<bool> {
        self.delivered.get(&code.0).copied()
    }

    pub(crate) fn release(&mut self, guest: &mut dyn GuestApi, code: CodeHandle) -> bool {
        match self.delivered.remove(&code.0) {
            Some(true) => self.persistent.release_string(guest, code.0),
            Some(false) => {
                guest.free(code.0);
                true
            }
            None => false,
        }
    }

    pub(crate) fn live(&self) -> Vec<CodeHandle> {
        self.delivered.keys().map(|&p| CodeHandle(p)).collect()
    }

    pub(crate) fn release_all(&mut self, guest: &mut dyn GuestApi) {
        for (ptr, persistent) in std::mem::take(&mut self.delivered) {
            if !persistent {
                guest.free(ptr);
            }
        }
        self.persistent.release_all(guest);
    }
}

#[cfg(test)]
mod tests {
    use luabridge_sim::SimGuest;

    use super::*;

    #[test]
    fn persistent_sources_share_a_handle() {
        let mut sim = SimGuest::new();
        let mut codes = CodeManager::default();
        let a = codes.prepare(&mut sim, "return 1", true).expect("prepare");
        let b = codes.prepare(&mut sim, "return 1", true).expect("prepare again");
        let c = codes.prepare(&mut sim, "return 1", false).expect("prepare scratch");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(codes.lookup(a), Some(true));
        assert_eq!(codes.lookup(c), Some(false));
        assert_eq!(codes.live().len(), 2);
    }

    #[test]
    fn release_is_single_shot() {
        let mut sim = SimGuest::new();
        let probe = sim.probe();
        let mut codes = CodeManager::default();
        let a = codes.prepare(&mut sim, "x = 1", false).expect("prepare");
        assert!(codes.release(&mut sim, a));
        assert!(!codes.release(&mut sim, a));
        assert_eq!(codes.lookup(a), None);
        assert_eq!(probe.live_host_allocations(), 0);
        assert_eq!(probe.double_frees(), 0);
    }

    #[test]
    fn release_all_frees_both_kinds() {
        let mut sim = SimGuest::new();
        let probe = sim.probe();
        let mut codes = CodeManager::default();
        codes.prepare(&mut sim, "a = 1", false).expect("scratch");
        codes.prepare(&mut sim, "b = 2", true).expect("persistent");
        codes.release_all(&mut sim);
        codes.release_all(&mut sim);
        assert!(codes.live().is_empty());
        assert_eq!(probe.live_host_allocations(), 0);
        assert_eq!(probe.double_frees(), 0);
    }
}
