//! Guest-heap allocations made on the host's behalf.
//!
//! Every pointer the ledger records is released exactly once, either through
//! the matching `release_*` call or through [`Ledger::release_all`].

use std::collections::HashMap;

use luabridge_guest_core::{alloc_c_string, GuestApi, GuestCallback, Ptr};

use crate::value::HostFunction;
use crate::{BridgeError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub strings: usize,
    pub callbacks: usize,
}

#[derive(Default)]
pub(crate) struct Ledger {
    strings: HashMap<String, Ptr>,
    string_owners: HashMap<Ptr, String>,
    trampolines: HashMap<usize, Ptr>,
    functions: HashMap<Ptr, HostFunction>,
}

impl Ledger {
    /// Equal strings share one allocation for the ledger's lifetime.
    pub(crate) fn intern_string(&mut self, guest: &mut dyn GuestApi, s: &str) -> Result<Ptr> {
        if let Some(&ptr) = self.strings.get(s) {
            return Ok(ptr);
        }
        let ptr = alloc_c_string(guest, s)?;
        self.strings.insert(s.to_string(), ptr);
        self.string_owners.insert(ptr, s.to_string());
        Ok(ptr)
    }

    /// Frees one interned string. Returns false if `ptr` is not interned here.
    pub(crate) fn release_string(&mut self, guest: &mut dyn GuestApi, ptr: Ptr) -> bool {
        let Some(s) = self.string_owners.remove(&ptr) else {
            return false;
        };
        self.strings.remove(&s);
        guest.free(ptr);
        true
    }

    /// The same host function always maps to the same trampoline. `make` is
    /// only called the first time `f` is seen.
    pub(crate) fn register_callback(
        &mut self,
        guest: &mut dyn GuestApi,
        f: &HostFunction,
        make: impl FnOnce() -> GuestCallback,
    ) -> Result<Ptr> {
        if let Some(&ptr) = self.trampolines.get(&f.identity()) {
            return Ok(ptr);
        }
        let ptr = guest.register_native_callback(make());
        if ptr.is_null() {
            return Err(BridgeError::AllocationFailure { bytes: 0 });
        }
        self.trampolines.insert(f.identity(), ptr);
        self.functions.insert(ptr, f.clone());
        Ok(ptr)
    }

    pub(crate) fn reverse_lookup(&self, ptr: Ptr) -> Option<HostFunction> {
        self.functions.get(&ptr).cloned()
    }

    pub(crate) fn release_all(&mut self, guest: &mut dyn GuestApi) {
        for (ptr, _) in self.string_owners.drain() {
            guest.free(ptr);
        }
        self.strings.clear();
        for (ptr, _) in self.functions.drain() {
            guest.release_native_callback(ptr);
        }
        self.trampolines.clear();
    }

    pub(crate) fn stats(&self) -> LedgerStats {
        LedgerStats {
            strings: self.strings.len(),
            callbacks: self.functions.len(),
        }
    }
}

/// One-shot copy of `s` in guest memory. The caller frees it exactly once.
pub(crate) fn scratch_string(guest: &mut dyn GuestApi, s: &str) -> Result<Ptr> {
    Ok(alloc_c_string(guest, s)?)
}
