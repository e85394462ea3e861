use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use luabridge_guest_core::{GuestApi, Ptr, StatePtr};

use crate::error::HandleKind;
use crate::ledger::Ledger;
use crate::{BridgeError, Result};

/// Opaque identity of a live interpreter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub(crate) u32);

impl Handle {
    pub fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CodeOwner {
    /// One-shot copy freed after the next execution.
    Scratch,
    /// Held by the instance ledger until the instance is destroyed.
    Interned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingCode {
    pub(crate) ptr: Ptr,
    pub(crate) owner: CodeOwner,
}

#[derive(Debug, Default)]
pub(crate) struct StateMeta {
    pub(crate) pending_code: Option<PendingCode>,
    /// Argument count of the native call currently running on this instance.
    pub(crate) pending_native_args: i32,
}

pub(crate) struct Instance {
    pub(crate) state: StatePtr,
    pub(crate) meta: StateMeta,
    pub(crate) ledger: Ledger,
    /// Registry references handed out and not yet released.
    pub(crate) refs: BTreeSet<i32>,
}

impl Instance {
    /// Frees the pending code pointer if this instance owns it privately.
    pub(crate) fn discard_pending(&mut self, guest: &mut dyn GuestApi) {
        if let Some(code) = self.meta.pending_code.take() {
            if code.owner == CodeOwner::Scratch {
                guest.free(code.ptr);
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct StateRegistry {
    instances: BTreeMap<u32, Rc<RefCell<Instance>>>,
    last: u32,
}

impl StateRegistry {
    pub(crate) fn create(&mut self, guest: &mut dyn GuestApi) -> Result<Handle> {
        let state = guest.new_state();
        if state.is_null() {
            return Err(BridgeError::AllocationFailure { bytes: 0 });
        }
        guest.open_libs(state);

        self.last += 1;
        let handle = Handle(self.last);
        self.instances.insert(
            handle.0,
            Rc::new(RefCell::new(Instance {
                state,
                meta: StateMeta::default(),
                ledger: Ledger::default(),
                refs: BTreeSet::new(),
            })),
        );
        Ok(handle)
    }

    pub(crate) fn get(&self, handle: Handle) -> Result<Rc<RefCell<Instance>>> {
        self.instances
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| BridgeError::handle_not_found(HandleKind::Instance, handle))
    }

    /// Closes the guest state and releases everything the instance owns.
    pub(crate) fn destroy(&mut self, guest: &mut dyn GuestApi, handle: Handle) -> Result<()> {
        let instance = self
            .instances
            .remove(&handle.0)
            .ok_or_else(|| BridgeError::handle_not_found(HandleKind::Instance, handle))?;
        let mut inst = instance.borrow_mut();
        guest.close(inst.state);
        inst.discard_pending(guest);
        inst.ledger.release_all(guest);
        inst.refs.clear();
        Ok(())
    }

    pub(crate) fn handles(&self) -> Vec<Handle> {
        self.instances.keys().map(|&id| Handle(id)).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.instances.len()
    }
}
