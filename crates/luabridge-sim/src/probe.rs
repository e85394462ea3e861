use std::cell::{Cell, RefCell};
use std::rc::Rc;

pub const DEFAULT_HEAP_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Debug)]
struct Counters {
    malloc_calls: Cell<u64>,
    free_calls: Cell<u64>,
    double_frees: Cell<u64>,
    live_host_allocations: Cell<usize>,
    live_callbacks: Cell<usize>,
    live_states: Cell<usize>,
    heap_limit: Cell<usize>,
    fail_new_state: Cell<bool>,
    output: RefCell<Vec<String>>,
}

/// Shared view of a [`crate::SimGuest`]'s accounting.
///
/// The guest is usually moved into a bridge as a trait object; a probe taken
/// beforehand keeps observing it and can still adjust its fault injection.
#[derive(Clone, Debug)]
pub struct SimProbe {
    inner: Rc<Counters>,
}

impl SimProbe {
    pub(crate) fn new() -> Self {
        Self {
            inner: Rc::new(Counters {
                malloc_calls: Cell::new(0),
                free_calls: Cell::new(0),
                double_frees: Cell::new(0),
                live_host_allocations: Cell::new(0),
                live_callbacks: Cell::new(0),
                live_states: Cell::new(0),
                heap_limit: Cell::new(DEFAULT_HEAP_LIMIT),
                fail_new_state: Cell::new(false),
                output: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Blocks handed out by `malloc` and not yet freed.
    pub fn live_host_allocations(&self) -> usize {
        self.inner.live_host_allocations.get()
    }

    /// `free` calls on pointers that were not live host allocations.
    pub fn double_frees(&self) -> u64 {
        self.inner.double_frees.get()
    }

    pub fn malloc_calls(&self) -> u64 {
        self.inner.malloc_calls.get()
    }

    pub fn free_calls(&self) -> u64 {
        self.inner.free_calls.get()
    }

    pub fn live_callbacks(&self) -> usize {
        self.inner.live_callbacks.get()
    }

    pub fn live_states(&self) -> usize {
        self.inner.live_states.get()
    }

    /// Lines written by the guest's `print`.
    pub fn output(&self) -> Vec<String> {
        self.inner.output.borrow().clone()
    }

    pub fn take_output(&self) -> Vec<String> {
        std::mem::take(&mut *self.inner.output.borrow_mut())
    }

    pub fn heap_limit(&self) -> usize {
        self.inner.heap_limit.get()
    }

    /// Caps the guest heap size in bytes. Blocks already handed out stay valid.
    pub fn set_heap_limit(&self, bytes: usize) {
        self.inner.heap_limit.set(bytes);
    }

    /// Makes `new_state` return the null state until cleared.
    pub fn set_fail_new_state(&self, fail: bool) {
        self.inner.fail_new_state.set(fail);
    }

    pub(crate) fn fail_new_state(&self) -> bool {
        self.inner.fail_new_state.get()
    }

    pub(crate) fn record_output(&self, line: String) {
        self.inner.output.borrow_mut().push(line);
    }

    pub(crate) fn on_malloc(&self, ok: bool) {
        bump(&self.inner.malloc_calls);
        if ok {
            adjust(&self.inner.live_host_allocations, 1);
        }
    }

    pub(crate) fn on_free(&self, was_live: bool) {
        bump(&self.inner.free_calls);
        if was_live {
            adjust(&self.inner.live_host_allocations, -1);
        } else {
            bump(&self.inner.double_frees);
        }
    }

    pub(crate) fn set_live_callbacks(&self, n: usize) {
        self.inner.live_callbacks.set(n);
    }

    pub(crate) fn set_live_states(&self, n: usize) {
        self.inner.live_states.set(n);
    }
}

fn bump(c: &Cell<u64>) {
    c.set(c.get() + 1);
}

fn adjust(c: &Cell<usize>, delta: isize) {
    c.set(c.get().saturating_add_signed(delta));
}
