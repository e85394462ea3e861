//! The primitive surface of the embedded interpreter.
//!
//! The guest is reachable only through pointers into a flat byte buffer, numeric
//! state handles and stack primitives addressed by 1-based or negative indices.
//! [`GuestApi`] is that surface as a trait; a real binding forwards every method
//! to the loaded interpreter module, the reference guest implements it in-process.

use std::fmt;
use std::rc::Rc;

use luabridge_contracts::REGISTRY_INDEX;

pub mod memory;

pub use memory::{alloc_c_string, encode_c_string, fetch_c_string, MemoryError};

/// Byte offset into the guest's linear memory. Offset 0 is the null pointer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ptr(pub u32);

impl Ptr {
    pub const NULL: Ptr = Ptr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn offset(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Ptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Address of a guest interpreter instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatePtr(pub u32);

impl StatePtr {
    pub const NULL: StatePtr = StatePtr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Host code the guest can call through a trampoline pointer.
///
/// The guest passes itself and the calling state; arguments sit at indices
/// `1..=get_top`. The return value is the number of results left on top of the
/// stack, or [`luabridge_contracts::NATIVE_ERROR`] when the top value is an error
/// object the guest must raise.
pub type GuestCallback = Rc<dyn Fn(&mut dyn GuestApi, StatePtr) -> i32>;

pub trait GuestApi {
    /// Returns [`StatePtr::NULL`] when the guest cannot allocate a new instance.
    fn new_state(&mut self) -> StatePtr;
    fn open_libs(&mut self, l: StatePtr);
    fn close(&mut self, l: StatePtr);

    /// Returns [`Ptr::NULL`] when the guest heap is exhausted.
    fn malloc(&mut self, len: u32) -> Ptr;
    fn free(&mut self, ptr: Ptr);
    fn heap(&self) -> &[u8];
    fn heap_mut(&mut self) -> &mut [u8];

    fn push_nil(&mut self, l: StatePtr);
    fn push_boolean(&mut self, l: StatePtr, b: bool);
    fn push_integer(&mut self, l: StatePtr, n: i64);
    fn push_number(&mut self, l: StatePtr, n: f64);
    /// Copies the null-terminated string at `s`; the caller keeps ownership of `s`.
    fn push_string(&mut self, l: StatePtr, s: Ptr);
    fn push_cfunction(&mut self, l: StatePtr, f: Ptr);
    fn push_value(&mut self, l: StatePtr, idx: i32);
    fn create_table(&mut self, l: StatePtr, narr: i32, nrec: i32);

    fn type_of(&self, l: StatePtr, idx: i32) -> i32;
    fn to_boolean(&self, l: StatePtr, idx: i32) -> bool;
    fn to_integerx(&self, l: StatePtr, idx: i32) -> Option<i64>;
    fn to_numberx(&self, l: StatePtr, idx: i32) -> Option<f64>;
    fn is_integer(&self, l: StatePtr, idx: i32) -> bool;
    /// Returns a pointer into guest memory valid while the value stays on the stack,
    /// or [`Ptr::NULL`] if the value is neither a string nor a number. Numbers are
    /// converted in place.
    fn to_string(&mut self, l: StatePtr, idx: i32) -> Ptr;
    fn is_cfunction(&self, l: StatePtr, idx: i32) -> bool;
    fn to_cfunction(&self, l: StatePtr, idx: i32) -> Ptr;

    fn get_top(&self, l: StatePtr) -> i32;
    fn set_top(&mut self, l: StatePtr, idx: i32);
    /// Pops a key and pushes the next key/value pair of the table at `idx`.
    /// Returns 0 (pushing nothing) once the traversal is complete.
    fn next(&mut self, l: StatePtr, idx: i32) -> i32;
    /// `t[k] = v` where `t` is at `idx`, `v` is the top value and `k` the one below;
    /// pops both.
    fn set_table(&mut self, l: StatePtr, idx: i32);
    fn get_global(&mut self, l: StatePtr, name: Ptr) -> i32;
    fn set_global(&mut self, l: StatePtr, name: Ptr);
    fn raw_geti(&mut self, l: StatePtr, idx: i32, n: i64) -> i32;
    /// Pops the top value and anchors it in the table at `t`, returning its key.
    fn reference(&mut self, l: StatePtr, t: i32) -> i32;
    fn unreference(&mut self, l: StatePtr, t: i32, r: i32);

    fn load_string(&mut self, l: StatePtr, src: Ptr) -> i32;
    fn pcall(&mut self, l: StatePtr, nargs: i32, nresults: i32, errfunc: i32) -> i32;

    fn register_native_callback(&mut self, f: GuestCallback) -> Ptr;
    fn release_native_callback(&mut self, f: Ptr);

    fn pop(&mut self, l: StatePtr, n: i32) {
        self.set_top(l, -n - 1);
    }

    /// Converts a relative (negative) index into an absolute one. Pseudo-indices
    /// and positive indices are returned unchanged.
    fn abs_index(&self, l: StatePtr, idx: i32) -> i32 {
        if idx > 0 || idx <= REGISTRY_INDEX {
            idx
        } else {
            self.get_top(l) + idx + 1
        }
    }
}
