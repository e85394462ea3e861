//! Conversion between host values and guest stack slots.
//!
//! Push is strict: anything without a guest representation fails with
//! [`BridgeError::UnsupportedValueKind`] and the stack is restored to its depth
//! before the push. Pull follows the bridge's `strict_pull` setting: strict
//! pulls fail the same way, best-effort pulls record a warning and substitute
//! nil (unsupported table keys are skipped).
//!
//! A mapping key is pushed as a guest number only when its text is exactly how
//! that number prints, so `"10"` and `"3.5"` become numeric keys while `"010"`
//! and `"2.0"` stay strings. Pulling such a table gives the same keys back.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use luabridge_contracts::{LuaType, NATIVE_ERROR, REGISTRY_INDEX};
use luabridge_guest_core::{fetch_c_string, GuestApi, GuestCallback, Ptr, StatePtr};

use crate::config::BridgeConfig;
use crate::diagnostics::{
    Diagnostic, Diagnostics, LB_CALLBACK_PANIC, LB_CALLBACK_STALE, LB_PULL_FOREIGN_FUNCTION,
    LB_PULL_KEY_UNSUPPORTED, LB_PULL_TOO_DEEP, LB_PULL_UNREADABLE_STRING, LB_PULL_UNSUPPORTED,
};
use crate::error::HandleKind;
use crate::ledger::scratch_string;
use crate::pcall;
use crate::registry::{Handle, Instance};
use crate::value::{HostFunction, HostValue};
use crate::{BridgeError, Result};

/// Bridge-wide context every marshaller and trampoline carries.
#[derive(Debug, Clone)]
pub(crate) struct Shared {
    pub(crate) diagnostics: Diagnostics,
    pub(crate) config: BridgeConfig,
}

/// A guest value anchored in the instance's registry table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestRef {
    handle: Handle,
    id: i32,
}

impl GuestRef {
    pub fn handle(&self) -> Handle {
        self.handle
    }
}

impl fmt::Display for GuestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref {} on {}", self.id, self.handle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum NumericKey {
    Int(i64),
    Float(f64),
}

/// A mapping key that reads back as exactly the same text is pushed as a
/// guest number; anything else stays a string.
fn numeric_key(k: &str) -> Option<NumericKey> {
    if let Ok(i) = k.parse::<i64>() {
        return (i.to_string() == k).then_some(NumericKey::Int(i));
    }
    match k.parse::<f64>() {
        Ok(f) if f.is_finite() && float_key_text(f) == k => Some(NumericKey::Float(f)),
        _ => None,
    }
}

fn float_key_text(f: f64) -> String {
    format!("{f}")
}

/// Keys exactly `1..=n` make a sequence. An empty table is an empty sequence.
fn sequence_or_mapping(mut map: BTreeMap<String, HostValue>) -> HostValue {
    let n = map.len();
    if (1..=n).all(|i| map.contains_key(&i.to_string())) {
        HostValue::Sequence((1..=n).filter_map(|i| map.remove(&i.to_string())).collect())
    } else {
        HostValue::Mapping(map)
    }
}

fn count_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

pub(crate) struct Marshaller<'g> {
    pub(crate) guest: &'g mut dyn GuestApi,
    pub(crate) l: StatePtr,
    pub(crate) handle: Handle,
    pub(crate) instance: Rc<RefCell<Instance>>,
    pub(crate) shared: Shared,
}

impl<'g> Marshaller<'g> {
    pub(crate) fn new(
        guest: &'g mut dyn GuestApi,
        handle: Handle,
        instance: Rc<RefCell<Instance>>,
        shared: Shared,
    ) -> Self {
        let l = instance.borrow().state;
        Self {
            guest,
            l,
            handle,
            instance,
            shared,
        }
    }

    pub(crate) fn depth(&self) -> i32 {
        self.guest.get_top(self.l)
    }

    pub(crate) fn restore(&mut self, depth: i32) {
        self.guest.set_top(self.l, depth);
    }

    pub(crate) fn type_at(&self, idx: i32) -> LuaType {
        LuaType::from_raw(self.guest.type_of(self.l, idx))
    }

    /// Reads a string or number slot. Numbers are converted in place by the guest.
    /// `None` when the guest hands back a null or unterminated pointer.
    pub(crate) fn read_string(&mut self, idx: i32) -> Option<String> {
        let ptr = self.guest.to_string(self.l, idx);
        fetch_c_string(self.guest.heap(), ptr)
    }

    pub(crate) fn intern(&mut self, s: &str) -> Result<Ptr> {
        self.instance
            .borrow_mut()
            .ledger
            .intern_string(&mut *self.guest, s)
    }

    pub(crate) fn warn(&self, diag: Diagnostic) {
        self.shared
            .diagnostics
            .record(diag.with_data("handle", self.handle.id()));
    }

    pub(crate) fn push(&mut self, v: &HostValue) -> Result<()> {
        let base = self.depth();
        let out = self.push_at(v, 0);
        if out.is_err() {
            self.restore(base);
        }
        out
    }

    /// Pushes `args` left to right, leaving the stack untouched on failure.
    pub(crate) fn push_all(&mut self, args: &[HostValue]) -> Result<i32> {
        let base = self.depth();
        for arg in args {
            if let Err(e) = self.push(arg) {
                self.restore(base);
                return Err(e);
            }
        }
        Ok(count_i32(args.len()))
    }

    fn push_str(&mut self, s: &str) -> Result<()> {
        // The guest copies pushed strings, so the scratch copy is freed right away.
        let ptr = scratch_string(&mut *self.guest, s)?;
        self.guest.push_string(self.l, ptr);
        self.guest.free(ptr);
        Ok(())
    }

    fn check_depth(&self, depth: u32) -> Result<()> {
        let max = self.shared.config.max_depth;
        if depth >= max {
            return Err(BridgeError::unsupported(
                "nested value",
                format!("nesting exceeds {max} levels"),
            ));
        }
        Ok(())
    }

    fn push_at(&mut self, v: &HostValue, depth: u32) -> Result<()> {
        let l = self.l;
        match v {
            HostValue::Nil => self.guest.push_nil(l),
            HostValue::Boolean(b) => self.guest.push_boolean(l, *b),
            HostValue::Integer(i) => self.guest.push_integer(l, *i),
            HostValue::Float(f) => self.guest.push_number(l, *f),
            HostValue::String(s) => self.push_str(s)?,
            HostValue::Function(f) => {
                let make = || {
                    trampoline(
                        f.clone(),
                        Rc::downgrade(&self.instance),
                        self.handle,
                        self.shared.clone(),
                    )
                };
                let ptr =
                    self.instance
                        .borrow_mut()
                        .ledger
                        .register_callback(&mut *self.guest, f, make)?;
                self.guest.push_cfunction(l, ptr);
            }
            HostValue::Sequence(items) | HostValue::Set(items) => {
                self.check_depth(depth)?;
                self.guest.create_table(l, count_i32(items.len()), 0);
                for (i, item) in items.iter().enumerate() {
                    self.guest.push_integer(l, i as i64 + 1);
                    self.push_at(item, depth + 1)?;
                    self.guest.set_table(l, -3);
                }
            }
            HostValue::Mapping(map) => {
                self.check_depth(depth)?;
                self.guest.create_table(l, 0, count_i32(map.len()));
                for (k, item) in map {
                    match numeric_key(k) {
                        Some(NumericKey::Int(i)) => self.guest.push_integer(l, i),
                        Some(NumericKey::Float(f)) => self.guest.push_number(l, f),
                        None => self.push_str(k)?,
                    }
                    self.push_at(item, depth + 1)?;
                    self.guest.set_table(l, -3);
                }
            }
            HostValue::Bytes(b) => {
                return Err(BridgeError::unsupported(
                    "bytes",
                    format!("{}-byte blob has no guest representation", b.len()),
                ))
            }
            HostValue::Symbol(s) => {
                return Err(BridgeError::unsupported(
                    "symbol",
                    format!("symbol {s:?} has no guest representation"),
                ))
            }
        }
        Ok(())
    }

    /// Converts the slot at `idx` without popping it.
    pub(crate) fn pull(&mut self, idx: i32) -> Result<HostValue> {
        let idx = self.guest.abs_index(self.l, idx);
        self.pull_at(idx, 0)
    }

    fn unrepresentable(&self, code: &str, kind: &'static str, detail: String) -> Result<HostValue> {
        if self.shared.config.strict_pull {
            return Err(BridgeError::unsupported(kind, detail));
        }
        self.warn(
            Diagnostic::warning(code, format!("{detail}; substituting nil")).with_data("kind", kind),
        );
        Ok(HostValue::Nil)
    }

    fn pull_at(&mut self, idx: i32, depth: u32) -> Result<HostValue> {
        let l = self.l;
        match self.type_at(idx) {
            LuaType::None | LuaType::Nil => Ok(HostValue::Nil),
            LuaType::Boolean => Ok(HostValue::Boolean(self.guest.to_boolean(l, idx))),
            LuaType::Number if self.guest.is_integer(l, idx) => Ok(HostValue::Integer(
                self.guest.to_integerx(l, idx).unwrap_or_default(),
            )),
            LuaType::Number => Ok(HostValue::Float(
                self.guest.to_numberx(l, idx).unwrap_or(f64::NAN),
            )),
            LuaType::String => match self.read_string(idx) {
                Some(s) => Ok(HostValue::String(s)),
                None => self.unrepresentable(
                    LB_PULL_UNREADABLE_STRING,
                    "string",
                    format!("guest string at slot {idx} could not be read"),
                ),
            },
            LuaType::Table => self.pull_table(idx, depth),
            LuaType::Function => self.pull_function(idx),
            ty @ (LuaType::LightUserdata | LuaType::Userdata | LuaType::Thread) => self
                .unrepresentable(
                    LB_PULL_UNSUPPORTED,
                    ty.as_str(),
                    format!("guest {ty} values have no host representation"),
                ),
        }
    }

    fn pull_function(&mut self, idx: i32) -> Result<HostValue> {
        if !self.guest.is_cfunction(self.l, idx) {
            return self.unrepresentable(
                LB_PULL_UNSUPPORTED,
                "function",
                "guest-defined functions have no host representation".to_string(),
            );
        }
        let ptr = self.guest.to_cfunction(self.l, idx);
        let found = self.instance.borrow().ledger.reverse_lookup(ptr);
        match found {
            Some(f) => Ok(HostValue::Function(f)),
            None => self.unrepresentable(
                LB_PULL_FOREIGN_FUNCTION,
                "function",
                format!("native function {ptr} was not registered by this bridge"),
            ),
        }
    }

    /// Key at `idx` as mapping text. Numeric keys are read by type, never through
    /// `to_string`, which would convert them in place and derail `next`.
    fn table_key(&mut self, idx: i32) -> Result<Option<String>> {
        let l = self.l;
        match self.type_at(idx) {
            LuaType::Number if self.guest.is_integer(l, idx) => Ok(Some(
                self.guest.to_integerx(l, idx).unwrap_or_default().to_string(),
            )),
            LuaType::Number => Ok(Some(float_key_text(
                self.guest.to_numberx(l, idx).unwrap_or(f64::NAN),
            ))),
            LuaType::String => match self.read_string(idx) {
                Some(s) => Ok(Some(s)),
                None => self.skip_key(
                    LB_PULL_UNREADABLE_STRING,
                    "string",
                    "guest string table key could not be read".to_string(),
                ),
            },
            ty => self.skip_key(
                LB_PULL_KEY_UNSUPPORTED,
                ty.as_str(),
                format!("{ty} table keys have no host representation"),
            ),
        }
    }

    fn skip_key(&self, code: &str, kind: &'static str, detail: String) -> Result<Option<String>> {
        if self.shared.config.strict_pull {
            return Err(BridgeError::unsupported(kind, detail));
        }
        self.warn(
            Diagnostic::warning(code, format!("{detail}; skipping entry")).with_data("kind", kind),
        );
        Ok(None)
    }

    fn pull_table(&mut self, t: i32, depth: u32) -> Result<HostValue> {
        let max = self.shared.config.max_depth;
        if depth >= max {
            return self.unrepresentable(
                LB_PULL_TOO_DEEP,
                "table",
                format!("table nesting exceeds {max} levels"),
            );
        }
        let base = self.depth();
        let mut map = BTreeMap::new();
        self.guest.push_nil(self.l);
        while self.guest.next(self.l, t) != 0 {
            let key = match self.table_key(-2) {
                Ok(Some(k)) => k,
                Ok(None) => {
                    self.guest.pop(self.l, 1);
                    continue;
                }
                Err(e) => {
                    self.restore(base);
                    return Err(e);
                }
            };
            let value_idx = self.depth();
            let value = match self.pull_at(value_idx, depth + 1) {
                Ok(v) => v,
                Err(e) => {
                    self.restore(base);
                    return Err(e);
                }
            };
            self.guest.pop(self.l, 1);
            map.insert(key, value);
        }
        Ok(sequence_or_mapping(map))
    }

    fn check_ref(&self, r: &GuestRef) -> Result<()> {
        let live = r.handle == self.handle && self.instance.borrow().refs.contains(&r.id);
        if live {
            Ok(())
        } else {
            Err(BridgeError::handle_not_found(HandleKind::Reference, r))
        }
    }

    /// Anchors the value at `idx` in the registry.
    pub(crate) fn take_ref(&mut self, idx: i32) -> Result<GuestRef> {
        let ty = self.type_at(idx);
        if matches!(ty, LuaType::None | LuaType::Nil) {
            return Err(BridgeError::unsupported(
                "nil",
                format!("cannot reference a {ty} slot"),
            ));
        }
        self.guest.push_value(self.l, idx);
        let id = self.guest.reference(self.l, REGISTRY_INDEX);
        if id < 0 {
            return Err(BridgeError::AllocationFailure { bytes: 0 });
        }
        self.instance.borrow_mut().refs.insert(id);
        Ok(GuestRef {
            handle: self.handle,
            id,
        })
    }

    pub(crate) fn call_ref(&mut self, r: &GuestRef, args: &[HostValue]) -> Result<Vec<HostValue>> {
        self.check_ref(r)?;
        let base = self.depth();
        let found = LuaType::from_raw(self.guest.raw_geti(self.l, REGISTRY_INDEX, i64::from(r.id)));
        if found != LuaType::Function {
            self.restore(base);
            return Err(BridgeError::NotCallable {
                name: r.to_string(),
                found,
            });
        }
        let nargs = match self.push_all(args) {
            Ok(n) => n,
            Err(e) => {
                self.restore(base);
                return Err(e);
            }
        };
        pcall::protected_call(self, base, nargs)
    }

    pub(crate) fn release_ref(&mut self, r: GuestRef) -> Result<()> {
        self.check_ref(&r)?;
        self.instance.borrow_mut().refs.remove(&r.id);
        self.guest.unreference(self.l, REGISTRY_INDEX, r.id);
        Ok(())
    }
}

/// What a host function sees while the guest is calling it.
pub struct CallContext<'g> {
    m: Marshaller<'g>,
    args: Vec<HostValue>,
    types: Vec<LuaType>,
}

impl<'g> CallContext<'g> {
    pub fn handle(&self) -> Handle {
        self.m.handle
    }

    pub fn args(&self) -> &[HostValue] {
        &self.args
    }

    /// Zero-based.
    pub fn arg(&self, i: usize) -> Option<&HostValue> {
        self.args.get(i)
    }

    /// Guest type of argument `i` as it arrived, before conversion.
    pub fn arg_type(&self, i: usize) -> LuaType {
        self.types.get(i).copied().unwrap_or(LuaType::None)
    }

    /// Number of arguments the guest passed to the running native call.
    pub fn arg_count(&self) -> usize {
        usize::try_from(self.m.instance.borrow().meta.pending_native_args).unwrap_or(0)
    }

    /// Anchors argument `i` (typically a guest function) so it can be called
    /// after this callback returns.
    pub fn take_ref(&mut self, i: usize) -> Result<GuestRef> {
        match i32::try_from(i).ok().and_then(|n| n.checked_add(1)) {
            Some(idx) => self.m.take_ref(idx),
            None => Err(BridgeError::unsupported(
                "nil",
                format!("argument {i} is out of range"),
            )),
        }
    }

    pub fn call_ref(&mut self, r: &GuestRef, args: &[HostValue]) -> Result<Vec<HostValue>> {
        self.m.call_ref(r, args)
    }

    pub fn release_ref(&mut self, r: GuestRef) -> Result<()> {
        self.m.release_ref(r)
    }

    pub fn call_global(&mut self, name: &str, args: &[HostValue]) -> Result<Vec<HostValue>> {
        pcall::call_global(&mut self.m, name, args)
    }
}

fn raise(guest: &mut dyn GuestApi, l: StatePtr, message: &str) -> i32 {
    let message = message.replace('\0', "\\0");
    match scratch_string(guest, &message) {
        Ok(ptr) => {
            guest.push_string(l, ptr);
            guest.free(ptr);
        }
        Err(_) => guest.push_nil(l),
    }
    NATIVE_ERROR
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

fn trampoline(
    f: HostFunction,
    instance: Weak<RefCell<Instance>>,
    handle: Handle,
    shared: Shared,
) -> GuestCallback {
    Rc::new(move |guest: &mut dyn GuestApi, l: StatePtr| {
        invoke(guest, l, &f, &instance, handle, &shared)
    })
}

fn invoke(
    guest: &mut dyn GuestApi,
    l: StatePtr,
    f: &HostFunction,
    instance: &Weak<RefCell<Instance>>,
    handle: Handle,
    shared: &Shared,
) -> i32 {
    let Some(instance) = instance.upgrade() else {
        shared.diagnostics.record(
            Diagnostic::warning(
                LB_CALLBACK_STALE,
                format!("host callback for instance {handle} ran after the instance was destroyed"),
            )
            .with_data("handle", handle.id()),
        );
        return raise(guest, l, "host callback belongs to a destroyed instance");
    };

    let nargs = guest.get_top(l);
    let prev = std::mem::replace(&mut instance.borrow_mut().meta.pending_native_args, nargs);
    let mut m = Marshaller::new(guest, handle, instance, shared.clone());
    m.l = l;

    let mut args = Vec::with_capacity(usize::try_from(nargs).unwrap_or(0));
    let mut types = Vec::with_capacity(args.capacity());
    for i in 1..=nargs {
        types.push(m.type_at(i));
        match m.pull(i) {
            Ok(v) => args.push(v),
            Err(e) => {
                m.instance.borrow_mut().meta.pending_native_args = prev;
                return raise(&mut *m.guest, l, &e.to_string());
            }
        }
    }

    // Unwinding must not cross the guest's native frame.
    let mut cx = CallContext { m, args, types };
    let out = panic::catch_unwind(AssertUnwindSafe(|| f.call(&mut cx)));
    let CallContext { mut m, .. } = cx;
    m.instance.borrow_mut().meta.pending_native_args = prev;

    let results = match out {
        Ok(Ok(results)) => results,
        Ok(Err(e)) => return raise(&mut *m.guest, l, &format!("{e:#}")),
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            m.warn(Diagnostic::error(
                LB_CALLBACK_PANIC,
                format!("host callback on instance {handle} panicked: {msg}"),
            ));
            m.restore(nargs);
            return raise(&mut *m.guest, l, &format!("host callback panicked: {msg}"));
        }
    };
    for v in &results {
        if let Err(e) = m.push(v) {
            m.restore(nargs);
            return raise(&mut *m.guest, l, &e.to_string());
        }
    }
    count_i32(results.len())
}
