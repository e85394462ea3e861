//! In-process reference guest.
//!
//! [`SimGuest`] implements [`GuestApi`] over a flat linear memory with a
//! first-fit allocator, per-state value stacks with call frames, insertion-ordered
//! tables, a registry table and a small evaluator for a subset of the guest
//! language. Allocation accounting is observable through a [`SimProbe`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use luabridge_contracts::{LuaType, StatusCode, MULTRET, REF_NIL, REGISTRY_INDEX};
use luabridge_guest_core::{fetch_c_string, GuestApi, GuestCallback, Ptr, StatePtr};

mod eval;
mod heap;
mod parser;
mod probe;
mod stdlib;
mod value;

pub use probe::{SimProbe, DEFAULT_HEAP_LIMIT};

use heap::Heap;
use value::{Function, Table, Value};

const REGISTRY_TABLE: usize = 0;
const CHUNK_NAME_MAX: usize = 40;

struct State {
    stack: Vec<Value>,
    /// Stack offsets where each active native call's frame begins.
    frames: Vec<usize>,
    tables: Vec<Table>,
    globals: HashMap<Rc<str>, Value>,
    next_ref: i32,
    free_refs: Vec<i32>,
}

impl State {
    fn new() -> Self {
        Self {
            stack: Vec::new(),
            frames: Vec::new(),
            tables: vec![Table::default()],
            globals: HashMap::new(),
            next_ref: 1,
            free_refs: Vec::new(),
        }
    }

    fn base(&self) -> usize {
        self.frames.last().copied().unwrap_or(0)
    }

    fn top(&self) -> i32 {
        (self.stack.len() - self.base()) as i32
    }

    /// Absolute stack position of an acceptable index.
    fn slot(&self, idx: i32) -> Option<usize> {
        let base = self.base();
        let pos = if idx > 0 {
            base + idx as usize - 1
        } else if idx < 0 && idx > REGISTRY_INDEX {
            let back = idx.unsigned_abs() as usize;
            self.stack.len().checked_sub(back).filter(|p| *p >= base)?
        } else {
            return None;
        };
        (pos < self.stack.len()).then_some(pos)
    }

    fn get(&self, idx: i32) -> Option<&Value> {
        if idx == REGISTRY_INDEX {
            return None;
        }
        self.slot(idx).map(|p| &self.stack[p])
    }

    fn value(&self, idx: i32) -> Value {
        if idx == REGISTRY_INDEX {
            return Value::Table(REGISTRY_TABLE);
        }
        self.get(idx).cloned().unwrap_or(Value::Nil)
    }

    fn table_at(&self, idx: i32) -> Option<usize> {
        match self.value(idx) {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    fn pop(&mut self) -> Value {
        if self.stack.len() > self.base() {
            self.stack.pop().unwrap_or(Value::Nil)
        } else {
            Value::Nil
        }
    }
}

/// The reference guest. See the crate docs.
pub struct SimGuest {
    heap: Heap,
    states: BTreeMap<u32, State>,
    next_state: u32,
    callbacks: HashMap<u32, GuestCallback>,
    next_callback: u32,
    /// Guest-owned copies backing `to_string` results.
    string_cache: HashMap<Rc<str>, Ptr>,
    host_allocs: HashSet<u32>,
    probe: SimProbe,
    next_opaque: u32,
    call_depth: usize,
}

impl Default for SimGuest {
    fn default() -> Self {
        Self::new()
    }
}

impl SimGuest {
    pub fn new() -> Self {
        let probe = SimProbe::new();
        Self {
            heap: Heap::new(probe.heap_limit()),
            states: BTreeMap::new(),
            next_state: 1,
            callbacks: HashMap::new(),
            next_callback: 1,
            string_cache: HashMap::new(),
            host_allocs: HashSet::new(),
            probe,
            next_opaque: 0,
            call_depth: 0,
        }
    }

    pub fn with_heap_limit(bytes: usize) -> Self {
        let sim = Self::new();
        sim.probe.set_heap_limit(bytes);
        sim
    }

    pub fn probe(&self) -> SimProbe {
        self.probe.clone()
    }

    fn state(&self, l: StatePtr) -> Option<&State> {
        self.states.get(&l.0)
    }

    fn state_mut(&mut self, l: StatePtr) -> Option<&mut State> {
        self.states.get_mut(&l.0)
    }

    fn push(&mut self, l: StatePtr, v: Value) {
        if let Some(st) = self.state_mut(l) {
            st.stack.push(v);
        }
    }

    fn value_at(&self, l: StatePtr, idx: i32) -> Value {
        self.state(l).map(|st| st.value(idx)).unwrap_or(Value::Nil)
    }

    fn alloc(&mut self, len: u32) -> Option<Ptr> {
        self.heap.set_limit(self.probe.heap_limit());
        self.heap.alloc(len)
    }

    /// Guest-owned, NUL-terminated copy of `s`, shared between equal strings.
    fn cached_string(&mut self, s: &Rc<str>) -> Ptr {
        if let Some(&ptr) = self.string_cache.get(s) {
            return ptr;
        }
        let Ok(len) = u32::try_from(s.len() + 1) else {
            return Ptr::NULL;
        };
        let Some(ptr) = self.alloc(len) else {
            return Ptr::NULL;
        };
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.heap.write(ptr, &bytes);
        self.string_cache.insert(s.clone(), ptr);
        ptr
    }

    fn raise(&mut self, l: StatePtr, status: StatusCode, message: String) -> i32 {
        self.push(l, Value::str(&message));
        status.raw()
    }
}

fn chunk_name(src: &str) -> String {
    let first = src.lines().next().unwrap_or("");
    let truncated = first.chars().count() > CHUNK_NAME_MAX || src.trim_end().contains('\n');
    if truncated {
        let head: String = first.chars().take(CHUNK_NAME_MAX).collect();
        format!("[string \"{head}...\"]")
    } else {
        format!("[string \"{first}\"]")
    }
}

impl GuestApi for SimGuest {
    fn new_state(&mut self) -> StatePtr {
        if self.probe.fail_new_state() {
            return StatePtr::NULL;
        }
        let id = self.next_state;
        self.next_state += 1;
        self.states.insert(id, State::new());
        self.probe.set_live_states(self.states.len());
        StatePtr(id)
    }

    fn open_libs(&mut self, l: StatePtr) {
        if let Some(st) = self.state_mut(l) {
            for (name, b) in stdlib::ALL {
                st.globals.insert(Rc::from(*name), Value::Builtin(*b));
            }
        }
    }

    fn close(&mut self, l: StatePtr) {
        self.states.remove(&l.0);
        self.probe.set_live_states(self.states.len());
    }

    fn malloc(&mut self, len: u32) -> Ptr {
        let ptr = self.alloc(len);
        self.probe.on_malloc(ptr.is_some());
        match ptr {
            Some(ptr) => {
                self.host_allocs.insert(ptr.0);
                ptr
            }
            None => Ptr::NULL,
        }
    }

    fn free(&mut self, ptr: Ptr) {
        if ptr.is_null() {
            return;
        }
        let was_live = self.host_allocs.remove(&ptr.0);
        if was_live {
            self.heap.free(ptr);
        }
        self.probe.on_free(was_live);
    }

    fn heap(&self) -> &[u8] {
        self.heap.bytes()
    }

    fn heap_mut(&mut self) -> &mut [u8] {
        self.heap.bytes_mut()
    }

    fn push_nil(&mut self, l: StatePtr) {
        self.push(l, Value::Nil);
    }

    fn push_boolean(&mut self, l: StatePtr, b: bool) {
        self.push(l, Value::Bool(b));
    }

    fn push_integer(&mut self, l: StatePtr, n: i64) {
        self.push(l, Value::Int(n));
    }

    fn push_number(&mut self, l: StatePtr, n: f64) {
        self.push(l, Value::Num(n));
    }

    fn push_string(&mut self, l: StatePtr, s: Ptr) {
        let v = match fetch_c_string(self.heap.bytes(), s) {
            Some(text) => Value::str(&text),
            None => Value::Nil,
        };
        self.push(l, v);
    }

    fn push_cfunction(&mut self, l: StatePtr, f: Ptr) {
        self.push(l, Value::Native(f));
    }

    fn push_value(&mut self, l: StatePtr, idx: i32) {
        let v = self.value_at(l, idx);
        self.push(l, v);
    }

    fn create_table(&mut self, l: StatePtr, narr: i32, nrec: i32) {
        let capacity = (narr.max(0) + nrec.max(0)) as usize;
        if let Ok(t) = self.new_table(l, capacity) {
            self.push(l, t);
        }
    }

    fn type_of(&self, l: StatePtr, idx: i32) -> i32 {
        let ty = match self.state(l) {
            Some(_) if idx == REGISTRY_INDEX => LuaType::Table,
            Some(st) => st.get(idx).map_or(LuaType::None, Value::type_tag),
            None => LuaType::None,
        };
        ty.raw()
    }

    fn to_boolean(&self, l: StatePtr, idx: i32) -> bool {
        self.value_at(l, idx).truthy()
    }

    fn to_integerx(&self, l: StatePtr, idx: i32) -> Option<i64> {
        self.value_at(l, idx).to_integer()
    }

    fn to_numberx(&self, l: StatePtr, idx: i32) -> Option<f64> {
        self.value_at(l, idx).to_number()
    }

    fn is_integer(&self, l: StatePtr, idx: i32) -> bool {
        matches!(self.value_at(l, idx), Value::Int(_))
    }

    fn to_string(&mut self, l: StatePtr, idx: i32) -> Ptr {
        let Some(pos) = self.state(l).and_then(|st| st.slot(idx)) else {
            return Ptr::NULL;
        };
        let s = match self.value_at(l, idx) {
            Value::Str(s) => s,
            v @ (Value::Int(_) | Value::Num(_)) => {
                let s: Rc<str> = Rc::from(eval::tostring(&v).as_str());
                if let Some(st) = self.state_mut(l) {
                    st.stack[pos] = Value::Str(s.clone());
                }
                s
            }
            _ => return Ptr::NULL,
        };
        self.cached_string(&s)
    }

    fn is_cfunction(&self, l: StatePtr, idx: i32) -> bool {
        matches!(self.value_at(l, idx), Value::Native(_) | Value::Builtin(_))
    }

    fn to_cfunction(&self, l: StatePtr, idx: i32) -> Ptr {
        match self.value_at(l, idx) {
            Value::Native(p) => p,
            Value::Builtin(b) => b.ptr(),
            _ => Ptr::NULL,
        }
    }

    fn get_top(&self, l: StatePtr) -> i32 {
        self.state(l).map_or(0, State::top)
    }

    fn set_top(&mut self, l: StatePtr, idx: i32) {
        let Some(st) = self.state_mut(l) else {
            return;
        };
        let base = st.base();
        let len = if idx >= 0 {
            base + idx as usize
        } else {
            (st.stack.len() + 1)
                .saturating_sub(idx.unsigned_abs() as usize)
                .max(base)
        };
        st.stack.resize(len, Value::Nil);
    }

    fn next(&mut self, l: StatePtr, idx: i32) -> i32 {
        let Some(st) = self.state_mut(l) else {
            return 0;
        };
        let table = st.table_at(idx);
        let key = st.pop();
        let Some(t) = table.and_then(|t| st.tables.get(t)) else {
            return 0;
        };
        match t.next(&key) {
            Ok(Some((k, v))) => {
                st.stack.push(k);
                st.stack.push(v);
                1
            }
            Ok(None) | Err(()) => 0,
        }
    }

    fn set_table(&mut self, l: StatePtr, idx: i32) {
        let Some(st) = self.state_mut(l) else {
            return;
        };
        let table = st.table_at(idx);
        let v = st.pop();
        let k = st.pop();
        if let Some(t) = table.and_then(|t| st.tables.get_mut(t)) {
            t.set(k, v);
        }
    }

    fn get_global(&mut self, l: StatePtr, name: Ptr) -> i32 {
        let v = match fetch_c_string(self.heap.bytes(), name) {
            Some(name) => self
                .state(l)
                .and_then(|st| st.globals.get(name.as_str()).cloned())
                .unwrap_or(Value::Nil),
            None => Value::Nil,
        };
        let ty = v.type_tag();
        self.push(l, v);
        ty.raw()
    }

    fn set_global(&mut self, l: StatePtr, name: Ptr) {
        let name = fetch_c_string(self.heap.bytes(), name);
        let Some(st) = self.state_mut(l) else {
            return;
        };
        let v = st.pop();
        let Some(name) = name else {
            return;
        };
        match v {
            Value::Nil => {
                st.globals.remove(name.as_str());
            }
            v => {
                st.globals.insert(Rc::from(name.as_str()), v);
            }
        }
    }

    fn raw_geti(&mut self, l: StatePtr, idx: i32, n: i64) -> i32 {
        let v = self
            .state(l)
            .and_then(|st| st.table_at(idx).and_then(|t| st.tables.get(t)))
            .map(|t| t.get_int(n))
            .unwrap_or(Value::Nil);
        let ty = v.type_tag();
        self.push(l, v);
        ty.raw()
    }

    fn reference(&mut self, l: StatePtr, t: i32) -> i32 {
        let Some(st) = self.state_mut(l) else {
            return REF_NIL;
        };
        let table = st.table_at(t);
        let v = st.pop();
        if matches!(v, Value::Nil) {
            return REF_NIL;
        }
        let Some(table) = table else {
            return REF_NIL;
        };
        let r = st.free_refs.pop().unwrap_or_else(|| {
            let r = st.next_ref;
            st.next_ref += 1;
            r
        });
        if let Some(tbl) = st.tables.get_mut(table) {
            tbl.set(Value::Int(i64::from(r)), v);
        }
        r
    }

    fn unreference(&mut self, l: StatePtr, t: i32, r: i32) {
        if r < 1 {
            return;
        }
        let Some(st) = self.state_mut(l) else {
            return;
        };
        let Some(table) = st.table_at(t).and_then(|t| st.tables.get_mut(t)) else {
            return;
        };
        if !matches!(table.get_int(i64::from(r)), Value::Nil) {
            table.set(Value::Int(i64::from(r)), Value::Nil);
            st.free_refs.push(r);
        }
    }

    fn load_string(&mut self, l: StatePtr, src: Ptr) -> i32 {
        let Some(text) = fetch_c_string(self.heap.bytes(), src) else {
            return self.raise(l, StatusCode::ErrSyntax, "source is not a string".to_string());
        };
        match parser::parse_chunk(&text) {
            Ok(block) => {
                let chunk = Function {
                    params: Vec::new(),
                    body: Rc::new(block),
                };
                self.push(l, Value::LuaFn(Rc::new(chunk)));
                StatusCode::Ok.raw()
            }
            Err(e) => {
                let message = format!("{}:{}", chunk_name(&text), e);
                self.raise(l, StatusCode::ErrSyntax, message)
            }
        }
    }

    fn pcall(&mut self, l: StatePtr, nargs: i32, nresults: i32, _errfunc: i32) -> i32 {
        let Some(st) = self.state_mut(l) else {
            return StatusCode::ErrRun.raw();
        };
        let nargs = nargs.max(0) as usize;
        let Some(fpos) = st
            .stack
            .len()
            .checked_sub(nargs + 1)
            .filter(|p| *p >= st.base())
        else {
            return self.raise(l, StatusCode::ErrRun, "attempt to call a nil value".to_string());
        };
        let args = st.stack.split_off(fpos + 1);
        let f = st.pop();

        let result = self.call_value(l, f, args);

        let Some(st) = self.state_mut(l) else {
            return StatusCode::ErrRun.raw();
        };
        st.stack.truncate(fpos.max(st.base()));
        match result {
            Ok(mut vals) => {
                if nresults != MULTRET {
                    vals.resize(nresults.max(0) as usize, Value::Nil);
                }
                st.stack.extend(vals);
                StatusCode::Ok.raw()
            }
            Err(err) => {
                st.stack.push(err.0);
                StatusCode::ErrRun.raw()
            }
        }
    }

    fn register_native_callback(&mut self, f: GuestCallback) -> Ptr {
        let id = self.next_callback;
        self.next_callback += 1;
        self.callbacks.insert(id, f);
        self.probe.set_live_callbacks(self.callbacks.len());
        Ptr(id)
    }

    fn release_native_callback(&mut self, f: Ptr) {
        self.callbacks.remove(&f.0);
        self.probe.set_live_callbacks(self.callbacks.len());
    }
}
