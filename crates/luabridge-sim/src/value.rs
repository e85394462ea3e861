use std::collections::HashMap;
use std::rc::Rc;

use luabridge_contracts::LuaType;
use luabridge_guest_core::Ptr;

use crate::parser::Block;
use crate::stdlib::Builtin;

#[derive(Debug)]
pub(crate) struct Function {
    pub(crate) params: Vec<Rc<str>>,
    pub(crate) body: Rc<Block>,
}

#[derive(Clone, Debug)]
pub(crate) enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Num(f64),
    Str(Rc<str>),
    Table(usize),
    LuaFn(Rc<Function>),
    Builtin(Builtin),
    Native(Ptr),
    Userdata(u32),
    Thread(u32),
}

impl Value {
    pub(crate) fn str(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }

    pub(crate) fn type_tag(&self) -> LuaType {
        match self {
            Value::Nil => LuaType::Nil,
            Value::Bool(_) => LuaType::Boolean,
            Value::Int(_) | Value::Num(_) => LuaType::Number,
            Value::Str(_) => LuaType::String,
            Value::Table(_) => LuaType::Table,
            Value::LuaFn(_) | Value::Builtin(_) | Value::Native(_) => LuaType::Function,
            Value::Userdata(_) => LuaType::Userdata,
            Value::Thread(_) => LuaType::Thread,
        }
    }

    pub(crate) fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub(crate) fn to_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Num(n) => Some(*n),
            Value::Str(s) => parse_number(s).and_then(|v| v.to_number()),
            _ => None,
        }
    }

    pub(crate) fn to_integer(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Num(n) => float_to_int(*n),
            Value::Str(s) => parse_number(s).and_then(|v| v.to_integer()),
            _ => None,
        }
    }

    pub(crate) fn raw_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Int(_) | Value::Num(_), Value::Int(_) | Value::Num(_)) => {
                self.to_number() == other.to_number()
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::LuaFn(a), Value::LuaFn(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Native(a), Value::Native(b)) => a == b,
            (Value::Userdata(a), Value::Userdata(b)) => a == b,
            (Value::Thread(a), Value::Thread(b)) => a == b,
            _ => false,
        }
    }
}

pub(crate) fn float_to_int(n: f64) -> Option<i64> {
    if n.fract() == 0.0 && n >= -9.223_372_036_854_776e18 && n < 9.223_372_036_854_776e18 {
        Some(n as i64)
    } else {
        None
    }
}

/// Parses a numeric literal the way the guest's string-to-number coercion does.
pub(crate) fn parse_number(s: &str) -> Option<Value> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok().map(Value::Int);
    }
    if t.bytes().all(|b| b.is_ascii_digit() || b == b'-' || b == b'+') {
        if let Ok(i) = t.parse::<i64>() {
            return Some(Value::Int(i));
        }
    }
    let looks_numeric = t
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'-' | b'+'));
    if !looks_numeric {
        return None;
    }
    t.parse::<f64>().ok().map(Value::Num)
}

pub(crate) fn fmt_number(n: f64) -> String {
    if n.is_nan() {
        return if n.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if n.fract() == 0.0 && n.abs() < 1e16 {
        format!("{n:.1}")
    } else {
        format!("{n}")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Key {
    Bool(bool),
    Int(i64),
    Num(u64),
    Str(Rc<str>),
    Table(usize),
    LuaFn(usize),
    Builtin(Builtin),
    Native(u32),
    Userdata(u32),
    Thread(u32),
}

impl Key {
    /// Float keys with an integral value are normalized to integer keys.
    pub(crate) fn of(v: &Value) -> Option<Key> {
        Some(match v {
            Value::Nil => return None,
            Value::Bool(b) => Key::Bool(*b),
            Value::Int(i) => Key::Int(*i),
            Value::Num(n) if n.is_nan() => return None,
            Value::Num(n) => match float_to_int(*n) {
                Some(i) => Key::Int(i),
                None => Key::Num(n.to_bits()),
            },
            Value::Str(s) => Key::Str(s.clone()),
            Value::Table(t) => Key::Table(*t),
            Value::LuaFn(f) => Key::LuaFn(Rc::as_ptr(f) as usize),
            Value::Builtin(b) => Key::Builtin(*b),
            Value::Native(p) => Key::Native(p.0),
            Value::Userdata(u) => Key::Userdata(*u),
            Value::Thread(t) => Key::Thread(*t),
        })
    }
}

/// Insertion-ordered hash table; traversal order is insertion order.
#[derive(Debug, Default)]
pub(crate) struct Table {
    entries: Vec<(Value, Value)>,
    index: HashMap<Key, usize>,
}

impl Table {
    pub(crate) fn with_capacity(n: usize) -> Self {
        Self {
            entries: Vec::with_capacity(n),
            index: HashMap::with_capacity(n),
        }
    }

    pub(crate) fn get(&self, key: &Value) -> Value {
        Key::of(key)
            .and_then(|k| self.index.get(&k))
            .map(|&i| self.entries[i].1.clone())
            .unwrap_or(Value::Nil)
    }

    pub(crate) fn get_int(&self, n: i64) -> Value {
        self.get(&Value::Int(n))
    }

    /// Returns false if `key` cannot index a table (nil or NaN).
    pub(crate) fn set(&mut self, key: Value, value: Value) -> bool {
        let Some(k) = Key::of(&key) else {
            return false;
        };
        let key = match (&k, key) {
            (Key::Int(i), Value::Num(_)) => Value::Int(*i),
            (_, key) => key,
        };
        match (self.index.get(&k).copied(), value) {
            (Some(i), Value::Nil) => {
                self.entries.remove(i);
                self.index.remove(&k);
                for slot in self.index.values_mut() {
                    if *slot > i {
                        *slot -= 1;
                    }
                }
            }
            (Some(i), value) => self.entries[i].1 = value,
            (None, Value::Nil) => {}
            (None, value) => {
                self.index.insert(k, self.entries.len());
                self.entries.push((key, value));
            }
        }
        true
    }

    /// The pair following `key` in traversal order; `Nil` starts the traversal.
    /// `Err(())` means `key` is not present in the table.
    pub(crate) fn next(&self, key: &Value) -> Result<Option<(Value, Value)>, ()> {
        let start = match key {
            Value::Nil => 0,
            key => {
                let k = Key::of(key).ok_or(())?;
                self.index.get(&k).ok_or(())? + 1
            }
        };
        Ok(self.entries.get(start).cloned())
    }

    /// Largest `n` such that `1..=n` are all present.
    pub(crate) fn border(&self) -> i64 {
        let mut n = 0;
        while self.index.contains_key(&Key::Int(n + 1)) {
            n += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_float_keys_collapse_into_integer_keys() {
        let mut t = Table::default();
        t.set(Value::Num(2.0), Value::str("x"));
        assert!(matches!(t.get_int(2), Value::Str(ref s) if &**s == "x"));
        let (k, _) = t.next(&Value::Nil).unwrap().unwrap();
        assert!(matches!(k, Value::Int(2)));
    }

    #[test]
    fn assigning_nil_removes_and_keeps_order() {
        let mut t = Table::default();
        for i in 1..=3 {
            t.set(Value::Int(i), Value::Int(i * 10));
        }
        t.set(Value::Int(2), Value::Nil);
        let (k1, _) = t.next(&Value::Nil).unwrap().unwrap();
        let (k2, v2) = t.next(&k1).unwrap().unwrap();
        assert!(matches!(k2, Value::Int(3)));
        assert!(matches!(v2, Value::Int(30)));
        assert!(t.next(&k2).unwrap().is_none());
        assert_eq!(t.border(), 1);
    }

    #[test]
    fn nil_and_nan_keys_are_rejected() {
        let mut t = Table::default();
        assert!(!t.set(Value::Nil, Value::Int(1)));
        assert!(!t.set(Value::Num(f64::NAN), Value::Int(1)));
    }

    #[test]
    fn parses_numeric_strings() {
        assert!(matches!(parse_number("10"), Some(Value::Int(10))));
        assert!(matches!(parse_number(" 2.5 "), Some(Value::Num(n)) if n == 2.5));
        assert!(matches!(parse_number("0x10"), Some(Value::Int(16))));
        assert!(parse_number("abc").is_none());
        assert!(parse_number("inf").is_none());
    }

    #[test]
    fn formats_numbers_like_the_guest() {
        assert_eq!(fmt_number(3.0), "3.0");
        assert_eq!(fmt_number(7.5), "7.5");
    }
}
