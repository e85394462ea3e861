use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde_json::{Map, Number, Value};

use crate::marshal::CallContext;
use crate::{BridgeError, Result};

type HostFn = dyn Fn(&mut CallContext<'_>) -> anyhow::Result<Vec<HostValue>>;

/// A host function the guest can call through a trampoline.
///
/// Equality is identity: two `HostFunction`s are equal only if they share the
/// same allocation, which is also what the ledger deduplicates on.
#[derive(Clone)]
pub struct HostFunction(Rc<HostFn>);

impl HostFunction {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut CallContext<'_>) -> anyhow::Result<Vec<HostValue>> + 'static,
    {
        HostFunction(Rc::new(f))
    }

    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    pub(crate) fn call(&self, cx: &mut CallContext<'_>) -> anyhow::Result<Vec<HostValue>> {
        (self.0)(cx)
    }
}

impl PartialEq for HostFunction {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunction({:#x})", self.identity())
    }
}

/// A host-side value the marshaller can move into or out of the guest.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Nil,
    Boolean(bool),
    Integer(i64),
    /// Always pushed as a guest float, even when integral.
    Float(f64),
    String(String),
    Function(HostFunction),
    Sequence(Vec<HostValue>),
    /// Pushed like a sequence over its members; pulls back as a sequence.
    Set(Vec<HostValue>),
    Mapping(BTreeMap<String, HostValue>),
    /// Raw binary blob. Has no guest representation.
    Bytes(Vec<u8>),
    /// Identity-only symbol. Has no guest representation.
    Symbol(String),
}

impl HostValue {
    /// Integral, in-range numbers become `Integer`, everything else `Float`.
    pub fn number(n: f64) -> Self {
        if n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64 {
            HostValue::Integer(n as i64)
        } else {
            HostValue::Float(n)
        }
    }

    pub fn string(s: impl Into<String>) -> Self {
        HostValue::String(s.into())
    }

    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&mut CallContext<'_>) -> anyhow::Result<Vec<HostValue>> + 'static,
    {
        HostValue::Function(HostFunction::new(f))
    }

    pub fn mapping<K: Into<String>>(entries: impl IntoIterator<Item = (K, HostValue)>) -> Self {
        HostValue::Mapping(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HostValue::Nil => "nil",
            HostValue::Boolean(_) => "boolean",
            HostValue::Integer(_) => "integer",
            HostValue::Float(_) => "float",
            HostValue::String(_) => "string",
            HostValue::Function(_) => "function",
            HostValue::Sequence(_) => "sequence",
            HostValue::Set(_) => "set",
            HostValue::Mapping(_) => "mapping",
            HostValue::Bytes(_) => "bytes",
            HostValue::Symbol(_) => "symbol",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, HostValue::Nil)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HostValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Integer(i) => Some(*i as f64),
            HostValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&HostFunction> {
        match self {
            HostValue::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn from_json(v: &Value) -> Self {
        match v {
            Value::Null => HostValue::Nil,
            Value::Bool(b) => HostValue::Boolean(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => HostValue::Integer(i),
                None => HostValue::number(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => HostValue::String(s.clone()),
            Value::Array(items) => HostValue::Sequence(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => HostValue::Mapping(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Fails for functions, blobs, symbols and non-finite floats.
    pub fn to_json(&self) -> Result<Value> {
        Ok(match self {
            HostValue::Nil => Value::Null,
            HostValue::Boolean(b) => Value::Bool(*b),
            HostValue::Integer(i) => Value::from(*i),
            HostValue::Float(f) => Value::Number(Number::from_f64(*f).ok_or_else(|| {
                BridgeError::unsupported("float", format!("{f} has no JSON form"))
            })?),
            HostValue::String(s) => Value::String(s.clone()),
            HostValue::Sequence(items) | HostValue::Set(items) => {
                Value::Array(items.iter().map(Self::to_json).collect::<Result<_>>()?)
            }
            HostValue::Mapping(map) => {
                let mut out = Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.to_json()?);
                }
                Value::Object(out)
            }
            HostValue::Function(_) | HostValue::Bytes(_) | HostValue::Symbol(_) => {
                return Err(BridgeError::unsupported(self.kind(), "no JSON form"))
            }
        })
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Boolean(b)
    }
}

impl From<i64> for HostValue {
    fn from(i: i64) -> Self {
        HostValue::Integer(i)
    }
}

impl From<f64> for HostValue {
    fn from(f: f64) -> Self {
        HostValue::Float(f)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::String(s.to_string())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::String(s)
    }
}

impl From<Vec<HostValue>> for HostValue {
    fn from(items: Vec<HostValue>) -> Self {
        HostValue::Sequence(items)
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(HostValue::Nil, Into::into)
    }
}
