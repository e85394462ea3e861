use luabridge_guest_core::Ptr;

use crate::eval::{tostring, LuaError};
use crate::value::{parse_number, Value};
use crate::SimGuest;

/// Functions installed by `open_libs`. `newuserdata` and `newthread` exist so tests
/// can produce values the host side has no representation for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Builtin {
    Print,
    Type,
    ToString,
    ToNumber,
    Error,
    Assert,
    NewUserdata,
    NewThread,
}

const BUILTIN_PTR_BASE: u32 = 0x7f00_0000;

pub(crate) const ALL: &[(&str, Builtin)] = &[
    ("print", Builtin::Print),
    ("type", Builtin::Type),
    ("tostring", Builtin::ToString),
    ("tonumber", Builtin::ToNumber),
    ("error", Builtin::Error),
    ("assert", Builtin::Assert),
    ("newuserdata", Builtin::NewUserdata),
    ("newthread", Builtin::NewThread),
];

impl Builtin {
    /// Function-table address reported for the builtin; never registered by a host.
    pub(crate) fn ptr(self) -> Ptr {
        let idx = ALL.iter().position(|(_, b)| *b == self).unwrap_or(0) as u32;
        Ptr(BUILTIN_PTR_BASE + idx)
    }
}

pub(crate) fn call(
    sim: &mut SimGuest,
    builtin: Builtin,
    args: Vec<Value>,
) -> Result<Vec<Value>, LuaError> {
    match builtin {
        Builtin::Print => {
            let line = args
                .iter()
                .map(tostring)
                .collect::<Vec<_>>()
                .join("\t");
            sim.probe.record_output(line);
            Ok(Vec::new())
        }
        Builtin::Type => {
            if args.is_empty() {
                return Err(LuaError::msg("bad argument #1 to 'type' (value expected)"));
            }
            Ok(vec![Value::str(nth(&args, 0).type_tag().as_str())])
        }
        Builtin::ToString => Ok(vec![Value::str(&tostring(&nth(&args, 0)))]),
        Builtin::ToNumber => Ok(vec![match nth(&args, 0) {
            v @ (Value::Int(_) | Value::Num(_)) => v,
            Value::Str(s) => parse_number(&s).unwrap_or(Value::Nil),
            _ => Value::Nil,
        }]),
        Builtin::Error => Err(LuaError(nth(&args, 0))),
        Builtin::Assert => {
            if nth(&args, 0).truthy() {
                Ok(args)
            } else if args.len() > 1 {
                Err(LuaError(nth(&args, 1)))
            } else {
                Err(LuaError::msg("assertion failed!"))
            }
        }
        Builtin::NewUserdata => {
            sim.next_opaque += 1;
            Ok(vec![Value::Userdata(sim.next_opaque)])
        }
        Builtin::NewThread => {
            sim.next_opaque += 1;
            Ok(vec![Value::Thread(sim.next_opaque)])
        }
    }
}

fn nth(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or(Value::Nil)
}
