//! Shared, version-pinned constants for the guest interpreter boundary.
//!
//! These values mirror the numeric contract of the embedded interpreter's C surface
//! (status codes, type tags, pseudo-indices). Both the bridge and any guest
//! implementation must agree on them; this crate is the single source of truth.

use std::fmt;

pub const LUABRIDGE_REPORT_SCHEMA_VERSION: &str = "luabridge.report@0.1.0";

/// Result-count request meaning "keep every value the callee returns".
pub const MULTRET: i32 = -1;

/// Pseudo-index of the guest registry table.
pub const REGISTRY_INDEX: i32 = -1_001_000;

/// Returned by reference creation when the anchored value was nil.
pub const REF_NIL: i32 = -1;
/// Never a valid reference.
pub const NO_REF: i32 = -2;

/// Returned by a native trampoline to signal "the error object is on top of the stack".
pub const NATIVE_ERROR: i32 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Yield,
    ErrRun,
    ErrSyntax,
    ErrMem,
    ErrErr,
    ErrFile,
    Other(i32),
}

impl StatusCode {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => StatusCode::Ok,
            1 => StatusCode::Yield,
            2 => StatusCode::ErrRun,
            3 => StatusCode::ErrSyntax,
            4 => StatusCode::ErrMem,
            5 => StatusCode::ErrErr,
            6 => StatusCode::ErrFile,
            other => StatusCode::Other(other),
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::Yield => 1,
            StatusCode::ErrRun => 2,
            StatusCode::ErrSyntax => 3,
            StatusCode::ErrMem => 4,
            StatusCode::ErrErr => 5,
            StatusCode::ErrFile => 6,
            StatusCode::Other(raw) => raw,
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, StatusCode::Ok)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::Ok => "ok",
            StatusCode::Yield => "yield",
            StatusCode::ErrRun => "runtime error",
            StatusCode::ErrSyntax => "syntax error",
            StatusCode::ErrMem => "memory error",
            StatusCode::ErrErr => "error in error handler",
            StatusCode::ErrFile => "file error",
            StatusCode::Other(_) => "unknown status",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.raw())
    }
}

/// Guest type tags as reported by the type query primitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LuaType {
    None,
    Nil,
    Boolean,
    LightUserdata,
    Number,
    String,
    Table,
    Function,
    Userdata,
    Thread,
}

impl LuaType {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => LuaType::Nil,
            1 => LuaType::Boolean,
            2 => LuaType::LightUserdata,
            3 => LuaType::Number,
            4 => LuaType::String,
            5 => LuaType::Table,
            6 => LuaType::Function,
            7 => LuaType::Userdata,
            8 => LuaType::Thread,
            _ => LuaType::None,
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            LuaType::None => -1,
            LuaType::Nil => 0,
            LuaType::Boolean => 1,
            LuaType::LightUserdata => 2,
            LuaType::Number => 3,
            LuaType::String => 4,
            LuaType::Table => 5,
            LuaType::Function => 6,
            LuaType::Userdata => 7,
            LuaType::Thread => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LuaType::None => "no value",
            LuaType::Nil => "nil",
            LuaType::Boolean => "boolean",
            LuaType::LightUserdata | LuaType::Userdata => "userdata",
            LuaType::Number => "number",
            LuaType::String => "string",
            LuaType::Table => "table",
            LuaType::Function => "function",
            LuaType::Thread => "thread",
        }
    }

    /// True if values of this type never have a host representation.
    pub fn is_opaque(self) -> bool {
        matches!(
            self,
            LuaType::LightUserdata | LuaType::Userdata | LuaType::Thread
        )
    }
}

impl fmt::Display for LuaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
