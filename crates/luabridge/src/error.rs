use std::fmt;

use luabridge_contracts::{LuaType, StatusCode};
use luabridge_guest_core::MemoryError;

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Instance,
    Code,
    Reference,
}

impl HandleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HandleKind::Instance => "instance",
            HandleKind::Code => "code",
            HandleKind::Reference => "reference",
        }
    }
}

/// A guest-side failure surfaced by a protected call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionError {
    pub status: StatusCode,
    pub message: String,
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for ExecutionError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The primitive surface has not been installed yet.
    NotInitialized,
    HandleNotFound {
        kind: HandleKind,
        id: String,
    },
    NotCallable {
        name: String,
        found: LuaType,
    },
    UnsupportedValueKind {
        kind: &'static str,
        detail: String,
    },
    Execution(ExecutionError),
    /// The guest heap is exhausted. Never retried.
    AllocationFailure {
        bytes: usize,
    },
}

impl BridgeError {
    pub(crate) fn handle_not_found(kind: HandleKind, id: impl fmt::Display) -> Self {
        BridgeError::HandleNotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn unsupported(kind: &'static str, detail: impl Into<String>) -> Self {
        BridgeError::UnsupportedValueKind {
            kind,
            detail: detail.into(),
        }
    }

    pub fn as_execution(&self) -> Option<&ExecutionError> {
        match self {
            BridgeError::Execution(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::NotInitialized => {
                f.write_str("interpreter primitive surface is not initialized yet")
            }
            BridgeError::HandleNotFound { kind, id } => {
                write!(f, "no live {} handle {id}", kind.as_str())
            }
            BridgeError::NotCallable { name, found } => {
                write!(f, "{name:?} is not callable (found {found})")
            }
            BridgeError::UnsupportedValueKind { kind, detail } => {
                write!(f, "unsupported value kind {kind}: {detail}")
            }
            BridgeError::Execution(e) => write!(f, "guest execution failed: {e}"),
            BridgeError::AllocationFailure { bytes } => {
                write!(f, "guest heap exhausted allocating {bytes} bytes")
            }
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::Execution(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ExecutionError> for BridgeError {
    fn from(e: ExecutionError) -> Self {
        BridgeError::Execution(e)
    }
}

impl From<MemoryError> for BridgeError {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::InteriorNul { .. } => BridgeError::unsupported("string", e.to_string()),
            MemoryError::OutOfMemory { bytes } | MemoryError::TooLarge { bytes } => {
                BridgeError::AllocationFailure { bytes }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interior_nul_maps_to_unsupported_string() {
        let err = BridgeError::from(MemoryError::InteriorNul { at: 3 });
        assert!(matches!(
            err,
            BridgeError::UnsupportedValueKind { kind: "string", .. }
        ));
    }

    #[test]
    fn execution_errors_render_status_and_message() {
        let err = BridgeError::from(ExecutionError {
            status: StatusCode::ErrSyntax,
            message: "oops".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "guest execution failed: syntax error (3): oops"
        );
        assert_eq!(err.as_execution().map(|e| e.status), Some(StatusCode::ErrSyntax));
    }
}
