use std::fmt;

use crate::{GuestApi, Ptr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    InteriorNul { at: usize },
    OutOfMemory { bytes: usize },
    TooLarge { bytes: usize },
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::InteriorNul { at } => {
                write!(f, "string contains a NUL byte at offset {at}")
            }
            MemoryError::OutOfMemory { bytes } => {
                write!(f, "guest heap exhausted allocating {bytes} bytes")
            }
            MemoryError::TooLarge { bytes } => {
                write!(f, "allocation of {bytes} bytes exceeds the guest address space")
            }
        }
    }
}

impl std::error::Error for MemoryError {}

/// Encodes `s` as UTF-8 followed by a terminating NUL.
pub fn encode_c_string(s: &str) -> Result<Vec<u8>, MemoryError> {
    if let Some(at) = s.bytes().position(|b| b == 0) {
        return Err(MemoryError::InteriorNul { at });
    }
    let mut out = Vec::with_capacity(s.len() + 1);
    out.extend_from_slice(s.as_bytes());
    out.push(0);
    Ok(out)
}

/// Allocates exactly `len(s) + 1` bytes of guest memory and copies `s` into it.
/// The caller owns the returned pointer.
pub fn alloc_c_string(guest: &mut dyn GuestApi, s: &str) -> Result<Ptr, MemoryError> {
    let bytes = encode_c_string(s)?;
    let len = u32::try_from(bytes.len()).map_err(|_| MemoryError::TooLarge {
        bytes: bytes.len(),
    })?;
    let ptr = guest.malloc(len);
    if ptr.is_null() {
        return Err(MemoryError::OutOfMemory { bytes: bytes.len() });
    }
    let start = ptr.offset();
    let end = start + bytes.len();
    if guest.heap().len() < end {
        // The guest handed out a block it cannot back.
        guest.free(ptr);
        return Err(MemoryError::OutOfMemory { bytes: bytes.len() });
    }
    guest.heap_mut()[start..end].copy_from_slice(&bytes);
    Ok(ptr)
}

/// Decodes the NUL-terminated string at `ptr`. Invalid UTF-8 is replaced.
/// Returns `None` for the null pointer or when no terminator exists in bounds.
pub fn fetch_c_string(heap: &[u8], ptr: Ptr) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let tail = heap.get(ptr.offset()..)?;
    let len = tail.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&tail[..len]).into_owned())
}
