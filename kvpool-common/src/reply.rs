//! # Reply Values
//!
//! Purpose: Represent a backend reply without interpreting it, so the pool
//! and dispatcher stay agnostic to what each command returns.
//!
//! ## Design Principles
//! 1. **Binary-Safe**: Bulk payloads are raw bytes, never assumed UTF-8.
//! 2. **Opaque Until Needed**: Only the facade decides what a reply means.

use std::fmt;

/// One reply frame returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// +OK or +PONG style replies.
    Simple(Vec<u8>),
    /// -ERR ... replies.
    Error(Vec<u8>),
    /// :123 replies.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays, with an empty vector for null arrays.
    Array(Vec<Reply>),
}

impl Reply {
    /// Returns the payload of a simple or non-null bulk string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Simple(data) => Some(data),
            Reply::Bulk(Some(data)) => Some(data),
            _ => None,
        }
    }

    /// Returns the integer value of an integer reply.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Short frame kind used in error messages and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Simple(_) => "simple",
            Reply::Error(_) => "error",
            Reply::Integer(_) => "integer",
            Reply::Bulk(Some(_)) => "bulk",
            Reply::Bulk(None) => "null",
            Reply::Array(_) => "array",
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Simple(data) => write!(f, "{}", String::from_utf8_lossy(data)),
            Reply::Error(message) => write!(f, "(error) {}", String::from_utf8_lossy(message)),
            Reply::Integer(value) => write!(f, "(integer) {}", value),
            Reply::Bulk(Some(data)) => write!(f, "{:?}", String::from_utf8_lossy(data)),
            Reply::Bulk(None) => write!(f, "(nil)"),
            Reply::Array(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_accessor_covers_simple_and_bulk() {
        assert_eq!(Reply::Simple(b"OK".to_vec()).as_bytes(), Some(&b"OK"[..]));
        assert_eq!(Reply::Bulk(Some(b"v".to_vec())).as_bytes(), Some(&b"v"[..]));
        assert_eq!(Reply::Bulk(None).as_bytes(), None);
        assert_eq!(Reply::Integer(3).as_bytes(), None);
    }

    #[test]
    fn displays_nested_arrays() {
        let reply = Reply::Array(vec![
            Reply::Bulk(Some(b"0".to_vec())),
            Reply::Array(vec![Reply::Integer(1), Reply::Bulk(None)]),
        ]);
        assert_eq!(reply.to_string(), "[\"0\", [(integer) 1, (nil)]]");
    }
}
