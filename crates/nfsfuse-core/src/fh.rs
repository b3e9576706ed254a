//! Bounded remote file handles.
//!
//! A file handle is an opaque byte string chosen by the server. Two handles
//! name the same object iff they have the same length and the same bytes up
//! to that length; trailing storage is never compared or hashed.

use std::fmt;
use std::hash::{Hash, Hasher};

use thiserror::Error;

/// Largest handle the protocol allows, in bytes.
pub const MAX_FHSIZE: usize = 128;

/// Error building a handle from server-supplied bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("file handle of {len} bytes exceeds the {MAX_FHSIZE}-byte limit")]
pub struct HandleTooLarge {
    pub len: usize,
}

/// A remote file handle with an explicit length.
#[derive(Clone, Copy)]
pub struct FileHandle {
    len: u16,
    data: [u8; MAX_FHSIZE],
}

impl FileHandle {
    /// Copies `bytes` into a bounded handle.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HandleTooLarge> {
        if bytes.len() > MAX_FHSIZE {
            return Err(HandleTooLarge { len: bytes.len() });
        }
        let mut data = [0u8; MAX_FHSIZE];
        data[..bytes.len()].copy_from_slice(bytes);
        #[allow(clippy::cast_possible_truncation)]
        Ok(Self {
            len: bytes.len() as u16,
            data,
        })
    }

    /// Builds a handle from a fixed-size array known to fit.
    pub fn from_array<const N: usize>(bytes: [u8; N]) -> Self {
        const { assert!(N <= MAX_FHSIZE) };
        let mut data = [0u8; MAX_FHSIZE];
        data[..N].copy_from_slice(&bytes);
        #[allow(clippy::cast_possible_truncation)]
        Self { len: N as u16, data }
    }

    /// Builds a handle whose storage past `len` holds arbitrary bytes.
    ///
    /// Only the first `len` bytes take part in equality and hashing, so this
    /// is how tests model handles copied out of reused buffers.
    pub fn from_raw_parts(data: [u8; MAX_FHSIZE], len: usize) -> Result<Self, HandleTooLarge> {
        if len > MAX_FHSIZE {
            return Err(HandleTooLarge { len });
        }
        #[allow(clippy::cast_possible_truncation)]
        Ok(Self {
            len: len as u16,
            data,
        })
    }

    /// The meaningful bytes of the handle.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len()]
    }

    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl PartialEq for FileHandle {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.as_bytes() == other.as_bytes()
    }
}

impl Eq for FileHandle {}

impl Hash for FileHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileHandle({}:", self.len)?;
        for b in self.as_bytes() {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

impl TryFrom<&[u8]> for FileHandle {
    type Error = HandleTooLarge;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Self::from_bytes(bytes)
    }
}
