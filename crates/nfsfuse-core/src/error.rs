//! Errors returned by the dispatch surface.

use thiserror::Error;

use crate::client::{NfsStatus, RpcError};
use crate::icache::CacheError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NfsError {
    /// A name does not exist in its directory.
    #[error("no such file or directory")]
    NotFound,

    /// A cached node no longer names a live object on the server.
    #[error("stale file handle for inode {0}")]
    StaleHandle(u64),

    /// The kernel referred to an inode the cache does not hold.
    #[error("unknown inode {0}")]
    InvalidInode(u64),

    #[error("server returned {0:?}")]
    Remote(NfsStatus),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl NfsError {
    /// Converts this error to a libc error code for FUSE.
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::NotFound | Self::InvalidInode(_) => libc::ENOENT,
            Self::StaleHandle(_) => libc::ESTALE,
            Self::Remote(s) => s.to_errno(),
            Self::Transport(_) => libc::EIO,
            Self::Cache(CacheError::Full { .. }) => libc::ENFILE,
            Self::InvalidArgument(_) => libc::EINVAL,
        }
    }
}

impl From<RpcError> for NfsError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Status(NfsStatus::NoEnt) => Self::NotFound,
            RpcError::Status(s) => Self::Remote(s),
            RpcError::Transport(msg) => Self::Transport(msg),
        }
    }
}

pub type NfsResult<T> = Result<T, NfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_and_stale_are_distinct() {
        assert_eq!(NfsError::NotFound.to_errno(), libc::ENOENT);
        assert_eq!(NfsError::StaleHandle(7).to_errno(), libc::ESTALE);
    }

    #[test]
    fn test_from_rpc_error() {
        assert_eq!(
            NfsError::from(RpcError::Status(NfsStatus::NoEnt)),
            NfsError::NotFound
        );
        assert_eq!(
            NfsError::from(RpcError::Status(NfsStatus::Access)).to_errno(),
            libc::EACCES
        );
        assert_eq!(
            NfsError::from(RpcError::Transport("reset".into())).to_errno(),
            libc::EIO
        );
    }

    #[test]
    fn test_cache_full_maps_to_enfile() {
        let e: NfsError = CacheError::Full { limit: 1 }.into();
        assert_eq!(e.to_errno(), libc::ENFILE);
    }
}
