//! Error handling and mapping for the FUSE adapter.
//!
//! Everything the kernel sees is an errno; this module is where dispatch
//! failures and malformed kernel arguments are turned into one.

use nfsfuse_core::NfsError;
use thiserror::Error;

/// Adapter-level errors.
#[derive(Debug, Error)]
pub enum FuseError {
    #[error(transparent)]
    Nfs(#[from] NfsError),

    /// An offset or size from the kernel that cannot be represented remotely.
    #[error("invalid offset: {0}")]
    InvalidOffset(i64),

    /// Reply buffer too small for the requested data.
    #[error("reply of {needed} bytes exceeds buffer of {size}")]
    Range { needed: usize, size: u32 },
}

impl FuseError {
    /// Converts this error to a libc error code for FUSE.
    pub fn to_errno(&self) -> i32 {
        match self {
            FuseError::Nfs(e) => e.to_errno(),
            FuseError::InvalidOffset(_) => libc::EINVAL,
            FuseError::Range { .. } => libc::ERANGE,
        }
    }
}

/// Result type for FUSE operations.
pub type FuseResult<T> = Result<T, FuseError>;

#[cfg(test)]
mod tests {
    use super::*;
    use nfsfuse_core::NfsStatus;

    #[test]
    fn test_stale_and_not_found_are_distinct() {
        assert_eq!(FuseError::from(NfsError::NotFound).to_errno(), libc::ENOENT);
        assert_eq!(
            FuseError::from(NfsError::StaleHandle(7)).to_errno(),
            libc::ESTALE
        );
    }

    #[test]
    fn test_remote_status_mapping() {
        let e = FuseError::from(NfsError::Remote(NfsStatus::NotSupp));
        assert_eq!(e.to_errno(), libc::ENOTSUP);
        let e = FuseError::from(NfsError::Remote(NfsStatus::Rofs));
        assert_eq!(e.to_errno(), libc::EROFS);
        let e = FuseError::from(NfsError::Transport("reset".into()));
        assert_eq!(e.to_errno(), libc::EIO);
    }

    #[test]
    fn test_adapter_errors() {
        assert_eq!(FuseError::InvalidOffset(-1).to_errno(), libc::EINVAL);
        assert_eq!(FuseError::Range { needed: 10, size: 4 }.to_errno(), libc::ERANGE);
    }
}
