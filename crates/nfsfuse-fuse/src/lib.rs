//! FUSE adapter for NFS exports.
//!
//! This crate binds the dispatch surface from `nfsfuse-core` to the kernel
//! through `fuser`, and provides the `mount.nfs-fuse` helper that ties
//! option parsing, the handshake, the FUSE session and the mount table
//! together.
//!
//! # Usage
//!
//! ```ignore
//! use nfsfuse_fuse::session::{self, MountArgs, MountPlan};
//! use nfsfuse_core::LoopbackConnector;
//!
//! let plan = MountPlan::from_args(&MountArgs {
//!     target: "localhost:/srv/share".into(),
//!     mountpoint: "/mnt/share".into(),
//!     ..MountArgs::default()
//! })?;
//! let connector = LoopbackConnector::new();
//! let active = session::mount(&plan, &connector, plan.registry())?;
//! active.shutdown();
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod exit_code;
pub mod filesystem;
pub mod inode;
pub mod session;

pub use backend::{BackendError, FuseMountHandle};
pub use config::MountConfig;
pub use error::{FuseError, FuseResult};
pub use filesystem::NfsFuse;
pub use inode::LookupCounts;
pub use session::{ActiveMount, MountArgs, MountError, MountPlan};
