//! Mount-side plumbing for nfs-fuse.
//!
//! - [`options`]: `-o` option translation and the canonical mount table string
//! - [`mtab`]: locked updates of the system mount table
//! - [`target`]: `host:/export` parsing
//! - [`signal`]: signal-driven shutdown
//! - [`daemon`]: background re-execution

pub mod daemon;
pub mod mtab;
pub mod options;
pub mod signal;
pub mod target;

pub use mtab::{MountEntry, MountTable, RegistryError};
pub use options::{LocalFlags, MountFlags, OptionError, ParsedOptions, canonicalize, parse};
pub use signal::ShutdownSignal;
pub use target::{RemoteTarget, TargetError};
