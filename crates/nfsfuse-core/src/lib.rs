//! Core of a FUSE bridge to NFS exports.
//!
//! This crate holds everything that does not touch the kernel: the bounded
//! [`FileHandle`], the attribute model, the RPC seam ([`RpcConnector`] and
//! [`RpcSession`]), the mount handshake, the inode/attribute cache and the
//! [`Dispatcher`] that turns filesystem operations into RPCs.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use nfsfuse_core::{handshake, CoreConfig, Dispatcher, InodeCache, LoopbackConnector};
//!
//! let config = CoreConfig::default();
//! let cache = Arc::new(InodeCache::new(config.clone()));
//! let request = handshake::MountRequest { host: "localhost".into(), export: "/srv".into(), version: 4 };
//! let state = handshake::mount(&LoopbackConnector, &request, &config, &cache)?;
//! let dispatcher = Dispatcher::for_mount(&state, cache);
//! ```

pub mod attr;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fh;
pub mod handshake;
pub mod icache;
pub mod loopback;
pub mod testing;

pub use attr::{AttrValid, Attributes, FileKind, SetAttributes, SetTime};
pub use client::{AccessMask, NfsStatus, RpcConnector, RpcError, RpcResult, RpcSession};
pub use config::CoreConfig;
pub use dispatch::{DirItem, DirPage, Dispatcher, NodeEntry, OpenOutcome};
pub use error::{NfsError, NfsResult};
pub use fh::{FileHandle, MAX_FHSIZE};
pub use handshake::{ExitClass, HandshakeError, MountRequest, MountState, MountedProtocol};
pub use icache::{InodeCache, ROOT_INODE};
pub use loopback::LoopbackConnector;
