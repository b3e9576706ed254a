//! Mount handshake.
//!
//! Walks a fresh client context through
//! INIT → CONTEXT-READY → VERSION-SELECTED → MOUNTED → ROOT-RESOLVED →
//! ICACHE-READY. Version 4 is driven here; any other version is handed to the
//! connector's legacy mount. A context that fails part way is destroyed
//! exactly once before the error is returned, and no cache node survives a
//! failed handshake.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, trace};

use crate::client::{RpcConnector, RpcError, RpcSession};
use crate::config::CoreConfig;
use crate::fh::{FileHandle, HandleTooLarge};
use crate::icache::{CacheNode, InodeCache};

/// Protocol major version negotiated by this module directly.
pub const MODERN_VERSION: u32 = 4;

/// Version used when neither `-t` nor `vers=` names one.
pub const DEFAULT_VERSION: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    Init,
    ContextReady,
    VersionSelected,
    Mounted,
    RootResolved,
    IcacheReady,
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::ContextReady => "context-ready",
            Self::VersionSelected => "version-selected",
            Self::Mounted => "mounted",
            Self::RootResolved => "root-resolved",
            Self::IcacheReady => "icache-ready",
        })
    }
}

/// How a failed mount should be reported to the caller's caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// Local resources or transport; retrying may help.
    SystemError,
    /// The server refused or returned something unusable.
    ProtocolFailure,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("failed to initialise RPC context: {0}")]
    ContextInit(#[source] RpcError),

    #[error("NFS version {version} not supported: {source}")]
    UnsupportedVersion {
        version: u32,
        #[source]
        source: RpcError,
    },

    #[error("mount of {host}:{export} failed: {source}")]
    MountRpc {
        host: String,
        export: String,
        #[source]
        source: RpcError,
    },

    #[error("root {0}")]
    HandleTooLarge(#[from] HandleTooLarge),

    #[error("failed to resolve export root: {0}")]
    RootResolution(String),
}

impl HandshakeError {
    pub fn exit_class(&self) -> ExitClass {
        match self {
            Self::ContextInit(_) | Self::RootResolution(_) => ExitClass::SystemError,
            Self::MountRpc { source, .. } if source.is_transport() => ExitClass::SystemError,
            Self::UnsupportedVersion { .. } | Self::MountRpc { .. } | Self::HandleTooLarge(_) => {
                ExitClass::ProtocolFailure
            }
        }
    }

    /// Last stage reached before the failure.
    pub fn stage(&self) -> HandshakeStage {
        match self {
            Self::ContextInit(_) => HandshakeStage::Init,
            Self::UnsupportedVersion { .. } => HandshakeStage::ContextReady,
            Self::MountRpc { .. } => HandshakeStage::VersionSelected,
            Self::HandleTooLarge(_) | Self::RootResolution(_) => HandshakeStage::Mounted,
        }
    }
}

/// What to mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub host: String,
    pub export: String,
    pub version: u32,
}

/// Which handshake produced a mount. Chosen once, at version selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountedProtocol {
    Legacy,
    Modern,
}

/// An established mount.
pub struct MountState {
    pub version: u32,
    pub protocol: MountedProtocol,
    pub root: Arc<CacheNode>,
    pub session: Arc<dyn RpcSession>,
}

impl fmt::Debug for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountState")
            .field("version", &self.version)
            .field("protocol", &self.protocol)
            .field("root", &self.root.ino())
            .finish_non_exhaustive()
    }
}

/// Destroys the wrapped session on drop unless disarmed.
struct SessionGuard {
    session: Arc<dyn RpcSession>,
    armed: bool,
}

impl SessionGuard {
    fn new(session: Box<dyn RpcSession>) -> Self {
        Self {
            session: Arc::from(session),
            armed: true,
        }
    }

    fn session(&self) -> &dyn RpcSession {
        self.session.as_ref()
    }

    fn disarm(mut self) -> Arc<dyn RpcSession> {
        self.armed = false;
        Arc::clone(&self.session)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.armed {
            debug!("releasing partially established RPC session");
            self.session.destroy();
        }
    }
}

/// Mounts `request`, seeding `cache` with the export root.
pub fn mount<C: RpcConnector + ?Sized>(
    connector: &C,
    request: &MountRequest,
    config: &CoreConfig,
    cache: &Arc<InodeCache>,
) -> Result<MountState, HandshakeError> {
    info!(
        host = %request.host,
        export = %request.export,
        version = request.version,
        "starting mount handshake"
    );
    if request.version != MODERN_VERSION {
        debug!(version = request.version, "using legacy mount protocol");
        return connector.legacy_mount(request, config, cache);
    }
    establish(connector, request, config, cache, MountedProtocol::Modern)
}

/// The establishment sequence shared by the modern and legacy paths.
pub fn establish<C: RpcConnector + ?Sized>(
    connector: &C,
    request: &MountRequest,
    config: &CoreConfig,
    cache: &Arc<InodeCache>,
    protocol: MountedProtocol,
) -> Result<MountState, HandshakeError> {
    let session = connector
        .init_context()
        .map_err(|e| failed(HandshakeError::ContextInit(e)))?;
    let guard = SessionGuard::new(session);
    trace!(stage = %HandshakeStage::ContextReady, "handshake advanced");

    guard
        .session()
        .select_version(request.version)
        .map_err(|source| {
            failed(HandshakeError::UnsupportedVersion {
                version: request.version,
                source,
            })
        })?;
    trace!(stage = %HandshakeStage::VersionSelected, version = request.version, "handshake advanced");

    let reply = guard
        .session()
        .mount(&request.host, &request.export)
        .map_err(|source| {
            failed(HandshakeError::MountRpc {
                host: request.host.clone(),
                export: request.export.clone(),
                source,
            })
        })?;
    trace!(stage = %HandshakeStage::Mounted, "handshake advanced");

    let root_fh = FileHandle::from_bytes(&reply.root_fh).map_err(|e| failed(e.into()))?;
    if config.debug_mount {
        debug!(?root_fh, attrs = ?reply.attrs, "export root");
    }
    let root = cache
        .resolve_root(&root_fh)
        .map_err(|e| failed(HandshakeError::RootResolution(e.to_string())))?;
    let generation = cache.next_generation();
    cache.refresh(&root, &reply.attrs, generation);
    trace!(stage = %HandshakeStage::RootResolved, ino = root.ino(), "handshake advanced");

    let session = guard.disarm();
    info!(
        host = %request.host,
        export = %request.export,
        version = request.version,
        stage = %HandshakeStage::IcacheReady,
        "mount handshake complete"
    );
    Ok(MountState {
        version: request.version,
        protocol,
        root,
        session,
    })
}

fn failed(err: HandshakeError) -> HandshakeError {
    error!(stage = %err.stage(), error = %err, "mount handshake failed");
    err
}

/// Tears a mount down and empties the cache.
///
/// Version 4 has no unmount procedure, so only the local context is
/// released; legacy mounts go through the connector's unmount.
pub fn unmount<C: RpcConnector + ?Sized>(
    connector: &C,
    state: MountState,
    cache: &InodeCache,
) -> Result<(), RpcError> {
    let result = match state.protocol {
        MountedProtocol::Modern => {
            state.session.destroy();
            Ok(())
        }
        MountedProtocol::Legacy => connector.legacy_unmount(&state),
    };
    cache.clear();
    info!(version = state.version, "unmounted");
    result
}
