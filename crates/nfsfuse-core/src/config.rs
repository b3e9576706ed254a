//! Configuration threaded into the handshake, cache and dispatcher.
//!
//! Replaces process-wide switches (verbosity, mount debugging) with one value
//! passed to constructors. Cache tunables are read from the residual mount
//! options so `-o acregmin=5,noac` behaves as it does for the kernel client.

use std::time::Duration;

use thiserror::Error;

/// Minimum attribute timeout for regular files.
pub const DEFAULT_ACREGMIN: Duration = Duration::from_secs(3);
/// Maximum attribute timeout for regular files.
pub const DEFAULT_ACREGMAX: Duration = Duration::from_secs(60);
/// Minimum attribute timeout for directories.
pub const DEFAULT_ACDIRMIN: Duration = Duration::from_secs(30);
/// Maximum attribute timeout for directories.
pub const DEFAULT_ACDIRMAX: Duration = Duration::from_secs(60);

/// Invalid cache tunable in the option string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {option}: {value:?}")]
    InvalidValue { option: String, value: String },
}

/// Core configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    /// Log handshake internals (root handle bytes, initial attributes).
    pub debug_mount: bool,

    pub acregmin: Duration,
    pub acregmax: Duration,
    pub acdirmin: Duration,
    pub acdirmax: Duration,

    /// Disable attribute caching entirely.
    pub noac: bool,

    /// Skip the attribute revalidation normally forced by `open`.
    pub nocto: bool,

    /// Upper bound on cached nodes; `None` is unbounded.
    pub max_nodes: Option<usize>,

    /// Protocol version named by `vers=`/`nfsvers=`, if any.
    pub requested_version: Option<u32>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            debug_mount: false,
            acregmin: DEFAULT_ACREGMIN,
            acregmax: DEFAULT_ACREGMAX,
            acdirmin: DEFAULT_ACDIRMIN,
            acdirmax: DEFAULT_ACDIRMAX,
            noac: false,
            nocto: false,
            max_nodes: None,
            requested_version: None,
        }
    }
}

impl CoreConfig {
    /// Builds a configuration from the comma-separated residual options.
    ///
    /// Tokens that are not cache or version tunables are ignored.
    pub fn from_extra_options(extra: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for token in extra.split(',').filter(|t| !t.is_empty()) {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (token, None),
            };
            match (key, value) {
                ("noac", None) => config.noac = true,
                ("nocto", None) => config.nocto = true,
                ("cto", None) => config.nocto = false,
                ("actimeo", Some(v)) => {
                    let d = parse_secs(key, v)?;
                    config.acregmin = d;
                    config.acregmax = d;
                    config.acdirmin = d;
                    config.acdirmax = d;
                }
                ("acregmin", Some(v)) => config.acregmin = parse_secs(key, v)?,
                ("acregmax", Some(v)) => config.acregmax = parse_secs(key, v)?,
                ("acdirmin", Some(v)) => config.acdirmin = parse_secs(key, v)?,
                ("acdirmax", Some(v)) => config.acdirmax = parse_secs(key, v)?,
                ("vers" | "nfsvers", Some(v)) => {
                    let major = v.split('.').next().unwrap_or(v);
                    config.requested_version = Some(major.parse().map_err(|_| invalid(key, v))?);
                }
                _ => {}
            }
        }
        // A minimum above its maximum is clamped rather than rejected.
        config.acregmax = config.acregmax.max(config.acregmin);
        config.acdirmax = config.acdirmax.max(config.acdirmin);
        Ok(config)
    }

    /// Attribute timeout bounds for a node of the given kind.
    pub fn timeout_bounds(&self, is_dir: bool) -> (Duration, Duration) {
        if self.noac {
            (Duration::ZERO, Duration::ZERO)
        } else if is_dir {
            (self.acdirmin, self.acdirmax)
        } else {
            (self.acregmin, self.acregmax)
        }
    }

    /// Enables verbose handshake logging.
    #[must_use]
    pub fn debug_mount(mut self, enabled: bool) -> Self {
        self.debug_mount = enabled;
        self
    }

    /// Caps the number of cached nodes.
    #[must_use]
    pub fn max_nodes(mut self, limit: usize) -> Self {
        self.max_nodes = Some(limit);
        self
    }

    /// Disables attribute caching.
    #[must_use]
    pub fn noac(mut self, enabled: bool) -> Self {
        self.noac = enabled;
        self
    }

    /// Disables close-to-open revalidation.
    #[must_use]
    pub fn nocto(mut self, enabled: bool) -> Self {
        self.nocto = enabled;
        self
    }
}

fn parse_secs(option: &str, value: &str) -> Result<Duration, ConfigError> {
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| invalid(option, value))
}

fn invalid(option: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        option: option.to_string(),
        value: value.to_string(),
    }
}
