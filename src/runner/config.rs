//! Configuration resolution for the SSH runner.
//!
//! Values follow a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSH_CONNECT_TIMEOUT` | 30s | Dial and handshake timeout in seconds |
//! | `SSH_COMPRESSION` | true | Offer zlib compression |
//! | `SSH_KEEPALIVE_INTERVAL` | 30s | Keepalive interval in seconds, 0 disables |
//! | `SSH_KNOWN_HOSTS` | `~/.ssh/known_hosts` | Trust store used when not insecure |

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::client;

/// Default SSH connection timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default keepalive interval in seconds
pub(crate) const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// Environment variable name for SSH connection timeout
pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";

/// Environment variable name for SSH compression
pub(crate) const COMPRESSION_ENV_VAR: &str = "SSH_COMPRESSION";

/// Environment variable name for the keepalive interval
pub(crate) const KEEPALIVE_INTERVAL_ENV_VAR: &str = "SSH_KEEPALIVE_INTERVAL";

/// Environment variable name for the known_hosts override
pub(crate) const KNOWN_HOSTS_ENV_VAR: &str = "SSH_KNOWN_HOSTS";

/// Transport settings shared by every session built with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Upper bound for TCP connect plus SSH handshake.
    pub connect_timeout: Duration,
    /// Offer zlib compression to the server.
    pub compress: bool,
    /// Keepalive interval; `None` disables keepalives.
    pub keepalive_interval: Option<Duration>,
    /// Trust store override. `None` means `~/.ssh/known_hosts`.
    pub known_hosts: Option<PathBuf>,
}

impl RunnerConfig {
    /// Resolve every setting from the environment, falling back to defaults.
    pub fn resolve() -> Self {
        Self {
            connect_timeout: Duration::from_secs(resolve_connect_timeout(None)),
            compress: resolve_compression(None),
            keepalive_interval: resolve_keepalive_interval(None),
            known_hosts: resolve_known_hosts(None),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts = Some(path.into());
        self
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            compress: true,
            keepalive_interval: Some(Duration::from_secs(DEFAULT_KEEPALIVE_INTERVAL_SECS)),
            known_hosts: None,
        }
    }
}

/// Resolve the connection timeout value with priority: parameter -> env var -> default
pub(crate) fn resolve_connect_timeout(timeout_param: Option<u64>) -> u64 {
    if let Some(timeout) = timeout_param {
        return timeout;
    }

    if let Ok(env_timeout) = env::var(CONNECT_TIMEOUT_ENV_VAR)
        && let Ok(timeout) = env_timeout.parse::<u64>()
    {
        return timeout;
    }

    DEFAULT_CONNECT_TIMEOUT_SECS
}

/// Resolve the compression setting with priority: parameter -> env var -> default (true)
pub(crate) fn resolve_compression(compress_param: Option<bool>) -> bool {
    if let Some(compress) = compress_param {
        return compress;
    }

    if let Ok(env_compress) = env::var(COMPRESSION_ENV_VAR) {
        return env_compress.eq_ignore_ascii_case("true") || env_compress == "1";
    }

    true
}

/// Resolve the keepalive interval with priority: parameter -> env var -> default.
///
/// A value of zero disables keepalives.
pub(crate) fn resolve_keepalive_interval(interval_param: Option<u64>) -> Option<Duration> {
    let secs = interval_param
        .or_else(|| {
            env::var(KEEPALIVE_INTERVAL_ENV_VAR)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
        })
        .unwrap_or(DEFAULT_KEEPALIVE_INTERVAL_SECS);

    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Resolve the known_hosts override with priority: parameter -> env var -> none
pub(crate) fn resolve_known_hosts(path_param: Option<PathBuf>) -> Option<PathBuf> {
    if path_param.is_some() {
        return path_param;
    }

    env::var(KNOWN_HOSTS_ENV_VAR)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

/// Build russh client configuration from the runner settings.
///
/// The inactivity timeout is left unset: a remote script may stay silent for
/// as long as it likes, and dead peers are detected through keepalives.
pub(crate) fn build_client_config(config: &RunnerConfig) -> Arc<client::Config> {
    let compression = if config.compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: config.keepalive_interval,
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}
