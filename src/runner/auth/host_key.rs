//! Server host key verification.

use std::fs::File;
use std::path::PathBuf;

use russh::keys::{self, PublicKey};
use tracing::{debug, error, warn};

use crate::runner::config::RunnerConfig;
use crate::runner::connection::ConnectionDescriptor;
use crate::runner::error::Cause;

/// How a session decides whether to trust the server's host key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any host key. Only for throwaway targets.
    Insecure,
    /// Accept only keys recorded for the host in this known_hosts file.
    KnownHosts(PathBuf),
}

impl HostKeyPolicy {
    /// Pick the policy for a descriptor.
    ///
    /// Insecure descriptors never touch the file system. Otherwise the
    /// known_hosts file (the configured override, or `~/.ssh/known_hosts`)
    /// must exist and be readable before any network activity happens.
    pub fn for_descriptor(
        descriptor: &ConnectionDescriptor,
        config: &RunnerConfig,
    ) -> Result<Self, Cause> {
        if descriptor.insecure() {
            return Ok(HostKeyPolicy::Insecure);
        }

        let path = match &config.known_hosts {
            Some(path) => path.clone(),
            None => dirs::home_dir()
                .ok_or(Cause::HomeDirectory)?
                .join(".ssh")
                .join("known_hosts"),
        };

        File::open(&path).map_err(|source| Cause::TrustStore {
            path: path.clone(),
            source,
        })?;

        debug!(path = %path.display(), "using known_hosts trust store");
        Ok(HostKeyPolicy::KnownHosts(path))
    }

    /// Decide whether `key`, presented by `host:port`, is trusted.
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        match self {
            HostKeyPolicy::Insecure => {
                warn!(host = %host, port, "accepting server key without verification");
                true
            }
            HostKeyPolicy::KnownHosts(path) => {
                match keys::check_known_hosts_path(host, port, key, path) {
                    Ok(true) => true,
                    Ok(false) => {
                        warn!(
                            host = %host,
                            port,
                            path = %path.display(),
                            "host key is not in known_hosts"
                        );
                        false
                    }
                    Err(e) => {
                        error!(
                            host = %host,
                            port,
                            path = %path.display(),
                            error = %e,
                            "host key verification failed"
                        );
                        false
                    }
                }
            }
        }
    }
}
