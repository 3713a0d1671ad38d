//! Dialing and authenticating an SSH connection.
//!
//! One call to [`connect`] performs the whole handshake:
//!
//! 1. build the russh client configuration from [`RunnerConfig`],
//! 2. open the TCP connection and negotiate the transport, bounded by the
//!    connect timeout, verifying the host key through [`HostKeyPolicy`],
//! 3. offer the session's single [`AuthMethod`].
//!
//! Nothing is retried. Any failure is returned as a [`Cause`] and the
//! partially established connection is dropped.

use russh::client;
use russh::keys;
use tracing::{debug, info, warn};

use super::auth::{AuthMethod, HostKeyPolicy};
use super::config::{RunnerConfig, build_client_config};
use super::connection::ConnectionDescriptor;
use super::error::Cause;

/// russh client handler that delegates host key checks to a [`HostKeyPolicy`].
#[derive(Debug)]
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub fn new(host: impl Into<String>, port: u16, policy: HostKeyPolicy) -> Self {
        Self {
            host: host.into(),
            port,
            policy,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(self.policy.verify(&self.host, self.port, server_public_key))
    }
}

/// Dial the descriptor's host and authenticate with `auth`.
pub(crate) async fn connect(
    descriptor: &ConnectionDescriptor,
    auth: &AuthMethod,
    policy: HostKeyPolicy,
    config: &RunnerConfig,
) -> Result<client::Handle<ClientHandler>, Cause> {
    let address = descriptor.address();
    let handler = ClientHandler::new(descriptor.host(), descriptor.port(), policy);
    let client_config = build_client_config(config);

    debug!(
        address = %address,
        timeout = ?config.connect_timeout,
        compress = config.compress,
        "dialing SSH server"
    );

    let connect_future = client::connect(
        client_config,
        (descriptor.host(), descriptor.port()),
        handler,
    );

    let mut handle = tokio::time::timeout(config.connect_timeout, connect_future)
        .await
        .map_err(|_| Cause::DialTimeout {
            address: address.clone(),
            timeout: config.connect_timeout,
        })?
        .map_err(|source| Cause::Dial {
            address: address.clone(),
            source,
        })?;

    let method = auth.name();
    let user = descriptor.user();
    let accepted = auth
        .authenticate(&mut handle, user)
        .await
        .map_err(|source| Cause::AuthenticationError {
            method,
            user: user.to_string(),
            address: address.clone(),
            source,
        })?;

    if !accepted {
        warn!(address = %address, user = %user, method, "authentication rejected");
        return Err(Cause::Authentication {
            method,
            user: user.to_string(),
            address,
        });
    }

    info!(address = %address, user = %user, method, "SSH connection established");
    Ok(handle)
}
