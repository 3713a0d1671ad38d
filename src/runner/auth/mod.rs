//! SSH authentication for script sessions.
//!
//! A session offers exactly one method, chosen from its descriptor:
//!
//! 1. [`AuthMethod::PublicKey`] when a credential was loaded,
//! 2. [`AuthMethod::Password`] when a non-empty password is set,
//! 3. [`AuthMethod::None`] otherwise.
//!
//! There is no fallback from one method to another. Server host keys are
//! checked separately by [`HostKeyPolicy`].

mod host_key;
mod key;

use russh::client;
use russh::keys::PrivateKeyWithHashAlg;
use tracing::debug;

use super::client::ClientHandler;
use super::connection::ConnectionDescriptor;

pub use host_key::HostKeyPolicy;
pub use key::{Credential, CredentialError};

/// The single authentication method offered for a session.
#[derive(Clone, PartialEq)]
pub enum AuthMethod {
    None,
    Password(String),
    PublicKey(Credential),
}

impl AuthMethod {
    /// Select the method for `descriptor`. A credential wins over a password.
    pub fn select(descriptor: &ConnectionDescriptor) -> Self {
        if let Some(credential) = descriptor.credential() {
            return AuthMethod::PublicKey(credential.clone());
        }
        match descriptor.password() {
            Some(password) if !password.is_empty() => AuthMethod::Password(password.to_string()),
            _ => AuthMethod::None,
        }
    }

    /// Method name as used in the SSH protocol.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey(_) => "publickey",
        }
    }

    /// Offer this method to the server. `Ok(false)` means the server refused it.
    pub(crate) async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        user: &str,
    ) -> Result<bool, russh::Error> {
        let result = match self {
            AuthMethod::None => handle.authenticate_none(user).await?,
            AuthMethod::Password(password) => {
                handle.authenticate_password(user, password.as_str()).await?
            }
            AuthMethod::PublicKey(credential) => {
                // RSA keys need the strongest signature hash the server supports
                let hash_alg = handle
                    .best_supported_rsa_hash()
                    .await
                    .ok()
                    .flatten()
                    .flatten();
                debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

                let key = PrivateKeyWithHashAlg::new(credential.key(), hash_alg);
                handle.authenticate_publickey(user, key).await?
            }
        };
        Ok(result.success())
    }
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::None => write!(f, "None"),
            AuthMethod::Password(_) => write!(f, "Password(<redacted>)"),
            AuthMethod::PublicKey(credential) => {
                f.debug_tuple("PublicKey").field(credential).finish()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> String {
        format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
    }

    #[test]
    fn test_credential_wins_over_password() {
        let descriptor = ConnectionDescriptor::builder("h", "u")
            .password("pw")
            .key_path(fixture("id_ed25519"))
            .build()
            .into_descriptor();
        let method = AuthMethod::select(&descriptor);
        assert_eq!(method.name(), "publickey");
        assert!(matches!(method, AuthMethod::PublicKey(_)));
    }

    #[test]
    fn test_password_without_credential() {
        let descriptor = ConnectionDescriptor::builder("h", "u")
            .password("pw")
            .build()
            .into_descriptor();
        assert_eq!(
            AuthMethod::select(&descriptor),
            AuthMethod::Password("pw".to_string())
        );
    }

    #[test]
    fn test_unloadable_key_falls_back_to_password() {
        let descriptor = ConnectionDescriptor::builder("h", "u")
            .password("pw")
            .key_path("/nonexistent/id_rsa")
            .build()
            .into_descriptor();
        assert_eq!(AuthMethod::select(&descriptor).name(), "password");
    }

    #[test]
    fn test_nothing_configured_is_none() {
        let descriptor = ConnectionDescriptor::builder("h", "u")
            .password("")
            .build()
            .into_descriptor();
        assert_eq!(AuthMethod::select(&descriptor), AuthMethod::None);
    }

    #[test]
    fn test_debug_redacts_password() {
        let debug = format!("{:?}", AuthMethod::Password("hunter2".to_string()));
        assert!(!debug.contains("hunter2"));
    }
}
