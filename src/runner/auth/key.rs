//! Private key credentials.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::keys::{self, PrivateKey, ssh_key::HashAlg};

/// Errors raised while loading a private key file.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("key file {} does not exist: {source}", path.display())]
    Missing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot read key file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("key file {} is passphrase protected", path.display())]
    Encrypted { path: PathBuf },

    #[error("cannot parse key file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: keys::Error,
    },
}

/// A decoded private key, ready for public key authentication.
///
/// Cheap to clone; the key material is shared. Two credentials are equal when
/// they hold the same public half.
#[derive(Clone)]
pub struct Credential {
    key: Arc<PrivateKey>,
}

impl Credential {
    /// Load an unencrypted private key (OpenSSH or PEM) from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CredentialError> {
        let path = path.as_ref();

        std::fs::metadata(path).map_err(|source| CredentialError::Missing {
            path: path.to_path_buf(),
            source,
        })?;

        let text = std::fs::read_to_string(path).map_err(|source| CredentialError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        match keys::decode_secret_key(&text, None) {
            Ok(key) => Ok(Self::from_key(key)),
            Err(keys::Error::KeyIsEncrypted) => Err(CredentialError::Encrypted {
                path: path.to_path_buf(),
            }),
            Err(source) => Err(CredentialError::Parse {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_key(key: PrivateKey) -> Self {
        Self { key: Arc::new(key) }
    }

    pub(crate) fn key(&self) -> Arc<PrivateKey> {
        Arc::clone(&self.key)
    }

    /// Key algorithm name, e.g. `ssh-ed25519`.
    pub fn algorithm(&self) -> String {
        self.key.algorithm().to_string()
    }

    /// SHA-256 fingerprint of the public half.
    pub fn fingerprint(&self) -> String {
        self.key.public_key().fingerprint(HashAlg::Sha256).to_string()
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.key.public_key().key_data() == other.key.public_key().key_data()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("algorithm", &self.algorithm())
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    #[test]
    fn test_load_ed25519() {
        let credential = Credential::load(fixture("id_ed25519")).unwrap();
        assert_eq!(credential.algorithm(), "ssh-ed25519");
        assert!(credential.fingerprint().starts_with("SHA256:"));
    }

    #[test]
    fn test_same_file_is_equal() {
        let a = Credential::load(fixture("id_ed25519")).unwrap();
        let b = Credential::load(fixture("id_ed25519")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_file() {
        let err = Credential::load("/nonexistent/id_ed25519").unwrap_err();
        assert!(matches!(err, CredentialError::Missing { .. }));
        assert!(err.to_string().contains("/nonexistent/id_ed25519"));
    }

    #[test]
    fn test_garbage_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage");
        std::fs::write(&path, "not a key\n").unwrap();

        let err = Credential::load(&path).unwrap_err();
        assert!(matches!(err, CredentialError::Parse { .. }));
    }

    #[test]
    fn test_encrypted_key_is_rejected() {
        let err = Credential::load(fixture("id_ed25519_encrypted")).unwrap_err();
        assert!(
            matches!(
                err,
                CredentialError::Encrypted { .. } | CredentialError::Parse { .. }
            ),
            "{err:?}"
        );
    }

    #[test]
    fn test_debug_hides_key_material() {
        let credential = Credential::load(fixture("id_ed25519")).unwrap();
        let debug = format!("{:?}", credential);
        assert!(debug.contains("ssh-ed25519"));
        assert!(!debug.contains("PRIVATE KEY"));
    }
}
