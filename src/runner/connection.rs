//! Connection descriptor resolution.
//!
//! Callers describe a target either as a typed [`ConnectionRecord`] (which can
//! also be deserialized from JSON or a config file), as a string-keyed mapping
//! where every value is text, or through [`ConnectionBuilder`]. All three paths
//! produce the same canonical [`ConnectionDescriptor`].
//!
//! Resolution never fails. A malformed optional field falls back to its zero
//! value and an unreadable private key is skipped; each such problem is logged
//! and returned as a [`ResolveWarning`] in the [`Resolution`]. Misconfiguration
//! then surfaces when dialing, with full session context.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::auth::Credential;

/// Transport family of a connection. Only SSH exists today.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Ssh,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Ssh => write!(f, "ssh"),
        }
    }
}

/// Fixed-shape connection input.
///
/// Empty `password` / `key_path` strings are treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionRecord {
    pub kind: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub key_path: Option<String>,
    pub insecure: bool,
}

/// Problem found while resolving a connection. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveWarning {
    /// Port was not a decimal `u16`; resolved to 0.
    InvalidPort { value: String },
    /// Boolean field was not a recognised boolean; resolved to false.
    InvalidBool { field: &'static str, value: String },
    /// Transport kind other than `ssh`; resolved to ssh.
    UnsupportedKind { value: String },
    /// Mapping key that names no connection field.
    UnknownKey { key: String },
    /// Private key could not be loaded; no credential attached.
    Credential { path: PathBuf, message: String },
}

impl fmt::Display for ResolveWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveWarning::InvalidPort { value } => {
                write!(f, "invalid port {:?}, using 0", value)
            }
            ResolveWarning::InvalidBool { field, value } => {
                write!(f, "invalid boolean {:?} for {}, using false", value, field)
            }
            ResolveWarning::UnsupportedKind { value } => {
                write!(f, "unsupported connection kind {:?}, using ssh", value)
            }
            ResolveWarning::UnknownKey { key } => write!(f, "unknown connection key {:?}", key),
            ResolveWarning::Credential { path, message } => {
                write!(f, "cannot load private key {}: {}", path.display(), message)
            }
        }
    }
}

/// Canonical description of how to reach and authenticate to a host.
///
/// Immutable once resolved; share it by reference to build any number of
/// sessions, from any number of tasks.
#[derive(Clone, PartialEq)]
pub struct ConnectionDescriptor {
    kind: TransportKind,
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    key_path: Option<PathBuf>,
    credential: Option<Credential>,
    insecure: bool,
}

impl ConnectionDescriptor {
    /// Resolve a typed record.
    pub fn from_record(record: &ConnectionRecord) -> Resolution {
        let mut warnings = Vec::new();
        let draft = Draft {
            kind: resolve_kind(&record.kind, &mut warnings),
            host: record.host.clone(),
            port: record.port,
            user: record.user.clone(),
            password: non_empty(record.password.as_deref()),
            key_path: non_empty(record.key_path.as_deref()).map(PathBuf::from),
            credential: None,
            insecure: record.insecure,
        };
        draft.finish(warnings)
    }

    /// Resolve a string-keyed mapping where every value is text.
    ///
    /// Keys match case-insensitively and ignore `_` and `-`, so `keyPath`,
    /// `key_path` and `KEY-PATH` are the same field. `type` is accepted for
    /// `kind` and `pubKeyPath` for `keyPath`.
    pub fn from_mapping<I, K, V>(mapping: I) -> Resolution
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut warnings = Vec::new();
        let mut draft = Draft::default();

        for (key, value) in mapping {
            let (key, value) = (key.as_ref(), value.as_ref());
            match normalize_key(key).as_str() {
                "kind" | "type" => draft.kind = resolve_kind(value, &mut warnings),
                "host" => draft.host = value.to_string(),
                "port" => draft.port = parse_port(value, &mut warnings),
                "user" => draft.user = value.to_string(),
                "password" => draft.password = non_empty(Some(value)),
                "insecure" => draft.insecure = parse_bool("insecure", value, &mut warnings),
                "keypath" | "pubkeypath" => {
                    draft.key_path = non_empty(Some(value)).map(PathBuf::from)
                }
                _ => warnings.push(ResolveWarning::UnknownKey {
                    key: key.to_string(),
                }),
            }
        }

        draft.finish(warnings)
    }

    /// Start a typed builder. The port defaults to 22.
    pub fn builder(host: impl Into<String>, user: impl Into<String>) -> ConnectionBuilder {
        ConnectionBuilder {
            draft: Draft {
                host: host.into(),
                user: user.into(),
                port: 22,
                ..Draft::default()
            },
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn key_path(&self) -> Option<&Path> {
        self.key_path.as_deref()
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Whether host key verification is skipped. Unsafe outside throwaway targets.
    pub fn insecure(&self) -> bool {
        self.insecure
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .field("credential", &self.credential)
            .field("insecure", &self.insecure)
            .finish()
    }
}

/// Outcome of resolving a connection: the descriptor plus anything that had
/// to be defaulted along the way.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub descriptor: ConnectionDescriptor,
    pub warnings: Vec<ResolveWarning>,
}

impl Resolution {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn into_descriptor(self) -> ConnectionDescriptor {
        self.descriptor
    }
}

/// Fluent construction of a [`ConnectionDescriptor`].
///
/// # Example
///
/// ```ignore
/// let descriptor = ConnectionDescriptor::builder("10.0.0.5", "deploy")
///     .port(2222)
///     .key_path("/home/deploy/.ssh/id_ed25519")
///     .build()
///     .into_descriptor();
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionBuilder {
    draft: Draft,
}

impl ConnectionBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.draft.port = port;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.draft.password = Some(password.into()).filter(|p| !p.is_empty());
        self
    }

    /// Private key to load when the descriptor is built.
    pub fn key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.draft.key_path = Some(path.into());
        self
    }

    /// Already-loaded credential; `key_path` is then not read.
    pub fn credential(mut self, credential: Credential) -> Self {
        self.draft.credential = Some(credential);
        self
    }

    pub fn insecure(mut self, insecure: bool) -> Self {
        self.draft.insecure = insecure;
        self
    }

    pub fn build(self) -> Resolution {
        self.draft.finish(Vec::new())
    }
}

#[derive(Debug, Clone, Default)]
struct Draft {
    kind: TransportKind,
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    key_path: Option<PathBuf>,
    credential: Option<Credential>,
    insecure: bool,
}

impl Draft {
    fn finish(mut self, mut warnings: Vec<ResolveWarning>) -> Resolution {
        let pending = match (&self.credential, &self.key_path) {
            (None, Some(path)) => Some(path.clone()),
            _ => None,
        };
        if let Some(path) = pending {
            match Credential::load(&path) {
                Ok(credential) => {
                    debug!(path = %path.display(), "loaded private key");
                    self.credential = Some(credential);
                }
                Err(e) => warnings.push(ResolveWarning::Credential {
                    path,
                    message: e.to_string(),
                }),
            }
        }

        for warning in &warnings {
            warn!(host = %self.host, "{}", warning);
        }

        Resolution {
            descriptor: ConnectionDescriptor {
                kind: self.kind,
                host: self.host,
                port: self.port,
                user: self.user,
                password: self.password,
                key_path: self.key_path,
                credential: self.credential,
                insecure: self.insecure,
            },
            warnings,
        }
    }
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

fn resolve_kind(value: &str, warnings: &mut Vec<ResolveWarning>) -> TransportKind {
    let trimmed = value.trim();
    if !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case("ssh") {
        warnings.push(ResolveWarning::UnsupportedKind {
            value: value.to_string(),
        });
    }
    TransportKind::Ssh
}

fn parse_port(value: &str, warnings: &mut Vec<ResolveWarning>) -> u16 {
    match value.trim().parse::<u16>() {
        Ok(port) => port,
        Err(_) => {
            if !value.trim().is_empty() {
                warnings.push(ResolveWarning::InvalidPort {
                    value: value.to_string(),
                });
            }
            0
        }
    }
}

fn parse_bool(field: &'static str, value: &str, warnings: &mut Vec<ResolveWarning>) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => true,
        "0" | "f" | "false" => false,
        "" => false,
        _ => {
            warnings.push(ResolveWarning::InvalidBool {
                field,
                value: value.to_string(),
            });
            false
        }
    }
}
