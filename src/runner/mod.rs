//! SSH session runner.
//!
//! Resolve a [`ConnectionDescriptor`], build a [`Session`] for a script and
//! run it:
//!
//! ```ignore
//! let descriptor = ConnectionDescriptor::from_record(&record).into_descriptor();
//! let script = ScriptTemplate::new("uptime", Shell::Bash, "uptime\n");
//!
//! let mut session = Session::new(&descriptor, &script, &Value::Null).await?;
//! let stdout = SharedBuffer::new();
//! session.set_stdout_writer(stdout.clone())?;
//! let result = session.run().await;
//! session.close().await;
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod session;
pub mod stream;

#[cfg(test)]
pub(crate) mod test_server;

pub use auth::{AuthMethod, Credential, CredentialError, HostKeyPolicy};
pub use config::RunnerConfig;
pub use connection::{
    ConnectionBuilder, ConnectionDescriptor, ConnectionRecord, Resolution, ResolveWarning,
    TransportKind,
};
pub use error::{Cause, NO_EXIT_CODE, RunnerError};
pub use session::{Session, SessionState};
pub use stream::{OutputPipe, OutputSink, SharedBuffer};
