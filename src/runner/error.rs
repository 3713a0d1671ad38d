//! Structured failures for script sessions.
//!
//! Every failure at or after connection resolution is reported as a
//! [`RunnerError`]: the script that was being run, the command text, the
//! best-effort exit code and a typed [`Cause`].
//!
//! # Exit codes
//!
//! Only a remote process that actually terminated yields a real exit code
//! ([`Cause::Exited`], [`Cause::Signaled`]). Every other cause reports
//! [`NO_EXIT_CODE`] (`-1`), meaning the remote exit status could not be
//! determined.
//!
//! Nothing in this crate retries. A failure is terminal for its session.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::script::{ScriptError, ScriptIdentity};

/// Exit code reported when no remote exit status is available.
pub const NO_EXIT_CODE: i32 = -1;

/// Underlying reason a session operation failed.
#[derive(Debug, thiserror::Error)]
pub enum Cause {
    #[error("script failed to parse: {0}")]
    Parse(#[source] ScriptError),

    #[error("cannot create stdin reader: {0}")]
    Stdin(#[source] ScriptError),

    #[error("cannot find home directory of current user")]
    HomeDirectory,

    #[error("cannot access known_hosts file {}: {source}", path.display())]
    TrustStore {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot dial host {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: russh::Error,
    },

    #[error("cannot dial host {address}: timed out after {timeout:?}")]
    DialTimeout { address: String, timeout: Duration },

    #[error("{method} authentication rejected for {user}@{address}")]
    Authentication {
        method: &'static str,
        user: String,
        address: String,
    },

    #[error("{method} authentication failed for {user}@{address}: {source}")]
    AuthenticationError {
        method: &'static str,
        user: String,
        address: String,
        #[source]
        source: russh::Error,
    },

    #[error("cannot open session: {0}")]
    OpenSession(#[source] russh::Error),

    #[error("cannot start command: {0}")]
    Start(#[source] russh::Error),

    #[error("remote side refused to start the command")]
    Rejected,

    #[error("command exited with status {status}")]
    Exited { status: u32 },

    #[error("command terminated by signal {signal}")]
    Signaled { signal: String, code: i32 },

    #[error("cannot write script to remote stdin: {0}")]
    Transport(#[source] io::Error),

    #[error("channel closed without reporting an exit status")]
    MissingExitStatus,

    #[error("command was terminated by close")]
    Terminated,

    #[error("cannot write {stream} stream: {source}")]
    Stream {
        stream: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("session I/O task failed: {0}")]
    Task(String),

    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: crate::runner::session::SessionState,
    },
}

impl Cause {
    /// Exit code implied by this cause.
    pub fn exit_code(&self) -> i32 {
        match self {
            Cause::Exited { status } => i32::try_from(*status).unwrap_or(NO_EXIT_CODE),
            Cause::Signaled { code, .. } => *code,
            _ => NO_EXIT_CODE,
        }
    }
}

/// A failed script session operation with its context.
#[derive(Debug)]
pub struct RunnerError {
    script: ScriptIdentity,
    command: String,
    exit_code: i32,
    cause: Cause,
}

impl RunnerError {
    /// Build an error, deriving the exit code from the cause.
    pub fn new(script: ScriptIdentity, command: impl Into<String>, cause: Cause) -> Self {
        Self {
            script,
            command: command.into(),
            exit_code: cause.exit_code(),
            cause,
        }
    }

    /// Identity of the script that was being run.
    pub fn script(&self) -> &ScriptIdentity {
        &self.script
    }

    /// Command text; empty when the failure happened before it was known.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn cause(&self) -> &Cause {
        &self.cause
    }

    pub fn into_cause(self) -> Cause {
        self.cause
    }
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "script {}: {}", self.script, self.cause)
    }
}

impl std::error::Error for RunnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::session::SessionState;
    use crate::script::Shell;
    use std::error::Error;

    fn identity() -> ScriptIdentity {
        ScriptIdentity::new("deploy", Shell::Bash)
    }

    mod exit_codes {
        use super::*;

        #[test]
        fn test_exited_carries_status() {
            assert_eq!(Cause::Exited { status: 7 }.exit_code(), 7);
            assert_eq!(Cause::Exited { status: 0 }.exit_code(), 0);
        }

        #[test]
        fn test_exited_out_of_range_is_unknown() {
            assert_eq!(Cause::Exited { status: u32::MAX }.exit_code(), NO_EXIT_CODE);
        }

        #[test]
        fn test_signaled_carries_code() {
            let cause = Cause::Signaled {
                signal: "TERM".to_string(),
                code: 143,
            };
            assert_eq!(cause.exit_code(), 143);
        }

        #[test]
        fn test_non_process_causes_are_unknown() {
            let causes = [
                Cause::HomeDirectory,
                Cause::MissingExitStatus,
                Cause::Rejected,
                Cause::Terminated,
                Cause::Transport(io::Error::from(io::ErrorKind::ConnectionReset)),
                Cause::OpenSession(russh::Error::Disconnect),
                Cause::Stream {
                    stream: "stdout",
                    source: io::Error::from(io::ErrorKind::BrokenPipe),
                },
                Cause::InvalidState {
                    operation: "wait",
                    state: SessionState::Connected,
                },
            ];
            for cause in causes {
                assert_eq!(cause.exit_code(), NO_EXIT_CODE, "{cause}");
            }
        }
    }

    mod runner_error {
        use super::*;

        #[test]
        fn test_exit_code_derived_from_cause() {
            let err = RunnerError::new(identity(), "bash -s", Cause::Exited { status: 3 });
            assert_eq!(err.exit_code(), 3);
            assert_eq!(err.command(), "bash -s");
            assert_eq!(err.script().name, "deploy");
        }

        #[test]
        fn test_display_names_script_and_cause() {
            let err = RunnerError::new(identity(), "", Cause::HomeDirectory);
            assert_eq!(
                err.to_string(),
                "script deploy (bash): cannot find home directory of current user"
            );
        }

        #[test]
        fn test_source_chain_reaches_underlying_error() {
            let parse = ScriptError::Unterminated { offset: 4 };
            let err = RunnerError::new(identity(), "", Cause::Parse(parse.clone()));

            let cause = err.source().expect("cause");
            let root = cause.source().expect("script error");
            assert_eq!(root.to_string(), parse.to_string());
        }

        #[test]
        fn test_into_cause() {
            let err = RunnerError::new(identity(), "sh -s", Cause::Terminated);
            assert!(matches!(err.into_cause(), Cause::Terminated));
        }

        #[test]
        fn test_is_send() {
            fn assert_send<T: Send>() {}
            assert_send::<RunnerError>();
        }
    }
}
