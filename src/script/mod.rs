//! Script collaborator consumed by the session runner.
//!
//! The runner never looks inside a script. It only needs:
//!
//! - an identity (name and shell) for error context,
//! - the literal command line that starts the interpreter remotely,
//! - a reader that yields the rendered script body, fed to the remote stdin,
//! - a parse error, checked before any network activity.
//!
//! [`ScriptTemplate`] is the bundled implementation: a named body with
//! `{{.Name}}` placeholders rendered from a JSON object.

mod template;

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

pub use template::ScriptTemplate;

/// Readable stream of a rendered script body.
pub type ScriptReader = Box<dyn AsyncRead + Send + Unpin>;

/// Interpreter used to execute a script body read from stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shell {
    Bash,
    Sh,
    PowerShell,
    Cmd,
}

impl Shell {
    /// Command line that makes the interpreter execute its standard input.
    pub fn command(&self) -> &'static str {
        match self {
            Shell::Bash => "bash -s",
            Shell::Sh => "sh -s",
            Shell::PowerShell => "powershell -NoProfile -NonInteractive -Command -",
            Shell::Cmd => "cmd /Q",
        }
    }

    /// Parse a shell name, case-insensitively.
    pub fn parse(name: &str) -> Option<Shell> {
        match name.trim().to_ascii_lowercase().as_str() {
            "bash" => Some(Shell::Bash),
            "sh" => Some(Shell::Sh),
            "powershell" | "pwsh" => Some(Shell::PowerShell),
            "cmd" => Some(Shell::Cmd),
            _ => None,
        }
    }
}

impl fmt::Display for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shell::Bash => write!(f, "bash"),
            Shell::Sh => write!(f, "sh"),
            Shell::PowerShell => write!(f, "powershell"),
            Shell::Cmd => write!(f, "cmd"),
        }
    }
}

/// Declared name and interpreter of a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptIdentity {
    pub name: String,
    pub shell: Shell,
}

impl ScriptIdentity {
    pub fn new(name: impl Into<String>, shell: Shell) -> Self {
        Self {
            name: name.into(),
            shell,
        }
    }
}

impl fmt::Display for ScriptIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.shell)
    }
}

/// Errors raised while parsing or rendering a script.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("unterminated placeholder starting at byte {offset}")]
    Unterminated { offset: usize },

    #[error("invalid placeholder `{text}` at byte {offset}")]
    InvalidPlaceholder { text: String, offset: usize },

    #[error("missing argument `{name}`")]
    MissingArgument { name: String },

    #[error("arguments must be a JSON object, got {kind}")]
    ArgumentsNotObject { kind: &'static str },
}

/// A script the session runner can execute.
pub trait Script: Send + Sync {
    /// Name and interpreter, used only for error context.
    fn identity(&self) -> &ScriptIdentity;

    /// Literal command line executed on the remote host.
    fn command(&self) -> String;

    /// Render the script against `arguments` and expose the text as a stream.
    fn reader(&self, arguments: &serde_json::Value) -> Result<ScriptReader, ScriptError>;

    /// Error recorded when the script was parsed, if any.
    fn parse_error(&self) -> Option<&ScriptError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    mod shell {
        use super::*;

        #[test]
        fn test_commands_read_stdin() {
            assert_eq!(Shell::Bash.command(), "bash -s");
            assert_eq!(Shell::Sh.command(), "sh -s");
            assert!(Shell::PowerShell.command().ends_with("-Command -"));
            assert_eq!(Shell::Cmd.command(), "cmd /Q");
        }

        #[test]
        fn test_parse_is_case_insensitive() {
            assert_eq!(Shell::parse("BASH"), Some(Shell::Bash));
            assert_eq!(Shell::parse(" PowerShell "), Some(Shell::PowerShell));
            assert_eq!(Shell::parse("pwsh"), Some(Shell::PowerShell));
            assert_eq!(Shell::parse("zsh"), None);
        }

        #[test]
        fn test_display_round_trips_through_parse() {
            for shell in [Shell::Bash, Shell::Sh, Shell::PowerShell, Shell::Cmd] {
                assert_eq!(Shell::parse(&shell.to_string()), Some(shell));
            }
        }
    }

    #[test]
    fn test_identity_display() {
        let identity = ScriptIdentity::new("ls", Shell::PowerShell);
        assert_eq!(identity.to_string(), "ls (powershell)");
    }
}
