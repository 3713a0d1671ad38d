#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::env;
use std::path::Path;
use std::process::ExitCode;

use dotenv::dotenv;
use serde_json::Value;
use ssh_runner::runner::{ConnectionDescriptor, NO_EXIT_CODE, Session};
use ssh_runner::script::{ScriptTemplate, Shell};
use tracing::{error, info};

const ENV_PREFIX: &str = "SSH_RUNNER_";
const SCRIPT_ENV_VAR: &str = "SSH_RUNNER_SCRIPT";
const SHELL_ENV_VAR: &str = "SSH_RUNNER_SHELL";
const ARGS_ENV_VAR: &str = "SSH_RUNNER_ARGS";

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    dotenv().ok();

    // Logs go to stderr so remote stdout passes through untouched
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let script_path = env::var(SCRIPT_ENV_VAR)
        .map_err(|_| format!("{} must point to a script file", SCRIPT_ENV_VAR))?;
    let shell_name = env::var(SHELL_ENV_VAR).unwrap_or_else(|_| "bash".to_string());
    let shell = Shell::parse(&shell_name)
        .ok_or_else(|| format!("unsupported shell {:?} in {}", shell_name, SHELL_ENV_VAR))?;
    let arguments: Value = match env::var(ARGS_ENV_VAR) {
        Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)?,
        _ => Value::Null,
    };

    let body = tokio::fs::read_to_string(&script_path).await?;
    let name = Path::new(&script_path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| script_path.clone());
    let script = ScriptTemplate::new(name, shell, body);

    let connection = env::vars().filter_map(|(key, value)| {
        if key == SCRIPT_ENV_VAR || key == SHELL_ENV_VAR || key == ARGS_ENV_VAR {
            return None;
        }
        key.strip_prefix(ENV_PREFIX)
            .map(|field| (field.to_string(), value))
    });
    let descriptor = ConnectionDescriptor::from_mapping(connection).into_descriptor();

    info!(
        address = %descriptor.address(),
        user = %descriptor.user(),
        shell = %shell,
        "running script {}",
        script_path
    );

    let mut session = match Session::new(&descriptor, &script, &arguments).await {
        Ok(session) => session,
        Err(e) => {
            error!("{}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    session.set_stdout_writer(tokio::io::stdout())?;
    session.set_stderr_writer(tokio::io::stderr())?;

    let result = session.run().await;
    session.close().await;

    if let Err(e) = &result {
        error!(exit_code = e.exit_code(), "{}", e);
    }

    Ok(exit_code(session.exit_code()))
}

fn exit_code(remote: i32) -> ExitCode {
    match u8::try_from(remote) {
        Ok(code) => ExitCode::from(code),
        Err(_) if remote == NO_EXIT_CODE => ExitCode::FAILURE,
        Err(_) => ExitCode::from(u8::MAX),
    }
}
