//! One remote execution of one script.
//!
//! A [`Session`] is built already connected: construction renders the script,
//! resolves the host key policy, dials, authenticates and opens an SSH
//! channel. The caller then wires output sinks and either calls
//! [`Session::run`], or [`Session::start`] followed by [`Session::wait`].
//! [`Session::close`] releases everything and is safe to call at any time,
//! any number of times.
//!
//! ```text
//! Created -> Connected -> Running -> Completed | Failed
//!                 \            \          \
//!                  +------------+----------+--> Closed
//! ```
//!
//! While running, a background task feeds the rendered script to the remote
//! stdin and drains the channel into the sinks. Closing or dropping a running
//! session cancels that task, which asks the remote command to terminate.

use std::fmt;
use std::io;
use std::time::Duration;

use russh::{
    Channel, ChannelMsg, ChannelReadHalf, ChannelWriteHalf, Disconnect, Sig, client,
};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::auth::{AuthMethod, HostKeyPolicy};
use super::client::{ClientHandler, connect};
use super::config::RunnerConfig;
use super::connection::ConnectionDescriptor;
use super::error::{Cause, NO_EXIT_CODE, RunnerError};
use super::stream::{Demux, Flow, OutputPipe, OutputSink, output_pipe};
use crate::script::{Script, ScriptIdentity, ScriptReader};

/// Bound on each teardown step that talks to the remote side.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `close` waits for the I/O task before aborting it.
const PUMP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Being constructed. Never observable on a returned session.
    Created,
    /// Authenticated with an open channel; sinks may be attached.
    Connected,
    /// Remote command started.
    Running,
    /// Remote command exited with status 0.
    Completed,
    /// Remote command or its transport failed.
    Failed,
    /// Resources released.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::Connected => "connected",
            SessionState::Running => "running",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A connected SSH session that runs one script.
pub struct Session {
    script: ScriptIdentity,
    command: String,
    handle: Option<client::Handle<ClientHandler>>,
    channel: Option<Channel<client::Msg>>,
    stdin: Option<ScriptReader>,
    stdout: Option<OutputSink>,
    stderr: Option<OutputSink>,
    pump: Option<JoinHandle<Result<(), Cause>>>,
    cancel: CancellationToken,
    state: SessionState,
    exit_code: i32,
}

impl Session {
    /// Connect a session for `script` using settings from the environment.
    pub async fn new<S>(
        descriptor: &ConnectionDescriptor,
        script: &S,
        arguments: &Value,
    ) -> Result<Self, RunnerError>
    where
        S: Script + ?Sized,
    {
        Self::with_config(descriptor, script, arguments, &RunnerConfig::resolve()).await
    }

    /// Connect a session for `script` with explicit transport settings.
    ///
    /// Steps run in order and the first failure is returned with exit code
    /// `-1` and an empty command: script parse error, stdin rendering, host
    /// key policy, dial and authentication, channel open. Nothing touches the
    /// network before the script has rendered.
    #[instrument(
        name = "session_connect",
        skip_all,
        fields(
            script = %script.identity(),
            address = %descriptor.address(),
            user = %descriptor.user()
        )
    )]
    pub async fn with_config<S>(
        descriptor: &ConnectionDescriptor,
        script: &S,
        arguments: &Value,
        config: &RunnerConfig,
    ) -> Result<Self, RunnerError>
    where
        S: Script + ?Sized,
    {
        let identity = script.identity().clone();
        let fail = |cause: Cause| {
            warn!(error = %cause, "cannot create session");
            RunnerError::new(identity.clone(), "", cause)
        };

        if let Some(e) = script.parse_error() {
            return Err(fail(Cause::Parse(e.clone())));
        }

        let command = script.command();
        let stdin = script
            .reader(arguments)
            .map_err(|e| fail(Cause::Stdin(e)))?;

        let auth = AuthMethod::select(descriptor);
        let policy = HostKeyPolicy::for_descriptor(descriptor, config).map_err(fail)?;
        let handle = connect(descriptor, &auth, policy, config)
            .await
            .map_err(fail)?;

        let channel = match handle.channel_open_session().await {
            Ok(channel) => channel,
            Err(e) => {
                release(handle).await;
                return Err(fail(Cause::OpenSession(e)));
            }
        };

        debug!(command = %command, "session channel open");

        Ok(Self {
            script: identity,
            command,
            handle: Some(handle),
            channel: Some(channel),
            stdin: Some(stdin),
            stdout: None,
            stderr: None,
            pump: None,
            cancel: CancellationToken::new(),
            state: SessionState::Connected,
            exit_code: NO_EXIT_CODE,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Exit code of the remote command; `-1` until it is known.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Command line executed remotely.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn script(&self) -> &ScriptIdentity {
        &self.script
    }

    /// Send remote stdout to `writer`. Replaces any earlier stdout sink.
    pub fn set_stdout_writer<W>(&mut self, writer: W) -> Result<(), RunnerError>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.expect_state(SessionState::Connected, "attach stdout")?;
        self.stdout = Some(Box::new(writer));
        Ok(())
    }

    /// Send remote stderr to `writer`. Replaces any earlier stderr sink.
    pub fn set_stderr_writer<W>(&mut self, writer: W) -> Result<(), RunnerError>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.expect_state(SessionState::Connected, "attach stderr")?;
        self.stderr = Some(Box::new(writer));
        Ok(())
    }

    /// Readable pipe of remote stdout. It must be drained while the command
    /// runs, or the remote side stalls once the pipe buffer is full.
    pub fn stdout_pipe(&mut self) -> Result<OutputPipe, RunnerError> {
        self.expect_state(SessionState::Connected, "open stdout pipe")?;
        let (pipe, sink) = output_pipe();
        self.stdout = Some(sink);
        Ok(pipe)
    }

    /// Readable pipe of remote stderr. Same draining rule as [`Session::stdout_pipe`].
    pub fn stderr_pipe(&mut self) -> Result<OutputPipe, RunnerError> {
        self.expect_state(SessionState::Connected, "open stderr pipe")?;
        let (pipe, sink) = output_pipe();
        self.stderr = Some(sink);
        Ok(pipe)
    }

    /// Start the script and wait for it to finish.
    pub async fn run(&mut self) -> Result<(), RunnerError> {
        self.start().await?;
        self.wait().await
    }

    /// Start the remote command and return without waiting for it.
    #[instrument(name = "session_start", skip_all, fields(script = %self.script))]
    pub async fn start(&mut self) -> Result<(), RunnerError> {
        self.expect_state(SessionState::Connected, "start")?;

        let (Some(channel), Some(stdin)) = (self.channel.take(), self.stdin.take()) else {
            return Err(self.error(Cause::InvalidState {
                operation: "start",
                state: self.state,
            }));
        };

        let (channel, early) = match exec(channel, &self.command).await {
            Ok(started) => started,
            Err(cause) => {
                warn!(command = %self.command, error = %cause, "cannot start remote command");
                self.state = SessionState::Failed;
                self.exit_code = NO_EXIT_CODE;
                return Err(self.error(cause));
            }
        };

        let demux = Demux::new(self.stdout.take(), self.stderr.take());
        self.pump = Some(tokio::spawn(pump(
            channel,
            early,
            stdin,
            demux,
            self.cancel.clone(),
        )));
        self.state = SessionState::Running;

        info!(command = %self.command, "remote command started");
        Ok(())
    }

    /// Wait for a started command to finish and all output to be delivered.
    #[instrument(name = "session_wait", skip_all, fields(script = %self.script))]
    pub async fn wait(&mut self) -> Result<(), RunnerError> {
        self.expect_state(SessionState::Running, "wait")?;

        let Some(pump) = self.pump.take() else {
            return Err(self.error(Cause::InvalidState {
                operation: "wait",
                state: self.state,
            }));
        };

        let outcome = match pump.await {
            Ok(outcome) => outcome,
            Err(e) => Err(Cause::Task(e.to_string())),
        };

        match outcome {
            Ok(()) => {
                self.state = SessionState::Completed;
                self.exit_code = 0;
                info!("remote command completed");
                Ok(())
            }
            Err(cause) => {
                self.state = SessionState::Failed;
                self.exit_code = cause.exit_code();
                warn!(exit_code = self.exit_code, error = %cause, "remote command failed");
                Err(self.error(cause))
            }
        }
    }

    /// Release the channel and the connection.
    ///
    /// A running command is asked to terminate and its output task is
    /// awaited for a bounded time, then aborted. The connection is always
    /// disconnected. Errors while tearing down are logged and otherwise
    /// ignored.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        self.cancel.cancel();
        if let Some(mut pump) = self.pump.take() {
            match timeout(PUMP_SHUTDOWN_TIMEOUT, &mut pump).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!(error = %e, "session I/O task ended abnormally"),
                Err(_) => {
                    warn!(script = %self.script, "session I/O task did not stop, aborting it");
                    pump.abort();
                }
            }
        }

        if let Some(channel) = self.channel.take() {
            match timeout(TEARDOWN_TIMEOUT, channel.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "cannot close channel"),
                Err(_) => debug!("timed out closing channel"),
            }
        }

        if let Some(handle) = self.handle.take() {
            release(handle).await;
        }

        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
        self.state = SessionState::Closed;
        debug!(script = %self.script, "session closed");
    }

    fn expect_state(
        &self,
        expected: SessionState,
        operation: &'static str,
    ) -> Result<(), RunnerError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.error(Cause::InvalidState {
                operation,
                state: self.state,
            }))
        }
    }

    fn error(&self, cause: Cause) -> RunnerError {
        RunnerError::new(self.script.clone(), self.command.clone(), cause)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("script", &self.script)
            .field("command", &self.command)
            .field("state", &self.state)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

async fn release(handle: client::Handle<ClientHandler>) {
    let disconnect = handle.disconnect(Disconnect::ByApplication, "", "English");
    match timeout(TEARDOWN_TIMEOUT, disconnect).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "cannot disconnect cleanly"),
        Err(_) => debug!("timed out disconnecting"),
    }
}

/// Request execution of `command` and wait for the server to confirm it.
///
/// Messages that arrive before the confirmation are returned so the pump can
/// replay them.
async fn exec(
    mut channel: Channel<client::Msg>,
    command: &str,
) -> Result<(Channel<client::Msg>, Vec<ChannelMsg>), Cause> {
    if let Err(e) = channel.exec(true, command).await {
        let _ = channel.close().await;
        return Err(Cause::Start(e));
    }

    let mut early = Vec::new();
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok((channel, early)),
            Some(ChannelMsg::Failure) | None => {
                let _ = channel.close().await;
                return Err(Cause::Rejected);
            }
            Some(msg) => early.push(msg),
        }
    }
}

/// Feed the script to the remote stdin, drain the channel and compute the
/// outcome. Cancellation sends SIGTERM to the remote command.
async fn pump(
    channel: Channel<client::Msg>,
    early: Vec<ChannelMsg>,
    mut stdin: ScriptReader,
    mut demux: Demux,
    cancel: CancellationToken,
) -> Result<(), Cause> {
    let (mut reader, writer) = channel.split();
    let drained = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        stdin_error = exchange(&mut reader, &writer, early, &mut stdin, &mut demux) => {
            Some(stdin_error)
        }
    };

    match drained {
        Some(stdin_error) => {
            let _ = timeout(TEARDOWN_TIMEOUT, writer.close()).await;
            demux.finish(stdin_error).await
        }
        None => {
            debug!("terminating remote command");
            match timeout(TEARDOWN_TIMEOUT, writer.signal(Sig::TERM)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "cannot signal remote command"),
                Err(_) => debug!("timed out signalling remote command"),
            }
            let _ = timeout(TEARDOWN_TIMEOUT, writer.close()).await;
            let _ = timeout(TEARDOWN_TIMEOUT, demux.finish(None)).await;
            Err(Cause::Terminated)
        }
    }
}

/// Write stdin and drain output at the same time.
///
/// The remote side may fill its output window before it has read all of
/// stdin, so the two directions cannot be serialized. Once the channel is
/// drained an unfinished stdin write is abandoned.
async fn exchange(
    reader: &mut ChannelReadHalf,
    writer: &ChannelWriteHalf<client::Msg>,
    early: Vec<ChannelMsg>,
    stdin: &mut ScriptReader,
    demux: &mut Demux,
) -> Option<io::Error> {
    let feed = feed_stdin(writer.make_writer(), stdin);
    tokio::pin!(feed);

    let drain = async {
        for msg in early {
            if demux.accept(msg).await == Flow::Done {
                return;
            }
        }
        while let Some(msg) = reader.wait().await {
            if demux.accept(msg).await == Flow::Done {
                return;
            }
        }
    };
    tokio::pin!(drain);

    let mut fed: Option<io::Result<()>> = None;
    loop {
        tokio::select! {
            result = &mut feed, if fed.is_none() => {
                if let Err(e) = &result {
                    debug!(error = %e, "remote stopped accepting stdin");
                }
                fed = Some(result);
            }
            () = &mut drain => break,
        }
    }

    fed.and_then(Result::err)
}

/// Copy the script into the channel, then send EOF.
async fn feed_stdin<W>(writer: W, stdin: &mut ScriptReader) -> io::Result<()>
where
    W: AsyncWrite,
{
    tokio::pin!(writer);
    tokio::io::copy(stdin, &mut writer).await?;
    writer.shutdown().await
}
