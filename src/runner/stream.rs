//! Remote output plumbing.
//!
//! The remote command's stdout and stderr arrive interleaved on one SSH
//! channel. [`Demux`] routes each chunk to the sink attached for its stream,
//! tracks how the remote process ended and folds everything into the final
//! outcome once the channel is drained.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use russh::{ChannelMsg, Sig};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tracing::{debug, warn};

use super::error::Cause;

/// Destination for one remote output stream.
pub type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Buffer size of an [`OutputPipe`]. The remote side blocks once this much
/// unread output is pending.
pub(crate) const PIPE_CAPACITY: usize = 64 * 1024;

/// SSH extended data type code for stderr.
const EXTENDED_DATA_STDERR: u32 = 1;

/// In-memory sink that can be cloned and read while a session is running.
///
/// Every clone appends to the same buffer, so one handle can be attached to a
/// session and another kept for reading.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.lock().clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Readable end of a remote output stream.
///
/// Reaches end of file once the session has drained the channel. If the pipe
/// is dropped early, further output for that stream fails the session with a
/// stream error.
#[derive(Debug)]
pub struct OutputPipe {
    inner: DuplexStream,
}

impl AsyncRead for OutputPipe {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Create a pipe: the reader for the caller, the sink for the session.
pub(crate) fn output_pipe() -> (OutputPipe, OutputSink) {
    let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
    (OutputPipe { inner: reader }, Box::new(writer))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn name(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Exit {
    Status(u32),
    Signal { name: String, code: i32 },
}

/// Whether the channel has more to say.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Done,
}

/// Routes channel output to sinks and records how the remote process ended.
pub(crate) struct Demux {
    stdout: Option<OutputSink>,
    stderr: Option<OutputSink>,
    exit: Option<Exit>,
    eof: bool,
    stream_error: Option<(&'static str, io::Error)>,
}

impl Demux {
    /// Output for a stream without a sink is discarded.
    pub(crate) fn new(stdout: Option<OutputSink>, stderr: Option<OutputSink>) -> Self {
        Self {
            stdout,
            stderr,
            exit: None,
            eof: false,
            stream_error: None,
        }
    }

    /// Handle one channel message.
    pub(crate) async fn accept(&mut self, msg: ChannelMsg) -> Flow {
        match msg {
            ChannelMsg::Data { ref data } => self.write(Stream::Stdout, data).await,
            ChannelMsg::ExtendedData { ref data, ext } => {
                if ext == EXTENDED_DATA_STDERR {
                    self.write(Stream::Stderr, data).await;
                } else {
                    debug!(ext, len = data.len(), "ignoring extended data");
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                debug!(exit_status, "remote command exited");
                self.exit = Some(Exit::Status(exit_status));
            }
            ChannelMsg::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                ..
            } => {
                let name = signal_name_of(&signal_name);
                let code = signal_exit_code(&signal_name);
                warn!(
                    signal = %name,
                    core_dumped,
                    message = %error_message,
                    "remote command killed by signal"
                );
                self.exit = Some(Exit::Signal { name, code });
            }
            ChannelMsg::Eof => self.eof = true,
            ChannelMsg::Close => return Flow::Done,
            ChannelMsg::Failure => warn!("remote side rejected a channel request"),
            _ => {}
        }

        if self.eof && self.exit.is_some() {
            Flow::Done
        } else {
            Flow::Continue
        }
    }

    /// Write a chunk to the sink for `stream`.
    ///
    /// A failing sink is detached so the channel keeps draining; the first
    /// such failure is kept for [`Demux::finish`].
    pub(crate) async fn write(&mut self, stream: Stream, bytes: &[u8]) {
        let slot = match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        };
        let Some(sink) = slot else {
            return;
        };

        if let Err(e) = sink.write_all(bytes).await {
            warn!(stream = stream.name(), error = %e, "output sink failed, discarding stream");
            *slot = None;
            if self.stream_error.is_none() {
                self.stream_error = Some((stream.name(), e));
            }
        }
    }

    async fn flush(&mut self) {
        for (name, slot) in [("stdout", &mut self.stdout), ("stderr", &mut self.stderr)] {
            if let Some(sink) = slot
                && let Err(e) = sink.flush().await
            {
                warn!(stream = name, error = %e, "cannot flush output sink");
                if self.stream_error.is_none() {
                    self.stream_error = Some((name, e));
                }
            }
        }
    }

    /// Flush and close the sinks and compute the outcome of the command.
    ///
    /// A real exit status always wins. Without one, a stdin transport error
    /// is reported first, then a sink failure.
    pub(crate) async fn finish(mut self, stdin_error: Option<io::Error>) -> Result<(), Cause> {
        self.flush().await;
        let stream_error = self
            .stream_error
            .take()
            .map(|(stream, source)| Cause::Stream { stream, source });

        match self.exit.take() {
            Some(Exit::Status(0)) => stream_error.map_or(Ok(()), Err),
            Some(Exit::Status(status)) => Err(Cause::Exited { status }),
            Some(Exit::Signal { name, code }) => Err(Cause::Signaled { signal: name, code }),
            None => Err(stdin_error
                .map(Cause::Transport)
                .or(stream_error)
                .unwrap_or(Cause::MissingExitStatus)),
        }
    }
}

fn signal_name_of(signal: &Sig) -> String {
    match signal {
        Sig::Custom(name) => name.clone(),
        other => format!("{:?}", other),
    }
}

/// Shell-style exit code for a signal: 128 plus the POSIX signal number, or
/// 128 when the number is unknown.
fn signal_exit_code(signal: &Sig) -> i32 {
    let number = match signal {
        Sig::HUP => 1,
        Sig::INT => 2,
        Sig::QUIT => 3,
        Sig::ILL => 4,
        Sig::ABRT => 6,
        Sig::FPE => 8,
        Sig::KILL => 9,
        Sig::USR1 => 10,
        Sig::SEGV => 11,
        Sig::PIPE => 13,
        Sig::ALRM => 14,
        Sig::TERM => 15,
        _ => 0,
    };
    128 + number
}
