//! In-process SSH server for exercising sessions end to end.
//!
//! Every connection accepts `none` authentication, the password
//! [`PASSWORD`] and the fixture key in `tests/fixtures/id_ed25519`. Whatever
//! command is executed behaves as its [`Behavior`] describes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use russh::keys::{PrivateKey, PublicKey, decode_secret_key};
use russh::server::{self, Auth, Msg};
use russh::{Channel, ChannelId, CryptoVec, Sig};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use super::connection::ConnectionDescriptor;

pub(crate) const PASSWORD: &str = "hunter2";

const FIXTURE_KEY: &str = include_str!("../../tests/fixtures/id_ed25519");

/// How the remote command ends once its stdin reaches EOF.
#[derive(Debug, Clone)]
pub(crate) enum Ending {
    Status(u32),
    Signal(Sig),
    /// Never report an exit and never close the channel.
    Hang,
}

#[derive(Debug, Clone)]
pub(crate) struct Behavior {
    /// Lines written to stdout as soon as the command starts, before any
    /// stdin is read.
    pub lines: usize,
    /// Copy stdin back to stdout.
    pub echo: bool,
    /// Written to stderr at EOF.
    pub stderr: Option<&'static str>,
    /// Answer the exec request with a failure.
    pub reject: bool,
    pub ending: Ending,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            lines: 0,
            echo: false,
            stderr: None,
            reject: false,
            ending: Ending::Status(0),
        }
    }
}

impl Behavior {
    pub(crate) fn exit(status: u32) -> Self {
        Self {
            ending: Ending::Status(status),
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct Observed {
    stdin_bytes: AtomicUsize,
    commands: Mutex<Vec<String>>,
}

pub(crate) struct TestServer {
    port: u16,
    observed: Arc<Observed>,
    accept: JoinHandle<()>,
}

impl TestServer {
    pub(crate) async fn start(behavior: Behavior) -> Self {
        let key = fixture_key();
        let authorized = key.public_key().clone();
        let config = Arc::new(server::Config {
            keys: vec![key],
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let observed = Arc::new(Observed::default());

        let shared = Arc::clone(&observed);
        let accept = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let handler = Connection {
                    behavior: behavior.clone(),
                    authorized: authorized.clone(),
                    observed: Arc::clone(&shared),
                };
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    if let Ok(running) = server::run_stream(config, socket, handler).await {
                        let _ = running.await;
                    }
                });
            }
        });

        Self {
            port,
            observed,
            accept,
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Descriptor for this server with host key checks disabled.
    pub(crate) fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor::builder("127.0.0.1", "runner")
            .port(self.port)
            .insecure(true)
            .build()
            .into_descriptor()
    }

    /// Total stdin bytes received across all connections.
    pub(crate) fn stdin_bytes(&self) -> usize {
        self.observed.stdin_bytes.load(Ordering::SeqCst)
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.observed.commands.lock().unwrap().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

pub(crate) fn fixture_key() -> PrivateKey {
    decode_secret_key(FIXTURE_KEY, None).unwrap()
}

struct Connection {
    behavior: Behavior,
    authorized: PublicKey,
    observed: Arc<Observed>,
}

impl server::Handler for Connection {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, _user: &str, password: &str) -> Result<Auth, Self::Error> {
        if password == PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if public_key.key_data() == self.authorized.key_data() {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut server::Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        self.observed.commands.lock().unwrap().push(command);

        if self.behavior.reject {
            return session.channel_failure(channel);
        }
        session.channel_success(channel)?;

        for line in 1..=self.behavior.lines {
            session.data(channel, CryptoVec::from_slice(format!("{line}\n").as_bytes()))?;
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        self.observed
            .stdin_bytes
            .fetch_add(data.len(), Ordering::SeqCst);
        if self.behavior.echo {
            session.data(channel, CryptoVec::from_slice(data))?;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        if let Some(text) = self.behavior.stderr {
            session.extended_data(channel, 1, CryptoVec::from_slice(text.as_bytes()))?;
        }

        match &self.behavior.ending {
            Ending::Status(status) => session.exit_status_request(channel, *status)?,
            Ending::Signal(signal) => {
                session.exit_signal_request(channel, signal.clone(), false, "", "en")?
            }
            Ending::Hang => return Ok(()),
        }
        session.eof(channel)?;
        session.close(channel)
    }
}
