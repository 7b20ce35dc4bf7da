// Copyright 2025 Lablup Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Remote endpoint over russh.
//!
//! The connection is dialed once per invocation and reused across tasks;
//! each task opens its own session channel, closed again in `wait`. A
//! network-level bastion dials targets through a `direct-tcpip` channel and
//! runs a second handshake over that stream.

use async_trait::async_trait;
use nix::sys::signal::Signal;
use owo_colors::{AnsiColors, OwoColorize};
use russh::client::{Config, Handle, Handler, Msg};
use russh::{Channel, ChannelMsg, Disconnect, Pty, Sig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::auth::auth_context;
use super::{
    current_username, Client, ClientError, OutputStream, Prefix, SessionInput, StdinWriter,
};
use crate::errors::ErrConnect;
use crate::ssh_config::{self, SshHost};
use crate::task::Task;
use crate::utils::prefix_color;

/// Terminal requested for TTY tasks: xterm, 80x40, 14.4k baud both ways,
/// echo disabled.
const PTY_MODES: [(Pty, u32); 3] = [
    (Pty::ECHO, 0),
    (Pty::TTY_OP_ISPEED, 14400),
    (Pty::TTY_OP_OSPEED, 14400),
];

pub struct SshClient {
    host: String,
    port: u16,
    user: String,
    env: String,
    color: AnsiColors,
    identity_file: Option<PathBuf>,
    handle: Option<Arc<Handle<ClientHandler>>>,
    session: Option<Session>,
    running: bool,
}

struct Session {
    input_tx: mpsc::Sender<SessionInput>,
    stdout_rx: Option<OutputStream>,
    stderr_rx: Option<OutputStream>,
    done_rx: oneshot::Receiver<Option<u32>>,
}

impl SshClient {
    /// Resolve the raw host string, preferring an ssh_config alias when one
    /// matches. The env prelude is extended with the resolved `SUP_HOST`.
    pub fn new(
        host: &str,
        env: &str,
        color_index: usize,
        ssh_hosts: &[SshHost],
    ) -> Result<Self, ErrConnect> {
        let (user, host, port, identity_file) = match ssh_config::find(ssh_hosts, host) {
            Some(alias) => {
                let resolved = if alias.host_name.is_empty() {
                    host.to_string()
                } else {
                    alias.host_name.clone()
                };
                let user = if alias.user.is_empty() {
                    current_username()
                } else {
                    alias.user.clone()
                };
                (user, resolved, alias.port.unwrap_or(22), alias.identity_file.clone())
            }
            None => {
                let (user, host, port) = parse_host(host)?;
                (user, host, port, None)
            }
        };

        let env = format!("{env}export SUP_HOST=\"{host}\";");
        Ok(Self {
            host,
            port,
            user,
            env,
            color: prefix_color(color_index),
            identity_file,
            handle: None,
            session: None,
            running: false,
        })
    }

    /// Dial TCP and run the SSH handshake. Host keys are accepted
    /// unconditionally.
    pub async fn connect(&mut self) -> Result<(), ErrConnect> {
        if self.handle.is_some() {
            return Err(self.connect_error("already connected"));
        }

        let config = Arc::new(Config::default());
        let handle = russh::client::connect(
            config,
            (self.host.as_str(), self.port),
            ClientHandler,
        )
        .await
        .map_err(|err| self.connect_error(err))?;

        self.authenticate(handle).await
    }

    /// Dial through a bastion: the bastion opens a TCP channel to this
    /// client's endpoint and the handshake runs over that stream.
    pub async fn connect_via(
        &mut self,
        bastion: &Arc<Handle<ClientHandler>>,
    ) -> Result<(), ErrConnect> {
        if self.handle.is_some() {
            return Err(self.connect_error("already connected"));
        }

        let channel = bastion
            .channel_open_direct_tcpip(
                self.host.clone(),
                self.port as u32,
                "127.0.0.1".to_string(),
                22,
            )
            .await
            .map_err(|err| self.connect_error(err))?;

        let config = Arc::new(Config::default());
        let handle =
            russh::client::connect_stream(config, channel.into_stream(), ClientHandler)
                .await
                .map_err(|err| self.connect_error(err))?;

        self.authenticate(handle).await
    }

    async fn authenticate(
        &mut self,
        mut handle: Handle<ClientHandler>,
    ) -> Result<(), ErrConnect> {
        auth_context()
            .await
            .authenticate(&mut handle, &self.user, self.identity_file.as_deref())
            .await
            .map_err(|err| self.connect_error(err))?;

        self.handle = Some(Arc::new(handle));
        Ok(())
    }

    /// Connection handle for dialing other clients through this one.
    pub fn handle(&self) -> Option<Arc<Handle<ClientHandler>>> {
        self.handle.clone()
    }

    fn connect_error(&self, reason: impl ToString) -> ErrConnect {
        ErrConnect {
            user: self.user.clone(),
            host: format!("{}:{}", self.host, self.port),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Client for SshClient {
    fn prefix(&self) -> Prefix {
        let host = if self.port == 22 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        };
        let tag = format!("{}@{} | ", self.user, host);
        let width = tag.len();
        Prefix {
            display: tag.color(self.color).to_string(),
            width,
        }
    }

    async fn run(&mut self, task: &Task) -> Result<(), ClientError> {
        if self.running {
            return Err(ClientError::AlreadyRunning);
        }
        let handle = self.handle.as_ref().ok_or(ClientError::NotConnected)?;

        let channel = handle.channel_open_session().await?;

        if task.tty {
            channel
                .request_pty(false, "xterm", 80, 40, 0, 0, &PTY_MODES)
                .await?;
        }

        let command = format!("{}{}", self.env, task.run);
        channel.exec(true, command.as_str()).await?;

        let (stdout_tx, stdout_rx) = mpsc::channel(16);
        let (stderr_tx, stderr_rx) = mpsc::channel(16);
        let (input_tx, input_rx) = mpsc::channel(16);
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(session_loop(
            channel, input_rx, stdout_tx, stderr_tx, done_tx,
        ));

        self.session = Some(Session {
            input_tx,
            stdout_rx: Some(stdout_rx),
            stderr_rx: Some(stderr_rx),
            done_rx,
        });
        self.running = true;
        Ok(())
    }

    fn stdin(&self) -> Option<StdinWriter> {
        self.session
            .as_ref()
            .map(|s| StdinWriter::new(s.input_tx.clone()))
    }

    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.session.as_mut().and_then(|s| s.stdout_rx.take())
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        self.session.as_mut().and_then(|s| s.stderr_rx.take())
    }

    async fn wait(&mut self) -> Result<(), ClientError> {
        if !self.running {
            return Err(ClientError::NotRunning);
        }
        let session = self.session.take().ok_or(ClientError::NotRunning)?;
        self.running = false;

        match session.done_rx.await {
            Ok(Some(0)) => Ok(()),
            Ok(Some(status)) => Err(ClientError::Exit { status }),
            Ok(None) => Err(ClientError::NoExitStatus),
            Err(_) => Err(ClientError::SessionClosed),
        }
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        self.session = None;
        self.running = false;

        if let Some(handle) = self.handle.take() {
            handle
                .disconnect(Disconnect::ByApplication, "", "")
                .await?;
        }
        Ok(())
    }
}

/// Owns the session channel for the lifetime of one task: multiplexes
/// output messages out and stdin/EOF/signal commands in, then reports the
/// exit status.
async fn session_loop(
    mut channel: Channel<Msg>,
    mut input_rx: mpsc::Receiver<SessionInput>,
    stdout_tx: mpsc::Sender<Vec<u8>>,
    stderr_tx: mpsc::Sender<Vec<u8>>,
    done_tx: oneshot::Sender<Option<u32>>,
) {
    enum Step {
        Msg(Option<ChannelMsg>),
        Input(Option<SessionInput>),
    }

    let mut status: Option<u32> = None;
    let mut input_open = true;

    loop {
        let step = if input_open {
            tokio::select! {
                msg = channel.wait() => Step::Msg(msg),
                input = input_rx.recv() => Step::Input(input),
            }
        } else {
            Step::Msg(channel.wait().await)
        };

        match step {
            Step::Msg(None) => break,
            Step::Msg(Some(ChannelMsg::Data { data })) => {
                let _ = stdout_tx.send(data.to_vec()).await;
            }
            Step::Msg(Some(ChannelMsg::ExtendedData { data, ext })) if ext == 1 => {
                let _ = stderr_tx.send(data.to_vec()).await;
            }
            // An exit status does not end the conversation; data may still
            // be in flight (RFC 4254 sec 5.3 even allows close without EOF).
            Step::Msg(Some(ChannelMsg::ExitStatus { exit_status })) => {
                status = Some(exit_status);
            }
            Step::Msg(Some(_)) => {}
            Step::Input(Some(SessionInput::Data(chunk))) => {
                if let Err(err) = channel.data(&chunk[..]).await {
                    tracing::warn!("writing to remote stdin failed: {err}");
                }
            }
            Step::Input(Some(SessionInput::Eof)) => {
                if let Err(err) = channel.eof().await {
                    tracing::warn!("closing remote stdin failed: {err}");
                }
            }
            Step::Input(Some(SessionInput::Signal(sig))) => {
                if sig == Signal::SIGINT {
                    // Some remote shells ignore the SSH signal channel, so
                    // also deliver a literal ETX over stdin.
                    let _ = channel.data(&b"\x03"[..]).await;
                    if let Err(err) = channel.signal(Sig::INT).await {
                        tracing::warn!("sending SIGINT over SSH failed: {err}");
                    }
                } else {
                    tracing::warn!("{sig} not supported over SSH, dropping");
                }
            }
            Step::Input(None) => input_open = false,
        }
    }

    let _ = done_tx.send(status);
}

/// Accepts any host key.
#[derive(Debug, Clone)]
pub struct ClientHandler;

impl Handler for ClientHandler {
    type Error = ClientError;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Parse `[ssh://][user@]host[:port]`. The split is at the last `@`, since
/// the username itself may contain one.
pub fn parse_host(host: &str) -> Result<(String, String, u16), ErrConnect> {
    let host = host.strip_prefix("ssh://").unwrap_or(host);

    let (user, rest) = match host.rfind('@') {
        Some(at) => (host[..at].to_string(), &host[at + 1..]),
        None => (current_username(), host),
    };

    let (name, port) = match rest.rfind(':') {
        Some(colon) => {
            let port = rest[colon + 1..].parse::<u16>().map_err(|_| ErrConnect {
                user: user.clone(),
                host: rest.to_string(),
                reason: format!("invalid port: {}", &rest[colon + 1..]),
            })?;
            (rest[..colon].to_string(), port)
        }
        None => (rest.to_string(), 22),
    };

    if name.contains('/') {
        return Err(ErrConnect {
            user,
            host: name,
            reason: "unexpected slash in the host URL".to_string(),
        });
    }

    Ok((user, name, port))
}
