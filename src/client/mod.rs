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

//! Endpoints the executor can drive.
//!
//! A client is single-tenant: one task at a time, with `run` as the
//! linearization point. Output travels through per-stream byte channels taken
//! once per task; stdin, EOF and signals travel the other way through the
//! [`SessionInput`] protocol so the executor's pumps never need to hold the
//! client lock while a `wait` is in flight.

pub mod auth;
pub mod localhost;
pub mod ssh;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::task::Task;

pub use localhost::LocalhostClient;
pub use ssh::SshClient;

/// Byte chunks pumped from a session's stdout or stderr.
pub type OutputStream = mpsc::Receiver<Vec<u8>>;

/// Shared handle used by the engine's client arena. The per-client `wait`
/// fiber holds the lock; everything else goes through cheap handles captured
/// at launch.
pub type SharedClient = Arc<Mutex<Box<dyn Client>>>;

/// I/O chunk size for session pumps.
pub(crate) const IO_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The command finished with a non-zero exit status. The executor
    /// classifies these; status 15 marks an intentional stop.
    #[error("Process exited with status {status}")]
    Exit { status: u32 },

    #[error("Session already running")]
    AlreadyRunning,

    #[error("Not connected")]
    NotConnected,

    #[error("Trying to wait on a stopped session")]
    NotRunning,

    #[error("Remote command did not report an exit status")]
    NoExitStatus,

    #[error("Session closed")]
    SessionClosed,

    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Display tag for a client's output lines. `width` is the printable length,
/// excluding any color codes in `display`.
#[derive(Debug, Clone)]
pub struct Prefix {
    pub display: String,
    pub width: usize,
}

/// Messages flowing into a running session.
#[derive(Debug)]
pub enum SessionInput {
    Data(Vec<u8>),
    /// Close the session's stdin. Sent exactly once, by the stdin feeder,
    /// after the input source reaches EOF.
    Eof,
    Signal(Signal),
}

/// Cloneable write handle onto a running session's stdin and signal path.
#[derive(Debug, Clone)]
pub struct StdinWriter {
    tx: mpsc::Sender<SessionInput>,
}

impl StdinWriter {
    pub(crate) fn new(tx: mpsc::Sender<SessionInput>) -> Self {
        Self { tx }
    }

    pub async fn write(&self, chunk: Vec<u8>) -> Result<(), ClientError> {
        self.tx
            .send(SessionInput::Data(chunk))
            .await
            .map_err(|_| ClientError::SessionClosed)
    }

    pub async fn close(&self) -> Result<(), ClientError> {
        self.tx
            .send(SessionInput::Eof)
            .await
            .map_err(|_| ClientError::SessionClosed)
    }

    pub async fn signal(&self, sig: Signal) -> Result<(), ClientError> {
        self.tx
            .send(SessionInput::Signal(sig))
            .await
            .map_err(|_| ClientError::SessionClosed)
    }
}

/// Capability set required of every endpoint: the local bash child and the
/// remote SSH session expose the same surface to the executor.
#[async_trait]
pub trait Client: Send {
    /// Stable display tag for interleaved output.
    fn prefix(&self) -> Prefix;

    /// Begin executing the task. Stdin, stdout and stderr plumbing is in
    /// place once this returns; rejects re-entry while a task is running.
    async fn run(&mut self, task: &Task) -> Result<(), ClientError>;

    /// Write handle for the running session. `None` when idle.
    fn stdin(&self) -> Option<StdinWriter>;

    /// Take the stdout stream for the running task. Yields once per task.
    fn take_stdout(&mut self) -> Option<OutputStream>;

    /// Take the stderr stream for the running task. Yields once per task.
    fn take_stderr(&mut self) -> Option<OutputStream>;

    /// Block until the current task finishes. A non-zero exit surfaces as
    /// [`ClientError::Exit`].
    async fn wait(&mut self) -> Result<(), ClientError>;

    /// Release connection-level resources. A no-op for localhost.
    async fn close(&mut self) -> Result<(), ClientError>;
}

/// Current OS user, used for prefixes and as the default SSH login.
pub(crate) fn current_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "root".to_string())
}
