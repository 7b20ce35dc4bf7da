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

//! Local endpoint: shells out through `bash -c`.

use async_trait::async_trait;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

use super::{
    current_username, Client, ClientError, OutputStream, Prefix, SessionInput, StdinWriter,
    IO_BUFFER_SIZE,
};
use crate::task::Task;

pub struct LocalhostClient {
    env: String,
    user: String,
    child: Option<Child>,
    input_tx: Option<mpsc::Sender<SessionInput>>,
    stdout_rx: Option<OutputStream>,
    stderr_rx: Option<OutputStream>,
    running: bool,
}

impl LocalhostClient {
    /// `env` is the full prelude for this client, `SUP_HOST` included.
    pub fn new(env: String) -> Self {
        Self {
            env,
            user: String::new(),
            child: None,
            input_tx: None,
            stdout_rx: None,
            stderr_rx: None,
            running: false,
        }
    }

    /// Records the current OS user for the prefix.
    pub fn connect(&mut self) -> Result<(), ClientError> {
        self.user = current_username();
        Ok(())
    }
}

#[async_trait]
impl Client for LocalhostClient {
    fn prefix(&self) -> Prefix {
        let display = format!("{}@localhost | ", self.user);
        let width = display.len();
        Prefix { display, width }
    }

    async fn run(&mut self, task: &Task) -> Result<(), ClientError> {
        if self.running {
            return Err(ClientError::AlreadyRunning);
        }

        let mut child = Command::new("bash")
            .arg("-c")
            .arg(format!("{}{}", self.env, task.run))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take().ok_or(ClientError::SessionClosed)?;
        let stdout = child.stdout.take().ok_or(ClientError::SessionClosed)?;
        let stderr = child.stderr.take().ok_or(ClientError::SessionClosed)?;
        let pid = child.id().map(|id| Pid::from_raw(id as i32));

        let (stdout_tx, stdout_rx) = mpsc::channel(16);
        let (stderr_tx, stderr_rx) = mpsc::channel(16);
        let (input_tx, input_rx) = mpsc::channel(16);

        tokio::spawn(pump_output(stdout, stdout_tx));
        tokio::spawn(pump_output(stderr, stderr_tx));
        tokio::spawn(feed_input(stdin, pid, input_rx));

        self.child = Some(child);
        self.input_tx = Some(input_tx);
        self.stdout_rx = Some(stdout_rx);
        self.stderr_rx = Some(stderr_rx);
        self.running = true;
        Ok(())
    }

    fn stdin(&self) -> Option<StdinWriter> {
        self.input_tx.clone().map(StdinWriter::new)
    }

    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.stdout_rx.take()
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        self.stderr_rx.take()
    }

    async fn wait(&mut self) -> Result<(), ClientError> {
        if !self.running {
            return Err(ClientError::NotRunning);
        }

        let mut child = self.child.take().ok_or(ClientError::NotRunning)?;
        let status = child.wait().await;
        self.running = false;
        self.input_tx = None;

        match status?.code() {
            Some(0) => Ok(()),
            Some(code) => Err(ClientError::Exit {
                status: code as u32,
            }),
            None => Err(ClientError::Other("command killed by signal".to_string())),
        }
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        Ok(())
    }
}

async fn pump_output(mut reader: impl AsyncRead + Unpin + Send + 'static, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; IO_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Owns the child's stdin. Data is written through, EOF drops the pipe, and
/// signals go straight to the process.
async fn feed_input(
    stdin: ChildStdin,
    pid: Option<Pid>,
    mut input_rx: mpsc::Receiver<SessionInput>,
) {
    let mut stdin = Some(stdin);
    while let Some(input) = input_rx.recv().await {
        match input {
            SessionInput::Data(chunk) => {
                if let Some(pipe) = stdin.as_mut() {
                    if let Err(err) = pipe.write_all(&chunk).await {
                        tracing::warn!("writing to local stdin failed: {err}");
                    }
                }
            }
            SessionInput::Eof => {
                stdin.take();
            }
            SessionInput::Signal(sig) => match pid {
                Some(pid) => {
                    if let Err(err) = kill(pid, sig) {
                        tracing::warn!("sending {sig} to local command failed: {err}");
                    }
                }
                None => tracing::warn!("local command already finished, dropping {sig}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    fn echo_task(body: &str) -> Task {
        Task {
            run: body.to_string(),
            input: None,
            tty: false,
            clients: vec![0],
        }
    }

    async fn drain(mut rx: OutputStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let mut client = LocalhostClient::new(String::new());
        client.connect().unwrap();
        client.run(&echo_task("printf hello")).await.unwrap();

        let stdout = client.take_stdout().unwrap();
        client.wait().await.unwrap();
        assert_eq!(drain(stdout).await, b"hello");
    }

    #[tokio::test]
    async fn test_env_prelude_is_applied() {
        let mut client =
            LocalhostClient::new("export SUP_HOST=\"localhost\";".to_string());
        client.connect().unwrap();
        client.run(&echo_task("printf %s $SUP_HOST")).await.unwrap();

        let stdout = client.take_stdout().unwrap();
        client.wait().await.unwrap();
        assert_eq!(drain(stdout).await, b"localhost");
    }

    #[tokio::test]
    async fn test_stderr_is_separate() {
        let mut client = LocalhostClient::new(String::new());
        client.connect().unwrap();
        client
            .run(&echo_task("printf out; printf err >&2"))
            .await
            .unwrap();

        let stdout = client.take_stdout().unwrap();
        let stderr = client.take_stderr().unwrap();
        client.wait().await.unwrap();
        assert_eq!(drain(stdout).await, b"out");
        assert_eq!(drain(stderr).await, b"err");
    }

    #[tokio::test]
    async fn test_nonzero_exit_maps_to_exit_error() {
        let mut client = LocalhostClient::new(String::new());
        client.connect().unwrap();
        client.run(&echo_task("exit 7")).await.unwrap();

        match client.wait().await {
            Err(ClientError::Exit { status: 7 }) => {}
            other => panic!("expected Exit {{ 7 }}, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejects_concurrent_run() {
        let mut client = LocalhostClient::new(String::new());
        client.connect().unwrap();
        client.run(&echo_task("sleep 1")).await.unwrap();

        match client.run(&echo_task("true")).await {
            Err(ClientError::AlreadyRunning) => {}
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }

        let writer = client.stdin().unwrap();
        writer.signal(Signal::SIGKILL).await.unwrap();
        let _ = client.wait().await;
    }

    #[tokio::test]
    async fn test_stdin_feed_and_close() {
        let mut client = LocalhostClient::new(String::new());
        client.connect().unwrap();
        client.run(&echo_task("cat")).await.unwrap();

        let writer = client.stdin().unwrap();
        writer.write(b"ping\n".to_vec()).await.unwrap();
        writer.close().await.unwrap();

        let stdout = client.take_stdout().unwrap();
        client.wait().await.unwrap();
        assert_eq!(drain(stdout).await, b"ping\n");
    }

    #[tokio::test]
    async fn test_wait_without_run_fails() {
        let mut client = LocalhostClient::new(String::new());
        client.connect().unwrap();
        match client.wait().await {
            Err(ClientError::NotRunning) => {}
            other => panic!("expected NotRunning, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reusable_across_tasks() {
        let mut client = LocalhostClient::new(String::new());
        client.connect().unwrap();

        for expected in ["one", "two"] {
            client
                .run(&echo_task(&format!("printf {expected}")))
                .await
                .unwrap();
            let stdout = client.take_stdout().unwrap();
            client.wait().await.unwrap();
            assert_eq!(drain(stdout).await, expected.as_bytes());
        }
    }
}
