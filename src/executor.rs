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

//! Per-task concurrency orchestrator.
//!
//! One task fans a single shell invocation out across its assigned clients.
//! Launches happen serially in client order; after that, each client gets a
//! stdout pump and a stderr pump, a single fan-in feeds the task's input to
//! every stdin, and an interrupt trap forwards signals to every client.
//! Once the pumps drain, every client is reaped concurrently and non-zero
//! exits are classified: status 15 counts as an intentional stop, anything
//! else becomes a [`RemoteExit`] carrying the remote status.

use anyhow::Result;
use futures::future::join_all;
use nix::sys::signal::Signal;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::client::{ClientError, Prefix, SharedClient, StdinWriter, IO_BUFFER_SIZE};
use crate::errors::{ErrTask, RemoteExit};
use crate::task::{Task, TaskInput};
use crate::utils::LinePrefixer;

/// Exit status conventionally reported for a command stopped by
/// SIGTERM/SIGINT. Treated as success for the purpose of continuing the run.
const STOPPED_EXIT_STATUS: u32 = 15;

/// Run one task across its clients. `max_len` is the widest prefix among all
/// connected clients, used to left-pad every prefix into a common column.
pub async fn run_task(
    task: &mut Task,
    clients: &[SharedClient],
    on_prefix: bool,
    max_len: usize,
) -> Result<()> {
    let mut prefixes = Vec::with_capacity(task.clients.len());
    let mut writers = Vec::with_capacity(task.clients.len());
    let mut pumps = Vec::new();

    // Launch phase: serial, in the task's client order. A failure here
    // aborts the task; already-launched clients are not unwound.
    for &id in &task.clients {
        let mut client = clients[id].lock().await;

        let prefix = if on_prefix {
            padded(&client.prefix(), max_len)
        } else {
            String::new()
        };

        if let Err(err) = client.run(task).await {
            return Err(anyhow::Error::new(ErrTask {
                command: task.run.clone(),
                reason: err.to_string(),
            })
            .context(format!("{prefix}task failed")));
        }

        let stdout = client
            .take_stdout()
            .ok_or_else(|| anyhow::anyhow!("{prefix}stdout already taken"))?;
        let stderr = client
            .take_stderr()
            .ok_or_else(|| anyhow::anyhow!("{prefix}stderr already taken"))?;
        let stdin = client
            .stdin()
            .ok_or_else(|| anyhow::anyhow!("{prefix}session has no stdin"))?;

        pumps.push(tokio::spawn(pump(stdout, prefix.clone(), false)));
        pumps.push(tokio::spawn(pump(stderr, prefix.clone(), true)));

        writers.push(stdin);
        prefixes.push((id, prefix));
    }

    // Stdin fan-in: one pump duplicates every chunk to every client, then
    // closes each stdin exactly once. Without an input source, stdin is
    // never touched and the remote side closes it naturally.
    let stdin_pump = match task.input.take() {
        Some(TaskInput::Stdin) => Some(tokio::spawn(feed_stdin(
            Box::new(tokio::io::stdin()) as Box<dyn AsyncRead + Send + Unpin>,
            writers.clone(),
        ))),
        Some(TaskInput::Stream(reader)) => {
            Some(tokio::spawn(feed_stdin(reader, writers.clone())))
        }
        None => None,
    };

    // Interrupt trap: forwarded to every client for the task's duration.
    let mut sigint = signal(SignalKind::interrupt())?;
    let trap_writers = writers.clone();
    let trap = tokio::spawn(async move {
        while sigint.recv().await.is_some() {
            for writer in &trap_writers {
                if let Err(err) = writer.signal(Signal::SIGINT).await {
                    tracing::warn!("sending signal failed: {err}");
                }
            }
        }
    });

    // Join phase: both pumps per client reaching EOF means the remote
    // process closed its outputs.
    join_all(pumps).await;

    // Reap phase: one fiber per client.
    let reapers: Vec<_> = prefixes
        .iter()
        .map(|(id, prefix)| {
            let client = clients[*id].clone();
            let prefix = prefix.clone();
            tokio::spawn(async move {
                let mut client = client.lock().await;
                match client.wait().await {
                    Ok(()) => None,
                    Err(ClientError::Exit {
                        status: STOPPED_EXIT_STATUS,
                    }) => {
                        tracing::warn!("{prefix}stopped (exit status 15)");
                        None
                    }
                    Err(err @ ClientError::Exit { status }) => {
                        eprintln!("{prefix}{err}");
                        Some(status)
                    }
                    Err(err) => {
                        eprintln!("{prefix}{err}");
                        Some(1)
                    }
                }
            })
        })
        .collect();

    let verdicts = join_all(reapers).await;

    trap.abort();
    if let Some(pump) = stdin_pump {
        pump.abort();
    }

    for verdict in verdicts {
        match verdict {
            Ok(Some(status)) => return Err(RemoteExit { status }.into()),
            Ok(None) => {}
            Err(err) => tracing::error!("reap fiber failed: {err}"),
        }
    }
    Ok(())
}

fn padded(prefix: &Prefix, max_len: usize) -> String {
    format!(
        "{}{}",
        " ".repeat(max_len.saturating_sub(prefix.width)),
        prefix.display
    )
}

/// Copy one output stream to the controller's stdout or stderr, re-emitting
/// the prefix at the start of every line. Write errors are logged, never
/// fatal.
async fn pump(mut rx: mpsc::Receiver<Vec<u8>>, prefix: String, to_stderr: bool) {
    let mut prefixer = LinePrefixer::new(prefix);
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();

    while let Some(chunk) = rx.recv().await {
        let lines = prefixer.feed(&chunk);
        if !lines.is_empty() {
            write_chunk(&mut stdout, &mut stderr, to_stderr, &lines).await;
        }
    }

    let tail = prefixer.flush();
    if !tail.is_empty() {
        write_chunk(&mut stdout, &mut stderr, to_stderr, &tail).await;
    }
}

async fn write_chunk(
    stdout: &mut tokio::io::Stdout,
    stderr: &mut tokio::io::Stderr,
    to_stderr: bool,
    chunk: &[u8],
) {
    let result = if to_stderr {
        async {
            stderr.write_all(chunk).await?;
            stderr.flush().await
        }
        .await
    } else {
        async {
            stdout.write_all(chunk).await?;
            stdout.flush().await
        }
        .await
    };

    if let Err(err) = result {
        tracing::warn!("writing output failed: {err}");
    }
}

/// Duplicate the task's input to every client's stdin, in read order, then
/// close each stdin. Errors are logged, never fatal.
async fn feed_stdin(mut reader: Box<dyn AsyncRead + Send + Unpin>, writers: Vec<StdinWriter>) {
    let mut buf = vec![0u8; IO_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for writer in &writers {
                    if let Err(err) = writer.write(buf[..n].to_vec()).await {
                        tracing::warn!("copying STDIN failed: {err}");
                    }
                }
            }
            Err(err) => {
                tracing::warn!("copying STDIN failed: {err}");
                break;
            }
        }
    }

    for writer in &writers {
        if let Err(err) = writer.close().await {
            tracing::warn!("failed to close client stdin: {err}");
        }
    }
}
