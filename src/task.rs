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

//! Translation of one declarative command into concrete tasks.
//!
//! A command may carry uploads, a script, a local command and a remote
//! command at once; each contributes its own task(s), in that fixed order.
//! `once` and `serial` shape how a task's clients are drawn from the
//! connected set, except for `local`, which always binds a dedicated
//! localhost client.

use anyhow::{Context, Result};
use std::fmt;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;

use crate::archive::{remote_untar_command, resolve_local_path, tar_stream_reader};
use crate::client::{Client, LocalhostClient, SharedClient};
use crate::config::Command;

/// Concrete unit of execution: one shell command body, an optional input
/// stream, and the clients (arena indices) assigned to it.
pub struct Task {
    pub run: String,
    pub input: Option<TaskInput>,
    pub tty: bool,
    pub clients: Vec<usize>,
}

/// Source of bytes fed into every assigned client's stdin.
pub enum TaskInput {
    /// The controller's own stdin.
    Stdin,
    /// An arbitrary byte stream, e.g. a tar archive.
    Stream(Box<dyn AsyncRead + Send + Sync + Unpin>),
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("run", &self.run)
            .field("tty", &self.tty)
            .field("clients", &self.clients)
            .field(
                "input",
                &match &self.input {
                    None => "none",
                    Some(TaskInput::Stdin) => "stdin",
                    Some(TaskInput::Stream(_)) => "stream",
                },
            )
            .finish()
    }
}

/// Slice the client set according to `once`/`serial`. `once` wins and binds
/// the first client; `serial > 0` forms contiguous waves in input order;
/// otherwise all clients run in one wave.
fn fan_out(ids: &[usize], once: bool, serial: usize) -> Vec<Vec<usize>> {
    debug_assert!(!ids.is_empty(), "fan-out over an empty client set");

    if once {
        vec![vec![ids[0]]]
    } else if serial > 0 {
        ids.chunks(serial).map(<[usize]>::to_vec).collect()
    } else {
        vec![ids.to_vec()]
    }
}

fn stdin_input(wanted: bool) -> Option<TaskInput> {
    wanted.then_some(TaskInput::Stdin)
}

fn with_debug(body: &str, debug: bool) -> String {
    if debug {
        format!("set -x;{body}")
    } else {
        body.to_string()
    }
}

/// Expand `cmd` into its ordered task list: uploads, then script, then
/// local, then remote. `client_ids` indexes into `clients`; a `local`
/// command appends its one-shot localhost client there.
pub async fn create_tasks(
    cmd: &Command,
    client_ids: &[usize],
    clients: &mut Vec<SharedClient>,
    env: &str,
    debug: bool,
) -> Result<Vec<Task>> {
    let mut tasks = Vec::new();

    if !cmd.upload.is_empty() {
        let cwd = std::env::current_dir().context("resolving CWD failed")?;

        for upload in &cmd.upload {
            let src = resolve_local_path(&cwd, &upload.src, env)
                .await
                .with_context(|| format!("upload: {}", upload.src))?;

            // Every wave gets its own archive stream; a stream is consumed
            // by the clients it is fanned out to.
            for ids in fan_out(client_ids, cmd.once, cmd.serial) {
                let reader = tar_stream_reader(&cwd, &src, &upload.exc)
                    .with_context(|| format!("upload: {}", upload.src))?;
                tasks.push(Task {
                    run: remote_untar_command(&upload.dst),
                    input: Some(TaskInput::Stream(Box::new(reader))),
                    tty: false,
                    clients: ids,
                });
            }
        }
    }

    if !cmd.script.is_empty() {
        let body = tokio::fs::read_to_string(&cmd.script)
            .await
            .context("can't open script")?;
        let body = with_debug(&body, debug);

        for ids in fan_out(client_ids, cmd.once, cmd.serial) {
            tasks.push(Task {
                run: body.clone(),
                input: stdin_input(cmd.stdin),
                tty: true,
                clients: ids,
            });
        }
    }

    if !cmd.local.is_empty() {
        let mut local = LocalhostClient::new(format!("{env}export SUP_HOST=\"localhost\";"));
        local.connect().context("connecting to localhost failed")?;

        clients.push(Arc::new(Mutex::new(Box::new(local) as Box<dyn Client>)));
        let id = clients.len() - 1;

        tasks.push(Task {
            run: with_debug(&cmd.local, debug),
            input: stdin_input(cmd.stdin),
            tty: true,
            clients: vec![id],
        });
    }

    if !cmd.run.is_empty() {
        let body = with_debug(&cmd.run, debug);

        for ids in fan_out(client_ids, cmd.once, cmd.serial) {
            tasks.push(Task {
                run: body.clone(),
                input: stdin_input(cmd.stdin),
                tty: true,
                clients: ids,
            });
        }
    }

    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn arena(n: usize) -> (Vec<usize>, Vec<SharedClient>) {
        let clients: Vec<SharedClient> = (0..n)
            .map(|_| {
                let mut c = LocalhostClient::new(String::new());
                c.connect().unwrap();
                Arc::new(Mutex::new(Box::new(c) as Box<dyn Client>))
            })
            .collect();
        ((0..n).collect(), clients)
    }

    fn run_cmd(run: &str) -> Command {
        Command {
            run: run.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_plain_run_binds_all_clients() {
        let (ids, mut clients) = arena(3);
        let cmd = run_cmd("date");

        let tasks = create_tasks(&cmd, &ids, &mut clients, "", false)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].clients, [0, 1, 2]);
        assert!(tasks[0].tty);
        assert!(tasks[0].input.is_none());
        assert_eq!(tasks[0].run, "date");
    }

    #[tokio::test]
    async fn test_once_binds_first_client_only() {
        let (ids, mut clients) = arena(3);
        let mut cmd = run_cmd("date");
        cmd.once = true;
        cmd.serial = 2; // once overrides serial

        let tasks = create_tasks(&cmd, &ids, &mut clients, "", false)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].clients, [0]);
    }

    #[tokio::test]
    async fn test_serial_forms_contiguous_waves() {
        let (ids, mut clients) = arena(5);
        let mut cmd = run_cmd("date");
        cmd.serial = 2;

        let tasks = create_tasks(&cmd, &ids, &mut clients, "", false)
            .await
            .unwrap();
        let waves: Vec<&[usize]> = tasks.iter().map(|t| t.clients.as_slice()).collect();
        assert_eq!(waves, [&[0, 1][..], &[2, 3][..], &[4][..]]);
    }

    #[tokio::test]
    async fn test_serial_larger_than_client_set_is_one_wave() {
        let (ids, mut clients) = arena(3);
        let mut cmd = run_cmd("date");
        cmd.serial = 10;

        let tasks = create_tasks(&cmd, &ids, &mut clients, "", false)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].clients, [0, 1, 2]);
    }

    #[tokio::test]
    async fn test_task_order_is_upload_script_local_run() {
        let mut script = tempfile::NamedTempFile::new().unwrap();
        writeln!(script, "echo from-script").unwrap();
        let dist = tempfile::tempdir().unwrap();

        let (ids, mut clients) = arena(2);
        let cmd = Command {
            run: "echo remote".to_string(),
            local: "echo local".to_string(),
            script: script.path().to_string_lossy().into_owned(),
            upload: vec![crate::config::Upload {
                src: dist.path().to_string_lossy().into_owned(),
                dst: "/tmp".to_string(),
                exc: String::new(),
            }],
            ..Default::default()
        };

        let tasks = create_tasks(&cmd, &ids, &mut clients, "", false)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 4);

        // Upload: remote untar, archive input, no TTY, all clients.
        assert!(tasks[0].run.starts_with("tar -C \"/tmp\""));
        assert!(matches!(tasks[0].input, Some(TaskInput::Stream(_))));
        assert!(!tasks[0].tty);
        assert_eq!(tasks[0].clients, [0, 1]);

        // Script body read in full.
        assert_eq!(tasks[1].run, "echo from-script\n");
        assert!(tasks[1].tty);

        // Local: bound to a freshly added client, not the connected set.
        assert_eq!(tasks[2].run, "echo local");
        assert_eq!(tasks[2].clients, [2]);
        assert_eq!(clients.len(), 3);

        assert_eq!(tasks[3].run, "echo remote");
        assert_eq!(tasks[3].clients, [0, 1]);
    }

    #[tokio::test]
    async fn test_debug_prefixes_set_x_except_uploads() {
        let dist = tempfile::tempdir().unwrap();
        let (ids, mut clients) = arena(1);
        let cmd = Command {
            run: "echo remote".to_string(),
            local: "echo local".to_string(),
            upload: vec![crate::config::Upload {
                src: dist.path().to_string_lossy().into_owned(),
                dst: "/tmp".to_string(),
                exc: String::new(),
            }],
            ..Default::default()
        };

        let tasks = create_tasks(&cmd, &ids, &mut clients, "", true)
            .await
            .unwrap();
        assert!(tasks[0].run.starts_with("tar -C"));
        assert_eq!(tasks[1].run, "set -x;echo local");
        assert_eq!(tasks[2].run, "set -x;echo remote");
    }

    #[tokio::test]
    async fn test_stdin_flag_attaches_controller_stdin() {
        let (ids, mut clients) = arena(2);
        let mut cmd = run_cmd("cat");
        cmd.stdin = true;

        let tasks = create_tasks(&cmd, &ids, &mut clients, "", false)
            .await
            .unwrap();
        assert!(matches!(tasks[0].input, Some(TaskInput::Stdin)));
    }

    #[tokio::test]
    async fn test_upload_serial_gets_stream_per_wave() {
        let dist = tempfile::tempdir().unwrap();
        std::fs::write(dist.path().join("f"), b"x").unwrap();

        let (ids, mut clients) = arena(3);
        let cmd = Command {
            serial: 2,
            upload: vec![crate::config::Upload {
                src: dist.path().to_string_lossy().into_owned(),
                dst: "/tmp".to_string(),
                exc: String::new(),
            }],
            ..Default::default()
        };

        let tasks = create_tasks(&cmd, &ids, &mut clients, "", false)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 2);
        for task in &tasks {
            assert!(matches!(task.input, Some(TaskInput::Stream(_))));
        }
        assert_eq!(tasks[0].clients, [0, 1]);
        assert_eq!(tasks[1].clients, [2]);
    }

    #[tokio::test]
    async fn test_missing_script_fails() {
        let (ids, mut clients) = arena(1);
        let cmd = Command {
            script: "/does/not/exist.sh".to_string(),
            ..Default::default()
        };

        let err = create_tasks(&cmd, &ids, &mut clients, "", false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("can't open script"));
    }

    #[tokio::test]
    async fn test_empty_command_produces_no_tasks() {
        let (ids, mut clients) = arena(2);
        let cmd = Command::default();

        let tasks = create_tasks(&cmd, &ids, &mut clients, "", false)
            .await
            .unwrap();
        assert!(tasks.is_empty());
    }
}
