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

//! Shipping local files to remote hosts as a streamed tar archive.
//!
//! The local side produces a gzip-compressed tar stream on stdout:
//! `tar --exclude=<pat>... -C . -czf - <path>`, and the remote side unpacks
//! it from its stdin: `tar -C "<dst>" -xzf -`. The stream rides the same
//! stdin channel the executor uses for commands, so an upload is just a task
//! whose input happens to be an archive.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::process::{ChildStdout, Command};

/// Command executed on the remote host to receive the archive.
pub fn remote_untar_command(dst: &str) -> String {
    format!("tar -C \"{dst}\" -xzf -")
}

/// Split a comma-separated exclude list into tar `--exclude=` arguments.
/// Entries are whitespace-trimmed; empties are dropped.
pub fn tar_exclude_args(exclude: &str) -> Vec<String> {
    exclude
        .split(',')
        .map(str::trim)
        .filter(|pat| !pat.is_empty())
        .map(|pat| format!("--exclude={pat}"))
        .collect()
}

/// Start `tar` over `path` and return its stdout as a lazy byte stream.
///
/// The producer is started eagerly but not waited on: the consumer (the
/// remote session's stdin) drives throughput. Startup failures surface here;
/// a mid-stream failure shows up as a short read on the consumer side. The
/// child is reaped in the background once it exits.
pub fn tar_stream_reader(cwd: &Path, path: &str, exclude: &str) -> Result<ChildStdout> {
    let mut args = tar_exclude_args(exclude);
    args.extend(["-C", ".", "-czf", "-"].map(str::to_string));
    args.push(path.to_string());

    let mut child = Command::new("tar")
        .args(&args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stdin(Stdio::null())
        .spawn()
        .context("tar: starting cmd failed")?;

    let stdout = child
        .stdout
        .take()
        .context("tar: stdout pipe failed")?;

    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if !status.success() => {
                tracing::warn!("tar exited with {status}");
            }
            Err(err) => tracing::warn!("reaping tar failed: {err}"),
            _ => {}
        }
    });

    Ok(stdout)
}

/// Resolve a user-supplied path against `cwd` by letting bash expand it with
/// the env prelude in scope. Required because the path may reference
/// variables defined only in the prelude.
pub async fn resolve_local_path(cwd: &Path, path: &str, env: &str) -> Result<String> {
    let output = Command::new("bash")
        .arg("-c")
        .arg(format!("{env}echo -n {path}"))
        .current_dir(cwd)
        .output()
        .await
        .context("resolving path failed")?;

    if !output.status.success() {
        anyhow::bail!(
            "resolving path failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
