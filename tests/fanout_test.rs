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

//! Engine-level fan-out behavior, exercised over localhost clients.

use sup::config::{Command, Network};
use sup::{EnvList, RemoteExit, Sup};

fn network_of(n: usize) -> Network {
    Network {
        hosts: vec!["localhost".to_string(); n],
        ..Default::default()
    }
}

/// Run `command` against `hosts` localhost clients with `$MARKER` pointing
/// at a scratch file, returning how many lines ended up in it.
async fn run_counted(hosts: usize, mut command: Command) -> usize {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker");

    let mut vars = EnvList::new();
    vars.set("MARKER", &marker.to_string_lossy());

    command.name = "counted".to_string();
    Sup::new()
        .run(&network_of(hosts), &vars, &[command], &[])
        .await
        .unwrap();

    if !marker.exists() {
        return 0;
    }
    std::fs::read_to_string(&marker).unwrap().lines().count()
}

#[tokio::test]
async fn test_every_client_executes_once() {
    let command = Command {
        run: "echo ran >> $MARKER".to_string(),
        ..Default::default()
    };
    assert_eq!(run_counted(3, command).await, 3);
}

#[tokio::test]
async fn test_once_runs_on_a_single_client() {
    let command = Command {
        run: "echo ran >> $MARKER".to_string(),
        once: true,
        ..Default::default()
    };
    assert_eq!(run_counted(3, command).await, 1);
}

#[tokio::test]
async fn test_serial_covers_all_clients() {
    let command = Command {
        run: "echo ran >> $MARKER".to_string(),
        serial: 2,
        ..Default::default()
    };
    assert_eq!(run_counted(5, command).await, 5);
}

#[tokio::test]
async fn test_serial_waves_do_not_overlap() {
    // Each client appends a begin/end pair; with serial=1 the pairs must
    // nest perfectly because waves run strictly one after another.
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("order");

    let mut vars = EnvList::new();
    vars.set("MARKER", &marker.to_string_lossy());

    let command = Command {
        name: "ordered".to_string(),
        run: "echo begin >> $MARKER; sleep 0.1; echo end >> $MARKER".to_string(),
        serial: 1,
        ..Default::default()
    };

    Sup::new()
        .run(&network_of(3), &vars, &[command], &[])
        .await
        .unwrap();

    let content = std::fs::read_to_string(&marker).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(
        lines,
        ["begin", "end", "begin", "end", "begin", "end"],
        "serial waves interleaved: {lines:?}"
    );
}

#[tokio::test]
async fn test_remote_failure_carries_exit_status() {
    let command = Command {
        name: "fail".to_string(),
        run: "exit 7".to_string(),
        ..Default::default()
    };

    let err = Sup::new()
        .run(&network_of(1), &EnvList::new(), &[command], &[])
        .await
        .unwrap_err();
    let exit = err
        .chain()
        .find_map(|e| e.downcast_ref::<RemoteExit>())
        .copied();
    assert_eq!(exit, Some(RemoteExit { status: 7 }));
}

#[tokio::test]
async fn test_exit_15_does_not_fail_the_run() {
    let command = Command {
        name: "stop".to_string(),
        run: "exit 15".to_string(),
        ..Default::default()
    };

    Sup::new()
        .run(&network_of(2), &EnvList::new(), &[command], &[])
        .await
        .unwrap();
}
