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

//! A Supfile target expands to its command sequence and the engine runs the
//! commands strictly in order.

use sup::{EnvList, Sup, Supfile};

#[tokio::test]
async fn test_target_commands_run_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("steps");

    let conf = Supfile::parse(
        r#"
networks:
  local:
    hosts:
      - localhost

commands:
  first:
    run: echo first >> $MARKER
  second:
    run: echo second >> $MARKER
  third:
    run: echo third >> $MARKER

targets:
  all:
    - first
    - second
    - third
"#,
    )
    .unwrap();

    let commands: Vec<_> = conf
        .target("all")
        .unwrap()
        .iter()
        .map(|name| conf.command(name).unwrap().clone())
        .collect();

    let mut vars = EnvList::new();
    vars.set("MARKER", &marker.to_string_lossy());

    let network = conf.network("local").unwrap();
    Sup::new().run(network, &vars, &commands, &[]).await.unwrap();

    let content = std::fs::read_to_string(&marker).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines, ["first", "second", "third"]);
}
