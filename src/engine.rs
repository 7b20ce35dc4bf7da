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

//! Run orchestration: connect one client per host, translate each command
//! into tasks, drive the tasks sequentially, tear everything down.

use anyhow::{Context, Result};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::client::{Client, LocalhostClient, SharedClient, SshClient};
use crate::config::{Command, EnvList, Network};
use crate::executor;
use crate::ssh_config::SshHost;
use crate::task::create_tasks;

pub struct Sup {
    debug: bool,
    prefix: bool,
}

impl Default for Sup {
    fn default() -> Self {
        Self::new()
    }
}

impl Sup {
    pub fn new() -> Self {
        Self {
            debug: false,
            prefix: true,
        }
    }

    /// Prepend `set -x;` to script/local/run bodies.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Tag every output line with the host prefix.
    pub fn with_prefix(mut self, prefix: bool) -> Self {
        self.prefix = prefix;
        self
    }

    /// Run the commands over the network's hosts, sequentially, each fanned
    /// out in parallel by the executor. Clients are connected once up front
    /// and closed at teardown, tunneled clients before their bastion.
    pub async fn run(
        &self,
        network: &Network,
        vars: &EnvList,
        commands: &[Command],
        ssh_hosts: &[SshHost],
    ) -> Result<()> {
        if commands.is_empty() {
            anyhow::bail!("no commands to be run");
        }
        if network.hosts.is_empty() {
            anyhow::bail!("no hosts defined for the network");
        }

        let env = vars.prelude();

        let mut bastion = match &network.bastion {
            Some(host) => {
                let mut client = SshClient::new(host, "", 0, ssh_hosts)
                    .context("connecting to bastion failed")?;
                client
                    .connect()
                    .await
                    .context("connecting to bastion failed")?;
                Some(client)
            }
            None => None,
        };
        let bastion_handle = bastion.as_ref().and_then(SshClient::handle);

        // One connect fiber per host.
        let connects: Vec<_> = network
            .hosts
            .iter()
            .enumerate()
            .map(|(index, host)| {
                let host = host.clone();
                let env = env.clone();
                let ssh_hosts = ssh_hosts.to_vec();
                let bastion_handle = bastion_handle.clone();

                tokio::spawn(async move {
                    if host == "localhost" {
                        let mut client =
                            LocalhostClient::new(format!("{env}export SUP_HOST=\"{host}\";"));
                        client.connect()?;
                        Ok::<Box<dyn Client>, anyhow::Error>(Box::new(client))
                    } else {
                        let mut client = SshClient::new(&host, &env, index, &ssh_hosts)?;
                        match &bastion_handle {
                            Some(handle) => client.connect_via(handle).await?,
                            None => client.connect().await?,
                        }
                        Ok::<Box<dyn Client>, anyhow::Error>(Box::new(client))
                    }
                })
            })
            .collect();

        let mut clients: Vec<SharedClient> = Vec::with_capacity(network.hosts.len());
        for joined in join_all(connects).await {
            let client = joined
                .context("connect fiber failed")?
                .context("connecting to clients failed")?;
            clients.push(Arc::new(Mutex::new(client)));
        }

        let connected = clients.len();
        let mut max_len = 0;
        for client in &clients {
            max_len = max_len.max(client.lock().await.prefix().width);
        }

        let result = self
            .run_commands(commands, &mut clients, connected, &env, max_len)
            .await;

        // Teardown runs regardless of the command outcome. Tunneled clients
        // close before the bastion that carries them.
        let mut close_errors = Vec::new();
        for client in &clients {
            if let Err(err) = client.lock().await.close().await {
                close_errors.push(err.to_string());
            }
        }
        if let Some(client) = bastion.as_mut() {
            if let Err(err) = Client::close(client).await {
                close_errors.push(err.to_string());
            }
        }

        result?;

        if !close_errors.is_empty() {
            anyhow::bail!("closing clients failed: {}", close_errors.join("; "));
        }
        Ok(())
    }

    async fn run_commands(
        &self,
        commands: &[Command],
        clients: &mut Vec<SharedClient>,
        connected: usize,
        env: &str,
        max_len: usize,
    ) -> Result<()> {
        let client_ids: Vec<usize> = (0..connected).collect();

        for cmd in commands {
            let mut tasks = create_tasks(cmd, &client_ids, clients, env, self.debug)
                .await
                .context("creating task failed")?;

            for task in &mut tasks {
                executor::run_task(task, clients, self.prefix, max_len).await?;
            }
        }
        Ok(())
    }
}
