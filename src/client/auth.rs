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

//! Process-wide SSH signer pool.
//!
//! Gathered once per invocation, behind a once-latch: identities offered by
//! the agent at `$SSH_AUTH_SOCK`, then every parseable private key matching
//! `~/.ssh/id_*`. A client constructed with an explicit identity file skips
//! the pool and uses only that key.

use russh::client::Handle;
use russh::keys::agent::client::AgentClient;
use russh::keys::{load_secret_key, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::ssh::ClientHandler;
use super::ClientError;

static AUTH_CONTEXT: OnceCell<AuthContext> = OnceCell::const_new();

pub async fn auth_context() -> &'static AuthContext {
    AUTH_CONTEXT.get_or_init(AuthContext::load).await
}

#[derive(Debug, Default)]
pub struct AuthContext {
    agent_identities: Vec<PublicKey>,
    keys: Vec<Arc<PrivateKey>>,
}

impl AuthContext {
    async fn load() -> Self {
        let mut ctx = Self::default();

        if std::env::var("SSH_AUTH_SOCK").is_ok() {
            match AgentClient::connect_env().await {
                Ok(mut agent) => match agent.request_identities().await {
                    Ok(identities) => ctx.agent_identities = identities,
                    Err(err) => tracing::debug!("listing agent identities failed: {err}"),
                },
                Err(err) => tracing::debug!("connecting to ssh-agent failed: {err}"),
            }
        }

        if let Some(home) = dirs::home_dir() {
            let pattern = format!("{}/.ssh/id_*", home.display());
            for entry in glob::glob(&pattern).into_iter().flatten().flatten() {
                if entry.extension().is_some_and(|ext| ext == "pub") {
                    continue;
                }
                match load_secret_key(&entry, None) {
                    Ok(key) => ctx.keys.push(Arc::new(key)),
                    Err(err) => {
                        tracing::debug!("skipping {}: {err}", entry.display());
                    }
                }
            }
        }

        tracing::debug!(
            "signer pool: {} agent identities, {} key files",
            ctx.agent_identities.len(),
            ctx.keys.len()
        );
        ctx
    }

    /// Offer every pooled signer until one is accepted, agent identities
    /// first. With `identity` set, only that key is offered.
    pub async fn authenticate(
        &self,
        handle: &mut Handle<ClientHandler>,
        user: &str,
        identity: Option<&Path>,
    ) -> Result<(), ClientError> {
        if let Some(identity) = identity {
            let key = load_secret_key(identity, None)
                .map_err(|err| ClientError::Other(format!("get private key: {err}")))?;
            return try_key(handle, user, Arc::new(key)).await.and_then(|ok| {
                if ok {
                    Ok(())
                } else {
                    Err(ClientError::Other(format!(
                        "key {} rejected by server",
                        identity.display()
                    )))
                }
            });
        }

        for identity in &self.agent_identities {
            // The agent client is not shareable across authentications, so
            // each attempt gets its own connection.
            let Ok(mut agent) = AgentClient::connect_env().await else {
                break;
            };
            let hash = handle.best_supported_rsa_hash().await?.flatten();
            match handle
                .authenticate_publickey_with(user, identity.clone(), hash, &mut agent)
                .await
            {
                Ok(result) if result.success() => return Ok(()),
                Ok(_) => {}
                Err(err) => tracing::debug!("agent auth attempt failed: {err}"),
            }
        }

        for key in &self.keys {
            if try_key(handle, user, key.clone()).await? {
                return Ok(());
            }
        }

        Err(ClientError::Other(
            "all SSH authentication methods failed".to_string(),
        ))
    }
}

async fn try_key(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    key: Arc<PrivateKey>,
) -> Result<bool, ClientError> {
    let hash = handle.best_supported_rsa_hash().await?.flatten();
    let result = handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, hash))
        .await?;
    Ok(result.success())
}
