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

//! Supfile model.
//!
//! A Supfile is a YAML document with `version`, `env`, `networks`, `commands`
//! and `targets`. Networks name the hosts a run fans out over, commands are
//! the declarative units of work, and targets are ordered aliases for command
//! sequences.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tokio::process;

/// Ordered list of `KEY=value` pairs. Order is preserved from the Supfile so
/// later entries may reference earlier ones inside the shell prelude.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvList(Vec<EnvVar>);

#[derive(Debug, Clone, PartialEq)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

impl EnvList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert or overwrite a variable. An existing key keeps its position.
    pub fn set(&mut self, key: &str, value: &str) {
        if let Some(var) = self.0.iter_mut().find(|v| v.key == key) {
            var.value = value.to_string();
            return;
        }
        self.0.push(EnvVar {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|v| v.key == key)
            .map(|v| v.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnvVar> {
        self.0.iter()
    }

    pub fn extend(&mut self, other: &EnvList) {
        for var in other.iter() {
            self.set(&var.key, &var.value);
        }
    }

    /// Serialize into the shell prelude embedded verbatim into every command:
    /// `export K="V";export K2="V2";`.
    pub fn prelude(&self) -> String {
        let mut out = String::new();
        for var in &self.0 {
            out.push_str(&format!("export {}=\"{}\";", var.key, var.value));
        }
        out
    }
}

impl fmt::Display for EnvList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.prelude())
    }
}

impl<'de> Deserialize<'de> for EnvList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct EnvListVisitor;

        impl<'de> serde::de::Visitor<'de> for EnvListVisitor {
            type Value = EnvList;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of environment variables")
            }

            fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
            where
                M: serde::de::MapAccess<'de>,
            {
                let mut list = EnvList::new();
                while let Some((key, value)) = access.next_entry::<String, YamlScalar>()? {
                    list.set(&key, &value.0);
                }
                Ok(list)
            }
        }

        deserializer.deserialize_map(EnvListVisitor)
    }
}

/// Accepts strings, numbers and booleans as env values, stringified.
struct YamlScalar(String);

impl<'de> Deserialize<'de> for YamlScalar {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        let s = match value {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::Null => String::new(),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "unsupported env value: {other:?}"
                )))
            }
        };
        Ok(YamlScalar(s))
    }
}

/// Named set of hosts, with an optional bastion and env overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Network {
    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default)]
    pub bastion: Option<String>,

    /// Local shell command whose stdout (one host per line) is appended
    /// to `hosts`.
    #[serde(default)]
    pub inventory: Option<String>,

    #[serde(default)]
    pub env: EnvList,
}

impl Network {
    /// Run the inventory command locally and collect the produced hosts.
    pub async fn parse_inventory(&self) -> Result<Vec<String>> {
        let Some(inventory) = &self.inventory else {
            return Ok(Vec::new());
        };

        let output = process::Command::new("bash")
            .arg("-c")
            .arg(inventory)
            .output()
            .await
            .context("inventory command failed to start")?;

        if !output.status.success() {
            anyhow::bail!(
                "inventory command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// One `{src, dst, exc}` upload record. `exc` is a comma-separated list of
/// tar exclude patterns.
#[derive(Debug, Clone, Deserialize)]
pub struct Upload {
    pub src: String,
    pub dst: String,
    #[serde(default)]
    pub exc: String,
}

/// Declarative unit of work, translated into one or more tasks.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Command {
    #[serde(skip)]
    pub name: String,

    #[serde(default)]
    pub desc: String,

    /// Shell command run on every remote client.
    #[serde(default)]
    pub run: String,

    /// Shell command run on localhost only.
    #[serde(default)]
    pub local: String,

    /// Path to a local file whose contents become the command body.
    #[serde(default)]
    pub script: String,

    #[serde(default)]
    pub upload: Vec<Upload>,

    /// Feed the controller's stdin to each client.
    #[serde(default)]
    pub stdin: bool,

    /// Execute on exactly one arbitrary client. Overrides `serial`.
    #[serde(default)]
    pub once: bool,

    /// Execute in successive waves of at most `serial` clients; 0 disables
    /// batching.
    #[serde(default)]
    pub serial: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct Supfile {
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub env: EnvList,

    #[serde(default)]
    pub networks: HashMap<String, Network>,

    #[serde(default)]
    pub commands: HashMap<String, Command>,

    #[serde(default)]
    pub targets: HashMap<String, Vec<String>>,
}

impl Supfile {
    pub fn parse(data: &str) -> Result<Self> {
        let mut conf: Supfile =
            serde_yaml::from_str(data).context("parsing Supfile failed")?;

        for (name, cmd) in conf.commands.iter_mut() {
            cmd.name = name.clone();
        }
        Ok(conf)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {} failed", path.display()))?;
        Self::parse(&data)
    }

    pub fn network(&self, name: &str) -> Option<&Network> {
        self.networks.get(name)
    }

    pub fn command(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    pub fn target(&self, name: &str) -> Option<&[String]> {
        self.targets.get(name).map(|t| t.as_slice())
    }

    /// Names sorted for stable usage listings.
    pub fn network_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.networks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn command_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn target_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.targets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
