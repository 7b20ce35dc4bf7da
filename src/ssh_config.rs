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

//! Minimal OpenSSH client-config reader.
//!
//! Only the options the engine consumes are recognized: `HostName`, `User`,
//! `Port` and `IdentityFile`, grouped under `Host` blocks. Aliases are
//! matched by exact name; wildcard patterns are ignored.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SshHost {
    /// Names listed after the `Host` keyword.
    pub aliases: Vec<String>,
    pub host_name: String,
    pub user: String,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
}

/// Parse an ssh_config document into its `Host` blocks.
pub fn parse(content: &str) -> Vec<SshHost> {
    let mut hosts = Vec::new();
    let mut current: Option<SshHost> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.splitn(2, char::is_whitespace);
        let keyword = parts.next().unwrap_or_default();
        let argument = parts.next().unwrap_or_default().trim();

        // `Key=value` is also legal ssh_config syntax.
        let (keyword, argument) = match keyword.split_once('=') {
            Some((k, v)) if argument.is_empty() => (k, v.trim()),
            _ => (keyword, argument),
        };

        if keyword.eq_ignore_ascii_case("host") {
            if let Some(host) = current.take() {
                hosts.push(host);
            }
            current = Some(SshHost {
                aliases: argument.split_whitespace().map(str::to_string).collect(),
                ..Default::default()
            });
            continue;
        }

        let Some(host) = current.as_mut() else {
            continue; // Options before any Host block are global; not used.
        };

        match keyword.to_ascii_lowercase().as_str() {
            "hostname" => host.host_name = argument.to_string(),
            "user" => host.user = argument.to_string(),
            "port" => host.port = argument.parse().ok(),
            "identityfile" => host.identity_file = Some(expand_tilde(argument)),
            _ => {}
        }
    }

    if let Some(host) = current.take() {
        hosts.push(host);
    }
    hosts
}

/// Read an ssh_config file. A missing file is not an error; running without
/// one is the common case.
pub async fn load(path: &Path) -> Result<Vec<SshHost>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading SSH config {} failed", path.display()))?;
    Ok(parse(&content))
}

/// Find the block whose alias list contains `name` exactly. Wildcards do not
/// participate in matching.
pub fn find<'a>(hosts: &'a [SshHost], name: &str) -> Option<&'a SshHost> {
    hosts.iter().find(|host| {
        host.aliases
            .iter()
            .any(|alias| !alias.contains(['*', '?']) && alias == name)
    })
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
# deploy boxes
Host api api-alias
    HostName api.internal.example.com
    User deploy
    Port 2222
    IdentityFile ~/.ssh/deploy_key

Host *.example.com
    User fallback

Host plain
    HostName plain.example.com
"#;

    #[test]
    fn test_parse_blocks() {
        let hosts = parse(CONFIG);
        assert_eq!(hosts.len(), 3);

        let api = &hosts[0];
        assert_eq!(api.aliases, ["api", "api-alias"]);
        assert_eq!(api.host_name, "api.internal.example.com");
        assert_eq!(api.user, "deploy");
        assert_eq!(api.port, Some(2222));
        assert!(api
            .identity_file
            .as_ref()
            .unwrap()
            .ends_with(".ssh/deploy_key"));
    }

    #[test]
    fn test_find_matches_exact_alias_only() {
        let hosts = parse(CONFIG);
        assert!(find(&hosts, "api").is_some());
        assert!(find(&hosts, "api-alias").is_some());
        assert!(find(&hosts, "plain").is_some());
        // Wildcard blocks never match and unknown names fall through.
        assert!(find(&hosts, "other.example.com").is_none());
    }

    #[test]
    fn test_key_value_syntax() {
        let hosts = parse("Host box\nHostName=box.example.com\nPort=2200\n");
        assert_eq!(hosts[0].host_name, "box.example.com");
        assert_eq!(hosts[0].port, Some(2200));
    }

    #[test]
    fn test_defaults_when_options_missing() {
        let hosts = parse("Host bare\n");
        assert_eq!(hosts[0].host_name, "");
        assert_eq!(hosts[0].port, None);
        assert!(hosts[0].identity_file.is_none());
    }
}
