use anyhow::{Context, Result};
use chrono::SecondsFormat;
use clap::Parser;
use regex::Regex;
use std::path::{Path, PathBuf};

use sup::{Cli, Command, EnvList, Network, RemoteExit, Sup, Supfile};

const USAGE: &str = "Usage: sup [OPTIONS] NETWORK COMMAND [...]\n       sup [ --help | -v | --version ]";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.version {
        println!("{}", sup::VERSION);
        return;
    }

    sup::utils::init_logging(cli.debug);

    if let Err(err) = run(cli).await {
        // A remote exit already printed its prefixed message from the reap
        // phase; the controller just adopts the status.
        if let Some(exit) = err.chain().find_map(|e| e.downcast_ref::<RemoteExit>()) {
            std::process::exit(exit.status as i32);
        }

        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let conf = load_supfile(cli.supfile.as_deref()).await?;

    let Some(network_name) = cli.network.clone() else {
        network_usage(&conf);
        anyhow::bail!("{USAGE}");
    };
    let Some(network) = conf.network(&network_name) else {
        network_usage(&conf);
        anyhow::bail!("unknown network: {network_name}");
    };
    let mut network = network.clone();

    // CLI --env overrides values defined in the network env.
    for entry in &cli.env {
        if entry.is_empty() {
            continue;
        }
        match entry.split_once('=') {
            Some((key, value)) => network.env.set(key, value),
            None => network.env.set(entry, ""),
        }
    }

    let inventory_hosts = network.parse_inventory().await?;
    network.hosts.extend(inventory_hosts);

    if let Some(pattern) = &cli.only {
        let expr = Regex::new(pattern)
            .with_context(|| format!("invalid --only regexp '{pattern}'"))?;
        network.hosts.retain(|host| expr.is_match(host));
        if network.hosts.is_empty() {
            anyhow::bail!("no hosts match --only '{pattern}' regexp");
        }
    }

    if let Some(pattern) = &cli.except {
        let expr = Regex::new(pattern)
            .with_context(|| format!("invalid --except regexp '{pattern}'"))?;
        network.hosts.retain(|host| !expr.is_match(host));
        if network.hosts.is_empty() {
            anyhow::bail!("no hosts left after --except '{pattern}' regexp");
        }
    }

    if network.hosts.is_empty() {
        network_usage(&conf);
        anyhow::bail!("no hosts defined for network {network_name}");
    }

    if cli.commands.is_empty() {
        command_usage(&conf);
        anyhow::bail!("{USAGE}");
    }
    let commands = resolve_commands(&conf, &cli.commands)?;

    let vars = assemble_env(&conf, &mut network, &network_name, &cli.env);

    let sshconfig = cli
        .sshconfig
        .clone()
        .or_else(|| dirs::home_dir().map(|home| home.join(".ssh").join("config")))
        .unwrap_or_else(|| PathBuf::from(".ssh/config"));
    let ssh_hosts = sup::ssh_config::load(&sshconfig).await?;

    let app = Sup::new()
        .with_debug(cli.debug)
        .with_prefix(!cli.disable_prefix);
    app.run(&network, &vars, &commands, &ssh_hosts).await
}

/// `-f` wins; otherwise `./Supfile`, then `./Supfile.yml`.
async fn load_supfile(path: Option<&Path>) -> Result<Supfile> {
    if let Some(path) = path {
        return Supfile::load(&expand_tilde(path)).await;
    }

    match Supfile::load(Path::new("./Supfile")).await {
        Ok(conf) => Ok(conf),
        Err(first) => Supfile::load(Path::new("./Supfile.yml"))
            .await
            .map_err(|second| anyhow::anyhow!("{first:#}\n{second:#}")),
    }
}

/// Expand target names: a target contributes its command sequence in order,
/// a command contributes itself.
fn resolve_commands(conf: &Supfile, names: &[String]) -> Result<Vec<Command>> {
    let mut commands = Vec::new();

    for name in names {
        if let Some(target) = conf.target(name) {
            for cmd_name in target {
                match conf.command(cmd_name) {
                    Some(cmd) => commands.push(cmd.clone()),
                    None => {
                        command_usage(conf);
                        anyhow::bail!("unknown command/target: {cmd_name}");
                    }
                }
            }
        } else if let Some(cmd) = conf.command(name) {
            commands.push(cmd.clone());
        } else {
            command_usage(conf);
            anyhow::bail!("unknown command/target: {name}");
        }
    }
    Ok(commands)
}

/// Merge the global and network env and add the session variables every
/// command sees: SUP_NETWORK, SUP_TIME, SUP_USER, SUP_ENV.
fn assemble_env(
    conf: &Supfile,
    network: &mut Network,
    network_name: &str,
    cli_env: &[String],
) -> EnvList {
    network.env.set("SUP_NETWORK", network_name);

    let sup_time = std::env::var("SUP_TIME")
        .unwrap_or_else(|_| chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
    network.env.set("SUP_TIME", &sup_time);

    let sup_user = std::env::var("SUP_USER")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_default();
    network.env.set("SUP_USER", &sup_user);

    let mut vars = EnvList::new();
    vars.extend(&conf.env);
    vars.extend(&network.env);

    // $SUP_ENV reproduces only the CLI overrides, so a nested sup invocation
    // inherits them.
    let mut sup_env = String::new();
    for entry in cli_env {
        if entry.is_empty() {
            continue;
        }
        let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
        sup_env.push_str(&format!(" -e {key}=\"{value}\""));
    }
    vars.set("SUP_ENV", sup_env.trim());

    vars
}

fn network_usage(conf: &Supfile) {
    eprintln!("Networks:");
    for name in conf.network_names() {
        eprintln!("- {name}");
        if let Some(network) = conf.network(name) {
            for host in &network.hosts {
                eprintln!("   - {host}");
            }
        }
    }
    eprintln!();
}

fn command_usage(conf: &Supfile) {
    eprintln!("Targets:");
    for name in conf.target_names() {
        if let Some(target) = conf.target(name) {
            eprintln!("- {name}\t{}", target.join(" "));
        }
    }
    eprintln!();
    eprintln!("Commands:");
    for name in conf.command_names() {
        if let Some(cmd) = conf.command(name) {
            eprintln!("- {name}\t{}", cmd.desc);
        }
    }
    eprintln!();
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(rest) = path.to_str().and_then(|s| s.strip_prefix("~/")) {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
