use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "sup",
    about = "Super simple deployment tool - run commands on multiple hosts in parallel",
    disable_version_flag = true,
    long_about = None
)]
pub struct Cli {
    #[arg(short = 'f', value_name = "PATH", help = "Custom path to ./Supfile[.yml]")]
    pub supfile: Option<PathBuf>,

    #[arg(
        short = 'e',
        long = "env",
        value_name = "KEY=VAL",
        help = "Set environment variables (overrides Supfile env)"
    )]
    pub env: Vec<String>,

    #[arg(
        long,
        value_name = "PATH",
        help = "Read SSH config file, ie. ~/.ssh/config"
    )]
    pub sshconfig: Option<PathBuf>,

    #[arg(long, value_name = "REGEX", help = "Filter hosts using regexp")]
    pub only: Option<String>,

    #[arg(long, value_name = "REGEX", help = "Filter out hosts using regexp")]
    pub except: Option<String>,

    #[arg(short = 'D', long = "debug", help = "Enable debug mode (set -x)")]
    pub debug: bool,

    #[arg(long = "disable-prefix", help = "Disable hostname prefix")]
    pub disable_prefix: bool,

    #[arg(short = 'v', long = "version", help = "Print version")]
    pub version: bool,

    #[arg(value_name = "NETWORK")]
    pub network: Option<String>,

    #[arg(value_name = "COMMAND", trailing_var_arg = true)]
    pub commands: Vec<String>,
}
