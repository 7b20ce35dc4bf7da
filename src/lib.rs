pub mod archive;
pub mod cli;
pub mod client;
pub mod config;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod ssh_config;
pub mod task;
pub mod utils;

pub use cli::Cli;
pub use config::{Command, EnvList, Network, Supfile};
pub use engine::Sup;
pub use errors::RemoteExit;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
