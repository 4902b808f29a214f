//! CLI command definitions and dispatch.

mod image_config;
mod info;
mod local_key;

use std::path::{Path, PathBuf};

use a3s_build_core::CacheConfig;
use clap::{Parser, Subcommand};

/// A3S Build: build cache tooling.
#[derive(Parser)]
#[command(name = "a3s-build", version, about)]
pub struct Cli {
    /// Cache configuration file (YAML or JSON)
    #[arg(long, global = true, env = "A3S_BUILD_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Show version, configuration and cache usage
    Info(info::InfoArgs),
    /// Resolve an image reference to its config for a platform
    ImageConfig(image_config::ImageConfigArgs),
    /// Compute the cache key of a local directory source
    LocalKey(local_key::LocalKeyArgs),
}

/// Load the configuration file if given, defaults otherwise.
pub(crate) fn load_config(path: Option<&Path>) -> Result<CacheConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => CacheConfig::from_file(path)?,
        None => CacheConfig::default(),
    };
    Ok(config)
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Info(args) => info::execute(args, &config).await,
        Command::ImageConfig(args) => image_config::execute(args, &config).await,
        Command::LocalKey(args) => local_key::execute(args, &config).await,
    }
}
