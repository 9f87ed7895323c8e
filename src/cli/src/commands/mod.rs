//! CLI command definitions and dispatch.

mod image;
mod layer;
mod push;
mod resolve;
mod save;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use strata_core::StrataConfig;
use strata_image::{LayerIndex, LayerProduct, ResolvedBaseImage};

/// Strata - deterministic container image layers and registry distribution.
#[derive(Parser)]
#[command(name = "strata", version, about)]
pub struct Cli {
    /// YAML configuration file (environment variables still apply on top)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build a layer product from a directory or a list of files
    Layer(layer::LayerArgs),
    /// Download a remote image's layers into local layer products
    Resolve(resolve::ResolveArgs),
    /// Assemble an image product from layer products
    Image(image::ImageArgs),
    /// Publish an image product to a registry
    Push(push::PushArgs),
    /// Write an image product as a `docker load` archive
    Save(save::SaveArgs),
}

/// Load the configuration file if one was given, then apply the environment.
pub(crate) fn load_config(path: Option<&Path>) -> Result<StrataConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => {
            let mut config = StrataConfig::load(path)?;
            config.apply_env();
            config
        }
        None => StrataConfig::from_env(),
    };
    config.validate()?;
    tracing::debug!(
        registry = %config.registry.url,
        upload_mode = %config.registry.upload_mode,
        concurrency = config.build.concurrency,
        "Loaded configuration"
    );
    Ok(config)
}

/// Index layer directories and every layer of resolved base images by digest.
pub(crate) fn layer_index(
    layer_dirs: &[PathBuf],
    base_dirs: &[PathBuf],
) -> Result<LayerIndex, Box<dyn std::error::Error>> {
    let mut index = LayerIndex::new();
    for dir in base_dirs {
        let base = ResolvedBaseImage::open(dir);
        index.extend(base.layers()?.iter().cloned())?;
    }
    index.extend(layer_dirs.iter().map(|dir| LayerProduct::open(dir)))?;
    Ok(index)
}

/// Parse `KEY=VALUE`.
pub(crate) fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Layer(args) => layer::execute(args, &config).await,
        Command::Resolve(args) => resolve::execute(args, &config).await,
        Command::Image(args) => image::execute(args, &config).await,
        Command::Push(args) => push::execute(args, &config).await,
        Command::Save(args) => save::execute(args, &config).await,
    }
}
