//! `strata push` command - Publish an image product to a registry.

use std::path::PathBuf;

use clap::Args;
use strata_core::{StrataConfig, UploadMode};
use strata_image::{publish_image, DockerImageProduct, RegistryClient};
use tokio_util::sync::CancellationToken;

#[derive(Args)]
pub struct PushArgs {
    /// Image product directory
    pub image: PathBuf,

    /// Target repository (e.g., "team/app")
    pub repo: String,

    /// Layer product directory referenced by the image (repeatable)
    #[arg(long = "layer")]
    pub layers: Vec<PathBuf>,

    /// Resolved base image directory whose layers the image uses (repeatable)
    #[arg(long = "base")]
    pub bases: Vec<PathBuf>,

    /// Maximum concurrent layer pushes (defaults to build.concurrency)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Blob upload strategy: monolithic or chunked
    #[arg(long)]
    pub upload_mode: Option<UploadMode>,

    /// Only print the image URI
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PushArgs, config: &StrataConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut registry = config.registry.clone();
    if let Some(mode) = args.upload_mode {
        registry.upload_mode = mode;
    }
    let concurrency = args.concurrency.unwrap_or(config.build.concurrency);

    let image = DockerImageProduct::open(&args.image);
    let index = super::layer_index(&args.layers, &args.bases)?;

    let cancel = CancellationToken::new();
    let client = RegistryClient::new(&registry)?.with_cancellation(cancel.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    if !args.quiet {
        println!("Pushing {} to {}...", args.image.display(), args.repo);
    }

    tracing::debug!(
        image = %args.image.display(),
        repo = %args.repo,
        layers = index.len(),
        concurrency,
        upload_mode = %registry.upload_mode,
        "Starting push"
    );
    let published = publish_image(&client, &args.repo, &image, &index, concurrency).await?;
    tracing::info!(repo = %args.repo, uri = %published.uri, "Push complete");

    if args.quiet {
        println!("{}", published.uri);
    } else {
        println!("Pushed: {}", published.uri);
    }
    Ok(())
}
