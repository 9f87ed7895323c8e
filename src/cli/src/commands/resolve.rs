//! `strata resolve` command - Materialize a remote image's layers.

use std::path::PathBuf;

use clap::Args;
use strata_core::StrataConfig;
use strata_image::{RegistryClient, RemoteImageResolver};

#[derive(Args)]
pub struct ResolveArgs {
    /// Repository to resolve (e.g., "base/os")
    pub repo: String,

    /// Tag or digest
    #[arg(default_value = "latest")]
    pub reference: String,

    /// Directory for the resolved layers (defaults to <cache_dir>/resolved/<repo>/<reference>)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

pub async fn execute(args: ResolveArgs, config: &StrataConfig) -> Result<(), Box<dyn std::error::Error>> {
    let output = args.output.unwrap_or_else(|| {
        config
            .cache_dir
            .join("resolved")
            .join(&args.repo)
            .join(args.reference.replace(':', "_"))
    });

    tracing::debug!(
        repo = %args.repo,
        reference = %args.reference,
        output = %output.display(),
        "Resolving remote image"
    );
    let client = RegistryClient::new(&config.registry)?;
    let resolved = RemoteImageResolver::new(&client)
        .resolve(&args.repo, &args.reference, &output)
        .await?;

    for layer in resolved.layers()? {
        println!("{} {}", layer.digest()?, layer.dir().display());
    }
    Ok(())
}
