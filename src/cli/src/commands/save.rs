//! `strata save` command - Write a `docker load` archive.

use std::path::PathBuf;

use clap::Args;
use strata_core::StrataConfig;
use strata_image::daemon;
use strata_image::DockerImageProduct;

#[derive(Args)]
pub struct SaveArgs {
    /// Image product directory
    pub image: PathBuf,

    /// Directory to write image.tar into
    #[arg(short, long)]
    pub output: PathBuf,

    /// Layer product directory referenced by the image (repeatable)
    #[arg(long = "layer")]
    pub layers: Vec<PathBuf>,

    /// Resolved base image directory whose layers the image uses (repeatable)
    #[arg(long = "base")]
    pub bases: Vec<PathBuf>,

    /// Run `docker load` on the archive afterwards
    #[arg(long)]
    pub load: bool,
}

pub async fn execute(args: SaveArgs, _config: &StrataConfig) -> Result<(), Box<dyn std::error::Error>> {
    let image = DockerImageProduct::open(&args.image);
    let index = super::layer_index(&args.layers, &args.bases)?;

    let archive = daemon::create_load_archive(&args.output, &image, &index)?;
    if args.load {
        daemon::docker_load(&archive).await?;
    }

    println!("{}", archive.display());
    Ok(())
}
