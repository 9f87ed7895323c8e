//! `strata layer` command - Build a layer product.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Args;
use strata_core::StrataConfig;
use strata_image::LayerBuilder;

#[derive(Args)]
pub struct LayerArgs {
    /// Directory to write the layer product into
    #[arg(short, long)]
    pub output: PathBuf,

    /// Source directory to archive
    #[arg(long, conflicts_with = "files", required_unless_present = "files")]
    pub source: Option<PathBuf>,

    /// Archive root for --source (defaults to build.app_root)
    #[arg(long)]
    pub tar_root: Option<String>,

    /// Symlink entry to add, as DEST=TARGET (repeatable)
    #[arg(long = "symlink", value_parser = super::parse_key_value)]
    pub symlinks: Vec<(String, String)>,

    /// Individual file to place under --base-dir (repeatable)
    #[arg(long = "file")]
    pub files: Vec<PathBuf>,

    /// Directory inside the archive for --file entries
    #[arg(long, default_value = "/")]
    pub base_dir: String,

    /// Repository the layer blob is known to live in
    #[arg(long)]
    pub canonical_repo: Option<String>,
}

pub async fn execute(args: LayerArgs, config: &StrataConfig) -> Result<(), Box<dyn std::error::Error>> {
    let product = match &args.source {
        Some(source) => {
            let tar_root = args
                .tar_root
                .clone()
                .unwrap_or_else(|| config.build.app_root.clone());
            let symlinks: BTreeMap<String, String> = args.symlinks.into_iter().collect();
            LayerBuilder::from_directory(
                &args.output,
                source,
                &tar_root,
                &symlinks,
                args.canonical_repo,
            )?
        }
        None => LayerBuilder::from_files(
            &args.output,
            &args.files,
            &args.base_dir,
            args.canonical_repo,
        )?,
    };

    println!("{} {}", product.digest()?, product.dir().display());
    Ok(())
}
