//! `strata image` command - Assemble an image product.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Args;
use serde_json::Value;
use strata_core::StrataConfig;
use strata_image::{DockerImageProduct, LayerProduct, ResolvedBaseImage};

#[derive(Args)]
pub struct ImageArgs {
    /// Directory to write the image product into
    #[arg(short, long)]
    pub output: PathBuf,

    /// Resolved base image directory (from `strata resolve`)
    #[arg(long)]
    pub base: Option<PathBuf>,

    /// Layer product directory, in application order (repeatable)
    #[arg(long = "layer")]
    pub layers: Vec<PathBuf>,

    /// Layer product directory appended after all others (repeatable)
    #[arg(long = "extra-layer")]
    pub extra_layers: Vec<PathBuf>,

    /// Config label as KEY=VALUE; VALUE is read as JSON when it parses (repeatable)
    #[arg(long = "label", value_parser = super::parse_key_value)]
    pub labels: Vec<(String, String)>,
}

pub async fn execute(args: ImageArgs, config: &StrataConfig) -> Result<(), Box<dyn std::error::Error>> {
    let base_layers = match &args.base {
        Some(dir) => ResolvedBaseImage::open(dir).layers()?.to_vec(),
        None => Vec::new(),
    };
    let own_layers: Vec<LayerProduct> = args.layers.iter().map(|d| LayerProduct::open(d)).collect();
    let extra_layers: Vec<LayerProduct> = args
        .extra_layers
        .iter()
        .map(|d| LayerProduct::open(d))
        .collect();
    let labels = label_values(args.labels);

    let image = DockerImageProduct::assemble(
        &args.output,
        &base_layers,
        &own_layers,
        &extra_layers,
        &labels,
        &config.build,
    )?;

    println!("{} {}", image.manifest_digest()?, image.dir().display());
    Ok(())
}

fn label_values(labels: Vec<(String, String)>) -> BTreeMap<String, Value> {
    labels
        .into_iter()
        .map(|(key, raw)| {
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            (key, value)
        })
        .collect()
}
