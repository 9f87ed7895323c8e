//! Strata Image - deterministic layers and images, and their distribution.
//!
//! Builds byte-stable layer archives, assembles content-addressed image
//! configs and manifests, and pushes them to a Docker Registry HTTP API v2
//! endpoint (or into a local daemon) with existence checks and
//! cross-repository mounts.

#![allow(clippy::result_large_err)]

pub mod archive;
pub mod daemon;
pub mod digest;
pub mod image;
pub mod layer;
pub mod manifest;
pub mod products;
pub mod publish;
pub mod registry;
pub mod resolve;

// Re-export common types
pub use digest::{Digest, StreamingDigest};
pub use image::{DockerImageProduct, ImageMetadata};
pub use layer::{LayerBuilder, LayerMetadata, LayerOptions, LayerProduct};
pub use manifest::{Descriptor, ImageConfig, ImageManifest, PartialManifest};
pub use products::{LayerIndex, ProductRegistry};
pub use publish::{publish_image, BlobPresence, PublishedImage};
pub use registry::{RegistryAuth, RegistryClient};
pub use resolve::{RemoteImageResolver, ResolvedBaseImage};
