//! Media types used on the registry wire and in persisted descriptors.

/// Schema 2 image manifest.
pub const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Image config blob.
pub const IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

/// Uncompressed layer tar, the default for locally built layers.
pub const LAYER_TAR: &str = "application/vnd.docker.image.rootfs.diff.tar";

/// Content type for layer blob uploads.
pub const OCTET_STREAM: &str = "application/octet-stream";
