//! Typed product collections owned by the caller.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use strata_core::error::{Result, StrataError};

use crate::digest::Digest;
use crate::layer::LayerProduct;

/// Map from a build identity (image name, target, ...) to its product.
#[derive(Debug)]
pub struct ProductRegistry<K, V> {
    products: HashMap<K, V>,
}

impl<K, V> Default for ProductRegistry<K, V> {
    fn default() -> Self {
        Self {
            products: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Debug, V> ProductRegistry<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a product. A key may be registered only once.
    pub fn insert(&mut self, key: K, product: V) -> Result<()> {
        if self.products.contains_key(&key) {
            return Err(StrataError::DuplicateProduct(format!("{:?}", key)));
        }
        self.products.insert(key, product);
        Ok(())
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.products.get(key)
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.products.iter()
    }
}

/// Map from blob digest to the layer product holding that blob.
#[derive(Debug, Default)]
pub struct LayerIndex {
    layers: HashMap<Digest, LayerProduct>,
}

impl LayerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a layer by its blob digest.
    ///
    /// The same blob may be indexed again from another directory as long as
    /// its metadata is identical; anything else under that digest is a
    /// `DuplicateProduct`.
    pub fn insert(&mut self, layer: LayerProduct) -> Result<()> {
        let digest = layer.digest()?.clone();
        if let Some(existing) = self.layers.get(&digest) {
            if existing.metadata()? == layer.metadata()? {
                return Ok(());
            }
            return Err(StrataError::DuplicateProduct(format!(
                "layer {} at {} conflicts with {}",
                digest,
                layer.dir().display(),
                existing.dir().display()
            )));
        }
        self.layers.insert(digest, layer);
        Ok(())
    }

    pub fn extend<I: IntoIterator<Item = LayerProduct>>(&mut self, layers: I) -> Result<()> {
        for layer in layers {
            self.insert(layer)?;
        }
        Ok(())
    }

    pub fn get(&self, digest: &Digest) -> Option<&LayerProduct> {
        self.layers.get(digest)
    }

    /// Look a digest up, failing with `MissingLayer` when it is not indexed.
    pub fn require(&self, digest: &Digest) -> Result<&LayerProduct> {
        self.get(digest)
            .ok_or_else(|| StrataError::MissingLayer(digest.to_string()))
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}
