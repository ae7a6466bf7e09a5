//! Image inspection

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};

use crate::error::Result;
use crate::types::PortSpec;

/// Looks up metadata of container images
#[async_trait]
pub trait ImageInspector: Send + Sync {
    /// Ports the image declares as exposed
    async fn exposed_ports(&self, image: &str) -> Result<BTreeSet<PortSpec>>;
}

/// Inspector for setups without registry access; every image declares no ports
#[derive(Debug, Clone, Copy, Default)]
pub struct NoImageInspector;

#[async_trait]
impl ImageInspector for NoImageInspector {
    async fn exposed_ports(&self, _image: &str) -> Result<BTreeSet<PortSpec>> {
        Ok(BTreeSet::new())
    }
}

/// Inspector answering from a fixed image → ports table
#[derive(Debug, Clone, Default)]
pub struct StaticImageInspector {
    images: HashMap<String, BTreeSet<PortSpec>>,
}

impl StaticImageInspector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the exposed ports of `image`
    pub fn with_image(mut self, image: impl Into<String>, ports: impl IntoIterator<Item = PortSpec>) -> Self {
        self.images.insert(image.into(), ports.into_iter().collect());
        self
    }
}

#[async_trait]
impl ImageInspector for StaticImageInspector {
    async fn exposed_ports(&self, image: &str) -> Result<BTreeSet<PortSpec>> {
        Ok(self.images.get(image).cloned().unwrap_or_default())
    }
}
