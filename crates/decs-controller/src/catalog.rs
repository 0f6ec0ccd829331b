//! OS images and external networks

use crate::api::{self, ExtNetworkRecord, ImageRecord};
use crate::error::{DecsError, Result};
use crate::invoker::{ApiInvoker, CallTimeout, FormParams};
use std::sync::Arc;

/// Read-only lookups of controller-wide objects
#[derive(Clone)]
pub struct Catalog {
    invoker: Arc<ApiInvoker>,
}

impl Catalog {
    pub fn new(invoker: Arc<ApiInvoker>) -> Self {
        Self { invoker }
    }

    pub async fn images(&self) -> Result<Vec<ImageRecord>> {
        let body = self
            .invoker
            .post(api::IMAGE_LIST_API, &FormParams::new(), CallTimeout::Read)
            .await?;
        api::decode(api::IMAGE_LIST_API, &body)
    }

    /// Image with exactly this (case sensitive) name
    pub async fn image_by_name(&self, name: &str) -> Result<ImageRecord> {
        self.images()
            .await?
            .into_iter()
            .find(|image| image.name == name)
            .ok_or_else(|| DecsError::NotFound(format!("image '{}'", name)))
    }

    pub async fn image_by_id(&self, id: u64) -> Result<ImageRecord> {
        self.images()
            .await?
            .into_iter()
            .find(|image| image.id == id)
            .ok_or_else(|| DecsError::NotFound(format!("image {}", id)))
    }

    pub async fn external_networks(&self) -> Result<Vec<ExtNetworkRecord>> {
        let body = self
            .invoker
            .post(api::EXTNET_LIST_API, &FormParams::new(), CallTimeout::Read)
            .await?;
        api::decode(api::EXTNET_LIST_API, &body)
    }
}
