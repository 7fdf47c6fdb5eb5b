//! Collaborators the queue depends on but does not implement.
//!
//! Production wiring lives in [`crate::openai`] and [`crate::storage`]; tests
//! substitute scripted fakes.
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ExternalError, StoreError};

/// Describes the clothing item shown in an image.
#[async_trait]
pub trait VisionDescriber: Send + Sync {
    async fn describe(&self, image_ref: &str) -> Result<String, ExternalError>;
}

/// Renders a new product image from a text prompt.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Returns a reference to the generated image. Generator references are
    /// usually short-lived and must be re-hosted.
    async fn generate(&self, prompt: &str) -> Result<String, ExternalError>;

    /// Fetches the bytes behind a reference returned by [`Self::generate`].
    async fn download(&self, image_ref: &str) -> Result<Bytes, ExternalError>;
}

/// Durable storage for raw image bytes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `data` under `key` and returns a publicly addressable reference.
    async fn upload(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<String, StoreError>;
}

/// The finished wardrobe item, as handed to the item store.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NewItem {
    pub owner_id: String,
    pub category: String,
    pub label: String,
    pub description: String,
    pub original_image: String,
    pub generated_image: String,
}

/// A stored item with its assigned id.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ItemRecord {
    pub id: String,
    #[serde(flatten)]
    pub item: NewItem,
}

/// Persists finished items.
#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn persist(&self, item: NewItem) -> Result<ItemRecord, StoreError>;
}
