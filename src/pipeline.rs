//! The work done for one upload job.
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::caller::{ExternalCaller, RetryBudget};
use crate::error::{ExternalCallExhausted, ExternalError, StoreError};
use crate::services::{
    BlobStore, ImageGenerator, ItemStore, NewItem, VisionDescriber,
};
use crate::types::job::{JobId, UploadPayload, UploadResult};

pub const VISION_PROMPT: &str = "Describe the clothing item in this image in \
    2-3 sentences. Be concise and consistent. Include the color, texture, and \
    what the item is. Do not mention the background or other objects. \
    Example: \"This is a soft, light blue cotton T-shirt with a classic crew \
    neck and short sleeves. The fabric is smooth and comfortable, perfect for \
    everyday wear.\"";

const GENERATION_SUFFIX: &str = ". Generate a single, centered product photo \
    of only this clothing item on a plain white background. Do not show more \
    than one item. No people, no props, no duplicate items, no text, no \
    shadows, and no extra objects. The item should be fully visible and \
    clearly separated from the background.";

const FALLBACK_LABEL: &str = "Clothing Item";

/// Builds the image-generation prompt for an item description.
pub fn generation_prompt(description: &str) -> String {
    format!("{}{GENERATION_SUFFIX}", description.trim_end_matches('.'))
}

/// Picks a label: the caller's hint if given, otherwise the first sentence
/// of the description without its "This is a" lead-in.
pub fn derive_label(hint: Option<&str>, description: &str) -> String {
    if let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) {
        return hint.to_owned();
    }

    let first = description.split('.').next().unwrap_or_default().trim();
    let short = first
        .strip_prefix("This is a ")
        .or_else(|| first.strip_prefix("This is "))
        .unwrap_or(first)
        .trim();

    if short.is_empty() {
        FALLBACK_LABEL.to_owned()
    } else {
        short.to_owned()
    }
}

/// The default categories every closet starts with.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Category {
    Top,
    Bottom,
    Shoes,
    Accessories,
}

impl Category {
    pub const ALL: [Category; 4] =
        [Self::Top, Self::Bottom, Self::Shoes, Self::Accessories];

    /// Case-insensitive match against the defaults; anything else is a `Top`.
    pub fn resolve(hint: Option<&str>) -> Self {
        let hint = hint.unwrap_or_default().trim();
        Self::ALL
            .into_iter()
            .find(|c| c.title().eq_ignore_ascii_case(hint))
            .unwrap_or(Self::Top)
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::Top => "Top",
            Self::Bottom => "Bottom",
            Self::Shoes => "Shoes",
            Self::Accessories => "Accessories",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Why a pipeline run stopped.
#[derive(Debug, Error)]
pub(crate) enum StepError {
    /// A step outside the rate-limited service failed; the job may be
    /// re-queued.
    #[error("{0}")]
    Retryable(String),
    /// An external call used up the job's budget.
    #[error(transparent)]
    Exhausted(#[from] ExternalCallExhausted),
    /// Saving the finished item failed. Never retried.
    #[error(transparent)]
    Persistence(StoreError),
}

/// The four collaborators a pipeline run needs.
#[derive(Clone)]
pub struct Services {
    pub vision: Arc<dyn VisionDescriber>,
    pub generator: Arc<dyn ImageGenerator>,
    pub blobs: Arc<dyn BlobStore>,
    pub items: Arc<dyn ItemStore>,
}

pub struct UploadPipeline {
    caller: ExternalCaller,
    services: Services,
}

impl UploadPipeline {
    pub fn new(caller: ExternalCaller, services: Services) -> Self {
        Self { caller, services }
    }

    /// Uploads the original, describes it, renders a product image, re-hosts
    /// that image and saves the item. Failed attempts are charged to
    /// `budget`.
    #[instrument(
        name = "job",
        skip_all,
        fields(job_id = %id, owner = %payload.owner_id)
    )]
    pub(crate) async fn run(
        &self,
        id: JobId,
        payload: &UploadPayload,
        budget: &mut RetryBudget,
    ) -> Result<UploadResult, StepError> {
        let owner = payload.owner_id.as_str();
        let Services {
            vision,
            generator,
            blobs,
            items,
        } = &self.services;

        let content_type = payload
            .content_type
            .clone()
            .unwrap_or_else(|| {
                content_type_for(payload.filename.as_deref()).into()
            });
        let key = format!(
            "clothing-items/{}{}",
            Uuid::new_v4(),
            extension_of(payload.filename.as_deref())
        );
        let original = blobs
            .upload(&key, payload.image.clone(), &content_type)
            .await
            .map_err(|e| {
                StepError::Retryable(format!("storing original image: {e}"))
            })?;
        debug!(%original, "stored original image");

        let description = self
            .caller
            .call_with_budget("describe", owner, budget, || {
                vision.describe(&original)
            })
            .await?;
        let description = match description.trim() {
            // Fall back to the uploader's own words if the service had none.
            "" => payload
                .description
                .as_deref()
                .unwrap_or_default()
                .trim()
                .to_owned(),
            text => text.to_owned(),
        };
        debug!(%description, "described image");

        let prompt = generation_prompt(&description);
        let transient = self
            .caller
            .call_with_budget("generate", owner, budget, || {
                generator.generate(&prompt)
            })
            .await?;

        let generated = self.rehost(&transient).await?;
        debug!(%generated, "re-hosted generated image");

        let label = derive_label(payload.label.as_deref(), &description);
        let category = Category::resolve(payload.category.as_deref());

        let record = items
            .persist(NewItem {
                owner_id: owner.to_owned(),
                category: category.to_string(),
                label,
                description,
                original_image: original,
                generated_image: generated,
            })
            .await
            .map_err(StepError::Persistence)?;
        info!(item_id = %record.id, "saved item");

        Ok(UploadResult {
            item_id: record.id,
            label: record.item.label,
            category: record.item.category,
            description: record.item.description,
            original_image: record.item.original_image,
            generated_image: record.item.generated_image,
        })
    }

    /// Generator links expire, so the image is copied into our own storage.
    async fn rehost(&self, transient: &str) -> Result<String, StepError> {
        let data = self
            .services
            .generator
            .download(transient)
            .await
            .map_err(|e: ExternalError| {
                let msg = format!("downloading generated image: {e}");
                StepError::Retryable(msg)
            })?;

        let key = format!("store-image-{}.png", Uuid::new_v4());
        self.services
            .blobs
            .upload(&key, data, "image/png")
            .await
            .map_err(|e| {
                StepError::Retryable(format!("storing generated image: {e}"))
            })
    }
}

fn extension_of(filename: Option<&str>) -> String {
    filename
        .and_then(|f| f.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| {
            !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}

fn content_type_for(filename: Option<&str>) -> &'static str {
    match extension_of(filename).as_str() {
        ".png" => "image/png",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".webp" => "image/webp",
        ".gif" => "image/gif",
        ".heic" => "image/heic",
        _ => "application/octet-stream",
    }
}
