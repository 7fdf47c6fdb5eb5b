use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::states::JobStatus;
use crate::error::JobFailure;

/// Process-unique job identifier, handed out in submission order.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Everything needed to turn a photo into a stored wardrobe item.
#[derive(Clone, Debug)]
pub struct UploadPayload {
    pub owner_id: String,
    pub image: Bytes,
    /// Original filename, used for the stored object's extension.
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub category: Option<String>,
    pub label: Option<String>,
    /// The uploader's own description. Only used when the vision service
    /// returns nothing.
    pub description: Option<String>,
}

impl UploadPayload {
    pub fn new(owner_id: impl Into<String>, image: impl Into<Bytes>) -> Self {
        Self {
            owner_id: owner_id.into(),
            image: image.into(),
            filename: None,
            content_type: None,
            category: None,
            label: None,
            description: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

/// Output of a completed job.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct UploadResult {
    #[serde(rename = "item-id")]
    pub item_id: String,
    pub label: String,
    pub category: String,
    pub description: String,
    #[serde(rename = "original-image")]
    pub original_image: String,
    #[serde(rename = "generated-image")]
    pub generated_image: String,
}

#[derive(Debug)]
pub(crate) struct Job {
    pub(crate) id: JobId,
    pub(crate) payload: UploadPayload,
    pub(crate) status: JobStatus,
    pub(crate) retry_count: u32,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) finished_at: Option<DateTime<Utc>>,
    pub(crate) result: Option<UploadResult>,
    pub(crate) error: Option<JobFailure>,
}

impl Job {
    pub(crate) fn new(id: JobId, payload: UploadPayload) -> Self {
        Self {
            id,
            payload,
            status: JobStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            finished_at: None,
            result: None,
            error: None,
        }
    }

    /// Moves the job along its state machine.
    pub(crate) fn set_status(&mut self, next: JobStatus) {
        debug_assert!(
            self.status.can_become(next),
            "illegal transition {:?} -> {:?}",
            self.status,
            next
        );
        self.status = next;
    }

    pub(crate) fn view(&self) -> JobStatusView {
        JobStatusView {
            id: self.id,
            status: self.status,
            retry_count: self.retry_count,
            created_at: self.created_at,
            finished_at: self.finished_at,
            result: self.result.clone(),
            error: self.error.as_ref().map(|e| JobErrorView {
                kind: e.kind(),
                message: e.to_string(),
            }),
        }
    }
}

/// Snapshot of a job handed to polling clients.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub status: JobStatus,
    #[serde(rename = "retry-count")]
    pub retry_count: u32,
    #[serde(rename = "created-at")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "finished-at", skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<UploadResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobErrorView>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct JobErrorView {
    pub kind: &'static str,
    pub message: String,
}
