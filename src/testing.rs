//! Scripted collaborator fakes for tests.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::caller::ExternalCaller;
use crate::config::{QueueConfig, RateLimitConfig};
use crate::error::{ExternalError, StoreError};
use crate::pipeline::{Services, UploadPipeline};
use crate::rate_limiter::RateLimiter;
use crate::services::{
    BlobStore, ImageGenerator, ItemRecord, ItemStore, NewItem, VisionDescriber,
};

pub(crate) const DESCRIPTION: &str =
    "This is a blue denim jacket with brass buttons. It is lightly faded.";

/// Hands out queued failures first, then succeeds forever.
#[derive(Default)]
pub(crate) struct Script {
    failures: Mutex<VecDeque<ExternalError>>,
    calls: AtomicUsize,
}

impl Script {
    pub(crate) fn push(&self, error: ExternalError, times: usize) {
        let mut failures = self.failures.lock();
        failures.extend(std::iter::repeat(error).take(times));
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next(&self) -> Result<(), ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failures.lock().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeVision {
    pub(crate) script: Script,
    /// Replaces `DESCRIPTION` when set.
    pub(crate) reply: Mutex<Option<String>>,
}

#[async_trait]
impl VisionDescriber for FakeVision {
    async fn describe(
        &self,
        _image_ref: &str,
    ) -> Result<String, ExternalError> {
        self.script.next()?;
        Ok(self
            .reply
            .lock()
            .clone()
            .unwrap_or_else(|| DESCRIPTION.to_owned()))
    }
}

#[derive(Default)]
pub(crate) struct FakeGenerator {
    pub(crate) script: Script,
}

#[async_trait]
impl ImageGenerator for FakeGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String, ExternalError> {
        self.script
            .next()
            .map(|_| "https://generator.test/tmp/render.png".to_owned())
    }

    async fn download(&self, _image_ref: &str) -> Result<Bytes, ExternalError> {
        Ok(Bytes::from_static(b"rendered"))
    }
}

/// Logs every upload attempt; fails once for each payload in `fail_once`.
#[derive(Default)]
pub(crate) struct FakeBlobs {
    pub(crate) uploads: Mutex<Vec<(String, Bytes)>>,
    pub(crate) fail_once: Mutex<Vec<Bytes>>,
}

impl FakeBlobs {
    /// Payloads of attempted original-photo uploads, in order.
    pub(crate) fn originals(&self) -> Vec<Bytes> {
        self.uploads
            .lock()
            .iter()
            .filter(|(key, _)| key.starts_with("clothing-items/"))
            .map(|(_, data)| data.clone())
            .collect()
    }
}

#[async_trait]
impl BlobStore for FakeBlobs {
    async fn upload(
        &self,
        key: &str,
        data: Bytes,
        _content_type: &str,
    ) -> Result<String, StoreError> {
        self.uploads.lock().push((key.to_owned(), data.clone()));

        let mut fail_once = self.fail_once.lock();
        if let Some(i) = fail_once.iter().position(|d| *d == data) {
            fail_once.remove(i);
            return Err(StoreError::Other("bucket unavailable".into()));
        }

        Ok(format!("https://blobs.test/{key}"))
    }
}

#[derive(Default)]
pub(crate) struct FakeItems {
    pub(crate) saved: Mutex<Vec<NewItem>>,
    pub(crate) broken: Mutex<bool>,
}

#[async_trait]
impl ItemStore for FakeItems {
    async fn persist(&self, item: NewItem) -> Result<ItemRecord, StoreError> {
        if *self.broken.lock() {
            return Err(StoreError::Other("database is read-only".into()));
        }

        let mut saved = self.saved.lock();
        saved.push(item.clone());
        Ok(ItemRecord {
            id: format!("item-{}", saved.len()),
            item,
        })
    }
}

#[derive(Default, Clone)]
pub(crate) struct Fakes {
    pub(crate) vision: Arc<FakeVision>,
    pub(crate) generator: Arc<FakeGenerator>,
    pub(crate) blobs: Arc<FakeBlobs>,
    pub(crate) items: Arc<FakeItems>,
}

impl Fakes {
    pub(crate) fn pipeline(
        &self,
        limiter: Arc<RateLimiter>,
        queue: &QueueConfig,
    ) -> UploadPipeline {
        let caller = ExternalCaller::new(limiter, queue.retry.clone());
        UploadPipeline::new(
            caller,
            Services {
                vision: self.vision.clone(),
                generator: self.generator.clone(),
                blobs: self.blobs.clone(),
                items: self.items.clone(),
            },
        )
    }
}

pub(crate) fn limiter() -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(RateLimitConfig::default()))
}
