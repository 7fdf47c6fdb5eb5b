//! Read-only view combining queue and limiter state for operators.
use std::sync::Arc;

use serde::Serialize;

use crate::error::StatusError;
use crate::queue::{JobQueue, QueueStatus};
use crate::rate_limiter::{RateLimitStatus, RateLimiter};
use crate::types::job::{JobId, JobStatusView};

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SystemStatus {
    pub queue: QueueStatus,
    #[serde(rename = "rate-limit")]
    pub rate_limit: RateLimitStatus,
}

/// Query facade handed to the control surface. Holds no state of its own.
#[derive(Clone)]
pub struct StatusStore {
    queue: JobQueue,
    limiter: Arc<RateLimiter>,
}

impl StatusStore {
    pub fn new(queue: JobQueue, limiter: Arc<RateLimiter>) -> Self {
        Self { queue, limiter }
    }

    pub fn job(&self, id: JobId) -> Result<JobStatusView, StatusError> {
        self.queue.status_of(id)
    }

    pub fn queue(&self) -> QueueStatus {
        self.queue.queue_status()
    }

    pub fn rate_limit(&self) -> RateLimitStatus {
        self.limiter.status()
    }

    pub fn snapshot(&self) -> SystemStatus {
        SystemStatus {
            queue: self.queue(),
            rate_limit: self.rate_limit(),
        }
    }
}
