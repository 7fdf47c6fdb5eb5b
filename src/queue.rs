//! The upload job queue and its single drain loop.
//!
//! Jobs run strictly one at a time. A job whose step fails while it still has
//! retry budget goes back to the *head* of the queue, so it is retried before
//! anything submitted after it. Terminal jobs leave the active queue but stay
//! queryable until evicted by the retention policy.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::select;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::caller::RetryBudget;
use crate::config::QueueConfig;
use crate::error::{JobFailure, StatusError, SubmitError};
use crate::pipeline::{StepError, UploadPipeline};
use crate::types::job::{Job, JobId, JobStatusView, UploadPayload, UploadResult};
use crate::types::states::JobStatus;

/// Shared handle to the process-wide queue. Cloning is cheap.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<QueueState>,
    pipeline: UploadPipeline,
    config: QueueConfig,
    cancel: CancellationToken,
    /// Bumped on every job transition; lets callers await outcomes.
    changed: watch::Sender<u64>,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    /// Ids of `Pending` jobs in processing order.
    pending: VecDeque<JobId>,
    jobs: HashMap<JobId, Job>,
    /// Terminal jobs in the order they finished.
    finished: VecDeque<(JobId, Instant)>,
    draining: bool,
    current: Option<JobId>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct QueueStatus {
    /// Jobs waiting to be processed.
    pub length: usize,
    #[serde(rename = "is-processing")]
    pub is_processing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<JobId>,
    /// Over every retained job, active or terminal.
    #[serde(rename = "counts-by-status")]
    pub counts_by_status: StatusCounts,
}

impl JobQueue {
    /// Creates an idle queue. The drain loop starts with the first
    /// submission and stops for good once `cancel` fires.
    pub fn new(
        pipeline: UploadPipeline,
        config: QueueConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                pipeline,
                config,
                cancel,
                changed,
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Queues an upload and returns its id without waiting for the work.
    ///
    /// Must be called from within a Tokio runtime, which hosts the drain
    /// loop.
    pub fn submit(&self, payload: UploadPayload) -> Result<JobId, SubmitError> {
        if payload.owner_id.trim().is_empty() {
            return Err(SubmitError::MissingOwner);
        }
        if payload.image.is_empty() {
            return Err(SubmitError::EmptyImage);
        }
        let max = self.inner.config.max_image_size;
        if payload.image.len() > max {
            return Err(SubmitError::ImageTooLarge {
                size: payload.image.len(),
                max,
            });
        }
        if self.inner.cancel.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }

        let (id, length, start) = {
            let mut st = self.inner.state.lock();
            self.inner.evict_expired(&mut st);

            st.next_id += 1;
            let id = JobId(st.next_id);
            st.jobs.insert(id, Job::new(id, payload));
            st.pending.push_back(id);

            let start = !st.draining;
            st.draining = true;
            (id, st.pending.len(), start)
        };

        info!(job_id = %id, queue_length = length, "queued upload");
        self.inner.notify();

        if start {
            tokio::spawn(drain(Arc::clone(&self.inner)));
        }

        Ok(id)
    }

    pub fn status_of(&self, id: JobId) -> Result<JobStatusView, StatusError> {
        let mut st = self.inner.state.lock();
        self.inner.evict_expired(&mut st);
        st.jobs
            .get(&id)
            .map(Job::view)
            .ok_or(StatusError::NotFound(id))
    }

    pub fn queue_status(&self) -> QueueStatus {
        let mut st = self.inner.state.lock();
        self.inner.evict_expired(&mut st);

        let mut counts = StatusCounts::default();
        for job in st.jobs.values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }

        QueueStatus {
            length: st.pending.len(),
            is_processing: st.draining,
            current: st.current,
            counts_by_status: counts,
        }
    }

    /// Suspends until the job reaches a terminal state.
    pub async fn wait_terminal(
        &self,
        id: JobId,
    ) -> Result<JobStatusView, StatusError> {
        let mut changed = self.inner.changed.subscribe();

        loop {
            let view = self.status_of(id)?;
            if view.status.is_terminal() || changed.changed().await.is_err() {
                return Ok(view);
            }
        }
    }
}

impl Inner {
    fn notify(&self) {
        self.changed.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Pops the head job and marks it `Processing`, or marks the loop idle
    /// when nothing is left.
    fn take_next(&self) -> Option<(JobId, UploadPayload, u32)> {
        let mut guard = self.state.lock();
        let st = &mut *guard;

        while let Some(id) = st.pending.pop_front() {
            let Some(job) = st.jobs.get_mut(&id) else {
                warn!(job_id = %id, "queued job vanished, skipping");
                continue;
            };

            job.set_status(JobStatus::Processing);
            let next = (id, job.payload.clone(), job.retry_count);
            st.current = Some(id);
            return Some(next);
        }

        st.draining = false;
        st.current = None;
        None
    }

    /// Records the outcome of one pipeline run.
    fn settle(
        &self,
        id: JobId,
        outcome: Result<UploadResult, StepError>,
        mut budget: RetryBudget,
    ) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.current = None;

        let Some(job) = st.jobs.get_mut(&id) else {
            return;
        };

        let failure = match outcome {
            Ok(result) => {
                job.retry_count = budget.used();
                job.result = Some(result);
                job.set_status(JobStatus::Completed);
                info!(
                    job_id = %id,
                    retries = job.retry_count,
                    "upload completed"
                );
                None
            },
            Err(StepError::Retryable(reason)) => {
                let has_budget = budget.consume();
                job.retry_count = budget.used();

                if has_budget {
                    job.set_status(JobStatus::Pending);
                    warn!(
                        job_id = %id,
                        attempt = job.retry_count,
                        max = budget.max(),
                        %reason,
                        "upload failed, retrying at head of queue"
                    );
                    st.pending.push_front(id);
                    None
                } else {
                    Some(JobFailure::RetryExhausted(reason))
                }
            },
            Err(StepError::Exhausted(e)) => {
                job.retry_count = budget.used();
                Some(JobFailure::RetryExhausted(e.to_string()))
            },
            Err(StepError::Persistence(e)) => {
                job.retry_count = budget.used();
                Some(JobFailure::Persistence(e.to_string()))
            },
        };

        if let Some(job) = st.jobs.get_mut(&id) {
            if let Some(failure) = failure {
                error!(
                    job_id = %id,
                    retries = job.retry_count,
                    %failure,
                    "upload failed"
                );
                job.error = Some(failure);
                job.set_status(JobStatus::Failed);
            }

            if job.status.is_terminal() {
                job.finished_at = Some(Utc::now());
                st.finished.push_back((id, Instant::now()));
            }
        }

        self.evict_expired(st);
    }

    /// Puts an interrupted job back so its state reads consistently.
    fn requeue_interrupted(&self, id: JobId, budget: RetryBudget) {
        let mut st = self.state.lock();
        if let Some(job) = st.jobs.get_mut(&id) {
            job.retry_count = budget.used();
            job.set_status(JobStatus::Pending);
            st.pending.push_front(id);
        }
        st.current = None;
        st.draining = false;
    }

    fn stop_draining(&self) {
        let mut st = self.state.lock();
        st.draining = false;
        st.current = None;
    }

    /// Drops terminal jobs past their TTL, then the oldest ones beyond the
    /// retention cap.
    fn evict_expired(&self, st: &mut QueueState) {
        let policy = &self.config.retention;
        let now = Instant::now();

        while let Some(&(id, finished)) = st.finished.front() {
            let expired = now.saturating_duration_since(finished) >= policy.ttl;
            if !expired && st.finished.len() <= policy.max_retained {
                break;
            }
            st.finished.pop_front();
            st.jobs.remove(&id);
            debug!(job_id = %id, "evicted finished job");
        }
    }
}

/// Processes jobs until the queue is empty or shutdown is requested.
async fn drain(inner: Arc<Inner>) {
    debug!("drain loop started");

    while let Some((id, payload, used)) = inner.take_next() {
        inner.notify();
        info!(job_id = %id, attempt = used + 1, "processing upload");

        let mut budget =
            RetryBudget::resume(used, inner.config.retry.max_retries);
        let outcome = select! {
            outcome = inner.pipeline.run(id, &payload, &mut budget) => {
                Some(outcome)
            },
            _ = inner.cancel.cancelled() => None,
        };

        let Some(outcome) = outcome else {
            warn!(job_id = %id, "shutting down mid-job, upload left pending");
            inner.requeue_interrupted(id, budget);
            inner.notify();
            return;
        };

        inner.settle(id, outcome, budget);
        inner.notify();

        // Paces the steady-state call rate even when no call had to wait for
        // the limiter.
        select! {
            _ = time::sleep(inner.config.inter_job_delay) => {},
            _ = inner.cancel.cancelled() => {
                inner.stop_draining();
                return;
            },
        }
    }

    debug!("drain loop idle");
}
