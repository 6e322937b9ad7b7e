//! Background job runner
//!
//! One queue drives three job classes: ranking refreshes, crawl cycles, and
//! the lifecycle sweep. Delivery is at-least-once and every worker is
//! idempotent. Duplicate enqueues collapse on the job's idempotency key
//! while it is pending or running. Retries use exponential backoff with
//! jitter under an explicit retry budget; validation and access errors are
//! never retried. Jobs that exhaust the budget land in a bounded
//! dead-letter buffer.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::crawler::Crawler;
use crate::error::{Error, Result};
use crate::identity::UserAlias;
use crate::ranking::RankingService;

pub mod scheduler;

/// Worker tasks consuming the queue
const WORKER_COUNT: usize = 4;

/// A background job
#[derive(Debug, Clone)]
pub enum Job {
    /// Regenerate rankings for one alias
    RankingRefresh {
        /// Alias whose generation is stale
        alias: UserAlias,
    },
    /// Crawl one instance
    CrawlInstance {
        /// Canonical instance name
        instance: String,
    },
    /// Expire stale posts and opt-out entries
    LifecycleSweep,
}

impl Job {
    /// Key under which duplicate enqueues collapse
    pub fn idempotency_key(&self) -> String {
        match self {
            Job::RankingRefresh { alias } => format!("refresh:{alias}"),
            Job::CrawlInstance { instance } => format!("crawl:{instance}"),
            Job::LifecycleSweep => "sweep".to_string(),
        }
    }

    /// Job class label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Job::RankingRefresh { .. } => "ranking_refresh",
            Job::CrawlInstance { .. } => "crawl_instance",
            Job::LifecycleSweep => "lifecycle_sweep",
        }
    }
}

/// A job that exhausted its retry budget
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Job class
    pub kind: &'static str,
    /// Idempotency key
    pub key: String,
    /// Final error
    pub error: String,
    /// When the job was given up on
    pub failed_at: DateTime<Utc>,
}

/// Everything workers need to execute jobs
pub struct JobContext {
    /// Ranking cache front
    pub rankings: RankingService,
    /// Crawler
    pub crawler: Arc<Crawler>,
    /// Frozen configuration
    pub config: Arc<Config>,
}

/// Queue handle held by the application state. Cheap to clone.
#[derive(Clone)]
pub struct JobsHandle {
    sender: mpsc::Sender<Job>,
    pending: Arc<DashMap<String, ()>>,
    dead_letters: Arc<Mutex<VecDeque<DeadLetter>>>,
    dead_letter_capacity: usize,
}

impl JobsHandle {
    /// Enqueue a job. Returns `false` when a job with the same idempotency
    /// key is already pending or running, or the queue is saturated;
    /// duplicates drop rather than queue.
    pub fn enqueue(&self, job: Job) -> bool {
        let key = job.idempotency_key();
        if self.pending.insert(key.clone(), ()).is_some() {
            tracing::debug!(kind = job.kind(), key, "duplicate enqueue collapsed");
            return false;
        }
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(e) => {
                self.pending.remove(&key);
                tracing::warn!(key, error = %e, "job queue saturated; dropping");
                false
            }
        }
    }

    /// Snapshot of the dead-letter buffer
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .map(|dl| dl.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of dead-lettered jobs
    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.lock().map(|dl| dl.len()).unwrap_or(0)
    }

    fn bury(&self, job: &Job, error: &Error) {
        let Ok(mut letters) = self.dead_letters.lock() else {
            return;
        };
        if letters.len() >= self.dead_letter_capacity {
            letters.pop_front();
        }
        letters.push_back(DeadLetter {
            kind: job.kind(),
            key: job.idempotency_key(),
            error: error.to_string(),
            failed_at: Utc::now(),
        });
    }
}

/// The runner: spawns workers, owns the global shutdown drain
pub struct JobRunner {
    handle: JobsHandle,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    context: Arc<JobContext>,
    cancel: CancellationToken,
}

/// Build the queue, returning the enqueue handle and the runner
pub fn channel(context: JobContext, cancel: CancellationToken) -> (JobsHandle, JobRunner) {
    let config = &context.config.jobs;
    let (sender, receiver) = mpsc::channel(config.queue_depth.max(1));

    let handle = JobsHandle {
        sender,
        pending: Arc::new(DashMap::new()),
        dead_letters: Arc::new(Mutex::new(VecDeque::new())),
        dead_letter_capacity: config.dead_letter_capacity.max(1),
    };

    let runner = JobRunner {
        handle: handle.clone(),
        receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        context: Arc::new(context),
        cancel,
    };

    (handle, runner)
}

impl JobRunner {
    /// Spawn the worker pool. Workers drain the queue cooperatively and
    /// exit once the shutdown token fires and the queue is empty.
    pub fn spawn_workers(self) -> Vec<JoinHandle<()>> {
        (0..WORKER_COUNT)
            .map(|worker| {
                let handle = self.handle.clone();
                let receiver = self.receiver.clone();
                let context = self.context.clone();
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut receiver = receiver.lock().await;
                            tokio::select! {
                                job = receiver.recv() => job,
                                _ = cancel.cancelled() => receiver.try_recv().ok(),
                            }
                        };
                        let Some(job) = job else {
                            if cancel.is_cancelled() {
                                tracing::debug!(worker, "job worker drained; exiting");
                                return;
                            }
                            // Channel closed without shutdown: stop quietly.
                            return;
                        };
                        process(&handle, &context, &cancel, job).await;
                    }
                })
            })
            .collect()
    }
}

async fn process(
    handle: &JobsHandle,
    context: &JobContext,
    cancel: &CancellationToken,
    job: Job,
) {
    let key = job.idempotency_key();
    let budget = context.config.jobs.max_retries;
    let base_delay = context.config.jobs.retry_base_delay_ms;
    let deadline = Duration::from_secs(context.config.jobs.job_timeout_secs.max(1));

    let mut attempt: u32 = 0;
    loop {
        let outcome = tokio::time::timeout(deadline, execute(context, cancel, &job))
            .await
            .unwrap_or(Err(Error::Timeout));

        match outcome {
            Ok(()) => {
                tracing::debug!(kind = job.kind(), key, attempt, "job finished");
                break;
            }
            Err(e) if is_retryable(&e) && attempt < budget && !cancel.is_cancelled() => {
                attempt += 1;
                let delay = retry_delay(base_delay, attempt);
                tracing::warn!(
                    kind = job.kind(),
                    key,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "job failed; retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        handle.bury(&job, &e);
                        break;
                    }
                }
            }
            Err(e) => {
                tracing::error!(
                    kind = job.kind(),
                    key,
                    attempt,
                    error = %e,
                    "job failed permanently; dead-lettering"
                );
                handle.bury(&job, &e);
                break;
            }
        }
    }

    handle.pending.remove(&key);
}

async fn execute(context: &JobContext, cancel: &CancellationToken, job: &Job) -> Result<()> {
    match job {
        Job::RankingRefresh { alias } => {
            context.rankings.refresh(alias).await.map(|_| ())
        }
        Job::CrawlInstance { instance } => {
            // Instance-scoped token: degrading health or shutdown cancels
            // just this crawl.
            let scoped = cancel.child_token();
            context
                .crawler
                .crawl_instance(instance, &scoped)
                .await
                .map(|_| ())
        }
        Job::LifecycleSweep => context.crawler.lifecycle_sweep().await.map(|_| ()),
    }
}

/// Explicit transient-vs-permanent classification. Validation and access
/// errors never retry.
fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Store(e) => e.is_retriable(),
        Error::Timeout => true,
        Error::Upstream { status, .. } => *status == 0 || *status == 429 || *status >= 500,
        Error::RankingUnavailable(_) => true,
        Error::Validation { .. } | Error::AuthRequired | Error::NotFound(_) => false,
        _ => false,
    }
}

fn retry_delay(base_ms: u64, attempt: u32) -> Duration {
    let base = base_ms.max(50);
    let exp = base.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1).min(8)));
    let jitter = rand::rng().random_range(0..=base / 2);
    Duration::from_millis(exp.min(60_000) + jitter)
}
