//! Job schedules: per-instance crawl cycles and the lifecycle sweep
//!
//! Ranking refreshes are not scheduled here; they enqueue lazily when a
//! read finds a stale generation, or explicitly via the jobs handle.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::identity::canonical_instance;

use super::{Job, JobsHandle};

/// Spawn the recurring schedules. Each loop exits on the shutdown token.
pub fn spawn(
    handle: JobsHandle,
    config: Arc<Config>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    let crawl_interval = Duration::from_secs(config.crawler.interval_secs.max(10));
    for instance in &config.crawler.instances {
        let instance = canonical_instance(instance);
        let handle = handle.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            // First cycle immediately; the corpus should not wait a full
            // interval after boot.
            handle.enqueue(Job::CrawlInstance { instance: instance.clone() });
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(crawl_interval) => {
                        handle.enqueue(Job::CrawlInstance { instance: instance.clone() });
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        }));
    }

    let sweep_interval = Duration::from_secs(config.jobs.sweep_interval_secs.max(60));
    let sweep_handle = handle.clone();
    let sweep_cancel = cancel.clone();
    tasks.push(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(sweep_interval) => {
                    sweep_handle.enqueue(Job::LifecycleSweep);
                }
                _ = sweep_cancel.cancelled() => return,
            }
        }
    }));

    tasks
}
