//! Background maintenance tasks
//!
//! Compaction and coalescing run as tokio tasks on fixed intervals. The
//! tasks only hold a weak reference to the cache; they stop on the
//! shutdown signal, when the cache is dropped, or once it is closed.
//! Every tick is counted under the task's name in the cache metrics; a
//! failed tick is logged and the loop carries on.

use super::cache::DirectCache;
use super::compaction::CompactionDriver;
use crate::error::Result;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Running maintenance tasks of one cache
pub(crate) struct Maintenance {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Maintenance {
    /// Spawn the enabled loops on the current tokio runtime
    pub(crate) fn spawn(cache: &Arc<DirectCache>) -> Self {
        let (shutdown, signal) = watch::channel(false);
        let config = cache.config();
        let mut tasks = Vec::new();

        if config.compaction_enabled {
            let driver = Arc::new(CompactionDriver::new());
            tasks.push(spawn_loop(
                "compaction",
                config.compaction_tick(),
                Arc::downgrade(cache),
                signal.clone(),
                move |cache| {
                    if let Some(report) = driver.run_once(cache)? {
                        debug!(buffer = report.buffer, moved = report.moved, "Compaction tick done");
                    }
                    Ok(())
                },
            ));
        }

        if config.coalesce_enabled {
            tasks.push(spawn_loop(
                "coalesce",
                config.coalesce_interval(),
                Arc::downgrade(cache),
                signal,
                |cache| cache.coalesce().map(|_| ()),
            ));
        }

        info!(cache = cache.name(), tasks = tasks.len(), "Maintenance tasks started");
        Self { shutdown, tasks }
    }

    /// Signal every loop and wait for all of them to finish
    pub(crate) async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Maintenance task ended abnormally");
            }
        }
    }
}

fn spawn_loop<F>(
    name: &'static str,
    period: Duration,
    cache: Weak<DirectCache>,
    mut signal: watch::Receiver<bool>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn(&DirectCache) -> Result<()> + Send + Sync + 'static,
{
    let job = Arc::new(job);

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = signal.changed() => {
                    if changed.is_err() || *signal.borrow() {
                        break;
                    }
                }
            }

            let Some(cache) = cache.upgrade() else {
                break;
            };
            if !cache.is_running() {
                break;
            }

            let job = Arc::clone(&job);
            let tick = move || {
                let started = Instant::now();
                let result = job(&cache);
                cache.metrics().record(name, started.elapsed(), &result);
                result
            };
            match tokio::task::spawn_blocking(tick).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = name, error = %e, "Maintenance tick failed"),
                Err(e) => warn!(task = name, error = %e, "Maintenance tick panicked"),
            }
        }

        debug!(task = name, "Maintenance loop stopped");
    })
}
