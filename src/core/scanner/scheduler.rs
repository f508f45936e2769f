// src/core/scanner/scheduler.rs

//! Bounded worker pool. Every job runs end-to-end in one slot and produces
//! exactly one result, whether it completes, fails, panics or is cancelled.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::core::config::SchemePolicy;
use crate::core::error::ProbeError;
use crate::core::models::{ProbeResult, ProbeUnit, ResultSource, Scheme};
use crate::core::scanner::enrichment::Enricher;
use crate::core::scanner::prober::Probe;
use crate::core::scanner::scheme::{negotiate, should_fall_back};

/// One kind of job the pool can run.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    type Job: Clone + Send + Sync + 'static;

    async fn run(&self, job: Self::Job) -> ProbeResult;

    /// The result reported for a job that did not run to completion.
    fn failed(&self, job: &Self::Job, error: ProbeError) -> ProbeResult;
}

pub struct Scheduler {
    threads: usize,
}

impl Scheduler {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    /// Runs every job, sending each result to `sink` as it completes.
    /// Returns once all results have been sent.
    pub async fn run<W: Worker>(
        &self,
        jobs: Vec<W::Job>,
        worker: Arc<W>,
        sink: mpsc::Sender<ProbeResult>,
        cancel: CancellationToken,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.threads));
        let mut tasks = JoinSet::new();
        let mut jobs = jobs.into_iter();

        while let Some(job) = jobs.next() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                // Nothing more is dispatched; the remaining jobs still get a result.
                debug!("Dispatch stopped, reporting remaining jobs as cancelled.");
                for job in std::iter::once(job).chain(jobs.by_ref()) {
                    if sink.send(worker.failed(&job, ProbeError::Cancelled)).await.is_err() {
                        break;
                    }
                }
                break;
            };

            let worker = Arc::clone(&worker);
            let sink = sink.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let pending = job.clone();
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => worker.failed(&pending, ProbeError::Cancelled),
                    outcome = AssertUnwindSafe(worker.run(job)).catch_unwind() => match outcome {
                        Ok(result) => result,
                        Err(panic) => {
                            let reason = panic_message(panic.as_ref());
                            error!(reason = %reason, "Worker panicked.");
                            worker.failed(&pending, ProbeError::Worker { reason })
                        }
                    },
                };
                // A closed sink means the consumer went away; the result is dropped.
                let _ = sink.send(result).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task aborted.");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Live probing of one unit: scheme negotiation, attempts under the probe
/// deadline, then enrichment of the first answered attempt.
pub struct ActiveWorker {
    prober: Arc<dyn Probe>,
    enricher: Arc<Enricher>,
    policy: SchemePolicy,
    timeout: Duration,
    method: String,
}

impl ActiveWorker {
    pub fn new(
        prober: Arc<dyn Probe>,
        enricher: Arc<Enricher>,
        policy: SchemePolicy,
        timeout: Duration,
        method: &reqwest::Method,
    ) -> Self {
        Self {
            prober,
            enricher,
            policy,
            timeout,
            method: method.to_string(),
        }
    }

    fn timed_out(&self, unit: &ProbeUnit, scheme: Scheme) -> ProbeError {
        ProbeError::Timeout {
            url: unit.url(scheme).map(|u| u.to_string()).unwrap_or_else(|_| unit.to_string()),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }
}

#[async_trait]
impl Worker for ActiveWorker {
    type Job = ProbeUnit;

    async fn run(&self, unit: ProbeUnit) -> ProbeResult {
        let started = Instant::now();
        let mut last_failure: Option<(Scheme, ProbeError)> = None;

        for scheme in negotiate(&unit, self.policy) {
            debug!(unit = %unit, scheme = %scheme, "Probing.");
            let attempt = tokio::time::timeout(self.timeout, self.prober.probe(&unit, scheme))
                .await
                .unwrap_or_else(|_| Err(self.timed_out(&unit, scheme)));

            match attempt {
                Ok(exchange) => {
                    return self.enricher.finish(&unit, exchange, ResultSource::Active, started).await;
                }
                Err(e) => {
                    debug!(unit = %unit, scheme = %scheme, error = %e, "Attempt failed.");
                    let fall_back = should_fall_back(&e);
                    last_failure = Some((scheme, e));
                    if !fall_back {
                        break;
                    }
                }
            }
        }

        let (scheme, error) = last_failure.map_or(
            (
                unit.scheme,
                ProbeError::Worker {
                    reason: "no scheme to attempt".to_string(),
                },
            ),
            |(scheme, e)| (Some(scheme), e),
        );
        let mut result = ProbeResult::failed(&unit, scheme, &self.method, error);
        result.elapsed_ms = started.elapsed().as_millis() as u64;
        result
    }

    fn failed(&self, unit: &ProbeUnit, error: ProbeError) -> ProbeResult {
        ProbeResult::failed(unit, unit.scheme, &self.method, error)
    }
}
