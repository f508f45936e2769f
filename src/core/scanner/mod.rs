// src/core/scanner/mod.rs

//! The scan engine and its stages.
//!
//! `Engine::new` does all the fallible preparation (target expansion, body
//! and passive file loading, client and adapter construction) so that a
//! started run can no longer fail as a whole: every unit reports exactly one
//! `ProbeResult`, successful or not.

pub mod aggregator;
pub mod asn_resolver;
pub mod enrichment;
pub mod fingerprint_scanner;
pub mod passive;
pub mod prober;
pub mod resolver;
pub mod scheduler;
pub mod scheme;
pub mod screenshot;
pub mod targets;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::config::{ScanConfig, ScanMode};
use crate::core::error::ScanError;
use crate::core::models::{PassiveRecord, ProbeResult, ProbeUnit};
use crate::logging::get_screenshot_dir;

pub use self::aggregator::ResultStream;
use self::asn_resolver::{AsnResolver, CymruAsnResolver};
use self::enrichment::Enricher;
use self::fingerprint_scanner::FingerprintEngine;
use self::passive::ReplayWorker;
use self::prober::{HttpProber, Probe};
use self::scheduler::{ActiveWorker, Scheduler};
use self::screenshot::{RenderServiceCapturer, ScreenshotCapturer};

/// Lower bound on the result channel size, so a slow consumer does not
/// immediately stall small pools.
const MIN_RESULT_BUFFER: usize = 64;

enum Plan {
    Active {
        units: Vec<ProbeUnit>,
        worker: Arc<ActiveWorker>,
    },
    Passive {
        records: Vec<PassiveRecord>,
        worker: Arc<ReplayWorker>,
    },
}

/// One prepared run.
pub struct Engine {
    config: Arc<ScanConfig>,
    plan: Plan,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(config: ScanConfig) -> Result<Self, ScanError> {
        let config = Arc::new(config);
        let features = config.features;

        let plan = match &config.mode {
            ScanMode::Active => {
                let units = targets::expand(&config)?;
                let prober: Arc<dyn Probe> = Arc::new(HttpProber::new(&config)?);
                let asn = features
                    .asn
                    .then(|| Arc::new(CymruAsnResolver::new(&config.dns)) as Arc<dyn AsnResolver>);
                let screenshot = if features.screenshot {
                    build_capturer(&config)
                } else {
                    None
                };
                let enricher = Arc::new(Enricher::online(features, FingerprintEngine::default(), asn, screenshot));
                let worker = ActiveWorker::new(
                    prober,
                    enricher,
                    config.scheme_policy,
                    config.timeout,
                    &config.method,
                );
                Plan::Active {
                    units,
                    worker: Arc::new(worker),
                }
            }
            ScanMode::Passive { response_file } => {
                let records = passive::load_records(response_file)?;
                let enricher = Arc::new(Enricher::offline(features, FingerprintEngine::default()));
                Plan::Passive {
                    records,
                    worker: Arc::new(ReplayWorker::new(enricher)),
                }
            }
        };

        Ok(Self {
            config,
            plan,
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Number of results the run will produce.
    pub fn len(&self) -> usize {
        match &self.plan {
            Plan::Active { units, .. } => units.len(),
            Plan::Passive { records, .. } => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Token that cancels this run. In-flight units report `Cancelled`.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Starts the run on the current Tokio runtime and returns its results
    /// as they complete.
    pub fn stream(self) -> ResultStream {
        let threads = self.config.threads;
        let silent = self.config.silent;
        let total = self.len();
        let (tx, rx) = mpsc::channel(threads.saturating_mul(2).max(MIN_RESULT_BUFFER));
        let guard = self.cancel.clone().drop_guard();
        let cancel = self.cancel;
        let scheduler = Scheduler::new(threads);

        if !silent {
            info!(
                units = total,
                threads,
                passive = self.config.mode.is_passive(),
                "Starting scan."
            );
        }

        tokio::spawn(async move {
            let started = Instant::now();
            match self.plan {
                Plan::Active { units, worker } => scheduler.run(units, worker, tx, cancel).await,
                Plan::Passive { records, worker } => scheduler.run(records, worker, tx, cancel).await,
            }
            if !silent {
                info!(units = total, elapsed_ms = started.elapsed().as_millis() as u64, "Scan finished.");
            }
        });

        ResultStream::new(rx, Some(guard))
    }

    /// Runs to completion and returns every result.
    pub async fn run(self) -> Vec<ProbeResult> {
        self.stream().collect().await
    }
}

fn build_capturer(config: &ScanConfig) -> Option<Arc<dyn ScreenshotCapturer>> {
    let endpoint = config.screenshot_endpoint.clone()?;
    match RenderServiceCapturer::new(endpoint, get_screenshot_dir(), config.timeout) {
        Ok(capturer) => Some(Arc::new(capturer)),
        Err(e) => {
            warn!(error = %e, "Screenshot capture disabled.");
            None
        }
    }
}
