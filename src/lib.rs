// src/lib.rs

//! HTTP(S) reconnaissance engine.
//!
//! Expands targets into (host, port, scheme) units, probes them over a
//! bounded worker pool, follows redirect chains and optionally enriches each
//! live endpoint with technology fingerprints, ASN ownership and screenshots.
//! Captured responses can be replayed instead of probing (passive mode).
//!
//! Four entry points share one engine: keyword options or a config object,
//! each in a blocking and an async flavour.
//!
//! ```no_run
//! use hprobe::{ScanOptions, scan_target};
//!
//! let results = scan_target(ScanOptions {
//!     target: Some("example.com".into()),
//!     ports: vec![80, 443, 8080],
//!     tech_detect: true,
//!     ..Default::default()
//! })?;
//! for result in results.iter().filter(|r| r.is_success()) {
//!     println!("{} {:?}", result.url.as_deref().unwrap_or("-"), result.response.as_ref().map(|r| r.status_code));
//! }
//! # Ok::<(), hprobe::ScanError>(())
//! ```

pub mod core;
pub mod logging;

pub use crate::core::config::{ScanConfig, ScanMode, ScanOptions, SchemePolicy};
pub use crate::core::error::{EnrichmentError, ProbeError, ScanError};
pub use crate::core::models::{
    AsnInfo, Enrichment, Fingerprint, ProbeResult, RedirectChain, RedirectHop, ResponseSummary, ResultSource, Scheme,
    Screenshot, Technology,
};
pub use crate::core::scanner::{Engine, ResultStream};

/// Scans with keyword options and blocks until every unit has reported.
///
/// Must not be called from inside a Tokio runtime; use
/// [`scan_target_async`] there.
pub fn scan_target(options: ScanOptions) -> Result<Vec<ProbeResult>, ScanError> {
    runtime()?.block_on(scan_target_async(options))
}

/// Blocking scan driven by a config object (a JSON map of option names).
pub fn scan_target_with_config(config: &serde_json::Value) -> Result<Vec<ProbeResult>, ScanError> {
    let options = ScanOptions::from_value(config)?;
    scan_target(options)
}

pub async fn scan_target_async(options: ScanOptions) -> Result<Vec<ProbeResult>, ScanError> {
    let config = ScanConfig::try_from(options)?;
    Ok(Engine::new(config)?.run().await)
}

pub async fn scan_target_with_config_async(config: &serde_json::Value) -> Result<Vec<ProbeResult>, ScanError> {
    let options = ScanOptions::from_value(config)?;
    scan_target_async(options).await
}

fn runtime() -> Result<tokio::runtime::Runtime, ScanError> {
    Ok(tokio::runtime::Builder::new_multi_thread().enable_all().build()?)
}
