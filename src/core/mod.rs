// src/core/mod.rs

/// Option parsing and validation into the immutable `ScanConfig`.
pub mod config;

/// Fatal, per-probe and enrichment error types.
pub mod error;

/// Data structures shared by every stage: probe units, responses,
/// fingerprints and the final `ProbeResult`.
pub mod models;

/// The scan engine: target expansion, probing, enrichment and scheduling.
pub mod scanner;
