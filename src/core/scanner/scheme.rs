// src/core/scanner/scheme.rs

//! Scheme negotiation: which schemes to try for a unit, and when to move on.

use crate::core::config::SchemePolicy;
use crate::core::error::ProbeError;
use crate::core::models::{ProbeUnit, Scheme};

/// Ordered schemes to attempt for `unit`. A scheme pinned by the target wins
/// over the policy.
pub fn negotiate(unit: &ProbeUnit, policy: SchemePolicy) -> Vec<Scheme> {
    if let Some(scheme) = unit.scheme {
        return vec![scheme];
    }
    match policy {
        SchemePolicy::Https => vec![Scheme::Https],
        SchemePolicy::Http => vec![Scheme::Http],
        SchemePolicy::Auto => vec![Scheme::Https, Scheme::Http],
    }
}

/// Whether a failed attempt may be retried over the next scheme.
///
/// Only failures where no HTTP response came back qualify. Any received
/// response, whatever its status, ends negotiation.
pub fn should_fall_back(error: &ProbeError) -> bool {
    matches!(
        error,
        ProbeError::Connect { .. } | ProbeError::Tls { .. } | ProbeError::Timeout { .. }
    )
}
