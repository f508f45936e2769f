// src/core/models.rs

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use reqwest::Method;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use url::Url;

use crate::core::error::{EnrichmentError, ProbeError};

// --- Probe Units ---

/// Transport scheme of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// One concrete (target, port, scheme) combination to attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProbeUnit {
    /// The raw target string this unit was expanded from.
    pub input: String,
    /// Hostname or IP literal (IPv6 without brackets).
    pub host: String,
    pub port: u16,
    /// `Some` when the target pinned a scheme (written as a URL).
    pub scheme: Option<Scheme>,
    /// Request path and query, always starting with `/`.
    pub path: String,
}

impl ProbeUnit {
    pub fn new(input: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            input: input.into(),
            host: host.into(),
            port,
            scheme: None,
            path: "/".to_string(),
        }
    }

    /// Builds the URL for an attempt over `scheme`. Default ports are elided.
    pub fn url(&self, scheme: Scheme) -> Result<Url, url::ParseError> {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let mut url = Url::parse(&format!("{}://{}:{}", scheme.as_str(), host, self.port))?;
        // Set, never joined: a path starting with `//` must not replace the host.
        match self.path.split_once('?') {
            Some((path, query)) => {
                url.set_path(path);
                url.set_query(Some(query));
            }
            None => url.set_path(&self.path),
        }
        Ok(url)
    }
}

impl fmt::Display for ProbeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Some(scheme) => write!(f, "{}://{}:{}{}", scheme, self.host, self.port, self.path),
            None => write!(f, "{}:{}{}", self.host, self.port, self.path),
        }
    }
}

// --- Redirects ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectHop {
    pub url: String,
    pub status: u16,
}

/// Hops in the order they were received. The last hop is the final response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectChain {
    pub hops: Vec<RedirectHop>,
    /// Set when a further redirect was not followed because of `max_redirects`.
    pub truncated: bool,
}

impl RedirectChain {
    pub fn push(&mut self, url: impl Into<String>, status: u16) {
        self.hops.push(RedirectHop {
            url: url.into(),
            status,
        });
    }

    /// Number of redirects actually followed so far.
    pub fn followed(&self) -> usize {
        self.hops.len().saturating_sub(1)
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }
}

// --- Responses ---

/// Raw response content handed to the fingerprint and enrichment stages.
/// Produced by the live prober or by the passive replayer.
#[derive(Debug, Clone)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub body_truncated: bool,
    pub remote_ip: Option<IpAddr>,
}

/// Serializable summary of the final response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSummary {
    pub status_code: u16,
    pub content_type: Option<String>,
    pub content_length: usize,
    pub title: Option<String>,
    pub server: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub words: usize,
    pub lines: usize,
    pub body_truncated: bool,
}

// --- Fingerprints ---

// A detected technology (e.g. a web server, framework or CMS).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Technology {
    pub name: String,
    pub category: String,
    pub version: Option<String>,
}

/// Technology labels plus content hashes, derived only from response content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub technologies: Vec<Technology>,
    /// SHA-256 of the response body, hex encoded.
    pub body_hash: Option<String>,
    /// SHA-256 of the sorted, lowercased header names.
    pub header_hash: Option<String>,
}

// --- Enrichment ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsnInfo {
    pub number: u32,
    pub prefix: Option<String>,
    pub country: Option<String>,
    pub registry: Option<String>,
    pub name: Option<String>,
}

/// Reference to a rendered screenshot stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screenshot {
    pub url: String,
    pub path: PathBuf,
}

/// Outcome of a best-effort enrichment step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum Enrichment<T> {
    #[default]
    NotRequested,
    Available(T),
    Unavailable { reason: String },
}

impl<T> Enrichment<T> {
    pub fn is_populated(&self) -> bool {
        !matches!(self, Enrichment::NotRequested)
    }

    pub fn available(&self) -> Option<&T> {
        match self {
            Enrichment::Available(value) => Some(value),
            _ => None,
        }
    }
}

impl<T> From<Result<T, EnrichmentError>> for Enrichment<T> {
    fn from(result: Result<T, EnrichmentError>) -> Self {
        match result {
            Ok(value) => Enrichment::Available(value),
            Err(e) => Enrichment::Unavailable {
                reason: e.to_string(),
            },
        }
    }
}

// --- Results ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    Active,
    Passive,
}

/// Outcome for one probe unit (or one passive record).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub input: String,
    pub host: String,
    pub port: u16,
    pub scheme: Option<Scheme>,
    pub url: Option<String>,
    pub ip: Option<IpAddr>,
    pub method: String,
    pub response: Option<ResponseSummary>,
    pub redirect_chain: RedirectChain,
    pub redirect_limit_exceeded: bool,
    pub fingerprint: Option<Fingerprint>,
    pub asn: Enrichment<AsnInfo>,
    pub screenshot: Enrichment<Screenshot>,
    pub error: Option<ProbeError>,
    pub source: ResultSource,
    pub timestamp: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl ProbeResult {
    /// A result for a unit whose probe failed. Enrichment stays `NotRequested`.
    pub fn failed(unit: &ProbeUnit, scheme: Option<Scheme>, method: &str, error: ProbeError) -> Self {
        Self {
            input: unit.input.clone(),
            host: unit.host.clone(),
            port: unit.port,
            scheme,
            url: scheme.and_then(|s| unit.url(s).ok()).map(|u| u.to_string()),
            ip: None,
            method: method.to_string(),
            response: None,
            redirect_chain: RedirectChain::default(),
            redirect_limit_exceeded: false,
            fingerprint: None,
            asn: Enrichment::NotRequested,
            screenshot: Enrichment::NotRequested,
            error: Some(error),
            source: ResultSource::Active,
            timestamp: Utc::now(),
            elapsed_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Identity used to compare result sets independently of arrival order.
    pub fn sort_key(&self) -> (String, u16, String) {
        (self.host.clone(), self.port, self.input.clone())
    }
}

// --- Passive Records ---

/// A previously captured exchange, replayed instead of a live probe.
#[derive(Debug, Clone)]
pub struct PassiveRecord {
    /// 1-based line number in the response file.
    pub line: usize,
    pub url: Url,
    pub scheme: Scheme,
    pub method: Method,
    pub snapshot: ResponseSnapshot,
}
