// src/core/config.rs

//! Run configuration.
//!
//! `ScanOptions` is the loose option bag accepted by the entry points (either
//! field by field or deserialized from a config object). `ScanConfig` is the
//! validated, immutable form every other component reads from. The only way
//! from one to the other is `ScanConfig::try_from`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use url::Url;

use crate::core::error::ScanError;
use crate::core::scanner::targets::parse_dns_overrides;

pub const DEFAULT_PORTS: &[u16] = &[80, 443];
pub const DEFAULT_THREADS: usize = 50;
pub const DEFAULT_TIMEOUT_SECS: f64 = 10.0;
/// Upper bound on `timeout`; anything longer is a configuration mistake.
pub const MAX_TIMEOUT_SECS: f64 = 3600.0;
pub const DEFAULT_MAX_REDIRECTS: usize = 10;
pub const DEFAULT_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Environment variable consulted when `screenshot_endpoint` is not set.
pub const SCREENSHOT_ENDPOINT_ENV: &str = "HPROBE_SCREENSHOT_ENDPOINT";

/// Which schemes to attempt for units that do not pin one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum SchemePolicy {
    /// HTTPS first, HTTP only if HTTPS fails below the HTTP layer.
    #[default]
    Auto,
    Http,
    Https,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
enum ModeKind {
    Active,
    Passive,
}

/// Live probing, or replay of captured responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanMode {
    Active,
    Passive { response_file: PathBuf },
}

impl ScanMode {
    pub fn is_passive(&self) -> bool {
        matches!(self, ScanMode::Passive { .. })
    }
}

/// Where the request body comes from. Both sources at once cannot be expressed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RequestBody {
    #[default]
    NoBody,
    Literal(Vec<u8>),
    FromFile(PathBuf),
}

/// Optional per-result work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    pub asn: bool,
    pub tech_detect: bool,
    pub fingerprint: bool,
    pub screenshot: bool,
    pub common_ports: bool,
}

impl Features {
    pub fn wants_fingerprint_engine(&self) -> bool {
        self.tech_detect || self.fingerprint
    }
}

/// Raw options as supplied by the calling layer. Every key is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanOptions {
    pub target: Option<String>,
    pub targets: Vec<String>,
    pub ports: Vec<u16>,
    pub threads: usize,
    /// Seconds.
    pub timeout: f64,
    pub max_redirects: usize,
    pub methods: String,
    pub scheme_policy: String,
    pub user_agent: Option<String>,
    pub asn: bool,
    pub tech_detect: bool,
    pub fingerprint: bool,
    pub screenshot: bool,
    pub common_ports: bool,
    pub silent: bool,
    pub dns: Vec<String>,
    pub proxy: Option<String>,
    pub post_data: Option<String>,
    pub post_file: Option<PathBuf>,
    pub content_type: String,
    pub mode: String,
    pub response_file: Option<PathBuf>,
    pub screenshot_endpoint: Option<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            target: None,
            targets: Vec::new(),
            ports: DEFAULT_PORTS.to_vec(),
            threads: DEFAULT_THREADS,
            timeout: DEFAULT_TIMEOUT_SECS,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            methods: "GET".to_string(),
            scheme_policy: SchemePolicy::Auto.to_string(),
            user_agent: None,
            asn: false,
            tech_detect: false,
            fingerprint: false,
            screenshot: false,
            common_ports: false,
            silent: false,
            dns: Vec::new(),
            proxy: None,
            post_data: None,
            post_file: None,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            mode: "active".to_string(),
            response_file: None,
            screenshot_endpoint: None,
        }
    }
}

impl ScanOptions {
    /// Reads options from a config object (a JSON map).
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ScanError> {
        if !value.is_object() {
            return Err(ScanError::config("configuration must be an object"));
        }
        ScanOptions::deserialize(value).map_err(|e| ScanError::config(e.to_string()))
    }
}

/// Validated run configuration. Built once per run, never mutated.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub(crate) targets: Vec<String>,
    pub(crate) ports: Vec<u16>,
    pub(crate) threads: usize,
    pub(crate) timeout: Duration,
    pub(crate) max_redirects: usize,
    pub(crate) method: Method,
    pub(crate) scheme_policy: SchemePolicy,
    pub(crate) user_agent: String,
    pub(crate) features: Features,
    pub(crate) dns: Vec<SocketAddr>,
    pub(crate) proxy: Option<Url>,
    pub(crate) body: RequestBody,
    pub(crate) content_type: String,
    pub(crate) mode: ScanMode,
    pub(crate) silent: bool,
    pub(crate) screenshot_endpoint: Option<Url>,
}

impl ScanConfig {
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn scheme_policy(&self) -> SchemePolicy {
        self.scheme_policy
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    pub fn mode(&self) -> &ScanMode {
        &self.mode
    }

    pub fn silent(&self) -> bool {
        self.silent
    }
}

impl TryFrom<ScanOptions> for ScanConfig {
    type Error = ScanError;

    fn try_from(options: ScanOptions) -> Result<Self, Self::Error> {
        let mut targets = options.targets;
        if let Some(target) = options.target {
            targets.insert(0, target);
        }

        if options.threads == 0 {
            return Err(ScanError::config("threads must be at least 1"));
        }
        if !options.timeout.is_finite() || options.timeout <= 0.0 || options.timeout > MAX_TIMEOUT_SECS {
            return Err(ScanError::config(format!(
                "timeout must be between 0 and {} seconds, got {}",
                MAX_TIMEOUT_SECS, options.timeout
            )));
        }
        let timeout = Duration::try_from_secs_f64(options.timeout)
            .map_err(|e| ScanError::config(format!("invalid timeout {}: {}", options.timeout, e)))?;
        if options.ports.contains(&0) {
            return Err(ScanError::config("port 0 is not a valid probe port"));
        }

        let method = parse_method(&options.methods)?;
        let scheme_policy = SchemePolicy::from_str(options.scheme_policy.trim()).map_err(|_| {
            ScanError::config(format!(
                "unknown scheme_policy '{}', expected Auto, Http or Https",
                options.scheme_policy
            ))
        })?;

        let body = match (options.post_data, options.post_file) {
            (Some(_), Some(_)) => {
                return Err(ScanError::config("post_data and post_file are mutually exclusive"));
            }
            (Some(data), None) => RequestBody::Literal(data.into_bytes()),
            (None, Some(path)) => RequestBody::FromFile(path),
            (None, None) => RequestBody::NoBody,
        };

        let mode_kind = ModeKind::from_str(options.mode.trim()).map_err(|_| {
            ScanError::config(format!("unknown mode '{}', expected active or passive", options.mode))
        })?;
        let mode = match (mode_kind, options.response_file) {
            (ModeKind::Passive, Some(response_file)) => ScanMode::Passive { response_file },
            (ModeKind::Passive, None) => {
                return Err(ScanError::config("passive mode requires response_file"));
            }
            (ModeKind::Active, Some(_)) => {
                return Err(ScanError::config("response_file is only valid in passive mode"));
            }
            (ModeKind::Active, None) => ScanMode::Active,
        };

        let dns = parse_dns_overrides(&options.dns)?;
        let proxy = options.proxy.as_deref().map(parse_proxy).transpose()?;

        let endpoint = options
            .screenshot_endpoint
            .or_else(|| std::env::var(SCREENSHOT_ENDPOINT_ENV).ok())
            .filter(|s| !s.trim().is_empty());
        let screenshot_endpoint = endpoint
            .as_deref()
            .map(|raw| {
                Url::parse(raw.trim())
                    .map_err(|e| ScanError::config(format!("invalid screenshot_endpoint '{}': {}", raw, e)))
            })
            .transpose()?;

        let user_agent = options
            .user_agent
            .filter(|ua| !ua.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

        Ok(ScanConfig {
            targets,
            ports: options.ports,
            threads: options.threads,
            timeout,
            max_redirects: options.max_redirects,
            method,
            scheme_policy,
            user_agent,
            features: Features {
                asn: options.asn,
                tech_detect: options.tech_detect,
                fingerprint: options.fingerprint,
                screenshot: options.screenshot,
                common_ports: options.common_ports,
            },
            dns,
            proxy,
            body,
            content_type: options.content_type,
            mode,
            silent: options.silent,
            screenshot_endpoint,
        })
    }
}

fn parse_method(raw: &str) -> Result<Method, ScanError> {
    let name = raw.trim().to_ascii_uppercase();
    if name.is_empty() {
        return Err(ScanError::config("methods must name an HTTP method"));
    }
    if name.contains(',') {
        return Err(ScanError::config(format!("only one HTTP method is supported, got '{}'", raw)));
    }
    Method::from_bytes(name.as_bytes())
        .map_err(|_| ScanError::config(format!("invalid HTTP method '{}'", raw)))
}

fn parse_proxy(raw: &str) -> Result<Url, ScanError> {
    let url = Url::parse(raw.trim()).map_err(|e| ScanError::config(format!("invalid proxy '{}': {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" | "socks5" | "socks5h" => Ok(url),
        other => Err(ScanError::config(format!("unsupported proxy scheme '{}'", other))),
    }
}

/// Reads the body file named by `RequestBody::FromFile` once, at engine start.
pub(crate) fn load_body(body: &RequestBody) -> Result<Option<Vec<u8>>, ScanError> {
    match body {
        RequestBody::NoBody => Ok(None),
        RequestBody::Literal(bytes) => Ok(Some(bytes.clone())),
        RequestBody::FromFile(path) => read_body_file(path).map(Some),
    }
}

fn read_body_file(path: &Path) -> Result<Vec<u8>, ScanError> {
    std::fs::read(path)
        .map_err(|e| ScanError::config(format!("cannot read post_file {}: {}", path.display(), e)))
}
