// src/core/scanner/prober.rs

//! One HTTP exchange against one endpoint, following redirects by hand so
//! every hop can be recorded.

use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::redirect::Policy;
use reqwest::{Client, Method, Proxy, Response, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::core::config::{ScanConfig, load_body};
use crate::core::error::{ProbeError, ScanError};
use crate::core::models::{ProbeUnit, RedirectChain, ResponseSnapshot, Scheme};
use crate::core::scanner::resolver::OverrideResolver;

/// Response bodies are read up to this size; the rest is discarded.
pub const MAX_BODY_SIZE: usize = 2 * 1024 * 1024;

/// The result of a completed exchange (possibly several redirect hops).
#[derive(Debug, Clone)]
pub struct Exchange {
    pub scheme: Scheme,
    pub final_url: Url,
    /// The method the exchange started with; redirects may have switched to GET.
    pub method: Method,
    pub chain: RedirectChain,
    pub snapshot: ResponseSnapshot,
}

impl Exchange {
    pub fn redirect_limit_exceeded(&self) -> bool {
        self.chain.truncated
    }
}

/// Anything able to run one exchange for a unit over a given scheme.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, unit: &ProbeUnit, scheme: Scheme) -> Result<Exchange, ProbeError>;
}

/// Live prober backed by a shared reqwest client.
pub struct HttpProber {
    client: Client,
    method: Method,
    body: Option<Arc<Vec<u8>>>,
    content_type: String,
    max_redirects: usize,
    timeout_ms: u64,
}

impl HttpProber {
    pub fn new(config: &ScanConfig) -> Result<Self, ScanError> {
        let mut builder = Client::builder()
            .use_rustls_tls()
            .redirect(Policy::none())
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .danger_accept_invalid_certs(true)
            .user_agent(config.user_agent.clone())
            .gzip(true)
            .brotli(true)
            .deflate(true);

        if let Some(proxy) = &config.proxy {
            let proxy = Proxy::all(proxy.as_str())
                .map_err(|e| ScanError::config(format!("invalid proxy '{}': {}", proxy, e)))?;
            builder = builder.proxy(proxy);
        }
        if !config.dns.is_empty() {
            builder = builder.dns_resolver(Arc::new(OverrideResolver::new(&config.dns)));
        }

        let client = builder
            .build()
            .map_err(|e| ScanError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            method: config.method.clone(),
            body: load_body(&config.body)?.map(Arc::new),
            content_type: config.content_type.clone(),
            max_redirects: config.max_redirects,
            timeout_ms: config.timeout.as_millis() as u64,
        })
    }

    async fn send(&self, method: &Method, url: &Url, with_body: bool) -> Result<Response, ProbeError> {
        let mut request = self.client.request(method.clone(), url.clone());
        if with_body {
            if let Some(body) = &self.body {
                request = request
                    .header(CONTENT_TYPE, self.content_type.as_str())
                    .body(body.as_ref().clone());
            }
        }
        request.send().await.map_err(|e| classify_error(&e, url, self.timeout_ms))
    }
}

#[async_trait]
impl Probe for HttpProber {
    async fn probe(&self, unit: &ProbeUnit, scheme: Scheme) -> Result<Exchange, ProbeError> {
        let mut url = unit.url(scheme).map_err(|e| ProbeError::Protocol {
            url: unit.to_string(),
            reason: format!("cannot build URL: {}", e),
        })?;
        let mut method = self.method.clone();
        let mut with_body = true;
        let mut chain = RedirectChain::default();

        loop {
            debug!(url = %url, method = %method, "Sending request.");
            let response = self.send(&method, &url, with_body).await?;
            let status = response.status();
            chain.push(url.as_str(), status.as_u16());

            if let Some(next) = redirect_target(&response, &url) {
                if chain.followed() >= self.max_redirects {
                    debug!(url = %url, limit = self.max_redirects, "Redirect limit reached, truncating chain.");
                    chain.truncated = true;
                } else {
                    debug!(from = %url, to = %next, status = status.as_u16(), "Following redirect.");
                    if switches_to_get(status, &method) {
                        method = Method::GET;
                        with_body = false;
                    }
                    url = next;
                    continue;
                }
            }

            let snapshot = read_snapshot(response, &url, self.timeout_ms).await?;
            return Ok(Exchange {
                scheme,
                final_url: url,
                method: self.method.clone(),
                chain,
                snapshot,
            });
        }
    }
}

/// Location of the next hop, if `response` is a redirect that names one.
fn redirect_target(response: &Response, base: &Url) -> Option<Url> {
    if !response.status().is_redirection() {
        return None;
    }
    let location = response.headers().get(LOCATION)?.to_str().ok()?;
    match base.join(location.trim()) {
        Ok(next) if matches!(next.scheme(), "http" | "https") => Some(next),
        Ok(next) => {
            warn!(location = %next, "Ignoring redirect to a non-HTTP scheme.");
            None
        }
        Err(e) => {
            warn!(location, error = %e, "Ignoring unparsable redirect location.");
            None
        }
    }
}

/// 303 always becomes GET; 301/302 do so for anything but GET/HEAD, as browsers do.
fn switches_to_get(status: StatusCode, method: &Method) -> bool {
    match status {
        StatusCode::SEE_OTHER => *method != Method::HEAD,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => *method != Method::GET && *method != Method::HEAD,
        _ => false,
    }
}

async fn read_snapshot(mut response: Response, url: &Url, timeout_ms: u64) -> Result<ResponseSnapshot, ProbeError> {
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let remote_ip = response.remote_addr().map(|addr| addr.ip());

    let mut body = Vec::new();
    let mut body_truncated = false;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| classify_error(&e, url, timeout_ms))?
    {
        let room = MAX_BODY_SIZE - body.len();
        if chunk.len() > room {
            body.extend_from_slice(&chunk[..room]);
            body_truncated = true;
            break;
        }
        body.extend_from_slice(&chunk);
    }

    Ok(ResponseSnapshot {
        status,
        headers,
        body,
        body_truncated,
        remote_ip,
    })
}

/// Maps a reqwest failure onto the probe error taxonomy.
///
/// Only the inner sources are inspected for TLS markers, with the host masked
/// out: the outer message embeds the URL and resolver errors echo the name.
pub(crate) fn classify_error(error: &reqwest::Error, url: &Url, timeout_ms: u64) -> ProbeError {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    let url = url.to_string();
    let causes = source_chain(error);
    let reason = if causes.is_empty() {
        error.to_string()
    } else {
        format!("{}: {}", error, causes)
    };

    if error.is_timeout() {
        return ProbeError::Timeout { url, timeout_ms };
    }
    if error.is_connect() {
        if looks_like_tls(&causes, &host) {
            return ProbeError::Tls { url, reason };
        }
        return ProbeError::Connect { url, reason };
    }
    if looks_like_tls(&causes, &host) {
        return ProbeError::Tls { url, reason };
    }
    ProbeError::Protocol { url, reason }
}

fn source_chain(error: &reqwest::Error) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut source = error.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if parts.last() != Some(&text) {
            parts.push(text);
        }
        source = inner.source();
    }
    parts.join(": ")
}

fn looks_like_tls(causes: &str, host: &str) -> bool {
    let mut causes = causes.to_ascii_lowercase();
    if !host.is_empty() {
        causes = causes.replace(host, "");
    }
    ["tls", "ssl", "certificate", "handshake", "corrupt message", "invalidcontenttype"]
        .iter()
        .any(|needle| causes.contains(needle))
}
