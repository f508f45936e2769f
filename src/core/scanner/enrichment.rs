// src/core/scanner/enrichment.rs

//! Turns a completed exchange into a `ProbeResult` and applies the optional,
//! best-effort enrichment steps to it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use reqwest::header::{CONTENT_TYPE, HeaderMap, SERVER};
use scraper::Html;
use tracing::{debug, warn};

use crate::core::config::Features;
use crate::core::models::{
    AsnInfo, Enrichment, ProbeResult, ProbeUnit, ResponseSnapshot, ResponseSummary, ResultSource, Screenshot,
};
use crate::core::scanner::asn_resolver::AsnResolver;
use crate::core::scanner::fingerprint_scanner::{FingerprintEngine, FingerprintRequest, page_title};
use crate::core::scanner::prober::Exchange;
use crate::core::scanner::screenshot::ScreenshotCapturer;

pub const PASSIVE_MODE_REASON: &str = "disabled in passive mode";

/// An enrichment collaborator, or the reason there is none.
enum Adapter<T: ?Sized> {
    Live(Arc<T>),
    Missing(String),
}

impl<T: ?Sized> Adapter<T> {
    fn from_option(adapter: Option<Arc<T>>, missing: &str) -> Self {
        match adapter {
            Some(a) => Adapter::Live(a),
            None => Adapter::Missing(missing.to_string()),
        }
    }
}

pub struct Enricher {
    features: Features,
    fingerprint_engine: FingerprintEngine,
    asn: Adapter<dyn AsnResolver>,
    screenshot: Adapter<dyn ScreenshotCapturer>,
}

impl Enricher {
    /// Enricher for live runs. A requested step without an adapter reports
    /// itself unavailable on every result.
    pub fn online(
        features: Features,
        fingerprint_engine: FingerprintEngine,
        asn: Option<Arc<dyn AsnResolver>>,
        screenshot: Option<Arc<dyn ScreenshotCapturer>>,
    ) -> Self {
        Self {
            features,
            fingerprint_engine,
            asn: Adapter::from_option(asn, "no ASN resolver configured"),
            screenshot: Adapter::from_option(screenshot, "no screenshot endpoint configured"),
        }
    }

    /// Enricher with no network collaborators at all.
    pub fn offline(features: Features, fingerprint_engine: FingerprintEngine) -> Self {
        Self {
            features,
            fingerprint_engine,
            asn: Adapter::Missing(PASSIVE_MODE_REASON.to_string()),
            screenshot: Adapter::Missing(PASSIVE_MODE_REASON.to_string()),
        }
    }

    /// Finalizes the core result for `exchange`, then enriches it.
    pub async fn finish(
        &self,
        unit: &ProbeUnit,
        exchange: Exchange,
        source: ResultSource,
        started: Instant,
    ) -> ProbeResult {
        let mut result = core_result(unit, &exchange, source);
        result.elapsed_ms = started.elapsed().as_millis() as u64;
        self.enrich(&mut result, &exchange.snapshot).await;
        result
    }

    pub async fn enrich(&self, result: &mut ProbeResult, snapshot: &ResponseSnapshot) {
        if self.features.wants_fingerprint_engine() {
            let request = FingerprintRequest {
                technologies: self.features.tech_detect,
                hashes: self.features.fingerprint,
            };
            result.fingerprint = Some(self.fingerprint_engine.analyze(snapshot, request));
        }

        let (asn, screenshot) = tokio::join!(self.lookup_asn(result), self.capture(result));
        result.asn = asn;
        result.screenshot = screenshot;
    }

    async fn lookup_asn(&self, result: &ProbeResult) -> Enrichment<AsnInfo> {
        if !self.features.asn {
            return Enrichment::NotRequested;
        }
        let resolver = match &self.asn {
            Adapter::Live(resolver) => resolver,
            Adapter::Missing(reason) => return Enrichment::Unavailable { reason: reason.clone() },
        };
        let Some(ip) = result.ip else {
            return Enrichment::Unavailable {
                reason: "no remote address known".to_string(),
            };
        };
        let outcome = resolver.lookup(ip).await;
        if let Err(e) = &outcome {
            warn!(ip = %ip, error = %e, "ASN enrichment unavailable.");
        }
        outcome.into()
    }

    async fn capture(&self, result: &ProbeResult) -> Enrichment<Screenshot> {
        if !self.features.screenshot {
            return Enrichment::NotRequested;
        }
        let capturer = match &self.screenshot {
            Adapter::Live(capturer) => capturer,
            Adapter::Missing(reason) => return Enrichment::Unavailable { reason: reason.clone() },
        };
        let Some(url) = result.url.as_deref() else {
            return Enrichment::Unavailable {
                reason: "no URL to render".to_string(),
            };
        };
        let outcome = capturer.capture(url).await;
        match &outcome {
            Ok(shot) => debug!(url, path = %shot.path.display(), "Screenshot captured."),
            Err(e) => warn!(url, error = %e, "Screenshot enrichment unavailable."),
        }
        outcome.into()
    }
}

/// The result fields derived from the exchange alone, enrichment untouched.
pub fn core_result(unit: &ProbeUnit, exchange: &Exchange, source: ResultSource) -> ProbeResult {
    ProbeResult {
        input: unit.input.clone(),
        host: unit.host.clone(),
        port: unit.port,
        scheme: Some(exchange.scheme),
        url: Some(exchange.final_url.to_string()),
        ip: exchange.snapshot.remote_ip,
        method: exchange.method.to_string(),
        response: Some(summarize(&exchange.snapshot)),
        redirect_chain: exchange.chain.clone(),
        redirect_limit_exceeded: exchange.redirect_limit_exceeded(),
        fingerprint: None,
        asn: Enrichment::NotRequested,
        screenshot: Enrichment::NotRequested,
        error: None,
        source,
        timestamp: Utc::now(),
        elapsed_ms: 0,
    }
}

pub fn summarize(snapshot: &ResponseSnapshot) -> ResponseSummary {
    let body = String::from_utf8_lossy(&snapshot.body);
    let content_type = header_text(&snapshot.headers, CONTENT_TYPE.as_str());
    let title = if looks_like_html(content_type.as_deref(), &body) {
        page_title(&Html::parse_document(&body))
    } else {
        None
    };

    let mut headers = BTreeMap::new();
    for name in snapshot.headers.keys() {
        if let Some(value) = header_text(&snapshot.headers, name.as_str()) {
            headers.insert(name.as_str().to_ascii_lowercase(), value);
        }
    }

    ResponseSummary {
        status_code: snapshot.status,
        content_type,
        content_length: snapshot.body.len(),
        title,
        server: header_text(&snapshot.headers, SERVER.as_str()),
        headers,
        words: body.split_whitespace().count(),
        lines: body.lines().count(),
        body_truncated: snapshot.body_truncated,
    }
}

/// All values of `name`, joined. Non-UTF-8 bytes are replaced.
fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    let values: Vec<String> = headers
        .get_all(name)
        .iter()
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .collect();
    (!values.is_empty()).then(|| values.join(", "))
}

fn looks_like_html(content_type: Option<&str>, body: &str) -> bool {
    match content_type {
        Some(ct) => ct.to_ascii_lowercase().contains("html"),
        None => body.trim_start().starts_with('<'),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::EnrichmentError;
    use crate::core::models::{RedirectChain, Scheme};
    use async_trait::async_trait;
    use reqwest::Method;
    use reqwest::header::HeaderValue;
    use std::net::IpAddr;
    use url::Url;

    struct FixedAsn;

    #[async_trait]
    impl AsnResolver for FixedAsn {
        async fn lookup(&self, _ip: IpAddr) -> Result<AsnInfo, EnrichmentError> {
            Ok(AsnInfo {
                number: 64500,
                prefix: Some("192.0.2.0/24".to_string()),
                country: None,
                registry: None,
                name: Some("EXAMPLE".to_string()),
            })
        }
    }

    struct BrokenCapturer;

    #[async_trait]
    impl ScreenshotCapturer for BrokenCapturer {
        async fn capture(&self, _url: &str) -> Result<Screenshot, EnrichmentError> {
            Err(EnrichmentError::RenderTimeout { timeout_ms: 30 })
        }
    }

    fn snapshot() -> ResponseSnapshot {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
        headers.insert(SERVER, HeaderValue::from_static("nginx/1.25.3"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));
        ResponseSnapshot {
            status: 200,
            headers,
            body: b"<html><head><title> Hello\n World </title></head>\n<body>one two</body></html>".to_vec(),
            body_truncated: false,
            remote_ip: Some("192.0.2.10".parse().unwrap()),
        }
    }

    fn exchange() -> Exchange {
        let url = Url::parse("https://a.test/").unwrap();
        let mut chain = RedirectChain::default();
        chain.push(url.as_str(), 200);
        Exchange {
            scheme: Scheme::Https,
            final_url: url,
            method: Method::GET,
            chain,
            snapshot: snapshot(),
        }
    }

    fn unit() -> ProbeUnit {
        ProbeUnit::new("a.test", "a.test", 443)
    }

    #[test]
    fn test_summarize() {
        let summary = summarize(&snapshot());
        assert_eq!(summary.status_code, 200);
        assert_eq!(summary.title.as_deref(), Some("Hello World"));
        assert_eq!(summary.server.as_deref(), Some("nginx/1.25.3"));
        assert_eq!(summary.headers.get("set-cookie").map(String::as_str), Some("a=1, b=2"));
        assert_eq!(summary.lines, 2);
        assert_eq!(summary.content_length, snapshot().body.len());
    }

    #[test]
    fn test_summarize_skips_title_for_non_html() {
        let mut snap = snapshot();
        snap.headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        snap.body = br#"{"title": "<title>x</title>"}"#.to_vec();
        assert_eq!(summarize(&snap).title, None);
    }

    #[tokio::test]
    async fn test_no_features_means_nothing_requested() {
        let enricher = Enricher::offline(Features::default(), FingerprintEngine::default());
        let result = enricher
            .finish(&unit(), exchange(), ResultSource::Active, Instant::now())
            .await;
        assert!(result.is_success());
        assert!(result.fingerprint.is_none());
        assert_eq!(result.asn, Enrichment::NotRequested);
        assert_eq!(result.screenshot, Enrichment::NotRequested);
        assert_eq!(result.redirect_chain.len(), 1);
    }

    #[tokio::test]
    async fn test_offline_marks_network_steps_unavailable() {
        let features = Features {
            asn: true,
            screenshot: true,
            tech_detect: true,
            ..Default::default()
        };
        let enricher = Enricher::offline(features, FingerprintEngine::default());
        let result = enricher
            .finish(&unit(), exchange(), ResultSource::Passive, Instant::now())
            .await;

        let reason = PASSIVE_MODE_REASON.to_string();
        assert_eq!(result.asn, Enrichment::Unavailable { reason: reason.clone() });
        assert_eq!(result.screenshot, Enrichment::Unavailable { reason });
        let fingerprint = result.fingerprint.unwrap();
        assert!(fingerprint.technologies.iter().any(|t| t.name == "Nginx"));
        assert!(fingerprint.body_hash.is_none());
    }

    #[tokio::test]
    async fn test_failures_degrade_only_their_field() {
        let features = Features {
            asn: true,
            screenshot: true,
            fingerprint: true,
            ..Default::default()
        };
        let enricher = Enricher::online(
            features,
            FingerprintEngine::default(),
            Some(Arc::new(FixedAsn)),
            Some(Arc::new(BrokenCapturer)),
        );
        let result = enricher
            .finish(&unit(), exchange(), ResultSource::Active, Instant::now())
            .await;

        assert!(result.is_success());
        assert_eq!(result.asn.available().map(|a| a.number), Some(64500));
        assert!(matches!(result.screenshot, Enrichment::Unavailable { .. }));
        let fingerprint = result.fingerprint.unwrap();
        assert!(fingerprint.technologies.is_empty());
        assert!(fingerprint.body_hash.is_some());
    }

    #[tokio::test]
    async fn test_missing_screenshot_endpoint() {
        let features = Features {
            screenshot: true,
            ..Default::default()
        };
        let enricher = Enricher::online(features, FingerprintEngine::default(), None, None);
        let mut result = core_result(&unit(), &exchange(), ResultSource::Active);
        enricher.enrich(&mut result, &snapshot()).await;
        assert_eq!(
            result.screenshot,
            Enrichment::Unavailable {
                reason: "no screenshot endpoint configured".to_string()
            }
        );
    }
}
