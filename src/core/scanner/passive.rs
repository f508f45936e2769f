// src/core/scanner/passive.rs

//! Replay of previously captured responses instead of live probing.
//!
//! The response file is JSON Lines, one capture per line:
//! `{"url": "...", "method": "GET", "ip": "192.0.2.1", "response": "HTTP/1.1 200 OK\r\n..."}`.
//! `method` and `ip` are optional.

use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, TRANSFER_ENCODING};
use serde::Deserialize;
use tracing::debug;
use url::{Host, Position, Url};

use crate::core::error::{ProbeError, ScanError};
use crate::core::models::{PassiveRecord, ProbeResult, ProbeUnit, RedirectChain, ResponseSnapshot, ResultSource, Scheme};
use crate::core::scanner::enrichment::Enricher;
use crate::core::scanner::prober::{Exchange, MAX_BODY_SIZE};
use crate::core::scanner::scheduler::Worker;

#[derive(Debug, Deserialize)]
struct CapturedRecord {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    ip: Option<String>,
    response: String,
}

/// Reads and validates every record up front. Any bad line fails the run.
pub fn load_records(path: &Path) -> Result<Vec<PassiveRecord>, ScanError> {
    let content = std::fs::read_to_string(path).map_err(|e| ScanError::passive(path, e.to_string()))?;

    let mut records = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let line_no = index + 1;
        let record = parse_record(line, line_no)
            .map_err(|reason| ScanError::passive(path, format!("line {}: {}", line_no, reason)))?;
        records.push(record);
    }

    debug!(path = %path.display(), records = records.len(), "Loaded passive response file.");
    Ok(records)
}

fn parse_record(line: &str, line_no: usize) -> Result<PassiveRecord, String> {
    let raw: CapturedRecord = serde_json::from_str(line).map_err(|e| format!("invalid JSON: {}", e))?;

    let url = Url::parse(raw.url.trim()).map_err(|e| format!("invalid url '{}': {}", raw.url, e))?;
    let scheme = Scheme::from_str(url.scheme()).map_err(|_| format!("unsupported scheme in '{}'", url))?;
    if url.host().is_none() {
        return Err(format!("url '{}' has no host", url));
    }

    let method = match raw.method.as_deref().map(str::trim) {
        None | Some("") => Method::GET,
        Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes()).map_err(|_| format!("invalid method '{}'", m))?,
    };

    let mut snapshot = parse_raw_response(raw.response.as_bytes())?;
    snapshot.remote_ip = raw
        .ip
        .as_deref()
        .map(|ip| IpAddr::from_str(ip.trim()).map_err(|_| format!("invalid ip '{}'", ip)))
        .transpose()?;

    Ok(PassiveRecord {
        line: line_no,
        url,
        scheme,
        method,
        snapshot,
    })
}

/// Parses a raw HTTP/1.x response: status line, headers, blank line, body.
pub fn parse_raw_response(raw: &[u8]) -> Result<ResponseSnapshot, String> {
    let (head, body) = split_head(raw).ok_or("missing blank line after headers")?;
    let head = std::str::from_utf8(head).map_err(|_| "response head is not valid UTF-8")?;
    let mut lines = head.split('\n').map(|l| l.trim_end_matches('\r'));

    let status_line = lines.next().unwrap_or_default();
    let status = parse_status_line(status_line)?;

    let mut headers = HeaderMap::new();
    let mut pending: Option<(String, String)> = None;
    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            // obs-fold continuation of the previous header
            let (_, value) = pending.as_mut().ok_or("header continuation without a header")?;
            value.push(' ');
            value.push_str(line.trim());
            continue;
        }
        if let Some((name, value)) = pending.take() {
            append_header(&mut headers, &name, &value)?;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| format!("malformed header line '{}'", line))?;
        pending = Some((name.trim().to_string(), value.trim().to_string()));
    }
    if let Some((name, value)) = pending {
        append_header(&mut headers, &name, &value)?;
    }

    let chunked = headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .any(|v| v.to_str().map(|s| s.to_ascii_lowercase().contains("chunked")).unwrap_or(false));
    let mut body = if chunked { decode_chunked(body)? } else { body.to_vec() };

    let body_truncated = body.len() > MAX_BODY_SIZE;
    body.truncate(MAX_BODY_SIZE);

    Ok(ResponseSnapshot {
        status,
        headers,
        body,
        body_truncated,
        remote_ip: None,
    })
}

fn split_head(raw: &[u8]) -> Option<(&[u8], &[u8])> {
    let crlf = raw.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    let lf = raw.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let (at, len) = match (crlf, lf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (a, b) => a.or(b)?,
    };
    Some((&raw[..at], &raw[at + len..]))
}

fn parse_status_line(line: &str) -> Result<u16, String> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(format!("not an HTTP/1.x status line: '{}'", line));
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| (100..=999).contains(code))
        .ok_or_else(|| format!("invalid status code in '{}'", line))
}

fn append_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), String> {
    let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| format!("invalid header name '{}'", name))?;
    let header_value =
        HeaderValue::from_str(value).map_err(|_| format!("invalid value for header '{}'", name))?;
    headers.append(header_name, header_value);
    Ok(())
}

fn decode_chunked(mut data: &[u8]) -> Result<Vec<u8>, String> {
    let mut body = Vec::new();
    loop {
        let line_end = data
            .windows(2)
            .position(|w| w == b"\r\n")
            .or_else(|| data.iter().position(|&b| b == b'\n'))
            .ok_or("unterminated chunk size line")?;
        let size_line = std::str::from_utf8(&data[..line_end]).map_err(|_| "invalid chunk size line")?;
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_hex, 16).map_err(|_| format!("invalid chunk size '{}'", size_hex))?;

        let skip = if data[line_end] == b'\r' { 2 } else { 1 };
        data = &data[line_end + skip..];
        if size == 0 {
            // Trailers, if any, are ignored.
            return Ok(body);
        }
        if data.len() < size {
            return Err("chunk shorter than its declared size".to_string());
        }
        body.extend_from_slice(&data[..size]);
        data = &data[size..];
        data = data
            .strip_prefix(b"\r\n")
            .or_else(|| data.strip_prefix(b"\n"))
            .ok_or("missing line break after chunk")?;
    }
}

/// The unit a record stands for: its URL, pinned to the captured scheme.
fn record_unit(record: &PassiveRecord) -> ProbeUnit {
    let host = match record.url.host() {
        Some(Host::Ipv6(addr)) => addr.to_string(),
        Some(host) => host.to_string(),
        None => String::new(),
    };
    let port = record.url.port_or_known_default().unwrap_or_default();
    let mut unit = ProbeUnit::new(record.url.as_str(), host, port);
    unit.scheme = Some(record.scheme);
    unit.path = record.url[Position::BeforePath..].to_string();
    unit
}

/// Builds results from captured records. Holds no prober and no network
/// adapter, so replay never touches the network.
pub struct ReplayWorker {
    enricher: Arc<Enricher>,
}

impl ReplayWorker {
    pub fn new(enricher: Arc<Enricher>) -> Self {
        Self { enricher }
    }
}

#[async_trait]
impl Worker for ReplayWorker {
    type Job = PassiveRecord;

    async fn run(&self, record: PassiveRecord) -> ProbeResult {
        let started = Instant::now();
        debug!(line = record.line, url = %record.url, "Replaying captured response.");
        let unit = record_unit(&record);

        let mut chain = RedirectChain::default();
        chain.push(record.url.as_str(), record.snapshot.status);
        let exchange = Exchange {
            scheme: record.scheme,
            final_url: record.url,
            method: record.method,
            chain,
            snapshot: record.snapshot,
        };
        self.enricher.finish(&unit, exchange, ResultSource::Passive, started).await
    }

    fn failed(&self, record: &PassiveRecord, error: ProbeError) -> ProbeResult {
        let mut result = ProbeResult::failed(&record_unit(record), Some(record.scheme), record.method.as_str(), error);
        result.url = Some(record.url.to_string());
        result.source = ResultSource::Passive;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Features;
    use crate::core::models::Enrichment;
    use crate::core::scanner::fingerprint_scanner::FingerprintEngine;
    use serde_json::json;
    use std::io::Write;

    fn write_lines(lines: &[String]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file
    }

    #[test]
    fn test_parse_raw_response() {
        let raw = b"HTTP/1.1 404 Not Found\r\nServer: nginx\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\nmissing";
        let snapshot = parse_raw_response(raw).unwrap();
        assert_eq!(snapshot.status, 404);
        assert_eq!(snapshot.headers.get("server").unwrap(), "nginx");
        assert_eq!(snapshot.headers.get_all("set-cookie").iter().count(), 2);
        assert_eq!(snapshot.body, b"missing");
    }

    #[test]
    fn test_parse_raw_response_bare_newlines_and_folding() {
        let raw = b"HTTP/1.0 200 OK\nX-Long: first\n  second\n\nbody";
        let snapshot = parse_raw_response(raw).unwrap();
        assert_eq!(snapshot.headers.get("x-long").unwrap(), "first second");
        assert_eq!(snapshot.body, b"body");
    }

    #[test]
    fn test_decode_chunked_body() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\n\r\n";
        let snapshot = parse_raw_response(raw).unwrap();
        assert_eq!(snapshot.body, b"hello world");
    }

    #[test]
    fn test_rejects_malformed_responses() {
        assert!(parse_raw_response(b"HTTP/1.1 200 OK\r\nServer: x").is_err());
        assert!(parse_raw_response(b"SSH-2.0-OpenSSH\r\n\r\n").is_err());
        assert!(parse_raw_response(b"HTTP/1.1 abc OK\r\n\r\n").is_err());
        assert!(parse_raw_response(b"HTTP/1.1 200 OK\r\nno colon here\r\n\r\n").is_err());
        assert!(parse_raw_response(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n").is_err());
    }

    #[test]
    fn test_load_records() {
        let file = write_lines(&[
            json!({"url": "https://a.test/login", "method": "post", "ip": "192.0.2.7",
                   "response": "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n<title>Login</title>"})
            .to_string(),
            String::new(),
            json!({"url": "http://[2001:db8::1]:8080/", "response": "HTTP/1.1 301 Moved\r\nLocation: /x\r\n\r\n"})
                .to_string(),
        ]);

        let records = load_records(file.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].method, Method::POST);
        assert_eq!(records[0].scheme, Scheme::Https);
        assert_eq!(records[0].snapshot.remote_ip, Some("192.0.2.7".parse().unwrap()));
        assert_eq!(records[1].line, 3);
        assert_eq!(records[1].method, Method::GET);

        let unit = record_unit(&records[1]);
        assert_eq!(unit.host, "2001:db8::1");
        assert_eq!(unit.port, 8080);
    }

    #[test]
    fn test_bad_record_fails_the_file() {
        let file = write_lines(&[
            json!({"url": "http://a.test/", "response": "HTTP/1.1 200 OK\r\n\r\n"}).to_string(),
            "{not json".to_string(),
        ]);
        let err = load_records(file.path()).unwrap_err();
        match err {
            ScanError::PassiveFile { reason, .. } => assert!(reason.starts_with("line 2:")),
            other => panic!("unexpected error: {other:?}"),
        }

        let file = write_lines(&[json!({"url": "ftp://a.test/", "response": "HTTP/1.1 200 OK\r\n\r\n"}).to_string()]);
        assert!(load_records(file.path()).is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_records(&dir.path().join("nope.jsonl")).unwrap_err();
        assert!(matches!(err, ScanError::PassiveFile { .. }));
    }

    #[tokio::test]
    async fn test_replay_worker_builds_single_hop_results() {
        let file = write_lines(&[json!({
            "url": "http://a.test:8080/admin",
            "ip": "192.0.2.9",
            "response": "HTTP/1.1 302 Found\r\nLocation: /login\r\nServer: Apache/2.4.58\r\n\r\n"
        })
        .to_string()]);
        let record = load_records(file.path()).unwrap().remove(0);

        let features = Features {
            asn: true,
            tech_detect: true,
            ..Default::default()
        };
        let worker = ReplayWorker::new(Arc::new(Enricher::offline(features, FingerprintEngine::default())));
        let result = worker.run(record).await;

        assert!(result.is_success());
        assert_eq!(result.source, ResultSource::Passive);
        assert_eq!(result.port, 8080);
        assert_eq!(result.url.as_deref(), Some("http://a.test:8080/admin"));
        assert_eq!(result.redirect_chain.len(), 1);
        assert!(!result.redirect_limit_exceeded);
        assert_eq!(result.response.as_ref().map(|r| r.status_code), Some(302));
        assert!(matches!(result.asn, Enrichment::Unavailable { .. }));
        assert!(
            result
                .fingerprint
                .unwrap()
                .technologies
                .iter()
                .any(|t| t.name == "Apache")
        );
    }
}
