// src/core/scanner/screenshot.rs

//! Screenshot capture through an external headless-browser render service.
//!
//! The service follows the browserless `/screenshot` contract: a JSON POST
//! naming the page, answered with the PNG bytes.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

use crate::core::error::EnrichmentError;
use crate::core::models::Screenshot;
use crate::core::scanner::fingerprint_scanner::sha256_hex;

/// Rendering gets more time than a probe; pages load sub-resources.
const RENDER_TIMEOUT_FACTOR: u32 = 3;

#[async_trait]
pub trait ScreenshotCapturer: Send + Sync {
    async fn capture(&self, url: &str) -> Result<Screenshot, EnrichmentError>;
}

pub struct RenderServiceCapturer {
    client: Client,
    endpoint: Url,
    output_dir: PathBuf,
    timeout: Duration,
}

impl RenderServiceCapturer {
    pub fn new(endpoint: Url, output_dir: PathBuf, probe_timeout: Duration) -> Result<Self, EnrichmentError> {
        let timeout = probe_timeout.saturating_mul(RENDER_TIMEOUT_FACTOR);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EnrichmentError::RenderUnavailable {
                reason: format!("failed to build render client: {}", e),
            })?;
        Ok(Self {
            client,
            endpoint,
            output_dir,
            timeout,
        })
    }
}

#[async_trait]
impl ScreenshotCapturer for RenderServiceCapturer {
    async fn capture(&self, url: &str) -> Result<Screenshot, EnrichmentError> {
        debug!(url, endpoint = %self.endpoint, "Requesting screenshot.");
        let timeout_ms = self.timeout.as_millis() as u64;
        let unavailable = |e: reqwest::Error| {
            if e.is_timeout() {
                EnrichmentError::RenderTimeout { timeout_ms }
            } else {
                EnrichmentError::RenderUnavailable { reason: e.to_string() }
            }
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&json!({ "url": url, "options": { "type": "png", "fullPage": false } }))
            .send()
            .await
            .map_err(unavailable)?;

        if !response.status().is_success() {
            warn!(url, status = %response.status(), "Render service refused the page.");
            return Err(EnrichmentError::RenderUnavailable {
                reason: format!("render service answered {}", response.status()),
            });
        }
        let png = response.bytes().await.map_err(unavailable)?;

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| EnrichmentError::RenderUnavailable {
                reason: format!("cannot create {}: {}", self.output_dir.display(), e),
            })?;
        let path = self.output_dir.join(file_name(url));
        tokio::fs::write(&path, &png)
            .await
            .map_err(|e| EnrichmentError::RenderUnavailable {
                reason: format!("cannot write {}: {}", path.display(), e),
            })?;

        debug!(url, path = %path.display(), bytes = png.len(), "Screenshot stored.");
        Ok(Screenshot {
            url: url.to_string(),
            path,
        })
    }
}

/// Stable, filesystem-safe name: readable host part plus a short URL hash.
pub fn file_name(url: &str) -> String {
    let host: String = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| format!("{}_{}", h, u.port_or_known_default().unwrap_or(0))))
        .unwrap_or_else(|| "page".to_string())
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    format!("{}_{}.png", host, &sha256_hex(url.as_bytes())[..12])
}
