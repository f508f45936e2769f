// src/main.rs

use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use hprobe::logging::initialize_logging;
use hprobe::{Engine, ScanConfig, ScanOptions};
use tracing::warn;

/// Probe hosts, IPs, CIDR ranges or URLs for live HTTP(S) endpoints.
/// Results are printed to stdout as JSON lines.
#[derive(Parser, Debug)]
#[command(name = "hprobe", version, about)]
struct Cli {
    /// Targets: hostnames, IPs, [v6]:port, host:port, CIDR ranges or URLs.
    targets: Vec<String>,

    /// JSON config object with the same option names; flags override it.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// File with one target per line.
    #[arg(short = 'l', long, value_name = "FILE")]
    list: Option<PathBuf>,

    #[arg(short, long, value_delimiter = ',')]
    ports: Option<Vec<u16>>,

    /// Number of concurrent probes.
    #[arg(short, long)]
    threads: Option<usize>,

    /// Per-probe deadline in seconds.
    #[arg(long)]
    timeout: Option<f64>,

    #[arg(long)]
    max_redirects: Option<usize>,

    #[arg(short = 'X', long = "method")]
    method: Option<String>,

    /// auto, http or https.
    #[arg(long)]
    scheme_policy: Option<String>,

    #[arg(long)]
    user_agent: Option<String>,

    #[arg(long)]
    asn: bool,

    #[arg(long)]
    tech_detect: bool,

    #[arg(long)]
    fingerprint: bool,

    #[arg(long)]
    screenshot: bool,

    /// Add the common web ports to the port list.
    #[arg(long)]
    common_ports: bool,

    /// Only results on stdout: no progress logging on stderr.
    #[arg(short, long)]
    silent: bool,

    /// Resolver overrides (ip, ip:port or [v6]:port).
    #[arg(long, value_delimiter = ',')]
    dns: Vec<String>,

    /// http://, https:// or socks5:// proxy URL.
    #[arg(long)]
    proxy: Option<String>,

    #[arg(short = 'd', long, conflicts_with = "post_file")]
    post_data: Option<String>,

    #[arg(long, value_name = "FILE")]
    post_file: Option<PathBuf>,

    #[arg(long)]
    content_type: Option<String>,

    /// active or passive.
    #[arg(long)]
    mode: Option<String>,

    /// Captured responses (JSON lines) to replay in passive mode.
    #[arg(long, value_name = "FILE")]
    response_file: Option<PathBuf>,

    /// Render service URL for screenshots.
    #[arg(long)]
    screenshot_endpoint: Option<String>,

    /// Print only results that got a response.
    #[arg(long)]
    success_only: bool,
}

impl Cli {
    fn into_options(self) -> Result<ScanOptions> {
        let mut options = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .wrap_err_with(|| format!("cannot read config file {}", path.display()))?;
                let value: serde_json::Value =
                    serde_json::from_str(&raw).wrap_err_with(|| format!("invalid JSON in {}", path.display()))?;
                ScanOptions::from_value(&value)?
            }
            None => ScanOptions::default(),
        };

        if let Some(path) = &self.list {
            let raw = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("cannot read target list {}", path.display()))?;
            options
                .targets
                .extend(raw.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with('#')).map(String::from));
        }
        options.targets.extend(self.targets);

        if let Some(ports) = self.ports {
            options.ports = ports;
        }
        if let Some(threads) = self.threads {
            options.threads = threads;
        }
        if let Some(timeout) = self.timeout {
            options.timeout = timeout;
        }
        if let Some(max_redirects) = self.max_redirects {
            options.max_redirects = max_redirects;
        }
        if let Some(method) = self.method {
            options.methods = method;
        }
        if let Some(policy) = self.scheme_policy {
            options.scheme_policy = policy;
        }
        if let Some(content_type) = self.content_type {
            options.content_type = content_type;
        }
        if let Some(mode) = self.mode {
            options.mode = mode;
        }
        if !self.dns.is_empty() {
            options.dns = self.dns;
        }

        options.user_agent = self.user_agent.or(options.user_agent);
        options.proxy = self.proxy.or(options.proxy);
        options.post_data = self.post_data.or(options.post_data);
        options.post_file = self.post_file.or(options.post_file);
        options.response_file = self.response_file.or(options.response_file);
        options.screenshot_endpoint = self.screenshot_endpoint.or(options.screenshot_endpoint);

        options.asn |= self.asn;
        options.tech_detect |= self.tech_detect;
        options.fingerprint |= self.fingerprint;
        options.screenshot |= self.screenshot;
        options.common_ports |= self.common_ports;
        options.silent |= self.silent;

        Ok(options)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let success_only = cli.success_only;
    let options = cli.into_options()?;
    initialize_logging(options.silent)?;

    let config = ScanConfig::try_from(options)?;
    let engine = Engine::new(config)?;

    let cancel = engine.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling scan.");
            cancel.cancel();
        }
    });

    let mut results = engine.stream();
    while let Some(result) = results.next().await {
        if success_only && !result.is_success() {
            continue;
        }
        println!("{}", serde_json::to_string(&result)?);
    }

    Ok(())
}
