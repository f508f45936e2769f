// src/core/scanner/targets.rs

//! Turns raw targets and ports into the deduplicated list of probe units.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use ipnetwork::IpNetwork;
use tracing::debug;
use url::{Host, Url};

use crate::core::config::ScanConfig;
use crate::core::error::ScanError;
use crate::core::models::{ProbeUnit, Scheme};

/// Ports commonly serving HTTP(S), unioned in when `common_ports` is set.
pub const COMMON_WEB_PORTS: &[u16] = &[
    80, 81, 443, 591, 2082, 2087, 2095, 2096, 3000, 5000, 7001, 8000, 8008, 8080, 8081, 8088, 8443,
    8888, 9000, 9443,
];

/// Largest CIDR range that will be expanded.
const MAX_RANGE_ADDRESSES: u128 = 65_536;

const DEFAULT_DNS_PORT: u16 = 53;

/// A target after parsing, before it is crossed with the port list.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedTarget {
    input: String,
    hosts: Vec<String>,
    port: Option<u16>,
    scheme: Option<Scheme>,
    path: String,
}

/// Expands the configured targets into probe units, preserving first-seen order.
pub fn expand(config: &ScanConfig) -> Result<Vec<ProbeUnit>, ScanError> {
    expand_targets(config.targets(), config.ports(), config.features().common_ports)
}

pub fn expand_targets(targets: &[String], ports: &[u16], common_ports: bool) -> Result<Vec<ProbeUnit>, ScanError> {
    let entries: Vec<&str> = targets
        .iter()
        .flat_map(|t| t.split(|c: char| c == ',' || c.is_whitespace()))
        .filter(|t| !t.is_empty())
        .collect();

    if entries.is_empty() {
        return Err(ScanError::config("no targets given"));
    }
    if ports.is_empty() {
        return Err(ScanError::config("no ports given"));
    }

    let mut port_list: Vec<u16> = Vec::new();
    let extra: &[u16] = if common_ports { COMMON_WEB_PORTS } else { &[] };
    for &port in ports.iter().chain(extra) {
        if !port_list.contains(&port) {
            port_list.push(port);
        }
    }

    let mut seen = HashSet::new();
    let mut units = Vec::new();
    for entry in entries {
        let parsed = parse_target(entry)?;
        let target_ports: &[u16] = match &parsed.port {
            Some(port) => std::slice::from_ref(port),
            None => &port_list,
        };
        for host in &parsed.hosts {
            for &port in target_ports {
                let unit = ProbeUnit {
                    input: parsed.input.clone(),
                    host: host.clone(),
                    port,
                    scheme: parsed.scheme,
                    path: parsed.path.clone(),
                };
                let key = (unit.host.clone(), unit.port, unit.scheme, unit.path.clone());
                if seen.insert(key) {
                    units.push(unit);
                }
            }
        }
    }

    debug!(units = units.len(), "Expanded targets into probe units.");
    Ok(units)
}

fn parse_target(raw: &str) -> Result<ParsedTarget, ScanError> {
    if raw.contains("://") {
        return parse_url_target(raw);
    }

    if raw.contains('/') {
        let network: IpNetwork = raw
            .parse()
            .map_err(|e| ScanError::config(format!("invalid CIDR range '{}': {}", raw, e)))?;
        return Ok(ParsedTarget {
            input: raw.to_string(),
            hosts: expand_network(raw, network)?,
            port: None,
            scheme: None,
            path: "/".to_string(),
        });
    }

    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Ok(bare(raw, ip.to_string(), None));
    }

    // [v6]:port or [v6]
    if let Some(rest) = raw.strip_prefix('[') {
        let (addr, tail) = rest
            .split_once(']')
            .ok_or_else(|| ScanError::config(format!("unterminated IPv6 literal in '{}'", raw)))?;
        let ip: IpAddr = addr
            .parse()
            .map_err(|_| ScanError::config(format!("invalid IPv6 literal in '{}'", raw)))?;
        let port = match tail {
            "" => None,
            _ => Some(parse_port(raw, tail.strip_prefix(':').unwrap_or(tail))?),
        };
        return Ok(bare(raw, ip.to_string(), port));
    }

    let (host, port) = match raw.rsplit_once(':') {
        Some((host, port)) => (host, Some(parse_port(raw, port)?)),
        None => (raw, None),
    };
    let host = normalize_host(raw, host)?;
    Ok(bare(raw, host, port))
}

fn bare(raw: &str, host: String, port: Option<u16>) -> ParsedTarget {
    ParsedTarget {
        input: raw.to_string(),
        hosts: vec![host],
        port,
        scheme: None,
        path: "/".to_string(),
    }
}

fn parse_url_target(raw: &str) -> Result<ParsedTarget, ScanError> {
    let url = Url::parse(raw).map_err(|e| ScanError::config(format!("invalid target URL '{}': {}", raw, e)))?;
    let scheme = match url.scheme() {
        "http" => Scheme::Http,
        "https" => Scheme::Https,
        other => return Err(ScanError::config(format!("unsupported scheme '{}' in '{}'", other, raw))),
    };
    let host = match url.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => return Err(ScanError::config(format!("target URL '{}' has no host", raw))),
    };
    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    Ok(ParsedTarget {
        input: raw.to_string(),
        hosts: vec![host],
        // None when the URL spells no port (or its scheme's default one).
        port: url.port(),
        scheme: Some(scheme),
        path,
    })
}

fn expand_network(raw: &str, network: IpNetwork) -> Result<Vec<String>, ScanError> {
    // Sized from the prefix: `size()` overflows for /0.
    let host_bits = match network {
        IpNetwork::V4(net) => 32 - u32::from(net.prefix()),
        IpNetwork::V6(net) => 128 - u32::from(net.prefix()),
    };
    let too_wide = 1u128
        .checked_shl(host_bits)
        .is_none_or(|size| size > MAX_RANGE_ADDRESSES);
    if too_wide {
        return Err(ScanError::config(format!(
            "range '{}' spans 2^{} addresses, more than the {} allowed",
            raw, host_bits, MAX_RANGE_ADDRESSES
        )));
    }
    Ok(network.iter().map(|ip| ip.to_string()).collect())
}

fn parse_port(raw: &str, port: &str) -> Result<u16, ScanError> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(ScanError::config(format!("invalid port '{}' in target '{}'", port, raw))),
        Ok(p) => Ok(p),
    }
}

fn normalize_host(raw: &str, host: &str) -> Result<String, ScanError> {
    match Host::parse(host) {
        Ok(Host::Domain(domain)) if !domain.is_empty() => Ok(domain.trim_end_matches('.').to_string()),
        Ok(Host::Ipv4(ip)) => Ok(ip.to_string()),
        Ok(Host::Ipv6(ip)) => Ok(ip.to_string()),
        _ => Err(ScanError::config(format!("invalid target host '{}'", raw))),
    }
}

/// Parses the resolver override list: `ip`, `ip:port` or `[v6]:port`.
pub fn parse_dns_overrides(entries: &[String]) -> Result<Vec<SocketAddr>, ScanError> {
    entries
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|entry| {
            if let Ok(ip) = entry.parse::<IpAddr>() {
                return Ok(SocketAddr::new(ip, DEFAULT_DNS_PORT));
            }
            entry
                .parse::<SocketAddr>()
                .map_err(|_| ScanError::config(format!("invalid DNS resolver '{}'", entry)))
        })
        .collect()
}
