// src/core/scanner/asn_resolver.rs

//! ASN ownership lookups over Team Cymru's DNS interface.
//!
//! `<reversed ip>.origin.asn.cymru.com` (or `origin6` with nibbles for IPv6)
//! answers with a TXT record `"ASN | prefix | CC | registry | allocated"`,
//! and `AS<n>.asn.cymru.com` with `"ASN | CC | registry | allocated | name"`.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, warn};

use crate::core::error::EnrichmentError;
use crate::core::models::AsnInfo;
use crate::core::scanner::resolver::build_resolver;

/// Contract for anything that maps an IP to its owning network.
#[async_trait]
pub trait AsnResolver: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> Result<AsnInfo, EnrichmentError>;
}

pub struct CymruAsnResolver {
    resolver: TokioAsyncResolver,
}

impl CymruAsnResolver {
    pub fn new(dns: &[SocketAddr]) -> Self {
        Self {
            resolver: build_resolver(dns),
        }
    }

    async fn txt(&self, name: &str) -> Result<Option<String>, EnrichmentError> {
        debug!(name, "Looking up ASN TXT record.");
        let records = self.resolver.txt_lookup(name).await.map_err(|e| {
            warn!(name, error = %e, "ASN lookup failed.");
            EnrichmentError::LookupUnavailable {
                reason: format!("DNS Error: {}", e),
            }
        })?;
        Ok(records.iter().next().map(|txt| {
            txt.txt_data()
                .iter()
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect::<String>()
        }))
    }
}

#[async_trait]
impl AsnResolver for CymruAsnResolver {
    async fn lookup(&self, ip: IpAddr) -> Result<AsnInfo, EnrichmentError> {
        let record = self.txt(&origin_query(ip)).await?.ok_or_else(|| EnrichmentError::LookupUnavailable {
            reason: format!("no ASN record for {}", ip),
        })?;
        let mut info = parse_origin(&record).ok_or_else(|| EnrichmentError::LookupUnavailable {
            reason: format!("unparsable ASN record '{}'", record),
        })?;

        // The owner name is a second query; missing it still leaves a usable answer.
        match self.txt(&format!("AS{}.asn.cymru.com", info.number)).await {
            Ok(Some(desc)) => info.name = parse_owner_name(&desc),
            Ok(None) => {}
            Err(e) => debug!(asn = info.number, error = %e, "ASN name lookup failed."),
        }
        Ok(info)
    }
}

/// Query name for the origin lookup of `ip`.
pub fn origin_query(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.origin.asn.cymru.com", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let nibbles: Vec<String> = v6
                .octets()
                .iter()
                .flat_map(|b| [b >> 4, b & 0x0f])
                .rev()
                .map(|n| format!("{:x}", n))
                .collect();
            format!("{}.origin6.asn.cymru.com", nibbles.join("."))
        }
    }
}

fn fields(record: &str) -> Vec<String> {
    record.split('|').map(|f| f.trim().to_string()).collect()
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

/// Parses `"13335 | 104.16.0.0/13 | US | arin | 2014-03-28"`. When several
/// origin ASNs are listed, the first wins.
pub fn parse_origin(record: &str) -> Option<AsnInfo> {
    let fields = fields(record);
    let number = fields.first()?.split_whitespace().next()?.parse().ok()?;
    Some(AsnInfo {
        number,
        prefix: non_empty(fields.get(1)),
        country: non_empty(fields.get(2)),
        registry: non_empty(fields.get(3)),
        name: None,
    })
}

/// Owner name from `"13335 | US | arin | 2010-07-14 | CLOUDFLARENET, US"`.
pub fn parse_owner_name(record: &str) -> Option<String> {
    non_empty(fields(record).get(4))
}
