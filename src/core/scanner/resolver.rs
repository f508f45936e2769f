// src/core/scanner/resolver.rs

//! DNS resolution through the user's resolver list instead of system defaults.

use std::net::SocketAddr;

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tracing::debug;

/// Builds a Tokio resolver. With no overrides this is the default upstream
/// configuration; otherwise exactly the given servers, over UDP then TCP.
pub fn build_resolver(servers: &[SocketAddr]) -> TokioAsyncResolver {
    if servers.is_empty() {
        return TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
    }

    let mut config = ResolverConfig::new();
    for &addr in servers {
        config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
        config.add_name_server(NameServerConfig::new(addr, Protocol::Tcp));
    }
    TokioAsyncResolver::tokio(config, ResolverOpts::default())
}

/// Plugs a hickory resolver into reqwest's connector.
#[derive(Clone)]
pub struct OverrideResolver {
    inner: TokioAsyncResolver,
}

impl OverrideResolver {
    pub fn new(servers: &[SocketAddr]) -> Self {
        Self {
            inner: build_resolver(servers),
        }
    }
}

impl Resolve for OverrideResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = self.inner.clone();
        Box::pin(async move {
            debug!(host = name.as_str(), "Resolving through DNS override.");
            let lookup = resolver.lookup_ip(name.as_str()).await?;
            let addrs: Addrs = Box::new(lookup.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}
