use std::{net::IpAddr, time::Duration};

use async_trait::async_trait;
use hickory_resolver::{
    Resolver, TokioResolver,
    config::{ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
};
use thiserror::Error;
use tokio::time::timeout;
use tracing::warn;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ResolveError {
    /// A normal negative answer: the record genuinely does not exist.
    #[error("no such host")]
    NotFound,
    /// Timeout, SERVFAIL, or any other transient/network failure.
    #[error("dns lookup failed: {0}")]
    Lookup(String),
}

impl ResolveError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ResolveError::NotFound)
    }
}

/// host/TXT/PTR lookups with independent per-call deadlines (component A).
///
/// Absence of a record ([`ResolveError::NotFound`]) is distinguished from a
/// soft lookup failure so that callers (reverse DNS, DNSBL, DMARC) can apply
/// the right fallback for each.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn lookup_host(&self, name: &str) -> Result<Vec<IpAddr>, ResolveError>;
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, ResolveError>;
    async fn lookup_ptr(&self, ip: IpAddr) -> Result<Vec<String>, ResolveError>;
}

fn classify(err: hickory_resolver::ResolveError) -> ResolveError {
    if err.is_no_records_found() {
        ResolveError::NotFound
    } else {
        ResolveError::Lookup(err.to_string())
    }
}

/// Production resolver backed by `hickory-resolver`'s async stub resolver.
#[derive(Clone)]
pub struct HickoryResolver {
    resolver: TokioResolver,
}

impl HickoryResolver {
    /// Reads `/etc/resolv.conf` (via hickory's Tokio runtime binding) for the
    /// nameservers to query; falls back to Cloudflare's DNS-over-TLS resolver
    /// (§4.A) if the system configuration can't be read, e.g. in a container
    /// without a resolv.conf.
    pub fn from_system_config() -> Self {
        let resolver = match Resolver::builder_tokio() {
            Ok(builder) => builder.with_options(ResolverOpts::default()).build(),
            Err(e) => {
                warn!(
                    error = %e,
                    "failed to read system DNS configuration, falling back to DNS-over-TLS"
                );
                Resolver::builder_with_config(
                    ResolverConfig::cloudflare_tls(),
                    TokioConnectionProvider::default(),
                )
                .with_options(ResolverOpts::default())
                .build()
            }
        };

        Self { resolver }
    }
}

#[async_trait]
impl Resolve for HickoryResolver {
    async fn lookup_host(&self, name: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let fqdn = if name.ends_with('.') {
            name.to_string()
        } else {
            format!("{name}.")
        };

        match timeout(LOOKUP_TIMEOUT, self.resolver.lookup_ip(fqdn)).await {
            Ok(Ok(lookup)) => Ok(lookup.iter().collect()),
            Ok(Err(e)) => Err(classify(e)),
            Err(_) => Err(ResolveError::Lookup("dns lookup timed out".into())),
        }
    }

    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, ResolveError> {
        let fqdn = if name.ends_with('.') {
            name.to_string()
        } else {
            format!("{name}.")
        };

        match timeout(LOOKUP_TIMEOUT, self.resolver.txt_lookup(fqdn)).await {
            Ok(Ok(lookup)) => Ok(lookup
                .into_iter()
                .map(|record| {
                    record
                        .txt_data()
                        .iter()
                        .flat_map(|chunk| chunk.iter().copied())
                        .map(char::from)
                        .collect::<String>()
                })
                .collect()),
            Ok(Err(e)) => Err(classify(e)),
            Err(_) => Err(ResolveError::Lookup("dns lookup timed out".into())),
        }
    }

    async fn lookup_ptr(&self, ip: IpAddr) -> Result<Vec<String>, ResolveError> {
        match timeout(LOOKUP_TIMEOUT, self.resolver.reverse_lookup(ip)).await {
            Ok(Ok(lookup)) => Ok(lookup.into_iter().map(|name| name.to_string()).collect()),
            Ok(Err(e)) => Err(classify(e)),
            Err(_) => Err(ResolveError::Lookup("dns lookup timed out".into())),
        }
    }
}

#[cfg(test)]
pub mod fixture {
    use std::{collections::HashMap, net::IpAddr};

    use async_trait::async_trait;

    use super::{Resolve, ResolveError};

    /// In-memory resolver for tests: exact-match lookups against fixed maps,
    /// `ResolveError::NotFound` for anything absent.
    #[derive(Default)]
    pub struct FixtureResolver {
        pub hosts: HashMap<String, Vec<IpAddr>>,
        pub txt: HashMap<String, Vec<String>>,
        pub ptr: HashMap<IpAddr, Vec<String>>,
    }

    impl FixtureResolver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_txt(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
            self.txt
                .entry(name.into())
                .or_default()
                .push(value.into());
            self
        }

        pub fn with_ptr(mut self, ip: IpAddr, name: impl Into<String>) -> Self {
            self.ptr.entry(ip).or_default().push(name.into());
            self
        }
    }

    #[async_trait]
    impl Resolve for FixtureResolver {
        async fn lookup_host(&self, name: &str) -> Result<Vec<IpAddr>, ResolveError> {
            self.hosts
                .get(name.trim_end_matches('.'))
                .cloned()
                .ok_or(ResolveError::NotFound)
        }

        async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, ResolveError> {
            self.txt
                .get(name.trim_end_matches('.'))
                .cloned()
                .ok_or(ResolveError::NotFound)
        }

        async fn lookup_ptr(&self, ip: IpAddr) -> Result<Vec<String>, ResolveError> {
            self.ptr.get(&ip).cloned().ok_or(ResolveError::NotFound)
        }
    }
}
