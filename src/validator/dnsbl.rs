//! DNSBL check (§4.B.4), grounded on
//! `examples/original_source/internal/validation/checks/blacklist.go` and
//! `examples/original_source/internal/rbl/rbl.go` for the exact zone list.
//!
//! Queried in parallel across zones rather than the original's sequential
//! loop (§9 "DNSBL" open question); non-IPv4 peers are not listed without a
//! query, since none of these zones publish IPv6 data.

use std::{net::IpAddr, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    resolver::Resolve,
    validator::{Check, CheckResult, CheckValues},
};

fn reversed_octets(ip: IpAddr) -> Option<String> {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            Some(format!("{d}.{c}.{b}.{a}"))
        }
        IpAddr::V6(_) => None,
    }
}

struct ZoneHit {
    zone: String,
    reasons: Vec<String>,
}

pub struct DnsblCheck {
    resolver: Arc<dyn Resolve>,
    zones: Vec<String>,
}

impl DnsblCheck {
    pub fn new(resolver: Arc<dyn Resolve>, spamhaus_token: &str) -> Self {
        let zones = vec![
            "bl.spamcop.net".to_string(),
            "psbl.surriel.com".to_string(),
            "ubl.unsubscore.com".to_string(),
            "b.barracudacentral.org".to_string(),
            format!("{spamhaus_token}.sbl-xbl.dq.spamhaus.net"),
        ];
        DnsblCheck { resolver, zones }
    }

    async fn query_zone(&self, reversed: &str, zone: &str) -> Option<ZoneHit> {
        let query = format!("{reversed}.{zone}");

        let records = match self.resolver.lookup_host(&query).await {
            Ok(records) => records,
            Err(e) if e.is_not_found() => return None,
            Err(e) => {
                warn!(zone, error = %e, "dnsbl zone query failed");
                return None;
            }
        };

        let listed = records
            .iter()
            .any(|ip| matches!(ip, IpAddr::V4(v4) if v4.octets()[0] == 127));

        if !listed {
            return None;
        }

        let reasons = self.resolver.lookup_txt(&query).await.unwrap_or_default();

        Some(ZoneHit {
            zone: zone.to_string(),
            reasons,
        })
    }

    async fn run(&self, values: &CheckValues) -> CheckResult {
        let Some(reversed) = reversed_octets(values.peer_ip) else {
            return CheckResult::ok("non-IPv4 peer, skipping DNSBL lookup");
        };

        let hits: Vec<ZoneHit> = futures::future::join_all(
            self.zones
                .iter()
                .map(|zone| self.query_zone(&reversed, zone)),
        )
        .await
        .into_iter()
        .flatten()
        .collect();

        if !hits.is_empty() {
            let zones: Vec<&str> = hits.iter().map(|hit| hit.zone.as_str()).collect();
            let reasons: Vec<&str> = hits
                .iter()
                .flat_map(|hit| hit.reasons.iter().map(String::as_str))
                .collect();

            info!(zones = ?zones, reasons = ?reasons, "peer listed on dnsbl");
            return CheckResult::reject(format!(
                "listed on {} with reason(s): {:?}",
                zones.join(", "),
                reasons
            ));
        }

        CheckResult::ok("not listed on any DNSBL")
    }
}

#[async_trait]
impl Check for DnsblCheck {
    fn name(&self) -> &'static str {
        "dnsbl"
    }

    async fn validate(&self, values: &CheckValues, cancel: CancellationToken) -> CheckResult {
        tokio::select! {
            result = self.run(values) => result,
            _ = cancel.cancelled() => {
                warn!("dnsbl check cancelled");
                CheckResult::cancelled()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::resolver::fixture::FixtureResolver;

    fn peer() -> CheckValues {
        CheckValues {
            envelope_from: "john@example.com".into(),
            header_from: "john@example.com".into(),
            helo: "mail.example.com".into(),
            data: Arc::from(&b""[..]),
            peer_ip: IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
        }
    }

    #[tokio::test]
    async fn clean_peer_passes() {
        let resolver = Arc::new(FixtureResolver::new());
        let check = DnsblCheck::new(resolver, "TOKEN");

        let result = check.run(&peer()).await;

        assert!(result.success);
        assert!(!result.reject);
    }

    #[tokio::test]
    async fn non_ipv4_peer_skips_lookup() {
        let resolver = Arc::new(FixtureResolver::new());
        let check = DnsblCheck::new(resolver, "TOKEN");
        let mut values = peer();
        values.peer_ip = "2001:db8::1".parse().unwrap();

        let result = check.run(&values).await;

        assert!(result.success);
    }

    #[tokio::test]
    async fn aggregates_reasons_across_every_listed_zone() {
        let mut resolver = FixtureResolver::new()
            .with_txt("4.3.2.1.bl.spamcop.net", "spamcop: known spam source")
            .with_txt("4.3.2.1.psbl.surriel.com", "psbl: reported by user");
        resolver
            .hosts
            .insert("4.3.2.1.bl.spamcop.net".into(), vec![Ipv4Addr::new(127, 0, 0, 2).into()]);
        resolver
            .hosts
            .insert("4.3.2.1.psbl.surriel.com".into(), vec![Ipv4Addr::new(127, 0, 0, 4).into()]);

        let check = DnsblCheck::new(Arc::new(resolver), "TOKEN");

        let result = check.run(&peer()).await;

        assert!(result.reject);
        assert!(result.message.contains("bl.spamcop.net"));
        assert!(result.message.contains("psbl.surriel.com"));
        assert!(result.message.contains("spamcop: known spam source"));
        assert!(result.message.contains("psbl: reported by user"));
    }
}
