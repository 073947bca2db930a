//! Reverse DNS check (§4.B.3), grounded on
//! `examples/original_source/internal/validation/checks/reverse_dns.go`.
//!
//! Deviates from the original on one point (§9 "ReverseDNS" open question):
//! a genuine negative PTR answer rejects, but any other resolver failure only
//! warns, since transient DNS errors are not evidence of forgery.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    resolver::Resolve,
    validator::{Check, CheckResult, CheckValues},
};

pub struct ReverseDnsCheck {
    resolver: Arc<dyn Resolve>,
}

impl ReverseDnsCheck {
    pub fn new(resolver: Arc<dyn Resolve>) -> Self {
        ReverseDnsCheck { resolver }
    }

    async fn run(&self, values: &CheckValues) -> CheckResult {
        let ptrs = match self.resolver.lookup_ptr(values.peer_ip).await {
            Ok(ptrs) => ptrs,
            Err(e) if e.is_not_found() => {
                return CheckResult::reject(format!("no PTR record for {}", values.peer_ip));
            }
            Err(e) => {
                warn!(error = %e, "reverse DNS lookup failed, continuing without PTR match");
                return CheckResult::fail("reverse DNS lookup failed, skipping match");
            }
        };

        let Some(first) = ptrs.first() else {
            return CheckResult::reject(format!("no PTR record for {}", values.peer_ip));
        };

        let ptr_record = first.trim_end_matches('.');
        if ptr_record.eq_ignore_ascii_case(&values.helo) {
            CheckResult::ok("PTR record matches HELO")
        } else {
            debug!(ptr = ptr_record, helo = %values.helo, "PTR record does not match HELO");
            CheckResult::fail(format!(
                "PTR record ({ptr_record}) does not match HELO ({})",
                values.helo
            ))
        }
    }
}

#[async_trait]
impl Check for ReverseDnsCheck {
    fn name(&self) -> &'static str {
        "reverse_dns"
    }

    async fn validate(&self, values: &CheckValues, cancel: CancellationToken) -> CheckResult {
        tokio::select! {
            result = self.run(values) => result,
            _ = cancel.cancelled() => {
                warn!("reverse dns check cancelled");
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

    fn values(helo: &str) -> CheckValues {
        CheckValues {
            envelope_from: "john@example.com".into(),
            header_from: "john@example.com".into(),
            helo: helo.into(),
            data: Arc::from(&b""[..]),
            peer_ip: IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
        }
    }

    #[tokio::test]
    async fn matching_ptr_passes() {
        let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        let resolver = Arc::new(FixtureResolver::new().with_ptr(ip, "mail.example.com."));
        let check = ReverseDnsCheck::new(resolver);

        let result = check.run(&values("mail.example.com")).await;

        assert!(result.success);
        assert!(!result.reject);
    }

    #[tokio::test]
    async fn mismatched_ptr_fails_without_rejecting() {
        let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        let resolver = Arc::new(FixtureResolver::new().with_ptr(ip, "somewhere-else.example.com."));
        let check = ReverseDnsCheck::new(resolver);

        let result = check.run(&values("mail.example.com")).await;

        assert!(!result.success);
        assert!(!result.reject);
    }

    #[tokio::test]
    async fn missing_ptr_rejects() {
        let resolver = Arc::new(FixtureResolver::new());
        let check = ReverseDnsCheck::new(resolver);

        let result = check.run(&values("mail.example.com")).await;

        assert!(!result.success);
        assert!(result.reject);
    }
}
