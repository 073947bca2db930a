//! SPF check (§4.B.1), grounded on
//! `examples/original_source/internal/validation/checks/spf.go` for the
//! pass/fail contract, evaluated with `mail-auth`'s RFC 7208 `check_host`
//! implementation.

use std::sync::Arc;

use async_trait::async_trait;
use mail_auth::{Resolver as MailAuthResolver, SpfResult};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::validator::{Check, CheckResult, CheckValues};

pub struct SpfCheck {
    resolver: Arc<MailAuthResolver>,
    local_hostname: String,
}

impl SpfCheck {
    pub fn new(resolver: Arc<MailAuthResolver>, local_hostname: String) -> Self {
        SpfCheck {
            resolver,
            local_hostname,
        }
    }

    async fn run(&self, values: &CheckValues) -> CheckResult {
        let output = if values.envelope_from.is_empty() {
            self.resolver
                .verify_spf_helo(values.peer_ip, &values.helo, &self.local_hostname)
                .await
        } else {
            let Some((_, domain)) = values.envelope_from.split_once('@') else {
                return CheckResult::fail("envelope-from has no domain")
                    .with_data("spf_pass", false);
            };

            self.resolver
                .verify_spf_sender(
                    values.peer_ip,
                    domain,
                    &self.local_hostname,
                    &values.envelope_from,
                )
                .await
        };

        match output.result() {
            SpfResult::Pass => CheckResult::ok("SPF pass").with_data("spf_pass", true),
            other => {
                CheckResult::fail(format!("expected pass, got {other}")).with_data("spf_pass", false)
            }
        }
    }
}

#[async_trait]
impl Check for SpfCheck {
    fn name(&self) -> &'static str {
        "spf"
    }

    async fn validate(&self, values: &CheckValues, cancel: CancellationToken) -> CheckResult {
        tokio::select! {
            result = self.run(values) => result,
            _ = cancel.cancelled() => {
                warn!("spf check cancelled");
                CheckResult::cancelled()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check() -> SpfCheck {
        SpfCheck::new(
            Arc::new(MailAuthResolver::new_cloudflare_tls().unwrap()),
            "relay.test".into(),
        )
    }

    #[tokio::test]
    async fn envelope_from_without_a_domain_fails_closed() {
        let result = check()
            .run(&CheckValues {
                envelope_from: "not-an-email".into(),
                header_from: "not-an-email".into(),
                helo: "mail.example.com".into(),
                data: Arc::from(&b""[..]),
                peer_ip: "1.2.3.4".parse().unwrap(),
            })
            .await;

        assert!(!result.success);
        assert_eq!(result.data.get("spf_pass").and_then(|v| v.as_bool()), Some(false));
    }
}
