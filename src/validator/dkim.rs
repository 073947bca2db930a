//! DKIM check (§4.B.2), grounded on
//! `examples/original_source/internal/validation/checks/dkim.go`: parse the
//! message, verify every signature found, succeed if any one of them passes.

use std::sync::Arc;

use async_trait::async_trait;
use mail_auth::{AuthenticatedMessage, DkimResult, Resolver as MailAuthResolver};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::validator::{Check, CheckResult, CheckValues};

pub struct DkimCheck {
    resolver: Arc<MailAuthResolver>,
}

impl DkimCheck {
    pub fn new(resolver: Arc<MailAuthResolver>) -> Self {
        DkimCheck { resolver }
    }

    async fn run(&self, values: &CheckValues) -> CheckResult {
        let Some(message) = AuthenticatedMessage::parse(&values.data) else {
            return CheckResult::fail("could not parse message for DKIM verification")
                .with_data("dkim_pass", false);
        };

        let results = self.resolver.verify_dkim(&message).await;

        if results.is_empty() {
            return CheckResult::fail("message has no DKIM signatures")
                .with_data("dkim_pass", false);
        }

        for result in &results {
            if *result.result() == DkimResult::Pass {
                let domain = result
                    .signature()
                    .map(|sig| sig.domain().to_string())
                    .unwrap_or_default();

                return CheckResult::ok("found valid DKIM signature")
                    .with_data("dkim_pass", true)
                    .with_data("dkim_domain", domain);
            }
        }

        CheckResult::fail("no DKIM signature verified").with_data("dkim_pass", false)
    }
}

#[async_trait]
impl Check for DkimCheck {
    fn name(&self) -> &'static str {
        "dkim"
    }

    async fn validate(&self, values: &CheckValues, cancel: CancellationToken) -> CheckResult {
        tokio::select! {
            result = self.run(values) => result,
            _ = cancel.cancelled() => {
                warn!("dkim check cancelled");
                CheckResult::cancelled()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check() -> DkimCheck {
        DkimCheck::new(Arc::new(MailAuthResolver::new_cloudflare_tls().unwrap()))
    }

    #[tokio::test]
    async fn unparseable_message_fails_closed() {
        let result = check()
            .run(&CheckValues {
                envelope_from: "john@example.com".into(),
                header_from: "john@example.com".into(),
                helo: "mail.example.com".into(),
                data: Arc::from(&b""[..]),
                peer_ip: "1.2.3.4".parse().unwrap(),
            })
            .await;

        assert!(!result.success);
        assert_eq!(result.data.get("dkim_pass").and_then(|v| v.as_bool()), Some(false));
    }

    #[tokio::test]
    async fn message_with_no_signatures_fails_closed() {
        let message = b"From: john@example.com\r\nTo: jane@example.com\r\nSubject: hi\r\n\r\nbody\r\n";

        let result = check()
            .run(&CheckValues {
                envelope_from: "john@example.com".into(),
                header_from: "john@example.com".into(),
                helo: "mail.example.com".into(),
                data: Arc::from(&message[..]),
                peer_ip: "1.2.3.4".parse().unwrap(),
            })
            .await;

        assert!(!result.success);
        assert_eq!(result.data.get("dkim_pass").and_then(|v| v.as_bool()), Some(false));
    }
}
