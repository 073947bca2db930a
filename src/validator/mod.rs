//! Authentication/reputation validator (components B, C, D).
//!
//! [`Validator::run_checks`] fans the stateless checks (§4.B) out
//! concurrently under a single cancellation scope, joins them, then runs
//! DMARC (§4.C) synchronously against the aggregated [`SharedState`].

pub mod dkim;
pub mod dmarc;
pub mod dnsbl;
pub mod reverse_dns;
pub mod spf;

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::validator::dmarc::DmarcEvaluator;

/// Immutable input to any check (§3).
#[derive(Debug, Clone)]
pub struct CheckValues {
    pub envelope_from: String,
    pub header_from: String,
    pub helo: String,
    pub data: Arc<[u8]>,
    pub peer_ip: IpAddr,
}

/// Output of a single check (§3). `reject` dominates `quarantine`;
/// `success == true` implies neither is set.
#[derive(Debug, Clone, Default)]
pub struct CheckResult {
    pub success: bool,
    pub reject: bool,
    pub quarantine: bool,
    pub message: String,
    pub data: HashMap<String, Value>,
}

impl CheckResult {
    pub fn ok(message: impl Into<String>) -> Self {
        CheckResult {
            success: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        CheckResult {
            success: false,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn reject(message: impl Into<String>) -> Self {
        CheckResult {
            success: false,
            reject: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn cancelled() -> Self {
        CheckResult::fail("cancelled")
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }
}

/// Mapping populated by parallel checks, read by DMARC. One message's lifetime.
pub type SharedState = HashMap<String, Value>;

/// Validator output (§3).
#[derive(Debug, Clone, Default)]
pub struct Verdict {
    pub reject: bool,
    pub reason: Option<String>,
    pub quarantine: bool,
}

/// One stateless check (§4.B): a pure function of [`CheckValues`] plus a
/// cancellation signal.
#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &'static str;
    async fn validate(&self, values: &CheckValues, cancel: CancellationToken) -> CheckResult;
}

/// Component D: runs the stateless checks concurrently, then DMARC.
///
/// Constructed once per process with its check list and DMARC evaluator, so
/// tests can inject fakes (§9 "avoid any global check registry").
pub struct Validator {
    checks: Vec<Arc<dyn Check>>,
    dmarc: DmarcEvaluator,
}

impl Validator {
    pub fn new(checks: Vec<Arc<dyn Check>>, dmarc: DmarcEvaluator) -> Self {
        Validator { checks, dmarc }
    }

    /// `session_cancel` is the session-scoped token (client disconnect or
    /// process shutdown, §5 "Cancellation semantics"); the first-reject-wins
    /// fan-out token is a child of it so an external cancellation tears down
    /// every in-flight check too, not just siblings of a rejecting one.
    pub async fn run_checks(&self, values: CheckValues, session_cancel: CancellationToken) -> Verdict {
        let cancel = session_cancel.child_token();
        let reason: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let quarantine = Arc::new(AtomicBool::new(false));
        let state: Arc<Mutex<SharedState>> = Arc::new(Mutex::new(HashMap::new()));

        let handles: Vec<_> = self
            .checks
            .iter()
            .cloned()
            .map(|check| {
                let values = values.clone();
                let cancel = cancel.clone();
                let reason = reason.clone();
                let quarantine = quarantine.clone();
                let state = state.clone();

                tokio::spawn(async move {
                    let result = check.validate(&values, cancel.clone()).await;

                    info!(
                        check = check.name(),
                        success = result.success,
                        reject = result.reject,
                        quarantine = result.quarantine,
                        message = %result.message,
                        "check finished"
                    );

                    if result.reject {
                        let mut guard = reason.lock().await;
                        if guard.is_none() {
                            *guard = Some(result.message.clone());
                        }
                        cancel.cancel();
                    }

                    if result.quarantine {
                        quarantine.store(true, Ordering::SeqCst);
                    }

                    if !result.reject {
                        state.lock().await.extend(result.data);
                    }
                })
            })
            .collect();

        // Join every launched task, cancellation or not: no leaked tasks (§8 invariant 6).
        futures::future::join_all(handles).await;

        if let Some(reason) = reason.lock().await.clone() {
            return Verdict {
                reject: true,
                reason: Some(reason),
                quarantine: false,
            };
        }

        let aggregated = state.lock().await.clone();
        let dmarc_result = self.dmarc.evaluate(&values, &aggregated).await;

        if dmarc_result.reject {
            return Verdict {
                reject: true,
                reason: Some(dmarc_result.message),
                quarantine: false,
            };
        }

        Verdict {
            reject: false,
            reason: None,
            quarantine: quarantine.load(Ordering::SeqCst) || dmarc_result.quarantine,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::IpAddr, time::Duration};

    use super::*;
    use crate::{resolver::fixture::FixtureResolver, validator::dmarc::DmarcEvaluator};

    struct FakeCheck {
        name: &'static str,
        result: CheckResult,
        delay: Duration,
    }

    #[async_trait]
    impl Check for FakeCheck {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn validate(&self, _values: &CheckValues, cancel: CancellationToken) -> CheckResult {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => self.result.clone(),
                _ = cancel.cancelled() => CheckResult::cancelled(),
            }
        }
    }

    fn values() -> CheckValues {
        CheckValues {
            envelope_from: "john@example.com".into(),
            header_from: "john@example.com".into(),
            helo: "mail.example.com".into(),
            data: Arc::from(&b""[..]),
            peer_ip: "1.2.3.4".parse::<IpAddr>().unwrap(),
        }
    }

    fn dmarc() -> DmarcEvaluator {
        DmarcEvaluator::new(Arc::new(FixtureResolver::new()))
    }

    #[tokio::test]
    async fn all_checks_pass_is_not_a_reject_or_quarantine() {
        let checks: Vec<Arc<dyn Check>> = vec![
            Arc::new(FakeCheck {
                name: "a",
                result: CheckResult::ok("fine")
                    .with_data("spf_pass", true)
                    .with_data("dkim_pass", true),
                delay: Duration::from_millis(1),
            }),
        ];
        let validator = Validator::new(checks, dmarc());

        let verdict = validator.run_checks(values(), CancellationToken::new()).await;

        assert!(!verdict.reject);
        assert!(!verdict.quarantine);
    }

    #[tokio::test]
    async fn one_rejecting_check_cancels_its_siblings() {
        let checks: Vec<Arc<dyn Check>> = vec![
            Arc::new(FakeCheck {
                name: "rejects-fast",
                result: CheckResult::reject("listed"),
                delay: Duration::from_millis(1),
            }),
            Arc::new(FakeCheck {
                name: "would-pass-slowly",
                result: CheckResult::ok("fine")
                    .with_data("spf_pass", true)
                    .with_data("dkim_pass", true),
                delay: Duration::from_secs(30),
            }),
        ];
        let validator = Validator::new(checks, dmarc());

        let verdict = tokio::time::timeout(
            Duration::from_secs(1),
            validator.run_checks(values(), CancellationToken::new()),
        )
        .await
        .expect("reject should cancel the slower sibling instead of waiting out its delay");

        assert!(verdict.reject);
        assert_eq!(verdict.reason.as_deref(), Some("listed"));
    }

    #[tokio::test]
    async fn quarantine_without_reject_surfaces_as_quarantine() {
        let checks: Vec<Arc<dyn Check>> = vec![Arc::new(FakeCheck {
            name: "quarantines",
            result: CheckResult {
                success: true,
                reject: false,
                quarantine: true,
                message: "suspicious".into(),
                data: HashMap::from([
                    ("spf_pass".to_string(), true.into()),
                    ("dkim_pass".to_string(), true.into()),
                ]),
            },
            delay: Duration::from_millis(1),
        })];
        let validator = Validator::new(checks, dmarc());

        let verdict = validator.run_checks(values(), CancellationToken::new()).await;

        assert!(!verdict.reject);
        assert!(verdict.quarantine);
    }

    #[tokio::test]
    async fn external_cancellation_tears_down_in_flight_checks() {
        let checks: Vec<Arc<dyn Check>> = vec![Arc::new(FakeCheck {
            name: "slow",
            result: CheckResult::ok("fine")
                .with_data("spf_pass", true)
                .with_data("dkim_pass", true),
            delay: Duration::from_secs(30),
        })];
        let validator = Validator::new(checks, dmarc());

        let session_cancel = CancellationToken::new();
        session_cancel.cancel();

        let verdict = tokio::time::timeout(
            Duration::from_secs(1),
            validator.run_checks(values(), session_cancel),
        )
        .await
        .expect("a pre-cancelled session token should tear down the check immediately");

        // The lone check was cancelled, not rejected, so there's no reason to reject.
        assert!(!verdict.reject);
    }
}
