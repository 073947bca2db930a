//! DMARC evaluator (§4.C), grounded nearly 1:1 on
//! `examples/original_source/internal/validation/checks/dmarc.go`: domain
//! splitting, alignment, and policy mapping all follow it directly. Unlike
//! the stateless checks, it reads [`SharedState`] synchronously after they
//! join rather than racing them (§9 "DMARC ordering" open question).

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::{
    resolver::Resolve,
    validator::{CheckValues, SharedState},
};

#[derive(Debug, Error)]
enum RecordError {
    #[error("no DMARC record published")]
    Absent,
    #[error("dns lookup failed: {0}")]
    Lookup(String),
    #[error("malformed DMARC record: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Alignment {
    Strict,
    Relaxed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Policy {
    None,
    Quarantine,
    Reject,
    /// A syntactically present but unrecognized `p=` value. RFC 7489 §6.4
    /// doesn't define a fallback, but §4.C step 7 treats "unknown" as its own
    /// terminal outcome, not a parse failure: it still goes through alignment
    /// before ending in a reject.
    Unknown,
}

struct DmarcRecord {
    policy: Policy,
    dkim_alignment: Alignment,
    spf_alignment: Alignment,
}

/// Parses the handful of tags this evaluator cares about (`v`, `p`, `adkim`,
/// `aspf`) out of a DMARC TXT record, RFC 7489 §6.4.
fn parse_record(raw: &str) -> Result<DmarcRecord, RecordError> {
    let mut saw_v = false;
    let mut policy = None;
    let mut dkim_alignment = Alignment::Relaxed;
    let mut spf_alignment = Alignment::Relaxed;

    for tag in raw.split(';') {
        let tag = tag.trim();
        let Some((key, value)) = tag.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());

        match key {
            "v" => {
                if !value.eq_ignore_ascii_case("DMARC1") {
                    return Err(RecordError::Malformed(format!("unexpected version: {value}")));
                }
                saw_v = true;
            }
            "p" => {
                policy = Some(match value {
                    "none" => Policy::None,
                    "quarantine" => Policy::Quarantine,
                    "reject" => Policy::Reject,
                    _ => Policy::Unknown,
                });
            }
            "adkim" => {
                dkim_alignment = match value {
                    "s" => Alignment::Strict,
                    "r" => Alignment::Relaxed,
                    other => {
                        return Err(RecordError::Malformed(format!("unknown adkim: {other}")));
                    }
                };
            }
            "aspf" => {
                spf_alignment = match value {
                    "s" => Alignment::Strict,
                    "r" => Alignment::Relaxed,
                    other => return Err(RecordError::Malformed(format!("unknown aspf: {other}"))),
                };
            }
            _ => {}
        }
    }

    if !saw_v {
        return Err(RecordError::Malformed("missing v= tag".into()));
    }

    Ok(DmarcRecord {
        policy: policy.ok_or_else(|| RecordError::Malformed("missing p= tag".into()))?,
        dkim_alignment,
        spf_alignment,
    })
}

pub struct DmarcResult {
    pub reject: bool,
    pub quarantine: bool,
    pub message: String,
}

impl DmarcResult {
    fn pass(message: impl Into<String>) -> Self {
        DmarcResult {
            reject: false,
            quarantine: false,
            message: message.into(),
        }
    }

    fn quarantine(message: impl Into<String>) -> Self {
        DmarcResult {
            reject: false,
            quarantine: true,
            message: message.into(),
        }
    }

    fn reject(message: impl Into<String>) -> Self {
        DmarcResult {
            reject: true,
            quarantine: false,
            message: message.into(),
        }
    }
}

pub struct DmarcEvaluator {
    resolver: Arc<dyn Resolve>,
}

impl DmarcEvaluator {
    pub fn new(resolver: Arc<dyn Resolve>) -> Self {
        DmarcEvaluator { resolver }
    }

    async fn lookup(&self, domain: &str) -> Result<DmarcRecord, RecordError> {
        let query = format!("_dmarc.{domain}");

        let records = match self.resolver.lookup_txt(&query).await {
            Ok(records) => records,
            Err(e) if e.is_not_found() => return Err(RecordError::Absent),
            Err(e) => return Err(RecordError::Lookup(e.to_string())),
        };

        let record = records
            .iter()
            .find(|r| r.starts_with("v=DMARC1"))
            .ok_or(RecordError::Absent)?;

        parse_record(record)
    }

    fn is_aligned(from_domain: &str, auth_domain: &str, mode: Alignment) -> bool {
        if mode == Alignment::Strict {
            return from_domain.eq_ignore_ascii_case(auth_domain);
        }

        let (Some(org_from), Some(org_auth)) =
            (psl::domain_str(from_domain), psl::domain_str(auth_domain))
        else {
            return false;
        };

        org_from.eq_ignore_ascii_case(org_auth)
    }

    pub async fn evaluate(&self, values: &CheckValues, state: &SharedState) -> DmarcResult {
        let Some((_, header_from_domain)) = values.header_from.split_once('@') else {
            return DmarcResult::reject(format!(
                "header-from split failed: {}",
                values.header_from
            ));
        };

        let Some((_, envelope_from_domain)) = values.envelope_from.split_once('@') else {
            return DmarcResult::reject(format!(
                "envelope-from split failed: {}",
                values.envelope_from
            ));
        };

        let (Some(spf_pass), Some(dkim_pass)) = (
            state.get("spf_pass").and_then(|v| v.as_bool()),
            state.get("dkim_pass").and_then(|v| v.as_bool()),
        ) else {
            return DmarcResult::reject("required check state is missing");
        };

        let record = match self.lookup(header_from_domain).await {
            Ok(record) => record,
            Err(RecordError::Absent) => {
                // No DMARC policy published at all: pass outright, distinct
                // from a lookup/parse error below.
                return DmarcResult::pass("no DMARC record published");
            }
            Err(e) => {
                if !spf_pass || !dkim_pass {
                    debug!(error = %e, "dmarc lookup failed alongside spf/dkim failure");
                    return DmarcResult::reject("SPF or DKIM failed, with DMARC failing too");
                }
                return DmarcResult::pass("dmarc lookup failed but spf and dkim passed");
            }
        };

        let dkim_domain = state
            .get("dkim_domain")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let dkim_aligned =
            Self::is_aligned(header_from_domain, dkim_domain, record.dkim_alignment);
        let spf_aligned = Self::is_aligned(
            header_from_domain,
            envelope_from_domain,
            record.spf_alignment,
        );

        if (spf_aligned && spf_pass) || (dkim_aligned && dkim_pass) {
            return DmarcResult::pass("dmarc pass");
        }

        match record.policy {
            Policy::None => DmarcResult::quarantine("dmarc policy is none"),
            Policy::Quarantine => DmarcResult::quarantine("dmarc quarantine"),
            Policy::Reject => DmarcResult::reject("dmarc reject"),
            Policy::Unknown => DmarcResult::reject("dmarc policy is unrecognized"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::resolver::fixture::FixtureResolver;

    fn values() -> CheckValues {
        CheckValues {
            envelope_from: "bounce@example.com".into(),
            header_from: "john@example.com".into(),
            helo: "mail.example.com".into(),
            data: Arc::from(&b""[..]),
            peer_ip: "1.2.3.4".parse().unwrap(),
        }
    }

    fn aligned_state() -> SharedState {
        let mut state = HashMap::new();
        state.insert("spf_pass".into(), true.into());
        state.insert("dkim_pass".into(), true.into());
        state.insert("dkim_domain".into(), "example.com".into());
        state
    }

    #[tokio::test]
    async fn no_record_passes() {
        let resolver = Arc::new(FixtureResolver::new());
        let evaluator = DmarcEvaluator::new(resolver);

        let result = evaluator.evaluate(&values(), &aligned_state()).await;

        assert!(!result.reject);
        assert!(!result.quarantine);
    }

    #[tokio::test]
    async fn aligned_pass_overrides_strict_policy() {
        let resolver = Arc::new(
            FixtureResolver::new().with_txt("_dmarc.example.com", "v=DMARC1; p=reject"),
        );
        let evaluator = DmarcEvaluator::new(resolver);

        let result = evaluator.evaluate(&values(), &aligned_state()).await;

        assert!(!result.reject);
        assert!(!result.quarantine);
    }

    #[tokio::test]
    async fn misaligned_quarantine_policy_quarantines() {
        let resolver = Arc::new(
            FixtureResolver::new().with_txt("_dmarc.example.com", "v=DMARC1; p=quarantine"),
        );
        let evaluator = DmarcEvaluator::new(resolver);

        let mut state = aligned_state();
        state.insert("spf_pass".into(), false.into());
        state.insert("dkim_pass".into(), false.into());

        let result = evaluator.evaluate(&values(), &state).await;

        assert!(!result.reject);
        assert!(result.quarantine);
    }

    #[tokio::test]
    async fn misaligned_reject_policy_rejects() {
        let resolver = Arc::new(
            FixtureResolver::new().with_txt("_dmarc.example.com", "v=DMARC1; p=reject"),
        );
        let evaluator = DmarcEvaluator::new(resolver);

        let mut state = aligned_state();
        state.insert("spf_pass".into(), false.into());
        state.insert("dkim_pass".into(), false.into());

        let result = evaluator.evaluate(&values(), &state).await;

        assert!(result.reject);
    }

    #[tokio::test]
    async fn unrecognized_policy_value_rejects_after_alignment() {
        let resolver = Arc::new(
            FixtureResolver::new().with_txt("_dmarc.example.com", "v=DMARC1; p=somethingelse"),
        );
        let evaluator = DmarcEvaluator::new(resolver);

        let mut state = aligned_state();
        state.insert("spf_pass".into(), false.into());
        state.insert("dkim_pass".into(), false.into());

        let result = evaluator.evaluate(&values(), &state).await;

        assert!(result.reject);
        assert_eq!(result.message, "dmarc policy is unrecognized");
    }
}
