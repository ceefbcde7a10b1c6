//! Flush-and-rebuild reconciliation of live state against the store
//!
//! [`apply_all`] is the recovery path (boot, explicit `natfwd apply`): it
//! clears every directive the filter owns, then applies each rule in store
//! order. It is not a diff. After a clean run, live state depends only on the
//! rules passed in, never on what was installed before.
//!
//! One failing rule does not stop the others; failures are collected in the
//! [`ApplyReport`].

use crate::core::error::{Error, Result};
use crate::core::forward::ForwardRule;
use crate::core::nft::PacketFilter;
use tracing::{info, warn};

/// A rule that could not be applied during reconciliation
#[derive(Debug)]
pub struct ApplyFailure {
    /// Position of the rule in the store
    pub index: usize,
    pub rule: ForwardRule,
    pub error: Error,
}

/// Aggregate outcome of [`apply_all`]
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Number of rules whose directives were fully installed
    pub applied: usize,
    pub failures: Vec<ApplyFailure>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of rules attempted
    pub fn total(&self) -> usize {
        self.applied + self.failures.len()
    }
}

/// Flushes all filter-owned directives, then applies every rule in order.
///
/// # Errors
///
/// Only a failed flush is an error: without it the resulting live state
/// would not be a function of `rules` alone. Per-rule failures are reported
/// in the returned [`ApplyReport`].
pub async fn apply_all<F: PacketFilter>(filter: &F, rules: &[ForwardRule]) -> Result<ApplyReport> {
    filter.flush_all().await?;

    let mut report = ApplyReport::default();
    for (index, rule) in rules.iter().enumerate() {
        match filter.apply(rule).await {
            Ok(()) => report.applied += 1,
            Err(error) => {
                warn!("Rule {index} [{rule}] failed to apply: {error}");
                report.failures.push(ApplyFailure {
                    index,
                    rule: *rule,
                    error,
                });
            }
        }
    }

    info!(
        "Reconciled {} rule(s): {} applied, {} failed",
        report.total(),
        report.applied,
        report.failures.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::MemoryFilter;

    fn rule(line: &str) -> ForwardRule {
        line.parse().unwrap()
    }

    #[tokio::test]
    async fn test_apply_all_from_empty() {
        let filter = MemoryFilter::default();
        let rules = [rule("tcp 8080 10.0.0.5 80"), rule("udp 53 10.0.0.2 53")];

        let report = apply_all(&filter, &rules).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.applied, 2);
        assert_eq!(filter.live_rules(), rules.to_vec());
    }

    #[tokio::test]
    async fn test_apply_all_is_independent_of_prior_state() {
        let rules = [rule("tcp 8080 10.0.0.5 80"), rule("udp 53 10.0.0.2 53")];

        let clean = MemoryFilter::default();
        apply_all(&clean, &rules).await.unwrap();

        let dirty = MemoryFilter::default();
        dirty.apply(&rule("tcp 22 10.0.0.9 22")).await.unwrap();
        dirty.apply(&rules[1]).await.unwrap();
        dirty.install_half(&rule("tcp 443 10.0.0.7 443"));
        apply_all(&dirty, &rules).await.unwrap();

        assert_eq!(dirty.snapshot(), clean.snapshot());
    }

    #[tokio::test]
    async fn test_apply_all_twice_is_stable() {
        let filter = MemoryFilter::default();
        let rules = [rule("tcp 8080 10.0.0.5 80")];

        apply_all(&filter, &rules).await.unwrap();
        let first = filter.snapshot();
        apply_all(&filter, &rules).await.unwrap();
        assert_eq!(filter.snapshot(), first);
    }

    #[tokio::test]
    async fn test_failure_is_contained() {
        let r1 = rule("tcp 1000 10.0.0.1 80");
        let r2 = rule("tcp 2000 10.0.0.2 80");
        let r3 = rule("tcp 3000 10.0.0.3 80");

        let filter = MemoryFilter::default();
        filter.fail_apply_for(r2);

        let report = apply_all(&filter, &[r1, r2, r3]).await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.total(), 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 1);
        assert_eq!(report.failures[0].rule, r2);
        assert_eq!(filter.live_rules(), vec![r1, r3]);
    }

    #[tokio::test]
    async fn test_flush_failure_aborts() {
        let filter = MemoryFilter::default();
        filter.fail_flush();

        let result = apply_all(&filter, &[rule("tcp 8080 10.0.0.5 80")]).await;
        assert!(result.is_err());
        assert!(filter.live_rules().is_empty());
    }

    #[tokio::test]
    async fn test_empty_store_clears_live_state() {
        let filter = MemoryFilter::default();
        filter.apply(&rule("tcp 8080 10.0.0.5 80")).await.unwrap();

        let report = apply_all(&filter, &[]).await.unwrap();
        assert_eq!(report.total(), 0);
        assert!(filter.snapshot().is_empty());
    }
}
