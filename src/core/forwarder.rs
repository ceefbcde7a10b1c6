//! Caller-facing forwarding operations
//!
//! [`PortForwarder`] ties the [`RuleStore`] to a [`PacketFilter`]: single-rule
//! changes are persisted first and then mirrored to live state, and
//! [`PortForwarder::apply_all`] rebuilds live state from the store.
//!
//! `add_rule` is all-or-nothing. If the live apply fails, whatever part of
//! the rule reached the kernel is removed again and the stored rule is rolled
//! back; the caller gets [`Error::RolledBack`]. When undoing fails, the caller
//! gets [`Error::RollbackFailed`] instead, so a rule that is still stored or
//! still live is never reported as simply "not added".
//! `remove_rule` keeps the store change even if the live delete fails,
//! because the store is the source of truth and the next `apply_all`
//! converges.

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::core::error::{Error, Result};
use crate::core::forward::ForwardRule;
use crate::core::nft::PacketFilter;
use crate::core::reconcile::{self, ApplyReport};
use crate::core::store::RuleStore;
use tracing::{error, info, warn};

pub struct PortForwarder<F> {
    store: RuleStore,
    filter: F,
    audit: Option<AuditLog>,
}

impl<F: PacketFilter> PortForwarder<F> {
    pub fn new(store: RuleStore, filter: F) -> Self {
        Self {
            store,
            filter,
            audit: None,
        }
    }

    /// Records every mutation in `audit`
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    async fn audit(&self, event: AuditEvent) {
        if let Some(audit) = &self.audit {
            audit.record(event).await;
        }
    }

    /// Validates, persists and applies a new forwarding rule.
    pub async fn add_rule(
        &mut self,
        protocol: &str,
        external_port: &str,
        host: &str,
        port: &str,
    ) -> Result<ForwardRule> {
        let rule = ForwardRule::parse(protocol, external_port, host, port)?;
        if let Some(warning) = crate::validators::check_destination(rule.destination) {
            warn!("[{rule}]: {warning}");
        }

        let result = self.insert(rule).await;
        let index = result.as_ref().ok().copied();
        self.audit(AuditEvent::for_rule(
            EventType::AddRule,
            index,
            &rule,
            result.as_ref().err().map(ToString::to_string),
        ))
        .await;

        result.map(|_| rule)
    }

    async fn insert(&mut self, rule: ForwardRule) -> Result<usize> {
        let index = self.store.add(rule).await?;

        let Err(apply_err) = self.filter.apply(&rule).await else {
            info!("Added rule {index} [{rule}]");
            return Ok(index);
        };

        error!("Applying [{rule}] failed, rolling back: {apply_err}");

        // A failed or timed-out apply may still have committed directives
        let live = self.filter.remove(&rule).await;
        let stored = self.store.remove_at(index).await;

        let apply = Box::new(apply_err);
        match (live, stored) {
            (Ok(()), Ok(_)) => Err(Error::RolledBack { cause: apply }),
            (live, Err(e)) => {
                if let Err(live_err) = live {
                    error!("Could not remove live directives for [{rule}]: {live_err}");
                }
                error!("[{rule}] is still stored at index {index}: {e}");
                Err(Error::RollbackFailed {
                    apply,
                    rollback: Box::new(e),
                })
            }
            (Err(e), Ok(_)) => {
                error!("[{rule}] may still be live until the next apply: {e}");
                Err(Error::RollbackFailed {
                    apply,
                    rollback: Box::new(e),
                })
            }
        }
    }

    /// Removes the rule at `index` from the store and from live state.
    pub async fn remove_rule(&mut self, index: usize) -> Result<ForwardRule> {
        let rule = self.store.remove_at(index).await?;

        let result = self.filter.remove(&rule).await;
        match &result {
            Ok(()) => info!("Removed rule {index} [{rule}]"),
            Err(e) => error!("Rule {index} [{rule}] removed from store but live delete failed: {e}"),
        }

        self.audit(AuditEvent::for_rule(
            EventType::RemoveRule,
            Some(index),
            &rule,
            result.as_ref().err().map(ToString::to_string),
        ))
        .await;

        result.map(|()| rule)
    }

    /// Current rules with their 0-based positions
    pub fn list_rules(&self) -> Vec<(usize, ForwardRule)> {
        self.store.list()
    }

    /// Flushes live state and re-applies every stored rule.
    pub async fn apply_all(&self) -> Result<ApplyReport> {
        let result = reconcile::apply_all(&self.filter, self.store.rules()).await;

        let event = match &result {
            Ok(report) => AuditEvent::new(
                EventType::ApplyAll,
                report.is_success(),
                serde_json::json!({
                    "applied": report.applied,
                    "failed": report
                        .failures
                        .iter()
                        .map(|f| f.rule.to_string())
                        .collect::<Vec<_>>(),
                }),
                (!report.is_success())
                    .then(|| format!("{} of {} rules failed", report.failures.len(), report.total())),
            ),
            Err(e) => AuditEvent::new(
                EventType::ApplyAll,
                false,
                serde_json::json!({ "rule_count": self.store.len() }),
                Some(e.to_string()),
            ),
        };
        self.audit(event).await;

        result
    }

    /// Clears live state without touching the store.
    pub async fn flush_live(&self) -> Result<()> {
        let result = self.filter.flush_all().await;
        self.audit(AuditEvent::new(
            EventType::Flush,
            result.is_ok(),
            serde_json::json!({}),
            result.as_ref().err().map(ToString::to_string),
        ))
        .await;
        result
    }
}
