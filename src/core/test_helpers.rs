//! Shared test utilities for core module tests
//!
//! This module is only compiled in test mode.

use crate::core::error::{Directive, Error, Result};
use crate::core::forward::ForwardRule;
use crate::core::nft::PacketFilter;
use std::collections::HashSet;
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("NATFWD_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

#[derive(Debug, Default)]
struct MemoryState {
    live: Vec<(Directive, ForwardRule)>,
    fail_apply: HashSet<ForwardRule>,
    fail_masquerade: HashSet<ForwardRule>,
    fail_after_commit: HashSet<ForwardRule>,
    fail_flush: bool,
    fail_remove: bool,
}

/// In-memory [`PacketFilter`] with injectable failures.
///
/// Live state is the ordered list of installed directives, which makes
/// "same live state" a plain equality check.
#[derive(Debug, Default)]
pub struct MemoryFilter {
    state: Mutex<MemoryState>,
}

impl MemoryFilter {
    /// Every installed directive in installation order
    pub fn snapshot(&self) -> Vec<(Directive, ForwardRule)> {
        self.state.lock().unwrap().live.clone()
    }

    /// Rules with both directives installed, in DNAT installation order
    pub fn live_rules(&self) -> Vec<ForwardRule> {
        let state = self.state.lock().unwrap();
        state
            .live
            .iter()
            .filter(|(d, rule)| {
                *d == Directive::Dnat
                    && state
                        .live
                        .iter()
                        .any(|(d2, r2)| *d2 == Directive::Masquerade && r2 == rule)
            })
            .map(|(_, rule)| *rule)
            .collect()
    }

    /// Simulates drift: only the DNAT half of `rule` is live
    pub fn install_half(&self, rule: &ForwardRule) {
        self.state.lock().unwrap().live.push((Directive::Dnat, *rule));
    }

    pub fn fail_apply_for(&self, rule: ForwardRule) {
        self.state.lock().unwrap().fail_apply.insert(rule);
    }

    pub fn fail_masquerade_for(&self, rule: ForwardRule) {
        self.state.lock().unwrap().fail_masquerade.insert(rule);
    }

    /// `apply` installs both directives and still reports a timeout, like an
    /// nft killed after its batch was committed
    pub fn fail_after_commit_for(&self, rule: ForwardRule) {
        self.state.lock().unwrap().fail_after_commit.insert(rule);
    }

    pub fn fail_flush(&self) {
        self.state.lock().unwrap().fail_flush = true;
    }

    pub fn fail_remove(&self) {
        self.state.lock().unwrap().fail_remove = true;
    }
}

fn injected(what: &str) -> Error {
    Error::Nftables {
        message: format!("injected {what} failure"),
        stderr: Some(format!("Error: injected {what} failure")),
        exit_code: Some(1),
    }
}

impl PacketFilter for MemoryFilter {
    async fn apply(&self, rule: &ForwardRule) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_apply.contains(rule) {
            return Err(injected("apply"));
        }
        state.live.push((Directive::Dnat, *rule));
        if state.fail_masquerade.contains(rule) {
            return Err(Error::PartialApply {
                applied: Directive::Dnat,
                failed: Directive::Masquerade,
                message: "injected masquerade failure".to_string(),
            });
        }
        state.live.push((Directive::Masquerade, *rule));
        if state.fail_after_commit.contains(rule) {
            return Err(Error::Timeout(1));
        }
        Ok(())
    }

    async fn remove(&self, rule: &ForwardRule) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_remove {
            return Err(injected("remove"));
        }
        state.live.retain(|(_, r)| r != rule);
        Ok(())
    }

    async fn flush_all(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_flush {
            return Err(injected("flush"));
        }
        state.live.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_twice_is_ok() {
        let filter = MemoryFilter::default();
        let rule: ForwardRule = "tcp 8080 10.0.0.5 80".parse().unwrap();
        filter.apply(&rule).await.unwrap();

        filter.remove(&rule).await.unwrap();
        filter.remove(&rule).await.unwrap();
        assert!(filter.snapshot().is_empty());
    }
}
