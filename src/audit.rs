//! Audit logging for operations that change NAT state
//!
//! Every add, remove, reconcile and flush is appended to `audit.log` in the
//! state directory as one JSON object per line.
use crate::core::forward::ForwardRule;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AddRule,
    RemoveRule,
    ApplyAll,
    Flush,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    /// Whether the operation succeeded
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }

    /// Event for a single-rule mutation
    pub fn for_rule(
        event_type: EventType,
        index: Option<usize>,
        rule: &ForwardRule,
        error: Option<String>,
    ) -> Self {
        Self::new(
            event_type,
            error.is_none(),
            serde_json::json!({
                "index": index,
                "rule": rule.to_string(),
            }),
            error,
        )
    }
}

/// Audit log writer
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Audit log in the XDG state directory
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    /// Audit log at an explicit path
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: &AuditEvent) -> std::io::Result<()> {
        let mut json = serde_json::to_string(event)?;
        json.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Appends an event, downgrading failures to a warning.
    ///
    /// Auditing must never turn a successful NAT change into a failed one.
    pub async fn record(&self, event: AuditEvent) {
        if let Err(e) = self.log(&event).await {
            tracing::warn!("Failed to write audit log {:?}: {}", self.log_path, e);
        }
    }

    /// Reads the most recent events from the log, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(count)
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_event_details() {
        let rule: ForwardRule = "tcp 8080 10.0.0.5 80".parse().unwrap();
        let event = AuditEvent::for_rule(EventType::AddRule, Some(3), &rule, None);

        assert!(event.success);
        assert_eq!(event.details["index"], 3);
        assert_eq!(event.details["rule"], "tcp 8080 10.0.0.5 80");
    }

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(
            EventType::ApplyAll,
            false,
            serde_json::json!({"failed": 2}),
            Some("2 rules failed".to_string()),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("apply_all"));
        assert!(json.contains("2 rules failed"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"timestamp":"2024-01-01T00:00:00Z","event_type":"remove_rule","success":true,"details":{},"error":null}"#;
        let event: AuditEvent = serde_json::from_str(json).unwrap();

        assert!(event.success);
        assert_eq!(event.event_type, EventType::RemoveRule);
    }

    #[tokio::test]
    async fn test_log_and_read_recent() {
        let tmp = tempfile::tempdir().unwrap();
        let audit = AuditLog::at(tmp.path().join("audit.log"));

        audit
            .record(AuditEvent::new(EventType::Flush, true, serde_json::json!({}), None))
            .await;
        audit
            .record(AuditEvent::new(EventType::ApplyAll, true, serde_json::json!({}), None))
            .await;

        let recent = audit.read_recent(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event_type, EventType::ApplyAll);
        assert_eq!(audit.read_recent(10).await.unwrap().len(), 2);
    }
}
