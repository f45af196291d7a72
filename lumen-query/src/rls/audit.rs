use chrono::{DateTime, Utc};
use lumen_core::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    /// Access allowed with a row filter
    Filtered,
    /// Access allowed without a row filter
    Unrestricted,
    /// Caller holds a bypass role
    Bypassed,
    Denied,
}

/// One access decision, as written to the audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub user_id: String,
    pub table_name: Option<String>,
    pub policies_evaluated: usize,
    pub policies_applied: Vec<String>,
    pub decision: AuditDecision,
    pub filters: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Destination for audit records.
///
/// Errors are reported back to the service, which logs them and carries on:
/// a failing sink never changes an access decision.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord) -> Result<()>;
}

/// Writes audit records to the `lumen::rls::audit` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) -> Result<()> {
        info!(
            target: "lumen::rls::audit",
            user_id = %record.user_id,
            table = record.table_name.as_deref().unwrap_or("*"),
            policies_evaluated = record.policies_evaluated,
            policies_applied = ?record.policies_applied,
            decision = ?record.decision,
            filters = record.filters.as_deref().unwrap_or(""),
            "RLS access decision"
        );
        Ok(())
    }
}
