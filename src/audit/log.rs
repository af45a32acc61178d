//! Append-only audit log.
//!
//! Newline-delimited JSON at `logs/audit.log`, sequential by arrival, with
//! an in-memory tail ring for the dashboard endpoints. Audit writes never
//! fail a request: file errors are logged and the entry still lands in the
//! ring.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// The closed event set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    CoverageActivated,
    CoverageRenewed,
    CoverageExpired,
    CoverageDuplicate,
    HedgeAction,
    HedgeOrder,
    LiquidityUpdate,
    MtmCredit,
    PutQuote,
    PutQuoteFailed,
    PutRenew,
    PutRenewFailed,
    OptionExecFailed,
    CloseBlocked,
    PutRenewSkipped,
    PortfolioIngest,
    LoopTick,
    AuditSeed,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::CoverageActivated => "coverage_activated",
            AuditEvent::CoverageRenewed => "coverage_renewed",
            AuditEvent::CoverageExpired => "coverage_expired",
            AuditEvent::CoverageDuplicate => "coverage_duplicate",
            AuditEvent::HedgeAction => "hedge_action",
            AuditEvent::HedgeOrder => "hedge_order",
            AuditEvent::LiquidityUpdate => "liquidity_update",
            AuditEvent::MtmCredit => "mtm_credit",
            AuditEvent::PutQuote => "put_quote",
            AuditEvent::PutQuoteFailed => "put_quote_failed",
            AuditEvent::PutRenew => "put_renew",
            AuditEvent::PutRenewFailed => "put_renew_failed",
            AuditEvent::OptionExecFailed => "option_exec_failed",
            AuditEvent::CloseBlocked => "close_blocked",
            AuditEvent::PutRenewSkipped => "put_renew_skipped",
            AuditEvent::PortfolioIngest => "portfolio_ingest",
            AuditEvent::LoopTick => "loop_tick",
            AuditEvent::AuditSeed => "audit_seed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: DateTime<Utc>,
    pub event: AuditEvent,
    pub payload: serde_json::Value,
}

const TAIL_CAPACITY: usize = 2_000;

pub struct AuditLog {
    path: PathBuf,
    tail: parking_lot::Mutex<VecDeque<AuditEntry>>,
    /// Serializes file appends so entries hit disk in arrival order.
    file_gate: tokio::sync::Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tail: parking_lot::Mutex::new(VecDeque::with_capacity(TAIL_CAPACITY)),
            file_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. Infallible by contract: disk trouble degrades to
    /// ring-only with a warning.
    pub async fn append(&self, event: AuditEvent, payload: serde_json::Value) {
        let entry = AuditEntry {
            ts: Utc::now(),
            event,
            payload,
        };

        {
            let mut tail = self.tail.lock();
            if tail.len() >= TAIL_CAPACITY {
                tail.pop_front();
            }
            tail.push_back(entry.clone());
        }

        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "audit entry failed to serialize");
                return;
            }
        };

        let _gate = self.file_gate.lock().await;
        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!(error = %e, path = %self.path.display(), "audit append failed");
        }
    }

    /// Newest-last tail of at most `limit` entries.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let tail = self.tail.lock();
        let skip = tail.len().saturating_sub(limit);
        tail.iter().skip(skip).cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.tail.lock().len()
    }

    /// Drop the file and the ring. Used by `/admin/reset`.
    pub async fn reset(&self) {
        let _gate = self.file_gate.lock().await;
        self.tail.lock().clear();
        let _ = tokio::fs::remove_file(&self.path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_tail_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.log"));
        log.append(AuditEvent::AuditSeed, serde_json::json!({"seed": 1}))
            .await;
        log.append(
            AuditEvent::CoverageActivated,
            serde_json::json!({"coverageId": "a"}),
        )
        .await;

        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event, AuditEvent::AuditSeed);
        assert_eq!(recent[1].event, AuditEvent::CoverageActivated);
        assert!(recent[0].ts <= recent[1].ts);

        let raw = std::fs::read_to_string(dir.path().join("audit.log")).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.event, AuditEvent::AuditSeed);
    }

    #[tokio::test]
    async fn test_append_survives_unwritable_path() {
        // Points at a directory; the file append fails but the ring holds.
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        log.append(AuditEvent::LoopTick, serde_json::json!({})).await;
        assert_eq!(log.count(), 1);
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let log = AuditLog::new(path.clone());
        log.append(AuditEvent::LoopTick, serde_json::json!({})).await;
        log.reset().await;
        assert_eq!(log.count(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_event_wire_tags() {
        assert_eq!(AuditEvent::PutQuoteFailed.as_str(), "put_quote_failed");
        let json = serde_json::to_string(&AuditEvent::CoverageDuplicate).unwrap();
        assert_eq!(json, "\"coverage_duplicate\"");
    }
}
