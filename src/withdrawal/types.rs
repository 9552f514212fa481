//! Withdrawal request types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Withdrawal status state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Approved,
    Processing,
    Completed,
    Failed,
    Rejected,
    Cancelled,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Approved => "approved",
            WithdrawalStatus::Processing => "processing",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Failed => "failed",
            WithdrawalStatus::Rejected => "rejected",
            WithdrawalStatus::Cancelled => "cancelled",
        }
    }

    /// Requests that still hold funds and count against the pending ceiling
    pub fn is_outstanding(&self) -> bool {
        matches!(
            self,
            WithdrawalStatus::Pending | WithdrawalStatus::Approved | WithdrawalStatus::Processing
        )
    }

    /// Requests whose amount counts toward the rolling limits
    pub fn counts_toward_limits(&self) -> bool {
        !matches!(
            self,
            WithdrawalStatus::Rejected | WithdrawalStatus::Cancelled | WithdrawalStatus::Failed
        )
    }

    pub fn can_transition_to(&self, next: WithdrawalStatus) -> bool {
        use WithdrawalStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Cancelled)
                | (Approved, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    AutoApproved,
    ManuallyApproved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

/// Where the payout goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutTarget {
    pub network: String,
    pub address: String,
    pub memo: Option<String>,
}

/// Rate captured at approval and reused at dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    pub rate: f64,
    pub payout_currency: String,
    pub payout_amount: u64,
    pub quoted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub withdrawal_id: String,
    pub player_id: String,
    pub amount: u64,
    pub fee_amount: u64,
    pub net_amount: u64,
    pub currency: String,
    pub target: PayoutTarget,
    pub ip_address: Option<String>,
    pub status: WithdrawalStatus,
    pub approval_status: ApprovalStatus,
    pub risk_score: u32,
    pub risk_level: RiskLevel,
    pub risk_factors: Vec<String>,
    pub conversion: Option<Conversion>,
    pub gateway_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub rejection_reason: Option<String>,
    pub reviewed_by: Option<String>,
    pub processing_attempts: u32,
    pub requested_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    /// Sequence of the last audit entry
    pub audit_seq: u32,
}

/// Input for a new withdrawal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWithdrawal {
    pub player_id: String,
    pub amount: u64,
    pub target: PayoutTarget,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum AuditActor {
    System,
    Player(String),
    Admin(String),
}

/// Append-only record of one status transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalAuditEntry {
    pub seq: u32,
    pub withdrawal_id: String,
    pub actor: AuditActor,
    pub old_status: Option<WithdrawalStatus>,
    pub new_status: WithdrawalStatus,
    pub details: serde_json::Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub attempted: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}
