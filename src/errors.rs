//! Error types for the cashier core
//!
//! One root error carries the whole domain taxonomy so that every caller
//! (admin tooling, provider callbacks, the worker) maps failures to the same
//! finite set of codes.

use std::fmt;

/// Root error type for all cashier operations
#[derive(Debug, thiserror::Error)]
pub enum CashierError {
    /// Malformed or missing input, surfaced verbatim to the caller
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Main and bonus wallets combined cannot cover the amount
    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: u64, available: u64 },

    #[error("Insufficient bonus balance: requested {requested}, available {available}")]
    InsufficientBonusBalance { requested: u64, available: u64 },

    /// The active bonus cannot be used for betting
    #[error("Bonus {instance_id} is not playable")]
    BonusNotPlayable { instance_id: String },

    #[error("Ineligible for bonus: {0}")]
    IneligibleForBonus(IneligibilityReason),

    /// Idempotent replay of a grant, deposit, bet or provider transaction
    #[error("Duplicate operation: {0}")]
    DuplicateOperation(String),

    /// Withdrawal held for manual review
    #[error("Withdrawal blocked by risk review (score {score})")]
    RiskBlocked { score: u32 },

    #[error("{window} withdrawal limit exceeded: {used} already used, {requested} requested, limit {limit}")]
    LimitExceeded {
        window: LimitWindow,
        used: u64,
        requested: u64,
        limit: u64,
    },

    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// External payout failed; the request has been compensated
    #[error("Payout gateway failure: {0}")]
    GatewayFailure(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Why a player cannot receive a bonus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IneligibilityReason {
    InvalidOrExpiredCode,
    CodeUsageLimitReached,
    AlreadyClaimed,
    MaxTriggersReached,
    BelowMinimumBonus,
    WrongTriggerType,
    PlanInactive,
}

impl IneligibilityReason {
    pub fn code(&self) -> &'static str {
        match self {
            IneligibilityReason::InvalidOrExpiredCode => "INVALID_OR_EXPIRED_CODE",
            IneligibilityReason::CodeUsageLimitReached => "CODE_USAGE_LIMIT_REACHED",
            IneligibilityReason::AlreadyClaimed => "ALREADY_CLAIMED",
            IneligibilityReason::MaxTriggersReached => "MAX_TRIGGERS_REACHED",
            IneligibilityReason::BelowMinimumBonus => "BELOW_MINIMUM_BONUS",
            IneligibilityReason::WrongTriggerType => "WRONG_TRIGGER_TYPE",
            IneligibilityReason::PlanInactive => "PLAN_INACTIVE",
        }
    }
}

impl fmt::Display for IneligibilityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IneligibilityReason::InvalidOrExpiredCode => write!(f, "bonus code is invalid or expired"),
            IneligibilityReason::CodeUsageLimitReached => write!(f, "bonus code usage limit reached"),
            IneligibilityReason::AlreadyClaimed => write!(f, "bonus already claimed"),
            IneligibilityReason::MaxTriggersReached => write!(f, "maximum grants per player reached"),
            IneligibilityReason::BelowMinimumBonus => write!(f, "bonus amount below plan minimum"),
            IneligibilityReason::WrongTriggerType => write!(f, "plan does not support this trigger"),
            IneligibilityReason::PlanInactive => write!(f, "bonus plan is inactive"),
        }
    }
}

/// Rolling window a cumulative withdrawal ceiling applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitWindow {
    Daily,
    Weekly,
    Monthly,
    PendingCount,
}

impl fmt::Display for LimitWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitWindow::Daily => write!(f, "Daily"),
            LimitWindow::Weekly => write!(f, "Weekly"),
            LimitWindow::Monthly => write!(f, "Monthly"),
            LimitWindow::PendingCount => write!(f, "Pending request"),
        }
    }
}

/// Storage system errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database open failed: {0}")]
    DatabaseOpenFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    /// Unique key already present
    #[error("Unique constraint violated on {0}")]
    UniqueViolation(String),

    /// Row lock could not be acquired in time
    #[error("Lock contention: {0}")]
    Contention(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        match e.kind() {
            rocksdb::ErrorKind::Busy
            | rocksdb::ErrorKind::TimedOut
            | rocksdb::ErrorKind::TryAgain => StorageError::Contention(e.to_string()),
            rocksdb::ErrorKind::Corruption => StorageError::CorruptedData(e.to_string()),
            _ => StorageError::WriteFailed(e.to_string()),
        }
    }
}

impl From<rocksdb::Error> for CashierError {
    fn from(e: rocksdb::Error) -> Self {
        CashierError::Storage(e.into())
    }
}

impl CashierError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CashierError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CashierError::Validation(msg.into())
    }

    /// Stable, finite code for external callers
    pub fn code(&self) -> &'static str {
        match self {
            CashierError::Validation(_) => "VALIDATION_ERROR",
            CashierError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            CashierError::InsufficientBonusBalance { .. } => "INSUFFICIENT_BONUS_BALANCE",
            CashierError::BonusNotPlayable { .. } => "BONUS_NOT_PLAYABLE",
            CashierError::IneligibleForBonus(_) => "INELIGIBLE_FOR_BONUS",
            CashierError::DuplicateOperation(_) => "DUPLICATE_OPERATION",
            CashierError::RiskBlocked { .. } => "RISK_BLOCKED",
            CashierError::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            CashierError::InvalidTransition { .. } => "INVALID_STATE",
            CashierError::GatewayFailure(_) => "GATEWAY_FAILURE",
            CashierError::NotFound { .. } => "NOT_FOUND",
            CashierError::Configuration(_) => "CONFIGURATION_ERROR",
            CashierError::Storage(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the same call may succeed if simply repeated later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CashierError::GatewayFailure(_) | CashierError::Storage(StorageError::Contention(_))
        )
    }

    /// Message safe to show to a player; infrastructure detail is hidden
    pub fn public_message(&self) -> String {
        match self {
            CashierError::Storage(_) | CashierError::Configuration(_) => {
                "The operation could not be completed, please try again later".to_string()
            }
            CashierError::GatewayFailure(_) => {
                "The payout could not be completed and the funds were returned".to_string()
            }
            other => other.to_string(),
        }
    }
}

// Convenience type alias for Results
pub type CashierResult<T> = Result<T, CashierError>;
