//! Bonus domain types
//!
//! Plans are templates; instances are single grants to a player. An instance
//! snapshots its plan's terms at grant time, so later plan edits never change
//! a bonus a player already holds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a plan is triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Deposit,
    Code,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Deposit => "deposit",
            TriggerType::Code => "code",
            TriggerType::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwardType {
    Flat,
    Percentage,
}

/// What the wager multiplier applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WagerBasis {
    Bonus,
    BonusPlusDeposit,
    Deposit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusTerms {
    pub award_type: AwardType,
    /// Minor units for `Flat`, whole percent of the deposit for `Percentage`
    pub award_value: u64,
    pub min_bonus_amount: u64,
    /// 0 = no ceiling
    pub max_release_amount: u64,
    pub wager_multiplier: u32,
    pub wager_basis: WagerBasis,
    /// 0 = use the configured default
    pub expiry_days: u32,
    /// 0 = unlimited
    pub max_trigger_per_player: u32,
    pub is_playable: bool,
    pub cancel_on_withdrawal: bool,
    pub playable_bonus_qualifies: bool,
}

impl BonusTerms {
    /// Bonus for a deposit (0 for coded/manual grants), clamped to the release ceiling
    pub fn bonus_amount(&self, deposit_amount: u64) -> u64 {
        let raw = match self.award_type {
            AwardType::Flat => self.award_value,
            AwardType::Percentage => deposit_amount.saturating_mul(self.award_value) / 100,
        };
        self.cap(raw)
    }

    pub fn cap(&self, amount: u64) -> u64 {
        if self.max_release_amount > 0 {
            amount.min(self.max_release_amount)
        } else {
            amount
        }
    }

    pub fn wager_requirement(&self, bonus_amount: u64, deposit_amount: u64) -> u64 {
        let base = match self.wager_basis {
            WagerBasis::Bonus => bonus_amount,
            WagerBasis::BonusPlusDeposit => bonus_amount.saturating_add(deposit_amount),
            WagerBasis::Deposit => deposit_amount,
        };
        base.saturating_mul(self.wager_multiplier as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusCode {
    pub code: String,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    /// None = unlimited
    pub max_uses: Option<u32>,
    pub uses: u32,
}

impl BonusCode {
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_from.map_or(true, |from| now >= from)
            && self.valid_until.map_or(true, |until| now <= until)
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_uses.map_or(false, |max| self.uses >= max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRule {
    pub min_deposit: u64,
    pub max_deposit: Option<u64>,
    /// Empty = any method
    pub payment_methods: Vec<String>,
}

impl DepositRule {
    pub fn matches(&self, amount: u64, payment_method: Option<&str>) -> bool {
        if amount < self.min_deposit || self.max_deposit.map_or(false, |max| amount > max) {
            return false;
        }
        if self.payment_methods.is_empty() {
            return true;
        }
        payment_method.map_or(false, |method| {
            self.payment_methods
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(method))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusPlan {
    pub id: String,
    pub name: String,
    pub description: String,
    pub trigger: TriggerType,
    pub is_active: bool,
    /// Higher wins when several deposit plans match
    pub priority: i32,
    pub terms: BonusTerms,
    pub code: Option<BonusCode>,
    pub deposit_rule: Option<DepositRule>,
    pub granted_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBonusPlan {
    pub name: String,
    pub description: String,
    pub trigger: TriggerType,
    pub priority: i32,
    pub terms: BonusTerms,
    pub code: Option<BonusCode>,
    pub deposit_rule: Option<DepositRule>,
}

/// The only plan fields an administrator may change
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BonusPlanUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
    pub priority: Option<i32>,
    /// Rejected once the plan has been granted
    pub terms: Option<BonusTerms>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    Wagering,
    Completed,
    Forfeited,
    Expired,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceStatus::Active | InstanceStatus::Wagering)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Active => "active",
            InstanceStatus::Wagering => "wagering",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Forfeited => "forfeited",
            InstanceStatus::Expired => "expired",
            InstanceStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusInstance {
    pub instance_id: String,
    pub player_id: String,
    pub plan_id: String,
    pub trigger: TriggerType,
    pub terms: BonusTerms,
    pub bonus_amount: u64,
    pub deposit_amount: u64,
    pub remaining_bonus: u64,
    pub wager_requirement_amount: u64,
    pub wager_progress_amount: u64,
    pub total_bets: u64,
    pub total_wins: u64,
    pub released_amount: u64,
    pub status: InstanceStatus,
    pub granted_at: DateTime<Utc>,
    pub activated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
    pub deposit_reference: Option<String>,
    pub granted_by: Option<String>,
    pub notes: Option<String>,
    /// Sequence of the last bonus transaction
    pub txn_seq: u32,
}

impl BonusInstance {
    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BonusTxnKind {
    Granted,
    BetPlaced,
    BetWon,
    BetRefunded,
    Released,
    Forfeited,
    Expired,
}

/// Append-only lifecycle record of one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusTransaction {
    pub seq: u32,
    pub instance_id: String,
    pub player_id: String,
    pub kind: BonusTxnKind,
    pub amount: u64,
    pub remaining_after: u64,
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameCategory {
    Slots,
    Table,
    Live,
    Other,
}

impl GameCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameCategory::Slots => "slots",
            GameCategory::Table => "table",
            GameCategory::Live => "live",
            GameCategory::Other => "other",
        }
    }

    /// Built-in contribution when nothing more specific is configured
    pub fn default_contribution(&self) -> u8 {
        match self {
            GameCategory::Slots => 100,
            GameCategory::Table => 10,
            GameCategory::Live => 10,
            GameCategory::Other => 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryBreakdown {
    pub slots: u64,
    pub table: u64,
    pub live: u64,
    pub other: u64,
}

impl CategoryBreakdown {
    pub fn add(&mut self, category: GameCategory, amount: u64) {
        let slot = match category {
            GameCategory::Slots => &mut self.slots,
            GameCategory::Table => &mut self.table,
            GameCategory::Live => &mut self.live,
            GameCategory::Other => &mut self.other,
        };
        *slot += amount;
    }
}

/// Reporting companion of an instance; progress fields mirror the instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WagerProgress {
    pub instance_id: String,
    pub player_id: String,
    pub required_amount: u64,
    pub progress_amount: u64,
    pub completion_percentage: f64,
    pub bets_count: u64,
    pub last_bet_at: Option<DateTime<Utc>>,
    pub breakdown: CategoryBreakdown,
}

impl WagerProgress {
    pub fn completion(progress: u64, required: u64) -> f64 {
        if required == 0 {
            return 100.0;
        }
        (progress as f64 / required as f64 * 100.0).min(100.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameContribution {
    pub game_code: String,
    pub category: GameCategory,
    pub contribution_percent: Option<u8>,
    pub restricted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryContribution {
    pub category: GameCategory,
    pub contribution_percent: u8,
    pub restricted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionSource {
    Game,
    Category,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedContribution {
    pub category: GameCategory,
    pub percent: u8,
    pub restricted: bool,
    pub source: ContributionSource,
}

impl ResolvedContribution {
    pub fn apply(&self, amount: u64) -> u64 {
        if self.restricted {
            return 0;
        }
        amount.saturating_mul(self.percent as u64) / 100
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusWalletBalance {
    pub player_id: String,
    pub playable_bonus_balance: u64,
    pub active_bonus_count: u32,
    pub total_granted: u64,
    pub total_released: u64,
    pub total_forfeited: u64,
}

/// Result of feeding one bet into an instance's wagering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WagerOutcome {
    pub instance_id: String,
    pub contribution: u64,
    pub progress_amount: u64,
    pub completed: bool,
    /// Credited to the main wallet on completion
    pub released_amount: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirySummary {
    pub scanned: usize,
    pub expired: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms() -> BonusTerms {
        BonusTerms {
            award_type: AwardType::Percentage,
            award_value: 100,
            min_bonus_amount: 5,
            max_release_amount: 200,
            wager_multiplier: 30,
            wager_basis: WagerBasis::Bonus,
            expiry_days: 30,
            max_trigger_per_player: 1,
            is_playable: true,
            cancel_on_withdrawal: false,
            playable_bonus_qualifies: false,
        }
    }

    #[test]
    fn test_match_bonus_under_cap() {
        let terms = terms();
        let bonus = terms.bonus_amount(150);
        assert_eq!(bonus, 150);
        assert_eq!(terms.wager_requirement(bonus, 150), 4_500);
        assert_eq!(terms.bonus_amount(500), 200);
    }

    #[test]
    fn test_wager_bases() {
        let mut terms = terms();
        terms.wager_multiplier = 10;
        terms.wager_basis = WagerBasis::BonusPlusDeposit;
        assert_eq!(terms.wager_requirement(100, 200), 3_000);
        terms.wager_basis = WagerBasis::Deposit;
        assert_eq!(terms.wager_requirement(100, 200), 2_000);
    }

    #[test]
    fn test_deposit_rule_matching() {
        let rule = DepositRule {
            min_deposit: 100,
            max_deposit: Some(1_000),
            payment_methods: vec!["card".to_string()],
        };
        assert!(rule.matches(500, Some("CARD")));
        assert!(!rule.matches(500, Some("crypto")));
        assert!(!rule.matches(500, None));
        assert!(!rule.matches(50, Some("card")));
        assert!(!rule.matches(1_001, Some("card")));
    }

    #[test]
    fn test_restricted_contribution_is_zero() {
        let resolved = ResolvedContribution {
            category: GameCategory::Slots,
            percent: 100,
            restricted: true,
            source: ContributionSource::Game,
        };
        assert_eq!(resolved.apply(1_000), 0);
    }
}
