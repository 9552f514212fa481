//! Bet/win settlement orchestrator
//!
//! Splits each bet between the main and bonus wallets (main first), feeds
//! the stake into wagering, and routes winnings back to the wallet that
//! funded the bet.

use crate::bonus::lifecycle::{live_instances_in, lock_instance_in, record_txn_in, save_instance_in};
use crate::bonus::types::{BonusTxnKind, InstanceStatus, WagerOutcome};
use crate::bonus::{wagering, wallet};
use crate::clock::Clock;
use crate::errors::{CashierError, CashierResult};
use crate::ledger::{self, AccountStatus, EntryKind};
use crate::metrics::CashierMetrics;
use crate::storage::{keys, validate_id, Storage, StorageTxn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Persisted per bet so winnings and refunds can be routed later
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BetRecord {
    pub bet_id: String,
    pub player_id: String,
    pub game_code: String,
    /// Instance the bet was wagered against, if any
    pub instance_id: Option<String>,
    pub main_amount: u64,
    pub bonus_amount: u64,
    pub settled_win: u64,
    pub refunded: bool,
    pub placed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BetSplit {
    pub bet_id: String,
    pub player_id: String,
    pub game_code: String,
    pub main_amount: u64,
    pub bonus_amount: u64,
    pub instance_id: Option<String>,
    pub wager: Option<WagerOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinDestination {
    Main,
    Bonus,
    /// The bonus that funded the bet has ended without release
    Forfeited,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinRouting {
    pub bet_id: String,
    pub amount: u64,
    pub destination: WinDestination,
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedBalance {
    pub player_id: String,
    pub currency: String,
    pub main_balance: u64,
    pub bonus_balance: u64,
    pub active_bonus_count: u32,
    /// Spendable cash; never includes bonus funds
    pub available: u64,
}

pub struct SettlementOrchestrator {
    storage: Storage,
    clock: Arc<dyn Clock>,
    metrics: Arc<CashierMetrics>,
}

impl SettlementOrchestrator {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>, metrics: Arc<CashierMetrics>) -> Self {
        Self {
            storage,
            clock,
            metrics,
        }
    }

    /// Settle a bet and apply its wagering in one transaction
    pub fn process_bet(
        &self,
        player_id: &str,
        bet_amount: u64,
        game_code: &str,
        bet_id: &str,
    ) -> CashierResult<BetSplit> {
        let now = self.clock.now();
        let txn = self.storage.begin();
        let mut split = settle_bet_in(&txn, player_id, bet_amount, game_code, bet_id, now)?;
        split.wager = apply_bet_wagering_in(&txn, &split, now)?;
        txn.commit()?;

        self.metrics.record_bet(split.main_amount, split.bonus_amount);
        info!(
            player_id,
            bet_id,
            main = split.main_amount,
            bonus = split.bonus_amount,
            contribution = split.wager.as_ref().map_or(0, |w| w.contribution),
            "Bet settled"
        );
        Ok(split)
    }

    /// Apply wagering for a bet already settled in an earlier transaction
    pub fn apply_bet_wagering(&self, split: &BetSplit) -> CashierResult<Option<WagerOutcome>> {
        let txn = self.storage.begin();
        let outcome = apply_bet_wagering_in(&txn, split, self.clock.now())?;
        txn.commit()?;
        Ok(outcome)
    }

    pub fn process_win(
        &self,
        player_id: &str,
        win_amount: u64,
        game_code: &str,
        bet_id: &str,
    ) -> CashierResult<WinRouting> {
        let now = self.clock.now();
        let txn = self.storage.begin();
        ledger::lock_account(&txn, player_id)?;
        let mut bet = lock_bet_in(&txn, bet_id)?;
        if bet.player_id != player_id {
            return Err(CashierError::not_found("bet", bet_id));
        }
        if bet.game_code != game_code {
            return Err(CashierError::validation(format!(
                "bet {} was placed on {}, not {}",
                bet_id, bet.game_code, game_code
            )));
        }
        let routing = settle_win_in(&txn, &mut bet, win_amount, bet_id, now)?;
        txn.commit()?;

        info!(player_id, bet_id, amount = win_amount, destination = ?routing.destination, "Win settled");
        Ok(routing)
    }

    /// Main and bonus balances side by side; `available` is main only
    pub fn get_combined_balance(&self, player_id: &str) -> CashierResult<CombinedBalance> {
        let account = self
            .storage
            .get_json::<ledger::PlayerAccount>(&keys::account(player_id))?
            .ok_or_else(|| CashierError::not_found("account", player_id))?;
        let bonus = self
            .storage
            .get_json::<crate::bonus::BonusWalletBalance>(&keys::bonus_wallet(player_id))?
            .unwrap_or_default();

        Ok(CombinedBalance {
            player_id: player_id.to_string(),
            currency: account.currency,
            main_balance: account.main_balance,
            bonus_balance: bonus.playable_bonus_balance,
            active_bonus_count: bonus.active_bonus_count,
            available: account.main_balance,
        })
    }

    pub fn get_bet(&self, bet_id: &str) -> CashierResult<BetRecord> {
        self.storage
            .get_json(&keys::bet(bet_id))?
            .ok_or_else(|| CashierError::not_found("bet", bet_id))
    }
}

pub(crate) fn lock_bet_in(txn: &StorageTxn<'_>, bet_id: &str) -> CashierResult<BetRecord> {
    txn.get_for_update_json(&keys::bet(bet_id))?
        .ok_or_else(|| CashierError::not_found("bet", bet_id))
}

/// Debit the stake, main wallet first, the shortfall from the oldest live
/// bonus. Wagering is not applied here.
pub(crate) fn settle_bet_in(
    txn: &StorageTxn<'_>,
    player_id: &str,
    bet_amount: u64,
    game_code: &str,
    bet_id: &str,
    now: DateTime<Utc>,
) -> CashierResult<BetSplit> {
    validate_id("bet_id", bet_id)?;
    validate_id("game_code", game_code)?;
    if bet_amount == 0 {
        return Err(CashierError::validation("bet amount must be positive"));
    }
    let mut account = ledger::lock_account(txn, player_id)?;
    if txn.get_for_update_json::<BetRecord>(&keys::bet(bet_id))?.is_some() {
        return Err(CashierError::DuplicateOperation(format!("bet {} already settled", bet_id)));
    }
    if account.status != AccountStatus::Active {
        return Err(CashierError::validation(format!("account {} is {}", player_id, account.status)));
    }

    let main_amount = bet_amount.min(account.main_balance);
    let bonus_amount = bet_amount - main_amount;
    let mut target = live_instances_in(txn, player_id)?.into_iter().next();

    if bonus_amount > 0 {
        let instance = target.as_mut().ok_or(CashierError::InsufficientFunds {
            requested: bet_amount,
            available: account.main_balance,
        })?;
        if !instance.terms.is_playable {
            return Err(CashierError::BonusNotPlayable {
                instance_id: instance.instance_id.clone(),
            });
        }
        if instance.remaining_bonus < bonus_amount {
            return Err(CashierError::InsufficientFunds {
                requested: bet_amount,
                available: account.main_balance + instance.remaining_bonus,
            });
        }
        wallet::deduct_in(txn, player_id, bonus_amount)?;
        instance.remaining_bonus -= bonus_amount;
        record_txn_in(txn, instance, BonusTxnKind::BetPlaced, bonus_amount, Some(bet_id), now)?;
    }

    if main_amount > 0 {
        ledger::debit(txn, &mut account, main_amount, EntryKind::BetDebit, bet_id, now)?;
    }

    if let Some(instance) = target.as_mut() {
        instance.total_bets += bet_amount;
        save_instance_in(txn, instance)?;
    }

    let instance_id = target.map(|i| i.instance_id);
    txn.insert_unique_json(
        &keys::bet(bet_id),
        &BetRecord {
            bet_id: bet_id.to_string(),
            player_id: player_id.to_string(),
            game_code: game_code.to_string(),
            instance_id: instance_id.clone(),
            main_amount,
            bonus_amount,
            settled_win: 0,
            refunded: false,
            placed_at: now,
        },
    )?;

    Ok(BetSplit {
        bet_id: bet_id.to_string(),
        player_id: player_id.to_string(),
        game_code: game_code.to_string(),
        main_amount,
        bonus_amount,
        instance_id,
        wager: None,
    })
}

/// `None` when the bet has no live instance to wager against
pub(crate) fn apply_bet_wagering_in(
    txn: &StorageTxn<'_>,
    split: &BetSplit,
    now: DateTime<Utc>,
) -> CashierResult<Option<WagerOutcome>> {
    let instance_id = match &split.instance_id {
        Some(id) => id,
        None => return Ok(None),
    };
    ledger::lock_account(txn, &split.player_id)?;
    let mut instance = lock_instance_in(txn, instance_id)?;
    if !instance.is_live() {
        return Ok(None);
    }
    let qualifying = wagering::qualifying_amount(&instance, split.main_amount, split.bonus_amount);
    wagering::apply_in(txn, &mut instance, &split.game_code, qualifying, now).map(Some)
}

pub(crate) fn settle_win_in(
    txn: &StorageTxn<'_>,
    bet: &mut BetRecord,
    win_amount: u64,
    reference: &str,
    now: DateTime<Utc>,
) -> CashierResult<WinRouting> {
    if bet.refunded {
        return Err(CashierError::InvalidTransition {
            entity: "bet",
            from: "refunded".to_string(),
            to: "won".to_string(),
        });
    }

    let mut routing = WinRouting {
        bet_id: bet.bet_id.clone(),
        amount: win_amount,
        destination: WinDestination::Main,
        instance_id: None,
    };

    match (&bet.instance_id, bet.bonus_amount > 0) {
        (Some(instance_id), true) => {
            let mut instance = lock_instance_in(txn, instance_id)?;
            routing.instance_id = Some(instance_id.clone());
            if instance.is_live() {
                if win_amount > 0 {
                    wallet::credit_in(txn, &bet.player_id, win_amount, false)?;
                    instance.remaining_bonus += win_amount;
                    instance.total_wins += win_amount;
                    record_txn_in(txn, &mut instance, BonusTxnKind::BetWon, win_amount, Some(reference), now)?;
                    save_instance_in(txn, &instance)?;
                }
                routing.destination = WinDestination::Bonus;
            } else if instance.status == InstanceStatus::Completed {
                credit_main_in(txn, &bet.player_id, win_amount, EntryKind::WinCredit, reference, now)?;
            } else {
                warn!(
                    player_id = %bet.player_id,
                    bet_id = %bet.bet_id,
                    instance_id = %instance_id,
                    status = %instance.status,
                    amount = win_amount,
                    "Win on a bonus that already ended is not credited"
                );
                routing.destination = WinDestination::Forfeited;
            }
        }
        _ => credit_main_in(txn, &bet.player_id, win_amount, EntryKind::WinCredit, reference, now)?,
    }

    bet.settled_win += win_amount;
    txn.put_json(&keys::bet(&bet.bet_id), bet)?;
    Ok(routing)
}

/// Return the stake to the wallets it came from. Returns the amount refunded.
pub(crate) fn refund_bet_in(
    txn: &StorageTxn<'_>,
    bet: &mut BetRecord,
    reference: &str,
    now: DateTime<Utc>,
) -> CashierResult<u64> {
    if bet.refunded {
        return Ok(0);
    }
    let mut refunded = 0;
    credit_main_in(txn, &bet.player_id, bet.main_amount, EntryKind::ProviderRefund, reference, now)?;
    refunded += bet.main_amount;

    if let (Some(instance_id), true) = (&bet.instance_id, bet.bonus_amount > 0) {
        let mut instance = lock_instance_in(txn, instance_id)?;
        if instance.is_live() {
            wallet::credit_in(txn, &bet.player_id, bet.bonus_amount, false)?;
            instance.remaining_bonus += bet.bonus_amount;
            record_txn_in(txn, &mut instance, BonusTxnKind::BetRefunded, bet.bonus_amount, Some(reference), now)?;
            save_instance_in(txn, &instance)?;
            refunded += bet.bonus_amount;
        } else if instance.status == InstanceStatus::Completed {
            credit_main_in(txn, &bet.player_id, bet.bonus_amount, EntryKind::ProviderRefund, reference, now)?;
            refunded += bet.bonus_amount;
        }
    }

    bet.refunded = true;
    txn.put_json(&keys::bet(&bet.bet_id), bet)?;
    Ok(refunded)
}

pub(crate) fn credit_main_in(
    txn: &StorageTxn<'_>,
    player_id: &str,
    amount: u64,
    kind: EntryKind,
    reference: &str,
    now: DateTime<Utc>,
) -> CashierResult<()> {
    if amount == 0 {
        return Ok(());
    }
    let mut account = ledger::lock_account(txn, player_id)?;
    ledger::credit(txn, &mut account, amount, kind, reference, now)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bonus::types::{AwardType, BonusTerms, GameCategory, NewBonusPlan, TriggerType, WagerBasis};
    use crate::test_support::Harness;

    fn grant(h: &Harness, player_id: &str, amount: u64, playable: bool) -> String {
        let plan = h
            .cashier
            .plans
            .create_plan(NewBonusPlan {
                name: "Manual".to_string(),
                description: String::new(),
                trigger: TriggerType::Manual,
                priority: 0,
                terms: BonusTerms {
                    award_type: AwardType::Flat,
                    award_value: amount,
                    min_bonus_amount: 0,
                    max_release_amount: 0,
                    wager_multiplier: 5,
                    wager_basis: WagerBasis::Bonus,
                    expiry_days: 30,
                    max_trigger_per_player: 0,
                    is_playable: playable,
                    cancel_on_withdrawal: true,
                    playable_bonus_qualifies: false,
                },
                code: None,
                deposit_rule: None,
            })
            .unwrap();
        h.cashier
            .lifecycle
            .grant_manual_bonus(player_id, &plan.id, None, "", "admin")
            .unwrap()
            .instance_id
    }

    #[test]
    fn test_main_first_then_bonus_on_restricted_game() {
        let h = Harness::new();
        h.player("p1", 50);
        h.cashier.contributions.register_game("crash", GameCategory::Slots).unwrap();
        h.cashier.contributions.set_game_contribution("crash", None, true).unwrap();
        let instance_id = grant(&h, "p1", 20, true);

        let split = h.cashier.settlement.process_bet("p1", 60, "crash", "bet-1").unwrap();
        assert_eq!((split.main_amount, split.bonus_amount), (50, 10));
        assert_eq!(split.main_amount + split.bonus_amount, 60);
        assert_eq!(split.wager.unwrap().contribution, 0);

        let instance = h.cashier.lifecycle.get_instance(&instance_id).unwrap();
        assert_eq!(instance.remaining_bonus, 10);
        assert_eq!(instance.wager_progress_amount, 0);
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 0);
    }

    #[test]
    fn test_insufficient_and_unplayable() {
        let h = Harness::new();
        h.player("p1", 50);
        let err = h.cashier.settlement.process_bet("p1", 60, "slot", "bet-1").unwrap_err();
        assert!(matches!(err, CashierError::InsufficientFunds { requested: 60, available: 50 }));

        grant(&h, "p1", 20, false);
        let err = h.cashier.settlement.process_bet("p1", 60, "slot", "bet-1").unwrap_err();
        assert!(matches!(err, CashierError::BonusNotPlayable { .. }));
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 50);

        // nothing was persisted for the failed bet id
        assert!(h.cashier.settlement.process_bet("p1", 40, "slot", "bet-1").is_ok());
        let err = h.cashier.settlement.process_bet("p1", 5, "slot", "bet-1").unwrap_err();
        assert!(matches!(err, CashierError::DuplicateOperation(_)));
    }

    #[test]
    fn test_win_routing_follows_funding() {
        let h = Harness::new();
        h.player("p1", 100);
        let instance_id = grant(&h, "p1", 50, true);

        h.cashier.settlement.process_bet("p1", 30, "slot", "bet-main").unwrap();
        let routing = h.cashier.settlement.process_win("p1", 45, "slot", "bet-main").unwrap();
        assert_eq!(routing.destination, WinDestination::Main);
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 115);

        h.cashier.settlement.process_bet("p1", 130, "slot", "bet-mixed").unwrap();
        let routing = h.cashier.settlement.process_win("p1", 80, "slot", "bet-mixed").unwrap();
        assert_eq!(routing.destination, WinDestination::Bonus);

        let instance = h.cashier.lifecycle.get_instance(&instance_id).unwrap();
        assert_eq!(instance.remaining_bonus, 50 - 15 + 80);
        assert_eq!(instance.total_wins, 80);

        let balance = h.cashier.settlement.get_combined_balance("p1").unwrap();
        assert_eq!(balance.main_balance, 0);
        assert_eq!(balance.available, 0);
        assert_eq!(balance.bonus_balance, 115);
        assert_eq!(balance.active_bonus_count, 1);
    }

    #[test]
    fn test_win_on_forfeited_bonus_is_not_credited() {
        let h = Harness::new();
        h.player("p1", 0);
        let instance_id = grant(&h, "p1", 50, true);
        h.cashier.settlement.process_bet("p1", 20, "slot", "bet-1").unwrap();
        h.cashier.lifecycle.forfeit_bonus(&instance_id, "abuse").unwrap();

        let routing = h.cashier.settlement.process_win("p1", 100, "slot", "bet-1").unwrap();
        assert_eq!(routing.destination, WinDestination::Forfeited);
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 0);
        assert_eq!(h.cashier.wallet.get_balance("p1").unwrap().playable_bonus_balance, 0);
        let instance = h.cashier.lifecycle.get_instance(&instance_id).unwrap();
        assert_eq!(instance.remaining_bonus, 0);
    }
}
