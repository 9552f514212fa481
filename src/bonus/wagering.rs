//! Wagering progress tracker

use super::contribution;
use super::lifecycle::{complete_in, lock_instance_in, save_instance_in};
use super::types::{BonusInstance, CategoryBreakdown, InstanceStatus, WagerOutcome, WagerProgress};
use crate::clock::Clock;
use crate::errors::{CashierError, CashierResult};
use crate::ledger;
use crate::storage::{keys, Storage, StorageTxn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Which wallet paid for the wagered amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WagerFunding {
    Main,
    Bonus,
}

pub struct WageringTracker {
    storage: Storage,
    clock: Arc<dyn Clock>,
}

impl WageringTracker {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Feed one bet into an instance's wagering; completes and releases the
    /// bonus when the requirement is met. One transaction.
    pub fn process_bet_wagering(
        &self,
        instance_id: &str,
        player_id: &str,
        game_code: &str,
        bet_amount: u64,
        funding: WagerFunding,
    ) -> CashierResult<WagerOutcome> {
        let txn = self.storage.begin();
        ledger::lock_account(&txn, player_id)?;
        let mut instance = lock_instance_in(&txn, instance_id)?;
        if instance.player_id != player_id {
            return Err(CashierError::not_found("bonus instance", instance_id));
        }

        let qualifying = match funding {
            WagerFunding::Main => qualifying_amount(&instance, bet_amount, 0),
            WagerFunding::Bonus => qualifying_amount(&instance, 0, bet_amount),
        };
        let outcome = apply_in(&txn, &mut instance, game_code, qualifying, self.clock.now())?;
        txn.commit()?;
        Ok(outcome)
    }
}

/// Bonus-funded stakes only count when the plan allows it
pub(crate) fn qualifying_amount(instance: &BonusInstance, main_amount: u64, bonus_amount: u64) -> u64 {
    if instance.terms.playable_bonus_qualifies {
        main_amount + bonus_amount
    } else {
        main_amount
    }
}

pub(crate) fn apply_in(
    txn: &StorageTxn<'_>,
    instance: &mut BonusInstance,
    game_code: &str,
    qualifying_amount: u64,
    now: DateTime<Utc>,
) -> CashierResult<WagerOutcome> {
    if !instance.is_live() {
        return Err(CashierError::InvalidTransition {
            entity: "bonus instance",
            from: instance.status.to_string(),
            to: InstanceStatus::Wagering.to_string(),
        });
    }

    let resolved = contribution::resolve_in(txn, game_code)?;
    let contribution = resolved.apply(qualifying_amount);

    if instance.status == InstanceStatus::Active {
        instance.status = InstanceStatus::Wagering;
    }
    instance.wager_progress_amount += contribution;

    let progress_key = keys::wager_progress(&instance.instance_id);
    let mut progress = txn
        .get_for_update_json::<WagerProgress>(&progress_key)?
        .unwrap_or_else(|| WagerProgress {
            instance_id: instance.instance_id.clone(),
            player_id: instance.player_id.clone(),
            required_amount: instance.wager_requirement_amount,
            progress_amount: 0,
            completion_percentage: 0.0,
            bets_count: 0,
            last_bet_at: None,
            breakdown: CategoryBreakdown::default(),
        });
    progress.progress_amount = instance.wager_progress_amount;
    progress.completion_percentage =
        WagerProgress::completion(progress.progress_amount, progress.required_amount);
    progress.bets_count += 1;
    progress.last_bet_at = Some(now);
    progress.breakdown.add(resolved.category, contribution);
    txn.put_json(&progress_key, &progress)?;

    debug!(
        instance_id = %instance.instance_id,
        game_code,
        contribution,
        percent = resolved.percent,
        progress = instance.wager_progress_amount,
        required = instance.wager_requirement_amount,
        "Wager contribution applied"
    );

    let mut released_amount = 0;
    let completed = instance.wager_progress_amount >= instance.wager_requirement_amount;
    if completed {
        released_amount = complete_in(txn, instance, now)?;
    } else {
        save_instance_in(txn, instance)?;
    }

    Ok(WagerOutcome {
        instance_id: instance.instance_id.clone(),
        contribution,
        progress_amount: instance.wager_progress_amount,
        completed,
        released_amount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bonus::types::{AwardType, BonusTerms, GameCategory, NewBonusPlan, TriggerType, WagerBasis};
    use crate::test_support::Harness;

    fn manual_plan(h: &Harness, qualifies: bool, max_release: u64) -> String {
        h.cashier
            .plans
            .create_plan(NewBonusPlan {
                name: "Goodwill".to_string(),
                description: String::new(),
                trigger: TriggerType::Manual,
                priority: 0,
                terms: BonusTerms {
                    award_type: AwardType::Flat,
                    award_value: 100,
                    min_bonus_amount: 0,
                    max_release_amount: max_release,
                    wager_multiplier: 10,
                    wager_basis: WagerBasis::Bonus,
                    expiry_days: 30,
                    max_trigger_per_player: 0,
                    is_playable: true,
                    cancel_on_withdrawal: false,
                    playable_bonus_qualifies: qualifies,
                },
                code: None,
                deposit_rule: None,
            })
            .unwrap()
            .id
    }

    #[test]
    fn test_bonus_funded_bets_do_not_count_by_default() {
        let h = Harness::new();
        h.player("p1", 0);
        h.cashier.contributions.register_game("slot-1", GameCategory::Slots).unwrap();
        let plan_id = manual_plan(&h, false, 0);
        let instance = h.cashier.lifecycle.grant_manual_bonus("p1", &plan_id, None, "", "admin").unwrap();

        let outcome = h
            .cashier
            .wagering
            .process_bet_wagering(&instance.instance_id, "p1", "slot-1", 500, WagerFunding::Bonus)
            .unwrap();
        assert_eq!(outcome.contribution, 0);

        let instance = h.cashier.lifecycle.get_instance(&instance.instance_id).unwrap();
        assert_eq!(instance.status, InstanceStatus::Wagering);
        assert_eq!(instance.wager_progress_amount, 0);
        assert_eq!(h.cashier.lifecycle.get_progress(&instance.instance_id).unwrap().bets_count, 1);
    }

    #[test]
    fn test_progress_completes_and_releases_once() {
        let h = Harness::new();
        h.player("p1", 0);
        h.cashier.contributions.register_game("slot-1", GameCategory::Slots).unwrap();
        h.cashier.contributions.register_game("bj", GameCategory::Table).unwrap();
        let plan_id = manual_plan(&h, false, 0);
        let instance = h.cashier.lifecycle.grant_manual_bonus("p1", &plan_id, None, "", "admin").unwrap();
        let id = instance.instance_id.clone();

        let outcome = h.cashier.wagering.process_bet_wagering(&id, "p1", "bj", 1_000, WagerFunding::Main).unwrap();
        assert_eq!(outcome.contribution, 100);
        assert!(!outcome.completed);

        let progress = h.cashier.lifecycle.get_progress(&id).unwrap();
        assert_eq!(progress.progress_amount, 100);
        assert_eq!(progress.breakdown.table, 100);
        assert!((progress.completion_percentage - 10.0).abs() < f64::EPSILON);

        let outcome = h.cashier.wagering.process_bet_wagering(&id, "p1", "slot-1", 900, WagerFunding::Main).unwrap();
        assert!(outcome.completed);
        assert_eq!(outcome.released_amount, 100);
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 100);

        let instance = h.cashier.lifecycle.get_instance(&id).unwrap();
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(instance.wager_progress_amount, h.cashier.lifecycle.get_progress(&id).unwrap().progress_amount);

        let err = h.cashier.wagering.process_bet_wagering(&id, "p1", "slot-1", 900, WagerFunding::Main).unwrap_err();
        assert!(matches!(err, CashierError::InvalidTransition { .. }));
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 100);
    }

    #[test]
    fn test_release_is_capped() {
        let h = Harness::new();
        h.player("p1", 0);
        h.cashier.contributions.register_game("slot-1", GameCategory::Slots).unwrap();
        let plan_id = manual_plan(&h, true, 60);
        let instance = h.cashier.lifecycle.grant_manual_bonus("p1", &plan_id, Some(100), "", "admin").unwrap();

        let outcome = h
            .cashier
            .wagering
            .process_bet_wagering(&instance.instance_id, "p1", "slot-1", 1_000, WagerFunding::Bonus)
            .unwrap();
        assert!(outcome.completed);
        assert_eq!(outcome.released_amount, 60);
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 60);

        let wallet = h.cashier.wallet.get_balance("p1").unwrap();
        assert_eq!(wallet.playable_bonus_balance, 0);
        assert_eq!(wallet.total_forfeited, 40);
    }

    #[test]
    fn test_concurrent_bets_and_wagering_complete_once() {
        let h = Harness::new();
        h.player("p1", 10_000);
        h.cashier.contributions.register_game("slot-1", GameCategory::Slots).unwrap();
        let plan_id = manual_plan(&h, false, 0);
        let id = h.cashier.lifecycle.grant_manual_bonus("p1", &plan_id, None, "", "admin").unwrap().instance_id;

        std::thread::scope(|scope| {
            let settled = scope.spawn(|| {
                (0..20)
                    .map(|i| h.cashier.settlement.process_bet("p1", 100, "slot-1", &format!("bet-{}", i)))
                    .collect::<Vec<_>>()
            });
            let wagered = scope.spawn(|| {
                (0..20)
                    .map(|_| h.cashier.wagering.process_bet_wagering(&id, "p1", "slot-1", 100, WagerFunding::Main))
                    .collect::<Vec<_>>()
            });

            for result in settled.join().unwrap() {
                assert!(result.is_ok(), "bet failed: {:?}", result);
            }
            for result in wagered.join().unwrap() {
                match result {
                    Ok(_) | Err(CashierError::InvalidTransition { .. }) => {}
                    Err(e) => panic!("wagering failed: {}", e),
                }
            }
        });

        let instance = h.cashier.lifecycle.get_instance(&id).unwrap();
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(h.cashier.wallet.get_balance("p1").unwrap().total_released, 100);
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 10_000 - 2_000 + 100);
    }
}
