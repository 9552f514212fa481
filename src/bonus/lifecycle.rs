//! Bonus instance lifecycle manager
//!
//! Grants bonuses from plans and drives each instance through
//! `active -> wagering -> completed`, or out early to `forfeited`, `expired`
//! or `cancelled`. Terminal instances are never written again.
//!
//! Eligibility is pre-checked by counting claim slots, but the race between
//! two concurrent grants is closed by `insert_unique` on the next slot key:
//! only one of them can take it.

use super::plans::{lock_plan_in, sort_by_priority};
use super::types::{
    BonusInstance, BonusPlan, BonusTransaction, BonusTxnKind, CategoryBreakdown, ExpirySummary,
    InstanceStatus, TriggerType, WagerProgress,
};
use super::wallet;
use crate::clock::Clock;
use crate::config::BonusConfig;
use crate::errors::{CashierError, CashierResult, IneligibilityReason, StorageError};
use crate::ledger::{self, AccountStatus};
use crate::metrics::CashierMetrics;
use crate::storage::{keys, validate_id, Storage, StorageTxn};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct BonusLifecycle {
    storage: Storage,
    clock: Arc<dyn Clock>,
    config: BonusConfig,
    metrics: Arc<CashierMetrics>,
}

struct Grant<'a> {
    player_id: &'a str,
    bonus_amount: u64,
    deposit_amount: u64,
    deposit_reference: Option<&'a str>,
    granted_by: Option<&'a str>,
    notes: Option<&'a str>,
    /// Reported when the per-player trigger limit is hit
    limit_reason: IneligibilityReason,
}

impl BonusLifecycle {
    pub fn new(
        storage: Storage,
        clock: Arc<dyn Clock>,
        config: BonusConfig,
        metrics: Arc<CashierMetrics>,
    ) -> Self {
        Self {
            storage,
            clock,
            config,
            metrics,
        }
    }

    /// Apply the best eligible deposit plan, if any. A deposit reference can
    /// be evaluated only once; a second call fails with `DuplicateOperation`.
    pub fn grant_deposit_bonus(
        &self,
        player_id: &str,
        deposit_amount: u64,
        deposit_reference: &str,
        payment_method: Option<&str>,
    ) -> CashierResult<Option<BonusInstance>> {
        validate_id("deposit reference", deposit_reference)?;
        if deposit_amount == 0 {
            return Err(CashierError::validation("deposit amount must be positive"));
        }
        let now = self.clock.now();
        let txn = self.storage.begin();

        txn.insert_unique_json(&keys::bonus_deposit_ref(deposit_reference), &player_id)
            .map_err(|e| match e {
                StorageError::UniqueViolation(_) => CashierError::DuplicateOperation(format!(
                    "deposit {} already evaluated for bonuses",
                    deposit_reference
                )),
                other => other.into(),
            })?;

        let mut candidates: Vec<BonusPlan> = txn
            .scan_prefix_json::<BonusPlan>(keys::BONUS_PLAN_PREFIX)?
            .into_iter()
            .map(|(_, plan)| plan)
            .filter(|plan| {
                plan.is_active
                    && plan.trigger == TriggerType::Deposit
                    && plan
                        .deposit_rule
                        .as_ref()
                        .map_or(false, |rule| rule.matches(deposit_amount, payment_method))
            })
            .collect();
        sort_by_priority(&mut candidates);

        let mut granted = None;
        for candidate in candidates {
            let mut plan = lock_plan_in(&txn, &candidate.id)?;
            let grant = Grant {
                player_id,
                bonus_amount: plan.terms.bonus_amount(deposit_amount),
                deposit_amount,
                deposit_reference: Some(deposit_reference),
                granted_by: None,
                notes: None,
                limit_reason: IneligibilityReason::MaxTriggersReached,
            };
            match self.grant_in(&txn, &mut plan, grant, now) {
                Ok(instance) => {
                    granted = Some(instance);
                    break;
                }
                Err(CashierError::IneligibleForBonus(reason)) => {
                    debug!(player_id, plan_id = %plan.id, reason = reason.code(), "Deposit plan skipped");
                }
                Err(e) => return Err(e),
            }
        }

        txn.commit()?;
        if let Some(instance) = &granted {
            self.metrics.record_grant(TriggerType::Deposit.as_str());
            info!(
                player_id,
                instance_id = %instance.instance_id,
                amount = instance.bonus_amount,
                deposit_reference,
                "Granted deposit bonus"
            );
        }
        Ok(granted)
    }

    pub fn grant_coded_bonus(&self, player_id: &str, code: &str) -> CashierResult<BonusInstance> {
        let now = self.clock.now();
        let txn = self.storage.begin();

        let plan_id = txn
            .get_json::<String>(&keys::bonus_code(code))?
            .ok_or(CashierError::IneligibleForBonus(IneligibilityReason::InvalidOrExpiredCode))?;
        let mut plan = lock_plan_in(&txn, &plan_id)?;

        if plan.trigger != TriggerType::Code {
            return Err(CashierError::IneligibleForBonus(IneligibilityReason::WrongTriggerType));
        }
        if !plan.is_active {
            return Err(CashierError::IneligibleForBonus(IneligibilityReason::PlanInactive));
        }
        let bonus_code = plan
            .code
            .as_ref()
            .ok_or(CashierError::IneligibleForBonus(IneligibilityReason::InvalidOrExpiredCode))?;
        if !bonus_code.is_open_at(now) {
            return Err(CashierError::IneligibleForBonus(IneligibilityReason::InvalidOrExpiredCode));
        }
        if bonus_code.is_exhausted() {
            return Err(CashierError::IneligibleForBonus(IneligibilityReason::CodeUsageLimitReached));
        }

        let grant = Grant {
            player_id,
            bonus_amount: plan.terms.bonus_amount(0),
            deposit_amount: 0,
            deposit_reference: None,
            granted_by: None,
            notes: None,
            limit_reason: IneligibilityReason::AlreadyClaimed,
        };
        let instance = self.grant_in(&txn, &mut plan, grant, now)?;
        if let Some(bonus_code) = plan.code.as_mut() {
            bonus_code.uses += 1;
        }
        txn.put_json(&keys::bonus_plan(&plan.id), &plan)?;
        txn.commit()?;

        self.metrics.record_grant(TriggerType::Code.as_str());
        info!(player_id, instance_id = %instance.instance_id, code, "Granted coded bonus");
        Ok(instance)
    }

    pub fn grant_manual_bonus(
        &self,
        player_id: &str,
        plan_id: &str,
        custom_amount: Option<u64>,
        notes: &str,
        admin_id: &str,
    ) -> CashierResult<BonusInstance> {
        validate_id("admin_id", admin_id)?;
        if custom_amount == Some(0) {
            return Err(CashierError::validation("custom bonus amount must be positive"));
        }
        let now = self.clock.now();
        let txn = self.storage.begin();
        let mut plan = lock_plan_in(&txn, plan_id)?;

        if plan.trigger != TriggerType::Manual {
            return Err(CashierError::IneligibleForBonus(IneligibilityReason::WrongTriggerType));
        }
        if !plan.is_active {
            return Err(CashierError::IneligibleForBonus(IneligibilityReason::PlanInactive));
        }

        let grant = Grant {
            player_id,
            bonus_amount: custom_amount.unwrap_or_else(|| plan.terms.bonus_amount(0)),
            deposit_amount: 0,
            deposit_reference: None,
            granted_by: Some(admin_id),
            notes: Some(notes),
            limit_reason: IneligibilityReason::MaxTriggersReached,
        };
        let instance = self.grant_in(&txn, &mut plan, grant, now)?;
        txn.commit()?;

        self.metrics.record_grant(TriggerType::Manual.as_str());
        info!(player_id, instance_id = %instance.instance_id, admin_id, amount = instance.bonus_amount, "Granted manual bonus");
        Ok(instance)
    }

    pub fn forfeit_bonus(&self, instance_id: &str, reason: &str) -> CashierResult<BonusInstance> {
        let now = self.clock.now();
        let txn = self.storage.begin();
        let mut instance = lock_instance_in(&txn, instance_id)?;
        let amount = close_in(&txn, &mut instance, InstanceStatus::Forfeited, reason, now)?;
        txn.commit()?;

        info!(player_id = %instance.player_id, instance_id, amount, reason, "Bonus forfeited");
        Ok(instance)
    }

    /// Cancel every live bonus whose plan is withdrawal-sensitive
    pub fn cancel_bonuses_on_withdrawal(&self, player_id: &str) -> CashierResult<Vec<BonusInstance>> {
        let txn = self.storage.begin();
        let cancelled = cancel_on_withdrawal_in(&txn, player_id, self.clock.now())?;
        txn.commit()?;
        Ok(cancelled)
    }

    /// Expire every live instance past its deadline. Each instance is handled
    /// in its own transaction; a failure is counted and the sweep goes on.
    pub fn expire_bonuses(&self) -> CashierResult<ExpirySummary> {
        let now = self.clock.now();
        let live_ids = self.storage.begin().scan_key_suffixes(keys::LIVE_INSTANCE_PREFIX)?;
        let mut summary = ExpirySummary {
            scanned: live_ids.len(),
            ..Default::default()
        };

        for instance_id in live_ids {
            match self.expire_one(&instance_id, now) {
                Ok(true) => summary.expired += 1,
                Ok(false) => {}
                Err(e) => {
                    summary.failed += 1;
                    warn!(instance_id = %instance_id, error = %e, "Failed to expire bonus");
                }
            }
        }

        if summary.expired > 0 || summary.failed > 0 {
            info!(scanned = summary.scanned, expired = summary.expired, failed = summary.failed, "Bonus expiry sweep finished");
        }
        Ok(summary)
    }

    fn expire_one(&self, instance_id: &str, now: DateTime<Utc>) -> CashierResult<bool> {
        let txn = self.storage.begin();
        let mut instance = lock_instance_in(&txn, instance_id)?;
        if !instance.is_live() || instance.expires_at > now {
            return Ok(false);
        }
        close_in(&txn, &mut instance, InstanceStatus::Expired, "expired", now)?;
        txn.commit()?;
        debug!(player_id = %instance.player_id, instance_id, "Bonus expired");
        Ok(true)
    }

    pub fn get_instance(&self, instance_id: &str) -> CashierResult<BonusInstance> {
        self.storage
            .get_json(&keys::bonus_instance(instance_id))?
            .ok_or_else(|| CashierError::not_found("bonus instance", instance_id))
    }

    pub fn get_progress(&self, instance_id: &str) -> CashierResult<WagerProgress> {
        self.storage
            .get_json(&keys::wager_progress(instance_id))?
            .ok_or_else(|| CashierError::not_found("wager progress", instance_id))
    }

    /// Every instance ever granted to the player, oldest first
    pub fn instances_for_player(&self, player_id: &str) -> CashierResult<Vec<BonusInstance>> {
        let txn = self.storage.begin();
        let mut instances = Vec::new();
        for instance_id in txn.scan_key_suffixes(&keys::player_instance_prefix(player_id))? {
            if let Some(instance) = txn.get_json::<BonusInstance>(&keys::bonus_instance(&instance_id))? {
                instances.push(instance);
            }
        }
        instances.sort_by(|a, b| {
            a.granted_at
                .cmp(&b.granted_at)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        Ok(instances)
    }

    pub fn transactions_for_instance(&self, instance_id: &str) -> CashierResult<Vec<BonusTransaction>> {
        Ok(self
            .storage
            .scan_prefix_json::<BonusTransaction>(&keys::bonus_transaction_prefix(instance_id))?
            .into_iter()
            .map(|(_, txn)| txn)
            .collect())
    }

    /// Checks run before any write so a rejected candidate leaves the
    /// transaction clean for the next one.
    fn grant_in(
        &self,
        txn: &StorageTxn<'_>,
        plan: &mut BonusPlan,
        grant: Grant<'_>,
        now: DateTime<Utc>,
    ) -> CashierResult<BonusInstance> {
        let account = ledger::lock_account(txn, grant.player_id)?;
        if account.status != AccountStatus::Active {
            return Err(CashierError::validation(format!(
                "account {} is {}",
                grant.player_id, account.status
            )));
        }
        if grant.bonus_amount == 0 || grant.bonus_amount < plan.terms.min_bonus_amount {
            return Err(CashierError::IneligibleForBonus(IneligibilityReason::BelowMinimumBonus));
        }

        let instance_id = Uuid::new_v4().to_string();
        claim_slot_in(txn, plan, grant.player_id, &instance_id, grant.limit_reason)?;

        let expiry_days = match plan.terms.expiry_days {
            0 => self.config.default_expiry_days,
            days => days,
        };
        let mut instance = BonusInstance {
            instance_id: instance_id.clone(),
            player_id: grant.player_id.to_string(),
            plan_id: plan.id.clone(),
            trigger: plan.trigger,
            terms: plan.terms.clone(),
            bonus_amount: grant.bonus_amount,
            deposit_amount: grant.deposit_amount,
            remaining_bonus: grant.bonus_amount,
            wager_requirement_amount: plan
                .terms
                .wager_requirement(grant.bonus_amount, grant.deposit_amount),
            wager_progress_amount: 0,
            total_bets: 0,
            total_wins: 0,
            released_amount: 0,
            status: InstanceStatus::Active,
            granted_at: now,
            activated_at: now,
            expires_at: now + Duration::days(expiry_days as i64),
            completed_at: None,
            ended_at: None,
            end_reason: None,
            deposit_reference: grant.deposit_reference.map(str::to_string),
            granted_by: grant.granted_by.map(str::to_string),
            notes: grant.notes.map(str::to_string),
            txn_seq: 0,
        };

        txn.put_marker(&keys::player_instance(grant.player_id, &instance_id))?;
        txn.put_marker(&keys::live_instance(&instance_id))?;
        txn.put_json(
            &keys::wager_progress(&instance_id),
            &WagerProgress {
                instance_id: instance_id.clone(),
                player_id: grant.player_id.to_string(),
                required_amount: instance.wager_requirement_amount,
                progress_amount: 0,
                completion_percentage: WagerProgress::completion(0, instance.wager_requirement_amount),
                bets_count: 0,
                last_bet_at: None,
                breakdown: CategoryBreakdown::default(),
            },
        )?;
        wallet::credit_in(txn, grant.player_id, grant.bonus_amount, true)?;
        record_txn_in(
            txn,
            &mut instance,
            BonusTxnKind::Granted,
            grant.bonus_amount,
            grant.deposit_reference,
            now,
        )?;

        if instance.wager_requirement_amount == 0 {
            complete_in(txn, &mut instance, now)?;
        } else {
            save_instance_in(txn, &instance)?;
        }

        plan.granted_count += 1;
        txn.put_json(&keys::bonus_plan(&plan.id), plan)?;
        Ok(instance)
    }
}

fn claim_slot_in(
    txn: &StorageTxn<'_>,
    plan: &BonusPlan,
    player_id: &str,
    instance_id: &str,
    limit_reason: IneligibilityReason,
) -> CashierResult<()> {
    let taken = txn
        .scan_key_suffixes(&keys::bonus_claim_prefix(&plan.id, player_id))?
        .len() as u32;
    let max = plan.terms.max_trigger_per_player;
    if max > 0 && taken >= max {
        return Err(CashierError::IneligibleForBonus(limit_reason));
    }
    txn.insert_unique_json(&keys::bonus_claim(&plan.id, player_id, taken + 1), &instance_id)
        .map_err(|e| match e {
            StorageError::UniqueViolation(_) => CashierError::IneligibleForBonus(limit_reason),
            other => other.into(),
        })
}

pub(crate) fn lock_instance_in(txn: &StorageTxn<'_>, instance_id: &str) -> CashierResult<BonusInstance> {
    txn.get_for_update_json(&keys::bonus_instance(instance_id))?
        .ok_or_else(|| CashierError::not_found("bonus instance", instance_id))
}

pub(crate) fn save_instance_in(txn: &StorageTxn<'_>, instance: &BonusInstance) -> CashierResult<()> {
    txn.put_json(&keys::bonus_instance(&instance.instance_id), instance)?;
    Ok(())
}

/// Lock the player's live instances, oldest grant first
pub(crate) fn live_instances_in(txn: &StorageTxn<'_>, player_id: &str) -> CashierResult<Vec<BonusInstance>> {
    let mut live = Vec::new();
    for instance_id in txn.scan_key_suffixes(&keys::player_instance_prefix(player_id))? {
        if !txn.exists(&keys::live_instance(&instance_id))? {
            continue;
        }
        let instance = lock_instance_in(txn, &instance_id)?;
        if instance.is_live() {
            live.push(instance);
        }
    }
    live.sort_by(|a, b| {
        a.granted_at
            .cmp(&b.granted_at)
            .then_with(|| a.instance_id.cmp(&b.instance_id))
    });
    Ok(live)
}

/// Append a lifecycle record; the caller saves the instance afterwards
pub(crate) fn record_txn_in(
    txn: &StorageTxn<'_>,
    instance: &mut BonusInstance,
    kind: BonusTxnKind,
    amount: u64,
    reference: Option<&str>,
    now: DateTime<Utc>,
) -> CashierResult<()> {
    instance.txn_seq += 1;
    let record = BonusTransaction {
        seq: instance.txn_seq,
        instance_id: instance.instance_id.clone(),
        player_id: instance.player_id.clone(),
        kind,
        amount,
        remaining_after: instance.remaining_bonus,
        reference: reference.map(str::to_string),
        created_at: now,
    };
    txn.put_json(&keys::bonus_transaction(&instance.instance_id, record.seq), &record)?;
    Ok(())
}

/// End a live instance early, forfeiting whatever is left of it
pub(crate) fn close_in(
    txn: &StorageTxn<'_>,
    instance: &mut BonusInstance,
    status: InstanceStatus,
    reason: &str,
    now: DateTime<Utc>,
) -> CashierResult<u64> {
    if !instance.is_live() || !status.is_terminal() || status == InstanceStatus::Completed {
        return Err(CashierError::InvalidTransition {
            entity: "bonus instance",
            from: instance.status.to_string(),
            to: status.to_string(),
        });
    }

    let forfeited = instance.remaining_bonus;
    wallet::forfeit_in(txn, &instance.player_id, forfeited, true)?;
    instance.remaining_bonus = 0;
    instance.status = status;
    instance.ended_at = Some(now);
    instance.end_reason = Some(reason.to_string());

    let kind = match status {
        InstanceStatus::Expired => BonusTxnKind::Expired,
        _ => BonusTxnKind::Forfeited,
    };
    record_txn_in(txn, instance, kind, forfeited, Some(reason), now)?;
    txn.delete(&keys::live_instance(&instance.instance_id))?;
    save_instance_in(txn, instance)?;
    Ok(forfeited)
}

/// Wagering satisfied: release the remaining bonus (up to the release
/// ceiling) to the main wallet and forfeit any excess. Returns the released amount.
pub(crate) fn complete_in(
    txn: &StorageTxn<'_>,
    instance: &mut BonusInstance,
    now: DateTime<Utc>,
) -> CashierResult<u64> {
    if !instance.is_live() {
        return Err(CashierError::InvalidTransition {
            entity: "bonus instance",
            from: instance.status.to_string(),
            to: InstanceStatus::Completed.to_string(),
        });
    }

    let remaining = instance.remaining_bonus;
    let release = instance.terms.cap(remaining);
    let excess = remaining - release;

    if excess > 0 {
        wallet::forfeit_in(txn, &instance.player_id, excess, false)?;
        instance.remaining_bonus = release;
        record_txn_in(txn, instance, BonusTxnKind::Forfeited, excess, Some("release ceiling"), now)?;
    }

    let reference = format!("bonus-release-{}", instance.instance_id);
    if release > 0 {
        wallet::release_in(txn, &instance.player_id, release, true, &reference, now)?;
    } else {
        wallet::forfeit_in(txn, &instance.player_id, 0, true)?;
    }

    instance.remaining_bonus = 0;
    instance.released_amount = release;
    instance.status = InstanceStatus::Completed;
    instance.completed_at = Some(now);
    instance.ended_at = Some(now);
    record_txn_in(txn, instance, BonusTxnKind::Released, release, Some(&reference), now)?;
    txn.delete(&keys::live_instance(&instance.instance_id))?;
    save_instance_in(txn, instance)?;

    info!(
        player_id = %instance.player_id,
        instance_id = %instance.instance_id,
        released = release,
        forfeited = excess,
        "Bonus wagering completed"
    );
    Ok(release)
}

pub(crate) fn cancel_on_withdrawal_in(
    txn: &StorageTxn<'_>,
    player_id: &str,
    now: DateTime<Utc>,
) -> CashierResult<Vec<BonusInstance>> {
    let mut cancelled = Vec::new();
    for mut instance in live_instances_in(txn, player_id)? {
        if !instance.terms.cancel_on_withdrawal {
            continue;
        }
        let amount = close_in(txn, &mut instance, InstanceStatus::Cancelled, "withdrawal requested", now)?;
        info!(player_id, instance_id = %instance.instance_id, amount, "Bonus cancelled by withdrawal");
        cancelled.push(instance);
    }
    Ok(cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bonus::types::{AwardType, BonusCode, BonusTerms, DepositRule, NewBonusPlan, WagerBasis};
    use crate::test_support::Harness;

    fn deposit_plan(priority: i32, max_release: u64) -> NewBonusPlan {
        NewBonusPlan {
            name: format!("Match {}", priority),
            description: "100% deposit match".to_string(),
            trigger: TriggerType::Deposit,
            priority,
            terms: BonusTerms {
                award_type: AwardType::Percentage,
                award_value: 100,
                min_bonus_amount: 5,
                max_release_amount: max_release,
                wager_multiplier: 30,
                wager_basis: WagerBasis::Bonus,
                expiry_days: 7,
                max_trigger_per_player: 1,
                is_playable: true,
                cancel_on_withdrawal: true,
                playable_bonus_qualifies: false,
            },
            code: None,
            deposit_rule: Some(DepositRule {
                min_deposit: 10,
                max_deposit: None,
                payment_methods: vec![],
            }),
        }
    }

    fn code_plan(code: &str, max_uses: Option<u32>) -> NewBonusPlan {
        let mut plan = deposit_plan(0, 0);
        plan.trigger = TriggerType::Code;
        plan.deposit_rule = None;
        plan.terms.award_type = AwardType::Flat;
        plan.terms.award_value = 500;
        plan.code = Some(BonusCode {
            code: code.to_string(),
            valid_from: None,
            valid_until: None,
            max_uses,
            uses: 0,
        });
        plan
    }

    #[test]
    fn test_deposit_grant_amount_and_requirement() {
        let h = Harness::new();
        h.player("p1", 0);
        h.cashier.plans.create_plan(deposit_plan(0, 200)).unwrap();

        let instance = h
            .cashier
            .lifecycle
            .grant_deposit_bonus("p1", 150, "dep-1", None)
            .unwrap()
            .unwrap();
        assert_eq!(instance.bonus_amount, 150);
        assert_eq!(instance.wager_requirement_amount, 4_500);
        assert_eq!(instance.status, InstanceStatus::Active);

        let wallet = h.cashier.wallet.get_balance("p1").unwrap();
        assert_eq!(wallet.playable_bonus_balance, 150);
        assert_eq!(wallet.active_bonus_count, 1);

        let txns = h.cashier.lifecycle.transactions_for_instance(&instance.instance_id).unwrap();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].kind, BonusTxnKind::Granted);
    }

    #[test]
    fn test_requirement_follows_wager_basis() {
        for (basis, expected) in [(WagerBasis::BonusPlusDeposit, 12_000), (WagerBasis::Deposit, 6_000)] {
            let h = Harness::new();
            h.player("p1", 0);
            let mut plan = deposit_plan(0, 0);
            plan.terms.wager_basis = basis;
            h.cashier.plans.create_plan(plan).unwrap();

            let instance = h
                .cashier
                .lifecycle
                .grant_deposit_bonus("p1", 200, "dep-1", None)
                .unwrap()
                .unwrap();
            assert_eq!(instance.bonus_amount, 200);
            assert_eq!(instance.wager_requirement_amount, expected, "basis {:?}", basis);
            assert_eq!(h.cashier.lifecycle.get_progress(&instance.instance_id).unwrap().required_amount, expected);
        }
    }

    #[test]
    fn test_concurrent_grants_for_one_deposit() {
        let h = Harness::new();
        h.player("p1", 0);
        h.cashier.plans.create_plan(deposit_plan(0, 0)).unwrap();

        let results = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| scope.spawn(|| h.cashier.lifecycle.grant_deposit_bonus("p1", 100, "dep-1", None)))
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect::<Vec<_>>()
        });

        let granted = results.iter().filter(|r| matches!(r, Ok(Some(_)))).count();
        let duplicates = results.iter().filter(|r| matches!(r, Err(CashierError::DuplicateOperation(_)))).count();
        assert_eq!((granted, duplicates), (1, 1));
        assert_eq!(h.cashier.wallet.get_balance("p1").unwrap().playable_bonus_balance, 100);
        assert_eq!(h.cashier.lifecycle.instances_for_player("p1").unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_deposits_claim_one_slot() {
        let h = Harness::new();
        h.player("p1", 0);
        h.cashier.plans.create_plan(deposit_plan(0, 0)).unwrap();

        let results = std::thread::scope(|scope| {
            let h = &h;
            let handles: Vec<_> = ["dep-a", "dep-b"]
                .into_iter()
                .map(|reference| scope.spawn(move || h.cashier.lifecycle.grant_deposit_bonus("p1", 100, reference, None)))
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect::<Vec<_>>()
        });

        let granted = results.iter().filter(|r| matches!(r, Ok(Some(_)))).count();
        let skipped = results.iter().filter(|r| matches!(r, Ok(None))).count();
        assert_eq!((granted, skipped), (1, 1));
        assert_eq!(h.cashier.wallet.get_balance("p1").unwrap().active_bonus_count, 1);
    }

    #[test]
    fn test_deposit_reference_evaluated_once() {
        let h = Harness::new();
        h.player("p1", 0);
        h.cashier.plans.create_plan(deposit_plan(0, 0)).unwrap();

        h.cashier.lifecycle.grant_deposit_bonus("p1", 100, "dep-1", None).unwrap();
        let err = h
            .cashier
            .lifecycle
            .grant_deposit_bonus("p1", 100, "dep-1", None)
            .unwrap_err();
        assert!(matches!(err, CashierError::DuplicateOperation(_)));
        assert_eq!(h.cashier.lifecycle.instances_for_player("p1").unwrap().len(), 1);
    }

    #[test]
    fn test_only_first_eligible_plan_applies() {
        let h = Harness::new();
        h.player("p1", 0);
        let low = h.cashier.plans.create_plan(deposit_plan(1, 0)).unwrap();
        let high = h.cashier.plans.create_plan(deposit_plan(9, 0)).unwrap();

        let first = h.cashier.lifecycle.grant_deposit_bonus("p1", 100, "dep-1", None).unwrap().unwrap();
        assert_eq!(first.plan_id, high.id);

        // high-priority plan is now exhausted for this player, so the next deposit falls through
        let second = h.cashier.lifecycle.grant_deposit_bonus("p1", 100, "dep-2", None).unwrap().unwrap();
        assert_eq!(second.plan_id, low.id);

        assert!(h.cashier.lifecycle.grant_deposit_bonus("p1", 100, "dep-3", None).unwrap().is_none());
    }

    #[test]
    fn test_below_minimum_plan_leaves_no_trace() {
        let h = Harness::new();
        h.player("p1", 0);
        let mut strict = deposit_plan(9, 0);
        strict.terms.min_bonus_amount = 1_000;
        let strict = h.cashier.plans.create_plan(strict).unwrap();
        let fallback = h.cashier.plans.create_plan(deposit_plan(1, 0)).unwrap();

        let instance = h.cashier.lifecycle.grant_deposit_bonus("p1", 500, "dep-1", None).unwrap().unwrap();
        assert_eq!(instance.plan_id, fallback.id);

        // the skipped plan took no claim slot
        let instance = h.cashier.lifecycle.grant_deposit_bonus("p1", 2_000, "dep-2", None).unwrap().unwrap();
        assert_eq!(instance.plan_id, strict.id);
    }

    #[test]
    fn test_coded_bonus_errors() {
        let h = Harness::new();
        h.player("p1", 0);
        h.player("p2", 0);
        h.cashier.plans.create_plan(code_plan("ONCE", Some(1))).unwrap();

        let err = h.cashier.lifecycle.grant_coded_bonus("p1", "NOPE").unwrap_err();
        assert!(matches!(err, CashierError::IneligibleForBonus(IneligibilityReason::InvalidOrExpiredCode)));

        let instance = h.cashier.lifecycle.grant_coded_bonus("p1", "once").unwrap();
        assert_eq!(instance.bonus_amount, 500);

        let err = h.cashier.lifecycle.grant_coded_bonus("p2", "ONCE").unwrap_err();
        assert!(matches!(err, CashierError::IneligibleForBonus(IneligibilityReason::CodeUsageLimitReached)));

        h.cashier.plans.create_plan(code_plan("MANY", None)).unwrap();
        h.cashier.lifecycle.grant_coded_bonus("p1", "MANY").unwrap();
        let err = h.cashier.lifecycle.grant_coded_bonus("p1", "MANY").unwrap_err();
        assert!(matches!(err, CashierError::IneligibleForBonus(IneligibilityReason::AlreadyClaimed)));
    }

    #[test]
    fn test_expired_code_rejected() {
        let h = Harness::new();
        h.player("p1", 0);
        let mut plan = code_plan("SPRING", None);
        if let Some(code) = plan.code.as_mut() {
            code.valid_until = Some(h.clock.now() - Duration::days(1));
        }
        h.cashier.plans.create_plan(plan).unwrap();
        let err = h.cashier.lifecycle.grant_coded_bonus("p1", "SPRING").unwrap_err();
        assert!(matches!(err, CashierError::IneligibleForBonus(IneligibilityReason::InvalidOrExpiredCode)));
    }

    #[test]
    fn test_manual_grant_requires_manual_plan() {
        let h = Harness::new();
        h.player("p1", 0);
        let deposit = h.cashier.plans.create_plan(deposit_plan(0, 0)).unwrap();
        let err = h
            .cashier
            .lifecycle
            .grant_manual_bonus("p1", &deposit.id, None, "goodwill", "admin-1")
            .unwrap_err();
        assert!(matches!(err, CashierError::IneligibleForBonus(IneligibilityReason::WrongTriggerType)));

        let mut manual = code_plan("UNUSED", None);
        manual.trigger = TriggerType::Manual;
        manual.code = None;
        let manual = h.cashier.plans.create_plan(manual).unwrap();

        let instance = h
            .cashier
            .lifecycle
            .grant_manual_bonus("p1", &manual.id, Some(750), "goodwill", "admin-1")
            .unwrap();
        assert_eq!(instance.bonus_amount, 750);
        assert_eq!(instance.granted_by.as_deref(), Some("admin-1"));
        assert_eq!(h.cashier.plans.get_plan(&manual.id).unwrap().granted_count, 1);
    }

    #[test]
    fn test_forfeit_is_terminal() {
        let h = Harness::new();
        h.player("p1", 0);
        h.cashier.plans.create_plan(code_plan("FREE", None)).unwrap();
        let instance = h.cashier.lifecycle.grant_coded_bonus("p1", "FREE").unwrap();

        let forfeited = h.cashier.lifecycle.forfeit_bonus(&instance.instance_id, "abuse").unwrap();
        assert_eq!(forfeited.status, InstanceStatus::Forfeited);
        assert_eq!(forfeited.remaining_bonus, 0);
        assert_eq!(h.cashier.wallet.get_balance("p1").unwrap().playable_bonus_balance, 0);

        let err = h.cashier.lifecycle.forfeit_bonus(&instance.instance_id, "again").unwrap_err();
        assert!(matches!(err, CashierError::InvalidTransition { .. }));
        assert_eq!(h.cashier.lifecycle.get_instance(&instance.instance_id).unwrap(), forfeited);
    }

    #[test]
    fn test_expiry_sweep() {
        let h = Harness::new();
        h.player("p1", 0);
        h.cashier.plans.create_plan(code_plan("WEEK", None)).unwrap();
        let instance = h.cashier.lifecycle.grant_coded_bonus("p1", "WEEK").unwrap();

        h.clock.advance(Duration::days(6));
        assert_eq!(h.cashier.lifecycle.expire_bonuses().unwrap().expired, 0);

        h.clock.advance(Duration::days(2));
        let summary = h.cashier.lifecycle.expire_bonuses().unwrap();
        assert_eq!((summary.scanned, summary.expired, summary.failed), (1, 1, 0));

        let expired = h.cashier.lifecycle.get_instance(&instance.instance_id).unwrap();
        assert_eq!(expired.status, InstanceStatus::Expired);
        let kinds: Vec<BonusTxnKind> = h
            .cashier
            .lifecycle
            .transactions_for_instance(&instance.instance_id)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect();
        assert_eq!(kinds, vec![BonusTxnKind::Granted, BonusTxnKind::Expired]);
        assert_eq!(h.cashier.lifecycle.expire_bonuses().unwrap().scanned, 0);
    }

    #[test]
    fn test_zero_requirement_completes_at_grant() {
        let h = Harness::new();
        h.player("p1", 0);
        let mut plan = code_plan("CASH", None);
        plan.terms.wager_multiplier = 0;
        h.cashier.plans.create_plan(plan).unwrap();

        let instance = h.cashier.lifecycle.grant_coded_bonus("p1", "CASH").unwrap();
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 500);
        assert_eq!(h.cashier.wallet.get_balance("p1").unwrap().active_bonus_count, 0);
    }
}
