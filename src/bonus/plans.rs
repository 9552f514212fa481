//! Bonus plan administration

use super::types::{AwardType, BonusPlan, BonusPlanUpdate, NewBonusPlan, TriggerType};
use crate::clock::Clock;
use crate::errors::{CashierError, CashierResult, StorageError};
use crate::storage::{keys, validate_id, Storage, StorageTxn};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct BonusPlans {
    storage: Storage,
    clock: Arc<dyn Clock>,
}

impl BonusPlans {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    pub fn create_plan(&self, new_plan: NewBonusPlan) -> CashierResult<BonusPlan> {
        validate_new_plan(&new_plan)?;

        let mut code = new_plan.code;
        if let Some(code) = code.as_mut() {
            code.code = code.code.to_uppercase();
            code.uses = 0;
        }

        let plan = BonusPlan {
            id: Uuid::new_v4().to_string(),
            name: new_plan.name,
            description: new_plan.description,
            trigger: new_plan.trigger,
            is_active: true,
            priority: new_plan.priority,
            terms: new_plan.terms,
            code,
            deposit_rule: new_plan.deposit_rule,
            granted_count: 0,
            created_at: self.clock.now(),
        };

        let txn = self.storage.begin();
        if let Some(code) = &plan.code {
            txn.insert_unique_json(&keys::bonus_code(&code.code), &plan.id)
                .map_err(|e| match e {
                    StorageError::UniqueViolation(_) => {
                        CashierError::DuplicateOperation(format!("bonus code {} already exists", code.code))
                    }
                    other => other.into(),
                })?;
        }
        txn.put_json(&keys::bonus_plan(&plan.id), &plan)?;
        txn.commit()?;

        info!(plan_id = %plan.id, name = %plan.name, trigger = plan.trigger.as_str(), "Created bonus plan");
        Ok(plan)
    }

    pub fn get_plan(&self, plan_id: &str) -> CashierResult<BonusPlan> {
        self.storage
            .get_json(&keys::bonus_plan(plan_id))?
            .ok_or_else(|| CashierError::not_found("bonus plan", plan_id))
    }

    /// All plans, highest priority first
    pub fn list_plans(&self) -> CashierResult<Vec<BonusPlan>> {
        let mut plans: Vec<BonusPlan> = self
            .storage
            .scan_prefix_json::<BonusPlan>(keys::BONUS_PLAN_PREFIX)?
            .into_iter()
            .map(|(_, plan)| plan)
            .collect();
        sort_by_priority(&mut plans);
        Ok(plans)
    }

    pub fn update_plan(&self, plan_id: &str, update: BonusPlanUpdate) -> CashierResult<BonusPlan> {
        let txn = self.storage.begin();
        let mut plan = lock_plan_in(&txn, plan_id)?;

        if let Some(terms) = update.terms {
            if plan.granted_count > 0 && terms != plan.terms {
                return Err(CashierError::validation(format!(
                    "terms of plan {} are fixed after {} grants",
                    plan_id, plan.granted_count
                )));
            }
            plan.terms = terms;
        }
        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(CashierError::validation("plan name must not be empty"));
            }
            plan.name = name;
        }
        if let Some(description) = update.description {
            plan.description = description;
        }
        if let Some(is_active) = update.is_active {
            plan.is_active = is_active;
        }
        if let Some(priority) = update.priority {
            plan.priority = priority;
        }

        txn.put_json(&keys::bonus_plan(plan_id), &plan)?;
        txn.commit()?;

        info!(plan_id, is_active = plan.is_active, "Updated bonus plan");
        Ok(plan)
    }
}

fn validate_new_plan(plan: &NewBonusPlan) -> CashierResult<()> {
    if plan.name.trim().is_empty() {
        return Err(CashierError::validation("plan name must not be empty"));
    }
    if plan.terms.award_value == 0 {
        return Err(CashierError::validation("award_value must be positive"));
    }
    if plan.terms.award_type == AwardType::Percentage && plan.trigger != TriggerType::Deposit {
        return Err(CashierError::validation(
            "percentage awards need a deposit-triggered plan",
        ));
    }
    match plan.trigger {
        TriggerType::Code => {
            let code = plan
                .code
                .as_ref()
                .ok_or_else(|| CashierError::validation("code-triggered plan needs a code"))?;
            validate_id("bonus code", &code.code)?;
            if let (Some(from), Some(until)) = (code.valid_from, code.valid_until) {
                if from > until {
                    return Err(CashierError::validation("code valid_from is after valid_until"));
                }
            }
        }
        TriggerType::Deposit => {
            if plan.deposit_rule.is_none() {
                return Err(CashierError::validation("deposit-triggered plan needs a deposit rule"));
            }
        }
        TriggerType::Manual => {}
    }
    if plan.trigger != TriggerType::Code && plan.code.is_some() {
        return Err(CashierError::validation("only code-triggered plans carry a code"));
    }
    Ok(())
}

pub(crate) fn sort_by_priority(plans: &mut [BonusPlan]) {
    plans.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

pub(crate) fn lock_plan_in(txn: &StorageTxn<'_>, plan_id: &str) -> CashierResult<BonusPlan> {
    txn.get_for_update_json(&keys::bonus_plan(plan_id))?
        .ok_or_else(|| CashierError::not_found("bonus plan", plan_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bonus::types::{BonusCode, BonusTerms, DepositRule, WagerBasis};
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    fn plans() -> (tempfile::TempDir, BonusPlans) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        (dir, BonusPlans::new(storage, Arc::new(clock)))
    }

    fn terms() -> BonusTerms {
        BonusTerms {
            award_type: AwardType::Flat,
            award_value: 1_000,
            min_bonus_amount: 0,
            max_release_amount: 0,
            wager_multiplier: 10,
            wager_basis: WagerBasis::Bonus,
            expiry_days: 7,
            max_trigger_per_player: 1,
            is_playable: true,
            cancel_on_withdrawal: true,
            playable_bonus_qualifies: false,
        }
    }

    fn coded(code: &str) -> NewBonusPlan {
        NewBonusPlan {
            name: "Welcome code".to_string(),
            description: String::new(),
            trigger: TriggerType::Code,
            priority: 0,
            terms: terms(),
            code: Some(BonusCode {
                code: code.to_string(),
                valid_from: None,
                valid_until: None,
                max_uses: Some(100),
                uses: 42,
            }),
            deposit_rule: None,
        }
    }

    #[test]
    fn test_code_is_unique_and_normalised() {
        let (_dir, plans) = plans();
        let plan = plans.create_plan(coded("welcome10")).unwrap();
        let code = plan.code.unwrap();
        assert_eq!(code.code, "WELCOME10");
        assert_eq!(code.uses, 0);

        let err = plans.create_plan(coded("WELCOME10")).unwrap_err();
        assert!(matches!(err, CashierError::DuplicateOperation(_)));
    }

    #[test]
    fn test_invalid_plans_rejected() {
        let (_dir, plans) = plans();
        let mut plan = coded("X1");
        plan.code = None;
        assert!(plans.create_plan(plan).is_err());

        let mut plan = coded("X2");
        plan.trigger = TriggerType::Deposit;
        plan.code = None;
        assert!(plans.create_plan(plan).is_err());

        let mut plan = coded("X3");
        plan.terms.award_type = AwardType::Percentage;
        assert!(plans.create_plan(plan).is_err());
    }

    #[test]
    fn test_update_and_priority_order() {
        let (_dir, plans) = plans();
        let low = plans.create_plan(coded("LOW")).unwrap();
        let mut high = coded("HIGH");
        high.trigger = TriggerType::Deposit;
        high.code = None;
        high.priority = 5;
        high.deposit_rule = Some(DepositRule {
            min_deposit: 0,
            max_deposit: None,
            payment_methods: vec![],
        });
        let high = plans.create_plan(high).unwrap();

        let listed: Vec<String> = plans.list_plans().unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(listed, vec![high.id.clone(), low.id.clone()]);

        let updated = plans
            .update_plan(
                &low.id,
                BonusPlanUpdate {
                    is_active: Some(false),
                    name: Some("Retired".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!updated.is_active);
        assert_eq!(updated.name, "Retired");
        assert!(plans.update_plan("missing", BonusPlanUpdate::default()).is_err());
    }
}
