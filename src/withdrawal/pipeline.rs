//! Withdrawal request pipeline
//!
//! A request debits the gross amount from the main wallet the moment it is
//! created. From then on every exit that does not pay the player (rejection,
//! cancellation, gateway failure) returns exactly that amount through
//! [`compensate_in`], which a unique refund marker keeps to a single refund
//! per request.
//!
//! Dispatch is two-phase: `approved -> processing` commits first, the gateway
//! is called with no locks held, then `completed` or `failed` commits in a
//! second transaction.

use super::gateway::{
    convert_amount, CurrencyConverter, GatewayError, PayoutGateway, PayoutInstruction, PayoutReceipt,
};
use super::risk::RiskScorer;
use super::types::{
    ApprovalStatus, AuditActor, BatchSummary, Conversion, NewWithdrawal, WithdrawalAuditEntry,
    WithdrawalRequest, WithdrawalStatus,
};
use crate::bonus::lifecycle::cancel_on_withdrawal_in;
use crate::clock::Clock;
use crate::config::{RiskConfig, WithdrawalPolicy};
use crate::errors::{CashierError, CashierResult, LimitWindow, StorageError};
use crate::ledger::{self, AccountStatus, EntryKind};
use crate::metrics::CashierMetrics;
use crate::storage::{keys, validate_id, Storage, StorageTxn};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct WithdrawalPipeline {
    storage: Storage,
    clock: Arc<dyn Clock>,
    policy: WithdrawalPolicy,
    risk: RiskScorer,
    gateway: Arc<dyn PayoutGateway>,
    converter: Arc<dyn CurrencyConverter>,
    metrics: Arc<CashierMetrics>,
    /// Requests currently being dispatched by this process
    in_flight: DashMap<String, ()>,
}

/// Removes its id from the in-flight set when dropped
struct InFlightGuard<'a> {
    in_flight: &'a DashMap<String, ()>,
    withdrawal_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.withdrawal_id);
    }
}

impl WithdrawalPipeline {
    pub fn new(
        storage: Storage,
        clock: Arc<dyn Clock>,
        policy: WithdrawalPolicy,
        risk: RiskConfig,
        gateway: Arc<dyn PayoutGateway>,
        converter: Arc<dyn CurrencyConverter>,
        metrics: Arc<CashierMetrics>,
    ) -> Self {
        Self {
            storage,
            clock,
            policy,
            risk: RiskScorer::new(risk),
            gateway,
            converter,
            metrics,
            in_flight: DashMap::new(),
        }
    }

    /// Validate, score and record a withdrawal, locking its funds. Eligible
    /// requests are approved and, inside the processing window, paid out
    /// before this returns.
    pub async fn create_withdrawal_request(&self, new: NewWithdrawal) -> CashierResult<WithdrawalRequest> {
        validate_id("player_id", &new.player_id)?;
        if new.target.address.trim().is_empty() || new.target.network.trim().is_empty() {
            return Err(CashierError::validation("payout network and address are required"));
        }

        let (request, auto_approve) = self.create_in_txn(&new, self.clock.now())?;
        self.metrics.record_withdrawal(WithdrawalStatus::Pending.as_str());
        info!(
            player_id = %request.player_id,
            withdrawal_id = %request.withdrawal_id,
            amount = request.amount,
            fee = request.fee_amount,
            risk_score = request.risk_score,
            auto_approve,
            "Withdrawal requested"
        );

        if !auto_approve {
            return Ok(request);
        }

        let withdrawal_id = request.withdrawal_id;
        let approved = match self
            .approve(&withdrawal_id, AuditActor::System, ApprovalStatus::AutoApproved)
            .await
        {
            Ok(approved) => approved,
            Err(e) => {
                warn!(withdrawal_id = %withdrawal_id, error = %e, "Auto-approval failed, left for review");
                return self.get_withdrawal(&withdrawal_id);
            }
        };

        if !self.policy.processing_window.contains(self.clock.now().time()) {
            debug!(withdrawal_id = %withdrawal_id, "Outside processing window, dispatch deferred");
            return Ok(approved);
        }

        match self.process_withdrawal(&withdrawal_id).await {
            Ok(processed) => Ok(processed),
            Err(e) => {
                if !matches!(e, CashierError::GatewayFailure(_)) {
                    warn!(withdrawal_id = %withdrawal_id, error = %e, "Immediate dispatch failed");
                }
                self.get_withdrawal(&withdrawal_id)
            }
        }
    }

    fn create_in_txn(
        &self,
        new: &NewWithdrawal,
        now: DateTime<Utc>,
    ) -> CashierResult<(WithdrawalRequest, bool)> {
        let policy = &self.policy;
        let amount = new.amount;
        let txn = self.storage.begin();
        let mut account = ledger::lock_account(&txn, &new.player_id)?;

        if account.status != AccountStatus::Active {
            return Err(CashierError::validation(format!("account is {}", account.status)));
        }
        if policy.require_kyc && !account.kyc_verified {
            return Err(CashierError::validation("identity verification required"));
        }
        if account.age_days(now) < policy.min_account_age_days as i64 {
            return Err(CashierError::validation(format!(
                "account must be at least {} days old",
                policy.min_account_age_days
            )));
        }
        if account.lifetime_deposits < policy.min_lifetime_deposit {
            return Err(CashierError::validation(format!(
                "lifetime deposits must reach {}",
                policy.min_lifetime_deposit
            )));
        }
        if amount < policy.min_amount || amount > policy.max_amount {
            return Err(CashierError::validation(format!(
                "amount must be between {} and {}",
                policy.min_amount, policy.max_amount
            )));
        }

        let cancelled_bonuses: Vec<String> = cancel_on_withdrawal_in(&txn, &new.player_id, now)?
            .into_iter()
            .map(|instance| instance.instance_id)
            .collect();

        if account.main_balance < amount {
            return Err(CashierError::InsufficientFunds {
                requested: amount,
                available: account.main_balance,
            });
        }

        let history = history_in(&txn, &new.player_id)?;
        let outstanding = history.iter().filter(|r| r.status.is_outstanding()).count();
        if outstanding >= policy.max_pending_requests {
            return Err(CashierError::LimitExceeded {
                window: LimitWindow::PendingCount,
                used: outstanding as u64,
                requested: 1,
                limit: policy.max_pending_requests as u64,
            });
        }

        for (window, days, limit) in [
            (LimitWindow::Daily, 1, policy.daily_limit),
            (LimitWindow::Weekly, 7, policy.weekly_limit),
            (LimitWindow::Monthly, 30, policy.monthly_limit),
        ] {
            let since = now - Duration::days(days);
            let used: u64 = history
                .iter()
                .filter(|r| r.status.counts_toward_limits() && r.requested_at > since)
                .map(|r| r.amount)
                .sum();
            if used + amount > limit {
                return Err(CashierError::LimitExceeded {
                    window,
                    used,
                    requested: amount,
                    limit,
                });
            }
        }

        let fee_amount = amount * policy.fee_bps as u64 / 10_000 + policy.fee_fixed;
        if fee_amount >= amount {
            return Err(CashierError::validation(format!(
                "fee {} leaves nothing to pay out of {}",
                fee_amount, amount
            )));
        }

        let ip_known = match &new.ip_address {
            Some(ip) => Some(txn.exists(&keys::known_ip(&new.player_id, ip))?),
            None => None,
        };
        let signals = self.risk.signals(amount, account.lifetime_deposits, ip_known, &history, now);
        let assessment = self.risk.assess(&signals);
        let high_risk = self.risk.is_high_risk(assessment.score);
        let auto_approve =
            !high_risk && amount <= policy.auto_approve_limit && policy.auto_processing_enabled;

        let mut request = WithdrawalRequest {
            withdrawal_id: Uuid::new_v4().to_string(),
            player_id: new.player_id.clone(),
            amount,
            fee_amount,
            net_amount: amount - fee_amount,
            currency: account.currency.clone(),
            target: new.target.clone(),
            ip_address: new.ip_address.clone(),
            status: WithdrawalStatus::Pending,
            approval_status: ApprovalStatus::Pending,
            risk_score: assessment.score,
            risk_level: assessment.level,
            risk_factors: assessment.factors.clone(),
            conversion: None,
            gateway_reference: None,
            failure_reason: None,
            rejection_reason: None,
            reviewed_by: None,
            processing_attempts: 0,
            requested_at: now,
            approved_at: None,
            rejected_at: None,
            processed_at: None,
            completed_at: None,
            cancelled_at: None,
            failed_at: None,
            audit_seq: 0,
        };

        ledger::debit(
            &txn,
            &mut account,
            amount,
            EntryKind::WithdrawalDebit,
            &request.withdrawal_id,
            now,
        )?;
        txn.put_marker(&keys::player_withdrawal(&request.player_id, &request.withdrawal_id))?;
        txn.put_marker(&keys::withdrawal_status(
            WithdrawalStatus::Pending.as_str(),
            &request.withdrawal_id,
        ))?;
        append_audit_in(
            &txn,
            &mut request,
            AuditActor::Player(new.player_id.clone()),
            None,
            WithdrawalStatus::Pending,
            json!({
                "amount": amount,
                "fee_amount": fee_amount,
                "risk_score": assessment.score,
                "risk_level": assessment.level.as_str(),
                "risk_factors": assessment.factors,
                "cancelled_bonuses": cancelled_bonuses,
                "auto_approve": auto_approve,
            }),
            now,
        )?;
        txn.insert_unique_json(&keys::withdrawal(&request.withdrawal_id), &request)?;
        txn.commit()?;

        Ok((request, auto_approve))
    }

    /// Admin approval; captures the payout conversion
    pub async fn approve_withdrawal(&self, withdrawal_id: &str, admin_id: &str) -> CashierResult<WithdrawalRequest> {
        validate_id("admin_id", admin_id)?;
        self.approve(
            withdrawal_id,
            AuditActor::Admin(admin_id.to_string()),
            ApprovalStatus::ManuallyApproved,
        )
        .await
    }

    async fn approve(
        &self,
        withdrawal_id: &str,
        actor: AuditActor,
        approval: ApprovalStatus,
    ) -> CashierResult<WithdrawalRequest> {
        let current = self.get_withdrawal(withdrawal_id)?;
        if current.status != WithdrawalStatus::Pending {
            return Err(invalid_transition(current.status, WithdrawalStatus::Approved));
        }
        let rate = self
            .converter
            .rate(&current.currency, &self.policy.payout_currency)
            .await?;

        let now = self.clock.now();
        let txn = self.storage.begin();
        let mut request = lock_request_in(&txn, withdrawal_id)?;
        if approval == ApprovalStatus::AutoApproved && self.risk.is_high_risk(request.risk_score) {
            return Err(CashierError::RiskBlocked {
                score: request.risk_score,
            });
        }

        let conversion = Conversion {
            rate,
            payout_currency: self.policy.payout_currency.clone(),
            payout_amount: convert_amount(request.net_amount, rate),
            quoted_at: now,
        };
        transition_in(
            &txn,
            &mut request,
            WithdrawalStatus::Approved,
            actor.clone(),
            json!({
                "approval": approval,
                "rate": conversion.rate,
                "payout_amount": conversion.payout_amount,
                "payout_currency": conversion.payout_currency,
            }),
            now,
        )?;
        request.approval_status = approval;
        request.approved_at = Some(now);
        request.conversion = Some(conversion);
        if let AuditActor::Admin(admin_id) = actor {
            request.reviewed_by = Some(admin_id);
        }
        save_request_in(&txn, &request)?;
        txn.commit()?;

        self.metrics.record_withdrawal(WithdrawalStatus::Approved.as_str());
        info!(withdrawal_id, approval = ?approval, "Withdrawal approved");
        Ok(request)
    }

    pub fn reject_withdrawal(&self, withdrawal_id: &str, admin_id: &str, reason: &str) -> CashierResult<WithdrawalRequest> {
        validate_id("admin_id", admin_id)?;
        let now = self.clock.now();
        let txn = self.storage.begin();
        let mut request = lock_request_in(&txn, withdrawal_id)?;
        transition_in(
            &txn,
            &mut request,
            WithdrawalStatus::Rejected,
            AuditActor::Admin(admin_id.to_string()),
            json!({ "reason": reason }),
            now,
        )?;
        request.approval_status = ApprovalStatus::Rejected;
        request.rejected_at = Some(now);
        request.rejection_reason = Some(reason.to_string());
        request.reviewed_by = Some(admin_id.to_string());
        compensate_in(&txn, &request, now)?;
        save_request_in(&txn, &request)?;
        txn.commit()?;

        self.metrics.record_withdrawal(WithdrawalStatus::Rejected.as_str());
        info!(withdrawal_id, admin_id, reason, "Withdrawal rejected and refunded");
        Ok(request)
    }

    /// Player-initiated; only while the request is still pending
    pub fn cancel_withdrawal(&self, withdrawal_id: &str, player_id: &str) -> CashierResult<WithdrawalRequest> {
        let now = self.clock.now();
        let txn = self.storage.begin();
        let mut request = lock_request_in(&txn, withdrawal_id)?;
        if request.player_id != player_id {
            return Err(CashierError::not_found("withdrawal", withdrawal_id));
        }
        transition_in(
            &txn,
            &mut request,
            WithdrawalStatus::Cancelled,
            AuditActor::Player(player_id.to_string()),
            json!({}),
            now,
        )?;
        request.cancelled_at = Some(now);
        compensate_in(&txn, &request, now)?;
        save_request_in(&txn, &request)?;
        txn.commit()?;

        self.metrics.record_withdrawal(WithdrawalStatus::Cancelled.as_str());
        info!(withdrawal_id, player_id, "Withdrawal cancelled and refunded");
        Ok(request)
    }

    /// Pay out an approved request. On final gateway failure the request is
    /// refunded, moved to `failed`, and `GatewayFailure` is returned.
    pub async fn process_withdrawal(&self, withdrawal_id: &str) -> CashierResult<WithdrawalRequest> {
        let _guard = self.claim_in_flight(withdrawal_id)?;
        let request = self.begin_processing(withdrawal_id)?;

        let outcome = match self.conversion_for(&request).await {
            Ok(conversion) => self.dispatch(&request, &conversion).await,
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(receipt) => self.finish_completed(withdrawal_id, receipt),
            Err(reason) => {
                self.finish_failed(withdrawal_id, &reason)?;
                Err(CashierError::GatewayFailure(reason))
            }
        }
    }

    /// Dispatch every approved request not yet attempted; one failure never
    /// stops the batch.
    pub async fn process_pending_withdrawals(&self) -> CashierResult<BatchSummary> {
        let approved = self
            .storage
            .begin()
            .scan_key_suffixes(&keys::withdrawal_status_prefix(WithdrawalStatus::Approved.as_str()))?;
        let mut summary = BatchSummary::default();

        for withdrawal_id in approved {
            let request = match self.get_withdrawal(&withdrawal_id) {
                Ok(request) => request,
                Err(e) => {
                    summary.failed += 1;
                    warn!(withdrawal_id = %withdrawal_id, error = %e, "Failed to load approved withdrawal");
                    continue;
                }
            };
            if request.status != WithdrawalStatus::Approved || request.processing_attempts > 0 {
                summary.skipped += 1;
                continue;
            }

            summary.attempted += 1;
            match self.process_withdrawal(&withdrawal_id).await {
                Ok(_) => summary.completed += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!(withdrawal_id = %withdrawal_id, error = %e, "Batch dispatch failed");
                }
            }
        }

        if summary.attempted > 0 || summary.failed > 0 {
            info!(
                attempted = summary.attempted,
                completed = summary.completed,
                failed = summary.failed,
                skipped = summary.skipped,
                "Pending withdrawal batch finished"
            );
        }
        Ok(summary)
    }

    pub fn get_withdrawal(&self, withdrawal_id: &str) -> CashierResult<WithdrawalRequest> {
        self.storage
            .get_json(&keys::withdrawal(withdrawal_id))?
            .ok_or_else(|| CashierError::not_found("withdrawal", withdrawal_id))
    }

    /// Oldest first
    pub fn withdrawals_for_player(&self, player_id: &str) -> CashierResult<Vec<WithdrawalRequest>> {
        let txn = self.storage.begin();
        history_in(&txn, player_id)
    }

    pub fn audit_log(&self, withdrawal_id: &str) -> CashierResult<Vec<WithdrawalAuditEntry>> {
        Ok(self
            .storage
            .scan_prefix_json::<WithdrawalAuditEntry>(&keys::withdrawal_audit_prefix(withdrawal_id))?
            .into_iter()
            .map(|(_, entry)| entry)
            .collect())
    }

    fn claim_in_flight(&self, withdrawal_id: &str) -> CashierResult<InFlightGuard<'_>> {
        match self.in_flight.entry(withdrawal_id.to_string()) {
            Entry::Occupied(_) => Err(CashierError::DuplicateOperation(format!(
                "withdrawal {} is already being dispatched",
                withdrawal_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(InFlightGuard {
                    in_flight: &self.in_flight,
                    withdrawal_id: withdrawal_id.to_string(),
                })
            }
        }
    }

    fn begin_processing(&self, withdrawal_id: &str) -> CashierResult<WithdrawalRequest> {
        let now = self.clock.now();
        let txn = self.storage.begin();
        let mut request = lock_request_in(&txn, withdrawal_id)?;
        let attempt = request.processing_attempts + 1;
        transition_in(
            &txn,
            &mut request,
            WithdrawalStatus::Processing,
            AuditActor::System,
            json!({ "attempt": attempt }),
            now,
        )?;
        request.processing_attempts += 1;
        request.processed_at = Some(now);
        save_request_in(&txn, &request)?;
        txn.commit()?;
        Ok(request)
    }

    async fn conversion_for(&self, request: &WithdrawalRequest) -> CashierResult<Conversion> {
        if let Some(conversion) = &request.conversion {
            return Ok(conversion.clone());
        }
        let rate = self
            .converter
            .rate(&request.currency, &self.policy.payout_currency)
            .await?;
        Ok(Conversion {
            rate,
            payout_currency: self.policy.payout_currency.clone(),
            payout_amount: convert_amount(request.net_amount, rate),
            quoted_at: self.clock.now(),
        })
    }

    /// Call the gateway with a timeout, retrying transient failures
    async fn dispatch(&self, request: &WithdrawalRequest, conversion: &Conversion) -> Result<PayoutReceipt, String> {
        let instruction = PayoutInstruction {
            withdrawal_id: request.withdrawal_id.clone(),
            player_id: request.player_id.clone(),
            amount: conversion.payout_amount,
            currency: conversion.payout_currency.clone(),
            target: request.target.clone(),
        };
        let timeout = self.policy.gateway_timeout();
        let max_attempts = self.policy.gateway_max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let error = match tokio::time::timeout(timeout, self.gateway.send_payout(&instruction)).await {
                Ok(Ok(receipt)) => {
                    if receipt.amount != instruction.amount {
                        warn!(
                            withdrawal_id = %request.withdrawal_id,
                            expected = instruction.amount,
                            paid = receipt.amount,
                            "Gateway paid a different amount"
                        );
                    }
                    return Ok(receipt);
                }
                Ok(Err(e)) => e,
                Err(_) => GatewayError::Timeout(timeout),
            };

            warn!(withdrawal_id = %request.withdrawal_id, attempt, max_attempts, error = %error, "Payout attempt failed");
            last_error = error.to_string();
            if !error.is_retryable() {
                break;
            }
            if attempt < max_attempts {
                tokio::time::sleep(self.policy.gateway_retry_backoff()).await;
            }
        }
        Err(last_error)
    }

    fn finish_completed(&self, withdrawal_id: &str, receipt: PayoutReceipt) -> CashierResult<WithdrawalRequest> {
        let now = self.clock.now();
        let txn = self.storage.begin();
        let mut request = lock_request_in(&txn, withdrawal_id)?;
        transition_in(
            &txn,
            &mut request,
            WithdrawalStatus::Completed,
            AuditActor::System,
            json!({ "reference": receipt.reference, "paid_amount": receipt.amount }),
            now,
        )?;
        request.gateway_reference = Some(receipt.reference);
        request.completed_at = Some(now);
        if let Some(ip) = &request.ip_address {
            txn.put_marker(&keys::known_ip(&request.player_id, ip))?;
        }
        save_request_in(&txn, &request)?;
        if let Err(e) = txn.commit() {
            // Paid out but not recorded; needs reconciliation against the gateway reference
            error!(withdrawal_id, reference = ?request.gateway_reference, error = %e, "Failed to record completed payout");
            return Err(e.into());
        }

        self.metrics.record_withdrawal(WithdrawalStatus::Completed.as_str());
        info!(
            withdrawal_id,
            player_id = %request.player_id,
            reference = ?request.gateway_reference,
            "Withdrawal completed"
        );
        Ok(request)
    }

    fn finish_failed(&self, withdrawal_id: &str, reason: &str) -> CashierResult<()> {
        let now = self.clock.now();
        let txn = self.storage.begin();
        let mut request = lock_request_in(&txn, withdrawal_id)?;
        transition_in(
            &txn,
            &mut request,
            WithdrawalStatus::Failed,
            AuditActor::System,
            json!({ "reason": reason, "attempts": self.policy.gateway_max_attempts }),
            now,
        )?;
        request.failure_reason = Some(reason.to_string());
        request.failed_at = Some(now);
        compensate_in(&txn, &request, now)?;
        save_request_in(&txn, &request)?;
        txn.commit()?;

        self.metrics.record_withdrawal(WithdrawalStatus::Failed.as_str());
        warn!(withdrawal_id, player_id = %request.player_id, reason, "Withdrawal failed and refunded");
        Ok(())
    }
}

fn invalid_transition(from: WithdrawalStatus, to: WithdrawalStatus) -> CashierError {
    CashierError::InvalidTransition {
        entity: "withdrawal",
        from: from.to_string(),
        to: to.to_string(),
    }
}

fn lock_request_in(txn: &StorageTxn<'_>, withdrawal_id: &str) -> CashierResult<WithdrawalRequest> {
    txn.get_for_update_json(&keys::withdrawal(withdrawal_id))?
        .ok_or_else(|| CashierError::not_found("withdrawal", withdrawal_id))
}

fn save_request_in(txn: &StorageTxn<'_>, request: &WithdrawalRequest) -> CashierResult<()> {
    txn.put_json(&keys::withdrawal(&request.withdrawal_id), request)?;
    Ok(())
}

fn history_in(txn: &StorageTxn<'_>, player_id: &str) -> CashierResult<Vec<WithdrawalRequest>> {
    let mut history = Vec::new();
    for withdrawal_id in txn.scan_key_suffixes(&keys::player_withdrawal_prefix(player_id))? {
        if let Some(request) = txn.get_json::<WithdrawalRequest>(&keys::withdrawal(&withdrawal_id))? {
            history.push(request);
        }
    }
    history.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
    Ok(history)
}

/// Move to `next`, keeping the status index and audit trail in step.
/// The caller saves the request.
fn transition_in(
    txn: &StorageTxn<'_>,
    request: &mut WithdrawalRequest,
    next: WithdrawalStatus,
    actor: AuditActor,
    details: serde_json::Value,
    now: DateTime<Utc>,
) -> CashierResult<()> {
    let current = request.status;
    if !current.can_transition_to(next) {
        return Err(invalid_transition(current, next));
    }
    txn.delete(&keys::withdrawal_status(current.as_str(), &request.withdrawal_id))?;
    txn.put_marker(&keys::withdrawal_status(next.as_str(), &request.withdrawal_id))?;
    request.status = next;
    append_audit_in(txn, request, actor, Some(current), next, details, now)
}

fn append_audit_in(
    txn: &StorageTxn<'_>,
    request: &mut WithdrawalRequest,
    actor: AuditActor,
    old_status: Option<WithdrawalStatus>,
    new_status: WithdrawalStatus,
    details: serde_json::Value,
    now: DateTime<Utc>,
) -> CashierResult<()> {
    request.audit_seq += 1;
    let entry = WithdrawalAuditEntry {
        seq: request.audit_seq,
        withdrawal_id: request.withdrawal_id.clone(),
        actor,
        old_status,
        new_status,
        details,
        at: now,
    };
    txn.insert_unique_json(&keys::withdrawal_audit(&request.withdrawal_id, entry.seq), &entry)?;
    Ok(())
}

/// Return the gross amount to the main wallet, at most once per request.
/// Returns whether this call made the refund.
fn compensate_in(txn: &StorageTxn<'_>, request: &WithdrawalRequest, now: DateTime<Utc>) -> CashierResult<bool> {
    match txn.insert_unique_json(&keys::withdrawal_refund(&request.withdrawal_id), &now) {
        Ok(()) => {}
        Err(StorageError::UniqueViolation(_)) => {
            warn!(withdrawal_id = %request.withdrawal_id, "Withdrawal already refunded");
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    }
    let mut account = ledger::lock_account(txn, &request.player_id)?;
    ledger::credit(
        txn,
        &mut account,
        request.amount,
        EntryKind::WithdrawalRefund,
        &request.withdrawal_id,
        now,
    )?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Harness, ScriptedPayoutGateway};
    use crate::withdrawal::types::PayoutTarget;

    fn request(player_id: &str, amount: u64) -> NewWithdrawal {
        NewWithdrawal {
            player_id: player_id.to_string(),
            amount,
            target: PayoutTarget {
                network: "tron".to_string(),
                address: "TQ1234".to_string(),
                memo: None,
            },
            ip_address: Some("10.0.0.1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_reject_refunds_exactly_once() {
        let h = Harness::manual_review();
        h.player("p1", 10_000);

        let created = h.cashier.withdrawals.create_withdrawal_request(request("p1", 4_000)).await.unwrap();
        assert_eq!(created.status, WithdrawalStatus::Pending);
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 6_000);

        let rejected = h.cashier.withdrawals.reject_withdrawal(&created.withdrawal_id, "admin-1", "docs").unwrap();
        assert_eq!(rejected.status, WithdrawalStatus::Rejected);
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 10_000);

        assert!(h.cashier.withdrawals.reject_withdrawal(&created.withdrawal_id, "admin-1", "again").is_err());
        assert!(h.cashier.withdrawals.cancel_withdrawal(&created.withdrawal_id, "p1").is_err());
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 10_000);
    }

    #[tokio::test]
    async fn test_cancel_only_by_owner_while_pending() {
        let h = Harness::manual_review();
        h.player("p1", 10_000);
        let created = h.cashier.withdrawals.create_withdrawal_request(request("p1", 2_000)).await.unwrap();

        assert!(matches!(
            h.cashier.withdrawals.cancel_withdrawal(&created.withdrawal_id, "p2").unwrap_err(),
            CashierError::NotFound { .. }
        ));
        let cancelled = h.cashier.withdrawals.cancel_withdrawal(&created.withdrawal_id, "p1").unwrap();
        assert_eq!(cancelled.status, WithdrawalStatus::Cancelled);
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 10_000);

        let audit = h.cashier.withdrawals.audit_log(&created.withdrawal_id).unwrap();
        let statuses: Vec<_> = audit.iter().map(|e| (e.old_status, e.new_status)).collect();
        assert_eq!(
            statuses,
            vec![
                (None, WithdrawalStatus::Pending),
                (Some(WithdrawalStatus::Pending), WithdrawalStatus::Cancelled)
            ]
        );
    }

    #[tokio::test]
    async fn test_gateway_failure_refunds_once_after_retries() {
        let gateway = ScriptedPayoutGateway::failing(5);
        let h = Harness::with_gateway(gateway.clone());
        h.player("p1", 10_000);

        let created = h.cashier.withdrawals.create_withdrawal_request(request("p1", 5_000)).await.unwrap();
        assert_eq!(created.status, WithdrawalStatus::Failed);
        assert_eq!(gateway.calls(), h.config.withdrawal.gateway_max_attempts as usize);
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 10_000);

        let refunds = h
            .cashier
            .ledger
            .entries("p1")
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == EntryKind::WithdrawalRefund)
            .count();
        assert_eq!(refunds, 1);

        let err = h.cashier.withdrawals.process_withdrawal(&created.withdrawal_id).await.unwrap_err();
        assert!(matches!(err, CashierError::InvalidTransition { .. }));
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 10_000);
    }

    #[tokio::test]
    async fn test_timed_out_attempt_is_retried() {
        let gateway = ScriptedPayoutGateway::succeeding();
        gateway.push(crate::testing::ScriptedOutcome::Hang);
        let h = Harness::with_gateway(gateway.clone());
        h.player("p1", 10_000);

        let paid = h.cashier.withdrawals.create_withdrawal_request(request("p1", 1_500)).await.unwrap();
        assert_eq!(paid.status, WithdrawalStatus::Completed);
        assert_eq!(paid.processing_attempts, 1);
        assert_eq!(gateway.calls(), 2);
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 8_500);
    }

    #[tokio::test]
    async fn test_pending_ceiling() {
        let h = Harness::manual_review();
        h.player("p1", 100_000);
        for _ in 0..h.config.withdrawal.max_pending_requests {
            h.cashier.withdrawals.create_withdrawal_request(request("p1", 1_000)).await.unwrap();
        }
        let err = h.cashier.withdrawals.create_withdrawal_request(request("p1", 1_000)).await.unwrap_err();
        assert!(matches!(err, CashierError::LimitExceeded { window: LimitWindow::PendingCount, .. }));
    }

    #[tokio::test]
    async fn test_high_risk_goes_to_manual_review() {
        let h = Harness::new();
        h.player("p1", 100_000);

        // up to two earlier requests in the hour are not rapid
        for _ in 0..3 {
            let paid = h.cashier.withdrawals.create_withdrawal_request(request("p1", 1_000)).await.unwrap();
            assert_eq!(paid.status, WithdrawalStatus::Completed);
            assert_eq!(paid.risk_score, 0);
        }
        assert!(h.cashier.ledger.is_known_ip("p1", "10.0.0.1").unwrap());

        // fourth request inside the hour, from an unseen address
        let mut fourth = request("p1", 1_000);
        fourth.ip_address = Some("203.0.113.9".to_string());
        let held = h.cashier.withdrawals.create_withdrawal_request(fourth).await.unwrap();
        assert_eq!(held.risk_score, 50);
        assert_eq!(held.status, WithdrawalStatus::Pending);
        assert_eq!(held.approval_status, ApprovalStatus::Pending);
        assert_eq!(held.risk_factors, vec!["rapid_withdrawals".to_string(), "new_ip".to_string()]);

        let approved = h.cashier.withdrawals.approve_withdrawal(&held.withdrawal_id, "admin-7").await.unwrap();
        assert_eq!(approved.approval_status, ApprovalStatus::ManuallyApproved);
        assert_eq!(approved.reviewed_by.as_deref(), Some("admin-7"));

        let summary = h.cashier.withdrawals.process_pending_withdrawals().await.unwrap();
        assert_eq!((summary.attempted, summary.completed), (1, 1));
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 96_000);
    }

    #[tokio::test]
    async fn test_outside_window_defers_to_batch() {
        let mut config = crate::testing::test_config();
        config.withdrawal.processing_window = crate::config::ProcessingWindow {
            start: chrono::NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            end: chrono::NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
        };
        let gateway = ScriptedPayoutGateway::succeeding();
        let h = Harness::build(config, gateway.clone(), Arc::new(crate::settlement::AcceptAllSessions));
        h.player("p1", 10_000);

        let created = h.cashier.withdrawals.create_withdrawal_request(request("p1", 2_000)).await.unwrap();
        assert_eq!(created.status, WithdrawalStatus::Approved);
        assert_eq!(created.approval_status, ApprovalStatus::AutoApproved);
        assert_eq!(created.processing_attempts, 0);
        assert_eq!(gateway.calls(), 0);
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 8_000);

        h.clock.advance(Duration::hours(9));
        let summary = h.cashier.withdrawals.process_pending_withdrawals().await.unwrap();
        assert_eq!((summary.attempted, summary.completed, summary.failed), (1, 1, 0));
        assert_eq!(
            h.cashier.withdrawals.get_withdrawal(&created.withdrawal_id).unwrap().status,
            WithdrawalStatus::Completed
        );
        assert_eq!(gateway.calls(), 1);

        let summary = h.cashier.withdrawals.process_pending_withdrawals().await.unwrap();
        assert_eq!(summary.attempted, 0);
        assert_eq!(gateway.calls(), 1);
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 8_000);
    }

    #[tokio::test]
    async fn test_eligibility_checks() {
        let mut config = crate::testing::test_config();
        config.withdrawal.require_kyc = true;
        config.withdrawal.min_account_age_days = 3;
        config.withdrawal.min_lifetime_deposit = 5_000;
        let h = Harness::build(
            config,
            ScriptedPayoutGateway::succeeding(),
            Arc::new(crate::settlement::AcceptAllSessions),
        );
        h.player("p1", 4_000);
        h.cashier.ledger.set_kyc_verified("p1", false).unwrap();

        let rejected = |err: CashierError, needle: &str| match err {
            CashierError::Validation(msg) => assert!(msg.contains(needle), "unexpected message: {}", msg),
            other => panic!("expected validation error, got {}", other),
        };

        let err = h.cashier.withdrawals.create_withdrawal_request(request("p1", 1_000)).await.unwrap_err();
        rejected(err, "identity verification");
        h.cashier.ledger.set_kyc_verified("p1", true).unwrap();

        let err = h.cashier.withdrawals.create_withdrawal_request(request("p1", 1_000)).await.unwrap_err();
        rejected(err, "days old");
        h.clock.advance(Duration::days(3));

        let err = h.cashier.withdrawals.create_withdrawal_request(request("p1", 1_000)).await.unwrap_err();
        rejected(err, "lifetime deposits");
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 4_000);
        assert!(h.cashier.withdrawals.withdrawals_for_player("p1").unwrap().is_empty());

        h.cashier.ledger.deposit("p1", 1_000, "top-up").unwrap();
        let paid = h.cashier.withdrawals.create_withdrawal_request(request("p1", 1_000)).await.unwrap();
        assert_eq!(paid.status, WithdrawalStatus::Completed);
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 4_000);
    }

    #[tokio::test]
    async fn test_weekly_and_monthly_limits_roll() {
        let mut config = crate::testing::test_config();
        config.withdrawal.auto_processing_enabled = false;
        config.withdrawal.daily_limit = 10_000;
        config.withdrawal.weekly_limit = 15_000;
        config.withdrawal.monthly_limit = 20_000;
        let h = Harness::build(
            config,
            ScriptedPayoutGateway::succeeding(),
            Arc::new(crate::settlement::AcceptAllSessions),
        );
        h.player("p1", 100_000);

        h.cashier.withdrawals.create_withdrawal_request(request("p1", 9_000)).await.unwrap();
        h.clock.advance(Duration::days(2));
        let err = h.cashier.withdrawals.create_withdrawal_request(request("p1", 7_000)).await.unwrap_err();
        assert!(matches!(
            err,
            CashierError::LimitExceeded { window: LimitWindow::Weekly, used: 9_000, requested: 7_000, limit: 15_000 }
        ));
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 91_000);

        // the first request has left the weekly window but not the monthly one
        h.clock.advance(Duration::days(6));
        h.cashier.withdrawals.create_withdrawal_request(request("p1", 6_000)).await.unwrap();
        h.clock.advance(Duration::days(8));
        let err = h.cashier.withdrawals.create_withdrawal_request(request("p1", 6_000)).await.unwrap_err();
        assert!(matches!(
            err,
            CashierError::LimitExceeded { window: LimitWindow::Monthly, used: 15_000, requested: 6_000, limit: 20_000 }
        ));
        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 85_000);
    }

    #[test]
    fn test_concurrent_reject_and_cancel_refund_once() {
        let h = Harness::manual_review();
        h.player("p1", 10_000);
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let created = runtime
            .block_on(h.cashier.withdrawals.create_withdrawal_request(request("p1", 4_000)))
            .unwrap();
        let id = created.withdrawal_id.as_str();

        let (rejected, cancelled) = std::thread::scope(|scope| {
            let reject = scope.spawn(|| h.cashier.withdrawals.reject_withdrawal(id, "admin-1", "docs"));
            let cancel = scope.spawn(|| h.cashier.withdrawals.cancel_withdrawal(id, "p1"));
            (reject.join().unwrap(), cancel.join().unwrap())
        });
        assert_eq!(rejected.is_ok() as u8 + cancelled.is_ok() as u8, 1);
        for err in [rejected.err(), cancelled.err()].into_iter().flatten() {
            assert!(matches!(err, CashierError::InvalidTransition { .. }), "unexpected error: {}", err);
        }

        assert_eq!(h.cashier.ledger.balance("p1").unwrap(), 10_000);
        let refunds = h
            .cashier
            .ledger
            .entries("p1")
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == EntryKind::WithdrawalRefund)
            .count();
        assert_eq!(refunds, 1);
    }
}
