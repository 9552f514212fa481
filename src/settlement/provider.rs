//! Idempotent game-provider callback adapter
//!
//! Every provider event carries its own transaction id. The first event with
//! a given id is applied and its answer persisted next to a
//! [`ProviderTransaction`] row; any later event with the same id gets the
//! stored answer (or `duplicate` if its parameters differ) and moves no money.
//!
//! Callbacks never return errors: every outcome maps to a
//! [`TransactionStatus`].

use super::orchestrator::{
    credit_main_in, lock_bet_in, refund_bet_in, settle_bet_in, settle_win_in, BetSplit,
    SettlementOrchestrator,
};
use crate::bonus::BonusWalletBalance;
use crate::clock::Clock;
use crate::config::ProviderConfig;
use crate::errors::{CashierError, CashierResult, StorageError};
use crate::ledger::{self, EntryKind, PlayerAccount};
use crate::metrics::CashierMetrics;
use crate::storage::{keys, validate_id, Storage, StorageTxn};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Success,
    InsufficientFunds,
    Duplicate,
    SessionExpired,
    GeneralError,
}

impl TransactionStatus {
    pub fn from_error(error: &CashierError) -> Self {
        match error {
            CashierError::InsufficientFunds { .. }
            | CashierError::InsufficientBonusBalance { .. }
            | CashierError::BonusNotPlayable { .. } => TransactionStatus::InsufficientFunds,
            CashierError::DuplicateOperation(_) => TransactionStatus::Duplicate,
            _ => TransactionStatus::GeneralError,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Success => "success",
            TransactionStatus::InsufficientFunds => "insufficient_funds",
            TransactionStatus::Duplicate => "duplicate",
            TransactionStatus::SessionExpired => "session_expired",
            TransactionStatus::GeneralError => "general_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Main wallet balance
    pub balance: u64,
    pub bonus_balance: u64,
    pub transaction_status: TransactionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebitRequest {
    pub player_id: String,
    pub game_id: String,
    pub round_id: String,
    pub currency: String,
    pub transaction_id: String,
    pub bet_amount: u64,
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditRequest {
    pub player_id: String,
    pub game_id: String,
    pub round_id: String,
    pub currency: String,
    pub transaction_id: String,
    pub bet_transaction_id: String,
    pub win_amount: u64,
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetWinRequest {
    pub player_id: String,
    pub game_id: String,
    pub round_id: String,
    pub currency: String,
    pub transaction_id: String,
    pub bet_amount: u64,
    pub win_amount: u64,
    /// Round is free to the player: only the win moves
    pub in_game_bonus: bool,
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    pub player_id: String,
    pub transaction_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderTxnKind {
    Debit,
    Credit,
    BetWin,
}

impl ProviderTxnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderTxnKind::Debit => "debit",
            ProviderTxnKind::Credit => "credit",
            ProviderTxnKind::BetWin => "bet_win",
        }
    }
}

/// Idempotency anchor, one per provider transaction id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderTransaction {
    pub transaction_id: String,
    pub kind: ProviderTxnKind,
    pub player_id: String,
    pub game_id: String,
    pub round_id: String,
    pub bet_amount: u64,
    pub win_amount: u64,
    pub main_amount: u64,
    pub bonus_amount: u64,
    pub response: ProviderResponse,
    pub refunded: bool,
    pub created_at: DateTime<Utc>,
}

impl ProviderTransaction {
    fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            kind: self.kind,
            player_id: self.player_id.clone(),
            game_id: self.game_id.clone(),
            round_id: self.round_id.clone(),
            bet_amount: self.bet_amount,
            win_amount: self.win_amount,
        }
    }
}

/// The parameters a replay must repeat to count as identical
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    kind: ProviderTxnKind,
    player_id: String,
    game_id: String,
    round_id: String,
    bet_amount: u64,
    win_amount: u64,
}

/// Authentication lives outside the cashier; this is its answer
#[async_trait]
pub trait SessionVerifier: Send + Sync {
    async fn verify(&self, player_id: &str, session_token: Option<&str>) -> bool;
}

/// Trusts every session; for deployments where the gateway in front authenticates
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllSessions;

#[async_trait]
impl SessionVerifier for AcceptAllSessions {
    async fn verify(&self, _player_id: &str, _session_token: Option<&str>) -> bool {
        true
    }
}

#[derive(Clone, Debug)]
struct CachedResponse {
    fingerprint: Fingerprint,
    response: ProviderResponse,
    created_at: Instant,
}

pub struct ProviderAdapter {
    storage: Storage,
    clock: Arc<dyn Clock>,
    orchestrator: Arc<SettlementOrchestrator>,
    sessions: Arc<dyn SessionVerifier>,
    metrics: Arc<CashierMetrics>,
    /// Advisory only; the persisted rows decide
    replay_cache: RwLock<LruCache<String, CachedResponse>>,
    replay_ttl: Duration,
}

impl ProviderAdapter {
    pub fn new(
        storage: Storage,
        clock: Arc<dyn Clock>,
        orchestrator: Arc<SettlementOrchestrator>,
        sessions: Arc<dyn SessionVerifier>,
        metrics: Arc<CashierMetrics>,
        config: &ProviderConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.replay_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            storage,
            clock,
            orchestrator,
            sessions,
            metrics,
            replay_cache: RwLock::new(LruCache::new(capacity)),
            replay_ttl: Duration::from_secs(config.replay_cache_ttl_secs),
        }
    }

    pub async fn debit(&self, request: DebitRequest) -> ProviderResponse {
        let fingerprint = Fingerprint {
            kind: ProviderTxnKind::Debit,
            player_id: request.player_id.clone(),
            game_id: request.game_id.clone(),
            round_id: request.round_id.clone(),
            bet_amount: request.bet_amount,
            win_amount: 0,
        };
        let session = request.session_token.as_deref();
        self.handle(&request.transaction_id, &request.player_id, session, fingerprint, |txn, now| {
            check_currency(txn, &request.player_id, &request.currency)?;
            let split = settle_bet_in(
                txn,
                &request.player_id,
                request.bet_amount,
                &request.game_id,
                &request.transaction_id,
                now,
            )?;
            Ok(Some(split))
        })
        .await
    }

    pub async fn credit(&self, request: CreditRequest) -> ProviderResponse {
        let fingerprint = Fingerprint {
            kind: ProviderTxnKind::Credit,
            player_id: request.player_id.clone(),
            game_id: request.game_id.clone(),
            round_id: request.round_id.clone(),
            bet_amount: 0,
            win_amount: request.win_amount,
        };
        let session = request.session_token.as_deref();
        self.handle(&request.transaction_id, &request.player_id, session, fingerprint, |txn, now| {
            check_currency(txn, &request.player_id, &request.currency)?;
            credit_win_in(
                txn,
                &request.player_id,
                &request.bet_transaction_id,
                request.win_amount,
                &request.transaction_id,
                now,
            )?;
            Ok(None)
        })
        .await
    }

    pub async fn bet_win(&self, request: BetWinRequest) -> ProviderResponse {
        let fingerprint = Fingerprint {
            kind: ProviderTxnKind::BetWin,
            player_id: request.player_id.clone(),
            game_id: request.game_id.clone(),
            round_id: request.round_id.clone(),
            bet_amount: if request.in_game_bonus { 0 } else { request.bet_amount },
            win_amount: request.win_amount,
        };
        let session = request.session_token.as_deref();
        self.handle(&request.transaction_id, &request.player_id, session, fingerprint, |txn, now| {
            check_currency(txn, &request.player_id, &request.currency)?;
            if request.in_game_bonus {
                credit_main_in(
                    txn,
                    &request.player_id,
                    request.win_amount,
                    EntryKind::WinCredit,
                    &request.transaction_id,
                    now,
                )?;
                return Ok(None);
            }
            let split = settle_bet_in(
                txn,
                &request.player_id,
                request.bet_amount,
                &request.game_id,
                &request.transaction_id,
                now,
            )?;
            credit_win_in(
                txn,
                &request.player_id,
                &request.transaction_id,
                request.win_amount,
                &request.transaction_id,
                now,
            )?;
            Ok(Some(split))
        })
        .await
    }

    /// Reverse a debit exactly once. Unknown transactions are answered with
    /// success and the current balance.
    pub async fn refund(&self, request: RefundRequest) -> ProviderResponse {
        let response = match self.apply_refund(&request) {
            Ok(response) => response,
            Err(e) => {
                warn!(player_id = %request.player_id, transaction_id = %request.transaction_id, error = %e, "Provider refund failed");
                self.reply(&request.player_id, TransactionStatus::from_error(&e))
            }
        };
        self.metrics.record_callback("refund", response.transaction_status.as_str());
        response
    }

    fn apply_refund(&self, request: &RefundRequest) -> CashierResult<ProviderResponse> {
        validate_id("transaction_id", &request.transaction_id)?;
        let now = self.clock.now();
        let txn = self.storage.begin();
        let key = keys::provider_transaction(&request.transaction_id);

        let mut original = match txn.get_for_update_json::<ProviderTransaction>(&key)? {
            Some(original) if original.player_id == request.player_id => original,
            _ => {
                debug!(transaction_id = %request.transaction_id, "Refund for unknown transaction");
                return respond_in(&txn, &request.player_id, TransactionStatus::Success);
            }
        };
        if original.kind != ProviderTxnKind::Debit {
            debug!(transaction_id = %request.transaction_id, kind = original.kind.as_str(), "Refund for settled transaction");
            return respond_in(&txn, &request.player_id, TransactionStatus::Duplicate);
        }
        ledger::lock_account(&txn, &request.player_id)?;

        match txn.insert_unique_json(&keys::provider_refund(&request.transaction_id), &now) {
            Ok(()) => {}
            Err(StorageError::UniqueViolation(_)) => {
                return respond_in(&txn, &request.player_id, TransactionStatus::Success);
            }
            Err(e) => return Err(e.into()),
        }

        let mut bet = lock_bet_in(&txn, &request.transaction_id)?;
        let refunded = refund_bet_in(&txn, &mut bet, &request.transaction_id, now)?;
        original.refunded = true;
        txn.put_json(&key, &original)?;
        let response = respond_in(&txn, &request.player_id, TransactionStatus::Success)?;
        txn.commit()?;

        info!(player_id = %request.player_id, transaction_id = %request.transaction_id, refunded, "Provider debit refunded");
        Ok(response)
    }

    async fn handle<F>(
        &self,
        transaction_id: &str,
        player_id: &str,
        session_token: Option<&str>,
        fingerprint: Fingerprint,
        apply: F,
    ) -> ProviderResponse
    where
        F: FnOnce(&StorageTxn<'_>, DateTime<Utc>) -> CashierResult<Option<BetSplit>>,
    {
        let kind = fingerprint.kind.as_str();

        if let Some(response) = self.cached(transaction_id, &fingerprint).await {
            self.metrics.record_callback(kind, response.transaction_status.as_str());
            return response;
        }

        if !self.sessions.verify(player_id, session_token).await {
            let response = self.reply(player_id, TransactionStatus::SessionExpired);
            self.metrics.record_callback(kind, response.transaction_status.as_str());
            return response;
        }

        let response = match self.apply(transaction_id, player_id, &fingerprint, apply) {
            Ok((response, split)) => {
                if let Some(split) = split {
                    self.metrics.record_bet(split.main_amount, split.bonus_amount);
                    self.apply_wagering_side_channel(&split);
                }
                self.remember(transaction_id, fingerprint, response.clone()).await;
                response
            }
            Err(e) => {
                let status = TransactionStatus::from_error(&e);
                if status == TransactionStatus::GeneralError {
                    warn!(player_id, transaction_id, kind, error = %e, "Provider callback failed");
                } else {
                    debug!(player_id, transaction_id, kind, status = status.as_str(), "Provider callback declined");
                }
                self.reply(player_id, status)
            }
        };

        self.metrics.record_callback(kind, response.transaction_status.as_str());
        response
    }

    /// One transaction: replay check, balance effect, marker row
    fn apply<F>(
        &self,
        transaction_id: &str,
        player_id: &str,
        fingerprint: &Fingerprint,
        apply: F,
    ) -> CashierResult<(ProviderResponse, Option<BetSplit>)>
    where
        F: FnOnce(&StorageTxn<'_>, DateTime<Utc>) -> CashierResult<Option<BetSplit>>,
    {
        validate_id("transaction_id", transaction_id)?;
        let now = self.clock.now();
        let txn = self.storage.begin();
        let key = keys::provider_transaction(transaction_id);

        if let Some(existing) = txn.get_for_update_json::<ProviderTransaction>(&key)? {
            if existing.fingerprint() == *fingerprint {
                return Ok((existing.response, None));
            }
            debug!(transaction_id, "Provider transaction id reused with different parameters");
            return Ok((respond_in(&txn, player_id, TransactionStatus::Duplicate)?, None));
        }

        let split = apply(&txn, now)?;
        let response = respond_in(&txn, player_id, TransactionStatus::Success)?;
        let record = ProviderTransaction {
            transaction_id: transaction_id.to_string(),
            kind: fingerprint.kind,
            player_id: player_id.to_string(),
            game_id: fingerprint.game_id.clone(),
            round_id: fingerprint.round_id.clone(),
            bet_amount: fingerprint.bet_amount,
            win_amount: fingerprint.win_amount,
            main_amount: split.as_ref().map_or(0, |s| s.main_amount),
            bonus_amount: split.as_ref().map_or(0, |s| s.bonus_amount),
            response: response.clone(),
            refunded: false,
            created_at: now,
        };
        txn.put_json(&key, &record)?;
        txn.commit()?;

        debug!(player_id, transaction_id, kind = fingerprint.kind.as_str(), balance = response.balance, "Provider transaction applied");
        Ok((response, split))
    }

    /// Runs after the balance change committed; failures never reach the provider
    fn apply_wagering_side_channel(&self, split: &BetSplit) {
        if let Err(e) = self.orchestrator.apply_bet_wagering(split) {
            self.metrics.record_side_channel_failure("wagering");
            warn!(
                player_id = %split.player_id,
                bet_id = %split.bet_id,
                error = %e,
                "Wagering update failed after provider debit"
            );
        }
    }

    async fn cached(&self, transaction_id: &str, fingerprint: &Fingerprint) -> Option<ProviderResponse> {
        let cache = self.replay_cache.read().await;
        cache
            .peek(transaction_id)
            .filter(|cached| cached.created_at.elapsed() <= self.replay_ttl)
            .filter(|cached| cached.fingerprint == *fingerprint)
            .map(|cached| cached.response.clone())
    }

    async fn remember(&self, transaction_id: &str, fingerprint: Fingerprint, response: ProviderResponse) {
        let mut cache = self.replay_cache.write().await;
        cache.put(
            transaction_id.to_string(),
            CachedResponse {
                fingerprint,
                response,
                created_at: Instant::now(),
            },
        );
    }

    /// Answer carrying the committed balances
    fn reply(&self, player_id: &str, status: TransactionStatus) -> ProviderResponse {
        let txn = self.storage.begin();
        respond_in(&txn, player_id, status).unwrap_or(ProviderResponse {
            balance: 0,
            bonus_balance: 0,
            transaction_status: status,
        })
    }
}

fn check_currency(txn: &StorageTxn<'_>, player_id: &str, currency: &str) -> CashierResult<()> {
    let account = ledger::lock_account(txn, player_id)?;
    if !account.currency.eq_ignore_ascii_case(currency) {
        return Err(CashierError::validation(format!(
            "currency {} does not match account currency {}",
            currency, account.currency
        )));
    }
    Ok(())
}

/// Route a win through its bet when known; otherwise straight to main
fn credit_win_in(
    txn: &StorageTxn<'_>,
    player_id: &str,
    bet_id: &str,
    win_amount: u64,
    reference: &str,
    now: DateTime<Utc>,
) -> CashierResult<()> {
    match txn.get_for_update_json::<super::BetRecord>(&keys::bet(bet_id))? {
        Some(mut bet) if bet.player_id == player_id => {
            settle_win_in(txn, &mut bet, win_amount, reference, now)?;
        }
        _ => credit_main_in(txn, player_id, win_amount, EntryKind::WinCredit, reference, now)?,
    }
    Ok(())
}

fn respond_in(txn: &StorageTxn<'_>, player_id: &str, status: TransactionStatus) -> CashierResult<ProviderResponse> {
    let balance = txn
        .get_json::<PlayerAccount>(&keys::account(player_id))?
        .map_or(0, |a| a.main_balance);
    let bonus_balance = txn
        .get_json::<BonusWalletBalance>(&keys::bonus_wallet(player_id))?
        .map_or(0, |w| w.playable_bonus_balance);
    Ok(ProviderResponse {
        balance,
        bonus_balance,
        transaction_status: status,
    })
}
