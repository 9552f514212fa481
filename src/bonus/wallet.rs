//! Per-player bonus wallet
//!
//! One row per player. The crate-internal `*_in` functions run inside the
//! caller's transaction and lock the row first; the public methods wrap each
//! in its own transaction.

use super::types::BonusWalletBalance;
use crate::clock::Clock;
use crate::errors::{CashierError, CashierResult};
use crate::ledger::{self, EntryKind, LedgerEntry};
use crate::storage::{keys, Storage, StorageTxn};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

pub struct BonusWallet {
    storage: Storage,
    clock: Arc<dyn Clock>,
}

impl BonusWallet {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    pub fn add_bonus(&self, player_id: &str, amount: u64) -> CashierResult<BonusWalletBalance> {
        let txn = self.storage.begin();
        let wallet = credit_in(&txn, player_id, amount, false)?;
        txn.commit()?;
        Ok(wallet)
    }

    pub fn deduct_bonus(&self, player_id: &str, amount: u64) -> CashierResult<BonusWalletBalance> {
        let txn = self.storage.begin();
        let wallet = deduct_in(&txn, player_id, amount)?;
        txn.commit()?;
        Ok(wallet)
    }

    pub fn forfeit_bonus(&self, player_id: &str, amount: u64) -> CashierResult<BonusWalletBalance> {
        let txn = self.storage.begin();
        let wallet = forfeit_in(&txn, player_id, amount, false)?;
        txn.commit()?;
        Ok(wallet)
    }

    /// Move bonus funds into the main wallet in one transaction
    pub fn release_to_main_wallet(&self, player_id: &str, amount: u64) -> CashierResult<LedgerEntry> {
        let txn = self.storage.begin();
        let entry = release_in(&txn, player_id, amount, false, "bonus-release", self.clock.now())?;
        txn.commit()?;
        Ok(entry)
    }

    pub fn get_balance(&self, player_id: &str) -> CashierResult<BonusWalletBalance> {
        Ok(self
            .storage
            .get_json(&keys::bonus_wallet(player_id))?
            .unwrap_or_else(|| empty(player_id)))
    }
}

fn empty(player_id: &str) -> BonusWalletBalance {
    BonusWalletBalance {
        player_id: player_id.to_string(),
        ..Default::default()
    }
}

pub(crate) fn lock_in(txn: &StorageTxn<'_>, player_id: &str) -> CashierResult<BonusWalletBalance> {
    Ok(txn
        .get_for_update_json(&keys::bonus_wallet(player_id))?
        .unwrap_or_else(|| empty(player_id)))
}

fn save(txn: &StorageTxn<'_>, wallet: &BonusWalletBalance) -> CashierResult<()> {
    txn.put_json(&keys::bonus_wallet(&wallet.player_id), wallet)?;
    Ok(())
}

/// Add funds; `opens_instance` counts a newly granted instance
pub(crate) fn credit_in(
    txn: &StorageTxn<'_>,
    player_id: &str,
    amount: u64,
    opens_instance: bool,
) -> CashierResult<BonusWalletBalance> {
    let mut wallet = lock_in(txn, player_id)?;
    wallet.playable_bonus_balance += amount;
    if opens_instance {
        wallet.active_bonus_count += 1;
        wallet.total_granted += amount;
    }
    save(txn, &wallet)?;
    debug!(player_id, amount, balance = wallet.playable_bonus_balance, "Bonus wallet credited");
    Ok(wallet)
}

pub(crate) fn deduct_in(
    txn: &StorageTxn<'_>,
    player_id: &str,
    amount: u64,
) -> CashierResult<BonusWalletBalance> {
    let mut wallet = lock_in(txn, player_id)?;
    if wallet.playable_bonus_balance < amount {
        return Err(CashierError::InsufficientBonusBalance {
            requested: amount,
            available: wallet.playable_bonus_balance,
        });
    }
    wallet.playable_bonus_balance -= amount;
    save(txn, &wallet)?;
    Ok(wallet)
}

/// Remove funds for good; `closes_instance` retires one live instance
pub(crate) fn forfeit_in(
    txn: &StorageTxn<'_>,
    player_id: &str,
    amount: u64,
    closes_instance: bool,
) -> CashierResult<BonusWalletBalance> {
    let mut wallet = lock_in(txn, player_id)?;
    // The wallet never goes negative even if an instance overstates its balance
    let taken = amount.min(wallet.playable_bonus_balance);
    wallet.playable_bonus_balance -= taken;
    wallet.total_forfeited += taken;
    if closes_instance {
        wallet.active_bonus_count = wallet.active_bonus_count.saturating_sub(1);
    }
    save(txn, &wallet)?;
    Ok(wallet)
}

pub(crate) fn release_in(
    txn: &StorageTxn<'_>,
    player_id: &str,
    amount: u64,
    closes_instance: bool,
    reference: &str,
    now: DateTime<Utc>,
) -> CashierResult<LedgerEntry> {
    let mut account = ledger::lock_account(txn, player_id)?;
    let mut wallet = lock_in(txn, player_id)?;
    if wallet.playable_bonus_balance < amount {
        return Err(CashierError::InsufficientBonusBalance {
            requested: amount,
            available: wallet.playable_bonus_balance,
        });
    }
    wallet.playable_bonus_balance -= amount;
    wallet.total_released += amount;
    if closes_instance {
        wallet.active_bonus_count = wallet.active_bonus_count.saturating_sub(1);
    }
    save(txn, &wallet)?;

    ledger::credit(txn, &mut account, amount, EntryKind::BonusRelease, reference, now)
}
