//! Balance ledger: the single source of truth for main-wallet funds
//!
//! Every change to `main_balance` goes through [`credit`] or [`debit`] inside
//! a caller's transaction, after the account row has been locked with
//! [`lock_account`]. Each change appends a [`LedgerEntry`].

use crate::clock::Clock;
use crate::errors::{CashierError, CashierResult, StorageError};
use crate::storage::{keys, validate_id, Storage, StorageTxn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Suspended,
    Closed,
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountStatus::Active => write!(f, "active"),
            AccountStatus::Suspended => write!(f, "suspended"),
            AccountStatus::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerAccount {
    pub player_id: String,
    pub currency: String,
    pub status: AccountStatus,
    pub kyc_verified: bool,
    pub created_at: DateTime<Utc>,
    pub main_balance: u64,
    pub lifetime_deposits: u64,
    pub lifetime_withdrawals: u64,
    /// Sequence number of the last ledger entry
    pub entry_seq: u64,
}

impl PlayerAccount {
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Deposit,
    BetDebit,
    WinCredit,
    BonusRelease,
    WithdrawalDebit,
    WithdrawalRefund,
    ProviderRefund,
    Adjustment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub player_id: String,
    pub kind: EntryKind,
    pub delta: i64,
    pub balance_after: u64,
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

pub struct Ledger {
    storage: Storage,
    clock: Arc<dyn Clock>,
}

impl Ledger {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    pub fn open_account(&self, player_id: &str, currency: &str) -> CashierResult<PlayerAccount> {
        validate_id("player_id", player_id)?;
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(CashierError::validation("currency must be a 3-letter code"));
        }

        let account = PlayerAccount {
            player_id: player_id.to_string(),
            currency: currency.to_uppercase(),
            status: AccountStatus::Active,
            kyc_verified: false,
            created_at: self.clock.now(),
            main_balance: 0,
            lifetime_deposits: 0,
            lifetime_withdrawals: 0,
            entry_seq: 0,
        };

        let txn = self.storage.begin();
        txn.insert_unique_json(&keys::account(player_id), &account)
            .map_err(|e| match e {
                StorageError::UniqueViolation(_) => {
                    CashierError::DuplicateOperation(format!("account {} already exists", player_id))
                }
                other => other.into(),
            })?;
        txn.commit()?;

        info!(player_id, currency = %account.currency, "Opened player account");
        Ok(account)
    }

    /// Credit a confirmed deposit. The reference may be applied only once.
    pub fn deposit(&self, player_id: &str, amount: u64, reference: &str) -> CashierResult<LedgerEntry> {
        if amount == 0 {
            return Err(CashierError::validation("deposit amount must be positive"));
        }
        validate_id("deposit reference", reference)?;

        let txn = self.storage.begin();
        let entry = deposit_in(&txn, player_id, amount, reference, self.clock.now())?;
        txn.commit()?;

        info!(player_id, amount, reference, balance = entry.balance_after, "Deposit credited");
        Ok(entry)
    }

    pub fn account(&self, player_id: &str) -> CashierResult<PlayerAccount> {
        self.storage
            .get_json(&keys::account(player_id))?
            .ok_or_else(|| CashierError::not_found("account", player_id))
    }

    pub fn balance(&self, player_id: &str) -> CashierResult<u64> {
        Ok(self.account(player_id)?.main_balance)
    }

    /// Ledger entries in append order
    pub fn entries(&self, player_id: &str) -> CashierResult<Vec<LedgerEntry>> {
        let rows = self
            .storage
            .scan_prefix_json::<LedgerEntry>(&keys::ledger_entry_prefix(player_id))?;
        Ok(rows.into_iter().map(|(_, entry)| entry).collect())
    }

    pub fn set_status(&self, player_id: &str, status: AccountStatus) -> CashierResult<PlayerAccount> {
        let txn = self.storage.begin();
        let mut account = lock_account(&txn, player_id)?;
        if account.status == AccountStatus::Closed && status != AccountStatus::Closed {
            return Err(CashierError::InvalidTransition {
                entity: "account",
                from: account.status.to_string(),
                to: status.to_string(),
            });
        }
        account.status = status;
        txn.put_json(&keys::account(player_id), &account)?;
        txn.commit()?;

        info!(player_id, status = %status, "Account status changed");
        Ok(account)
    }

    pub fn set_kyc_verified(&self, player_id: &str, verified: bool) -> CashierResult<()> {
        let txn = self.storage.begin();
        let mut account = lock_account(&txn, player_id)?;
        account.kyc_verified = verified;
        txn.put_json(&keys::account(player_id), &account)?;
        txn.commit()?;
        Ok(())
    }

    /// Remember an address the player has successfully used before
    pub fn record_known_ip(&self, player_id: &str, ip: &str) -> CashierResult<()> {
        if ip.trim().is_empty() {
            return Err(CashierError::validation("ip must not be empty"));
        }
        let txn = self.storage.begin();
        lock_account(&txn, player_id)?;
        txn.put_marker(&keys::known_ip(player_id, ip))?;
        txn.commit()?;
        Ok(())
    }

    pub fn is_known_ip(&self, player_id: &str, ip: &str) -> CashierResult<bool> {
        let txn = self.storage.begin();
        Ok(txn.exists(&keys::known_ip(player_id, ip))?)
    }
}

pub(crate) fn deposit_in(
    txn: &StorageTxn<'_>,
    player_id: &str,
    amount: u64,
    reference: &str,
    now: DateTime<Utc>,
) -> CashierResult<LedgerEntry> {
    let mut account = lock_account(txn, player_id)?;
    if account.status != AccountStatus::Active {
        return Err(CashierError::validation(format!(
            "account {} is {}",
            player_id, account.status
        )));
    }

    txn.insert_unique_json(&keys::ledger_reference(reference), &player_id)
        .map_err(|e| match e {
            StorageError::UniqueViolation(_) => {
                CashierError::DuplicateOperation(format!("deposit {} already applied", reference))
            }
            other => other.into(),
        })?;

    account.lifetime_deposits += amount;
    credit(txn, &mut account, amount, EntryKind::Deposit, reference, now)
}

/// Load and row-lock an account for the rest of the transaction
pub(crate) fn lock_account(txn: &StorageTxn<'_>, player_id: &str) -> CashierResult<PlayerAccount> {
    txn.get_for_update_json(&keys::account(player_id))?
        .ok_or_else(|| CashierError::not_found("account", player_id))
}

pub(crate) fn credit(
    txn: &StorageTxn<'_>,
    account: &mut PlayerAccount,
    amount: u64,
    kind: EntryKind,
    reference: &str,
    now: DateTime<Utc>,
) -> CashierResult<LedgerEntry> {
    account.main_balance = account
        .main_balance
        .checked_add(amount)
        .ok_or_else(|| CashierError::validation("balance overflow"))?;
    if kind == EntryKind::WithdrawalRefund {
        account.lifetime_withdrawals = account.lifetime_withdrawals.saturating_sub(amount);
    }
    append(txn, account, amount as i64, kind, reference, now)
}

/// Fails with `InsufficientFunds` and writes nothing if the balance is short
pub(crate) fn debit(
    txn: &StorageTxn<'_>,
    account: &mut PlayerAccount,
    amount: u64,
    kind: EntryKind,
    reference: &str,
    now: DateTime<Utc>,
) -> CashierResult<LedgerEntry> {
    if account.main_balance < amount {
        return Err(CashierError::InsufficientFunds {
            requested: amount,
            available: account.main_balance,
        });
    }
    account.main_balance -= amount;
    if kind == EntryKind::WithdrawalDebit {
        account.lifetime_withdrawals += amount;
    }
    append(txn, account, -(amount as i64), kind, reference, now)
}

fn append(
    txn: &StorageTxn<'_>,
    account: &mut PlayerAccount,
    delta: i64,
    kind: EntryKind,
    reference: &str,
    now: DateTime<Utc>,
) -> CashierResult<LedgerEntry> {
    account.entry_seq += 1;
    let entry = LedgerEntry {
        seq: account.entry_seq,
        player_id: account.player_id.clone(),
        kind,
        delta,
        balance_after: account.main_balance,
        reference: reference.to_string(),
        created_at: now,
    };
    txn.put_json(&keys::ledger_entry(&account.player_id, entry.seq), &entry)?;
    txn.put_json(&keys::account(&account.player_id), account)?;
    Ok(entry)
}
