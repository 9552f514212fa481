//! Transactional storage layer using RocksDB
//!
//! Every logical operation runs inside one pessimistic RocksDB transaction.
//! `get_for_update_*` takes a row lock held until commit or rollback, which
//! serialises concurrent mutations of the same player's funds. Unique keys
//! written through [`StorageTxn::insert_unique_json`] are the race-closing
//! constraint behind every idempotency and eligibility check.

use crate::config::StorageConfig;
use crate::errors::StorageError;
use rocksdb::{
    Direction, IteratorMode, Options, Transaction, TransactionDB, TransactionDBOptions,
};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct Storage {
    db: Arc<TransactionDB>,
}

impl Storage {
    /// Open (or create) a database with default tuning
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::open_with_config(path, &StorageConfig::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: &StorageConfig,
    ) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
        opts.set_max_write_buffer_number(config.max_write_buffer_number);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let mut txn_opts = TransactionDBOptions::default();
        txn_opts.set_txn_lock_timeout(config.lock_timeout_ms);
        txn_opts.set_default_lock_timeout(config.lock_timeout_ms);

        let db = TransactionDB::open(&opts, &txn_opts, path)
            .map_err(|e| StorageError::DatabaseOpenFailed(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Start a new unit of work
    pub fn begin(&self) -> StorageTxn<'_> {
        StorageTxn {
            txn: self.db.transaction(),
        }
    }

    /// Read a committed row outside of any transaction
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let bytes = self.db.get(key.as_bytes())?;
        bytes.map(|b| decode(key, &b)).transpose()
    }

    /// Scan committed rows under a prefix, in key order
    pub fn scan_prefix_json<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, T)>, StorageError> {
        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8_lossy(&key).into_owned();
            let value = decode(&key, &value)?;
            rows.push((key, value));
        }
        Ok(rows)
    }
}

/// One pessimistic transaction. Dropping it without [`StorageTxn::commit`]
/// rolls back every write and releases every lock.
pub struct StorageTxn<'a> {
    txn: Transaction<'a, TransactionDB>,
}

impl<'a> StorageTxn<'a> {
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let bytes = self.txn.get(key.as_bytes())?;
        bytes.map(|b| decode(key, &b)).transpose()
    }

    /// Read and exclusively lock a row until the transaction ends
    pub fn get_for_update_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        let bytes = self.txn.get_for_update(key.as_bytes(), true)?;
        bytes.map(|b| decode(key, &b)).transpose()
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| StorageError::WriteFailed(format!("Failed to encode {}: {}", key, e)))?;
        self.txn.put(key.as_bytes(), bytes)?;
        Ok(())
    }

    /// Insert a row that must not already exist.
    ///
    /// The key is locked before the existence check, so two racing
    /// transactions cannot both succeed: the loser waits, then sees the
    /// winner's committed row and fails with `UniqueViolation`.
    pub fn insert_unique_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        if self.txn.get_for_update(key.as_bytes(), true)?.is_some() {
            return Err(StorageError::UniqueViolation(key.to_string()));
        }
        self.put_json(key, value)
    }

    /// Write an empty index entry
    pub fn put_marker(&self, key: &str) -> Result<(), StorageError> {
        self.txn.put(key.as_bytes(), Vec::<u8>::new())?;
        Ok(())
    }

    pub fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.txn.get(key.as_bytes())?.is_some())
    }

    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.txn.delete(key.as_bytes())?;
        Ok(())
    }

    /// Scan rows under a prefix (including this transaction's own writes)
    pub fn scan_prefix_json<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, T)>, StorageError> {
        let mut rows = Vec::new();
        for (key, value) in self.scan_raw(prefix)? {
            let value = decode(&key, &value)?;
            rows.push((key, value));
        }
        Ok(rows)
    }

    /// Keys under a prefix, with the prefix stripped
    pub fn scan_key_suffixes(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .scan_raw(prefix)?
            .into_iter()
            .map(|(key, _)| key[prefix.len()..].to_string())
            .collect())
    }

    fn scan_raw(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let mut rows = Vec::new();
        let iter = self
            .txn
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            rows.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
        }
        Ok(rows)
    }

    pub fn commit(self) -> Result<(), StorageError> {
        self.txn.commit()?;
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(bytes)
        .map_err(|e| StorageError::CorruptedData(format!("Failed to decode {}: {}", key, e)))
}

/// Key layout. Identifiers never contain ':' (see [`validate_id`]), so a
/// prefix ending in ':' never matches a longer identifier.
pub mod keys {
    pub fn account(player_id: &str) -> String {
        format!("account:{}", player_id)
    }

    pub fn known_ip(player_id: &str, ip: &str) -> String {
        format!("known_ip:{}:{}", player_id, ip)
    }

    pub fn ledger_entry(player_id: &str, seq: u64) -> String {
        format!("ledger:entry:{}:{:020}", player_id, seq)
    }

    pub fn ledger_entry_prefix(player_id: &str) -> String {
        format!("ledger:entry:{}:", player_id)
    }

    pub fn ledger_reference(reference: &str) -> String {
        format!("ledger:ref:{}", reference)
    }

    pub fn bonus_wallet(player_id: &str) -> String {
        format!("bonus:wallet:{}", player_id)
    }

    pub fn bonus_plan(plan_id: &str) -> String {
        format!("bonus:plan:{}", plan_id)
    }

    pub const BONUS_PLAN_PREFIX: &str = "bonus:plan:";

    pub fn bonus_code(code: &str) -> String {
        format!("bonus:code:{}", code.to_uppercase())
    }

    /// One slot per permitted grant of a plan to a player
    pub fn bonus_claim(plan_id: &str, player_id: &str, slot: u32) -> String {
        format!("bonus:claim:{}:{}:{:06}", plan_id, player_id, slot)
    }

    pub fn bonus_claim_prefix(plan_id: &str, player_id: &str) -> String {
        format!("bonus:claim:{}:{}:", plan_id, player_id)
    }

    pub fn bonus_deposit_ref(reference: &str) -> String {
        format!("bonus:deposit:{}", reference)
    }

    pub fn bonus_instance(instance_id: &str) -> String {
        format!("bonus:instance:{}", instance_id)
    }

    pub fn player_instance(player_id: &str, instance_id: &str) -> String {
        format!("bonus:player:{}:{}", player_id, instance_id)
    }

    pub fn player_instance_prefix(player_id: &str) -> String {
        format!("bonus:player:{}:", player_id)
    }

    /// Index of instances that can still change (active or wagering)
    pub fn live_instance(instance_id: &str) -> String {
        format!("bonus:live:{}", instance_id)
    }

    pub const LIVE_INSTANCE_PREFIX: &str = "bonus:live:";

    pub fn bonus_transaction(instance_id: &str, seq: u32) -> String {
        format!("bonus:txn:{}:{:06}", instance_id, seq)
    }

    pub fn bonus_transaction_prefix(instance_id: &str) -> String {
        format!("bonus:txn:{}:", instance_id)
    }

    pub fn wager_progress(instance_id: &str) -> String {
        format!("wager:progress:{}", instance_id)
    }

    pub fn game(game_code: &str) -> String {
        format!("contribution:game:{}", game_code)
    }

    pub fn category_contribution(category: &str) -> String {
        format!("contribution:category:{}", category)
    }

    pub fn bet(bet_id: &str) -> String {
        format!("bet:{}", bet_id)
    }

    pub fn provider_transaction(transaction_id: &str) -> String {
        format!("provider:txn:{}", transaction_id)
    }

    pub fn provider_refund(transaction_id: &str) -> String {
        format!("provider:refund:{}", transaction_id)
    }

    pub fn withdrawal(withdrawal_id: &str) -> String {
        format!("withdrawal:request:{}", withdrawal_id)
    }

    pub fn player_withdrawal(player_id: &str, withdrawal_id: &str) -> String {
        format!("withdrawal:player:{}:{}", player_id, withdrawal_id)
    }

    pub fn player_withdrawal_prefix(player_id: &str) -> String {
        format!("withdrawal:player:{}:", player_id)
    }

    pub fn withdrawal_status(status: &str, withdrawal_id: &str) -> String {
        format!("withdrawal:status:{}:{}", status, withdrawal_id)
    }

    pub fn withdrawal_status_prefix(status: &str) -> String {
        format!("withdrawal:status:{}:", status)
    }

    pub fn withdrawal_audit(withdrawal_id: &str, seq: u32) -> String {
        format!("withdrawal:audit:{}:{:06}", withdrawal_id, seq)
    }

    pub fn withdrawal_audit_prefix(withdrawal_id: &str) -> String {
        format!("withdrawal:audit:{}:", withdrawal_id)
    }

    /// Written once by the compensating refund of a withdrawal
    pub fn withdrawal_refund(withdrawal_id: &str) -> String {
        format!("withdrawal:refund:{}", withdrawal_id)
    }
}

/// Identifiers become key segments; reject anything that would break the layout
pub fn validate_id(kind: &str, id: &str) -> Result<(), crate::errors::CashierError> {
    if id.is_empty() || id.len() > 128 {
        return Err(crate::errors::CashierError::validation(format!(
            "{} must be 1-128 characters",
            kind
        )));
    }
    if id.contains(':') || id.chars().any(char::is_whitespace) {
        return Err(crate::errors::CashierError::validation(format!(
            "{} must not contain ':' or whitespace",
            kind
        )));
    }
    Ok(())
}
