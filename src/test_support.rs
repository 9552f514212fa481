//! Shared fixture for unit tests

use crate::clock::ManualClock;
use crate::config::CashierConfig;
use crate::services::{Cashier, CashierBuilder};
use crate::settlement::{AcceptAllSessions, SessionVerifier};
use crate::storage::Storage;
use crate::testing::test_config;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use tempfile::TempDir;

pub use crate::testing::{RejectAllSessions, ScriptedPayoutGateway};

pub struct Harness {
    _dir: TempDir,
    pub cashier: Cashier,
    pub clock: ManualClock,
    pub gateway: Arc<ScriptedPayoutGateway>,
    pub config: CashierConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(test_config(), ScriptedPayoutGateway::succeeding(), Arc::new(AcceptAllSessions))
    }

    /// Withdrawals wait for an admin
    pub fn manual_review() -> Self {
        let mut config = test_config();
        config.withdrawal.auto_processing_enabled = false;
        Self::build(config, ScriptedPayoutGateway::succeeding(), Arc::new(AcceptAllSessions))
    }

    pub fn with_gateway(gateway: Arc<ScriptedPayoutGateway>) -> Self {
        Self::build(test_config(), gateway, Arc::new(AcceptAllSessions))
    }

    pub fn with_sessions(sessions: Arc<dyn SessionVerifier>) -> Self {
        Self::build(test_config(), ScriptedPayoutGateway::succeeding(), sessions)
    }

    pub fn build(
        config: CashierConfig,
        gateway: Arc<ScriptedPayoutGateway>,
        sessions: Arc<dyn SessionVerifier>,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let cashier = CashierBuilder::new(config.clone())
            .with_clock(Arc::new(clock.clone()))
            .with_gateway(gateway.clone())
            .with_sessions(sessions)
            .build(storage)
            .unwrap();
        Self {
            _dir: dir,
            cashier,
            clock,
            gateway,
            config,
        }
    }

    /// Open a verified EUR account holding `balance`
    pub fn player(&self, player_id: &str, balance: u64) {
        self.cashier.ledger.open_account(player_id, "EUR").unwrap();
        if balance > 0 {
            self.cashier
                .ledger
                .deposit(player_id, balance, &format!("seed-{}", player_id))
                .unwrap();
        }
        self.cashier.ledger.set_kyc_verified(player_id, true).unwrap();
    }
}
