//! Service container wiring every component onto one storage handle
//!
//! Components share the [`Storage`], [`Clock`] and [`CashierMetrics`] handles.
//! External collaborators (payout gateway, currency converter, session
//! verifier) are injected through [`CashierBuilder`] so tests and the worker
//! can swap them.

use crate::bonus::{
    BonusInstance, BonusLifecycle, BonusPlans, BonusWallet, GameContributionResolver,
    WageringTracker,
};
use crate::clock::{Clock, SystemClock};
use crate::config::CashierConfig;
use crate::errors::{CashierError, CashierResult};
use crate::ledger::{Ledger, LedgerEntry};
use crate::metrics::CashierMetrics;
use crate::settlement::{AcceptAllSessions, ProviderAdapter, SessionVerifier, SettlementOrchestrator};
use crate::storage::Storage;
use crate::withdrawal::{
    CurrencyConverter, FixedRateConverter, PayoutGateway, SimulatedPayoutGateway, WithdrawalPipeline,
};
use std::sync::Arc;
use tracing::{info, warn};

/// All cashier services
pub struct Cashier {
    pub config: CashierConfig,
    pub storage: Storage,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<CashierMetrics>,
    pub ledger: Arc<Ledger>,
    pub plans: Arc<BonusPlans>,
    pub contributions: Arc<GameContributionResolver>,
    pub wallet: Arc<BonusWallet>,
    pub lifecycle: Arc<BonusLifecycle>,
    pub wagering: Arc<WageringTracker>,
    pub settlement: Arc<SettlementOrchestrator>,
    pub provider: Arc<ProviderAdapter>,
    pub withdrawals: Arc<WithdrawalPipeline>,
}

impl Cashier {
    /// Credit a deposit and grant the best matching deposit bonus.
    ///
    /// The deposit always stands; a failed grant is logged and reported as
    /// no bonus.
    pub fn deposit(
        &self,
        player_id: &str,
        amount: u64,
        reference: &str,
        payment_method: Option<&str>,
    ) -> CashierResult<(LedgerEntry, Option<BonusInstance>)> {
        let entry = self.ledger.deposit(player_id, amount, reference)?;
        let bonus = match self
            .lifecycle
            .grant_deposit_bonus(player_id, amount, reference, payment_method)
        {
            Ok(bonus) => bonus,
            Err(e) => {
                warn!(player_id, reference, error = %e, "Deposit bonus grant failed");
                None
            }
        };
        Ok((entry, bonus))
    }
}

/// Builder for [`Cashier`]
pub struct CashierBuilder {
    config: CashierConfig,
    clock: Option<Arc<dyn Clock>>,
    gateway: Option<Arc<dyn PayoutGateway>>,
    converter: Option<Arc<dyn CurrencyConverter>>,
    sessions: Option<Arc<dyn SessionVerifier>>,
}

impl CashierBuilder {
    pub fn new(config: CashierConfig) -> Self {
        Self {
            config,
            clock: None,
            gateway: None,
            converter: None,
            sessions: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn PayoutGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn CurrencyConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn SessionVerifier>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Validate the configuration and wire every service onto `storage`
    pub fn build(self, storage: Storage) -> CashierResult<Cashier> {
        let config = self.config;
        config.validate()?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let metrics = Arc::new(
            CashierMetrics::new()
                .map_err(|e| CashierError::Configuration(format!("metrics registry: {}", e)))?,
        );
        let gateway: Arc<dyn PayoutGateway> = self
            .gateway
            .unwrap_or_else(|| Arc::new(SimulatedPayoutGateway::default()));
        let converter: Arc<dyn CurrencyConverter> = self.converter.unwrap_or_else(|| {
            Arc::new(FixedRateConverter::new(
                config.withdrawal.payout_currency.clone(),
                config.withdrawal.conversion_rates.clone(),
            ))
        });
        let sessions: Arc<dyn SessionVerifier> = self.sessions.unwrap_or_else(|| Arc::new(AcceptAllSessions));

        let settlement = Arc::new(SettlementOrchestrator::new(
            storage.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let provider = Arc::new(ProviderAdapter::new(
            storage.clone(),
            clock.clone(),
            settlement.clone(),
            sessions,
            metrics.clone(),
            &config.provider,
        ));
        let withdrawals = Arc::new(WithdrawalPipeline::new(
            storage.clone(),
            clock.clone(),
            config.withdrawal.clone(),
            config.risk.clone(),
            gateway,
            converter,
            metrics.clone(),
        ));

        info!(
            auto_processing = config.withdrawal.auto_processing_enabled,
            payout_currency = %config.withdrawal.payout_currency,
            "Cashier services ready"
        );

        Ok(Cashier {
            ledger: Arc::new(Ledger::new(storage.clone(), clock.clone())),
            plans: Arc::new(BonusPlans::new(storage.clone(), clock.clone())),
            contributions: Arc::new(GameContributionResolver::new(storage.clone())),
            wallet: Arc::new(BonusWallet::new(storage.clone(), clock.clone())),
            lifecycle: Arc::new(BonusLifecycle::new(
                storage.clone(),
                clock.clone(),
                config.bonus.clone(),
                metrics.clone(),
            )),
            wagering: Arc::new(WageringTracker::new(storage.clone(), clock.clone())),
            settlement,
            provider,
            withdrawals,
            config,
            storage,
            clock,
            metrics,
        })
    }
}
