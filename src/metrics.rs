//! Prometheus counters for money movements and callbacks

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Counters registered on a private registry so several instances (tests,
/// embedded use) never collide on the default one.
#[derive(Clone)]
pub struct CashierMetrics {
    registry: Registry,
    bonus_grants: IntCounterVec,
    bets_settled: IntCounterVec,
    withdrawals: IntCounterVec,
    provider_callbacks: IntCounterVec,
    side_channel_failures: IntCounterVec,
}

impl CashierMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("cashier".to_string()), None)?;

        let bonus_grants = IntCounterVec::new(
            Opts::new("bonus_grants_total", "Bonus instances granted"),
            &["trigger"],
        )?;
        let bets_settled = IntCounterVec::new(
            Opts::new("bets_settled_total", "Bets settled by funding source"),
            &["funding"],
        )?;
        let withdrawals = IntCounterVec::new(
            Opts::new("withdrawals_total", "Withdrawal requests by resulting status"),
            &["status"],
        )?;
        let provider_callbacks = IntCounterVec::new(
            Opts::new("provider_callbacks_total", "Provider callbacks by kind and answer"),
            &["kind", "status"],
        )?;
        let side_channel_failures = IntCounterVec::new(
            Opts::new("side_channel_failures_total", "Best-effort steps that failed after commit"),
            &["channel"],
        )?;

        registry.register(Box::new(bonus_grants.clone()))?;
        registry.register(Box::new(bets_settled.clone()))?;
        registry.register(Box::new(withdrawals.clone()))?;
        registry.register(Box::new(provider_callbacks.clone()))?;
        registry.register(Box::new(side_channel_failures.clone()))?;

        Ok(Self {
            registry,
            bonus_grants,
            bets_settled,
            withdrawals,
            provider_callbacks,
            side_channel_failures,
        })
    }

    pub fn record_grant(&self, trigger: &str) {
        self.bonus_grants.with_label_values(&[trigger]).inc();
    }

    pub fn record_bet(&self, main_amount: u64, bonus_amount: u64) {
        let funding = match (main_amount > 0, bonus_amount > 0) {
            (true, true) => "mixed",
            (false, true) => "bonus",
            _ => "main",
        };
        self.bets_settled.with_label_values(&[funding]).inc();
    }

    pub fn record_withdrawal(&self, status: &str) {
        self.withdrawals.with_label_values(&[status]).inc();
    }

    pub fn record_callback(&self, kind: &str, status: &str) {
        self.provider_callbacks.with_label_values(&[kind, status]).inc();
    }

    pub fn record_side_channel_failure(&self, channel: &str) {
        self.side_channel_failures.with_label_values(&[channel]).inc();
    }

    pub fn withdrawal_count(&self, status: &str) -> u64 {
        self.withdrawals.with_label_values(&[status]).get()
    }

    pub fn side_channel_failure_count(&self, channel: &str) -> u64 {
        self.side_channel_failures.with_label_values(&[channel]).get()
    }

    /// Prometheus text exposition format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
