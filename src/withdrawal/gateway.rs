//! External payout rail and currency conversion adapters

use super::types::PayoutTarget;
use crate::errors::{CashierError, CashierResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// What the gateway is asked to pay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutInstruction {
    pub withdrawal_id: String,
    pub player_id: String,
    pub amount: u64,
    pub currency: String,
    pub target: PayoutTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutReceipt {
    pub reference: String,
    pub amount: u64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Definitive refusal; retrying will not help
    #[error("Payout rejected: {0}")]
    Rejected(String),

    #[error("Gateway unavailable: {0}")]
    Unavailable(String),

    #[error("Gateway timed out after {0:?}")]
    Timeout(Duration),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, GatewayError::Rejected(_))
    }
}

/// Payout rail. The wire protocol is the implementor's business.
#[async_trait]
pub trait PayoutGateway: Send + Sync {
    async fn send_payout(&self, instruction: &PayoutInstruction) -> Result<PayoutReceipt, GatewayError>;
}

/// Gateway that pays everything after a short delay
#[derive(Debug, Clone)]
pub struct SimulatedPayoutGateway {
    delay: Duration,
}

impl SimulatedPayoutGateway {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for SimulatedPayoutGateway {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

#[async_trait]
impl PayoutGateway for SimulatedPayoutGateway {
    async fn send_payout(&self, instruction: &PayoutInstruction) -> Result<PayoutReceipt, GatewayError> {
        // Simulate network round trip
        tokio::time::sleep(self.delay).await;
        let reference = format!("sim_{}", Uuid::new_v4().simple());
        debug!(withdrawal_id = %instruction.withdrawal_id, reference = %reference, "Simulated payout sent");
        Ok(PayoutReceipt {
            reference,
            amount: instruction.amount,
        })
    }
}

#[async_trait]
pub trait CurrencyConverter: Send + Sync {
    /// Units of `to` per unit of `from`
    async fn rate(&self, from: &str, to: &str) -> CashierResult<f64>;
}

/// Rates from configuration, all quoted into one payout currency
#[derive(Debug, Clone)]
pub struct FixedRateConverter {
    payout_currency: String,
    rates: HashMap<String, f64>,
}

impl FixedRateConverter {
    pub fn new(payout_currency: impl Into<String>, rates: HashMap<String, f64>) -> Self {
        Self {
            payout_currency: payout_currency.into().to_uppercase(),
            rates: rates
                .into_iter()
                .map(|(currency, rate)| (currency.to_uppercase(), rate))
                .collect(),
        }
    }
}

#[async_trait]
impl CurrencyConverter for FixedRateConverter {
    async fn rate(&self, from: &str, to: &str) -> CashierResult<f64> {
        if from.eq_ignore_ascii_case(to) {
            return Ok(1.0);
        }
        if !to.eq_ignore_ascii_case(&self.payout_currency) {
            return Err(CashierError::Configuration(format!(
                "no conversion into {} (payouts are in {})",
                to, self.payout_currency
            )));
        }
        self.rates
            .get(&from.to_uppercase())
            .copied()
            .ok_or_else(|| CashierError::Configuration(format!("no conversion rate for {}", from)))
    }
}

/// Minor units after conversion, rounded to nearest
pub fn convert_amount(amount: u64, rate: f64) -> u64 {
    (amount as f64 * rate).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_rates() {
        let mut rates = HashMap::new();
        rates.insert("eur".to_string(), 1.08);
        let converter = FixedRateConverter::new("USDT", rates);

        assert_eq!(converter.rate("EUR", "usdt").await.unwrap(), 1.08);
        assert_eq!(converter.rate("USDT", "USDT").await.unwrap(), 1.0);
        assert!(converter.rate("GBP", "USDT").await.is_err());
        assert!(converter.rate("EUR", "BTC").await.is_err());
        assert_eq!(convert_amount(10_000, 1.08), 10_800);
    }

    #[tokio::test]
    async fn test_simulated_gateway_pays_full_amount() {
        let gateway = SimulatedPayoutGateway::new(Duration::from_millis(1));
        let receipt = gateway
            .send_payout(&PayoutInstruction {
                withdrawal_id: "w1".to_string(),
                player_id: "p1".to_string(),
                amount: 4_200,
                currency: "USDT".to_string(),
                target: PayoutTarget {
                    network: "tron".to_string(),
                    address: "TXYZ".to_string(),
                    memo: None,
                },
            })
            .await
            .unwrap();
        assert_eq!(receipt.amount, 4_200);
        assert!(receipt.reference.starts_with("sim_"));
        assert!(GatewayError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!GatewayError::Rejected("blocked".to_string()).is_retryable());
    }
}
