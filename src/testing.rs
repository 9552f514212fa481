//! Scriptable doubles for the external collaborators, for use in tests

use crate::config::CashierConfig;
use crate::settlement::SessionVerifier;
use crate::withdrawal::{GatewayError, PayoutGateway, PayoutInstruction, PayoutReceipt};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the scripted gateway does on one call
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Pay,
    Fail(GatewayError),
    /// Never answers within any sane timeout
    Hang,
}

/// Gateway that replays queued outcomes and pays once the queue is empty
#[derive(Debug, Default)]
pub struct ScriptedPayoutGateway {
    script: Mutex<VecDeque<ScriptedOutcome>>,
    calls: AtomicUsize,
}

impl ScriptedPayoutGateway {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fails the next `times` calls as unavailable
    pub fn failing(times: usize) -> Arc<Self> {
        let gateway = Self::default();
        for _ in 0..times {
            gateway.push(ScriptedOutcome::Fail(GatewayError::Unavailable(
                "scripted outage".to_string(),
            )));
        }
        Arc::new(gateway)
    }

    pub fn push(&self, outcome: ScriptedOutcome) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(outcome);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PayoutGateway for ScriptedPayoutGateway {
    async fn send_payout(&self, instruction: &PayoutInstruction) -> Result<PayoutReceipt, GatewayError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = self
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or(ScriptedOutcome::Pay);

        match outcome {
            ScriptedOutcome::Pay => Ok(PayoutReceipt {
                reference: format!("scripted-{}-{}", instruction.withdrawal_id, call),
                amount: instruction.amount,
            }),
            ScriptedOutcome::Fail(error) => Err(error),
            ScriptedOutcome::Hang => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Err(GatewayError::Unavailable("hung call returned".to_string()))
            }
        }
    }
}

/// Session verifier that refuses every token
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAllSessions;

#[async_trait]
impl SessionVerifier for RejectAllSessions {
    async fn verify(&self, _player_id: &str, _session_token: Option<&str>) -> bool {
        false
    }
}

/// Development configuration with EUR payable at par into the payout currency
pub fn test_config() -> CashierConfig {
    let mut config = CashierConfig::development();
    config.withdrawal.conversion_rates.insert("EUR".to_string(), 1.0);
    config.withdrawal.gateway_timeout_ms = 200;
    config
}
