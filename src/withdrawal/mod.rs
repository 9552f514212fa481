//! Withdrawal requests: eligibility, limits, risk, approval and payout

pub mod gateway;
pub mod pipeline;
pub mod risk;
pub mod types;

pub use gateway::{
    convert_amount, CurrencyConverter, FixedRateConverter, GatewayError, PayoutGateway,
    PayoutInstruction, PayoutReceipt, SimulatedPayoutGateway,
};
pub use pipeline::WithdrawalPipeline;
pub use risk::{RiskAssessment, RiskScorer, RiskSignals};
pub use types::*;
