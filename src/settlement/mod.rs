//! Bet/win settlement and the provider callback adapter

pub mod orchestrator;
pub mod provider;

pub use orchestrator::{
    BetRecord, BetSplit, CombinedBalance, SettlementOrchestrator, WinDestination, WinRouting,
};
pub use provider::{
    AcceptAllSessions, BetWinRequest, CreditRequest, DebitRequest, ProviderAdapter,
    ProviderResponse, ProviderTransaction, ProviderTxnKind, RefundRequest, SessionVerifier,
    TransactionStatus,
};
