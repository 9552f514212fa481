//! Cashier - bonus wallet, wagering, settlement and withdrawal pipeline
//!
//! Every money movement runs inside one RocksDB transaction and leaves a
//! ledger entry behind. Bonus funds live in a separate wallet that is only
//! spendable while a bonus instance is live, and turn into main-wallet money
//! once the instance's wagering requirement is met.

pub mod bonus;
pub mod clock;
pub mod config;
pub mod errors;
pub mod ledger;
pub mod metrics;
pub mod services;
pub mod settlement;
pub mod storage;
pub mod testing;
pub mod withdrawal;

#[cfg(test)]
mod test_support;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CashierConfig, ConfigLoader};
pub use errors::{CashierError, CashierResult};
pub use services::{Cashier, CashierBuilder};
pub use storage::Storage;
