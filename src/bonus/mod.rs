//! Bonus wallet and wagering engine

pub mod contribution;
pub mod lifecycle;
pub mod plans;
pub mod types;
pub mod wagering;
pub mod wallet;

pub use contribution::GameContributionResolver;
pub use lifecycle::BonusLifecycle;
pub use plans::BonusPlans;
pub use types::*;
pub use wagering::{WagerFunding, WageringTracker};
pub use wallet::BonusWallet;
