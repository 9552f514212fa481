//! Withdrawal risk scoring
//!
//! Additive points from behavioural signals; the point values and level
//! thresholds come from [`RiskConfig`].

use super::types::{RiskLevel, WithdrawalRequest, WithdrawalStatus};
use crate::config::RiskConfig;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Facts about one request gathered from history
#[derive(Debug, Clone, Default)]
pub struct RiskSignals {
    pub amount: u64,
    pub lifetime_deposits: u64,
    /// Earlier requests, not counting the one being scored
    pub requests_last_hour: usize,
    /// None when the caller supplied no address
    pub ip_known: Option<bool>,
    pub recent_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: u32,
    pub level: RiskLevel,
    pub factors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RiskScorer {
    config: RiskConfig,
}

impl RiskScorer {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Collect signals for a new request from the player's earlier requests
    pub fn signals(
        &self,
        amount: u64,
        lifetime_deposits: u64,
        ip_known: Option<bool>,
        history: &[WithdrawalRequest],
        now: DateTime<Utc>,
    ) -> RiskSignals {
        let hour_ago = now - Duration::hours(1);
        let failure_window = now - Duration::days(self.config.recent_failures_window_days);
        RiskSignals {
            amount,
            lifetime_deposits,
            // earlier requests only; the one being scored is not in history
            requests_last_hour: history.iter().filter(|r| r.requested_at > hour_ago).count(),
            ip_known,
            recent_failures: history
                .iter()
                .filter(|r| {
                    matches!(r.status, WithdrawalStatus::Rejected | WithdrawalStatus::Failed)
                        && r.requested_at > failure_window
                })
                .count(),
        }
    }

    pub fn assess(&self, signals: &RiskSignals) -> RiskAssessment {
        let c = &self.config;
        let mut score = 0;
        let mut factors = Vec::new();

        if signals.requests_last_hour > c.rapid_withdrawal_max_per_hour {
            score += c.rapid_withdrawal_points;
            factors.push("rapid_withdrawals".to_string());
        }
        if signals.amount > signals.lifetime_deposits.saturating_mul(c.deposit_ratio_multiplier) {
            score += c.deposit_ratio_points;
            factors.push("amount_exceeds_deposits".to_string());
        }
        if signals.ip_known == Some(false) {
            score += c.new_ip_points;
            factors.push("new_ip".to_string());
        }
        if signals.recent_failures > c.recent_failures_max {
            score += c.recent_failures_points;
            factors.push("recent_failures".to_string());
        }

        RiskAssessment {
            score,
            level: self.level(score),
            factors,
        }
    }

    pub fn level(&self, score: u32) -> RiskLevel {
        let c = &self.config;
        if score >= c.critical_threshold {
            RiskLevel::Critical
        } else if score >= c.high_threshold {
            RiskLevel::High
        } else if score >= c.medium_threshold {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn is_high_risk(&self, score: u32) -> bool {
        score >= self.config.high_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> RiskScorer {
        RiskScorer::new(RiskConfig::default())
    }

    #[test]
    fn test_levels() {
        let scorer = scorer();
        assert_eq!(scorer.level(0), RiskLevel::Low);
        assert_eq!(scorer.level(29), RiskLevel::Low);
        assert_eq!(scorer.level(30), RiskLevel::Medium);
        assert_eq!(scorer.level(49), RiskLevel::Medium);
        assert_eq!(scorer.level(50), RiskLevel::High);
        assert_eq!(scorer.level(69), RiskLevel::High);
        assert_eq!(scorer.level(70), RiskLevel::Critical);
        assert!(!scorer.is_high_risk(49));
        assert!(scorer.is_high_risk(50));
    }

    #[test]
    fn test_points_are_additive() {
        let scorer = scorer();
        let quiet = RiskSignals {
            amount: 100,
            lifetime_deposits: 1_000,
            requests_last_hour: 1,
            ip_known: Some(true),
            recent_failures: 0,
        };
        assert_eq!(scorer.assess(&quiet).score, 0);

        let noisy = RiskSignals {
            amount: 5_000,
            lifetime_deposits: 1_000,
            requests_last_hour: 3,
            ip_known: Some(false),
            recent_failures: 3,
        };
        let assessment = scorer.assess(&noisy);
        assert_eq!(assessment.score, 30 + 40 + 20 + 25);
        assert_eq!(assessment.level, RiskLevel::Critical);
        assert_eq!(assessment.factors.len(), 4);

        let new_ip_only = RiskSignals {
            ip_known: Some(false),
            ..quiet
        };
        let assessment = scorer.assess(&new_ip_only);
        assert_eq!((assessment.score, assessment.level), (20, RiskLevel::Low));
    }
}
