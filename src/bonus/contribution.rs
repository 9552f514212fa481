//! Game contribution resolver
//!
//! Precedence: per-game override, then per-category setting, then the
//! built-in default for the category. A restricted game or category always
//! contributes nothing.

use super::types::{
    CategoryContribution, ContributionSource, GameCategory, GameContribution, ResolvedContribution,
};
use crate::errors::{CashierError, CashierResult};
use crate::storage::{keys, validate_id, Storage, StorageTxn};
use tracing::info;

pub struct GameContributionResolver {
    storage: Storage,
}

impl GameContributionResolver {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Register a game (or move it to another category), keeping any override
    pub fn register_game(&self, game_code: &str, category: GameCategory) -> CashierResult<GameContribution> {
        validate_id("game_code", game_code)?;
        let txn = self.storage.begin();
        let key = keys::game(game_code);
        let game = match txn.get_for_update_json::<GameContribution>(&key)? {
            Some(existing) => GameContribution { category, ..existing },
            None => GameContribution {
                game_code: game_code.to_string(),
                category,
                contribution_percent: None,
                restricted: false,
            },
        };
        txn.put_json(&key, &game)?;
        txn.commit()?;
        Ok(game)
    }

    pub fn set_game_contribution(
        &self,
        game_code: &str,
        contribution_percent: Option<u8>,
        restricted: bool,
    ) -> CashierResult<GameContribution> {
        check_percent(contribution_percent)?;
        let txn = self.storage.begin();
        let key = keys::game(game_code);
        let mut game = txn
            .get_for_update_json::<GameContribution>(&key)?
            .ok_or_else(|| CashierError::not_found("game", game_code))?;
        game.contribution_percent = contribution_percent;
        game.restricted = restricted;
        txn.put_json(&key, &game)?;
        txn.commit()?;

        info!(game_code, ?contribution_percent, restricted, "Game contribution updated");
        Ok(game)
    }

    pub fn set_category_contribution(
        &self,
        category: GameCategory,
        contribution_percent: u8,
        restricted: bool,
    ) -> CashierResult<CategoryContribution> {
        check_percent(Some(contribution_percent))?;
        let row = CategoryContribution {
            category,
            contribution_percent,
            restricted,
        };
        let txn = self.storage.begin();
        txn.put_json(&keys::category_contribution(category.as_str()), &row)?;
        txn.commit()?;

        info!(category = category.as_str(), contribution_percent, restricted, "Category contribution updated");
        Ok(row)
    }

    pub fn resolve(&self, game_code: &str) -> CashierResult<ResolvedContribution> {
        let txn = self.storage.begin();
        resolve_in(&txn, game_code)
    }
}

fn check_percent(percent: Option<u8>) -> CashierResult<()> {
    match percent {
        Some(p) if p > 100 => Err(CashierError::validation(format!(
            "contribution percent must be 0-100, got {}",
            p
        ))),
        _ => Ok(()),
    }
}

/// Unknown games fall into `Other`
pub(crate) fn resolve_in(txn: &StorageTxn<'_>, game_code: &str) -> CashierResult<ResolvedContribution> {
    let game = txn.get_json::<GameContribution>(&keys::game(game_code))?;
    let category = game.as_ref().map_or(GameCategory::Other, |g| g.category);

    if let Some(game) = &game {
        if game.restricted {
            return Ok(ResolvedContribution {
                category,
                percent: 0,
                restricted: true,
                source: ContributionSource::Game,
            });
        }
        if let Some(percent) = game.contribution_percent {
            return Ok(ResolvedContribution {
                category,
                percent,
                restricted: false,
                source: ContributionSource::Game,
            });
        }
    }

    if let Some(row) =
        txn.get_json::<CategoryContribution>(&keys::category_contribution(category.as_str()))?
    {
        return Ok(ResolvedContribution {
            category,
            percent: if row.restricted { 0 } else { row.contribution_percent },
            restricted: row.restricted,
            source: ContributionSource::Category,
        });
    }

    Ok(ResolvedContribution {
        category,
        percent: category.default_contribution(),
        restricted: false,
        source: ContributionSource::Default,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_tier_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = GameContributionResolver::new(Storage::open(dir.path()).unwrap());

        resolver.register_game("starburst", GameCategory::Slots).unwrap();
        resolver.register_game("blackjack", GameCategory::Table).unwrap();
        resolver.register_game("roulette-live", GameCategory::Live).unwrap();

        let resolved = resolver.resolve("starburst").unwrap();
        assert_eq!((resolved.percent, resolved.source), (100, ContributionSource::Default));

        resolver.set_category_contribution(GameCategory::Table, 20, false).unwrap();
        let resolved = resolver.resolve("blackjack").unwrap();
        assert_eq!((resolved.percent, resolved.source), (20, ContributionSource::Category));

        resolver.set_game_contribution("blackjack", Some(5), false).unwrap();
        let resolved = resolver.resolve("blackjack").unwrap();
        assert_eq!((resolved.percent, resolved.source), (5, ContributionSource::Game));

        resolver.set_game_contribution("starburst", None, true).unwrap();
        let resolved = resolver.resolve("starburst").unwrap();
        assert!(resolved.restricted);
        assert_eq!(resolved.apply(1_000), 0);

        let resolved = resolver.resolve("unknown-game").unwrap();
        assert_eq!((resolved.category, resolved.percent), (GameCategory::Other, 0));
    }

    #[test]
    fn test_reregistering_keeps_override() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = GameContributionResolver::new(Storage::open(dir.path()).unwrap());

        resolver.register_game("baccarat", GameCategory::Table).unwrap();
        resolver.set_game_contribution("baccarat", Some(15), false).unwrap();
        let game = resolver.register_game("baccarat", GameCategory::Live).unwrap();
        assert_eq!(game.contribution_percent, Some(15));

        assert!(resolver.set_game_contribution("baccarat", Some(101), false).is_err());
        assert!(resolver.set_game_contribution("missing", Some(10), false).is_err());
    }
}
