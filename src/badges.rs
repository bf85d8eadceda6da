//! Badge evaluation.
//!
//! Badges are declarative threshold rules over cumulative season stats.
//! Because every counter a rule can read is non-decreasing within a
//! season, qualification is monotone: once granted, a badge is never
//! revoked.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::debug;

use crate::error::EngineError;
use crate::models::{BadgeKind, BadgeRule, UserSeasonStats};
use crate::store;

/// The stat counter a rule reads. Streak rules read the longest streak so
/// a later reset cannot un-qualify anyone.
pub fn counter_for(kind: BadgeKind, stats: &UserSeasonStats) -> i64 {
    match kind {
        BadgeKind::Streak => stats.longest_streak,
        BadgeKind::Correct => stats.correct_count,
        BadgeKind::RiskWins => stats.risk_bets_won,
        BadgeKind::Points => stats.points,
    }
}

pub fn rule_met(rule: &BadgeRule, stats: &UserSeasonStats) -> bool {
    counter_for(rule.kind, stats) >= rule.threshold
}

/// Run every rule against every stats row in the season, upserting
/// qualification records for rules that are met. Called inside the
/// resolution transaction so grants commit with the scores they follow.
pub(crate) fn evaluate_season(
    conn: &Connection,
    season_id: i64,
    now: DateTime<Utc>,
) -> Result<usize, EngineError> {
    let rules = store::fetch_badge_rules(conn)?;
    if rules.is_empty() {
        return Ok(0);
    }
    let stats_rows = store::fetch_season_stats(conn, season_id)?;

    let mut granted = 0;
    for stats in &stats_rows {
        for rule in &rules {
            if rule_met(rule, stats) {
                store::upsert_user_badge(
                    conn,
                    &stats.user_id,
                    rule.id,
                    season_id,
                    counter_for(rule.kind, stats),
                    now,
                )?;
                granted += 1;
            }
        }
    }
    debug!(season_id, granted, "badge evaluation pass complete");
    Ok(granted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> UserSeasonStats {
        UserSeasonStats {
            user_id: "u1".into(),
            season_id: 1,
            points: 730,
            correct_count: 9,
            total_count: 12,
            current_streak: 0,
            longest_streak: 5,
            risk_bets_won: 2,
            risk_bets_total: 4,
            jokers_used: 1,
            jokers_remaining: 2,
            win_rate: 0.75,
        }
    }

    #[test]
    fn counters_read_the_right_fields() {
        let s = stats();
        assert_eq!(counter_for(BadgeKind::Streak, &s), 5);
        assert_eq!(counter_for(BadgeKind::Correct, &s), 9);
        assert_eq!(counter_for(BadgeKind::RiskWins, &s), 2);
        assert_eq!(counter_for(BadgeKind::Points, &s), 730);
    }

    #[test]
    fn streak_rules_use_longest_streak() {
        // current_streak reset to zero must not matter.
        let s = stats();
        let rule = BadgeRule {
            id: 1,
            name: "On Fire".into(),
            kind: BadgeKind::Streak,
            threshold: 5,
        };
        assert!(rule_met(&rule, &s));
    }

    #[test]
    fn threshold_is_inclusive() {
        let s = stats();
        let at = BadgeRule {
            id: 1,
            name: "Sharp".into(),
            kind: BadgeKind::Correct,
            threshold: 9,
        };
        let above = BadgeRule {
            id: 2,
            name: "Sharper".into(),
            kind: BadgeKind::Correct,
            threshold: 10,
        };
        assert!(rule_met(&at, &s));
        assert!(!rule_met(&above, &s));
    }
}
