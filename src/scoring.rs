//! Pure scoring and streak functions.
//!
//! Everything here is total and deterministic: identical inputs always
//! produce identical outputs, which is what makes re-scoring idempotent
//! and the resolution transaction auditable.

use serde::{Deserialize, Serialize};

/// Base stake value every question is scored against before odds.
pub const BASE_STAKE: f64 = 100.0;

/// Multiplier applied on top of odds when a correct pick carried the risk
/// modifier.
pub const RISK_MULTIPLIER: f64 = 1.5;

/// Flat fallback awarded when a wrong pick carried the joker modifier.
pub const JOKER_SAVE_POINTS: i64 = 100;

/// Convert signed American odds to a payout multiplier.
///
/// `+150` pays 2.5x the stake, `-120` pays 1.8333...x.
pub fn american_odds_multiplier(odds: i32) -> f64 {
    if odds >= 0 {
        1.0 + odds as f64 / 100.0
    } else {
        1.0 + 100.0 / odds.unsigned_abs() as f64
    }
}

/// Decomposition of one scoring decision, kept alongside the final number
/// for audit and display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub points: i64,
    pub base: f64,
    pub multiplier: f64,
    pub risk_applied: bool,
    pub joker_save: bool,
}

/// Score a single prediction outcome.
///
/// - correct + risk: `round(100 * m * 1.5)`
/// - correct: `round(100 * m)`
/// - incorrect + joker: flat 100 ("joker save"), odds-independent
/// - incorrect + risk: 0 (risk forfeits entirely; a joker cannot rescue a
///   risk bet, that combination is rejected at write time upstream)
/// - incorrect: 0
pub fn score(is_correct: bool, odds: i32, is_risk: bool, used_joker: bool) -> ScoreBreakdown {
    let multiplier = american_odds_multiplier(odds);
    let base = BASE_STAKE * multiplier;

    if is_correct {
        let raw = if is_risk { base * RISK_MULTIPLIER } else { base };
        return ScoreBreakdown {
            points: raw.round() as i64,
            base,
            multiplier,
            risk_applied: is_risk,
            joker_save: false,
        };
    }

    if used_joker && !is_risk {
        return ScoreBreakdown {
            points: JOKER_SAVE_POINTS,
            base,
            multiplier,
            risk_applied: false,
            joker_save: true,
        };
    }

    ScoreBreakdown {
        points: 0,
        base,
        multiplier,
        risk_applied: is_risk,
        joker_save: false,
    }
}

/// Streak bonus tuning. Exposed as configuration so products can adjust
/// cadence and magnitude without touching the engine.
#[derive(Debug, Clone, Copy)]
pub struct StreakConfig {
    /// A bonus fires every time the streak reaches a multiple of this.
    pub bonus_cadence: i64,
    pub bonus_points: i64,
}

impl Default for StreakConfig {
    fn default() -> Self {
        Self {
            bonus_cadence: 3,
            bonus_points: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreakUpdate {
    pub new_streak: i64,
    pub bonus_points: i64,
}

/// Advance a user's streak for one resolved round.
///
/// At least one correct pick increments the streak; a round with no
/// correct pick resets it to zero. The bonus fires when the new streak
/// lands on a cadence multiple.
pub fn streak_update(current: i64, any_correct: bool, cfg: &StreakConfig) -> StreakUpdate {
    if !any_correct {
        return StreakUpdate {
            new_streak: 0,
            bonus_points: 0,
        };
    }

    let new_streak = current + 1;
    let bonus_points = if cfg.bonus_cadence > 0 && new_streak % cfg.bonus_cadence == 0 {
        cfg.bonus_points
    } else {
        0
    };

    StreakUpdate {
        new_streak,
        bonus_points,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odds_conversion() {
        assert_eq!(american_odds_multiplier(150), 2.5);
        assert_eq!(american_odds_multiplier(0), 1.0);
        assert_eq!(american_odds_multiplier(100), 2.0);
        let m = american_odds_multiplier(-120);
        assert!((m - 1.8333333333333333).abs() < 1e-12);
        assert_eq!(american_odds_multiplier(-100), 2.0);
    }

    #[test]
    fn correct_plain_pick() {
        let b = score(true, 150, false, false);
        assert_eq!(b.points, 250);
        assert!(!b.risk_applied);
        assert!(!b.joker_save);
    }

    #[test]
    fn correct_risk_pick_negative_odds() {
        let b = score(true, -120, true, false);
        assert_eq!(b.points, 275);
        assert!(b.risk_applied);
    }

    #[test]
    fn incorrect_joker_saves_flat() {
        let b = score(false, 300, false, true);
        assert_eq!(b.points, JOKER_SAVE_POINTS);
        assert!(b.joker_save);

        // Joker save ignores odds entirely.
        let b2 = score(false, -500, false, true);
        assert_eq!(b2.points, JOKER_SAVE_POINTS);
    }

    #[test]
    fn incorrect_risk_forfeits() {
        let b = score(false, 150, true, false);
        assert_eq!(b.points, 0);
        // Even if both flags slipped through upstream validation, a risk
        // bet is never joker-saved.
        let b2 = score(false, 150, true, true);
        assert_eq!(b2.points, 0);
        assert!(!b2.joker_save);
    }

    #[test]
    fn incorrect_plain_scores_zero() {
        assert_eq!(score(false, 150, false, false).points, 0);
    }

    #[test]
    fn scoring_is_deterministic() {
        for odds in [-500, -120, -100, 0, 100, 150, 999] {
            for is_correct in [true, false] {
                for is_risk in [true, false] {
                    for used_joker in [true, false] {
                        let a = score(is_correct, odds, is_risk, used_joker);
                        let b = score(is_correct, odds, is_risk, used_joker);
                        assert_eq!(a, b);
                    }
                }
            }
        }
    }

    #[test]
    fn streak_increments_and_resets() {
        let cfg = StreakConfig::default();
        let up = streak_update(1, true, &cfg);
        assert_eq!(up.new_streak, 2);
        assert_eq!(up.bonus_points, 0);

        let reset = streak_update(7, false, &cfg);
        assert_eq!(reset.new_streak, 0);
        assert_eq!(reset.bonus_points, 0);
    }

    #[test]
    fn streak_bonus_fires_on_cadence() {
        let cfg = StreakConfig {
            bonus_cadence: 3,
            bonus_points: 50,
        };
        assert_eq!(streak_update(2, true, &cfg).bonus_points, 50);
        assert_eq!(streak_update(3, true, &cfg).bonus_points, 0);
        assert_eq!(streak_update(5, true, &cfg).bonus_points, 50);
    }
}
