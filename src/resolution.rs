//! The resolution transaction.
//!
//! Turns a set of correct answers for a round into point awards, streak
//! updates, stat upserts, and badge grants, all inside one SQL
//! transaction. Re-invoking on an already-resolved round is a no-op
//! success, so two racing attempts produce exactly one set of writes.

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::info;
use uuid::Uuid;

use crate::badges;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventSender};
use crate::models::{Answer, Caller, Prediction, RoundStatus, ScoreEvent, ScoreReason};
use crate::scoring::{score, streak_update, StreakConfig};
use crate::store::{self, GameDb};

#[derive(Debug, Clone, Serialize)]
pub struct ResolveOutcome {
    pub round_id: i64,
    pub season_id: i64,
    pub already_resolved: bool,
    pub users_scored: usize,
    pub points_awarded: i64,
    pub message: String,
}

pub struct ResolutionEngine {
    db: GameDb,
    streak: StreakConfig,
    jokers_per_season: i64,
    events: EventSender,
}

impl ResolutionEngine {
    pub fn new(
        db: GameDb,
        streak: StreakConfig,
        jokers_per_season: i64,
        events: EventSender,
    ) -> Self {
        Self {
            db,
            streak,
            jokers_per_season,
            events,
        }
    }

    /// Apply a correct-answer set to a round. Requires the administrative
    /// or trusted-agent capability; checked before any read.
    pub async fn resolve(
        &self,
        caller: &Caller,
        round_id: i64,
        answers: &[Answer],
    ) -> Result<ResolveOutcome, EngineError> {
        if !caller.can_resolve() {
            return Err(EngineError::Unauthorized);
        }

        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let outcome = run_resolution(&tx, round_id, answers, &self.streak, self.jokers_per_season)?;
        tx.commit()?;
        drop(conn);

        if outcome.already_resolved {
            info!(round_id, "resolution skipped, round already resolved");
        } else {
            info!(
                round_id,
                users = outcome.users_scored,
                points = outcome.points_awarded,
                "round resolved"
            );
            let _ = self.events.send(EngineEvent::RoundResolved {
                round_id: outcome.round_id,
                season_id: outcome.season_id,
                users_scored: outcome.users_scored,
                points_awarded: outcome.points_awarded,
            });
        }

        Ok(outcome)
    }
}

/// Per-user accumulation for one round.
#[derive(Debug, Default)]
struct RoundTotals {
    points: i64,
    correct: i64,
    total: i64,
    risk_won: i64,
    risk_total: i64,
    jokers_used: i64,
}

fn run_resolution(
    conn: &Connection,
    round_id: i64,
    answers: &[Answer],
    streak_cfg: &StreakConfig,
    jokers_per_season: i64,
) -> Result<ResolveOutcome, EngineError> {
    let round = store::fetch_round(conn, round_id)?
        .ok_or_else(|| EngineError::not_found(format!("round {round_id}")))?;

    if round.status == RoundStatus::Resolved {
        return Ok(ResolveOutcome {
            round_id,
            season_id: round.season_id,
            already_resolved: true,
            users_scored: 0,
            points_awarded: 0,
            message: format!("round {round_id} already resolved"),
        });
    }
    if round.status == RoundStatus::Draft {
        return Err(EngineError::invalid("cannot resolve a draft round"));
    }

    let questions = store::fetch_questions(conn, round_id)?;
    let by_id: HashMap<i64, _> = questions.iter().map(|q| (q.id, q)).collect();

    if answers.is_empty() {
        return Err(EngineError::invalid("no answers supplied"));
    }
    let mut answer_map: HashMap<i64, String> = HashMap::with_capacity(answers.len());
    for answer in answers {
        let question = by_id.get(&answer.question_id).ok_or_else(|| {
            EngineError::not_found(format!(
                "question {} in round {round_id}",
                answer.question_id
            ))
        })?;
        // Exact label match; any repair happened at the boundary.
        if !question.options.contains(&answer.correct_option) {
            return Err(EngineError::invalid(format!(
                "answer {:?} is not an option of question {}",
                answer.correct_option, answer.question_id
            )));
        }
        answer_map.insert(answer.question_id, answer.correct_option.clone());
    }

    let now = Utc::now();
    for (question_id, option) in &answer_map {
        store::mark_question_resolved(conn, *question_id, option)?;
    }

    // Score every prediction on the answered questions, grouped by user.
    // BTreeMap keeps the per-user pass deterministic.
    let predictions = store::fetch_predictions_for_round(conn, round_id)?;
    let mut per_user: BTreeMap<String, Vec<&Prediction>> = BTreeMap::new();
    for p in &predictions {
        if answer_map.contains_key(&p.question_id) {
            per_user.entry(p.user_id.clone()).or_default().push(p);
        }
    }

    let mut users_scored = 0;
    let mut points_awarded = 0;

    for (user_id, picks) in &per_user {
        let mut totals = RoundTotals::default();

        for pick in picks {
            let question = by_id
                .get(&pick.question_id)
                .ok_or_else(|| EngineError::not_found(format!("question {}", pick.question_id)))?;
            let correct_option = &answer_map[&pick.question_id];
            let is_correct = &pick.option == correct_option;

            let breakdown = score(is_correct, question.odds, pick.is_risk, pick.used_joker);
            store::save_prediction_outcome(conn, pick.id, is_correct, breakdown.points)?;

            totals.total += 1;
            totals.points += breakdown.points;
            if is_correct {
                totals.correct += 1;
            }
            if pick.is_risk {
                totals.risk_total += 1;
                if is_correct {
                    totals.risk_won += 1;
                }
            }
            if pick.used_joker {
                totals.jokers_used += 1;
            }

            if breakdown.points > 0 {
                let reason = if breakdown.joker_save {
                    ScoreReason::JokerSave
                } else {
                    ScoreReason::QuestionCorrect
                };
                store::append_score_event(
                    conn,
                    &ScoreEvent {
                        id: Uuid::new_v4().to_string(),
                        user_id: user_id.clone(),
                        round_id,
                        points: breakdown.points,
                        reason,
                        created_at: now,
                    },
                )?;
            }
        }

        let mut stats = store::fetch_stats(conn, user_id, round.season_id)?
            .unwrap_or_else(|| {
                crate::models::UserSeasonStats::fresh(user_id, round.season_id, jokers_per_season)
            });

        let streak = streak_update(stats.current_streak, totals.correct > 0, streak_cfg);
        if streak.bonus_points > 0 {
            totals.points += streak.bonus_points;
            store::append_score_event(
                conn,
                &ScoreEvent {
                    id: Uuid::new_v4().to_string(),
                    user_id: user_id.clone(),
                    round_id,
                    points: streak.bonus_points,
                    reason: ScoreReason::StreakBonus,
                    created_at: now,
                },
            )?;
        }

        stats.points += totals.points;
        stats.correct_count += totals.correct;
        stats.total_count += totals.total;
        stats.risk_bets_won += totals.risk_won;
        stats.risk_bets_total += totals.risk_total;
        stats.jokers_used += totals.jokers_used;
        stats.jokers_remaining = (stats.jokers_remaining - totals.jokers_used).max(0);
        stats.current_streak = streak.new_streak;
        stats.longest_streak = stats.longest_streak.max(streak.new_streak);
        stats.recompute_win_rate();
        store::save_stats(conn, &stats)?;

        users_scored += 1;
        points_awarded += totals.points;
    }

    badges::evaluate_season(conn, round.season_id, now)?;
    store::set_round_resolved(conn, round_id)?;

    Ok(ResolveOutcome {
        round_id,
        season_id: round.season_id,
        already_resolved: false,
        users_scored,
        points_awarded,
        message: format!(
            "round {round_id} resolved: {} answers, {users_scored} users scored"
        , answer_map.len()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BadgeKind, OptionList, ScoreReason};
    use chrono::Duration;

    struct Fixture {
        db: GameDb,
        engine: ResolutionEngine,
        season: i64,
        round: i64,
        q1: i64,
        q2: i64,
    }

    async fn fixture() -> Fixture {
        let db = GameDb::in_memory().unwrap();
        let (events, _rx) = crate::events::channel(16);
        let engine = ResolutionEngine::new(db.clone(), StreakConfig::default(), 3, events);

        let season = db.create_season("S1", "Outback Island").await.unwrap();
        let now = Utc::now();
        let round = db
            .create_round(season, 1, now - Duration::hours(2), now + Duration::hours(1))
            .await
            .unwrap();
        db.advance_round_status(round, RoundStatus::Open)
            .await
            .unwrap();

        let opts = OptionList::new(vec!["Alice".into(), "Bob".into()]).unwrap();
        let q1 = db
            .create_question(round, "Who wins immunity?", "immunity", 150, &opts)
            .await
            .unwrap();
        let q2 = db
            .create_question(round, "Who is eliminated?", "elimination", -120, &opts)
            .await
            .unwrap();

        Fixture {
            db,
            engine,
            season,
            round,
            q1,
            q2,
        }
    }

    fn answers(f: &Fixture) -> Vec<Answer> {
        vec![
            Answer {
                question_id: f.q1,
                correct_option: "Alice".into(),
            },
            Answer {
                question_id: f.q2,
                correct_option: "Bob".into(),
            },
        ]
    }

    #[tokio::test]
    async fn resolve_scores_predictions_and_updates_stats() {
        let f = fixture().await;
        let now = Utc::now();
        // u1: correct plain (+150 -> 250), correct risk (-120 -> 275)
        f.db.upsert_prediction("u1", f.q1, "Alice", false, false, now)
            .await
            .unwrap();
        f.db.upsert_prediction("u1", f.q2, "Bob", true, false, now)
            .await
            .unwrap();
        // u2: wrong with joker (100), wrong plain (0)
        f.db.upsert_prediction("u2", f.q1, "Bob", false, true, now)
            .await
            .unwrap();
        f.db.upsert_prediction("u2", f.q2, "Alice", false, false, now)
            .await
            .unwrap();

        let outcome = f
            .engine
            .resolve(&Caller::Admin, f.round, &answers(&f))
            .await
            .unwrap();
        assert!(!outcome.already_resolved);
        assert_eq!(outcome.users_scored, 2);
        assert_eq!(outcome.points_awarded, 250 + 275 + 100);

        let s1 = f.db.get_stats("u1", f.season).await.unwrap().unwrap();
        assert_eq!(s1.points, 525);
        assert_eq!(s1.correct_count, 2);
        assert_eq!(s1.total_count, 2);
        assert_eq!(s1.current_streak, 1);
        assert_eq!(s1.longest_streak, 1);
        assert_eq!(s1.risk_bets_won, 1);
        assert_eq!(s1.risk_bets_total, 1);
        assert!((s1.win_rate - 1.0).abs() < 1e-12);

        let s2 = f.db.get_stats("u2", f.season).await.unwrap().unwrap();
        assert_eq!(s2.points, 100);
        assert_eq!(s2.correct_count, 0);
        assert_eq!(s2.current_streak, 0);
        assert_eq!(s2.jokers_used, 1);
        assert_eq!(s2.jokers_remaining, 2);

        let round = f.db.get_round(f.round).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Resolved);

        let p = f.db.get_prediction("u1", f.q2).await.unwrap().unwrap();
        assert_eq!(p.is_correct, Some(true));
        assert_eq!(p.points_awarded, Some(275));
    }

    #[tokio::test]
    async fn resolve_is_idempotent() {
        let f = fixture().await;
        let now = Utc::now();
        f.db.upsert_prediction("u1", f.q1, "Alice", false, false, now)
            .await
            .unwrap();

        let first = f
            .engine
            .resolve(&Caller::Admin, f.round, &answers(&f))
            .await
            .unwrap();
        assert!(!first.already_resolved);

        let events_after_first = f.db.score_events_for_round(f.round).await.unwrap();
        let stats_after_first = f.db.get_stats("u1", f.season).await.unwrap().unwrap();

        let second = f
            .engine
            .resolve(&Caller::Admin, f.round, &answers(&f))
            .await
            .unwrap();
        assert!(second.already_resolved);
        assert_eq!(second.users_scored, 0);

        let events_after_second = f.db.score_events_for_round(f.round).await.unwrap();
        assert_eq!(events_after_first.len(), events_after_second.len());
        let stats_after_second = f.db.get_stats("u1", f.season).await.unwrap().unwrap();
        assert_eq!(stats_after_first.points, stats_after_second.points);
        assert_eq!(stats_after_first.total_count, stats_after_second.total_count);
    }

    #[tokio::test]
    async fn resolve_requires_capability() {
        let f = fixture().await;
        let err = f
            .engine
            .resolve(&Caller::User("u1".into()), f.round, &answers(&f))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized));

        // Agent capability is trusted.
        let ok = f
            .engine
            .resolve(&Caller::Agent, f.round, &answers(&f))
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn resolve_rejects_bad_answers_without_partial_writes() {
        let f = fixture().await;
        let now = Utc::now();
        f.db.upsert_prediction("u1", f.q1, "Alice", false, false, now)
            .await
            .unwrap();

        let bad = vec![
            Answer {
                question_id: f.q1,
                correct_option: "Alice".into(),
            },
            Answer {
                question_id: f.q2,
                correct_option: "Nobody".into(),
            },
        ];
        let err = f.engine.resolve(&Caller::Admin, f.round, &bad).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));

        // Nothing committed: round still open, no score events, no stats.
        let round = f.db.get_round(f.round).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Open);
        assert!(f.db.score_events_for_round(f.round).await.unwrap().is_empty());
        assert!(f.db.get_stats("u1", f.season).await.unwrap().is_none());
        let q1 = f.db.round_questions(f.round).await.unwrap();
        assert!(q1.iter().all(|q| q.correct_option.is_none()));
    }

    #[tokio::test]
    async fn resolve_unknown_round_is_not_found() {
        let f = fixture().await;
        let err = f
            .engine
            .resolve(&Caller::Admin, 9999, &answers(&f))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn conservation_of_points() {
        let f = fixture().await;
        let now = Utc::now();
        for (user, pick1, pick2, risk) in [
            ("u1", "Alice", "Bob", false),
            ("u2", "Bob", "Bob", false),
            ("u3", "Alice", "Alice", true),
        ] {
            f.db.upsert_prediction(user, f.q1, pick1, risk, false, now)
                .await
                .unwrap();
            f.db.upsert_prediction(user, f.q2, pick2, false, false, now)
                .await
                .unwrap();
        }

        f.engine
            .resolve(&Caller::Admin, f.round, &answers(&f))
            .await
            .unwrap();

        let mut prediction_sum = 0;
        for user in ["u1", "u2", "u3"] {
            for q in [f.q1, f.q2] {
                if let Some(p) = f.db.get_prediction(user, q).await.unwrap() {
                    prediction_sum += p.points_awarded.unwrap_or(0);
                }
            }
        }

        let events = f.db.score_events_for_round(f.round).await.unwrap();
        let event_sum: i64 = events
            .iter()
            .filter(|e| e.reason != ScoreReason::StreakBonus)
            .map(|e| e.points)
            .sum();
        assert_eq!(prediction_sum, event_sum);
    }

    #[tokio::test]
    async fn streak_bonus_and_longest_streak_monotonicity() {
        let f = fixture().await;
        let streak_cfg = StreakConfig {
            bonus_cadence: 2,
            bonus_points: 40,
        };
        let (events, _rx) = crate::events::channel(16);
        let engine = ResolutionEngine::new(f.db.clone(), streak_cfg, 3, events);

        let opts = OptionList::new(vec!["Alice".into(), "Bob".into()]).unwrap();
        let now = Utc::now();
        let mut longest_seen = 0;
        for n in 2..=4 {
            let round = f
                .db
                .create_round(f.season, n, now - Duration::hours(2), now + Duration::hours(1))
                .await
                .unwrap();
            f.db.advance_round_status(round, RoundStatus::Open)
                .await
                .unwrap();
            let q = f
                .db
                .create_question(round, "Who wins?", "immunity", 100, &opts)
                .await
                .unwrap();
            // Correct on rounds 2 and 3, wrong on round 4.
            let pick = if n < 4 { "Alice" } else { "Bob" };
            f.db.upsert_prediction("u1", q, pick, false, false, now)
                .await
                .unwrap();
            engine
                .resolve(
                    &Caller::Admin,
                    round,
                    &[Answer {
                        question_id: q,
                        correct_option: "Alice".into(),
                    }],
                )
                .await
                .unwrap();

            let stats = f.db.get_stats("u1", f.season).await.unwrap().unwrap();
            assert!(stats.longest_streak >= longest_seen);
            longest_seen = stats.longest_streak;
        }

        let stats = f.db.get_stats("u1", f.season).await.unwrap().unwrap();
        assert_eq!(stats.current_streak, 0);
        assert_eq!(stats.longest_streak, 2);
        // 200 + (200 + 40 bonus at streak 2) + 0
        assert_eq!(stats.points, 440);
    }

    #[tokio::test]
    async fn badges_granted_once_and_never_revoked() {
        let f = fixture().await;
        f.db.add_badge_rule("First Blood", BadgeKind::Correct, 1)
            .await
            .unwrap();

        let now = Utc::now();
        f.db.upsert_prediction("u1", f.q1, "Alice", false, false, now)
            .await
            .unwrap();
        f.engine
            .resolve(&Caller::Admin, f.round, &answers(&f))
            .await
            .unwrap();

        let badges = f.db.user_badges("u1", f.season).await.unwrap();
        assert_eq!(badges.len(), 1);
        assert!(badges[0].progress >= 1);

        // A later round with a wrong pick must not revoke the badge.
        let opts = OptionList::new(vec!["Alice".into(), "Bob".into()]).unwrap();
        let round2 = f
            .db
            .create_round(f.season, 2, now - Duration::hours(1), now + Duration::hours(1))
            .await
            .unwrap();
        f.db.advance_round_status(round2, RoundStatus::Open)
            .await
            .unwrap();
        let q = f
            .db
            .create_question(round2, "Who wins?", "immunity", 100, &opts)
            .await
            .unwrap();
        f.db.upsert_prediction("u1", q, "Bob", false, false, now)
            .await
            .unwrap();
        f.engine
            .resolve(
                &Caller::Admin,
                round2,
                &[Answer {
                    question_id: q,
                    correct_option: "Alice".into(),
                }],
            )
            .await
            .unwrap();

        let badges = f.db.user_badges("u1", f.season).await.unwrap();
        assert_eq!(badges.len(), 1);
    }
}
