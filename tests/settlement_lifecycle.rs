//! End-to-end settlement lifecycle against a real on-disk database:
//! season fixtures, open predictions, lock, resolve, stats, badges, and
//! a live bet from placement through settlement.

use std::sync::Arc;

use chrono::{Duration, Utc};
use realitybet_backend::events;
use realitybet_backend::livepool::LivePoolEngine;
use realitybet_backend::models::{
    Answer, BadgeKind, Caller, LiveBetOption, OptionList, RoundStatus,
};
use realitybet_backend::resolution::ResolutionEngine;
use realitybet_backend::scoring::StreakConfig;
use realitybet_backend::store::GameDb;

#[tokio::test]
async fn full_round_lifecycle_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("lifecycle.db");
    let db = GameDb::new(db_path.to_str().unwrap()).unwrap();

    let (events, mut event_rx) = events::channel(64);
    let resolution = ResolutionEngine::new(db.clone(), StreakConfig::default(), 3, events);

    // Season with one badge rule and one round of two questions.
    let season = db.create_season("Season 3", "Castaway Cove").await.unwrap();
    db.add_badge_rule("On the Board", BadgeKind::Correct, 1)
        .await
        .unwrap();

    let now = Utc::now();
    let round = db
        .create_round(season, 1, now + Duration::hours(1), now + Duration::hours(2))
        .await
        .unwrap();
    db.advance_round_status(round, RoundStatus::Open)
        .await
        .unwrap();

    let opts = OptionList::new(vec!["Dana".into(), "Eli".into()]).unwrap();
    let q1 = db
        .create_question(round, "Who wins immunity?", "immunity", 150, &opts)
        .await
        .unwrap();
    let q2 = db
        .create_question(round, "Who goes home?", "elimination", -120, &opts)
        .await
        .unwrap();

    // Picks while the round is open; the second write replaces the first.
    db.upsert_prediction("alice", q1, "Eli", false, false, now)
        .await
        .unwrap();
    db.upsert_prediction("alice", q1, "Dana", false, false, now)
        .await
        .unwrap();
    db.upsert_prediction("alice", q2, "Eli", true, false, now)
        .await
        .unwrap();
    db.upsert_prediction("bob", q1, "Eli", false, true, now)
        .await
        .unwrap();

    // Lock, then settle.
    db.advance_round_status(round, RoundStatus::Locked)
        .await
        .unwrap();
    let err = db
        .upsert_prediction("carol", q1, "Dana", false, false, Utc::now())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("locked"));

    let outcome = resolution
        .resolve(
            &Caller::Admin,
            round,
            &[
                Answer {
                    question_id: q1,
                    correct_option: "Dana".into(),
                },
                Answer {
                    question_id: q2,
                    correct_option: "Eli".into(),
                },
            ],
        )
        .await
        .unwrap();
    assert!(!outcome.already_resolved);
    assert_eq!(outcome.users_scored, 2);

    // alice: 250 (plain +150) + 275 (risk -120) = 525. bob: joker save 100.
    let alice = db.get_stats("alice", season).await.unwrap().unwrap();
    assert_eq!(alice.points, 525);
    assert_eq!(alice.current_streak, 1);
    let bob = db.get_stats("bob", season).await.unwrap().unwrap();
    assert_eq!(bob.points, 100);
    assert_eq!(bob.jokers_remaining, 2);

    // Badge granted inside the same settlement.
    let badges = db.user_badges("alice", season).await.unwrap();
    assert_eq!(badges.len(), 1);
    assert!(db.user_badges("bob", season).await.unwrap().is_empty());

    // The commit published exactly one event.
    let event = event_rx.try_recv().unwrap();
    let raw = serde_json::to_value(&event).unwrap();
    assert_eq!(raw["type"], "round_resolved");
    assert_eq!(raw["round_id"], round);
    assert!(event_rx.try_recv().is_err());

    // Second resolve attempt is a silent no-op.
    let again = resolution
        .resolve(
            &Caller::Agent,
            round,
            &[Answer {
                question_id: q1,
                correct_option: "Dana".into(),
            }],
        )
        .await
        .unwrap();
    assert!(again.already_resolved);
    assert!(event_rx.try_recv().is_err());
}

#[tokio::test]
async fn live_bet_lifecycle_with_events() {
    let db = GameDb::in_memory().unwrap();
    let (events, mut event_rx) = events::channel(64);
    let engine = Arc::new(LivePoolEngine::new(db.clone(), events));

    let now = Utc::now();
    let bet = db
        .create_live_bet(
            "Does the tribe swap tonight?",
            "twist",
            &[
                LiveBetOption {
                    label: "Yes".into(),
                    odds: 200,
                },
                LiveBetOption {
                    label: "No".into(),
                    odds: -150,
                },
            ],
            now,
            now + Duration::minutes(10),
            1.0,
        )
        .await
        .unwrap();

    engine.place("alice", bet, "Yes", 100, now).await.unwrap();
    engine.place("bob", bet, "No", 300, now).await.unwrap();

    let shares = engine.pool_shares(bet).await.unwrap();
    assert!((shares[0].share - 0.25).abs() < 1e-12);
    assert!((shares[1].share - 0.75).abs() < 1e-12);

    engine.lock(&Caller::Admin, bet).await.unwrap();
    let summary = engine.settle(&Caller::Admin, bet, "No").await.unwrap();
    assert_eq!(summary.winners, 1);
    // 300 * (1 + 100/150) rounded.
    assert_eq!(summary.total_paid, 500);

    let locked = serde_json::to_value(event_rx.try_recv().unwrap()).unwrap();
    assert_eq!(locked["type"], "bet_locked");
    let settled = serde_json::to_value(event_rx.try_recv().unwrap()).unwrap();
    assert_eq!(settled["type"], "bet_settled");
    assert_eq!(settled["total_paid"], 500);
}
