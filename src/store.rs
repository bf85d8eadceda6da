//! SQLite persistence for the settlement engine.
//!
//! A single shared connection behind a tokio `Mutex` serializes all
//! writes, which is what keeps hot live-bet pool increments race-free.
//! The resolution transaction acquires the lock once and runs inside one
//! `rusqlite` transaction so a round settles all-or-nothing.
//!
//! The `fetch_*`/`save_*` free functions take `&Connection` so the same
//! row mapping works both for plain queries and inside a transaction.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::EngineError;
use crate::models::{
    BadgeKind, BadgeRule, LiveBet, LiveBetOption, LiveBetPlacement, LiveBetStatus, LivePayout,
    OptionList, Prediction, Question, QuestionStatus, Round, RoundStatus, ScoreEvent, ScoreReason,
    Season, UserBadge, UserSeasonStats,
};

#[derive(Clone)]
pub struct GameDb {
    conn: Arc<Mutex<Connection>>,
}

impl GameDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open game db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, used by tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory db")?;
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Exclusive access to the underlying connection. Engine code holds
    /// this across a whole SQL transaction.
    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    // ===== Fixtures / admin writes =====

    pub async fn create_season(&self, name: &str, show_name: &str) -> Result<i64, EngineError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO seasons (name, show_name) VALUES (?1, ?2)",
            params![name, show_name],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn create_round(
        &self,
        season_id: i64,
        number: i64,
        airs_at: DateTime<Utc>,
        locks_at: DateTime<Utc>,
    ) -> Result<i64, EngineError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO rounds (season_id, number, airs_at, locks_at, status)
             VALUES (?1, ?2, ?3, ?4, 'draft')",
            params![season_id, number, airs_at.to_rfc3339(), locks_at.to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn create_question(
        &self,
        round_id: i64,
        prompt: &str,
        kind: &str,
        odds: i32,
        options: &OptionList,
    ) -> Result<i64, EngineError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO questions (round_id, prompt, kind, odds, options, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'open')",
            params![round_id, prompt, kind, odds, options.to_json()?],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Externally triggered forward-only status transition (Draft→Open,
    /// Open→Locked). Locked→Resolved is owned by the resolution
    /// transaction and rejected here.
    pub async fn advance_round_status(
        &self,
        round_id: i64,
        next: RoundStatus,
    ) -> Result<(), EngineError> {
        if next == RoundStatus::Resolved {
            return Err(EngineError::invalid(
                "rounds are resolved through settlement, not a status write",
            ));
        }
        let conn = self.conn.lock().await;
        let round = fetch_round(&conn, round_id)?
            .ok_or_else(|| EngineError::not_found(format!("round {round_id}")))?;
        if !round.status.can_advance_to(next) {
            return Err(EngineError::invalid(format!(
                "round {} cannot move {} -> {}",
                round_id,
                round.status.as_str(),
                next.as_str()
            )));
        }
        conn.execute(
            "UPDATE rounds SET status = ?1 WHERE id = ?2",
            params![next.as_str(), round_id],
        )?;
        Ok(())
    }

    pub async fn add_badge_rule(
        &self,
        name: &str,
        kind: BadgeKind,
        threshold: i64,
    ) -> Result<i64, EngineError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO badges (name, kind, threshold) VALUES (?1, ?2, ?3)",
            params![name, kind.as_str(), threshold],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // ===== Reads =====

    pub async fn get_round(&self, round_id: i64) -> Result<Option<Round>, EngineError> {
        let conn = self.conn.lock().await;
        fetch_round(&conn, round_id)
    }

    pub async fn get_season(&self, season_id: i64) -> Result<Option<Season>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT id, name, show_name FROM seasons WHERE id = ?1")?;
        stmt.query_row(params![season_id], |row| {
            Ok(Season {
                id: row.get(0)?,
                name: row.get(1)?,
                show_name: row.get(2)?,
            })
        })
        .optional()
        .map_err(EngineError::from)
    }

    pub async fn round_questions(&self, round_id: i64) -> Result<Vec<Question>, EngineError> {
        let conn = self.conn.lock().await;
        fetch_questions(&conn, round_id)
    }

    pub async fn get_stats(
        &self,
        user_id: &str,
        season_id: i64,
    ) -> Result<Option<UserSeasonStats>, EngineError> {
        let conn = self.conn.lock().await;
        fetch_stats(&conn, user_id, season_id)
    }

    pub async fn score_events_for_round(
        &self,
        round_id: i64,
    ) -> Result<Vec<ScoreEvent>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, round_id, points, reason, created_at
             FROM score_events WHERE round_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![round_id], map_score_event)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(EngineError::from)
    }

    pub async fn list_badge_rules(&self) -> Result<Vec<BadgeRule>, EngineError> {
        let conn = self.conn.lock().await;
        fetch_badge_rules(&conn)
    }

    pub async fn user_badges(
        &self,
        user_id: &str,
        season_id: i64,
    ) -> Result<Vec<UserBadge>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT user_id, badge_id, season_id, progress, granted_at
             FROM user_badges WHERE user_id = ?1 AND season_id = ?2 ORDER BY badge_id ASC",
        )?;
        let rows = stmt.query_map(params![user_id, season_id], |row| {
            let granted: String = row.get(4)?;
            Ok(UserBadge {
                user_id: row.get(0)?,
                badge_id: row.get(1)?,
                season_id: row.get(2)?,
                progress: row.get(3)?,
                granted_at: parse_ts(&granted, 4)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(EngineError::from)
    }

    pub async fn get_prediction(
        &self,
        user_id: &str,
        question_id: i64,
    ) -> Result<Option<Prediction>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, question_id, option, is_risk, used_joker,
                    is_correct, points_awarded, updated_at
             FROM predictions WHERE user_id = ?1 AND question_id = ?2",
        )?;
        stmt.query_row(params![user_id, question_id], map_prediction)
            .optional()
            .map_err(EngineError::from)
    }

    /// Rounds the verification agent should look at: already aired,
    /// not yet resolved. Oldest air time first, bounded by `limit`.
    pub async fn unresolved_aired_rounds(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Round>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, season_id, number, airs_at, locks_at, status
             FROM rounds
             WHERE status != 'resolved' AND status != 'draft' AND airs_at <= ?1
             ORDER BY airs_at ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now.to_rfc3339(), limit as i64], map_round)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(EngineError::from)
    }

    // ===== Prediction writes =====

    /// Upsert a user's pick for a question. Last write wins while the
    /// round is open; rejected once the round's lock time has passed,
    /// whatever the stored status says. Both modifiers set is an engine
    /// invariant violation, not just a UI concern.
    pub async fn upsert_prediction(
        &self,
        user_id: &str,
        question_id: i64,
        option: &str,
        is_risk: bool,
        used_joker: bool,
        now: DateTime<Utc>,
    ) -> Result<Prediction, EngineError> {
        if is_risk && used_joker {
            return Err(EngineError::invalid(
                "risk and joker modifiers are mutually exclusive",
            ));
        }
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(EngineError::invalid("user_id required"));
        }

        let conn = self.conn.lock().await;
        let question = fetch_question(&conn, question_id)?
            .ok_or_else(|| EngineError::not_found(format!("question {question_id}")))?;
        let round = fetch_round(&conn, question.round_id)?
            .ok_or_else(|| EngineError::not_found(format!("round {}", question.round_id)))?;

        match round.status {
            RoundStatus::Open => {}
            RoundStatus::Draft => {
                return Err(EngineError::invalid("round is not open for predictions"))
            }
            RoundStatus::Locked | RoundStatus::Resolved => {
                return Err(EngineError::invalid("round is locked"))
            }
        }
        // Lock time is authoritative even before the status flip lands.
        if now >= round.locks_at {
            return Err(EngineError::invalid("round lock time has passed"));
        }
        if !question.options.contains(option) {
            return Err(EngineError::invalid(format!(
                "option {option:?} is not one of the question's options"
            )));
        }

        conn.execute(
            "INSERT INTO predictions (user_id, question_id, option, is_risk, used_joker, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id, question_id) DO UPDATE SET
                option = excluded.option,
                is_risk = excluded.is_risk,
                used_joker = excluded.used_joker,
                updated_at = excluded.updated_at",
            params![
                user_id,
                question_id,
                option,
                is_risk as i64,
                used_joker as i64,
                now.to_rfc3339()
            ],
        )?;

        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, question_id, option, is_risk, used_joker,
                    is_correct, points_awarded, updated_at
             FROM predictions WHERE user_id = ?1 AND question_id = ?2",
        )?;
        stmt.query_row(params![user_id, question_id], map_prediction)
            .map_err(EngineError::from)
    }

    // ===== Live bet writes (pool engine calls these) =====

    pub async fn create_live_bet(
        &self,
        prompt: &str,
        category: &str,
        options: &[LiveBetOption],
        opens_at: DateTime<Utc>,
        locks_at: DateTime<Utc>,
        multiplier: f64,
    ) -> Result<i64, EngineError> {
        let labels = OptionList::new(options.iter().map(|o| o.label.clone()).collect())?;
        debug_assert_eq!(labels.len(), options.len());
        if !(multiplier.is_finite() && multiplier > 0.0) {
            return Err(EngineError::invalid("multiplier must be positive"));
        }
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO live_bets
                (prompt, category, options, status, opens_at, locks_at, total_pool, multiplier)
             VALUES (?1, ?2, ?3, 'open', ?4, ?5, 0, ?6)",
            params![
                prompt,
                category,
                serde_json::to_string(options)?,
                opens_at.to_rfc3339(),
                locks_at.to_rfc3339(),
                multiplier
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_live_bet(&self, bet_id: i64) -> Result<Option<LiveBet>, EngineError> {
        let conn = self.conn.lock().await;
        fetch_live_bet(&conn, bet_id)
    }

    pub async fn live_bet_placements(
        &self,
        bet_id: i64,
    ) -> Result<Vec<LiveBetPlacement>, EngineError> {
        let conn = self.conn.lock().await;
        fetch_placements(&conn, bet_id)
    }

    pub async fn live_bet_payouts(&self, bet_id: i64) -> Result<Vec<LivePayout>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, bet_id, user_id, kind, amount, created_at
             FROM live_bet_payouts WHERE bet_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![bet_id], |row| {
            let created: String = row.get(5)?;
            Ok(LivePayout {
                id: row.get(0)?,
                bet_id: row.get(1)?,
                user_id: row.get(2)?,
                kind: row.get(3)?,
                amount: row.get(4)?,
                created_at: parse_ts(&created, 5)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(EngineError::from)
    }
}

// ===== Schema =====

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS seasons (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            show_name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rounds (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            season_id INTEGER NOT NULL,
            number INTEGER NOT NULL,
            airs_at TEXT NOT NULL,
            locks_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'draft',
            FOREIGN KEY (season_id) REFERENCES seasons(id)
        );
        CREATE INDEX IF NOT EXISTS idx_rounds_status_airs ON rounds(status, airs_at);

        CREATE TABLE IF NOT EXISTS questions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            round_id INTEGER NOT NULL,
            prompt TEXT NOT NULL,
            kind TEXT NOT NULL,
            odds INTEGER NOT NULL,
            options TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            correct_option TEXT,
            FOREIGN KEY (round_id) REFERENCES rounds(id)
        );
        CREATE INDEX IF NOT EXISTS idx_questions_round ON questions(round_id);

        CREATE TABLE IF NOT EXISTS predictions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            question_id INTEGER NOT NULL,
            option TEXT NOT NULL,
            is_risk INTEGER NOT NULL DEFAULT 0,
            used_joker INTEGER NOT NULL DEFAULT 0,
            is_correct INTEGER,
            points_awarded INTEGER,
            updated_at TEXT NOT NULL,
            UNIQUE (user_id, question_id),
            FOREIGN KEY (question_id) REFERENCES questions(id)
        );
        CREATE INDEX IF NOT EXISTS idx_predictions_question ON predictions(question_id);

        CREATE TABLE IF NOT EXISTS user_season_stats (
            user_id TEXT NOT NULL,
            season_id INTEGER NOT NULL,
            points INTEGER NOT NULL DEFAULT 0,
            correct_count INTEGER NOT NULL DEFAULT 0,
            total_count INTEGER NOT NULL DEFAULT 0,
            current_streak INTEGER NOT NULL DEFAULT 0,
            longest_streak INTEGER NOT NULL DEFAULT 0,
            risk_bets_won INTEGER NOT NULL DEFAULT 0,
            risk_bets_total INTEGER NOT NULL DEFAULT 0,
            jokers_used INTEGER NOT NULL DEFAULT 0,
            jokers_remaining INTEGER NOT NULL DEFAULT 0,
            win_rate REAL NOT NULL DEFAULT 0.0,
            PRIMARY KEY (user_id, season_id)
        );

        CREATE TABLE IF NOT EXISTS score_events (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            round_id INTEGER NOT NULL,
            points INTEGER NOT NULL,
            reason TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_score_events_round ON score_events(round_id);
        CREATE INDEX IF NOT EXISTS idx_score_events_user ON score_events(user_id);

        CREATE TABLE IF NOT EXISTS badges (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            threshold INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS user_badges (
            user_id TEXT NOT NULL,
            badge_id INTEGER NOT NULL,
            season_id INTEGER NOT NULL,
            progress INTEGER NOT NULL,
            granted_at TEXT NOT NULL,
            PRIMARY KEY (user_id, badge_id, season_id),
            FOREIGN KEY (badge_id) REFERENCES badges(id)
        );

        CREATE TABLE IF NOT EXISTS live_bets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            prompt TEXT NOT NULL,
            category TEXT NOT NULL,
            options TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            opens_at TEXT NOT NULL,
            locks_at TEXT NOT NULL,
            correct_option TEXT,
            total_pool INTEGER NOT NULL DEFAULT 0,
            multiplier REAL NOT NULL DEFAULT 1.0
        );
        CREATE INDEX IF NOT EXISTS idx_live_bets_status ON live_bets(status);

        CREATE TABLE IF NOT EXISTS live_bet_placements (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            bet_id INTEGER NOT NULL,
            user_id TEXT NOT NULL,
            option TEXT NOT NULL,
            stake INTEGER NOT NULL,
            placed_at TEXT NOT NULL,
            UNIQUE (bet_id, user_id),
            FOREIGN KEY (bet_id) REFERENCES live_bets(id)
        );
        CREATE INDEX IF NOT EXISTS idx_placements_bet ON live_bet_placements(bet_id);

        CREATE TABLE IF NOT EXISTS live_bet_payouts (
            id TEXT PRIMARY KEY,
            bet_id INTEGER NOT NULL,
            user_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            amount INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_payouts_bet ON live_bet_payouts(bet_id);",
    )
    .context("initialize schema")?;
    Ok(())
}

// ===== Row mapping =====

fn parse_ts(raw: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn bad_column(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        msg.into(),
    )
}

fn map_round(row: &rusqlite::Row<'_>) -> rusqlite::Result<Round> {
    let airs: String = row.get(3)?;
    let locks: String = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(Round {
        id: row.get(0)?,
        season_id: row.get(1)?,
        number: row.get(2)?,
        airs_at: parse_ts(&airs, 3)?,
        locks_at: parse_ts(&locks, 4)?,
        status: RoundStatus::parse(&status)
            .ok_or_else(|| bad_column(5, format!("unknown round status {status:?}")))?,
    })
}

fn map_question(row: &rusqlite::Row<'_>) -> rusqlite::Result<Question> {
    let options_raw: String = row.get(5)?;
    let status: String = row.get(6)?;
    let options = OptionList::from_json(&options_raw)
        .map_err(|e| bad_column(5, format!("corrupt option list: {e}")))?;
    Ok(Question {
        id: row.get(0)?,
        round_id: row.get(1)?,
        prompt: row.get(2)?,
        kind: row.get(3)?,
        odds: row.get(4)?,
        options,
        status: QuestionStatus::parse(&status)
            .ok_or_else(|| bad_column(6, format!("unknown question status {status:?}")))?,
        correct_option: row.get(7)?,
    })
}

fn map_prediction(row: &rusqlite::Row<'_>) -> rusqlite::Result<Prediction> {
    let updated: String = row.get(8)?;
    Ok(Prediction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        question_id: row.get(2)?,
        option: row.get(3)?,
        is_risk: row.get::<_, i64>(4)? != 0,
        used_joker: row.get::<_, i64>(5)? != 0,
        is_correct: row.get::<_, Option<i64>>(6)?.map(|v| v != 0),
        points_awarded: row.get(7)?,
        updated_at: parse_ts(&updated, 8)?,
    })
}

fn map_stats(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserSeasonStats> {
    Ok(UserSeasonStats {
        user_id: row.get(0)?,
        season_id: row.get(1)?,
        points: row.get(2)?,
        correct_count: row.get(3)?,
        total_count: row.get(4)?,
        current_streak: row.get(5)?,
        longest_streak: row.get(6)?,
        risk_bets_won: row.get(7)?,
        risk_bets_total: row.get(8)?,
        jokers_used: row.get(9)?,
        jokers_remaining: row.get(10)?,
        win_rate: row.get(11)?,
    })
}

fn map_score_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScoreEvent> {
    let reason: String = row.get(4)?;
    let created: String = row.get(5)?;
    Ok(ScoreEvent {
        id: row.get(0)?,
        user_id: row.get(1)?,
        round_id: row.get(2)?,
        points: row.get(3)?,
        reason: ScoreReason::parse(&reason)
            .ok_or_else(|| bad_column(4, format!("unknown score reason {reason:?}")))?,
        created_at: parse_ts(&created, 5)?,
    })
}

fn map_live_bet(row: &rusqlite::Row<'_>) -> rusqlite::Result<LiveBet> {
    let options_raw: String = row.get(3)?;
    let status: String = row.get(4)?;
    let opens: String = row.get(5)?;
    let locks: String = row.get(6)?;
    let options: Vec<LiveBetOption> = serde_json::from_str(&options_raw)
        .map_err(|e| bad_column(3, format!("corrupt live bet options: {e}")))?;
    Ok(LiveBet {
        id: row.get(0)?,
        prompt: row.get(1)?,
        category: row.get(2)?,
        options,
        status: LiveBetStatus::parse(&status)
            .ok_or_else(|| bad_column(4, format!("unknown live bet status {status:?}")))?,
        opens_at: parse_ts(&opens, 5)?,
        locks_at: parse_ts(&locks, 6)?,
        correct_option: row.get(7)?,
        total_pool: row.get(8)?,
        multiplier: row.get(9)?,
    })
}

fn map_placement(row: &rusqlite::Row<'_>) -> rusqlite::Result<LiveBetPlacement> {
    let placed: String = row.get(5)?;
    Ok(LiveBetPlacement {
        id: row.get(0)?,
        bet_id: row.get(1)?,
        user_id: row.get(2)?,
        option: row.get(3)?,
        stake: row.get(4)?,
        placed_at: parse_ts(&placed, 5)?,
    })
}

// ===== Connection-level helpers (shared with transactions) =====

pub(crate) fn fetch_round(conn: &Connection, round_id: i64) -> Result<Option<Round>, EngineError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, season_id, number, airs_at, locks_at, status FROM rounds WHERE id = ?1",
    )?;
    stmt.query_row(params![round_id], map_round)
        .optional()
        .map_err(EngineError::from)
}

pub(crate) fn fetch_question(
    conn: &Connection,
    question_id: i64,
) -> Result<Option<Question>, EngineError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, round_id, prompt, kind, odds, options, status, correct_option
         FROM questions WHERE id = ?1",
    )?;
    stmt.query_row(params![question_id], map_question)
        .optional()
        .map_err(EngineError::from)
}

pub(crate) fn fetch_questions(
    conn: &Connection,
    round_id: i64,
) -> Result<Vec<Question>, EngineError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, round_id, prompt, kind, odds, options, status, correct_option
         FROM questions WHERE round_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![round_id], map_question)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(EngineError::from)
}

/// All predictions touching any question in the resolved set.
pub(crate) fn fetch_predictions_for_round(
    conn: &Connection,
    round_id: i64,
) -> Result<Vec<Prediction>, EngineError> {
    let mut stmt = conn.prepare_cached(
        "SELECT p.id, p.user_id, p.question_id, p.option, p.is_risk, p.used_joker,
                p.is_correct, p.points_awarded, p.updated_at
         FROM predictions p
         JOIN questions q ON q.id = p.question_id
         WHERE q.round_id = ?1
         ORDER BY p.user_id ASC, p.question_id ASC",
    )?;
    let rows = stmt.query_map(params![round_id], map_prediction)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(EngineError::from)
}

pub(crate) fn mark_question_resolved(
    conn: &Connection,
    question_id: i64,
    correct_option: &str,
) -> Result<(), EngineError> {
    conn.execute(
        "UPDATE questions SET correct_option = ?1, status = 'resolved' WHERE id = ?2",
        params![correct_option, question_id],
    )?;
    Ok(())
}

pub(crate) fn save_prediction_outcome(
    conn: &Connection,
    prediction_id: i64,
    is_correct: bool,
    points_awarded: i64,
) -> Result<(), EngineError> {
    conn.execute(
        "UPDATE predictions SET is_correct = ?1, points_awarded = ?2 WHERE id = ?3",
        params![is_correct as i64, points_awarded, prediction_id],
    )?;
    Ok(())
}

pub(crate) fn fetch_stats(
    conn: &Connection,
    user_id: &str,
    season_id: i64,
) -> Result<Option<UserSeasonStats>, EngineError> {
    let mut stmt = conn.prepare_cached(
        "SELECT user_id, season_id, points, correct_count, total_count, current_streak,
                longest_streak, risk_bets_won, risk_bets_total, jokers_used,
                jokers_remaining, win_rate
         FROM user_season_stats WHERE user_id = ?1 AND season_id = ?2",
    )?;
    stmt.query_row(params![user_id, season_id], map_stats)
        .optional()
        .map_err(EngineError::from)
}

pub(crate) fn fetch_season_stats(
    conn: &Connection,
    season_id: i64,
) -> Result<Vec<UserSeasonStats>, EngineError> {
    let mut stmt = conn.prepare_cached(
        "SELECT user_id, season_id, points, correct_count, total_count, current_streak,
                longest_streak, risk_bets_won, risk_bets_total, jokers_used,
                jokers_remaining, win_rate
         FROM user_season_stats WHERE season_id = ?1 ORDER BY user_id ASC",
    )?;
    let rows = stmt.query_map(params![season_id], map_stats)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(EngineError::from)
}

pub(crate) fn save_stats(conn: &Connection, stats: &UserSeasonStats) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO user_season_stats
            (user_id, season_id, points, correct_count, total_count, current_streak,
             longest_streak, risk_bets_won, risk_bets_total, jokers_used,
             jokers_remaining, win_rate)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(user_id, season_id) DO UPDATE SET
            points = excluded.points,
            correct_count = excluded.correct_count,
            total_count = excluded.total_count,
            current_streak = excluded.current_streak,
            longest_streak = excluded.longest_streak,
            risk_bets_won = excluded.risk_bets_won,
            risk_bets_total = excluded.risk_bets_total,
            jokers_used = excluded.jokers_used,
            jokers_remaining = excluded.jokers_remaining,
            win_rate = excluded.win_rate",
        params![
            stats.user_id,
            stats.season_id,
            stats.points,
            stats.correct_count,
            stats.total_count,
            stats.current_streak,
            stats.longest_streak,
            stats.risk_bets_won,
            stats.risk_bets_total,
            stats.jokers_used,
            stats.jokers_remaining,
            stats.win_rate
        ],
    )?;
    Ok(())
}

pub(crate) fn append_score_event(
    conn: &Connection,
    event: &ScoreEvent,
) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO score_events (id, user_id, round_id, points, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.id,
            event.user_id,
            event.round_id,
            event.points,
            event.reason.as_str(),
            event.created_at.to_rfc3339()
        ],
    )?;
    Ok(())
}

pub(crate) fn set_round_resolved(conn: &Connection, round_id: i64) -> Result<(), EngineError> {
    conn.execute(
        "UPDATE rounds SET status = 'resolved' WHERE id = ?1",
        params![round_id],
    )?;
    Ok(())
}

pub(crate) fn fetch_badge_rules(conn: &Connection) -> Result<Vec<BadgeRule>, EngineError> {
    let mut stmt =
        conn.prepare_cached("SELECT id, name, kind, threshold FROM badges ORDER BY id ASC")?;
    let rows = stmt.query_map([], |row| {
        let kind: String = row.get(2)?;
        Ok(BadgeRule {
            id: row.get(0)?,
            name: row.get(1)?,
            kind: BadgeKind::parse(&kind)
                .ok_or_else(|| bad_column(2, format!("unknown badge kind {kind:?}")))?,
            threshold: row.get(3)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(EngineError::from)
}

/// Grant (or refresh progress on) a badge. Never deletes.
pub(crate) fn upsert_user_badge(
    conn: &Connection,
    user_id: &str,
    badge_id: i64,
    season_id: i64,
    progress: i64,
    granted_at: DateTime<Utc>,
) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO user_badges (user_id, badge_id, season_id, progress, granted_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(user_id, badge_id, season_id) DO UPDATE SET
            progress = MAX(user_badges.progress, excluded.progress)",
        params![user_id, badge_id, season_id, progress, granted_at.to_rfc3339()],
    )?;
    Ok(())
}

// ===== Live bet helpers =====

pub(crate) fn fetch_live_bet(conn: &Connection, bet_id: i64) -> Result<Option<LiveBet>, EngineError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, prompt, category, options, status, opens_at, locks_at,
                correct_option, total_pool, multiplier
         FROM live_bets WHERE id = ?1",
    )?;
    stmt.query_row(params![bet_id], map_live_bet)
        .optional()
        .map_err(EngineError::from)
}

pub(crate) fn fetch_placements(
    conn: &Connection,
    bet_id: i64,
) -> Result<Vec<LiveBetPlacement>, EngineError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, bet_id, user_id, option, stake, placed_at
         FROM live_bet_placements WHERE bet_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![bet_id], map_placement)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(EngineError::from)
}

pub(crate) fn fetch_open_live_bets(conn: &Connection) -> Result<Vec<LiveBet>, EngineError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, prompt, category, options, status, opens_at, locks_at,
                correct_option, total_pool, multiplier
         FROM live_bets WHERE status = 'open' OR status = 'locked' ORDER BY id ASC",
    )?;
    let rows = stmt.query_map([], map_live_bet)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(EngineError::from)
}

pub(crate) fn insert_placement(
    conn: &Connection,
    bet_id: i64,
    user_id: &str,
    option: &str,
    stake: i64,
    placed_at: DateTime<Utc>,
) -> Result<i64, EngineError> {
    conn.execute(
        "INSERT INTO live_bet_placements (bet_id, user_id, option, stake, placed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![bet_id, user_id, option, stake, placed_at.to_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn bump_live_pool(
    conn: &Connection,
    bet_id: i64,
    stake: i64,
) -> Result<(), EngineError> {
    conn.execute(
        "UPDATE live_bets SET total_pool = total_pool + ?1 WHERE id = ?2",
        params![stake, bet_id],
    )?;
    Ok(())
}

pub(crate) fn set_live_bet_status(
    conn: &Connection,
    bet_id: i64,
    status: LiveBetStatus,
) -> Result<(), EngineError> {
    conn.execute(
        "UPDATE live_bets SET status = ?1 WHERE id = ?2",
        params![status.as_str(), bet_id],
    )?;
    Ok(())
}

pub(crate) fn set_live_bet_resolved(
    conn: &Connection,
    bet_id: i64,
    correct_option: &str,
) -> Result<(), EngineError> {
    conn.execute(
        "UPDATE live_bets SET status = 'resolved', correct_option = ?1 WHERE id = ?2",
        params![correct_option, bet_id],
    )?;
    Ok(())
}

pub(crate) fn insert_live_payout(
    conn: &Connection,
    id: &str,
    bet_id: i64,
    user_id: &str,
    kind: &str,
    amount: i64,
    created_at: DateTime<Utc>,
) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO live_bet_payouts (id, bet_id, user_id, kind, amount, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, bet_id, user_id, kind, amount, created_at.to_rfc3339()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn seed_open_round(db: &GameDb) -> (i64, i64, i64) {
        let season = db.create_season("Season 12", "Outback Island").await.unwrap();
        let now = Utc::now();
        let round = db
            .create_round(season, 1, now + Duration::hours(1), now + Duration::hours(2))
            .await
            .unwrap();
        db.advance_round_status(round, RoundStatus::Open)
            .await
            .unwrap();
        let options =
            OptionList::new(vec!["Alice".into(), "Bob".into(), "Cara".into()]).unwrap();
        let question = db
            .create_question(round, "Who wins immunity?", "immunity", 150, &options)
            .await
            .unwrap();
        (season, round, question)
    }

    #[tokio::test]
    async fn prediction_upsert_is_last_write_wins() {
        let db = GameDb::in_memory().unwrap();
        let (_, _, question) = seed_open_round(&db).await;
        let now = Utc::now();

        db.upsert_prediction("u1", question, "Alice", false, false, now)
            .await
            .unwrap();
        let p = db
            .upsert_prediction("u1", question, "Bob", true, false, now)
            .await
            .unwrap();
        assert_eq!(p.option, "Bob");
        assert!(p.is_risk);

        // Still exactly one row.
        let stored = db.get_prediction("u1", question).await.unwrap().unwrap();
        assert_eq!(stored.id, p.id);
    }

    #[tokio::test]
    async fn prediction_rejects_both_modifiers() {
        let db = GameDb::in_memory().unwrap();
        let (_, _, question) = seed_open_round(&db).await;
        let err = db
            .upsert_prediction("u1", question, "Alice", true, true, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[tokio::test]
    async fn prediction_rejected_after_lock_time_even_while_status_open() {
        let db = GameDb::in_memory().unwrap();
        let (_, round, question) = seed_open_round(&db).await;
        let round = db.get_round(round).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Open);

        let after_lock = round.locks_at + Duration::seconds(1);
        let err = db
            .upsert_prediction("u1", question, "Alice", false, false, after_lock)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[tokio::test]
    async fn prediction_rejects_unknown_option() {
        let db = GameDb::in_memory().unwrap();
        let (_, _, question) = seed_open_round(&db).await;
        let err = db
            .upsert_prediction("u1", question, "Zed", false, false, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[tokio::test]
    async fn round_status_cannot_move_backward_or_jump_to_resolved() {
        let db = GameDb::in_memory().unwrap();
        let (_, round, _) = seed_open_round(&db).await;

        let back = db.advance_round_status(round, RoundStatus::Draft).await;
        assert!(back.is_err());

        let skip = db.advance_round_status(round, RoundStatus::Resolved).await;
        assert!(skip.is_err());

        db.advance_round_status(round, RoundStatus::Locked)
            .await
            .unwrap();
        let r = db.get_round(round).await.unwrap().unwrap();
        assert_eq!(r.status, RoundStatus::Locked);
    }

    #[tokio::test]
    async fn db_survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.db");
        let path = path.to_str().unwrap();

        {
            let db = GameDb::new(path).unwrap();
            db.create_season("S1", "Show").await.unwrap();
        }
        let db = GameDb::new(path).unwrap();
        let conn = db.lock().await;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM seasons", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
