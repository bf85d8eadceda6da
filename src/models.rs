use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Lifecycle of a votable round. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Draft,
    Open,
    Locked,
    Resolved,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::Draft => "draft",
            RoundStatus::Open => "open",
            RoundStatus::Locked => "locked",
            RoundStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(RoundStatus::Draft),
            "open" => Some(RoundStatus::Open),
            "locked" => Some(RoundStatus::Locked),
            "resolved" => Some(RoundStatus::Resolved),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            RoundStatus::Draft => 0,
            RoundStatus::Open => 1,
            RoundStatus::Locked => 2,
            RoundStatus::Resolved => 3,
        }
    }

    /// Status only ever advances.
    pub fn can_advance_to(&self, next: RoundStatus) -> bool {
        next.rank() > self.rank()
    }
}

/// Question status tracks the round's in ordinary use but is stored
/// independently so a single question carries its own resolved marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    Open,
    Locked,
    Resolved,
}

impl QuestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionStatus::Open => "open",
            QuestionStatus::Locked => "locked",
            QuestionStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(QuestionStatus::Open),
            "locked" => Some(QuestionStatus::Locked),
            "resolved" => Some(QuestionStatus::Resolved),
            _ => None,
        }
    }
}

/// Ordered, unique set of option labels for a question or live bet.
/// Validated once at the write boundary; stored as a JSON array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionList(Vec<String>);

impl OptionList {
    pub const MIN_OPTIONS: usize = 2;
    pub const MAX_OPTIONS: usize = 8;

    pub fn new(labels: Vec<String>) -> Result<Self, EngineError> {
        let labels: Vec<String> = labels.into_iter().map(|l| l.trim().to_string()).collect();
        if labels.len() < Self::MIN_OPTIONS || labels.len() > Self::MAX_OPTIONS {
            return Err(EngineError::InvalidState(format!(
                "option list must have {}..={} labels, got {}",
                Self::MIN_OPTIONS,
                Self::MAX_OPTIONS,
                labels.len()
            )));
        }
        for (i, label) in labels.iter().enumerate() {
            if label.is_empty() {
                return Err(EngineError::InvalidState(
                    "option labels must be non-empty".to_string(),
                ));
            }
            if labels[..i].iter().any(|prev| prev == label) {
                return Err(EngineError::InvalidState(format!(
                    "duplicate option label: {label}"
                )));
            }
        }
        Ok(Self(labels))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.0.iter().any(|l| l == label)
    }

    /// Case-insensitive repair lookup: returns the canonical label.
    pub fn match_ignore_case(&self, label: &str) -> Option<&str> {
        let needle = label.trim();
        self.0
            .iter()
            .find(|l| l.eq_ignore_ascii_case(needle))
            .map(|l| l.as_str())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }

    pub fn from_json(raw: &str) -> Result<Self, EngineError> {
        let labels: Vec<String> = serde_json::from_str(raw)?;
        Self::new(labels)
    }
}

/// A season of the underlying show; the aggregation scope for stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Season {
    pub id: i64,
    pub name: String,
    pub show_name: String,
}

/// A schedulable unit ("episode") owning an ordered set of questions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub id: i64,
    pub season_id: i64,
    pub number: i64,
    pub airs_at: DateTime<Utc>,
    pub locks_at: DateTime<Utc>,
    pub status: RoundStatus,
}

/// A single predictable prompt with fixed options and American payout odds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,
    pub round_id: i64,
    pub prompt: String,
    pub kind: String,
    /// Signed American odds, e.g. +150 or -120.
    pub odds: i32,
    pub options: OptionList,
    pub status: QuestionStatus,
    pub correct_option: Option<String>,
}

/// A user's pick for one question. Mutable until the round locks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: i64,
    pub user_id: String,
    pub question_id: i64,
    pub option: String,
    pub is_risk: bool,
    pub used_joker: bool,
    pub is_correct: Option<bool>,
    pub points_awarded: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

/// Cumulative per-user, per-season counters. Created lazily, mutated only
/// by the resolution transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSeasonStats {
    pub user_id: String,
    pub season_id: i64,
    pub points: i64,
    pub correct_count: i64,
    pub total_count: i64,
    pub current_streak: i64,
    pub longest_streak: i64,
    pub risk_bets_won: i64,
    pub risk_bets_total: i64,
    pub jokers_used: i64,
    pub jokers_remaining: i64,
    pub win_rate: f64,
}

impl UserSeasonStats {
    pub fn fresh(user_id: &str, season_id: i64, jokers_per_season: i64) -> Self {
        Self {
            user_id: user_id.to_string(),
            season_id,
            points: 0,
            correct_count: 0,
            total_count: 0,
            current_streak: 0,
            longest_streak: 0,
            risk_bets_won: 0,
            risk_bets_total: 0,
            jokers_used: 0,
            jokers_remaining: jokers_per_season,
            win_rate: 0.0,
        }
    }

    pub fn recompute_win_rate(&mut self) {
        self.win_rate = if self.total_count > 0 {
            self.correct_count as f64 / self.total_count as f64
        } else {
            0.0
        };
    }
}

/// Reason tag on a score-event ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreReason {
    QuestionCorrect,
    JokerSave,
    StreakBonus,
}

impl ScoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreReason::QuestionCorrect => "question_correct",
            ScoreReason::JokerSave => "joker_save",
            ScoreReason::StreakBonus => "streak_bonus",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "question_correct" => Some(ScoreReason::QuestionCorrect),
            "joker_save" => Some(ScoreReason::JokerSave),
            "streak_bonus" => Some(ScoreReason::StreakBonus),
            _ => None,
        }
    }
}

/// Immutable append-only ledger entry, one per scoring action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreEvent {
    pub id: String,
    pub user_id: String,
    pub round_id: i64,
    pub points: i64,
    pub reason: ScoreReason,
    pub created_at: DateTime<Utc>,
}

/// Which cumulative counter a badge rule reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadgeKind {
    Streak,
    Correct,
    RiskWins,
    Points,
}

impl BadgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BadgeKind::Streak => "streak",
            BadgeKind::Correct => "correct",
            BadgeKind::RiskWins => "risk_wins",
            BadgeKind::Points => "points",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "streak" => Some(BadgeKind::Streak),
            "correct" => Some(BadgeKind::Correct),
            "risk_wins" => Some(BadgeKind::RiskWins),
            "points" => Some(BadgeKind::Points),
            _ => None,
        }
    }
}

/// Declarative threshold rule over one stat counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadgeRule {
    pub id: i64,
    pub name: String,
    pub kind: BadgeKind,
    pub threshold: i64,
}

/// Per-user qualification record. Upserted once the rule is met; never
/// deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBadge {
    pub user_id: String,
    pub badge_id: i64,
    pub season_id: i64,
    pub progress: i64,
    pub granted_at: DateTime<Utc>,
}

/// Live bet lifecycle. `Ended` is the emergency-stop terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveBetStatus {
    Open,
    Locked,
    Resolved,
    Ended,
}

impl LiveBetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LiveBetStatus::Open => "open",
            LiveBetStatus::Locked => "locked",
            LiveBetStatus::Resolved => "resolved",
            LiveBetStatus::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(LiveBetStatus::Open),
            "locked" => Some(LiveBetStatus::Locked),
            "resolved" => Some(LiveBetStatus::Resolved),
            "ended" => Some(LiveBetStatus::Ended),
            _ => None,
        }
    }
}

/// One outcome of a live bet with its fixed American odds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveBetOption {
    pub label: String,
    pub odds: i32,
}

/// A short-horizon market accepting stakes during a live event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveBet {
    pub id: i64,
    pub prompt: String,
    pub category: String,
    pub options: Vec<LiveBetOption>,
    pub status: LiveBetStatus,
    pub opens_at: DateTime<Utc>,
    pub locks_at: DateTime<Utc>,
    pub correct_option: Option<String>,
    pub total_pool: i64,
    pub multiplier: f64,
}

impl LiveBet {
    pub fn option_odds(&self, label: &str) -> Option<i32> {
        self.options
            .iter()
            .find(|o| o.label == label)
            .map(|o| o.odds)
    }
}

/// One user's stake on one live bet. At most one per (user, bet).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveBetPlacement {
    pub id: i64,
    pub bet_id: i64,
    pub user_id: String,
    pub option: String,
    pub stake: i64,
    pub placed_at: DateTime<Utc>,
}

/// Audit ledger row for live-bet settlements and refunds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivePayout {
    pub id: String,
    pub bet_id: i64,
    pub user_id: String,
    /// "payout" or "refund".
    pub kind: String,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// A correct answer for one question, as supplied to `resolve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub question_id: i64,
    pub correct_option: String,
}

/// Capability of the caller invoking an engine entrypoint. Authentication
/// happens upstream; the engine only checks capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Admin,
    /// The trusted automated verification agent identity.
    Agent,
    User(String),
}

impl Caller {
    pub fn can_resolve(&self) -> bool {
        matches!(self, Caller::Admin | Caller::Agent)
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Caller::Admin)
    }
}

/// Application configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub admin_token: Option<String>,
    pub auto_resolve_threshold: f64,
    pub verify_batch_size: usize,
    pub evidence_max_results: usize,
    pub streak_bonus_cadence: i64,
    pub streak_bonus_points: i64,
    pub jokers_per_season: i64,
    pub live_default_multiplier: f64,
    pub tavily_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,
    pub openrouter_model: String,
    pub search_timeout_secs: u64,
    pub llm_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./realitybet.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let admin_token = std::env::var("ADMIN_TOKEN")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let auto_resolve_threshold = env_f64("AUTO_RESOLVE_THRESHOLD", 0.9).clamp(0.0, 1.0);
        let verify_batch_size = env_usize("VERIFY_BATCH_SIZE", 5).max(1);
        let evidence_max_results = env_usize("EVIDENCE_MAX_RESULTS", 5).max(1);
        let streak_bonus_cadence = env_i64("STREAK_BONUS_CADENCE", 3).max(1);
        let streak_bonus_points = env_i64("STREAK_BONUS_POINTS", 50).max(0);
        let jokers_per_season = env_i64("JOKERS_PER_SEASON", 3).max(0);
        let live_default_multiplier = env_f64("LIVE_DEFAULT_MULTIPLIER", 1.0).max(0.0);

        let tavily_api_key = std::env::var("TAVILY_API_KEY")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let openrouter_api_key = std::env::var("OPENROUTER_API_KEY")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let openrouter_model = std::env::var("OPENROUTER_MODEL")
            .unwrap_or_else(|_| "openai/gpt-4o-mini".to_string());

        let search_timeout_secs = env_u64("SEARCH_TIMEOUT_SECS", 20).max(1);
        let llm_timeout_secs = env_u64("LLM_TIMEOUT_SECS", 30).max(1);

        Ok(Self {
            database_path,
            port,
            admin_token,
            auto_resolve_threshold,
            verify_batch_size,
            evidence_max_results,
            streak_bonus_cadence,
            streak_bonus_points,
            jokers_per_season,
            live_default_multiplier,
            tavily_api_key,
            openrouter_api_key,
            openrouter_model,
            search_timeout_secs,
            llm_timeout_secs,
        })
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|v: &f64| v.is_finite())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
