//! Automated verification agent.
//!
//! Walks a bounded batch of aired-but-unresolved rounds, gathers web
//! evidence, extracts candidate answers with confidences, and either
//! auto-applies the whole answer set through the resolution transaction
//! or surfaces everything for human review. Resolution is all-or-nothing
//! per round: one low-confidence question holds the entire round back.

pub mod extract;
pub mod search;

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::models::{Answer, Caller, Question, Round, RoundStatus, Season};
use crate::resolution::ResolutionEngine;
use crate::store::GameDb;

pub use extract::{AnswerExtractor, ExtractedAnswer, OpenRouterExtractor, QuestionSpec};
pub use search::{EvidenceSearch, SearchResponse, SearchResult, TavilyClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    AutoResolved,
    NeedsReview,
    NoResults,
    AlreadyResolved,
    Error,
}

impl VerifyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyStatus::AutoResolved => "auto_resolved",
            VerifyStatus::NeedsReview => "needs_review",
            VerifyStatus::NoResults => "no_results",
            VerifyStatus::AlreadyResolved => "already_resolved",
            VerifyStatus::Error => "error",
        }
    }
}

/// Per-question verdict surfaced to human reviewers.
#[derive(Debug, Clone, Serialize)]
pub struct QuestionVerification {
    pub question_id: i64,
    /// Canonical option label after repair, if any label matched.
    pub correct_option: Option<String>,
    pub confidence: f64,
    pub source: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    pub round_id: i64,
    pub status: VerifyStatus,
    pub per_question: Vec<QuestionVerification>,
    pub average_confidence: f64,
    pub message: String,
}

impl VerifyResult {
    fn plain(round_id: i64, status: VerifyStatus, message: impl Into<String>) -> Self {
        Self {
            round_id,
            status,
            per_question: Vec::new(),
            average_confidence: 0.0,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VerifyConfig {
    /// Every per-question confidence must reach this before auto-apply.
    pub auto_resolve_threshold: f64,
    /// Rounds examined per invocation.
    pub batch_size: usize,
    pub max_search_results: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            auto_resolve_threshold: 0.9,
            batch_size: 5,
            max_search_results: 5,
        }
    }
}

pub struct VerificationAgent {
    db: GameDb,
    resolution: Arc<ResolutionEngine>,
    search: Arc<dyn EvidenceSearch>,
    extractor: Arc<dyn AnswerExtractor>,
    cfg: VerifyConfig,
}

impl VerificationAgent {
    pub fn new(
        db: GameDb,
        resolution: Arc<ResolutionEngine>,
        search: Arc<dyn EvidenceSearch>,
        extractor: Arc<dyn AnswerExtractor>,
        cfg: VerifyConfig,
    ) -> Self {
        Self {
            db,
            resolution,
            search,
            extractor,
            cfg,
        }
    }

    /// Process a bounded batch of candidate rounds. Collaborator failures
    /// downgrade the affected round to `error` without touching siblings.
    pub async fn verify_pending(&self) -> Result<Vec<VerifyResult>, EngineError> {
        let rounds = self
            .db
            .unresolved_aired_rounds(chrono::Utc::now(), self.cfg.batch_size)
            .await?;
        if rounds.is_empty() {
            info!("verification batch: nothing to verify");
            return Ok(Vec::new());
        }

        let mut results = Vec::with_capacity(rounds.len());
        for round in rounds {
            let round_id = round.id;
            let result = match self.verify_round(&round).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(round_id, error = %e, "verification failed for round");
                    VerifyResult::plain(round_id, VerifyStatus::Error, e.to_string())
                }
            };
            results.push(result);
        }
        Ok(results)
    }

    async fn verify_round(&self, round: &Round) -> Result<VerifyResult, EngineError> {
        if round.status == RoundStatus::Resolved {
            return Ok(VerifyResult::plain(
                round.id,
                VerifyStatus::AlreadyResolved,
                "round already resolved",
            ));
        }

        let questions = self.db.round_questions(round.id).await?;
        let unresolved: Vec<&Question> = questions
            .iter()
            .filter(|q| q.correct_option.is_none())
            .collect();
        if unresolved.is_empty() {
            return Err(EngineError::invalid(format!(
                "round {} has no unresolved questions",
                round.id
            )));
        }

        let season = self
            .db
            .get_season(round.season_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("season {}", round.season_id)))?;

        let queries = build_queries(&season, round, &unresolved);
        let evidence = self
            .search
            .search(&queries, self.cfg.max_search_results)
            .await?;
        if evidence.results.is_empty() {
            return Ok(VerifyResult::plain(
                round.id,
                VerifyStatus::NoResults,
                "evidence search returned no results",
            ));
        }

        let specs: Vec<QuestionSpec> = unresolved
            .iter()
            .map(|q| QuestionSpec {
                id: q.id,
                prompt: q.prompt.clone(),
                options: q.options.as_slice().to_vec(),
            })
            .collect();
        let show_context = format!(
            "{} {}, episode {} (aired {})",
            season.show_name,
            season.name,
            round.number,
            round.airs_at.format("%Y-%m-%d")
        );
        let extracted = self
            .extractor
            .extract(&flatten_evidence(&evidence), &specs, &show_context)
            .await?;

        let per_question = repair_answers(&unresolved, &extracted);
        let average_confidence = if per_question.is_empty() {
            0.0
        } else {
            per_question.iter().map(|q| q.confidence).sum::<f64>() / per_question.len() as f64
        };

        let all_confident = per_question
            .iter()
            .all(|q| q.confidence >= self.cfg.auto_resolve_threshold && q.correct_option.is_some());

        if !all_confident {
            return Ok(VerifyResult {
                round_id: round.id,
                status: VerifyStatus::NeedsReview,
                message: format!(
                    "{} of {} questions below threshold {}",
                    per_question
                        .iter()
                        .filter(|q| q.confidence < self.cfg.auto_resolve_threshold
                            || q.correct_option.is_none())
                        .count(),
                    per_question.len(),
                    self.cfg.auto_resolve_threshold
                ),
                per_question,
                average_confidence,
            });
        }

        // Every answer cleared the gate; apply the full set atomically.
        let answers: Vec<Answer> = per_question
            .iter()
            .map(|q| Answer {
                question_id: q.question_id,
                correct_option: q.correct_option.clone().unwrap_or_default(),
            })
            .collect();
        let outcome = self
            .resolution
            .resolve(&Caller::Agent, round.id, &answers)
            .await?;

        let status = if outcome.already_resolved {
            VerifyStatus::AlreadyResolved
        } else {
            VerifyStatus::AutoResolved
        };
        info!(
            round_id = round.id,
            status = status.as_str(),
            average_confidence,
            "verification outcome"
        );
        Ok(VerifyResult {
            round_id: round.id,
            status,
            per_question,
            average_confidence,
            message: outcome.message,
        })
    }
}

/// One query per unresolved question plus a general episode-results query.
fn build_queries(season: &Season, round: &Round, unresolved: &[&Question]) -> Vec<String> {
    let mut queries: Vec<String> = unresolved
        .iter()
        .map(|q| {
            format!(
                "{} {} episode {} {}",
                season.show_name, season.name, round.number, q.prompt
            )
        })
        .collect();
    queries.push(format!(
        "{} {} episode {} results recap spoilers",
        season.show_name, season.name, round.number
    ));
    queries
}

fn flatten_evidence(evidence: &SearchResponse) -> String {
    let mut text = String::new();
    if let Some(answer) = &evidence.answer {
        text.push_str("Summary answer: ");
        text.push_str(answer);
        text.push_str("\n\n");
    }
    for result in &evidence.results {
        text.push_str(&format!(
            "## {} ({})\n{}\n\n",
            result.title, result.url, result.content
        ));
    }
    text
}

/// Match every extracted answer back onto the question's canonical option
/// labels. No exact match falls back to case-insensitive repair; no match
/// at all forces the confidence to zero. A question the extractor skipped
/// also scores zero.
fn repair_answers(
    unresolved: &[&Question],
    extracted: &[ExtractedAnswer],
) -> Vec<QuestionVerification> {
    unresolved
        .iter()
        .map(|question| {
            let found = extracted.iter().find(|e| e.question_id == question.id);
            match found {
                None => QuestionVerification {
                    question_id: question.id,
                    correct_option: None,
                    confidence: 0.0,
                    source: String::new(),
                    reasoning: "no answer extracted".to_string(),
                },
                Some(answer) => {
                    let canonical = if question.options.contains(&answer.correct_option) {
                        Some(answer.correct_option.clone())
                    } else {
                        question
                            .options
                            .match_ignore_case(&answer.correct_option)
                            .map(|s| s.to_string())
                    };
                    let confidence = if canonical.is_some() {
                        answer.confidence.clamp(0.0, 1.0)
                    } else {
                        0.0
                    };
                    QuestionVerification {
                        question_id: question.id,
                        correct_option: canonical,
                        confidence,
                        source: answer.source.clone(),
                        reasoning: answer.reasoning.clone(),
                    }
                }
            }
        })
        .collect()
}
