//! Answer extraction collaborator.
//!
//! Feeds evidence text plus the exact question list to a language model
//! and parses a strict KEY=VALUE block per question. The model is told
//! to answer with one of the supplied option labels verbatim; the agent
//! does a case-insensitive repair on top and zeroes the confidence when
//! no label matches.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;

use crate::error::EngineError;

/// What the extractor gets to see about a question.
#[derive(Debug, Clone, Serialize)]
pub struct QuestionSpec {
    pub id: i64,
    pub prompt: String,
    pub options: Vec<String>,
}

/// One extracted candidate answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedAnswer {
    pub question_id: i64,
    pub correct_option: String,
    /// In [0, 1].
    pub confidence: f64,
    pub source: String,
    pub reasoning: String,
}

#[async_trait]
pub trait AnswerExtractor: Send + Sync {
    async fn extract(
        &self,
        evidence: &str,
        questions: &[QuestionSpec],
        show_context: &str,
    ) -> Result<Vec<ExtractedAnswer>, EngineError>;
}

const SYSTEM_PROMPT: &str = "You verify reality-TV episode outcomes from web evidence. \
For every question you are given, emit exactly one block of lines in this format:\n\
QUESTION_ID=<id>\nANSWER=<one of the listed options, verbatim>\nCONFIDENCE=<0.0-1.0>\n\
SOURCE=<url or short citation>\nREASONING=<one sentence>\n---\n\
Use only the supplied evidence. If the evidence does not determine an answer, \
still emit the block with your best option and a low CONFIDENCE. \
Never invent options that are not in the list. No prose outside the blocks.";

pub struct OpenRouterExtractor {
    http: reqwest::Client,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl OpenRouterExtractor {
    pub fn new(http: reqwest::Client, api_key: String, model: String, timeout: Duration) -> Self {
        Self {
            http,
            api_key,
            model,
            timeout,
        }
    }

    fn build_user_prompt(
        evidence: &str,
        questions: &[QuestionSpec],
        show_context: &str,
    ) -> String {
        let mut prompt = String::new();
        let _ = writeln!(prompt, "Show context: {show_context}");
        let _ = writeln!(prompt, "\nQuestions:");
        for q in questions {
            let _ = writeln!(
                prompt,
                "- QUESTION_ID={} prompt={:?} options=[{}]",
                q.id,
                q.prompt,
                q.options.join(", ")
            );
        }
        let _ = writeln!(prompt, "\nEvidence:\n{evidence}");
        prompt
    }

    async fn chat_completion(&self, user: &str) -> Result<String, EngineError> {
        let req = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: Some(0.0),
            max_tokens: Some(1200),
        };

        let resp = self
            .http
            .post("https://openrouter.ai/api/v1/chat/completions")
            .timeout(self.timeout)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&req)
            .send()
            .await
            .map_err(|e| EngineError::upstream(format!("openrouter request: {e}")))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(400).collect();
            return Err(EngineError::upstream(format!(
                "openrouter {}: {snippet}",
                status.as_u16()
            )));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| EngineError::upstream(format!("openrouter json parse: {e}")))?;
        Ok(parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl AnswerExtractor for OpenRouterExtractor {
    async fn extract(
        &self,
        evidence: &str,
        questions: &[QuestionSpec],
        show_context: &str,
    ) -> Result<Vec<ExtractedAnswer>, EngineError> {
        let prompt = Self::build_user_prompt(evidence, questions, show_context);
        let content = self.chat_completion(&prompt).await?;
        parse_extraction_blocks(&content)
    }
}

/// Parse `---`-separated KEY=VALUE blocks. Lines without `=` are skipped;
/// unknown keys reject the whole output so format drift is caught loudly.
pub fn parse_extraction_blocks(raw: &str) -> Result<Vec<ExtractedAnswer>, EngineError> {
    let mut out = Vec::new();
    for block in raw.split("---") {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }

        let mut question_id: Option<i64> = None;
        let mut answer: Option<String> = None;
        let mut confidence: Option<f64> = None;
        let mut source: Option<String> = None;
        let mut reasoning: Option<String> = None;

        for line in block.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((k, v)) = line.split_once('=') else {
                continue;
            };
            let key = k.trim().to_ascii_uppercase();
            let val = v.trim();
            match key.as_str() {
                "QUESTION_ID" => question_id = val.parse::<i64>().ok(),
                "ANSWER" => {
                    if !val.is_empty() {
                        answer = Some(val.chars().take(128).collect());
                    }
                }
                "CONFIDENCE" => {
                    confidence = val
                        .parse::<f64>()
                        .ok()
                        .filter(|x| x.is_finite())
                        .map(|x| x.clamp(0.0, 1.0));
                }
                "SOURCE" => source = Some(val.chars().take(256).collect()),
                "REASONING" => reasoning = Some(val.chars().take(512).collect()),
                _ => {
                    return Err(EngineError::upstream(format!(
                        "unknown key in extraction block: {key}"
                    )))
                }
            }
        }

        let question_id =
            question_id.ok_or_else(|| EngineError::upstream("missing QUESTION_ID"))?;
        let correct_option = answer.ok_or_else(|| EngineError::upstream("missing ANSWER"))?;
        out.push(ExtractedAnswer {
            question_id,
            correct_option,
            confidence: confidence.unwrap_or(0.0),
            source: source.unwrap_or_default(),
            reasoning: reasoning.unwrap_or_default(),
        });
    }
    Ok(out)
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageOut>,
}

#[derive(Debug, Deserialize)]
struct ChatMessageOut {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_two_blocks() {
        let raw = "QUESTION_ID=12\nANSWER=Alice\nCONFIDENCE=0.95\nSOURCE=https://ew.com/recap\n\
                   REASONING=Recap names Alice as immunity winner\n---\n\
                   QUESTION_ID=13\nANSWER=Bob\nCONFIDENCE=0.6\nSOURCE=https://reddit.com\n\
                   REASONING=Thread is split\n---";
        let parsed = parse_extraction_blocks(raw).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].question_id, 12);
        assert_eq!(parsed[0].correct_option, "Alice");
        assert_eq!(parsed[0].confidence, 0.95);
        assert_eq!(parsed[1].confidence, 0.6);
    }

    #[test]
    fn confidence_is_clamped_and_defaults_to_zero() {
        let raw = "QUESTION_ID=1\nANSWER=Yes\nCONFIDENCE=7.5\n---\nQUESTION_ID=2\nANSWER=No\n---";
        let parsed = parse_extraction_blocks(raw).unwrap();
        assert_eq!(parsed[0].confidence, 1.0);
        assert_eq!(parsed[1].confidence, 0.0);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let raw = "QUESTION_ID=1\nANSWER=Yes\nWAT=nope\n---";
        assert!(parse_extraction_blocks(raw).is_err());
    }

    #[test]
    fn missing_fields_are_rejected() {
        assert!(parse_extraction_blocks("ANSWER=Yes\nCONFIDENCE=0.9\n---").is_err());
        assert!(parse_extraction_blocks("QUESTION_ID=1\nCONFIDENCE=0.9\n---").is_err());
    }

    #[test]
    fn prose_lines_without_equals_are_skipped() {
        let raw = "Here are the results:\nQUESTION_ID=1\nANSWER=Yes\nCONFIDENCE=0.9\n---";
        let parsed = parse_extraction_blocks(raw).unwrap();
        assert_eq!(parsed.len(), 1);
    }
}
