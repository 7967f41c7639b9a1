// prompt-evolution-rs/src/synthesizer.rs
// Candidate synthesis: one completion request per candidate, parsed back
// into a PromptContent document.

use std::sync::Arc;
use std::time::Duration;

use completion_client::TextCompletion;
use prompt_store::VersionStore;
use serde::Serialize;
use shared_types::config::SynthesizerConfig;
use shared_types::{FeedbackSummary, PromptContent, PromptVersion, RecommendedChange};
use tracing::instrument;

use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SynthesisParseError {
    #[error("response contains no JSON object")]
    NoJsonObject,

    #[error("response contains {0} top-level JSON objects, expected exactly one")]
    MultipleJsonObjects(usize),

    #[error("response ends inside an unterminated JSON object")]
    Unterminated,

    #[error("JSON object is not a prompt document: {0}")]
    InvalidContent(String),
}

/// A synthesized prompt that has not been written to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub content: PromptContent,
    pub applied: Vec<String>,
    pub rationale: String,
}

/// Locate the single top-level `{...}` block in `text`.
///
/// Braces inside JSON string literals are ignored. Text outside blocks is
/// treated as prose and not scanned for strings.
pub fn extract_json_block(text: &str) -> Result<&str, SynthesisParseError> {
    let mut blocks: Vec<(usize, usize)> = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if depth > 0 && in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = idx;
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    blocks.push((start, idx + 1));
                }
            }
            _ => {}
        }
    }

    if depth > 0 {
        return Err(SynthesisParseError::Unterminated);
    }
    match blocks.as_slice() {
        [] => Err(SynthesisParseError::NoJsonObject),
        [(s, e)] => Ok(&text[*s..*e]),
        many => Err(SynthesisParseError::MultipleJsonObjects(many.len())),
    }
}

pub fn parse_prompt_content(text: &str) -> Result<PromptContent, SynthesisParseError> {
    let block = extract_json_block(text)?;
    let content: PromptContent = serde_json::from_str(block)
        .map_err(|e| SynthesisParseError::InvalidContent(e.to_string()))?;
    if content.system_instructions.trim().is_empty() {
        return Err(SynthesisParseError::InvalidContent(
            "system_instructions is empty".to_string(),
        ));
    }
    Ok(content)
}

#[derive(Serialize)]
struct ImprovementView<'a> {
    id: &'a str,
    priority: &'a shared_types::Priority,
    description: &'a str,
}

pub fn build_synthesis_request(
    active: &PromptContent,
    changes: &[RecommendedChange],
) -> Result<String, PipelineError> {
    let current = serde_json::to_string_pretty(active)
        .map_err(|e| PipelineError::InvalidRequest(e.to_string()))?;
    let improvements: Vec<ImprovementView<'_>> = changes
        .iter()
        .map(|c| ImprovementView {
            id: &c.id,
            priority: &c.priority,
            description: &c.description,
        })
        .collect();
    let improvements = serde_json::to_string_pretty(&improvements)
        .map_err(|e| PipelineError::InvalidRequest(e.to_string()))?;

    Ok(format!(
        "You are improving the system prompt of a production conversational agent.\n\n\
         CURRENT PROMPT:\n{current}\n\n\
         RECOMMENDED IMPROVEMENTS:\n{improvements}\n\n\
         Guidelines:\n\
         - Apply every recommended improvement.\n\
         - Preserve all tool declarations and tool-calling syntax exactly.\n\
         - Keep the existing core instructions unless an improvement replaces them.\n\
         - Keep the prompt concise.\n\n\
         Return ONLY the complete JSON structure of the updated prompt, with the fields \
         \"system_instructions\" and \"tools\"."
    ))
}

pub struct CandidateSynthesizer {
    completion: Arc<dyn TextCompletion>,
    store: Arc<VersionStore>,
    config: SynthesizerConfig,
    timeout: Duration,
}

impl CandidateSynthesizer {
    pub fn new(
        completion: Arc<dyn TextCompletion>,
        store: Arc<VersionStore>,
        config: SynthesizerConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            completion,
            store,
            config,
            timeout,
        }
    }

    /// Synthesize new content without touching the store. `None` when the
    /// summary carries no recommendations.
    #[instrument(
        name = "candidate_draft",
        skip(self, active, feedback),
        fields(active.version_id = %active.version_id)
    )]
    pub async fn draft(
        &self,
        active: &PromptVersion,
        feedback: &FeedbackSummary,
    ) -> Result<Option<Draft>, PipelineError> {
        if !feedback.has_recommendations() {
            tracing::info!("no recommended changes; nothing to synthesize");
            return Ok(None);
        }

        let limit = self
            .config
            .max_recommendations
            .clamp(1, feedback.recommended_changes.len());
        let applied = &feedback.recommended_changes[..limit];
        let request = build_synthesis_request(&active.content, applied)?;

        let response =
            completion_client::complete_within(self.completion.as_ref(), &request, self.timeout)
                .await?;
        let content = parse_prompt_content(&response).map_err(|e| {
            metrics::increment_counter!("synthesis_parse_failures_total");
            e
        })?;

        let ids: Vec<String> = applied.iter().map(|c| c.id.clone()).collect();
        let rationale = format!("Applied recommendations: {}", ids.join(", "));
        Ok(Some(Draft {
            content,
            applied: ids,
            rationale,
        }))
    }

    /// Draft a candidate and store it as a child of `active`.
    pub async fn synthesize(
        &self,
        active: &PromptVersion,
        feedback: &FeedbackSummary,
    ) -> Result<Option<PromptVersion>, PipelineError> {
        let Some(draft) = self.draft(active, feedback).await? else {
            return Ok(None);
        };
        let version = self
            .store
            .create_candidate(
                draft.content,
                &active.version_id,
                &draft.rationale,
                &self.config.created_by,
            )
            .await?;
        metrics::increment_counter!("candidates_synthesized_total");
        Ok(Some(version))
    }
}
