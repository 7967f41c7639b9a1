// prompt-evolution-rs/src/error.rs

use completion_client::CompletionError;
use prompt_store::StoreError;
use run_ledger::LedgerError;
use shared_types::{ErrorClass, MalformedWindow, StorageError};

use crate::synthesizer::SynthesisParseError;
use crate::transcripts::SourceError;

/// Top-level error type for the pipeline stages.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    MalformedWindow(#[from] MalformedWindow),

    #[error("no active prompt version; bootstrap the store first")]
    NotBootstrapped,

    #[error("no stored feedback summary for window {0}")]
    MissingFeedback(String),

    #[error("transcript source error: {0}")]
    Source(#[from] SourceError),

    #[error("completion error: {0}")]
    Completion(#[from] CompletionError),

    #[error("synthesis parse error: {0}")]
    SynthesisParse(#[from] SynthesisParseError),

    #[error("version store error: {0}")]
    Store(#[from] StoreError),

    #[error("run ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid analyzer rule: {0}")]
    Rule(#[from] regex::Error),
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::InvalidRequest(_)
            | PipelineError::MalformedWindow(_)
            | PipelineError::NotBootstrapped
            | PipelineError::MissingFeedback(_)
            | PipelineError::Rule(_) => ErrorClass::Input,
            PipelineError::Source(e) => e.class(),
            PipelineError::Completion(e) => e.class(),
            PipelineError::SynthesisParse(_) => ErrorClass::Parse,
            PipelineError::Store(e) => e.class(),
            PipelineError::Ledger(e) => e.class(),
            PipelineError::Storage(e) => e.class(),
        }
    }
}

/// Raise an operator alert for errors that indicate broken invariants.
pub(crate) fn alert_if_consistency(err: &PipelineError, run_id: &str) {
    if err.class().is_alerting() {
        tracing::error!(alert = true, run_id = %run_id, error = %err, "consistency violation in pipeline run");
        metrics::increment_counter!("prompt_evolution_consistency_alerts_total", "source" => "pipeline");
    }
}
