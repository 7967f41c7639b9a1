// prompt-evolution-rs/src/lib.rs
// Feedback-driven prompt evolution.
//
// Transcripts are analysed into ranked recommendations, a completion model
// rewrites the active prompt into a candidate, the evaluation gate decides,
// and the orchestrator promotes or rejects while recording each run in the
// ledger.

pub mod analyzer;
pub mod error;
pub mod gate;
pub mod orchestrator;
pub mod synthesizer;
pub mod transcripts;

#[cfg(test)]
mod tests;

pub use analyzer::FeedbackAnalyzer;
pub use error::PipelineError;
pub use gate::EvaluationGate;
pub use orchestrator::{CancelToken, PipelineOrchestrator, RunRequest, RunTicket};
pub use synthesizer::{CandidateSynthesizer, Draft, SynthesisParseError};
pub use transcripts::{NdjsonTranscriptSource, SourceError, Transcript, TranscriptSource};

/// Result type used by this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
