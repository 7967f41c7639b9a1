// prompt-evolution-rs/src/transcripts.rs
// Source of recorded call transcripts.
//
// NdjsonTranscriptSource reads every `*.ndjson` file in a directory, one
// transcript per line. Unparsable lines are logged and skipped.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_types::{ErrorClass, TimeWindow};
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub call_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    /// Explicit call outcome, when the call layer recorded one.
    #[serde(default)]
    pub success: Option<bool>,
    pub content: String,
}

impl Transcript {
    /// Explicit duration, else the span between start and end, else zero.
    pub fn duration_secs(&self) -> f64 {
        if let Some(secs) = self.duration_secs {
            return secs.max(0.0);
        }
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transcript fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("transcript source unavailable: {0}")]
    Unavailable(String),
}

impl SourceError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::ExternalService
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TranscriptSource: Send + Sync {
    /// Transcripts whose `started_at` falls inside `window`.
    async fn fetch_transcripts(&self, window: TimeWindow) -> Result<Vec<Transcript>, SourceError>;
}

pub struct NdjsonTranscriptSource {
    dir: PathBuf,
}

impl NdjsonTranscriptSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_file(path: &Path, window: &TimeWindow, out: &mut Vec<Transcript>) -> Result<(), SourceError> {
        let raw = fs::read_to_string(path).await?;
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Transcript>(line) {
                Ok(t) if window.contains(t.started_at) => out.push(t),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(
                        file = %path.display(),
                        line = idx + 1,
                        error = %err,
                        "failed to parse transcript line; skipping"
                    );
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TranscriptSource for NdjsonTranscriptSource {
    async fn fetch_transcripts(&self, window: TimeWindow) -> Result<Vec<Transcript>, SourceError> {
        if !fs::try_exists(self.dir()).await? {
            tracing::warn!(dir = %self.dir().display(), "transcript directory does not exist");
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let mut entries = fs::read_dir(self.dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("ndjson") {
                files.push(path);
            }
        }
        files.sort();

        let mut out = Vec::new();
        for path in &files {
            Self::read_file(path, &window, &mut out).await?;
        }
        tracing::debug!(files = files.len(), transcripts = out.len(), window = %window, "transcripts fetched");
        Ok(out)
    }
}
