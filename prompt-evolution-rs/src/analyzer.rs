// prompt-evolution-rs/src/analyzer.rs
// Feedback analysis over a window of call transcripts.
//
// Per call: success (explicit outcome, else success markers), duration, and
// the friction categories whose keywords appear on word boundaries. Categories
// are aggregated into issues and turned into recommendations ranked by
// frequency x severity. Equal scores keep first-observed order, and ids are
// derived from the category, so re-analysing a window reproduces the same
// recommendation list.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use shared_types::config::{AnalyzerConfig, FrictionRule};
use shared_types::storage::{self, KvStore};
use shared_types::{
    AnalysisMetrics, CallMetrics, FeedbackSummary, Issue, Priority, RecommendedChange, TimeWindow,
};
use tracing::instrument;

use crate::error::PipelineError;
use crate::transcripts::{SourceError, Transcript, TranscriptSource};

pub use shared_types::config::{LONG_CALL, UNSUCCESSFUL_CALL};

const FEEDBACK_PREFIX: &str = "feedback/";

pub fn feedback_key(window: &TimeWindow) -> String {
    format!("{FEEDBACK_PREFIX}{}", window.key())
}

struct CompiledRule {
    rule: FrictionRule,
    pattern: Regex,
}

/// Category bookkeeping in first-observed order.
struct CategoryTally {
    description: String,
    severity: f64,
    recommendation: String,
    frequency: usize,
}

pub struct FeedbackAnalyzer {
    source: Arc<dyn TranscriptSource>,
    kv: Arc<dyn KvStore>,
    config: AnalyzerConfig,
    rules: Vec<CompiledRule>,
    fetch_timeout: Duration,
}

impl FeedbackAnalyzer {
    pub fn new(
        source: Arc<dyn TranscriptSource>,
        kv: Arc<dyn KvStore>,
        config: AnalyzerConfig,
        fetch_timeout: Duration,
    ) -> Result<Self, PipelineError> {
        let rules = config
            .friction_rules
            .iter()
            .map(|rule| {
                let alternatives: Vec<String> =
                    rule.keywords.iter().map(|k| regex::escape(k.trim())).collect();
                // \W boundaries instead of \b so keywords ending in punctuation still match.
                let pattern = Regex::new(&format!(
                    r"(?i)(?:^|\W)(?:{})(?:\W|$)",
                    alternatives.join("|")
                ))?;
                Ok(CompiledRule {
                    rule: rule.clone(),
                    pattern,
                })
            })
            .collect::<Result<Vec<_>, PipelineError>>()?;

        Ok(Self {
            source,
            kv,
            config,
            rules,
            fetch_timeout,
        })
    }

    fn call_metrics(&self, transcript: &Transcript) -> CallMetrics {
        let lowered = transcript.content.to_lowercase();
        let success = transcript.success.unwrap_or_else(|| {
            self.config
                .success_markers
                .iter()
                .any(|m| lowered.contains(&m.to_lowercase()))
        });
        let friction = self
            .rules
            .iter()
            .filter(|r| r.pattern.is_match(&transcript.content))
            .map(|r| r.rule.category.clone())
            .collect();

        CallMetrics {
            call_id: transcript.call_id.clone(),
            success,
            duration_secs: transcript.duration_secs(),
            friction,
        }
    }

    /// Categories observed in one call, in rule order followed by the
    /// built-in categories.
    fn categories_for<'a>(&'a self, call: &'a CallMetrics) -> Vec<(&'a str, &'a str, f64, &'a str)> {
        let mut out: Vec<(&str, &str, f64, &str)> = Vec::new();
        for category in &call.friction {
            if let Some(r) = self.rules.iter().find(|r| &r.rule.category == category) {
                out.push((
                    &r.rule.category,
                    &r.rule.description,
                    r.rule.severity,
                    &r.rule.recommendation,
                ));
            }
        }
        if !call.success {
            out.push((
                UNSUCCESSFUL_CALL,
                "Call ended without a successful outcome",
                self.config.unsuccessful_severity,
                &self.config.unsuccessful_recommendation,
            ));
        }
        if call.duration_secs > self.config.long_call_secs {
            out.push((
                LONG_CALL,
                "Call exceeded the long-call threshold",
                self.config.long_call_severity,
                &self.config.long_call_recommendation,
            ));
        }
        out
    }

    fn summarize(&self, window: TimeWindow, mut transcripts: Vec<Transcript>) -> FeedbackSummary {
        transcripts.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.call_id.cmp(&b.call_id))
        });
        let calls: Vec<CallMetrics> = transcripts.iter().map(|t| self.call_metrics(t)).collect();

        let mut order: Vec<String> = Vec::new();
        let mut tallies: HashMap<String, CategoryTally> = HashMap::new();
        for call in &calls {
            for (category, description, severity, recommendation) in self.categories_for(call) {
                tallies
                    .entry(category.to_string())
                    .or_insert_with(|| {
                        order.push(category.to_string());
                        CategoryTally {
                            description: description.to_string(),
                            severity,
                            recommendation: recommendation.to_string(),
                            frequency: 0,
                        }
                    })
                    .frequency += 1;
            }
        }

        let ranked: Vec<(&String, &CategoryTally)> = order
            .iter()
            .filter_map(|c| tallies.get(c).map(|t| (c, t)))
            .collect();

        let mut issues: Vec<Issue> = ranked
            .iter()
            .map(|(category, tally)| Issue {
                category: category.to_string(),
                description: tally.description.clone(),
                frequency: tally.frequency,
            })
            .collect();
        // Stable sorts: ties keep first-observed order.
        issues.sort_by(|a, b| b.frequency.cmp(&a.frequency));

        let mut recommended_changes: Vec<RecommendedChange> = ranked
            .iter()
            .map(|(category, tally)| RecommendedChange {
                id: format!("rec-{category}"),
                category: category.to_string(),
                description: tally.recommendation.clone(),
                priority: Priority::from_severity(tally.severity),
                impact: tally.frequency as f64 * tally.severity,
            })
            .collect();
        recommended_changes.sort_by(|a, b| b.impact.total_cmp(&a.impact));

        let n = calls.len() as f64;
        let rate = |count: usize| if n > 0.0 { count as f64 / n } else { 0.0 };
        let metrics = AnalysisMetrics {
            success_rate: rate(calls.iter().filter(|c| c.success).count()),
            average_duration_secs: if n > 0.0 {
                calls.iter().map(|c| c.duration_secs).sum::<f64>() / n
            } else {
                0.0
            },
            friction_rate: rate(calls.iter().filter(|c| !c.friction.is_empty()).count()),
            long_call_rate: rate(
                calls
                    .iter()
                    .filter(|c| c.duration_secs > self.config.long_call_secs)
                    .count(),
            ),
        };

        FeedbackSummary {
            window_start: window.start,
            window_end: window.end,
            calls_analyzed: calls.len(),
            issues,
            recommended_changes,
            metrics,
            calls,
            generated_at: Utc::now(),
        }
    }

    /// Analyse every transcript in `window` and store the summary,
    /// replacing any earlier summary for the same window.
    #[instrument(name = "feedback_analysis", skip(self), fields(window = %window))]
    pub async fn analyze(&self, window: TimeWindow) -> Result<FeedbackSummary, PipelineError> {
        window.validate()?;

        let transcripts = tokio::time::timeout(self.fetch_timeout, self.source.fetch_transcripts(window))
            .await
            .map_err(|_| SourceError::Timeout(self.fetch_timeout))??;

        let summary = if transcripts.is_empty() {
            tracing::warn!("no transcripts in window; producing empty summary");
            FeedbackSummary::empty(window, Utc::now())
        } else {
            self.summarize(window, transcripts)
        };

        storage::put_json(self.kv.as_ref(), &feedback_key(&window), &summary).await?;

        metrics::increment_counter!("feedback_analyses_total");
        tracing::info!(
            calls_analyzed = summary.calls_analyzed,
            issues = summary.issues.len(),
            recommendations = summary.recommended_changes.len(),
            "feedback analysis complete"
        );
        Ok(summary)
    }

    /// The stored summary for `window`, if it was analysed before.
    pub async fn load(&self, window: TimeWindow) -> Result<Option<FeedbackSummary>, PipelineError> {
        window.validate()?;
        Ok(storage::get_json(self.kv.as_ref(), &feedback_key(&window)).await?)
    }
}
