// shared-types-rs/src/model.rs
// Records exchanged between the version store, the pipeline stages and the run ledger.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, DurationRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorClass;

// ---------------------------------------------------------------------------
// Prompt versions
// ---------------------------------------------------------------------------

/// `v{major}.{minor}` identifier of a prompt version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionId {
    pub major: u32,
    pub minor: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version id '{0}', expected v<major>.<minor>")]
pub struct InvalidVersionId(pub String);

impl VersionId {
    pub const INITIAL: VersionId = VersionId { major: 1, minor: 0 };

    pub fn next_minor(self) -> Self {
        Self {
            major: self.major,
            minor: self.minor + 1,
        }
    }
}

impl FromStr for VersionId {
    type Err = InvalidVersionId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidVersionId(s.to_string());
        let body = s.strip_prefix('v').ok_or_else(invalid)?;
        let (major, minor) = body.split_once('.').ok_or_else(invalid)?;
        let digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
        if !digits(major) || !digits(minor) {
            return Err(invalid());
        }
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Candidate,
    Active,
    Rejected,
    Superseded,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Candidate => "candidate",
            VersionStatus::Active => "active",
            VersionStatus::Rejected => "rejected",
            VersionStatus::Superseded => "superseded",
        }
    }

    /// Allowed edges: candidate -> active -> superseded, candidate -> rejected.
    pub fn can_transition_to(&self, next: VersionStatus) -> bool {
        matches!(
            (self, next),
            (VersionStatus::Candidate, VersionStatus::Active)
                | (VersionStatus::Candidate, VersionStatus::Rejected)
                | (VersionStatus::Active, VersionStatus::Superseded)
        )
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// The instruction text and tool declarations that make up a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptContent {
    pub system_instructions: String,
    #[serde(default)]
    pub tools: Vec<ToolDeclaration>,
}

impl PromptContent {
    pub fn new(system_instructions: impl Into<String>) -> Self {
        Self {
            system_instructions: system_instructions.into(),
            tools: Vec::new(),
        }
    }

    pub fn with_tool(mut self, tool: ToolDeclaration) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    /// Line-oriented rendering used for diffs and length checks.
    ///
    /// Instruction lines come first, then one line per tool and one more
    /// for its parameter schema when present.
    pub fn render_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .system_instructions
            .lines()
            .map(str::to_string)
            .collect();
        for tool in &self.tools {
            lines.push(format!("tool {}: {}", tool.name, tool.description));
            if !tool.parameters.is_null() {
                lines.push(format!("tool {} parameters: {}", tool.name, tool.parameters));
            }
        }
        lines
    }

    pub fn render(&self) -> String {
        self.render_lines().join("\n")
    }

    /// Rendered length in characters.
    pub fn rendered_len(&self) -> usize {
        self.render().chars().count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptVersion {
    pub version_id: String,
    pub sequence: u64,
    pub content: PromptContent,
    pub status: VersionStatus,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub rationale: String,
    pub lineage: Option<String>,
    #[serde(default)]
    pub status_changed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status_reason: Option<String>,
}

impl PromptVersion {
    pub fn id(&self) -> Result<VersionId, InvalidVersionId> {
        self.version_id.parse()
    }

    pub fn is_active(&self) -> bool {
        self.status == VersionStatus::Active
    }
}

// ---------------------------------------------------------------------------
// Feedback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed window: start {start} is not before end {end}")]
pub struct MalformedWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Half-open interval `[start, end)` of transcript start times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, MalformedWindow> {
        let window = Self { start, end };
        window.validate()?;
        Ok(window)
    }

    pub fn validate(&self) -> Result<(), MalformedWindow> {
        if self.start >= self.end {
            return Err(MalformedWindow {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    /// The full UTC calendar day before `now`.
    pub fn previous_day(now: DateTime<Utc>) -> Self {
        let day = chrono::Duration::days(1);
        let end = now.duration_trunc(day).unwrap_or(now);
        Self {
            start: end - day,
            end,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// `20240105T000000Z_20240106T000000Z`, safe for storage key names.
    pub fn key(&self) -> String {
        const FMT: &str = "%Y%m%dT%H%M%SZ";
        format!("{}_{}", self.start.format(FMT), self.end.format(FMT))
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} .. {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn from_severity(severity: f64) -> Self {
        if severity >= 3.0 {
            Priority::High
        } else if severity >= 2.0 {
            Priority::Medium
        } else {
            Priority::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub category: String,
    pub description: String,
    pub frequency: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendedChange {
    pub id: String,
    pub category: String,
    pub description: String,
    pub priority: Priority,
    pub impact: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallMetrics {
    pub call_id: String,
    pub success: bool,
    pub duration_secs: f64,
    /// Friction categories observed in this call, in rule order.
    pub friction: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisMetrics {
    pub success_rate: f64,
    pub average_duration_secs: f64,
    pub friction_rate: f64,
    pub long_call_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSummary {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub calls_analyzed: usize,
    pub issues: Vec<Issue>,
    pub recommended_changes: Vec<RecommendedChange>,
    pub metrics: AnalysisMetrics,
    pub calls: Vec<CallMetrics>,
    pub generated_at: DateTime<Utc>,
}

impl FeedbackSummary {
    pub fn empty(window: TimeWindow, generated_at: DateTime<Utc>) -> Self {
        Self {
            window_start: window.start,
            window_end: window.end,
            calls_analyzed: 0,
            issues: Vec::new(),
            recommended_changes: Vec::new(),
            metrics: AnalysisMetrics::default(),
            calls: Vec::new(),
            generated_at,
        }
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow {
            start: self.window_start,
            end: self.window_end,
        }
    }

    pub fn has_recommendations(&self) -> bool {
        !self.recommended_changes.is_empty()
    }
}

/// Analysis results for one window, attributed to the version that was
/// active when the window was analysed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowPerformance {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub calls_analyzed: usize,
    pub metrics: AnalysisMetrics,
    pub recorded_at: DateTime<Utc>,
}

impl WindowPerformance {
    pub fn from_summary(summary: &FeedbackSummary, recorded_at: DateTime<Utc>) -> Self {
        Self {
            window_start: summary.window_start,
            window_end: summary.window_end,
            calls_analyzed: summary.calls_analyzed,
            metrics: summary.metrics.clone(),
            recorded_at,
        }
    }
}

/// Running performance record of one prompt version, keyed by window so
/// re-analysing a window replaces its entry instead of counting it twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionPerformance {
    pub version_id: String,
    pub windows: BTreeMap<String, WindowPerformance>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceTotals {
    pub windows: usize,
    pub calls_analyzed: usize,
    /// Call-weighted averages over every recorded window.
    pub metrics: AnalysisMetrics,
}

impl VersionPerformance {
    pub fn new(version_id: impl Into<String>) -> Self {
        Self {
            version_id: version_id.into(),
            windows: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, window: TimeWindow, entry: WindowPerformance) {
        self.windows.insert(window.key(), entry);
    }

    pub fn totals(&self) -> PerformanceTotals {
        let calls: usize = self.windows.values().map(|w| w.calls_analyzed).sum();
        let weighted = |pick: fn(&AnalysisMetrics) -> f64| {
            if calls == 0 {
                return 0.0;
            }
            self.windows
                .values()
                .map(|w| pick(&w.metrics) * w.calls_analyzed as f64)
                .sum::<f64>()
                / calls as f64
        };
        PerformanceTotals {
            windows: self.windows.len(),
            calls_analyzed: calls,
            metrics: AnalysisMetrics {
                success_rate: weighted(|m| m.success_rate),
                average_duration_secs: weighted(|m| m.average_duration_secs),
                friction_rate: weighted(|m| m.friction_rate),
                long_call_rate: weighted(|m| m.long_call_rate),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub score: f64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationDecision {
    pub approved: bool,
    pub reasons: Vec<String>,
    pub metrics: BTreeMap<String, f64>,
    pub checks: Vec<CheckResult>,
}

impl EvaluationDecision {
    pub fn from_checks(checks: Vec<CheckResult>) -> Self {
        let approved = checks.iter().all(|c| c.passed);
        let reasons = if approved {
            checks
                .iter()
                .map(|c| format!("{}: passed", c.name))
                .collect()
        } else {
            checks
                .iter()
                .filter(|c| !c.passed)
                .map(|c| format!("{}: {}", c.name, c.message))
                .collect()
        };
        let metrics = checks.iter().map(|c| (c.name.clone(), c.score)).collect();
        Self {
            approved,
            reasons,
            metrics,
            checks,
        }
    }

    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}

// ---------------------------------------------------------------------------
// Pipeline runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Full,
    AnalysisOnly,
    SimulationOnly,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Full => "full",
            RunMode::AnalysisOnly => "analysis_only",
            RunMode::SimulationOnly => "simulation_only",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analysis,
    Synthesis,
    Evaluation,
    Promotion,
    Cancellation,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Analysis => "analysis",
            Stage::Synthesis => "synthesis",
            Stage::Evaluation => "evaluation",
            Stage::Promotion => "promotion",
            Stage::Cancellation => "cancellation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub success: bool,
    pub detail: String,
    #[serde(default)]
    pub error_class: Option<ErrorClass>,
    pub recorded_at: DateTime<Utc>,
}

impl StageRecord {
    pub fn ok(stage: Stage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            success: true,
            detail: detail.into(),
            error_class: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(stage: Stage, class: ErrorClass, detail: impl Into<String>) -> Self {
        Self {
            stage,
            success: false,
            detail: detail.into(),
            error_class: Some(class),
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Rejected,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Rejected => "rejected",
            RunOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub trigger: RunTrigger,
    pub mode: RunMode,
    pub triggered_by: String,
    pub window: Option<TimeWindow>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub stage_results: Vec<StageRecord>,
    pub outcome: Option<RunOutcome>,
    pub candidate_version: Option<String>,
    pub decision: Option<EvaluationDecision>,
    pub ledger_seq: Option<u64>,
    pub prev_hash: Option<String>,
    pub hash: Option<String>,
}

impl PipelineRun {
    pub fn is_closed(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageRecord> {
        self.stage_results.iter().find(|r| r.stage == stage)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            trigger: self.trigger,
            mode: self.mode,
            triggered_by: self.triggered_by.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            outcome: self.outcome,
            candidate_version: self.candidate_version.clone(),
            last_detail: self.stage_results.last().map(|r| r.detail.clone()),
        }
    }
}

/// Condensed view of a run for history listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub trigger: RunTrigger,
    pub mode: RunMode,
    pub triggered_by: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
    pub candidate_version: Option<String>,
    pub last_detail: Option<String>,
}
