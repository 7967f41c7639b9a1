// prompt-evolution-rs/src/orchestrator.rs
// Pipeline orchestration.
//
// A run moves through analysis, synthesis, evaluation and promotion, with one
// ledger stage record per step. Stage failures end the run as `failed` and
// are never returned to the caller; only ledger failures and invalid requests
// are. Cancellation is checked before each stage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use completion_client::TextCompletion;
use prompt_store::VersionStore;
use run_ledger::RunLedger;
use serde::{Deserialize, Serialize};
use shared_types::config::EvolutionConfig;
use shared_types::storage::KvStore;
use shared_types::{
    ErrorClass, EvaluationDecision, FeedbackSummary, PipelineRun, PromptContent, PromptVersion,
    RunMode, RunOutcome, RunTrigger, Stage, StageRecord, TimeWindow,
};
use tokio::sync::Mutex;
use tracing::instrument;

use crate::analyzer::FeedbackAnalyzer;
use crate::error::{alert_if_consistency, PipelineError};
use crate::gate::EvaluationGate;
use crate::synthesizer::CandidateSynthesizer;
use crate::transcripts::TranscriptSource;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub mode: RunMode,
    pub trigger: RunTrigger,
    pub triggered_by: String,
    #[serde(default)]
    pub window: Option<TimeWindow>,
    /// Stored version to evaluate in `simulation_only` mode.
    #[serde(default)]
    pub candidate_version: Option<String>,
}

impl RunRequest {
    pub fn new(mode: RunMode, trigger: RunTrigger, triggered_by: impl Into<String>) -> Self {
        Self {
            mode,
            trigger,
            triggered_by: triggered_by.into(),
            window: None,
            candidate_version: None,
        }
    }

    pub fn with_window(mut self, window: TimeWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_candidate(mut self, version_id: impl Into<String>) -> Self {
        self.candidate_version = Some(version_id.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A run that has been opened in the ledger but not executed yet.
#[derive(Debug, Clone)]
pub struct RunTicket {
    pub run_id: String,
    pub window: TimeWindow,
    pub request: RunRequest,
    pub cancel: CancelToken,
}

/// Early exit from a run with the outcome to close it with.
struct Halt(RunOutcome);

type StageResult<T> = Result<std::result::Result<T, Halt>, PipelineError>;

/// Unwrap a stage step, returning its outcome from the driver on a halt.
macro_rules! proceed {
    ($step:expr) => {
        match $step.await? {
            Ok(value) => value,
            Err(Halt(outcome)) => return Ok(outcome),
        }
    };
}

pub struct PipelineOrchestrator {
    analyzer: Arc<FeedbackAnalyzer>,
    synthesizer: Arc<CandidateSynthesizer>,
    gate: Arc<EvaluationGate>,
    store: Arc<VersionStore>,
    ledger: Arc<RunLedger>,
    in_flight: Mutex<HashMap<String, CancelToken>>,
}

impl PipelineOrchestrator {
    pub fn new(
        analyzer: Arc<FeedbackAnalyzer>,
        synthesizer: Arc<CandidateSynthesizer>,
        gate: Arc<EvaluationGate>,
        store: Arc<VersionStore>,
        ledger: Arc<RunLedger>,
    ) -> Self {
        Self {
            analyzer,
            synthesizer,
            gate,
            store,
            ledger,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Wire the stages from configuration over a shared key-value store.
    pub fn from_config(
        config: &EvolutionConfig,
        kv: Arc<dyn KvStore>,
        source: Arc<dyn TranscriptSource>,
        completion: Arc<dyn TextCompletion>,
    ) -> Result<Self, PipelineError> {
        let completion_timeout = Duration::from_secs(config.completion.timeout_secs);
        let store = Arc::new(VersionStore::new(kv.clone()));
        let ledger = Arc::new(RunLedger::new(kv.clone()));
        let analyzer = Arc::new(FeedbackAnalyzer::new(
            source,
            kv,
            config.analyzer.clone(),
            Duration::from_secs(config.transcripts.fetch_timeout_secs),
        )?);
        let synthesizer = Arc::new(CandidateSynthesizer::new(
            completion.clone(),
            store.clone(),
            config.synthesizer.clone(),
            completion_timeout,
        ));
        let gate = Arc::new(EvaluationGate::new(
            completion,
            config.gate.clone(),
            completion_timeout,
        ));
        Ok(Self::new(analyzer, synthesizer, gate, store, ledger))
    }

    pub fn store(&self) -> &Arc<VersionStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<RunLedger> {
        &self.ledger
    }

    pub fn analyzer(&self) -> &Arc<FeedbackAnalyzer> {
        &self.analyzer
    }

    /// Validate `request` and open its run record.
    pub async fn start(&self, request: RunRequest) -> Result<RunTicket, PipelineError> {
        let window = request
            .window
            .unwrap_or_else(|| TimeWindow::previous_day(Utc::now()));
        window.validate()?;
        if request.candidate_version.is_some() && request.mode != RunMode::SimulationOnly {
            return Err(PipelineError::InvalidRequest(format!(
                "candidate_version is only accepted in simulation_only mode, not {}",
                request.mode.as_str()
            )));
        }

        let run = self
            .ledger
            .begin(
                request.trigger,
                request.mode,
                &request.triggered_by,
                Some(window),
            )
            .await?;
        let cancel = CancelToken::default();
        self.in_flight
            .lock()
            .await
            .insert(run.run_id.clone(), cancel.clone());

        Ok(RunTicket {
            run_id: run.run_id,
            window,
            request,
            cancel,
        })
    }

    /// Request cancellation of an in-flight run. Takes effect before its
    /// next stage. Returns false when the run is not executing.
    pub async fn cancel(&self, run_id: &str) -> bool {
        match self.in_flight.lock().await.get(run_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(run_id = %run_id, "pipeline run cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Run every stage the ticket's mode calls for and close the run.
    #[instrument(
        name = "pipeline_run",
        skip(self, ticket),
        fields(run_id = %ticket.run_id, mode = ticket.request.mode.as_str())
    )]
    pub async fn execute(&self, ticket: RunTicket) -> Result<PipelineRun, PipelineError> {
        let driven = match ticket.request.mode {
            RunMode::Full => self.drive_full(&ticket).await,
            RunMode::AnalysisOnly => self.drive_analysis_only(&ticket).await,
            RunMode::SimulationOnly => self.drive_simulation_only(&ticket).await,
        };
        self.in_flight.lock().await.remove(&ticket.run_id);

        let outcome = driven?;
        let run = self.ledger.close(&ticket.run_id, outcome).await?;
        tracing::info!(outcome = outcome.as_str(), "pipeline run finished");
        Ok(run)
    }

    /// `start` followed by `execute`.
    pub async fn run(&self, request: RunRequest) -> Result<PipelineRun, PipelineError> {
        let ticket = self.start(request).await?;
        self.execute(ticket).await
    }

    async fn record_ok(&self, run_id: &str, stage: Stage, detail: String) -> Result<(), PipelineError> {
        self.ledger
            .record_stage(run_id, StageRecord::ok(stage, detail))
            .await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        run_id: &str,
        stage: Stage,
        err: &PipelineError,
    ) -> Result<Halt, PipelineError> {
        alert_if_consistency(err, run_id);
        metrics::increment_counter!(
            "pipeline_stage_failures_total",
            "stage" => stage.as_str(),
            "class" => err.class().as_str()
        );
        tracing::warn!(stage = stage.as_str(), error = %err, "pipeline stage failed");
        self.ledger
            .record_stage(run_id, StageRecord::failed(stage, err.class(), err.to_string()))
            .await?;
        Ok(Halt(RunOutcome::Failed))
    }

    /// Stop the run if cancellation was requested.
    async fn checkpoint(&self, ticket: &RunTicket, next: Stage) -> StageResult<()> {
        if !ticket.cancel.is_cancelled() {
            return Ok(Ok(()));
        }
        self.ledger
            .record_stage(
                &ticket.run_id,
                StageRecord::failed(
                    Stage::Cancellation,
                    ErrorClass::Input,
                    format!("cancelled before {next}"),
                ),
            )
            .await?;
        tracing::info!(next_stage = next.as_str(), "pipeline run cancelled");
        Ok(Err(Halt(RunOutcome::Failed)))
    }

    async fn analysis(&self, ticket: &RunTicket) -> StageResult<FeedbackSummary> {
        let analysed = match self.analyzer.analyze(ticket.window).await {
            Ok(summary) => self
                .attribute_performance(&summary)
                .await
                .map(|credited| (summary, credited)),
            Err(err) => Err(err),
        };
        match analysed {
            Ok((summary, credited)) => {
                let mut detail = format!(
                    "{} calls analyzed, {} recommended changes",
                    summary.calls_analyzed,
                    summary.recommended_changes.len()
                );
                if let Some(version_id) = credited {
                    detail.push_str(&format!(", credited to {version_id}"));
                }
                self.record_ok(&ticket.run_id, Stage::Analysis, detail).await?;
                Ok(Ok(summary))
            }
            Err(err) => Ok(Err(self.record_failure(&ticket.run_id, Stage::Analysis, &err).await?)),
        }
    }

    /// Record the window's metrics against the active version, if any.
    async fn attribute_performance(
        &self,
        summary: &FeedbackSummary,
    ) -> Result<Option<String>, PipelineError> {
        if summary.calls_analyzed == 0 {
            return Ok(None);
        }
        let Some(active) = self.store.get_active().await? else {
            return Ok(None);
        };
        self.store
            .record_performance(&active.version_id, summary)
            .await?;
        Ok(Some(active.version_id))
    }

    async fn active_version(&self, ticket: &RunTicket) -> StageResult<PromptVersion> {
        let err = match self.store.get_active().await {
            Ok(Some(active)) => return Ok(Ok(active)),
            Ok(None) => PipelineError::NotBootstrapped,
            Err(e) => e.into(),
        };
        Ok(Err(self.record_failure(&ticket.run_id, Stage::Synthesis, &err).await?))
    }

    async fn evaluation(
        &self,
        ticket: &RunTicket,
        candidate: &PromptContent,
        active: &PromptContent,
    ) -> StageResult<EvaluationDecision> {
        match self.gate.evaluate(candidate, active).await {
            Ok(decision) => {
                self.ledger.set_decision(&ticket.run_id, decision.clone()).await?;
                let detail = if decision.approved {
                    "approved".to_string()
                } else {
                    format!("rejected: {}", decision.reasons.join("; "))
                };
                self.record_ok(&ticket.run_id, Stage::Evaluation, detail).await?;
                Ok(Ok(decision))
            }
            Err(err) => Ok(Err(self.record_failure(&ticket.run_id, Stage::Evaluation, &err).await?)),
        }
    }

    async fn drive_analysis_only(&self, ticket: &RunTicket) -> Result<RunOutcome, PipelineError> {
        proceed!(self.checkpoint(ticket, Stage::Analysis));
        proceed!(self.analysis(ticket));
        Ok(RunOutcome::Completed)
    }

    async fn drive_full(&self, ticket: &RunTicket) -> Result<RunOutcome, PipelineError> {
        let run_id = ticket.run_id.as_str();
        proceed!(self.checkpoint(ticket, Stage::Analysis));
        let summary = proceed!(self.analysis(ticket));
        if summary.calls_analyzed == 0 {
            return Ok(RunOutcome::Completed);
        }

        proceed!(self.checkpoint(ticket, Stage::Synthesis));
        let active = proceed!(self.active_version(ticket));
        let candidate = match self.synthesizer.synthesize(&active, &summary).await {
            Ok(Some(candidate)) => {
                self.ledger.set_candidate(run_id, &candidate.version_id).await?;
                self.record_ok(
                    run_id,
                    Stage::Synthesis,
                    format!("candidate {} derived from {}", candidate.version_id, active.version_id),
                )
                .await?;
                candidate
            }
            Ok(None) => {
                self.record_ok(run_id, Stage::Synthesis, "no recommended changes".to_string())
                    .await?;
                return Ok(RunOutcome::Completed);
            }
            Err(err) => return Ok(self.record_failure(run_id, Stage::Synthesis, &err).await?.0),
        };

        proceed!(self.checkpoint(ticket, Stage::Evaluation));
        let decision = proceed!(self.evaluation(ticket, &candidate.content, &active.content));

        proceed!(self.checkpoint(ticket, Stage::Promotion));
        if decision.approved {
            let reason = format!("approved by run {run_id}: {}", decision.reasons.join("; "));
            match self.store.activate(&candidate.version_id, &reason).await {
                Ok(_) => {
                    self.record_ok(
                        run_id,
                        Stage::Promotion,
                        format!("activated {}", candidate.version_id),
                    )
                    .await?;
                    Ok(RunOutcome::Completed)
                }
                Err(err) => Ok(self
                    .record_failure(run_id, Stage::Promotion, &err.into())
                    .await?
                    .0),
            }
        } else {
            let reason = decision.reasons.join("; ");
            match self.store.reject(&candidate.version_id, &reason).await {
                Ok(_) => {
                    self.record_ok(
                        run_id,
                        Stage::Promotion,
                        format!("rejected {}", candidate.version_id),
                    )
                    .await?;
                    Ok(RunOutcome::Rejected)
                }
                Err(err) => Ok(self
                    .record_failure(run_id, Stage::Promotion, &err.into())
                    .await?
                    .0),
            }
        }
    }

    async fn drive_simulation_only(&self, ticket: &RunTicket) -> Result<RunOutcome, PipelineError> {
        let run_id = ticket.run_id.as_str();
        proceed!(self.checkpoint(ticket, Stage::Synthesis));
        let active = proceed!(self.active_version(ticket));

        let candidate: PromptContent = match &ticket.request.candidate_version {
            Some(version_id) => match self.store.get(version_id).await {
                Ok(Some(version)) => {
                    self.ledger.set_candidate(run_id, &version.version_id).await?;
                    self.record_ok(
                        run_id,
                        Stage::Synthesis,
                        format!("evaluating stored version {}", version.version_id),
                    )
                    .await?;
                    version.content
                }
                Ok(None) => {
                    let err: PipelineError =
                        prompt_store::StoreError::VersionNotFound(version_id.clone()).into();
                    return Ok(self.record_failure(run_id, Stage::Synthesis, &err).await?.0);
                }
                Err(err) => {
                    return Ok(self
                        .record_failure(run_id, Stage::Synthesis, &err.into())
                        .await?
                        .0)
                }
            },
            None => {
                let drafted = match self.analyzer.load(ticket.window).await {
                    Ok(Some(summary)) => self.synthesizer.draft(&active, &summary).await,
                    Ok(None) => Err(PipelineError::MissingFeedback(ticket.window.to_string())),
                    Err(err) => Err(err),
                };
                match drafted {
                    Ok(Some(draft)) => {
                        self.record_ok(
                            run_id,
                            Stage::Synthesis,
                            format!("drafted preview from {}", draft.applied.join(", ")),
                        )
                        .await?;
                        draft.content
                    }
                    Ok(None) => {
                        self.record_ok(run_id, Stage::Synthesis, "no recommended changes".to_string())
                            .await?;
                        return Ok(RunOutcome::Completed);
                    }
                    Err(err) => {
                        return Ok(self.record_failure(run_id, Stage::Synthesis, &err).await?.0)
                    }
                }
            }
        };

        proceed!(self.checkpoint(ticket, Stage::Evaluation));
        proceed!(self.evaluation(ticket, &candidate, &active.content));
        Ok(RunOutcome::Completed)
    }
}
