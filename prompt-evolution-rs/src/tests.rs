use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use completion_client::{CompletionError, TextCompletion};
use mockall::mock;
use shared_types::config::{AnalyzerConfig, EvolutionConfig, GateConfig, SynthesizerConfig};
use shared_types::storage::{KvStore, MemoryKvStore};
use shared_types::{
    ErrorClass, PromptContent, RunMode, RunOutcome, RunTrigger, Stage, TimeWindow,
    ToolDeclaration, VersionStatus,
};

use crate::analyzer::{FeedbackAnalyzer, LONG_CALL, UNSUCCESSFUL_CALL};
use crate::gate::{self, EvaluationGate};
use crate::orchestrator::{CancelToken, PipelineOrchestrator, RunRequest};
use crate::synthesizer::{
    extract_json_block, parse_prompt_content, CandidateSynthesizer, SynthesisParseError,
};
use crate::transcripts::{
    MockTranscriptSource, NdjsonTranscriptSource, SourceError, Transcript, TranscriptSource,
};
use crate::PipelineError;

mock! {
    pub Completion {}

    #[async_trait]
    impl TextCompletion for Completion {
        async fn complete_text(
            &self,
            prompt: &str,
            timeout: Duration
        ) -> Result<String, CompletionError>;
    }
}

const GOOD_REPLY: &str = "I understand completely and I'm sorry for the trouble. The value is \
    in the results, and I can connect you with our team or follow up tomorrow.";

fn window_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap()
}

fn window() -> TimeWindow {
    TimeWindow::new(window_start(), window_start() + chrono::Duration::days(1)).unwrap()
}

fn transcript(call_id: &str, minute: i64, content: &str, success: Option<bool>) -> Transcript {
    Transcript {
        call_id: call_id.to_string(),
        started_at: window_start() + chrono::Duration::minutes(minute),
        ended_at: None,
        duration_secs: Some(120.0),
        success,
        content: content.to_string(),
    }
}

fn hesitant_calls() -> Vec<Transcript> {
    vec![
        transcript("call-1", 10, "Customer: I'm not sure, I need to think about it.", Some(false)),
        transcript("call-2", 20, "Customer: Great, you're all set for Tuesday.", None),
    ]
}

fn active_content() -> PromptContent {
    PromptContent::new(
        "You are the front desk agent for a wellness clinic. Help callers schedule an \
         appointment, describe our services and offer a free consultation before booking.",
    )
    .with_tool(ToolDeclaration {
        name: "book_appointment".to_string(),
        description: "Create a booking for the caller".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": { "time": { "type": "string" } }
        }),
    })
}

fn improved_content() -> PromptContent {
    let mut content = active_content();
    content.system_instructions.push_str(
        " When a caller hesitates, acknowledge it and propose a concrete follow up time.",
    );
    content
}

fn source_with(transcripts: Vec<Transcript>) -> MockTranscriptSource {
    let mut source = MockTranscriptSource::new();
    source
        .expect_fetch_transcripts()
        .returning(move |_| Ok(transcripts.clone()));
    source
}

/// Answers synthesis requests with `candidate` and simulations with `reply`.
fn scripted_completion(candidate: &PromptContent, reply: &'static str) -> MockCompletion {
    let body = serde_json::to_string_pretty(candidate).unwrap();
    let mut completion = MockCompletion::new();
    completion
        .expect_complete_text()
        .returning(move |prompt: &str, _timeout: Duration| {
            if prompt.contains("RECOMMENDED IMPROVEMENTS:") {
                Ok(format!("Here is the revised prompt:\n{body}\nLet me know if you need more."))
            } else {
                Ok(reply.to_string())
            }
        });
    completion
}

struct Harness {
    kv: Arc<MemoryKvStore>,
    orchestrator: PipelineOrchestrator,
}

async fn harness(
    source: impl TranscriptSource + 'static,
    completion: impl TextCompletion + 'static,
    bootstrap: bool,
) -> Harness {
    let kv = Arc::new(MemoryKvStore::new());
    let orchestrator = PipelineOrchestrator::from_config(
        &EvolutionConfig::default(),
        kv.clone(),
        Arc::new(source),
        Arc::new(completion),
    )
    .unwrap();
    if bootstrap {
        orchestrator
            .store()
            .bootstrap(active_content(), "initial prompt", "operator")
            .await
            .unwrap();
    }
    Harness { kv, orchestrator }
}

fn full_request() -> RunRequest {
    RunRequest::new(RunMode::Full, RunTrigger::Manual, "operator").with_window(window())
}

fn stages(run: &shared_types::PipelineRun) -> Vec<Stage> {
    run.stage_results.iter().map(|r| r.stage).collect()
}

// ---------------------------------------------------------------------------
// Pipeline runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn zero_transcripts_complete_without_synthesis() {
    let h = harness(source_with(Vec::new()), MockCompletion::new(), true).await;

    let run = h.orchestrator.run(full_request()).await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Completed));
    assert_eq!(stages(&run), vec![Stage::Analysis]);
    assert_eq!(run.candidate_version, None);
    assert_eq!(h.orchestrator.store().list_history().await.unwrap().len(), 1);

    let summary = h.orchestrator.analyzer().load(window()).await.unwrap().unwrap();
    assert_eq!(summary.calls_analyzed, 0);
    assert!(summary.recommended_changes.is_empty());
}

#[tokio::test]
async fn approved_candidate_is_promoted() {
    let h = harness(
        source_with(hesitant_calls()),
        scripted_completion(&improved_content(), GOOD_REPLY),
        true,
    )
    .await;

    let run = h.orchestrator.run(full_request()).await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Completed));
    assert_eq!(
        stages(&run),
        vec![Stage::Analysis, Stage::Synthesis, Stage::Evaluation, Stage::Promotion]
    );
    assert!(run.stage_results.iter().all(|r| r.success));
    assert_eq!(run.candidate_version.as_deref(), Some("v1.1"));

    let decision = run.decision.as_ref().unwrap();
    assert!(decision.approved);
    assert_eq!(decision.checks.len(), 5);
    assert!(decision.check(gate::SIMULATED_CONVERSATIONS).unwrap().passed);

    let store = h.orchestrator.store();
    let active = store.get_active().await.unwrap().unwrap();
    assert_eq!(active.version_id, "v1.1");
    assert_eq!(active.lineage.as_deref(), Some("v1.0"));
    assert_eq!(active.content, improved_content());
    assert!(active.rationale.contains("rec-hesitation"));
    assert!(active
        .status_reason
        .as_deref()
        .unwrap()
        .starts_with(&format!("approved by run {}", run.run_id)));
    assert_eq!(
        store.get("v1.0").await.unwrap().unwrap().status,
        VersionStatus::Superseded
    );

    let stats = h.orchestrator.ledger().stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert!(h.orchestrator.ledger().verify_chain().await.is_ok());
}

#[tokio::test]
async fn missing_tool_declaration_rejects_without_simulation() {
    let stripped = PromptContent::new(improved_content().system_instructions);
    let mut completion = MockCompletion::new();
    let body = serde_json::to_string(&stripped).unwrap();
    completion
        .expect_complete_text()
        .times(1)
        .returning(move |_, _| Ok(body.clone()));
    let h = harness(source_with(hesitant_calls()), completion, true).await;

    let run = h.orchestrator.run(full_request()).await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Rejected));
    let decision = run.decision.as_ref().unwrap();
    assert!(!decision.approved);
    assert_eq!(decision.checks.len(), 4);
    assert!(decision.check(gate::SIMULATED_CONVERSATIONS).is_none());
    assert_eq!(
        decision.reasons,
        vec!["structural_integrity: missing tool declarations: book_appointment".to_string()]
    );

    let store = h.orchestrator.store();
    assert_eq!(store.get_active().await.unwrap().unwrap().version_id, "v1.0");
    let candidate = store.get("v1.1").await.unwrap().unwrap();
    assert_eq!(candidate.status, VersionStatus::Rejected);
}

#[tokio::test]
async fn rejected_version_cannot_be_activated_later() {
    let stripped = PromptContent::new(improved_content().system_instructions);
    let h = harness(
        source_with(hesitant_calls()),
        scripted_completion(&stripped, GOOD_REPLY),
        true,
    )
    .await;
    let run = h.orchestrator.run(full_request()).await.unwrap();
    assert_eq!(run.outcome, Some(RunOutcome::Rejected));

    let before = h.kv.list_prefix("versions/").await.unwrap();
    let err = h
        .orchestrator
        .store()
        .activate("v1.1", "manual approval")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        prompt_store::StoreError::VersionNotCandidate {
            status: VersionStatus::Rejected,
            ..
        }
    ));
    assert_eq!(h.kv.list_prefix("versions/").await.unwrap(), before);
}

/// Holds every synthesis request until `parties` of them are waiting.
struct RendezvousCompletion {
    barrier: tokio::sync::Barrier,
    candidate: String,
}

#[async_trait]
impl TextCompletion for RendezvousCompletion {
    async fn complete_text(&self, prompt: &str, _timeout: Duration) -> Result<String, CompletionError> {
        if prompt.contains("RECOMMENDED IMPROVEMENTS:") {
            self.barrier.wait().await;
            Ok(self.candidate.clone())
        } else {
            Ok(GOOD_REPLY.to_string())
        }
    }
}

#[tokio::test]
async fn concurrent_full_runs_promote_exactly_one_candidate() {
    let completion = RendezvousCompletion {
        barrier: tokio::sync::Barrier::new(2),
        candidate: serde_json::to_string(&improved_content()).unwrap(),
    };
    let h = harness(source_with(hesitant_calls()), completion, true).await;

    let (a, b) = tokio::join!(
        h.orchestrator.run(full_request()),
        h.orchestrator.run(full_request())
    );
    let runs = [a.unwrap(), b.unwrap()];

    let completed: Vec<_> = runs
        .iter()
        .filter(|r| r.outcome == Some(RunOutcome::Completed))
        .collect();
    let failed: Vec<_> = runs
        .iter()
        .filter(|r| r.outcome == Some(RunOutcome::Failed))
        .collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(failed.len(), 1);

    let promotion = failed[0].stage(Stage::Promotion).unwrap();
    assert!(!promotion.success);
    assert_eq!(promotion.error_class, Some(ErrorClass::Consistency));

    let store = h.orchestrator.store();
    let history = store.list_history().await.unwrap();
    assert_eq!(
        history.iter().filter(|v| v.status == VersionStatus::Active).count(),
        1
    );
    let active = store.get_active().await.unwrap().unwrap();
    assert_eq!(Some(active.version_id), completed[0].candidate_version.clone());

    let pending = store.pending_candidates().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(Some(pending[0].version_id.clone()), failed[0].candidate_version.clone());
}

/// Resolves the run's candidate out of band during the first simulation.
struct ResolvedElsewhere {
    kv: Arc<MemoryKvStore>,
    candidate: String,
    resolved: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl TextCompletion for ResolvedElsewhere {
    async fn complete_text(&self, prompt: &str, _timeout: Duration) -> Result<String, CompletionError> {
        if prompt.contains("RECOMMENDED IMPROVEMENTS:") {
            return Ok(self.candidate.clone());
        }
        if !self.resolved.swap(true, std::sync::atomic::Ordering::SeqCst) {
            prompt_store::VersionStore::new(self.kv.clone())
                .reject("v1.1", "rejected by operator")
                .await
                .unwrap();
        }
        Ok(GOOD_REPLY.to_string())
    }
}

#[tokio::test]
async fn candidate_resolved_before_promotion_is_a_consistency_failure() {
    let kv = Arc::new(MemoryKvStore::new());
    let completion = ResolvedElsewhere {
        kv: kv.clone(),
        candidate: serde_json::to_string(&improved_content()).unwrap(),
        resolved: Default::default(),
    };
    let orchestrator = PipelineOrchestrator::from_config(
        &EvolutionConfig::default(),
        kv.clone(),
        Arc::new(source_with(hesitant_calls())),
        Arc::new(completion),
    )
    .unwrap();
    orchestrator
        .store()
        .bootstrap(active_content(), "initial prompt", "operator")
        .await
        .unwrap();

    let run = orchestrator.run(full_request()).await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Failed));
    assert!(run.decision.as_ref().unwrap().approved);
    let promotion = run.stage(Stage::Promotion).unwrap();
    assert!(!promotion.success);
    assert_eq!(promotion.error_class, Some(ErrorClass::Consistency));
    assert!(promotion.detail.contains("expected candidate"));

    let store = orchestrator.store();
    assert_eq!(store.get_active().await.unwrap().unwrap().version_id, "v1.0");
    assert_eq!(
        store.get("v1.1").await.unwrap().unwrap().status,
        VersionStatus::Rejected
    );
}

#[tokio::test]
async fn analysis_credits_window_to_active_version() {
    let h = harness(source_with(hesitant_calls()), MockCompletion::new(), true).await;
    let request =
        RunRequest::new(RunMode::AnalysisOnly, RunTrigger::Manual, "operator").with_window(window());

    let run = h.orchestrator.run(request.clone()).await.unwrap();
    assert!(run.stage_results[0].detail.ends_with("credited to v1.0"));
    // A second pass over the same window replaces the first.
    h.orchestrator.run(request).await.unwrap();

    let totals = h.orchestrator.store().performance("v1.0").await.unwrap().totals();
    assert_eq!(totals.windows, 1);
    assert_eq!(totals.calls_analyzed, 2);
    assert!((totals.metrics.success_rate - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn empty_window_is_not_credited() {
    let h = harness(source_with(Vec::new()), MockCompletion::new(), true).await;
    h.orchestrator.run(full_request()).await.unwrap();
    assert!(h
        .orchestrator
        .store()
        .performance("v1.0")
        .await
        .unwrap()
        .windows
        .is_empty());
}

#[tokio::test]
async fn store_without_active_version_fails_synthesis() {
    let h = harness(source_with(hesitant_calls()), MockCompletion::new(), false).await;

    let run = h.orchestrator.run(full_request()).await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Failed));
    let synthesis = run.stage(Stage::Synthesis).unwrap();
    assert!(!synthesis.success);
    assert_eq!(synthesis.error_class, Some(ErrorClass::Input));
}

#[tokio::test]
async fn completion_timeout_fails_synthesis_and_leaves_store_untouched() {
    let mut completion = MockCompletion::new();
    completion
        .expect_complete_text()
        .times(1)
        .returning(|_, timeout| Err(CompletionError::Timeout(timeout)));
    let h = harness(source_with(hesitant_calls()), completion, true).await;

    let run = h.orchestrator.run(full_request()).await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Failed));
    let synthesis = run.stage(Stage::Synthesis).unwrap();
    assert_eq!(synthesis.error_class, Some(ErrorClass::ExternalService));
    assert!(synthesis.detail.contains("timed out"));
    assert_eq!(h.orchestrator.store().list_history().await.unwrap().len(), 1);
}

#[tokio::test]
async fn unparsable_synthesis_response_is_a_parse_failure() {
    let mut completion = MockCompletion::new();
    completion
        .expect_complete_text()
        .returning(|_, _| Ok("I would rather not rewrite this prompt.".to_string()));
    let h = harness(source_with(hesitant_calls()), completion, true).await;

    let run = h.orchestrator.run(full_request()).await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Failed));
    assert_eq!(
        run.stage(Stage::Synthesis).unwrap().error_class,
        Some(ErrorClass::Parse)
    );
    assert_eq!(h.orchestrator.store().list_history().await.unwrap().len(), 1);
}

#[tokio::test]
async fn evaluation_failure_leaves_candidate_pending() {
    let body = serde_json::to_string(&improved_content()).unwrap();
    let mut completion = MockCompletion::new();
    completion
        .expect_complete_text()
        .returning(move |prompt: &str, _timeout: Duration| {
            if prompt.contains("RECOMMENDED IMPROVEMENTS:") {
                Ok(body.clone())
            } else {
                Err(CompletionError::ServerError("503 Service Unavailable".to_string()))
            }
        });
    let h = harness(source_with(hesitant_calls()), completion, true).await;

    let run = h.orchestrator.run(full_request()).await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Failed));
    assert_eq!(run.decision, None);
    assert_eq!(
        run.stage(Stage::Evaluation).unwrap().error_class,
        Some(ErrorClass::ExternalService)
    );
    let pending = h.orchestrator.store().pending_candidates().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].version_id, "v1.1");
}

#[tokio::test]
async fn transcript_source_failure_fails_analysis() {
    let mut source = MockTranscriptSource::new();
    source
        .expect_fetch_transcripts()
        .returning(|_| Err(SourceError::Unavailable("call archive offline".to_string())));
    let h = harness(source, MockCompletion::new(), true).await;

    let run = h.orchestrator.run(full_request()).await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Failed));
    assert_eq!(stages(&run), vec![Stage::Analysis]);
    assert_eq!(
        run.stage(Stage::Analysis).unwrap().error_class,
        Some(ErrorClass::ExternalService)
    );
}

#[tokio::test]
async fn inverted_window_is_refused_before_a_run_opens() {
    let h = harness(source_with(Vec::new()), MockCompletion::new(), true).await;
    let inverted = TimeWindow {
        start: window().end,
        end: window().start,
    };
    let request = RunRequest::new(RunMode::AnalysisOnly, RunTrigger::Manual, "operator")
        .with_window(inverted);

    let err = h.orchestrator.run(request).await.unwrap_err();
    assert!(matches!(err, PipelineError::MalformedWindow(_)));
    assert_eq!(err.class(), ErrorClass::Input);
    assert!(h.orchestrator.ledger().list_runs().await.unwrap().is_empty());
}

#[tokio::test]
async fn analysis_only_stops_after_analysis() {
    let h = harness(source_with(hesitant_calls()), MockCompletion::new(), true).await;
    let request = RunRequest::new(RunMode::AnalysisOnly, RunTrigger::Scheduled, "scheduler")
        .with_window(window());

    let run = h.orchestrator.run(request).await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Completed));
    assert_eq!(stages(&run), vec![Stage::Analysis]);
    assert!(run.stage_results[0].detail.starts_with("2 calls analyzed"));
    assert_eq!(h.orchestrator.store().list_history().await.unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelled_ticket_stops_before_analysis() {
    let h = harness(source_with(hesitant_calls()), MockCompletion::new(), true).await;
    let ticket = h.orchestrator.start(full_request()).await.unwrap();
    let run_id = ticket.run_id.clone();

    assert!(h.orchestrator.cancel(&run_id).await);
    assert!(!h.orchestrator.cancel("no-such-run").await);

    let run = h.orchestrator.execute(ticket).await.unwrap();
    assert_eq!(run.outcome, Some(RunOutcome::Failed));
    assert_eq!(stages(&run), vec![Stage::Cancellation]);
    assert_eq!(run.stage_results[0].detail, "cancelled before analysis");
    assert!(!h.orchestrator.cancel(&run_id).await);
}

#[tokio::test]
async fn cancellation_during_synthesis_keeps_candidate_pending() {
    let slot: Arc<StdMutex<Option<CancelToken>>> = Arc::new(StdMutex::new(None));
    let body = serde_json::to_string(&improved_content()).unwrap();
    let mut completion = MockCompletion::new();
    let cancel_slot = slot.clone();
    completion
        .expect_complete_text()
        .times(1)
        .returning(move |_, _| {
            if let Some(token) = cancel_slot.lock().unwrap().as_ref() {
                token.cancel();
            }
            Ok(body.clone())
        });
    let h = harness(source_with(hesitant_calls()), completion, true).await;

    let ticket = h.orchestrator.start(full_request()).await.unwrap();
    *slot.lock().unwrap() = Some(ticket.cancel.clone());
    let run = h.orchestrator.execute(ticket).await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Failed));
    assert_eq!(
        stages(&run),
        vec![Stage::Analysis, Stage::Synthesis, Stage::Cancellation]
    );
    assert_eq!(run.candidate_version.as_deref(), Some("v1.1"));
    let store = h.orchestrator.store();
    assert_eq!(store.pending_candidates().await.unwrap().len(), 1);
    assert_eq!(store.get_active().await.unwrap().unwrap().version_id, "v1.0");
}

// ---------------------------------------------------------------------------
// Simulation-only runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn simulation_only_evaluates_stored_candidate_without_promotion() {
    let h = harness(
        source_with(Vec::new()),
        scripted_completion(&improved_content(), GOOD_REPLY),
        true,
    )
    .await;
    let store = h.orchestrator.store();
    store
        .create_candidate(improved_content(), "v1.0", "hand edit", "operator")
        .await
        .unwrap();

    let request = RunRequest::new(RunMode::SimulationOnly, RunTrigger::Manual, "operator")
        .with_window(window())
        .with_candidate("v1.1");
    let run = h.orchestrator.run(request).await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Completed));
    assert_eq!(stages(&run), vec![Stage::Synthesis, Stage::Evaluation]);
    assert_eq!(run.candidate_version.as_deref(), Some("v1.1"));
    assert!(run.decision.as_ref().unwrap().approved);

    assert_eq!(store.get("v1.1").await.unwrap().unwrap().status, VersionStatus::Candidate);
    assert_eq!(store.get_active().await.unwrap().unwrap().version_id, "v1.0");
}

#[tokio::test]
async fn simulation_only_with_unknown_candidate_fails() {
    let h = harness(source_with(Vec::new()), MockCompletion::new(), true).await;
    let request = RunRequest::new(RunMode::SimulationOnly, RunTrigger::Manual, "operator")
        .with_window(window())
        .with_candidate("v9.9");

    let run = h.orchestrator.run(request).await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Failed));
    let synthesis = run.stage(Stage::Synthesis).unwrap();
    assert_eq!(synthesis.error_class, Some(ErrorClass::Input));
    assert!(synthesis.detail.contains("v9.9"));
}

#[tokio::test]
async fn simulation_only_drafts_from_stored_feedback_without_writing_versions() {
    let h = harness(
        source_with(hesitant_calls()),
        scripted_completion(&improved_content(), GOOD_REPLY),
        true,
    )
    .await;
    let analysis = RunRequest::new(RunMode::AnalysisOnly, RunTrigger::Manual, "operator")
        .with_window(window());
    h.orchestrator.run(analysis).await.unwrap();

    let request = RunRequest::new(RunMode::SimulationOnly, RunTrigger::Manual, "operator")
        .with_window(window());
    let run = h.orchestrator.run(request).await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Completed));
    assert_eq!(run.candidate_version, None);
    assert!(run.stage(Stage::Synthesis).unwrap().detail.contains("preview"));
    assert!(run.decision.as_ref().unwrap().approved);
    assert_eq!(h.orchestrator.store().list_history().await.unwrap().len(), 1);
}

#[tokio::test]
async fn simulation_only_without_stored_feedback_fails() {
    let h = harness(source_with(hesitant_calls()), MockCompletion::new(), true).await;
    let request = RunRequest::new(RunMode::SimulationOnly, RunTrigger::Manual, "operator")
        .with_window(window());

    let run = h.orchestrator.run(request).await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Failed));
    let synthesis = run.stage(Stage::Synthesis).unwrap();
    assert_eq!(synthesis.error_class, Some(ErrorClass::Input));
    assert!(synthesis.detail.contains("no stored feedback summary"));
}

#[tokio::test]
async fn candidate_version_is_refused_outside_simulation_only() {
    let h = harness(source_with(Vec::new()), MockCompletion::new(), true).await;
    let err = h
        .orchestrator
        .start(full_request().with_candidate("v1.0"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRequest(_)));
    assert!(h.orchestrator.ledger().list_runs().await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Feedback analysis
// ---------------------------------------------------------------------------

fn analyzer_over(source: MockTranscriptSource, kv: Arc<MemoryKvStore>) -> FeedbackAnalyzer {
    FeedbackAnalyzer::new(
        Arc::new(source),
        kv,
        AnalyzerConfig::default(),
        Duration::from_secs(5),
    )
    .unwrap()
}

fn ranking_calls() -> Vec<Transcript> {
    vec![
        transcript("call-a", 5, "Honestly this is too expensive.", Some(true)),
        transcript("call-b", 15, "It costs too much, I found it cheaper elsewhere.", Some(true)),
        transcript("call-c", 25, "Can I speak to a human please?", Some(false)),
    ]
}

#[tokio::test]
async fn recommendations_are_ranked_by_frequency_times_severity() {
    let kv = Arc::new(MemoryKvStore::new());
    let analyzer = analyzer_over(source_with(ranking_calls()), kv);

    let summary = analyzer.analyze(window()).await.unwrap();

    assert_eq!(summary.calls_analyzed, 3);
    let ranked: Vec<(&str, f64)> = summary
        .recommended_changes
        .iter()
        .map(|c| (c.id.as_str(), c.impact))
        .collect();
    assert_eq!(
        ranked,
        vec![
            ("rec-price_objection", 4.0),
            ("rec-human_handoff", 3.0),
            ("rec-unsuccessful_call", 2.5),
        ]
    );
    assert_eq!(
        summary.recommended_changes[1].priority,
        shared_types::Priority::High
    );

    let issues: Vec<(&str, usize)> = summary
        .issues
        .iter()
        .map(|i| (i.category.as_str(), i.frequency))
        .collect();
    assert_eq!(
        issues,
        vec![("price_objection", 2), ("human_handoff", 1), (UNSUCCESSFUL_CALL, 1)]
    );
    assert!((summary.metrics.success_rate - 2.0 / 3.0).abs() < 1e-9);
    assert!((summary.metrics.friction_rate - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn analysis_is_reproducible_regardless_of_fetch_order() {
    let kv = Arc::new(MemoryKvStore::new());
    let mut reversed = ranking_calls();
    reversed.reverse();

    let first = analyzer_over(source_with(ranking_calls()), kv.clone())
        .analyze(window())
        .await
        .unwrap();
    let second_analyzer = analyzer_over(source_with(reversed), kv.clone());
    let second = second_analyzer.analyze(window()).await.unwrap();

    assert_eq!(first.recommended_changes, second.recommended_changes);
    assert_eq!(first.issues, second.issues);

    let stored = second_analyzer.load(window()).await.unwrap().unwrap();
    assert_eq!(stored.recommended_changes, second.recommended_changes);
    assert_eq!(stored.generated_at, second.generated_at);
    assert_eq!(kv.list_prefix("feedback/").await.unwrap().len(), 1);
}

#[tokio::test]
async fn keywords_match_on_word_boundaries_only() {
    let kv = Arc::new(MemoryKvStore::new());
    let calls = vec![
        transcript("call-1", 1, "Our operators were great and the cooperation was smooth.", Some(true)),
        transcript("call-2", 2, "Please transfer me to an OPERATOR.", Some(true)),
    ];
    let summary = analyzer_over(source_with(calls), kv).analyze(window()).await.unwrap();

    assert!(summary.calls[0].friction.is_empty());
    assert_eq!(summary.calls[1].friction, vec!["human_handoff".to_string()]);
    assert_eq!(summary.issues.len(), 1);
    assert_eq!(summary.issues[0].frequency, 1);
}

#[tokio::test]
async fn builtin_categories_cover_failed_and_long_calls() {
    let kv = Arc::new(MemoryKvStore::new());
    let mut long = transcript("call-long", 1, "Booking confirmed for Friday.", None);
    long.duration_secs = None;
    long.ended_at = Some(long.started_at + chrono::Duration::minutes(15));
    let quiet = transcript("call-quiet", 2, "Thanks, goodbye.", None);

    let summary = analyzer_over(source_with(vec![long, quiet]), kv)
        .analyze(window())
        .await
        .unwrap();

    assert!(summary.calls[0].success);
    assert!((summary.calls[0].duration_secs - 900.0).abs() < 1e-9);
    assert!(!summary.calls[1].success);
    let categories: Vec<&str> = summary.issues.iter().map(|i| i.category.as_str()).collect();
    assert_eq!(categories, vec![LONG_CALL, UNSUCCESSFUL_CALL]);
    assert!((summary.metrics.long_call_rate - 0.5).abs() < 1e-9);
}

/// Never answers within any reasonable timeout.
struct StalledSource;

#[async_trait]
impl TranscriptSource for StalledSource {
    async fn fetch_transcripts(&self, _window: TimeWindow) -> Result<Vec<Transcript>, SourceError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn slow_transcript_source_times_out() {
    let kv = Arc::new(MemoryKvStore::new());
    let analyzer = FeedbackAnalyzer::new(
        Arc::new(StalledSource),
        kv.clone(),
        AnalyzerConfig::default(),
        Duration::from_millis(50),
    )
    .unwrap();

    let err = analyzer.analyze(window()).await.unwrap_err();
    assert!(matches!(err, PipelineError::Source(SourceError::Timeout(_))));
    assert_eq!(err.class(), ErrorClass::ExternalService);
    assert!(kv.list_prefix("feedback/").await.unwrap().is_empty());
}

/// Ignores the timeout it is handed.
struct StalledCompletion;

#[async_trait]
impl TextCompletion for StalledCompletion {
    async fn complete_text(&self, _prompt: &str, _timeout: Duration) -> Result<String, CompletionError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(GOOD_REPLY.to_string())
    }
}

#[tokio::test]
async fn stalled_completion_is_cut_off_during_synthesis() {
    let kv = Arc::new(MemoryKvStore::new());
    let store = Arc::new(prompt_store::VersionStore::new(kv.clone()));
    let active = store
        .bootstrap(active_content(), "initial prompt", "operator")
        .await
        .unwrap();
    let analyzer = FeedbackAnalyzer::new(
        Arc::new(source_with(hesitant_calls())),
        kv.clone(),
        AnalyzerConfig::default(),
        Duration::from_secs(5),
    )
    .unwrap();
    let summary = analyzer.analyze(window()).await.unwrap();
    let synthesizer = CandidateSynthesizer::new(
        Arc::new(StalledCompletion),
        store,
        SynthesizerConfig::default(),
        Duration::from_millis(50),
    );

    let err = synthesizer.draft(&active, &summary).await.unwrap_err();
    assert!(matches!(err, PipelineError::Completion(CompletionError::Timeout(_))));
    assert_eq!(err.class(), ErrorClass::ExternalService);
}

#[tokio::test]
async fn stalled_completion_is_cut_off_during_simulation() {
    let gate = EvaluationGate::new(
        Arc::new(StalledCompletion),
        GateConfig::default(),
        Duration::from_millis(50),
    );

    let err = gate
        .evaluate(&improved_content(), &active_content())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Completion(CompletionError::Timeout(_))));
}

// ---------------------------------------------------------------------------
// Synthesis parsing
// ---------------------------------------------------------------------------

#[test]
fn json_block_is_found_inside_prose() {
    let text = "Here's the update: {\"system_instructions\": \"Use {braces} and \\\"quotes\\\"\", \"tools\": []} Hope it helps!";
    let block = extract_json_block(text).unwrap();
    assert!(block.starts_with('{') && block.ends_with('}'));
    let content = parse_prompt_content(text).unwrap();
    assert_eq!(content.system_instructions, "Use {braces} and \"quotes\"");
}

#[test]
fn json_block_errors_are_distinguished() {
    assert_eq!(extract_json_block("no json here"), Err(SynthesisParseError::NoJsonObject));
    assert_eq!(
        extract_json_block("{\"a\": 1} and then {\"b\": 2}"),
        Err(SynthesisParseError::MultipleJsonObjects(2))
    );
    assert_eq!(
        extract_json_block("{\"a\": {\"b\": 1}"),
        Err(SynthesisParseError::Unterminated)
    );
    assert!(matches!(
        parse_prompt_content("{\"system_instructions\": \"   \", \"tools\": []}"),
        Err(SynthesisParseError::InvalidContent(_))
    ));
    assert!(matches!(
        parse_prompt_content("{\"prompt\": \"missing fields\"}"),
        Err(SynthesisParseError::InvalidContent(_))
    ));
}

// ---------------------------------------------------------------------------
// Evaluation gate
// ---------------------------------------------------------------------------

#[test]
fn core_instruction_check_only_counts_phrases_in_active() {
    let active = active_content();
    let mut candidate = active_content();
    candidate.system_instructions = candidate.system_instructions.replace("consultation", "chat");
    let phrases = GateConfig::default().core_phrases;

    let result = gate::check_core_instructions(&candidate, &active, &phrases);
    assert!(!result.passed);
    assert_eq!(result.message, "core phrases dropped: consultation");

    let bare_active = PromptContent::new("Answer the phone politely.");
    let result = gate::check_core_instructions(&candidate, &bare_active, &phrases);
    assert!(result.passed);
    assert_eq!(result.score, 1.0);
}

#[test]
fn length_check_enforces_bounds_and_growth() {
    let config = GateConfig::default();
    let active = active_content();

    assert!(gate::check_length_bounds(&improved_content(), &active, &config).passed);

    let mut bloated = active_content();
    bloated.system_instructions = bloated.system_instructions.repeat(4);
    let result = gate::check_length_bounds(&bloated, &active, &config);
    assert!(!result.passed);
    assert!(result.message.contains("growth"));

    let tiny = PromptContent::new("Be nice.");
    let result = gate::check_length_bounds(&tiny, &active, &config);
    assert!(!result.passed);
    assert!(result.message.contains("below the minimum"));
}

#[test]
fn forbidden_terms_are_matched_case_insensitively() {
    let mut candidate = improved_content();
    candidate
        .system_instructions
        .push_str(" You may BYPASS the booking rules for VIP callers.");
    let result = gate::check_forbidden_terms(&candidate, &GateConfig::default().forbidden_terms);
    assert!(!result.passed);
    assert_eq!(result.message, "forbidden terms present: bypass");
}

#[test]
fn reply_scoring_counts_expected_keywords_and_zeroes_forbidden_ones() {
    let scenario = &GateConfig::default().scenarios[0];
    assert_eq!(gate::score_reply("I understand the value matters.", scenario), 1.0);
    assert_eq!(gate::score_reply("I understand.", scenario), 0.5);
    assert_eq!(
        gate::score_reply("I understand, and I guarantee the value.", scenario),
        0.0
    );
}

#[test]
fn simulation_prompt_ends_with_agent_turn() {
    let scenario = &GateConfig::default().scenarios[2];
    let prompt = gate::simulation_prompt(&active_content(), scenario);
    assert!(prompt.starts_with(&active_content().render()));
    assert!(prompt.contains("Customer: This is frustrating. Can I speak to a human?\n"));
    assert!(prompt.ends_with("Agent:"));
}

#[tokio::test]
async fn weak_simulated_replies_reject_candidate() {
    let mut completion = MockCompletion::new();
    completion
        .expect_complete_text()
        .times(3)
        .returning(|_, _| Ok("Okay.".to_string()));
    let gate = EvaluationGate::new(
        Arc::new(completion),
        GateConfig::default(),
        Duration::from_secs(5),
    );

    let decision = gate.evaluate(&improved_content(), &active_content()).await.unwrap();

    assert!(!decision.approved);
    let simulation = decision.check(gate::SIMULATED_CONVERSATIONS).unwrap();
    assert!(!simulation.passed);
    assert_eq!(simulation.score, 0.0);
    assert_eq!(decision.reasons.len(), 1);
    assert!(decision.reasons[0].starts_with("simulated_conversations: scenarios below floor"));
}

#[tokio::test]
async fn approved_decision_lists_every_check() {
    let gate = EvaluationGate::new(
        Arc::new(scripted_completion(&improved_content(), GOOD_REPLY)),
        GateConfig::default(),
        Duration::from_secs(5),
    );

    let decision = gate.evaluate(&improved_content(), &active_content()).await.unwrap();

    assert!(decision.approved);
    let names: Vec<&str> = decision.checks.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            gate::STRUCTURAL_INTEGRITY,
            gate::CORE_INSTRUCTIONS,
            gate::LENGTH_BOUNDS,
            gate::FORBIDDEN_TERMS,
            gate::SIMULATED_CONVERSATIONS,
        ]
    );
    assert_eq!(decision.reasons.len(), 5);
}

// ---------------------------------------------------------------------------
// NDJSON transcript source
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ndjson_source_filters_window_and_skips_bad_lines() {
    let dir = tempfile::tempdir().unwrap();
    let line = |t: &Transcript| serde_json::to_string(t).unwrap();

    let first = transcript("call-1", 30, "hello", Some(true));
    let mut outside = transcript("call-2", 0, "yesterday", None);
    outside.started_at = window().end;
    let third = transcript("call-3", 90, "later", None);

    std::fs::write(
        dir.path().join("a.ndjson"),
        format!("{}\nnot json at all\n\n", line(&first)),
    )
    .unwrap();
    std::fs::write(
        dir.path().join("b.ndjson"),
        format!("{}\n{}\n", line(&outside), line(&third)),
    )
    .unwrap();
    std::fs::write(dir.path().join("notes.txt"), line(&first)).unwrap();

    let source = NdjsonTranscriptSource::new(dir.path());
    let found = source.fetch_transcripts(window()).await.unwrap();
    let ids: Vec<&str> = found.iter().map(|t| t.call_id.as_str()).collect();
    assert_eq!(ids, vec!["call-1", "call-3"]);
}

#[tokio::test]
async fn ndjson_source_treats_missing_directory_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let source = NdjsonTranscriptSource::new(dir.path().join("absent"));
    assert!(source.fetch_transcripts(window()).await.unwrap().is_empty());
}
