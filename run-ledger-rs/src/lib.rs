// run-ledger-rs/src/lib.rs
// Append-only ledger of pipeline runs.
//
// - A run is opened by `begin`, receives stage records while it executes and
//   is sealed by `close`. Closed runs are never rewritten.
// - Closing a run links it into a SHA-256 hash chain:
//     hash = SHA-256(prev_hash || canonical JSON of the sealed run)
//   The run record and the chain head are written in one atomic batch.
// - Public API:
//     * RunLedger::begin / record_stage / set_candidate / set_decision / close
//     * RunLedger::get / list_runs / stats / verify_chain

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared_types::storage::{self, KvStore, StorageError};
use shared_types::{
    ErrorClass, EvaluationDecision, PipelineRun, RunMode, RunOutcome, RunTrigger, Stage,
    StageRecord, TimeWindow,
};
use tokio::sync::Mutex;
use uuid::Uuid;


const RUN_PREFIX: &str = "runs/";
const HEAD_KEY: &str = "ledger/head";

/// Hash that precedes the first sealed run.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Errors produced by the ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("run {0} not found")]
    RunNotFound(String),

    #[error("run {0} is closed and cannot be modified")]
    RunClosed(String),

    #[error("run {run_id} already has a {stage} stage record")]
    DuplicateStage { run_id: String, stage: Stage },

    #[error("hash chain broken at sequence {seq}: {reason}")]
    ChainBroken { seq: u64, reason: String },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl LedgerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LedgerError::RunNotFound(_) => ErrorClass::Input,
            LedgerError::RunClosed(_)
            | LedgerError::DuplicateStage { .. }
            | LedgerError::ChainBroken { .. } => ErrorClass::Consistency,
            LedgerError::Serde(_) => ErrorClass::Storage,
            LedgerError::Storage(e) => e.class(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ChainHead {
    seq: u64,
    hash: String,
}

impl Default for ChainHead {
    fn default() -> Self {
        Self {
            seq: 0,
            hash: GENESIS_HASH.to_string(),
        }
    }
}

/// Aggregate counters over all recorded runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total_runs: usize,
    pub open_runs: usize,
    pub completed: usize,
    pub rejected: usize,
    pub failed: usize,
    /// Closed runs that did not fail, over all closed runs.
    pub success_rate: f64,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainReport {
    pub runs_verified: u64,
    pub head_hash: String,
}

fn run_key(run_id: &str) -> String {
    format!("{RUN_PREFIX}{run_id}")
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Chain hash of a sealed run. The `hash` field itself is excluded.
fn seal_hash(prev_hash: &str, run: &PipelineRun) -> Result<String> {
    let mut unsealed = run.clone();
    unsealed.hash = None;
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(serde_json::to_vec(&unsealed)?);
    Ok(to_hex(&hasher.finalize()))
}

pub struct RunLedger {
    kv: Arc<dyn KvStore>,
    write_lock: Mutex<()>,
}

impl RunLedger {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            write_lock: Mutex::new(()),
        }
    }

    /// Open a new run record.
    pub async fn begin(
        &self,
        trigger: RunTrigger,
        mode: RunMode,
        triggered_by: &str,
        window: Option<TimeWindow>,
    ) -> Result<PipelineRun> {
        let run = PipelineRun {
            run_id: Uuid::new_v4().to_string(),
            trigger,
            mode,
            triggered_by: triggered_by.to_string(),
            window,
            started_at: Utc::now(),
            ended_at: None,
            stage_results: Vec::new(),
            outcome: None,
            candidate_version: None,
            decision: None,
            ledger_seq: None,
            prev_hash: None,
            hash: None,
        };
        storage::put_json(self.kv.as_ref(), &run_key(&run.run_id), &run).await?;

        metrics::increment_counter!(
            "pipeline_runs_started_total",
            "mode" => mode.as_str(),
            "trigger" => trigger.as_str()
        );
        tracing::info!(
            run_id = %run.run_id,
            mode = mode.as_str(),
            trigger = trigger.as_str(),
            "pipeline run opened"
        );
        Ok(run)
    }

    async fn load_open(&self, run_id: &str) -> Result<PipelineRun> {
        let run: PipelineRun = self
            .get(run_id)
            .await?
            .ok_or_else(|| LedgerError::RunNotFound(run_id.to_string()))?;
        if run.is_closed() {
            return Err(LedgerError::RunClosed(run_id.to_string()));
        }
        Ok(run)
    }

    async fn update_open<F>(&self, run_id: &str, apply: F) -> Result<PipelineRun>
    where
        F: FnOnce(&mut PipelineRun) -> Result<()> + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut run = self.load_open(run_id).await?;
        apply(&mut run)?;
        storage::put_json(self.kv.as_ref(), &run_key(run_id), &run).await?;
        Ok(run)
    }

    /// Append a stage record. Each stage may appear once per run.
    pub async fn record_stage(&self, run_id: &str, record: StageRecord) -> Result<PipelineRun> {
        tracing::debug!(
            run_id = %run_id,
            stage = record.stage.as_str(),
            success = record.success,
            "stage recorded"
        );
        self.update_open(run_id, |run| {
            if run.stage(record.stage).is_some() {
                return Err(LedgerError::DuplicateStage {
                    run_id: run.run_id.clone(),
                    stage: record.stage,
                });
            }
            run.stage_results.push(record);
            Ok(())
        })
        .await
    }

    pub async fn set_candidate(&self, run_id: &str, version_id: &str) -> Result<PipelineRun> {
        let version_id = version_id.to_string();
        self.update_open(run_id, move |run| {
            run.candidate_version = Some(version_id);
            Ok(())
        })
        .await
    }

    pub async fn set_decision(
        &self,
        run_id: &str,
        decision: EvaluationDecision,
    ) -> Result<PipelineRun> {
        self.update_open(run_id, move |run| {
            run.decision = Some(decision);
            Ok(())
        })
        .await
    }

    /// Seal a run with its outcome and link it into the hash chain.
    pub async fn close(&self, run_id: &str, outcome: RunOutcome) -> Result<PipelineRun> {
        let _guard = self.write_lock.lock().await;
        let mut run = self.load_open(run_id).await?;
        let head: ChainHead = storage::get_json(self.kv.as_ref(), HEAD_KEY)
            .await?
            .unwrap_or_default();

        run.ended_at = Some(Utc::now());
        run.outcome = Some(outcome);
        run.ledger_seq = Some(head.seq + 1);
        run.prev_hash = Some(head.hash.clone());
        let hash = seal_hash(&head.hash, &run)?;
        run.hash = Some(hash.clone());

        let new_head = ChainHead {
            seq: head.seq + 1,
            hash,
        };
        self.kv
            .put_many(vec![
                (run_key(run_id), storage::encode_json(&run)?),
                (HEAD_KEY.to_string(), storage::encode_json(&new_head)?),
            ])
            .await?;

        metrics::increment_counter!(
            "pipeline_runs_closed_total",
            "outcome" => outcome.as_str(),
            "mode" => run.mode.as_str()
        );
        tracing::info!(
            run_id = %run_id,
            outcome = outcome.as_str(),
            ledger_seq = new_head.seq,
            "pipeline run closed"
        );
        Ok(run)
    }

    pub async fn get(&self, run_id: &str) -> Result<Option<PipelineRun>> {
        if storage::validate_key(&run_key(run_id)).is_err() {
            return Ok(None);
        }
        Ok(storage::get_json(self.kv.as_ref(), &run_key(run_id)).await?)
    }

    /// Every run, newest first.
    pub async fn list_runs(&self) -> Result<Vec<PipelineRun>> {
        let mut runs: Vec<PipelineRun> = storage::list_json(self.kv.as_ref(), RUN_PREFIX).await?;
        runs.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        Ok(runs)
    }

    pub async fn stats(&self) -> Result<LedgerStats> {
        let runs = self.list_runs().await?;
        let mut stats = LedgerStats {
            total_runs: runs.len(),
            last_run_at: runs.first().map(|r| r.started_at),
            ..LedgerStats::default()
        };
        for run in &runs {
            match run.outcome {
                None => stats.open_runs += 1,
                Some(RunOutcome::Completed) => stats.completed += 1,
                Some(RunOutcome::Rejected) => stats.rejected += 1,
                Some(RunOutcome::Failed) => stats.failed += 1,
            }
        }
        let closed = stats.completed + stats.rejected + stats.failed;
        if closed > 0 {
            stats.success_rate = (stats.completed + stats.rejected) as f64 / closed as f64;
        }
        Ok(stats)
    }

    /// Recompute the hash chain over every sealed run and compare it with
    /// the stored head.
    pub async fn verify_chain(&self) -> Result<ChainReport> {
        let mut sealed: Vec<PipelineRun> = self
            .list_runs()
            .await?
            .into_iter()
            .filter(|r| r.is_closed())
            .collect();
        sealed.sort_by_key(|r| r.ledger_seq);

        let mut prev = GENESIS_HASH.to_string();
        let mut expected_seq = 0u64;
        for run in &sealed {
            expected_seq += 1;
            let broken = |reason: String| LedgerError::ChainBroken {
                seq: expected_seq,
                reason,
            };
            if run.ledger_seq != Some(expected_seq) {
                return Err(broken(format!(
                    "run {} carries sequence {:?}",
                    run.run_id, run.ledger_seq
                )));
            }
            if run.prev_hash.as_deref() != Some(prev.as_str()) {
                return Err(broken(format!("run {} does not link to its predecessor", run.run_id)));
            }
            let recomputed = seal_hash(&prev, run)?;
            if run.hash.as_deref() != Some(recomputed.as_str()) {
                return Err(broken(format!("run {} content does not match its hash", run.run_id)));
            }
            prev = recomputed;
        }

        let head: ChainHead = storage::get_json(self.kv.as_ref(), HEAD_KEY)
            .await?
            .unwrap_or_default();
        if head.seq != expected_seq || head.hash != prev {
            return Err(LedgerError::ChainBroken {
                seq: head.seq,
                reason: "stored chain head does not match the sealed runs".to_string(),
            });
        }

        Ok(ChainReport {
            runs_verified: expected_seq,
            head_hash: prev,
        })
    }
}
