// prompt-store-rs/src/lib.rs
// Version store for agent prompts.
//
// Every prompt version lives under `versions/{version_id}` in a KvStore.
// Status changes go through one async mutex, and a promotion writes the
// superseded and the newly active record in a single `put_many` batch, so
// readers never see two active versions or a half-applied promotion.
// Per-version performance lives under `performance/{version_id}`.

use std::sync::Arc;

use chrono::Utc;
use shared_types::storage::{self, KvStore, StorageError};
use shared_types::{
    ErrorClass, FeedbackSummary, InvalidVersionId, PromptContent, PromptVersion, VersionId,
    VersionPerformance, VersionStatus, WindowPerformance,
};
use tokio::sync::Mutex;
use tracing::instrument;

pub mod diff;


pub use diff::{diff_versions, FieldChange, VersionDiff};

const VERSION_PREFIX: &str = "versions/";
const PERFORMANCE_PREFIX: &str = "performance/";

/// Result type used by this crate.
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("version {0} not found")]
    VersionNotFound(String),

    #[error("version {version_id} is {status}, expected candidate")]
    VersionNotCandidate {
        version_id: String,
        status: VersionStatus,
    },

    #[error("version {version_id} is {status}; only superseded versions can be restored")]
    NotRollbackTarget {
        version_id: String,
        status: VersionStatus,
    },

    #[error("lineage {0} does not exist")]
    InvalidLineage(String),

    #[error("candidate {version_id} derives from {lineage:?} but the active version is {active:?}")]
    LineageConflict {
        version_id: String,
        lineage: Option<String>,
        active: Option<String>,
    },

    #[error("store holds more than one active version: {0:?}")]
    MultipleActive(Vec<String>),

    #[error("no active version; the store has not been bootstrapped")]
    NoActiveVersion,

    #[error("store already holds versions; bootstrap refused")]
    AlreadyBootstrapped,

    #[error(transparent)]
    InvalidVersionId(#[from] InvalidVersionId),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::VersionNotFound(_)
            | StoreError::NotRollbackTarget { .. }
            | StoreError::InvalidLineage(_)
            | StoreError::NoActiveVersion
            | StoreError::AlreadyBootstrapped
            | StoreError::InvalidVersionId(_) => ErrorClass::Input,
            StoreError::VersionNotCandidate { .. }
            | StoreError::LineageConflict { .. }
            | StoreError::MultipleActive(_) => ErrorClass::Consistency,
            StoreError::Storage(e) => e.class(),
        }
    }
}

fn version_key(version_id: &str) -> String {
    format!("{VERSION_PREFIX}{version_id}")
}

fn performance_key(version_id: &str) -> String {
    format!("{PERFORMANCE_PREFIX}{version_id}")
}

pub struct VersionStore {
    kv: Arc<dyn KvStore>,
    mutation: Mutex<()>,
}

impl VersionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            mutation: Mutex::new(()),
        }
    }

    /// Every stored version, oldest first.
    async fn load_all(&self) -> Result<Vec<PromptVersion>> {
        let mut versions: Vec<PromptVersion> =
            storage::list_json(self.kv.as_ref(), VERSION_PREFIX).await?;
        versions.sort_by_key(|v| v.sequence);
        Ok(versions)
    }

    fn single_active(versions: &[PromptVersion]) -> Result<Option<&PromptVersion>> {
        let mut active = versions.iter().filter(|v| v.is_active());
        let first = active.next();
        if let Some(second) = active.next() {
            let mut ids = vec![
                first.map(|v| v.version_id.clone()).unwrap_or_default(),
                second.version_id.clone(),
            ];
            ids.extend(active.map(|v| v.version_id.clone()));
            tracing::error!(alert = true, active = ?ids, "multiple active prompt versions");
            metrics::increment_counter!("prompt_evolution_consistency_alerts_total", "source" => "prompt_store");
            return Err(StoreError::MultipleActive(ids));
        }
        Ok(first)
    }

    pub async fn get_active(&self) -> Result<Option<PromptVersion>> {
        let versions = self.load_all().await?;
        Ok(Self::single_active(&versions)?.cloned())
    }

    pub async fn get(&self, version_id: &str) -> Result<Option<PromptVersion>> {
        // Reject ids that could never name a version before touching storage.
        version_id.parse::<VersionId>()?;
        Ok(storage::get_json(self.kv.as_ref(), &version_key(version_id)).await?)
    }

    async fn require(&self, version_id: &str) -> Result<PromptVersion> {
        self.get(version_id)
            .await?
            .ok_or_else(|| StoreError::VersionNotFound(version_id.to_string()))
    }

    /// Install `v1.0` as the active version of an empty store.
    #[instrument(name = "prompt_store_bootstrap", skip(self, content, rationale))]
    pub async fn bootstrap(
        &self,
        content: PromptContent,
        rationale: &str,
        created_by: &str,
    ) -> Result<PromptVersion> {
        let _guard = self.mutation.lock().await;
        if !self.kv.list_prefix(VERSION_PREFIX).await?.is_empty() {
            return Err(StoreError::AlreadyBootstrapped);
        }

        let now = Utc::now();
        let version = PromptVersion {
            version_id: VersionId::INITIAL.to_string(),
            sequence: 1,
            content,
            status: VersionStatus::Active,
            created_at: now,
            created_by: created_by.to_string(),
            rationale: rationale.to_string(),
            lineage: None,
            status_changed_at: Some(now),
            status_reason: Some("bootstrap".to_string()),
        };
        storage::put_json(self.kv.as_ref(), &version_key(&version.version_id), &version).await?;
        tracing::info!(version_id = %version.version_id, "prompt store bootstrapped");
        Ok(version)
    }

    /// Store a new candidate derived from `lineage`.
    ///
    /// The id is the lineage with its minor number bumped, skipping ids
    /// already taken by sibling candidates.
    #[instrument(name = "prompt_store_create_candidate", skip(self, content, rationale))]
    pub async fn create_candidate(
        &self,
        content: PromptContent,
        lineage: &str,
        rationale: &str,
        created_by: &str,
    ) -> Result<PromptVersion> {
        let _guard = self.mutation.lock().await;
        let versions = self.load_all().await?;
        self.insert_candidate(&versions, content, lineage, rationale, created_by)
            .await
    }

    async fn insert_candidate(
        &self,
        versions: &[PromptVersion],
        content: PromptContent,
        lineage: &str,
        rationale: &str,
        created_by: &str,
    ) -> Result<PromptVersion> {
        let parent = versions
            .iter()
            .find(|v| v.version_id == lineage)
            .ok_or_else(|| StoreError::InvalidLineage(lineage.to_string()))?;

        let mut next = parent.id()?.next_minor();
        while versions.iter().any(|v| v.version_id == next.to_string()) {
            next = next.next_minor();
        }
        let sequence = versions.last().map(|v| v.sequence).unwrap_or(0) + 1;

        let version = PromptVersion {
            version_id: next.to_string(),
            sequence,
            content,
            status: VersionStatus::Candidate,
            created_at: Utc::now(),
            created_by: created_by.to_string(),
            rationale: rationale.to_string(),
            lineage: Some(parent.version_id.clone()),
            status_changed_at: None,
            status_reason: None,
        };
        storage::put_json(self.kv.as_ref(), &version_key(&version.version_id), &version).await?;

        metrics::increment_counter!("prompt_store_candidates_total");
        tracing::info!(
            version_id = %version.version_id,
            lineage = %lineage,
            "candidate version created"
        );
        Ok(version)
    }

    /// Promote a candidate, superseding the current active version.
    ///
    /// The candidate must derive from the version that is active right now;
    /// otherwise another promotion won the race and this one is refused.
    /// Nothing is written unless every check passes.
    #[instrument(name = "prompt_store_activate", skip(self, reason))]
    pub async fn activate(&self, version_id: &str, reason: &str) -> Result<PromptVersion> {
        let _guard = self.mutation.lock().await;
        self.activate_locked(version_id, reason).await
    }

    async fn activate_locked(&self, version_id: &str, reason: &str) -> Result<PromptVersion> {
        let mut target = self.require(version_id).await?;
        if !target.status.can_transition_to(VersionStatus::Active) {
            return Err(StoreError::VersionNotCandidate {
                version_id: version_id.to_string(),
                status: target.status,
            });
        }

        let versions = self.load_all().await?;
        let active = Self::single_active(&versions)?.cloned();
        let active_id = active.as_ref().map(|v| v.version_id.clone());
        if target.lineage != active_id {
            metrics::increment_counter!("prompt_store_lineage_conflicts_total");
            return Err(StoreError::LineageConflict {
                version_id: version_id.to_string(),
                lineage: target.lineage.clone(),
                active: active_id,
            });
        }

        let now = Utc::now();
        let mut batch = Vec::with_capacity(2);
        if let Some(mut previous) = active {
            previous.status = VersionStatus::Superseded;
            previous.status_changed_at = Some(now);
            previous.status_reason = Some(format!("superseded by {version_id}"));
            batch.push((
                version_key(&previous.version_id),
                storage::encode_json(&previous)?,
            ));
        }
        target.status = VersionStatus::Active;
        target.status_changed_at = Some(now);
        target.status_reason = Some(reason.to_string());
        batch.push((version_key(version_id), storage::encode_json(&target)?));

        self.kv.put_many(batch).await?;

        metrics::increment_counter!("prompt_store_activations_total");
        tracing::info!(
            version_id = %version_id,
            superseded = ?target.lineage,
            "prompt version activated"
        );
        Ok(target)
    }

    /// Bring back the content of a superseded version.
    ///
    /// The content is copied into a new candidate derived from the current
    /// active version and promoted in the same step, so the lineage chain
    /// keeps moving forward and the old record keeps its status.
    #[instrument(name = "prompt_store_rollback", skip(self, reason))]
    pub async fn rollback_to(
        &self,
        version_id: &str,
        reason: &str,
        created_by: &str,
    ) -> Result<PromptVersion> {
        let _guard = self.mutation.lock().await;
        let source = self.require(version_id).await?;
        if source.status != VersionStatus::Superseded {
            return Err(StoreError::NotRollbackTarget {
                version_id: version_id.to_string(),
                status: source.status,
            });
        }

        let versions = self.load_all().await?;
        let active = Self::single_active(&versions)?
            .cloned()
            .ok_or(StoreError::NoActiveVersion)?;
        let rationale = format!("rollback to {version_id}: {reason}");
        let candidate = self
            .insert_candidate(
                &versions,
                source.content,
                &active.version_id,
                &rationale,
                created_by,
            )
            .await?;
        let restored = self
            .activate_locked(&candidate.version_id, &rationale)
            .await?;

        metrics::increment_counter!("prompt_store_rollbacks_total");
        tracing::info!(
            version_id = %restored.version_id,
            restored_from = %version_id,
            "prompt version rolled back"
        );
        Ok(restored)
    }

    #[instrument(name = "prompt_store_reject", skip(self, reason))]
    pub async fn reject(&self, version_id: &str, reason: &str) -> Result<PromptVersion> {
        let _guard = self.mutation.lock().await;
        let mut target = self.require(version_id).await?;
        if !target.status.can_transition_to(VersionStatus::Rejected) {
            return Err(StoreError::VersionNotCandidate {
                version_id: version_id.to_string(),
                status: target.status,
            });
        }

        target.status = VersionStatus::Rejected;
        target.status_changed_at = Some(Utc::now());
        target.status_reason = Some(reason.to_string());
        storage::put_json(self.kv.as_ref(), &version_key(version_id), &target).await?;

        metrics::increment_counter!("prompt_store_rejections_total");
        tracing::info!(version_id = %version_id, reason = %reason, "prompt version rejected");
        Ok(target)
    }

    /// All versions, newest first.
    pub async fn list_history(&self) -> Result<Vec<PromptVersion>> {
        let mut versions = self.load_all().await?;
        versions.reverse();
        Ok(versions)
    }

    /// Candidates awaiting a decision, newest first.
    pub async fn pending_candidates(&self) -> Result<Vec<PromptVersion>> {
        Ok(self
            .list_history()
            .await?
            .into_iter()
            .filter(|v| v.status == VersionStatus::Candidate)
            .collect())
    }

    pub async fn diff(&self, from_version: &str, to_version: &str) -> Result<VersionDiff> {
        let from = self.require(from_version).await?;
        let to = self.require(to_version).await?;
        Ok(diff_versions(&from, &to))
    }

    /// Attribute an analysed window to `version_id`.
    #[instrument(name = "prompt_store_record_performance", skip(self, summary))]
    pub async fn record_performance(
        &self,
        version_id: &str,
        summary: &FeedbackSummary,
    ) -> Result<VersionPerformance> {
        let _guard = self.mutation.lock().await;
        self.require(version_id).await?;
        let key = performance_key(version_id);
        let mut performance = storage::get_json(self.kv.as_ref(), &key)
            .await?
            .unwrap_or_else(|| VersionPerformance::new(version_id));
        performance.record(
            summary.window(),
            WindowPerformance::from_summary(summary, Utc::now()),
        );
        storage::put_json(self.kv.as_ref(), &key, &performance).await?;
        Ok(performance)
    }

    /// Recorded performance of `version_id`; empty when nothing was analysed
    /// while it was active.
    pub async fn performance(&self, version_id: &str) -> Result<VersionPerformance> {
        self.require(version_id).await?;
        Ok(
            storage::get_json(self.kv.as_ref(), &performance_key(version_id))
                .await?
                .unwrap_or_else(|| VersionPerformance::new(version_id)),
        )
    }

    /// Diff of `version_id` against the currently active version.
    pub async fn diff_against_active(&self, version_id: &str) -> Result<VersionDiff> {
        let active = self.get_active().await?.ok_or(StoreError::NoActiveVersion)?;
        let target = self.require(version_id).await?;
        Ok(diff_versions(&active, &target))
    }
}
