//! # memory-refinery - lifecycle and consolidation engine for agent memory
//!
//! Scores memories by time-decaying priority, groups them into temporal
//! windows, consolidates each window into a summary under bitemporal rules,
//! and applies untrusted agent plans to the store behind a validation gate.

pub mod actions;
pub mod config;
pub mod consolidation;
pub mod error;
pub mod priority;
pub mod reconsolidation;
pub mod refine;
pub mod report;
pub mod storage;
pub mod store;
pub mod temporal;
pub mod types;
pub mod validation;
pub mod windowing;

pub use actions::{
    ActionKind, CreateAction, DeleteAction, MergeAction, NewMemory, RefinementAction,
    UpdateAction,
};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use consolidation::{consolidation_hash, ConsolidateArgs, ConsolidationOrchestrator};
pub use error::{MemoryError, Result, StorageDiagnostics};
pub use priority::{PriorityBreakdown, PriorityModel, PriorityWeights};
pub use reconsolidation::{
    ReconsolidationConfig, ReconsolidationExecutor, ReconsolidationPlan, SupersessionError,
    SupersessionPair, SupersessionTarget,
};
pub use refine::{MergeDisposal, RefineConfig, RefineConfigBuilder, RefinementExecutor};
pub use report::{
    ActionOutcome, ActionStatus, ConsolidationReport, RefineMemoriesResult, RefineStatus,
    WindowReport, WindowStatus,
};
pub use storage::{MemoryStorage, UpsertDefaults};
pub use store::SqliteStore;
pub use temporal::{
    ConsolidationValidation, CycleReport, EdgeCheck, RelationshipValidation, TemporalConfig,
    TemporalPolicy, TemporalValidator,
};
pub use types::{
    Importance, MemoryId, MemoryKind, MemoryMetadata, MemoryRecord, MemoryType, ProtectionClass,
    RelationType, Relationship, Stability, SupersededPair,
};
pub use validation::{ActionPlanValidator, ValidationContext, ValidationOutcome};
pub use windowing::{
    ConsolidationWindow, WindowAlignment, WindowDetection, WindowingConfig,
    WindowingConfigBuilder, WindowingStrategy,
};

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Entry point wiring every component to one storage backend
#[derive(Clone)]
pub struct Refinery {
    storage: Arc<dyn MemoryStorage>,
    config: EngineConfig,
    data_dir: Option<PathBuf>,
}

impl std::fmt::Debug for Refinery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Refinery")
            .field("backend", &self.storage.backend_name())
            .field("data_dir", &self.data_dir)
            .finish()
    }
}

impl Refinery {
    pub fn new(storage: Arc<dyn MemoryStorage>, config: EngineConfig) -> Self {
        Self {
            storage,
            config,
            data_dir: None,
        }
    }

    /// Open (or create) the SQLite store under `data_dir`
    pub async fn open(data_dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let store = SqliteStore::open(data_dir.join("refinery.db")).await?;
        tracing::debug!("Opened refinery store in {}", data_dir.display());

        Ok(Self {
            storage: store,
            config,
            data_dir: Some(data_dir),
        })
    }

    pub async fn in_memory(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(SqliteStore::connect_in_memory().await?, config))
    }

    pub fn storage(&self) -> &Arc<dyn MemoryStorage> {
        &self.storage
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn validator(&self) -> TemporalValidator {
        TemporalValidator::new(self.config.temporal.clone())
    }

    pub fn orchestrator(&self) -> ConsolidationOrchestrator {
        ConsolidationOrchestrator::new(
            Arc::clone(&self.storage),
            WindowingStrategy::new(self.config.windowing.clone()),
            self.validator(),
            self.config.default_policy,
        )
    }

    pub fn refinement_executor(&self) -> RefinementExecutor {
        RefinementExecutor::new(
            Arc::clone(&self.storage),
            self.validator(),
            self.config.refine.clone(),
        )
    }

    pub fn reconsolidation_executor(&self) -> ReconsolidationExecutor {
        ReconsolidationExecutor::new(
            Arc::clone(&self.storage),
            self.validator(),
            self.config.reconsolidation.clone(),
        )
    }

    /// Store records, scoring each with the priority model
    pub async fn add_memories(
        &self,
        index: &str,
        records: &[MemoryRecord],
        defaults: Option<&UpsertDefaults>,
    ) -> Result<Vec<MemoryId>> {
        self.add_memories_at(index, records, defaults, Utc::now()).await
    }

    pub async fn add_memories_at(
        &self,
        index: &str,
        records: &[MemoryRecord],
        defaults: Option<&UpsertDefaults>,
        now: DateTime<Utc>,
    ) -> Result<Vec<MemoryId>> {
        let scored: Vec<MemoryRecord> = records
            .iter()
            .cloned()
            .map(|mut record| {
                let score = PriorityModel::refresh(&mut record, now);
                record.metadata.dynamics.initial_priority = score;
                record
            })
            .collect();
        self.storage.upsert_memories(index, &scored, defaults).await
    }

    /// Store records with the priority they already carry
    pub async fn add_memories_pinned(
        &self,
        index: &str,
        records: &[MemoryRecord],
        defaults: Option<&UpsertDefaults>,
    ) -> Result<Vec<MemoryId>> {
        self.storage.upsert_memories(index, records, defaults).await
    }

    /// Priority of a stored record, with the factors behind it
    pub async fn priority(&self, index: &str, id: &str, now: DateTime<Utc>) -> Result<PriorityBreakdown> {
        let record = self
            .storage
            .get_memory(index, id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        Ok(PriorityModel::breakdown(&record, now))
    }

    /// Windows over the live raw memories of `index`
    pub async fn detect_windows(&self, index: &str) -> Result<WindowDetection> {
        let memories: Vec<MemoryRecord> = self
            .storage
            .list_memories(index, None)
            .await?
            .into_iter()
            .filter(|m| m.metadata.kind != MemoryKind::Summary)
            .collect();
        Ok(WindowingStrategy::new(self.config.windowing.clone()).detect_windows(&memories))
    }

    /// Consolidate every live memory of `index`
    pub async fn consolidate(&self, index: &str, args: &ConsolidateArgs) -> Result<RefineMemoriesResult> {
        let sources = self.storage.list_memories(index, None).await?;
        Ok(self.orchestrator().execute(args, index, &sources).await)
    }

    /// Consolidate an explicit source set
    pub async fn consolidate_sources(
        &self,
        index: &str,
        args: &ConsolidateArgs,
        sources: &[MemoryRecord],
    ) -> RefineMemoriesResult {
        self.orchestrator().execute(args, index, sources).await
    }

    pub async fn apply_actions(&self, index: &str, actions: &[Value], dry_run: bool) -> RefineMemoriesResult {
        self.refinement_executor().execute(actions, index, dry_run).await
    }

    pub async fn reconsolidate(
        &self,
        index: &str,
        plan: &ReconsolidationPlan,
        valid_ids: &[MemoryId],
    ) -> ConsolidationReport {
        self.reconsolidation_executor()
            .execute(plan, index, valid_ids)
            .await
    }

    /// Count a retrieval of `id` and rescore it
    pub async fn record_access(&self, index: &str, id: &str, now: DateTime<Utc>) -> Result<MemoryRecord> {
        let mut record = self
            .storage
            .get_memory(index, id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;

        let dynamics = &mut record.metadata.dynamics;
        dynamics.access_count = dynamics.access_count.saturating_add(1);
        dynamics.max_access_count = dynamics.max_access_count.max(dynamics.access_count);
        dynamics.last_accessed_at = Some(now);
        PriorityModel::refresh(&mut record, now);

        // Edges are untouched by an access
        record.metadata.relationships = None;
        self.storage
            .upsert_memories(index, std::slice::from_ref(&record), None)
            .await?;
        tracing::debug!(
            "Access {} on '{}', priority now {:.3}",
            record.metadata.dynamics.access_count,
            id,
            record.metadata.dynamics.current_priority
        );
        Ok(record)
    }
}
