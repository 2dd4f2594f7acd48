//! Batch Orchestrator - Single Entry Point For Campaign Runs
//!
//! CRITICAL: every cell goes through the resolver, and every generation goes
//! through the in-flight registry. No bypass.
//!
//! Resolution, deduplication and aggregation run on the calling task; only
//! generation is dispatched to the bounded worker pool.

use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::asset::{Asset, AssetKey, CachedAsset};
use crate::cache::{CacheStore, StoreError};
use crate::campaign::{CampaignError, CampaignSpec, MatrixCell};
use crate::cancel::CancelToken;
use crate::generation::{
    AttemptState, GenerationClient, GenerationOutcome, GenerationRequest, RetryPolicy,
    RetryingGenerator,
};
use crate::governor::RateGovernor;
use crate::inflight::{Claim, InFlightRegistry};
use crate::report::{CellOutcome, CellRecord, ExecutionReport, ReportSummary, RunStatus};
use crate::resolver::{AssetResolver, ResolutionOutcome, ResolveError};
use crate::ENGINE_VERSION;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Campaign(#[from] CampaignError),

    #[error("Cache conflict for key {key}: fingerprint invariant violated")]
    CacheConflict { key: AssetKey },

    #[error("Cache store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Fail-fast: cell {cell} failed: {reason}")]
    FailFast {
        cell: MatrixCell,
        reason: String,
        report: Box<ExecutionReport>,
    },

    #[error("Generation worker failed: {0}")]
    Worker(String),
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::CacheConflict { key } => OrchestratorError::CacheConflict { key },
            other => OrchestratorError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<ResolveError> for OrchestratorError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::Store(store) => store.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrent generation requests.
    pub max_workers: usize,
    /// Stop dispatching and fail the run on the first failed cell.
    pub fail_fast: bool,
    /// How long in-flight calls may run after cancellation.
    pub cancel_grace_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            fail_fast: false,
            cancel_grace_ms: 30_000,
        }
    }
}

/// Report plus the resolved assets, aligned with `report.records`.
#[derive(Debug, Clone)]
pub struct CampaignRun {
    pub report: ExecutionReport,
    pub assets: Vec<Option<Asset>>,
}

impl CampaignRun {
    /// Cells that ended with an asset.
    pub fn outputs(&self) -> impl Iterator<Item = (&CellRecord, &Asset)> {
        self.report
            .records
            .iter()
            .zip(&self.assets)
            .filter_map(|(record, asset)| asset.as_ref().map(|a| (record, a)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedAction {
    UseInput,
    UseCache,
    Generate,
    Fail,
}

/// Dry-run view of one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedCell {
    pub index: usize,
    #[serde(flatten)]
    pub cell: MatrixCell,
    pub action: PlannedAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_key: Option<AssetKey>,
    /// Index of the cell whose generation this cell will share.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shares_with: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// What one key's generation produced. Shared by every waiter of the key.
#[derive(Debug)]
struct KeyResult {
    asset: Option<Asset>,
    outcome: CellOutcome,
    error: Option<String>,
    attempts: u32,
    calls: u32,
    cost: f64,
    latency: Duration,
    /// The producer's own run stopped it. Says nothing about the key itself.
    interrupted: bool,
}

impl KeyResult {
    fn from_generation(outcome: GenerationOutcome) -> Self {
        let interrupted = outcome.state == AttemptState::Cancelled;
        let (asset, cell_outcome, error) = match outcome.result {
            Ok(asset) => (Some(asset), CellOutcome::Generated, None),
            Err(e) => (
                None,
                CellOutcome::Failed,
                Some(format!("{e} ({:?} after {} attempts)", outcome.state, outcome.attempts)),
            ),
        };
        Self {
            asset,
            outcome: cell_outcome,
            error,
            attempts: outcome.attempts,
            calls: outcome.calls,
            cost: outcome.cost,
            latency: outcome.latency,
            interrupted,
        }
    }

    fn cached(asset: Asset) -> Self {
        Self {
            asset: Some(asset),
            outcome: CellOutcome::Cache,
            error: None,
            attempts: 0,
            calls: 0,
            cost: 0.0,
            latency: Duration::ZERO,
            interrupted: false,
        }
    }

    fn cancelled(reason: &str) -> Self {
        Self {
            asset: None,
            outcome: CellOutcome::Failed,
            error: Some(reason.to_string()),
            attempts: 0,
            calls: 0,
            cost: 0.0,
            latency: Duration::ZERO,
            interrupted: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Producer,
    Waiter,
}

struct KeyReport {
    result: Arc<KeyResult>,
    role: Role,
}

enum CellState {
    Ready {
        outcome: CellOutcome,
        asset: Asset,
        key: Option<AssetKey>,
        latency: Duration,
    },
    Pending {
        key: AssetKey,
    },
    Failed {
        reason: String,
        latency: Duration,
    },
}

struct PendingKey {
    request: GenerationRequest,
    cells: Vec<usize>,
}

/// Everything a pool worker needs, cheap to clone into a task.
#[derive(Clone)]
struct GenerationWorker {
    cache: Arc<dyn CacheStore>,
    generator: Arc<RetryingGenerator>,
    inflight: InFlightRegistry<Arc<KeyResult>>,
}

impl GenerationWorker {
    /// Generate `request.key` once across every run sharing the registry.
    ///
    /// A waiter whose producer was stopped by that producer's own run claims
    /// the key again instead of inheriting the stop. Only `halt` can stop
    /// this run's cell.
    async fn produce(
        self,
        request: GenerationRequest,
        halt: &CancelToken,
    ) -> Result<KeyReport, OrchestratorError> {
        let ticket = loop {
            let waiter = match self.inflight.claim(&request.key) {
                Claim::Producer(ticket) => break ticket,
                Claim::Waiter(waiter) => waiter,
            };
            debug!(key = %request.key.short(), "joining in-flight generation");
            let published = tokio::select! {
                published = waiter.wait() => published,
                _ = halt.cancelled() => {
                    return Ok(KeyReport {
                        result: Arc::new(KeyResult::cancelled(
                            "cancelled while waiting for in-flight generation",
                        )),
                        role: Role::Waiter,
                    });
                }
            };
            match published {
                Some(result) if !result.interrupted => {
                    return Ok(KeyReport {
                        result,
                        role: Role::Waiter,
                    })
                }
                _ => debug!(key = %request.key.short(), "in-flight producer stopped early, claiming key"),
            }
        };

        // The previous producer of this key may have finished after we resolved.
        if let Some(entry) = self.cache.get(&request.key)? {
            let result = Arc::new(KeyResult::cached(entry.asset));
            ticket.complete(Arc::clone(&result));
            return Ok(KeyReport {
                result,
                role: Role::Producer,
            });
        }

        let outcome = self.generator.generate(&request, halt).await;
        if let Ok(asset) = &outcome.result {
            // Write-through before publishing so late claimants hit the cache.
            self.cache
                .put(&CachedAsset::generated(request.key.clone(), asset.clone()))?;
        }

        let result = Arc::new(KeyResult::from_generation(outcome));
        ticket.complete(Arc::clone(&result));
        Ok(KeyReport {
            result,
            role: Role::Producer,
        })
    }
}

/// The campaign orchestrator - single entry point for runs
pub struct BatchOrchestrator {
    resolver: Arc<AssetResolver>,
    worker: GenerationWorker,
    config: OrchestratorConfig,
}

impl BatchOrchestrator {
    pub fn new(
        resolver: AssetResolver,
        cache: Arc<dyn CacheStore>,
        client: Arc<dyn GenerationClient>,
        governor: Arc<RateGovernor>,
        retry: RetryPolicy,
        config: OrchestratorConfig,
    ) -> Self {
        let generator = RetryingGenerator::new(client, governor, retry)
            .with_cancel_grace(Duration::from_millis(config.cancel_grace_ms));
        Self {
            resolver: Arc::new(resolver),
            worker: GenerationWorker {
                cache,
                generator: Arc::new(generator),
                inflight: InFlightRegistry::new(),
            },
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Keys currently being generated by any run of this orchestrator.
    pub fn in_flight(&self) -> usize {
        self.worker.inflight.len()
    }

    /// Run a campaign to completion and return its report.
    pub async fn run(&self, campaign: &CampaignSpec) -> Result<ExecutionReport, OrchestratorError> {
        self.execute(campaign, &CancelToken::new())
            .await
            .map(|run| run.report)
    }

    /// Resolve every cell without generating anything.
    pub fn plan(&self, campaign: &CampaignSpec) -> Result<Vec<PlannedCell>, OrchestratorError> {
        campaign.validate()?;
        let mut first_for_key: HashMap<AssetKey, usize> = HashMap::new();
        let mut planned = Vec::new();

        for (index, cell) in campaign.cells().into_iter().enumerate() {
            let outcome = self.resolver.resolve(campaign, &cell)?;
            let asset_key = outcome.asset_key().cloned();
            let (action, shares_with, reason) = match outcome {
                ResolutionOutcome::ResolvedFromInput { .. } => (PlannedAction::UseInput, None, None),
                ResolutionOutcome::ResolvedFromCache { .. } => (PlannedAction::UseCache, None, None),
                ResolutionOutcome::RequiresGeneration(request) => {
                    let first = *first_for_key.entry(request.key).or_insert(index);
                    let shares_with = (first != index).then_some(first);
                    (PlannedAction::Generate, shares_with, None)
                }
                ResolutionOutcome::Failed { reason } => (PlannedAction::Fail, None, Some(reason)),
            };
            planned.push(PlannedCell {
                index,
                cell,
                action,
                asset_key,
                shares_with,
                reason,
            });
        }

        Ok(planned)
    }

    /// Run a campaign, honouring `cancel`.
    ///
    /// Cell failures end up in the report. Only a broken cache (conflict or
    /// unavailable) or a fail-fast trip aborts with an error.
    #[instrument(skip_all, fields(campaign_id = %campaign.campaign_id))]
    pub async fn execute(
        &self,
        campaign: &CampaignSpec,
        cancel: &CancelToken,
    ) -> Result<CampaignRun, OrchestratorError> {
        campaign.validate()?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        let cells = campaign.cells();
        info!(%run_id, cells = cells.len(), "campaign run started");

        // Phase 1: resolve every cell, grouping generation work by key.
        let mut states = Vec::with_capacity(cells.len());
        let mut pending: IndexMap<AssetKey, PendingKey> = IndexMap::new();
        for (index, cell) in cells.iter().enumerate() {
            let resolve_started = Instant::now();
            let outcome = self.resolver.resolve(campaign, cell)?;
            let latency = resolve_started.elapsed();
            states.push(match outcome {
                ResolutionOutcome::ResolvedFromInput { asset, .. } => CellState::Ready {
                    outcome: CellOutcome::Input,
                    asset,
                    key: None,
                    latency,
                },
                ResolutionOutcome::ResolvedFromCache { asset, key } => CellState::Ready {
                    outcome: CellOutcome::Cache,
                    asset,
                    key: Some(key),
                    latency,
                },
                ResolutionOutcome::RequiresGeneration(request) => {
                    let key = request.key.clone();
                    pending
                        .entry(key.clone())
                        .or_insert_with(|| PendingKey {
                            request,
                            cells: Vec::new(),
                        })
                        .cells
                        .push(index);
                    CellState::Pending { key }
                }
                ResolutionOutcome::Failed { reason } => CellState::Failed { reason, latency },
            });
        }

        let pending_cells: usize = pending.values().map(|p| p.cells.len()).sum();
        info!(
            pending_cells,
            generation_requests = pending.len(),
            resolved = cells.len() - pending_cells,
            "resolution complete"
        );

        // Phase 2: generate each distinct key once.
        let halt = CancelToken::new();
        let resolution_failed = states.iter().any(|s| matches!(s, CellState::Failed { .. }));
        if cancel.is_cancelled() || (self.config.fail_fast && resolution_failed) {
            halt.cancel();
        }
        let mut results: HashMap<AssetKey, KeyReport> = HashMap::new();
        if !halt.is_cancelled() && !pending.is_empty() {
            self.dispatch(&pending, cancel, &halt, &mut results).await?;
        }

        // Phase 3: aggregate in matrix order.
        let mut records = Vec::with_capacity(cells.len());
        let mut assets = Vec::with_capacity(cells.len());
        let mut charged: HashSet<AssetKey> = HashSet::new();
        let mut generation_calls = 0u32;

        for (index, (cell, state)) in cells.into_iter().zip(states).enumerate() {
            let (record, asset) = match state {
                CellState::Ready {
                    outcome,
                    asset,
                    key,
                    latency,
                } => (
                    CellRecord {
                        index,
                        cell,
                        outcome,
                        asset_key: key,
                        content_sha256: Some(asset.sha256()),
                        latency_ms: millis(latency),
                        cost: 0.0,
                        attempts: 0,
                        deduplicated: false,
                        error: None,
                    },
                    Some(asset),
                ),
                CellState::Failed { reason, latency } => (
                    failed_record(index, cell, None, latency, reason),
                    None,
                ),
                CellState::Pending { key } => match results.get(&key) {
                    Some(report) => {
                        let first = charged.insert(key.clone());
                        let charge = first && report.role == Role::Producer;
                        let result = &report.result;
                        if charge {
                            generation_calls += result.calls;
                        }
                        (
                            CellRecord {
                                index,
                                cell,
                                outcome: result.outcome,
                                asset_key: Some(key),
                                content_sha256: result.asset.as_ref().map(Asset::sha256),
                                latency_ms: millis(result.latency),
                                cost: if charge { result.cost } else { 0.0 },
                                attempts: if charge { result.attempts } else { 0 },
                                deduplicated: !charge && result.outcome != CellOutcome::Cache,
                                error: result.error.clone(),
                            },
                            result.asset.clone(),
                        )
                    }
                    None => {
                        let reason = if cancel.is_cancelled() {
                            "cancelled before dispatch"
                        } else {
                            "not dispatched: run halted by fail-fast"
                        };
                        (
                            failed_record(index, cell, Some(key), Duration::ZERO, reason.to_string()),
                            None,
                        )
                    }
                },
            };
            records.push(record);
            assets.push(asset);
        }

        let generation_requests = results
            .values()
            .filter(|r| r.role == Role::Producer && r.result.outcome != CellOutcome::Cache)
            .count();
        let summary = ReportSummary::from_records(&records, generation_requests, generation_calls);
        let status = if cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if summary.failed == 0 {
            RunStatus::Succeeded
        } else if self.config.fail_fast {
            RunStatus::Failed
        } else {
            RunStatus::PartiallySucceeded
        };

        let report = ExecutionReport {
            run_id,
            campaign_id: campaign.campaign_id.clone(),
            engine_version: ENGINE_VERSION.to_string(),
            started_at,
            finished_at: Utc::now(),
            duration_ms: millis(clock.elapsed()),
            status,
            worker_count: self.config.max_workers,
            locale_in_key: self.resolver.key_policy().locale_in_key,
            summary,
            records,
        };

        info!(
            %run_id,
            status = ?report.status,
            generated = report.summary.generated,
            from_cache = report.summary.from_cache,
            from_input = report.summary.from_input,
            failed = report.summary.failed,
            total_cost = report.summary.total_cost,
            "campaign run finished"
        );

        if report.status == RunStatus::Failed {
            let first = report
                .failed_records()
                .next()
                .map(|r| (r.cell.clone(), r.error.clone().unwrap_or_default()));
            if let Some((cell, reason)) = first {
                return Err(OrchestratorError::FailFast {
                    cell,
                    reason,
                    report: Box::new(report),
                });
            }
        }

        Ok(CampaignRun { report, assets })
    }

    /// Spawn one task per key on a bounded pool and collect results as they
    /// complete. External cancellation and fail-fast both trip `halt`.
    async fn dispatch(
        &self,
        pending: &IndexMap<AssetKey, PendingKey>,
        cancel: &CancelToken,
        halt: &CancelToken,
        results: &mut HashMap<AssetKey, KeyReport>,
    ) -> Result<(), OrchestratorError> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut workers = JoinSet::new();

        for job in pending.values() {
            let worker = self.worker.clone();
            let request = job.request.clone();
            let semaphore = Arc::clone(&semaphore);
            let halt = halt.clone();
            workers.spawn(async move {
                let key = request.key.clone();
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (key, Ok(None));
                };
                if halt.is_cancelled() {
                    return (key, Ok(None));
                }
                (key, worker.produce(request, &halt).await.map(Some))
            });
        }

        let mut cancel_seen = false;
        loop {
            tokio::select! {
                joined = workers.join_next() => {
                    let Some(joined) = joined else { break };
                    let (key, result) = joined.map_err(|e| OrchestratorError::Worker(e.to_string()))?;
                    match result {
                        Ok(Some(report)) => {
                            if self.config.fail_fast
                                && report.result.outcome == CellOutcome::Failed
                                && !halt.is_cancelled()
                            {
                                warn!(key = %key.short(), "fail-fast: halting generation dispatch");
                                halt.cancel();
                            }
                            results.insert(key, report);
                        }
                        Ok(None) => debug!(key = %key.short(), "generation skipped: run halted"),
                        Err(fatal) => {
                            warn!(error = %fatal, "fatal error, aborting run");
                            workers.abort_all();
                            return Err(fatal);
                        }
                    }
                }
                _ = cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    info!("cancellation requested, halting generation dispatch");
                    halt.cancel();
                }
            }
        }

        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn failed_record(
    index: usize,
    cell: MatrixCell,
    key: Option<AssetKey>,
    latency: Duration,
    reason: String,
) -> CellRecord {
    CellRecord {
        index,
        cell,
        outcome: CellOutcome::Failed,
        asset_key: key,
        content_sha256: None,
        latency_ms: millis(latency),
        cost: 0.0,
        attempts: 0,
        deduplicated: false,
        error: Some(reason),
    }
}
