//! Prism Core - Campaign Asset Resolution & Generation Orchestration
//!
//! # Guarantees
//! 1. Input Outranks Cache, Cache Outranks Generation
//! 2. One Fingerprint, One Asset
//! 3. At Most One Generation Per Key
//! 4. Reports Follow The Matrix, Not The Clock
//! 5. Cell Failures Are Recorded, Not Escalated

pub mod asset;
pub mod cache;
pub mod campaign;
pub mod cancel;
pub mod config;
pub mod generation;
pub mod governor;
pub mod hashing;
pub mod inflight;
pub mod openai;
pub mod orchestrator;
pub mod report;
pub mod resolver;
pub mod telemetry;

pub use asset::{Asset, AssetKey, CachedAsset, InvalidAssetKey};
pub use cache::{CacheStore, FsCacheStore, MemoryCacheStore, StoreError};
pub use campaign::{AspectRatio, CampaignError, CampaignSpec, MatrixCell, ProductSpec};
pub use cancel::CancelToken;
pub use config::{ConfigError, EngineConfig};
pub use generation::{
    AttemptState, GenerationClient, GenerationError, GenerationOutcome, GenerationRequest,
    RequestBuilder, RetryPolicy, RetryingGenerator,
};
pub use governor::{GovernorConfig, GovernorError, RateGovernor};
pub use hashing::{canonical_json, compute_asset_key, sha256_hex};
pub use orchestrator::{BatchOrchestrator, CampaignRun, OrchestratorConfig, OrchestratorError};
pub use report::{CellOutcome, CellRecord, ExecutionReport, ReportSummary, RunStatus};
pub use resolver::{AssetResolver, InputAssetProvider, KeyPolicy, ResolutionOutcome};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
