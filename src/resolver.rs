//! Asset Resolver - Ordered Lookup Chain
//!
//! Strategies produce candidate assets.
//! The resolver walks them in fixed order and stops at the first hit.
//!
//! Default chain: specific override -> generic override -> cache -> generate.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::asset::{Asset, AssetKey};
use crate::cache::{CacheStore, StoreError};
use crate::campaign::{AspectRatio, CampaignSpec, MatrixCell, ProductSpec};
use crate::generation::{GenerationRequest, RequestBuilder};
use crate::hashing::{compute_asset_key, Fingerprint};
use serde_json::Value;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
#[error("Input asset lookup failed for {path}: {reason}")]
pub struct ProviderError {
    pub path: String,
    pub reason: String,
}

/// Everything a strategy or request builder may look at for one cell.
#[derive(Debug, Clone, Copy)]
pub struct CellContext<'a> {
    pub campaign: &'a CampaignSpec,
    pub product: &'a ProductSpec,
    pub cell: &'a MatrixCell,
    /// Locale the generated asset depends on, if locales generate separately.
    pub key_locale: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionOutcome {
    ResolvedFromInput { asset: Asset, strategy: &'static str },
    ResolvedFromCache { asset: Asset, key: AssetKey },
    RequiresGeneration(GenerationRequest),
    Failed { reason: String },
}

impl ResolutionOutcome {
    pub fn asset_key(&self) -> Option<&AssetKey> {
        match self {
            ResolutionOutcome::ResolvedFromCache { key, .. } => Some(key),
            ResolutionOutcome::RequiresGeneration(request) => Some(&request.key),
            _ => None,
        }
    }
}

/// Source of user-supplied assets. `aspect_ratio = None` asks for an asset
/// usable at any ratio.
pub trait InputAssetProvider: Send + Sync {
    fn lookup(
        &self,
        campaign_id: &str,
        product_id: &str,
        aspect_ratio: Option<AspectRatio>,
    ) -> Result<Option<Asset>, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Input,
    Cache,
}

/// One link of the priority chain.
pub trait ResolverStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> StrategyKind;
    fn lookup(&self, ctx: &CellContext<'_>, key: &AssetKey) -> Result<Option<Asset>, StoreError>;
}

// --- Concrete Strategies ---

pub struct SpecificOverride {
    provider: Arc<dyn InputAssetProvider>,
}

impl ResolverStrategy for SpecificOverride {
    fn name(&self) -> &'static str { "specific_override" }

    fn kind(&self) -> StrategyKind { StrategyKind::Input }

    fn lookup(&self, ctx: &CellContext<'_>, _key: &AssetKey) -> Result<Option<Asset>, StoreError> {
        Ok(lookup_input(
            self.provider.as_ref(),
            ctx,
            Some(ctx.cell.aspect_ratio),
        ))
    }
}

pub struct GenericOverride {
    provider: Arc<dyn InputAssetProvider>,
}

impl ResolverStrategy for GenericOverride {
    fn name(&self) -> &'static str { "generic_override" }

    fn kind(&self) -> StrategyKind { StrategyKind::Input }

    fn lookup(&self, ctx: &CellContext<'_>, _key: &AssetKey) -> Result<Option<Asset>, StoreError> {
        Ok(lookup_input(self.provider.as_ref(), ctx, None))
    }
}

/// Unreadable input assets fall through to the next strategy.
fn lookup_input(
    provider: &dyn InputAssetProvider,
    ctx: &CellContext<'_>,
    ratio: Option<AspectRatio>,
) -> Option<Asset> {
    match provider.lookup(&ctx.campaign.campaign_id, &ctx.product.id, ratio) {
        Ok(found) => found,
        Err(e) => {
            warn!(cell = %ctx.cell, error = %e, "ignoring unreadable input asset");
            None
        }
    }
}

pub struct CacheLookup {
    cache: Arc<dyn CacheStore>,
}

impl ResolverStrategy for CacheLookup {
    fn name(&self) -> &'static str { "cache" }

    fn kind(&self) -> StrategyKind { StrategyKind::Cache }

    fn lookup(&self, _ctx: &CellContext<'_>, key: &AssetKey) -> Result<Option<Asset>, StoreError> {
        Ok(self.cache.get(key)?.map(|entry| entry.asset))
    }
}

/// Which parameters feed the asset fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPolicy {
    /// When false, locales of the same product/ratio share one generated asset.
    pub locale_in_key: bool,
    /// Model/quality identity of the generation service.
    pub generator_profile: String,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            locale_in_key: false,
            generator_profile: "default".to_string(),
        }
    }
}

impl KeyPolicy {
    /// `request` is the payload built for the cell; it is hashed with the brief.
    pub fn asset_key(
        &self,
        campaign: &CampaignSpec,
        product: &ProductSpec,
        cell: &MatrixCell,
        request: &Value,
    ) -> Result<AssetKey, serde_json::Error> {
        compute_asset_key(&Fingerprint {
            campaign_id: &campaign.campaign_id,
            product_id: &product.id,
            product_name: &product.name,
            product_category: &product.category,
            aspect_ratio: cell.aspect_ratio,
            campaign_message: &campaign.campaign_message,
            campaign_parameters: &campaign.parameters,
            creative: &product.creative,
            generator_profile: &self.generator_profile,
            locale: self.locale_in_key.then_some(cell.locale.as_str()),
            request,
        })
    }
}

pub struct AssetResolver {
    strategies: Vec<Box<dyn ResolverStrategy>>,
    request_builder: Arc<dyn RequestBuilder>,
    key_policy: KeyPolicy,
}

impl AssetResolver {
    /// Standard chain: specific override, generic override, cache.
    pub fn new(
        inputs: Arc<dyn InputAssetProvider>,
        cache: Arc<dyn CacheStore>,
        request_builder: Arc<dyn RequestBuilder>,
        key_policy: KeyPolicy,
    ) -> Self {
        Self::with_strategies(
            vec![
                Box::new(SpecificOverride {
                    provider: Arc::clone(&inputs),
                }),
                Box::new(GenericOverride { provider: inputs }),
                Box::new(CacheLookup { cache }),
            ],
            request_builder,
            key_policy,
        )
    }

    pub fn with_strategies(
        strategies: Vec<Box<dyn ResolverStrategy>>,
        request_builder: Arc<dyn RequestBuilder>,
        key_policy: KeyPolicy,
    ) -> Self {
        Self {
            strategies,
            request_builder,
            key_policy,
        }
    }

    pub fn key_policy(&self) -> &KeyPolicy {
        &self.key_policy
    }

    fn context<'a>(
        &self,
        campaign: &'a CampaignSpec,
        product: &'a ProductSpec,
        cell: &'a MatrixCell,
    ) -> CellContext<'a> {
        CellContext {
            campaign,
            product,
            cell,
            key_locale: self.key_policy.locale_in_key.then_some(cell.locale.as_str()),
        }
    }

    /// Key a cell would be cached under, with the request that feeds it.
    /// `None` when the cell names a product the brief does not define.
    pub fn asset_key(
        &self,
        campaign: &CampaignSpec,
        cell: &MatrixCell,
    ) -> Result<Option<AssetKey>, serde_json::Error> {
        let Some(product) = campaign.product(&cell.product_id) else {
            return Ok(None);
        };
        let payload = self.request_builder.build(&self.context(campaign, product, cell));
        self.key_policy
            .asset_key(campaign, product, cell, &payload)
            .map(Some)
    }

    /// Resolve one cell. Only a failing cache store is an error; everything
    /// else is expressed as an outcome.
    pub fn resolve(
        &self,
        campaign: &CampaignSpec,
        cell: &MatrixCell,
    ) -> Result<ResolutionOutcome, ResolveError> {
        let Some(product) = campaign.product(&cell.product_id) else {
            return Ok(ResolutionOutcome::Failed {
                reason: format!("unknown product '{}'", cell.product_id),
            });
        };

        let ctx = self.context(campaign, product, cell);
        let payload = self.request_builder.build(&ctx);
        let key = match self.key_policy.asset_key(campaign, product, cell, &payload) {
            Ok(key) => key,
            Err(e) => {
                return Ok(ResolutionOutcome::Failed {
                    reason: format!("fingerprint failed: {e}"),
                })
            }
        };

        for strategy in &self.strategies {
            if let Some(asset) = strategy.lookup(&ctx, &key)? {
                debug!(cell = %cell, strategy = strategy.name(), "resolved");
                return Ok(match strategy.kind() {
                    StrategyKind::Input => ResolutionOutcome::ResolvedFromInput {
                        asset,
                        strategy: strategy.name(),
                    },
                    StrategyKind::Cache => ResolutionOutcome::ResolvedFromCache { asset, key },
                });
            }
        }

        debug!(cell = %cell, key = %key.short(), "requires generation");
        Ok(ResolutionOutcome::RequiresGeneration(GenerationRequest {
            key,
            cell: cell.clone(),
            payload,
        }))
    }
}

// --- Input Providers ---

/// In-memory provider, keyed by (campaign, product, ratio).
#[derive(Default)]
pub struct MemoryInputProvider {
    assets: HashMap<(String, String, Option<AspectRatio>), Asset>,
}

impl MemoryInputProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_specific(
        mut self,
        campaign_id: &str,
        product_id: &str,
        ratio: AspectRatio,
        asset: Asset,
    ) -> Self {
        self.assets
            .insert((campaign_id.into(), product_id.into(), Some(ratio)), asset);
        self
    }

    pub fn with_generic(mut self, campaign_id: &str, product_id: &str, asset: Asset) -> Self {
        self.assets
            .insert((campaign_id.into(), product_id.into(), None), asset);
        self
    }
}

impl InputAssetProvider for MemoryInputProvider {
    fn lookup(
        &self,
        campaign_id: &str,
        product_id: &str,
        aspect_ratio: Option<AspectRatio>,
    ) -> Result<Option<Asset>, ProviderError> {
        Ok(self
            .assets
            .get(&(campaign_id.to_string(), product_id.to_string(), aspect_ratio))
            .cloned())
    }
}

const INPUT_EXTENSIONS: [(&str, &str); 4] = [
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("webp", "image/webp"),
];

/// Filesystem provider.
///
/// Specific: `<root>/<campaign>/<product>_<ratio>.<ext>`
/// Generic:  `<root>/<campaign>/<product>.<ext>`, then `<root>/<product>.<ext>`
pub struct DirInputProvider {
    root: PathBuf,
}

impl DirInputProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn candidates(
        &self,
        campaign_id: &str,
        product_id: &str,
        aspect_ratio: Option<AspectRatio>,
    ) -> Vec<PathBuf> {
        let stems = match aspect_ratio {
            Some(ratio) => vec![self
                .root
                .join(campaign_id)
                .join(format!("{}_{}", product_id, ratio))],
            None => vec![
                self.root.join(campaign_id).join(product_id),
                self.root.join(product_id),
            ],
        };
        stems
            .into_iter()
            .flat_map(|stem| {
                INPUT_EXTENSIONS
                    .iter()
                    .map(move |(ext, _)| stem.with_extension(ext))
            })
            .collect()
    }

    fn read(path: &Path) -> Result<Option<Asset>, ProviderError> {
        match fs::read(path) {
            Ok(data) => {
                let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("png");
                let content_type = INPUT_EXTENSIONS
                    .iter()
                    .find(|(e, _)| *e == ext)
                    .map_or("image/png", |(_, ct)| *ct);
                Ok(Some(Asset::new(data, content_type)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProviderError {
                path: path.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

impl InputAssetProvider for DirInputProvider {
    fn lookup(
        &self,
        campaign_id: &str,
        product_id: &str,
        aspect_ratio: Option<AspectRatio>,
    ) -> Result<Option<Asset>, ProviderError> {
        for path in self.candidates(campaign_id, product_id, aspect_ratio) {
            if let Some(asset) = Self::read(&path)? {
                debug!(path = %path.display(), "input asset found");
                return Ok(Some(asset));
            }
        }
        Ok(None)
    }
}
