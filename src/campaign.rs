//! Campaign Model - Briefs and the Asset Matrix
//!
//! A campaign expands into one matrix cell per required output asset:
//! products (brief order) x aspect ratios (canonical order) x locales (brief order).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

pub type CampaignId = String;
pub type ProductId = String;

#[derive(Debug, Error)]
pub enum CampaignError {
    #[error("Failed to read campaign brief: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid campaign brief JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid campaign: {0}")]
    Invalid(String),

    #[error("Unknown aspect ratio: {0}")]
    UnknownAspectRatio(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "1x1", alias = "1:1")]
    Square,
    #[serde(rename = "9x16", alias = "9:16")]
    Vertical,
    #[serde(rename = "16x9", alias = "16:9")]
    Horizontal,
}

impl AspectRatio {
    /// Canonical enumeration order for the matrix.
    pub const ALL: [AspectRatio; 3] = [
        AspectRatio::Square,
        AspectRatio::Vertical,
        AspectRatio::Horizontal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Square => "1x1",
            AspectRatio::Vertical => "9x16",
            AspectRatio::Horizontal => "16x9",
        }
    }

    /// Pixel size requested from the generation service.
    pub fn generation_size(&self) -> [u32; 2] {
        match self {
            AspectRatio::Square => [1024, 1024],
            AspectRatio::Vertical => [1024, 1792],
            AspectRatio::Horizontal => [1792, 1024],
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AspectRatio {
    type Err = CampaignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1x1" | "1:1" => Ok(AspectRatio::Square),
            "9x16" | "9:16" => Ok(AspectRatio::Vertical),
            "16x9" | "16:9" => Ok(AspectRatio::Horizontal),
            other => Err(CampaignError::UnknownAspectRatio(other.to_string())),
        }
    }
}

/// A product to render. Fields other than id/name/category are kept as
/// opaque creative parameters for the request builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSpec {
    pub id: ProductId,
    pub name: String,
    pub category: String,
    #[serde(flatten)]
    pub creative: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignSpec {
    #[serde(alias = "id")]
    pub campaign_id: CampaignId,
    pub campaign_message: String,
    #[serde(default = "default_locales")]
    pub locales: Vec<String>,
    pub products: Vec<ProductSpec>,
    /// Campaign-level parameters such as region or target audience.
    #[serde(flatten)]
    pub parameters: BTreeMap<String, Value>,
}

fn default_locales() -> Vec<String> {
    vec!["en".to_string()]
}

/// One required output: (product, aspect ratio, locale).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatrixCell {
    pub product_id: ProductId,
    pub aspect_ratio: AspectRatio,
    pub locale: String,
}

impl MatrixCell {
    pub fn new(product_id: impl Into<String>, aspect_ratio: AspectRatio, locale: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            aspect_ratio,
            locale: locale.into(),
        }
    }
}

impl fmt::Display for MatrixCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.product_id, self.aspect_ratio, self.locale)
    }
}

impl CampaignSpec {
    pub fn load(path: &Path) -> Result<Self, CampaignError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, CampaignError> {
        let campaign: CampaignSpec = serde_json::from_str(content)?;
        campaign.validate()?;
        Ok(campaign)
    }

    /// Structural checks the engine relies on: filesystem-safe identifiers,
    /// non-empty and unique products and locales.
    pub fn validate(&self) -> Result<(), CampaignError> {
        if !is_token(&self.campaign_id) {
            return Err(CampaignError::Invalid(format!(
                "campaign_id '{}' must match [a-z0-9_-]+",
                self.campaign_id
            )));
        }
        if self.products.is_empty() {
            return Err(CampaignError::Invalid("campaign has no products".into()));
        }
        if self.locales.is_empty() {
            return Err(CampaignError::Invalid("campaign has no locales".into()));
        }

        let mut seen = HashSet::new();
        for product in &self.products {
            if !is_token(&product.id) {
                return Err(CampaignError::Invalid(format!(
                    "product id '{}' must match [a-z0-9_-]+",
                    product.id
                )));
            }
            if !seen.insert(product.id.as_str()) {
                return Err(CampaignError::Invalid(format!(
                    "duplicate product id '{}'",
                    product.id
                )));
            }
        }

        let mut locales = HashSet::new();
        for locale in &self.locales {
            if locale.trim().is_empty() || !locales.insert(locale.as_str()) {
                return Err(CampaignError::Invalid(format!(
                    "locale '{}' is empty or duplicated",
                    locale
                )));
            }
        }

        Ok(())
    }

    pub fn product(&self, id: &str) -> Option<&ProductSpec> {
        self.products.iter().find(|p| p.id == id)
    }

    /// Expand into matrix cells in canonical order.
    pub fn cells(&self) -> Vec<MatrixCell> {
        let mut cells =
            Vec::with_capacity(self.products.len() * AspectRatio::ALL.len() * self.locales.len());
        for product in &self.products {
            for ratio in AspectRatio::ALL {
                for locale in &self.locales {
                    cells.push(MatrixCell::new(product.id.clone(), ratio, locale.clone()));
                }
            }
        }
        cells
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    const BRIEF: &str = r#"{
        "campaign_id": "summer_launch",
        "region": "EU",
        "target_audience": "urban commuters",
        "campaign_message": "Stay fresh all summer",
        "locales": ["en", "de"],
        "products": [
            {"id": "eco_bottle", "name": "Eco Bottle", "category": "drinkware",
             "creative_brief": {"setting": "studio", "mood": "calm"}},
            {"id": "sun_cap", "name": "Sun Cap", "category": "apparel"}
        ]
    }"#;

    #[test]
    fn test_parse_keeps_opaque_parameters() {
        let campaign = CampaignSpec::from_json_str(BRIEF).unwrap();
        assert_eq!(campaign.parameters.get("region").unwrap(), "EU");
        let bottle = campaign.product("eco_bottle").unwrap();
        assert!(bottle.creative.contains_key("creative_brief"));
        assert!(!bottle.creative.contains_key("name"));
    }

    #[test]
    fn test_cells_canonical_order() {
        let campaign = CampaignSpec::from_json_str(BRIEF).unwrap();
        let cells = campaign.cells();
        assert_eq!(cells.len(), 12);
        assert_eq!(cells[0], MatrixCell::new("eco_bottle", AspectRatio::Square, "en"));
        assert_eq!(cells[1], MatrixCell::new("eco_bottle", AspectRatio::Square, "de"));
        assert_eq!(cells[2], MatrixCell::new("eco_bottle", AspectRatio::Vertical, "en"));
        assert_eq!(cells[5], MatrixCell::new("eco_bottle", AspectRatio::Horizontal, "de"));
        assert_eq!(cells[6], MatrixCell::new("sun_cap", AspectRatio::Square, "en"));
    }

    #[test]
    fn test_default_locale() {
        let brief = r#"{"campaign_id": "c1", "campaign_message": "hello there",
            "products": [{"id": "p1", "name": "P", "category": "x"}]}"#;
        let campaign = CampaignSpec::from_json_str(brief).unwrap();
        assert_eq!(campaign.locales, vec!["en".to_string()]);
    }

    #[test]
    fn test_rejects_unsafe_ids() {
        let brief = r#"{"campaign_id": "Summer Launch", "campaign_message": "hello there",
            "products": [{"id": "p1", "name": "P", "category": "x"}]}"#;
        assert!(matches!(
            CampaignSpec::from_json_str(brief),
            Err(CampaignError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_products() {
        let brief = r#"{"campaign_id": "c1", "campaign_message": "hello there",
            "products": [{"id": "p1", "name": "P", "category": "x"},
                         {"id": "p1", "name": "Q", "category": "y"}]}"#;
        let err = CampaignSpec::from_json_str(brief).unwrap_err();
        assert!(err.to_string().contains("duplicate product id"));
    }

    #[test]
    fn test_aspect_ratio_parsing() {
        assert_eq!("9:16".parse::<AspectRatio>().unwrap(), AspectRatio::Vertical);
        assert_eq!("16x9".parse::<AspectRatio>().unwrap(), AspectRatio::Horizontal);
        assert!("4x3".parse::<AspectRatio>().is_err());
        let json = serde_json::to_string(&AspectRatio::Square).unwrap();
        assert_eq!(json, r#""1x1""#);
    }
}
