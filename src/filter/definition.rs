//! Filter documents as authored by users or generated from item prices.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::atomic::write_atomic;

pub const USER_PRIORITY: i32 = 10;
pub const AUTO_PRIORITY: i32 = 0;
pub const AUTO_CATEGORY: &str = "auto";

fn default_true() -> bool {
    true
}

fn default_category() -> String {
    "user".to_string()
}

fn default_priority() -> i32 {
    USER_PRIORITY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub id: String,
    /// Id of the filter whose criteria this one extends.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub baseid: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub criteria: Criteria,
}

impl Filter {
    pub fn new(title: impl Into<String>, id: impl Into<String>, criteria: Criteria) -> Self {
        Self {
            title: title.into(),
            id: id.into(),
            baseid: String::new(),
            category: default_category(),
            enabled: true,
            priority: USER_PRIORITY,
            description: String::new(),
            criteria,
        }
    }

    /// A filter naming itself as its base is not a child.
    pub fn base_id(&self) -> Option<&str> {
        let base = self.baseid.trim();
        (!base.is_empty() && !base.eq_ignore_ascii_case(&self.id)).then_some(base)
    }

    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            &self.id
        } else {
            &self.title
        }
    }
}

/// Declarative criteria. Every key is optional; unset keys do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Criteria {
    /// Rarity names, e.g. `unique` or `divination card`.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub rarity: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    /// Quoted names match exactly, unquoted ones as substrings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_min: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_max: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ilvl_min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ilvl_max: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level_min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level_max: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_max: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sockets_min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sockets_max: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links_min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links_max: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stacksize_min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stacksize_max: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modcount_min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modcount_max: Option<u32>,
    /// Minimum gem experience, in percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrupted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modifiable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crafted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enchanted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buyout: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub es_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub es_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub armour_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub armour_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evasion_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evasion_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdps_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdps_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edps_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edps_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dps_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dps_max: Option<f64>,

    /// Modifier filter groups; every group must pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fgs: Option<Vec<FilterGroupDef>>,
}

impl Criteria {
    pub fn is_empty(&self) -> bool {
        *self == Criteria::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupType {
    All,
    None,
    Count,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterGroupDef {
    #[serde(rename = "type")]
    pub kind: GroupType,
    #[serde(default)]
    pub mfs: Vec<ModFilterDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_min: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_max: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModFilterDef {
    /// Modifier category: total, implicit, explicit, crafted, enchant,
    /// prophecy, leaguestone or pseudo.
    #[serde(rename = "type")]
    pub category: String,
    /// A regex for text categories, a catalog name for pseudo.
    pub expr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Positional minimums, one per captured value.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<f64>,
}

impl ModFilterDef {
    pub fn new(category: &str, expr: &str) -> Self {
        Self {
            category: category.to_string(),
            expr: expr.to_string(),
            min: None,
            max: None,
            values: Vec::new(),
        }
    }
}

/// On-disk filter file: `{ "filters": [...], "last_update": ... }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterDocument {
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

impl FilterDocument {
    /// Returns `None` if the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read filter file: {}", path.display()))?;
        let document = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse filter file: {}", path.display()))?;
        Ok(Some(document))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize filters")?;
        write_atomic(path, &json)
    }
}

fn default_price_threshold() -> String {
    "1 exalted".to_string()
}

fn default_price_override() -> String {
    "* 1".to_string()
}

fn default_filter_price_override() -> String {
    "* 0.8".to_string()
}

/// User tuning applied on top of the filter documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub disabled_categories: Vec<String>,
    /// Generated filters below this item price start disabled.
    #[serde(default = "default_price_threshold")]
    pub price_threshold: String,
    /// Items listed above this price are skipped before filter evaluation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<String>,
    #[serde(default = "default_price_override")]
    pub default_price_override: String,
    #[serde(default = "default_filter_price_override")]
    pub default_filter_price_override: String,
    #[serde(default)]
    pub price_overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub filter_price_overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub filter_state_overrides: BTreeMap<String, bool>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            disabled_categories: Vec::new(),
            price_threshold: default_price_threshold(),
            budget: None,
            default_price_override: default_price_override(),
            default_filter_price_override: default_filter_price_override(),
            price_overrides: BTreeMap::new(),
            filter_price_overrides: BTreeMap::new(),
            filter_state_overrides: BTreeMap::new(),
        }
    }
}

impl FilterConfig {
    /// Missing file means defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read filter config: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse filter config: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize filter config")?;
        write_atomic(path, &json)
    }

    pub fn is_category_disabled(&self, category: &str) -> bool {
        self.disabled_categories
            .iter()
            .any(|c| c.eq_ignore_ascii_case(category))
    }
}
