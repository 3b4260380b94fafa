//! Filter compilation.
//!
//! Turns user and generated filter documents into compiled filters: base
//! filters are resolved first (cycles are rejected), prices are resolved
//! against a frozen currency snapshot, then configured overrides decide the
//! final price caps and which filters are active.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::config::FiltersConfig;
use crate::currency::CurrencySnapshot;
use crate::error::CompileError;
use crate::filter::auto::ItemPriceSource;
use crate::filter::definition::{Criteria, Filter, FilterConfig, FilterDocument};
use crate::filter::mods::ModFilterGroup;
use crate::filter::predicate::{
    Bound, CompiledCriteria, CompiledFilter, CriterionKey, Flag, NameMatch, NumericField,
    Predicate,
};
use crate::item::Rarity;

/// Compile `criteria` on top of an already compiled `base`. Relative prices
/// are anchored on the base's price for the same bound.
pub fn compile_criteria(
    criteria: &Criteria,
    base: &CompiledCriteria,
    currency: &CurrencySnapshot,
) -> Result<CompiledCriteria, CompileError> {
    let mut compiled = base.clone();

    if let Some(names) = &criteria.rarity {
        let rarities = names
            .iter()
            .map(|name| {
                Rarity::from_name(name).ok_or_else(|| {
                    CompileError::criteria("type", format!("unknown rarity '{name}'"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        compiled.insert(CriterionKey::Type, Predicate::Rarity(rarities));
    }
    if let Some(base_type) = &criteria.base {
        compiled.insert(CriterionKey::Base, Predicate::Base(base_type.to_lowercase()));
    }
    if let Some(names) = &criteria.name {
        let names = names.iter().map(|n| NameMatch::parse(n)).collect();
        compiled.insert(CriterionKey::Name, Predicate::Name(names));
    }

    for (bound, expr) in [
        (Bound::Min, &criteria.price_min),
        (Bound::Max, &criteria.price_max),
    ] {
        if let Some(expr) = expr {
            let price = currency.compile_price(expr, base.price(bound))?;
            compiled.set_price(bound, price);
        }
    }

    let numeric: [(CriterionKey, NumericField, Bound, Option<f64>); 27] = [
        (CriterionKey::IlvlMin, NumericField::ItemLevel, Bound::Min, criteria.ilvl_min.map(f64::from)),
        (CriterionKey::IlvlMax, NumericField::ItemLevel, Bound::Max, criteria.ilvl_max.map(f64::from)),
        (CriterionKey::LevelMin, NumericField::Level, Bound::Min, criteria.level_min.map(f64::from)),
        (CriterionKey::LevelMax, NumericField::Level, Bound::Max, criteria.level_max.map(f64::from)),
        (CriterionKey::QualityMin, NumericField::Quality, Bound::Min, criteria.quality_min.map(f64::from)),
        (CriterionKey::QualityMax, NumericField::Quality, Bound::Max, criteria.quality_max.map(f64::from)),
        (CriterionKey::SocketsMin, NumericField::Sockets, Bound::Min, criteria.sockets_min.map(f64::from)),
        (CriterionKey::SocketsMax, NumericField::Sockets, Bound::Max, criteria.sockets_max.map(f64::from)),
        (CriterionKey::LinksMin, NumericField::Links, Bound::Min, criteria.links_min.map(f64::from)),
        (CriterionKey::LinksMax, NumericField::Links, Bound::Max, criteria.links_max.map(f64::from)),
        (CriterionKey::StackSizeMin, NumericField::StackSize, Bound::Min, criteria.stacksize_min.map(f64::from)),
        (CriterionKey::StackSizeMax, NumericField::StackSize, Bound::Max, criteria.stacksize_max.map(f64::from)),
        (CriterionKey::ModCountMin, NumericField::ModCount, Bound::Min, criteria.modcount_min.map(f64::from)),
        (CriterionKey::ModCountMax, NumericField::ModCount, Bound::Max, criteria.modcount_max.map(f64::from)),
        (CriterionKey::Experience, NumericField::Experience, Bound::Min, criteria.exp),
        (CriterionKey::EsMin, NumericField::EnergyShield, Bound::Min, criteria.es_min),
        (CriterionKey::EsMax, NumericField::EnergyShield, Bound::Max, criteria.es_max),
        (CriterionKey::ArmourMin, NumericField::Armour, Bound::Min, criteria.armour_min),
        (CriterionKey::ArmourMax, NumericField::Armour, Bound::Max, criteria.armour_max),
        (CriterionKey::EvasionMin, NumericField::Evasion, Bound::Min, criteria.evasion_min),
        (CriterionKey::EvasionMax, NumericField::Evasion, Bound::Max, criteria.evasion_max),
        (CriterionKey::PdpsMin, NumericField::PhysicalDps, Bound::Min, criteria.pdps_min),
        (CriterionKey::PdpsMax, NumericField::PhysicalDps, Bound::Max, criteria.pdps_max),
        (CriterionKey::EdpsMin, NumericField::ElementalDps, Bound::Min, criteria.edps_min),
        (CriterionKey::EdpsMax, NumericField::ElementalDps, Bound::Max, criteria.edps_max),
        (CriterionKey::DpsMin, NumericField::Dps, Bound::Min, criteria.dps_min),
        (CriterionKey::DpsMax, NumericField::Dps, Bound::Max, criteria.dps_max),
    ];
    for (key, field, bound, value) in numeric {
        if let Some(value) = value {
            compiled.insert(key, Predicate::Numeric(field, bound, value));
        }
    }

    let flags = [
        (CriterionKey::Corrupted, Flag::Corrupted, criteria.corrupted),
        (CriterionKey::Modifiable, Flag::Modifiable, criteria.modifiable),
        (CriterionKey::Identified, Flag::Identified, criteria.identified),
        (CriterionKey::Crafted, Flag::Crafted, criteria.crafted),
        (CriterionKey::Enchanted, Flag::Enchanted, criteria.enchanted),
        (CriterionKey::Buyout, Flag::Buyout, criteria.buyout),
    ];
    for (key, flag, value) in flags {
        if let Some(expected) = value {
            compiled.insert(key, Predicate::Flag(flag, expected));
        }
    }

    if let Some(groups) = &criteria.fgs {
        let groups = groups
            .iter()
            .map(ModFilterGroup::compile)
            .collect::<Result<Vec<_>, _>>()?;
        compiled.insert(CriterionKey::ModGroups, Predicate::ModGroups(groups));
    }

    Ok(compiled)
}

fn find_override<'a, V>(overrides: &'a BTreeMap<String, V>, id: &str) -> Option<(&'a String, &'a V)> {
    overrides.iter().find(|(key, _)| key.eq_ignore_ascii_case(id))
}

/// Outcome of a full compile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileSummary {
    pub compiled: usize,
    pub active: usize,
    pub failed: usize,
}

pub struct FilterCompiler {
    user_path: PathBuf,
    config_path: PathBuf,
    auto_path: PathBuf,
    source: Option<Arc<dyn ItemPriceSource>>,
    update_interval: Duration,

    user_filters: Vec<Filter>,
    auto_filters: Vec<Filter>,
    last_update: Option<DateTime<Utc>>,
    config: FilterConfig,

    compiled: Vec<Arc<CompiledFilter>>,
    active: Vec<Arc<CompiledFilter>>,
    budget: Option<Decimal>,
    item_prices: BTreeMap<String, String>,
    compiled_item_prices: BTreeMap<String, Decimal>,
    compiled_filter_prices: BTreeMap<String, Decimal>,
}

impl FilterCompiler {
    pub fn new(
        config: &FiltersConfig,
        auto_path: PathBuf,
        source: Option<Arc<dyn ItemPriceSource>>,
    ) -> Self {
        Self {
            user_path: config.user_file.clone(),
            config_path: config.config_file.clone(),
            auto_path,
            source,
            update_interval: Duration::minutes(config.update_interval_minutes),
            user_filters: Vec::new(),
            auto_filters: Vec::new(),
            last_update: None,
            config: FilterConfig::default(),
            compiled: Vec::new(),
            active: Vec::new(),
            budget: None,
            item_prices: BTreeMap::new(),
            compiled_item_prices: BTreeMap::new(),
            compiled_filter_prices: BTreeMap::new(),
        }
    }

    /// Load the filter config, user filters and the cached generated filters.
    /// Missing files are treated as empty.
    pub fn load(&mut self) -> Result<()> {
        self.config = FilterConfig::load(&self.config_path)?;

        let user = match FilterDocument::load(&self.user_path)? {
            Some(document) => document.filters,
            None => {
                warn!(path = %self.user_path.display(), "User filter file not found");
                Vec::new()
            }
        };

        let (auto, last_update) = match FilterDocument::load(&self.auto_path)? {
            Some(document) => (document.filters, document.last_update),
            None => (Vec::new(), None),
        };

        self.set_filters(user, auto);
        self.last_update = last_update;
        info!(
            user = self.user_filters.len(),
            generated = self.auto_filters.len(),
            "Loaded filters"
        );
        Ok(())
    }

    /// Drop user filters with reserved ids and later duplicates of any id.
    fn set_filters(&mut self, user: Vec<Filter>, auto: Vec<Filter>) {
        let mut seen = HashSet::new();
        let mut keep = |filter: &Filter, generated: bool| {
            if filter.id.is_empty() {
                return true;
            }
            if !generated && filter.id.starts_with('_') {
                error!(
                    filter = %filter.display_title(),
                    id = %filter.id,
                    "Invalid filter id, the underscore prefix is reserved for generated filters"
                );
                return false;
            }
            if !seen.insert(filter.id.to_lowercase()) {
                error!(filter = %filter.display_title(), id = %filter.id, "Duplicate filter id");
                return false;
            }
            true
        };

        self.user_filters = user.into_iter().filter(|f| keep(f, false)).collect();
        self.auto_filters = auto.into_iter().filter(|f| keep(f, true)).collect();
    }

    pub fn needs_update(&self) -> bool {
        if self.source.is_none() {
            return false;
        }
        match self.last_update {
            None => true,
            Some(at) => Utc::now() - at >= self.update_interval,
        }
    }

    /// Regenerate filters from the item price source and cache them.
    pub async fn update_auto(&mut self, force: bool) -> Result<bool> {
        let Some(source) = self.source.clone() else {
            return Ok(false);
        };
        if !force && !self.needs_update() {
            return Ok(false);
        }

        let filters = source.fetch_filters().await?;
        let now = Utc::now();
        FilterDocument {
            filters: filters.clone(),
            last_update: Some(now),
        }
        .save(&self.auto_path)?;

        let user = std::mem::take(&mut self.user_filters);
        self.set_filters(user, filters);
        self.last_update = Some(now);
        info!(
            generated = self.auto_filters.len(),
            source = source.name(),
            "Generated filters updated"
        );
        Ok(true)
    }

    pub fn set_config(&mut self, config: FilterConfig) -> Result<()> {
        config.save(&self.config_path)?;
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    fn find_filter(&self, id: &str) -> Option<&Filter> {
        self.user_filters
            .iter()
            .chain(&self.auto_filters)
            .find(|f| f.id.eq_ignore_ascii_case(id))
    }

    /// Compile one filter over the given base criteria.
    pub fn compile(
        &self,
        filter: &Filter,
        base: &CompiledCriteria,
        currency: &CurrencySnapshot,
    ) -> Result<CompiledCriteria, CompileError> {
        compile_criteria(&filter.criteria, base, currency)
    }

    /// Compile a filter and, first, the chain of filters it extends.
    pub fn compile_filter(
        &self,
        filter: &Filter,
        currency: &CurrencySnapshot,
    ) -> Result<CompiledCriteria, CompileError> {
        self.compile_chain(filter, currency, &mut Vec::new())
    }

    fn compile_chain(
        &self,
        filter: &Filter,
        currency: &CurrencySnapshot,
        path: &mut Vec<String>,
    ) -> Result<CompiledCriteria, CompileError> {
        let id = filter.id.to_lowercase();
        if path.contains(&id) {
            let mut path = path.clone();
            path.push(id);
            return Err(CompileError::CircularReference { path });
        }
        path.push(id);

        let base = match filter.base_id() {
            None => CompiledCriteria::default(),
            Some(base_id) => {
                let base = self
                    .find_filter(base_id)
                    .ok_or_else(|| CompileError::BaseNotFound(base_id.to_string()))?;
                self.compile_chain(base, currency, path)?
            }
        };
        self.compile(filter, &base, currency)
    }

    fn compile_price_or_warn(
        currency: &CurrencySnapshot,
        expr: &str,
        base: Option<Decimal>,
        what: &str,
    ) -> Option<Decimal> {
        match currency.compile_price(expr, base) {
            Ok(price) => Some(price),
            Err(e) => {
                warn!(expr = %expr, error = %e, "Invalid {}", what);
                None
            }
        }
    }

    /// Recompile every filter against `currency` and rebuild the active set.
    ///
    /// Filters that fail to compile are left out with a warning; the rest of
    /// the batch is unaffected.
    pub fn compile_all(&mut self, currency: &CurrencySnapshot) -> CompileSummary {
        let config = &self.config;
        let mut failed = 0;

        let threshold = Self::compile_price_or_warn(
            currency,
            &config.price_threshold,
            None,
            "price threshold",
        )
        .unwrap_or(Decimal::ZERO);

        // generated filters: item price, then filter price
        let mut item_prices = BTreeMap::new();
        let mut compiled_item_prices = BTreeMap::new();
        let mut compiled_filter_prices = BTreeMap::new();
        let mut used_price = BTreeSet::new();
        let mut used_filter_price = BTreeSet::new();
        let mut used_state = BTreeSet::new();
        let mut auto = Vec::with_capacity(self.auto_filters.len());

        for filter in &self.auto_filters {
            let criteria = match self.compile_filter(filter, currency) {
                Ok(criteria) => criteria,
                Err(e) => {
                    warn!(filter = %filter.display_title(), error = %e, "Failed compiling filter");
                    failed += 1;
                    continue;
                }
            };
            let id = filter.id.to_lowercase();
            if let Some(raw) = &filter.criteria.price_max {
                item_prices.insert(id.clone(), raw.clone());
            }

            let mut cf = CompiledFilter::new(
                &filter.id,
                &filter.title,
                &filter.category,
                !config.is_category_disabled(&filter.category),
                criteria,
            );

            let price_override = match find_override(&config.price_overrides, &id) {
                Some((key, expr)) => {
                    used_price.insert(key.clone());
                    expr
                }
                None => &config.default_price_override,
            };
            if let Some(price) = cf.price_max() {
                let price = Self::compile_price_or_warn(currency, price_override, Some(price), "item price override")
                    .unwrap_or(price);
                cf.set_price_max(price);
                compiled_item_prices.insert(id.clone(), price);
            }

            let filter_override = match find_override(&config.filter_price_overrides, &id) {
                Some((key, expr)) => {
                    used_filter_price.insert(key.clone());
                    expr
                }
                None => &config.default_filter_price_override,
            };
            cf.enabled = cf.enabled && cf.price_max().unwrap_or(Decimal::ZERO) >= threshold;
            if let Some((key, state)) = find_override(&config.filter_state_overrides, &id) {
                used_state.insert(key.clone());
                cf.enabled = *state;
            }
            if let Some(price) = cf.price_max() {
                let price = Self::compile_price_or_warn(currency, filter_override, Some(price), "filter price override")
                    .unwrap_or(price);
                cf.set_price_max(price);
                compiled_filter_prices.insert(id, price);
            }
            auto.push(cf);
        }

        let mut user = Vec::with_capacity(self.user_filters.len());
        for filter in &self.user_filters {
            match self.compile_filter(filter, currency) {
                Ok(criteria) => {
                    let enabled = filter.enabled
                        && !config.is_category_disabled(&filter.category)
                        && !criteria.is_empty();
                    user.push(CompiledFilter::new(
                        &filter.id,
                        &filter.title,
                        &filter.category,
                        enabled,
                        criteria,
                    ));
                }
                Err(e) => {
                    warn!(filter = %filter.display_title(), error = %e, "Failed compiling filter");
                    failed += 1;
                }
            }
        }

        for key in config.price_overrides.keys().filter(|k| !used_price.contains(*k)) {
            warn!(id = %key, "Unused item price override");
        }
        for key in config
            .filter_price_overrides
            .keys()
            .filter(|k| !used_filter_price.contains(*k))
        {
            warn!(id = %key, "Unused filter price override");
        }
        for key in config
            .filter_state_overrides
            .keys()
            .filter(|k| !used_state.contains(*k))
        {
            warn!(id = %key, "Unused filter state override");
        }

        let mut compiled: Vec<Arc<CompiledFilter>> = Vec::with_capacity(user.len() + auto.len());
        for mut cf in user.into_iter().chain(auto) {
            if cf.enabled && cf.price_max().is_some_and(|p| p <= Decimal::ZERO) {
                cf.enabled = false;
                warn!(filter = %cf.title, "Filter disabled, price max must be higher than zero");
            }
            compiled.push(Arc::new(cf));
        }

        let budget = config.budget.as_deref().and_then(|expr| {
            Self::compile_price_or_warn(currency, expr, None, "budget")
        });

        self.active = compiled.iter().filter(|cf| cf.enabled).cloned().collect();
        self.compiled = compiled;
        self.budget = budget;
        self.item_prices = item_prices;
        self.compiled_item_prices = compiled_item_prices;
        self.compiled_filter_prices = compiled_filter_prices;

        let summary = CompileSummary {
            compiled: self.compiled.len(),
            active: self.active.len(),
            failed,
        };
        info!(
            compiled = summary.compiled,
            active = summary.active,
            failed = summary.failed,
            "Filters compiled"
        );
        summary
    }

    /// Active filters in evaluation order: user filters, then generated ones.
    pub fn active(&self) -> Vec<Arc<CompiledFilter>> {
        self.active.clone()
    }

    pub fn compiled(&self) -> &[Arc<CompiledFilter>] {
        &self.compiled
    }

    pub fn budget(&self) -> Option<Decimal> {
        self.budget
    }

    /// Source prices of generated filters, as listed by the price source.
    pub fn item_prices(&self) -> &BTreeMap<String, String> {
        &self.item_prices
    }

    pub fn compiled_item_prices(&self) -> &BTreeMap<String, Decimal> {
        &self.compiled_item_prices
    }

    pub fn compiled_filter_prices(&self) -> &BTreeMap<String, Decimal> {
        &self.compiled_filter_prices
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    pub fn user_filters(&self) -> &[Filter] {
        &self.user_filters
    }

    pub fn auto_filters(&self) -> &[Filter] {
        &self.auto_filters
    }
}
