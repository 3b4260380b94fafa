//! Currency rate table.
//!
//! Rates are expressed in the base unit (Chaos Orb, rate 1). Overrides let a
//! currency be priced relative to its observed rate or in terms of another
//! currency. Compilation resolves those chains and rejects cycles before
//! anything is committed.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{ConfidenceLevel, CurrencyConfig};
use crate::currency::price::PriceExpr;
use crate::currency::rates::RateSource;
use crate::error::CompileError;
use crate::state::atomic::write_atomic;

pub const BASE_CURRENCY: &str = "Chaos Orb";

/// Aliases used in listing notes and price expressions.
const DEFAULT_ALIASES: &[(&str, &str)] = &[
    ("c", "Chaos Orb"),
    ("chaos", "Chaos Orb"),
    ("ex", "Exalted Orb"),
    ("exa", "Exalted Orb"),
    ("exalted", "Exalted Orb"),
    ("div", "Divine Orb"),
    ("divine", "Divine Orb"),
    ("alch", "Orb of Alchemy"),
    ("alchemy", "Orb of Alchemy"),
    ("alt", "Orb of Alteration"),
    ("alts", "Orb of Alteration"),
    ("alteration", "Orb of Alteration"),
    ("fuse", "Orb of Fusing"),
    ("fusing", "Orb of Fusing"),
    ("chrom", "Chromatic Orb"),
    ("chrome", "Chromatic Orb"),
    ("chromatic", "Chromatic Orb"),
    ("jew", "Jeweller's Orb"),
    ("jeweller", "Jeweller's Orb"),
    ("jewellers", "Jeweller's Orb"),
    ("chance", "Orb of Chance"),
    ("gcp", "Gemcutter's Prism"),
    ("gemcutter", "Gemcutter's Prism"),
    ("regal", "Regal Orb"),
    ("regret", "Orb of Regret"),
    ("scour", "Orb of Scouring"),
    ("scouring", "Orb of Scouring"),
    ("bless", "Blessed Orb"),
    ("blessed", "Blessed Orb"),
    ("vaal", "Vaal Orb"),
    ("mirror", "Mirror of Kalandra"),
    ("kalandra", "Mirror of Kalandra"),
    ("annul", "Orb of Annulment"),
    ("annulment", "Orb of Annulment"),
    ("chisel", "Cartographer's Chisel"),
    ("cartographer", "Cartographer's Chisel"),
    ("wis", "Scroll of Wisdom"),
    ("wisdom", "Scroll of Wisdom"),
    ("port", "Portal Scroll"),
    ("portal", "Portal Scroll"),
    ("silver", "Silver Coin"),
    ("aug", "Orb of Augmentation"),
    ("trans", "Orb of Transmutation"),
    ("transmute", "Orb of Transmutation"),
    ("bauble", "Glassblower's Bauble"),
    ("glassblower", "Glassblower's Bauble"),
    ("coin", "Perandus Coin"),
    ("coins", "Perandus Coin"),
    ("perandus", "Perandus Coin"),
    ("eternal", "Eternal Orb"),
];

/// Frozen, value-copied view of the compiled table handed to evaluators.
#[derive(Debug, Clone, Default)]
pub struct CurrencySnapshot {
    aliases: HashMap<String, String>,
    rates: HashMap<String, Decimal>,
}

impl CurrencySnapshot {
    pub fn canonical(&self, alias: &str) -> Option<&str> {
        self.aliases.get(&alias.to_lowercase()).map(String::as_str)
    }

    pub fn rate(&self, canonical: &str) -> Option<Decimal> {
        self.rates.get(canonical).copied()
    }

    /// Value of `amount` of the currency called `alias`, in the base unit.
    /// `None` for an unknown alias or a value out of range.
    pub fn convert(&self, amount: Decimal, alias: &str) -> Option<Decimal> {
        let canonical = self.canonical(alias)?;
        amount.checked_mul(self.rate(canonical)?)
    }

    pub fn rates(&self) -> &HashMap<String, Decimal> {
        &self.rates
    }

    pub fn compile_price(&self, expr: &str, base: Option<Decimal>) -> Result<Decimal, CompileError> {
        self.compile_expr(&PriceExpr::parse(expr)?, base)
    }

    pub fn compile_expr(&self, expr: &PriceExpr, base: Option<Decimal>) -> Result<Decimal, CompileError> {
        expr.evaluate(base, |alias| {
            self.convert(Decimal::ONE, alias)
                .ok_or_else(|| CompileError::UnknownCurrency(alias.to_string()))
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CurrencyFile {
    #[serde(default)]
    shorts: BTreeMap<String, String>,
    #[serde(default)]
    rates: BTreeMap<String, Decimal>,
    #[serde(default)]
    overrides: BTreeMap<String, String>,
    last_update: Option<DateTime<Utc>>,
    confidence_level: Option<ConfidenceLevel>,
}

pub struct CurrencyTable {
    path: Option<PathBuf>,
    source: Arc<dyn RateSource>,
    aliases: HashMap<String, String>,
    /// Observed rates as fetched, before overrides.
    rates: HashMap<String, Decimal>,
    overrides: BTreeMap<String, String>,
    compiled: Arc<CurrencySnapshot>,
    last_update: Option<DateTime<Utc>>,
    confidence: ConfidenceLevel,
    update_interval: Duration,
}

impl CurrencyTable {
    pub fn new(config: &CurrencyConfig, path: Option<PathBuf>, source: Arc<dyn RateSource>) -> Self {
        let aliases = DEFAULT_ALIASES
            .iter()
            .map(|(alias, name)| (alias.to_string(), name.to_string()))
            .chain(std::iter::once((
                BASE_CURRENCY.to_lowercase(),
                BASE_CURRENCY.to_string(),
            )))
            .collect();

        let mut table = Self {
            path,
            source,
            aliases,
            rates: HashMap::new(),
            overrides: BTreeMap::new(),
            compiled: Arc::new(CurrencySnapshot::default()),
            last_update: None,
            confidence: config.confidence_level,
            update_interval: Duration::minutes(config.update_interval_minutes),
        };
        table.rates.insert(BASE_CURRENCY.to_string(), Decimal::ONE);
        table
    }

    /// Load the persisted table, if any, and compile it.
    pub fn load(&mut self) -> Result<()> {
        if let Some(path) = self.path.clone() {
            if path.exists() {
                self.load_file(&path)?;
            }
        }

        if let Err(e) = self.compile() {
            warn!(error = %e, "Persisted currency overrides rejected, ignoring them");
            self.overrides.clear();
            self.compile()?;
        }
        Ok(())
    }

    fn load_file(&mut self, path: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read currency file: {}", path.display()))?;
        let file: CurrencyFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse currency file: {}", path.display()))?;

        for (alias, name) in file.shorts {
            self.aliases.insert(alias.to_lowercase(), name);
        }
        for name in file.rates.keys() {
            self.aliases.insert(name.to_lowercase(), name.clone());
        }
        self.rates.extend(file.rates);
        self.rates.insert(BASE_CURRENCY.to_string(), Decimal::ONE);
        self.overrides = file.overrides;
        self.last_update = file.last_update;
        if let Some(level) = file.confidence_level {
            self.confidence = level;
        }

        info!(
            rates = self.rates.len(),
            overrides = self.overrides.len(),
            "Loaded currency table"
        );
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = CurrencyFile {
            shorts: self
                .aliases
                .iter()
                .map(|(a, n)| (a.clone(), n.clone()))
                .collect(),
            rates: self.rates.iter().map(|(n, r)| (n.clone(), *r)).collect(),
            overrides: self.overrides.clone(),
            last_update: self.last_update,
            confidence_level: Some(self.confidence),
        };
        let json = serde_json::to_vec_pretty(&file).context("Failed to serialize currency table")?;
        write_atomic(path, &json)
    }

    pub fn needs_update(&self) -> bool {
        match self.last_update {
            None => true,
            Some(at) => Utc::now() - at >= self.update_interval,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.rates.len() > 1
    }

    /// Refresh observed rates from the rate source and recompile.
    ///
    /// Returns `Ok(false)` without fetching if the refresh interval has not
    /// elapsed and `force` is not set.
    pub async fn update(&mut self, force: bool, accept_empty: bool) -> Result<bool> {
        if !force && !self.needs_update() {
            return Ok(false);
        }

        let fetched = self
            .source
            .fetch_rates(self.confidence.threshold())
            .await
            .with_context(|| format!("Failed to fetch rates from {}", self.source.name()))?;

        if fetched.rates.is_empty() && !accept_empty {
            bail!("Rate source {} returned no usable rates", self.source.name());
        }

        for (alias, name) in fetched.aliases {
            self.aliases.entry(alias.to_lowercase()).or_insert(name);
        }
        for name in fetched.rates.keys() {
            self.aliases.insert(name.to_lowercase(), name.clone());
        }

        let mut rates = fetched.rates;
        rates.insert(BASE_CURRENCY.to_string(), Decimal::ONE);
        let compiled = compile_rates(&self.aliases, &rates, &self.overrides)?;

        info!(rates = rates.len(), "Currency rates updated");
        self.rates = rates;
        self.compiled = Arc::new(compiled);
        self.last_update = Some(Utc::now());
        self.save()?;
        Ok(true)
    }

    /// Resolve overrides and replace the compiled snapshot.
    ///
    /// A circular override chain rejects the whole compile and leaves the
    /// previous snapshot in place.
    pub fn compile(&mut self) -> Result<(), CompileError> {
        self.compiled = Arc::new(compile_rates(&self.aliases, &self.rates, &self.overrides)?);
        Ok(())
    }

    /// Replace the override table, committing only if it compiles.
    pub fn set_overrides(&mut self, overrides: BTreeMap<String, String>) -> Result<(), CompileError> {
        let compiled = compile_rates(&self.aliases, &self.rates, &overrides)?;
        self.overrides = overrides;
        self.compiled = Arc::new(compiled);
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<CurrencySnapshot> {
        Arc::clone(&self.compiled)
    }

    pub fn convert(&self, amount: Decimal, alias: &str) -> Option<Decimal> {
        self.compiled.convert(amount, alias)
    }

    pub fn compile_price(&self, expr: &str, base: Option<Decimal>) -> Result<Decimal, CompileError> {
        self.compiled.compile_price(expr, base)
    }

    /// Whether `expr` can be used as a currency override.
    pub fn is_override_price_valid(&self, expr: &str) -> bool {
        match PriceExpr::parse(expr) {
            Ok(parsed) => parsed
                .currency()
                .map_or(true, |alias| self.aliases.contains_key(alias)),
            Err(_) => false,
        }
    }

    pub fn add_alias(&mut self, alias: &str, canonical: &str) {
        self.aliases.insert(alias.to_lowercase(), canonical.to_string());
    }

    pub fn compiled_rates(&self) -> &HashMap<String, Decimal> {
        self.compiled.rates()
    }

    pub fn observed_rates(&self) -> &HashMap<String, Decimal> {
        &self.rates
    }

    pub fn overrides(&self) -> &BTreeMap<String, String> {
        &self.overrides
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }
}

fn compile_rates(
    aliases: &HashMap<String, String>,
    rates: &HashMap<String, Decimal>,
    overrides: &BTreeMap<String, String>,
) -> Result<CurrencySnapshot, CompileError> {
    let mut resolver = OverrideResolver {
        aliases,
        rates,
        overrides,
        resolved: HashMap::new(),
        path: Vec::new(),
    };

    for name in overrides.keys() {
        resolver.path.clear();
        match resolver.resolve(name) {
            Ok(_) => {}
            Err(e @ CompileError::CircularReference { .. }) => return Err(e),
            Err(e) => warn!(currency = %name, error = %e, "Currency override excluded"),
        }
    }

    let mut compiled = rates.clone();
    compiled.extend(resolver.resolved);
    compiled.insert(BASE_CURRENCY.to_string(), Decimal::ONE);

    let mut snapshot_aliases = aliases.clone();
    for name in compiled.keys() {
        snapshot_aliases
            .entry(name.to_lowercase())
            .or_insert_with(|| name.clone());
    }

    Ok(CurrencySnapshot {
        aliases: snapshot_aliases,
        rates: compiled,
    })
}

struct OverrideResolver<'a> {
    aliases: &'a HashMap<String, String>,
    rates: &'a HashMap<String, Decimal>,
    overrides: &'a BTreeMap<String, String>,
    resolved: HashMap<String, Decimal>,
    path: Vec<String>,
}

impl OverrideResolver<'_> {
    fn resolve(&mut self, name: &str) -> Result<Decimal, CompileError> {
        if name == BASE_CURRENCY {
            return Ok(Decimal::ONE);
        }
        if let Some(rate) = self.resolved.get(name) {
            return Ok(*rate);
        }
        if self.path.iter().any(|n| n == name) {
            let mut path = self.path.clone();
            path.push(name.to_string());
            return Err(CompileError::CircularReference { path });
        }

        let (aliases, rates, overrides) = (self.aliases, self.rates, self.overrides);
        let Some(text) = overrides.get(name) else {
            return rates
                .get(name)
                .copied()
                .ok_or_else(|| CompileError::UnknownCurrency(name.to_string()));
        };

        let expr = PriceExpr::parse(text)?;
        let observed = rates.get(name).copied();

        self.path.push(name.to_string());
        let rate = expr.evaluate(observed, |alias| {
            let canonical = aliases
                .get(alias)
                .ok_or_else(|| CompileError::UnknownCurrency(alias.to_string()))?;
            self.resolve(canonical)
        });
        self.path.pop();

        let rate = rate?;
        self.resolved.insert(name.to_string(), rate);
        Ok(rate)
    }
}
