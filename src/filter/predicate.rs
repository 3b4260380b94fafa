//! Compiled predicates and their evaluation order.

use std::collections::BTreeMap;
use std::fmt;

use rust_decimal::Decimal;

use crate::filter::mods::ModFilterGroup;
use crate::item::{Item, Rarity};

/// Every criteria key a filter can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CriterionKey {
    Type,
    Base,
    PriceMin,
    PriceMax,
    IlvlMin,
    IlvlMax,
    LevelMin,
    LevelMax,
    QualityMin,
    QualityMax,
    SocketsMin,
    SocketsMax,
    StackSizeMin,
    StackSizeMax,
    ModCountMin,
    ModCountMax,
    Experience,
    Corrupted,
    Modifiable,
    Identified,
    Crafted,
    Enchanted,
    Buyout,
    LinksMin,
    LinksMax,
    Name,
    EsMin,
    EsMax,
    ArmourMin,
    ArmourMax,
    EvasionMin,
    EvasionMax,
    PdpsMin,
    PdpsMax,
    EdpsMin,
    EdpsMax,
    DpsMin,
    DpsMax,
    ModGroups,
}

impl CriterionKey {
    /// Lower runs first. Cheap and discriminating checks lead, regex
    /// modifier matching runs last.
    pub fn priority(self) -> u8 {
        use CriterionKey::*;
        match self {
            LinksMin | LinksMax | Name => 2,
            EsMin | EsMax | ArmourMin | ArmourMax | EvasionMin | EvasionMax | PdpsMin
            | PdpsMax | EdpsMin | EdpsMax | DpsMin | DpsMax => 3,
            ModGroups => 5,
            _ => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        use CriterionKey::*;
        match self {
            Type => "type",
            Base => "base",
            PriceMin => "price_min",
            PriceMax => "price_max",
            IlvlMin => "ilvl_min",
            IlvlMax => "ilvl_max",
            LevelMin => "level_min",
            LevelMax => "level_max",
            QualityMin => "quality_min",
            QualityMax => "quality_max",
            SocketsMin => "sockets_min",
            SocketsMax => "sockets_max",
            StackSizeMin => "stacksize_min",
            StackSizeMax => "stacksize_max",
            ModCountMin => "modcount_min",
            ModCountMax => "modcount_max",
            Experience => "exp",
            Corrupted => "corrupted",
            Modifiable => "modifiable",
            Identified => "identified",
            Crafted => "crafted",
            Enchanted => "enchanted",
            Buyout => "buyout",
            LinksMin => "links_min",
            LinksMax => "links_max",
            Name => "name",
            EsMin => "es_min",
            EsMax => "es_max",
            ArmourMin => "armour_min",
            ArmourMax => "armour_max",
            EvasionMin => "evasion_min",
            EvasionMax => "evasion_max",
            PdpsMin => "pdps_min",
            PdpsMax => "pdps_max",
            EdpsMin => "edps_min",
            EdpsMax => "edps_max",
            DpsMin => "dps_min",
            DpsMax => "dps_max",
            ModGroups => "fgs",
        }
    }
}

impl fmt::Display for CriterionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Min,
    Max,
}

impl Bound {
    fn accepts<T: PartialOrd>(self, value: T, bound: T) -> bool {
        match self {
            Bound::Min => value >= bound,
            Bound::Max => value <= bound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericField {
    ItemLevel,
    Level,
    Quality,
    Sockets,
    Links,
    StackSize,
    ModCount,
    Experience,
    EnergyShield,
    Armour,
    Evasion,
    PhysicalDps,
    ElementalDps,
    Dps,
}

impl NumericField {
    pub fn value(self, item: &Item) -> f64 {
        match self {
            NumericField::ItemLevel => item.item_level as f64,
            NumericField::Level => item.level as f64,
            NumericField::Quality => item.quality as f64,
            NumericField::Sockets => item.sockets as f64,
            NumericField::Links => item.links as f64,
            NumericField::StackSize => item.stack_size as f64,
            NumericField::ModCount => item.mod_count as f64,
            NumericField::Experience => item.experience,
            NumericField::EnergyShield => item.stats.energy_shield,
            NumericField::Armour => item.stats.armour,
            NumericField::Evasion => item.stats.evasion,
            NumericField::PhysicalDps => item.stats.physical_dps,
            NumericField::ElementalDps => item.stats.elemental_dps,
            NumericField::Dps => item.stats.dps,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Corrupted,
    Modifiable,
    Identified,
    Crafted,
    Enchanted,
    Buyout,
}

impl Flag {
    pub fn value(self, item: &Item) -> bool {
        match self {
            Flag::Corrupted => item.corrupted,
            Flag::Modifiable => item.is_modifiable(),
            Flag::Identified => item.identified,
            Flag::Crafted => item.crafted,
            Flag::Enchanted => item.enchanted,
            Flag::Buyout => item.has_buyout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameMatch {
    Exact(String),
    Contains(String),
}

impl NameMatch {
    /// `"Name"` matches exactly, anything else as a substring. Case is ignored.
    pub fn parse(token: &str) -> Self {
        let token = token.trim();
        match token
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
        {
            Some(exact) => NameMatch::Exact(exact.to_lowercase()),
            None => NameMatch::Contains(token.to_lowercase()),
        }
    }

    fn matches(&self, name_lower: &str) -> bool {
        match self {
            NameMatch::Exact(name) => name_lower == name,
            NameMatch::Contains(part) => name_lower.contains(part.as_str()),
        }
    }
}

/// One compiled check against an item.
#[derive(Debug, Clone)]
pub enum Predicate {
    Rarity(Vec<Rarity>),
    /// Lowercased substring of the base type.
    Base(String),
    Name(Vec<NameMatch>),
    /// Unpriced items always pass.
    Price(Bound, Decimal),
    Numeric(NumericField, Bound, f64),
    Flag(Flag, bool),
    ModGroups(Vec<ModFilterGroup>),
}

impl Predicate {
    pub fn evaluate(&self, item: &Item) -> bool {
        match self {
            Predicate::Rarity(rarities) => item.rarity.is_some_and(|r| rarities.contains(&r)),
            Predicate::Base(base) => item.base_lower.contains(base.as_str()),
            Predicate::Name(names) => names.iter().any(|n| n.matches(&item.name_lower)),
            Predicate::Price(bound, limit) => item.price.map_or(true, |p| bound.accepts(p, *limit)),
            Predicate::Numeric(field, bound, limit) => bound.accepts(field.value(item), *limit),
            Predicate::Flag(flag, expected) => flag.value(item) == *expected,
            Predicate::ModGroups(groups) => groups.iter().all(|g| g.check(item)),
        }
    }
}

/// Predicates keyed by criterion, evaluated in priority order.
#[derive(Debug, Clone, Default)]
pub struct CompiledCriteria {
    predicates: BTreeMap<CriterionKey, Predicate>,
}

impl CompiledCriteria {
    pub fn insert(&mut self, key: CriterionKey, predicate: Predicate) {
        self.predicates.insert(key, predicate);
    }

    pub fn get(&self, key: CriterionKey) -> Option<&Predicate> {
        self.predicates.get(&key)
    }

    pub fn price(&self, bound: Bound) -> Option<Decimal> {
        let key = match bound {
            Bound::Min => CriterionKey::PriceMin,
            Bound::Max => CriterionKey::PriceMax,
        };
        match self.predicates.get(&key) {
            Some(Predicate::Price(_, price)) => Some(*price),
            _ => None,
        }
    }

    pub fn set_price(&mut self, bound: Bound, price: Decimal) {
        let key = match bound {
            Bound::Min => CriterionKey::PriceMin,
            Bound::Max => CriterionKey::PriceMax,
        };
        self.predicates.insert(key, Predicate::Price(bound, price));
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = CriterionKey> + '_ {
        self.predicates.keys().copied()
    }

    /// Keys in evaluation order. Ties keep declaration order.
    fn ordered(&self) -> Vec<CriterionKey> {
        let mut ordered: Vec<_> = self.predicates.keys().copied().collect();
        ordered.sort_by_key(|k| k.priority());
        ordered
    }
}

/// A filter ready for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    pub id: String,
    pub title: String,
    pub category: String,
    pub enabled: bool,
    pub criteria: CompiledCriteria,
    order: Vec<CriterionKey>,
}

impl CompiledFilter {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        category: impl Into<String>,
        enabled: bool,
        criteria: CompiledCriteria,
    ) -> Self {
        let order = criteria.ordered();
        Self {
            id: id.into(),
            title: title.into(),
            category: category.into(),
            enabled,
            criteria,
            order,
        }
    }

    /// Replace the upper price bound after overrides.
    pub fn set_price_max(&mut self, price: Decimal) {
        self.criteria.set_price(Bound::Max, price);
        self.order = self.criteria.ordered();
    }

    pub fn price_max(&self) -> Option<Decimal> {
        self.criteria.price(Bound::Max)
    }

    pub fn check(&self, item: &Item) -> bool {
        self.check_with(item, |_| {})
    }

    /// Like [`check`](Self::check), reporting each key as it is evaluated.
    pub fn check_with(&self, item: &Item, mut on_eval: impl FnMut(CriterionKey)) -> bool {
        self.order.iter().all(|&key| {
            on_eval(key);
            self.criteria.get(key).map_or(true, |p| p.evaluate(item))
        })
    }

    pub fn evaluation_order(&self) -> impl Iterator<Item = CriterionKey> + '_ {
        self.order.iter().copied()
    }
}
