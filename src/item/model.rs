//! Parsed market item.
//!
//! Everything a filter can ask about is derived once, when the item is built
//! from its raw feed record, and the item is read-only afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;
use tracing::debug;

use crate::currency::CurrencySnapshot;
use crate::item::price::{listing_price, ListingPrice};
use crate::item::stash::{Property, RawItem, StashTab};

/// Frame type of an item, as reported by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Rarity {
    Normal,
    Magic,
    Rare,
    Unique,
    Gem,
    Currency,
    DivinationCard,
    Quest,
    Prophecy,
    Relic,
}

impl Rarity {
    pub fn from_frame_type(frame_type: u8) -> Option<Self> {
        Some(match frame_type {
            0 => Rarity::Normal,
            1 => Rarity::Magic,
            2 => Rarity::Rare,
            3 => Rarity::Unique,
            4 => Rarity::Gem,
            5 => Rarity::Currency,
            6 => Rarity::DivinationCard,
            7 => Rarity::Quest,
            8 => Rarity::Prophecy,
            9 => Rarity::Relic,
            _ => return None,
        })
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.trim().to_lowercase().as_str() {
            "normal" => Rarity::Normal,
            "magic" => Rarity::Magic,
            "rare" => Rarity::Rare,
            "unique" => Rarity::Unique,
            "gem" => Rarity::Gem,
            "currency" => Rarity::Currency,
            "divination card" | "divination" | "card" => Rarity::DivinationCard,
            "quest" => Rarity::Quest,
            "prophecy" => Rarity::Prophecy,
            "relic" => Rarity::Relic,
            _ => return None,
        })
    }
}

impl fmt::Display for Rarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Rarity::Normal => "normal",
            Rarity::Magic => "magic",
            Rarity::Rare => "rare",
            Rarity::Unique => "unique",
            Rarity::Gem => "gem",
            Rarity::Currency => "currency",
            Rarity::DivinationCard => "divination card",
            Rarity::Quest => "quest",
            Rarity::Prophecy => "prophecy",
            Rarity::Relic => "relic",
        };
        f.write_str(name)
    }
}

/// Which modifier text list a mod filter looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModCategory {
    Total,
    Implicit,
    Explicit,
    Crafted,
    Enchant,
    Prophecy,
    Leaguestone,
    Pseudo,
}

impl ModCategory {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.trim().to_lowercase().as_str() {
            "total" => ModCategory::Total,
            "implicit" => ModCategory::Implicit,
            "explicit" => ModCategory::Explicit,
            "crafted" => ModCategory::Crafted,
            "enchant" | "enchanted" => ModCategory::Enchant,
            "prophecy" => ModCategory::Prophecy,
            "leaguestone" => ModCategory::Leaguestone,
            "pseudo" => ModCategory::Pseudo,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resistances {
    pub fire: f64,
    pub cold: f64,
    pub lightning: f64,
    pub chaos: f64,
    /// `+#% to all Elemental Resistances`, counted once.
    pub all_elemental: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    pub strength: f64,
    pub dexterity: f64,
    pub intelligence: f64,
    /// `+# to all Attributes`, counted once.
    pub all: f64,
}

/// Weapon and armour figures, normalised to 20% quality where applicable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CombatStats {
    pub attacks_per_second: f64,
    pub physical_dps: f64,
    pub elemental_dps: f64,
    pub chaos_dps: f64,
    pub dps: f64,
    pub energy_shield: f64,
    pub armour: f64,
    pub evasion: f64,
}

#[derive(Debug, Clone)]
pub struct Item {
    pub id: String,
    /// `name typeLine` with markup removed.
    pub name: String,
    pub name_lower: String,
    pub base: String,
    pub base_lower: String,
    pub rarity: Option<Rarity>,
    pub league: Option<String>,
    pub item_level: u32,
    pub level: u32,
    pub quality: u32,
    pub experience: f64,
    pub corrupted: bool,
    pub mirrored: bool,
    pub identified: bool,
    pub crafted: bool,
    pub enchanted: bool,
    pub sockets: u32,
    pub links: u32,
    pub stack_size: u32,
    pub mod_count: u32,
    pub implicit_mods: Vec<String>,
    pub explicit_mods: Vec<String>,
    pub crafted_mods: Vec<String>,
    pub enchant_mods: Vec<String>,
    pub prophecy_mods: Vec<String>,
    pub leaguestone_mods: Vec<String>,
    /// Implicit, explicit, crafted and enchant mods together.
    pub all_mods: Vec<String>,
    pub listing: Option<ListingPrice>,
    /// Listing price in the base currency; `None` if unpriced or the
    /// currency is unknown.
    pub price: Option<Decimal>,
    pub stats: CombatStats,
    pub resistances: Resistances,
    pub attributes: Attributes,
    pub life: f64,
    pub x: u32,
    pub y: u32,
}

struct Patterns {
    markup: Regex,
    number: Regex,
    range: Regex,
    increased_physical: Regex,
    increased_es: Vec<Regex>,
    increased_armour: Vec<Regex>,
    increased_evasion: Vec<Regex>,
    resistance: Regex,
    all_elemental: Regex,
    dual_resistance: Regex,
    attribute: Regex,
    all_attributes: Regex,
    dual_attribute: Regex,
    life: Regex,
}

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
}

static PATTERNS: LazyLock<Patterns> = LazyLock::new(|| {
    let re = |p: &str| Regex::new(p).expect("item pattern is valid");
    Patterns {
        markup: re(r"<<[^>]*>>"),
        number: re(r"[0-9]+(?:\.[0-9]+)?"),
        range: re(r"^([0-9]+)-([0-9]+)$"),
        increased_physical: re(r"^(\d+)% increased Physical Damage$"),
        increased_es: compile_all(&[
            r"^(\d+)% increased Energy Shield$",
            r"^(\d+)% increased Armour and Energy Shield$",
            r"^(\d+)% increased Evasion and Energy Shield$",
            r"^(\d+)% increased Armour, Evasion and Energy Shield$",
        ]),
        increased_armour: compile_all(&[
            r"^(\d+)% increased Armour$",
            r"^(\d+)% increased Armour and Evasion$",
            r"^(\d+)% increased Armour and Energy Shield$",
            r"^(\d+)% increased Armour, Evasion and Energy Shield$",
        ]),
        increased_evasion: compile_all(&[
            r"^(\d+)% increased Evasion Rating$",
            r"^(\d+)% increased Armour and Evasion$",
            r"^(\d+)% increased Evasion and Energy Shield$",
            r"^(\d+)% increased Armour, Evasion and Energy Shield$",
        ]),
        resistance: re(r"^([+-]\d+)% to (Fire|Cold|Lightning|Chaos) Resistance$"),
        all_elemental: re(r"^([+-]\d+)% to all Elemental Resistances$"),
        dual_resistance: re(r"^([+-]\d+)% to (Fire|Cold|Lightning) and (Fire|Cold|Lightning) Resistances$"),
        attribute: re(r"^([+-]\d+) to (Strength|Dexterity|Intelligence)$"),
        all_attributes: re(r"^([+-]\d+) to all Attributes$"),
        dual_attribute: re(r"^([+-]\d+) to (Strength|Dexterity|Intelligence) and (Strength|Dexterity|Intelligence)$"),
        life: re(r"^([+-]\d+) to maximum Life$"),
    }
});

fn first_number(text: &str) -> Option<f64> {
    PATTERNS.number.find(text)?.as_str().parse().ok()
}

fn range_average(text: &str) -> f64 {
    match PATTERNS.range.captures(text) {
        Some(caps) => {
            let low: f64 = caps[1].parse().unwrap_or(0.0);
            let high: f64 = caps[2].parse().unwrap_or(0.0);
            (low + high) / 2.0
        }
        None => 0.0,
    }
}

fn find_property<'a>(properties: &'a [Property], name: &str) -> Option<&'a Property> {
    properties.iter().find(|p| p.name == name)
}

fn property_number(properties: &[Property], name: &str) -> Option<f64> {
    find_property(properties, name)
        .and_then(Property::first_value)
        .and_then(first_number)
}

fn sum_first_capture<'a>(mods: impl IntoIterator<Item = &'a String>, patterns: &[&Regex]) -> f64 {
    mods.into_iter()
        .flat_map(|m| patterns.iter().filter_map(move |re| re.captures(m)))
        .filter_map(|caps| caps.get(1)?.as_str().parse::<f64>().ok())
        .sum()
}

/// Scale a quality-affected figure to what it would be at 20% quality.
/// Items that can no longer be modified keep their listed value.
fn at_max_quality(value: f64, quality: u32, increased: f64, unmodifiable: bool) -> f64 {
    if unmodifiable || quality >= 20 {
        return value;
    }
    value * (120.0 + increased) / (quality as f64 + 100.0 + increased)
}

impl Item {
    pub fn from_raw(raw: &RawItem, tab: &StashTab, currency: &CurrencySnapshot) -> Self {
        let patterns = &*PATTERNS;

        let name = patterns
            .markup
            .replace_all(&format!("{} {}", raw.name, raw.type_line), "")
            .trim()
            .to_string();
        let base = patterns.markup.replace_all(&raw.type_line, "").trim().to_string();

        let listing = listing_price(raw.note.as_deref(), tab.stash.as_deref());
        let price = listing.as_ref().and_then(|l| {
            let converted = currency.convert(l.amount, &l.currency);
            if converted.is_none() {
                debug!(item = %raw.id, price = %l.raw, "Listing price not convertible, item is unpriced");
            }
            converted
        });

        // group ids come straight from the feed and may be sparse
        let mut groups: BTreeMap<u32, u32> = BTreeMap::new();
        for socket in &raw.sockets {
            *groups.entry(socket.group).or_default() += 1;
        }

        let all_mods: Vec<String> = raw
            .implicit_mods
            .iter()
            .chain(&raw.explicit_mods)
            .chain(&raw.crafted_mods)
            .chain(&raw.enchant_mods)
            .cloned()
            .collect();

        let quality = property_number(&raw.properties, "Quality").unwrap_or(0.0) as u32;
        let mut item = Self {
            id: raw.id.clone(),
            name_lower: name.to_lowercase(),
            name,
            base_lower: base.to_lowercase(),
            base,
            rarity: Rarity::from_frame_type(raw.frame_type),
            league: raw.league.clone(),
            item_level: raw.ilvl,
            level: property_number(&raw.properties, "Level").unwrap_or(0.0) as u32,
            quality,
            experience: find_property(&raw.additional_properties, "Experience")
                .and_then(|p| p.progress)
                .map_or(0.0, |p| p * 100.0),
            corrupted: raw.corrupted,
            mirrored: raw.duplicated,
            identified: raw.identified,
            crafted: !raw.crafted_mods.is_empty(),
            enchanted: !raw.enchant_mods.is_empty(),
            sockets: raw.sockets.len() as u32,
            links: groups.into_values().max().unwrap_or(0),
            stack_size: raw.stack_size.unwrap_or(1),
            mod_count: (raw.implicit_mods.len() + raw.explicit_mods.len() + raw.crafted_mods.len())
                as u32,
            implicit_mods: raw.implicit_mods.clone(),
            explicit_mods: raw.explicit_mods.clone(),
            crafted_mods: raw.crafted_mods.clone(),
            enchant_mods: raw.enchant_mods.clone(),
            prophecy_mods: raw.prophecy_text.iter().cloned().collect(),
            leaguestone_mods: raw.properties.iter().map(Property::formatted).collect(),
            all_mods,
            listing,
            price,
            stats: CombatStats::default(),
            resistances: Resistances::default(),
            attributes: Attributes::default(),
            life: 0.0,
            x: raw.x,
            y: raw.y,
        };

        item.stats = item.combat_stats(&raw.properties);
        item.resistances = item.collect_resistances();
        item.attributes = item.collect_attributes();
        item.life = sum_first_capture(&item.all_mods, &[&patterns.life]);
        item
    }

    fn combat_stats(&self, properties: &[Property]) -> CombatStats {
        let patterns = &*PATTERNS;
        let aps = property_number(properties, "Attacks per Second").unwrap_or(0.0);

        let physical = find_property(properties, "Physical Damage")
            .and_then(Property::first_value)
            .map_or(0.0, range_average);
        let increased_physical =
            sum_first_capture(&self.explicit_mods, &[&patterns.increased_physical]);
        let physical_dps =
            at_max_quality(physical, self.quality, increased_physical, !self.is_modifiable()) * aps;

        let damage_sum = |name: &str| {
            find_property(properties, name).map_or(0.0, |p| {
                p.values.iter().map(|v| range_average(&v.0)).sum::<f64>()
            })
        };
        let elemental_dps = damage_sum("Elemental Damage") * aps;
        let chaos_dps = damage_sum("Chaos Damage") * aps;

        let defence = |name: &str, increased: &[Regex]| {
            let base = property_number(properties, name).unwrap_or(0.0);
            let refs: Vec<&Regex> = increased.iter().collect();
            let inc = sum_first_capture(&self.explicit_mods, &refs);
            at_max_quality(base, self.quality, inc, !self.is_modifiable())
        };

        CombatStats {
            attacks_per_second: aps,
            physical_dps,
            elemental_dps,
            chaos_dps,
            dps: physical_dps + elemental_dps + chaos_dps,
            energy_shield: defence("Energy Shield", &patterns.increased_es),
            armour: defence("Armour", &patterns.increased_armour),
            evasion: defence("Evasion Rating", &patterns.increased_evasion),
        }
    }

    fn collect_resistances(&self) -> Resistances {
        let patterns = &*PATTERNS;
        let mut res = Resistances::default();

        let mut add = |element: &str, value: f64| match element {
            "Fire" => res.fire += value,
            "Cold" => res.cold += value,
            "Lightning" => res.lightning += value,
            "Chaos" => res.chaos += value,
            _ => {}
        };

        for m in &self.all_mods {
            if let Some(caps) = patterns.resistance.captures(m) {
                add(&caps[2], caps[1].parse().unwrap_or(0.0));
            } else if let Some(caps) = patterns.dual_resistance.captures(m) {
                let value = caps[1].parse().unwrap_or(0.0);
                add(&caps[2], value);
                add(&caps[3], value);
            }
        }
        res.all_elemental = sum_first_capture(&self.all_mods, &[&patterns.all_elemental]);
        res
    }

    fn collect_attributes(&self) -> Attributes {
        let patterns = &*PATTERNS;
        let mut attrs = Attributes::default();

        let mut add = |name: &str, value: f64| match name {
            "Strength" => attrs.strength += value,
            "Dexterity" => attrs.dexterity += value,
            "Intelligence" => attrs.intelligence += value,
            _ => {}
        };

        for m in &self.all_mods {
            if let Some(caps) = patterns.attribute.captures(m) {
                add(&caps[2], caps[1].parse().unwrap_or(0.0));
            } else if let Some(caps) = patterns.dual_attribute.captures(m) {
                let value = caps[1].parse().unwrap_or(0.0);
                add(&caps[2], value);
                add(&caps[3], value);
            }
        }
        attrs.all = sum_first_capture(&self.all_mods, &[&patterns.all_attributes]);
        attrs
    }

    pub fn mods(&self, category: ModCategory) -> &[String] {
        match category {
            ModCategory::Total => &self.all_mods,
            ModCategory::Implicit => &self.implicit_mods,
            ModCategory::Explicit => &self.explicit_mods,
            ModCategory::Crafted => &self.crafted_mods,
            ModCategory::Enchant => &self.enchant_mods,
            ModCategory::Prophecy => &self.prophecy_mods,
            ModCategory::Leaguestone => &self.leaguestone_mods,
            ModCategory::Pseudo => &[],
        }
    }

    pub fn is_modifiable(&self) -> bool {
        !(self.mirrored || self.corrupted)
    }

    pub fn has_buyout(&self) -> bool {
        self.price.is_some_and(|p| p > Decimal::ZERO)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::currency::rates::{RateSnapshot, StaticRates};
    use crate::currency::CurrencyTable;
    use crate::config::{ConfidenceLevel, CurrencyConfig};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    pub(crate) async fn test_currency() -> Arc<CurrencySnapshot> {
        let config = CurrencyConfig {
            rates_url: String::new(),
            update_interval_minutes: 30,
            confidence_level: ConfidenceLevel::Low,
        };
        let source = StaticRates::new(RateSnapshot {
            rates: [("Exalted Orb".to_string(), dec!(150))].into_iter().collect(),
            aliases: Vec::new(),
        });
        let mut table = CurrencyTable::new(&config, None, Arc::new(source));
        table.load().unwrap();
        table.update(true, false).await.unwrap();
        table.snapshot()
    }

    pub(crate) fn weapon_json() -> serde_json::Value {
        serde_json::json!({
            "id": "weapon-1",
            "name": "<<set:MS>><<set:M>><<set:S>>Doom Edge",
            "typeLine": "Vaal Axe",
            "league": "Standard",
            "note": "~b/o 2 exa",
            "frameType": 2,
            "ilvl": 84,
            "identified": true,
            "corrupted": false,
            "sockets": [
                {"group": 0, "attr": "S"}, {"group": 0, "attr": "S"},
                {"group": 0, "attr": "D"}, {"group": 1, "attr": "I"},
                {"group": 1, "attr": "S"}, {"group": 1, "attr": "S"}
            ],
            "properties": [
                {"name": "Quality", "values": [["+10%", 1]], "displayMode": 0},
                {"name": "Physical Damage", "values": [["100-200", 1]], "displayMode": 0},
                {"name": "Elemental Damage", "values": [["10-20", 4], ["30-40", 5]], "displayMode": 0},
                {"name": "Attacks per Second", "values": [["1.50", 1]], "displayMode": 0}
            ],
            "implicitMods": ["+25% to Fire and Cold Resistances"],
            "explicitMods": [
                "100% increased Physical Damage",
                "+30% to Fire Resistance",
                "+10% to all Elemental Resistances",
                "+20 to Strength and Dexterity",
                "+50 to maximum Life"
            ],
            "craftedMods": ["+15 to Strength"]
        })
    }

    pub(crate) fn build(json: serde_json::Value, currency: &CurrencySnapshot) -> Item {
        let raw: RawItem = serde_json::from_value(json).unwrap();
        Item::from_raw(&raw, &StashTab::default(), currency)
    }

    #[tokio::test]
    async fn test_derived_fields() {
        let currency = test_currency().await;
        let item = build(weapon_json(), &currency);

        assert_eq!(item.name, "Doom Edge Vaal Axe");
        assert_eq!(item.name_lower, "doom edge vaal axe");
        assert_eq!(item.rarity, Some(Rarity::Rare));
        assert_eq!(item.sockets, 6);
        assert_eq!(item.links, 3);
        assert_eq!(item.stack_size, 1);
        assert_eq!(item.mod_count, 7);
        assert_eq!(item.quality, 10);
        assert!(item.crafted);
        assert!(!item.enchanted);
        assert!(item.is_modifiable());
        assert_eq!(item.price, Some(dec!(300)));
        assert!(item.has_buyout());
    }

    #[tokio::test]
    async fn test_dps_normalised_to_max_quality() {
        let currency = test_currency().await;
        let item = build(weapon_json(), &currency);

        // 150 avg * (120 + 100) / (10 + 100 + 100) * 1.5
        let expected_pdps = 150.0 * 220.0 / 210.0 * 1.5;
        assert!((item.stats.physical_dps - expected_pdps).abs() < 1e-9);
        assert!((item.stats.elemental_dps - 75.0).abs() < 1e-9);
        assert!((item.stats.dps - (expected_pdps + 75.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unmodifiable_items_are_not_normalised() {
        let currency = test_currency().await;
        let mut json = weapon_json();
        json["corrupted"] = serde_json::json!(true);
        let item = build(json, &currency);

        assert!((item.stats.physical_dps - 225.0).abs() < 1e-9);
        assert!(!item.is_modifiable());
    }

    #[tokio::test]
    async fn test_resistances_and_attributes() {
        let currency = test_currency().await;
        let item = build(weapon_json(), &currency);

        assert_eq!(item.resistances.fire, 55.0);
        assert_eq!(item.resistances.cold, 25.0);
        assert_eq!(item.resistances.lightning, 0.0);
        assert_eq!(item.resistances.all_elemental, 10.0);
        assert_eq!(item.attributes.strength, 35.0);
        assert_eq!(item.attributes.dexterity, 20.0);
        assert_eq!(item.life, 50.0);
    }

    #[tokio::test]
    async fn test_unknown_currency_is_unpriced() {
        let currency = test_currency().await;
        let mut json = weapon_json();
        json["note"] = serde_json::json!("~b/o 3 shiny-rock");
        let item = build(json, &currency);

        assert!(item.listing.is_some());
        assert_eq!(item.price, None);
        assert!(!item.has_buyout());
    }

    #[tokio::test]
    async fn test_overflowing_listing_is_unpriced() {
        let currency = test_currency().await;
        let mut json = weapon_json();
        json["note"] = serde_json::json!("~b/o 9999999999999999999999999999 exa");
        let item = build(json, &currency);

        assert_eq!(item.listing.as_ref().map(|l| l.currency.as_str()), Some("exa"));
        assert_eq!(item.price, None);
    }

    #[tokio::test]
    async fn test_sparse_socket_groups() {
        let currency = test_currency().await;
        let mut json = weapon_json();
        json["sockets"] = serde_json::json!([
            {"group": 4000000000u32, "attr": "S"},
            {"group": 4000000000u32, "attr": "D"},
            {"group": 0, "attr": "I"}
        ]);
        let item = build(json, &currency);

        assert_eq!(item.sockets, 3);
        assert_eq!(item.links, 2);
    }

    #[test]
    fn test_rarity_names() {
        assert_eq!(Rarity::from_name("Divination Card"), Some(Rarity::DivinationCard));
        assert_eq!(Rarity::from_frame_type(3), Some(Rarity::Unique));
        assert_eq!(Rarity::from_frame_type(42), None);
        assert_eq!(Rarity::Unique.to_string(), "unique");
    }
}
