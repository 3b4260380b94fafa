//! Pseudo modifiers: named totals that are not literally on the item.
//!
//! Some are computed from the item's derived resistances and attributes,
//! the rest merge differently worded mods that grant the same bonus.

use std::sync::LazyLock;

use regex::Regex;

use crate::filter::mods::line_total;
use crate::item::Item;

pub enum PseudoKind {
    Derived(fn(&Item) -> f64),
    /// Summed over every pattern and every modifier line.
    Patterns(Vec<Regex>),
}

pub struct PseudoMod {
    pub name: String,
    pub kind: PseudoKind,
}

impl PseudoMod {
    pub fn value(&self, item: &Item) -> f64 {
        match &self.kind {
            PseudoKind::Derived(compute) => compute(item),
            PseudoKind::Patterns(patterns) => patterns
                .iter()
                .map(|re| item.all_mods.iter().map(|m| line_total(re, m)).sum::<f64>())
                .sum(),
        }
    }
}

impl std::fmt::Debug for PseudoMod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PseudoMod").field("name", &self.name).finish()
    }
}

fn nonzero(value: f64) -> f64 {
    if value != 0.0 {
        1.0
    } else {
        0.0
    }
}

fn elemental_count(item: &Item) -> f64 {
    let res = &item.resistances;
    if res.all_elemental != 0.0 {
        return 3.0;
    }
    nonzero(res.fire) + nonzero(res.cold) + nonzero(res.lightning)
}

fn total_elemental(item: &Item) -> f64 {
    let res = &item.resistances;
    res.all_elemental * 3.0 + res.fire + res.cold + res.lightning
}

const DERIVED: &[(&str, fn(&Item) -> f64)] = &[
    ("# Elemental Resistances", elemental_count),
    ("# Resistances", |item: &Item| {
        elemental_count(item) + nonzero(item.resistances.chaos)
    }),
    ("+#% total Elemental Resistance", total_elemental),
    ("+#% total Resistance", |item: &Item| {
        total_elemental(item) + item.resistances.chaos
    }),
    ("(total) +#% to all Elemental Resistances", |item: &Item| {
        let res = &item.resistances;
        res.all_elemental + res.fire.min(res.cold).min(res.lightning)
    }),
    ("(total) +#% to Fire Resistance", |item: &Item| {
        item.resistances.all_elemental + item.resistances.fire
    }),
    ("(total) +#% to Cold Resistance", |item: &Item| {
        item.resistances.all_elemental + item.resistances.cold
    }),
    ("(total) +#% to Lightning Resistance", |item: &Item| {
        item.resistances.all_elemental + item.resistances.lightning
    }),
    ("(total) +#% to Chaos Resistance", |item: &Item| item.resistances.chaos),
    ("(total) +# to all Attributes", |item: &Item| {
        let attrs = &item.attributes;
        attrs.all + attrs.strength.min(attrs.dexterity).min(attrs.intelligence)
    }),
    ("(total) +# to Strength", |item: &Item| {
        item.attributes.all + item.attributes.strength
    }),
    ("(total) +# to Dexterity", |item: &Item| {
        item.attributes.all + item.attributes.dexterity
    }),
    ("(total) +# to Intelligence", |item: &Item| {
        item.attributes.all + item.attributes.intelligence
    }),
    // 2 strength grants 1 life
    ("(total) +# to maximum Life", |item: &Item| {
        item.life + (item.attributes.strength + item.attributes.all) / 2.0
    }),
];

const SOCKETED_GEMS: &[&str] = &[
    "Aura", "Bow", "Chaos", "Elemental", "Cold", "Fire", "Lightning", "Melee", "Minion",
    "Movement", "Spell", "Support", "Strength", "Vaal",
];

fn pattern_mods() -> Vec<(String, Vec<String>)> {
    let mut mods: Vec<(String, Vec<String>)> = vec![
        (
            "(total) #% increased Elemental Damage with Weapons".into(),
            vec![r"([0-9]+)% increased Elemental Damage(?: with Weapons)?$".into()],
        ),
        (
            "(total) #% increased Cold Spell Damage".into(),
            vec![r"([0-9]+)% increased (?:Elemental|Spell|Cold) Damage$".into()],
        ),
        (
            "(total) #% increased Fire Spell Damage".into(),
            vec![r"([0-9]+)% increased (?:Elemental|Spell|Fire) Damage$".into()],
        ),
        (
            "(total) #% increased Lightning Spell Damage".into(),
            vec![r"([0-9]+)% increased (?:Elemental|Spell|Lightning) Damage$".into()],
        ),
        (
            "(total) #% increased Burning Damage".into(),
            vec![r"([0-9]+)% increased (?:Elemental|Fire|Burning) Damage$".into()],
        ),
        (
            "(total) #% increased Fire Area Damage".into(),
            vec![r"([0-9]+)% increased (?:Elemental|Fire|Area) Damage$".into()],
        ),
        (
            "(total) #% increased Critical Strike Chance for Spells".into(),
            vec![
                r"([0-9]+)% increased Global Critical Strike Chance$".into(),
                r"([0-9]+)% increased Critical Strike Chance for Spells$".into(),
            ],
        ),
        (
            "(total) Adds # Damage to Attacks".into(),
            vec![r"Adds ([0-9]+) to ([0-9]+) (?:Physical|Chaos|Cold|Fire|Lightning) Damage(?: to Attacks)?$".into()],
        ),
        (
            "(total) Adds # Elemental Damage to Attacks".into(),
            vec![r"Adds ([0-9]+) to ([0-9]+) (?:Cold|Fire|Lightning) Damage(?: to Attacks)?$".into()],
        ),
        (
            "(total) Adds # Damage to Spells".into(),
            vec![r"Adds ([0-9]+) to ([0-9]+) (?:Chaos|Cold|Fire|Lightning) Damage to Spells$".into()],
        ),
        (
            "(total) Adds # Elemental Damage to Spells".into(),
            vec![r"Adds ([0-9]+) to ([0-9]+) (?:Cold|Fire|Lightning) Damage to Spells$".into()],
        ),
        (
            "(total) Adds # Physical Damage to Attacks".into(),
            vec![r"Adds ([0-9]+) to ([0-9]+) Physical Damage(?: to Attacks)?$".into()],
        ),
    ];

    for element in ["Cold", "Fire", "Lightning"] {
        mods.push((
            format!("(total) #% increased {element} Damage with Weapons"),
            vec![format!(
                r"([0-9]+)% increased (?:Elemental|{element}) Damage(?: with Weapons)?$"
            )],
        ));
    }
    for gem in SOCKETED_GEMS {
        mods.push((
            format!("(total) +# to Level of Socketed {gem} Gems"),
            vec![format!(r"([\-+][0-9]+) to Level of Socketed(?: {gem})? Gems$")],
        ));
    }
    mods
}

static CATALOG: LazyLock<Vec<PseudoMod>> = LazyLock::new(|| {
    let mut catalog: Vec<PseudoMod> = DERIVED
        .iter()
        .map(|&(name, compute)| PseudoMod {
            name: name.to_string(),
            kind: PseudoKind::Derived(compute),
        })
        .collect();

    for (name, patterns) in pattern_mods() {
        let patterns = patterns
            .iter()
            .filter_map(|p| Regex::new(&format!("(?i)^{p}")).ok())
            .collect();
        catalog.push(PseudoMod {
            name,
            kind: PseudoKind::Patterns(patterns),
        });
    }
    catalog
});

/// Look up a pseudo modifier by name, ignoring case.
pub fn lookup(name: &str) -> Option<&'static PseudoMod> {
    let name = name.trim();
    CATALOG.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

pub fn names() -> impl Iterator<Item = &'static str> {
    CATALOG.iter().map(|p| p.name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::model::tests::{build, test_currency, weapon_json};

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert!(lookup("+#% TOTAL elemental resistance").is_some());
        assert!(lookup("(total) +# to Level of Socketed Vaal Gems").is_some());
        assert!(lookup("no such pseudo").is_none());
        assert!(names().count() > DERIVED.len());
    }

    #[tokio::test]
    async fn test_derived_resistance_totals() {
        let currency = test_currency().await;
        let item = build(weapon_json(), &currency);

        // fire 55, cold 25, lightning 0, all elemental 10
        let total = lookup("+#% total Elemental Resistance").unwrap();
        assert_eq!(total.value(&item), 30.0 + 55.0 + 25.0);

        let count = lookup("# Elemental Resistances").unwrap();
        assert_eq!(count.value(&item), 3.0);

        let fire = lookup("(total) +#% to Fire Resistance").unwrap();
        assert_eq!(fire.value(&item), 65.0);

        // life 50 plus half of 35 strength
        let life = lookup("(total) +# to maximum Life").unwrap();
        assert_eq!(life.value(&item), 67.5);
    }

    #[tokio::test]
    async fn test_pattern_pseudo_merges_wordings() {
        let currency = test_currency().await;
        let mut json = weapon_json();
        json["explicitMods"] = serde_json::json!([
            "Adds 10 to 20 Fire Damage to Attacks",
            "Adds 2 to 4 Physical Damage"
        ]);
        json["implicitMods"] = serde_json::json!([]);
        let item = build(json, &currency);

        let added = lookup("(total) Adds # Damage to Attacks").unwrap();
        assert_eq!(added.value(&item), 15.0 + 3.0);

        let elemental = lookup("(total) Adds # Elemental Damage to Attacks").unwrap();
        assert_eq!(elemental.value(&item), 15.0);
    }
}
