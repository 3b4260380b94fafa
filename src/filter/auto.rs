//! Filters generated from an external item price list.
//!
//! Every priced line becomes a buyout filter capped at the item's market
//! value. The compiler later scales that cap with the configured overrides.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::filter::definition::{
    Criteria, Filter, FilterGroupDef, GroupType, ModFilterDef, AUTO_CATEGORY, AUTO_PRIORITY,
};
use crate::item::Rarity;

/// Explicit mod that tells apart the variants of one unique.
const VARIANTS: &[(&str, &str)] = &[
    ("Physical", r"([0-9]+)% increased Physical Damage$"),
    ("Cold", r"([0-9]+)% increased Cold Damage$"),
    ("Fire", r"([0-9]+)% increased Fire Damage$"),
    ("Lightning", r"([0-9]+)% increased Lightning Damage$"),
    ("ES", r"([0-9]+)% increased Energy Shield$"),
    ("Armour", r"([0-9]+)% increased Armour$"),
    ("Armour/Evasion/ES", r"([0-9]+)% increased Armour, Evasion and Energy Shield$"),
    ("Armour/ES", r"([0-9]+)% increased Armour and Energy Shield$"),
    ("Evasion/ES", r"([0-9]+)% increased Evasion and Energy Shield$"),
    ("Evasion/ES/Life", r"([0-9]+)% increased Evasion and Energy Shield$"),
    ("Evasion", r"([0-9]+)% increased Evasion Rating$"),
    ("Armour/Evasion", r"([0-9]+)% increased Armour and Evasion$"),
    ("Armour/ES/Life", r"([0-9]+)% increased Armour and Evasion$"),
    (
        "Added Attacks",
        r"Adds ([0-9]+) to ([0-9]+) Lightning Damage to Attacks during Flask effect$",
    ),
    (
        "Added Spells",
        r"Adds ([0-9]+) to ([0-9]+) Lightning Damage to Spells during Flask effect$",
    ),
    ("Penetration", r"Damage Penetrates 10% Lightning Resistance during Flask effect$"),
    ("Conversion", r"20% of Physical Damage Converted to Lightning during Flask effect$"),
];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceLine {
    pub name: String,
    #[serde(default)]
    pub base_type: Option<String>,
    #[serde(default)]
    pub item_class: u8,
    #[serde(default)]
    pub chaos_value: f64,
    #[serde(default)]
    pub links: u32,
    #[serde(default)]
    pub variant: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PriceOverview {
    #[serde(default)]
    lines: Vec<PriceLine>,
}

/// Where generated filters come from.
#[async_trait]
pub trait ItemPriceSource: Send + Sync {
    async fn fetch_filters(&self) -> Result<Vec<Filter>>;

    fn name(&self) -> &str;
}

fn slug(title: &str) -> String {
    title
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Build one filter per priced line. `taken` holds ids already in use and
/// receives the new ones.
pub fn generate_filters(lines: &[PriceLine], taken: &mut HashSet<String>) -> Vec<Filter> {
    let mut filters = Vec::with_capacity(lines.len());

    for line in lines {
        if line.chaos_value <= 0.0 {
            continue;
        }
        let Ok(price) = Decimal::try_from(line.chaos_value) else {
            continue;
        };
        let rarity = Rarity::from_frame_type(line.item_class).unwrap_or(Rarity::Unique);

        let title = format!(
            "{} {} {}",
            if rarity == Rarity::Relic { "Legacy" } else { "" },
            line.name,
            line.variant.as_deref().unwrap_or("")
        )
        .trim()
        .to_string();

        let base_id = format!("_{}", slug(&title));
        let mut id = base_id.clone();
        let mut n = 2;
        while taken.contains(&id) {
            id = format!("{base_id}{n}");
            n += 1;
        }
        taken.insert(id.clone());

        let mut criteria = Criteria {
            rarity: Some(vec![rarity.to_string()]),
            name: Some(vec![format!("\"{}\"", line.name)]),
            price_max: Some(format!("{} chaos", price.round_dp(2).normalize())),
            buyout: Some(true),
            ..Criteria::default()
        };
        if line.links > 0 {
            criteria.links_min = Some(line.links);
        }

        if let Some(variant) = &line.variant {
            match VARIANTS.iter().find(|(name, _)| name == variant) {
                Some((_, expr)) => {
                    criteria.fgs = Some(vec![FilterGroupDef {
                        kind: GroupType::All,
                        mfs: vec![ModFilterDef::new("explicit", expr)],
                        match_min: None,
                        match_max: None,
                    }]);
                }
                None => warn!(variant = %variant, item = %line.name, "Unknown item variant"),
            }
        }

        let mut filter = Filter::new(title, id, criteria);
        filter.category = AUTO_CATEGORY.to_string();
        filter.priority = AUTO_PRIORITY;
        filter.description = line.base_type.clone().unwrap_or_default();
        filters.push(filter);
    }
    filters
}

/// Item overview endpoints of poe.ninja.
pub struct NinjaItemSource {
    http: reqwest::Client,
    urls: Vec<String>,
    league: String,
}

impl NinjaItemSource {
    pub fn new(urls: Vec<String>, league: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create item price HTTP client")?;
        Ok(Self {
            http,
            urls,
            league: league.into(),
        })
    }

    async fn fetch_lines(&self, url: &str) -> Result<Vec<PriceLine>> {
        let overview: PriceOverview = self
            .http
            .get(url)
            .query(&[("league", self.league.as_str())])
            .send()
            .await
            .with_context(|| format!("Item price request failed: {url}"))?
            .error_for_status()
            .with_context(|| format!("Item price source returned an error: {url}"))?
            .json()
            .await
            .with_context(|| format!("Failed to decode item prices: {url}"))?;
        Ok(overview.lines)
    }
}

#[async_trait]
impl ItemPriceSource for NinjaItemSource {
    #[instrument(skip(self), fields(league = %self.league))]
    async fn fetch_filters(&self) -> Result<Vec<Filter>> {
        let mut taken = HashSet::new();
        let mut filters = Vec::new();
        for url in &self.urls {
            let lines = self.fetch_lines(url).await?;
            debug!(url = %url, lines = lines.len(), "Fetched item prices");
            filters.extend(generate_filters(&lines, &mut taken));
        }
        Ok(filters)
    }

    fn name(&self) -> &str {
        "poe.ninja"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn lines() -> serde_json::Value {
        serde_json::json!({
            "lines": [
                {"name": "Tabula Rasa", "baseType": "Simple Robe", "itemClass": 3,
                 "chaosValue": 12.5, "links": 6, "variant": null},
                {"name": "Tabula Rasa", "baseType": "Simple Robe", "itemClass": 3,
                 "chaosValue": 10.0, "links": 0, "variant": null},
                {"name": "Atziri's Disfavour", "baseType": "Vaal Axe", "itemClass": 3,
                 "chaosValue": 0, "links": 0},
                {"name": "Vessel of Vinktar", "baseType": "Topaz Flask", "itemClass": 3,
                 "chaosValue": 40, "variant": "Added Attacks"},
                {"name": "Doryani's Catalyst", "baseType": "Opal Sceptre", "itemClass": 9,
                 "chaosValue": 3.333, "variant": "Mystery"}
            ]
        })
    }

    fn parse(value: serde_json::Value) -> Vec<PriceLine> {
        serde_json::from_value::<PriceOverview>(value).unwrap().lines
    }

    #[test]
    fn test_generate_filters() {
        let mut taken = HashSet::new();
        let filters = generate_filters(&parse(lines()), &mut taken);
        assert_eq!(filters.len(), 4);

        let six_link = &filters[0];
        assert_eq!(six_link.id, "_tabula_rasa");
        assert_eq!(six_link.category, AUTO_CATEGORY);
        assert_eq!(six_link.criteria.links_min, Some(6));
        assert_eq!(six_link.criteria.price_max.as_deref(), Some("12.5 chaos"));
        assert_eq!(six_link.criteria.name, Some(vec!["\"Tabula Rasa\"".to_string()]));
        assert_eq!(six_link.criteria.rarity, Some(vec!["unique".to_string()]));
        assert_eq!(six_link.criteria.buyout, Some(true));

        // same title gets a numbered id
        assert_eq!(filters[1].id, "_tabula_rasa2");
        assert_eq!(filters[1].criteria.links_min, None);

        let vinktar = &filters[2];
        assert_eq!(vinktar.id, "_vessel_of_vinktar_added_attacks");
        let groups = vinktar.criteria.fgs.as_ref().unwrap();
        assert_eq!(groups[0].mfs[0].category, "explicit");

        let legacy = &filters[3];
        assert_eq!(legacy.title, "Legacy Doryani's Catalyst Mystery");
        assert_eq!(legacy.criteria.price_max.as_deref(), Some("3.33 chaos"));
        assert!(legacy.criteria.fgs.is_none());
    }

    #[tokio::test]
    async fn test_ninja_item_source() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/GetUniqueArmourOverview"))
            .and(query_param("league", "Standard"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lines()))
            .mount(&server)
            .await;

        let source = NinjaItemSource::new(
            vec![format!("{}/GetUniqueArmourOverview", server.uri())],
            "Standard",
        )
        .unwrap();
        let filters = source.fetch_filters().await.unwrap();
        assert_eq!(filters.len(), 4);
    }

    #[tokio::test]
    async fn test_ninja_item_source_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let source = NinjaItemSource::new(vec![server.uri()], "Standard").unwrap();
        assert!(source.fetch_filters().await.is_err());
    }
}
