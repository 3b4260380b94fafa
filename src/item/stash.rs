//! Raw feed page decoding.
//!
//! Only the fields the scanner consumes are modelled; everything else in the
//! page is ignored.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct StashSnapshot {
    pub next_change_id: Option<String>,
    #[serde(default)]
    pub stashes: Vec<StashTab>,
}

impl StashSnapshot {
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Public, non-empty tabs whose first item belongs to `league`.
    pub fn league_tabs(self, league: &str) -> Vec<StashTab> {
        self.stashes
            .into_iter()
            .filter(|tab| tab.public && tab.league() == Some(league))
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StashTab {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub public: bool,
    pub account_name: Option<String>,
    pub last_character_name: Option<String>,
    /// Tab name, which may carry a price for every item in it.
    pub stash: Option<String>,
    #[serde(default)]
    pub items: Vec<RawItem>,
}

impl StashTab {
    pub fn league(&self) -> Option<&str> {
        self.items.first().and_then(|item| item.league.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub type_line: String,
    pub league: Option<String>,
    pub note: Option<String>,
    #[serde(default)]
    pub frame_type: u8,
    #[serde(default)]
    pub ilvl: u32,
    #[serde(default)]
    pub identified: bool,
    #[serde(default)]
    pub corrupted: bool,
    #[serde(default)]
    pub duplicated: bool,
    pub stack_size: Option<u32>,
    #[serde(default)]
    pub sockets: Vec<Socket>,
    #[serde(default)]
    pub properties: Vec<Property>,
    #[serde(default)]
    pub additional_properties: Vec<Property>,
    #[serde(default)]
    pub implicit_mods: Vec<String>,
    #[serde(default)]
    pub explicit_mods: Vec<String>,
    #[serde(default)]
    pub crafted_mods: Vec<String>,
    #[serde(default)]
    pub enchant_mods: Vec<String>,
    pub prophecy_text: Option<String>,
    pub inventory_id: Option<String>,
    #[serde(default)]
    pub x: u32,
    #[serde(default)]
    pub y: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Socket {
    #[serde(default)]
    pub group: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub values: Vec<PropertyValue>,
    pub display_mode: Option<u8>,
    pub progress: Option<f64>,
}

/// `["12-24", 0]`: display text and a value-type tag.
#[derive(Debug, Clone, Deserialize)]
pub struct PropertyValue(pub String, pub i64);

impl Property {
    /// Text of the first value, if any.
    pub fn first_value(&self) -> Option<&str> {
        self.values.first().map(|v| v.0.as_str())
    }

    /// `Name: value, value`, or the name with `%N` placeholders filled in
    /// for format-style properties.
    pub fn formatted(&self) -> String {
        if self.display_mode == Some(3) {
            let mut text = self.name.clone();
            for (i, value) in self.values.iter().enumerate() {
                text = text.replace(&format!("%{i}"), &value.0);
            }
            return text;
        }
        if self.values.is_empty() {
            return self.name.clone();
        }
        let values: Vec<&str> = self.values.iter().map(|v| v.0.as_str()).collect();
        format!("{}: {}", self.name, values.join(", "))
    }
}
