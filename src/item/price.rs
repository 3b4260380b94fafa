//! Listing prices from item notes and stash tab names.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;

static LISTING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"~(?:b/o|price)([0-9]+(?:\.[0-9]+)?)(?:[/\\]([0-9]+(?:\.[0-9]+)?))?([a-z\-']+)",
    )
    .expect("listing price pattern is valid")
});

/// Asking price as written by the seller.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingPrice {
    pub amount: Decimal,
    /// Currency alias, lowercased.
    pub currency: String,
    /// The note or tab name the price came from.
    pub raw: String,
}

/// Parse `~b/o 1.5 exa`, `~price 3/2 chaos` and similar.
pub fn parse_listing(text: &str) -> Option<(Decimal, String)> {
    let compact: String = text
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let caps = LISTING_RE.captures(&compact)?;

    let mut amount = Decimal::from_str(&caps[1]).ok()?;
    if let Some(denominator) = caps.get(2) {
        let denominator = Decimal::from_str(denominator.as_str()).ok()?;
        amount = amount.checked_div(denominator)?;
    }
    Some((amount, caps[3].to_string()))
}

/// The item note takes precedence over the tab name.
pub fn listing_price(note: Option<&str>, stash_name: Option<&str>) -> Option<ListingPrice> {
    [note, stash_name].into_iter().flatten().find_map(|text| {
        parse_listing(text).map(|(amount, currency)| ListingPrice {
            amount,
            currency,
            raw: text.to_string(),
        })
    })
}
