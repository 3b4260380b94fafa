//! Market items: raw feed records, listing prices and the derived model.

pub mod model;
pub mod price;
pub mod stash;

pub use model::{Item, ModCategory, Rarity};
pub use price::{listing_price, ListingPrice};
pub use stash::{RawItem, StashSnapshot, StashTab};
