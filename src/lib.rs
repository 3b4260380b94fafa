pub mod config;
pub mod currency;
pub mod error;
pub mod feed;
pub mod filter;
pub mod item;
pub mod monitoring;
pub mod scanner;
pub mod state;
