//! Change-feed walking: cursor type, request ledger, and the downloader actor.

pub mod change_id;
pub mod downloader;
pub mod latest;
pub mod ledger;
pub mod stats;

pub use change_id::ChangeId;
pub use downloader::{FeedDownloader, FeedPayload, NextResult};
