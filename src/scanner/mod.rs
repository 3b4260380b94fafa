//! The scan pipeline: dispatcher, update scheduler, result delivery and the
//! lifecycle tying them to the feed downloader.

pub mod dispatcher;
pub mod lifecycle;
pub mod results;
pub mod updater;

pub use dispatcher::{ParseStats, ParserDispatcher, ScanContext};
pub use lifecycle::Scanner;
pub use results::{ItemMatch, LogResultHandler, ResultHandler, StashContext};
pub use updater::{Services, UpdateScheduler};
