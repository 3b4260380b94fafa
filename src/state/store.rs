//! Durable scan state: the feed cursor and the dedup index.
//!
//! Two files live in the state directory:
//!
//! - `stateid.dat` holds the last committed change id, replaced atomically.
//! - `state.dat` is an append-only log of `id;timestamp;price;seller` lines.
//!   It is replayed on load and immediately rewritten without duplicates.
//!
//! Item updates are buffered and only reach the log together with the cursor
//! in [`StateStore::save_state`], once per fully processed payload.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info, warn};

use crate::feed::change_id::ChangeId;
use crate::state::atomic::write_atomic;

pub const CURSOR_FILE: &str = "stateid.dat";
pub const LOG_FILE: &str = "state.dat";

/// Last seen listing of an item.
#[derive(Debug, Clone, PartialEq)]
pub struct SeenItem {
    pub timestamp: DateTime<Utc>,
    pub price: Option<String>,
    pub seller: String,
}

impl SeenItem {
    fn same_listing(&self, price: Option<&str>, seller: &str) -> bool {
        self.price.as_deref() == price && self.seller == seller
    }
}

pub struct StateStore {
    dir: PathBuf,
    change_id: Option<ChangeId>,
    items: HashMap<String, SeenItem>,
    pending: Vec<(String, SeenItem)>,
    log: Option<BufWriter<File>>,
}

fn clean_field(value: &str) -> String {
    value.replace(['\n', '\r'], " ")
}

fn format_record(id: &str, item: &SeenItem) -> String {
    format!(
        "{};{};{};{}\n",
        id,
        item.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        item.price.as_deref().map(clean_field).unwrap_or_default(),
        clean_field(&item.seller)
    )
}

fn parse_record(line: &str) -> Option<(String, SeenItem)> {
    let mut parts = line.splitn(3, ';');
    let id = parts.next().filter(|s| !s.is_empty())?;
    let timestamp = parts.next()?;
    let (price, seller) = parts.next()?.rsplit_once(';')?;

    let timestamp = DateTime::parse_from_rfc3339(timestamp)
        .map(|t| t.with_timezone(&Utc))
        .ok()?;

    Some((
        id.to_string(),
        SeenItem {
            timestamp,
            price: (!price.is_empty()).then(|| price.to_string()),
            seller: seller.to_string(),
        },
    ))
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            change_id: None,
            items: HashMap::new(),
            pending: Vec::new(),
            log: None,
        }
    }

    fn cursor_path(&self) -> PathBuf {
        self.dir.join(CURSOR_FILE)
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// Read the cursor, replay and compact the item log, and open it for appending.
    pub fn load_state(&mut self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create state directory: {}", self.dir.display()))?;

        self.change_id = read_cursor(&self.cursor_path())?;

        let log_path = self.log_path();
        let (items, replayed, malformed) = replay_log(&log_path)?;
        if malformed > 0 {
            warn!(malformed, "Skipped malformed state records");
        }
        self.items = items;

        let mut compacted = String::new();
        for (id, item) in &self.items {
            compacted.push_str(&format_record(id, item));
        }
        write_atomic(&log_path, compacted.as_bytes())?;

        self.log = Some(BufWriter::new(open_log(&log_path)?));

        info!(
            change_id = self.change_id.as_ref().map(ChangeId::as_str).unwrap_or(""),
            items = self.items.len(),
            replayed,
            "Loaded scan state"
        );
        Ok(())
    }

    /// Record a listing. Returns true if the item is new or its price or
    /// seller changed since it was last seen. The update only becomes part of
    /// the dedup index once `save_state` commits it.
    pub fn add_item(&mut self, id: &str, price: Option<&str>, seller: &str) -> bool {
        let seen = self
            .pending
            .iter()
            .rev()
            .find(|(pending_id, _)| pending_id == id)
            .map(|(_, item)| item)
            .or_else(|| self.items.get(id));
        if seen.is_some_and(|seen| seen.same_listing(price, seller)) {
            return false;
        }

        let item = SeenItem {
            timestamp: Utc::now(),
            price: price.map(str::to_string),
            seller: seller.to_string(),
        };
        self.pending.push((id.to_string(), item));
        true
    }

    /// Commit buffered item updates, then the cursor. On failure the buffered
    /// updates are discarded and the dedup index is left untouched.
    pub fn save_state(&mut self, change_id: &ChangeId) -> Result<()> {
        let staged = std::mem::take(&mut self.pending);
        if !staged.is_empty() {
            if let Err(e) = self.append_records(&staged) {
                // drop whatever is still buffered so it never reaches the log
                if let Some(log) = self.log.take() {
                    let _ = log.into_parts();
                }
                return Err(e);
            }
            debug!(records = staged.len(), "Appended state delta");
        }

        write_atomic(&self.cursor_path(), change_id.as_str().as_bytes())?;
        self.items.extend(staged);
        self.change_id = Some(change_id.clone());
        Ok(())
    }

    fn append_records(&mut self, records: &[(String, SeenItem)]) -> Result<()> {
        if self.log.is_none() {
            fs::create_dir_all(&self.dir).with_context(|| {
                format!("Failed to create state directory: {}", self.dir.display())
            })?;
            self.log = Some(BufWriter::new(open_log(&self.log_path())?));
        }
        let Some(log) = self.log.as_mut() else {
            return Ok(());
        };
        for (id, item) in records {
            log.write_all(format_record(id, item).as_bytes())
                .context("Failed to append to state log")?;
        }
        log.flush().context("Failed to flush state log")?;
        log.get_ref()
            .sync_data()
            .context("Failed to sync state log")?;
        Ok(())
    }

    pub fn change_id(&self) -> Option<&ChangeId> {
        self.change_id.as_ref()
    }

    pub fn get(&self, id: &str) -> Option<&SeenItem> {
        self.items.get(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Close the log. Updates not yet committed by `save_state` are dropped;
    /// reprocessing their payload recreates them.
    pub fn close(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            debug!(
                records = self.pending.len(),
                "Dropping uncommitted state records"
            );
            self.pending.clear();
        }
        if let Some(mut log) = self.log.take() {
            log.flush().context("Failed to flush state log")?;
        }
        Ok(())
    }
}

fn open_log(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open state log: {}", path.display()))
}

fn read_cursor(path: &Path) -> Result<Option<ChangeId>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read cursor: {}", path.display()))?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    match trimmed.parse::<ChangeId>() {
        Ok(id) => Ok(Some(id)),
        Err(e) => {
            warn!(error = %e, "Ignoring malformed cursor");
            Ok(None)
        }
    }
}

fn replay_log(path: &Path) -> Result<(HashMap<String, SeenItem>, usize, usize)> {
    let mut items = HashMap::new();
    let (mut replayed, mut malformed) = (0, 0);
    if !path.exists() {
        return Ok((items, replayed, malformed));
    }

    let file =
        File::open(path).with_context(|| format!("Failed to open state log: {}", path.display()))?;
    for line in BufReader::new(file).lines() {
        let line = line.context("Failed to read state log")?;
        if line.is_empty() {
            continue;
        }
        match parse_record(&line) {
            Some((id, item)) => {
                items.insert(id, item);
                replayed += 1;
            }
            None => malformed += 1,
        }
    }
    Ok((items, replayed, malformed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ChangeId {
        s.parse().unwrap()
    }

    #[test]
    fn test_add_item_dedup() {
        let mut store = StateStore::new("unused");
        assert!(store.add_item("item1", Some("~b/o 5 chaos"), "alice"));
        assert!(!store.add_item("item1", Some("~b/o 5 chaos"), "alice"));
        assert!(store.add_item("item1", Some("~b/o 4 chaos"), "alice"));
        assert!(store.add_item("item1", Some("~b/o 4 chaos"), "bob"));
        assert!(store.add_item("item1", None, "bob"));
        assert!(!store.add_item("item1", None, "bob"));
    }

    #[test]
    fn test_record_round_trip_keeps_semicolons_in_price() {
        let item = SeenItem {
            timestamp: Utc::now(),
            price: Some("~price 1;2 exa".to_string()),
            seller: "seller_1".to_string(),
        };
        let line = format_record("abc", &item);
        let (parsed_id, parsed) = parse_record(line.trim_end()).unwrap();
        assert_eq!(parsed_id, "abc");
        assert_eq!(parsed.price, item.price);
        assert_eq!(parsed.seller, "seller_1");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::new(dir.path());
        store.load_state().unwrap();
        assert!(store.change_id().is_none());

        store.add_item("a", Some("~b/o 1 exa"), "alice");
        store.add_item("b", None, "bob");
        store.save_state(&id("1-2-3-4-5")).unwrap();
        store.close().unwrap();

        let mut reloaded = StateStore::new(dir.path());
        reloaded.load_state().unwrap();
        assert_eq!(reloaded.change_id(), Some(&id("1-2-3-4-5")));
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("b").unwrap().price, None);
        assert!(!reloaded.add_item("a", Some("~b/o 1 exa"), "alice"));
    }

    #[test]
    fn test_load_compacts_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::new(dir.path());
        store.load_state().unwrap();
        for price in ["1", "2", "3"] {
            store.add_item("same", Some(price), "alice");
            store.save_state(&id("1-1-1-1-1")).unwrap();
        }
        store.close().unwrap();

        let log = dir.path().join(LOG_FILE);
        assert_eq!(fs::read_to_string(&log).unwrap().lines().count(), 3);

        let mut reloaded = StateStore::new(dir.path());
        reloaded.load_state().unwrap();
        assert_eq!(fs::read_to_string(&log).unwrap().lines().count(), 1);
        assert_eq!(reloaded.get("same").unwrap().price.as_deref(), Some("3"));
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(LOG_FILE),
            "garbage\nok;2024-01-01T00:00:00.000000Z;;seller\n;;;\n",
        )
        .unwrap();
        fs::write(dir.path().join(CURSOR_FILE), "not-an-id").unwrap();

        let mut store = StateStore::new(dir.path());
        store.load_state().unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.change_id().is_none());
    }

    #[test]
    fn test_uncommitted_updates_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::new(dir.path());
        store.load_state().unwrap();
        store.add_item("a", Some("1"), "alice");
        store.save_state(&id("1-1-1-1-1")).unwrap();

        // crash before the second payload is committed
        store.add_item("b", Some("1"), "bob");
        drop(store);

        let mut reloaded = StateStore::new(dir.path());
        reloaded.load_state().unwrap();
        assert_eq!(reloaded.change_id(), Some(&id("1-1-1-1-1")));
        assert!(reloaded.get("b").is_none());
        assert!(reloaded.add_item("b", Some("1"), "bob"));
        assert!(!reloaded.add_item("a", Some("1"), "alice"));
    }

    #[test]
    fn test_failed_commit_keeps_items_reportable() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::new(dir.path());
        store.load_state().unwrap();

        // a non-empty directory in place of the cursor makes the rename fail
        let cursor = dir.path().join(CURSOR_FILE);
        fs::create_dir(&cursor).unwrap();
        fs::write(cursor.join("blocker"), "").unwrap();

        assert!(store.add_item("a", Some("~b/o 1 exa"), "alice"));
        assert!(store.save_state(&id("1-1-1-1-1")).is_err());
        assert!(store.get("a").is_none());
        assert!(store.change_id().is_none());

        fs::remove_dir_all(&cursor).unwrap();
        assert!(store.add_item("a", Some("~b/o 1 exa"), "alice"));
        store.save_state(&id("1-1-1-1-2")).unwrap();
        assert!(!store.add_item("a", Some("~b/o 1 exa"), "alice"));
        assert_eq!(store.change_id(), Some(&id("1-1-1-1-2")));
    }

    #[test]
    fn test_repeat_within_payload_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::new(dir.path());
        store.load_state().unwrap();

        assert!(store.add_item("a", Some("1"), "alice"));
        assert!(!store.add_item("a", Some("1"), "alice"));
        assert!(store.add_item("a", Some("2"), "alice"));
        store.save_state(&id("1-1-1-1-1")).unwrap();
        assert_eq!(store.get("a").unwrap().price.as_deref(), Some("2"));
    }
}
