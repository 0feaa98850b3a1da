//! Durable "already handled" bookkeeping.
//!
//! Every store is a small flat file that is read once on start-up and rewritten
//! whole on each change. Writes land in a sibling temporary file that is then
//! renamed over the original, so a crash mid-write leaves the previous contents
//! intact. A store has exactly one writer; sharing a file between processes is
//! not supported.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context as _, Result};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info, warn};

/// File name of the processed report id set.
pub const PROCESSED_REPORTS: &str = "processed_reports.json";
/// File name of the notified report id set.
pub const NOTIFIED_REPORTS: &str = "notified_reports.json";
/// File name of the poll cursor.
pub const CURSOR: &str = "cursor.txt";

/// Replace `path` with `contents`.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))
}

/// A persisted set of identifiers.
#[derive(Debug)]
pub struct PersistedSet<T> {
    path: PathBuf,
    items: BTreeSet<T>,
}

impl<T> PersistedSet<T>
where
    T: Ord + Serialize + DeserializeOwned,
{
    /// Open the set stored at `path`. A missing or unreadable file yields an
    /// empty set.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let items = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<T>>(&bytes) {
                Ok(items) => items.into_iter().collect(),
                Err(e) => {
                    warn!("ignoring corrupt store {}: {e}", path.display());
                    BTreeSet::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no store at {}, starting empty", path.display());
                BTreeSet::new()
            }
            Err(e) => {
                warn!("failed to read store {}: {e}", path.display());
                BTreeSet::new()
            }
        };

        debug!("loaded {} entries from {}", items.len(), path.display());
        Self { path, items }
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items.contains(item)
    }

    /// Insert `item` and persist the whole set. Returns whether the item was new.
    ///
    /// The in-memory set keeps the item even if persisting fails.
    pub fn add(&mut self, item: T) -> Result<bool> {
        if !self.items.insert(item) {
            return Ok(false);
        }

        let contents = serde_json::to_vec(&self.items).context("failed to encode store")?;
        write_atomic(&self.path, &contents)?;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// The persisted id of the newest report event already handled.
#[derive(Debug)]
pub struct CursorStore {
    path: PathBuf,
    cursor: Option<i64>,
}

impl CursorStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cursor = match fs::read_to_string(&path) {
            Ok(s) => match s.trim().parse::<i64>() {
                Ok(cursor) => {
                    info!("loaded cursor {cursor}");
                    Some(cursor)
                }
                Err(e) => {
                    warn!("ignoring corrupt cursor {}: {e}", path.display());
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no cursor file found, starting fresh");
                None
            }
            Err(e) => {
                warn!("failed to read cursor {}: {e}", path.display());
                None
            }
        };

        Self { path, cursor }
    }

    pub const fn get(&self) -> Option<i64> {
        self.cursor
    }

    /// Set and persist the cursor.
    pub fn set(&mut self, cursor: i64) -> Result<()> {
        self.cursor = Some(cursor);
        write_atomic(&self.path, cursor.to_string().as_bytes())
    }
}
