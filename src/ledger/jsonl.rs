//! JSONL ledger with an in-memory cache.
//!
//! The cache remembers how far into the file it has read. Reads and appends
//! first pick up any lines another handle or process appended since, so the
//! occurrence-key check sees the whole file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use log::{info, warn};

use super::{LedgerEntry, LedgerSink, NewLedgerEntry};
use crate::error::{Result, SchedulerError};

#[derive(Debug, Default)]
struct Loaded {
    entries: Vec<LedgerEntry>,
    /// Byte offset just past the last complete line read
    offset: u64,
}

/// Append-only ledger file, one JSON entry per line.
pub struct JsonlLedger {
    path: PathBuf,
    cache: RwLock<Loaded>,
}

impl std::fmt::Debug for JsonlLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlLedger").field("path", &self.path).finish_non_exhaustive()
    }
}

impl JsonlLedger {
    /// Open a ledger file, creating its parent directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            cache: RwLock::new(Loaded::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All recorded entries, in append order.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let loaded = self.synced()?;
        Ok(loaded.entries.clone())
    }

    /// Lock the cache and bring it up to date with the file.
    fn synced(&self) -> Result<RwLockWriteGuard<'_, Loaded>> {
        let mut loaded = self.cache.write().map_err(|e| SchedulerError::Persistence(e.to_string()))?;
        self.read_tail(&mut loaded)?;
        Ok(loaded)
    }

    fn read_tail(&self, loaded: &mut Loaded) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }

        let mut file = File::open(&self.path)?;
        if file.metadata()?.len() < loaded.offset {
            warn!("Ledger {} shrank, reloading", self.path.display());
            *loaded = Loaded::default();
        }
        file.seek(SeekFrom::Start(loaded.offset))?;

        let mut reader = BufReader::new(file);
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            // A line without its newline is still being written
            if read == 0 || !line.ends_with('\n') {
                break;
            }
            if !line.trim().is_empty() {
                loaded.entries.push(serde_json::from_str(line.trim())?);
            }
            loaded.offset += read as u64;
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerSink for JsonlLedger {
    async fn append(&self, entry: NewLedgerEntry) -> Result<LedgerEntry> {
        let mut loaded = self.synced()?;

        if let Some(existing) = loaded.entries.iter().find(|e| e.occurrence_key == entry.occurrence_key) {
            info!(
                "Occurrence {} of rule {} already recorded as {}",
                entry.occurrence_key, entry.rule_id, existing.id
            );
            return Ok(existing.clone());
        }

        let recorded = entry.into_entry();

        // File first (source of truth); the cache picks the line up from the tail
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&recorded)?)?;
        self.read_tail(&mut loaded)?;

        Ok(recorded)
    }
}
