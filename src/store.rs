//! Reading store: the persistence write path and its post-write hooks.

use crate::error::{FeedError, Result};
use crate::readings::{ReadingIndex, ReadingLog};
use crate::types::{ChangeEvent, ChangeOperation, Reading, ReadingId, ReadingInput, StoreStats};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Sync the log every N writes.
    pub sync_interval: u64,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./readings"),
            sync_interval: 1,
            create_if_missing: true,
        }
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"RFD\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Called synchronously after every durable write, in write order.
pub trait WriteHook: Send + Sync {
    fn after_write(&self, event: &ChangeEvent);
}

/// The reading store.
pub struct Store {
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    log: ReadingLog,

    index: ReadingIndex,

    hooks: RwLock<Vec<Arc<dyn WriteHook>>>,

    /// Serializes writes so hooks observe them in log order.
    write_lock: Mutex<()>,
}

impl Store {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create_new(config)
        } else {
            Err(FeedError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create_new(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;

        let lock_file = Self::acquire_lock(&config.path)?;
        let log = ReadingLog::open_with_sync_interval(
            config.path.join("readings.log"),
            config.sync_interval,
        )?;

        tracing::info!(path = %config.path.display(), "created reading store");

        Ok(Self {
            config,
            _lock_file: lock_file,
            log,
            index: ReadingIndex::new(),
            hooks: RwLock::new(Vec::new()),
            write_lock: Mutex::new(()),
        })
    }

    /// Open an existing store and rebuild its index from the log.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;

        let lock_file = Self::acquire_lock(&config.path)?;
        let log = ReadingLog::open_with_sync_interval(
            config.path.join("readings.log"),
            config.sync_interval,
        )?;

        let index = ReadingIndex::new();
        for result in log.iter_from(0) {
            let (offset, entry) = result?;
            if let Some(id) = entry.reading.id {
                index.apply(entry.operation, id, offset);
            }
        }

        tracing::info!(
            path = %config.path.display(),
            readings = index.count(),
            "opened reading store"
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            log,
            index,
            hooks: RwLock::new(Vec::new()),
            write_lock: Mutex::new(()),
        })
    }

    /// Register a hook run after each write.
    pub fn add_hook(&self, hook: Arc<dyn WriteHook>) {
        self.hooks.write().push(hook);
    }

    // --- Writes ---

    /// Write a new reading.
    pub fn create(&self, input: ReadingInput) -> Result<Reading> {
        input.validate()?;
        let _lock = self.write_lock.lock();

        let (reading, offset) = self.log.append_new(input)?;
        if let Some(id) = reading.id {
            self.index.apply(ChangeOperation::Created, id, offset);
        }

        self.run_hooks(&ChangeEvent::created(reading.clone()));
        Ok(reading)
    }

    /// Overwrite an existing reading. Unset input fields keep their value.
    pub fn update(&self, id: ReadingId, input: ReadingInput) -> Result<Reading> {
        input.validate()?;
        let _lock = self.write_lock.lock();

        let existing = self.get(id)?.ok_or(FeedError::ReadingNotFound(id))?;
        let reading = Reading {
            id: Some(id),
            timestamp: input.timestamp.unwrap_or(existing.timestamp),
            value: input.value,
            unit: input.unit.unwrap_or(existing.unit),
        };

        let offset = self.log.append_change(ChangeOperation::Updated, &reading)?;
        self.index.apply(ChangeOperation::Updated, id, offset);

        self.run_hooks(&ChangeEvent::updated(reading.clone()));
        Ok(reading)
    }

    /// Delete a reading, returning its last state.
    pub fn delete(&self, id: ReadingId) -> Result<Reading> {
        let _lock = self.write_lock.lock();

        let existing = self.get(id)?.ok_or(FeedError::ReadingNotFound(id))?;
        let offset = self.log.append_change(ChangeOperation::Deleted, &existing)?;
        self.index.apply(ChangeOperation::Deleted, id, offset);

        self.run_hooks(&ChangeEvent::deleted(existing.clone()));
        Ok(existing)
    }

    fn run_hooks(&self, event: &ChangeEvent) {
        let hooks = self.hooks.read().clone();
        for hook in hooks {
            hook.after_write(event);
        }
    }

    // --- Reads ---

    /// Get a reading by id.
    pub fn get(&self, id: ReadingId) -> Result<Option<Reading>> {
        match self.index.get_offset(id) {
            Some(offset) => Ok(Some(self.log.read_at(offset)?.reading)),
            None => Ok(None),
        }
    }

    /// The most recently created reading.
    pub fn latest(&self) -> Result<Option<Reading>> {
        match self.index.latest() {
            Some((_, offset)) => Ok(Some(self.log.read_at(offset)?.reading)),
            None => Ok(None),
        }
    }

    /// Every live reading, oldest first.
    pub fn list(&self) -> Result<Vec<Reading>> {
        self.index
            .entries()
            .into_iter()
            .map(|(_, offset)| self.log.read_at(offset).map(|entry| entry.reading))
            .collect()
    }

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            reading_count: self.index.count() as u64,
            log_size: self.log.size(),
            latest: self.index.latest().map(|(id, _)| id),
        }
    }

    /// Sync all data to disk.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        if !manifest_path.exists() {
            return Err(FeedError::NotInitialized);
        }
        let mut file = File::open(manifest_path)?;

        let mut header = [0u8; 5];
        file.read_exact(&mut header)?;
        if &header[0..4] != STORE_MAGIC {
            return Err(FeedError::InvalidFormat("Invalid store magic".into()));
        }
        if header[4] != STORE_VERSION {
            return Err(FeedError::InvalidFormat(format!(
                "Unsupported store version: {}",
                header[4]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| FeedError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}
