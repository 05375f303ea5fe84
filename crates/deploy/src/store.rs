//! Durable rollup records, one JSON document per rollup.

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use anyhow::Context;
use fs2::FileExt;

use crate::{Rollup, RollupError, RollupResult, validate_name};

/// Store-wide lock serializing record creation.
const CHAIN_IDS_LOCK: &str = ".chain-ids.lock";

/// File-backed store of [`Rollup`] records keyed by name.
///
/// Writes go through a temp file that is synced and renamed into place, so a crash never
/// leaves a half-written record behind. Every mutation holds an exclusive advisory lock on
/// `.<name>.lock` for its read-check-write sequence. Creation additionally holds the
/// store-wide `.chain-ids.lock`, which keeps chain ids unique across records.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

/// Holds an advisory lock until dropped.
struct RecordLock {
    file: File,
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, "Failed to release record lock");
        }
    }
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> RollupResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .context(format!("Failed to create store directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }

    fn check_name(name: &str) -> RollupResult<()> {
        validate_name(name).map_err(|e| RollupError::InvalidRequest(e.to_string()))
    }

    fn lock(&self, name: &str) -> RollupResult<RecordLock> {
        self.lock_file(&self.root.join(format!(".{name}.lock")))
    }

    fn lock_file(&self, path: &Path) -> RollupResult<RecordLock> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .context(format!("Failed to open lock file {}", path.display()))?;
        FileExt::lock_exclusive(&file)
            .context(format!("Failed to lock {}", path.display()))?;
        Ok(RecordLock { file })
    }

    fn read(&self, name: &str) -> RollupResult<Option<Rollup>> {
        let path = self.record_path(name);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to read {}", path.display()))
                    .into());
            }
        };
        let rollup = serde_json::from_str(&content)
            .context(format!("Failed to parse rollup record {}", path.display()))?;
        Ok(Some(rollup))
    }

    fn write(&self, rollup: &Rollup) -> RollupResult<()> {
        let path = self.record_path(&rollup.name);
        let tmp = self.root.join(format!(".{}.json.tmp", rollup.name));
        let content =
            serde_json::to_vec_pretty(rollup).context("Failed to serialize rollup record")?;

        let write_tmp = || -> anyhow::Result<()> {
            use std::io::Write;
            let mut file = File::create(&tmp)
                .context(format!("Failed to create {}", tmp.display()))?;
            file.write_all(&content)
                .context(format!("Failed to write {}", tmp.display()))?;
            file.sync_all()
                .context(format!("Failed to sync {}", tmp.display()))?;
            std::fs::rename(&tmp, &path)
                .context(format!("Failed to move record into {}", path.display()))?;
            // Persist the rename itself.
            File::open(&self.root)
                .and_then(|dir| dir.sync_all())
                .context(format!("Failed to sync {}", self.root.display()))?;
            Ok(())
        };
        write_tmp()?;
        Ok(())
    }

    /// Insert a new record.
    ///
    /// Fails with [`RollupError::AlreadyExists`] if the name is taken and with
    /// [`RollupError::InvalidRequest`] if another record already uses its chain id.
    pub fn create(&self, rollup: &Rollup) -> RollupResult<()> {
        self.create_unique(|_| Ok(rollup.clone())).map(|_| ())
    }

    /// Build and insert a record while holding the store-wide creation lock.
    ///
    /// `make` receives the `(name, chain id)` pairs of every stored record, so a chain id
    /// chosen from it cannot be claimed by a concurrent creation before the write.
    pub fn create_unique<F>(&self, make: F) -> RollupResult<Rollup>
    where
        F: FnOnce(&[(String, u64)]) -> RollupResult<Rollup>,
    {
        let _catalog = self.lock_file(&self.root.join(CHAIN_IDS_LOCK))?;
        let taken = self.chain_ids()?;
        let rollup = make(&taken)?;

        Self::check_name(&rollup.name)?;
        let _lock = self.lock(&rollup.name)?;
        if self.read(&rollup.name)?.is_some() {
            return Err(RollupError::AlreadyExists(rollup.name.clone()));
        }
        if let Some((owner, _)) = taken
            .iter()
            .find(|(name, id)| *id == rollup.chain_id && *name != rollup.name)
        {
            return Err(RollupError::InvalidRequest(format!(
                "chain id {} is already used by rollup {owner}",
                rollup.chain_id
            )));
        }

        self.write(&rollup)?;
        tracing::debug!(rollup = %rollup.name, chain_id = rollup.chain_id, step = %rollup.step, "Rollup record created");
        Ok(rollup)
    }

    pub fn get(&self, name: &str) -> RollupResult<Rollup> {
        Self::check_name(name)?;
        self.read(name)?
            .ok_or_else(|| RollupError::NotFound(format!("rollup {name}")))
    }

    /// Overwrite the whole record.
    ///
    /// `rollup.revision` must equal the stored revision; on success it is incremented in
    /// place so the caller can keep writing the same value.
    pub fn update(&self, rollup: &mut Rollup) -> RollupResult<()> {
        Self::check_name(&rollup.name)?;
        let _lock = self.lock(&rollup.name)?;
        let stored = self
            .read(&rollup.name)?
            .ok_or_else(|| RollupError::MissingForWrite(rollup.name.clone()))?;

        if stored.revision != rollup.revision {
            return Err(RollupError::Conflict {
                name: rollup.name.clone(),
                expected: rollup.revision,
                found: stored.revision,
            });
        }
        stored
            .verify_transition(rollup)
            .map_err(|reason| RollupError::InvariantViolation {
                name: rollup.name.clone(),
                reason,
            })?;

        let mut next = rollup.clone();
        next.revision = stored.revision + 1;
        self.write(&next)?;
        rollup.revision = next.revision;

        tracing::debug!(
            rollup = %rollup.name,
            step = %rollup.step,
            revision = rollup.revision,
            "Rollup record updated"
        );
        Ok(())
    }

    pub fn delete(&self, name: &str) -> RollupResult<()> {
        Self::check_name(name)?;
        let _lock = self.lock(name)?;
        let path = self.record_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RollupError::MissingForWrite(name.to_string()));
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to remove {}", path.display()))
                    .into());
            }
        }
        // The lock file is left in place; removing it would race with a waiting locker.
        tracing::debug!(rollup = %name, "Rollup record deleted");
        Ok(())
    }

    /// All records, sorted by name. Unreadable documents are logged and skipped.
    pub fn list(&self) -> RollupResult<Vec<Rollup>> {
        let entries = std::fs::read_dir(&self.root)
            .context(format!("Failed to list {}", self.root.display()))?;

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let file_name = entry.file_name().into_string().ok()?;
                let name = file_name.strip_suffix(".json")?;
                (!name.starts_with('.')).then(|| name.to_string())
            })
            .collect();
        names.sort();

        let mut rollups = Vec::with_capacity(names.len());
        for name in names {
            match self.read(&name) {
                Ok(Some(rollup)) => rollups.push(rollup),
                Ok(None) => {}
                Err(e) => tracing::warn!(rollup = %name, error = %e, "Skipping unreadable record"),
            }
        }
        Ok(rollups)
    }

    /// Chain ids of every stored record.
    pub fn chain_ids(&self) -> RollupResult<Vec<(String, u64)>> {
        Ok(self
            .list()?
            .into_iter()
            .map(|rollup| (rollup.name, rollup.chain_id))
            .collect())
    }
}
