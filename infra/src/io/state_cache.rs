//! Durable storage of backend state snapshots, one blob per slot.
//!
//! Layout: `<cache_dir>/<cluster>/<slot>.tfstate`. Writes go through a temp
//! file and a rename so a crash never leaves a half-written snapshot behind.
//!
//! `save_if_absent` is a plain exists-then-write. That is only safe because a
//! slot has at most one writer at a time inside one process; there is no
//! cross-process locking.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::core::slot::validate_slot;
use crate::error::InfraError;

const STATE_EXTENSION: &str = "tfstate";

/// Persistence contract for state snapshots.
pub trait StateCache: Send + Sync {
    /// Whether the slot holds a snapshot. Never fails: unreadable means absent.
    fn exists(&self, slot: &str) -> bool;

    /// The stored snapshot, or `None` if the slot is empty.
    fn load(&self, slot: &str) -> Result<Option<Vec<u8>>, InfraError>;

    /// Overwrite the slot unconditionally.
    fn save(&self, slot: &str, state: &[u8]) -> Result<(), InfraError>;

    /// Write only if the slot is empty. Returns whether a write happened.
    fn save_if_absent(&self, slot: &str, state: &[u8]) -> Result<bool, InfraError> {
        if self.exists(slot) {
            debug!(slot, "slot already cached, keeping existing snapshot");
            return Ok(false);
        }
        self.save(slot, state)?;
        Ok(true)
    }

    /// Remove the slot. Absent slots are fine.
    fn delete(&self, slot: &str) -> Result<(), InfraError>;
}

/// File-system cache scoped to one cluster.
#[derive(Debug, Clone)]
pub struct FsStateCache {
    dir: PathBuf,
}

impl FsStateCache {
    pub fn new(cache_dir: impl AsRef<Path>, cluster: &str) -> Self {
        Self {
            dir: cache_dir.as_ref().join(cluster),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn slot_path(&self, slot: &str) -> PathBuf {
        self.dir.join(format!("{slot}.{STATE_EXTENSION}"))
    }

    /// Names of all cached slots, sorted.
    pub fn slots(&self) -> Result<Vec<String>, InfraError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error("*", "list", &self.dir, err)),
        };
        let mut slots = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| io_error("*", "list", &self.dir, err))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(STATE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                slots.push(stem.to_string());
            }
        }
        slots.sort();
        Ok(slots)
    }

    /// Delete every slot of this cluster.
    pub fn clear(&self) -> Result<usize, InfraError> {
        let slots = self.slots()?;
        for slot in &slots {
            self.delete(slot)?;
        }
        Ok(slots.len())
    }

    fn checked_path(&self, slot: &str) -> Result<PathBuf, InfraError> {
        validate_slot(slot)?;
        Ok(self.slot_path(slot))
    }
}

impl StateCache for FsStateCache {
    fn exists(&self, slot: &str) -> bool {
        match self.checked_path(slot) {
            Ok(path) => path.is_file(),
            Err(err) => {
                warn!(slot, err = %err, "treating invalid slot as absent");
                false
            }
        }
    }

    fn load(&self, slot: &str) -> Result<Option<Vec<u8>>, InfraError> {
        let path = self.checked_path(slot)?;
        match fs::read(&path) {
            Ok(bytes) => {
                debug!(slot, bytes = bytes.len(), "loaded cached state");
                Ok(Some(bytes))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(slot, "load", &path, err)),
        }
    }

    fn save(&self, slot: &str, state: &[u8]) -> Result<(), InfraError> {
        let path = self.checked_path(slot)?;
        fs::create_dir_all(&self.dir).map_err(|err| io_error(slot, "save", &self.dir, err))?;
        let tmp_path = path.with_extension(format!("{STATE_EXTENSION}.tmp"));
        fs::write(&tmp_path, state).map_err(|err| io_error(slot, "save", &tmp_path, err))?;
        fs::rename(&tmp_path, &path).map_err(|err| io_error(slot, "save", &path, err))?;
        debug!(slot, bytes = state.len(), path = %path.display(), "saved state");
        Ok(())
    }

    fn delete(&self, slot: &str) -> Result<(), InfraError> {
        let path = self.checked_path(slot)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(slot, "deleted cached state");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(slot, "delete", &path, err)),
        }
    }
}

fn io_error(slot: &str, op: &'static str, path: &Path, source: std::io::Error) -> InfraError {
    InfraError::Io {
        slot: slot.to_string(),
        op,
        path: path.to_path_buf(),
        source,
    }
}
