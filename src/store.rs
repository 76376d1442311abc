//! Record persistence behind a repository seam.
//!
//! Three independent logical records (contacts, patient profile,
//! settings) are each round-tripped through a `Repository<T>`. The
//! production implementation is `JsonFileStore`: one pretty-printed JSON
//! file per record, written atomically (temp file + rename) so a crash
//! mid-write never corrupts the record. Absent records are `Ok(None)`;
//! callers fall back to defaults.

use std::fs;
use std::marker::PhantomData;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Load/save seam per record type. Loaded once at startup, written
/// through on every mutation.
pub trait Repository<T>: Send + Sync {
    /// Read the record. `None` when it has never been saved.
    fn load(&self) -> Result<Option<T>, StoreError>;

    /// Persist the record, replacing any previous version.
    fn save(&self, value: &T) -> Result<(), StoreError>;
}

/// One JSON file per record.
pub struct JsonFileStore<T> {
    path: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T> {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            _record: PhantomData,
        }
    }
}

impl<T> Repository<T> for JsonFileStore<T>
where
    T: Serialize + DeserializeOwned,
{
    fn load(&self) -> Result<Option<T>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn save(&self, value: &T) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(value)?;
        // Stage then rename: readers never observe a half-written record.
        let staged = self.path.with_extension("json.tmp");
        fs::write(&staged, json.as_bytes())?;
        fs::rename(&staged, &self.path)?;
        Ok(())
    }
}

/// Shared repositories: a cloneable handle to one underlying store.
impl<T, R> Repository<T> for std::sync::Arc<R>
where
    R: Repository<T>,
{
    fn load(&self) -> Result<Option<T>, StoreError> {
        (**self).load()
    }

    fn save(&self, value: &T) -> Result<(), StoreError> {
        (**self).save(value)
    }
}

/// In-memory repository for tests.
#[cfg(test)]
pub struct MemoryStore<T> {
    value: std::sync::Mutex<Option<T>>,
}

#[cfg(test)]
impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self {
            value: std::sync::Mutex::new(None),
        }
    }
}

#[cfg(test)]
impl<T> MemoryStore<T> {
    pub fn with(value: T) -> Self {
        Self {
            value: std::sync::Mutex::new(Some(value)),
        }
    }
}

#[cfg(test)]
impl<T: Clone + Send> Repository<T> for MemoryStore<T> {
    fn load(&self) -> Result<Option<T>, StoreError> {
        Ok(self.value.lock().unwrap().clone())
    }

    fn save(&self, value: &T) -> Result<(), StoreError> {
        *self.value.lock().unwrap() = Some(value.clone());
        Ok(())
    }
}
