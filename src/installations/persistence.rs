use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};

use crate::installations::constants::INSTALLATIONS_CACHE_DIR_ENV;
use crate::installations::error::{internal_error, InstallationsResult};
use crate::installations::types::InstallationEntry;

/// Storage for installation entries, keyed by app name.
pub trait InstallationsPersistence: Send + Sync {
    fn read(&self, app_name: &str) -> InstallationsResult<Option<InstallationEntry>>;
    fn write(&self, app_name: &str, entry: &InstallationEntry) -> InstallationsResult<()>;
    fn clear(&self, app_name: &str) -> InstallationsResult<()>;
}

/// Stores each entry as a JSON file named after the percent-encoded app name.
#[derive(Clone, Debug)]
pub struct FilePersistence {
    base_dir: Arc<PathBuf>,
}

impl FilePersistence {
    pub fn new(base_dir: PathBuf) -> InstallationsResult<Self> {
        fs::create_dir_all(&base_dir).map_err(|err| {
            internal_error(format!(
                "Failed to create installations cache directory '{}': {}",
                base_dir.display(),
                err
            ))
        })?;
        Ok(Self {
            base_dir: Arc::new(base_dir),
        })
    }

    /// Uses `FIREBASE_INSTALLATIONS_CACHE_DIR` when set, otherwise
    /// `.firebase/installations` below the working directory.
    pub fn from_env() -> InstallationsResult<Self> {
        if let Ok(dir) = std::env::var(INSTALLATIONS_CACHE_DIR_ENV) {
            return Self::new(PathBuf::from(dir));
        }

        let dir = std::env::current_dir()
            .map_err(|err| internal_error(format!("Failed to obtain working directory: {}", err)))?
            .join(".firebase/installations");
        Self::new(dir)
    }

    fn file_for(&self, app_name: &str) -> PathBuf {
        let encoded = percent_encode(app_name.as_bytes(), NON_ALPHANUMERIC).to_string();
        self.base_dir.join(format!("{}.json", encoded))
    }
}

impl InstallationsPersistence for FilePersistence {
    fn read(&self, app_name: &str) -> InstallationsResult<Option<InstallationEntry>> {
        let path = self.file_for(app_name);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|err| {
            internal_error(format!(
                "Failed to read installations cache '{}': {}",
                path.display(),
                err
            ))
        })?;
        let entry = serde_json::from_slice(&bytes).map_err(|err| {
            internal_error(format!(
                "Failed to parse installations cache '{}': {}",
                path.display(),
                err
            ))
        })?;
        Ok(Some(entry))
    }

    fn write(&self, app_name: &str, entry: &InstallationEntry) -> InstallationsResult<()> {
        let path = self.file_for(app_name);
        let bytes = serde_json::to_vec(entry).map_err(|err| {
            internal_error(format!(
                "Failed to serialize installations cache '{}': {}",
                path.display(),
                err
            ))
        })?;
        fs::write(&path, bytes).map_err(|err| {
            internal_error(format!(
                "Failed to write installations cache '{}': {}",
                path.display(),
                err
            ))
        })
    }

    fn clear(&self, app_name: &str) -> InstallationsResult<()> {
        let path = self.file_for(app_name);
        if path.exists() {
            fs::remove_file(&path).map_err(|err| {
                internal_error(format!(
                    "Failed to delete installations cache '{}': {}",
                    path.display(),
                    err
                ))
            })?;
        }
        Ok(())
    }
}

/// Keeps entries in process memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryPersistence {
    entries: Arc<Mutex<HashMap<String, InstallationEntry>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InstallationsPersistence for MemoryPersistence {
    fn read(&self, app_name: &str) -> InstallationsResult<Option<InstallationEntry>> {
        Ok(self.entries.lock().unwrap().get(app_name).cloned())
    }

    fn write(&self, app_name: &str, entry: &InstallationEntry) -> InstallationsResult<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(app_name.to_string(), entry.clone());
        Ok(())
    }

    fn clear(&self, app_name: &str) -> InstallationsResult<()> {
        self.entries.lock().unwrap().remove(app_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installations::types::AuthToken;

    fn temp_dir() -> PathBuf {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let mut path = std::env::temp_dir();
        path.push(format!(
            "installations-persistence-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        path
    }

    fn registered() -> InstallationEntry {
        InstallationEntry::Registered {
            fid: "fid".into(),
            refresh_token: "refresh".into(),
            auth_token: AuthToken::Completed {
                token: "token".into(),
                expires_in: 60_000,
                creation_time: 1_000,
            },
        }
    }

    #[test]
    fn file_persistence_round_trip() {
        let dir = temp_dir();
        let persistence = FilePersistence::new(dir.clone()).unwrap();
        let entry = registered();

        persistence.write("[DEFAULT]/app", &entry).unwrap();
        assert!(dir.join("%5BDEFAULT%5D%2Fapp.json").exists());
        let loaded = persistence.read("[DEFAULT]/app").unwrap().unwrap();
        assert_eq!(loaded, entry);

        persistence.clear("[DEFAULT]/app").unwrap();
        assert!(persistence.read("[DEFAULT]/app").unwrap().is_none());
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn memory_persistence_is_shared_between_clones() {
        let persistence = MemoryPersistence::new();
        let other = persistence.clone();
        persistence.write("app", &registered()).unwrap();
        assert_eq!(other.read("app").unwrap(), Some(registered()));
        other.clear("app").unwrap();
        assert!(persistence.read("app").unwrap().is_none());
    }
}
