//! Flat file implementation of the StorageBackend trait
//!
//! All profiles live in one JSON document keyed by user id:
//!
//! ```json
//! { "users": { "<id>": { "displayName": "...", "currentAddress": "...",
//!   "currentLocation": "...", "currentISP": "...", "lastSeen": "...",
//!   "history": [ { "address": "...", "firstSeen": "...", "lastSeen": "...",
//!   "location": "...", "isp": "..." } ] } } }
//! ```
//!
//! The document is read once at initialization and rewritten in full on
//! every save, under a single lock.

use super::{StorageBackend, StorageError};
use crate::models::{AddressRecord, UserProfile};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    users: BTreeMap<String, StoredProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredProfile {
    display_name: String,
    current_address: Option<String>,
    current_location: Option<String>,
    #[serde(rename = "currentISP")]
    current_isp: Option<String>,
    last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    history: Vec<AddressRecord>,
}

impl StoredProfile {
    fn from_profile(profile: &UserProfile) -> Self {
        StoredProfile {
            display_name: profile.display_name.clone(),
            current_address: profile.current_address.clone(),
            current_location: profile.current_location.clone(),
            current_isp: profile.current_isp.clone(),
            last_seen: profile.last_seen,
            history: profile.history.clone(),
        }
    }

    fn to_profile(&self, id: &str) -> UserProfile {
        let mut profile = UserProfile {
            id: id.to_string(),
            display_name: self.display_name.clone(),
            current_address: self.current_address.clone(),
            current_location: self.current_location.clone(),
            current_isp: self.current_isp.clone(),
            last_seen: self.last_seen,
            history: self.history.clone(),
        };
        profile.sort_history();
        profile
    }
}

/// JSON document storage
pub struct FileBackend {
    path: PathBuf,
    max_history_size: usize,
    /// `None` until initialized and after shutdown
    document: Mutex<Option<Document>>,
}

impl FileBackend {
    /// Create a backend for the document at `path`
    ///
    /// Nothing touches the disk until [`StorageBackend::initialize`].
    pub fn new<P: AsRef<Path>>(path: P, max_history_size: usize) -> Self {
        FileBackend {
            path: path.as_ref().to_path_buf(),
            max_history_size,
            document: Mutex::new(None),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Document>>, StorageError> {
        self.document
            .lock()
            .map_err(|_| StorageError::Unavailable("file store lock poisoned".to_string()))
    }

    fn read_document(path: &Path) -> Result<Document, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Unavailable(format!(
                        "cannot create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        if !path.exists() {
            let document = Document::default();
            Self::write_document(path, &document).map_err(|e| {
                StorageError::Unavailable(format!("cannot create {}: {}", path.display(), e))
            })?;
            return Ok(document);
        }

        let contents = fs::read_to_string(path).map_err(|e| {
            StorageError::Unavailable(format!("cannot read {}: {}", path.display(), e))
        })?;
        if contents.trim().is_empty() {
            return Ok(Document::default());
        }

        serde_json::from_str(&contents).map_err(|e| {
            StorageError::Unavailable(format!("cannot parse {}: {}", path.display(), e))
        })
    }

    /// Write the document next to its final location, then move it in place
    fn write_document(path: &Path, document: &Document) -> Result<(), StorageError> {
        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);

        let contents = serde_json::to_vec_pretty(document)?;
        let mut file = File::create(&tmp_path)?;
        file.write_all(&contents)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn initialize(&self) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        if guard.is_some() {
            return Ok(());
        }

        let document = Self::read_document(&self.path)?;
        log::info!(
            "File storage initialized at {} ({} profiles)",
            self.path.display(),
            document.users.len()
        );
        *guard = Some(document);
        Ok(())
    }

    fn shutdown(&self) {
        let mut guard = match self.document.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.take().is_some() {
            log::info!("File storage at {} closed", self.path.display());
        }
    }

    fn save(&self, profile: &UserProfile) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        let document = guard.as_mut().ok_or(StorageError::NotInitialized)?;

        let mut ordered = profile.clone();
        ordered.sort_history();
        ordered.enforce_cap(self.max_history_size);

        let previous = document
            .users
            .insert(profile.id.clone(), StoredProfile::from_profile(&ordered));

        if let Err(e) = Self::write_document(&self.path, document) {
            // Keep memory in step with what is on disk
            match previous {
                Some(stored) => document.users.insert(profile.id.clone(), stored),
                None => document.users.remove(&profile.id),
            };
            log::error!("Failed to save profile {}: {}", profile.id, e);
            return Err(e);
        }
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<UserProfile>, StorageError> {
        let guard = self.lock()?;
        let document = guard.as_ref().ok_or(StorageError::NotInitialized)?;
        Ok(document.users.get(id).map(|stored| stored.to_profile(id)))
    }

    fn find_by_name(&self, name: &str) -> Result<Option<UserProfile>, StorageError> {
        let guard = self.lock()?;
        let document = guard.as_ref().ok_or(StorageError::NotInitialized)?;

        let found = document
            .users
            .iter()
            .filter(|(_, stored)| stored.display_name.eq_ignore_ascii_case(name))
            // Latest sighting wins; equal sightings fall back to the smallest id
            .max_by(|(id_a, a), (id_b, b)| {
                a.last_seen.cmp(&b.last_seen).then_with(|| id_b.cmp(id_a))
            });

        Ok(found.map(|(id, stored)| stored.to_profile(id)))
    }

    fn last_record(&self, id: &str) -> Result<Option<AddressRecord>, StorageError> {
        Ok(self
            .load(id)?
            .and_then(|profile| profile.last_record().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn create_test_store(max: usize) -> (TempDir, FileBackend) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = FileBackend::new(dir.path().join("data").join("iplog.json"), max);
        store.initialize().expect("Failed to initialize file store");
        (dir, store)
    }

    fn profile_with(id: &str, name: &str, addresses: &[(&str, i64)]) -> UserProfile {
        let mut profile = UserProfile::new(id, name);
        for (address, secs) in addresses {
            profile.history.push(AddressRecord::new(*address, at(*secs)));
        }
        profile.sort_history();
        if let Some(head) = profile.history.first() {
            profile.current_address = Some(head.address.clone());
            profile.last_seen = Some(head.last_seen);
        }
        profile
    }

    #[test]
    fn test_profile_roundtrip() {
        let (_dir, store) = create_test_store(10);
        let mut profile = profile_with("u1", "Alice", &[("1.2.3.4", 10), ("5.6.7.8", 20)]);
        profile.history[0].location = Some("X".to_string());
        profile.history[0].isp = Some("Y".to_string());
        profile.current_location = Some("X".to_string());

        assert!(store.load("u1").unwrap().is_none());
        store.save(&profile).unwrap();

        assert_eq!(store.load("u1").unwrap(), Some(profile));
    }

    #[test]
    fn test_persists_across_reopen() {
        let (dir, store) = create_test_store(10);
        let profile = profile_with("u1", "Alice", &[("1.2.3.4", 10)]);
        store.save(&profile).unwrap();
        store.shutdown();

        let reopened = FileBackend::new(dir.path().join("data").join("iplog.json"), 10);
        reopened.initialize().unwrap();
        assert_eq!(reopened.load("u1").unwrap(), Some(profile));
    }

    #[test]
    fn test_document_layout() {
        let (dir, store) = create_test_store(10);
        store
            .save(&profile_with("u1", "Alice", &[("1.2.3.4", 10)]))
            .unwrap();

        let raw = fs::read_to_string(dir.path().join("data").join("iplog.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let user = &value["users"]["u1"];
        assert_eq!(user["displayName"], "Alice");
        assert_eq!(user["currentAddress"], "1.2.3.4");
        assert_eq!(user["history"][0]["address"], "1.2.3.4");
    }

    #[test]
    fn test_save_replaces_history() {
        let (dir, store) = create_test_store(10);
        store.save(&profile_with("u1", "Alice", &[("b", 5)])).unwrap();

        let replacement = profile_with("u1", "Alice", &[("c", 4)]);
        store.save(&replacement).unwrap();

        assert_eq!(store.load("u1").unwrap(), Some(replacement));
        assert!(store.is_recorded("u1", "c").unwrap());
        // No temp file is left behind
        assert!(!dir.path().join("data").join("iplog.json.tmp").exists());
    }

    #[test]
    fn test_save_enforces_cap() {
        let (_dir, store) = create_test_store(2);
        let profile = profile_with("u1", "Alice", &[("a", 1), ("b", 2), ("c", 3)]);
        store.save(&profile).unwrap();

        let loaded = store.load("u1").unwrap().unwrap();
        let addresses: Vec<&str> = loaded.history.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addresses, vec!["c", "b"]);
    }

    #[test]
    fn test_find_by_name_ignores_case() {
        let (_dir, store) = create_test_store(10);
        store
            .save(&profile_with("u1", "Alice", &[("1.2.3.4", 10)]))
            .unwrap();

        let found = store.find_by_name("aLiCe").unwrap().unwrap();
        assert_eq!(found.id, "u1");
        assert!(store.find_by_name("bob").unwrap().is_none());
    }

    #[test]
    fn test_find_by_name_prefers_latest_sighting() {
        let (_dir, store) = create_test_store(10);
        store
            .save(&profile_with("u1", "Alice", &[("1.1.1.1", 10)]))
            .unwrap();
        store
            .save(&profile_with("u2", "alice", &[("2.2.2.2", 50)]))
            .unwrap();

        assert_eq!(store.find_by_name("ALICE").unwrap().unwrap().id, "u2");
    }

    #[test]
    fn test_last_record_and_is_recorded() {
        let (_dir, store) = create_test_store(10);
        store
            .save(&profile_with("u1", "Alice", &[("1.1.1.1", 10), ("2.2.2.2", 20)]))
            .unwrap();

        assert_eq!(store.last_record("u1").unwrap().unwrap().address, "2.2.2.2");
        assert!(store.is_recorded("u1", "2.2.2.2").unwrap());
        // Present, but not the newest
        assert!(!store.is_recorded("u1", "1.1.1.1").unwrap());
        assert!(!store.is_recorded("nobody", "2.2.2.2").unwrap());
        assert!(store.last_record("nobody").unwrap().is_none());
    }

    #[test]
    fn test_empty_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iplog.json");
        fs::write(&path, "").unwrap();

        let store = FileBackend::new(&path, 10);
        store.initialize().unwrap();
        assert!(store.load("u1").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iplog.json");
        fs::write(&path, "{ not json").unwrap();

        let store = FileBackend::new(&path, 10);
        assert!(matches!(store.initialize(), Err(StorageError::Unavailable(_))));
        store.shutdown();
    }

    #[test]
    fn test_not_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBackend::new(dir.path().join("iplog.json"), 10);
        assert!(matches!(store.load("u1"), Err(StorageError::NotInitialized)));

        store.initialize().unwrap();
        store.shutdown();
        store.shutdown();
        assert!(matches!(
            store.save(&UserProfile::new("u1", "Alice")),
            Err(StorageError::NotInitialized)
        ));
    }

    #[test]
    fn test_concurrent_saves_of_different_users() {
        let (_dir, store) = create_test_store(10);
        let store = std::sync::Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let id = format!("user{}", i);
                    let profile = profile_with(&id, &id, &[("10.0.0.1", i)]);
                    store.save(&profile).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for i in 0..8 {
            assert!(store.load(&format!("user{}", i)).unwrap().is_some());
        }
    }
}
