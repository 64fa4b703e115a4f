//! Reference database: enrolled name → embedding, persisted as one JSON file.
//!
//! The whole mapping is rewritten on every enrollment (temp file + rename).
//! Enrollment photos are archived next to it as `<refs_dir>/<name>.jpg`.

use chrono::{DateTime, Utc};
use faceunlock_core::{Embedding, Reference};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DB_FORMAT_VERSION: u32 = 1;
const MAX_NAME_CHARS: usize = 64;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed reference database {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported reference database version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid name: {0:?}")]
    InvalidName(String),
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One enrolled identity as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEntry {
    pub embedding: Vec<f32>,
    pub model_version: Option<String>,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct DbFile {
    version: u32,
    entries: BTreeMap<String, StoredEntry>,
}

/// In-memory copy of the reference database plus where it lives on disk.
pub struct RefStore {
    db_path: PathBuf,
    refs_dir: PathBuf,
    entries: BTreeMap<String, StoredEntry>,
}

impl RefStore {
    /// Load the database, starting empty if the file does not exist yet.
    pub fn open(db_path: impl Into<PathBuf>, refs_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let db_path = db_path.into();
        let refs_dir = refs_dir.into();

        let entries = match std::fs::read(&db_path) {
            Ok(bytes) => {
                let file: DbFile =
                    serde_json::from_slice(&bytes).map_err(|source| StoreError::Malformed {
                        path: db_path.clone(),
                        source,
                    })?;
                if file.version != DB_FORMAT_VERSION {
                    return Err(StoreError::UnsupportedVersion(file.version));
                }
                file.entries
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %db_path.display(), "no reference database yet, starting empty");
                BTreeMap::new()
            }
            Err(source) => return Err(StoreError::Io { path: db_path, source }),
        };

        tracing::info!(path = %db_path.display(), enrolled = entries.len(), "reference database loaded");

        Ok(Self {
            db_path,
            refs_dir,
            entries,
        })
    }

    /// Snapshot of all enrolled references, ordered by name.
    pub fn gallery(&self) -> Vec<Reference> {
        self.entries
            .iter()
            .map(|(name, entry)| Reference {
                name: name.clone(),
                embedding: Embedding {
                    values: entry.embedding.clone(),
                    model_version: entry.model_version.clone(),
                },
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Enroll (or re-enroll) `name`: stage the photo, persist the mapping,
    /// then move the photo into place.
    ///
    /// Returns the validated name. On any failure the previous entry and
    /// photo for `name` are left as they were.
    pub fn enroll(
        &mut self,
        name: &str,
        embedding: &Embedding,
        jpeg: &[u8],
    ) -> Result<String, StoreError> {
        let name = validate_name(name)?.to_string();

        std::fs::create_dir_all(&self.refs_dir).map_err(|source| StoreError::Io {
            path: self.refs_dir.clone(),
            source,
        })?;
        let photo_path = self.photo_path(&name);
        let staged_photo = tmp_path(&photo_path);
        std::fs::write(&staged_photo, jpeg).map_err(|source| StoreError::Io {
            path: staged_photo.clone(),
            source,
        })?;

        let entry = StoredEntry {
            embedding: embedding.values.clone(),
            model_version: embedding.model_version.clone(),
            enrolled_at: Utc::now(),
        };
        let previous = self.entries.insert(name.clone(), entry);

        let committed = self.persist().and_then(|()| {
            std::fs::rename(&staged_photo, &photo_path).map_err(|source| StoreError::Io {
                path: photo_path.clone(),
                source,
            })
        });

        if let Err(e) = committed {
            let replaced = previous.is_some();
            match previous {
                Some(old) => self.entries.insert(name.clone(), old),
                None => self.entries.remove(&name),
            };
            discard(&staged_photo);
            // The mapping may already be on disk with the new entry.
            if let Err(rewrite) = self.persist() {
                tracing::error!(error = %rewrite, "could not restore reference database after failed enroll");
            }
            tracing::warn!(name = %name, replaced, error = %e, "enroll rolled back");
            return Err(e);
        }

        tracing::info!(
            name = %name,
            replaced = previous.is_some(),
            enrolled = self.entries.len(),
            "reference enrolled"
        );
        Ok(name)
    }

    /// Where the enrollment photo for `name` is archived.
    pub fn photo_path(&self, name: &str) -> PathBuf {
        self.refs_dir.join(format!("{name}.jpg"))
    }

    fn persist(&self) -> Result<(), StoreError> {
        let file = DbFile {
            version: DB_FORMAT_VERSION,
            entries: self.entries.clone(),
        };
        let json = serde_json::to_vec(&file)?;

        if let Some(parent) = self.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let tmp = tmp_path(&self.db_path);
        std::fs::write(&tmp, json).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.db_path).map_err(|source| {
            discard(&tmp);
            StoreError::Io {
                path: self.db_path.clone(),
                source,
            }
        })
    }
}

/// Best-effort removal of a staged file.
fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "could not remove staged file");
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Check that `name` is usable both as a database key and as a file stem.
pub fn validate_name(name: &str) -> Result<&str, StoreError> {
    let trimmed = name.trim();
    let valid = !trimmed.is_empty()
        && trimmed.chars().count() <= MAX_NAME_CHARS
        && !trimmed.starts_with('.')
        && !trimmed.chars().any(|c| c == '/' || c == '\\' || c.is_control());
    if valid {
        Ok(trimmed)
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn emb(values: &[f32]) -> Embedding {
        Embedding { values: values.to_vec(), model_version: Some("w600k_r50".into()) }
    }

    fn open(dir: &TempDir) -> RefStore {
        RefStore::open(dir.path().join("ref_db.json"), dir.path().join("refs")).unwrap()
    }

    #[test]
    fn test_missing_file_opens_empty() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert!(store.is_empty());
        assert!(store.gallery().is_empty());
    }

    #[test]
    fn test_enroll_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let name = store.enroll("  alice ", &emb(&[0.6, 0.8]), b"jpeg-bytes").unwrap();
        assert_eq!(name, "alice");

        assert_eq!(std::fs::read(dir.path().join("refs/alice.jpg")).unwrap(), b"jpeg-bytes");

        let gallery = open(&dir).gallery();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery[0].name, "alice");
        assert_eq!(gallery[0].embedding.values, vec![0.6, 0.8]);
        assert_eq!(gallery[0].embedding.model_version.as_deref(), Some("w600k_r50"));
    }

    #[test]
    fn test_reenroll_replaces_entry() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        store.enroll("bob", &emb(&[1.0, 0.0]), b"a").unwrap();
        store.enroll("bob", &emb(&[0.0, 1.0]), b"b").unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.gallery()[0].embedding.values, vec![0.0, 1.0]);
        assert_eq!(open(&dir).gallery()[0].embedding.values, vec![0.0, 1.0]);
    }

    #[test]
    fn test_invalid_names_rejected() {
        for bad in ["", "   ", "../etc", "a/b", "a\\b", ".hidden", "tab\there"] {
            assert!(validate_name(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(validate_name(&"x".repeat(MAX_NAME_CHARS + 1)).is_err());
        assert_eq!(validate_name("Zoë Q").unwrap(), "Zoë Q");
    }

    #[test]
    fn test_enroll_invalid_name_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let err = store.enroll("../x", &emb(&[1.0]), b"a").unwrap_err();
        assert!(matches!(err, StoreError::InvalidName(_)));
        assert!(store.is_empty());
        assert!(!dir.path().join("ref_db.json").exists());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ref_db.json"), b"{not json").unwrap();
        let err = RefStore::open(dir.path().join("ref_db.json"), dir.path().join("refs"))
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::Malformed { .. }));
    }

    #[test]
    fn test_unknown_version_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ref_db.json"), br#"{"version":9,"entries":{}}"#).unwrap();
        let err = RefStore::open(dir.path().join("ref_db.json"), dir.path().join("refs"))
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::UnsupportedVersion(9)));
    }

    #[test]
    fn test_failed_persist_restores_previous_entry() {
        let dir = TempDir::new().unwrap();
        // Database path is a directory, so the final rename fails.
        let db_path = dir.path().join("db_dir");
        std::fs::create_dir(&db_path).unwrap();
        std::fs::write(db_path.join("keep"), b"x").unwrap();
        let mut store = RefStore {
            db_path,
            refs_dir: dir.path().join("refs"),
            entries: BTreeMap::new(),
        };
        assert!(store.enroll("carol", &emb(&[1.0]), b"a").is_err());
        assert!(store.is_empty());
        assert!(!dir.path().join("refs/carol.jpg").exists());
        assert!(!dir.path().join("refs/carol.jpg.tmp").exists());
        assert!(!dir.path().join("db_dir.tmp").exists());
    }

    #[test]
    fn test_failed_reenroll_keeps_photo_and_embedding() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("ref_db.json");
        let mut store = open(&dir);
        store.enroll("bob", &emb(&[1.0, 0.0]), b"photo-one").unwrap();

        // Swap the database file for a non-empty directory so the next save fails.
        std::fs::remove_file(&db_path).unwrap();
        std::fs::create_dir(&db_path).unwrap();
        std::fs::write(db_path.join("keep"), b"x").unwrap();

        assert!(store.enroll("bob", &emb(&[0.0, 1.0]), b"photo-two").is_err());

        assert_eq!(store.gallery()[0].embedding.values, vec![1.0, 0.0]);
        assert_eq!(std::fs::read(store.photo_path("bob")).unwrap(), b"photo-one");
        assert!(!dir.path().join("refs/bob.jpg.tmp").exists());
        assert!(!dir.path().join("ref_db.json.tmp").exists());
    }

    #[test]
    fn test_tmp_path() {
        assert_eq!(tmp_path(Path::new("/a/ref_db.json")), PathBuf::from("/a/ref_db.json.tmp"));
    }
}
