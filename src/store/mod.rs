use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::library::{
    Attachment, AttachmentUpload, FileSyncKind, LibraryIdentifier, LibrarySelection, SyncObject,
    Versions,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("storage failure: {0}")]
    Failure(String),
}

/// Which version field a [`WriteRequest::StoreVersion`] targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionTarget {
    Object(SyncObject),
    Deletions,
    Settings,
}

/// A locally modified object that needs uploading.
#[derive(Debug, Clone)]
pub struct DirtyObject {
    pub object: SyncObject,
    pub key: String,
    /// Write parameters exactly as the service expects them.
    pub parameters: serde_json::Value,
}

/// Library metadata and permissions as persisted locally.
#[derive(Debug, Clone)]
pub struct LibraryInfo {
    pub identifier: LibraryIdentifier,
    pub name: String,
    pub can_edit_metadata: bool,
    pub can_edit_files: bool,
    pub file_sync_kind: FileSyncKind,
}

/// One mutation of the object store. Requests handed to
/// [`ObjectStore::perform_all`] commit together or not at all.
#[derive(Debug, Clone)]
pub enum WriteRequest {
    /// Store objects fetched from the service (download batch payloads).
    StoreObjects {
        library: LibraryIdentifier,
        object: SyncObject,
        payloads: Vec<serde_json::Value>,
    },
    /// Stamp a version field for a library.
    StoreVersion {
        library: LibraryIdentifier,
        target: VersionTarget,
        version: i64,
    },
    /// Clear dirty flags after the service acknowledged a write batch.
    MarkSynced {
        library: LibraryIdentifier,
        object: SyncObject,
        keys: Vec<String>,
        version: i64,
    },
    /// Apply remote deletions locally.
    DeleteObjects {
        library: LibraryIdentifier,
        object: SyncObject,
        keys: Vec<String>,
    },
    /// Keep a locally displayed object a remote deletion targeted; it is
    /// re-marked as needing upload.
    RestoreObjects {
        library: LibraryIdentifier,
        object: SyncObject,
        keys: Vec<String>,
    },
    /// Flag objects whose batch fetch failed so the next pass retries them.
    MarkForResync {
        library: LibraryIdentifier,
        object: SyncObject,
        keys: Vec<String>,
    },
    MarkAttachmentDownloaded {
        library: LibraryIdentifier,
        key: String,
        downloaded: bool,
    },
    MarkAttachmentUploaded {
        library: LibraryIdentifier,
        key: String,
    },
    MarkAttachmentUploadFailed {
        library: LibraryIdentifier,
        key: String,
        error: String,
    },
    /// Store a corrected modification time for an attachment (file transport
    /// found matching content with a different mtime).
    StoreMtime {
        library: LibraryIdentifier,
        key: String,
        mtime: i64,
    },
    /// Apply remotely changed library settings together with their version.
    StoreSettings {
        library: LibraryIdentifier,
        payload: serde_json::Value,
        version: i64,
    },
    /// Drop remote-file deletion records once the file transport confirmed
    /// them.
    MarkFileDeletionsSynced {
        library: LibraryIdentifier,
        keys: Vec<String>,
    },
    /// Purge all local data of a remotely removed group.
    DeleteGroup { group_id: i64 },
    /// Detach a group from the service, keeping the local copy unsynced.
    MarkGroupAsLocalOnly { group_id: i64 },
    /// Discard local uncommitted changes in a library.
    RevertLibraryChanges { library: LibraryIdentifier },
    /// Keep local changes but stop attempting to push them.
    MarkChangesAsResolved { library: LibraryIdentifier },
}

/// Change notification emitted after remote-driven mutations commit.
#[derive(Debug, Clone)]
pub struct StoreChange {
    pub library: LibraryIdentifier,
    pub object: SyncObject,
    pub keys: Vec<String>,
}

/// The persistent-object-store collaborator boundary.
///
/// Implementations must give `perform_all` transactional semantics: either
/// every request in the slice commits, or none do.
pub trait ObjectStore: Send + Sync {
    fn perform(&self, request: WriteRequest) -> Result<(), StoreError> {
        self.perform_all(vec![request])
    }

    fn perform_all(&self, requests: Vec<WriteRequest>) -> Result<(), StoreError>;

    fn libraries(&self, selection: &LibrarySelection) -> Result<Vec<LibraryInfo>, StoreError>;

    /// Locally modified objects for a library, in a stable order.
    fn updates(&self, library: LibraryIdentifier) -> Result<Vec<DirtyObject>, StoreError>;

    /// Locally deleted keys not yet submitted, in a stable order.
    fn deletions(
        &self,
        library: LibraryIdentifier,
    ) -> Result<Vec<(SyncObject, String)>, StoreError>;

    /// Last-synced version record for a library.
    fn versions(&self, library: LibraryIdentifier) -> Result<Versions, StoreError>;

    fn pending_uploads(
        &self,
        library: LibraryIdentifier,
    ) -> Result<Vec<AttachmentUpload>, StoreError>;

    /// Attachment keys whose remote files await deletion on the WebDAV server.
    fn pending_file_deletions(
        &self,
        library: LibraryIdentifier,
    ) -> Result<Vec<String>, StoreError>;

    /// Attachments whose payload is remote-only or remotely changed.
    fn attachments_needing_download(
        &self,
        library: LibraryIdentifier,
    ) -> Result<Vec<Attachment>, StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

/// Durable key-value settings, persisted as one JSON file.
pub struct SettingsStore {
    path: PathBuf,
    values: Mutex<HashMap<String, serde_json::Value>>,
}

impl SettingsStore {
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let values = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            values: Mutex::new(values),
        })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let values = self.values.lock().unwrap();
        values
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap();
        values.insert(key.to_string(), serde_json::to_value(value)?);
        self.save(&values)
    }

    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap();
        values.remove(key);
        self.save(&values)
    }

    fn save(&self, values: &HashMap<String, serde_json::Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(values)?;
        std::fs::write(&self.path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = SettingsStore::load(&path).unwrap();
        store.set("webdavVerified", &true).unwrap();
        store.set("retryCount", &3u32).unwrap();

        let reloaded = SettingsStore::load(&path).unwrap();
        assert_eq!(reloaded.get::<bool>("webdavVerified"), Some(true));
        assert_eq!(reloaded.get::<u32>("retryCount"), Some(3));
        assert_eq!(reloaded.get::<bool>("missing"), None);

        reloaded.remove("webdavVerified").unwrap();
        let reloaded = SettingsStore::load(&path).unwrap();
        assert_eq!(reloaded.get::<bool>("webdavVerified"), None);
    }
}
