use std::sync::Arc;

use thiserror::Error;

use crate::library::{LibraryIdentifier, SyncObject, Versions};
use crate::store::{ObjectStore, StoreError, VersionTarget, WriteRequest};

#[derive(Error, Debug)]
pub enum VersionStoreError {
    /// The service reported a version lower than the one already stored.
    /// Treated as server-side data loss: callers must run a full resync
    /// instead of silently regressing local state.
    #[error("version regression for {library} {target:?}: stored {stored}, reported {reported}")]
    Regression {
        library: LibraryIdentifier,
        target: VersionTarget,
        stored: i64,
        reported: i64,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Tracks the last-known remote version per library and object collection.
///
/// Versions are persisted in the object store so a batch's data mutation and
/// its version stamp can commit in one transaction; this type adds the
/// monotonic-update policy on top.
pub struct VersionStore {
    store: Arc<dyn ObjectStore>,
}

impl VersionStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn read(&self, library: LibraryIdentifier) -> Result<Versions, VersionStoreError> {
        Ok(self.store.versions(library)?)
    }

    /// Apply a new version for one target, enforcing monotonicity.
    pub fn update(
        &self,
        library: LibraryIdentifier,
        target: VersionTarget,
        version: i64,
    ) -> Result<(), VersionStoreError> {
        let request = self.stamp_request(library, target, version)?;
        self.store.perform(request)?;
        Ok(())
    }

    /// Validate a version update and return the store request without
    /// performing it, so callers can commit it together with the batch data
    /// it belongs to.
    pub fn stamp_request(
        &self,
        library: LibraryIdentifier,
        target: VersionTarget,
        version: i64,
    ) -> Result<WriteRequest, VersionStoreError> {
        let stored = self.current(library, target)?;
        if version < stored {
            return Err(VersionStoreError::Regression {
                library,
                target,
                stored,
                reported: version,
            });
        }
        Ok(WriteRequest::StoreVersion {
            library,
            target,
            version,
        })
    }

    /// Clear a library's version record. Only the explicit full-resync path
    /// may do this.
    pub fn reset(&self, library: LibraryIdentifier) -> Result<(), VersionStoreError> {
        log::warn!("VersionStore: resetting versions for {}", library);
        let mut requests = Vec::new();
        for object in [
            SyncObject::Collection,
            SyncObject::Search,
            SyncObject::Item,
            SyncObject::Trash,
        ] {
            requests.push(WriteRequest::StoreVersion {
                library,
                target: VersionTarget::Object(object),
                version: 0,
            });
        }
        requests.push(WriteRequest::StoreVersion {
            library,
            target: VersionTarget::Deletions,
            version: 0,
        });
        requests.push(WriteRequest::StoreVersion {
            library,
            target: VersionTarget::Settings,
            version: 0,
        });
        self.store.perform_all(requests)?;
        Ok(())
    }

    fn current(
        &self,
        library: LibraryIdentifier,
        target: VersionTarget,
    ) -> Result<i64, VersionStoreError> {
        let versions = self.store.versions(library)?;
        Ok(version_for(&versions, target))
    }
}

pub(crate) fn version_for(versions: &Versions, target: VersionTarget) -> i64 {
    match target {
        VersionTarget::Object(object) => versions.version(object),
        VersionTarget::Deletions => versions.deletions,
        VersionTarget::Settings => versions.settings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;

    fn user() -> LibraryIdentifier {
        LibraryIdentifier::Custom(crate::library::CustomLibraryKind::MyLibrary)
    }

    #[test]
    fn updates_are_monotonic() {
        let store = Arc::new(MemoryStore::new());
        let versions = VersionStore::new(store.clone());
        let target = VersionTarget::Object(SyncObject::Item);

        versions.update(user(), target, 10).unwrap();
        assert_eq!(versions.read(user()).unwrap().items, 10);

        // Equal is allowed (idempotent retry)
        versions.update(user(), target, 10).unwrap();
        versions.update(user(), target, 12).unwrap();
        assert_eq!(versions.read(user()).unwrap().items, 12);
    }

    #[test]
    fn smaller_version_is_a_regression_signal() {
        let store = Arc::new(MemoryStore::new());
        let versions = VersionStore::new(store.clone());
        let target = VersionTarget::Object(SyncObject::Collection);

        versions.update(user(), target, 8).unwrap();
        let err = versions.update(user(), target, 5).unwrap_err();
        assert!(matches!(
            err,
            VersionStoreError::Regression {
                stored: 8,
                reported: 5,
                ..
            }
        ));
        // The stored value is untouched
        assert_eq!(versions.read(user()).unwrap().collections, 8);
    }

    #[test]
    fn reset_clears_every_field() {
        let store = Arc::new(MemoryStore::new());
        let versions = VersionStore::new(store.clone());

        versions
            .update(user(), VersionTarget::Object(SyncObject::Item), 42)
            .unwrap();
        versions.update(user(), VersionTarget::Settings, 7).unwrap();

        versions.reset(user()).unwrap();
        assert_eq!(versions.read(user()).unwrap(), Versions::default());

        // After a reset, lower versions may be stored again
        versions
            .update(user(), VersionTarget::Object(SyncObject::Item), 3)
            .unwrap();
        assert_eq!(versions.read(user()).unwrap().items, 3);
    }
}
