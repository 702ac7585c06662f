use crate::library::{FileSyncKind, LibraryIdentifier, SyncObject, Versions};
use crate::store::DirtyObject;

/// Hard cap on objects per API round trip; bounds request size and the
/// retry blast radius of a failed batch.
pub const MAX_BATCH_SIZE: usize = 50;

/// Submission order for write/delete batches: structural objects first so
/// that items never reference a collection or search the service has not
/// seen yet.
const OBJECT_ORDER: [SyncObject; 5] = [
    SyncObject::Collection,
    SyncObject::Search,
    SyncObject::Item,
    SyncObject::Trash,
    SyncObject::Tag,
];

/// One batch of objects to fetch from the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadBatch {
    pub library: LibraryIdentifier,
    pub object: SyncObject,
    pub keys: Vec<String>,
    pub version: i64,
}

/// One batch of local changes to submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    pub library: LibraryIdentifier,
    pub object: SyncObject,
    pub version: i64,
    pub parameters: Vec<serde_json::Value>,
}

impl WriteBatch {
    /// New batch carrying the version the service returned; all other fields
    /// unchanged.
    pub fn copy_with_version(&self, version: i64) -> WriteBatch {
        WriteBatch {
            library: self.library,
            object: self.object,
            version,
            parameters: self.parameters.clone(),
        }
    }

    /// Object keys contained in this batch's parameters.
    pub fn keys(&self) -> Vec<String> {
        self.parameters
            .iter()
            .filter_map(|params| params.get("key"))
            .filter_map(|key| key.as_str())
            .map(String::from)
            .collect()
    }
}

/// One batch of local deletions to submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteBatch {
    pub library: LibraryIdentifier,
    pub object: SyncObject,
    pub version: i64,
    pub keys: Vec<String>,
}

impl DeleteBatch {
    pub fn copy_with_version(&self, version: i64) -> DeleteBatch {
        DeleteBatch {
            library: self.library,
            object: self.object,
            version,
            keys: self.keys.clone(),
        }
    }
}

/// The unit of work for one library for one sync pass. Built once per pass,
/// consumed and discarded.
#[derive(Debug, Clone)]
pub struct LibraryData {
    pub identifier: LibraryIdentifier,
    pub name: String,
    pub versions: Versions,
    pub can_edit_metadata: bool,
    pub can_edit_files: bool,
    pub updates: Vec<WriteBatch>,
    pub deletions: Vec<DeleteBatch>,
    pub has_upload: bool,
    pub has_webdav_deletions: bool,
    pub file_sync_kind: FileSyncKind,
}

/// Partition dirty objects into write batches: structural objects first,
/// input order preserved within an object type, at most [`MAX_BATCH_SIZE`]
/// parameters per batch. The partition is a pure function of its inputs so
/// retries resubmit identical batches.
pub fn write_batches(
    library: LibraryIdentifier,
    versions: &Versions,
    updates: &[DirtyObject],
) -> Vec<WriteBatch> {
    let mut batches = Vec::new();
    for object in OBJECT_ORDER {
        let parameters: Vec<serde_json::Value> = updates
            .iter()
            .filter(|update| update.object == object)
            .map(|update| update.parameters.clone())
            .collect();
        for chunk in parameters.chunks(MAX_BATCH_SIZE) {
            batches.push(WriteBatch {
                library,
                object,
                version: versions.version(object),
                parameters: chunk.to_vec(),
            });
        }
    }
    batches
}

/// Partition pending deletions into delete batches, same ordering and cap
/// rules as [`write_batches`].
pub fn delete_batches(
    library: LibraryIdentifier,
    versions: &Versions,
    deletions: &[(SyncObject, String)],
) -> Vec<DeleteBatch> {
    let mut batches = Vec::new();
    for object in OBJECT_ORDER {
        let keys: Vec<String> = deletions
            .iter()
            .filter(|(deleted, _)| *deleted == object)
            .map(|(_, key)| key.clone())
            .collect();
        for chunk in keys.chunks(MAX_BATCH_SIZE) {
            batches.push(DeleteBatch {
                library,
                object,
                version: versions.version(object),
                keys: chunk.to_vec(),
            });
        }
    }
    batches
}

/// Partition changed keys into download batches with progressively growing
/// sizes (5, 10, 20, 40, then 50 thereafter): early small batches surface
/// decode problems quickly, later batches amortize round trips.
pub fn download_batches(
    library: LibraryIdentifier,
    object: SyncObject,
    keys: &[String],
    version: i64,
) -> Vec<DownloadBatch> {
    let mut batch_size = 5;
    let mut processed = 0;
    let mut batches = Vec::new();

    while processed < keys.len() {
        let upper = (processed + batch_size).min(keys.len());
        batches.push(DownloadBatch {
            library,
            object,
            keys: keys[processed..upper].to_vec(),
            version,
        });
        processed += batch_size;
        if batch_size < MAX_BATCH_SIZE {
            batch_size = (batch_size * 2).min(MAX_BATCH_SIZE);
        }
    }

    batches
}
