pub mod batch;
pub mod conflict;
pub mod versions;

mod controller;

pub use batch::{
    delete_batches, download_batches, write_batches, DeleteBatch, DownloadBatch, LibraryData,
    WriteBatch, MAX_BATCH_SIZE,
};
pub use conflict::{
    Conflict, ConflictPresenter, ConflictReceiver, ConflictResolution, ConflictResolver,
    RemoteDeletionOutcome,
};
pub use controller::{SyncController, SyncError, SyncReport};
pub use versions::{VersionStore, VersionStoreError};
