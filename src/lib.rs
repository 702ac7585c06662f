//! Synchronization and transfer engine for a personal reference library.
//!
//! Keeps a local object store consistent with a versioned multi-tenant REST
//! service across a personal library and any number of group libraries, and
//! moves attachment payloads through vendor storage or a user-configured
//! WebDAV server.

pub mod api;
pub mod config;
pub mod library;
pub mod store;
pub mod sync;
pub mod transfer;
pub mod webdav;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConfigError, CredentialStore, SyncConfig, WebDavConfig};
pub use library::{
    Attachment, AttachmentLocation, AttachmentUpload, CustomLibraryKind, FileSyncKind,
    LibraryIdentifier, LibrarySelection, SyncKind, SyncObject, Versions,
};
pub use sync::{SyncController, SyncError, SyncReport};
