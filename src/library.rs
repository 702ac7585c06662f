use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The built-in library kinds every account has exactly one of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CustomLibraryKind {
    MyLibrary,
}

/// Identifies one sync domain: the personal library or a shared group library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LibraryIdentifier {
    Custom(CustomLibraryKind),
    Group(i64),
}

impl LibraryIdentifier {
    pub fn is_group(&self) -> bool {
        matches!(self, LibraryIdentifier::Group(_))
    }

    /// API path segment for this library ("users/{id}" vs "groups/{id}").
    pub fn api_path(&self, user_id: i64) -> String {
        match self {
            LibraryIdentifier::Custom(_) => format!("users/{}", user_id),
            LibraryIdentifier::Group(id) => format!("groups/{}", id),
        }
    }
}

impl fmt::Display for LibraryIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LibraryIdentifier::Custom(CustomLibraryKind::MyLibrary) => write!(f, "user"),
            LibraryIdentifier::Group(id) => write!(f, "group({})", id),
        }
    }
}

/// The object-type dimension, orthogonal to the library dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncObject {
    Group,
    Collection,
    Search,
    Item,
    Trash,
    Tag,
}

impl SyncObject {
    /// API path segment for the object collection.
    pub fn api_component(&self) -> &'static str {
        match self {
            SyncObject::Group => "groups",
            SyncObject::Collection => "collections",
            SyncObject::Search => "searches",
            SyncObject::Item | SyncObject::Trash => "items",
            SyncObject::Tag => "tags",
        }
    }
}

impl fmt::Display for SyncObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncObject::Group => "group",
            SyncObject::Collection => "collection",
            SyncObject::Search => "search",
            SyncObject::Item => "item",
            SyncObject::Trash => "trash",
            SyncObject::Tag => "tag",
        };
        write!(f, "{}", name)
    }
}

/// Per-library record of the last-known remote version numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Versions {
    pub collections: i64,
    pub items: i64,
    pub trash: i64,
    pub searches: i64,
    pub deletions: i64,
    pub settings: i64,
}

impl Versions {
    /// Highest version across all object collections.
    pub fn max(&self) -> i64 {
        [
            self.collections,
            self.items,
            self.trash,
            self.searches,
            self.deletions,
            self.settings,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }

    pub fn version(&self, object: SyncObject) -> i64 {
        match object {
            SyncObject::Collection => self.collections,
            SyncObject::Item => self.items,
            SyncObject::Trash => self.trash,
            SyncObject::Search => self.searches,
            // Groups and tags are versioned through the library max
            SyncObject::Group | SyncObject::Tag => self.max(),
        }
    }
}

/// Which sync pass is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// Only objects which need syncing are fetched.
    Normal,
    /// Same as `Normal`, ignoring individual retry backoff.
    IgnoreDelays,
    /// Everything is re-fetched, stored versions are ignored.
    Full,
    /// A retry after a previous broken sync.
    Retry,
}

/// Which libraries a sync pass covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibrarySelection {
    All,
    Specific(Vec<LibraryIdentifier>),
}

/// File transport used for a library's attachments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileSyncKind {
    #[default]
    Vendor,
    WebDav,
}

/// Where an attachment's payload currently lives relative to this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentLocation {
    /// Up-to-date copy on disk.
    Local,
    /// Only on the server.
    Remote,
    /// Flagged remote but the server reported it missing.
    RemoteMissing,
    /// On disk, but the server has a newer payload.
    LocalAndChangedRemotely,
}

/// A file attachment as seen by the transfer subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub key: String,
    pub library_id: LibraryIdentifier,
    pub filename: String,
    pub content_type: String,
    pub location: AttachmentLocation,
}

/// One pending outgoing file.
///
/// Content identity is `md5` + `mtime`; the local path and previous hash are
/// carried for the transfer itself and excluded from equality.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub library_id: LibraryIdentifier,
    pub key: String,
    pub filename: String,
    pub content_type: String,
    pub md5: String,
    /// Modification time in milliseconds since the epoch.
    pub mtime: i64,
    pub file: PathBuf,
    pub old_md5: Option<String>,
}

impl PartialEq for AttachmentUpload {
    fn eq(&self, other: &Self) -> bool {
        self.library_id == other.library_id
            && self.key == other.key
            && self.filename == other.filename
            && self.content_type == other.content_type
            && self.md5 == other.md5
            && self.mtime == other.mtime
    }
}

impl Eq for AttachmentUpload {}
