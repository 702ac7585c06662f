//! Test doubles shared by the module test suites: an in-memory object
//! store, a scripted API client and a scripted upload transport.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::api::{ApiClient, ApiError, ApiRequest, ApiResponse, HttpMethod, ProgressSink};
use crate::library::{
    Attachment, AttachmentUpload, CustomLibraryKind, FileSyncKind, LibraryIdentifier,
    LibrarySelection, SyncObject, Versions,
};
use crate::store::{
    DirtyObject, LibraryInfo, ObjectStore, StoreChange, StoreError, VersionTarget, WriteRequest,
};
use crate::transfer::{TaskId, UploadError, UploadRequest, UploadTransport};

pub fn user_library() -> LibraryIdentifier {
    LibraryIdentifier::Custom(CustomLibraryKind::MyLibrary)
}

/// Canned [`ApiResponse`] with the same 412 classification the real client
/// applies.
pub fn response(status: u16, data: &[u8]) -> ApiResponse {
    ApiResponse {
        status,
        headers: HashMap::new(),
        data: data.to_vec(),
        precondition: ApiResponse::classify_precondition(status, data),
    }
}

pub trait ResponseExt {
    fn with_header(self, name: &str, value: &str) -> ApiResponse;
}

impl ResponseExt for ApiResponse {
    fn with_header(mut self, name: &str, value: &str) -> ApiResponse {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }
}

/// Scripted behavior for one `download` call.
pub struct DownloadScript {
    pub delay: Duration,
    pub result: Result<Vec<u8>, ApiError>,
}

/// [`ApiClient`] double: `send` pops canned responses in order, `download`
/// pops [`DownloadScript`]s; every request is recorded.
pub struct ScriptedApiClient {
    responses: Mutex<VecDeque<ApiResponse>>,
    requests: Mutex<Vec<ApiRequest>>,
    send_delay: Mutex<Duration>,
    downloads: Mutex<VecDeque<DownloadScript>>,
    download_calls: AtomicUsize,
    active_downloads: AtomicUsize,
    max_active_downloads: AtomicUsize,
}

impl ScriptedApiClient {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            send_delay: Mutex::new(Duration::ZERO),
            downloads: Mutex::new(VecDeque::new()),
            download_calls: AtomicUsize::new(0),
            active_downloads: AtomicUsize::new(0),
            max_active_downloads: AtomicUsize::new(0),
        }
    }

    pub fn push_response(&self, response: ApiResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn push_download(&self, script: DownloadScript) {
        self.downloads.lock().unwrap().push_back(script);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = delay;
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn recorded_methods(&self) -> Vec<HttpMethod> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.method)
            .collect()
    }

    pub fn recorded_urls(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.url.clone())
            .collect()
    }

    pub fn download_count(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_downloads(&self) -> usize {
        self.max_active_downloads.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedApiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApiClient for ScriptedApiClient {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let description = format!("{} {}", request.method.as_str(), request.url);
        self.requests.lock().unwrap().push(request);

        let delay = *self.send_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(ApiError::Transport(format!("unscripted request: {}", description)))
    }

    async fn download(
        &self,
        request: ApiRequest,
        destination: &Path,
        progress: ProgressSink<'_>,
    ) -> Result<(), ApiError> {
        self.requests.lock().unwrap().push(request);
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active_downloads.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_downloads.fetch_max(active, Ordering::SeqCst);

        let script = self.downloads.lock().unwrap().pop_front();
        let result = async {
            let script = script.ok_or(ApiError::Transport("unscripted download".to_string()))?;
            if !script.delay.is_zero() {
                tokio::time::sleep(script.delay).await;
            }
            let data = script.result?;
            progress(0.5);
            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(destination, data).await?;
            progress(1.0);
            Ok(())
        }
        .await;

        self.active_downloads.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Default)]
struct MemoryState {
    libraries: Vec<LibraryInfo>,
    versions: HashMap<LibraryIdentifier, Versions>,
    updates: HashMap<LibraryIdentifier, Vec<DirtyObject>>,
    deletions: HashMap<LibraryIdentifier, Vec<(SyncObject, String)>>,
    pending_uploads: HashMap<LibraryIdentifier, Vec<AttachmentUpload>>,
    pending_file_deletions: HashMap<LibraryIdentifier, Vec<String>>,
    needs_download: HashMap<LibraryIdentifier, Vec<Attachment>>,
    performed: Vec<WriteRequest>,
    fail: bool,
}

/// Transactional in-memory [`ObjectStore`]. Applies enough of each request
/// to drive the engine and records every request for assertions.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    changes: broadcast::Sender<StoreChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        let store = Self {
            state: Mutex::new(MemoryState::default()),
            changes,
        };
        store.add_library(LibraryInfo {
            identifier: user_library(),
            name: "My Library".to_string(),
            can_edit_metadata: true,
            can_edit_files: true,
            file_sync_kind: FileSyncKind::Vendor,
        });
        store
    }

    pub fn add_library(&self, info: LibraryInfo) {
        self.state.lock().unwrap().libraries.push(info);
    }

    pub fn add_update(&self, library: LibraryIdentifier, update: DirtyObject) {
        self.state
            .lock()
            .unwrap()
            .updates
            .entry(library)
            .or_default()
            .push(update);
    }

    pub fn add_deletion(&self, library: LibraryIdentifier, object: SyncObject, key: &str) {
        self.state
            .lock()
            .unwrap()
            .deletions
            .entry(library)
            .or_default()
            .push((object, key.to_string()));
    }

    pub fn add_pending_upload(&self, upload: AttachmentUpload) {
        self.state
            .lock()
            .unwrap()
            .pending_uploads
            .entry(upload.library_id)
            .or_default()
            .push(upload);
    }

    pub fn set_versions(&self, library: LibraryIdentifier, versions: Versions) {
        self.state.lock().unwrap().versions.insert(library, versions);
    }

    pub fn set_fail(&self, fail: bool) {
        self.state.lock().unwrap().fail = fail;
    }

    pub fn performed(&self) -> Vec<WriteRequest> {
        self.state.lock().unwrap().performed.clone()
    }

    /// Keys cleared of their dirty flag via `MarkSynced`.
    pub fn synced_keys(&self) -> Vec<String> {
        self.performed()
            .into_iter()
            .filter_map(|request| match request {
                WriteRequest::MarkSynced { keys, .. } => Some(keys),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn uploaded_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .performed()
            .into_iter()
            .filter_map(|request| match request {
                WriteRequest::MarkAttachmentUploaded { key, .. } => Some(key),
                _ => None,
            })
            .collect();
        keys.sort();
        keys
    }

    pub fn upload_failed_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .performed()
            .into_iter()
            .filter_map(|request| match request {
                WriteRequest::MarkAttachmentUploadFailed { key, .. } => Some(key),
                _ => None,
            })
            .collect();
        keys.sort();
        keys
    }

    pub fn deleted_groups(&self) -> Vec<i64> {
        self.performed()
            .into_iter()
            .filter_map(|request| match request {
                WriteRequest::DeleteGroup { group_id } => Some(group_id),
                _ => None,
            })
            .collect()
    }

    pub fn attachment_downloaded_count(&self, key: &str) -> usize {
        self.performed()
            .into_iter()
            .filter(|request| {
                matches!(
                    request,
                    WriteRequest::MarkAttachmentDownloaded { key: marked, downloaded: true, .. }
                        if marked == key
                )
            })
            .count()
    }

    pub fn stored_object_keys(&self, object: SyncObject) -> Vec<String> {
        self.performed()
            .into_iter()
            .filter_map(|request| match request {
                WriteRequest::StoreObjects {
                    object: stored,
                    payloads,
                    ..
                } if stored == object => Some(payloads),
                _ => None,
            })
            .flatten()
            .filter_map(|payload| {
                payload
                    .get("key")
                    .or_else(|| payload.get("id"))
                    .map(|key| match key {
                        serde_json::Value::String(key) => key.clone(),
                        other => other.to_string(),
                    })
            })
            .collect()
    }

    fn apply(state: &mut MemoryState, request: &WriteRequest) {
        match request {
            WriteRequest::StoreVersion {
                library,
                target,
                version,
            } => {
                let versions = state.versions.entry(*library).or_default();
                set_version(versions, *target, *version);
            }
            WriteRequest::MarkSynced {
                library,
                object,
                keys,
                version,
            } => {
                if let Some(updates) = state.updates.get_mut(library) {
                    updates.retain(|update| {
                        update.object != *object || !keys.contains(&update.key)
                    });
                }
                let versions = state.versions.entry(*library).or_default();
                set_version(versions, VersionTarget::Object(*object), *version);
            }
            WriteRequest::DeleteObjects { library, object, keys } => {
                if let Some(deletions) = state.deletions.get_mut(library) {
                    deletions.retain(|(deleted, key)| deleted != object || !keys.contains(key));
                }
            }
            WriteRequest::MarkAttachmentUploaded { library, key } => {
                if let Some(uploads) = state.pending_uploads.get_mut(library) {
                    uploads.retain(|upload| &upload.key != key);
                }
            }
            WriteRequest::MarkFileDeletionsSynced { library, keys } => {
                if let Some(pending) = state.pending_file_deletions.get_mut(library) {
                    pending.retain(|key| !keys.contains(key));
                }
            }
            WriteRequest::StoreSettings { library, version, .. } => {
                let versions = state.versions.entry(*library).or_default();
                versions.settings = *version;
            }
            WriteRequest::DeleteGroup { group_id } => {
                let library = LibraryIdentifier::Group(*group_id);
                state.libraries.retain(|info| info.identifier != library);
                state.versions.remove(&library);
                state.updates.remove(&library);
                state.deletions.remove(&library);
            }
            _ => {}
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn set_version(versions: &mut Versions, target: VersionTarget, version: i64) {
    match target {
        VersionTarget::Object(SyncObject::Collection) => versions.collections = version,
        VersionTarget::Object(SyncObject::Search) => versions.searches = version,
        VersionTarget::Object(SyncObject::Item) => versions.items = version,
        VersionTarget::Object(SyncObject::Trash) => versions.trash = version,
        VersionTarget::Object(SyncObject::Group) | VersionTarget::Object(SyncObject::Tag) => {}
        VersionTarget::Deletions => versions.deletions = version,
        VersionTarget::Settings => versions.settings = version,
    }
}

impl ObjectStore for MemoryStore {
    fn perform_all(&self, requests: Vec<WriteRequest>) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.fail {
            return Err(StoreError::Failure("injected failure".to_string()));
        }
        for request in &requests {
            Self::apply(&mut state, request);
            if let WriteRequest::StoreObjects {
                library,
                object,
                payloads,
            } = request
            {
                let keys = payloads
                    .iter()
                    .filter_map(|payload| payload.get("key"))
                    .filter_map(|key| key.as_str())
                    .map(String::from)
                    .collect();
                let _ = self.changes.send(StoreChange {
                    library: *library,
                    object: *object,
                    keys,
                });
            }
        }
        state.performed.extend(requests);
        Ok(())
    }

    fn libraries(&self, selection: &LibrarySelection) -> Result<Vec<LibraryInfo>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .libraries
            .iter()
            .filter(|info| match selection {
                LibrarySelection::All => true,
                LibrarySelection::Specific(identifiers) => identifiers.contains(&info.identifier),
            })
            .cloned()
            .collect())
    }

    fn updates(&self, library: LibraryIdentifier) -> Result<Vec<DirtyObject>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.updates.get(&library).cloned().unwrap_or_default())
    }

    fn deletions(
        &self,
        library: LibraryIdentifier,
    ) -> Result<Vec<(SyncObject, String)>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.deletions.get(&library).cloned().unwrap_or_default())
    }

    fn versions(&self, library: LibraryIdentifier) -> Result<Versions, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.versions.get(&library).copied().unwrap_or_default())
    }

    fn pending_uploads(
        &self,
        library: LibraryIdentifier,
    ) -> Result<Vec<AttachmentUpload>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.pending_uploads.get(&library).cloned().unwrap_or_default())
    }

    fn pending_file_deletions(
        &self,
        library: LibraryIdentifier,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pending_file_deletions
            .get(&library)
            .cloned()
            .unwrap_or_default())
    }

    fn attachments_needing_download(
        &self,
        library: LibraryIdentifier,
    ) -> Result<Vec<Attachment>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.needs_download.get(&library).cloned().unwrap_or_default())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

/// [`UploadTransport`] double: hands out sequential task ids and records
/// every call.
pub struct ScriptedTransport {
    next_id: AtomicI64,
    prepared: Mutex<Vec<(TaskId, UploadRequest)>>,
    resumed: Mutex<Vec<TaskId>>,
    invalidated: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            prepared: Mutex::new(Vec::new()),
            resumed: Mutex::new(Vec::new()),
            invalidated: Mutex::new(Vec::new()),
        }
    }

    pub fn prepared_count(&self) -> usize {
        self.prepared.lock().unwrap().len()
    }

    pub fn resumed(&self) -> Vec<TaskId> {
        self.resumed.lock().unwrap().clone()
    }

    pub fn invalidated(&self, session_id: &str) -> bool {
        self.invalidated
            .lock()
            .unwrap()
            .iter()
            .any(|invalidated| invalidated == session_id)
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UploadTransport for ScriptedTransport {
    async fn prepare(
        &self,
        _session_id: &str,
        request: UploadRequest,
        _file: &Path,
    ) -> Result<TaskId, UploadError> {
        let task_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.prepared.lock().unwrap().push((task_id, request));
        Ok(task_id)
    }

    async fn resume(&self, task_id: TaskId) -> Result<(), UploadError> {
        self.resumed.lock().unwrap().push(task_id);
        Ok(())
    }

    fn invalidate(&self, session_id: &str) {
        self.invalidated
            .lock()
            .unwrap()
            .push(session_id.to_string());
    }
}
