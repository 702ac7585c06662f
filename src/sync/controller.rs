use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::api::{
    ApiClient, ApiError, ApiRequest, ApiResponse, HttpMethod, PreconditionKind, RequestBody,
    STATUS_NOT_MODIFIED, STATUS_PRECONDITION_FAILED,
};
use crate::library::{
    FileSyncKind, LibraryIdentifier, LibrarySelection, SyncKind, SyncObject, Versions,
};
use crate::store::{DirtyObject, ObjectStore, StoreError, VersionTarget, WriteRequest};
use crate::sync::batch::{
    delete_batches, download_batches, write_batches, DeleteBatch, DownloadBatch, LibraryData,
    WriteBatch,
};
use crate::sync::conflict::{Conflict, ConflictResolution, ConflictResolver};
use crate::sync::versions::{VersionStore, VersionStoreError};
use crate::transfer::{
    AttachmentDownloader, BackgroundUpload, BackgroundUploadCoordinator, BackgroundUploadKind,
    UploadRequest,
};
use crate::webdav::{UploadPreparation, WebDavClient};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("sync cancelled")]
    Cancelled,
    #[error("no internet connection")]
    NoInternetConnection,
    #[error("api error: {0}")]
    ApiError(String),
    #[error("database error: {0}")]
    DbError(String),
    #[error("version mismatch for {0}")]
    VersionMismatch(LibraryIdentifier),
    #[error("group sync failed: {0}")]
    GroupSyncFailed(String),
    #[error("could not load libraries: {0}")]
    AllLibrariesFetchFailed(String),
    #[error("object version conflict during upload")]
    UploadObjectConflict,
    #[error("could not load key permissions")]
    PermissionLoadingFailed,
    #[error("missing permissions for group {0}")]
    MissingGroupPermissions(i64),
}

/// Outcome of one `sync` call (which may have chained several passes).
#[derive(Debug, Default, Clone)]
pub struct SyncReport {
    pub fatal: Option<SyncError>,
    pub non_fatal: Vec<SyncError>,
    /// A conflict needed a decision but no presenter was attached; the next
    /// sync retries it.
    pub conflicts_pending: bool,
    /// The request arrived while a pass was active and was coalesced into a
    /// rerun of that pass.
    pub scheduled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreateLibraryOptions {
    Automatic,
    OnlyWrites,
    ForceDownloads,
}

/// One step of a sync pass. The queue is processed front-first; dynamically
/// produced follow-ups are inserted at the front so per-library ordering is
/// structural.
#[derive(Debug, Clone)]
enum Action {
    LoadPermissions,
    SyncGroupVersions,
    CreateLibraryActions(LibrarySelection, CreateLibraryOptions),
    SyncVersions {
        library: LibraryIdentifier,
        object: SyncObject,
        since: Option<i64>,
    },
    SyncBatchToStore(DownloadBatch),
    StoreVersion {
        library: LibraryIdentifier,
        target: VersionTarget,
        version: i64,
    },
    SyncDeletions {
        library: LibraryIdentifier,
        since: i64,
    },
    SyncSettings {
        library: LibraryIdentifier,
        since: Option<i64>,
    },
    SubmitWriteBatch(WriteBatch),
    SubmitDeleteBatch(DeleteBatch),
    ResolveDeletedGroup {
        group_id: i64,
        name: String,
    },
    ResolveGroupWritePermission {
        group_id: i64,
        name: String,
    },
    DeleteGroup(i64),
    MarkGroupAsLocalOnly(i64),
    RevertLibraryToOriginal(LibraryIdentifier),
    MarkChangesAsResolved(LibraryIdentifier),
    ProcessAttachments(LibraryIdentifier),
    SubmitWebDavDeletions(LibraryIdentifier),
}

impl Action {
    fn library(&self) -> Option<LibraryIdentifier> {
        match self {
            Action::SyncVersions { library, .. }
            | Action::StoreVersion { library, .. }
            | Action::SyncDeletions { library, .. }
            | Action::SyncSettings { library, .. }
            | Action::RevertLibraryToOriginal(library)
            | Action::MarkChangesAsResolved(library)
            | Action::ProcessAttachments(library)
            | Action::SubmitWebDavDeletions(library) => Some(*library),
            Action::SyncBatchToStore(batch) => Some(batch.library),
            Action::SubmitWriteBatch(batch) => Some(batch.library),
            Action::SubmitDeleteBatch(batch) => Some(batch.library),
            Action::ResolveDeletedGroup { group_id, .. }
            | Action::ResolveGroupWritePermission { group_id, .. }
            | Action::DeleteGroup(group_id)
            | Action::MarkGroupAsLocalOnly(group_id) => {
                Some(LibraryIdentifier::Group(*group_id))
            }
            Action::LoadPermissions
            | Action::SyncGroupVersions
            | Action::CreateLibraryActions(..) => None,
        }
    }

    /// Actions of the download phase, removed wholesale when the service
    /// reports a library unchanged.
    fn is_download_phase(&self) -> bool {
        matches!(
            self,
            Action::SyncVersions { .. }
                | Action::SyncBatchToStore(_)
                | Action::StoreVersion { .. }
                | Action::SyncDeletions { .. }
                | Action::SyncSettings { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[allow(dead_code)]
struct Permissions {
    #[serde(default)]
    library: bool,
    #[serde(default)]
    notes: bool,
    #[serde(default)]
    files: bool,
    #[serde(default)]
    write: bool,
}

#[derive(Debug, Clone, Default)]
#[allow(dead_code)]
struct AccessPermissions {
    user: Permissions,
    group_default: Option<Permissions>,
    groups: HashMap<i64, Permissions>,
}

impl AccessPermissions {
    fn group(&self, group_id: i64) -> Option<Permissions> {
        self.groups.get(&group_id).copied().or(self.group_default)
    }
}

/// Per-pass mutable state.
struct Pass {
    kind: SyncKind,
    selection: LibrarySelection,
    queue: VecDeque<Action>,
    current_library: Option<LibraryIdentifier>,
    /// Version returned by the last object sync; a different value from a
    /// later response means the library changed mid-pass.
    last_returned_version: Option<i64>,
    non_fatal: Vec<SyncError>,
    conflicts_pending: bool,
    conflict_retries: usize,
    version_retried: HashSet<LibraryIdentifier>,
    access: AccessPermissions,
    /// Set by the library-conflict path; applied before the next request.
    pending_delay: Option<std::time::Duration>,
}

struct ControllerState {
    syncing: bool,
    rerun: Option<(SyncKind, LibrarySelection)>,
    cancel: CancellationToken,
}

/// The top-level sync state machine.
///
/// One logical pass at a time per account: a start request during an active
/// pass is coalesced into "run again after the current pass". Cancellation
/// takes effect at action boundaries; a batch is either acknowledged and
/// persisted or discarded whole.
pub struct SyncController {
    user_id: i64,
    api_base: String,
    api_key: Option<String>,
    api: Arc<dyn ApiClient>,
    store: Arc<dyn ObjectStore>,
    versions: VersionStore,
    conflicts: Arc<ConflictResolver>,
    downloader: Option<Arc<AttachmentDownloader>>,
    uploader: Option<Arc<BackgroundUploadCoordinator>>,
    webdav: Option<Arc<WebDavClient>>,
    /// Escalating delays (seconds) between library-conflict retries.
    conflict_delays: Vec<u64>,
    state: Mutex<ControllerState>,
}

/// Bound on automatic pass chaining (retry after non-fatal errors, full
/// resync after an upload object conflict).
const MAX_AUTO_RERUNS: usize = 3;

/// Escalating waits before retrying a pass that failed for connectivity.
const CONNECTIVITY_BACKOFF_SECS: [u64; 3] = [5, 15, 60];

impl SyncController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: i64,
        api_base: String,
        api_key: Option<String>,
        api: Arc<dyn ApiClient>,
        store: Arc<dyn ObjectStore>,
        conflicts: Arc<ConflictResolver>,
        downloader: Option<Arc<AttachmentDownloader>>,
        uploader: Option<Arc<BackgroundUploadCoordinator>>,
        webdav: Option<Arc<WebDavClient>>,
        conflict_delays: Vec<u64>,
    ) -> Self {
        Self {
            user_id,
            api_base,
            api_key,
            api,
            versions: VersionStore::new(store.clone()),
            store,
            conflicts,
            downloader,
            uploader,
            webdav,
            conflict_delays,
            state: Mutex::new(ControllerState {
                syncing: false,
                rerun: None,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.state.lock().unwrap().syncing
    }

    /// Abort the current pass at the next action boundary.
    pub fn cancel(&self) {
        let state = self.state.lock().unwrap();
        if state.syncing {
            log::info!("SyncController: cancelling");
            state.cancel.cancel();
        }
    }

    /// Run a sync. Chains automatic retries (and coalesced rerun requests)
    /// until a pass finishes clean, fails fatally or the rerun allowance is
    /// spent.
    pub async fn sync(&self, kind: SyncKind, selection: LibrarySelection) -> SyncReport {
        let token = {
            let mut state = self.state.lock().unwrap();
            if state.syncing {
                log::info!("SyncController: sync in progress, scheduling rerun");
                state.rerun = Some((kind, selection));
                return SyncReport {
                    scheduled: true,
                    ..SyncReport::default()
                };
            }
            state.syncing = true;
            state.cancel = CancellationToken::new();
            state.cancel.clone()
        };

        let mut kind = kind;
        let mut selection = selection;
        let mut auto_reruns = 0;
        let report = loop {
            log::info!("SyncController: starting pass ({:?})", kind);
            let report = self.run_pass(kind, selection.clone(), &token).await;
            log::info!(
                "SyncController: pass finished (fatal={:?}, non-fatal={})",
                report.fatal,
                report.non_fatal.len()
            );

            if token.is_cancelled() {
                break report;
            }
            if let Some((next_kind, next_selection)) = self.state.lock().unwrap().rerun.take() {
                kind = next_kind;
                selection = next_selection;
                continue;
            }
            if auto_reruns >= MAX_AUTO_RERUNS {
                break report;
            }

            match (&report.fatal, report.non_fatal.is_empty()) {
                // Most likely stale version bookkeeping; a full sync repairs it
                (Some(SyncError::UploadObjectConflict), _)
                    if !(kind == SyncKind::Full && selection == LibrarySelection::All) =>
                {
                    kind = SyncKind::Full;
                    selection = LibrarySelection::All;
                    auto_reruns += 1;
                }
                // Connectivity comes back on its own; retry with backoff
                (Some(SyncError::NoInternetConnection), _) => {
                    let backoff = CONNECTIVITY_BACKOFF_SECS
                        [auto_reruns.min(CONNECTIVITY_BACKOFF_SECS.len() - 1)];
                    log::info!("SyncController: offline, retrying in {}s", backoff);
                    auto_reruns += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(backoff)) => {}
                        _ = token.cancelled() => break report,
                    }
                    kind = SyncKind::Retry;
                }
                (Some(_), _) => break report,
                (None, true) => break report,
                // Retry once; if the retry still fails, run one full sync
                (None, false) => match kind {
                    SyncKind::Retry => {
                        kind = SyncKind::Full;
                        selection = LibrarySelection::All;
                        auto_reruns += 1;
                    }
                    SyncKind::Full if selection == LibrarySelection::All => break report,
                    _ => {
                        kind = SyncKind::Retry;
                        auto_reruns += 1;
                    }
                },
            }
        };

        self.state.lock().unwrap().syncing = false;
        report
    }

    async fn run_pass(
        &self,
        kind: SyncKind,
        selection: LibrarySelection,
        token: &CancellationToken,
    ) -> SyncReport {
        let mut pass = Pass {
            kind,
            selection: selection.clone(),
            queue: VecDeque::new(),
            current_library: None,
            last_returned_version: None,
            non_fatal: Vec::new(),
            conflicts_pending: false,
            conflict_retries: 0,
            version_retried: HashSet::new(),
            access: AccessPermissions::default(),
            pending_delay: None,
        };

        pass.queue.push_back(Action::LoadPermissions);
        if selection_includes_groups(&selection) {
            pass.queue.push_back(Action::SyncGroupVersions);
        } else {
            pass.queue
                .push_back(Action::CreateLibraryActions(selection, CreateLibraryOptions::Automatic));
        }

        while let Some(action) = pass.queue.pop_front() {
            if token.is_cancelled() {
                return self.finish_pass(pass, Some(SyncError::Cancelled));
            }

            // Library change resets the mid-pass version check
            let library = action.library();
            if library != pass.current_library {
                pass.last_returned_version = None;
                pass.current_library = library;
            }

            log::debug!("SyncController: action {:?}", action);
            let result = tokio::select! {
                result = self.process(action, &mut pass) => result,
                _ = token.cancelled() => Err(SyncError::Cancelled),
            };
            if let Err(fatal) = result {
                return self.finish_pass(pass, Some(fatal));
            }
        }

        self.finish_pass(pass, None)
    }

    fn finish_pass(&self, pass: Pass, fatal: Option<SyncError>) -> SyncReport {
        SyncReport {
            fatal,
            non_fatal: pass.non_fatal,
            conflicts_pending: pass.conflicts_pending,
            scheduled: false,
        }
    }

    async fn process(&self, action: Action, pass: &mut Pass) -> Result<(), SyncError> {
        match action {
            Action::LoadPermissions => self.load_permissions(pass).await,
            Action::SyncGroupVersions => self.sync_group_versions(pass).await,
            Action::CreateLibraryActions(selection, options) => {
                self.create_library_actions(pass, selection, options)
            }
            Action::SyncVersions {
                library,
                object,
                since,
            } => self.sync_versions(pass, library, object, since).await,
            Action::SyncBatchToStore(batch) => self.sync_batch_to_store(pass, batch).await,
            Action::StoreVersion {
                library,
                target,
                version,
            } => self.store_version(pass, library, target, version),
            Action::SyncDeletions { library, since } => {
                self.sync_deletions(pass, library, since).await
            }
            Action::SyncSettings { library, since } => {
                self.sync_settings(pass, library, since).await
            }
            Action::SubmitWriteBatch(batch) => self.submit_write_batch(pass, batch).await,
            Action::SubmitDeleteBatch(batch) => self.submit_delete_batch(pass, batch).await,
            Action::ResolveDeletedGroup { group_id, name } => {
                self.resolve_conflict(pass, Conflict::GroupRemoved { group_id, name })
                    .await
            }
            Action::ResolveGroupWritePermission { group_id, name } => {
                self.resolve_conflict(pass, Conflict::GroupWriteDenied { group_id, name })
                    .await
            }
            Action::DeleteGroup(group_id) => {
                self.perform_store(vec![WriteRequest::DeleteGroup { group_id }])
            }
            Action::MarkGroupAsLocalOnly(group_id) => {
                self.perform_store(vec![WriteRequest::MarkGroupAsLocalOnly { group_id }])
            }
            Action::RevertLibraryToOriginal(library) => {
                let requests = vec![WriteRequest::RevertLibraryChanges { library }];
                self.perform_store(requests)?;
                // Discarded local state must be replaced by fresh remote data
                pass.queue.push_front(Action::CreateLibraryActions(
                    LibrarySelection::Specific(vec![library]),
                    CreateLibraryOptions::ForceDownloads,
                ));
                Ok(())
            }
            Action::MarkChangesAsResolved(library) => {
                self.perform_store(vec![WriteRequest::MarkChangesAsResolved { library }])
            }
            Action::ProcessAttachments(library) => self.process_attachments(pass, library).await,
            Action::SubmitWebDavDeletions(library) => {
                self.submit_webdav_deletions(pass, library).await
            }
        }
    }

    // ===== Permissions and groups =====

    async fn load_permissions(&self, pass: &mut Pass) -> Result<(), SyncError> {
        #[derive(Deserialize)]
        struct KeyResponse {
            access: Access,
        }
        #[derive(Deserialize)]
        struct Access {
            #[serde(default)]
            user: Permissions,
            #[serde(default)]
            groups: HashMap<String, Permissions>,
        }

        let request = self.api_request(HttpMethod::Get, format!("{}/keys/current", self.api_base));
        let response = self
            .api
            .send(request)
            .await
            .map_err(|_| SyncError::PermissionLoadingFailed)?;
        if !response.is_success() {
            return Err(SyncError::PermissionLoadingFailed);
        }
        let parsed: KeyResponse = response
            .json()
            .map_err(|_| SyncError::PermissionLoadingFailed)?;

        let mut access = AccessPermissions {
            user: parsed.access.user,
            group_default: None,
            groups: HashMap::new(),
        };
        for (key, permissions) in parsed.access.groups {
            if key == "all" {
                access.group_default = Some(permissions);
            } else if let Ok(group_id) = key.parse() {
                access.groups.insert(group_id, permissions);
            }
        }
        pass.access = access;
        Ok(())
    }

    async fn sync_group_versions(&self, pass: &mut Pass) -> Result<(), SyncError> {
        let request = self.api_request(
            HttpMethod::Get,
            format!("{}/users/{}/groups?format=versions", self.api_base, self.user_id),
        );
        let response = self
            .api
            .send(request)
            .await
            .map_err(|error| self.abort_error(&error).unwrap_or_else(|| SyncError::GroupSyncFailed(error.to_string())))?;
        if !response.is_success() {
            return Err(SyncError::GroupSyncFailed(format!(
                "status {}",
                response.status
            )));
        }
        let current_version = response.last_modified_version().unwrap_or(0);
        let remote: HashMap<String, i64> = response
            .json()
            .map_err(|error| SyncError::GroupSyncFailed(error.to_string()))?;
        let remote: HashMap<i64, i64> = remote
            .into_iter()
            .filter_map(|(id, version)| id.parse().ok().map(|id| (id, version)))
            .collect();

        let local = self
            .store
            .libraries(&LibrarySelection::All)
            .map_err(|error| SyncError::DbError(error.to_string()))?;

        // Remotely removed groups need a user decision before their data goes
        let mut actions: Vec<Action> = Vec::new();
        for info in &local {
            if let LibraryIdentifier::Group(group_id) = info.identifier {
                if !remote.contains_key(&group_id) {
                    actions.push(Action::ResolveDeletedGroup {
                        group_id,
                        name: info.name.clone(),
                    });
                }
            }
        }

        // Changed groups are fetched one by one
        let mut to_update: Vec<i64> = Vec::new();
        for (group_id, remote_version) in &remote {
            let relevant = match &pass.selection {
                LibrarySelection::All => true,
                LibrarySelection::Specific(identifiers) => identifiers
                    .contains(&LibraryIdentifier::Group(*group_id)),
            };
            if !relevant {
                continue;
            }
            let known = self
                .versions
                .read(LibraryIdentifier::Group(*group_id))
                .map(|versions| versions.max())
                .unwrap_or(0);
            if pass.kind == SyncKind::Full || *remote_version > known {
                to_update.push(*group_id);
            }
        }
        to_update.sort_unstable();
        let user_library = LibraryIdentifier::Custom(crate::library::CustomLibraryKind::MyLibrary);
        // Groups always sync one by one
        for group_id in &to_update {
            actions.push(Action::SyncBatchToStore(DownloadBatch {
                library: user_library,
                object: SyncObject::Group,
                keys: vec![group_id.to_string()],
                version: current_version,
            }));
        }
        actions.push(Action::CreateLibraryActions(
            pass.selection.clone(),
            CreateLibraryOptions::Automatic,
        ));

        for action in actions.into_iter().rev() {
            pass.queue.push_front(action);
        }
        Ok(())
    }

    // ===== Library planning =====

    fn create_library_actions(
        &self,
        pass: &mut Pass,
        selection: LibrarySelection,
        options: CreateLibraryOptions,
    ) -> Result<(), SyncError> {
        let infos = self
            .store
            .libraries(&selection)
            .map_err(|error| SyncError::AllLibrariesFetchFailed(error.to_string()))?;

        let mut actions: Vec<Action> = Vec::new();
        for info in infos {
            if let LibraryIdentifier::Group(group_id) = info.identifier {
                if pass.access.group(group_id).is_none() {
                    log::warn!("SyncController: no permissions for group {}, skipping", group_id);
                    pass.non_fatal
                        .push(SyncError::MissingGroupPermissions(group_id));
                    continue;
                }
            }

            let versions = self
                .versions
                .read(info.identifier)
                .map_err(|error| SyncError::DbError(error.to_string()))?;

            let data = self
                .build_library_data(&info, versions)
                .map_err(|error| SyncError::DbError(error.to_string()))?;

            match options {
                CreateLibraryOptions::ForceDownloads => {
                    actions.extend(self.download_actions(&data, pass.kind));
                }
                CreateLibraryOptions::OnlyWrites | CreateLibraryOptions::Automatic => {
                    if !data.updates.is_empty() || !data.deletions.is_empty() {
                        let write_allowed = match data.identifier {
                            LibraryIdentifier::Group(group_id) => {
                                data.can_edit_metadata
                                    && pass
                                        .access
                                        .group(group_id)
                                        .map(|permissions| permissions.write)
                                        .unwrap_or(false)
                            }
                            LibraryIdentifier::Custom(_) => true,
                        };
                        if write_allowed {
                            // Deletions first so a freed key slot can be
                            // reused by a following write
                            for batch in &data.deletions {
                                actions.push(Action::SubmitDeleteBatch(batch.clone()));
                            }
                            for batch in &data.updates {
                                actions.push(Action::SubmitWriteBatch(batch.clone()));
                            }
                            actions.push(Action::ProcessAttachments(data.identifier));
                            if data.has_webdav_deletions {
                                actions.push(Action::SubmitWebDavDeletions(data.identifier));
                            }
                        } else if let LibraryIdentifier::Group(group_id) = data.identifier {
                            actions.push(Action::ResolveGroupWritePermission {
                                group_id,
                                name: data.name.clone(),
                            });
                        }
                    } else if options == CreateLibraryOptions::Automatic {
                        actions.extend(self.download_actions(&data, pass.kind));
                    }
                }
            }
        }

        // Forced downloads and writes are follow-ups of the running action
        // and go to the queue front; automatic planning appends
        match options {
            CreateLibraryOptions::Automatic => pass.queue.extend(actions),
            _ => {
                for action in actions.into_iter().rev() {
                    pass.queue.push_front(action);
                }
            }
        }
        Ok(())
    }

    fn build_library_data(
        &self,
        info: &crate::store::LibraryInfo,
        versions: Versions,
    ) -> Result<LibraryData, StoreError> {
        let updates: Vec<DirtyObject> = self.store.updates(info.identifier)?;
        let deletions = self.store.deletions(info.identifier)?;
        let has_upload = !self.store.pending_uploads(info.identifier)?.is_empty();
        let has_webdav_deletions = info.file_sync_kind == FileSyncKind::WebDav
            && !self.store.pending_file_deletions(info.identifier)?.is_empty();

        Ok(LibraryData {
            identifier: info.identifier,
            name: info.name.clone(),
            versions,
            can_edit_metadata: info.can_edit_metadata,
            can_edit_files: info.can_edit_files,
            updates: write_batches(info.identifier, &versions, &updates),
            deletions: delete_batches(info.identifier, &versions, &deletions),
            has_upload,
            has_webdav_deletions,
            file_sync_kind: info.file_sync_kind,
        })
    }

    fn download_actions(&self, data: &LibraryData, kind: SyncKind) -> Vec<Action> {
        let since = |version: i64| {
            if kind == SyncKind::Full || version == 0 {
                None
            } else {
                Some(version)
            }
        };
        let library = data.identifier;
        vec![
            Action::SyncSettings {
                library,
                since: since(data.versions.settings),
            },
            Action::SyncVersions {
                library,
                object: SyncObject::Collection,
                since: since(data.versions.collections),
            },
            Action::SyncVersions {
                library,
                object: SyncObject::Search,
                since: since(data.versions.searches),
            },
            Action::SyncVersions {
                library,
                object: SyncObject::Item,
                since: since(data.versions.items),
            },
            Action::SyncVersions {
                library,
                object: SyncObject::Trash,
                since: since(data.versions.trash),
            },
            Action::SyncDeletions {
                library,
                since: data.versions.deletions,
            },
            Action::ProcessAttachments(library),
        ]
    }

    // ===== Downloads =====

    async fn sync_versions(
        &self,
        pass: &mut Pass,
        library: LibraryIdentifier,
        object: SyncObject,
        since: Option<i64>,
    ) -> Result<(), SyncError> {
        let trash_flag = match object {
            SyncObject::Trash => "&trash=1",
            SyncObject::Item => "&trash=0",
            _ => "",
        };
        let mut url = format!(
            "{}/{}/{}?format=versions{}",
            self.api_base,
            library.api_path(self.user_id),
            object.api_component(),
            trash_flag
        );
        if let Some(since) = since {
            url.push_str(&format!("&since={}", since));
        }
        let mut request = self.api_request(HttpMethod::Get, url);
        if let Some(since) = since {
            request = request.header("If-Modified-Since-Version", since.to_string());
        }

        let response = match self.send_non_fatal(pass, request, library).await? {
            Some(response) => response,
            None => return Ok(()),
        };

        if response.status == STATUS_NOT_MODIFIED {
            self.remove_download_actions(pass, library);
            return Ok(());
        }
        if !response.is_success() {
            pass.non_fatal
                .push(SyncError::ApiError(format!("versions fetch: status {}", response.status)));
            return Ok(());
        }

        let current_version = response.last_modified_version().unwrap_or(0);
        if let Some(last) = pass.last_returned_version {
            if last != current_version {
                // The library changed on the service between object syncs;
                // retry it once from scratch, skip it otherwise
                log::warn!(
                    "SyncController: version mismatch in {} ({} != {})",
                    library,
                    last,
                    current_version
                );
                self.remove_library_actions(pass, library);
                if pass.version_retried.insert(library) {
                    pass.queue.push_front(Action::CreateLibraryActions(
                        LibrarySelection::Specific(vec![library]),
                        CreateLibraryOptions::Automatic,
                    ));
                } else {
                    pass.non_fatal.push(SyncError::VersionMismatch(library));
                }
                return Ok(());
            }
        }
        pass.last_returned_version = Some(current_version);

        let versions: HashMap<String, i64> = response
            .json()
            .map_err(|error| SyncError::ApiError(error.to_string()))?;
        let mut keys: Vec<String> = versions.into_keys().collect();
        keys.sort_unstable();

        let mut actions: Vec<Action> = download_batches(library, object, &keys, current_version)
            .into_iter()
            .map(Action::SyncBatchToStore)
            .collect();
        if !actions.is_empty() {
            actions.push(Action::StoreVersion {
                library,
                target: VersionTarget::Object(object),
                version: current_version,
            });
        }
        for action in actions.into_iter().rev() {
            pass.queue.push_front(action);
        }
        Ok(())
    }

    async fn sync_batch_to_store(
        &self,
        pass: &mut Pass,
        batch: DownloadBatch,
    ) -> Result<(), SyncError> {
        let url = match batch.object {
            SyncObject::Group => {
                // Groups sync one at a time
                format!("{}/groups/{}", self.api_base, batch.keys.join(","))
            }
            _ => format!(
                "{}/{}/{}?format=json&{}Key={}",
                self.api_base,
                batch.library.api_path(self.user_id),
                batch.object.api_component(),
                key_parameter(batch.object),
                batch.keys.join(",")
            ),
        };
        let request = self.api_request(HttpMethod::Get, url);

        let response = match self.send_non_fatal(pass, request, batch.library).await? {
            Some(response) => response,
            None => return Ok(()),
        };

        if !response.is_success() {
            // The whole batch failed; mark for resync and keep going
            log::error!(
                "SyncController: batch fetch failed with {} for {} {}",
                response.status,
                batch.library,
                batch.object
            );
            self.perform_store(
                vec![WriteRequest::MarkForResync {
                    library: batch.library,
                    object: batch.object,
                    keys: batch.keys.clone(),
                }],
            )?;
            pass.non_fatal
                .push(SyncError::ApiError(format!("batch fetch: status {}", response.status)));
            return Ok(());
        }

        let payloads: Vec<serde_json::Value> = match batch.object {
            SyncObject::Group => vec![response
                .json()
                .map_err(|error| SyncError::ApiError(error.to_string()))?],
            _ => response
                .json()
                .map_err(|error| SyncError::ApiError(error.to_string()))?,
        };

        // Objects the payload didn't cover failed server-side decoding or
        // were deleted concurrently; they are retried next pass
        let received: HashSet<String> = payloads
            .iter()
            .filter_map(|payload| payload.get("key").or_else(|| payload.get("id")))
            .filter_map(|key| match key {
                serde_json::Value::String(key) => Some(key.clone()),
                serde_json::Value::Number(id) => Some(id.to_string()),
                _ => None,
            })
            .collect();
        let failed: Vec<String> = batch
            .keys
            .iter()
            .filter(|key| !received.contains(*key))
            .cloned()
            .collect();

        let mut requests = vec![WriteRequest::StoreObjects {
            library: batch.library,
            object: batch.object,
            payloads,
        }];
        if !failed.is_empty() {
            log::warn!(
                "SyncController: {} objects missing from batch response, marking for resync",
                failed.len()
            );
            requests.push(WriteRequest::MarkForResync {
                library: batch.library,
                object: batch.object,
                keys: failed,
            });
        }
        self.perform_store(requests)?;
        Ok(())
    }

    fn store_version(
        &self,
        pass: &mut Pass,
        library: LibraryIdentifier,
        target: VersionTarget,
        version: i64,
    ) -> Result<(), SyncError> {
        match self.versions.update(library, target, version) {
            Ok(()) => Ok(()),
            Err(VersionStoreError::Regression { .. }) => {
                // The service reported an older version than we stored:
                // server-side data loss. Reset and re-download the library.
                log::error!(
                    "SyncController: version regression in {}, forcing full resync",
                    library
                );
                self.versions
                    .reset(library)
                    .map_err(|error| SyncError::DbError(error.to_string()))?;
                self.remove_library_actions(pass, library);
                if pass.version_retried.insert(library) {
                    pass.queue.push_front(Action::CreateLibraryActions(
                        LibrarySelection::Specific(vec![library]),
                        CreateLibraryOptions::ForceDownloads,
                    ));
                } else {
                    pass.non_fatal.push(SyncError::VersionMismatch(library));
                }
                Ok(())
            }
            Err(VersionStoreError::Store(error)) => Err(SyncError::DbError(error.to_string())),
        }
    }

    async fn sync_deletions(
        &self,
        pass: &mut Pass,
        library: LibraryIdentifier,
        since: i64,
    ) -> Result<(), SyncError> {
        #[derive(Deserialize, Default)]
        struct Deletions {
            #[serde(default)]
            collections: Vec<String>,
            #[serde(default)]
            searches: Vec<String>,
            #[serde(default)]
            items: Vec<String>,
            #[serde(default)]
            #[allow(dead_code)]
            tags: Vec<String>,
        }

        let request = self
            .api_request(
                HttpMethod::Get,
                format!(
                    "{}/{}/deleted?since={}",
                    self.api_base,
                    library.api_path(self.user_id),
                    since
                ),
            )
            .header("If-Modified-Since-Version", since.to_string());

        let response = match self.send_non_fatal(pass, request, library).await? {
            Some(response) => response,
            None => return Ok(()),
        };
        if response.status == STATUS_NOT_MODIFIED {
            return Ok(());
        }
        if !response.is_success() {
            pass.non_fatal
                .push(SyncError::ApiError(format!("deletions fetch: status {}", response.status)));
            return Ok(());
        }

        let version = response.last_modified_version().unwrap_or(since);
        let deletions: Deletions = response
            .json()
            .map_err(|error| SyncError::ApiError(error.to_string()))?;

        // Every UI surface showing a doomed object gets a veto before the
        // local copy goes away
        let outcome = self
            .conflicts
            .resolve_remote_deletions(library, deletions.collections, deletions.items)
            .await;

        let mut requests = Vec::new();
        if !outcome.delete_collections.is_empty() {
            requests.push(WriteRequest::DeleteObjects {
                library,
                object: SyncObject::Collection,
                keys: outcome.delete_collections,
            });
        }
        if !outcome.restore_collections.is_empty() {
            requests.push(WriteRequest::RestoreObjects {
                library,
                object: SyncObject::Collection,
                keys: outcome.restore_collections,
            });
        }
        if !outcome.delete_items.is_empty() {
            requests.push(WriteRequest::DeleteObjects {
                library,
                object: SyncObject::Item,
                keys: outcome.delete_items,
            });
        }
        if !outcome.restore_items.is_empty() {
            requests.push(WriteRequest::RestoreObjects {
                library,
                object: SyncObject::Item,
                keys: outcome.restore_items,
            });
        }
        if !deletions.searches.is_empty() {
            requests.push(WriteRequest::DeleteObjects {
                library,
                object: SyncObject::Search,
                keys: deletions.searches,
            });
        }
        requests.push(WriteRequest::StoreVersion {
            library,
            target: VersionTarget::Deletions,
            version,
        });
        self.perform_store(requests)?;
        Ok(())
    }

    async fn sync_settings(
        &self,
        pass: &mut Pass,
        library: LibraryIdentifier,
        since: Option<i64>,
    ) -> Result<(), SyncError> {
        let mut url = format!("{}/{}/settings", self.api_base, library.api_path(self.user_id));
        if let Some(since) = since {
            url.push_str(&format!("?since={}", since));
        }
        let mut request = self.api_request(HttpMethod::Get, url);
        if let Some(since) = since {
            request = request.header("If-Modified-Since-Version", since.to_string());
        }

        let response = match self.send_non_fatal(pass, request, library).await? {
            Some(response) => response,
            None => return Ok(()),
        };
        if response.status == STATUS_NOT_MODIFIED {
            self.remove_download_actions(pass, library);
            return Ok(());
        }
        if !response.is_success() {
            pass.non_fatal
                .push(SyncError::ApiError(format!("settings fetch: status {}", response.status)));
            return Ok(());
        }

        let version = response.last_modified_version().unwrap_or(0);
        let payload: serde_json::Value = response
            .json()
            .map_err(|error| SyncError::ApiError(error.to_string()))?;
        let changed = payload.as_object().map(|map| !map.is_empty()).unwrap_or(false);
        if changed {
            self.perform_store(
                vec![WriteRequest::StoreSettings {
                    library,
                    payload,
                    version,
                }],
            )?;
        }
        Ok(())
    }

    // ===== Writes =====

    async fn submit_write_batch(&self, pass: &mut Pass, batch: WriteBatch) -> Result<(), SyncError> {
        let url = format!(
            "{}/{}/{}",
            self.api_base,
            batch.library.api_path(self.user_id),
            batch.object.api_component()
        );
        let request = self
            .api_request(HttpMethod::Post, url)
            .header("If-Unmodified-Since-Version", batch.version.to_string())
            .body(RequestBody::Json(serde_json::Value::Array(
                batch.parameters.clone(),
            )));

        let response = match self.send_non_fatal(pass, request, batch.library).await? {
            Some(response) => response,
            None => return Ok(()),
        };

        if response.status == STATUS_PRECONDITION_FAILED {
            return self.handle_precondition_failure(pass, &response, batch.library);
        }
        if !response.is_success() {
            pass.non_fatal
                .push(SyncError::ApiError(format!("write submit: status {}", response.status)));
            return Ok(());
        }

        let new_version = response.last_modified_version().unwrap_or(batch.version);
        self.perform_store(
            vec![WriteRequest::MarkSynced {
                library: batch.library,
                object: batch.object,
                keys: batch.keys(),
                version: new_version,
            }],
        )?;
        self.update_version_in_next_batch(pass, batch.library, new_version);
        Ok(())
    }

    async fn submit_delete_batch(&self, pass: &mut Pass, batch: DeleteBatch) -> Result<(), SyncError> {
        let url = format!(
            "{}/{}/{}?{}Key={}",
            self.api_base,
            batch.library.api_path(self.user_id),
            batch.object.api_component(),
            key_parameter(batch.object),
            batch.keys.join(",")
        );
        let request = self
            .api_request(HttpMethod::Delete, url)
            .header("If-Unmodified-Since-Version", batch.version.to_string());

        let response = match self.send_non_fatal(pass, request, batch.library).await? {
            Some(response) => response,
            None => return Ok(()),
        };

        if response.status == STATUS_PRECONDITION_FAILED {
            return self.handle_precondition_failure(pass, &response, batch.library);
        }
        if !response.is_success() {
            pass.non_fatal
                .push(SyncError::ApiError(format!("delete submit: status {}", response.status)));
            return Ok(());
        }

        let new_version = response.last_modified_version().unwrap_or(batch.version);
        self.perform_store(
            vec![
                WriteRequest::DeleteObjects {
                    library: batch.library,
                    object: batch.object,
                    keys: batch.keys.clone(),
                },
                WriteRequest::StoreVersion {
                    library: batch.library,
                    target: VersionTarget::Object(batch.object),
                    version: new_version,
                },
            ],
        )?;
        self.update_version_in_next_batch(pass, batch.library, new_version);
        Ok(())
    }

    fn handle_precondition_failure(
        &self,
        pass: &mut Pass,
        response: &ApiResponse,
        library: LibraryIdentifier,
    ) -> Result<(), SyncError> {
        match response.precondition {
            Some(PreconditionKind::ObjectConflict) => {
                // A single object's version failed validation while the
                // library version passed; local bookkeeping is stale
                Err(SyncError::UploadObjectConflict)
            }
            Some(PreconditionKind::LibraryConflict) | None => {
                // The service has newer data. Drop the remaining write
                // actions (remote changes may invalidate them), pull the
                // library, then try the writes again.
                let delay = self
                    .conflict_delays
                    .get(pass.conflict_retries.min(self.conflict_delays.len().saturating_sub(1)))
                    .copied()
                    .unwrap_or(0);
                pass.conflict_retries += 1;
                log::info!(
                    "SyncController: library conflict in {}, retrying after {}s",
                    library,
                    delay
                );

                self.remove_library_actions(pass, library);
                pass.queue.push_front(Action::CreateLibraryActions(
                    LibrarySelection::Specific(vec![library]),
                    CreateLibraryOptions::OnlyWrites,
                ));
                pass.queue.push_front(Action::CreateLibraryActions(
                    LibrarySelection::Specific(vec![library]),
                    CreateLibraryOptions::ForceDownloads,
                ));
                if delay > 0 {
                    // Waiting here keeps the pass sequential; the next queued
                    // action runs after the delay
                    let delay = std::time::Duration::from_secs(delay);
                    pass.pending_delay = Some(delay);
                }
                Ok(())
            }
        }
    }

    // ===== Conflict resolution =====

    async fn resolve_conflict(&self, pass: &mut Pass, conflict: Conflict) -> Result<(), SyncError> {
        if !self.conflicts.has_presenter() {
            // No UI attached (e.g. logged-out background sync): pause the
            // conflict instead of blocking or crashing
            log::warn!("SyncController: no conflict presenter, deferring {:?}", conflict);
            pass.conflicts_pending = true;
            return Ok(());
        }

        match self.conflicts.present(conflict).await {
            Some(ConflictResolution::DeleteGroup(group_id)) => {
                pass.queue.push_front(Action::DeleteGroup(group_id));
            }
            Some(ConflictResolution::MarkGroupAsLocalOnly(group_id)) => {
                pass.queue.push_front(Action::MarkGroupAsLocalOnly(group_id));
            }
            Some(ConflictResolution::RevertLibraryToOriginal(library)) => {
                pass.queue.push_front(Action::RevertLibraryToOriginal(library));
            }
            Some(ConflictResolution::MarkChangesAsResolved(library)) => {
                pass.queue.push_front(Action::MarkChangesAsResolved(library));
            }
            None => {
                pass.conflicts_pending = true;
            }
        }
        Ok(())
    }

    // ===== Attachments =====

    async fn process_attachments(
        &self,
        pass: &mut Pass,
        library: LibraryIdentifier,
    ) -> Result<(), SyncError> {
        // Incoming payloads
        if let Some(downloader) = &self.downloader {
            match self.store.attachments_needing_download(library) {
                Ok(attachments) if !attachments.is_empty() => {
                    log::info!(
                        "SyncController: queueing {} attachment downloads for {}",
                        attachments.len(),
                        library
                    );
                    downloader.batch_download(&attachments);
                }
                Ok(_) => {}
                Err(error) => pass.non_fatal.push(SyncError::DbError(error.to_string())),
            }
        }

        // Outgoing payloads
        let Some(uploader) = &self.uploader else {
            return Ok(());
        };
        let uploads = match self.store.pending_uploads(library) {
            Ok(uploads) => uploads,
            Err(error) => {
                pass.non_fatal.push(SyncError::DbError(error.to_string()));
                return Ok(());
            }
        };
        if uploads.is_empty() {
            return Ok(());
        }

        let info = self
            .store
            .libraries(&LibrarySelection::Specific(vec![library]))
            .ok()
            .and_then(|infos| infos.into_iter().next());
        let file_sync_kind = info.map(|info| info.file_sync_kind).unwrap_or_default();
        let ongoing = uploader.ongoing_upload_md5s();

        for upload in uploads {
            if ongoing.contains(&upload.md5) {
                log::debug!("SyncController: upload {} already in flight", upload.key);
                continue;
            }
            let use_webdav = file_sync_kind == FileSyncKind::WebDav && !library.is_group();
            let result = match self.webdav.as_ref().filter(|_| use_webdav) {
                Some(webdav) => self.start_webdav_upload(uploader, webdav, &upload).await,
                None => self.start_vendor_upload(uploader, &upload).await,
            };
            if let Err(error) = result {
                log::error!("SyncController: can't start upload {} - {}", upload.key, error);
                pass.non_fatal.push(error);
            }
        }
        Ok(())
    }

    async fn start_webdav_upload(
        &self,
        uploader: &Arc<BackgroundUploadCoordinator>,
        webdav: &Arc<WebDavClient>,
        upload: &crate::library::AttachmentUpload,
    ) -> Result<(), SyncError> {
        match webdav
            .prepare_upload(upload)
            .await
            .map_err(|error| SyncError::ApiError(error.to_string()))?
        {
            UploadPreparation::Exists => {
                self.store
                    .perform(WriteRequest::MarkAttachmentUploaded {
                        library: upload.library_id,
                        key: upload.key.clone(),
                    })
                    .map_err(|error| SyncError::DbError(error.to_string()))?;
                Ok(())
            }
            UploadPreparation::New { url } => {
                let remote_url = format!("{}{}.bin", url, upload.key);
                let size = std::fs::metadata(&upload.file).map(|meta| meta.len()).unwrap_or(0);
                let descriptor = BackgroundUpload {
                    kind: BackgroundUploadKind::WebDav { mtime: upload.mtime },
                    key: upload.key.clone(),
                    library_id: upload.library_id,
                    user_id: self.user_id,
                    remote_url: remote_url.clone(),
                    file_url: upload.file.clone(),
                    md5: upload.md5.clone(),
                    session_id: String::new(),
                    date: chrono::Utc::now(),
                    size,
                };
                let request = UploadRequest {
                    url: remote_url,
                    headers: Vec::new(),
                    parameters: Vec::new(),
                    filename: upload.filename.clone(),
                    mime_type: upload.content_type.clone(),
                };
                uploader
                    .start(descriptor, request)
                    .await
                    .map_err(|error| SyncError::ApiError(error.to_string()))?;
                Ok(())
            }
        }
    }

    async fn start_vendor_upload(
        &self,
        uploader: &Arc<BackgroundUploadCoordinator>,
        upload: &crate::library::AttachmentUpload,
    ) -> Result<(), SyncError> {
        #[derive(Deserialize)]
        struct Authorization {
            #[serde(default)]
            exists: i64,
            #[serde(default)]
            url: String,
            #[serde(default, rename = "uploadKey")]
            upload_key: String,
            #[serde(default)]
            params: HashMap<String, String>,
        }

        let size = std::fs::metadata(&upload.file).map(|meta| meta.len()).unwrap_or(0);
        let mut form = vec![
            ("filename".to_string(), upload.filename.clone()),
            ("filesize".to_string(), size.to_string()),
            ("md5".to_string(), upload.md5.clone()),
            ("mtime".to_string(), upload.mtime.to_string()),
        ];
        if upload.old_md5.is_none() {
            form.push(("params".to_string(), "1".to_string()));
        }
        let mut request = self
            .api_request(
                HttpMethod::Post,
                format!(
                    "{}/{}/items/{}/file",
                    self.api_base,
                    upload.library_id.api_path(self.user_id),
                    upload.key
                ),
            )
            .body(RequestBody::Form(form));
        request = match &upload.old_md5 {
            Some(old_md5) => request.header("If-Match", old_md5.clone()),
            None => request.header("If-None-Match", "*"),
        };

        let response = self
            .api
            .send(request)
            .await
            .map_err(|error| SyncError::ApiError(error.to_string()))?;
        if response.status == STATUS_PRECONDITION_FAILED {
            return Err(SyncError::UploadObjectConflict);
        }
        if !response.is_success() {
            return Err(SyncError::ApiError(format!(
                "upload authorization: status {}",
                response.status
            )));
        }
        let authorization: Authorization = response
            .json()
            .map_err(|error| SyncError::ApiError(error.to_string()))?;

        if authorization.exists == 1 {
            self.store
                .perform(WriteRequest::MarkAttachmentUploaded {
                    library: upload.library_id,
                    key: upload.key.clone(),
                })
                .map_err(|error| SyncError::DbError(error.to_string()))?;
            return Ok(());
        }

        let descriptor = BackgroundUpload {
            kind: BackgroundUploadKind::Vendor {
                upload_key: authorization.upload_key,
            },
            key: upload.key.clone(),
            library_id: upload.library_id,
            user_id: self.user_id,
            remote_url: authorization.url.clone(),
            file_url: upload.file.clone(),
            md5: upload.md5.clone(),
            session_id: String::new(),
            date: chrono::Utc::now(),
            size,
        };
        let request = UploadRequest {
            url: authorization.url,
            headers: Vec::new(),
            parameters: authorization.params.into_iter().collect(),
            filename: upload.filename.clone(),
            mime_type: upload.content_type.clone(),
        };
        uploader
            .start(descriptor, request)
            .await
            .map_err(|error| SyncError::ApiError(error.to_string()))?;
        Ok(())
    }

    async fn submit_webdav_deletions(
        &self,
        pass: &mut Pass,
        library: LibraryIdentifier,
    ) -> Result<(), SyncError> {
        let Some(webdav) = &self.webdav else {
            return Ok(());
        };
        let keys = match self.store.pending_file_deletions(library) {
            Ok(keys) => keys,
            Err(error) => {
                pass.non_fatal.push(SyncError::DbError(error.to_string()));
                return Ok(());
            }
        };
        if keys.is_empty() {
            return Ok(());
        }

        match webdav.delete_files(&keys).await {
            Ok(result) => {
                // Missing counts as done: the goal state is "file gone"
                let mut done: Vec<String> = result.succeeded.into_iter().collect();
                done.extend(result.missing);
                if !done.is_empty() {
                    self.perform_store(
                        vec![WriteRequest::MarkFileDeletionsSynced {
                            library,
                            keys: done,
                        }],
                    )?;
                }
                if !result.failed.is_empty() {
                    pass.non_fatal.push(SyncError::ApiError(format!(
                        "webdav deletions failed for {} files",
                        result.failed.len()
                    )));
                }
            }
            Err(error) => {
                pass.non_fatal.push(SyncError::ApiError(error.to_string()));
            }
        }
        Ok(())
    }

    // ===== Helpers =====

    fn api_request(&self, method: HttpMethod, url: String) -> ApiRequest {
        let mut request = ApiRequest::new(method, url);
        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }
        request
    }

    /// Send a request, converting transport errors into either a fatal abort
    /// or a recorded non-fatal error (`None` means "skip this action").
    async fn send_non_fatal(
        &self,
        pass: &mut Pass,
        request: ApiRequest,
        library: LibraryIdentifier,
    ) -> Result<Option<ApiResponse>, SyncError> {
        if let Some(delay) = pass.pending_delay.take() {
            tokio::time::sleep(delay).await;
        }
        match self.api.send(request).await {
            Ok(response) => Ok(Some(response)),
            Err(error) => {
                if let Some(fatal) = self.abort_error(&error) {
                    return Err(fatal);
                }
                log::error!("SyncController: request failed for {} - {}", library, error);
                pass.non_fatal.push(SyncError::ApiError(error.to_string()));
                Ok(None)
            }
        }
    }

    /// Errors no amount of continuing can fix abort the whole pass.
    fn abort_error(&self, error: &ApiError) -> Option<SyncError> {
        match error {
            ApiError::NoConnection => Some(SyncError::NoInternetConnection),
            ApiError::InvalidUrl(url) => Some(SyncError::ApiError(url.clone())),
            _ => None,
        }
    }

    fn perform_store(&self, requests: Vec<WriteRequest>) -> Result<(), SyncError> {
        self.store
            .perform_all(requests)
            .map_err(|error| SyncError::DbError(error.to_string()))
    }

    fn remove_library_actions(&self, pass: &mut Pass, library: LibraryIdentifier) {
        pass.queue.retain(|action| action.library() != Some(library));
    }

    fn remove_download_actions(&self, pass: &mut Pass, library: LibraryIdentifier) {
        pass.queue
            .retain(|action| action.library() != Some(library) || !action.is_download_phase());
    }

    /// Stamp the server-returned version onto the next queued batch for the
    /// same library, so consecutive submissions carry a valid precondition.
    fn update_version_in_next_batch(
        &self,
        pass: &mut Pass,
        library: LibraryIdentifier,
        version: i64,
    ) {
        for action in pass.queue.iter_mut() {
            match action {
                Action::SubmitWriteBatch(batch) if batch.library == library => {
                    *batch = batch.copy_with_version(version);
                    return;
                }
                Action::SubmitDeleteBatch(batch) if batch.library == library => {
                    *batch = batch.copy_with_version(version);
                    return;
                }
                _ => continue,
            }
        }
    }
}

fn selection_includes_groups(selection: &LibrarySelection) -> bool {
    match selection {
        LibrarySelection::All => true,
        LibrarySelection::Specific(identifiers) => {
            identifiers.iter().any(LibraryIdentifier::is_group)
        }
    }
}

fn key_parameter(object: SyncObject) -> &'static str {
    match object {
        SyncObject::Collection => "collection",
        SyncObject::Search => "search",
        SyncObject::Item | SyncObject::Trash => "item",
        SyncObject::Tag => "tag",
        SyncObject::Group => "group",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{response, user_library, MemoryStore, ResponseExt, ScriptedApiClient};
    use async_trait::async_trait;
    use std::time::Duration;

    const ACCESS_USER_ONLY: &[u8] =
        br#"{"access":{"user":{"library":true,"files":true,"write":true},"groups":{}}}"#;
    const ACCESS_WITH_GROUPS: &[u8] = br#"{"access":{"user":{"library":true,"files":true,"write":true},"groups":{"all":{"library":true,"files":true,"write":true}}}}"#;

    fn controller(
        api: Arc<ScriptedApiClient>,
        store: Arc<MemoryStore>,
        conflicts: Arc<ConflictResolver>,
    ) -> SyncController {
        SyncController::new(
            77,
            "https://api.example.com".to_string(),
            Some("token".to_string()),
            api,
            store,
            conflicts,
            None,
            None,
            None,
            vec![0],
        )
    }

    fn dirty_item(key: &str) -> DirtyObject {
        DirtyObject {
            object: SyncObject::Item,
            key: key.to_string(),
            parameters: serde_json::json!({ "key": key, "title": "Paper", "version": 0 }),
        }
    }

    fn synced_versions() -> Versions {
        Versions {
            collections: 1,
            items: 3,
            trash: 1,
            searches: 1,
            deletions: 1,
            settings: 1,
        }
    }

    fn user_selection() -> LibrarySelection {
        LibrarySelection::Specific(vec![user_library()])
    }

    #[tokio::test]
    async fn object_conflict_412_triggers_full_resync_which_succeeds() {
        let api = Arc::new(ScriptedApiClient::new());
        let store = Arc::new(MemoryStore::new());
        store.add_update(user_library(), dirty_item("KEYA0001"));
        store.set_versions(user_library(), synced_versions());
        let controller = controller(api.clone(), store.clone(), Arc::new(ConflictResolver::new()));

        // First pass: the write hits a 412 whose payload names the object
        api.push_response(response(200, ACCESS_USER_ONLY));
        api.push_response(response(
            412,
            br#"{"successful":{},"failed":{"0":{"key":"KEYA0001","code":412}}}"#,
        ));
        // Automatic full sync: permissions, group versions, then the rewrite
        api.push_response(response(200, ACCESS_USER_ONLY));
        api.push_response(response(200, b"{}").with_header("last-modified-version", "5"));
        api.push_response(response(200, b"{}").with_header("last-modified-version", "10"));

        let report = controller.sync(SyncKind::Normal, user_selection()).await;

        assert_eq!(report.fatal, None);
        assert!(report.non_fatal.is_empty());
        assert_eq!(store.synced_keys(), vec!["KEYA0001".to_string()]);
        assert_eq!(
            api.recorded_methods(),
            vec![
                HttpMethod::Get,  // permissions
                HttpMethod::Post, // write, rejected with object conflict
                HttpMethod::Get,  // permissions (full sync)
                HttpMethod::Get,  // group versions
                HttpMethod::Post, // write, accepted
            ]
        );
    }

    #[tokio::test]
    async fn bare_412_pulls_the_library_and_retries_the_writes() {
        let api = Arc::new(ScriptedApiClient::new());
        let store = Arc::new(MemoryStore::new());
        store.add_update(user_library(), dirty_item("KEYB0001"));
        store.set_versions(user_library(), synced_versions());
        let controller = controller(api.clone(), store.clone(), Arc::new(ConflictResolver::new()));

        api.push_response(response(200, ACCESS_USER_ONLY));
        // Library-wide precondition failure, no object payload
        api.push_response(response(412, b""));
        // Forced download phase: the library is unchanged, so one 304 ends it
        api.push_response(response(304, b""));
        // Rewrite succeeds
        api.push_response(response(200, b"{}").with_header("last-modified-version", "12"));

        let report = controller.sync(SyncKind::Normal, user_selection()).await;

        assert_eq!(report.fatal, None);
        assert_eq!(store.synced_keys(), vec!["KEYB0001".to_string()]);
        let urls = api.recorded_urls();
        assert_eq!(urls.len(), 4);
        // The forced pull started with the settings probe
        assert!(urls[2].contains("/settings"));
        assert_eq!(store.versions(user_library()).unwrap().items, 12);
    }

    #[tokio::test]
    async fn cancellation_discards_the_in_flight_batch() {
        let api = Arc::new(ScriptedApiClient::new());
        let store = Arc::new(MemoryStore::new());
        for index in 0..60 {
            store.add_update(user_library(), dirty_item(&format!("KEYC{:04}", index)));
        }
        store.set_versions(user_library(), synced_versions());
        let controller = Arc::new(controller(
            api.clone(),
            store.clone(),
            Arc::new(ConflictResolver::new()),
        ));

        api.set_send_delay(Duration::from_millis(100));
        api.push_response(response(200, ACCESS_USER_ONLY));
        api.push_response(response(200, b"{}").with_header("last-modified-version", "9"));
        api.push_response(response(200, b"{}").with_header("last-modified-version", "9"));

        let handle = tokio::spawn({
            let controller = controller.clone();
            async move { controller.sync(SyncKind::Normal, user_selection()).await }
        });
        // Cancel while the first write batch is in flight
        tokio::time::sleep(Duration::from_millis(150)).await;
        controller.cancel();
        let report = handle.await.unwrap();

        assert_eq!(report.fatal, Some(SyncError::Cancelled));
        // The abandoned batch was not applied: nothing is marked synced
        assert!(store.synced_keys().is_empty());
        assert!(api.request_count() <= 2);
    }

    #[tokio::test]
    async fn unchanged_library_skips_its_remaining_downloads() {
        let api = Arc::new(ScriptedApiClient::new());
        let store = Arc::new(MemoryStore::new());
        store.set_versions(user_library(), synced_versions());
        let controller = controller(api.clone(), store.clone(), Arc::new(ConflictResolver::new()));

        api.push_response(response(200, ACCESS_USER_ONLY));
        api.push_response(response(304, b""));

        let report = controller.sync(SyncKind::Normal, user_selection()).await;

        assert_eq!(report.fatal, None);
        assert!(report.non_fatal.is_empty());
        // Permissions + settings probe; the 304 removed the remaining
        // version/deletion fetches
        assert_eq!(api.request_count(), 2);
    }

    #[tokio::test]
    async fn changed_items_are_fetched_in_batches_and_version_stamped() {
        let api = Arc::new(ScriptedApiClient::new());
        let store = Arc::new(MemoryStore::new());
        store.set_versions(user_library(), synced_versions());
        let controller = controller(api.clone(), store.clone(), Arc::new(ConflictResolver::new()));

        api.push_response(response(200, ACCESS_USER_ONLY));
        // Settings unchanged, collections unchanged, searches unchanged
        api.push_response(response(200, b"{}").with_header("last-modified-version", "8"));
        api.push_response(response(200, b"{}").with_header("last-modified-version", "8"));
        api.push_response(response(200, b"{}").with_header("last-modified-version", "8"));
        // Two items changed remotely
        api.push_response(
            response(200, br#"{"KEYD0001":8,"KEYD0002":8}"#)
                .with_header("last-modified-version", "8"),
        );
        api.push_response(response(
            200,
            br#"[{"key":"KEYD0001","version":8},{"key":"KEYD0002","version":8}]"#,
        ));
        // Trash and deletions unchanged
        api.push_response(response(200, b"{}").with_header("last-modified-version", "8"));
        api.push_response(response(304, b""));

        let report = controller.sync(SyncKind::Normal, user_selection()).await;

        assert_eq!(report.fatal, None);
        assert!(report.non_fatal.is_empty());
        assert_eq!(
            store.stored_object_keys(SyncObject::Item),
            vec!["KEYD0001".to_string(), "KEYD0002".to_string()]
        );
        // The item version advanced to the fetched version
        assert_eq!(store.versions(user_library()).unwrap().items, 8);
    }

    struct DecisivePresenter;

    #[async_trait]
    impl crate::sync::conflict::ConflictPresenter for DecisivePresenter {
        async fn resolve(&self, conflict: Conflict) -> Option<ConflictResolution> {
            match conflict {
                Conflict::GroupRemoved { group_id, .. } => {
                    Some(ConflictResolution::DeleteGroup(group_id))
                }
                Conflict::GroupWriteDenied { group_id, .. } => Some(
                    ConflictResolution::MarkChangesAsResolved(LibraryIdentifier::Group(group_id)),
                ),
            }
        }
    }

    #[tokio::test]
    async fn remotely_removed_group_is_purged_after_user_decision() {
        let api = Arc::new(ScriptedApiClient::new());
        let store = Arc::new(MemoryStore::new());
        store.set_versions(user_library(), synced_versions());
        store.add_library(crate::store::LibraryInfo {
            identifier: LibraryIdentifier::Group(34),
            name: "Old Group".to_string(),
            can_edit_metadata: true,
            can_edit_files: true,
            file_sync_kind: FileSyncKind::Vendor,
        });
        let conflicts = Arc::new(ConflictResolver::new());
        conflicts.set_presenter(Arc::new(DecisivePresenter));
        let controller = controller(api.clone(), store.clone(), conflicts);

        api.push_response(response(200, ACCESS_WITH_GROUPS));
        // The service no longer lists group 34
        api.push_response(response(200, b"{}").with_header("last-modified-version", "5"));
        // User-library downloads are unchanged
        api.push_response(response(304, b""));

        let report = controller.sync(SyncKind::Normal, LibrarySelection::All).await;

        assert_eq!(report.fatal, None);
        assert!(!report.conflicts_pending);
        assert_eq!(store.deleted_groups(), vec![34]);
        // The purged group produced no further requests
        assert_eq!(api.request_count(), 3);
    }

    #[tokio::test]
    async fn group_conflict_without_presenter_pauses_instead_of_failing() {
        let api = Arc::new(ScriptedApiClient::new());
        let store = Arc::new(MemoryStore::new());
        store.set_versions(user_library(), synced_versions());
        store.set_versions(LibraryIdentifier::Group(34), synced_versions());
        store.add_library(crate::store::LibraryInfo {
            identifier: LibraryIdentifier::Group(34),
            name: "Old Group".to_string(),
            can_edit_metadata: true,
            can_edit_files: true,
            file_sync_kind: FileSyncKind::Vendor,
        });
        let controller = controller(api.clone(), store.clone(), Arc::new(ConflictResolver::new()));

        api.push_response(response(200, ACCESS_WITH_GROUPS));
        api.push_response(response(200, b"{}").with_header("last-modified-version", "5"));
        // Both libraries report unchanged
        api.push_response(response(304, b""));
        api.push_response(response(304, b""));

        let report = controller.sync(SyncKind::Normal, LibrarySelection::All).await;

        assert_eq!(report.fatal, None);
        assert!(report.conflicts_pending);
        // The group was not purged without a decision
        assert!(store.deleted_groups().is_empty());
    }

    #[tokio::test]
    async fn store_failure_aborts_the_pass_as_db_error() {
        let api = Arc::new(ScriptedApiClient::new());
        let store = Arc::new(MemoryStore::new());
        store.add_update(user_library(), dirty_item("KEYE0001"));
        store.set_versions(user_library(), synced_versions());
        let controller = controller(api.clone(), store.clone(), Arc::new(ConflictResolver::new()));

        api.push_response(response(200, ACCESS_USER_ONLY));
        api.push_response(response(200, b"{}").with_header("last-modified-version", "4"));
        store.set_fail(true);

        let report = controller.sync(SyncKind::Normal, user_selection()).await;
        assert!(matches!(report.fatal, Some(SyncError::DbError(_))));
    }

    #[tokio::test]
    async fn concurrent_start_is_coalesced_into_a_rerun() {
        let api = Arc::new(ScriptedApiClient::new());
        let store = Arc::new(MemoryStore::new());
        store.set_versions(user_library(), synced_versions());
        let controller = Arc::new(controller(
            api.clone(),
            store.clone(),
            Arc::new(ConflictResolver::new()),
        ));

        api.set_send_delay(Duration::from_millis(50));
        // First pass + coalesced rerun, both ending on the settings 304
        api.push_response(response(200, ACCESS_USER_ONLY));
        api.push_response(response(304, b""));
        api.push_response(response(200, ACCESS_USER_ONLY));
        api.push_response(response(304, b""));

        let first = tokio::spawn({
            let controller = controller.clone();
            async move { controller.sync(SyncKind::Normal, user_selection()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = controller.sync(SyncKind::Normal, user_selection()).await;
        assert!(second.scheduled);

        let report = first.await.unwrap();
        assert_eq!(report.fatal, None);
        // The rerun actually executed: four requests in total
        assert_eq!(api.request_count(), 4);
    }
}
