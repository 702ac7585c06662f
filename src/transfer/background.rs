use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::{ApiClient, ApiError, ApiRequest, HttpMethod, RequestBody};
use crate::library::LibraryIdentifier;
use crate::store::{ObjectStore, StoreError, WriteRequest};
use crate::webdav::{WebDavClient, WebDavError};

/// Opaque identifier of one transport-level upload task.
pub type TaskId = i64;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("webdav error: {0}")]
    WebDav(#[from] WebDavError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("file changed since upload was queued: {0}")]
    Modified(String),
    #[error("unacceptable status {code}")]
    Status { code: u16 },
    #[error("webdav transport not configured")]
    WebDavMissing,
}

/// How a finished upload is registered with the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackgroundUploadKind {
    /// Vendor storage: register with the authorization key the service
    /// issued when the upload was authorized.
    Vendor { upload_key: String },
    /// WebDAV: upload the prop metadata carrying this mtime.
    WebDav { mtime: i64 },
}

/// Durable descriptor of one in-flight background upload.
///
/// Persisted before its transport task starts and removed exactly once,
/// after registration succeeded or was abandoned, so a process restarted
/// only to deliver completion callbacks can recover all bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundUpload {
    pub kind: BackgroundUploadKind,
    pub key: String,
    pub library_id: LibraryIdentifier,
    pub user_id: i64,
    pub remote_url: String,
    pub file_url: PathBuf,
    pub md5: String,
    pub session_id: String,
    pub date: DateTime<Utc>,
    pub size: u64,
}

/// Lifecycle state of a persisted upload descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum UploadState {
    InFlight,
    Finished { failed: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadRecord {
    upload: BackgroundUpload,
    state: UploadState,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UploadContextData {
    uploads: HashMap<TaskId, UploadRecord>,
}

/// Durable storage for upload descriptors, keyed by transport task id.
struct UploadContext {
    path: PathBuf,
    data: Mutex<UploadContextData>,
}

impl UploadContext {
    fn load(path: &Path) -> Result<Self, UploadError> {
        let data = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            UploadContextData::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            data: Mutex::new(data),
        })
    }

    fn save(&self, data: &UploadContextData) -> Result<(), UploadError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(data)
            .map_err(|error| UploadError::Transport(error.to_string()))?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }

    fn insert(&self, task_id: TaskId, upload: BackgroundUpload) -> Result<(), UploadError> {
        let mut data = self.data.lock().unwrap();
        data.uploads.insert(
            task_id,
            UploadRecord {
                upload,
                state: UploadState::InFlight,
            },
        );
        self.save(&data)
    }

    fn mark_finished(&self, task_id: TaskId, failed: bool) -> Result<(), UploadError> {
        let mut data = self.data.lock().unwrap();
        if let Some(record) = data.uploads.get_mut(&task_id) {
            record.state = UploadState::Finished { failed };
        }
        self.save(&data)
    }

    fn remove(&self, task_id: TaskId) -> Result<(), UploadError> {
        let mut data = self.data.lock().unwrap();
        data.uploads.remove(&task_id);
        self.save(&data)
    }

    fn clear(&self) -> Result<(), UploadError> {
        let mut data = self.data.lock().unwrap();
        data.uploads.clear();
        self.save(&data)
    }

    fn records(&self) -> Vec<(TaskId, UploadRecord)> {
        let data = self.data.lock().unwrap();
        let mut records: Vec<_> = data
            .uploads
            .iter()
            .map(|(task_id, record)| (*task_id, record.clone()))
            .collect();
        records.sort_by_key(|(task_id, _)| *task_id);
        records
    }
}

/// Transport-level upload request, already fully described (URL, headers and
/// multipart parameters) so the transport needs no further context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub parameters: Vec<(String, String)>,
    pub filename: String,
    pub mime_type: String,
}

/// The resumable, process-independent upload primitive.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Create a task without starting it and return its opaque id, so the
    /// caller can persist bookkeeping before any byte moves.
    async fn prepare(
        &self,
        session_id: &str,
        request: UploadRequest,
        file: &Path,
    ) -> Result<TaskId, UploadError>;

    /// Start (or restart) a prepared task.
    async fn resume(&self, task_id: TaskId) -> Result<(), UploadError>;

    /// Invalidate the whole session, cancelling every task in it.
    fn invalidate(&self, session_id: &str);
}

/// Drives resumable background uploads and survives process restarts.
///
/// Individual task completions are buffered (durably); only once the
/// transport reports the whole session drained does the coordinator
/// batch-finish: register successes with the server and flag the attachment
/// uploaded, mark failures failed. Finishing runs inside a bounded
/// time-extension window; descriptors not processed before it expires stay
/// in durable storage for [`BackgroundUploadCoordinator::resume_pending`] on
/// the next process entry.
pub struct BackgroundUploadCoordinator {
    api: Arc<dyn ApiClient>,
    store: Arc<dyn ObjectStore>,
    webdav: Option<Arc<WebDavClient>>,
    transport: Arc<dyn UploadTransport>,
    context: UploadContext,
    api_base: String,
    api_key: Option<String>,
    session_id: String,
    finish_window: Duration,
}

impl BackgroundUploadCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn ApiClient>,
        store: Arc<dyn ObjectStore>,
        webdav: Option<Arc<WebDavClient>>,
        transport: Arc<dyn UploadTransport>,
        context_path: &Path,
        api_base: String,
        api_key: Option<String>,
        session_id: String,
        finish_window: Duration,
    ) -> Result<Self, UploadError> {
        Ok(Self {
            api,
            store,
            webdav,
            transport,
            context: UploadContext::load(context_path)?,
            api_base,
            api_key,
            session_id,
            finish_window,
        })
    }

    /// Launch one background upload. The descriptor is persisted before the
    /// task is resumed.
    pub async fn start(
        &self,
        upload: BackgroundUpload,
        request: UploadRequest,
    ) -> Result<TaskId, UploadError> {
        let mut upload = upload;
        upload.session_id = self.session_id.clone();

        let current_md5 = super::file_md5(&upload.file_url)?;
        if current_md5 != upload.md5 {
            return Err(UploadError::Modified(upload.key));
        }

        let task_id = self
            .transport
            .prepare(&self.session_id, request, &upload.file_url)
            .await?;

        log::info!(
            "BackgroundUploadCoordinator: persist upload {}; {} = task {}",
            upload.key,
            upload.library_id,
            task_id
        );
        self.context.insert(task_id, upload)?;
        self.transport.resume(task_id).await?;
        Ok(task_id)
    }

    /// All persisted, not yet fully processed uploads.
    pub fn ongoing_uploads(&self) -> Vec<BackgroundUpload> {
        self.context
            .records()
            .into_iter()
            .map(|(_, record)| record.upload)
            .collect()
    }

    /// Content hashes of ongoing uploads, for dedup checks elsewhere.
    pub fn ongoing_upload_md5s(&self) -> HashSet<String> {
        self.ongoing_uploads()
            .into_iter()
            .map(|upload| upload.md5)
            .collect()
    }

    /// Invalidate the transport session and purge all persisted descriptors.
    pub fn cancel(&self) -> Result<(), UploadError> {
        log::info!("BackgroundUploadCoordinator: cancel session {}", self.session_id);
        self.transport.invalidate(&self.session_id);
        self.context.clear()
    }

    /// One transport task finished (successfully or not). Buffered durably;
    /// processing waits for the session to drain.
    pub fn task_completed(&self, task_id: TaskId, failed: bool) -> Result<(), UploadError> {
        log::info!(
            "BackgroundUploadCoordinator: task {} completed (failed={})",
            task_id,
            failed
        );
        self.context.mark_finished(task_id, failed)
    }

    /// Every task of the session has reported; batch-finish the buffered
    /// completions within the time-extension window.
    pub async fn session_drained(&self, session_id: &str) {
        let finished: Vec<(TaskId, BackgroundUpload, bool)> = self
            .context
            .records()
            .into_iter()
            .filter(|(_, record)| record.upload.session_id == session_id)
            .filter_map(|(task_id, record)| match record.state {
                UploadState::Finished { failed } => Some((task_id, record.upload, failed)),
                UploadState::InFlight => None,
            })
            .collect();

        if finished.is_empty() {
            return;
        }
        log::info!(
            "BackgroundUploadCoordinator: session {} drained, processing {} tasks",
            session_id,
            finished.len()
        );
        self.process_finished(finished).await;
    }

    /// First-class startup path: process completions a previous process left
    /// behind and restart transfers that never completed.
    pub async fn resume_pending(&self) {
        let records = self.context.records();
        if records.is_empty() {
            return;
        }
        log::info!(
            "BackgroundUploadCoordinator: resuming {} persisted uploads",
            records.len()
        );

        let mut finished = Vec::new();
        for (task_id, record) in records {
            match record.state {
                UploadState::Finished { failed } => finished.push((task_id, record.upload, failed)),
                UploadState::InFlight => {
                    if let Err(error) = self.transport.resume(task_id).await {
                        log::warn!(
                            "BackgroundUploadCoordinator: can't resume task {} - {}",
                            task_id,
                            error
                        );
                    }
                }
            }
        }
        self.process_finished(finished).await;
    }

    async fn process_finished(&self, finished: Vec<(TaskId, BackgroundUpload, bool)>) {
        let work = async {
            for (task_id, upload, failed) in &finished {
                match self.finish_single(upload, !*failed).await {
                    Ok(()) => {}
                    Err(error) => {
                        log::error!(
                            "BackgroundUploadCoordinator: couldn't finish {} - {}",
                            upload.key,
                            error
                        );
                    }
                }
                // Removed exactly once, after registration succeeded or was
                // abandoned above
                if let Err(error) = self.context.remove(*task_id) {
                    log::error!(
                        "BackgroundUploadCoordinator: can't remove task {} - {}",
                        task_id,
                        error
                    );
                }
            }
        };

        if tokio::time::timeout(self.finish_window, work).await.is_err() {
            // Window expired; unprocessed descriptors stay in durable storage
            // and the next launch picks them up
            log::warn!("BackgroundUploadCoordinator: finish window expired, deferring remainder");
        }
    }

    async fn finish_single(&self, upload: &BackgroundUpload, successful: bool) -> Result<(), UploadError> {
        if !successful {
            self.store.perform(WriteRequest::MarkAttachmentUploadFailed {
                library: upload.library_id,
                key: upload.key.clone(),
                error: "background upload failed".to_string(),
            })?;
            return Ok(());
        }

        match &upload.kind {
            BackgroundUploadKind::Vendor { upload_key } => {
                self.register_vendor_upload(upload, upload_key).await?;
            }
            BackgroundUploadKind::WebDav { mtime } => {
                let webdav = self.webdav.as_ref().ok_or(UploadError::WebDavMissing)?;
                webdav.finish_upload(&upload.key, *mtime, &upload.md5).await?;
            }
        }

        self.store.perform(WriteRequest::MarkAttachmentUploaded {
            library: upload.library_id,
            key: upload.key.clone(),
        })?;
        Ok(())
    }

    async fn register_vendor_upload(
        &self,
        upload: &BackgroundUpload,
        upload_key: &str,
    ) -> Result<(), UploadError> {
        let url = format!(
            "{}/{}/items/{}/file",
            self.api_base.trim_end_matches('/'),
            upload.library_id.api_path(upload.user_id),
            upload.key
        );
        let mut request = ApiRequest::new(HttpMethod::Post, url).body(RequestBody::Form(vec![(
            "upload".to_string(),
            upload_key.to_string(),
        )]));
        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = self.api.send(request).await?;
        if !response.is_success() {
            return Err(UploadError::Status {
                code: response.status,
            });
        }
        Ok(())
    }
}
