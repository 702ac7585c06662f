use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiClient, ApiError, ApiRequest};
use crate::library::{Attachment, AttachmentLocation, CustomLibraryKind, LibraryIdentifier};
use crate::store::{ObjectStore, WriteRequest};
use crate::webdav::WebDavClient;

/// Bound on simultaneous file transfers; keeps the engine from saturating
/// the device's network resources.
pub const MAX_CONCURRENT_DOWNLOADS: usize = 2;

/// Dedup key for one in-flight attachment fetch. Never persisted; lives only
/// for the operation's duration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Download {
    pub key: String,
    pub library_id: LibraryIdentifier,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    #[error("unacceptable status {code}")]
    Status { code: u16 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no internet connection")]
    NoConnection,
    #[error("cancelled")]
    Cancelled,
    #[error("file transport unavailable: {0}")]
    FileTransport(String),
}

impl From<ApiError> for DownloadError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::NoConnection => DownloadError::NoConnection,
            ApiError::Status { code } => DownloadError::Status { code },
            other => DownloadError::Transport(other.to_string()),
        }
    }
}

/// Kinds of events emitted for one download.
///
/// Observers see zero or more `Progress` events terminated by exactly one of
/// `Ready`, `Failed` or `Cancelled`.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateKind {
    Progress(f64),
    Ready,
    Failed(DownloadError),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub key: String,
    pub parent_key: Option<String>,
    pub library_id: LibraryIdentifier,
    pub kind: UpdateKind,
}

struct EnqueuedDownload {
    download: Download,
    parent_key: Option<String>,
    path: PathBuf,
}

struct ActiveDownload {
    progress: f64,
    token: CancellationToken,
}

struct Inner {
    queue: VecDeque<EnqueuedDownload>,
    active: HashMap<Download, ActiveDownload>,
    errors: HashMap<Download, DownloadError>,
}

/// Bounded-concurrency attachment download manager.
///
/// Downloads are keyed by `{key, library}`; a second request while one is in
/// flight joins the existing operation instead of duplicating the transfer.
pub struct AttachmentDownloader {
    user_id: i64,
    api_base: String,
    api_key: Option<String>,
    api: Arc<dyn ApiClient>,
    store: Arc<dyn ObjectStore>,
    webdav: Option<Arc<WebDavClient>>,
    files_dir: PathBuf,
    inner: Mutex<Inner>,
    events: tokio::sync::broadcast::Sender<Update>,
}

impl AttachmentDownloader {
    pub fn new(
        user_id: i64,
        api_base: String,
        api_key: Option<String>,
        api: Arc<dyn ApiClient>,
        store: Arc<dyn ObjectStore>,
        webdav: Option<Arc<WebDavClient>>,
        files_dir: PathBuf,
    ) -> Self {
        let (events, _) = tokio::sync::broadcast::channel(256);
        Self {
            user_id,
            api_base,
            api_key,
            api,
            store,
            webdav,
            files_dir,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                active: HashMap::new(),
                errors: HashMap::new(),
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Update> {
        self.events.subscribe()
    }

    /// Local path an attachment's payload is stored at.
    pub fn file_path(&self, library_id: LibraryIdentifier, key: &str, filename: &str) -> PathBuf {
        let library_dir = match library_id {
            LibraryIdentifier::Custom(CustomLibraryKind::MyLibrary) => "user".to_string(),
            LibraryIdentifier::Group(id) => format!("group_{}", id),
        };
        self.files_dir.join(library_dir).join(key).join(filename)
    }

    /// Start a download for the attachment unless its payload is already
    /// local. Idempotent: repeated calls while a download is in flight are
    /// no-ops (the caller joins the shared event stream).
    pub fn download_if_needed(self: &Arc<Self>, attachment: &Attachment, parent_key: Option<&str>) {
        match attachment.location {
            AttachmentLocation::Local => {
                log::debug!("AttachmentDownloader: {} already local", attachment.key);
                self.emit(Update {
                    key: attachment.key.clone(),
                    parent_key: parent_key.map(String::from),
                    library_id: attachment.library_id,
                    kind: UpdateKind::Ready,
                });
            }
            AttachmentLocation::Remote
            | AttachmentLocation::RemoteMissing
            | AttachmentLocation::LocalAndChangedRemotely => {
                let path =
                    self.file_path(attachment.library_id, &attachment.key, &attachment.filename);
                self.enqueue(
                    Download {
                        key: attachment.key.clone(),
                        library_id: attachment.library_id,
                    },
                    parent_key.map(String::from),
                    path,
                );
            }
        }
    }

    /// Enqueue every remote attachment of a batch (e.g. discovered during a
    /// sync pass).
    pub fn batch_download(self: &Arc<Self>, attachments: &[Attachment]) {
        for attachment in attachments {
            self.download_if_needed(attachment, None);
        }
    }

    fn enqueue(self: &Arc<Self>, download: Download, parent_key: Option<String>, path: PathBuf) {
        {
            let mut inner = self.inner.lock().unwrap();
            let in_flight = inner.active.contains_key(&download)
                || inner.queue.iter().any(|queued| queued.download == download);
            if in_flight {
                log::debug!("AttachmentDownloader: {} already in flight", download.key);
                return;
            }
            inner.errors.remove(&download);
            inner.queue.push_back(EnqueuedDownload {
                download: download.clone(),
                parent_key: parent_key.clone(),
                path,
            });
        }

        log::info!("AttachmentDownloader: enqueue {}; {}", download.key, download.library_id);
        // Synthetic 0% event so observers show "started" before any bytes move
        self.emit(Update {
            key: download.key.clone(),
            parent_key,
            library_id: download.library_id,
            kind: UpdateKind::Progress(0.0),
        });
        self.start_next_if_possible();
    }

    fn start_next_if_possible(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        while inner.active.len() < MAX_CONCURRENT_DOWNLOADS {
            let Some(enqueued) = inner.queue.pop_front() else {
                break;
            };
            let token = CancellationToken::new();
            inner.active.insert(
                enqueued.download.clone(),
                ActiveDownload {
                    progress: 0.0,
                    token: token.clone(),
                },
            );
            let downloader = self.clone();
            tokio::spawn(async move {
                downloader
                    .run_download(enqueued.download, enqueued.parent_key, enqueued.path, token)
                    .await;
            });
        }
    }

    async fn run_download(
        self: Arc<Self>,
        download: Download,
        parent_key: Option<String>,
        path: PathBuf,
        token: CancellationToken,
    ) {
        // Stream into a sidecar path so a failed or cancelled refresh never
        // corrupts an existing local copy.
        let partial = PathBuf::from(format!("{}.part", path.display()));

        let result = match self.build_request(&download) {
            Ok(request) => {
                let progress_self = self.clone();
                let progress_download = download.clone();
                let progress_parent = parent_key.clone();
                let on_progress = move |fraction: f64| {
                    {
                        let mut inner = progress_self.inner.lock().unwrap();
                        if let Some(active) = inner.active.get_mut(&progress_download) {
                            active.progress = fraction;
                        }
                    }
                    progress_self.emit(Update {
                        key: progress_download.key.clone(),
                        parent_key: progress_parent.clone(),
                        library_id: progress_download.library_id,
                        kind: UpdateKind::Progress(fraction),
                    });
                };

                tokio::select! {
                    result = self.api.download(request, &partial, &on_progress) => {
                        result.map_err(DownloadError::from)
                    }
                    _ = token.cancelled() => Err(DownloadError::Cancelled),
                }
            }
            Err(error) => Err(error),
        };

        let result = match result {
            Ok(()) => tokio::fs::rename(&partial, &path)
                .await
                .map_err(|error| DownloadError::Transport(error.to_string())),
            Err(error) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(error)
            }
        };

        self.finish(download, parent_key, path, result);
    }

    fn build_request(&self, download: &Download) -> Result<ApiRequest, DownloadError> {
        // Personal-library attachments go through WebDAV when the user has
        // configured it; everything else uses vendor storage.
        if !download.library_id.is_group() {
            if let Some(webdav) = self.webdav.as_ref().filter(|webdav| webdav.is_enabled()) {
                return webdav
                    .download_request(&download.key)
                    .map_err(|error| DownloadError::FileTransport(error.to_string()));
            }
        }

        let url = format!(
            "{}/{}/items/{}/file",
            self.api_base.trim_end_matches('/'),
            download.library_id.api_path(self.user_id),
            download.key
        );
        let mut request = ApiRequest::get(url);
        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }
        Ok(request)
    }

    fn finish(
        self: &Arc<Self>,
        download: Download,
        parent_key: Option<String>,
        path: PathBuf,
        result: Result<(), DownloadError>,
    ) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.active.remove(&download);
        }

        let kind = match result {
            Ok(()) => {
                log::info!("AttachmentDownloader: finished {}; {}", download.key, download.library_id);
                self.inner.lock().unwrap().errors.remove(&download);
                let request = WriteRequest::MarkAttachmentDownloaded {
                    library: download.library_id,
                    key: download.key.clone(),
                    downloaded: true,
                };
                if let Err(error) = self.store.perform(request) {
                    log::error!(
                        "AttachmentDownloader: can't store downloaded flag for {} - {}",
                        download.key,
                        error
                    );
                }
                UpdateKind::Ready
            }
            Err(DownloadError::Cancelled) => {
                self.inner.lock().unwrap().errors.remove(&download);
                if path.exists() {
                    // Cancelling a refresh of an existing file must not
                    // regress the UI to "missing"
                    UpdateKind::Ready
                } else {
                    UpdateKind::Cancelled
                }
            }
            Err(error) => {
                if path.exists() {
                    // The user already has a usable file; a failed refresh is
                    // not worth an error
                    log::error!(
                        "AttachmentDownloader: failed to refresh local {} - {}",
                        download.key,
                        error
                    );
                    self.inner.lock().unwrap().errors.remove(&download);
                    UpdateKind::Ready
                } else {
                    log::error!(
                        "AttachmentDownloader: failed to download {} - {}",
                        download.key,
                        error
                    );
                    self.inner
                        .lock()
                        .unwrap()
                        .errors
                        .insert(download.clone(), error.clone());
                    UpdateKind::Failed(error)
                }
            }
        };

        self.emit(Update {
            key: download.key,
            parent_key,
            library_id: download.library_id,
            kind,
        });
        self.start_next_if_possible();
    }

    /// Cancel the in-flight or queued download for this key, if any, and
    /// clear its cached error state.
    pub fn cancel(self: &Arc<Self>, key: &str, library_id: LibraryIdentifier) {
        let download = Download {
            key: key.to_string(),
            library_id,
        };

        let queued = {
            let mut inner = self.inner.lock().unwrap();
            inner.errors.remove(&download);
            if let Some(active) = inner.active.get(&download) {
                // The running task observes the token and finishes as
                // cancelled; terminal event comes from `finish`
                active.token.cancel();
                None
            } else if let Some(index) = inner
                .queue
                .iter()
                .position(|queued| queued.download == download)
            {
                inner.queue.remove(index)
            } else {
                None
            }
        };

        if let Some(queued) = queued {
            log::info!("AttachmentDownloader: cancelled queued {}", download.key);
            let kind = if queued.path.exists() {
                UpdateKind::Ready
            } else {
                UpdateKind::Cancelled
            };
            self.emit(Update {
                key: download.key,
                parent_key: queued.parent_key,
                library_id,
                kind,
            });
            self.start_next_if_possible();
        }
    }

    /// Cancel everything: queued downloads report a terminal event
    /// immediately, active ones as their tasks observe cancellation.
    pub fn cancel_all(self: &Arc<Self>) {
        log::info!("AttachmentDownloader: stop all tasks");
        let queued = {
            let mut inner = self.inner.lock().unwrap();
            inner.errors.clear();
            for active in inner.active.values() {
                active.token.cancel();
            }
            std::mem::take(&mut inner.queue)
        };

        for enqueued in queued {
            let kind = if enqueued.path.exists() {
                UpdateKind::Ready
            } else {
                UpdateKind::Cancelled
            };
            self.emit(Update {
                key: enqueued.download.key,
                parent_key: enqueued.parent_key,
                library_id: enqueued.download.library_id,
                kind,
            });
        }
    }

    /// Non-blocking snapshot of a download's progress and cached error.
    pub fn data(&self, key: &str, library_id: LibraryIdentifier) -> (Option<f64>, Option<DownloadError>) {
        let download = Download {
            key: key.to_string(),
            library_id,
        };
        let inner = self.inner.lock().unwrap();
        let error = inner.errors.get(&download).cloned();
        if let Some(active) = inner.active.get(&download) {
            (Some(active.progress), error)
        } else if inner.queue.iter().any(|queued| queued.download == download) {
            (Some(0.0), error)
        } else {
            (None, error)
        }
    }

    fn emit(&self, update: Update) {
        // Send fails only when no observer is subscribed, which is fine
        let _ = self.events.send(update);
    }
}
