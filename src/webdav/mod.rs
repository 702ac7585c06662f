use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::{ApiClient, ApiError, ApiRequest, HttpMethod, RequestBody};
use crate::library::AttachmentUpload;
use crate::store::{ObjectStore, SettingsStore, StoreError, WriteRequest};

/// Directory created under the user-supplied WebDAV path; all attachment
/// payloads and prop files live inside it.
pub const SYNC_DIR: &str = "refsync";

const VERIFIED_KEY: &str = "webdavVerified";

/// PROPFIND body asking for the one property every DAV server can answer.
const PROPFIND_BODY: &str =
    "<propfind xmlns='DAV:'><prop><getcontentlength/></prop></propfind>";

/// Stored WebDAV session: everything needed to build the server URL plus
/// credentials. Password is injected by the configuration layer, never
/// persisted here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebDavSession {
    pub enabled: bool,
    pub scheme: String,
    /// Raw "host[:port]/path" string as entered by the user.
    pub url: String,
    pub username: String,
    #[serde(skip)]
    pub password: String,
}

/// Errors from the verification handshake; each maps to a distinct
/// user-facing message.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum VerificationError {
    #[error("no scheme configured")]
    NoScheme,
    #[error("scheme {0:?} is not http or https")]
    SchemeInvalid(String),
    #[error("no server url configured")]
    NoUrl,
    #[error("server url is invalid")]
    InvalidUrl,
    #[error("no username configured")]
    NoUsername,
    #[error("no password configured")]
    NoPassword,
    #[error("server did not identify as a WebDAV server")]
    NotDav,
    #[error("parent directory not found")]
    ParentDirNotFound,
    #[error("sync directory not found at {0}")]
    SyncDirNotFound(String),
    #[error("server did not return 404 for a missing file")]
    NonExistentFileNotMissing,
    #[error("test file missing right after upload")]
    FileMissingAfterUpload,
}

#[derive(Error, Debug)]
pub enum WebDavError {
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("unacceptable status {code} for {url}")]
    Status { code: u16, url: String },
    #[error("invalid prop file payload: {0}")]
    ItemPropInvalid(String),
}

/// Outcome of [`WebDavClient::prepare_upload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadPreparation {
    /// Identical content is already on the server; no transfer needed.
    Exists,
    /// Upload the payload to `url`.
    New { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MetadataResult {
    Unchanged,
    MtimeChanged(i64),
    Changed,
    New,
}

/// Per-key outcome sets for a batch of remote file deletions.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WebDavDeletionResult {
    pub succeeded: HashSet<String>,
    pub missing: HashSet<String>,
    pub failed: HashSet<String>,
}

/// WebDAV attachment transport.
///
/// Gated behind [`WebDavClient::verify`]: the ordered handshake must succeed
/// once (per configuration change) before any transfer methods are used.
pub struct WebDavClient {
    api: Arc<dyn ApiClient>,
    store: Arc<dyn ObjectStore>,
    settings: Arc<SettingsStore>,
    session: RwLock<WebDavSession>,
}

impl WebDavClient {
    pub fn new(
        api: Arc<dyn ApiClient>,
        store: Arc<dyn ObjectStore>,
        settings: Arc<SettingsStore>,
        session: WebDavSession,
    ) -> Self {
        Self {
            api,
            store,
            settings,
            session: RwLock::new(session),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.session.read().unwrap().enabled
    }

    pub fn is_verified(&self) -> bool {
        self.settings.get::<bool>(VERIFIED_KEY).unwrap_or(false)
    }

    /// Drop the verified flag; the next transfer requires a fresh handshake.
    pub fn reset_verification(&self) -> Result<(), WebDavError> {
        self.settings.remove(VERIFIED_KEY)?;
        Ok(())
    }

    pub fn set_session(&self, session: WebDavSession) -> Result<(), WebDavError> {
        *self.session.write().unwrap() = session;
        // Any session change invalidates an earlier verification
        self.reset_verification()
    }

    /// Base URL of the sync directory, e.g.
    /// `https://dav.example.com:8443/remote/refsync/`.
    pub fn current_url(&self) -> Result<String, VerificationError> {
        let session = self.session.read().unwrap();
        create_url(&session)
    }

    fn credentials(&self) -> Result<(String, String), VerificationError> {
        let session = self.session.read().unwrap();
        if session.username.is_empty() {
            return Err(VerificationError::NoUsername);
        }
        if session.password.is_empty() {
            return Err(VerificationError::NoPassword);
        }
        Ok((session.username.clone(), session.password.clone()))
    }

    fn request(&self, method: HttpMethod, url: impl Into<String>) -> Result<ApiRequest, VerificationError> {
        let (username, password) = self.credentials()?;
        Ok(ApiRequest::new(method, url).basic_auth(username, password))
    }

    // ===== Verification handshake =====

    /// Run the full verification handshake and persist the verified flag.
    ///
    /// Strictly ordered probes, each gating the next:
    /// 1. parse stored session (scheme/url/credentials),
    /// 2. OPTIONS capability probe (requires a `DAV` response header),
    /// 3. PROPFIND on the sync directory (404 falls back to PROPFIND on the
    ///    parent to distinguish a missing parent from a missing sync dir),
    /// 4. a deliberately nonexistent file must come back 404,
    /// 5. write probe (upload, read back, delete). A missing readback is
    ///    non-fatal: verification still succeeds.
    pub async fn verify(&self) -> Result<String, WebDavError> {
        let url = match self.check_server().await {
            Ok(url) => url,
            Err(WebDavError::Verification(VerificationError::FileMissingAfterUpload)) => {
                log::warn!("WebDavClient: write probe readback missing, continuing anyway");
                self.current_url()?
            }
            Err(error) => {
                log::error!("WebDavClient: verification failed - {}", error);
                return Err(error);
            }
        };
        self.settings.set(VERIFIED_KEY, &true)?;
        log::info!("WebDavClient: file sync is successfully set up at {}", url);
        Ok(url)
    }

    async fn check_server(&self) -> Result<String, WebDavError> {
        log::info!("WebDavClient: checking server");
        let url = self.current_url()?;
        self.check_is_dav(&url).await?;
        self.check_sync_directory(&url).await?;
        self.check_returns_404_for_missing_file(&url).await?;
        self.check_writability(&url).await?;
        Ok(url)
    }

    async fn check_is_dav(&self, url: &str) -> Result<(), WebDavError> {
        let response = self.api.send(self.request(HttpMethod::Options, url)?).await?;
        if !response.is_success() {
            return Err(WebDavError::Status {
                code: response.status,
                url: url.to_string(),
            });
        }
        if response.header("dav").is_none() {
            return Err(VerificationError::NotDav.into());
        }
        Ok(())
    }

    async fn check_sync_directory(&self, url: &str) -> Result<(), WebDavError> {
        match self.propfind(url).await? {
            207 => Ok(()),
            404 => {
                // Sync directory missing; find out whether the parent exists
                let parent = parent_url(url);
                match self.propfind(&parent).await? {
                    207 => Err(VerificationError::SyncDirNotFound(url.to_string()).into()),
                    _ => Err(VerificationError::ParentDirNotFound.into()),
                }
            }
            status => Err(WebDavError::Status {
                code: status,
                url: url.to_string(),
            }),
        }
    }

    async fn check_returns_404_for_missing_file(&self, url: &str) -> Result<(), WebDavError> {
        let probe = format!("{}nonexistent.prop", url);
        let response = self.api.send(self.request(HttpMethod::Get, &probe)?).await?;
        if response.status == 404 {
            Ok(())
        } else {
            Err(VerificationError::NonExistentFileNotMissing.into())
        }
    }

    async fn check_writability(&self, url: &str) -> Result<(), WebDavError> {
        let probe = format!("{}refsync-test-file.prop", url);

        let request = self.request(HttpMethod::Put, &probe)?.body(RequestBody::Raw {
            content_type: "text/plain".to_string(),
            data: b" ".to_vec(),
        });
        let response = self.api.send(request).await?;
        if !response.is_success() {
            return Err(WebDavError::Status {
                code: response.status,
                url: probe,
            });
        }

        let readback = self.api.send(self.request(HttpMethod::Get, &probe)?).await?;
        if readback.status == 404 {
            return Err(VerificationError::FileMissingAfterUpload.into());
        }

        let _ = self.api.send(self.request(HttpMethod::Delete, &probe)?).await?;
        Ok(())
    }

    async fn propfind(&self, url: &str) -> Result<u16, WebDavError> {
        let request = self
            .request(HttpMethod::Propfind, url)?
            .header("Depth", "0")
            .body(RequestBody::Raw {
                content_type: "text/xml; charset=utf-8".to_string(),
                data: PROPFIND_BODY.as_bytes().to_vec(),
            });
        Ok(self.api.send(request).await?.status)
    }

    /// Create the sync directory (after [`VerificationError::SyncDirNotFound`]).
    pub async fn create_sync_directory(&self) -> Result<(), WebDavError> {
        let url = self.current_url()?;
        let response = self.api.send(self.request(HttpMethod::Mkcol, &url)?).await?;
        // METHOD_NOT_ALLOWED means the directory already exists
        if response.is_success() || response.status == 405 {
            Ok(())
        } else {
            Err(WebDavError::Status {
                code: response.status,
                url,
            })
        }
    }

    // ===== Transfers =====

    /// Download request for an attachment payload, for use by the
    /// attachment downloader.
    pub fn download_request(&self, key: &str) -> Result<ApiRequest, WebDavError> {
        let url = self.current_url()?;
        Ok(self.request(HttpMethod::Get, format!("{}{}.bin", url, key))?)
    }

    /// Check remote prop metadata for one pending upload and decide whether
    /// a transfer is needed. Matching content with a different mtime only
    /// updates the stored mtime.
    pub async fn prepare_upload(
        &self,
        upload: &AttachmentUpload,
    ) -> Result<UploadPreparation, WebDavError> {
        log::info!("WebDavClient: prepare upload for {}", upload.key);
        let url = self.current_url()?;

        let result = match self.metadata(&url, &upload.key).await? {
            None => MetadataResult::New,
            Some((remote_mtime, remote_hash)) => {
                if upload.md5 == remote_hash {
                    if upload.mtime == remote_mtime {
                        MetadataResult::Unchanged
                    } else {
                        MetadataResult::MtimeChanged(remote_mtime)
                    }
                } else {
                    MetadataResult::Changed
                }
            }
        };

        match result {
            MetadataResult::Unchanged => Ok(UploadPreparation::Exists),
            MetadataResult::MtimeChanged(mtime) => {
                self.store.perform(WriteRequest::StoreMtime {
                    library: upload.library_id,
                    key: upload.key.clone(),
                    mtime,
                })?;
                Ok(UploadPreparation::Exists)
            }
            MetadataResult::Changed => {
                // Stale metadata on the server; remove it before re-uploading
                let prop = format!("{}{}.prop", url, upload.key);
                let _ = self.api.send(self.request(HttpMethod::Delete, &prop)?).await?;
                Ok(UploadPreparation::New { url })
            }
            MetadataResult::New => Ok(UploadPreparation::New { url }),
        }
    }

    /// Upload an attachment payload and, on success, its prop metadata.
    pub async fn upload(&self, upload: &AttachmentUpload) -> Result<(), WebDavError> {
        let url = self.current_url()?;
        let data = tokio::fs::read(&upload.file).await.map_err(ApiError::Io)?;

        let payload_url = format!("{}{}.bin", url, upload.key);
        let request = self
            .request(HttpMethod::Put, &payload_url)?
            .body(RequestBody::Raw {
                content_type: upload.content_type.clone(),
                data,
            });
        let response = self.api.send(request).await?;
        if !response.is_success() {
            return Err(WebDavError::Status {
                code: response.status,
                url: payload_url,
            });
        }

        self.finish_upload(&upload.key, upload.mtime, &upload.md5).await
    }

    /// Upload the prop metadata that marks a payload complete on the server.
    pub async fn finish_upload(&self, key: &str, mtime: i64, hash: &str) -> Result<(), WebDavError> {
        let url = self.current_url()?;
        let prop_url = format!("{}{}.prop", url, key);
        let body = format!(
            "<properties version=\"1\"><mtime>{}</mtime><hash>{}</hash></properties>",
            mtime, hash
        );
        let request = self.request(HttpMethod::Put, &prop_url)?.body(RequestBody::Raw {
            content_type: "text/xml; charset=utf-8".to_string(),
            data: body.into_bytes(),
        });
        let response = self.api.send(request).await?;
        if !response.is_success() {
            return Err(WebDavError::Status {
                code: response.status,
                url: prop_url,
            });
        }
        Ok(())
    }

    /// Delete payload and prop files for the given keys. Per-key outcomes:
    /// all-404 counts as `missing`, any non-success/non-404 as `failed`.
    pub async fn delete_files(&self, keys: &[String]) -> Result<WebDavDeletionResult, WebDavError> {
        let url = self.current_url()?;
        let mut result = WebDavDeletionResult::default();

        for key in keys {
            let mut statuses = Vec::with_capacity(2);
            for ext in ["prop", "bin"] {
                let target = format!("{}{}.{}", url, key, ext);
                let response = self.api.send(self.request(HttpMethod::Delete, &target)?).await?;
                statuses.push(response.status);
            }

            if statuses.iter().any(|status| *status != 404 && !(200..300).contains(status)) {
                result.failed.insert(key.clone());
            } else if statuses.iter().all(|status| *status == 404) {
                result.missing.insert(key.clone());
            } else {
                result.succeeded.insert(key.clone());
            }
        }

        Ok(result)
    }

    /// Fetch and parse the prop metadata for one key; `None` when the server
    /// has no record of the file.
    async fn metadata(&self, url: &str, key: &str) -> Result<Option<(i64, String)>, WebDavError> {
        let prop_url = format!("{}{}.prop", url, key);
        let response = self.api.send(self.request(HttpMethod::Get, &prop_url)?).await?;

        if response.status == 404 {
            return Ok(None);
        }
        if !response.is_success() {
            return Err(WebDavError::Status {
                code: response.status,
                url: prop_url,
            });
        }

        parse_prop(&response.data).map(Some)
    }
}

/// Extract `mtime` and `hash` leaf values from arbitrary prop XML.
fn parse_prop(data: &[u8]) -> Result<(i64, String), WebDavError> {
    let mut reader = Reader::from_reader(data);
    reader.config_mut().trim_text(true);

    let mut current: Option<Vec<u8>> = None;
    let mut mtime: Option<i64> = None;
    let mut hash: Option<String> = None;
    let mut buffer = Vec::new();

    loop {
        match reader.read_event_into(&mut buffer) {
            Ok(Event::Start(start)) => current = Some(start.name().as_ref().to_vec()),
            Ok(Event::Text(text)) => {
                let value = text
                    .unescape()
                    .map_err(|e| WebDavError::ItemPropInvalid(e.to_string()))?;
                match current.as_deref() {
                    Some(b"mtime") => mtime = value.trim().parse().ok(),
                    Some(b"hash") => hash = Some(value.trim().to_string()),
                    _ => {}
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Err(e) => return Err(WebDavError::ItemPropInvalid(e.to_string())),
            _ => {}
        }
        buffer.clear();
    }

    match (mtime, hash) {
        (Some(mtime), Some(hash)) if !hash.is_empty() => Ok((mtime, hash)),
        _ => Err(WebDavError::ItemPropInvalid(
            String::from_utf8_lossy(data).to_string(),
        )),
    }
}

/// Build the sync-directory URL from a stored session.
fn create_url(session: &WebDavSession) -> Result<String, VerificationError> {
    if session.scheme.is_empty() {
        return Err(VerificationError::NoScheme);
    }
    if session.scheme != "http" && session.scheme != "https" {
        return Err(VerificationError::SchemeInvalid(session.scheme.clone()));
    }
    if session.url.is_empty() {
        return Err(VerificationError::NoUrl);
    }

    let mut components = session.url.split('/');
    let authority = components.next().unwrap_or("");
    if authority.is_empty() {
        return Err(VerificationError::InvalidUrl);
    }
    let mut host_parts = authority.split(':');
    let host = host_parts.next().unwrap_or("");
    if host.is_empty() {
        return Err(VerificationError::InvalidUrl);
    }
    let port = match host_parts.next() {
        Some(raw) => Some(raw.parse::<u16>().map_err(|_| VerificationError::InvalidUrl)?),
        None => None,
    };

    let path: Vec<&str> = components.filter(|part| !part.is_empty()).collect();

    let mut url = format!("{}://{}", session.scheme, host);
    if let Some(port) = port {
        url.push_str(&format!(":{}", port));
    }
    for part in &path {
        url.push('/');
        url.push_str(part);
    }
    url.push('/');
    url.push_str(SYNC_DIR);
    url.push('/');
    Ok(url)
}

fn parent_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(index) => format!("{}/", &trimmed[..=index]),
        None => url.to_string(),
    }
}
