use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, Method};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// HTTP methods used by the engine, including the WebDAV extension verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Propfind,
    Mkcol,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Propfind => "PROPFIND",
            HttpMethod::Mkcol => "MKCOL",
        }
    }

    fn to_reqwest(self) -> Method {
        match self {
            HttpMethod::Get => Method::GET,
            HttpMethod::Head => Method::HEAD,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
            HttpMethod::Options => Method::OPTIONS,
            // Verbs outside the RFC 7231 set
            HttpMethod::Propfind => Method::from_bytes(b"PROPFIND").unwrap_or(Method::GET),
            HttpMethod::Mkcol => Method::from_bytes(b"MKCOL").unwrap_or(Method::PUT),
        }
    }
}

/// Request body encodings the service accepts.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
    Raw {
        content_type: String,
        data: Vec<u8>,
    },
}

/// One HTTP request as issued by the engine.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    /// Basic-auth credentials (WebDAV); vendor requests authenticate via headers.
    pub basic_auth: Option<(String, String)>,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            basic_auth: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((username.into(), password.into()));
        self
    }
}

/// Classification of a failed write precondition.
///
/// Carried explicitly on the response so callers never have to re-derive it
/// from a generic error value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreconditionKind {
    /// One object's version didn't match; re-fetch and merge that object.
    ObjectConflict,
    /// The whole library's version precondition failed.
    LibraryConflict,
}

/// Response to an [`ApiRequest`].
///
/// `send` returns a response for every completed HTTP exchange regardless of
/// status; only transport-level failures become [`ApiError`]s. Callers check
/// `status` (304 and 412 are meaningful, not exceptional).
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    /// Header map with lowercased names.
    pub headers: HashMap<String, String>,
    pub data: Vec<u8>,
    /// Set iff `status == 412`.
    pub precondition: Option<PreconditionKind>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// The per-library version stamp the service attaches to every response.
    pub fn last_modified_version(&self) -> Option<i64> {
        self.header("last-modified-version").and_then(|v| v.parse().ok())
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.data).map_err(ApiError::from)
    }

    /// Classify a 412 from its payload: a body carrying per-object `failed`
    /// entries means a single object's precondition failed; anything else is
    /// a library-wide version conflict.
    pub fn classify_precondition(status: u16, data: &[u8]) -> Option<PreconditionKind> {
        if status != 412 {
            return None;
        }
        let has_failed_objects = serde_json::from_slice::<serde_json::Value>(data)
            .ok()
            .and_then(|value| {
                value
                    .get("failed")
                    .and_then(|failed| failed.as_object())
                    .map(|map| !map.is_empty())
            })
            .unwrap_or(false);
        if has_failed_objects {
            Some(PreconditionKind::ObjectConflict)
        } else {
            Some(PreconditionKind::LibraryConflict)
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("no internet connection")]
    NoConnection,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("unacceptable status {code}")]
    Status { code: u16 },
    #[error("response missing expected payload")]
    ResponseMissing,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ApiError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_connect() || error.is_timeout() {
            ApiError::NoConnection
        } else {
            ApiError::Transport(error.to_string())
        }
    }
}

/// Progress callback for file downloads, called with a fraction in 0.0..=1.0.
pub type ProgressSink<'a> = &'a (dyn Fn(f64) + Send + Sync);

/// The REST-client collaborator boundary.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Issue a request and return the response for any completed exchange.
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError>;

    /// Stream a file response to `destination`, reporting fractional progress.
    /// Non-2xx statuses are errors here (a partial file is useless).
    async fn download(
        &self,
        request: ApiRequest,
        destination: &Path,
        progress: ProgressSink<'_>,
    ) -> Result<(), ApiError>;
}

/// reqwest-backed [`ApiClient`].
pub struct HttpApiClient {
    client: Client,
}

impl HttpApiClient {
    pub fn new() -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    fn build(&self, request: ApiRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(request.method.to_reqwest(), &request.url);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some((username, password)) = &request.basic_auth {
            builder = builder.basic_auth(username, Some(password));
        }
        match request.body {
            Some(RequestBody::Json(value)) => builder = builder.json(&value),
            Some(RequestBody::Form(fields)) => builder = builder.form(&fields),
            Some(RequestBody::Raw { content_type, data }) => {
                builder = builder.header("Content-Type", content_type).body(data);
            }
            None => {}
        }
        builder
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let response = self.build(request).send().await?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let data = response.bytes().await?.to_vec();
        let precondition = ApiResponse::classify_precondition(status, &data);

        Ok(ApiResponse {
            status,
            headers,
            data,
            precondition,
        })
    }

    async fn download(
        &self,
        request: ApiRequest,
        destination: &Path,
        progress: ProgressSink<'_>,
    ) -> Result<(), ApiError> {
        let response = self.build(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                code: status.as_u16(),
            });
        }

        let total = response.content_length();

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(destination).await?;
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(ApiError::from)?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if let Some(total) = total.filter(|total| *total > 0) {
                progress((received as f64 / total as f64).min(1.0));
            }
        }
        file.flush().await?;
        progress(1.0);

        Ok(())
    }
}

// Surfaced here so HTTP status names don't leak into sync code.
pub const STATUS_NOT_MODIFIED: u16 = 304;
pub const STATUS_PRECONDITION_FAILED: u16 = 412;
