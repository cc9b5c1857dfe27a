//! Remote cell sources

use crate::error::{Result, TransferFailureKind, VolError};
use crate::types::CellIndex;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::fs;

/// Cell source backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceBackend {
    /// Local directory holding cell files
    FileSystem,
    /// HTTP(S) server
    Http,
    /// In-process map, used by tests and tooling
    Memory,
}

impl SourceBackend {
    /// Parse source backend from URL scheme
    pub fn from_url(url: &str) -> Result<Self> {
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end];
            match scheme {
                "file" => Ok(SourceBackend::FileSystem),
                "http" | "https" => Ok(SourceBackend::Http),
                "mem" => Ok(SourceBackend::Memory),
                _ => Err(VolError::InvalidUrl(format!("Unknown scheme: {}", scheme))),
            }
        } else {
            // Assume file system if no scheme
            Ok(SourceBackend::FileSystem)
        }
    }
}

/// Basic-auth credentials for a remote source
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl FromStr for Credentials {
    type Err = VolError;

    /// Parse `USERNAME:PASSWORD`; the password may itself contain colons
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((user, pass)) if !user.is_empty() => Ok(Self {
                username: user.to_string(),
                password: pass.to_string(),
            }),
            _ => Err(VolError::Configuration(
                "credentials must be given as USERNAME:PASSWORD".to_string(),
            )),
        }
    }
}

/// Trait for fetching cell payloads from wherever the grid is published
#[async_trait]
pub trait CellSource: Send + Sync {
    /// Fetch the complete payload published under `name` for `cell`
    async fn fetch(&self, cell: CellIndex, name: &str) -> Result<Bytes>;

    /// Human-readable location of a payload, for logging
    fn locate(&self, name: &str) -> String;

    /// Get the backend type
    fn backend(&self) -> SourceBackend;
}

/// Cells served from a local directory
pub struct FileSystemCellSource {
    base_path: PathBuf,
}

impl FileSystemCellSource {
    /// Create a new file system cell source
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl CellSource for FileSystemCellSource {
    async fn fetch(&self, cell: CellIndex, name: &str) -> Result<Bytes> {
        let path = self.base_path.join(name);
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(VolError::transfer(
                cell,
                TransferFailureKind::NotFound,
                format!("{} does not exist", path.display()),
            )),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => Err(
                VolError::transfer(cell, TransferFailureKind::Authentication, e.to_string()),
            ),
            Err(e) => Err(VolError::transfer(
                cell,
                TransferFailureKind::Transient,
                e.to_string(),
            )),
        }
    }

    fn locate(&self, name: &str) -> String {
        self.base_path.join(name).display().to_string()
    }

    fn backend(&self) -> SourceBackend {
        SourceBackend::FileSystem
    }
}

/// In-memory cell source with failure injection
#[derive(Default)]
pub struct MemoryCellSource {
    payloads: RwLock<HashMap<String, Bytes>>,
    failures: RwLock<HashMap<String, TransferFailureKind>>,
    fetches: AtomicUsize,
}

impl MemoryCellSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a payload under `name`
    pub fn insert(&self, name: impl Into<String>, payload: impl Into<Bytes>) {
        self.payloads.write().insert(name.into(), payload.into());
    }

    /// Make every fetch of `name` fail with `kind` until cleared
    pub fn inject_failure(&self, name: impl Into<String>, kind: TransferFailureKind) {
        self.failures.write().insert(name.into(), kind);
    }

    /// Remove an injected failure
    pub fn clear_failure(&self, name: &str) {
        self.failures.write().remove(name);
    }

    /// Number of fetches attempted so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CellSource for MemoryCellSource {
    async fn fetch(&self, cell: CellIndex, name: &str) -> Result<Bytes> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if let Some(kind) = self.failures.read().get(name).copied() {
            return Err(VolError::transfer(cell, kind, "injected failure"));
        }

        self.payloads.read().get(name).cloned().ok_or_else(|| {
            VolError::transfer(
                cell,
                TransferFailureKind::NotFound,
                format!("no payload named {}", name),
            )
        })
    }

    fn locate(&self, name: &str) -> String {
        format!("mem://{}", name)
    }

    fn backend(&self) -> SourceBackend {
        SourceBackend::Memory
    }
}

/// Cells served over HTTP(S) with basic auth
#[cfg(feature = "http-client")]
pub struct HttpCellSource {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<Credentials>,
}

#[cfg(feature = "http-client")]
impl HttpCellSource {
    /// Create a source rooted at `base_url`.
    ///
    /// Gzip transfer encoding is negotiated automatically.
    pub fn new(
        base_url: impl Into<String>,
        credentials: Option<Credentials>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url.into();
        if SourceBackend::from_url(&base_url)? != SourceBackend::Http {
            return Err(VolError::InvalidUrl(format!(
                "expected an http(s) URL, got {}",
                base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()
            .map_err(|e| VolError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn classify_status(status: reqwest::StatusCode) -> TransferFailureKind {
        match status.as_u16() {
            401 | 403 => TransferFailureKind::Authentication,
            404 | 410 => TransferFailureKind::NotFound,
            _ => TransferFailureKind::Transient,
        }
    }
}

#[cfg(feature = "http-client")]
#[async_trait]
impl CellSource for HttpCellSource {
    async fn fetch(&self, cell: CellIndex, name: &str) -> Result<Bytes> {
        let url = self.locate(name);
        let mut request = self.client.get(&url);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request.send().await.map_err(|e| {
            VolError::transfer(cell, TransferFailureKind::Transient, e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(VolError::transfer(
                cell,
                Self::classify_status(status),
                format!("HTTP {} for {}", status, url),
            ));
        }

        let expected_len = response.content_length();
        let body = response.bytes().await.map_err(|e| {
            VolError::transfer(cell, TransferFailureKind::Transient, e.to_string())
        })?;

        if let Some(expected) = expected_len {
            if body.len() as u64 != expected {
                return Err(VolError::transfer(
                    cell,
                    TransferFailureKind::Transient,
                    format!("short body: {} of {} bytes", body.len(), expected),
                ));
            }
        }

        Ok(body)
    }

    fn locate(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }

    fn backend(&self) -> SourceBackend {
        SourceBackend::Http
    }
}

/// Parse a source location and create the matching cell source
pub fn create_cell_source(
    url: &str,
    credentials: Option<Credentials>,
    timeout: Duration,
) -> Result<Box<dyn CellSource>> {
    match SourceBackend::from_url(url)? {
        SourceBackend::FileSystem => {
            let path = url.strip_prefix("file://").unwrap_or(url);
            Ok(Box::new(FileSystemCellSource::new(path)))
        }
        #[cfg(feature = "http-client")]
        SourceBackend::Http => Ok(Box::new(HttpCellSource::new(url, credentials, timeout)?)),
        #[cfg(not(feature = "http-client"))]
        SourceBackend::Http => {
            let _ = (credentials, timeout);
            Err(VolError::Configuration(
                "HTTP sources require the http-client feature".to_string(),
            ))
        }
        SourceBackend::Memory => Err(VolError::Configuration(
            "memory sources are constructed in-process, not from a URL".to_string(),
        )),
    }
}
