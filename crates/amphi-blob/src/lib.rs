// SPDX-License-Identifier: MIT OR Apache-2.0
//! Opaque named byte container for intermediate pipeline artifacts.
//!
//! The worker uploads converted audio chunks here so the transcriber can
//! read them by URI, and deletes them once transcription is done. Blob names
//! are the basenames of the local artifacts, unique per pipeline invocation
//! by chunk index.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Uploads of multi-hundred-megabyte FLAC chunks may legitimately take a
/// while; anything beyond this is a stuck connection.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Errors surfaced by blob backends.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// Transport-level failure.
    #[error("blob transport: {0}")]
    Transport(#[from] reqwest::Error),
    /// The store answered with a non-success status.
    #[error("blob store returned status {code}: {body}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// Response body.
        body: String,
    },
    /// Deleting a blob that does not exist.
    #[error("no blob named {0}")]
    NotFound(String),
}

/// Capability contract for the blob container.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write a named blob, replacing any previous content under that name.
    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<(), BlobError>;
    /// Remove a blob. Missing blobs are an error.
    async fn delete(&self, name: &str) -> Result<(), BlobError>;
    /// Stable URI under which the transcriber can read the blob.
    fn uri(&self, name: &str) -> String;
}

// ── In-memory backend ───────────────────────────────────────────────

/// Process-local blob store used by tests and the end-to-end scenarios.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    bucket: String,
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Store addressing blobs as `gs://<bucket>/<name>`.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            blobs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Current blob names, for assertions.
    pub fn names(&self) -> Vec<String> {
        self.blobs
            .lock()
            .expect("blobs lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Content of one blob, for assertions.
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.blobs
            .lock()
            .expect("blobs lock poisoned")
            .get(name)
            .cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        self.blobs
            .lock()
            .expect("blobs lock poisoned")
            .insert(name.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), BlobError> {
        self.blobs
            .lock()
            .expect("blobs lock poisoned")
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BlobError::NotFound(name.to_string()))
    }

    fn uri(&self, name: &str) -> String {
        format!("gs://{}/{name}", self.bucket)
    }
}

// ── GCS backend ─────────────────────────────────────────────────────

/// Blob store backed by the Google Cloud Storage JSON API.
#[derive(Clone, Debug)]
pub struct GcsBlobStore {
    http: reqwest::Client,
    bucket: String,
    base_url: String,
    auth_token: Option<String>,
}

impl GcsBlobStore {
    /// Store over the public endpoint for the given bucket.
    pub fn new(bucket: impl Into<String>) -> Result<Self, BlobError> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(UPLOAD_TIMEOUT).build()?,
            bucket: bucket.into(),
            base_url: "https://storage.googleapis.com".to_string(),
            auth_token: None,
        })
    }

    /// Point the store at a different endpoint (fake server in tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Attach a bearer token to every request.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl BlobStore for GcsBlobStore {
    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        let url = format!("{}/upload/storage/v1/b/{}/o", self.base_url, self.bucket);
        debug!(target: "amphi.blob", name, size = bytes.len(), "uploading blob");
        let resp = self
            .authorize(self.http.post(&url))
            .query(&[("uploadType", "media"), ("name", name)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BlobError::Status {
                code: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), BlobError> {
        let url = format!(
            "{}/storage/v1/b/{}/o/{name}",
            self.base_url, self.bucket
        );
        debug!(target: "amphi.blob", name, "deleting blob");
        let resp = self.authorize(self.http.delete(&url)).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BlobError::NotFound(name.to_string()));
        }
        if !status.is_success() {
            return Err(BlobError::Status {
                code: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn uri(&self, name: &str) -> String {
        format!("gs://{}/{name}", self.bucket)
    }
}
