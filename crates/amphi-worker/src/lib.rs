// SPDX-License-Identifier: MIT OR Apache-2.0
//! The worker loop: admission under a monetary budget, and the multi-step
//! pipeline that turns an admitted record into an indexed transcript.
//!
//! One iteration of the loop drains every in-flight record through the
//! pipeline (readiness permitting), then admits at most one new record if
//! the balance allows it. Records are processed strictly sequentially; all
//! crash-safety comes from the catalog's durable flag transitions, so a
//! record interrupted mid-pipeline is simply rerun from the top on the next
//! healthy iteration.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod worker;

pub use worker::{Admission, Worker};

use amphi_blob::BlobError;
use amphi_budget::BrokerError;
use amphi_catalog::CatalogError;
use amphi_index::IndexError;
use amphi_media::MediaError;
use amphi_transcribe::TranscribeError;
use std::time::Duration;

/// Tuning knobs for the worker, fixed at construction.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Bound on one source-audio download.
    pub download_timeout: Duration,
    /// How long to sleep when an iteration neither processed nor admitted
    /// anything.
    pub idle_sleep: Duration,
    /// Per-record failure cap: after this many failed pipeline runs the
    /// record is skipped instead of burning more external cost. Counters are
    /// process-local and reset on restart.
    pub max_attempts: u32,
    /// Consecutive admission failures tolerated before the loop exits.
    pub max_schedule_failures: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            download_timeout: Duration::from_secs(30 * 60),
            idle_sleep: Duration::from_secs(60),
            max_attempts: 5,
            max_schedule_failures: 3,
        }
    }
}

/// Error of one pipeline step or loop operation, surfaced to the top-level
/// loop which logs it and moves on to the next iteration.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Catalog operation failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// Budget operation failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),
    /// Blob store operation failed.
    #[error(transparent)]
    Blob(#[from] BlobError),
    /// Audio conversion failed.
    #[error(transparent)]
    Media(#[from] MediaError),
    /// Transcription failed.
    #[error(transparent)]
    Transcribe(#[from] TranscribeError),
    /// Bulk indexing failed.
    #[error(transparent)]
    Index(#[from] IndexError),
    /// Source audio download failed in transport.
    #[error("downloading {url}: {source}")]
    Download {
        /// The audio URL.
        url: String,
        /// Underlying transport error.
        source: reqwest::Error,
    },
    /// Source audio download answered with a non-success status.
    #[error("downloading {url}: status {code}")]
    DownloadStatus {
        /// The audio URL.
        url: String,
        /// HTTP status code.
        code: u16,
    },
    /// Local file handling failed.
    #[error("temporary file: {0}")]
    Io(#[from] std::io::Error),
    /// The HTTP client could not be constructed. Fatal at startup.
    #[error("http client initialization: {0}")]
    Init(reqwest::Error),
    /// The loop was asked to shut down.
    #[error("worker cancelled")]
    Cancelled,
}

impl WorkerError {
    /// Whether this error is a shutdown signal rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Transcribe(TranscribeError::Cancelled)
        )
    }

    /// Whether this error indicates corrupted durable state that retrying
    /// cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Catalog(CatalogError::Invariant(_)))
    }
}
