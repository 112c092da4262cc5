// SPDX-License-Identifier: MIT OR Apache-2.0
//! Conversion of source audio into the encoding the recognizer accepts.
//!
//! The recognizer wants mono 16 kHz FLAC and rejects requests longer than
//! three hours, so a source file is converted and split into chunks of at
//! most [`MAX_CHUNK`] in one pass per chunk. The conversion engine is an
//! external `sox` subprocess; every invocation runs under a wall-clock
//! timeout so a wedged converter cannot hang the pipeline.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Upper bound on one chunk: 2 h 59 m 50 s, just under the recognizer's
/// three-hour request limit.
pub const MAX_CHUNK: Duration = Duration::from_secs(10_790);

/// Default wall-clock bound for one sox invocation.
pub const DEFAULT_CONVERSION_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors surfaced by the media transformer.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// The converter process could not be spawned or awaited.
    #[error("converter process: {0}")]
    Spawn(#[from] std::io::Error),
    /// The converter exited with a failure status.
    #[error("converter exited with status {code:?}")]
    Conversion {
        /// Exit code, absent when the process died to a signal.
        code: Option<i32>,
    },
    /// The converter exceeded its wall-clock bound and was killed.
    #[error("converter timed out after {timeout:?}")]
    Timeout {
        /// The configured bound.
        timeout: Duration,
    },
}

/// Capability contract for audio conversion.
#[async_trait]
pub trait MediaTransformer: Send + Sync {
    /// Convert the local source audio into recognizer-ready FLAC chunks and
    /// return their paths, ordered by chunk index.
    ///
    /// `duration` is the catalog's known audio duration, used to plan chunk
    /// boundaries; a zero duration yields a single unsplit chunk.
    async fn to_recognizable_chunks(
        &self,
        input: &Path,
        duration: Duration,
    ) -> Result<Vec<PathBuf>, MediaError>;
}

/// One planned sox invocation: the output chunk index and an optional
/// `(start, length)` trim window in seconds.
type ChunkPlan = Vec<Option<(u64, u64)>>;

/// Plan chunk trim windows for the given total duration.
fn plan_chunks(duration: Duration, max_chunk: Duration) -> ChunkPlan {
    let total = duration.as_secs();
    let max = max_chunk.as_secs().max(1);
    if total <= max {
        // Single chunk, no trim: sox copies the whole file.
        return vec![None];
    }
    let count = total.div_ceil(max);
    (0..count).map(|i| Some((i * max, max))).collect()
}

/// sox-backed transformer.
#[derive(Clone, Debug)]
pub struct SoxTransformer {
    sox_path: String,
    timeout: Duration,
    max_chunk: Duration,
}

impl SoxTransformer {
    /// Transformer invoking the given sox binary with default bounds.
    pub fn new(sox_path: impl Into<String>) -> Self {
        Self {
            sox_path: sox_path.into(),
            timeout: DEFAULT_CONVERSION_TIMEOUT,
            max_chunk: MAX_CHUNK,
        }
    }

    /// Override the per-invocation wall-clock bound (large inputs may need
    /// more than the default).
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the chunk bound; test hook.
    #[must_use]
    pub fn with_max_chunk(mut self, max_chunk: Duration) -> Self {
        self.max_chunk = max_chunk;
        self
    }

    /// Argument vector for one chunk conversion.
    fn args(input: &Path, output: &Path, trim: Option<(u64, u64)>) -> Vec<String> {
        let mut args = vec![
            input.display().to_string(),
            output.display().to_string(),
            "channels".to_string(),
            "1".to_string(),
            "rate".to_string(),
            "16k".to_string(),
        ];
        if let Some((start, len)) = trim {
            args.push("trim".to_string());
            args.push(start.to_string());
            args.push(len.to_string());
        }
        args
    }

    async fn run_sox(&self, args: &[String]) -> Result<(), MediaError> {
        let mut child = Command::new(&self.sox_path)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                if !status.success() {
                    return Err(MediaError::Conversion {
                        code: status.code(),
                    });
                }
                Ok(())
            }
            Err(_) => {
                let _ = child.kill().await;
                Err(MediaError::Timeout {
                    timeout: self.timeout,
                })
            }
        }
    }
}

#[async_trait]
impl MediaTransformer for SoxTransformer {
    async fn to_recognizable_chunks(
        &self,
        input: &Path,
        duration: Duration,
    ) -> Result<Vec<PathBuf>, MediaError> {
        let plan = plan_chunks(duration, self.max_chunk);
        let mut outputs = Vec::with_capacity(plan.len());
        for (index, trim) in plan.into_iter().enumerate() {
            let output = input.with_extension(format!("{index:03}.flac"));
            let args = Self::args(input, &output, trim);
            debug!(
                target: "amphi.media",
                input = %input.display(),
                output = %output.display(),
                chunk = index,
                "converting chunk"
            );
            self.run_sox(&args).await?;
            outputs.push(output);
        }
        Ok(outputs)
    }
}
