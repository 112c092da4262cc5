// SPDX-License-Identifier: MIT OR Apache-2.0
//! The worker itself: admission, the per-record pipeline, and the top-level
//! loop.

use crate::{WorkerConfig, WorkerError};
use amphi_blob::BlobStore;
use amphi_budget::{Broker, cents_to_duration, duration_to_cents};
use amphi_catalog::Catalog;
use amphi_core::{Lesson, Shutdown};
use amphi_index::{HealthProbe, Indexer};
use amphi_media::MediaTransformer;
use amphi_transcribe::Transcriber;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

/// Outcome of one admission attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Budget or catalog had nothing to offer; the loop may sleep.
    NoNewWork,
    /// One record was admitted and the budget debited; the loop should
    /// immediately try again.
    NewWorkAdmitted,
}

/// Removes the local chunk files when the pipeline leaves the record, on
/// success and failure alike.
struct LocalChunks(Vec<PathBuf>);

impl Drop for LocalChunks {
    fn drop(&mut self) {
        for path in &self.0 {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Drives records through the pipeline under the admission policy.
///
/// All external collaborators are injected as capabilities; the worker owns
/// nothing durable, only transient local files within one pipeline
/// invocation.
pub struct Worker {
    catalog: Arc<dyn Catalog>,
    broker: Arc<dyn Broker>,
    blobs: Arc<dyn BlobStore>,
    media: Arc<dyn MediaTransformer>,
    transcriber: Arc<dyn Transcriber>,
    indexer: Arc<dyn Indexer>,
    probe: Arc<dyn HealthProbe>,
    http: reqwest::Client,
    config: WorkerConfig,
    attempts: Mutex<HashMap<String, u32>>,
}

impl Worker {
    /// Build a worker over the given capabilities.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<dyn Catalog>,
        broker: Arc<dyn Broker>,
        blobs: Arc<dyn BlobStore>,
        media: Arc<dyn MediaTransformer>,
        transcriber: Arc<dyn Transcriber>,
        indexer: Arc<dyn Indexer>,
        probe: Arc<dyn HealthProbe>,
        config: WorkerConfig,
    ) -> Result<Self, WorkerError> {
        let http = reqwest::Client::builder()
            .timeout(config.download_timeout)
            .build()
            .map_err(WorkerError::Init)?;
        Ok(Self {
            catalog,
            broker,
            blobs,
            media,
            transcriber,
            indexer,
            probe,
            http,
            config,
            attempts: Mutex::new(HashMap::new()),
        })
    }

    /// Admission step: greedily schedule at most one pending record the
    /// current balance can pay for, then debit its price.
    ///
    /// The transition and the debit are two separate transactions; a crash
    /// between them leaves a scheduled record without a matching debit,
    /// which only ever over-estimates the remaining budget.
    pub async fn maybe_schedule(&self) -> Result<Admission, WorkerError> {
        let balance = self.broker.get_balance().await?;
        debug!(target: "amphi.worker", balance, "checked balance");
        if balance <= 0 {
            return Ok(Admission::NoNewWork);
        }
        let max_duration = cents_to_duration(balance);
        let picked = self.catalog.schedule_random(max_duration).await?;
        if picked.is_zero() {
            return Ok(Admission::NoNewWork);
        }
        let price = duration_to_cents(picked);
        self.broker.change_balance(-price).await?;
        info!(
            target: "amphi.worker",
            duration_secs = picked.as_secs(),
            price_cents = price,
            "admitted new record"
        );
        Ok(Admission::NewWorkAdmitted)
    }

    /// Pipeline step: drain every in-flight record, stopping at the first
    /// failure. Skipped entirely while the search engine is unhealthy.
    pub async fn run(&self, shutdown: &Shutdown) -> Result<(), WorkerError> {
        if !self.probe.is_healthy().await {
            info!(target: "amphi.worker", "search engine not ready, skipping this iteration");
            return Ok(());
        }
        let scheduled = self.catalog.get_scheduled().await?;
        for (key, lesson) in scheduled {
            if shutdown.is_requested() {
                return Ok(());
            }
            if self.attempts_exhausted(&key) {
                warn!(
                    target: "amphi.worker",
                    key = %key,
                    max_attempts = self.config.max_attempts,
                    "record failed too often, skipping until restart"
                );
                continue;
            }
            if let Err(err) = self.process_record(&key, &lesson, shutdown).await {
                if err.is_cancellation() {
                    return Ok(());
                }
                self.record_failure(&key);
                return Err(err);
            }
            self.clear_failures(&key);
        }
        Ok(())
    }

    /// Top-level loop: run the pipeline, admit new work, sleep only when
    /// idle. Per-record errors are reported and retried on the next
    /// iteration; only invariant violations and repeated admission failures
    /// end the loop.
    pub async fn run_loop(&self, shutdown: &Shutdown) -> Result<(), WorkerError> {
        let mut schedule_failures: u32 = 0;
        loop {
            if shutdown.is_requested() {
                info!(target: "amphi.worker", "shutdown requested, leaving loop");
                return Ok(());
            }
            if let Err(err) = self.run(shutdown).await {
                if err.is_fatal() {
                    return Err(err);
                }
                error!(target: "amphi.worker", error = %err, "pipeline iteration failed");
            }
            if shutdown.is_requested() {
                return Ok(());
            }
            match self.maybe_schedule().await {
                Ok(Admission::NewWorkAdmitted) => {
                    schedule_failures = 0;
                    // Keep filling the queue without sleeping.
                    continue;
                }
                Ok(Admission::NoNewWork) => {
                    schedule_failures = 0;
                }
                Err(err) => {
                    schedule_failures += 1;
                    error!(
                        target: "amphi.worker",
                        error = %err,
                        consecutive = schedule_failures,
                        "admission failed"
                    );
                    if schedule_failures >= self.config.max_schedule_failures {
                        return Err(err);
                    }
                }
            }
            tokio::select! {
                _ = shutdown.requested() => return Ok(()),
                _ = tokio::time::sleep(self.config.idle_sleep) => {}
            }
        }
    }

    /// Run one record through download, conversion, transcription and
    /// indexing, then commit the transcript.
    async fn process_record(
        &self,
        key: &str,
        lesson: &Lesson,
        shutdown: &Shutdown,
    ) -> Result<(), WorkerError> {
        info!(target: "amphi.worker", key = %key, audio = %lesson.audio_url, "processing record");
        // The temp file is removed on drop, whatever path leaves this
        // function.
        let source = self.download_to_tmp(&lesson.audio_url).await?;
        let chunks = LocalChunks(
            self.media
                .to_recognizable_chunks(
                    source.path(),
                    Duration::from_secs(lesson.duration_secs),
                )
                .await?,
        );
        debug!(target: "amphi.worker", key = %key, chunks = chunks.0.len(), "converted to chunks");

        let hints = lesson.hints();
        let text_blob_name = format!("{}.txt", basename(&lesson.audio_url));
        let mut full_text = String::new();
        for chunk in &chunks.0 {
            if shutdown.is_requested() {
                return Err(WorkerError::Cancelled);
            }
            let chunk_name = basename(chunk);
            let bytes = tokio::fs::read(chunk).await?;
            self.blobs.upload(&chunk_name, bytes).await?;

            let fragments = self
                .transcriber
                .transcribe(
                    &lesson.language,
                    &self.blobs.uri(&chunk_name),
                    &hints,
                    shutdown,
                )
                .await?;
            let sentences: Vec<String> = fragments.into_iter().map(|f| f.text).collect();
            let chunk_text = sentences.join(" ");
            full_text.push_str(&chunk_text);
            full_text.push(' ');

            // The raw-text sidecar is a convenience artifact; losing it must
            // not fail the record.
            if let Err(err) = self
                .blobs
                .upload(&text_blob_name, chunk_text.into_bytes())
                .await
            {
                warn!(
                    target: "amphi.worker",
                    key = %key,
                    error = %err,
                    "failed to upload transcript sidecar"
                );
            }
            self.blobs.delete(&chunk_name).await?;
            self.indexer.index(lesson, &sentences).await?;
        }

        let transcript = full_text.trim();
        if transcript.is_empty() {
            warn!(target: "amphi.worker", key = %key, "record completed with an empty transcript");
        }
        self.catalog.mark_converted(key, transcript).await?;
        info!(target: "amphi.worker", key = %key, "record converted");
        Ok(())
    }

    /// Stream the source audio into a fresh temporary file.
    async fn download_to_tmp(&self, url: &str) -> Result<NamedTempFile, WorkerError> {
        let tmp = NamedTempFile::new()?;
        let mut resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| WorkerError::Download {
                url: url.to_string(),
                source,
            })?;
        if !resp.status().is_success() {
            return Err(WorkerError::DownloadStatus {
                url: url.to_string(),
                code: resp.status().as_u16(),
            });
        }
        let mut file = tmp.reopen()?;
        while let Some(chunk) = resp.chunk().await.map_err(|source| WorkerError::Download {
            url: url.to_string(),
            source,
        })? {
            file.write_all(&chunk)?;
        }
        Ok(tmp)
    }

    fn attempts_exhausted(&self, key: &str) -> bool {
        let attempts = self.attempts.lock().expect("attempts lock poisoned");
        attempts.get(key).copied().unwrap_or(0) >= self.config.max_attempts
    }

    fn record_failure(&self, key: &str) {
        let mut attempts = self.attempts.lock().expect("attempts lock poisoned");
        *attempts.entry(key.to_string()).or_insert(0) += 1;
    }

    fn clear_failures(&self, key: &str) {
        self.attempts
            .lock()
            .expect("attempts lock poisoned")
            .remove(key);
    }
}

/// Final path component of a URL or path.
fn basename(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
