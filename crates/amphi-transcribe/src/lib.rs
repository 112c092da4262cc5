// SPDX-License-Identifier: MIT OR Apache-2.0
//! Long-running speech recognition over blob URIs.
//!
//! A transcription request is submitted once, then the returned operation is
//! polled until it reports completion. Individual HTTP calls are bounded at
//! ten seconds; the overall operation is not — recognizing three hours of
//! audio legitimately takes a long time. Cancellation aborts the poll loop
//! at the next tick.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use amphi_core::{Shutdown, Transcription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Language used when a record carries no usable tag.
pub const DEFAULT_LANGUAGE: &str = "fr-FR";

/// Per-HTTP-request timeout; the poll loop itself is unbounded.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between two polls of a pending operation.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Errors surfaced by the transcriber.
#[derive(Debug, thiserror::Error)]
pub enum TranscribeError {
    /// Transport-level failure; retryable at the record level.
    #[error("speech transport: {0}")]
    Transport(#[from] reqwest::Error),
    /// The API answered with a non-success status.
    #[error("speech service returned status {code}: {body}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// Response body.
        body: String,
    },
    /// The operation completed carrying an error.
    #[error("recognition failed: {0}")]
    Operation(String),
    /// The operation completed with neither error nor response.
    #[error("recognition completed without a response body")]
    MissingResponse,
    /// The worker was asked to shut down mid-poll.
    #[error("transcription cancelled")]
    Cancelled,
}

/// Capability contract for speech recognition.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Recognize the audio behind `uri`, biased by the given vocabulary
    /// hints. Returns one fragment per result segment, keeping the
    /// recognizer's first alternative.
    async fn transcribe(
        &self,
        language: &str,
        uri: &str,
        hints: &[String],
        shutdown: &Shutdown,
    ) -> Result<Vec<Transcription>, TranscribeError>;
}

/// Map a record's language tag to a recognizer language code.
///
/// Empty and unrecognized tags fall back to [`DEFAULT_LANGUAGE`]; full tags
/// containing a region are passed through unchanged.
pub fn language_code(tag: &str) -> String {
    let tag = tag.trim();
    if tag.contains('-') {
        return tag.to_string();
    }
    match tag.to_ascii_lowercase().as_str() {
        "fr" => "fr-FR",
        "en" => "en-US",
        "de" => "de-DE",
        "es" => "es-ES",
        "it" => "it-IT",
        _ => DEFAULT_LANGUAGE,
    }
    .to_string()
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecognizeRequest<'a> {
    config: RecognitionConfig<'a>,
    audio: RecognitionAudio<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecognitionConfig<'a> {
    encoding: &'static str,
    sample_rate_hertz: u32,
    language_code: &'a str,
    speech_contexts: Vec<SpeechContext<'a>>,
}

#[derive(Serialize)]
struct SpeechContext<'a> {
    phrases: &'a [String],
}

#[derive(Serialize)]
struct RecognitionAudio<'a> {
    uri: &'a str,
}

#[derive(Deserialize)]
struct OperationName {
    name: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct Operation {
    done: bool,
    error: Option<OperationStatus>,
    response: Option<RecognizeResponse>,
}

#[derive(Deserialize)]
struct OperationStatus {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RecognizeResponse {
    results: Vec<SpeechResult>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SpeechResult {
    alternatives: Vec<Alternative>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Alternative {
    transcript: String,
    confidence: f32,
}

// ── REST backend ────────────────────────────────────────────────────

/// Transcriber backed by the speech REST API.
#[derive(Clone, Debug)]
pub struct SpeechTranscriber {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    poll_interval: Duration,
}

impl SpeechTranscriber {
    /// Transcriber against the public endpoint.
    pub fn new() -> Result<Self, TranscribeError> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()?,
            base_url: "https://speech.googleapis.com".to_string(),
            auth_token: None,
            poll_interval: POLL_INTERVAL,
        })
    }

    /// Point the transcriber at a different endpoint (test double).
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

    /// Override the poll cadence; test hook.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn submit(
        &self,
        language_code: &str,
        uri: &str,
        hints: &[String],
    ) -> Result<String, TranscribeError> {
        let request = RecognizeRequest {
            config: RecognitionConfig {
                encoding: "FLAC",
                sample_rate_hertz: 16_000,
                language_code,
                speech_contexts: vec![SpeechContext { phrases: hints }],
            },
            audio: RecognitionAudio { uri },
        };
        let url = format!("{}/v1/speech:longrunningrecognize", self.base_url);
        let resp = self
            .authorize(self.http.post(&url))
            .json(&request)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TranscribeError::Status {
                code: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let op: OperationName = resp.json().await?;
        Ok(op.name)
    }

    async fn poll(&self, name: &str) -> Result<Operation, TranscribeError> {
        let url = format!("{}/v1/operations/{name}", self.base_url);
        let resp = self.authorize(self.http.get(&url)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TranscribeError::Status {
                code: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl Transcriber for SpeechTranscriber {
    async fn transcribe(
        &self,
        language: &str,
        uri: &str,
        hints: &[String],
        shutdown: &Shutdown,
    ) -> Result<Vec<Transcription>, TranscribeError> {
        let code = language_code(language);
        let name = self.submit(&code, uri, hints).await?;
        debug!(target: "amphi.transcribe", operation = %name, %uri, language = %code, "recognition submitted");

        loop {
            if shutdown.is_requested() {
                return Err(TranscribeError::Cancelled);
            }
            let op = self.poll(&name).await?;
            if op.done {
                if let Some(status) = op.error {
                    return Err(TranscribeError::Operation(status.message));
                }
                let response = op.response.ok_or(TranscribeError::MissingResponse)?;
                let fragments = response
                    .results
                    .into_iter()
                    .filter_map(|r| r.alternatives.into_iter().next())
                    .map(|a| Transcription {
                        text: a.transcript,
                        confidence: a.confidence,
                    })
                    .collect();
                return Ok(fragments);
            }
            tokio::select! {
                _ = shutdown.requested() => return Err(TranscribeError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
