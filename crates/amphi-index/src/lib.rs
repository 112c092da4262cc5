// SPDX-License-Identifier: MIT OR Apache-2.0
//! Full-text indexing of transcript sentences.
//!
//! Each transcribed sentence becomes one search document carrying the
//! record's descriptive metadata and a serial number, inserted in a single
//! `_bulk` call. The readiness probe asks the same cluster whether it is
//! healthy enough to accept work at all.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use amphi_core::Lesson;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Search index every document lands in.
const INDEX_NAME: &str = "course";
/// Mapping type shared by all documents.
const DOC_TYPE: &str = "transcript";

/// Per-request timeout for bulk inserts.
const INDEX_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-request timeout for the health probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors surfaced by the indexer.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Transport-level failure.
    #[error("index transport: {0}")]
    Transport(#[from] reqwest::Error),
    /// The engine answered with a non-success status.
    #[error("search engine returned status {code}: {body}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// Response body.
        body: String,
    },
    /// A document failed to serialize.
    #[error("encoding bulk body: {0}")]
    Encode(#[from] serde_json::Error),
    /// The bulk response reported per-item errors or contained no items.
    #[error("bulk insert rejected: errors={errors}, items={items}")]
    Rejected {
        /// The response's `errors` flag.
        errors: bool,
        /// Number of items the response acknowledged.
        items: usize,
    },
}

/// Capability contract for transcript indexing.
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Insert one document per sentence, all carrying the record's
    /// metadata. An empty sentence list is a no-op.
    async fn index(&self, lesson: &Lesson, sentences: &[String]) -> Result<(), IndexError>;
}

/// Capability contract for the downstream readiness gate.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Whether the search engine can accept writes right now.
    async fn is_healthy(&self) -> bool;
}

// ── Elasticsearch backends ──────────────────────────────────────────

#[derive(Serialize)]
struct BulkAction {
    index: BulkActionMeta,
}

#[derive(Serialize)]
struct BulkActionMeta {
    #[serde(rename = "_index")]
    index: &'static str,
    #[serde(rename = "_type")]
    doc_type: &'static str,
}

#[derive(Serialize)]
struct Document<'a> {
    #[serde(flatten)]
    lesson: &'a Lesson,
    transcript: &'a str,
    #[serde(rename = "Serial")]
    serial: usize,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct BulkResponse {
    errors: bool,
    items: Vec<serde_json::Value>,
}

/// NDJSON body of one bulk insert: alternating action and document lines,
/// newline-terminated.
fn bulk_body(lesson: &Lesson, sentences: &[String]) -> Result<String, serde_json::Error> {
    let action = serde_json::to_string(&BulkAction {
        index: BulkActionMeta {
            index: INDEX_NAME,
            doc_type: DOC_TYPE,
        },
    })?;
    let mut body = String::new();
    for (serial, sentence) in sentences.iter().enumerate() {
        body.push_str(&action);
        body.push('\n');
        body.push_str(&serde_json::to_string(&Document {
            lesson,
            transcript: sentence,
            serial,
        })?);
        body.push('\n');
    }
    Ok(body)
}

/// Indexer posting to an Elasticsearch `_bulk` endpoint.
#[derive(Clone, Debug)]
pub struct ElasticIndexer {
    http: reqwest::Client,
    host: String,
}

impl ElasticIndexer {
    /// Indexer against the given cluster address.
    pub fn new(host: impl Into<String>) -> Result<Self, IndexError> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(INDEX_TIMEOUT).build()?,
            host: host.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Indexer for ElasticIndexer {
    async fn index(&self, lesson: &Lesson, sentences: &[String]) -> Result<(), IndexError> {
        if sentences.is_empty() {
            return Ok(());
        }
        let body = bulk_body(lesson, sentences)?;
        debug!(target: "amphi.index", sentences = sentences.len(), "bulk insert");
        let resp = self
            .http
            .post(format!("{}/_bulk", self.host))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(IndexError::Status {
                code: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let bulk: BulkResponse = resp.json().await?;
        if bulk.errors || bulk.items.is_empty() {
            return Err(IndexError::Rejected {
                errors: bulk.errors,
                items: bulk.items.len(),
            });
        }
        Ok(())
    }
}

/// Readiness probe over the cluster health endpoint.
#[derive(Clone, Debug)]
pub struct ElasticHealthProbe {
    http: reqwest::Client,
    host: String,
}

impl ElasticHealthProbe {
    /// Probe against the given cluster address.
    pub fn new(host: impl Into<String>) -> Result<Self, IndexError> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(HEALTH_TIMEOUT).build()?,
            host: host.into().trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Deserialize)]
struct ClusterHealth {
    status: String,
}

#[async_trait]
impl HealthProbe for ElasticHealthProbe {
    async fn is_healthy(&self) -> bool {
        let url = format!("{}/_cluster/health", self.host);
        let Ok(resp) = self.http.get(&url).send().await else {
            return false;
        };
        if !resp.status().is_success() {
            return false;
        }
        match resp.json::<ClusterHealth>().await {
            Ok(health) => health.status == "green" || health.status == "yellow",
            Err(_) => false,
        }
    }
}

// ── Test doubles ────────────────────────────────────────────────────

/// Recording indexer used by tests and the end-to-end scenarios.
#[derive(Debug, Default)]
pub struct MemoryIndexer {
    calls: Mutex<Vec<(Lesson, Vec<String>)>>,
    rejecting: AtomicBool,
}

impl MemoryIndexer {
    /// Indexer accepting everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail as a rejected bulk insert.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// All recorded calls.
    pub fn calls(&self) -> Vec<(Lesson, Vec<String>)> {
        self.calls.lock().expect("calls lock poisoned").clone()
    }
}

#[async_trait]
impl Indexer for MemoryIndexer {
    async fn index(&self, lesson: &Lesson, sentences: &[String]) -> Result<(), IndexError> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(IndexError::Rejected {
                errors: true,
                items: 0,
            });
        }
        if sentences.is_empty() {
            return Ok(());
        }
        self.calls
            .lock()
            .expect("calls lock poisoned")
            .push((lesson.clone(), sentences.to_vec()));
        Ok(())
    }
}

/// Probe with a fixed answer, used by tests and the end-to-end scenarios.
#[derive(Debug)]
pub struct StaticHealthProbe {
    healthy: AtomicBool,
}

impl StaticHealthProbe {
    /// Probe that always answers `healthy`.
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
        }
    }

    /// Flip the answer.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthProbe for StaticHealthProbe {
    async fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn lesson() -> Lesson {
        Lesson {
            title: "Title".to_string(),
            lecturer: "Lecturer".to_string(),
            chaire: "Chaire".to_string(),
            audio_url: "http://a/x.mp3".to_string(),
            source_url: "http://a/x.htm".to_string(),
            duration_secs: 600,
            ..Lesson::default()
        }
    }

    // ── Bulk body format ────────────────────────────────────────────

    #[test]
    fn bulk_body_alternates_action_and_document_lines() {
        let sentences = vec!["line 1".to_string(), "line 2".to_string()];
        let body = bulk_body(&lesson(), &sentences).unwrap();
        assert!(body.ends_with('\n'), "body must be newline-terminated");
        let lines: Vec<&str> = body.trim_end().split('\n').collect();
        assert_eq!(lines.len(), 4);

        let action: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(
            action,
            serde_json::json!({"index": {"_index": "course", "_type": "transcript"}})
        );
        let first: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(first["transcript"], "line 1");
        assert_eq!(first["Serial"], 0);
        assert_eq!(first["title"], "Title");
        assert_eq!(first["duration"], 600);
        let second: serde_json::Value = serde_json::from_str(lines[3]).unwrap();
        assert_eq!(second["transcript"], "line 2");
        assert_eq!(second["Serial"], 1);
    }

    // ── ElasticIndexer ──────────────────────────────────────────────

    async fn indexer(server: &MockServer) -> ElasticIndexer {
        ElasticIndexer::new(server.uri()).unwrap()
    }

    #[tokio::test]
    async fn successful_bulk_insert() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .and(header("content-type", "application/x-ndjson"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "took": 3, "errors": false, "items": [{"index": {}}, {"index": {}}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        indexer(&server)
            .await
            .index(&lesson(), &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn errors_flag_fails_the_step_regardless_of_items() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "took": 3, "errors": true, "items": [{"index": {}}]
            })))
            .mount(&server)
            .await;
        let err = indexer(&server)
            .await
            .index(&lesson(), &["a".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Rejected { errors: true, items: 1 }));
    }

    #[tokio::test]
    async fn empty_items_fail_the_step() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "took": 0, "errors": false, "items": []
            })))
            .mount(&server)
            .await;
        let err = indexer(&server)
            .await
            .index(&lesson(), &["a".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Rejected { errors: false, items: 0 }));
    }

    #[tokio::test]
    async fn empty_sentence_list_skips_the_engine() {
        let server = MockServer::start().await;
        // No mock mounted: any request would come back as an error status.
        indexer(&server).await.index(&lesson(), &[]).await.unwrap();
    }

    #[tokio::test]
    async fn http_error_status_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;
        let err = indexer(&server)
            .await
            .index(&lesson(), &["a".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Status { code: 503, .. }));
    }

    // ── ElasticHealthProbe ──────────────────────────────────────────

    async fn probe_with_status(status: &str) -> bool {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_cluster/health"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": status})),
            )
            .mount(&server)
            .await;
        ElasticHealthProbe::new(server.uri())
            .unwrap()
            .is_healthy()
            .await
    }

    #[tokio::test]
    async fn green_and_yellow_are_healthy() {
        assert!(probe_with_status("green").await);
        assert!(probe_with_status("yellow").await);
    }

    #[tokio::test]
    async fn red_is_unhealthy() {
        assert!(!probe_with_status("red").await);
    }

    #[tokio::test]
    async fn transport_and_decode_failures_are_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        assert!(
            !ElasticHealthProbe::new(server.uri())
                .unwrap()
                .is_healthy()
                .await
        );

        let garbled = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&garbled)
            .await;
        assert!(
            !ElasticHealthProbe::new(garbled.uri())
                .unwrap()
                .is_healthy()
                .await
        );
    }

    // ── Test doubles ────────────────────────────────────────────────

    #[tokio::test]
    async fn memory_indexer_records_calls_and_can_reject() {
        let mem = MemoryIndexer::new();
        mem.index(&lesson(), &["a".to_string()]).await.unwrap();
        assert_eq!(mem.calls().len(), 1);
        mem.set_rejecting(true);
        assert!(mem.index(&lesson(), &["b".to_string()]).await.is_err());
        assert_eq!(mem.calls().len(), 1);
    }

    #[tokio::test]
    async fn static_probe_answers_and_flips() {
        let probe = StaticHealthProbe::new(true);
        assert!(probe.is_healthy().await);
        probe.set_healthy(false);
        assert!(!probe.is_healthy().await);
    }
}
