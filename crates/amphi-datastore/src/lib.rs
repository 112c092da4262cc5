// SPDX-License-Identifier: MIT OR Apache-2.0
//! Minimal Google Datastore REST v1 client.
//!
//! Covers exactly what the catalog and budget backends need: entity lookup,
//! transactional commits, and structured queries. Authentication is a bearer
//! token supplied by the deployment (workload identity sidecar, `gcloud auth
//! print-access-token`, ...); against the emulator no token is needed and the
//! base URL points at `DATASTORE_EMULATOR_HOST`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod types;

pub use types::{Direction, Entity, Key, Op, PathElement, Query, Value};

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Default public API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://datastore.googleapis.com";

/// Per-request timeout. Datastore calls are small; anything slower than this
/// is treated as a transient failure and retried by the worker loop.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for [`DatastoreClient`].
#[derive(Clone, Debug)]
pub struct DatastoreConfig {
    /// GCP project id the entities live in.
    pub project_id: String,
    /// API endpoint, overridable for the emulator.
    pub base_url: String,
    /// Optional OAuth bearer token.
    pub auth_token: Option<String>,
}

impl DatastoreConfig {
    /// Config against the public endpoint for the given project.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            auth_token: None,
        }
    }

    /// Point the client at a different endpoint (emulator, test double).
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
}

/// Errors surfaced by the Datastore client.
#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    /// Transport-level failure (connect, timeout, decode).
    #[error("datastore transport: {0}")]
    Transport(#[from] reqwest::Error),
    /// The API answered with a non-success status.
    #[error("datastore returned status {code}: {body}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// Response body, as returned by the API.
        body: String,
    },
    /// A property had an unexpected type or was absent.
    #[error("entity property {0:?} is missing or has the wrong type")]
    Property(String),
}

/// Thin async client over the Datastore REST v1 surface.
#[derive(Clone, Debug)]
pub struct DatastoreClient {
    http: reqwest::Client,
    config: DatastoreConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LookupRequest<'a> {
    keys: Vec<&'a Key>,
    #[serde(skip_serializing_if = "Option::is_none")]
    read_options: Option<ReadOptions<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadOptions<'a> {
    transaction: &'a str,
}

#[derive(serde::Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct LookupResponse {
    found: Vec<FoundEntity>,
}

#[derive(serde::Deserialize)]
struct FoundEntity {
    entity: Entity,
}

#[derive(serde::Deserialize)]
struct BeginTransactionResponse {
    transaction: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommitRequest {
    mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction: Option<String>,
    mutations: Vec<Mutation>,
}

/// One write inside a commit.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Mutation {
    /// Create or replace the entity.
    #[serde(rename = "upsert")]
    Upsert(Entity),
    /// Replace an entity that must already exist.
    #[serde(rename = "update")]
    Update(Entity),
}

#[derive(Serialize)]
struct RunQueryRequest {
    query: Query,
}

#[derive(serde::Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RunQueryResponse {
    batch: QueryBatch,
}

#[derive(serde::Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct QueryBatch {
    entity_results: Vec<EntityResult>,
    end_cursor: Option<String>,
}

#[derive(serde::Deserialize)]
struct EntityResult {
    entity: Entity,
}

/// Result of [`DatastoreClient::run_query`].
#[derive(Debug)]
pub struct QueryResults {
    /// Entities in result order.
    pub entities: Vec<Entity>,
    /// Cursor positioned after the last result, for pagination.
    pub end_cursor: Option<String>,
}

impl DatastoreClient {
    /// Build a client; fails only if the TLS backend cannot initialize.
    pub fn new(config: DatastoreConfig) -> Result<Self, DatastoreError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http, config })
    }

    /// Open a new transaction and return its opaque id.
    pub async fn begin_transaction(&self) -> Result<String, DatastoreError> {
        let resp: BeginTransactionResponse = self
            .call("beginTransaction", &serde_json::json!({}))
            .await?;
        Ok(resp.transaction)
    }

    /// Fetch a single entity, optionally inside a transaction.
    ///
    /// Returns `None` when the key does not exist.
    pub async fn lookup(
        &self,
        key: &Key,
        transaction: Option<&str>,
    ) -> Result<Option<Entity>, DatastoreError> {
        let req = LookupRequest {
            keys: vec![key],
            read_options: transaction.map(|t| ReadOptions { transaction: t }),
        };
        let resp: LookupResponse = self.call("lookup", &req).await?;
        Ok(resp.found.into_iter().next().map(|f| f.entity))
    }

    /// Commit the given mutations inside `transaction`.
    pub async fn commit(
        &self,
        transaction: String,
        mutations: Vec<Mutation>,
    ) -> Result<(), DatastoreError> {
        let req = CommitRequest {
            mode: "TRANSACTIONAL",
            transaction: Some(transaction),
            mutations,
        };
        let _: serde_json::Value = self.call("commit", &req).await?;
        Ok(())
    }

    /// Commit the given mutations outside any transaction.
    pub async fn commit_non_transactional(
        &self,
        mutations: Vec<Mutation>,
    ) -> Result<(), DatastoreError> {
        let req = CommitRequest {
            mode: "NON_TRANSACTIONAL",
            transaction: None,
            mutations,
        };
        let _: serde_json::Value = self.call("commit", &req).await?;
        Ok(())
    }

    /// Run a structured query.
    pub async fn run_query(&self, query: Query) -> Result<QueryResults, DatastoreError> {
        let resp: RunQueryResponse = self.call("runQuery", &RunQueryRequest { query }).await?;
        Ok(QueryResults {
            entities: resp
                .batch
                .entity_results
                .into_iter()
                .map(|r| r.entity)
                .collect(),
            end_cursor: resp.batch.end_cursor,
        })
    }

    async fn call<B: Serialize, R: DeserializeOwned>(
        &self,
        verb: &str,
        body: &B,
    ) -> Result<R, DatastoreError> {
        let url = format!(
            "{}/v1/projects/{}:{verb}",
            self.config.base_url, self.config.project_id
        );
        debug!(target: "amphi.datastore", %url, "datastore call");
        let mut req = self.http.post(&url).json(body);
        if let Some(token) = &self.config.auth_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DatastoreError::Status {
                code: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> DatastoreClient {
        DatastoreClient::new(
            DatastoreConfig::new("test-project").with_base_url(server.uri()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn begin_transaction_returns_opaque_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/test-project:beginTransaction"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"transaction": "tx1"})),
            )
            .mount(&server)
            .await;
        assert_eq!(client(&server).begin_transaction().await.unwrap(), "tx1");
    }

    #[tokio::test]
    async fn lookup_found_and_missing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/test-project:lookup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "found": [{"entity": {
                    "key": {"path": [{"kind": "Account", "name": "acc_usd"}]},
                    "properties": {"BalanceInUsdCents": {"integerValue": "42"}}
                }}]
            })))
            .mount(&server)
            .await;
        let key = Key::named("Account", "acc_usd");
        let entity = client(&server).lookup(&key, None).await.unwrap().unwrap();
        assert_eq!(entity.get_i64("BalanceInUsdCents").unwrap(), 42);

        let empty = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/test-project:lookup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&empty)
            .await;
        assert!(client(&empty).lookup(&key, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lookup_in_transaction_sends_read_options() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/test-project:lookup"))
            .and(body_partial_json(
                serde_json::json!({"readOptions": {"transaction": "tx9"}}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;
        let key = Key::named("Entry", "e1");
        client(&server).lookup(&key, Some("tx9")).await.unwrap();
    }

    #[tokio::test]
    async fn commit_sends_transactional_mutations() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/test-project:commit"))
            .and(body_partial_json(serde_json::json!({
                "mode": "TRANSACTIONAL",
                "transaction": "tx2",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;
        let mut entity = Entity::new(Key::named("Account", "acc_usd"));
        entity.set("BalanceInUsdCents", Value::integer(7));
        client(&server)
            .commit("tx2".to_string(), vec![Mutation::Update(entity)])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_success_status_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409).set_body_string("contention"))
            .mount(&server)
            .await;
        let err = client(&server).begin_transaction().await.unwrap_err();
        match err {
            DatastoreError::Status { code, body } => {
                assert_eq!(code, 409);
                assert_eq!(body, "contention");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn run_query_parses_entities_and_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/test-project:runQuery"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "batch": {
                    "entityResults": [
                        {"entity": {
                            "key": {"path": [{"kind": "Entry", "name": "e1"}]},
                            "properties": {"DurationSec": {"integerValue": "600"}}
                        }}
                    ],
                    "endCursor": "abc=="
                }
            })))
            .mount(&server)
            .await;
        let results = client(&server)
            .run_query(Query::kind("Entry").limit(1))
            .await
            .unwrap();
        assert_eq!(results.entities.len(), 1);
        assert_eq!(results.entities[0].get_i64("DurationSec").unwrap(), 600);
        assert_eq!(results.end_cursor.as_deref(), Some("abc=="));
    }
}
