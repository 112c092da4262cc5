// SPDX-License-Identifier: MIT OR Apache-2.0
//! Worker binary: parses configuration, wires the production backends and
//! runs the loop until interrupted.

use amphi_blob::GcsBlobStore;
use amphi_budget::DatastoreBroker;
use amphi_catalog::DatastoreCatalog;
use amphi_core::Shutdown;
use amphi_datastore::{DatastoreClient, DatastoreConfig};
use amphi_index::{ElasticHealthProbe, ElasticIndexer};
use amphi_media::SoxTransformer;
use amphi_transcribe::SpeechTranscriber;
use amphi_worker::{Worker, WorkerConfig};
use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Exit code for runtime errors.
const EXIT_RUNTIME_ERROR: i32 = 1;

/// Fallback search-engine address when neither the flag nor the service
/// environment variables are set.
const DEFAULT_ELASTIC_ADDRESS: &str = "http://localhost:9200";

#[derive(Parser, Debug)]
#[command(
    name = "amphi-worker",
    version,
    about = "Budget-constrained lecture transcription worker"
)]
struct Cli {
    /// GCP project holding the catalog and the account.
    #[arg(long = "project_id")]
    project_id: String,

    /// Cloud storage bucket for intermediate artifacts.
    #[arg(long)]
    bucket: String,

    /// Path to the sox binary used for audio conversion.
    #[arg(long = "sox_path", default_value = "sox")]
    sox_path: String,

    /// Address of the search engine. When omitted it is composed from
    /// ELASTICSEARCH_SERVICE_HOST and ELASTICSEARCH_SERVICE_PORT, falling
    /// back to http://localhost:9200.
    #[arg(long = "elastic_address")]
    elastic_address: Option<String>,

    /// Log output format.
    #[arg(long = "log_type", value_enum, default_value_t = LogType::Text)]
    log_type: LogType,
}

/// Log formatter selection.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogType {
    /// Human-readable single-line output.
    Text,
    /// Structured JSON, one event per line.
    Json,
}

fn init_telemetry(log_type: LogType) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_type {
        LogType::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogType::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Resolve the search-engine address from the flag and the service
/// environment, flag first.
fn elastic_address(
    flag: Option<String>,
    env_host: Option<String>,
    env_port: Option<String>,
) -> String {
    if let Some(addr) = flag {
        return addr;
    }
    match (env_host, env_port) {
        (Some(host), Some(port)) => format!("http://{host}:{port}"),
        _ => DEFAULT_ELASTIC_ADDRESS.to_string(),
    }
}

async fn run(cli: Cli) -> Result<()> {
    if cli.project_id.is_empty() {
        bail!("--project_id must not be empty");
    }
    if cli.bucket.is_empty() {
        bail!("--bucket must not be empty");
    }

    let auth_token = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN").ok();

    let mut datastore_config = DatastoreConfig::new(&cli.project_id);
    if let Ok(emulator) = std::env::var("DATASTORE_EMULATOR_HOST") {
        datastore_config = datastore_config.with_base_url(format!("http://{emulator}"));
    }
    if let Some(token) = &auth_token {
        datastore_config = datastore_config.with_auth_token(token);
    }
    let datastore = DatastoreClient::new(datastore_config).context("building datastore client")?;

    let catalog = Arc::new(DatastoreCatalog::new(datastore.clone()));
    let broker = Arc::new(
        DatastoreBroker::connect(datastore)
            .await
            .context("binding budget account")?,
    );

    let mut blobs = GcsBlobStore::new(&cli.bucket).context("building blob store")?;
    let mut transcriber = SpeechTranscriber::new().context("building transcriber")?;
    if let Some(token) = &auth_token {
        blobs = blobs.with_auth_token(token);
        transcriber = transcriber.with_auth_token(token);
    }

    let elastic = elastic_address(
        cli.elastic_address,
        std::env::var("ELASTICSEARCH_SERVICE_HOST").ok(),
        std::env::var("ELASTICSEARCH_SERVICE_PORT").ok(),
    );
    let indexer = Arc::new(ElasticIndexer::new(&elastic).context("building indexer")?);
    let probe = Arc::new(ElasticHealthProbe::new(&elastic).context("building health probe")?);
    let media = Arc::new(SoxTransformer::new(&cli.sox_path));

    let worker = Worker::new(
        catalog,
        broker,
        Arc::new(blobs),
        media,
        Arc::new(transcriber),
        indexer,
        probe,
        WorkerConfig::default(),
    )
    .context("building worker")?;

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(target: "amphi.cli", "interrupt received, shutting down");
            signal.request();
        }
    });

    info!(target: "amphi.cli", elastic = %elastic, "worker created, entering loop");
    worker.run_loop(&shutdown).await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_telemetry(cli.log_type);
    if let Err(err) = run(cli).await {
        error!(target: "amphi.cli", error = %format!("{err:#}"), "worker exited with error");
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_wins_over_environment() {
        let addr = elastic_address(
            Some("http://search:9200".to_string()),
            Some("ignored".to_string()),
            Some("1".to_string()),
        );
        assert_eq!(addr, "http://search:9200");
    }

    #[test]
    fn environment_composes_the_address() {
        let addr = elastic_address(
            None,
            Some("es.svc".to_string()),
            Some("9200".to_string()),
        );
        assert_eq!(addr, "http://es.svc:9200");
    }

    #[test]
    fn missing_environment_falls_back_to_localhost() {
        assert_eq!(
            elastic_address(None, None, None),
            DEFAULT_ELASTIC_ADDRESS
        );
        assert_eq!(
            elastic_address(None, Some("es.svc".to_string()), None),
            DEFAULT_ELASTIC_ADDRESS
        );
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from([
            "amphi-worker",
            "--project_id",
            "proj",
            "--bucket",
            "bkt",
        ])
        .unwrap();
        assert_eq!(cli.sox_path, "sox");
        assert!(cli.elastic_address.is_none());
        assert!(matches!(cli.log_type, LogType::Text));
    }

    #[test]
    fn cli_requires_project_and_bucket() {
        assert!(Cli::try_parse_from(["amphi-worker"]).is_err());
        assert!(Cli::try_parse_from(["amphi-worker", "--project_id", "p"]).is_err());
    }

    #[test]
    fn cli_parses_log_type() {
        let cli = Cli::try_parse_from([
            "amphi-worker",
            "--project_id",
            "p",
            "--bucket",
            "b",
            "--log_type",
            "json",
        ])
        .unwrap();
        assert!(matches!(cli.log_type, LogType::Json));
    }
}
