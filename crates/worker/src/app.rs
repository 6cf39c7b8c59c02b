use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use jobrelay_broker::Broker;
use jobrelay_infra::broker::RedisStreamsBroker;
use jobrelay_infra::jobs::handlers::{DirectoryDocumentSink, DocumentSink};
use jobrelay_infra::jobs::{self, HandlerDeps, RegistryLoader, WorkerRuntime};
use jobrelay_infra::{ConfigError, Settings};

/// Where `generatePDF` output goes for these settings.
///
/// A long-running worker writes to disk; there is no in-memory fallback.
pub fn document_sink(settings: &Settings) -> Result<Arc<dyn DocumentSink>, ConfigError> {
    let dir = settings.require_pdf_output_dir()?;
    info!(dir = %dir.display(), "writing generated documents to disk");
    Ok(Arc::new(DirectoryDocumentSink::new(dir)))
}

/// Compose the worker runtime over an already connected broker.
pub fn build_runtime(
    broker: Arc<dyn Broker>,
    settings: &Settings,
) -> Result<WorkerRuntime, ConfigError> {
    let deps = HandlerDeps {
        documents: document_sink(settings)?,
    };
    Ok(WorkerRuntime::new(
        broker,
        RegistryLoader::new(jobs::catalog(&deps)),
        settings.worker.clone(),
    ))
}

/// Connect to Redis and run the worker until `shutdown` resolves.
pub async fn run<F>(settings: Settings, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send,
{
    // Fail on configuration before touching the network.
    settings
        .require_pdf_output_dir()
        .context("invalid configuration")?;

    let broker = RedisStreamsBroker::connect(&settings.redis)
        .await
        .with_context(|| format!("connecting to broker at {}", settings.redis.url))?;

    info!(
        stream = broker.stream_key(),
        group = %settings.redis.consumer_group,
        "broker ready"
    );

    let runtime = build_runtime(Arc::new(broker), &settings).context("invalid configuration")?;
    let worker = runtime.worker().await.context("starting worker")?;

    worker.run(shutdown).await.context("worker stopped")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use serde_json::json;

    use jobrelay_broker::InMemoryBroker;
    use jobrelay_infra::jobs::WorkerError;

    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| map.get(key).cloned()).unwrap()
    }

    #[test]
    fn output_dir_is_required() {
        let err = build_runtime(InMemoryBroker::arc(), &settings(&[])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing {
                key: "JOBRELAY_PDF_OUTPUT_DIR"
            }
        );
    }

    #[tokio::test]
    async fn run_rejects_missing_output_dir_before_connecting() {
        // Unroutable URL: reaching the broker would hang or fail differently.
        let settings = settings(&[("REDIS_URL", "redis://192.0.2.1:6379")]);

        let err = run(settings, std::future::pending()).await.unwrap_err();

        assert!(err.downcast_ref::<ConfigError>().is_some());
    }

    #[tokio::test]
    async fn runtime_registers_bundled_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let broker = InMemoryBroker::arc();
        let runtime = build_runtime(
            broker.clone(),
            &settings(&[
                ("JOBRELAY_BLOCK_MS", "20"),
                ("JOBRELAY_PDF_OUTPUT_DIR", dir.path().to_str().unwrap()),
            ]),
        )
        .unwrap();

        let worker = runtime.worker().await.unwrap();

        assert_eq!(broker.subscription_count(), 1);
        assert_eq!(worker.config().receive_wait, Duration::from_millis(20));
        assert!(runtime.loader().build().registry.contains("generatePDF"));
    }

    #[tokio::test]
    async fn generated_documents_land_in_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("pdf");
        let broker = InMemoryBroker::arc();
        let runtime = build_runtime(
            broker.clone(),
            &settings(&[
                ("JOBRELAY_BLOCK_MS", "20"),
                ("JOBRELAY_PDF_OUTPUT_DIR", out.to_str().unwrap()),
            ]),
        )
        .unwrap();

        let handle = runtime.worker().await.unwrap().spawn();
        let id = runtime
            .queue()
            .enqueue("generatePDF", &json!({"hello": "world"}))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let done = runtime
                    .queue()
                    .status(id)
                    .await
                    .unwrap()
                    .is_some_and(|r| r.state.is_terminal());
                if done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        handle.shutdown().await.unwrap();

        let files: Vec<_> = std::fs::read_dir(&out).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn strict_mode_is_carried_into_worker_config() {
        let dir = tempfile::tempdir().unwrap();
        let broker = InMemoryBroker::arc();
        let settings = settings(&[
            ("JOBRELAY_FAIL_ON_REGISTRATION_ERROR", "true"),
            ("JOBRELAY_PDF_OUTPUT_DIR", dir.path().to_str().unwrap()),
        ]);
        let runtime = build_runtime(broker, &settings).unwrap();

        // The bundled catalog is valid, so strict mode still starts.
        let started: Result<_, WorkerError> = runtime.worker().await;
        assert!(started.is_ok());
        assert!(started.unwrap().config().fail_on_registration_error);
    }
}
