use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobrelay_observability::init();

    let settings = jobrelay_infra::Settings::from_env().context("invalid configuration")?;

    tracing::info!(
        queue = %settings.redis.queue,
        consumer = %settings.worker.consumer_name,
        concurrency = settings.worker.concurrency,
        "starting jobrelay worker"
    );

    jobrelay_worker::app::run(settings, shutdown_signal()).await?;

    tracing::info!("jobrelay worker exited");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested; draining in-flight jobs");
}
