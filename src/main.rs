use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use evecs::config::Settings;
use evecs::engine::{Deadline, Engine};
use evecs::notify::NotifyHub;
use evecs::repairer;
use evecs::store::{DocumentStore, LocalStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env();
    evecs::observability::init(settings.metrics_port)?;

    std::fs::create_dir_all(&settings.data_dir)?;
    let store = Arc::new(LocalStore::open(settings.wal_path(), settings.transactions)?);
    let dyn_store: Arc<dyn DocumentStore> = store.clone();
    let engine = Arc::new(
        Engine::new(dyn_store, Arc::new(NotifyHub::new()), settings.engine_config()).await?,
    );

    info!("evecs started");
    info!("  data_dir: {}", settings.data_dir.display());
    info!("  policy: {:?}", settings.policy);
    info!("  transactions: {}", if settings.transactions { "on" } else { "off" });
    info!(
        "  metrics: {}",
        settings
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Finish whatever a previous run left half-done.
    let reports = engine.repair_all(Deadline::within(Duration::from_secs(60))).await?;
    let dirty = reports.iter().filter(|r| !r.is_clean()).count();
    info!("startup repair: {} location(s) checked, {dirty} fixed", reports.len());

    let repair_engine = engine.clone();
    let repair_every = settings.repair_interval;
    let stale_after = settings.stale_pending;
    let repair_task = tokio::spawn(async move {
        repairer::run_repairer(repair_engine, repair_every, stale_after).await;
    });
    let compact_store = store.clone();
    let threshold = settings.compact_threshold;
    let compact_task = tokio::spawn(async move {
        repairer::run_compactor(compact_store, threshold, Duration::from_secs(30)).await;
    });

    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received");
    repair_task.abort();
    compact_task.abort();
    if let Err(e) = store.compact().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("evecs stopped");
    Ok(())
}
