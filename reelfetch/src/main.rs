use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use reelfetch::admission::AdmissionRunner;
use reelfetch::config::AgentConfig;
use reelfetch::dispatcher::{Dispatcher, Message, MessageStatus};
use reelfetch::downloader::probe_version;
use reelfetch::library::{Materializer, TemplateNamer};
use reelfetch::logging;
use reelfetch::pipeline::WorkerPool;
use reelfetch::provider::{CatalogProvider, ProviderRegistry};

/// Log dispatcher messages to the console.
fn log_message(message: &Message) {
    let progress = message
        .progress
        .map(|p| format!(" ({:.0}%)", p.percent()))
        .unwrap_or_default();
    match message.status {
        MessageStatus::Error => error!(id = %message.id, "{}{progress}", message.text),
        MessageStatus::Warning => warn!(id = %message.id, "{}{progress}", message.text),
        MessageStatus::Success | MessageStatus::Info => {
            info!(id = %message.id, "{}{progress}", message.text)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::load().context("failed to load configuration")?;
    let _log_guard = logging::init_logging(&config.logging)?;

    let root = CancellationToken::new();
    logging::start_retention_cleanup(&config.logging, root.child_token());

    match probe_version(&config.ffmpeg.binary_path).await {
        Some(version) => info!(%version, "ffmpeg detected"),
        None => warn!(path = %config.ffmpeg.binary_path, "ffmpeg not found, downloads will fail"),
    }

    let dispatcher = Dispatcher::with_capacity(config.mailbox_capacity);
    let _console = dispatcher.subscribe(log_message);

    let ffmpeg = Arc::new(config.ffmpeg.clone());
    let mut registry = ProviderRegistry::new();
    if let Some(ref catalog) = config.catalog_path {
        registry.register(Arc::new(CatalogProvider::new(catalog, ffmpeg.clone())));
    }
    if registry.is_empty() {
        warn!("no provider configured, set REELFETCH_CATALOG or catalog_path");
    }

    let materializer = Arc::new(Materializer::new(
        &config.library_root,
        Arc::new(TemplateNamer::new(config.naming.clone())),
        dispatcher.clone(),
        &config.container,
    ));
    let pool = Arc::new(WorkerPool::new(config.pool.clone(), &root));
    let mut runner = AdmissionRunner::new(
        registry,
        pool.clone(),
        materializer,
        config.rate_limiter_config()?,
    );

    let shutdown = root.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            shutdown.cancel();
        }
    });

    info!(
        library = %config.library_root.display(),
        tasks = config.watch.len(),
        workers = pool.max_workers(),
        "starting run"
    );
    let report = runner.run(&root, &config.watch).await;

    // Downloads may run for hours; the deadline only starts after an interrupt.
    if let Err(e) = pool.stop_on(&root, config.drain_deadline()).await {
        warn!(error = %e, "pool did not drain cleanly");
    }
    let stats = pool.stats();
    info!(
        accepted = report.accepted,
        duplicates = report.duplicates,
        already_present = report.already_present,
        rejected = report.failed,
        completed = stats.completed,
        failed = stats.failed + stats.panicked,
        cancelled = stats.cancelled,
        "run finished"
    );

    root.cancel();
    Ok(())
}
