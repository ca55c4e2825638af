//! Long-lived `watch` and one-shot `scan`.

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::pipeline::Pipeline;

/// Watch until SIGINT/SIGTERM, then drain and exit.
pub async fn watch(settings: Settings) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_settings(settings).context("Failed to start pipeline")?;

    let cancel = CancellationToken::new();
    let signal = tokio::spawn(shutdown_signal(cancel.clone()));

    let result = pipeline.run(cancel).await;
    signal.abort();

    let stats = result.context("Pipeline stopped with an error")?;
    if stats.failed > 0 {
        eprintln!("{} paths failed; they will be retried on the next run", stats.failed);
    }
    Ok(())
}

pub async fn scan(settings: Settings) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_settings(settings).context("Failed to start pipeline")?;
    let stats = pipeline.scan().await.context("Scan failed")?;

    println!(
        "Scan complete: {} stored, {} unchanged, {} failed",
        stats.completed, stats.unchanged, stats.failed
    );
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("[cli] cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    eprintln!("Received shutdown signal");
    cancel.cancel();
}
