use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{info, warn};

use chargewatch::clock::WallClock;
use chargewatch::config::Config;
use chargewatch::driver;
use chargewatch::record::PushMessage;
use chargewatch::source::{BookingSource, JsonFileSource, StaticSource};

const MAX_LINE_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    chargewatch::observability::init(config.metrics_port)?;

    let source: Arc<dyn BookingSource> = match &config.snapshot_file {
        Some(path) => Arc::new(JsonFileSource::new(path)),
        None => Arc::new(StaticSource::new(Vec::new())),
    };
    info!("chargewatch starting");
    info!(
        "  snapshot: {}",
        config
            .snapshot_file
            .as_ref()
            .map_or("none".to_string(), |p| p.display().to_string())
    );
    info!("  utc_offset: {}", config.driver.engine.utc_offset);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let (handle, driver_task) = driver::spawn(
        config.driver.clone(),
        WallClock,
        source,
        config.charger_ids.clone(),
    );

    let mut changes = handle.subscribe_all();
    let logger = tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => info!(
                    charger = %change.charger_id,
                    busy = change.busy,
                    revision = change.revision,
                    "availability changed"
                ),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("availability log lagged, skipped {n} changes")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Graceful shutdown on SIGTERM/ctrl-c or end of input
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    warn!("failed to register SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    let mut lines = FramedRead::new(
        tokio::io::stdin(),
        LinesCodec::new_with_max_length(MAX_LINE_BYTES),
    );
    loop {
        tokio::select! {
            line = lines.next() => {
                let line = match line {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        warn!("unreadable input line: {e}");
                        continue;
                    }
                    None => {
                        info!("input closed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<PushMessage>(&line) {
                    Ok(message) => {
                        if handle.push(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("malformed push message: {e}");
                        metrics::counter!(
                            chargewatch::observability::EVENTS_REJECTED_TOTAL,
                            "reason" => "malformed"
                        )
                        .increment(1);
                    }
                }
            }
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    handle.shutdown().await;
    if let Err(e) = driver_task.await {
        warn!("driver task ended abnormally: {e}");
    }
    drop(handle);
    logger.abort();
    info!("chargewatch stopped");
    Ok(())
}
