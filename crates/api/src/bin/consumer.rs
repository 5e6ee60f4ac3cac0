//! `orderflow-consumer`: runs the consume loop and serves the stats surface
//! until Ctrl-C (or a fatal loop error).

use anyhow::Context;
use tracing::{error, info};

use orderflow_api::app::{build_app, services};
use orderflow_infra::PipelineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env().context("invalid configuration")?;
    orderflow_observability::init_with(config.log_format);

    let (consume_loop, state) =
        services::redis_consume_loop(&config).context("failed to connect to broker")?;
    let worker = consume_loop.spawn("order-consumer");

    let handle = worker.handle().clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("ctrl-c received; shutting down");
                handle.shutdown();
            }
            Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
        }
    });

    let listener = tokio::net::TcpListener::bind(config.stats.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.stats.addr))?;
    info!(addr = %listener.local_addr()?, "stats server listening");

    let (stopped_tx, stopped_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, build_app(state))
            .with_graceful_shutdown(async {
                let _ = stopped_rx.await;
            })
            .await
    });

    let loop_result = tokio::task::spawn_blocking(move || worker.join()).await?;
    let _ = stopped_tx.send(());
    server.await??;

    loop_result.context("consume loop failed")
}
