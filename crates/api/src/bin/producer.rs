//! `orderflow-producer`: publishes synthetic orders until Ctrl-C.

use anyhow::Context;
use tracing::info;

use orderflow_api::app::services;
use orderflow_infra::PipelineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env().context("invalid configuration")?;
    orderflow_observability::init_with(config.log_format);

    let generator =
        services::start_redis_generator(&config).context("failed to connect to broker")?;
    info!(
        topic = %config.topics.orders,
        rate = config.generator.messages_per_second,
        "producer running; press ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await?;
    let published = tokio::task::spawn_blocking(move || generator.stop()).await?;
    info!(published, "producer stopped");

    Ok(())
}
