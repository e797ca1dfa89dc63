use anyhow::{Context, Result};
use envconfig::Envconfig;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use analytics_joiner::{
    config::Config,
    metrics_consts::describe_metrics,
    server::{router, serve, setup_metrics_recorder},
    service::JoinService,
};

fn setup_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_filter(filter).boxed()
    };
    tracing_subscriber::registry().with(log_layer).init();
}

fn start_server(config: &Config) -> Result<JoinHandle<()>> {
    let recorder_handle =
        setup_metrics_recorder().context("Failed to install Prometheus recorder")?;
    describe_metrics();

    let bind = config.bind_address()?;
    let router = router(recorder_handle);

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, bind).await {
            error!("Metrics server failed: {}", e);
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env()
        .context("Failed to load configuration from environment variables. Please check your environment setup.")?;

    setup_tracing(config.log_json);
    info!("Starting analytics joiner");
    info!("Configuration loaded: {:?}", config);

    let server_handle = start_server(&config)?;
    info!("Started metrics server on {}:{}", config.host, config.port);

    let service = JoinService::new(config)
        .await
        .context("Failed to create analytics joiner service. Check your Kafka, Redis and analytics settings.")?;

    // Blocks until SIGINT or SIGTERM, then drains and commits.
    service.run().await?;

    server_handle.abort();

    Ok(())
}
