use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use lmrelay_common::{GlobalConfig, GlobalConfigPatch, ServiceConfig, load_file};
use lmrelay_core::{Core, UpstreamClientConfig, WreqUpstreamClient};
use lmrelay_protocol::Service;
use lmrelay_provider_core::{EventHub, TracingEventSink};
use tracing::info;

mod cli;

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("lmrelay failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    info!(
        host = %config.host,
        port = config.port,
        proxy = %config.proxy.as_deref().unwrap_or(""),
        queue_timeout_secs = config.queue_timeout_secs,
        model_cache_ttl_secs = config.model_cache_ttl_secs,
        "config loaded"
    );

    let client = WreqUpstreamClient::new(UpstreamClientConfig::from_global(&config))
        .context("building upstream client")?;
    let events = EventHub::default();
    events.add_sink(Arc::new(TracingEventSink));

    let bind = format!("{}:{}", config.host, config.port);
    let core = Core::new(config, Arc::new(client), events);
    let state = core.state();
    for (service, service_config) in &state.config.services {
        info!(
            service = %service,
            base_url = %service_config.base_url,
            credentials = state.forwarder.pool().len(*service),
            max_concurrency = service_config.max_concurrency,
            "pool ready"
        );
    }

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(addr = %bind, "listening");
    axum::serve(
        listener,
        core.router()
            .into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

/// defaults < file < ENV/CLI. Every service is present so routes resolve
/// even without keys.
fn resolve_config(cli: &Cli) -> anyhow::Result<GlobalConfig> {
    let mut patch = GlobalConfigPatch::default();
    for service in Service::ALL {
        patch.services.insert(service, ServiceConfig::new(service));
    }
    if let Some(path) = cli.config.as_deref() {
        patch.overlay(load_file(path)?);
    }
    patch.overlay(cli.patch());
    Ok(patch.into_config()?)
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lmrelay=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
