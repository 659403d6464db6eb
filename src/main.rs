//! Main entry point for the load-balanced dispatcher CLI

use balanced_dispatch::{
    balancer::{HealthCheckManager, ServerRegistry, StaticServerRegistry},
    command::{RetryPolicy, TracingListener},
    config::Settings,
    transport::{HttpRequest, ReqwestTransport},
    RequestDispatcher,
};
use futures::StreamExt;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::load()?;
    settings.validate()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    let json = settings.logging.format == "json";
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();

    let mut args = std::env::args().skip(1);
    let target = args
        .next()
        .ok_or_else(|| anyhow::anyhow!("usage: lb-dispatch <url> [raw]"))?;
    let raw = args.next().as_deref() == Some("raw");

    info!(
        service = %settings.client.service_id,
        servers = settings.load_balancer.servers.len(),
        "Loaded configuration"
    );

    let transport = ReqwestTransport::new(&settings.client)?;

    // Initialize server registry and health checks
    let registry = settings.load_balancer.is_active().then(|| {
        Arc::new(StaticServerRegistry::from_config(
            settings.client.service_id.clone(),
            &settings.load_balancer,
        ))
    });

    let health_manager = match &registry {
        Some(registry) if settings.health_check.enabled => {
            let manager = HealthCheckManager::from_config(
                registry.clone(),
                reqwest::Client::new(),
                &settings.health_check,
            );
            manager.start(settings.health_check.interval_secs).await;
            Some(manager)
        }
        _ => None,
    };

    let dispatcher = RequestDispatcher::new(transport)
        .with_optional_load_balancer(registry.map(|r| r as Arc<dyn ServerRegistry>))
        .with_retry_policy(RetryPolicy::from(&settings.retry))
        .with_listener(Arc::new(TracingListener));

    info!(
        target = %target,
        load_balanced = dispatcher.is_load_balanced(),
        "Dispatching request"
    );

    let request = HttpRequest::get(&target)?;
    if raw {
        let mut chunks = dispatcher.raw_byte_stream(request);
        let mut total = 0usize;
        let mut count = 0usize;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            total += chunk.len();
            count += 1;
        }
        info!(chunks = count, bytes = total, "Stream completed");
    } else {
        let response = dispatcher
            .exchange(request)
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("dispatch completed without a response"))??;
        info!(status = %response.status, bytes = response.body.len(), "Received response");
    }

    if let Some(manager) = health_manager {
        manager.stop().await;
    }

    Ok(())
}
