use actix_web::{web, App, HttpServer, middleware};
use einvoice_engine::api::{ApiState, configure_routes};
use einvoice_engine::{ComplianceService, ComplianceSettings, DrainScheduler};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use std::env;
use std::sync::Arc;
use anyhow::{bail, Result};

#[actix_web::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    tracing::info!("Starting e-invoice compliance API");

    // Initialize Prometheus metrics
    prometheus::default_registry()
        .register(Box::new(prometheus::process_collector::ProcessCollector::for_self()))?;

    // Load configuration
    let settings = ComplianceSettings::load()?;
    if settings.api_token.is_none() {
        bail!("api_token must be set (EINVOICE__API_TOKEN) to serve the API");
    }

    let service = Arc::new(ComplianceService::open(settings).await?);
    let state = ApiState::from_service(service.clone());
    let app_config = (*state.config).clone();
    let state = web::Data::new(state);

    // Drain in-process unless a dedicated worker does it
    let in_process_drain = env::var("EMBEDDED_WORKER")
        .unwrap_or_else(|_| "true".to_string())
        .parse::<bool>()
        .unwrap_or(true);
    let scheduler = in_process_drain.then(|| {
        let interval = service.settings().queue.drain_interval();
        DrainScheduler::spawn(service.clone(), interval)
    });

    // Get server settings
    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = env::var("PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse::<u16>()?;

    tracing::info!("Starting server on {}:{}", host, port);

    // Start HTTP server
    HttpServer::new(move || {
        let app_config = app_config.clone();
        App::new()
            .app_data(state.clone())
            .wrap(TracingLogger::default())
            .wrap(middleware::NormalizePath::trim())
            .configure(move |cfg| configure_routes(cfg, &app_config))
    })
    .bind((host.as_str(), port))?
    .run()
    .await?;

    if let Some(scheduler) = scheduler {
        scheduler.cancel().await;
    }

    Ok(())
}
