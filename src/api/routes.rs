use actix_cors::Cors;
use actix_web::{web, HttpResponse};

use super::handlers;
use super::middleware::{auth::create_auth_middleware, compression::create_compression_middleware};
use super::state::{ApiState, AppConfig};

pub fn configure_routes(cfg: &mut web::ServiceConfig, config: &AppConfig) {
    cfg
        // Health checks
        .route("/health", web::get().to(health_check))
        .route("/ready", web::get().to(readiness_check))
        .route("/metrics", web::get().to(metrics_endpoint))

        // API v1
        .service(
            web::scope("/api/v1")
                .app_data(web::JsonConfig::default().limit(config.max_body_bytes))
                .wrap(create_auth_middleware())
                .wrap(create_compression_middleware(config.enable_compression))
                .wrap(
                    Cors::default()
                        .allowed_origin_fn(|origin, _req_head| {
                            origin.as_bytes().starts_with(b"http://localhost") ||
                            origin.as_bytes().starts_with(b"https://")
                        })
                        .allowed_methods(vec!["GET", "POST", "DELETE"])
                        .allowed_headers(vec!["Content-Type", "Authorization"])
                        .max_age(3600)
                )

                // Invoice issuance
                .service(
                    web::scope("/invoices")
                        .route("", web::post().to(handlers::issue_invoice))
                        .route("/{uuid}", web::get().to(handlers::get_invoice))
                        .route("/{uuid}/qr.png", web::get().to(handlers::invoice_qr_png))
                        .route("/{uuid}/validation", web::get().to(handlers::validate_stored_invoice))
                        .route("/{uuid}/compliance-check", web::post().to(handlers::compliance_check))
                )
                .route("/qr/decode", web::post().to(handlers::decode_qr))

                // Offline queue (operators)
                .service(
                    web::scope("/queue")
                        .route("/stats", web::get().to(handlers::queue_stats))
                        .route("/overdue", web::get().to(handlers::queue_overdue))
                        .route("/drain", web::post().to(handlers::drain_queue))
                        .route("/export", web::get().to(handlers::export_queue))
                        .route("/{id}", web::delete().to(handlers::remove_queue_entry))
                        .route("/{id}/retry", web::post().to(handlers::retry_queue_entry))
                )

                .service(
                    web::scope("/chain")
                        .route("", web::get().to(handlers::chain_status))
                        .route("/resume", web::post().to(handlers::resume_chain))
                )
        );
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy"
    }))
}

async fn readiness_check(state: web::Data<ApiState>) -> HttpResponse {
    let db_healthy = state.service.store().ping().await;
    let halted = state.service.chain_halted().await;

    if db_healthy && halted.is_none() {
        HttpResponse::Ok().json(serde_json::json!({
            "status": "ready",
            "checks": {
                "database": "ok",
                "chain": "ok"
            }
        }))
    } else {
        HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "not_ready",
            "checks": {
                "database": if db_healthy { "ok" } else { "failed" },
                "chain": halted.map(|reason| format!("halted: {}", reason)).unwrap_or_else(|| "ok".to_string())
            }
        }))
    }
}

async fn metrics_endpoint() -> HttpResponse {
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(buffer)
}
