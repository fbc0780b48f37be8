use actix_web::{web, HttpResponse};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::error::{ApiError, ApiResult};
use super::state::ApiState;
use crate::models::InvoiceInput;
use crate::qr::QrTag;
use crate::service::validate_invoice;

#[derive(Debug, Deserialize)]
pub struct DecodeQrRequest {
    pub payload: String,
}

/// Issue, chain, sign and submit one invoice
pub async fn issue_invoice(
    input: web::Json<InvoiceInput>,
    state: web::Data<ApiState>,
) -> ApiResult<HttpResponse> {
    let issued = state.service.issue(input.into_inner()).await?;
    Ok(HttpResponse::Created().json(issued))
}

pub async fn get_invoice(
    path: web::Path<Uuid>,
    state: web::Data<ApiState>,
) -> ApiResult<HttpResponse> {
    let uuid = path.into_inner();
    let invoice = state
        .service
        .get_invoice(uuid)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Invoice {} not found", uuid)))?;

    Ok(HttpResponse::Ok().json(invoice))
}

pub async fn invoice_qr_png(
    path: web::Path<Uuid>,
    state: web::Data<ApiState>,
) -> ApiResult<HttpResponse> {
    let uuid = path.into_inner();
    if state.service.get_invoice(uuid).await?.is_none() {
        return Err(ApiError::not_found(format!("Invoice {} not found", uuid)));
    }

    let png = state.service.qr_png(uuid).await?;
    Ok(HttpResponse::Ok().content_type("image/png").body(png))
}

/// Local structural checks, no call to the authority
pub async fn validate_stored_invoice(
    path: web::Path<Uuid>,
    state: web::Data<ApiState>,
) -> ApiResult<HttpResponse> {
    let uuid = path.into_inner();
    let invoice = state
        .service
        .get_invoice(uuid)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Invoice {} not found", uuid)))?;

    Ok(HttpResponse::Ok().json(validate_invoice(&invoice)))
}

pub async fn compliance_check(
    path: web::Path<Uuid>,
    state: web::Data<ApiState>,
) -> ApiResult<HttpResponse> {
    let uuid = path.into_inner();
    if state.service.get_invoice(uuid).await?.is_none() {
        return Err(ApiError::not_found(format!("Invoice {} not found", uuid)));
    }

    let check = state.service.check_compliance(uuid).await?;
    Ok(HttpResponse::Ok().json(check))
}

pub async fn decode_qr(
    body: web::Json<DecodeQrRequest>,
    state: web::Data<ApiState>,
) -> ApiResult<HttpResponse> {
    let payload = state.service.decode_qr(&body.payload)?;

    let mut tags = serde_json::Map::new();
    for tag in payload.tags() {
        let value = match (tag, payload.get_str(tag)) {
            (QrTag::SellerName | QrTag::VatNumber | QrTag::Timestamp | QrTag::InvoiceTotal | QrTag::VatTotal, Ok(Some(text))) => {
                json!(text)
            }
            _ => json!(STANDARD.encode(payload.get(tag).unwrap_or_default())),
        };
        tags.insert(tag.as_byte().to_string(), json!({ "name": tag, "value": value }));
    }

    Ok(HttpResponse::Ok().json(json!({
        "tags": tags,
        "summary": payload.summary().ok(),
    })))
}

pub async fn queue_stats(state: web::Data<ApiState>) -> ApiResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.service.queue_stats().await?))
}

pub async fn queue_overdue(state: web::Data<ApiState>) -> ApiResult<HttpResponse> {
    let overdue = state.service.query_overdue().await?;
    Ok(HttpResponse::Ok().json(json!({
        "count": overdue.len(),
        "entries": overdue,
    })))
}

pub async fn drain_queue(state: web::Data<ApiState>) -> ApiResult<HttpResponse> {
    let report = state.service.drain_queue().await?;
    Ok(HttpResponse::Ok().json(report))
}

/// Full queue as a JSON attachment for audit
pub async fn export_queue(state: web::Data<ApiState>) -> ApiResult<HttpResponse> {
    let export = state.service.export_queue().await?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .insert_header(("Content-Disposition", "attachment; filename=\"offline-queue.json\""))
        .body(export))
}

pub async fn remove_queue_entry(
    path: web::Path<Uuid>,
    state: web::Data<ApiState>,
) -> ApiResult<HttpResponse> {
    let removed = state.service.remove_queue_entry(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({
        "status": "removed",
        "entry_id": removed.id,
        "invoice_uuid": removed.invoice.uuid(),
    })))
}

pub async fn retry_queue_entry(
    path: web::Path<Uuid>,
    state: web::Data<ApiState>,
) -> ApiResult<HttpResponse> {
    let entry = state.service.retry_queue_entry(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(entry))
}

pub async fn chain_status(state: web::Data<ApiState>) -> ApiResult<HttpResponse> {
    let tail = state.service.chain_tail().await;
    let halted = state.service.chain_halted().await;

    Ok(HttpResponse::Ok().json(json!({
        "chain_id": state.service.chain_id(),
        "icv": tail.icv,
        "last_hash": tail.last_hash,
        "halted": halted,
    })))
}

/// Operator override after an integrity failure
pub async fn resume_chain(state: web::Data<ApiState>) -> ApiResult<HttpResponse> {
    let tail = state.service.resume_chain().await;
    tracing::warn!(chain_id = %state.service.chain_id(), icv = tail.icv, "Chain resumed through API");

    Ok(HttpResponse::Ok().json(json!({
        "status": "resumed",
        "icv": tail.icv,
        "last_hash": tail.last_hash,
    })))
}
