use super::common::{created_response, map_service_error, success_response, validate_input};
use crate::{
    errors::ApiError,
    ids::{EmployeeId, GoodsReceiptId, InvoiceId},
    services::{invoicing::InvoiceRequest, receipts::GoodsReceiptRequest},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentApproval {
    pub approver_id: EmployeeId,
}

/// Raise a goods receipt note for a fully delivered purchase order
pub async fn create_goods_receipt(
    State(state): State<AppState>,
    Json(payload): Json<GoodsReceiptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;
    let receipt = state
        .services
        .goods_receipts
        .create_goods_receipt(payload)
        .await
        .map_err(map_service_error)?;
    Ok(created_response(receipt))
}

pub async fn get_goods_receipt(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let receipt = state
        .services
        .goods_receipts
        .get_goods_receipt(GoodsReceiptId::from(id))
        .await
        .map_err(map_service_error)?;
    Ok(success_response(receipt))
}

pub async fn approve_goods_receipt(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DocumentApproval>,
) -> Result<impl IntoResponse, ApiError> {
    let receipt = state
        .services
        .goods_receipts
        .approve_goods_receipt(GoodsReceiptId::from(id), payload.approver_id)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(receipt))
}

/// Bill the accepted quantities of an approved goods receipt
pub async fn create_invoice(
    State(state): State<AppState>,
    Json(payload): Json<InvoiceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;
    let invoice = state
        .services
        .invoices
        .create_invoice(payload)
        .await
        .map_err(map_service_error)?;
    Ok(created_response(invoice))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let invoice = state
        .services
        .invoices
        .get_invoice(InvoiceId::from(id))
        .await
        .map_err(map_service_error)?;
    Ok(success_response(invoice))
}

pub async fn approve_invoice(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DocumentApproval>,
) -> Result<impl IntoResponse, ApiError> {
    let invoice = state
        .services
        .invoices
        .approve_invoice(InvoiceId::from(id), payload.approver_id)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(invoice))
}

pub fn goods_receipt_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_goods_receipt))
        .route("/:id", get(get_goods_receipt))
        .route("/:id/approve", post(approve_goods_receipt))
}

pub fn invoice_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_invoice))
        .route("/:id", get(get_invoice))
        .route("/:id/approve", post(approve_invoice))
}
