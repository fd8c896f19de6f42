use super::common::{created_response, map_service_error, success_response, validate_input};
use crate::{
    entities::purchase_order::PurchaseOrderStatus,
    errors::ApiError,
    ids::PurchaseOrderId,
    services::{fulfilment::ShippingStatus, purchase_orders::ConsolidationRequest},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: PurchaseOrderStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ShippingStatusResponse {
    pub purchase_order_id: PurchaseOrderId,
    pub shipping_status: ShippingStatus,
}

/// Consolidate ready purchase requests into one purchase order per supplier
pub async fn create_purchase_orders(
    State(state): State<AppState>,
    Json(payload): Json<ConsolidationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let orders = state
        .services
        .purchase_orders
        .create_purchase_orders(payload)
        .await
        .map_err(map_service_error)?;

    info!(count = orders.len(), "Purchase orders created");
    Ok(created_response(orders))
}

pub async fn get_purchase_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .services
        .purchase_orders
        .get_purchase_order(PurchaseOrderId::from(id))
        .await
        .map_err(map_service_error)?;
    Ok(success_response(order))
}

pub async fn get_shipping_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let purchase_order_id = PurchaseOrderId::from(id);
    let shipping_status = state
        .services
        .fulfilment
        .derive_po_shipping_status(purchase_order_id)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(ShippingStatusResponse {
        purchase_order_id,
        shipping_status,
    }))
}

pub async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<StatusUpdateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .services
        .purchase_orders
        .advance_purchase_order_status(PurchaseOrderId::from(id), payload.status)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(order))
}

pub fn purchase_order_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_purchase_orders))
        .route("/:id", get(get_purchase_order))
        .route("/:id/shipping-status", get(get_shipping_status))
        .route("/:id/status", post(update_status))
}
