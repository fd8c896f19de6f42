use super::common::{created_response, map_service_error, success_response, validate_input};
use crate::{
    errors::ApiError,
    ids::{ParentRequestId, PurchaseRequestId, ReturnRequestId, SupplierId},
    services::{
        approval::{ApprovalAction, RejectionAction},
        fulfilment::{DeliveryMeta, DispatchMeta, LineQuantity},
        purchase_requests::CheckoutRequest,
        returns::ReplacementRequest,
    },
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
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct DispatchRequest {
    pub supplier_id: SupplierId,
    #[validate(length(min = 1, message = "At least one line is required"))]
    pub lines: Vec<LineQuantity>,
    #[serde(flatten)]
    pub meta: DispatchMeta,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct DeliveryRequest {
    pub supplier_id: SupplierId,
    #[validate(length(min = 1, message = "At least one line is required"))]
    pub lines: Vec<LineQuantity>,
    #[serde(flatten)]
    pub meta: DeliveryMeta,
}

/// Split a cart into per-supplier purchase requests
pub async fn checkout(
    State(state): State<AppState>,
    Json(payload): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let outcome = state
        .services
        .purchase_requests
        .submit_cart(payload)
        .await
        .map_err(map_service_error)?;

    info!(
        parent_request_id = ?outcome.parent_request_id(),
        "Checkout accepted"
    );
    Ok(created_response(outcome))
}

pub async fn get_purchase_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let request = state
        .services
        .purchase_requests
        .get_request(PurchaseRequestId::from(id))
        .await
        .map_err(map_service_error)?;
    Ok(success_response(request))
}

pub async fn get_request_group(
    State(state): State<AppState>,
    Path(parent_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let requests = state
        .services
        .purchase_requests
        .get_siblings(ParentRequestId::from(parent_id))
        .await
        .map_err(map_service_error)?;
    Ok(success_response(requests))
}

/// Approve a request, or every sibling when addressed by parent id
pub async fn approve(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Json(payload): Json<ApprovalAction>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .services
        .approvals
        .advance(group_id, payload)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(outcome))
}

pub async fn reject(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Json(payload): Json<RejectionAction>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;
    let outcome = state
        .services
        .approvals
        .reject(group_id, payload)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(outcome))
}

pub async fn dispatch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DispatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;
    let outcome = state
        .services
        .fulfilment
        .record_dispatch(
            PurchaseRequestId::from(id),
            payload.supplier_id,
            payload.lines,
            payload.meta,
        )
        .await
        .map_err(map_service_error)?;
    Ok(success_response(outcome))
}

pub async fn deliver(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DeliveryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;
    let outcome = state
        .services
        .fulfilment
        .record_delivery(
            PurchaseRequestId::from(id),
            payload.supplier_id,
            payload.lines,
            payload.meta,
        )
        .await
        .map_err(map_service_error)?;
    Ok(success_response(outcome))
}

/// Open a size/item exchange for a delivered line
pub async fn request_replacement(
    State(state): State<AppState>,
    Json(payload): Json<ReplacementRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;
    let outcome = state
        .services
        .returns
        .request_replacement(payload)
        .await
        .map_err(map_service_error)?;
    Ok(created_response(outcome))
}

pub async fn get_return(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .services
        .returns
        .get_return(ReturnRequestId::from(id))
        .await
        .map_err(map_service_error)?;
    Ok(success_response(record))
}

pub fn purchase_request_routes() -> Router<AppState> {
    Router::new()
        .route("/checkout", post(checkout))
        .route("/:id", get(get_purchase_request))
        .route("/groups/:parent_id", get(get_request_group))
        .route("/:id/approve", post(approve))
        .route("/:id/reject", post(reject))
        .route("/:id/dispatch", post(dispatch))
        .route("/:id/deliver", post(deliver))
}

pub fn return_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(request_replacement))
        .route("/:id", get(get_return))
}
