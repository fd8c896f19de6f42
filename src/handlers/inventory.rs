use super::common::{map_service_error, success_response, validate_input};
use crate::{
    errors::ApiError,
    ids::{ProductId, SupplierId},
    services::inventory::StockLevelUpdate,
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, put},
    Router,
};
use uuid::Uuid;

/// Set the on-hand quantity of one size
pub async fn set_stock_level(
    State(state): State<AppState>,
    Json(payload): Json<StockLevelUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;
    let view = state
        .services
        .inventory
        .set_stock_level(payload)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(view))
}

pub async fn get_inventory(
    State(state): State<AppState>,
    Path((supplier_id, product_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state
        .services
        .inventory
        .get_inventory(SupplierId::from(supplier_id), ProductId::from(product_id))
        .await
        .map_err(map_service_error)?;
    Ok(success_response(view))
}

pub fn inventory_routes() -> Router<AppState> {
    Router::new()
        .route("/", put(set_stock_level))
        .route("/:supplier_id/:product_id", get(get_inventory))
}
