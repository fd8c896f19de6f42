//! Uniform procurement workflow engine
//!
//! Splits employee carts into per-supplier purchase requests, routes them through site and
//! company approval, consolidates them into purchase orders, and tracks dispatch, delivery,
//! goods receipt and invoicing.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod directory;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod ids;
pub mod logging;
pub mod migrator;
pub mod services;

use axum::{response::Json, routing::get, Router};
use serde_json::{json, Value};
use slog::Logger;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::db::DbPool;
use crate::services::ServiceContainer;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub config: config::AppConfig,
    pub services: ServiceContainer,
}

impl AppState {
    pub fn new(db: Arc<DbPool>, config: config::AppConfig, services: ServiceContainer) -> Self {
        Self {
            db,
            config,
            services,
        }
    }
}

/// Procurement API routes, mounted under `/api/v1`
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(api_status))
        .nest(
            "/purchase-requests",
            handlers::purchase_requests::purchase_request_routes(),
        )
        .nest("/returns", handlers::purchase_requests::return_routes())
        .nest(
            "/purchase-orders",
            handlers::purchase_orders::purchase_order_routes(),
        )
        .nest("/inventory", handlers::inventory::inventory_routes())
        .nest("/goods-receipts", handlers::receipts::goods_receipt_routes())
        .nest("/invoices", handlers::receipts::invoice_routes())
}

/// Full application router with health, API and request logging layers.
pub fn app_router(state: AppState, logger: Logger) -> Router {
    let router = Router::new()
        .nest("/health", handlers::health::health_routes())
        .nest("/api/v1", api_v1_routes())
        .layer(TraceLayer::new_for_http());

    logging::with_access_log(router, logger).with_state(state)
}

async fn api_status() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "uniform-procurement",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub mod prelude {
    pub use crate::db::*;
    pub use crate::errors::*;
    pub use crate::events::*;
    pub use crate::ids::*;
    pub use crate::services::*;
}
