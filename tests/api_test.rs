//! HTTP surface: routing, status codes and error bodies.

mod common;

use axum::http::{Method, StatusCode};
use common::{response_json, send, TestContext};
use serde_json::json;
use uniform_procurement::{ids::SupplierId, services::approval::ApprovalPolicy};

#[tokio::test]
async fn health_reports_database_up() {
    let ctx = TestContext::new(ApprovalPolicy::direct()).await;
    let app = ctx.app();

    let response = send(&app, Method::GET, "/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["status"], "up");
    assert_eq!(body["database"], "up");

    let response = send(&app, Method::GET, "/api/v1/status", None).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn checkout_then_approve_over_http() {
    let ctx = TestContext::new(ApprovalPolicy::site_then_company()).await;
    let first = ctx.add_product(SupplierId::new());
    let second = ctx.add_product(SupplierId::new());
    let app = ctx.app();

    let response = send(
        &app,
        Method::POST,
        "/api/v1/purchase-requests/checkout",
        Some(json!({
            "requester_id": ctx.requester_id,
            "company_id": ctx.company_id,
            "lines": [
                { "product_id": first, "size": "M", "quantity": 1, "unit_price": "20.00" },
                { "product_id": second, "size": "L", "quantity": 2, "unit_price": "15.00" }
            ]
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    assert_eq!(body["kind"], "split");
    let parent = body["parent_request_id"].as_str().expect("parent id").to_string();
    assert_eq!(body["requests"].as_array().map(Vec::len), Some(2));

    let response = send(
        &app,
        Method::GET,
        &format!("/api/v1/purchase-requests/groups/{}", parent),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(
        &app,
        Method::POST,
        &format!("/api/v1/purchase-requests/{}/approve", parent),
        Some(json!({
            "role": "site_admin",
            "approver_id": ctx.site_admin,
            "pr_reference": { "number": "PR-77", "date": "2024-03-01" }
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["changed"], true);
    for request in body["requests"].as_array().expect("requests") {
        assert_eq!(request["approval_stage"], "PendingCompanyApproval");
        assert_eq!(request["pr_reference_number"], "PR-77");
    }

    let response = send(
        &app,
        Method::POST,
        &format!("/api/v1/purchase-requests/{}/approve", parent),
        Some(json!({ "role": "company_admin", "approver_id": ctx.site_admin })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = response_json(response).await;
    assert_eq!(body["kind"], "unauthorized_approver");
}

#[tokio::test]
async fn errors_carry_a_machine_readable_kind() {
    let ctx = TestContext::new(ApprovalPolicy::direct()).await;
    let app = ctx.app();

    let response = send(
        &app,
        Method::GET,
        &format!("/api/v1/purchase-requests/{}", uuid::Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = response_json(response).await;
    assert_eq!(body["kind"], "not_found");
    assert!(body["message"].is_string());

    let response = send(
        &app,
        Method::POST,
        "/api/v1/purchase-requests/checkout",
        Some(json!({
            "requester_id": ctx.requester_id,
            "company_id": ctx.company_id,
            "lines": []
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert_eq!(body["kind"], "validation_error");
}

#[tokio::test]
async fn inventory_round_trips_through_http() {
    let ctx = TestContext::new(ApprovalPolicy::direct()).await;
    let supplier = SupplierId::new();
    let product = ctx.add_product(supplier);
    let app = ctx.app();

    let response = send(
        &app,
        Method::PUT,
        "/api/v1/inventory",
        Some(json!({
            "supplier_id": supplier,
            "product_id": product,
            "size": "XL",
            "quantity": 9
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(
        &app,
        Method::GET,
        &format!("/api/v1/inventory/{}/{}", supplier, product),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["stock"]["XL"], 9);
    assert_eq!(body["total_stock"], 9);

    let response = send(
        &app,
        Method::PUT,
        "/api/v1/inventory",
        Some(json!({
            "supplier_id": supplier,
            "product_id": product,
            "size": "XL",
            "quantity": -1
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn shipping_status_is_derived_on_read() {
    let ctx = TestContext::new(ApprovalPolicy::direct()).await;
    let supplier = SupplierId::new();
    let product = ctx.add_product(supplier);
    let request = ctx
        .checkout(vec![common::line(
            product,
            "M",
            2,
            rust_decimal_macros::dec!(10),
        )])
        .await
        .into_requests()
        .remove(0);
    let po = ctx.consolidate(vec![request.id()]).await.remove(0).id();
    let app = ctx.app();
    let uri = format!("/api/v1/purchase-orders/{}/shipping-status", po);

    let body = response_json(send(&app, Method::GET, &uri, None).await).await;
    assert_eq!(body["shipping_status"], "AwaitingShipment");

    let response = send(
        &app,
        Method::POST,
        &format!("/api/v1/purchase-requests/{}/dispatch", request.id()),
        Some(json!({
            "supplier_id": supplier,
            "lines": [{ "item_id": request.items[0].id, "quantity": 1 }],
            "carrier": "DHL"
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(send(&app, Method::GET, &uri, None).await).await;
    assert_eq!(body["shipping_status"], "PartiallyShipped");

    let response = send(
        &app,
        Method::GET,
        &format!("/api/v1/purchase-orders/{}/shipping-status", uuid::Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn checkout_cannot_claim_a_return_link() {
    let ctx = TestContext::new(ApprovalPolicy::direct()).await;
    let product = ctx.add_product(SupplierId::new());
    let app = ctx.app();

    let response = send(
        &app,
        Method::POST,
        "/api/v1/purchase-requests/checkout",
        Some(json!({
            "requester_id": ctx.requester_id,
            "company_id": ctx.company_id,
            "replacement_source_id": uuid::Uuid::new_v4(),
            "lines": [
                { "product_id": product, "size": "M", "quantity": 1, "unit_price": "20.00" }
            ]
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    assert_eq!(body["kind"], "single");
    let request = &body["request"];
    assert_eq!(request["request_type"], "Standard");
    assert!(request["replacement_source_id"].is_null());
}
