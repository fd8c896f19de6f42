//! Consolidating approved purchase requests into per-supplier purchase orders.

mod common;

use assert_matches::assert_matches;
use common::{line, TestContext};
use rust_decimal_macros::dec;
use uniform_procurement::{
    entities::{
        purchase_order::PurchaseOrderStatus,
        purchase_request::{ApprovalStage, RequestStatus},
    },
    errors::ServiceError,
    ids::{CompanyId, PurchaseRequestId, SupplierId},
    services::{
        approval::ApprovalPolicy, fulfilment::ShippingStatus,
        purchase_requests::PurchaseRequestView,
    },
};

async fn ready_requests(ctx: &TestContext, suppliers: &[SupplierId]) -> Vec<PurchaseRequestView> {
    let mut views = Vec::new();
    for supplier in suppliers {
        let product = ctx.add_product(*supplier);
        let outcome = ctx.checkout(vec![line(product, "M", 2, dec!(10))]).await;
        views.extend(outcome.into_requests());
    }
    views
}

fn ids(views: &[PurchaseRequestView]) -> Vec<PurchaseRequestId> {
    views.iter().map(PurchaseRequestView::id).collect()
}

#[tokio::test]
async fn one_purchase_order_per_supplier() {
    let ctx = TestContext::new(ApprovalPolicy::direct()).await;
    let alpha = SupplierId::new();
    let beta = SupplierId::new();
    let requests = ready_requests(&ctx, &[alpha, alpha, beta]).await;

    let orders = ctx.consolidate(ids(&requests)).await;
    assert_eq!(orders.len(), 2);

    for order in &orders {
        assert_eq!(order.order.client_po_number, "CPO-42");
        assert_eq!(order.order.status, PurchaseOrderStatus::Created);
        assert_eq!(order.shipping_status, ShippingStatus::AwaitingShipment);
        let expected = if order.order.supplier_id == alpha.as_uuid() { 2 } else { 1 };
        assert_eq!(order.purchase_request_ids.len(), expected);
    }

    for request in &requests {
        let view = ctx.refresh(request.id()).await;
        assert_eq!(view.request.approval_stage, ApprovalStage::PoCreated);
        assert_eq!(view.request.status, RequestStatus::AwaitingFulfilment);
    }

    let fetched = ctx
        .services
        .purchase_orders
        .get_purchase_order(orders[0].id())
        .await
        .expect("order");
    assert_eq!(fetched.purchase_request_ids.len(), orders[0].purchase_request_ids.len());
}

#[tokio::test]
async fn unapproved_requests_cannot_be_consolidated() {
    let ctx = TestContext::new(ApprovalPolicy::site_then_company()).await;
    let requests = ready_requests(&ctx, &[SupplierId::new()]).await;

    let result = ctx
        .services
        .purchase_orders
        .create_purchase_orders(ctx.consolidation(ids(&requests)))
        .await;
    assert_matches!(result, Err(ServiceError::InvalidStatus(_)));
}

#[tokio::test]
async fn site_approved_requests_are_ready() {
    let ctx = TestContext::new(ApprovalPolicy::site_only()).await;
    let requests = ready_requests(&ctx, &[SupplierId::new()]).await;
    ctx.services
        .approvals
        .advance(requests[0].id().as_uuid(), ctx.site_approval())
        .await
        .expect("site approval");

    let orders = ctx.consolidate(ids(&requests)).await;
    assert_eq!(orders.len(), 1);
}

#[tokio::test]
async fn a_request_is_consolidated_only_once() {
    let ctx = TestContext::new(ApprovalPolicy::direct()).await;
    let requests = ready_requests(&ctx, &[SupplierId::new()]).await;
    ctx.consolidate(ids(&requests)).await;

    let result = ctx
        .services
        .purchase_orders
        .create_purchase_orders(ctx.consolidation(ids(&requests)))
        .await;
    assert_matches!(result, Err(ServiceError::InvalidStatus(_)));
}

#[tokio::test]
async fn duplicate_and_foreign_ids_are_rejected() {
    let ctx = TestContext::new(ApprovalPolicy::direct()).await;
    let requests = ready_requests(&ctx, &[SupplierId::new()]).await;
    let id = requests[0].id();

    let result = ctx
        .services
        .purchase_orders
        .create_purchase_orders(ctx.consolidation(vec![id, id]))
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));

    let mut other_company = ctx.consolidation(vec![id]);
    other_company.company_id = CompanyId::new();
    let result = ctx
        .services
        .purchase_orders
        .create_purchase_orders(other_company)
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));

    let result = ctx
        .services
        .purchase_orders
        .create_purchase_orders(ctx.consolidation(vec![PurchaseRequestId::new()]))
        .await;
    assert_matches!(result, Err(ServiceError::NotFound(_)));
}

#[tokio::test]
async fn failed_consolidation_writes_nothing() {
    let ctx = TestContext::new(ApprovalPolicy::direct()).await;
    let requests = ready_requests(&ctx, &[SupplierId::new(), SupplierId::new()]).await;

    // A second supplier for one product fails re-validation for the whole batch.
    let moved = uniform_procurement::ids::ProductId::from(requests[1].items[0].product_id);
    ctx.directory
        .assign_supplier(ctx.company_id, moved, SupplierId::new());

    let result = ctx
        .services
        .purchase_orders
        .create_purchase_orders(ctx.consolidation(ids(&requests)))
        .await;
    assert_matches!(result, Err(ServiceError::InvariantViolation(_)));

    for request in &requests {
        let view = ctx.refresh(request.id()).await;
        assert_eq!(view.request.approval_stage, ApprovalStage::NotRequired);
    }
}

#[tokio::test]
async fn status_only_moves_forward() {
    let ctx = TestContext::new(ApprovalPolicy::direct()).await;
    let requests = ready_requests(&ctx, &[SupplierId::new()]).await;
    let po = ctx.consolidate(ids(&requests)).await.remove(0);
    let service = &ctx.services.purchase_orders;

    let sent = service
        .advance_purchase_order_status(po.id(), PurchaseOrderStatus::SentToSupplier)
        .await
        .expect("send");
    assert_eq!(sent.order.status, PurchaseOrderStatus::SentToSupplier);

    let same = service
        .advance_purchase_order_status(po.id(), PurchaseOrderStatus::SentToSupplier)
        .await
        .expect("repeat is a no-op");
    assert_eq!(same.order.status, PurchaseOrderStatus::SentToSupplier);

    let back = service
        .advance_purchase_order_status(po.id(), PurchaseOrderStatus::Created)
        .await;
    assert_matches!(back, Err(ServiceError::InvalidStatus(_)));
}
