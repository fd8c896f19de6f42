//! Checkout splitting: one purchase request per supplier, siblings under a shared parent.

mod common;

use assert_matches::assert_matches;
use common::{line, TestContext};
use rust_decimal_macros::dec;
use uniform_procurement::{
    entities::purchase_request::{ApprovalStage, RequestStatus, RequestType},
    errors::ServiceError,
    events::Event,
    ids::{ProductId, SupplierId},
    services::{approval::ApprovalPolicy, purchase_requests::SplitOutcome},
};

#[tokio::test]
async fn two_suppliers_split_into_siblings_pending_site_approval() {
    let mut ctx = TestContext::new(ApprovalPolicy::site_then_company()).await;
    let shirts = SupplierId::new();
    let boots = SupplierId::new();
    let shirt = ctx.add_product(shirts);
    let boot = ctx.add_product(boots);

    let outcome = ctx
        .checkout(vec![
            line(shirt, "M", 2, dec!(12.50)),
            line(boot, "42", 1, dec!(80.00)),
        ])
        .await;

    let parent = outcome.parent_request_id().expect("split should have a parent");
    let requests = outcome.into_requests();
    assert_eq!(requests.len(), 2);

    for view in &requests {
        assert_eq!(view.request.parent_request_id, Some(parent.as_uuid()));
        assert_eq!(view.request.approval_stage, ApprovalStage::PendingSiteApproval);
        assert_eq!(view.request.status, RequestStatus::AwaitingApproval);
        assert_eq!(view.request.request_type, RequestType::Standard);
        assert_eq!(view.request.site_id, Some(ctx.site_id.as_uuid()));
        assert_eq!(view.items.len(), 1);
    }

    let mut suppliers: Vec<_> = requests.iter().map(|v| v.request.supplier_id).collect();
    suppliers.sort();
    let mut expected = vec![shirts.as_uuid(), boots.as_uuid()];
    expected.sort();
    assert_eq!(suppliers, expected);

    let siblings = ctx
        .services
        .purchase_requests
        .get_siblings(parent)
        .await
        .expect("siblings");
    assert_eq!(siblings.len(), 2);

    let created = ctx
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, Event::PurchaseRequestCreated { parent_request_id: Some(p), .. } if *p == parent))
        .count();
    assert_eq!(created, 2);
}

#[tokio::test]
async fn single_supplier_cart_has_no_parent() {
    let ctx = TestContext::new(ApprovalPolicy::site_then_company()).await;
    let supplier = SupplierId::new();
    let shirt = ctx.add_product(supplier);
    let trousers = ctx.add_product(supplier);

    let outcome = ctx
        .checkout(vec![
            line(shirt, "M", 1, dec!(10)),
            line(trousers, "32", 2, dec!(25)),
            line(shirt, "L", 1, dec!(10)),
        ])
        .await;

    assert_matches!(&outcome, SplitOutcome::Single { .. });
    assert_eq!(outcome.parent_request_id(), None);

    let request = outcome.into_requests().remove(0);
    assert_eq!(request.request.parent_request_id, None);
    assert_eq!(request.items.len(), 3);

    let line_numbers: Vec<i32> = request.items.iter().map(|i| i.line_number).collect();
    assert_eq!(line_numbers, vec![1, 2, 3]);
    let total_units: i32 = request.items.iter().map(|i| i.ordered_quantity).sum();
    assert_eq!(total_units, 4);
}

#[tokio::test]
async fn every_cart_line_lands_in_exactly_one_request() {
    let ctx = TestContext::new(ApprovalPolicy::direct()).await;
    let suppliers = [SupplierId::new(), SupplierId::new(), SupplierId::new()];
    let products: Vec<ProductId> = suppliers
        .iter()
        .cycle()
        .take(7)
        .map(|s| ctx.add_product(*s))
        .collect();

    let lines = products
        .iter()
        .enumerate()
        .map(|(i, p)| line(*p, "S", i as i32 + 1, dec!(5)))
        .collect();
    let requests = ctx.checkout(lines).await.into_requests();

    assert_eq!(requests.len(), 3);
    let mut line_numbers: Vec<i32> = requests
        .iter()
        .flat_map(|r| r.items.iter().map(|i| i.line_number))
        .collect();
    line_numbers.sort();
    assert_eq!(line_numbers, (1..=7).collect::<Vec<_>>());

    for view in &requests {
        for item in &view.items {
            let product = ProductId::from(item.product_id);
            let index = products.iter().position(|p| *p == product).expect("known product");
            assert_eq!(suppliers[index % 3].as_uuid(), view.request.supplier_id);
        }
    }
}

#[tokio::test]
async fn direct_policy_skips_approval() {
    let ctx = TestContext::new(ApprovalPolicy::direct()).await;
    let product = ctx.add_product(SupplierId::new());

    let request = ctx
        .checkout(vec![line(product, "M", 1, dec!(10))])
        .await
        .into_requests()
        .remove(0);

    assert_eq!(request.request.approval_stage, ApprovalStage::NotRequired);
    assert_eq!(request.request.status, RequestStatus::AwaitingFulfilment);
}

#[tokio::test]
async fn company_only_policy_starts_at_company_stage() {
    let ctx = TestContext::new(ApprovalPolicy::company_only()).await;
    let product = ctx.add_product(SupplierId::new());

    let request = ctx
        .checkout(vec![line(product, "M", 1, dec!(10))])
        .await
        .into_requests()
        .remove(0);

    assert_eq!(
        request.request.approval_stage,
        ApprovalStage::PendingCompanyApproval
    );
}

#[tokio::test]
async fn product_with_two_suppliers_is_an_invariant_violation() {
    let ctx = TestContext::new(ApprovalPolicy::site_then_company()).await;
    let product = ctx.add_product(SupplierId::new());
    ctx.directory
        .assign_supplier(ctx.company_id, product, SupplierId::new());
    let fine = ctx.add_product(SupplierId::new());

    let result = ctx
        .services
        .purchase_requests
        .submit_cart(ctx.checkout_request(vec![
            line(fine, "M", 1, dec!(10)),
            line(product, "M", 1, dec!(10)),
        ]))
        .await;

    assert_matches!(result, Err(ServiceError::InvariantViolation(_)));
}

#[tokio::test]
async fn unmapped_product_rejects_whole_cart() {
    let ctx = TestContext::new(ApprovalPolicy::site_then_company()).await;
    let mapped = ctx.add_product(SupplierId::new());

    let result = ctx
        .services
        .purchase_requests
        .submit_cart(ctx.checkout_request(vec![
            line(mapped, "M", 1, dec!(10)),
            line(ProductId::new(), "M", 1, dec!(10)),
        ]))
        .await;

    assert_matches!(result, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn ineligible_line_rejects_whole_cart() {
    let ctx = TestContext::new(ApprovalPolicy::site_then_company()).await;
    let capped = ctx.add_product(SupplierId::new());
    let other = ctx.add_product(SupplierId::new());
    ctx.directory.set_allowance(ctx.requester_id, capped, 2);

    let result = ctx
        .services
        .purchase_requests
        .submit_cart(ctx.checkout_request(vec![
            line(other, "M", 1, dec!(10)),
            line(capped, "M", 3, dec!(10)),
        ]))
        .await;

    let err = result.expect_err("over-allowance line should fail");
    assert_matches!(&err, ServiceError::ValidationError(msg) if msg.contains("line 2"));
}

#[rstest::rstest]
#[case::empty_cart(vec![])]
#[case::zero_quantity(vec![(0, "M", dec!(1))])]
#[case::blank_size(vec![(1, "", dec!(1))])]
#[case::negative_price(vec![(1, "M", dec!(-1))])]
#[tokio::test]
async fn malformed_carts_are_rejected(#[case] raw: Vec<(i32, &'static str, rust_decimal::Decimal)>) {
    let ctx = TestContext::new(ApprovalPolicy::direct()).await;
    let product = ctx.add_product(SupplierId::new());
    let lines = raw
        .into_iter()
        .map(|(qty, size, price)| line(product, size, qty, price))
        .collect();

    let result = ctx
        .services
        .purchase_requests
        .submit_cart(ctx.checkout_request(lines))
        .await;

    assert_matches!(result, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn missing_policy_is_not_found() {
    let ctx = TestContext::new(ApprovalPolicy::direct()).await;
    let product = ctx.add_product(SupplierId::new());
    let mut request = ctx.checkout_request(vec![line(product, "M", 1, dec!(10))]);
    request.company_id = uniform_procurement::ids::CompanyId::new();

    let result = ctx.services.purchase_requests.submit_cart(request).await;
    assert_matches!(result, Err(ServiceError::NotFound(_)));
}
