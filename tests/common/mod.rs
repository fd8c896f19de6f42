#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uniform_procurement::{
    config::AppConfig,
    db::{self, DbConfig, DbPool},
    directory::{Directory, InMemoryDirectory},
    events::{Event, EventSender},
    ids::{
        CompanyId, EmployeeId, ProductId, PurchaseRequestId, PurchaseRequestItemId, SiteId,
        SupplierId,
    },
    logging::discard_logger,
    services::{
        approval::{ApprovalAction, ApprovalPolicy, ApproverRole, PrReference},
        fulfilment::{DeliveryMeta, DeliveryOutcome, DispatchMeta, DispatchOutcome, LineQuantity},
        inventory::{InventoryView, StockLevelUpdate},
        purchase_orders::{ConsolidationRequest, PurchaseOrderView},
        purchase_requests::{CartLine, CheckoutRequest, PurchaseRequestView, SplitOutcome},
        ServiceContainer, ServiceFactory,
    },
    AppState,
};

/// Services wired to a fresh in-memory SQLite database and an in-memory directory.
///
/// Every context gets one company, one site, a requester registered at that site, a site admin
/// and a company approver.
pub struct TestContext {
    pub db: Arc<DbPool>,
    pub directory: Arc<InMemoryDirectory>,
    pub services: ServiceContainer,
    pub company_id: CompanyId,
    pub site_id: SiteId,
    pub requester_id: EmployeeId,
    pub site_admin: EmployeeId,
    pub company_admin: EmployeeId,
    events: mpsc::Receiver<Event>,
}

impl TestContext {
    pub async fn new(policy: ApprovalPolicy) -> Self {
        let pool = db::establish_connection_with_config(&DbConfig::in_memory())
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db = Arc::new(pool);

        let company_id = CompanyId::new();
        let site_id = SiteId::new();
        let requester_id = EmployeeId::new();
        let site_admin = EmployeeId::new();
        let company_admin = EmployeeId::new();

        let directory = Arc::new(InMemoryDirectory::new());
        directory.set_policy(company_id, policy);
        directory.register_employee(requester_id, site_id);
        directory.grant_site_admin(site_admin, site_id);
        directory.grant_company_approver(company_admin, company_id);

        let (event_tx, event_rx) = mpsc::channel(4096);
        let factory = ServiceFactory::new(
            db.clone(),
            Directory::in_memory(directory.clone()),
            Some(Arc::new(EventSender::new(event_tx))),
        );
        let services = ServiceContainer::new(&factory);

        Self {
            db,
            directory,
            services,
            company_id,
            site_id,
            requester_id,
            site_admin,
            company_admin,
            events: event_rx,
        }
    }

    /// Registers a new product supplied to the test company by `supplier_id`.
    pub fn add_product(&self, supplier_id: SupplierId) -> ProductId {
        let product_id = ProductId::new();
        self.directory
            .assign_supplier(self.company_id, product_id, supplier_id);
        product_id
    }

    /// Everything published since the last drain.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn checkout_request(&self, lines: Vec<CartLine>) -> CheckoutRequest {
        CheckoutRequest {
            requester_id: self.requester_id,
            company_id: self.company_id,
            lines,
        }
    }

    pub async fn checkout(&self, lines: Vec<CartLine>) -> SplitOutcome {
        self.services
            .purchase_requests
            .submit_cart(self.checkout_request(lines))
            .await
            .expect("checkout should succeed")
    }

    pub fn site_approval(&self) -> ApprovalAction {
        ApprovalAction {
            role: ApproverRole::SiteAdmin,
            approver_id: self.site_admin,
            pr_reference: Some(PrReference {
                number: "PR-1001".to_string(),
                date: date(2024, 3, 1),
            }),
        }
    }

    pub fn company_approval(&self) -> ApprovalAction {
        ApprovalAction {
            role: ApproverRole::CompanyAdmin,
            approver_id: self.company_admin,
            pr_reference: None,
        }
    }

    pub fn consolidation(&self, ids: Vec<PurchaseRequestId>) -> ConsolidationRequest {
        ConsolidationRequest {
            company_id: self.company_id,
            purchase_request_ids: ids,
            client_po_number: "CPO-42".to_string(),
            po_date: date(2024, 3, 2),
            created_by: self.company_admin,
        }
    }

    pub async fn consolidate(&self, ids: Vec<PurchaseRequestId>) -> Vec<PurchaseOrderView> {
        self.services
            .purchase_orders
            .create_purchase_orders(self.consolidation(ids))
            .await
            .expect("consolidation should succeed")
    }

    pub async fn refresh(&self, request_id: PurchaseRequestId) -> PurchaseRequestView {
        self.services
            .purchase_requests
            .get_request(request_id)
            .await
            .expect("request should exist")
    }

    /// Dispatches every outstanding unit of the request.
    pub async fn dispatch_all(&self, request_id: PurchaseRequestId) -> DispatchOutcome {
        let view = self.refresh(request_id).await;
        let lines = open_lines(&view, |item| item.ordered_quantity - item.dispatched_quantity);
        self.services
            .fulfilment
            .record_dispatch(
                request_id,
                SupplierId::from(view.request.supplier_id),
                lines,
                DispatchMeta::default(),
            )
            .await
            .expect("dispatch should succeed")
    }

    /// Delivers every dispatched but undelivered unit of the request.
    pub async fn deliver_all(&self, request_id: PurchaseRequestId) -> DeliveryOutcome {
        let view = self.refresh(request_id).await;
        let lines = open_lines(&view, |item| item.dispatched_quantity - item.delivered_quantity);
        self.services
            .fulfilment
            .record_delivery(
                request_id,
                SupplierId::from(view.request.supplier_id),
                lines,
                DeliveryMeta::default(),
            )
            .await
            .expect("delivery should succeed")
    }

    pub async fn set_stock(
        &self,
        supplier_id: SupplierId,
        product_id: ProductId,
        size: &str,
        quantity: i32,
    ) -> InventoryView {
        self.services
            .inventory
            .set_stock_level(StockLevelUpdate {
                supplier_id,
                product_id,
                size: size.to_string(),
                quantity,
                low_stock_threshold: None,
            })
            .await
            .expect("stock update should succeed")
    }

    pub async fn stock_of(&self, supplier_id: SupplierId, product_id: ProductId, size: &str) -> i32 {
        self.services
            .inventory
            .get_inventory(supplier_id, product_id)
            .await
            .expect("inventory record should exist")
            .stock
            .get(size)
            .copied()
            .unwrap_or(0)
    }

    /// Full HTTP application over the same services.
    pub fn app(&self) -> Router {
        let config = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        let state = AppState::new(self.db.clone(), config, self.services.clone());
        uniform_procurement::app_router(state, discard_logger())
    }
}

fn open_lines(
    view: &PurchaseRequestView,
    open: impl Fn(&uniform_procurement::entities::purchase_request_item::Model) -> i32,
) -> Vec<LineQuantity> {
    view.items
        .iter()
        .map(|item| LineQuantity {
            item_id: PurchaseRequestItemId::from(item.id),
            quantity: open(item),
        })
        .filter(|line| line.quantity > 0)
        .collect()
}

pub fn line(product_id: ProductId, size: &str, quantity: i32, unit_price: Decimal) -> CartLine {
    CartLine {
        product_id,
        size: size.to_string(),
        quantity,
        unit_price,
    }
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

pub fn item_id(view: &PurchaseRequestView, index: usize) -> PurchaseRequestItemId {
    PurchaseRequestItemId::from(view.items[index].id)
}

/// Send a request against the router with an optional JSON body.
pub async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> Response {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        }
        None => Body::empty(),
    };
    let request = builder.body(body).expect("failed to build request");
    app.clone()
        .oneshot(request)
        .await
        .expect("router error during test request")
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}
