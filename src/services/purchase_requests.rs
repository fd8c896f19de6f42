use crate::{
    db::DbPool,
    directory::{Directory, SupplierResolution},
    entities::{
        purchase_request::{
            self, ApprovalStage, Entity as PurchaseRequestEntity, Model as PurchaseRequestModel,
            RequestStatus, RequestType,
        },
        purchase_request_item::{self, Entity as PurchaseRequestItemEntity},
    },
    errors::ServiceError,
    events::{publish_all, Event, EventSender},
    ids::{
        CompanyId, EmployeeId, ParentRequestId, ProductId, PurchaseRequestId, ReturnRequestId,
        SupplierId,
    },
    services::approval::{initial_state, ApprovalPolicy},
};
use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, IntoActiveModel,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// One line of an employee's cart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct CartLine {
    pub product_id: ProductId,
    #[validate(length(min = 1, max = 32, message = "Size is required"))]
    pub size: String,
    #[validate(range(min = 1, max = 10_000, message = "Quantity must be between 1 and 10000"))]
    pub quantity: i32,
    pub unit_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CheckoutRequest {
    pub requester_id: EmployeeId,
    pub company_id: CompanyId,
    #[validate(length(min = 1, message = "Cart must contain at least one line"))]
    pub lines: Vec<CartLine>,
}

/// A purchase request together with its line items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseRequestView {
    #[serde(flatten)]
    pub request: PurchaseRequestModel,
    pub items: Vec<purchase_request_item::Model>,
}

impl PurchaseRequestView {
    pub fn id(&self) -> PurchaseRequestId {
        PurchaseRequestId::from(self.request.id)
    }
}

/// What a checkout produced: one request, or several siblings under a shared parent id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SplitOutcome {
    Single {
        request: PurchaseRequestView,
    },
    Split {
        parent_request_id: ParentRequestId,
        requests: Vec<PurchaseRequestView>,
    },
}

impl SplitOutcome {
    pub fn requests(&self) -> Vec<&PurchaseRequestView> {
        match self {
            SplitOutcome::Single { request } => vec![request],
            SplitOutcome::Split { requests, .. } => requests.iter().collect(),
        }
    }

    pub fn into_requests(self) -> Vec<PurchaseRequestView> {
        match self {
            SplitOutcome::Single { request } => vec![request],
            SplitOutcome::Split { requests, .. } => requests,
        }
    }

    pub fn parent_request_id(&self) -> Option<ParentRequestId> {
        match self {
            SplitOutcome::Single { .. } => None,
            SplitOutcome::Split {
                parent_request_id, ..
            } => Some(*parent_request_id),
        }
    }
}

/// Validated, fully resolved checkout ready to be written.
#[derive(Debug, Clone)]
pub(crate) struct SplitPlan {
    pub requester_id: EmployeeId,
    pub company_id: CompanyId,
    pub site_id: Option<Uuid>,
    pub policy: ApprovalPolicy,
    /// Set only by the returns service once the return record id is known.
    pub replacement_source_id: Option<ReturnRequestId>,
    /// Cart lines grouped by supplier, each line keeping its cart position.
    pub groups: BTreeMap<SupplierId, Vec<(usize, CartLine)>>,
}

/// Partitions cart lines by the supplier resolved for their product.
///
/// Every line lands in exactly one group; a product missing from `suppliers` is an error.
pub fn partition_cart(
    lines: &[CartLine],
    suppliers: &HashMap<ProductId, SupplierId>,
) -> Result<BTreeMap<SupplierId, Vec<(usize, CartLine)>>, ServiceError> {
    let mut groups: BTreeMap<SupplierId, Vec<(usize, CartLine)>> = BTreeMap::new();
    for (position, line) in lines.iter().enumerate() {
        let supplier = suppliers.get(&line.product_id).ok_or_else(|| {
            ServiceError::ValidationError(format!(
                "No supplier resolved for product {}",
                line.product_id
            ))
        })?;
        groups
            .entry(*supplier)
            .or_default()
            .push((position, line.clone()));
    }
    Ok(groups)
}

fn validate_cart(request: &CheckoutRequest) -> Result<(), ServiceError> {
    request.validate()?;
    for (position, line) in request.lines.iter().enumerate() {
        line.validate().map_err(|e| {
            ServiceError::ValidationError(format!("Line {}: {}", position + 1, e))
        })?;
        if line.size.trim().is_empty() {
            return Err(ServiceError::ValidationError(format!(
                "Line {}: size is required",
                position + 1
            )));
        }
        if line.unit_price.is_sign_negative() {
            return Err(ServiceError::ValidationError(format!(
                "Line {}: unit price cannot be negative",
                position + 1
            )));
        }
    }
    Ok(())
}

/// Splits carts into single-supplier purchase requests and serves request lookups.
#[derive(Clone)]
pub struct PurchaseRequestService {
    db_pool: Arc<DbPool>,
    directory: Directory,
    event_sender: Option<Arc<EventSender>>,
}

impl PurchaseRequestService {
    pub fn new(
        db_pool: Arc<DbPool>,
        directory: Directory,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db_pool,
            directory,
            event_sender,
        }
    }

    /// Turns a cart into one purchase request per supplier.
    #[instrument(skip(self, request), fields(requester_id = %request.requester_id, company_id = %request.company_id, lines = request.lines.len()))]
    pub async fn submit_cart(&self, request: CheckoutRequest) -> Result<SplitOutcome, ServiceError> {
        let plan = self.prepare_split(&request).await?;

        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for checkout");
            ServiceError::DatabaseError(e)
        })?;

        let outcome = persist_split(&txn, &plan).await?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit checkout transaction");
            ServiceError::DatabaseError(e)
        })?;

        self.after_split(&outcome).await;
        Ok(outcome)
    }

    /// Runs every check and lookup a checkout needs without writing anything.
    pub(crate) async fn prepare_split(
        &self,
        request: &CheckoutRequest,
    ) -> Result<SplitPlan, ServiceError> {
        validate_cart(request)?;

        let mut ineligible = Vec::new();
        for (position, line) in request.lines.iter().enumerate() {
            let eligible = self
                .directory
                .eligibility
                .is_eligible(
                    request.requester_id,
                    request.company_id,
                    line.product_id,
                    &line.size,
                    line.quantity,
                )
                .await?;
            if !eligible {
                ineligible.push(format!(
                    "line {} (product {}, size {}, qty {})",
                    position + 1,
                    line.product_id,
                    line.size,
                    line.quantity
                ));
            }
        }
        if !ineligible.is_empty() {
            warn!(requester_id = %request.requester_id, "Cart contains ineligible lines");
            return Err(ServiceError::ValidationError(format!(
                "Requester is not eligible for: {}",
                ineligible.join(", ")
            )));
        }

        let policy = self
            .directory
            .policies
            .approval_policy(request.company_id)
            .await?;

        let mut suppliers = HashMap::new();
        for line in &request.lines {
            if suppliers.contains_key(&line.product_id) {
                continue;
            }
            let supplier = match self
                .directory
                .suppliers
                .resolve_supplier(line.product_id, request.company_id)
                .await?
            {
                SupplierResolution::Found(supplier) => supplier,
                SupplierResolution::NotFound => {
                    return Err(ServiceError::ValidationError(format!(
                        "No supplier is authorized to fulfil product {} for company {}",
                        line.product_id, request.company_id
                    )))
                }
                SupplierResolution::MultipleFound(found) => {
                    error!(product_id = %line.product_id, suppliers = found.len(), "Multiple suppliers resolved for one product");
                    return Err(ServiceError::InvariantViolation(format!(
                        "Multiple suppliers ({}) are mapped to product {}; a product must have exactly one supplier",
                        found.len(),
                        line.product_id
                    )));
                }
            };
            suppliers.insert(line.product_id, supplier);
        }

        let groups = partition_cart(&request.lines, &suppliers)?;
        let site_id = self
            .directory
            .approvers
            .registered_site(request.requester_id)
            .await?
            .map(Uuid::from);

        Ok(SplitPlan {
            requester_id: request.requester_id,
            company_id: request.company_id,
            site_id,
            policy,
            replacement_source_id: None,
            groups,
        })
    }

    pub(crate) async fn after_split(&self, outcome: &SplitOutcome) {
        let parent = outcome.parent_request_id();
        let requests = outcome.requests();
        counter!("procurement.purchase_requests.created", requests.len() as u64);
        info!(
            parent_request_id = ?parent,
            request_count = requests.len(),
            "Checkout split into purchase requests"
        );

        let events = requests
            .iter()
            .map(|view| Event::PurchaseRequestCreated {
                purchase_request_id: view.id(),
                parent_request_id: parent,
                supplier_id: SupplierId::from(view.request.supplier_id),
            })
            .collect();
        publish_all(self.event_sender.as_deref(), events).await;
    }

    /// Fetches a purchase request with its items.
    #[instrument(skip(self), fields(purchase_request_id = %id))]
    pub async fn get_request(
        &self,
        id: PurchaseRequestId,
    ) -> Result<PurchaseRequestView, ServiceError> {
        let db = &*self.db_pool;
        let request = find_request(db, id).await?;
        let mut views = attach_items(db, vec![request]).await?;
        views
            .pop()
            .ok_or_else(|| ServiceError::InternalError("request view missing".to_string()))
    }

    /// Lists every sibling created from one checkout.
    #[instrument(skip(self), fields(parent_request_id = %parent_id))]
    pub async fn get_siblings(
        &self,
        parent_id: ParentRequestId,
    ) -> Result<Vec<PurchaseRequestView>, ServiceError> {
        let db = &*self.db_pool;
        let requests = PurchaseRequestEntity::find()
            .filter(purchase_request::Column::ParentRequestId.eq(parent_id.as_uuid()))
            .order_by_asc(purchase_request::Column::SupplierId)
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)?;
        if requests.is_empty() {
            return Err(ServiceError::NotFound(format!(
                "No purchase requests under parent {}",
                parent_id
            )));
        }
        attach_items(db, requests).await
    }
}

/// Writes every request of a split plan. Callers own the transaction.
pub(crate) async fn persist_split<C: ConnectionTrait>(
    conn: &C,
    plan: &SplitPlan,
) -> Result<SplitOutcome, ServiceError> {
    let now = Utc::now();
    let parent_id = (plan.groups.len() > 1).then(ParentRequestId::new);
    let (stage, status) = initial_state(&plan.policy);
    let request_type = if plan.replacement_source_id.is_some() {
        RequestType::Replacement
    } else {
        RequestType::Standard
    };

    let mut views = Vec::with_capacity(plan.groups.len());
    for (supplier_id, lines) in &plan.groups {
        let request_id = PurchaseRequestId::new();
        let request = purchase_request::ActiveModel {
            id: Set(request_id.as_uuid()),
            parent_request_id: Set(parent_id.map(|p| p.as_uuid())),
            requester_id: Set(plan.requester_id.as_uuid()),
            company_id: Set(plan.company_id.as_uuid()),
            site_id: Set(plan.site_id),
            supplier_id: Set(supplier_id.as_uuid()),
            request_type: Set(request_type),
            replacement_source_id: Set(plan.replacement_source_id.map(|r| r.as_uuid())),
            status: Set(status),
            approval_stage: Set(stage),
            pr_reference_number: Set(None),
            pr_reference_date: Set(None),
            site_approved_by: Set(None),
            site_approved_at: Set(None),
            company_approved_by: Set(None),
            company_approved_at: Set(None),
            rejection_reason: Set(None),
            rejection_notes: Set(None),
            rejected_by: Set(None),
            rejected_at: Set(None),
            carrier: Set(None),
            tracking_reference: Set(None),
            dispatched_at: Set(None),
            delivered_at: Set(None),
            received_by: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            version: Set(1),
        }
        .insert(conn)
        .await
        .map_err(|e| {
            error!(error = %e, purchase_request_id = %request_id, "Failed to insert purchase request");
            ServiceError::DatabaseError(e)
        })?;

        let mut items = Vec::with_capacity(lines.len());
        for (position, line) in lines {
            let item = purchase_request_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                purchase_request_id: Set(request_id.as_uuid()),
                line_number: Set(*position as i32 + 1),
                product_id: Set(line.product_id.as_uuid()),
                size: Set(line.size.trim().to_string()),
                ordered_quantity: Set(line.quantity),
                dispatched_quantity: Set(0),
                delivered_quantity: Set(0),
                unit_price: Set(line.unit_price),
            }
            .insert(conn)
            .await
            .map_err(|e| {
                error!(error = %e, purchase_request_id = %request_id, "Failed to insert purchase request item");
                ServiceError::DatabaseError(e)
            })?;
            items.push(item);
        }

        info!(
            purchase_request_id = %request_id,
            supplier_id = %supplier_id,
            stage = %stage,
            items = items.len(),
            "Purchase request created"
        );
        views.push(PurchaseRequestView { request, items });
    }

    Ok(match parent_id {
        Some(parent_request_id) => SplitOutcome::Split {
            parent_request_id,
            requests: views,
        },
        None => {
            let request = views.pop().ok_or_else(|| {
                ServiceError::ValidationError("Cart produced no purchase requests".to_string())
            })?;
            SplitOutcome::Single { request }
        }
    })
}

pub(crate) async fn find_request<C: ConnectionTrait>(
    conn: &C,
    id: PurchaseRequestId,
) -> Result<PurchaseRequestModel, ServiceError> {
    PurchaseRequestEntity::find_by_id(id.as_uuid())
        .one(conn)
        .await
        .map_err(ServiceError::DatabaseError)?
        .ok_or_else(|| ServiceError::NotFound(format!("Purchase request {} not found", id)))
}

pub(crate) async fn load_items<C: ConnectionTrait>(
    conn: &C,
    request_ids: &[Uuid],
) -> Result<Vec<purchase_request_item::Model>, ServiceError> {
    if request_ids.is_empty() {
        return Ok(Vec::new());
    }
    PurchaseRequestItemEntity::find()
        .filter(purchase_request_item::Column::PurchaseRequestId.is_in(request_ids.to_vec()))
        .order_by_asc(purchase_request_item::Column::LineNumber)
        .all(conn)
        .await
        .map_err(ServiceError::DatabaseError)
}

/// Pairs each request with its items, preserving the order of `requests`.
pub(crate) async fn attach_items<C: ConnectionTrait>(
    conn: &C,
    requests: Vec<PurchaseRequestModel>,
) -> Result<Vec<PurchaseRequestView>, ServiceError> {
    let ids: Vec<Uuid> = requests.iter().map(|r| r.id).collect();
    let mut by_request: HashMap<Uuid, Vec<purchase_request_item::Model>> = HashMap::new();
    for item in load_items(conn, &ids).await? {
        by_request
            .entry(item.purchase_request_id)
            .or_default()
            .push(item);
    }
    Ok(requests
        .into_iter()
        .map(|request| {
            let items = by_request.remove(&request.id).unwrap_or_default();
            PurchaseRequestView { request, items }
        })
        .collect())
}

/// Persists changes to a request, failing if another writer bumped its version first.
pub(crate) async fn save_request<C: ConnectionTrait>(
    conn: &C,
    current: &PurchaseRequestModel,
    mut changes: purchase_request::ActiveModel,
) -> Result<PurchaseRequestModel, ServiceError> {
    changes.version = Set(current.version + 1);
    changes.updated_at = Set(Utc::now());
    PurchaseRequestEntity::update(changes)
        .filter(purchase_request::Column::Version.eq(current.version))
        .exec(conn)
        .await
        .map_err(|e| match e {
            DbErr::RecordNotUpdated => {
                warn!(purchase_request_id = %current.id, "Purchase request modified concurrently");
                ServiceError::ConcurrentModification(current.id)
            }
            other => {
                error!(error = %other, purchase_request_id = %current.id, "Failed to update purchase request");
                ServiceError::DatabaseError(other)
            }
        })
}

/// Starts an update of `current`; only fields set afterwards are written.
pub(crate) fn edit(current: &PurchaseRequestModel) -> purchase_request::ActiveModel {
    current.clone().into_active_model()
}

/// True when a request has cleared every approval step it needs and can join a purchase order.
pub(crate) fn is_ready_for_po(request: &PurchaseRequestModel) -> bool {
    match request.approval_stage {
        ApprovalStage::CompanyApproved => true,
        ApprovalStage::SiteApproved | ApprovalStage::NotRequired => {
            request.status == RequestStatus::AwaitingFulfilment
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn line(product: ProductId, size: &str, quantity: i32) -> CartLine {
        CartLine {
            product_id: product,
            size: size.to_string(),
            quantity,
            unit_price: dec!(10.00),
        }
    }

    #[test]
    fn partition_groups_by_supplier_and_keeps_positions() {
        let shirt = ProductId::new();
        let trousers = ProductId::new();
        let cap = ProductId::new();
        let north = SupplierId::new();
        let south = SupplierId::new();
        let suppliers = HashMap::from([(shirt, north), (trousers, south), (cap, north)]);

        let lines = vec![line(shirt, "M", 2), line(trousers, "32", 1), line(cap, "L", 1)];
        let groups = partition_cart(&lines, &suppliers).unwrap();

        assert_eq!(groups.len(), 2);
        let north_positions: Vec<usize> = groups[&north].iter().map(|(p, _)| *p).collect();
        assert_eq!(north_positions, vec![0, 2]);
        assert_eq!(groups[&south][0].1.product_id, trousers);
    }

    #[test]
    fn partition_rejects_unresolved_products() {
        let lines = vec![line(ProductId::new(), "M", 1)];
        let err = partition_cart(&lines, &HashMap::new()).unwrap_err();
        assert!(matches!(err, ServiceError::ValidationError(_)));
    }

    #[test]
    fn negative_prices_and_empty_sizes_fail_validation() {
        let base = CheckoutRequest {
            requester_id: EmployeeId::new(),
            company_id: CompanyId::new(),
            lines: vec![line(ProductId::new(), "M", 1)],
        };
        assert!(validate_cart(&base).is_ok());

        let mut negative = base.clone();
        negative.lines[0].unit_price = dec!(-1);
        assert!(validate_cart(&negative).is_err());

        let mut no_size = base.clone();
        no_size.lines[0].size.clear();
        assert!(validate_cart(&no_size).is_err());

        let mut blank_size = base.clone();
        blank_size.lines[0].size = "   ".to_string();
        assert!(validate_cart(&blank_size).is_err());

        let mut bulk = base.clone();
        bulk.lines[0].quantity = 10_001;
        assert!(validate_cart(&bulk).is_err());

        let mut empty = base;
        empty.lines.clear();
        assert!(validate_cart(&empty).is_err());
    }

    proptest! {
        #[test]
        fn partition_is_exact(assignments in proptest::collection::vec((0usize..4, 1i32..20), 1..24)) {
            let products: Vec<ProductId> = (0..6).map(|_| ProductId::new()).collect();
            let suppliers_pool: Vec<SupplierId> = (0..4).map(|_| SupplierId::new()).collect();
            let suppliers: HashMap<ProductId, SupplierId> = products
                .iter()
                .enumerate()
                .map(|(i, p)| (*p, suppliers_pool[i % suppliers_pool.len()]))
                .collect();

            let lines: Vec<CartLine> = assignments
                .iter()
                .enumerate()
                .map(|(i, (product_idx, qty))| line(products[(product_idx + i) % products.len()], "M", *qty))
                .collect();

            let groups = partition_cart(&lines, &suppliers).unwrap();

            let mut seen: Vec<usize> = groups.values().flatten().map(|(p, _)| *p).collect();
            seen.sort_unstable();
            prop_assert_eq!(seen, (0..lines.len()).collect::<Vec<_>>());

            for (supplier, group) in &groups {
                for (position, grouped) in group {
                    prop_assert_eq!(&suppliers[&grouped.product_id], supplier);
                    prop_assert_eq!(grouped, &lines[*position]);
                }
            }
        }
    }
}
