use crate::{
    db::DbPool,
    directory::{Directory, SupplierResolution},
    entities::{
        purchase_order::{
            self, Entity as PurchaseOrderEntity, Model as PurchaseOrderModel, PurchaseOrderStatus,
        },
        purchase_request::{
            self, ApprovalStage, Entity as PurchaseRequestEntity, Model as PurchaseRequestModel,
            RequestStatus,
        },
        request_po_link::{self, Entity as RequestPoLinkEntity},
    },
    errors::ServiceError,
    events::{publish_all, Event, EventSender},
    ids::{CompanyId, EmployeeId, ProductId, PurchaseOrderId, PurchaseRequestId, SupplierId},
    services::{
        fulfilment::{derive_shipping_status, ShippingStatus},
        purchase_requests::{
            attach_items, edit, is_ready_for_po, load_items, save_request, PurchaseRequestView,
        },
    },
};
use chrono::{NaiveDate, Utc};
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ConsolidationRequest {
    pub company_id: CompanyId,
    #[validate(length(min = 1, message = "At least one purchase request is required"))]
    pub purchase_request_ids: Vec<PurchaseRequestId>,
    #[validate(length(min = 1, max = 64, message = "Client PO number is required"))]
    pub client_po_number: String,
    pub po_date: NaiveDate,
    pub created_by: EmployeeId,
}

/// A purchase order with its linked requests and derived shipping status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseOrderView {
    #[serde(flatten)]
    pub order: PurchaseOrderModel,
    pub purchase_request_ids: Vec<PurchaseRequestId>,
    pub shipping_status: ShippingStatus,
}

impl PurchaseOrderView {
    pub fn id(&self) -> PurchaseOrderId {
        PurchaseOrderId::from(self.order.id)
    }
}

/// Consolidates approved purchase requests into one purchase order per supplier.
#[derive(Clone)]
pub struct PurchaseOrderService {
    db_pool: Arc<DbPool>,
    directory: Directory,
    event_sender: Option<Arc<EventSender>>,
}

impl PurchaseOrderService {
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

    /// Creates purchase orders for the given requests, grouped by supplier.
    #[instrument(skip(self, request), fields(company_id = %request.company_id, requests = request.purchase_request_ids.len()))]
    pub async fn create_purchase_orders(
        &self,
        request: ConsolidationRequest,
    ) -> Result<Vec<PurchaseOrderView>, ServiceError> {
        request.validate()?;
        let client_po_number = request.client_po_number.trim().to_string();
        if client_po_number.is_empty() {
            return Err(ServiceError::ValidationError(
                "Client PO number is required".to_string(),
            ));
        }
        let mut unique = HashSet::new();
        if let Some(dup) = request
            .purchase_request_ids
            .iter()
            .find(|id| !unique.insert(**id))
        {
            return Err(ServiceError::ValidationError(format!(
                "Purchase request {} listed more than once",
                dup
            )));
        }

        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start consolidation transaction");
            ServiceError::DatabaseError(e)
        })?;

        let ids: Vec<Uuid> = request
            .purchase_request_ids
            .iter()
            .map(|id| id.as_uuid())
            .collect();
        let requests = PurchaseRequestEntity::find()
            .filter(purchase_request::Column::Id.is_in(ids.clone()))
            .all(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;

        if requests.len() != ids.len() {
            let found: HashSet<Uuid> = requests.iter().map(|r| r.id).collect();
            let missing: Vec<String> = ids
                .iter()
                .filter(|id| !found.contains(id))
                .map(Uuid::to_string)
                .collect();
            return Err(ServiceError::NotFound(format!(
                "Purchase requests not found: {}",
                missing.join(", ")
            )));
        }

        for pr in &requests {
            if pr.company_id != request.company_id.as_uuid() {
                return Err(ServiceError::ValidationError(format!(
                    "Purchase request {} belongs to a different company",
                    pr.id
                )));
            }
            if !is_ready_for_po(pr) {
                return Err(ServiceError::InvalidStatus(format!(
                    "Purchase request {} is not ready for a purchase order (stage {}, status {})",
                    pr.id, pr.approval_stage, pr.status
                )));
            }
        }

        self.revalidate_suppliers(&txn, &requests, request.company_id)
            .await?;

        let mut groups: BTreeMap<SupplierId, Vec<PurchaseRequestModel>> = BTreeMap::new();
        for pr in requests {
            groups
                .entry(SupplierId::from(pr.supplier_id))
                .or_default()
                .push(pr);
        }

        let now = Utc::now();
        let mut created = Vec::with_capacity(groups.len());
        for (supplier_id, members) in groups {
            let po_id = PurchaseOrderId::new();
            let order = purchase_order::ActiveModel {
                id: Set(po_id.as_uuid()),
                company_id: Set(request.company_id.as_uuid()),
                supplier_id: Set(supplier_id.as_uuid()),
                client_po_number: Set(client_po_number.clone()),
                po_date: Set(request.po_date),
                created_by: Set(request.created_by.as_uuid()),
                status: Set(PurchaseOrderStatus::Created),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&txn)
            .await
            .map_err(|e| {
                error!(error = %e, purchase_order_id = %po_id, "Failed to insert purchase order");
                ServiceError::DatabaseError(e)
            })?;

            let mut linked = Vec::with_capacity(members.len());
            for pr in &members {
                request_po_link::ActiveModel {
                    purchase_request_id: Set(pr.id),
                    purchase_order_id: Set(po_id.as_uuid()),
                    created_at: Set(now),
                }
                .insert(&txn)
                .await
                .map_err(|e| {
                    if ServiceError::is_unique_violation(&e) {
                        ServiceError::InvariantViolation(format!(
                            "Purchase request {} is already linked to a purchase order",
                            pr.id
                        ))
                    } else {
                        ServiceError::DatabaseError(e)
                    }
                })?;

                let mut changes = edit(pr);
                changes.approval_stage = Set(ApprovalStage::PoCreated);
                changes.status = Set(RequestStatus::AwaitingFulfilment);
                save_request(&txn, pr, changes).await?;
                linked.push(PurchaseRequestId::from(pr.id));
            }

            created.push(PurchaseOrderView {
                order,
                purchase_request_ids: linked,
                shipping_status: ShippingStatus::AwaitingShipment,
            });
        }

        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit consolidation");
            ServiceError::DatabaseError(e)
        })?;

        counter!("procurement.purchase_orders.created", created.len() as u64);
        info!(
            purchase_orders = created.len(),
            client_po_number = %client_po_number,
            "Purchase orders created"
        );

        let events = created
            .iter()
            .map(|view| Event::PurchaseOrderCreated {
                purchase_order_id: view.id(),
                supplier_id: SupplierId::from(view.order.supplier_id),
                request_count: view.purchase_request_ids.len(),
            })
            .collect();
        publish_all(self.event_sender.as_deref(), events).await;

        Ok(created)
    }

    /// Every product on every request must still resolve to that request's supplier.
    async fn revalidate_suppliers<C: ConnectionTrait>(
        &self,
        conn: &C,
        requests: &[PurchaseRequestModel],
        company_id: CompanyId,
    ) -> Result<(), ServiceError> {
        let ids: Vec<Uuid> = requests.iter().map(|r| r.id).collect();
        let items = load_items(conn, &ids).await?;

        let mut checked: BTreeSet<(Uuid, Uuid)> = BTreeSet::new();
        for item in &items {
            let Some(pr) = requests.iter().find(|r| r.id == item.purchase_request_id) else {
                continue;
            };
            if !checked.insert((item.product_id, pr.supplier_id)) {
                continue;
            }
            let product_id = ProductId::from(item.product_id);
            match self
                .directory
                .suppliers
                .resolve_supplier(product_id, company_id)
                .await?
            {
                SupplierResolution::Found(supplier) if supplier.as_uuid() == pr.supplier_id => {}
                SupplierResolution::Found(supplier) => {
                    warn!(product_id = %product_id, expected = %pr.supplier_id, resolved = %supplier, "Supplier assignment changed");
                    return Err(ServiceError::InvariantViolation(format!(
                        "Product {} on request {} now resolves to supplier {}",
                        product_id, pr.id, supplier
                    )));
                }
                SupplierResolution::MultipleFound(found) => {
                    return Err(ServiceError::InvariantViolation(format!(
                        "Multiple suppliers ({}) are mapped to product {}",
                        found.len(),
                        product_id
                    )));
                }
                SupplierResolution::NotFound => {
                    return Err(ServiceError::InvariantViolation(format!(
                        "Product {} on request {} no longer has a supplier",
                        product_id, pr.id
                    )));
                }
            }
        }
        Ok(())
    }

    #[instrument(skip(self), fields(purchase_order_id = %po_id))]
    pub async fn get_purchase_order(
        &self,
        po_id: PurchaseOrderId,
    ) -> Result<PurchaseOrderView, ServiceError> {
        let db = &*self.db_pool;
        let order = find_order(db, po_id).await?;
        order_view(db, order).await
    }

    /// Moves a purchase order forward along its lifecycle. Repeating the current status is a no-op.
    #[instrument(skip(self), fields(purchase_order_id = %po_id, target = %target))]
    pub async fn advance_purchase_order_status(
        &self,
        po_id: PurchaseOrderId,
        target: PurchaseOrderStatus,
    ) -> Result<PurchaseOrderView, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;

        let order = find_order(&txn, po_id).await?;
        if target.rank() < order.status.rank() {
            return Err(ServiceError::InvalidStatus(format!(
                "Purchase order {} is {} and cannot move back to {}",
                po_id, order.status, target
            )));
        }

        let change = bump_status_in(&txn, po_id, target).await?;
        let order = find_order(&txn, po_id).await?;
        let view = order_view(&txn, order).await?;
        txn.commit().await.map_err(ServiceError::DatabaseError)?;

        if let Some(event) = change {
            publish_all(self.event_sender.as_deref(), vec![event]).await;
        }
        Ok(view)
    }
}

pub(crate) async fn find_order<C: ConnectionTrait>(
    conn: &C,
    po_id: PurchaseOrderId,
) -> Result<PurchaseOrderModel, ServiceError> {
    PurchaseOrderEntity::find_by_id(po_id.as_uuid())
        .one(conn)
        .await
        .map_err(ServiceError::DatabaseError)?
        .ok_or_else(|| ServiceError::NotFound(format!("Purchase order {} not found", po_id)))
}

/// Requests linked to a purchase order, with their items.
pub(crate) async fn linked_requests<C: ConnectionTrait>(
    conn: &C,
    po_id: PurchaseOrderId,
) -> Result<Vec<PurchaseRequestView>, ServiceError> {
    let request_ids: Vec<Uuid> = RequestPoLinkEntity::find()
        .filter(request_po_link::Column::PurchaseOrderId.eq(po_id.as_uuid()))
        .all(conn)
        .await
        .map_err(ServiceError::DatabaseError)?
        .into_iter()
        .map(|link| link.purchase_request_id)
        .collect();
    if request_ids.is_empty() {
        return Ok(Vec::new());
    }

    let requests = PurchaseRequestEntity::find()
        .filter(purchase_request::Column::Id.is_in(request_ids))
        .order_by_asc(purchase_request::Column::CreatedAt)
        .all(conn)
        .await
        .map_err(ServiceError::DatabaseError)?;
    attach_items(conn, requests).await
}

/// Purchase orders a request was consolidated into.
pub(crate) async fn orders_for_request<C: ConnectionTrait>(
    conn: &C,
    request_id: PurchaseRequestId,
) -> Result<Vec<PurchaseOrderId>, ServiceError> {
    Ok(RequestPoLinkEntity::find()
        .filter(request_po_link::Column::PurchaseRequestId.eq(request_id.as_uuid()))
        .all(conn)
        .await
        .map_err(ServiceError::DatabaseError)?
        .into_iter()
        .map(|link| PurchaseOrderId::from(link.purchase_order_id))
        .collect())
}

pub(crate) async fn order_view<C: ConnectionTrait>(
    conn: &C,
    order: PurchaseOrderModel,
) -> Result<PurchaseOrderView, ServiceError> {
    let requests = linked_requests(conn, PurchaseOrderId::from(order.id)).await?;
    let shipping_status = derive_shipping_status(requests.iter().flat_map(|r| r.items.iter()));
    Ok(PurchaseOrderView {
        order,
        purchase_request_ids: requests.iter().map(PurchaseRequestView::id).collect(),
        shipping_status,
    })
}

/// Raises the order to `target` if it is currently behind it, returning the change event.
pub(crate) async fn bump_status_in<C: ConnectionTrait>(
    conn: &C,
    po_id: PurchaseOrderId,
    target: PurchaseOrderStatus,
) -> Result<Option<Event>, ServiceError> {
    let order = find_order(conn, po_id).await?;
    if order.status.rank() >= target.rank() {
        return Ok(None);
    }

    let old_status = order.status;
    let mut changes = order.into_active_model();
    changes.status = Set(target);
    changes.updated_at = Set(Utc::now());
    changes.update(conn).await.map_err(|e| {
        error!(error = %e, purchase_order_id = %po_id, "Failed to update purchase order status");
        ServiceError::DatabaseError(e)
    })?;

    info!(purchase_order_id = %po_id, from = %old_status, to = %target, "Purchase order status changed");
    Ok(Some(Event::PurchaseOrderStatusChanged {
        purchase_order_id: po_id,
        old_status: old_status.to_string(),
        new_status: target.to_string(),
    }))
}
