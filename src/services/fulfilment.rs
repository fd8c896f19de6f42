use crate::{
    db::DbPool,
    entities::{
        purchase_order::PurchaseOrderStatus,
        purchase_request::{ApprovalStage, Model as PurchaseRequestModel, RequestStatus, RequestType},
        purchase_request_item::Model as ItemModel,
        return_request::{self, Entity as ReturnRequestEntity, ReturnStatus},
    },
    errors::ServiceError,
    events::{publish_all, Event, EventSender},
    ids::{
        ProductId, PurchaseOrderId, PurchaseRequestId, PurchaseRequestItemId, ReturnRequestId,
        SupplierId,
    },
    services::{
        inventory::{InventoryService, InventoryWarning, StockChange, StockKey},
        purchase_orders::{bump_status_in, linked_requests, orders_for_request},
        purchase_requests::{
            attach_items, edit, find_request, load_items, save_request, PurchaseRequestView,
        },
    },
};
use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{ActiveModelTrait, ConnectionTrait, EntityTrait, IntoActiveModel, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use validator::Validate;

/// Shipping progress of a purchase order, computed from its lines on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum ShippingStatus {
    AwaitingShipment,
    PartiallyShipped,
    FullyShipped,
    FullyDelivered,
}

/// Quantities of one request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineProgress {
    pub ordered: i32,
    pub dispatched: i32,
    pub delivered: i32,
}

impl From<&ItemModel> for LineProgress {
    fn from(item: &ItemModel) -> Self {
        Self {
            ordered: item.ordered_quantity,
            dispatched: item.dispatched_quantity,
            delivered: item.delivered_quantity,
        }
    }
}

pub fn shipping_status_of(lines: impl IntoIterator<Item = LineProgress>) -> ShippingStatus {
    let mut any_line = false;
    let mut all_delivered = true;
    let mut all_dispatched = true;
    let mut any_dispatched = false;
    for line in lines {
        any_line = true;
        all_delivered &= line.delivered >= line.ordered;
        all_dispatched &= line.dispatched >= line.ordered;
        any_dispatched |= line.dispatched > 0;
    }

    if !any_line {
        ShippingStatus::AwaitingShipment
    } else if all_delivered {
        ShippingStatus::FullyDelivered
    } else if all_dispatched {
        ShippingStatus::FullyShipped
    } else if any_dispatched {
        ShippingStatus::PartiallyShipped
    } else {
        ShippingStatus::AwaitingShipment
    }
}

pub fn derive_shipping_status<'a>(items: impl IntoIterator<Item = &'a ItemModel>) -> ShippingStatus {
    shipping_status_of(items.into_iter().map(LineProgress::from))
}

/// Units moved for one request line by a single dispatch or delivery call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineQuantity {
    pub item_id: PurchaseRequestItemId,
    pub quantity: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Movement {
    Dispatch,
    Delivery,
}

/// Checks per-line quantities against what is still open and returns the lines that move.
///
/// Dispatch is capped by `ordered - dispatched`, delivery by `dispatched - delivered`.
pub fn plan_movement(
    items: &[ItemModel],
    lines: &[LineQuantity],
    movement: Movement,
) -> Result<Vec<(ItemModel, i32)>, ServiceError> {
    let mut seen = HashSet::new();
    let mut planned = Vec::new();
    for line in lines {
        if !seen.insert(line.item_id) {
            return Err(ServiceError::ValidationError(format!(
                "Line {} appears more than once",
                line.item_id
            )));
        }
        if line.quantity < 0 {
            return Err(ServiceError::ValidationError(format!(
                "Line {} has a negative quantity",
                line.item_id
            )));
        }
        let item = items
            .iter()
            .find(|item| item.id == line.item_id.as_uuid())
            .ok_or_else(|| {
                ServiceError::ValidationError(format!(
                    "Line {} does not belong to this purchase request",
                    line.item_id
                ))
            })?;

        let (open, what) = match movement {
            Movement::Dispatch => (item.ordered_quantity - item.dispatched_quantity, "dispatch"),
            Movement::Delivery => (item.dispatched_quantity - item.delivered_quantity, "deliver"),
        };
        if line.quantity > open {
            return Err(ServiceError::ValidationError(format!(
                "Cannot {} {} units of line {}; only {} outstanding",
                what, line.quantity, line.item_id, open
            )));
        }
        if line.quantity > 0 {
            planned.push((item.clone(), line.quantity));
        }
    }

    if planned.is_empty() {
        return Err(ServiceError::ValidationError(
            "At least one line must have a quantity greater than zero".to_string(),
        ));
    }
    Ok(planned)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct DispatchMeta {
    #[validate(length(max = 128))]
    pub carrier: Option<String>,
    #[validate(length(max = 128))]
    pub tracking_reference: Option<String>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct DeliveryMeta {
    pub delivered_at: Option<DateTime<Utc>>,
    #[validate(length(max = 128))]
    pub received_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub request: PurchaseRequestView,
    /// Stock shortfalls; the dispatch was still recorded.
    pub inventory_warnings: Vec<InventoryWarning>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub request: PurchaseRequestView,
    pub fully_delivered: bool,
    /// Set when this delivery completed a replacement and returned the original size to stock.
    pub restocked: Option<StockChange>,
}

/// Records supplier dispatches and employee deliveries against purchase requests.
#[derive(Clone)]
pub struct FulfilmentService {
    db_pool: Arc<DbPool>,
    inventory: InventoryService,
    event_sender: Option<Arc<EventSender>>,
}

impl FulfilmentService {
    pub fn new(
        db_pool: Arc<DbPool>,
        inventory: InventoryService,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db_pool,
            inventory,
            event_sender,
        }
    }

    #[instrument(skip(self, lines, meta), fields(purchase_request_id = %request_id, supplier_id = %supplier_id))]
    pub async fn record_dispatch(
        &self,
        request_id: PurchaseRequestId,
        supplier_id: SupplierId,
        lines: Vec<LineQuantity>,
        meta: DispatchMeta,
    ) -> Result<DispatchOutcome, ServiceError> {
        meta.validate()?;
        let db = &*self.db_pool;

        // Stock keys come from a read outside the transaction so locks are held before it opens.
        let preview = find_request(db, request_id).await?;
        let keys: Vec<StockKey> = load_items(db, &[preview.id])
            .await?
            .iter()
            .map(|item| {
                (
                    SupplierId::from(preview.supplier_id),
                    ProductId::from(item.product_id),
                )
            })
            .collect();
        let _guard = self.inventory.locks().acquire(keys).await;

        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start dispatch transaction");
            ServiceError::DatabaseError(e)
        })?;

        let request = find_request(&txn, request_id).await?;
        ensure_supplier(&request, supplier_id)?;
        if request.approval_stage != ApprovalStage::PoCreated {
            return Err(ServiceError::InvalidStatus(format!(
                "Purchase request {} is at stage {}; dispatch needs a purchase order",
                request_id, request.approval_stage
            )));
        }
        if !matches!(
            request.status,
            RequestStatus::AwaitingFulfilment | RequestStatus::Dispatched
        ) {
            return Err(ServiceError::InvalidStatus(format!(
                "Purchase request {} is {} and cannot be dispatched",
                request_id, request.status
            )));
        }

        let items = load_items(&txn, &[request.id]).await?;
        let planned = plan_movement(&items, &lines, Movement::Dispatch)?;

        let mut units = 0;
        let mut changes_made = Vec::with_capacity(planned.len());
        for (item, quantity) in &planned {
            let mut changes = item.clone().into_active_model();
            changes.dispatched_quantity = Set(item.dispatched_quantity + quantity);
            changes.update(&txn).await.map_err(|e| {
                error!(error = %e, item_id = %item.id, "Failed to update dispatched quantity");
                ServiceError::DatabaseError(e)
            })?;
            units += quantity;

            let change = self
                .inventory
                .decrement_in(
                    &txn,
                    supplier_id,
                    ProductId::from(item.product_id),
                    &item.size,
                    *quantity,
                )
                .await?;
            changes_made.push(change);
        }

        let mut changes = edit(&request);
        changes.status = Set(RequestStatus::Dispatched);
        if meta.carrier.is_some() {
            changes.carrier = Set(meta.carrier.clone());
        }
        if meta.tracking_reference.is_some() {
            changes.tracking_reference = Set(meta.tracking_reference.clone());
        }
        changes.dispatched_at = Set(Some(meta.dispatched_at.unwrap_or_else(Utc::now)));
        let saved = save_request(&txn, &request, changes).await?;

        let mut events = vec![Event::PurchaseRequestDispatched {
            purchase_request_id: request_id,
            units,
        }];
        for po_id in orders_for_request(&txn, request_id).await? {
            if let Some(event) = bump_status_in(&txn, po_id, PurchaseOrderStatus::InFulfilment).await? {
                events.push(event);
            }
        }

        let view = single_view(&txn, saved).await?;
        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit dispatch");
            ServiceError::DatabaseError(e)
        })?;

        let inventory_warnings: Vec<InventoryWarning> = changes_made
            .iter()
            .filter(|c| c.is_insufficient())
            .map(InventoryWarning::from)
            .collect();
        events.extend(changes_made.iter().flat_map(StockChange::events));

        counter!("procurement.dispatches.recorded", 1);
        counter!("procurement.units.dispatched", units as u64);
        if !inventory_warnings.is_empty() {
            warn!(warnings = inventory_warnings.len(), "Dispatch recorded with inventory shortfall");
        }
        info!(units, "Dispatch recorded");
        publish_all(self.event_sender.as_deref(), events).await;

        Ok(DispatchOutcome {
            request: view,
            inventory_warnings,
        })
    }

    #[instrument(skip(self, lines, meta), fields(purchase_request_id = %request_id, supplier_id = %supplier_id))]
    pub async fn record_delivery(
        &self,
        request_id: PurchaseRequestId,
        supplier_id: SupplierId,
        lines: Vec<LineQuantity>,
        meta: DeliveryMeta,
    ) -> Result<DeliveryOutcome, ServiceError> {
        meta.validate()?;
        let db = &*self.db_pool;

        let preview = find_request(db, request_id).await?;
        let pending_return = match (preview.request_type, preview.replacement_source_id) {
            (RequestType::Replacement, Some(return_id)) => ReturnRequestEntity::find_by_id(return_id)
                .one(db)
                .await
                .map_err(ServiceError::DatabaseError)?,
            _ => None,
        };
        let keys: Vec<StockKey> = pending_return
            .iter()
            .map(|r| (SupplierId::from(r.supplier_id), ProductId::from(r.product_id)))
            .collect();
        let _guard = self.inventory.locks().acquire(keys).await;

        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start delivery transaction");
            ServiceError::DatabaseError(e)
        })?;

        let request = find_request(&txn, request_id).await?;
        ensure_supplier(&request, supplier_id)?;
        if request.status != RequestStatus::Dispatched {
            return Err(ServiceError::InvalidStatus(format!(
                "Purchase request {} is {}; deliveries need a dispatch first",
                request_id, request.status
            )));
        }

        let items = load_items(&txn, &[request.id]).await?;
        let planned = plan_movement(&items, &lines, Movement::Delivery)?;

        let mut delivered_now = items.clone();
        for (item, quantity) in &planned {
            let new_total = item.delivered_quantity + quantity;
            let mut changes = item.clone().into_active_model();
            changes.delivered_quantity = Set(new_total);
            changes.update(&txn).await.map_err(|e| {
                error!(error = %e, item_id = %item.id, "Failed to update delivered quantity");
                ServiceError::DatabaseError(e)
            })?;
            if let Some(current) = delivered_now.iter_mut().find(|i| i.id == item.id) {
                current.delivered_quantity = new_total;
            }
        }
        let fully_delivered = delivered_now.iter().all(ItemModel::is_fully_delivered);

        let mut changes = edit(&request);
        if let Some(received_by) = &meta.received_by {
            changes.received_by = Set(Some(received_by.clone()));
        }
        if fully_delivered {
            changes.status = Set(RequestStatus::Delivered);
            changes.delivered_at = Set(Some(meta.delivered_at.unwrap_or_else(Utc::now)));
        }
        let saved = save_request(&txn, &request, changes).await?;

        let mut events = vec![Event::PurchaseRequestDelivered {
            purchase_request_id: request_id,
            fully_delivered,
        }];
        let restocked = if fully_delivered && request.request_type == RequestType::Replacement {
            self.complete_return(&txn, &request, &mut events).await?
        } else {
            None
        };

        let view = single_view(&txn, saved).await?;
        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit delivery");
            ServiceError::DatabaseError(e)
        })?;

        counter!("procurement.deliveries.recorded", 1);
        info!(fully_delivered, "Delivery recorded");
        publish_all(self.event_sender.as_deref(), events).await;

        Ok(DeliveryOutcome {
            request: view,
            fully_delivered,
            restocked,
        })
    }

    /// Restocks the returned size and closes the return. Runs once per return.
    async fn complete_return<C: ConnectionTrait>(
        &self,
        conn: &C,
        request: &PurchaseRequestModel,
        events: &mut Vec<Event>,
    ) -> Result<Option<StockChange>, ServiceError> {
        let Some(return_id) = request.replacement_source_id else {
            warn!(purchase_request_id = %request.id, "Replacement request has no return record");
            return Ok(None);
        };
        let record = ReturnRequestEntity::find_by_id(return_id)
            .one(conn)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| {
                ServiceError::InvariantViolation(format!(
                    "Return {} referenced by replacement {} does not exist",
                    return_id, request.id
                ))
            })?;
        if record.status == ReturnStatus::Completed {
            return Ok(None);
        }

        let change = self
            .inventory
            .increment_in(
                conn,
                SupplierId::from(record.supplier_id),
                ProductId::from(record.product_id),
                &record.original_size,
                record.quantity,
            )
            .await?;

        let now = Utc::now();
        let mut changes: return_request::ActiveModel = record.into_active_model();
        changes.status = Set(ReturnStatus::Completed);
        changes.completed_at = Set(Some(now));
        changes.updated_at = Set(now);
        changes.update(conn).await.map_err(|e| {
            error!(error = %e, return_request_id = %return_id, "Failed to complete return");
            ServiceError::DatabaseError(e)
        })?;

        events.push(Event::InventoryRestocked {
            supplier_id: change.supplier_id,
            product_id: change.product_id,
            size: change.size.clone(),
            quantity: change.requested,
        });
        events.push(Event::ReturnCompleted(ReturnRequestId::from(return_id)));
        Ok(Some(change))
    }

    /// Shipping status of a purchase order, derived from its linked request lines.
    #[instrument(skip(self), fields(purchase_order_id = %po_id))]
    pub async fn derive_po_shipping_status(
        &self,
        po_id: PurchaseOrderId,
    ) -> Result<ShippingStatus, ServiceError> {
        let db = &*self.db_pool;
        shipping_status_in(db, po_id).await
    }
}

pub(crate) async fn shipping_status_in<C: ConnectionTrait>(
    conn: &C,
    po_id: PurchaseOrderId,
) -> Result<ShippingStatus, ServiceError> {
    crate::services::purchase_orders::find_order(conn, po_id).await?;
    let requests = linked_requests(conn, po_id).await?;
    Ok(derive_shipping_status(
        requests.iter().flat_map(|r| r.items.iter()),
    ))
}

fn ensure_supplier(request: &PurchaseRequestModel, supplier_id: SupplierId) -> Result<(), ServiceError> {
    if request.supplier_id != supplier_id.as_uuid() {
        warn!(purchase_request_id = %request.id, supplier_id = %supplier_id, "Supplier does not own request");
        return Err(ServiceError::ValidationError(format!(
            "Supplier {} does not fulfil purchase request {}",
            supplier_id, request.id
        )));
    }
    Ok(())
}

async fn single_view<C: ConnectionTrait>(
    conn: &C,
    request: PurchaseRequestModel,
) -> Result<PurchaseRequestView, ServiceError> {
    attach_items(conn, vec![request])
        .await?
        .pop()
        .ok_or_else(|| ServiceError::InternalError("request view missing".to_string()))
}
