use crate::{
    db::DbPool,
    entities::{
        goods_receipt::{self, DocumentStatus, Entity as GoodsReceiptEntity},
        goods_receipt_line::{self, Entity as GoodsReceiptLineEntity},
    },
    errors::ServiceError,
    events::{publish_all, Event, EventSender},
    ids::{EmployeeId, GoodsReceiptId, PurchaseOrderId, PurchaseRequestItemId},
    services::{
        fulfilment::{derive_shipping_status, ShippingStatus},
        purchase_orders::{find_order, linked_requests},
        purchase_requests::PurchaseRequestView,
    },
};
use chrono::{NaiveDate, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Units of a delivered line the receiver refuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRejection {
    pub item_id: PurchaseRequestItemId,
    pub rejected_quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GoodsReceiptRequest {
    pub purchase_order_id: PurchaseOrderId,
    #[validate(length(min = 1, max = 64, message = "GRN number is required"))]
    pub grn_number: String,
    pub grn_date: NaiveDate,
    pub raised_by: EmployeeId,
    #[serde(default)]
    pub rejections: Vec<LineRejection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoodsReceiptView {
    #[serde(flatten)]
    pub receipt: goods_receipt::Model,
    pub lines: Vec<goods_receipt_line::Model>,
}

/// A receipt line before it is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptLinePlan {
    pub purchase_request_id: Uuid,
    pub purchase_request_item_id: Uuid,
    pub product_id: Uuid,
    pub size: String,
    pub delivered: i32,
    pub accepted: i32,
    pub rejected: i32,
    pub unit_price: Decimal,
}

/// Copies delivered quantities from every linked line and applies rejections.
pub fn plan_receipt_lines(
    requests: &[PurchaseRequestView],
    rejections: &[LineRejection],
) -> Result<Vec<ReceiptLinePlan>, ServiceError> {
    let mut rejected_by_item: HashMap<Uuid, i32> = HashMap::new();
    for rejection in rejections {
        if rejection.rejected_quantity < 0 {
            return Err(ServiceError::ValidationError(format!(
                "Rejected quantity for line {} cannot be negative",
                rejection.item_id
            )));
        }
        if rejected_by_item
            .insert(rejection.item_id.as_uuid(), rejection.rejected_quantity)
            .is_some()
        {
            return Err(ServiceError::ValidationError(format!(
                "Line {} is rejected more than once",
                rejection.item_id
            )));
        }
    }

    let mut lines = Vec::new();
    for view in requests {
        for item in &view.items {
            let rejected = rejected_by_item.remove(&item.id).unwrap_or(0);
            if rejected > item.delivered_quantity {
                return Err(ServiceError::ValidationError(format!(
                    "Cannot reject {} units of line {}; only {} delivered",
                    rejected, item.id, item.delivered_quantity
                )));
            }
            lines.push(ReceiptLinePlan {
                purchase_request_id: view.request.id,
                purchase_request_item_id: item.id,
                product_id: item.product_id,
                size: item.size.clone(),
                delivered: item.delivered_quantity,
                accepted: item.delivered_quantity - rejected,
                rejected,
                unit_price: item.unit_price,
            });
        }
    }

    if let Some(unknown) = rejected_by_item.keys().next() {
        return Err(ServiceError::ValidationError(format!(
            "Line {} is not part of this purchase order",
            unknown
        )));
    }
    Ok(lines)
}

/// Raises and approves goods receipt notes against fully delivered purchase orders.
#[derive(Clone)]
pub struct GoodsReceiptService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl GoodsReceiptService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    #[instrument(skip(self, request), fields(purchase_order_id = %request.purchase_order_id, grn_number = %request.grn_number))]
    pub async fn create_goods_receipt(
        &self,
        request: GoodsReceiptRequest,
    ) -> Result<GoodsReceiptView, ServiceError> {
        request.validate()?;
        let grn_number = request.grn_number.trim().to_string();
        if grn_number.is_empty() {
            return Err(ServiceError::ValidationError(
                "GRN number is required".to_string(),
            ));
        }
        let po_id = request.purchase_order_id;

        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start goods receipt transaction");
            ServiceError::DatabaseError(e)
        })?;

        find_order(&txn, po_id).await?;
        let requests = linked_requests(&txn, po_id).await?;
        let status = derive_shipping_status(requests.iter().flat_map(|r| r.items.iter()));
        if requests.is_empty() || status != ShippingStatus::FullyDelivered {
            return Err(ServiceError::InvalidStatus(format!(
                "Purchase order {} is {}; a goods receipt needs it fully delivered",
                po_id, status
            )));
        }

        if receipt_for_order(&txn, po_id).await?.is_some() {
            warn!(purchase_order_id = %po_id, "Goods receipt already exists");
            return Err(ServiceError::InvariantViolation(format!(
                "Purchase order {} already has a goods receipt",
                po_id
            )));
        }

        let planned = plan_receipt_lines(&requests, &request.rejections)?;

        let now = Utc::now();
        let grn_id = GoodsReceiptId::new();
        let receipt = goods_receipt::ActiveModel {
            id: Set(grn_id.as_uuid()),
            purchase_order_id: Set(po_id.as_uuid()),
            grn_number: Set(grn_number),
            grn_date: Set(request.grn_date),
            raised_by: Set(request.raised_by.as_uuid()),
            status: Set(DocumentStatus::Raised),
            approved_by: Set(None),
            approved_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            if ServiceError::is_unique_violation(&e) {
                ServiceError::InvariantViolation(format!(
                    "Purchase order {} already has a goods receipt",
                    po_id
                ))
            } else {
                error!(error = %e, "Failed to insert goods receipt");
                ServiceError::DatabaseError(e)
            }
        })?;

        let mut lines = Vec::with_capacity(planned.len());
        for line in planned {
            let saved = goods_receipt_line::ActiveModel {
                id: Set(Uuid::new_v4()),
                goods_receipt_id: Set(grn_id.as_uuid()),
                purchase_request_id: Set(line.purchase_request_id),
                purchase_request_item_id: Set(line.purchase_request_item_id),
                product_id: Set(line.product_id),
                size: Set(line.size),
                delivered_quantity: Set(line.delivered),
                accepted_quantity: Set(line.accepted),
                rejected_quantity: Set(line.rejected),
                unit_price: Set(line.unit_price),
            }
            .insert(&txn)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to insert goods receipt line");
                ServiceError::DatabaseError(e)
            })?;
            lines.push(saved);
        }

        txn.commit().await.map_err(|e| {
            // A concurrent duplicate can surface at commit on some backends.
            if ServiceError::is_unique_violation(&e) {
                ServiceError::InvariantViolation(format!(
                    "Purchase order {} already has a goods receipt",
                    po_id
                ))
            } else {
                error!(error = %e, "Failed to commit goods receipt");
                ServiceError::DatabaseError(e)
            }
        })?;

        counter!("procurement.goods_receipts.raised", 1);
        info!(goods_receipt_id = %grn_id, lines = lines.len(), "Goods receipt raised");
        publish_all(
            self.event_sender.as_deref(),
            vec![Event::GoodsReceiptRaised {
                goods_receipt_id: grn_id,
                purchase_order_id: po_id,
            }],
        )
        .await;

        Ok(GoodsReceiptView { receipt, lines })
    }

    #[instrument(skip(self), fields(goods_receipt_id = %grn_id, approver_id = %approver_id))]
    pub async fn approve_goods_receipt(
        &self,
        grn_id: GoodsReceiptId,
        approver_id: EmployeeId,
    ) -> Result<GoodsReceiptView, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;

        let receipt = find_receipt(&txn, grn_id).await?;
        if receipt.status != DocumentStatus::Raised {
            return Err(ServiceError::InvalidStatus(format!(
                "Goods receipt {} is {} and cannot be approved",
                grn_id, receipt.status
            )));
        }

        let now = Utc::now();
        let mut changes = receipt.into_active_model();
        changes.status = Set(DocumentStatus::Approved);
        changes.approved_by = Set(Some(approver_id.as_uuid()));
        changes.approved_at = Set(Some(now));
        changes.updated_at = Set(now);
        let receipt = changes.update(&txn).await.map_err(|e| {
            error!(error = %e, "Failed to approve goods receipt");
            ServiceError::DatabaseError(e)
        })?;
        let lines = receipt_lines(&txn, grn_id).await?;

        txn.commit().await.map_err(ServiceError::DatabaseError)?;

        info!("Goods receipt approved");
        publish_all(
            self.event_sender.as_deref(),
            vec![Event::GoodsReceiptApproved(grn_id)],
        )
        .await;
        Ok(GoodsReceiptView { receipt, lines })
    }

    pub async fn get_goods_receipt(
        &self,
        grn_id: GoodsReceiptId,
    ) -> Result<GoodsReceiptView, ServiceError> {
        let db = &*self.db_pool;
        let receipt = find_receipt(db, grn_id).await?;
        let lines = receipt_lines(db, grn_id).await?;
        Ok(GoodsReceiptView { receipt, lines })
    }
}

pub(crate) async fn find_receipt<C: ConnectionTrait>(
    conn: &C,
    grn_id: GoodsReceiptId,
) -> Result<goods_receipt::Model, ServiceError> {
    GoodsReceiptEntity::find_by_id(grn_id.as_uuid())
        .one(conn)
        .await
        .map_err(ServiceError::DatabaseError)?
        .ok_or_else(|| ServiceError::NotFound(format!("Goods receipt {} not found", grn_id)))
}

pub(crate) async fn receipt_lines<C: ConnectionTrait>(
    conn: &C,
    grn_id: GoodsReceiptId,
) -> Result<Vec<goods_receipt_line::Model>, ServiceError> {
    GoodsReceiptLineEntity::find()
        .filter(goods_receipt_line::Column::GoodsReceiptId.eq(grn_id.as_uuid()))
        .order_by_asc(goods_receipt_line::Column::PurchaseRequestId)
        .all(conn)
        .await
        .map_err(ServiceError::DatabaseError)
}

async fn receipt_for_order<C: ConnectionTrait>(
    conn: &C,
    po_id: PurchaseOrderId,
) -> Result<Option<goods_receipt::Model>, ServiceError> {
    GoodsReceiptEntity::find()
        .filter(goods_receipt::Column::PurchaseOrderId.eq(po_id.as_uuid()))
        .one(conn)
        .await
        .map_err(ServiceError::DatabaseError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{
        purchase_request::{self, ApprovalStage, RequestStatus, RequestType},
        purchase_request_item,
    };
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn view(delivered: &[i32]) -> PurchaseRequestView {
        let request_id = Uuid::new_v4();
        let now = Utc::now();
        PurchaseRequestView {
            request: purchase_request::Model {
                id: request_id,
                parent_request_id: None,
                requester_id: Uuid::new_v4(),
                company_id: Uuid::new_v4(),
                site_id: None,
                supplier_id: Uuid::new_v4(),
                request_type: RequestType::Standard,
                replacement_source_id: None,
                status: RequestStatus::Delivered,
                approval_stage: ApprovalStage::PoCreated,
                pr_reference_number: None,
                pr_reference_date: None,
                site_approved_by: None,
                site_approved_at: None,
                company_approved_by: None,
                company_approved_at: None,
                rejection_reason: None,
                rejection_notes: None,
                rejected_by: None,
                rejected_at: None,
                carrier: None,
                tracking_reference: None,
                dispatched_at: None,
                delivered_at: None,
                received_by: None,
                created_at: now,
                updated_at: now,
                version: 1,
            },
            items: delivered
                .iter()
                .enumerate()
                .map(|(i, qty)| purchase_request_item::Model {
                    id: Uuid::new_v4(),
                    purchase_request_id: request_id,
                    line_number: i as i32 + 1,
                    product_id: Uuid::new_v4(),
                    size: "L".to_string(),
                    ordered_quantity: *qty,
                    dispatched_quantity: *qty,
                    delivered_quantity: *qty,
                    unit_price: dec!(20.00),
                })
                .collect(),
        }
    }

    #[test]
    fn lines_copy_delivered_and_subtract_rejections() {
        let requests = vec![view(&[4, 2])];
        let first = PurchaseRequestItemId::from(requests[0].items[0].id);
        let lines = plan_receipt_lines(
            &requests,
            &[LineRejection {
                item_id: first,
                rejected_quantity: 1,
            }],
        )
        .unwrap();

        assert_eq!(lines.len(), 2);
        assert_eq!((lines[0].delivered, lines[0].accepted, lines[0].rejected), (4, 3, 1));
        assert_eq!((lines[1].delivered, lines[1].accepted, lines[1].rejected), (2, 2, 0));
    }

    #[test]
    fn rejections_cannot_exceed_delivery_or_name_foreign_lines() {
        let requests = vec![view(&[2])];
        let item = PurchaseRequestItemId::from(requests[0].items[0].id);
        assert_matches!(
            plan_receipt_lines(&requests, &[LineRejection { item_id: item, rejected_quantity: 3 }]),
            Err(ServiceError::ValidationError(_))
        );
        assert_matches!(
            plan_receipt_lines(
                &requests,
                &[LineRejection {
                    item_id: PurchaseRequestItemId::new(),
                    rejected_quantity: 1
                }]
            ),
            Err(ServiceError::ValidationError(_))
        );
    }
}
