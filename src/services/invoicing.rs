use crate::{
    db::DbPool,
    entities::{
        goods_receipt::DocumentStatus,
        goods_receipt_line,
        invoice::{self, Entity as InvoiceEntity},
        invoice_line::{self, Entity as InvoiceLineEntity},
        purchase_order::PurchaseOrderStatus,
    },
    errors::ServiceError,
    events::{publish_all, Event, EventSender},
    ids::{EmployeeId, GoodsReceiptId, InvoiceId, PurchaseOrderId},
    services::{
        purchase_orders::bump_status_in,
        receipts::{find_receipt, receipt_lines},
    },
};
use chrono::{NaiveDate, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IntoActiveModel, QueryFilter,
    Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InvoiceRequest {
    pub goods_receipt_id: GoodsReceiptId,
    #[validate(length(min = 1, max = 64, message = "Invoice number is required"))]
    pub invoice_number: String,
    pub invoice_date: NaiveDate,
    #[validate(length(min = 1, max = 128, message = "Supplier invoice reference is required"))]
    pub supplier_invoice_ref: String,
    #[serde(default)]
    pub additional_charges: Decimal,
    pub raised_by: EmployeeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceView {
    #[serde(flatten)]
    pub invoice: invoice::Model,
    pub lines: Vec<invoice_line::Model>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceLinePlan {
    pub goods_receipt_line_id: Uuid,
    pub product_id: Uuid,
    pub size: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceTotals {
    pub lines: Vec<InvoiceLinePlan>,
    pub subtotal: Decimal,
    pub total: Decimal,
}

/// Bills accepted quantities at the unit price captured when the request was made.
pub fn compute_invoice(
    receipt_lines: &[goods_receipt_line::Model],
    additional_charges: Decimal,
) -> Result<InvoiceTotals, ServiceError> {
    if additional_charges.is_sign_negative() && !additional_charges.is_zero() {
        return Err(ServiceError::ValidationError(
            "Additional charges cannot be negative".to_string(),
        ));
    }

    let lines: Vec<InvoiceLinePlan> = receipt_lines
        .iter()
        .filter(|line| line.accepted_quantity > 0)
        .map(|line| InvoiceLinePlan {
            goods_receipt_line_id: line.id,
            product_id: line.product_id,
            size: line.size.clone(),
            quantity: line.accepted_quantity,
            unit_price: line.unit_price,
            amount: line.unit_price * Decimal::from(line.accepted_quantity),
        })
        .collect();
    let subtotal: Decimal = lines.iter().map(|line| line.amount).sum();

    Ok(InvoiceTotals {
        lines,
        subtotal,
        total: subtotal + additional_charges,
    })
}

/// Raises invoices against approved goods receipts.
#[derive(Clone)]
pub struct InvoiceService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl InvoiceService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    #[instrument(skip(self, request), fields(goods_receipt_id = %request.goods_receipt_id, invoice_number = %request.invoice_number))]
    pub async fn create_invoice(&self, request: InvoiceRequest) -> Result<InvoiceView, ServiceError> {
        request.validate()?;
        let invoice_number = request.invoice_number.trim().to_string();
        let supplier_invoice_ref = request.supplier_invoice_ref.trim().to_string();
        if invoice_number.is_empty() {
            return Err(ServiceError::ValidationError(
                "Invoice number is required".to_string(),
            ));
        }
        if supplier_invoice_ref.is_empty() {
            return Err(ServiceError::ValidationError(
                "Supplier invoice reference is required".to_string(),
            ));
        }
        let grn_id = request.goods_receipt_id;

        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start invoice transaction");
            ServiceError::DatabaseError(e)
        })?;

        let receipt = find_receipt(&txn, grn_id).await?;
        if receipt.status != DocumentStatus::Approved {
            return Err(ServiceError::InvalidStatus(format!(
                "Goods receipt {} is {}; invoices need an approved receipt",
                grn_id, receipt.status
            )));
        }
        if invoice_for_receipt(&txn, grn_id).await?.is_some() {
            warn!(goods_receipt_id = %grn_id, "Invoice already exists");
            return Err(ServiceError::InvariantViolation(format!(
                "Goods receipt {} already has an invoice",
                grn_id
            )));
        }

        let lines = receipt_lines(&txn, grn_id).await?;
        let totals = compute_invoice(&lines, request.additional_charges)?;

        let now = Utc::now();
        let invoice_id = InvoiceId::new();
        let invoice = invoice::ActiveModel {
            id: Set(invoice_id.as_uuid()),
            goods_receipt_id: Set(grn_id.as_uuid()),
            purchase_order_id: Set(receipt.purchase_order_id),
            invoice_number: Set(invoice_number),
            invoice_date: Set(request.invoice_date),
            supplier_invoice_ref: Set(supplier_invoice_ref),
            subtotal: Set(totals.subtotal),
            additional_charges: Set(request.additional_charges),
            total: Set(totals.total),
            status: Set(DocumentStatus::Raised),
            raised_by: Set(request.raised_by.as_uuid()),
            approved_by: Set(None),
            approved_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(|e| duplicate_or_db(e, grn_id))?;

        let mut saved_lines = Vec::with_capacity(totals.lines.len());
        for line in totals.lines {
            let saved = invoice_line::ActiveModel {
                id: Set(Uuid::new_v4()),
                invoice_id: Set(invoice_id.as_uuid()),
                goods_receipt_line_id: Set(line.goods_receipt_line_id),
                product_id: Set(line.product_id),
                size: Set(line.size),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_price),
                amount: Set(line.amount),
            }
            .insert(&txn)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to insert invoice line");
                ServiceError::DatabaseError(e)
            })?;
            saved_lines.push(saved);
        }

        txn.commit().await.map_err(|e| duplicate_or_db(e, grn_id))?;

        counter!("procurement.invoices.raised", 1);
        info!(invoice_id = %invoice_id, total = %invoice.total, "Invoice raised");
        publish_all(
            self.event_sender.as_deref(),
            vec![Event::InvoiceRaised {
                invoice_id,
                goods_receipt_id: grn_id,
            }],
        )
        .await;

        Ok(InvoiceView {
            invoice,
            lines: saved_lines,
        })
    }

    /// Approves an invoice and closes its purchase order.
    #[instrument(skip(self), fields(invoice_id = %invoice_id, approver_id = %approver_id))]
    pub async fn approve_invoice(
        &self,
        invoice_id: InvoiceId,
        approver_id: EmployeeId,
    ) -> Result<InvoiceView, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;

        let current = find_invoice(&txn, invoice_id).await?;
        if current.status != DocumentStatus::Raised {
            return Err(ServiceError::InvalidStatus(format!(
                "Invoice {} is {} and cannot be approved",
                invoice_id, current.status
            )));
        }
        let po_id = PurchaseOrderId::from(current.purchase_order_id);

        let now = Utc::now();
        let mut changes = current.into_active_model();
        changes.status = Set(DocumentStatus::Approved);
        changes.approved_by = Set(Some(approver_id.as_uuid()));
        changes.approved_at = Set(Some(now));
        changes.updated_at = Set(now);
        let invoice = changes.update(&txn).await.map_err(|e| {
            error!(error = %e, "Failed to approve invoice");
            ServiceError::DatabaseError(e)
        })?;

        let mut events = vec![Event::InvoiceApproved(invoice_id)];
        if let Some(event) = bump_status_in(&txn, po_id, PurchaseOrderStatus::Completed).await? {
            events.push(event);
        }
        let lines = invoice_lines(&txn, invoice_id).await?;

        txn.commit().await.map_err(ServiceError::DatabaseError)?;

        info!("Invoice approved");
        publish_all(self.event_sender.as_deref(), events).await;
        Ok(InvoiceView { invoice, lines })
    }

    pub async fn get_invoice(&self, invoice_id: InvoiceId) -> Result<InvoiceView, ServiceError> {
        let db = &*self.db_pool;
        let invoice = find_invoice(db, invoice_id).await?;
        let lines = invoice_lines(db, invoice_id).await?;
        Ok(InvoiceView { invoice, lines })
    }
}

fn duplicate_or_db(err: sea_orm::DbErr, grn_id: GoodsReceiptId) -> ServiceError {
    if ServiceError::is_unique_violation(&err) {
        ServiceError::InvariantViolation(format!(
            "Goods receipt {} already has an invoice",
            grn_id
        ))
    } else {
        error!(error = %err, "Failed to write invoice");
        ServiceError::DatabaseError(err)
    }
}

async fn find_invoice<C: ConnectionTrait>(
    conn: &C,
    invoice_id: InvoiceId,
) -> Result<invoice::Model, ServiceError> {
    InvoiceEntity::find_by_id(invoice_id.as_uuid())
        .one(conn)
        .await
        .map_err(ServiceError::DatabaseError)?
        .ok_or_else(|| ServiceError::NotFound(format!("Invoice {} not found", invoice_id)))
}

async fn invoice_for_receipt<C: ConnectionTrait>(
    conn: &C,
    grn_id: GoodsReceiptId,
) -> Result<Option<invoice::Model>, ServiceError> {
    InvoiceEntity::find()
        .filter(invoice::Column::GoodsReceiptId.eq(grn_id.as_uuid()))
        .one(conn)
        .await
        .map_err(ServiceError::DatabaseError)
}

async fn invoice_lines<C: ConnectionTrait>(
    conn: &C,
    invoice_id: InvoiceId,
) -> Result<Vec<invoice_line::Model>, ServiceError> {
    InvoiceLineEntity::find()
        .filter(invoice_line::Column::InvoiceId.eq(invoice_id.as_uuid()))
        .all(conn)
        .await
        .map_err(ServiceError::DatabaseError)
}
