use crate::{
    db::DbPool,
    entities::{
        purchase_request_item::{self, Entity as PurchaseRequestItemEntity},
        return_request::{self, Entity as ReturnRequestEntity, ReturnStatus},
    },
    errors::ServiceError,
    events::{publish_all, Event, EventSender},
    ids::{EmployeeId, PurchaseRequestId, PurchaseRequestItemId, ReturnRequestId},
    services::purchase_requests::{
        find_request, persist_split, CartLine, CheckoutRequest, PurchaseRequestService,
        PurchaseRequestView,
    },
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReplacementRequest {
    pub original_item_id: PurchaseRequestItemId,
    pub requester_id: EmployeeId,
    #[validate(length(min = 1, max = 32, message = "Replacement size is required"))]
    pub replacement_size: String,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
    #[validate(length(min = 1, max = 500, message = "A return reason is required"))]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplacementOutcome {
    pub return_request: return_request::Model,
    pub replacement: PurchaseRequestView,
}

/// Opens size/item exchanges: a return record plus a replacement purchase request.
#[derive(Clone)]
pub struct ReturnService {
    db_pool: Arc<DbPool>,
    requests: PurchaseRequestService,
    event_sender: Option<Arc<EventSender>>,
}

impl ReturnService {
    pub fn new(
        db_pool: Arc<DbPool>,
        requests: PurchaseRequestService,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db_pool,
            requests,
            event_sender,
        }
    }

    #[instrument(skip(self, request), fields(original_item_id = %request.original_item_id, quantity = request.quantity))]
    pub async fn request_replacement(
        &self,
        request: ReplacementRequest,
    ) -> Result<ReplacementOutcome, ServiceError> {
        request.validate()?;
        let replacement_size = request.replacement_size.trim().to_string();
        if replacement_size.is_empty() {
            return Err(ServiceError::ValidationError(
                "Replacement size is required".to_string(),
            ));
        }
        if request.reason.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "A return reason is required".to_string(),
            ));
        }
        let db = &*self.db_pool;

        let item = find_item(db, request.original_item_id).await?;
        let original = find_request(db, PurchaseRequestId::from(item.purchase_request_id)).await?;
        if original.requester_id != request.requester_id.as_uuid() {
            return Err(ServiceError::ValidationError(format!(
                "Line {} was not ordered by employee {}",
                item.id, request.requester_id
            )));
        }
        ensure_returnable(db, &item, request.quantity).await?;

        let return_id = ReturnRequestId::new();
        let checkout = CheckoutRequest {
            requester_id: request.requester_id,
            company_id: original.company_id.into(),
            lines: vec![CartLine {
                product_id: item.product_id.into(),
                size: replacement_size.clone(),
                quantity: request.quantity,
                unit_price: item.unit_price,
            }],
        };
        let mut plan = self.requests.prepare_split(&checkout).await?;
        plan.replacement_source_id = Some(return_id);

        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start replacement transaction");
            ServiceError::DatabaseError(e)
        })?;

        ensure_returnable(&txn, &item, request.quantity).await?;
        let outcome = persist_split(&txn, &plan).await?;
        let replacement = outcome.requests().first().map(|v| (*v).clone()).ok_or_else(|| {
            ServiceError::InternalError("replacement checkout produced no request".to_string())
        })?;

        let now = Utc::now();
        let record = return_request::ActiveModel {
            id: Set(return_id.as_uuid()),
            original_purchase_request_id: Set(original.id),
            original_item_id: Set(item.id),
            requester_id: Set(request.requester_id.as_uuid()),
            supplier_id: Set(original.supplier_id),
            product_id: Set(item.product_id),
            original_size: Set(item.size.clone()),
            replacement_size: Set(replacement_size),
            quantity: Set(request.quantity),
            reason: Set(request.reason.trim().to_string()),
            status: Set(ReturnStatus::Requested),
            replacement_purchase_request_id: Set(Some(replacement.request.id)),
            completed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            error!(error = %e, return_request_id = %return_id, "Failed to insert return request");
            ServiceError::DatabaseError(e)
        })?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit replacement");
            ServiceError::DatabaseError(e)
        })?;

        info!(return_request_id = %return_id, replacement_id = %replacement.id(), "Replacement requested");
        self.requests.after_split(&outcome).await;
        publish_all(
            self.event_sender.as_deref(),
            vec![Event::ReturnRequested {
                return_request_id: return_id,
                replacement_request_id: replacement.id(),
            }],
        )
        .await;

        Ok(ReplacementOutcome {
            return_request: record,
            replacement,
        })
    }

    #[instrument(skip(self))]
    pub async fn get_return(
        &self,
        return_id: ReturnRequestId,
    ) -> Result<return_request::Model, ServiceError> {
        let db = &*self.db_pool;
        ReturnRequestEntity::find_by_id(return_id.as_uuid())
            .one(db)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("Return {} not found", return_id)))
    }
}

async fn find_item<C: ConnectionTrait>(
    conn: &C,
    item_id: PurchaseRequestItemId,
) -> Result<purchase_request_item::Model, ServiceError> {
    PurchaseRequestItemEntity::find_by_id(item_id.as_uuid())
        .one(conn)
        .await
        .map_err(ServiceError::DatabaseError)?
        .ok_or_else(|| ServiceError::NotFound(format!("Purchase request line {} not found", item_id)))
}

/// Delivered units on the line not already covered by earlier returns.
async fn ensure_returnable<C: ConnectionTrait>(
    conn: &C,
    item: &purchase_request_item::Model,
    quantity: i32,
) -> Result<(), ServiceError> {
    let already_returned: i32 = ReturnRequestEntity::find()
        .filter(return_request::Column::OriginalItemId.eq(item.id))
        .all(conn)
        .await
        .map_err(ServiceError::DatabaseError)?
        .iter()
        .map(|r| r.quantity)
        .sum();

    let returnable = item.delivered_quantity - already_returned;
    if quantity > returnable {
        return Err(ServiceError::ValidationError(format!(
            "Only {} delivered units of line {} can be returned",
            returnable.max(0),
            item.id
        )));
    }
    Ok(())
}
