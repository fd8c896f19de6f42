use crate::ids::{
    GoodsReceiptId, InvoiceId, ParentRequestId, PurchaseOrderId, PurchaseRequestId,
    ReturnRequestId, SupplierId, ProductId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event and logs instead of failing when the channel is closed.
    ///
    /// Events are published after the owning transaction commits, so a lost event never
    /// invalidates the write that produced it.
    pub async fn publish(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "Failed to publish procurement event");
        }
    }
}

/// Publishes through an optional sender, the way services hold their event channel.
pub async fn publish_all(sender: Option<&EventSender>, events: Vec<Event>) {
    if let Some(sender) = sender {
        for event in events {
            sender.publish(event).await;
        }
    }
}

/// Domain events raised by the procurement workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    PurchaseRequestCreated {
        purchase_request_id: PurchaseRequestId,
        parent_request_id: Option<ParentRequestId>,
        supplier_id: SupplierId,
    },
    ApprovalAdvanced {
        purchase_request_id: PurchaseRequestId,
        from_stage: String,
        to_stage: String,
    },
    PurchaseRequestRejected {
        purchase_request_id: PurchaseRequestId,
        reason_code: String,
    },
    PurchaseOrderCreated {
        purchase_order_id: PurchaseOrderId,
        supplier_id: SupplierId,
        request_count: usize,
    },
    PurchaseOrderStatusChanged {
        purchase_order_id: PurchaseOrderId,
        old_status: String,
        new_status: String,
    },
    PurchaseRequestDispatched {
        purchase_request_id: PurchaseRequestId,
        units: i32,
    },
    PurchaseRequestDelivered {
        purchase_request_id: PurchaseRequestId,
        fully_delivered: bool,
    },
    InsufficientInventory {
        supplier_id: SupplierId,
        product_id: ProductId,
        size: String,
        requested: i32,
        available: i32,
    },
    LowStock {
        supplier_id: SupplierId,
        product_id: ProductId,
        size: String,
        remaining: i32,
        threshold: i32,
    },
    InventoryRestocked {
        supplier_id: SupplierId,
        product_id: ProductId,
        size: String,
        quantity: i32,
    },
    ReturnRequested {
        return_request_id: ReturnRequestId,
        replacement_request_id: PurchaseRequestId,
    },
    ReturnCompleted(ReturnRequestId),
    GoodsReceiptRaised {
        goods_receipt_id: GoodsReceiptId,
        purchase_order_id: PurchaseOrderId,
    },
    GoodsReceiptApproved(GoodsReceiptId),
    InvoiceRaised {
        invoice_id: InvoiceId,
        goods_receipt_id: GoodsReceiptId,
    },
    InvoiceApproved(InvoiceId),
}

// Consumes the event channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::InsufficientInventory {
                supplier_id,
                product_id,
                size,
                requested,
                available,
            } => {
                warn!(
                    supplier_id = %supplier_id,
                    product_id = %product_id,
                    size = %size,
                    requested = requested,
                    available = available,
                    "Dispatch exceeded recorded stock"
                );
            }
            Event::LowStock {
                supplier_id,
                product_id,
                size,
                remaining,
                threshold,
            } => {
                warn!(
                    supplier_id = %supplier_id,
                    product_id = %product_id,
                    size = %size,
                    remaining = remaining,
                    threshold = threshold,
                    "Stock at or below low-stock threshold"
                );
            }
            other => {
                info!(event = ?other, "Procurement event");
            }
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let sender = EventSender::new(tx);
        let first = GoodsReceiptId::new();
        let second = InvoiceId::new();

        publish_all(
            Some(&sender),
            vec![
                Event::GoodsReceiptApproved(first),
                Event::InvoiceApproved(second),
            ],
        )
        .await;

        assert_eq!(rx.recv().await, Some(Event::GoodsReceiptApproved(first)));
        assert_eq!(rx.recv().await, Some(Event::InvoiceApproved(second)));
    }

    #[tokio::test]
    async fn publish_on_closed_channel_does_not_fail() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);
        sender
            .publish(Event::ReturnCompleted(ReturnRequestId::new()))
            .await;
        assert!(sender.send(Event::ReturnCompleted(ReturnRequestId::new())).await.is_err());
    }
}
