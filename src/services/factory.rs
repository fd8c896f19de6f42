use std::sync::Arc;

use crate::{
    db::DbPool,
    directory::Directory,
    events::EventSender,
    services::{
        approval::ApprovalService, fulfilment::FulfilmentService, inventory::InventoryService,
        invoicing::InvoiceService, purchase_orders::PurchaseOrderService,
        purchase_requests::PurchaseRequestService, receipts::GoodsReceiptService,
        returns::ReturnService,
    },
};

/// Factory for creating service instances with shared dependencies
pub struct ServiceFactory {
    db_pool: Arc<DbPool>,
    directory: Directory,
    event_sender: Option<Arc<EventSender>>,
}

impl ServiceFactory {
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

    /// Creates an inventory ledger with its own lock registry.
    ///
    /// Services that mutate stock must share one ledger, so [`ServiceContainer::new`] builds it once.
    pub fn inventory_service(&self) -> InventoryService {
        InventoryService::new(self.db_pool.clone(), self.event_sender.clone())
    }

    pub fn purchase_request_service(&self) -> PurchaseRequestService {
        PurchaseRequestService::new(
            self.db_pool.clone(),
            self.directory.clone(),
            self.event_sender.clone(),
        )
    }

    pub fn approval_service(&self) -> ApprovalService {
        ApprovalService::new(
            self.db_pool.clone(),
            self.directory.clone(),
            self.event_sender.clone(),
        )
    }

    pub fn purchase_order_service(&self) -> PurchaseOrderService {
        PurchaseOrderService::new(
            self.db_pool.clone(),
            self.directory.clone(),
            self.event_sender.clone(),
        )
    }

    pub fn fulfilment_service(&self, inventory: InventoryService) -> FulfilmentService {
        FulfilmentService::new(self.db_pool.clone(), inventory, self.event_sender.clone())
    }

    pub fn return_service(&self) -> ReturnService {
        ReturnService::new(
            self.db_pool.clone(),
            self.purchase_request_service(),
            self.event_sender.clone(),
        )
    }

    pub fn goods_receipt_service(&self) -> GoodsReceiptService {
        GoodsReceiptService::new(self.db_pool.clone(), self.event_sender.clone())
    }

    pub fn invoice_service(&self) -> InvoiceService {
        InvoiceService::new(self.db_pool.clone(), self.event_sender.clone())
    }

    /// Gets a reference to the database pool
    pub fn db_pool(&self) -> &Arc<DbPool> {
        &self.db_pool
    }
}

/// Service container holding all service instances
#[derive(Clone)]
pub struct ServiceContainer {
    pub purchase_requests: Arc<PurchaseRequestService>,
    pub approvals: Arc<ApprovalService>,
    pub purchase_orders: Arc<PurchaseOrderService>,
    pub inventory: Arc<InventoryService>,
    pub fulfilment: Arc<FulfilmentService>,
    pub returns: Arc<ReturnService>,
    pub goods_receipts: Arc<GoodsReceiptService>,
    pub invoices: Arc<InvoiceService>,
}

impl ServiceContainer {
    /// Creates a new service container with all services initialized
    pub fn new(factory: &ServiceFactory) -> Self {
        let inventory = factory.inventory_service();

        Self {
            purchase_requests: Arc::new(factory.purchase_request_service()),
            approvals: Arc::new(factory.approval_service()),
            purchase_orders: Arc::new(factory.purchase_order_service()),
            fulfilment: Arc::new(factory.fulfilment_service(inventory.clone())),
            inventory: Arc::new(inventory),
            returns: Arc::new(factory.return_service()),
            goods_receipts: Arc::new(factory.goods_receipt_service()),
            invoices: Arc::new(factory.invoice_service()),
        }
    }
}
