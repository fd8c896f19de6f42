//! Persistence models for the procurement workflow.

pub mod goods_receipt;
pub mod goods_receipt_line;
pub mod inventory_record;
pub mod invoice;
pub mod invoice_line;
pub mod purchase_order;
pub mod purchase_request;
pub mod purchase_request_item;
pub mod request_po_link;
pub mod return_request;
