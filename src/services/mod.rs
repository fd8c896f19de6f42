// Procurement workflow
pub mod approval;
pub mod purchase_orders;
pub mod purchase_requests;

// Fulfilment and stock
pub mod fulfilment;
pub mod inventory;
pub mod returns;

// Receipt and billing
pub mod invoicing;
pub mod receipts;

// Service factory for dependency injection
pub mod factory;

pub use factory::{ServiceContainer, ServiceFactory};
