pub mod common;
pub mod health;
pub mod inventory;
pub mod purchase_orders;
pub mod purchase_requests;
pub mod receipts;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;
