//! Canonical identifier types.
//!
//! Every entity is addressed by exactly one opaque id type. Raw UUIDs are wrapped once at the
//! service boundary and unwrapped only when talking to the persistence layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

entity_id!(
    /// A single-supplier purchase request.
    PurchaseRequestId
);
entity_id!(
    /// Shared by every sibling request split from one checkout.
    ParentRequestId
);
entity_id!(PurchaseRequestItemId);
entity_id!(PurchaseOrderId);
entity_id!(GoodsReceiptId);
entity_id!(GoodsReceiptLineId);
entity_id!(InvoiceId);
entity_id!(ReturnRequestId);
entity_id!(InventoryRecordId);
entity_id!(CompanyId);
entity_id!(SiteId);
entity_id!(EmployeeId);
entity_id!(SupplierId);
entity_id!(ProductId);
