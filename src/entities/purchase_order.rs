use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum PurchaseOrderStatus {
    #[sea_orm(string_value = "Created")]
    Created,
    #[sea_orm(string_value = "SentToSupplier")]
    SentToSupplier,
    #[sea_orm(string_value = "Acknowledged")]
    Acknowledged,
    #[sea_orm(string_value = "InFulfilment")]
    InFulfilment,
    #[sea_orm(string_value = "Completed")]
    Completed,
}

impl PurchaseOrderStatus {
    /// Position along the forward-only lifecycle.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Created => 0,
            Self::SentToSupplier => 1,
            Self::Acknowledged => 2,
            Self::InFulfilment => 3,
            Self::Completed => 4,
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "purchase_orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub company_id: Uuid,
    pub supplier_id: Uuid,
    pub client_po_number: String,
    pub po_date: NaiveDate,
    pub created_by: Uuid,
    pub status: PurchaseOrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::request_po_link::Entity")]
    RequestLinks,
}

impl Related<super::request_po_link::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RequestLinks.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
