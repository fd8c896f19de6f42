use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Overall lifecycle of a purchase request.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum RequestStatus {
    #[sea_orm(string_value = "AwaitingApproval")]
    AwaitingApproval,
    #[sea_orm(string_value = "AwaitingFulfilment")]
    AwaitingFulfilment,
    #[sea_orm(string_value = "Dispatched")]
    Dispatched,
    #[sea_orm(string_value = "Delivered")]
    Delivered,
    #[sea_orm(string_value = "Rejected")]
    Rejected,
}

/// Position of a request in the approval chain.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum ApprovalStage {
    /// Company runs without multi-stage approval.
    #[sea_orm(string_value = "NotRequired")]
    NotRequired,
    #[sea_orm(string_value = "PendingSiteApproval")]
    PendingSiteApproval,
    #[sea_orm(string_value = "SiteApproved")]
    SiteApproved,
    #[sea_orm(string_value = "PendingCompanyApproval")]
    PendingCompanyApproval,
    #[sea_orm(string_value = "CompanyApproved")]
    CompanyApproved,
    #[sea_orm(string_value = "PoCreated")]
    PoCreated,
}

impl ApprovalStage {
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ApprovalStage::PendingSiteApproval | ApprovalStage::PendingCompanyApproval
        )
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum RequestType {
    #[sea_orm(string_value = "Standard")]
    Standard,
    #[sea_orm(string_value = "Replacement")]
    Replacement,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "purchase_requests")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub parent_request_id: Option<Uuid>,
    pub requester_id: Uuid,
    pub company_id: Uuid,
    pub site_id: Option<Uuid>,
    pub supplier_id: Uuid,
    pub request_type: RequestType,
    pub replacement_source_id: Option<Uuid>,
    pub status: RequestStatus,
    pub approval_stage: ApprovalStage,
    pub pr_reference_number: Option<String>,
    pub pr_reference_date: Option<NaiveDate>,
    pub site_approved_by: Option<Uuid>,
    pub site_approved_at: Option<DateTime<Utc>>,
    pub company_approved_by: Option<Uuid>,
    pub company_approved_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub rejection_notes: Option<String>,
    pub rejected_by: Option<Uuid>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub carrier: Option<String>,
    pub tracking_reference: Option<String>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub received_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::purchase_request_item::Entity")]
    Items,
}

impl Related<super::purchase_request_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Items.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
