use crate::{
    db::DbPool,
    directory::Directory,
    entities::purchase_request::{
        self, ApprovalStage, Entity as PurchaseRequestEntity, Model as PurchaseRequestModel,
        RequestStatus,
    },
    errors::ServiceError,
    events::{publish_all, Event, EventSender},
    ids::{CompanyId, EmployeeId, ParentRequestId, PurchaseRequestId, SiteId},
    services::purchase_requests::{attach_items, edit, save_request, PurchaseRequestView},
};
use chrono::{NaiveDate, Utc};
use sea_orm::{
    ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Per-company approval configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    pub multi_stage_approval_enabled: bool,
    pub site_approval_required: bool,
    pub company_approval_required: bool,
}

impl ApprovalPolicy {
    /// Requests go straight to fulfilment.
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn site_then_company() -> Self {
        Self {
            multi_stage_approval_enabled: true,
            site_approval_required: true,
            company_approval_required: true,
        }
    }

    pub fn site_only() -> Self {
        Self {
            multi_stage_approval_enabled: true,
            site_approval_required: true,
            company_approval_required: false,
        }
    }

    pub fn company_only() -> Self {
        Self {
            multi_stage_approval_enabled: true,
            site_approval_required: false,
            company_approval_required: true,
        }
    }
}

/// Stage and status a freshly created request starts in.
pub fn initial_state(policy: &ApprovalPolicy) -> (ApprovalStage, RequestStatus) {
    if !policy.multi_stage_approval_enabled {
        (ApprovalStage::NotRequired, RequestStatus::AwaitingFulfilment)
    } else if policy.site_approval_required {
        (ApprovalStage::PendingSiteApproval, RequestStatus::AwaitingApproval)
    } else {
        (
            ApprovalStage::PendingCompanyApproval,
            RequestStatus::AwaitingApproval,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum ApproverRole {
    SiteAdmin,
    CompanyAdmin,
}

/// The approval-relevant facts of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalSnapshot {
    pub stage: ApprovalStage,
    pub status: RequestStatus,
    pub site_approved: bool,
    pub company_approved: bool,
}

impl From<&PurchaseRequestModel> for ApprovalSnapshot {
    fn from(request: &PurchaseRequestModel) -> Self {
        Self {
            stage: request.approval_stage,
            status: request.status,
            site_approved: request.site_approved_by.is_some(),
            company_approved: request.company_approved_by.is_some(),
        }
    }
}

/// What an approval by `role` does to a request in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Advance {
        stage: ApprovalStage,
        status: RequestStatus,
    },
    /// The role already signed off; nothing to write.
    AlreadyApproved,
}

pub fn decide_approval(
    snapshot: ApprovalSnapshot,
    role: ApproverRole,
    policy: &ApprovalPolicy,
) -> Result<ApprovalDecision, ServiceError> {
    if snapshot.status == RequestStatus::Rejected {
        return Err(ServiceError::InvalidStatus(
            "Request has been rejected".to_string(),
        ));
    }
    if snapshot.stage == ApprovalStage::NotRequired {
        return Err(ServiceError::ValidationError(
            "Request does not require approval".to_string(),
        ));
    }

    match (role, snapshot.stage) {
        (ApproverRole::SiteAdmin, ApprovalStage::PendingSiteApproval) => {
            if policy.company_approval_required {
                Ok(ApprovalDecision::Advance {
                    stage: ApprovalStage::PendingCompanyApproval,
                    status: RequestStatus::AwaitingApproval,
                })
            } else {
                Ok(ApprovalDecision::Advance {
                    stage: ApprovalStage::SiteApproved,
                    status: RequestStatus::AwaitingFulfilment,
                })
            }
        }
        (ApproverRole::SiteAdmin, _) if snapshot.site_approved => {
            Ok(ApprovalDecision::AlreadyApproved)
        }
        (ApproverRole::CompanyAdmin, ApprovalStage::PendingCompanyApproval) => {
            Ok(ApprovalDecision::Advance {
                stage: ApprovalStage::CompanyApproved,
                status: RequestStatus::AwaitingFulfilment,
            })
        }
        (ApproverRole::CompanyAdmin, _) if snapshot.company_approved => {
            Ok(ApprovalDecision::AlreadyApproved)
        }
        (role, stage) => Err(ServiceError::UnauthorizedApprover(format!(
            "A {} cannot act on a request at stage {}",
            role, stage
        ))),
    }
}

/// Whether `role` may reject a request in this state. `Ok(false)` means it is already rejected.
pub fn can_reject(snapshot: ApprovalSnapshot, role: ApproverRole) -> Result<bool, ServiceError> {
    match (role, snapshot.stage, snapshot.status) {
        (_, _, RequestStatus::Rejected) => Ok(false),
        (ApproverRole::SiteAdmin, ApprovalStage::PendingSiteApproval, _)
        | (ApproverRole::CompanyAdmin, ApprovalStage::PendingCompanyApproval, _) => Ok(true),
        (_, stage, _) if stage.is_pending() => Err(ServiceError::UnauthorizedApprover(format!(
            "A {} cannot reject a request at stage {}",
            role, stage
        ))),
        (_, stage, _) => Err(ServiceError::InvalidStatus(format!(
            "Request at stage {} is no longer awaiting approval",
            stage
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PrReference {
    #[validate(length(min = 1, max = 64, message = "PR reference number is required"))]
    pub number: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalAction {
    pub role: ApproverRole,
    pub approver_id: EmployeeId,
    /// Mandatory for site approval.
    #[serde(default)]
    pub pr_reference: Option<PrReference>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RejectionAction {
    pub role: ApproverRole,
    pub approver_id: EmployeeId,
    #[validate(length(min = 1, max = 64, message = "Rejection reason code is required"))]
    pub reason_code: String,
    #[validate(length(max = 2000))]
    #[serde(default)]
    pub notes: Option<String>,
}

/// How a caller-supplied id mapped onto stored requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RequestGroupKey {
    Parent(ParentRequestId),
    Request(PurchaseRequestId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalOutcome {
    pub group: RequestGroupKey,
    /// False when the call repeated an approval or rejection already recorded.
    pub changed: bool,
    pub requests: Vec<PurchaseRequestView>,
}

/// Finds the requests an approval action targets.
///
/// A parent id selects every sibling. A request id that belongs to a multi-request group is refused,
/// since advancing it alone would split the group.
pub(crate) async fn resolve_group<C: ConnectionTrait>(
    conn: &C,
    raw_id: Uuid,
) -> Result<(RequestGroupKey, Vec<PurchaseRequestModel>), ServiceError> {
    let siblings = PurchaseRequestEntity::find()
        .filter(purchase_request::Column::ParentRequestId.eq(raw_id))
        .order_by_asc(purchase_request::Column::SupplierId)
        .all(conn)
        .await
        .map_err(ServiceError::DatabaseError)?;
    if !siblings.is_empty() {
        return Ok((
            RequestGroupKey::Parent(ParentRequestId::from(raw_id)),
            siblings,
        ));
    }

    let request = PurchaseRequestEntity::find_by_id(raw_id)
        .one(conn)
        .await
        .map_err(ServiceError::DatabaseError)?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("No purchase request or group with id {}", raw_id))
        })?;

    if let Some(parent_id) = request.parent_request_id {
        let sibling_count = PurchaseRequestEntity::find()
            .filter(purchase_request::Column::ParentRequestId.eq(parent_id))
            .all(conn)
            .await
            .map_err(ServiceError::DatabaseError)?
            .len();
        if sibling_count > 1 {
            return Err(ServiceError::ValidationError(format!(
                "Request {} is one of {} split requests; act on parent {} so all siblings move together",
                raw_id, sibling_count, parent_id
            )));
        }
    }

    Ok((
        RequestGroupKey::Request(PurchaseRequestId::from(raw_id)),
        vec![request],
    ))
}

/// Approves and rejects purchase requests, moving split siblings in lockstep.
#[derive(Clone)]
pub struct ApprovalService {
    db_pool: Arc<DbPool>,
    directory: Directory,
    event_sender: Option<Arc<EventSender>>,
}

impl ApprovalService {
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

    /// Advances a request, or every sibling under a parent id, by one approval step.
    #[instrument(skip(self, action), fields(group_id = %group_id, role = %action.role, approver_id = %action.approver_id))]
    pub async fn advance(
        &self,
        group_id: Uuid,
        action: ApprovalAction,
    ) -> Result<ApprovalOutcome, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start approval transaction");
            ServiceError::DatabaseError(e)
        })?;

        let (group, requests) = resolve_group(&txn, group_id).await?;
        let company_id = shared_company(&requests)?;
        let policy = self.directory.policies.approval_policy(company_id).await?;

        ensure_lockstep(&requests)?;

        // Every sibling must accept the same transition before anything is written.
        let mut decisions = Vec::with_capacity(requests.len());
        for request in &requests {
            decisions.push(decide_approval(
                ApprovalSnapshot::from(request),
                action.role,
                &policy,
            )?);
        }
        let first = decisions[0];
        if decisions.iter().any(|d| *d != first) {
            error!(group = ?group, "Sibling requests are at different approval stages");
            return Err(ServiceError::InvariantViolation(
                "Sibling requests are not at the same approval stage".to_string(),
            ));
        }

        let (next_stage, next_status) = match first {
            ApprovalDecision::AlreadyApproved => {
                info!(group = ?group, "Approval already recorded; nothing to do");
                let requests = attach_items(&txn, requests).await?;
                txn.rollback().await.map_err(ServiceError::DatabaseError)?;
                return Ok(ApprovalOutcome {
                    group,
                    changed: false,
                    requests,
                });
            }
            ApprovalDecision::Advance { stage, status } => (stage, status),
        };

        self.authorize_role(action.role, action.approver_id, &requests, company_id)
            .await?;

        let reference = match action.role {
            ApproverRole::SiteAdmin => Some(required_reference(action.pr_reference.as_ref())?),
            ApproverRole::CompanyAdmin => None,
        };

        let now = Utc::now();
        let mut updated = Vec::with_capacity(requests.len());
        let mut events = Vec::with_capacity(requests.len());
        for request in &requests {
            let mut changes = edit(request);
            changes.approval_stage = Set(next_stage);
            changes.status = Set(next_status);
            match action.role {
                ApproverRole::SiteAdmin => {
                    changes.site_approved_by = Set(Some(action.approver_id.as_uuid()));
                    changes.site_approved_at = Set(Some(now));
                    if let Some(reference) = &reference {
                        changes.pr_reference_number = Set(Some(reference.number.clone()));
                        changes.pr_reference_date = Set(Some(reference.date));
                    }
                }
                ApproverRole::CompanyAdmin => {
                    changes.company_approved_by = Set(Some(action.approver_id.as_uuid()));
                    changes.company_approved_at = Set(Some(now));
                }
            }
            let saved = save_request(&txn, request, changes).await?;
            events.push(Event::ApprovalAdvanced {
                purchase_request_id: PurchaseRequestId::from(saved.id),
                from_stage: request.approval_stage.to_string(),
                to_stage: next_stage.to_string(),
            });
            updated.push(saved);
        }

        let requests = attach_items(&txn, updated).await?;
        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit approval");
            ServiceError::DatabaseError(e)
        })?;

        info!(group = ?group, stage = %next_stage, count = requests.len(), "Approval advanced");
        publish_all(self.event_sender.as_deref(), events).await;

        Ok(ApprovalOutcome {
            group,
            changed: true,
            requests,
        })
    }

    /// Rejects a request, or every sibling under a parent id, at its current pending stage.
    #[instrument(skip(self, action), fields(group_id = %group_id, role = %action.role, reason = %action.reason_code))]
    pub async fn reject(
        &self,
        group_id: Uuid,
        action: RejectionAction,
    ) -> Result<ApprovalOutcome, ServiceError> {
        action.validate()?;

        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start rejection transaction");
            ServiceError::DatabaseError(e)
        })?;

        let (group, requests) = resolve_group(&txn, group_id).await?;
        let company_id = shared_company(&requests)?;
        ensure_lockstep(&requests)?;

        let mut pending = Vec::with_capacity(requests.len());
        for request in &requests {
            pending.push(can_reject(ApprovalSnapshot::from(request), action.role)?);
        }
        if pending.iter().all(|p| !p) {
            info!(group = ?group, "Rejection already recorded; nothing to do");
            let requests = attach_items(&txn, requests).await?;
            txn.rollback().await.map_err(ServiceError::DatabaseError)?;
            return Ok(ApprovalOutcome {
                group,
                changed: false,
                requests,
            });
        }
        if pending.iter().any(|p| !p) {
            return Err(ServiceError::InvariantViolation(
                "Sibling requests disagree on rejection state".to_string(),
            ));
        }

        self.authorize_role(action.role, action.approver_id, &requests, company_id)
            .await?;

        let now = Utc::now();
        let mut updated = Vec::with_capacity(requests.len());
        for request in &requests {
            let mut changes = edit(request);
            changes.status = Set(RequestStatus::Rejected);
            changes.rejection_reason = Set(Some(action.reason_code.clone()));
            changes.rejection_notes = Set(action.notes.clone());
            changes.rejected_by = Set(Some(action.approver_id.as_uuid()));
            changes.rejected_at = Set(Some(now));
            updated.push(save_request(&txn, request, changes).await?);
        }

        let events = updated
            .iter()
            .map(|r| Event::PurchaseRequestRejected {
                purchase_request_id: PurchaseRequestId::from(r.id),
                reason_code: action.reason_code.clone(),
            })
            .collect();

        let requests = attach_items(&txn, updated).await?;
        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit rejection");
            ServiceError::DatabaseError(e)
        })?;

        warn!(group = ?group, count = requests.len(), "Purchase requests rejected");
        publish_all(self.event_sender.as_deref(), events).await;

        Ok(ApprovalOutcome {
            group,
            changed: true,
            requests,
        })
    }

    async fn authorize_role(
        &self,
        role: ApproverRole,
        approver_id: EmployeeId,
        requests: &[PurchaseRequestModel],
        company_id: CompanyId,
    ) -> Result<(), ServiceError> {
        let approvers = &self.directory.approvers;
        let allowed = match role {
            ApproverRole::SiteAdmin => {
                let requester = EmployeeId::from(requests[0].requester_id);
                let site = match approvers.registered_site(requester).await? {
                    Some(site) => Some(site),
                    None => requests[0].site_id.map(SiteId::from),
                };
                match site {
                    Some(site) => approvers.administers_site(approver_id, site).await?,
                    None => false,
                }
            }
            ApproverRole::CompanyAdmin => {
                approvers.can_approve_orders(approver_id, company_id).await?
            }
        };

        if allowed {
            Ok(())
        } else {
            warn!(approver_id = %approver_id, role = %role, "Approver lacks authority");
            Err(ServiceError::UnauthorizedApprover(format!(
                "Employee {} is not authorized to act as {} for these requests",
                approver_id, role
            )))
        }
    }
}

/// Site approval must carry a PR reference number and date.
fn required_reference(reference: Option<&PrReference>) -> Result<PrReference, ServiceError> {
    let reference = reference.ok_or_else(|| {
        ServiceError::ValidationError(
            "PR reference number and date are required for site approval".to_string(),
        )
    })?;
    let number = reference.number.trim();
    if number.is_empty() {
        return Err(ServiceError::ValidationError(
            "PR reference number is required".to_string(),
        ));
    }
    let trimmed = PrReference {
        number: number.to_string(),
        date: reference.date,
    };
    trimmed.validate()?;
    Ok(trimmed)
}

fn ensure_lockstep(requests: &[PurchaseRequestModel]) -> Result<(), ServiceError> {
    let Some(first) = requests.first() else {
        return Ok(());
    };
    if requests
        .iter()
        .any(|r| r.approval_stage != first.approval_stage || r.status != first.status)
    {
        error!(parent_request_id = ?first.parent_request_id, "Sibling requests diverged");
        return Err(ServiceError::InvariantViolation(
            "Sibling requests are not at the same approval stage".to_string(),
        ));
    }
    Ok(())
}

fn shared_company(requests: &[PurchaseRequestModel]) -> Result<CompanyId, ServiceError> {
    let first = requests
        .first()
        .ok_or_else(|| ServiceError::NotFound("Request group is empty".to_string()))?;
    if requests.iter().any(|r| r.company_id != first.company_id) {
        return Err(ServiceError::InvariantViolation(
            "Sibling requests belong to different companies".to_string(),
        ));
    }
    Ok(CompanyId::from(first.company_id))
}
