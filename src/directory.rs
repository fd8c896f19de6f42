//! Collaborators the workflow consults but does not own.
//!
//! Supplier assignment, eligibility quotas, approver scopes and company approval policy all live
//! in master-data systems outside this crate. The engine reaches them through the async traits
//! below; [`InMemoryDirectory`] implements every trait and is what the server binary seeds from a
//! JSON file and what the tests drive.

use crate::errors::ServiceError;
use crate::ids::{CompanyId, EmployeeId, ProductId, SiteId, SupplierId};
use crate::services::approval::ApprovalPolicy;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of looking up who supplies a product to a company.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupplierResolution {
    Found(SupplierId),
    NotFound,
    MultipleFound(Vec<SupplierId>),
}

#[async_trait]
pub trait SupplierResolver: Send + Sync {
    async fn resolve_supplier(
        &self,
        product_id: ProductId,
        company_id: CompanyId,
    ) -> Result<SupplierResolution, ServiceError>;
}

#[async_trait]
pub trait EligibilityGate: Send + Sync {
    /// Whether the employee may order `quantity` units of the product in this size.
    async fn is_eligible(
        &self,
        requester_id: EmployeeId,
        company_id: CompanyId,
        product_id: ProductId,
        size: &str,
        quantity: i32,
    ) -> Result<bool, ServiceError>;
}

#[async_trait]
pub trait ApproverAuthority: Send + Sync {
    /// Site the employee is registered at, if any.
    async fn registered_site(&self, employee_id: EmployeeId)
        -> Result<Option<SiteId>, ServiceError>;

    async fn administers_site(
        &self,
        approver_id: EmployeeId,
        site_id: SiteId,
    ) -> Result<bool, ServiceError>;

    /// Whether the approver holds the order-approval privilege for the company.
    async fn can_approve_orders(
        &self,
        approver_id: EmployeeId,
        company_id: CompanyId,
    ) -> Result<bool, ServiceError>;
}

#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn approval_policy(&self, company_id: CompanyId) -> Result<ApprovalPolicy, ServiceError>;
}

/// Bundle of collaborator handles shared by the workflow services.
#[derive(Clone)]
pub struct Directory {
    pub suppliers: Arc<dyn SupplierResolver>,
    pub eligibility: Arc<dyn EligibilityGate>,
    pub approvers: Arc<dyn ApproverAuthority>,
    pub policies: Arc<dyn PolicySource>,
}

impl Directory {
    pub fn new(
        suppliers: Arc<dyn SupplierResolver>,
        eligibility: Arc<dyn EligibilityGate>,
        approvers: Arc<dyn ApproverAuthority>,
        policies: Arc<dyn PolicySource>,
    ) -> Self {
        Self {
            suppliers,
            eligibility,
            approvers,
            policies,
        }
    }

    /// Uses one in-memory directory for every collaborator.
    pub fn in_memory(directory: Arc<InMemoryDirectory>) -> Self {
        Self {
            suppliers: directory.clone(),
            eligibility: directory.clone(),
            approvers: directory.clone(),
            policies: directory,
        }
    }
}

/// Serialized form of the in-memory directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySeed {
    pub supplier_assignments: Vec<SupplierAssignment>,
    pub policies: Vec<CompanyPolicy>,
    pub employees: Vec<EmployeeSite>,
    pub site_admins: Vec<SiteAdmin>,
    pub company_approvers: Vec<CompanyApprover>,
    pub allowances: Vec<Allowance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplierAssignment {
    pub company_id: CompanyId,
    pub product_id: ProductId,
    pub supplier_id: SupplierId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyPolicy {
    pub company_id: CompanyId,
    #[serde(flatten)]
    pub policy: ApprovalPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmployeeSite {
    pub employee_id: EmployeeId,
    pub site_id: SiteId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteAdmin {
    pub approver_id: EmployeeId,
    pub site_id: SiteId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyApprover {
    pub approver_id: EmployeeId,
    pub company_id: CompanyId,
}

/// Caps the quantity an employee may order of one product per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allowance {
    pub employee_id: EmployeeId,
    pub product_id: ProductId,
    pub max_quantity: i32,
}

/// Reads a directory seed from a JSON file.
pub fn load_seed(path: impl AsRef<Path>) -> Result<DirectorySeed, ServiceError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ServiceError::InternalError(format!(
            "Failed to read directory seed {}: {}",
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        ServiceError::ValidationError(format!(
            "Invalid directory seed {}: {}",
            path.display(),
            e
        ))
    })
}

#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    suppliers: DashMap<(CompanyId, ProductId), Vec<SupplierId>>,
    policies: DashMap<CompanyId, ApprovalPolicy>,
    employee_sites: DashMap<EmployeeId, SiteId>,
    site_admins: DashMap<EmployeeId, HashSet<SiteId>>,
    company_approvers: DashMap<EmployeeId, HashSet<CompanyId>>,
    allowances: DashMap<(EmployeeId, ProductId), i32>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: DirectorySeed) -> Self {
        let directory = Self::new();
        for a in &seed.supplier_assignments {
            directory.assign_supplier(a.company_id, a.product_id, a.supplier_id);
        }
        for p in seed.policies {
            directory.set_policy(p.company_id, p.policy);
        }
        for e in &seed.employees {
            directory.register_employee(e.employee_id, e.site_id);
        }
        for s in &seed.site_admins {
            directory.grant_site_admin(s.approver_id, s.site_id);
        }
        for c in &seed.company_approvers {
            directory.grant_company_approver(c.approver_id, c.company_id);
        }
        for a in &seed.allowances {
            directory.set_allowance(a.employee_id, a.product_id, a.max_quantity);
        }
        info!(
            assignments = seed.supplier_assignments.len(),
            employees = seed.employees.len(),
            "Directory seeded"
        );
        directory
    }

    /// Adds a supplier for the product. Assigning a second supplier makes resolution ambiguous.
    pub fn assign_supplier(&self, company_id: CompanyId, product_id: ProductId, supplier_id: SupplierId) {
        let mut entry = self.suppliers.entry((company_id, product_id)).or_default();
        if !entry.contains(&supplier_id) {
            entry.push(supplier_id);
        }
    }

    pub fn set_policy(&self, company_id: CompanyId, policy: ApprovalPolicy) {
        self.policies.insert(company_id, policy);
    }

    pub fn register_employee(&self, employee_id: EmployeeId, site_id: SiteId) {
        self.employee_sites.insert(employee_id, site_id);
    }

    pub fn grant_site_admin(&self, approver_id: EmployeeId, site_id: SiteId) {
        self.site_admins.entry(approver_id).or_default().insert(site_id);
    }

    pub fn grant_company_approver(&self, approver_id: EmployeeId, company_id: CompanyId) {
        self.company_approvers
            .entry(approver_id)
            .or_default()
            .insert(company_id);
    }

    pub fn set_allowance(&self, employee_id: EmployeeId, product_id: ProductId, max_quantity: i32) {
        self.allowances.insert((employee_id, product_id), max_quantity);
    }
}

#[async_trait]
impl SupplierResolver for InMemoryDirectory {
    async fn resolve_supplier(
        &self,
        product_id: ProductId,
        company_id: CompanyId,
    ) -> Result<SupplierResolution, ServiceError> {
        let resolution = match self.suppliers.get(&(company_id, product_id)) {
            None => SupplierResolution::NotFound,
            Some(found) => match found.as_slice() {
                [] => SupplierResolution::NotFound,
                [single] => SupplierResolution::Found(*single),
                many => SupplierResolution::MultipleFound(many.to_vec()),
            },
        };
        debug!(product_id = %product_id, company_id = %company_id, ?resolution, "Supplier resolved");
        Ok(resolution)
    }
}

#[async_trait]
impl EligibilityGate for InMemoryDirectory {
    async fn is_eligible(
        &self,
        requester_id: EmployeeId,
        _company_id: CompanyId,
        product_id: ProductId,
        _size: &str,
        quantity: i32,
    ) -> Result<bool, ServiceError> {
        // Products without a configured allowance are unrestricted.
        Ok(self
            .allowances
            .get(&(requester_id, product_id))
            .map(|max| quantity <= *max)
            .unwrap_or(true))
    }
}

#[async_trait]
impl ApproverAuthority for InMemoryDirectory {
    async fn registered_site(
        &self,
        employee_id: EmployeeId,
    ) -> Result<Option<SiteId>, ServiceError> {
        Ok(self.employee_sites.get(&employee_id).map(|site| *site))
    }

    async fn administers_site(
        &self,
        approver_id: EmployeeId,
        site_id: SiteId,
    ) -> Result<bool, ServiceError> {
        Ok(self
            .site_admins
            .get(&approver_id)
            .map(|sites| sites.contains(&site_id))
            .unwrap_or(false))
    }

    async fn can_approve_orders(
        &self,
        approver_id: EmployeeId,
        company_id: CompanyId,
    ) -> Result<bool, ServiceError> {
        Ok(self
            .company_approvers
            .get(&approver_id)
            .map(|companies| companies.contains(&company_id))
            .unwrap_or(false))
    }
}

#[async_trait]
impl PolicySource for InMemoryDirectory {
    async fn approval_policy(&self, company_id: CompanyId) -> Result<ApprovalPolicy, ServiceError> {
        self.policies
            .get(&company_id)
            .map(|policy| *policy)
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "No approval policy configured for company {}",
                    company_id
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_supplier_makes_resolution_ambiguous() {
        let directory = InMemoryDirectory::new();
        let company = CompanyId::new();
        let product = ProductId::new();
        let first = SupplierId::new();

        assert_eq!(
            directory.resolve_supplier(product, company).await.unwrap(),
            SupplierResolution::NotFound
        );

        directory.assign_supplier(company, product, first);
        directory.assign_supplier(company, product, first);
        assert_eq!(
            directory.resolve_supplier(product, company).await.unwrap(),
            SupplierResolution::Found(first)
        );

        directory.assign_supplier(company, product, SupplierId::new());
        assert!(matches!(
            directory.resolve_supplier(product, company).await.unwrap(),
            SupplierResolution::MultipleFound(ref s) if s.len() == 2
        ));
    }

    #[tokio::test]
    async fn allowance_caps_line_quantity() {
        let directory = InMemoryDirectory::new();
        let employee = EmployeeId::new();
        let product = ProductId::new();
        let company = CompanyId::new();
        directory.set_allowance(employee, product, 2);

        assert!(directory
            .is_eligible(employee, company, product, "M", 2)
            .await
            .unwrap());
        assert!(!directory
            .is_eligible(employee, company, product, "M", 3)
            .await
            .unwrap());
        assert!(directory
            .is_eligible(employee, company, ProductId::new(), "M", 50)
            .await
            .unwrap());
    }

    #[test]
    fn seed_parses_from_json() {
        let company = CompanyId::new();
        let json = serde_json::json!({
            "policies": [{
                "company_id": company,
                "multi_stage_approval_enabled": true,
                "site_approval_required": true,
                "company_approval_required": false
            }]
        });
        let seed: DirectorySeed = serde_json::from_value(json).unwrap();
        assert_eq!(seed.policies.len(), 1);
        assert!(seed.policies[0].policy.site_approval_required);
        assert!(seed.supplier_assignments.is_empty());
    }
}
