use crate::domain::request::{RequestContext, UserId};
use crate::domain::tier::{normalize_key, ApproverType, TierApprover};
use crate::eligibility::directory::DirectoryClient;
use crate::errors::ApprovalError;

/// Expands one configured approver into concrete users.
pub trait ApproverSource {
    fn resolve(
        &self,
        approver: &TierApprover,
        context: &RequestContext,
        directory: &dyn DirectoryClient,
    ) -> Result<Vec<UserId>, ApprovalError>;
}

pub struct RoleSource;
pub struct UserSource;
pub struct ManagerSource;
pub struct DepartmentHeadSource;
pub struct ExecutiveSource;
pub struct DynamicSource;

pub fn source_for(approver_type: ApproverType) -> &'static dyn ApproverSource {
    match approver_type {
        ApproverType::Role => &RoleSource,
        ApproverType::User => &UserSource,
        ApproverType::Manager => &ManagerSource,
        ApproverType::DepartmentHead => &DepartmentHeadSource,
        ApproverType::Executive => &ExecutiveSource,
        ApproverType::Dynamic => &DynamicSource,
    }
}

fn directory_error(message: String) -> ApprovalError {
    ApprovalError::Directory(message)
}

fn identifier(approver: &TierApprover) -> Option<&str> {
    approver.approver_id.as_deref().map(str::trim).filter(|id| !id.is_empty())
}

impl ApproverSource for RoleSource {
    fn resolve(
        &self,
        approver: &TierApprover,
        _context: &RequestContext,
        directory: &dyn DirectoryClient,
    ) -> Result<Vec<UserId>, ApprovalError> {
        match identifier(approver) {
            Some(role) => directory.users_with_role(role).map_err(directory_error),
            None => Ok(Vec::new()),
        }
    }
}

impl ApproverSource for UserSource {
    fn resolve(
        &self,
        approver: &TierApprover,
        _context: &RequestContext,
        _directory: &dyn DirectoryClient,
    ) -> Result<Vec<UserId>, ApprovalError> {
        Ok(identifier(approver).map(|id| vec![UserId::new(id)]).unwrap_or_default())
    }
}

impl ApproverSource for ManagerSource {
    fn resolve(
        &self,
        _approver: &TierApprover,
        context: &RequestContext,
        directory: &dyn DirectoryClient,
    ) -> Result<Vec<UserId>, ApprovalError> {
        let manager = directory.manager_of(&context.requester_id).map_err(directory_error)?;
        Ok(manager.into_iter().collect())
    }
}

impl ApproverSource for DepartmentHeadSource {
    /// Uses the request's department attribute, falling back to the requester's own.
    fn resolve(
        &self,
        _approver: &TierApprover,
        context: &RequestContext,
        directory: &dyn DirectoryClient,
    ) -> Result<Vec<UserId>, ApprovalError> {
        let department = match context.department() {
            Some(department) => Some(department.to_string()),
            None => directory.department_of(&context.requester_id).map_err(directory_error)?,
        };
        let Some(department) = department else {
            return Ok(Vec::new());
        };
        let head = directory.department_head(&department).map_err(directory_error)?;
        Ok(head.into_iter().collect())
    }
}

impl ApproverSource for ExecutiveSource {
    fn resolve(
        &self,
        _approver: &TierApprover,
        _context: &RequestContext,
        directory: &dyn DirectoryClient,
    ) -> Result<Vec<UserId>, ApprovalError> {
        directory.executives().map_err(directory_error)
    }
}

impl ApproverSource for DynamicSource {
    /// Approvers named by the request itself under the configured key.
    fn resolve(
        &self,
        approver: &TierApprover,
        context: &RequestContext,
        _directory: &dyn DirectoryClient,
    ) -> Result<Vec<UserId>, ApprovalError> {
        let Some(key) = identifier(approver).map(normalize_key) else {
            return Ok(Vec::new());
        };
        Ok(context
            .dynamic_approvers
            .iter()
            .find(|(candidate, _)| normalize_key(candidate) == key)
            .map(|(_, users)| users.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::source_for;
    use crate::domain::request::{RequestAttributes, RequestContext, UserId};
    use crate::domain::tier::{ApproverType, TierApprover, TriggerType, WorkflowCategory};
    use crate::eligibility::directory::{DirectoryUser, InMemoryDirectory};

    fn directory() -> InMemoryDirectory {
        InMemoryDirectory::default()
            .with_user(DirectoryUser {
                id: UserId::new("dana"),
                roles: vec!["buyer".to_string()],
                manager_id: Some(UserId::new("mo")),
                department: Some("facilities".to_string()),
                is_executive: false,
            })
            .with_user(DirectoryUser {
                id: UserId::new("eve"),
                roles: vec!["finance".to_string()],
                manager_id: None,
                department: None,
                is_executive: true,
            })
            .with_department("facilities", UserId::new("hank"))
            .with_department("it", UserId::new("ivan"))
    }

    fn approver(approver_type: ApproverType, approver_id: Option<&str>) -> TierApprover {
        TierApprover {
            approver_type,
            approver_id: approver_id.map(str::to_string),
            order: 0,
            is_required: true,
        }
    }

    fn context() -> RequestContext {
        RequestContext::new(
            UserId::new("dana"),
            WorkflowCategory::Purchase,
            RequestAttributes::new().with_number(TriggerType::Amount, Decimal::new(500, 0)),
        )
    }

    fn resolve(approver: &TierApprover, context: &RequestContext) -> Vec<String> {
        source_for(approver.approver_type)
            .resolve(approver, context, &directory())
            .expect("resolves")
            .into_iter()
            .map(|user| user.0)
            .collect()
    }

    #[test]
    fn each_approver_type_resolves_through_its_source() {
        let context = context();

        assert_eq!(resolve(&approver(ApproverType::Role, Some("Finance")), &context), vec!["eve"]);
        assert_eq!(resolve(&approver(ApproverType::User, Some("zed")), &context), vec!["zed"]);
        assert_eq!(resolve(&approver(ApproverType::Manager, None), &context), vec!["mo"]);
        assert_eq!(resolve(&approver(ApproverType::DepartmentHead, None), &context), vec!["hank"]);
        assert_eq!(resolve(&approver(ApproverType::Executive, None), &context), vec!["eve"]);
    }

    #[test]
    fn department_attribute_overrides_requester_department() {
        let mut context = context();
        context.attributes = context.attributes.clone().with_text(TriggerType::Department, "IT");

        assert_eq!(resolve(&approver(ApproverType::DepartmentHead, None), &context), vec!["ivan"]);
    }

    #[test]
    fn dynamic_approvers_come_from_the_request() {
        let mut context = context();
        context
            .dynamic_approvers
            .insert("Project_Lead".to_string(), vec![UserId::new("pat"), UserId::new("quinn")]);

        assert_eq!(
            resolve(&approver(ApproverType::Dynamic, Some("project_lead")), &context),
            vec!["pat", "quinn"]
        );
        assert!(resolve(&approver(ApproverType::Dynamic, Some("other")), &context).is_empty());
    }
}
