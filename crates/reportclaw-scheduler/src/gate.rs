//! Authorization gate consulted on the submission path.
//!
//! The gate is a pure capability check; it never touches task state. The
//! default [`RoleGate`] derives capabilities from the actor's organization role
//! plus any explicit per-project grants.

use reportclaw_core::error::{ReportClawError, Result};
use reportclaw_core::types::{Action, Actor, OrgRole, Resource, Subject};

/// Capability check: may `actor` perform `action` on `resource`?
pub trait AuthorizationGate: Send + Sync {
    fn can_submit(&self, actor: &Actor, action: Action, resource: &Resource) -> bool;
}

/// Turn a negative gate answer into an [`ReportClawError::Authorization`].
pub fn authorize(
    gate: &dyn AuthorizationGate,
    actor: &Actor,
    action: Action,
    resource: &Resource,
) -> Result<()> {
    if gate.can_submit(actor, action, resource) {
        Ok(())
    } else {
        tracing::warn!(
            user = %actor.user_id,
            ?action,
            ?resource,
            "🚫 submission denied"
        );
        Err(ReportClawError::Authorization(format!(
            "user '{}' may not {} {}",
            actor.user_id,
            action_verb(action),
            describe(resource)
        )))
    }
}

/// Organization-role based gate.
///
/// - Actors never reach across organizations.
/// - Admins may do anything inside their organization.
/// - Owners may view and manage their own scheduled items.
/// - Editors manage scheduled deliveries and exports, viewers only view.
/// - Explicit grants extend the above, optionally scoped to one project.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoleGate;

impl RoleGate {
    fn role_allows(role: OrgRole, action: Action) -> bool {
        match role {
            OrgRole::Admin | OrgRole::Editor => true,
            OrgRole::Viewer => action == Action::View,
        }
    }
}

impl AuthorizationGate for RoleGate {
    fn can_submit(&self, actor: &Actor, action: Action, resource: &Resource) -> bool {
        let (organization_id, project_id, subject) = match resource {
            Resource::ScheduledItem {
                organization_id,
                project_id,
                ..
            } => (organization_id, project_id, Subject::ScheduledDelivery),
            Resource::ExportCsv {
                organization_id,
                project_id,
            } => (organization_id, project_id, Subject::ExportCsv),
        };

        if actor.organization_id != *organization_id {
            return false;
        }
        if actor.is_org_admin(organization_id) {
            return true;
        }
        if let Resource::ScheduledItem { owner, .. } = resource
            && *owner == actor.user_id
        {
            return true;
        }
        if Self::role_allows(actor.role, action) {
            return true;
        }

        actor.grants.iter().any(|g| {
            g.subject == subject
                // manage implies view
                && (g.action == action || g.action == Action::Manage)
                && g.project_id.as_ref().is_none_or(|p| p == project_id)
        })
    }
}

fn action_verb(action: Action) -> &'static str {
    match action {
        Action::View => "view",
        Action::Manage => "manage",
    }
}

fn describe(resource: &Resource) -> String {
    match resource {
        Resource::ScheduledItem { project_id, .. } => {
            format!("scheduled deliveries in project '{project_id}'")
        }
        Resource::ExportCsv { project_id, .. } => format!("exports in project '{project_id}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(owner: &str) -> Resource {
        Resource::ScheduledItem {
            organization_id: "org-1".into(),
            project_id: "proj-1".into(),
            owner: owner.into(),
        }
    }

    fn export(project: &str) -> Resource {
        Resource::ExportCsv {
            organization_id: "org-1".into(),
            project_id: project.into(),
        }
    }

    #[test]
    fn test_admin_and_owner() {
        let gate = RoleGate;
        let admin = Actor::new("a", "org-1", OrgRole::Admin);
        assert!(gate.can_submit(&admin, Action::Manage, &item("someone")));

        let owner = Actor::new("u1", "org-1", OrgRole::Viewer);
        assert!(gate.can_submit(&owner, Action::Manage, &item("u1")));
        assert!(!gate.can_submit(&owner, Action::Manage, &item("u2")));
        assert!(gate.can_submit(&owner, Action::View, &item("u2")));
    }

    #[test]
    fn test_cross_org_denied() {
        let gate = RoleGate;
        let admin = Actor::new("a", "org-2", OrgRole::Admin);
        assert!(!gate.can_submit(&admin, Action::View, &item("a")));
    }

    #[test]
    fn test_export_requires_manage_grant_for_viewer() {
        let gate = RoleGate;
        let viewer = Actor::new("v", "org-1", OrgRole::Viewer);
        assert!(!gate.can_submit(&viewer, Action::Manage, &export("proj-1")));

        let granted = viewer.with_grant(Action::Manage, Subject::ExportCsv, Some("proj-1"));
        assert!(gate.can_submit(&granted, Action::Manage, &export("proj-1")));
        assert!(!gate.can_submit(&granted, Action::Manage, &export("proj-2")));

        let org_wide = Actor::new("v", "org-1", OrgRole::Viewer).with_grant(
            Action::Manage,
            Subject::ExportCsv,
            None,
        );
        assert!(org_wide.grants[0].project_id.is_none());
        assert!(gate.can_submit(&org_wide, Action::Manage, &export("proj-2")));
    }

    #[test]
    fn test_authorize_maps_to_error() {
        let viewer = Actor::new("v", "org-1", OrgRole::Viewer);
        let err = authorize(&RoleGate, &viewer, Action::Manage, &export("proj-1")).unwrap_err();
        assert!(matches!(err, ReportClawError::Authorization(_)));
        assert!(authorize(&RoleGate, &viewer, Action::View, &item("x")).is_ok());
    }
}
