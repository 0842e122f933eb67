//! Permission Evaluator (spec §4.3): `may(user, action, scope, resource_id)`
//! with ownership shortcuts and hierarchical inheritance. Always refetches
//! by id through `Store` — never holds resident object-graph references
//! (spec §9's design note on cyclic references).

pub mod gate;

use crate::error::CoreResult;
use crate::model::{Action, Project, Scope, User};
use crate::store::Store;
use uuid::Uuid;

/// Walks `scope`/`resource_id` up to the owning `Project`. Returns `None`
/// if the resource itself no longer exists (treated as no ownership match;
/// callers fall through to "false" rather than erroring, since an absent
/// resource grants nothing).
async fn owning_project(store: &dyn Store, scope: Scope, resource_id: Uuid) -> CoreResult<Option<Project>> {
    let project_id = match scope {
        Scope::Project => resource_id,
        Scope::Environment => match store.get_environment(resource_id).await? {
            Some(env) => env.project_id,
            None => return Ok(None),
        },
        Scope::Service => match store.get_service(resource_id).await? {
            Some(svc) => svc.project_id,
            None => return Ok(None),
        },
    };
    match store.resolve_project(project_id).await {
        Ok(project) => Ok(Some(project)),
        Err(_) => Ok(None),
    }
}

fn has_direct_grant(
    grants: &[crate::model::ResourcePermission],
    user_id: Uuid,
    scope: Scope,
    resource_id: Uuid,
    action: Action,
) -> bool {
    grants
        .iter()
        .any(|p| p.user_id == user_id && p.scope == scope && p.resource_id == resource_id && p.has_action(action))
}

/// spec §4.3's 5-step short-circuit algorithm.
pub async fn may(store: &dyn Store, user: &User, action: Action, scope: Scope, resource_id: Uuid) -> CoreResult<bool> {
    // Step 1: admin / super-admin.
    if user.is_admin {
        return Ok(true);
    }

    // Step 2: ownership shortcut.
    if let Some(project) = owning_project(store, scope, resource_id).await? {
        if project.owner_id == user.id {
            return Ok(true);
        }
    }

    let grants = store.list_resource_permissions(Some(user.id), None, None).await?;

    // Step 3: direct grant at the exact (scope, resource_id).
    if has_direct_grant(&grants, user.id, scope, resource_id, action) {
        return Ok(true);
    }

    // Step 4: hierarchical inheritance.
    match scope {
        Scope::Service => {
            if let Some(service) = store.get_service(resource_id).await? {
                for env_id in store.list_environment_ids_for_service(resource_id).await? {
                    if has_direct_grant(&grants, user.id, Scope::Environment, env_id, action) {
                        return Ok(true);
                    }
                }
                if has_direct_grant(&grants, user.id, Scope::Project, service.project_id, action) {
                    return Ok(true);
                }
            }
        }
        Scope::Environment => {
            if let Some(env) = store.get_environment(resource_id).await? {
                if has_direct_grant(&grants, user.id, Scope::Project, env.project_id, action) {
                    return Ok(true);
                }
            }
        }
        Scope::Project => {}
    }

    // Step 5.
    Ok(false)
}

/// spec §4.3: true iff admin/super-admin or the owning Project's owner.
/// Managing grants only — does not imply the `admin` action itself.
pub async fn may_grant(store: &dyn Store, user: &User, scope: Scope, resource_id: Uuid) -> CoreResult<bool> {
    if user.is_admin {
        return Ok(true);
    }
    Ok(owning_project(store, scope, resource_id)
        .await?
        .map(|p| p.owner_id == user.id)
        .unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::store::memory::MemoryStore;
    use chrono::Utc;

    fn user(is_admin: bool) -> User {
        User {
            id: Uuid::new_v4(),
            email: "u@example.com".into(),
            name: "U".into(),
            is_active: true,
            is_admin,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    fn project(owner_id: Uuid) -> Project {
        Project {
            id: Uuid::new_v4(),
            name: "proj".into(),
            description: None,
            owner_id,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    fn service(project_id: Uuid) -> Service {
        Service {
            id: Uuid::new_v4(),
            name: "svc".into(),
            description: None,
            service_type: ServiceType::Microservice,
            project_id,
            owner: None,
            status: ServiceStatus::Unknown,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn admin_may_everything() {
        let store = MemoryStore::new();
        let admin = user(true);
        let p = project(Uuid::new_v4());
        store.insert_project(p.clone());
        assert!(may(&store, &admin, Action::Admin, Scope::Project, p.id).await.unwrap());
    }

    #[tokio::test]
    async fn owner_may_everything() {
        let store = MemoryStore::new();
        let owner = user(false);
        let p = project(owner.id);
        store.insert_project(p.clone());
        assert!(may(&store, &owner, Action::Delete, Scope::Project, p.id).await.unwrap());
    }

    #[tokio::test]
    async fn permission_inheritance_project_to_service() {
        let store = MemoryStore::new();
        let owner = user(false);
        let grantee = user(false);
        let p = project(owner.id);
        store.insert_project(p.clone());
        let svc = service(p.id);
        store.insert_service(svc.clone());

        store
            .create_resource_permission(ResourcePermission {
                id: Uuid::new_v4(),
                user_id: grantee.id,
                scope: Scope::Project,
                resource_id: p.id,
                actions: vec!["read".into(), "write".into()],
                granted_by: owner.id,
                granted_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(may(&store, &grantee, Action::Write, Scope::Service, svc.id).await.unwrap());
        assert!(!may(&store, &grantee, Action::Delete, Scope::Service, svc.id).await.unwrap());
    }

    #[tokio::test]
    async fn stranger_has_no_access() {
        let store = MemoryStore::new();
        let owner = user(false);
        let stranger = user(false);
        let p = project(owner.id);
        store.insert_project(p.clone());
        assert!(!may(&store, &stranger, Action::Read, Scope::Project, p.id).await.unwrap());
    }

    #[tokio::test]
    async fn may_grant_requires_ownership_or_admin() {
        let store = MemoryStore::new();
        let owner = user(false);
        let stranger = user(false);
        let p = project(owner.id);
        store.insert_project(p.clone());
        assert!(may_grant(&store, &owner, Scope::Project, p.id).await.unwrap());
        assert!(!may_grant(&store, &stranger, Scope::Project, p.id).await.unwrap());
    }

    #[tokio::test]
    async fn granting_more_actions_never_reduces_may() {
        let store = MemoryStore::new();
        let owner = user(false);
        let grantee = user(false);
        let p = project(owner.id);
        store.insert_project(p.clone());

        let before = may(&store, &grantee, Action::Write, Scope::Project, p.id).await.unwrap();
        store
            .create_resource_permission(ResourcePermission {
                id: Uuid::new_v4(),
                user_id: grantee.id,
                scope: Scope::Project,
                resource_id: p.id,
                actions: vec!["write".into()],
                granted_by: owner.id,
                granted_at: Utc::now(),
            })
            .await
            .unwrap();
        let after = may(&store, &grantee, Action::Write, Scope::Project, p.id).await.unwrap();
        assert!(!before);
        assert!(after);
    }
}
