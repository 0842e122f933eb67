//! Authorization Gate (spec §4.3 last paragraph, §6.4, component J): the
//! thin wrapper an external API calls. Resolving a `Caller` from raw
//! tokens/cookies is out of scope — this takes the already-authenticated
//! `Caller` and applies the Permission Evaluator plus the listing policy.

use super::{may, may_grant};
use crate::error::{CoreError, CoreResult};
use crate::model::{Action, Caller, ResourcePermission, Scope, User};
use crate::store::Store;
use uuid::Uuid;

fn caller_as_user(caller: &Caller) -> User {
    User {
        id: caller.id,
        email: caller.email.clone(),
        name: String::new(),
        is_active: caller.is_active,
        is_admin: caller.is_admin || caller.is_super_admin,
        created_at: chrono::Utc::now(),
        deleted_at: None,
    }
}

/// Calls the Permission Evaluator and turns `false` into `PermissionDenied`.
pub async fn authorize(
    store: &dyn Store,
    caller: &Caller,
    action: Action,
    scope: Scope,
    resource_id: Uuid,
) -> CoreResult<()> {
    let user = caller_as_user(caller);
    if may(store, &user, action, scope, resource_id).await? {
        Ok(())
    } else {
        Err(CoreError::PermissionDenied(format!(
            "{} may not {:?} {:?}:{}",
            caller.email, action, scope, resource_id
        )))
    }
}

/// spec §4.3: "when the caller cannot `mayGrant` on the target,
/// `listResourcePermissions` must be filtered to the caller's own rows."
pub async fn list_resource_permissions(
    store: &dyn Store,
    caller: &Caller,
    scope: Option<Scope>,
    resource_id: Option<Uuid>,
) -> CoreResult<Vec<ResourcePermission>> {
    let user = caller_as_user(caller);
    let can_manage = match (scope, resource_id) {
        (Some(scope), Some(resource_id)) => may_grant(store, &user, scope, resource_id).await?,
        _ => user.is_admin,
    };
    let user_filter = if can_manage { None } else { Some(user.id) };
    store.list_resource_permissions(user_filter, scope, resource_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::store::memory::MemoryStore;
    use chrono::Utc;

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

    #[tokio::test]
    async fn non_owner_listing_filtered_to_own_rows() {
        let store = MemoryStore::new();
        let owner_caller = Caller {
            id: Uuid::new_v4(),
            email: "owner@example.com".into(),
            is_active: true,
            is_admin: false,
            is_super_admin: false,
        };
        let other_caller = Caller {
            id: Uuid::new_v4(),
            email: "other@example.com".into(),
            is_active: true,
            is_admin: false,
            is_super_admin: false,
        };
        let p = project(owner_caller.id);
        store.insert_project(p.clone());

        store
            .create_resource_permission(ResourcePermission {
                id: Uuid::new_v4(),
                user_id: owner_caller.id,
                scope: Scope::Project,
                resource_id: p.id,
                actions: vec!["read".into()],
                granted_by: owner_caller.id,
                granted_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .create_resource_permission(ResourcePermission {
                id: Uuid::new_v4(),
                user_id: other_caller.id,
                scope: Scope::Project,
                resource_id: p.id,
                actions: vec!["read".into()],
                granted_by: owner_caller.id,
                granted_at: Utc::now(),
            })
            .await
            .unwrap();

        let seen = list_resource_permissions(&store, &other_caller, Some(Scope::Project), Some(p.id))
            .await
            .unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].user_id, other_caller.id);

        let seen_by_owner = list_resource_permissions(&store, &owner_caller, Some(Scope::Project), Some(p.id))
            .await
            .unwrap();
        assert_eq!(seen_by_owner.len(), 2);
    }

    #[tokio::test]
    async fn authorize_denies_stranger() {
        let store = MemoryStore::new();
        let owner_caller = Caller {
            id: Uuid::new_v4(),
            email: "owner@example.com".into(),
            is_active: true,
            is_admin: false,
            is_super_admin: false,
        };
        let stranger = Caller {
            id: Uuid::new_v4(),
            email: "stranger@example.com".into(),
            is_active: true,
            is_admin: false,
            is_super_admin: false,
        };
        let p = project(owner_caller.id);
        store.insert_project(p.clone());

        assert!(authorize(&store, &owner_caller, Action::Admin, Scope::Project, p.id)
            .await
            .is_ok());
        assert!(authorize(&store, &stranger, Action::Read, Scope::Project, p.id)
            .await
            .is_err());
    }
}
