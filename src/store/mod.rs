//! Store (spec §4.1): the single persistent-repository contract every other
//! component reads and writes through. Two implementations: `postgres` for
//! production, `memory` as a test fake (grounded on the teacher's own
//! `create_mock_controller` pattern for unit-testing without live infra).

pub mod memory;
pub mod postgres;

use crate::error::CoreResult;
use crate::model::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// All durable reads/writes for the core. Trait-object-safe so components
/// depend on `Arc<dyn Store>` rather than a concrete backend (mirrors the
/// teacher's `EncryptionProvider`/`DeploymentBackend` trait-object style).
#[async_trait]
pub trait Store: Send + Sync {
    // -- Projects / Environments / Services -------------------------------

    async fn resolve_project(&self, id: Uuid) -> CoreResult<Project>;
    async fn get_environment(&self, id: Uuid) -> CoreResult<Option<Environment>>;
    async fn list_environments_by_project(&self, project_id: Uuid) -> CoreResult<Vec<Environment>>;
    async fn get_service(&self, id: Uuid) -> CoreResult<Option<Service>>;

    /// Environments a Service is attached to via `service_environments`, used
    /// by the Permission Evaluator's hierarchical-inheritance step (spec
    /// §4.3 step 4) to find the environment grant(s) to check.
    async fn list_environment_ids_for_service(&self, service_id: Uuid) -> CoreResult<Vec<Uuid>>;

    // -- Configs (versioned-config keys + everything else) -----------------

    async fn get_config(
        &self,
        parent_scope: ConfigParentScope,
        parent_id: Uuid,
        key: &str,
    ) -> CoreResult<Option<ConfigEntry>>;

    async fn list_configs(
        &self,
        parent_scope: ConfigParentScope,
        parent_id: Uuid,
    ) -> CoreResult<Vec<ConfigEntry>>;

    /// Insert-or-update by `(parent_scope, parent_id, key)` among
    /// non-deleted rows (spec §4.9's `save_domain_info`).
    async fn upsert_config(
        &self,
        parent_scope: ConfigParentScope,
        parent_id: Uuid,
        key: &str,
        value: Option<String>,
        config_data: Option<serde_json::Value>,
    ) -> CoreResult<ConfigEntry>;

    async fn set_config_workflow_uuid(&self, config_id: Uuid, workflow_uuid: Uuid) -> CoreResult<()>;

    // -- Variables / Secrets -------------------------------------------------

    async fn list_variables(&self, scope: VariableScope, resource_id: Uuid) -> CoreResult<Vec<VariableEntry>>;

    // -- Clusters -------------------------------------------------------------

    async fn get_cluster(&self, id: Uuid) -> CoreResult<Option<KubernetesCluster>>;
    async fn create_cluster(&self, cluster: KubernetesCluster) -> CoreResult<KubernetesCluster>;
    async fn pick_cluster_for_environment_type(
        &self,
        env_type: EnvironmentType,
    ) -> CoreResult<Option<KubernetesCluster>>;

    // -- Permissions ------------------------------------------------------

    async fn list_resource_permissions(
        &self,
        user_id: Option<Uuid>,
        scope: Option<Scope>,
        resource_id: Option<Uuid>,
    ) -> CoreResult<Vec<ResourcePermission>>;

    async fn create_resource_permission(
        &self,
        permission: ResourcePermission,
    ) -> CoreResult<ResourcePermission>;

    // -- Versions / Deployments ---------------------------------------------

    async fn latest_service_version(&self, service_id: Uuid) -> CoreResult<Option<ServiceVersion>>;

    async fn find_service_versions_by_hash(
        &self,
        service_id: Uuid,
        config_hash: &str,
    ) -> CoreResult<Vec<ServiceVersion>>;

    /// Fails with `CoreError::AlreadyExists` on duplicate `(service_id,
    /// version_label)` (spec §4.1).
    async fn create_service_version(
        &self,
        service_id: Uuid,
        version_label: &str,
        config_hash: &str,
        spec_json: serde_json::Value,
    ) -> CoreResult<ServiceVersion>;

    async fn get_service_version(&self, id: Uuid) -> CoreResult<Option<ServiceVersion>>;

    async fn create_deployment(
        &self,
        service_id: Uuid,
        version_id: Uuid,
        environment_id: Option<Uuid>,
        steps: serde_json::Value,
        downstream_overrides: Option<serde_json::Value>,
    ) -> CoreResult<Deployment>;

    async fn get_deployment(&self, id: Uuid) -> CoreResult<Option<Deployment>>;

    async fn set_deployment_workflow_uuid(&self, deployment_id: Uuid, workflow_uuid: Uuid) -> CoreResult<()>;

    async fn update_deployment_status(
        &self,
        deployment_id: Uuid,
        status: DeploymentStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> CoreResult<()>;

    /// Count of deployments sharing `(version_id, environment_id)` created
    /// strictly before `created_at` — the subversion index is 1 + this
    /// (spec §5, §GLOSSARY; informational, races acceptable).
    async fn count_deployments_before(
        &self,
        version_id: Uuid,
        environment_id: Option<Uuid>,
        created_at: DateTime<Utc>,
    ) -> CoreResult<i64>;

    // -- Workflow engine state (spec §4.7, §6.1) ------------------------------

    async fn create_workflow(
        &self,
        workflow_uuid: Uuid,
        name: &str,
        inputs: serde_json::Value,
        queue_name: &str,
    ) -> CoreResult<WorkflowRecord>;

    async fn get_workflow(&self, workflow_uuid: Uuid) -> CoreResult<Option<WorkflowRecord>>;

    async fn update_workflow_status(
        &self,
        workflow_uuid: Uuid,
        status: WorkflowStatus,
        error: Option<String>,
    ) -> CoreResult<()>;

    async fn list_enqueued_workflows(&self, queue_name: &str, limit: i64) -> CoreResult<Vec<WorkflowRecord>>;

    async fn get_operation_output(
        &self,
        workflow_uuid: Uuid,
        function_id: i32,
    ) -> CoreResult<Option<OperationOutputRecord>>;

    async fn put_operation_output(&self, record: OperationOutputRecord) -> CoreResult<()>;

    async fn count_operation_outputs(&self, workflow_uuid: Uuid) -> CoreResult<i64>;

    async fn set_event(&self, workflow_uuid: Uuid, key: &str, value: serde_json::Value) -> CoreResult<()>;

    async fn get_event(&self, workflow_uuid: Uuid, key: &str) -> CoreResult<Option<serde_json::Value>>;

    async fn append_stream(&self, workflow_uuid: Uuid, key: &str, value: serde_json::Value) -> CoreResult<()>;

    async fn read_stream(
        &self,
        workflow_uuid: Uuid,
        key: &str,
        max_items: usize,
    ) -> CoreResult<Vec<serde_json::Value>>;
}
