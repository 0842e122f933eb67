//! Postgres-backed `Store` (spec §4.1), grounded on the teacher's
//! `db/*.rs` modules: a `PgPool`, one transaction per logical write, and
//! unique-constraint violations mapped to `CoreError::AlreadyExists`.
//!
//! Unlike the teacher, queries here use the runtime `sqlx::query`/`query_as`
//! API rather than the `query_as!` compile-time-checked macro: the macro
//! needs a live database (or a checked-in `.sqlx` cache) at build time,
//! which this environment doesn't have. Noted in DESIGN.md.

use super::Store;
use crate::error::{CoreError, CoreResult};
use crate::model::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> CoreResult<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| CoreError::Unavailable(format!("failed to connect to database: {e}")))?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> CoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CoreError::Fatal(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn resolve_project(&self, id: Uuid) -> CoreResult<Project> {
        sqlx::query_as::<_, Project>(
            "SELECT id, name, description, owner_id, created_at, updated_at, deleted_at \
             FROM projects WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "resolve_project"))?
        .ok_or_else(|| CoreError::NotFound(format!("project {id}")))
    }

    async fn get_environment(&self, id: Uuid) -> CoreResult<Option<Environment>> {
        sqlx::query_as::<_, Environment>(
            "SELECT id, name, type as \"type\", url, project_id, cluster_id, created_at, updated_at, deleted_at \
             FROM environments WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "get_environment"))
    }

    async fn list_environments_by_project(&self, project_id: Uuid) -> CoreResult<Vec<Environment>> {
        sqlx::query_as::<_, Environment>(
            "SELECT id, name, type as \"type\", url, project_id, cluster_id, created_at, updated_at, deleted_at \
             FROM environments WHERE project_id = $1 AND deleted_at IS NULL",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "list_environments_by_project"))
    }

    async fn get_service(&self, id: Uuid) -> CoreResult<Option<Service>> {
        sqlx::query_as::<_, Service>(
            "SELECT id, name, description, type as \"type\", project_id, owner, status, created_at, updated_at, deleted_at \
             FROM services WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "get_service"))
    }

    async fn list_environment_ids_for_service(&self, service_id: Uuid) -> CoreResult<Vec<Uuid>> {
        let rows = sqlx::query("SELECT environment_id FROM service_environments WHERE service_id = $1")
            .bind(service_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CoreError::from_sqlx(e, "list_environment_ids_for_service"))?;
        Ok(rows.into_iter().map(|r| r.get::<Uuid, _>("environment_id")).collect())
    }

    async fn get_config(
        &self,
        parent_scope: ConfigParentScope,
        parent_id: Uuid,
        key: &str,
    ) -> CoreResult<Option<ConfigEntry>> {
        sqlx::query_as::<_, ConfigEntry>(
            "SELECT id, parent_scope, parent_id, key, value, config_data, workflow_uuid, created_at, updated_at, deleted_at \
             FROM configs WHERE parent_scope = $1 AND parent_id = $2 AND key = $3 AND deleted_at IS NULL",
        )
        .bind(parent_scope)
        .bind(parent_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "get_config"))
    }

    async fn list_configs(
        &self,
        parent_scope: ConfigParentScope,
        parent_id: Uuid,
    ) -> CoreResult<Vec<ConfigEntry>> {
        sqlx::query_as::<_, ConfigEntry>(
            "SELECT id, parent_scope, parent_id, key, value, config_data, workflow_uuid, created_at, updated_at, deleted_at \
             FROM configs WHERE parent_scope = $1 AND parent_id = $2 AND deleted_at IS NULL",
        )
        .bind(parent_scope)
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "list_configs"))
    }

    async fn upsert_config(
        &self,
        parent_scope: ConfigParentScope,
        parent_id: Uuid,
        key: &str,
        value: Option<String>,
        config_data: Option<serde_json::Value>,
    ) -> CoreResult<ConfigEntry> {
        sqlx::query_as::<_, ConfigEntry>(
            "INSERT INTO configs (parent_scope, parent_id, key, value, config_data) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (parent_scope, parent_id, key) WHERE deleted_at IS NULL \
             DO UPDATE SET value = EXCLUDED.value, config_data = EXCLUDED.config_data, updated_at = now() \
             RETURNING id, parent_scope, parent_id, key, value, config_data, workflow_uuid, created_at, updated_at, deleted_at",
        )
        .bind(parent_scope)
        .bind(parent_id)
        .bind(key)
        .bind(value)
        .bind(config_data)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "upsert_config"))
    }

    async fn set_config_workflow_uuid(&self, config_id: Uuid, workflow_uuid: Uuid) -> CoreResult<()> {
        sqlx::query("UPDATE configs SET workflow_uuid = $2, updated_at = now() WHERE id = $1")
            .bind(config_id)
            .bind(workflow_uuid)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::from_sqlx(e, "set_config_workflow_uuid"))?;
        Ok(())
    }

    async fn list_variables(&self, scope: VariableScope, resource_id: Uuid) -> CoreResult<Vec<VariableEntry>> {
        sqlx::query_as::<_, VariableEntry>(
            "SELECT id, scope, resource_id, key, value, is_secret, created_at, updated_at, deleted_at \
             FROM variables WHERE scope = $1 AND resource_id = $2 AND deleted_at IS NULL",
        )
        .bind(scope)
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "list_variables"))
    }

    async fn get_cluster(&self, id: Uuid) -> CoreResult<Option<KubernetesCluster>> {
        sqlx::query_as::<_, KubernetesCluster>(
            "SELECT id, name, api_url, auth_method, environment_type, kubeconfig_content, token, \
             client_key, client_cert, client_ca_cert, created_at, updated_at \
             FROM kubernetes_clusters WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "get_cluster"))
    }

    async fn create_cluster(&self, cluster: KubernetesCluster) -> CoreResult<KubernetesCluster> {
        sqlx::query_as::<_, KubernetesCluster>(
            "INSERT INTO kubernetes_clusters \
             (id, name, api_url, auth_method, environment_type, kubeconfig_content, token, client_key, client_cert, client_ca_cert) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING id, name, api_url, auth_method, environment_type, kubeconfig_content, token, \
             client_key, client_cert, client_ca_cert, created_at, updated_at",
        )
        .bind(cluster.id)
        .bind(&cluster.name)
        .bind(&cluster.api_url)
        .bind(cluster.auth_method)
        .bind(cluster.environment_type)
        .bind(&cluster.kubeconfig_content)
        .bind(&cluster.token)
        .bind(&cluster.client_key)
        .bind(&cluster.client_cert)
        .bind(&cluster.client_ca_cert)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "create_cluster"))
    }

    async fn pick_cluster_for_environment_type(
        &self,
        env_type: EnvironmentType,
    ) -> CoreResult<Option<KubernetesCluster>> {
        sqlx::query_as::<_, KubernetesCluster>(
            "SELECT id, name, api_url, auth_method, environment_type, kubeconfig_content, token, \
             client_key, client_cert, client_ca_cert, created_at, updated_at \
             FROM kubernetes_clusters WHERE environment_type = $1 LIMIT 1",
        )
        .bind(env_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "pick_cluster_for_environment_type"))
    }

    async fn list_resource_permissions(
        &self,
        user_id: Option<Uuid>,
        scope: Option<Scope>,
        resource_id: Option<Uuid>,
    ) -> CoreResult<Vec<ResourcePermission>> {
        sqlx::query_as::<_, ResourcePermission>(
            "SELECT id, user_id, scope, resource_id, actions, granted_by, granted_at FROM resource_permissions \
             WHERE ($1::uuid IS NULL OR user_id = $1) \
             AND ($2::text IS NULL OR scope = $2) \
             AND ($3::uuid IS NULL OR resource_id = $3)",
        )
        .bind(user_id)
        .bind(scope.map(|s| match s {
            Scope::Project => "project",
            Scope::Environment => "environment",
            Scope::Service => "service",
        }))
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "list_resource_permissions"))
    }

    async fn create_resource_permission(
        &self,
        permission: ResourcePermission,
    ) -> CoreResult<ResourcePermission> {
        sqlx::query_as::<_, ResourcePermission>(
            "INSERT INTO resource_permissions (id, user_id, scope, resource_id, actions, granted_by, granted_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING id, user_id, scope, resource_id, actions, granted_by, granted_at",
        )
        .bind(permission.id)
        .bind(permission.user_id)
        .bind(permission.scope)
        .bind(permission.resource_id)
        .bind(&permission.actions)
        .bind(permission.granted_by)
        .bind(permission.granted_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "create_resource_permission"))
    }

    async fn latest_service_version(&self, service_id: Uuid) -> CoreResult<Option<ServiceVersion>> {
        sqlx::query_as::<_, ServiceVersion>(
            "SELECT id, service_id, version_label, config_hash, spec_json, created_at FROM service_versions \
             WHERE service_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "latest_service_version"))
    }

    async fn find_service_versions_by_hash(
        &self,
        service_id: Uuid,
        config_hash: &str,
    ) -> CoreResult<Vec<ServiceVersion>> {
        sqlx::query_as::<_, ServiceVersion>(
            "SELECT id, service_id, version_label, config_hash, spec_json, created_at FROM service_versions \
             WHERE service_id = $1 AND config_hash = $2",
        )
        .bind(service_id)
        .bind(config_hash)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "find_service_versions_by_hash"))
    }

    async fn create_service_version(
        &self,
        service_id: Uuid,
        version_label: &str,
        config_hash: &str,
        spec_json: serde_json::Value,
    ) -> CoreResult<ServiceVersion> {
        sqlx::query_as::<_, ServiceVersion>(
            "INSERT INTO service_versions (service_id, version_label, config_hash, spec_json) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, service_id, version_label, config_hash, spec_json, created_at",
        )
        .bind(service_id)
        .bind(version_label)
        .bind(config_hash)
        .bind(spec_json)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "create_service_version"))
    }

    async fn get_service_version(&self, id: Uuid) -> CoreResult<Option<ServiceVersion>> {
        sqlx::query_as::<_, ServiceVersion>(
            "SELECT id, service_id, version_label, config_hash, spec_json, created_at FROM service_versions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "get_service_version"))
    }

    async fn create_deployment(
        &self,
        service_id: Uuid,
        version_id: Uuid,
        environment_id: Option<Uuid>,
        steps: serde_json::Value,
        downstream_overrides: Option<serde_json::Value>,
    ) -> CoreResult<Deployment> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoreError::from_sqlx(e, "create_deployment:begin"))?;

        let version_service_id: Uuid = sqlx::query("SELECT service_id FROM service_versions WHERE id = $1")
            .bind(version_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| CoreError::from_sqlx(e, "create_deployment:lookup_version"))?
            .ok_or_else(|| CoreError::NotFound(format!("version {version_id}")))?
            .get(0);

        if version_service_id != service_id {
            return Err(CoreError::Invalid(
                "version does not belong to the given service".to_string(),
            ));
        }

        let deployment = sqlx::query_as::<_, Deployment>(
            "INSERT INTO deployments (service_id, version_id, environment_id, steps, downstream_overrides) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING id, service_id, version_id, environment_id, workflow_uuid, steps, downstream_overrides, status, created_at, completed_at",
        )
        .bind(service_id)
        .bind(version_id)
        .bind(environment_id)
        .bind(steps)
        .bind(downstream_overrides)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "create_deployment:insert"))?;

        tx.commit()
            .await
            .map_err(|e| CoreError::from_sqlx(e, "create_deployment:commit"))?;

        Ok(deployment)
    }

    async fn get_deployment(&self, id: Uuid) -> CoreResult<Option<Deployment>> {
        sqlx::query_as::<_, Deployment>(
            "SELECT id, service_id, version_id, environment_id, workflow_uuid, steps, downstream_overrides, status, created_at, completed_at \
             FROM deployments WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "get_deployment"))
    }

    async fn set_deployment_workflow_uuid(&self, deployment_id: Uuid, workflow_uuid: Uuid) -> CoreResult<()> {
        sqlx::query("UPDATE deployments SET workflow_uuid = $2 WHERE id = $1")
            .bind(deployment_id)
            .bind(workflow_uuid)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::from_sqlx(e, "set_deployment_workflow_uuid"))?;
        Ok(())
    }

    async fn update_deployment_status(
        &self,
        deployment_id: Uuid,
        status: DeploymentStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> CoreResult<()> {
        sqlx::query("UPDATE deployments SET status = $2, completed_at = $3 WHERE id = $1")
            .bind(deployment_id)
            .bind(status)
            .bind(completed_at)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::from_sqlx(e, "update_deployment_status"))?;
        Ok(())
    }

    async fn count_deployments_before(
        &self,
        version_id: Uuid,
        environment_id: Option<Uuid>,
        created_at: DateTime<Utc>,
    ) -> CoreResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM deployments \
             WHERE version_id = $1 AND environment_id IS NOT DISTINCT FROM $2 AND created_at < $3",
        )
        .bind(version_id)
        .bind(environment_id)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "count_deployments_before"))?;
        Ok(row.get::<i64, _>("count"))
    }

    async fn create_workflow(
        &self,
        workflow_uuid: Uuid,
        name: &str,
        inputs: serde_json::Value,
        queue_name: &str,
    ) -> CoreResult<WorkflowRecord> {
        sqlx::query_as::<_, WorkflowRecord>(
            "INSERT INTO workflow_status (workflow_uuid, status, name, inputs, queue_name) \
             VALUES ($1, 'enqueued', $2, $3, $4) \
             RETURNING workflow_uuid, status, name, inputs, queue_name, application_version, error, created_at, updated_at",
        )
        .bind(workflow_uuid)
        .bind(name)
        .bind(inputs)
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "create_workflow"))
    }

    async fn get_workflow(&self, workflow_uuid: Uuid) -> CoreResult<Option<WorkflowRecord>> {
        sqlx::query_as::<_, WorkflowRecord>(
            "SELECT workflow_uuid, status, name, inputs, queue_name, application_version, error, created_at, updated_at \
             FROM workflow_status WHERE workflow_uuid = $1",
        )
        .bind(workflow_uuid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "get_workflow"))
    }

    async fn update_workflow_status(
        &self,
        workflow_uuid: Uuid,
        status: WorkflowStatus,
        error: Option<String>,
    ) -> CoreResult<()> {
        sqlx::query("UPDATE workflow_status SET status = $2, error = $3, updated_at = now() WHERE workflow_uuid = $1")
            .bind(workflow_uuid)
            .bind(status)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::from_sqlx(e, "update_workflow_status"))?;
        Ok(())
    }

    async fn list_enqueued_workflows(&self, queue_name: &str, limit: i64) -> CoreResult<Vec<WorkflowRecord>> {
        sqlx::query_as::<_, WorkflowRecord>(
            "SELECT workflow_uuid, status, name, inputs, queue_name, application_version, error, created_at, updated_at \
             FROM workflow_status WHERE queue_name = $1 AND status = 'enqueued' ORDER BY created_at LIMIT $2",
        )
        .bind(queue_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "list_enqueued_workflows"))
    }

    async fn get_operation_output(
        &self,
        workflow_uuid: Uuid,
        function_id: i32,
    ) -> CoreResult<Option<OperationOutputRecord>> {
        sqlx::query_as::<_, OperationOutputRecord>(
            "SELECT workflow_uuid, function_id, function_name, output, error, child_workflow_id, \
             started_at_epoch_ms, completed_at_epoch_ms \
             FROM operation_outputs WHERE workflow_uuid = $1 AND function_id = $2",
        )
        .bind(workflow_uuid)
        .bind(function_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "get_operation_output"))
    }

    async fn put_operation_output(&self, record: OperationOutputRecord) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO operation_outputs \
             (workflow_uuid, function_id, function_name, output, error, child_workflow_id, started_at_epoch_ms, completed_at_epoch_ms) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (workflow_uuid, function_id) DO UPDATE SET \
             output = EXCLUDED.output, error = EXCLUDED.error, completed_at_epoch_ms = EXCLUDED.completed_at_epoch_ms",
        )
        .bind(record.workflow_uuid)
        .bind(record.function_id)
        .bind(&record.function_name)
        .bind(&record.output)
        .bind(&record.error)
        .bind(record.child_workflow_id)
        .bind(record.started_at_epoch_ms)
        .bind(record.completed_at_epoch_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "put_operation_output"))?;
        Ok(())
    }

    async fn count_operation_outputs(&self, workflow_uuid: Uuid) -> CoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM operation_outputs WHERE workflow_uuid = $1")
            .bind(workflow_uuid)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| CoreError::from_sqlx(e, "count_operation_outputs"))?;
        Ok(row.get::<i64, _>("count"))
    }

    async fn set_event(&self, workflow_uuid: Uuid, key: &str, value: serde_json::Value) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO workflow_events (workflow_uuid, key, value) VALUES ($1, $2, $3) \
             ON CONFLICT (workflow_uuid, key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(workflow_uuid)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::from_sqlx(e, "set_event"))?;
        Ok(())
    }

    async fn get_event(&self, workflow_uuid: Uuid, key: &str) -> CoreResult<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT value FROM workflow_events WHERE workflow_uuid = $1 AND key = $2")
            .bind(workflow_uuid)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CoreError::from_sqlx(e, "get_event"))?;
        Ok(row.map(|r| r.get::<serde_json::Value, _>("value")))
    }

    async fn append_stream(&self, workflow_uuid: Uuid, key: &str, value: serde_json::Value) -> CoreResult<()> {
        sqlx::query("INSERT INTO workflow_streams (workflow_uuid, key, value) VALUES ($1, $2, $3)")
            .bind(workflow_uuid)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::from_sqlx(e, "append_stream"))?;
        Ok(())
    }

    async fn read_stream(
        &self,
        workflow_uuid: Uuid,
        key: &str,
        max_items: usize,
    ) -> CoreResult<Vec<serde_json::Value>> {
        // `usize::MAX as i64` wraps to -1, which Postgres rejects as a LIMIT.
        // Callers asking for "all" (send()'s dedup scan) get an unbounded
        // query instead of a cast that only happens to fit for smaller caps.
        let rows = if max_items >= i64::MAX as usize {
            sqlx::query(
                "SELECT value FROM workflow_streams WHERE workflow_uuid = $1 AND key = $2 ORDER BY seq",
            )
            .bind(workflow_uuid)
            .bind(key)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query(
                "SELECT value FROM workflow_streams WHERE workflow_uuid = $1 AND key = $2 ORDER BY seq LIMIT $3",
            )
            .bind(workflow_uuid)
            .bind(key)
            .bind(max_items as i64)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| CoreError::from_sqlx(e, "read_stream"))?;
        Ok(rows.into_iter().map(|r| r.get::<serde_json::Value, _>("value")).collect())
    }
}
