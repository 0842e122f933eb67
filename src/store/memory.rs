//! In-memory `Store` fake used by unit tests (spec §1.1 ambient stack note:
//! version engine / permission evaluator / workflow engine tests run
//! without a live Postgres).

use super::Store;
use crate::error::{CoreError, CoreResult};
use crate::model::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    projects: HashMap<Uuid, Project>,
    environments: HashMap<Uuid, Environment>,
    services: HashMap<Uuid, Service>,
    configs: HashMap<Uuid, ConfigEntry>,
    variables: HashMap<Uuid, VariableEntry>,
    clusters: HashMap<Uuid, KubernetesCluster>,
    permissions: HashMap<Uuid, ResourcePermission>,
    service_environments: HashMap<Uuid, Vec<Uuid>>,
    versions: HashMap<Uuid, ServiceVersion>,
    deployments: HashMap<Uuid, Deployment>,
    workflows: HashMap<Uuid, WorkflowRecord>,
    operation_outputs: HashMap<(Uuid, i32), OperationOutputRecord>,
    events: HashMap<(Uuid, String), serde_json::Value>,
    streams: HashMap<(Uuid, String), Vec<serde_json::Value>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_project(&self, project: Project) {
        self.inner.lock().unwrap().projects.insert(project.id, project);
    }

    pub fn insert_environment(&self, env: Environment) {
        self.inner.lock().unwrap().environments.insert(env.id, env);
    }

    pub fn insert_service(&self, service: Service) {
        self.inner.lock().unwrap().services.insert(service.id, service);
    }

    pub fn insert_config(&self, config: ConfigEntry) {
        self.inner.lock().unwrap().configs.insert(config.id, config);
    }

    pub fn insert_variable(&self, variable: VariableEntry) {
        self.inner.lock().unwrap().variables.insert(variable.id, variable);
    }

    pub fn insert_cluster(&self, cluster: KubernetesCluster) {
        self.inner.lock().unwrap().clusters.insert(cluster.id, cluster);
    }

    pub fn link_service_environment(&self, service_id: Uuid, environment_id: Uuid) {
        self.inner
            .lock()
            .unwrap()
            .service_environments
            .entry(service_id)
            .or_default()
            .push(environment_id);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn resolve_project(&self, id: Uuid) -> CoreResult<Project> {
        self.inner
            .lock()
            .unwrap()
            .projects
            .get(&id)
            .filter(|p| p.deleted_at.is_none())
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("project {id}")))
    }

    async fn get_environment(&self, id: Uuid) -> CoreResult<Option<Environment>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .environments
            .get(&id)
            .filter(|e| e.deleted_at.is_none())
            .cloned())
    }

    async fn list_environments_by_project(&self, project_id: Uuid) -> CoreResult<Vec<Environment>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .environments
            .values()
            .filter(|e| e.project_id == project_id && e.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn get_service(&self, id: Uuid) -> CoreResult<Option<Service>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .services
            .get(&id)
            .filter(|s| s.deleted_at.is_none())
            .cloned())
    }

    async fn list_environment_ids_for_service(&self, service_id: Uuid) -> CoreResult<Vec<Uuid>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .service_environments
            .get(&service_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_config(
        &self,
        parent_scope: ConfigParentScope,
        parent_id: Uuid,
        key: &str,
    ) -> CoreResult<Option<ConfigEntry>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .configs
            .values()
            .find(|c| {
                c.parent_scope == parent_scope
                    && c.parent_id == parent_id
                    && c.key == key
                    && c.deleted_at.is_none()
            })
            .cloned())
    }

    async fn list_configs(
        &self,
        parent_scope: ConfigParentScope,
        parent_id: Uuid,
    ) -> CoreResult<Vec<ConfigEntry>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .configs
            .values()
            .filter(|c| c.parent_scope == parent_scope && c.parent_id == parent_id && c.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn upsert_config(
        &self,
        parent_scope: ConfigParentScope,
        parent_id: Uuid,
        key: &str,
        value: Option<String>,
        config_data: Option<serde_json::Value>,
    ) -> CoreResult<ConfigEntry> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        if let Some(existing) = inner
            .configs
            .values_mut()
            .find(|c| c.parent_scope == parent_scope && c.parent_id == parent_id && c.key == key && c.deleted_at.is_none())
        {
            existing.value = value;
            existing.config_data = config_data;
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let entry = ConfigEntry {
            id: Uuid::new_v4(),
            parent_scope,
            parent_id,
            key: key.to_string(),
            value,
            config_data,
            workflow_uuid: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        inner.configs.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn set_config_workflow_uuid(&self, config_id: Uuid, workflow_uuid: Uuid) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let config = inner
            .configs
            .get_mut(&config_id)
            .ok_or_else(|| CoreError::NotFound(format!("config {config_id}")))?;
        config.workflow_uuid = Some(workflow_uuid);
        Ok(())
    }

    async fn list_variables(&self, scope: VariableScope, resource_id: Uuid) -> CoreResult<Vec<VariableEntry>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .variables
            .values()
            .filter(|v| v.scope == scope && v.resource_id == resource_id && v.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn get_cluster(&self, id: Uuid) -> CoreResult<Option<KubernetesCluster>> {
        Ok(self.inner.lock().unwrap().clusters.get(&id).cloned())
    }

    async fn create_cluster(&self, cluster: KubernetesCluster) -> CoreResult<KubernetesCluster> {
        let mut inner = self.inner.lock().unwrap();
        if inner.clusters.values().any(|c| c.name == cluster.name) {
            return Err(CoreError::AlreadyExists(format!(
                "cluster name `{}` already in use",
                cluster.name
            )));
        }
        inner.clusters.insert(cluster.id, cluster.clone());
        Ok(cluster)
    }

    async fn pick_cluster_for_environment_type(
        &self,
        env_type: EnvironmentType,
    ) -> CoreResult<Option<KubernetesCluster>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .clusters
            .values()
            .find(|c| c.environment_type == Some(env_type))
            .cloned())
    }

    async fn list_resource_permissions(
        &self,
        user_id: Option<Uuid>,
        scope: Option<Scope>,
        resource_id: Option<Uuid>,
    ) -> CoreResult<Vec<ResourcePermission>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .permissions
            .values()
            .filter(|p| user_id.is_none_or(|u| p.user_id == u))
            .filter(|p| scope.is_none_or(|s| p.scope == s))
            .filter(|p| resource_id.is_none_or(|r| p.resource_id == r))
            .cloned()
            .collect())
    }

    async fn create_resource_permission(
        &self,
        permission: ResourcePermission,
    ) -> CoreResult<ResourcePermission> {
        let mut inner = self.inner.lock().unwrap();
        let duplicate = inner.permissions.values().any(|p| {
            p.user_id == permission.user_id
                && p.scope == permission.scope
                && p.resource_id == permission.resource_id
        });
        if duplicate {
            return Err(CoreError::AlreadyExists(format!(
                "permission for user {} on {:?}:{} already exists",
                permission.user_id, permission.scope, permission.resource_id
            )));
        }
        inner.permissions.insert(permission.id, permission.clone());
        Ok(permission)
    }

    async fn latest_service_version(&self, service_id: Uuid) -> CoreResult<Option<ServiceVersion>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .versions
            .values()
            .filter(|v| v.service_id == service_id)
            .max_by_key(|v| v.created_at)
            .cloned())
    }

    async fn find_service_versions_by_hash(
        &self,
        service_id: Uuid,
        config_hash: &str,
    ) -> CoreResult<Vec<ServiceVersion>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .versions
            .values()
            .filter(|v| v.service_id == service_id && v.config_hash == config_hash)
            .cloned()
            .collect())
    }

    async fn create_service_version(
        &self,
        service_id: Uuid,
        version_label: &str,
        config_hash: &str,
        spec_json: serde_json::Value,
    ) -> CoreResult<ServiceVersion> {
        let mut inner = self.inner.lock().unwrap();
        let duplicate = inner
            .versions
            .values()
            .any(|v| v.service_id == service_id && v.version_label == version_label);
        if duplicate {
            return Err(CoreError::AlreadyExists(format!(
                "version `{version_label}` already exists for service {service_id}"
            )));
        }
        let version = ServiceVersion {
            id: Uuid::new_v4(),
            service_id,
            version_label: version_label.to_string(),
            config_hash: config_hash.to_string(),
            spec_json,
            created_at: Utc::now(),
        };
        inner.versions.insert(version.id, version.clone());
        Ok(version)
    }

    async fn get_service_version(&self, id: Uuid) -> CoreResult<Option<ServiceVersion>> {
        Ok(self.inner.lock().unwrap().versions.get(&id).cloned())
    }

    async fn create_deployment(
        &self,
        service_id: Uuid,
        version_id: Uuid,
        environment_id: Option<Uuid>,
        steps: serde_json::Value,
        downstream_overrides: Option<serde_json::Value>,
    ) -> CoreResult<Deployment> {
        let mut inner = self.inner.lock().unwrap();
        let version = inner
            .versions
            .get(&version_id)
            .ok_or_else(|| CoreError::NotFound(format!("version {version_id}")))?;
        if version.service_id != service_id {
            return Err(CoreError::Invalid(
                "version does not belong to the given service".to_string(),
            ));
        }
        let deployment = Deployment {
            id: Uuid::new_v4(),
            service_id,
            version_id,
            environment_id,
            workflow_uuid: None,
            steps,
            downstream_overrides,
            status: DeploymentStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        };
        inner.deployments.insert(deployment.id, deployment.clone());
        Ok(deployment)
    }

    async fn get_deployment(&self, id: Uuid) -> CoreResult<Option<Deployment>> {
        Ok(self.inner.lock().unwrap().deployments.get(&id).cloned())
    }

    async fn set_deployment_workflow_uuid(&self, deployment_id: Uuid, workflow_uuid: Uuid) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let deployment = inner
            .deployments
            .get_mut(&deployment_id)
            .ok_or_else(|| CoreError::NotFound(format!("deployment {deployment_id}")))?;
        deployment.workflow_uuid = Some(workflow_uuid);
        Ok(())
    }

    async fn update_deployment_status(
        &self,
        deployment_id: Uuid,
        status: DeploymentStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let deployment = inner
            .deployments
            .get_mut(&deployment_id)
            .ok_or_else(|| CoreError::NotFound(format!("deployment {deployment_id}")))?;
        deployment.status = status;
        deployment.completed_at = completed_at;
        Ok(())
    }

    async fn count_deployments_before(
        &self,
        version_id: Uuid,
        environment_id: Option<Uuid>,
        created_at: DateTime<Utc>,
    ) -> CoreResult<i64> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .deployments
            .values()
            .filter(|d| d.version_id == version_id && d.environment_id == environment_id && d.created_at < created_at)
            .count() as i64)
    }

    async fn create_workflow(
        &self,
        workflow_uuid: Uuid,
        name: &str,
        inputs: serde_json::Value,
        queue_name: &str,
    ) -> CoreResult<WorkflowRecord> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let record = WorkflowRecord {
            workflow_uuid,
            status: WorkflowStatus::Enqueued,
            name: name.to_string(),
            inputs,
            queue_name: queue_name.to_string(),
            application_version: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        inner.workflows.insert(workflow_uuid, record.clone());
        Ok(record)
    }

    async fn get_workflow(&self, workflow_uuid: Uuid) -> CoreResult<Option<WorkflowRecord>> {
        Ok(self.inner.lock().unwrap().workflows.get(&workflow_uuid).cloned())
    }

    async fn update_workflow_status(
        &self,
        workflow_uuid: Uuid,
        status: WorkflowStatus,
        error: Option<String>,
    ) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .workflows
            .get_mut(&workflow_uuid)
            .ok_or_else(|| CoreError::NotFound(format!("workflow {workflow_uuid}")))?;
        record.status = status;
        record.error = error;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn list_enqueued_workflows(&self, queue_name: &str, limit: i64) -> CoreResult<Vec<WorkflowRecord>> {
        let mut records: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .workflows
            .values()
            .filter(|w| w.queue_name == queue_name && w.status == WorkflowStatus::Enqueued)
            .cloned()
            .collect();
        records.sort_by_key(|w| w.created_at);
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }

    async fn get_operation_output(
        &self,
        workflow_uuid: Uuid,
        function_id: i32,
    ) -> CoreResult<Option<OperationOutputRecord>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .operation_outputs
            .get(&(workflow_uuid, function_id))
            .cloned())
    }

    async fn put_operation_output(&self, record: OperationOutputRecord) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .operation_outputs
            .insert((record.workflow_uuid, record.function_id), record);
        Ok(())
    }

    async fn count_operation_outputs(&self, workflow_uuid: Uuid) -> CoreResult<i64> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .operation_outputs
            .keys()
            .filter(|(wf, _)| *wf == workflow_uuid)
            .count() as i64)
    }

    async fn set_event(&self, workflow_uuid: Uuid, key: &str, value: serde_json::Value) -> CoreResult<()> {
        self.inner
            .lock()
            .unwrap()
            .events
            .insert((workflow_uuid, key.to_string()), value);
        Ok(())
    }

    async fn get_event(&self, workflow_uuid: Uuid, key: &str) -> CoreResult<Option<serde_json::Value>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .events
            .get(&(workflow_uuid, key.to_string()))
            .cloned())
    }

    async fn append_stream(&self, workflow_uuid: Uuid, key: &str, value: serde_json::Value) -> CoreResult<()> {
        self.inner
            .lock()
            .unwrap()
            .streams
            .entry((workflow_uuid, key.to_string()))
            .or_default()
            .push(value);
        Ok(())
    }

    async fn read_stream(
        &self,
        workflow_uuid: Uuid,
        key: &str,
        max_items: usize,
    ) -> CoreResult<Vec<serde_json::Value>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .streams
            .get(&(workflow_uuid, key.to_string()))
            .map(|v| v.iter().take(max_items).cloned().collect())
            .unwrap_or_default())
    }
}
