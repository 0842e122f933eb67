//! Domain entities shared across every component (spec §3).
//!
//! These are plain data; components fetch them by id through `Store` rather
//! than holding resident references to each other (spec §9: do not
//! materialize cyclic object graphs).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub is_active: bool,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum EnvironmentType {
    Development,
    Testing,
    Staging,
    Production,
    Sandbox,
    Dev,
    Prod,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Environment {
    pub id: Uuid,
    pub name: String,
    #[sqlx(rename = "type")]
    pub env_type: EnvironmentType,
    pub url: Option<String>,
    pub project_id: Uuid,
    pub cluster_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum ServiceType {
    Microservice,
    Webapp,
    Database,
    Queue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Down,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Service {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    #[sqlx(rename = "type")]
    pub service_type: ServiceType,
    pub project_id: Uuid,
    pub owner: Option<String>,
    pub status: ServiceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum ConfigParentScope {
    Project,
    Environment,
    Service,
}

/// Unifies Project/Environment/ServiceConfig — they share shape and differ
/// only in which table `parent_id` points into (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConfigEntry {
    pub id: Uuid,
    pub parent_scope: ConfigParentScope,
    pub parent_id: Uuid,
    pub key: String,
    pub value: Option<String>,
    pub config_data: Option<serde_json::Value>,
    /// EnvironmentConfig-only: the workflow currently acting on this row
    /// (e.g. the subdomain-provisioning workflow's id).
    pub workflow_uuid: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AdminConfig {
    pub id: Uuid,
    pub key: String,
    pub value: Option<String>,
    pub config_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum VariableScope {
    Project,
    Environment,
    Service,
}

/// Backs both EnvironmentVariable and Secret rows; `is_secret` decides
/// whether read paths redact `value` down to its length (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VariableEntry {
    pub id: Uuid,
    pub scope: VariableScope,
    pub resource_id: Uuid,
    pub key: String,
    pub value: String,
    pub is_secret: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl VariableEntry {
    /// What a read API is allowed to show for a secret: its length, never
    /// the plaintext (spec §3).
    pub fn redacted_value(&self) -> Option<String> {
        if self.is_secret {
            None
        } else {
            Some(self.value.clone())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "camelCase")]
pub enum AuthMethod {
    Kubeconfig,
    Token,
    ServiceAccount,
    ClientCert,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct KubernetesCluster {
    pub id: Uuid,
    pub name: String,
    pub api_url: String,
    pub auth_method: AuthMethod,
    pub environment_type: Option<EnvironmentType>,
    /// All credential fields are stored encrypted; decrypted on demand by
    /// the K8s Gateway (spec §4.6).
    pub kubeconfig_content: Option<String>,
    pub token: Option<String>,
    pub client_key: Option<String>,
    pub client_cert: Option<String>,
    pub client_ca_cert: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ServiceVersion {
    pub id: Uuid,
    pub service_id: Uuid,
    pub version_label: String,
    pub config_hash: String,
    pub spec_json: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamOverride {
    pub service_id: Uuid,
    pub service_name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Deployment {
    pub id: Uuid,
    pub service_id: Uuid,
    pub version_id: Uuid,
    pub environment_id: Option<Uuid>,
    pub workflow_uuid: Option<Uuid>,
    pub steps: serde_json::Value,
    pub downstream_overrides: Option<serde_json::Value>,
    pub status: DeploymentStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn downstream_overrides_parsed(&self) -> Vec<DownstreamOverride> {
        self.downstream_overrides
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// Legacy permission scheme, data-only — never consulted for authorization
/// decisions (spec §9).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LegacyUserPermission {
    pub id: Uuid,
    pub user_id: Uuid,
    pub permission_def: String,
    pub resource_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Scope {
    Project,
    Environment,
    Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Write,
    Delete,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ResourcePermission {
    pub id: Uuid,
    pub user_id: Uuid,
    pub scope: Scope,
    pub resource_id: Uuid,
    /// Non-empty subset of {read,write,delete,admin}, stored as a string
    /// list column (spec §3 invariant).
    pub actions: Vec<String>,
    pub granted_by: Uuid,
    pub granted_at: DateTime<Utc>,
}

impl ResourcePermission {
    pub fn has_action(&self, action: Action) -> bool {
        let name = match action {
            Action::Read => "read",
            Action::Write => "write",
            Action::Delete => "delete",
            Action::Admin => "admin",
        };
        self.actions.iter().any(|a| a == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum WorkflowStatus {
    Enqueued,
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Paused,
}

/// Row in `workflow_status` (spec §6.1) — the durable record of one
/// workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkflowRecord {
    pub workflow_uuid: Uuid,
    pub status: WorkflowStatus,
    pub name: String,
    pub inputs: serde_json::Value,
    pub queue_name: String,
    pub application_version: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row in `operation_outputs` (spec §6.1) — one memoized step.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OperationOutputRecord {
    pub workflow_uuid: Uuid,
    pub function_id: i32,
    pub function_name: String,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub child_workflow_id: Option<Uuid>,
    pub started_at_epoch_ms: i64,
    pub completed_at_epoch_ms: Option<i64>,
}

/// Already-resolved caller identity handed to the core by the external API
/// (spec §6.4) — how tokens/cookies became this is out of scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Caller {
    pub id: Uuid,
    pub email: String,
    pub is_active: bool,
    pub is_admin: bool,
    pub is_super_admin: bool,
}
