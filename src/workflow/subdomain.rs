//! Environment-Subdomain Orchestrator (spec §4.9): provisions the
//! per-environment TLS certificate and gateway listeners.

use crate::error::{CoreError, CoreResult};
use crate::k8s::GatewayFactory;
use crate::model::{ConfigParentScope, KubernetesCluster};
use crate::render::{self, EnvironmentSubdomainInputs};
use crate::settings::DomainSettings;
use crate::store::Store;
use crate::workflow::{Workflow, WorkflowCtx};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub const SUBDOMAIN_STEPS: [&str; 4] = [
    "save_domain_info",
    "render_env_manifests",
    "apply_env_certificate",
    "apply_env_gateway",
];

const DOMAIN_INFO_KEY: &str = "domain_info";
const CUSTOM_DOMAIN_PREFIX: &str = "custom_domain:";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubdomainArgs {
    environment_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EnvDetails {
    environment_id: Uuid,
    cluster_id: Option<Uuid>,
    project_name: String,
    environment_name: String,
    extra_sans: Vec<String>,
}

pub struct SubdomainWorkflow {
    store: Arc<dyn Store>,
    gateway_factory: Arc<dyn GatewayFactory>,
    domain: DomainSettings,
}

impl SubdomainWorkflow {
    pub fn new(store: Arc<dyn Store>, gateway_factory: Arc<dyn GatewayFactory>, domain: DomainSettings) -> Self {
        Self {
            store,
            gateway_factory,
            domain,
        }
    }

    pub fn enqueue_args(environment_id: Uuid) -> serde_json::Value {
        serde_json::json!({"environment_id": environment_id})
    }

    async fn cluster(&self, cluster_id: Option<Uuid>) -> CoreResult<KubernetesCluster> {
        let cluster_id =
            cluster_id.ok_or_else(|| CoreError::Fatal("environment has no cluster_id, cannot provision subdomain".to_string()))?;
        self.store
            .get_cluster(cluster_id)
            .await?
            .ok_or_else(|| CoreError::Fatal(format!("cluster {cluster_id} not found")))
    }
}

#[async_trait]
impl Workflow for SubdomainWorkflow {
    fn name(&self) -> &'static str {
        "setup_env_subdomain"
    }

    async fn run(&self, ctx: &mut WorkflowCtx<'_>, args: serde_json::Value) -> Result<serde_json::Value, CoreError> {
        let args: SubdomainArgs = serde_json::from_value(args)
            .map_err(|e| CoreError::Invalid(format!("setup_env_subdomain args: {e}")))?;

        let details = ctx
            .step(SUBDOMAIN_STEPS[0], || async {
                let environment = self
                    .store
                    .get_environment(args.environment_id)
                    .await?
                    .ok_or_else(|| CoreError::NotFound(format!("environment {}", args.environment_id)))?;
                let project = self.store.resolve_project(environment.project_id).await?;

                self.store
                    .upsert_config(
                        ConfigParentScope::Environment,
                        args.environment_id,
                        DOMAIN_INFO_KEY,
                        None,
                        Some(serde_json::json!({
                            "project_name": project.name,
                            "environment_name": environment.name,
                        })),
                    )
                    .await?;

                let extra_sans = self
                    .store
                    .list_configs(ConfigParentScope::Environment, args.environment_id)
                    .await?
                    .into_iter()
                    .filter(|c| c.key.starts_with(CUSTOM_DOMAIN_PREFIX))
                    .filter_map(|c| c.value)
                    .collect();

                Ok(EnvDetails {
                    environment_id: args.environment_id,
                    cluster_id: environment.cluster_id,
                    project_name: project.name,
                    environment_name: environment.name,
                    extra_sans,
                })
            })
            .await?;

        let domain = self.domain.clone();
        let bundle = ctx
            .step(SUBDOMAIN_STEPS[1], || async {
                Ok(render::render_environment_subdomain(&EnvironmentSubdomainInputs {
                    project_name: details.project_name.clone(),
                    env_name: details.environment_name.clone(),
                    base_domain: domain.base_domain.clone(),
                    cert_namespace: domain.cert_namespace.clone(),
                    issuer_name: domain.issuer_name.clone(),
                    cert_duration_hours: domain.cert_duration_hours as u32,
                    cert_renew_before_hours: domain.cert_renew_before_hours as u32,
                    gateway_name: domain.gateway_name.clone(),
                    gateway_namespace: domain.gateway_namespace.clone(),
                    gateway_class_name: domain.gateway_class_name.clone(),
                    extra_sans: details.extra_sans.clone(),
                }))
            })
            .await?;

        let cluster = self.cluster(details.cluster_id).await?;

        ctx.step(SUBDOMAIN_STEPS[2], || async {
            let gateway = self.gateway_factory.build(&cluster).await?;
            gateway.apply(&bundle.certificate, &self.domain.cert_namespace).await?;
            Ok(())
        })
        .await?;

        ctx.step(SUBDOMAIN_STEPS[3], || async {
            let gateway = self.gateway_factory.build(&cluster).await?;
            gateway.apply(&bundle.gateway, &self.domain.gateway_namespace).await?;
            Ok(())
        })
        .await?;

        Ok(serde_json::json!({"environment_id": details.environment_id}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::fake::FakeGatewayFactory;
    use crate::model::*;
    use crate::store::memory::MemoryStore;
    use chrono::Utc;

    #[tokio::test]
    async fn subdomain_workflow_writes_domain_info_and_applies_objects() {
        let memory = MemoryStore::new();
        let owner = Uuid::new_v4();
        let project = Project {
            id: Uuid::new_v4(),
            name: "Acme".into(),
            description: None,
            owner_id: owner,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        };
        memory.insert_project(project.clone());

        let cluster = KubernetesCluster {
            id: Uuid::new_v4(),
            name: "test-cluster".into(),
            api_url: "https://example.invalid".into(),
            auth_method: AuthMethod::Token,
            environment_type: None,
            kubeconfig_content: None,
            token: Some("unused".into()),
            client_key: None,
            client_cert: None,
            client_ca_cert: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        memory.insert_cluster(cluster.clone());

        let environment = Environment {
            id: Uuid::new_v4(),
            name: "qa".into(),
            env_type: EnvironmentType::Testing,
            url: None,
            project_id: project.id,
            cluster_id: Some(cluster.id),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        };
        memory.insert_environment(environment.clone());

        let store: Arc<dyn Store> = Arc::new(memory);
        let workflow_uuid = Uuid::new_v4();
        store
            .create_workflow(
                workflow_uuid,
                "setup_env_subdomain",
                SubdomainWorkflow::enqueue_args(environment.id),
                "default",
            )
            .await
            .unwrap();

        let factory = Arc::new(FakeGatewayFactory::new());
        let workflow = SubdomainWorkflow::new(store.clone(), factory.clone(), DomainSettings::default());

        let mut ctx = WorkflowCtx::new(store.as_ref(), workflow_uuid);
        let out = workflow
            .run(&mut ctx, SubdomainWorkflow::enqueue_args(environment.id))
            .await
            .unwrap();
        assert_eq!(out["environment_id"], environment.id.to_string());

        let domain_info = store
            .get_config(ConfigParentScope::Environment, environment.id, DOMAIN_INFO_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(domain_info.config_data.unwrap()["environment_name"], "qa");

        let applied = factory.gateway.applied.lock().unwrap();
        assert_eq!(applied.len(), 2);
    }
}
