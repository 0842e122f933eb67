//! Deployment Orchestrator (spec §4.8): the 11 ordered steps that turn a
//! `Deployment` row into applied, ready Kubernetes objects.

use crate::error::{CoreError, CoreResult};
use crate::k8s::{ApplyOutcome, GatewayFactory};
use crate::model::{ConfigParentScope, DeploymentStatus, KubernetesCluster};
use crate::render::{self, K8sObject, ServiceDetails};
use crate::settings::DomainSettings;
use crate::store::Store;
use crate::workflow::{Workflow, WorkflowCtx};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// The canonical step names in execution order, asserted against at startup
/// (spec.md: "the canonical step list MUST match the order above").
pub const DEPLOY_STEPS: [&str; 11] = [
    "get_deployment",
    "get_environment_name",
    "get_service_details",
    "render_manifests",
    "create_namespace",
    "create_service_account",
    "create_deployment",
    "create_service",
    "create_destination_rule",
    "create_virtual_service_mesh",
    "create_virtual_service_ext",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeployArgs {
    deployment_id: Uuid,
}

pub struct DeployWorkflow {
    store: Arc<dyn Store>,
    gateway_factory: Arc<dyn GatewayFactory>,
    domain: DomainSettings,
    poll_timeout: Duration,
    poll_interval: Duration,
}

impl DeployWorkflow {
    pub fn new(
        store: Arc<dyn Store>,
        gateway_factory: Arc<dyn GatewayFactory>,
        domain: DomainSettings,
        poll_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            gateway_factory,
            domain,
            poll_timeout,
            poll_interval,
        }
    }

    pub fn enqueue_args(deployment_id: Uuid) -> serde_json::Value {
        serde_json::json!({"deployment_id": deployment_id})
    }

    async fn cluster_for_environment(&self, environment_id: Option<Uuid>) -> CoreResult<KubernetesCluster> {
        let environment_id = environment_id
            .ok_or_else(|| CoreError::Fatal("deployment has no environment_id, cannot resolve cluster".to_string()))?;
        let environment = self
            .store
            .get_environment(environment_id)
            .await?
            .ok_or_else(|| CoreError::Fatal(format!("environment {environment_id} not found")))?;
        let cluster_id = environment
            .cluster_id
            .ok_or_else(|| CoreError::Fatal(format!("environment {environment_id} has no cluster_id")))?;
        self.store
            .get_cluster(cluster_id)
            .await?
            .ok_or_else(|| CoreError::Fatal(format!("cluster {cluster_id} not found")))
    }

    /// spec.md §4.8 step 3: parses the version's `spec_json` (written by
    /// `version::publish_service_version`) and injects `version=label`.
    async fn get_service_details(&self, version_id: Uuid) -> CoreResult<ServiceDetails> {
        let version = self
            .store
            .get_service_version(version_id)
            .await?
            .ok_or_else(|| CoreError::Fatal(format!("service version {version_id} not found")))?;

        let service_value = version
            .spec_json
            .get("service")
            .ok_or_else(|| CoreError::Fatal("version spec_json missing `service`".to_string()))?;
        let project_value = version
            .spec_json
            .get("project")
            .ok_or_else(|| CoreError::Fatal("version spec_json missing `project`".to_string()))?;
        let versioned_config = version
            .spec_json
            .get("versioned_config")
            .ok_or_else(|| CoreError::Fatal("version spec_json missing `versioned_config`".to_string()))?;

        let service_id = service_value
            .get("id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Uuid>().ok())
            .ok_or_else(|| CoreError::Fatal("version spec_json `service.id` missing or invalid".to_string()))?;
        let service_name = service_value
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let project_id = project_value
            .get("id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Uuid>().ok())
            .ok_or_else(|| CoreError::Fatal("version spec_json `project.id` missing or invalid".to_string()))?;
        let project_name = project_value
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let docker_image = versioned_config
            .get("docker_image")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let ports = versioned_config
            .get("ports")
            .and_then(parse_ports)
            .unwrap_or_default();

        let lane_id = self
            .store
            .get_config(ConfigParentScope::Service, service_id, "lane_id")
            .await?
            .and_then(|c| c.value);

        Ok(ServiceDetails {
            project_id,
            project_name,
            service_id,
            service_name,
            docker_image,
            ports,
            lane_id,
        })
    }

    /// Applies the object and polls it to readiness, per spec.md §4.8
    /// steps 5-11 ("skip if absent" — callers only invoke this for
    /// objects that exist in the rendered bundle).
    async fn apply_and_wait(&self, cluster: &KubernetesCluster, namespace: &str, object: &K8sObject) -> CoreResult<()> {
        let gateway = self.gateway_factory.build(cluster).await?;
        let _: ApplyOutcome = gateway.apply(object, namespace).await?;
        gateway.poll_ready(object, namespace, self.poll_timeout, self.poll_interval).await
    }
}

fn parse_ports(value: &serde_json::Value) -> Option<Vec<u16>> {
    value.as_array().map(|arr| {
        arr.iter()
            .filter_map(|entry| {
                entry
                    .get("containerPort")
                    .and_then(|p| p.as_u64())
                    .or_else(|| entry.as_u64())
                    .map(|p| p as u16)
            })
            .collect()
    })
}

#[async_trait]
impl Workflow for DeployWorkflow {
    fn name(&self) -> &'static str {
        "deploy_workflow"
    }

    async fn run(&self, ctx: &mut WorkflowCtx<'_>, args: serde_json::Value) -> Result<serde_json::Value, CoreError> {
        let args: DeployArgs = serde_json::from_value(args)
            .map_err(|e| CoreError::Invalid(format!("deploy_workflow args: {e}")))?;

        let deployment = ctx
            .step(DEPLOY_STEPS[0], || async {
                self.store
                    .get_deployment(args.deployment_id)
                    .await?
                    .ok_or_else(|| CoreError::NotFound(format!("deployment {}", args.deployment_id)))
            })
            .await?;

        let env_name = ctx
            .step(DEPLOY_STEPS[1], || async {
                match deployment.environment_id {
                    Some(env_id) => Ok(self
                        .store
                        .get_environment(env_id)
                        .await?
                        .map(|e| e.name)
                        .unwrap_or_default()),
                    None => Ok(String::new()),
                }
            })
            .await?;

        let version_id = deployment.version_id;
        let details = ctx
            .step(DEPLOY_STEPS[2], || async { self.get_service_details(version_id).await })
            .await?;

        let version = self
            .store
            .get_service_version(version_id)
            .await?
            .ok_or_else(|| CoreError::Fatal(format!("service version {version_id} missing during render")))?;
        let version_label = version.version_label;

        let downstream_overrides: Vec<render::DownstreamOverrideInput> = deployment
            .downstream_overrides_parsed()
            .into_iter()
            .map(|d| render::DownstreamOverrideInput {
                service_name: d.service_name,
                version: d.version,
            })
            .collect();

        let deployment_id = deployment.id;
        let domain = self.domain.clone();
        let bundle = ctx
            .step(DEPLOY_STEPS[3], || async {
                Ok(render::bundle(
                    &details,
                    &version_label,
                    deployment_id,
                    &env_name,
                    &downstream_overrides,
                    &domain.base_domain,
                    &domain.gateway_namespace,
                    &domain.gateway_name,
                ))
            })
            .await?;

        let cluster = self.cluster_for_environment(deployment.environment_id).await?;
        let namespace = bundle.namespace.name();

        ctx.step(DEPLOY_STEPS[4], || async {
            self.apply_and_wait(&cluster, &namespace, &bundle.namespace).await
        })
        .await?;

        ctx.step(DEPLOY_STEPS[5], || async {
            self.apply_and_wait(&cluster, &namespace, &bundle.service_account).await
        })
        .await?;

        ctx.step(DEPLOY_STEPS[6], || async {
            self.apply_and_wait(&cluster, &namespace, &bundle.deployment).await
        })
        .await?;

        ctx.step(DEPLOY_STEPS[7], || async {
            self.apply_and_wait(&cluster, &namespace, &bundle.service).await
        })
        .await?;

        ctx.step(DEPLOY_STEPS[8], || async {
            for rule in &bundle.destination_rules {
                self.apply_and_wait(&cluster, &namespace, rule).await?;
            }
            Ok(())
        })
        .await?;

        ctx.step(DEPLOY_STEPS[9], || async {
            for vs in &bundle.virtual_services_mesh {
                self.apply_and_wait(&cluster, &namespace, vs).await?;
            }
            Ok(())
        })
        .await?;

        ctx.step(DEPLOY_STEPS[10], || async {
            self.apply_and_wait(&cluster, &namespace, &bundle.virtual_service_ext).await
        })
        .await?;

        self.store
            .update_deployment_status(deployment.id, DeploymentStatus::Succeeded, Some(chrono::Utc::now()))
            .await?;

        Ok(serde_json::json!({"deployment_id": deployment.id, "namespace": namespace}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::fake::FakeGatewayFactory;
    use crate::model::*;
    use crate::store::memory::MemoryStore;
    use chrono::Utc;

    #[test]
    fn step_order_matches_spec() {
        assert_eq!(
            DEPLOY_STEPS,
            [
                "get_deployment",
                "get_environment_name",
                "get_service_details",
                "render_manifests",
                "create_namespace",
                "create_service_account",
                "create_deployment",
                "create_service",
                "create_destination_rule",
                "create_virtual_service_mesh",
                "create_virtual_service_ext",
            ]
        );
    }

    async fn seed(store: &MemoryStore) -> (Uuid, Uuid) {
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
        store.insert_project(project.clone());

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
        store.insert_cluster(cluster.clone());

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
        store.insert_environment(environment.clone());

        let service = Service {
            id: Uuid::new_v4(),
            name: "billing-api".into(),
            description: None,
            service_type: ServiceType::Microservice,
            project_id: project.id,
            owner: None,
            status: ServiceStatus::Unknown,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        };
        store.insert_service(service.clone());

        let spec_json = serde_json::json!({
            "service": {"id": service.id, "name": service.name},
            "project": {"id": project.id, "name": project.name},
            "versioned_config": {
                "docker_image": "nginx:1.26",
                "ports": [{"containerPort": 80}],
            },
            "variables": {},
            "secrets": {},
        });

        let version = store
            .create_service_version(service.id, "v1", "hash1", spec_json)
            .await
            .unwrap();

        let deployment = store
            .create_deployment(service.id, version.id, Some(environment.id), serde_json::json!([]), None)
            .await
            .unwrap();

        (deployment.id, environment.id)
    }

    #[tokio::test]
    async fn deploy_workflow_applies_all_objects_in_order() {
        let memory = MemoryStore::new();
        let (deployment_id, _env_id) = seed(&memory).await;
        let store: Arc<dyn Store> = Arc::new(memory);

        let workflow_uuid = Uuid::new_v4();
        store
            .create_workflow(workflow_uuid, "deploy_workflow", DeployWorkflow::enqueue_args(deployment_id), "default")
            .await
            .unwrap();

        let factory = Arc::new(FakeGatewayFactory::new());
        let workflow = DeployWorkflow::new(
            store.clone(),
            factory.clone(),
            DomainSettings::default(),
            Duration::from_secs(5),
            Duration::from_millis(1),
        );

        let mut ctx = WorkflowCtx::new(store.as_ref(), workflow_uuid);
        let out = workflow
            .run(&mut ctx, DeployWorkflow::enqueue_args(deployment_id))
            .await
            .unwrap();
        assert_eq!(out["deployment_id"], deployment_id.to_string());

        let applied_count = factory.gateway.applied.lock().unwrap().len();
        // namespace, service account, deployment, service, 1 destination rule, 0 mesh vs, 1 ext vs
        assert_eq!(applied_count, 6);

        let deployment = store.get_deployment(deployment_id).await.unwrap().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Succeeded);
    }
}
