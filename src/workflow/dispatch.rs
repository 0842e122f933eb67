//! Scheduler/Dispatcher (spec §4.10): durable enqueue plus a background
//! poll loop that drives registered workflows to completion.
//!
//! Grounded on the teacher's `reconcile_loop`/`health_check_loop` shape
//! (`tokio::spawn` + `tokio::time::interval`, graceful shutdown via a
//! cancellation signal) rather than a push-based executor.

use crate::error::{CoreError, CoreResult};
use crate::model::{ConfigParentScope, WorkflowStatus};
use crate::store::Store;
use crate::workflow::{Workflow, WorkflowCtx};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

const DOMAIN_INFO_KEY: &str = "domain_info";

/// `HashMap<&'static str, Arc<dyn Workflow>>` registry populated at startup
/// from `DeployWorkflow` and `SubdomainWorkflow`.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    registry: HashMap<&'static str, Arc<dyn Workflow>>,
    queue_name: String,
    semaphore: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, queue_name: impl Into<String>, queue_capacity: usize) -> Self {
        Self {
            store,
            registry: HashMap::new(),
            queue_name: queue_name.into(),
            semaphore: Arc::new(Semaphore::new(queue_capacity.max(1))),
        }
    }

    pub fn register(&mut self, workflow: Arc<dyn Workflow>) {
        self.registry.insert(workflow.name(), workflow);
    }

    /// spec.md §4.10: persists the workflow record before returning the id.
    pub async fn enqueue(&self, workflow_name: &str, args: serde_json::Value) -> CoreResult<Uuid> {
        if !self.registry.contains_key(workflow_name) {
            return Err(CoreError::Invalid(format!("unknown workflow `{workflow_name}`")));
        }
        let workflow_uuid = Uuid::new_v4();
        self.store.create_workflow(workflow_uuid, workflow_name, args, &self.queue_name).await?;
        Ok(workflow_uuid)
    }

    /// spec.md §4.9: the mutation that starts `setup_env_subdomain` MUST
    /// persist the returned `workflow_uuid` onto the
    /// `EnvironmentConfig(key="domain_info")` row.
    pub async fn enqueue_subdomain_workflow(&self, environment_id: Uuid) -> CoreResult<Uuid> {
        let workflow_uuid = self
            .enqueue(
                "setup_env_subdomain",
                crate::workflow::subdomain::SubdomainWorkflow::enqueue_args(environment_id),
            )
            .await?;

        let config = self
            .store
            .upsert_config(ConfigParentScope::Environment, environment_id, DOMAIN_INFO_KEY, None, None)
            .await?;
        self.store.set_config_workflow_uuid(config.id, workflow_uuid).await?;

        Ok(workflow_uuid)
    }

    /// Drives one enqueued workflow to completion: transitions it to
    /// `running`, runs the body, and records `succeeded`/`failed`.
    async fn drive(store: Arc<dyn Store>, workflow: Arc<dyn Workflow>, workflow_uuid: Uuid, inputs: serde_json::Value) {
        if let Err(e) = store.update_workflow_status(workflow_uuid, WorkflowStatus::Running, None).await {
            error!(%workflow_uuid, error = %e, "failed to mark workflow running");
            return;
        }

        let mut ctx = WorkflowCtx::new(store.as_ref(), workflow_uuid);
        match workflow.run(&mut ctx, inputs).await {
            Ok(_) => {
                if let Err(e) = store.update_workflow_status(workflow_uuid, WorkflowStatus::Succeeded, None).await {
                    error!(%workflow_uuid, error = %e, "failed to mark workflow succeeded");
                }
            }
            Err(CoreError::Cancelled(msg)) => {
                info!(%workflow_uuid, %msg, "workflow cancelled");
            }
            Err(e) => {
                warn!(%workflow_uuid, error = %e, "workflow failed");
                if let Err(e) = store
                    .update_workflow_status(workflow_uuid, WorkflowStatus::Failed, Some(e.to_string()))
                    .await
                {
                    error!(%workflow_uuid, error = %e, "failed to mark workflow failed");
                }
            }
        }
    }

    /// One poll tick: claims up to semaphore capacity of `enqueued` rows
    /// and spawns each onto its own task.
    async fn tick(&self) {
        let available = self.semaphore.available_permits();
        if available == 0 {
            return;
        }
        let candidates = match self.store.list_enqueued_workflows(&self.queue_name, available as i64).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "failed to list enqueued workflows");
                return;
            }
        };

        for record in candidates {
            let Some(workflow) = self.registry.get(record.name.as_str()).cloned() else {
                error!(name = %record.name, "no registered workflow for enqueued row");
                continue;
            };
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                break;
            };
            let store = self.store.clone();
            tokio::spawn(async move {
                let _permit = permit;
                Self::drive(store, workflow, record.workflow_uuid, record.inputs).await;
            });
        }
    }

    /// Background loop, grounded on the teacher's `reconcile_loop`: polls
    /// on `interval` until `shutdown` resolves.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("dispatcher shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::fake::FakeGatewayFactory;
    use crate::model::*;
    use crate::settings::DomainSettings;
    use crate::store::memory::MemoryStore;
    use crate::workflow::deploy::DeployWorkflow;
    use chrono::Utc;

    #[tokio::test]
    async fn enqueue_persists_row_before_returning() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut dispatcher = Dispatcher::new(store.clone(), "default", 4);
        let factory: Arc<dyn crate::k8s::GatewayFactory> = Arc::new(FakeGatewayFactory::new());
        dispatcher.register(Arc::new(DeployWorkflow::new(
            store.clone(),
            factory,
            DomainSettings::default(),
            Duration::from_secs(1),
            Duration::from_millis(1),
        )));

        let workflow_uuid = dispatcher
            .enqueue("deploy_workflow", DeployWorkflow::enqueue_args(Uuid::new_v4()))
            .await
            .unwrap();

        let record = store.get_workflow(workflow_uuid).await.unwrap().unwrap();
        assert_eq!(record.status, WorkflowStatus::Enqueued);
    }

    #[tokio::test]
    async fn enqueue_unknown_workflow_is_rejected() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new(store, "default", 4);
        let result = dispatcher.enqueue("not_a_real_workflow", serde_json::json!({})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn subdomain_enqueue_writes_workflow_uuid_onto_domain_info() {
        let memory = MemoryStore::new();
        let project = Project {
            id: Uuid::new_v4(),
            name: "Acme".into(),
            description: None,
            owner_id: Uuid::new_v4(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        };
        memory.insert_project(project.clone());
        let environment = Environment {
            id: Uuid::new_v4(),
            name: "qa".into(),
            env_type: EnvironmentType::Testing,
            url: None,
            project_id: project.id,
            cluster_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        };
        memory.insert_environment(environment.clone());

        let store: Arc<dyn Store> = Arc::new(memory);
        let mut dispatcher = Dispatcher::new(store.clone(), "default", 4);
        dispatcher.register(Arc::new(crate::workflow::subdomain::SubdomainWorkflow::new(
            store.clone(),
            Arc::new(FakeGatewayFactory::new()),
            DomainSettings::default(),
        )));

        let workflow_uuid = dispatcher.enqueue_subdomain_workflow(environment.id).await.unwrap();

        let config = store
            .get_config(ConfigParentScope::Environment, environment.id, "domain_info")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(config.workflow_uuid, Some(workflow_uuid));
    }
}
