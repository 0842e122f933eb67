//! K8s Gateway (spec §4.6). Builds an authenticated client from a
//! `KubernetesCluster` row, applies manifests with server-side-apply +
//! strategic-merge fallback, and polls resources to readiness.
//!
//! Client construction is grounded on the teacher's
//! `kube::Config::new(url)` / `kube::Client::try_from(config)` pattern
//! (`kubernetes.rs::create_mock_controller`), extended here to cover all
//! four auth methods spec §4.6 requires.

use crate::encryption::Encryptor;
use crate::error::{CoreError, CoreResult};
use crate::model::{AuthMethod, KubernetesCluster};
use crate::render::K8sObject;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment as K8sDeployment;
use k8s_openapi::api::core::v1::{Namespace, Service as K8sService, ServiceAccount};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, Config};
use std::sync::Arc;
use std::time::Duration;

pub enum ApplyOutcome {
    Applied,
    Patched,
}

/// The subset of gateway behavior the Deployment Orchestrator and
/// Environment-Subdomain Orchestrator depend on — a trait so tests can
/// substitute `FakeGateway` (spec §8, grounded on the teacher's
/// `create_mock_controller` fake pattern).
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn apply(&self, object: &K8sObject, fallback_namespace: &str) -> CoreResult<ApplyOutcome>;
    async fn poll_ready(&self, object: &K8sObject, fallback_namespace: &str, timeout: Duration, interval: Duration) -> CoreResult<()>;
}

pub struct K8sGateway {
    client: Client,
}

impl K8sGateway {
    /// spec §4.6: builds a client per `auth_method`, decrypting credentials
    /// on demand. Credential material is held in the `kube::Config` fields
    /// directly (`client_certificate_data`, `client_key_data`) rather than
    /// written to disk, and is dropped along with the `Config` once the
    /// `Client` is built.
    pub async fn for_cluster(cluster: &KubernetesCluster, encryptor: &dyn Encryptor) -> CoreResult<Self> {
        install_rustls_provider();

        let url = cluster
            .api_url
            .parse()
            .map_err(|e| CoreError::Invalid(format!("cluster {} has an invalid api_url: {e}", cluster.name)))?;

        let mut config = Config::new(url);

        match cluster.auth_method {
            AuthMethod::Kubeconfig => {
                let raw = cluster
                    .kubeconfig_content
                    .as_deref()
                    .ok_or_else(|| CoreError::Invalid("kubeconfig cluster missing kubeconfig_content".to_string()))?;
                let decrypted = encryptor.decrypt(raw).await?;
                let kubeconfig = kube::config::Kubeconfig::from_yaml(&decrypted)
                    .map_err(|e| CoreError::Invalid(format!("invalid kubeconfig: {e}")))?;
                config = Config::from_custom_kubeconfig(kubeconfig, &kube::config::KubeConfigOptions::default())
                    .await
                    .map_err(|e| CoreError::Unavailable(format!("failed to build client config from kubeconfig: {e}")))?;
            }
            AuthMethod::Token | AuthMethod::ServiceAccount => {
                let raw = cluster
                    .token
                    .as_deref()
                    .ok_or_else(|| CoreError::Invalid(format!("{:?} cluster missing token", cluster.auth_method)))?;
                let decrypted = encryptor.decrypt(raw).await?;
                config.auth_info.token = Some(decrypted.into());
            }
            AuthMethod::ClientCert => {
                let (client_cert, client_key, ca_cert) = (
                    cluster.client_cert.as_deref(),
                    cluster.client_key.as_deref(),
                    cluster.client_ca_cert.as_deref(),
                );
                let (client_cert, client_key) = match (client_cert, client_key) {
                    (Some(c), Some(k)) => (c, k),
                    _ => return Err(CoreError::Invalid("clientCert cluster missing client_cert/client_key".to_string())),
                };
                let client_cert = encryptor.decrypt(client_cert).await?;
                let client_key = encryptor.decrypt(client_key).await?;
                config.auth_info.client_certificate_data = Some(client_cert);
                config.auth_info.client_key_data = Some(client_key.into());
                if let Some(ca) = ca_cert {
                    let ca = encryptor.decrypt(ca).await?;
                    config.root_cert = Some(vec![ca.into_bytes()]);
                }
            }
        }

        let client = Client::try_from(config)
            .map_err(|e| CoreError::Unavailable(format!("failed to build kube client for cluster {}: {e}", cluster.name)))?;

        Ok(Self { client })
    }

    #[cfg(test)]
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

/// Constructs a `Gateway` per call, per §5's "never shared across steps"
/// rule — the Deployment Orchestrator depends on this trait rather than
/// calling `K8sGateway::for_cluster` directly so tests can substitute a
/// factory that hands out one shared `FakeGateway` instance.
#[async_trait]
pub trait GatewayFactory: Send + Sync {
    async fn build(&self, cluster: &KubernetesCluster) -> CoreResult<Arc<dyn Gateway>>;
}

pub struct RealGatewayFactory {
    pub encryptor: Arc<dyn Encryptor>,
}

#[async_trait]
impl GatewayFactory for RealGatewayFactory {
    async fn build(&self, cluster: &KubernetesCluster) -> CoreResult<Arc<dyn Gateway>> {
        let gateway = K8sGateway::for_cluster(cluster, self.encryptor.as_ref()).await?;
        Ok(Arc::new(gateway))
    }
}

fn install_rustls_provider() {
    rustls::crypto::ring::default_provider().install_default().ok();
}

const FIELD_MANAGER: &str = "env360";

#[async_trait]
impl Gateway for K8sGateway {
    async fn apply(&self, object: &K8sObject, fallback_namespace: &str) -> CoreResult<ApplyOutcome> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let result = match object {
            K8sObject::Namespace(ns) => {
                let api: Api<Namespace> = Api::all(self.client.clone());
                api.patch(&object.name(), &params, &Patch::Apply(ns)).await.map(|_| ())
            }
            K8sObject::ServiceAccount(sa) => {
                let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), fallback_namespace);
                api.patch(&object.name(), &params, &Patch::Apply(sa)).await.map(|_| ())
            }
            K8sObject::Deployment(d) => {
                let api: Api<K8sDeployment> = Api::namespaced(self.client.clone(), fallback_namespace);
                api.patch(&object.name(), &params, &Patch::Apply(d)).await.map(|_| ())
            }
            K8sObject::Service(s) => {
                let api: Api<K8sService> = Api::namespaced(self.client.clone(), fallback_namespace);
                api.patch(&object.name(), &params, &Patch::Apply(s)).await.map(|_| ())
            }
            K8sObject::Unstructured(u) => {
                return self.apply_unstructured(u, fallback_namespace).await;
            }
        };

        match result {
            Ok(()) => Ok(ApplyOutcome::Applied),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                self.strategic_merge_fallback(object, fallback_namespace).await?;
                Ok(ApplyOutcome::Patched)
            }
            Err(e) => Err(CoreError::Unavailable(format!("apply failed for {}: {e}", object.name()))),
        }
    }

    async fn poll_ready(
        &self,
        object: &K8sObject,
        fallback_namespace: &str,
        timeout: Duration,
        interval: Duration,
    ) -> CoreResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut ticker = tokio::time::interval(interval);
        loop {
            // A GET failure mid-poll (eventual-consistency 404 right after
            // apply, a transient connection blip) means "not ready yet",
            // not "give up" — only the deadline ends the loop.
            let ready = self.is_ready(object, fallback_namespace).await.unwrap_or(false);
            if ready {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::Unavailable(format!(
                    "timed out waiting for {} to become ready",
                    object.name()
                )));
            }
            ticker.tick().await;
        }
    }
}

impl K8sGateway {
    async fn apply_unstructured(
        &self,
        object: &crate::render::UnstructuredObject,
        fallback_namespace: &str,
    ) -> CoreResult<ApplyOutcome> {
        use kube::core::DynamicObject;
        use kube::discovery::ApiResource;

        let gvk = parse_gvk(&object.api_version, &object.kind);
        let ar = ApiResource::from_gvk(&gvk);
        let namespace = object.metadata.namespace.as_deref().unwrap_or(fallback_namespace);
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);

        let mut dyn_obj = DynamicObject::new(&object.metadata.name, &ar);
        dyn_obj.data = serde_json::json!({ "spec": object.spec });
        dyn_obj.metadata.labels = Some(object.metadata.labels.clone());
        if !object.metadata.annotations.is_empty() {
            dyn_obj.metadata.annotations = Some(object.metadata.annotations.clone());
        }

        let params = PatchParams::apply(FIELD_MANAGER).force();
        match api.patch(&object.metadata.name, &params, &Patch::Apply(&dyn_obj)).await {
            Ok(_) => Ok(ApplyOutcome::Applied),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                api.patch(&object.metadata.name, &PatchParams::default(), &Patch::Strategic(&dyn_obj))
                    .await
                    .map_err(|e| CoreError::Unavailable(format!("strategic merge failed for {}: {e}", object.metadata.name)))?;
                Ok(ApplyOutcome::Patched)
            }
            Err(e) => Err(CoreError::Unavailable(format!("apply failed for {}: {e}", object.metadata.name))),
        }
    }

    async fn strategic_merge_fallback(&self, object: &K8sObject, fallback_namespace: &str) -> CoreResult<()> {
        let params = PatchParams::default();
        let result = match object {
            K8sObject::Namespace(ns) => {
                let api: Api<Namespace> = Api::all(self.client.clone());
                api.patch(&object.name(), &params, &Patch::Strategic(ns)).await.map(|_| ())
            }
            K8sObject::ServiceAccount(sa) => {
                let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), fallback_namespace);
                api.patch(&object.name(), &params, &Patch::Strategic(sa)).await.map(|_| ())
            }
            K8sObject::Deployment(d) => {
                let api: Api<K8sDeployment> = Api::namespaced(self.client.clone(), fallback_namespace);
                api.patch(&object.name(), &params, &Patch::Strategic(d)).await.map(|_| ())
            }
            K8sObject::Service(s) => {
                let api: Api<K8sService> = Api::namespaced(self.client.clone(), fallback_namespace);
                api.patch(&object.name(), &params, &Patch::Strategic(s)).await.map(|_| ())
            }
            K8sObject::Unstructured(_) => return Ok(()),
        };
        result.map_err(|e| CoreError::Unavailable(format!("strategic merge failed for {}: {e}", object.name())))
    }

    async fn is_ready(&self, object: &K8sObject, fallback_namespace: &str) -> CoreResult<bool> {
        match object {
            K8sObject::Namespace(_) => {
                let api: Api<Namespace> = Api::all(self.client.clone());
                let ns = api.get(&object.name()).await.map_err(map_get_err)?;
                Ok(ns.status.and_then(|s| s.phase).as_deref() == Some("Active"))
            }
            K8sObject::ServiceAccount(_) => {
                let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), fallback_namespace);
                Ok(api.get(&object.name()).await.is_ok())
            }
            K8sObject::Deployment(_) => {
                let api: Api<K8sDeployment> = Api::namespaced(self.client.clone(), fallback_namespace);
                let dep = api.get(&object.name()).await.map_err(map_get_err)?;
                let spec_replicas = dep.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                let status = dep.status.unwrap_or_default();
                Ok(status.available_replicas.unwrap_or(0) >= spec_replicas
                    && status.updated_replicas.unwrap_or(0) >= spec_replicas
                    && status.ready_replicas.unwrap_or(0) >= spec_replicas)
            }
            K8sObject::Service(_) => {
                let api: Api<K8sService> = Api::namespaced(self.client.clone(), fallback_namespace);
                let svc = api.get(&object.name()).await.map_err(map_get_err)?;
                let is_lb = svc.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some("LoadBalancer");
                if is_lb {
                    Ok(svc
                        .status
                        .and_then(|s| s.load_balancer)
                        .and_then(|lb| lb.ingress)
                        .map(|ingress| !ingress.is_empty())
                        .unwrap_or(false))
                } else {
                    Ok(svc
                        .spec
                        .and_then(|s| s.cluster_ip)
                        .map(|ip| ip != "None")
                        .unwrap_or(false))
                }
            }
            K8sObject::Unstructured(u) => match u.kind.as_str() {
                "HTTPRoute" | "VirtualService" | "Gateway" | "Ingress" => {
                    use kube::core::DynamicObject;
                    use kube::discovery::ApiResource;
                    let gvk = parse_gvk(&u.api_version, &u.kind);
                    let ar = ApiResource::from_gvk(&gvk);
                    let namespace = u.metadata.namespace.as_deref().unwrap_or(fallback_namespace);
                    let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
                    Ok(api.get(&u.metadata.name).await.is_ok())
                }
                _ => Ok(true),
            },
        }
    }
}

fn parse_gvk(api_version: &str, kind: &str) -> kube::core::GroupVersionKind {
    match api_version.split_once('/') {
        Some((group, version)) => kube::core::GroupVersionKind::gvk(group, version, kind),
        None => kube::core::GroupVersionKind::gvk("", api_version, kind),
    }
}

fn map_get_err(e: kube::Error) -> CoreError {
    CoreError::Unavailable(format!("get failed: {e}"))
}

/// spec §4.6 `checkReadyz`: unauthenticated GET `/readyz`.
pub async fn check_readyz(api_url: &str) -> CoreResult<()> {
    let url = format!("{}/readyz", api_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| CoreError::Fatal(format!("failed to build http client: {e}")))?;
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| CoreError::Unavailable(format!("readyz request failed: {e}")))?;
    let status_ok = response.status().is_success();
    let body = response
        .text()
        .await
        .map_err(|e| CoreError::Unavailable(format!("readyz body read failed: {e}")))?;
    if status_ok && body.contains("ok") {
        Ok(())
    } else {
        Err(CoreError::Unavailable(format!("cluster readyz check failed: {body}")))
    }
}

/// spec §4.6 `checkConnection`: authenticated call using decrypted creds.
pub async fn check_connection(cluster: &KubernetesCluster, encryptor: &dyn Encryptor) -> CoreResult<()> {
    let gateway = K8sGateway::for_cluster(cluster, encryptor).await?;
    let api: Api<Namespace> = Api::all(gateway.client.clone());
    api.list(&Default::default())
        .await
        .map(|_| ())
        .map_err(|e| CoreError::Unavailable(format!("connection check failed: {e}")))
}

/// Test double for the Deployment/Subdomain Orchestrators (spec §8),
/// grounded on the teacher's `create_mock_controller` fake pattern: records
/// every call and always reports ready.
#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeGateway {
        pub applied: Mutex<Vec<String>>,
        pub polled: Mutex<Vec<String>>,
    }

    impl FakeGateway {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Gateway for FakeGateway {
        async fn apply(&self, object: &K8sObject, _fallback_namespace: &str) -> CoreResult<ApplyOutcome> {
            self.applied.lock().unwrap().push(object.name());
            Ok(ApplyOutcome::Applied)
        }

        async fn poll_ready(
            &self,
            object: &K8sObject,
            _fallback_namespace: &str,
            _timeout: Duration,
            _interval: Duration,
        ) -> CoreResult<()> {
            self.polled.lock().unwrap().push(object.name());
            Ok(())
        }
    }

    /// Hands out the same `FakeGateway` on every `build` call so a test can
    /// inspect all recorded applies/polls across an entire workflow run.
    pub struct FakeGatewayFactory {
        pub gateway: Arc<FakeGateway>,
    }

    impl FakeGatewayFactory {
        pub fn new() -> Self {
            Self {
                gateway: Arc::new(FakeGateway::new()),
            }
        }
    }

    impl Default for FakeGatewayFactory {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl GatewayFactory for FakeGatewayFactory {
        async fn build(&self, _cluster: &KubernetesCluster) -> CoreResult<Arc<dyn Gateway>> {
            Ok(self.gateway.clone())
        }
    }
}
