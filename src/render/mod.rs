//! Manifest Renderer (spec §4.5): a deterministic, side-effect-free function
//! from domain objects to Kubernetes manifests. Grounded on the teacher's
//! `kubernetes.rs` object-builder style (`ObjectMeta`/`LabelSelector`
//! literals with `..Default::default()`); Istio/Gateway-API/cert-manager
//! kinds use the generic `UnstructuredObject` shape (spec §9's design note)
//! since `k8s-openapi` doesn't model those CRDs.

use k8s_openapi::api::apps::v1::{Deployment as K8sDeployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, Namespace, PodSpec, PodTemplateSpec, Service as K8sService, ServiceAccount,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A GVK env360 doesn't have a typed `k8s-openapi` model for (Istio
/// DestinationRule/VirtualService, Gateway API HTTPRoute/Gateway,
/// cert-manager Certificate) — spec §9's "duck-typed manifest" design note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnstructuredObject {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: UnstructuredMeta,
    pub spec: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UnstructuredMeta {
    pub name: String,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "objectKind")]
#[allow(clippy::large_enum_variant)]
pub enum K8sObject {
    Namespace(Namespace),
    ServiceAccount(ServiceAccount),
    Deployment(K8sDeployment),
    Service(K8sService),
    Unstructured(UnstructuredObject),
}

impl K8sObject {
    pub fn name(&self) -> String {
        match self {
            K8sObject::Namespace(o) => o.metadata.name.clone().unwrap_or_default(),
            K8sObject::ServiceAccount(o) => o.metadata.name.clone().unwrap_or_default(),
            K8sObject::Deployment(o) => o.metadata.name.clone().unwrap_or_default(),
            K8sObject::Service(o) => o.metadata.name.clone().unwrap_or_default(),
            K8sObject::Unstructured(o) => o.metadata.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamOverrideInput {
    pub service_name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDetails {
    pub project_id: Uuid,
    pub project_name: String,
    pub service_id: Uuid,
    pub service_name: String,
    pub docker_image: String,
    pub ports: Vec<u16>,
    pub lane_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestBundle {
    pub namespace: K8sObject,
    pub service_account: K8sObject,
    pub deployment: K8sObject,
    pub service: K8sObject,
    pub destination_rules: Vec<K8sObject>,
    pub virtual_services_mesh: Vec<K8sObject>,
    pub virtual_service_ext: K8sObject,
    pub route: K8sObject,
}

/// spec §4.5's normalization rule: lowercase; `/`, `_`, ` ` → `-`.
pub fn normalize(raw: &str) -> String {
    raw.to_lowercase().replace(['/', '_', ' '], "-")
}

fn namespace_name(project_id: Uuid) -> String {
    format!("proj-{}", normalize(&project_id.to_string()))
}

fn workload_name(service_name: &str, version_label: &str) -> String {
    format!("{}-{}", normalize(service_name), normalize(version_label))
}

/// The canonical label set every object carries (spec §4.5).
fn canonical_labels(details: &ServiceDetails, deployment_id: Uuid) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/part-of".to_string(), "env360".to_string());
    labels.insert("managed-by".to_string(), "env360".to_string());
    labels.insert("project-id".to_string(), details.project_id.to_string());
    labels.insert("project-name".to_string(), normalize(&details.project_name));
    labels.insert("deployment-id".to_string(), deployment_id.to_string());
    labels
}

/// Additional labels attached only to workload/service/service-account
/// objects, layered on top of `canonical_labels`.
fn workload_labels(details: &ServiceDetails, version_label: &str, deployment_id: Uuid) -> BTreeMap<String, String> {
    let mut labels = canonical_labels(details, deployment_id);
    labels.insert(
        "app".to_string(),
        format!("{}-{}", normalize(&details.service_name), normalize(version_label)),
    );
    labels.insert("version".to_string(), normalize(version_label));
    labels.insert("service-id".to_string(), details.service_id.to_string());
    labels.insert("service-name".to_string(), normalize(&details.service_name));
    if let Some(lane) = &details.lane_id {
        labels.insert("lane".to_string(), normalize(lane));
    }
    labels
}

/// spec §4.5: `Deployment.spec.selector.matchLabels` and `Service.spec.selector`
/// MUST use exactly these five keys.
fn selector_labels(details: &ServiceDetails, version_label: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("service-id".to_string(), details.service_id.to_string());
    labels.insert("service-name".to_string(), normalize(&details.service_name));
    labels.insert("version".to_string(), normalize(version_label));
    labels.insert("project-id".to_string(), details.project_id.to_string());
    labels.insert("project-name".to_string(), normalize(&details.project_name));
    labels
}

fn render_namespace(details: &ServiceDetails, deployment_id: Uuid) -> K8sObject {
    K8sObject::Namespace(Namespace {
        metadata: ObjectMeta {
            name: Some(namespace_name(details.project_id)),
            labels: Some(canonical_labels(details, deployment_id)),
            ..Default::default()
        },
        ..Default::default()
    })
}

fn render_service_account(details: &ServiceDetails, version_label: &str, namespace: &str, deployment_id: Uuid) -> K8sObject {
    K8sObject::ServiceAccount(ServiceAccount {
        metadata: ObjectMeta {
            name: Some(workload_name(&details.service_name, version_label)),
            namespace: Some(namespace.to_string()),
            labels: Some(workload_labels(details, version_label, deployment_id)),
            ..Default::default()
        },
        ..Default::default()
    })
}

fn render_deployment(
    details: &ServiceDetails,
    version_label: &str,
    namespace: &str,
    deployment_id: Uuid,
) -> K8sObject {
    let name = workload_name(&details.service_name, version_label);
    let selector = selector_labels(details, version_label);
    let labels = workload_labels(details, version_label, deployment_id);

    K8sObject::Deployment(K8sDeployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            annotations: Some(BTreeMap::from([(
                "env360.dev/deployment-id".to_string(),
                deployment_id.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    name: Some(name.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(name.clone()),
                    containers: vec![Container {
                        name: "app".to_string(),
                        image: Some(details.docker_image.clone()),
                        ports: Some(
                            details
                                .ports
                                .iter()
                                .map(|p| ContainerPort {
                                    container_port: *p as i32,
                                    ..Default::default()
                                })
                                .collect(),
                        ),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

fn render_service(details: &ServiceDetails, version_label: &str, namespace: &str, deployment_id: Uuid) -> K8sObject {
    let name = workload_name(&details.service_name, version_label);
    let selector = selector_labels(details, version_label);

    K8sObject::Service(K8sService {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(workload_labels(details, version_label, deployment_id)),
            annotations: Some(BTreeMap::from([(
                "env360.dev/deployment-id".to_string(),
                deployment_id.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector),
            ports: Some(
                details
                    .ports
                    .iter()
                    .enumerate()
                    .map(|(i, p)| ServicePort {
                        name: Some(format!("port-{i}")),
                        port: *p as i32,
                        target_port: Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(*p as i32)),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    })
}

fn destination_rule(
    host: &str,
    name: &str,
    namespace: &str,
    subset_name: &str,
    labels: &BTreeMap<String, String>,
) -> K8sObject {
    K8sObject::Unstructured(UnstructuredObject {
        api_version: "networking.istio.io/v1beta1".to_string(),
        kind: "DestinationRule".to_string(),
        metadata: UnstructuredMeta {
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
            labels: labels.clone(),
            annotations: BTreeMap::new(),
        },
        spec: serde_json::json!({
            "host": host,
            "subsets": [{"name": subset_name, "labels": {"version": subset_name}}],
        }),
    })
}

fn virtual_service_mesh(
    details: &ServiceDetails,
    version_label: &str,
    namespace: &str,
    downstream: &DownstreamOverrideInput,
) -> K8sObject {
    let source_app = format!("{}-{}", normalize(&details.service_name), normalize(version_label));
    let mut source_labels = serde_json::json!({"app": source_app, "version": normalize(version_label)});
    if let Some(lane) = &details.lane_id {
        source_labels["lane"] = serde_json::Value::String(normalize(lane));
    }
    let host = normalize(&downstream.service_name);
    K8sObject::Unstructured(UnstructuredObject {
        api_version: "networking.istio.io/v1beta1".to_string(),
        kind: "VirtualService".to_string(),
        metadata: UnstructuredMeta {
            name: format!("{}-{}-mesh", normalize(&details.service_name), host),
            namespace: Some(namespace.to_string()),
            labels: canonical_labels(details, Uuid::nil()),
            annotations: BTreeMap::new(),
        },
        spec: serde_json::json!({
            "hosts": [host],
            "http": [{
                "match": [{"sourceLabels": source_labels}],
                "route": [{"destination": {"host": host, "subset": normalize(&downstream.version)}}],
            }],
        }),
    })
}

fn virtual_service_ext(
    details: &ServiceDetails,
    version_label: &str,
    namespace: &str,
    env_name: &str,
    base_domain: &str,
    gateway_namespace: &str,
    gateway_name: &str,
) -> K8sObject {
    let prefix = format!(
        "/{}/{}/{}/{}",
        normalize(&details.project_name),
        normalize(env_name),
        normalize(&details.service_name),
        normalize(version_label)
    );
    let host = workload_name(&details.service_name, version_label);
    let port = details.ports.first().copied().unwrap_or(80);

    K8sObject::Unstructured(UnstructuredObject {
        api_version: "networking.istio.io/v1beta1".to_string(),
        kind: "VirtualService".to_string(),
        metadata: UnstructuredMeta {
            name: format!("{host}-ext"),
            namespace: Some(namespace.to_string()),
            labels: canonical_labels(details, Uuid::nil()),
            annotations: BTreeMap::new(),
        },
        spec: serde_json::json!({
            "hosts": [base_domain],
            "gateways": [format!("{gateway_namespace}/{gateway_name}")],
            "http": [{
                "match": [{"uri": {"prefix": prefix}}],
                "route": [{"destination": {"host": host, "port": {"number": port}}}],
            }],
        }),
    })
}

fn http_route(
    details: &ServiceDetails,
    version_label: &str,
    namespace: &str,
    env_name: &str,
    base_domain: &str,
) -> K8sObject {
    let prefix = format!(
        "/{}/{}/{}/{}",
        normalize(&details.project_name),
        normalize(env_name),
        normalize(&details.service_name),
        normalize(version_label)
    );
    let host = workload_name(&details.service_name, version_label);
    let port = details.ports.first().copied().unwrap_or(80);

    K8sObject::Unstructured(UnstructuredObject {
        api_version: "gateway.networking.k8s.io/v1".to_string(),
        kind: "HTTPRoute".to_string(),
        metadata: UnstructuredMeta {
            name: format!("{host}-route"),
            namespace: Some(namespace.to_string()),
            labels: canonical_labels(details, Uuid::nil()),
            annotations: BTreeMap::new(),
        },
        spec: serde_json::json!({
            "hostnames": [base_domain],
            "rules": [{
                "matches": [{"path": {"type": "PathPrefix", "value": prefix}}],
                "backendRefs": [{"name": host, "port": port}],
            }],
        }),
    })
}

/// spec §4.5: the full `bundle()` function.
#[allow(clippy::too_many_arguments)]
pub fn bundle(
    details: &ServiceDetails,
    version_label: &str,
    deployment_id: Uuid,
    env_name: &str,
    downstream_overrides: &[DownstreamOverrideInput],
    base_domain: &str,
    gateway_namespace: &str,
    gateway_name: &str,
) -> ManifestBundle {
    let namespace = namespace_name(details.project_id);

    let mut destination_rules = vec![destination_rule(
        &workload_name(&details.service_name, version_label),
        &format!("{}-dest-rule", normalize(&details.service_name)),
        &namespace,
        &normalize(version_label),
        &canonical_labels(details, deployment_id),
    )];
    for downstream in downstream_overrides {
        destination_rules.push(destination_rule(
            &normalize(&downstream.service_name),
            &format!("{}-dest-rule", normalize(&downstream.service_name)),
            &namespace,
            &normalize(&downstream.version),
            &canonical_labels(details, deployment_id),
        ));
    }

    let virtual_services_mesh = downstream_overrides
        .iter()
        .map(|d| virtual_service_mesh(details, version_label, &namespace, d))
        .collect();

    ManifestBundle {
        namespace: render_namespace(details, deployment_id),
        service_account: render_service_account(details, version_label, &namespace, deployment_id),
        deployment: render_deployment(details, version_label, &namespace, deployment_id),
        service: render_service(details, version_label, &namespace, deployment_id),
        destination_rules,
        virtual_services_mesh,
        virtual_service_ext: virtual_service_ext(
            details,
            version_label,
            &namespace,
            env_name,
            base_domain,
            gateway_namespace,
            gateway_name,
        ),
        route: http_route(details, version_label, &namespace, env_name, base_domain),
    }
}

/// Environment-Subdomain renderer (spec §4.5 last paragraph): Certificate +
/// Gateway for a (project, environment) pair.
pub struct EnvironmentSubdomainInputs {
    pub project_name: String,
    pub env_name: String,
    pub base_domain: String,
    pub cert_namespace: String,
    pub issuer_name: String,
    pub cert_duration_hours: u32,
    pub cert_renew_before_hours: u32,
    pub gateway_name: String,
    pub gateway_namespace: String,
    pub gateway_class_name: String,
    /// Additional SANs for environments with bound custom domains
    /// (supplemented from `original_source/`; additive, doesn't change the
    /// two-listener baseline unless non-empty).
    pub extra_sans: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSubdomainBundle {
    pub certificate: K8sObject,
    pub gateway: K8sObject,
}

pub fn render_environment_subdomain(inputs: &EnvironmentSubdomainInputs) -> EnvironmentSubdomainBundle {
    let env = normalize(&inputs.env_name);
    let project = normalize(&inputs.project_name);
    let exact_host = format!("{env}.{project}.{}", inputs.base_domain);
    let wildcard_host = format!("*.{env}.{project}.{}", inputs.base_domain);
    let secret_name = format!("{env}-{project}-tls");

    let mut dns_names = vec![exact_host.clone(), wildcard_host.clone()];
    dns_names.extend(inputs.extra_sans.iter().cloned());

    let certificate = K8sObject::Unstructured(UnstructuredObject {
        api_version: "cert-manager.io/v1".to_string(),
        kind: "Certificate".to_string(),
        metadata: UnstructuredMeta {
            name: format!("{env}-{project}-cert"),
            namespace: Some(inputs.cert_namespace.clone()),
            labels: BTreeMap::from([
                ("app.kubernetes.io/part-of".to_string(), "env360".to_string()),
                ("managed-by".to_string(), "env360".to_string()),
            ]),
            annotations: BTreeMap::new(),
        },
        spec: serde_json::json!({
            "secretName": secret_name,
            "dnsNames": dns_names,
            "duration": format!("{}h", inputs.cert_duration_hours),
            "renewBefore": format!("{}h", inputs.cert_renew_before_hours),
            "issuerRef": {"name": inputs.issuer_name, "kind": "ClusterIssuer"},
        }),
    });

    let mut listeners = vec![
        serde_json::json!({
            "name": "exact",
            "hostname": exact_host,
            "port": 443,
            "protocol": "HTTPS",
            "tls": {"mode": "Terminate", "certificateRefs": [{"name": secret_name}]},
        }),
        serde_json::json!({
            "name": "wildcard",
            "hostname": wildcard_host,
            "port": 443,
            "protocol": "HTTPS",
            "tls": {"mode": "Terminate", "certificateRefs": [{"name": secret_name}]},
        }),
    ];
    if !inputs.extra_sans.is_empty() {
        listeners.push(serde_json::json!({
            "name": "custom-domains",
            "hostname": "*",
            "port": 443,
            "protocol": "HTTPS",
            "tls": {"mode": "Terminate", "certificateRefs": [{"name": secret_name}]},
        }));
    }

    let gateway = K8sObject::Unstructured(UnstructuredObject {
        api_version: "gateway.networking.k8s.io/v1".to_string(),
        kind: "Gateway".to_string(),
        metadata: UnstructuredMeta {
            name: format!("{env}-{project}-{}", inputs.gateway_name),
            namespace: Some(inputs.gateway_namespace.clone()),
            labels: BTreeMap::from([
                ("app.kubernetes.io/part-of".to_string(), "env360".to_string()),
                ("managed-by".to_string(), "env360".to_string()),
            ]),
            annotations: BTreeMap::new(),
        },
        spec: serde_json::json!({
            "gatewayClassName": inputs.gateway_class_name,
            "listeners": listeners,
        }),
    });

    EnvironmentSubdomainBundle { certificate, gateway }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details() -> ServiceDetails {
        ServiceDetails {
            project_id: Uuid::nil(),
            project_name: "Acme Corp".to_string(),
            service_id: Uuid::nil(),
            service_name: "Billing_Api".to_string(),
            docker_image: "nginx:1.26".to_string(),
            ports: vec![80],
            lane_id: None,
        }
    }

    #[test]
    fn normalization_rule() {
        assert_eq!(normalize("Billing_Api"), "billing-api");
        assert_eq!(normalize("My Project/Sub"), "my-project-sub");
    }

    #[test]
    fn namespace_name_matches_spec_pattern() {
        let b = bundle(&details(), "v2", Uuid::nil(), "qa", &[], "env360.example.com", "istio-ingress", "env360-ingress");
        assert_eq!(b.namespace.name(), format!("proj-{}", Uuid::nil()));
    }

    #[test]
    fn empty_downstream_overrides_produce_empty_mesh_list() {
        let b = bundle(&details(), "v2", Uuid::nil(), "qa", &[], "env360.example.com", "istio-ingress", "env360-ingress");
        assert!(b.virtual_services_mesh.is_empty());
        assert_eq!(b.destination_rules.len(), 1);
    }

    #[test]
    fn downstream_lane_override_shapes_manifests() {
        let overrides = vec![DownstreamOverrideInput {
            service_name: "billing".to_string(),
            version: "v7".to_string(),
        }];
        let b = bundle(&details(), "v2", Uuid::nil(), "qa", &overrides, "env360.example.com", "istio-ingress", "env360-ingress");
        assert_eq!(b.destination_rules.len(), 2);
        assert_eq!(b.virtual_services_mesh.len(), 1);

        let K8sObject::Unstructured(vs) = &b.virtual_services_mesh[0] else {
            panic!("expected unstructured virtual service");
        };
        assert_eq!(vs.spec["hosts"][0], "billing");
        assert_eq!(vs.spec["http"][0]["route"][0]["destination"]["subset"], "v7");
    }

    #[test]
    fn external_virtual_service_uri_prefix() {
        let b = bundle(&details(), "v2", Uuid::nil(), "qa", &[], "env360.example.com", "istio-ingress", "env360-ingress");
        let K8sObject::Unstructured(vs) = &b.virtual_service_ext else {
            panic!("expected unstructured virtual service");
        };
        assert_eq!(vs.spec["hosts"][0], "env360.example.com");
        assert_eq!(
            vs.spec["http"][0]["match"][0]["uri"]["prefix"],
            "/acme-corp/qa/billing-api/v2"
        );
    }

    #[test]
    fn selector_labels_are_exactly_five_keys() {
        let labels = selector_labels(&details(), "v2");
        assert_eq!(labels.len(), 5);
        for key in ["service-id", "service-name", "version", "project-id", "project-name"] {
            assert!(labels.contains_key(key));
        }
    }
}
