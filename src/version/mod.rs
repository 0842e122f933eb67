//! Version Engine (spec §4.4): publishing new `ServiceVersion`s, content
//! hashing, and the pure-read diff used before publishing.

use crate::error::{CoreError, CoreResult};
use crate::model::{ConfigParentScope, Service, ServiceVersion, VariableScope};
use crate::store::Store;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

const VERSIONED_CONFIG_KEYS: [&str; 2] = ["docker_image", "ports"];

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PublishOutcome {
    pub ok: bool,
    pub version_label: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FieldDelta {
    pub key: String,
    pub changed: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Default)]
pub struct VersionDiff {
    pub config: Vec<FieldDelta>,
    pub variables: Vec<FieldDelta>,
    pub secrets: Vec<FieldDelta>,
    pub duplicate_labels: Vec<String>,
}

/// Loads `(versionedConfig, variables, secrets)` for the service, the same
/// shape `publish_service_version` and `validate_new_version` both need.
async fn load_editable_triple(
    store: &dyn Store,
    service_id: Uuid,
) -> CoreResult<(BTreeMap<String, Value>, BTreeMap<String, Value>, BTreeMap<String, Value>)> {
    let configs = store.list_configs(ConfigParentScope::Service, service_id).await?;
    let mut versioned_config = BTreeMap::new();
    for entry in configs.into_iter().filter(|c| VERSIONED_CONFIG_KEYS.contains(&c.key.as_str())) {
        let raw = entry.value.unwrap_or_default();
        let value = if entry.key == "ports" {
            serde_json::from_str(&raw).unwrap_or(Value::String(raw))
        } else {
            Value::String(raw)
        };
        versioned_config.insert(entry.key, value);
    }

    let vars = store.list_variables(VariableScope::Service, service_id).await?;
    let mut variables = BTreeMap::new();
    let mut secrets = BTreeMap::new();
    for v in vars {
        let target = if v.is_secret { &mut secrets } else { &mut variables };
        target.insert(v.key, Value::String(v.value));
    }

    Ok((versioned_config, variables, secrets))
}

/// Canonical JSON: sorted keys (via `BTreeMap`) and compact separators (via
/// `serde_json::to_vec`, which never inserts whitespace).
fn canonical_json(
    config: &BTreeMap<String, Value>,
    variables: &BTreeMap<String, Value>,
    secrets: &BTreeMap<String, Value>,
) -> Vec<u8> {
    let mut root = Map::new();
    root.insert("config".to_string(), Value::Object(config.clone().into_iter().collect()));
    root.insert("variables".to_string(), Value::Object(variables.clone().into_iter().collect()));
    root.insert("secrets".to_string(), Value::Object(secrets.clone().into_iter().collect()));
    serde_json::to_vec(&Value::Object(root)).expect("canonical json never fails to serialize")
}

fn config_hash(
    config: &BTreeMap<String, Value>,
    variables: &BTreeMap<String, Value>,
    secrets: &BTreeMap<String, Value>,
) -> String {
    let bytes = canonical_json(config, variables, secrets);
    let digest = Sha256::digest(&bytes);
    hex::encode(digest)
}

/// Parses a version label as `^v(\d+)$`; `None` if it doesn't match.
fn parse_label_number(label: &str) -> Option<u64> {
    label.strip_prefix('v').and_then(|rest| rest.parse::<u64>().ok())
}

fn next_label(previous: Option<&str>) -> String {
    match previous.and_then(parse_label_number) {
        Some(n) => format!("v{}", n + 1),
        None => "v1".to_string(),
    }
}

/// spec §4.4 steps 1–7.
pub async fn publish_service_version(store: &dyn Store, service_id: Uuid) -> CoreResult<PublishOutcome> {
    let service = store
        .get_service(service_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("service {service_id}")))?;

    let (config, variables, secrets) = load_editable_triple(store, service_id).await?;
    let hash = config_hash(&config, &variables, &secrets);

    let previous = store.latest_service_version(service_id).await?;
    if let Some(prev) = &previous {
        if prev.config_hash == hash {
            return Ok(PublishOutcome {
                ok: false,
                version_label: None,
                message: Some(format!("No new changes since {}", prev.version_label)),
            });
        }
    }

    let label = next_label(previous.as_ref().map(|p| p.version_label.as_str()));
    let spec_json = build_spec_json(store, &service, &config, &variables, &secrets).await?;

    match store.create_service_version(service_id, &label, &hash, spec_json).await {
        Ok(version) => Ok(PublishOutcome {
            ok: true,
            version_label: Some(version.version_label),
            message: None,
        }),
        Err(CoreError::AlreadyExists(msg)) => Err(CoreError::Conflict(msg)),
        Err(other) => Err(other),
    }
}

/// spec §4.4: "the full specJSON (service snapshot, all configs, variables,
/// secrets, project snapshot)" — not just the versioned subset, so the
/// deploy workflow can render deterministically from the version alone.
async fn build_spec_json(
    store: &dyn Store,
    service: &Service,
    versioned_config: &BTreeMap<String, Value>,
    variables: &BTreeMap<String, Value>,
    secrets: &BTreeMap<String, Value>,
) -> CoreResult<Value> {
    let project = store.resolve_project(service.project_id).await?;
    let all_configs = store.list_configs(ConfigParentScope::Service, service.id).await?;

    Ok(serde_json::json!({
        "service": service,
        "project": project,
        "versioned_config": versioned_config,
        "all_config": all_configs,
        "variables": variables,
        "secrets": secrets,
    }))
}

/// spec §4.4 "Validation API" — a pure read, no writes.
pub async fn validate_new_version(store: &dyn Store, service_id: Uuid) -> CoreResult<VersionDiff> {
    let (config, variables, secrets) = load_editable_triple(store, service_id).await?;
    let hash = config_hash(&config, &variables, &secrets);

    let previous = store.latest_service_version(service_id).await?;
    let prev_triple = match &previous {
        Some(p) => parse_previous_triple(p),
        None => Default::default(),
    };

    let diff_section = |current: &BTreeMap<String, Value>, prev: &BTreeMap<String, Value>| -> Vec<FieldDelta> {
        let mut keys: Vec<&String> = current.keys().chain(prev.keys()).collect();
        keys.sort();
        keys.dedup();
        keys.into_iter()
            .map(|k| FieldDelta {
                key: k.clone(),
                changed: current.get(k) != prev.get(k),
            })
            .collect()
    };

    let duplicate_labels = store
        .find_service_versions_by_hash(service_id, &hash)
        .await?
        .into_iter()
        .map(|v| v.version_label)
        .collect();

    Ok(VersionDiff {
        config: diff_section(&config, &prev_triple.0),
        variables: diff_section(&variables, &prev_triple.1),
        secrets: diff_section(&secrets, &prev_triple.2),
        duplicate_labels,
    })
}

fn parse_previous_triple(
    version: &ServiceVersion,
) -> (BTreeMap<String, Value>, BTreeMap<String, Value>, BTreeMap<String, Value>) {
    let to_map = |v: &Value| -> BTreeMap<String, Value> {
        v.as_object()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    };
    let config = version.spec_json.get("versioned_config").map(to_map).unwrap_or_default();
    let variables = version.spec_json.get("variables").map(to_map).unwrap_or_default();
    let secrets = version.spec_json.get("secrets").map(to_map).unwrap_or_default();
    (config, variables, secrets)
}

/// The combined "publish and deploy" entry point mentioned in spec §9's open
/// question: resolved by requiring the same hash-uniqueness check as plain
/// `publish_service_version`, so no code path can mint a `ServiceVersion`
/// without it.
pub async fn publish_and_deploy(
    store: &dyn Store,
    service_id: Uuid,
    environment_id: Option<Uuid>,
) -> CoreResult<(PublishOutcome, Option<Uuid>)> {
    let outcome = publish_service_version(store, service_id).await?;
    if !outcome.ok {
        return Ok((outcome, None));
    }
    let version = store
        .latest_service_version(service_id)
        .await?
        .ok_or_else(|| CoreError::Fatal("version just published is missing".to_string()))?;
    let deployment = store
        .create_deployment(service_id, version.id, environment_id, Value::Array(vec![]), None)
        .await?;
    Ok((outcome, Some(deployment.id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::store::memory::MemoryStore;
    use chrono::Utc;

    fn seed_service(store: &MemoryStore) -> Uuid {
        let owner = Uuid::new_v4();
        let project = Project {
            id: Uuid::new_v4(),
            name: "proj".into(),
            description: None,
            owner_id: owner,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        };
        store.insert_project(project.clone());
        let service = Service {
            id: Uuid::new_v4(),
            name: "svc".into(),
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
        store.insert_config(ConfigEntry {
            id: Uuid::new_v4(),
            parent_scope: ConfigParentScope::Service,
            parent_id: service.id,
            key: "docker_image".into(),
            value: Some("nginx:1.25".into()),
            config_data: None,
            workflow_uuid: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        });
        store.insert_config(ConfigEntry {
            id: Uuid::new_v4(),
            parent_scope: ConfigParentScope::Service,
            parent_id: service.id,
            key: "ports".into(),
            value: Some(r#"[{"containerPort":80}]"#.into()),
            config_data: None,
            workflow_uuid: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        });
        store.insert_variable(VariableEntry {
            id: Uuid::new_v4(),
            scope: VariableScope::Service,
            resource_id: service.id,
            key: "LOG".into(),
            value: "info".into(),
            is_secret: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        });
        store.insert_variable(VariableEntry {
            id: Uuid::new_v4(),
            scope: VariableScope::Service,
            resource_id: service.id,
            key: "API".into(),
            value: "abc".into(),
            is_secret: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        });
        service.id
    }

    #[tokio::test]
    async fn publish_v1_then_unchanged() {
        let store = MemoryStore::new();
        let service_id = seed_service(&store);

        let first = publish_service_version(&store, service_id).await.unwrap();
        assert!(first.ok);
        assert_eq!(first.version_label.as_deref(), Some("v1"));

        let second = publish_service_version(&store, service_id).await.unwrap();
        assert!(!second.ok);
        assert_eq!(second.message.as_deref(), Some("No new changes since v1"));
    }

    #[tokio::test]
    async fn publish_v2_after_image_bump() {
        let store = MemoryStore::new();
        let service_id = seed_service(&store);
        publish_service_version(&store, service_id).await.unwrap();

        let config = store
            .list_configs(ConfigParentScope::Service, service_id)
            .await
            .unwrap();
        let docker_image = config.iter().find(|c| c.key == "docker_image").unwrap();
        store
            .upsert_config(
                ConfigParentScope::Service,
                service_id,
                "docker_image",
                Some("nginx:1.26".into()),
                docker_image.config_data.clone(),
            )
            .await
            .unwrap();

        let second = publish_service_version(&store, service_id).await.unwrap();
        assert!(second.ok);
        assert_eq!(second.version_label.as_deref(), Some("v2"));

        let v1 = store
            .find_service_versions_by_hash(service_id, "")
            .await
            .unwrap();
        assert!(v1.is_empty());
    }

    #[tokio::test]
    async fn diff_is_pure_read() {
        let store = MemoryStore::new();
        let service_id = seed_service(&store);
        publish_service_version(&store, service_id).await.unwrap();

        let diff = validate_new_version(&store, service_id).await.unwrap();
        assert!(!diff.duplicate_labels.is_empty());
        assert!(store.latest_service_version(service_id).await.unwrap().is_some());
    }

    #[test]
    fn label_sequencing() {
        assert_eq!(next_label(None), "v1");
        assert_eq!(next_label(Some("v1")), "v2");
        assert_eq!(next_label(Some("v9")), "v10");
    }

    #[test]
    fn hash_is_stable_under_key_reordering() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), Value::String("2".into()));
        a.insert("a".to_string(), Value::String("1".into()));
        let mut b = BTreeMap::new();
        b.insert("a".to_string(), Value::String("1".into()));
        b.insert("b".to_string(), Value::String("2".into()));
        assert_eq!(config_hash(&a, &BTreeMap::new(), &BTreeMap::new()), config_hash(&b, &BTreeMap::new(), &BTreeMap::new()));
    }
}
