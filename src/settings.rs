//! Layered configuration (spec §6.3), grounded on the teacher's
//! `server/settings.rs`: typed sub-structs loaded through the `config`
//! crate with environment-variable overrides and defaults for every key.

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    #[serde(default)]
    pub domain: DomainSettings,
    #[serde(default)]
    pub workflow: WorkflowSettings,
    #[serde(default)]
    pub security: SecuritySettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

/// Environment-subdomain provisioning defaults (spec §6.3).
#[derive(Debug, Clone, Deserialize)]
pub struct DomainSettings {
    #[serde(default = "default_base_domain")]
    pub base_domain: String,
    #[serde(default = "default_cert_namespace")]
    pub cert_namespace: String,
    #[serde(default = "default_issuer_name")]
    pub issuer_name: String,
    #[serde(default = "default_cert_duration_hours")]
    pub cert_duration_hours: i64,
    #[serde(default = "default_cert_renew_before_hours")]
    pub cert_renew_before_hours: i64,
    #[serde(default = "default_gateway_name")]
    pub gateway_name: String,
    #[serde(default = "default_gateway_namespace")]
    pub gateway_namespace: String,
    #[serde(default = "default_gateway_class_name")]
    pub gateway_class_name: String,
}

impl Default for DomainSettings {
    fn default() -> Self {
        Self {
            base_domain: default_base_domain(),
            cert_namespace: default_cert_namespace(),
            issuer_name: default_issuer_name(),
            cert_duration_hours: default_cert_duration_hours(),
            cert_renew_before_hours: default_cert_renew_before_hours(),
            gateway_name: default_gateway_name(),
            gateway_namespace: default_gateway_namespace(),
            gateway_class_name: default_gateway_class_name(),
        }
    }
}

fn default_base_domain() -> String {
    "env360.example.com".to_string()
}
fn default_cert_namespace() -> String {
    "cert-manager".to_string()
}
fn default_issuer_name() -> String {
    "letsencrypt-prod".to_string()
}
fn default_cert_duration_hours() -> i64 {
    2160
}
fn default_cert_renew_before_hours() -> i64 {
    360
}
fn default_gateway_name() -> String {
    "env360-ingress".to_string()
}
fn default_gateway_namespace() -> String {
    "istio-ingress".to_string()
}
fn default_gateway_class_name() -> String {
    "istio".to_string()
}

/// Workflow engine tunables (spec §4.8: queue name, poll timeout/interval).
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSettings {
    #[serde(default = "default_queue_name")]
    pub default_queue_name: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_poll_timeout_secs")]
    pub deploy_poll_timeout_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub deploy_poll_interval_secs: u64,
    #[serde(default = "default_dispatch_interval_secs")]
    pub dispatch_interval_secs: u64,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            default_queue_name: default_queue_name(),
            queue_capacity: default_queue_capacity(),
            deploy_poll_timeout_secs: default_poll_timeout_secs(),
            deploy_poll_interval_secs: default_poll_interval_secs(),
            dispatch_interval_secs: default_dispatch_interval_secs(),
        }
    }
}

fn default_queue_name() -> String {
    "env360-deploy".to_string()
}
fn default_queue_capacity() -> usize {
    8
}
fn default_poll_timeout_secs() -> u64 {
    300
}
fn default_poll_interval_secs() -> u64 {
    10
}
fn default_dispatch_interval_secs() -> u64 {
    2
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecuritySettings {
    /// AEAD key material, base64-encoded 32 bytes (spec §6.3).
    pub secrets_encryption_key: Option<String>,
    /// Comma-separated, lowercased for comparison (spec §3: derived,
    /// never stored, super-admin flag).
    #[serde(default)]
    pub super_admin_emails: String,
}

impl SecuritySettings {
    pub fn is_super_admin(&self, email: &str) -> bool {
        let email = email.to_lowercase();
        self.super_admin_emails
            .split(',')
            .map(|e| e.trim().to_lowercase())
            .any(|e| !e.is_empty() && e == email)
    }
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(Environment::default().separator("__"))
            .build()?;

        config.try_deserialize()
    }
}
