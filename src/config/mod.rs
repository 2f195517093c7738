/// Configuration for a preflight run
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::utils::quantity::parse_quantity;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_PVC_STORAGE_REQUEST: &str = "1Gi";

/// Errors detected before any cluster call is made
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("storage-class is required, cannot be empty")]
    MissingStorageClass,

    #[error("cannot give image pull secret if local registry is not provided; use --local-registry to provide one")]
    PullSecretWithoutRegistry,

    #[error("invalid quantity '{value}' for {field}")]
    InvalidQuantity { field: &'static str, value: String },

    #[error("{resource} request ({request}) must not exceed its limit ({limit})")]
    RequestExceedsLimit {
        resource: &'static str,
        request: String,
        limit: String,
    },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Immutable parameters of one preflight run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    /// Namespace in which ephemeral resources are created
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Storage class to validate (required)
    #[serde(default)]
    pub storage_class: String,

    /// Volume snapshot class; discovered from the provisioner when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_class: Option<String>,

    /// Registry from which test images are pulled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_registry: Option<String>,

    /// Pull secret for the local registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<String>,

    /// Service account for ephemeral pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,

    /// Remove ephemeral resources even when some check failed
    #[serde(default)]
    pub cleanup_on_failure: bool,

    /// Storage requested by every ephemeral PVC
    #[serde(default = "default_pvc_storage_request")]
    pub pvc_storage_request: String,

    /// CPU/memory requests and limits for ephemeral pods
    #[serde(default)]
    pub resources: PodResources,

    /// Node selector applied to ephemeral pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

/// Pod resource requirements; unset values are left to cluster defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodResources {
    #[serde(default)]
    pub requests: ResourceValues,
    #[serde(default)]
    pub limits: ResourceValues,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceValues {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl ResourceValues {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none()
    }

    /// `(name, quantity)` pairs of the values that are set
    pub fn entries(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [("cpu", self.cpu.as_deref()), ("memory", self.memory.as_deref())]
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_pvc_storage_request() -> String {
    DEFAULT_PVC_STORAGE_REQUEST.to_string()
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            storage_class: String::new(),
            snapshot_class: None,
            local_registry: None,
            image_pull_secret: None,
            service_account: None,
            cleanup_on_failure: false,
            pvc_storage_request: default_pvc_storage_request(),
            resources: PodResources::default(),
            node_selector: BTreeMap::new(),
        }
    }
}

impl RunConfig {
    /// Load configuration from a YAML file (not validated)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: RunConfig = serde_yaml::from_str(&content)?;
        config.normalize();
        Ok(config)
    }

    /// Treat empty strings as unset
    pub fn normalize(&mut self) {
        for field in [
            &mut self.snapshot_class,
            &mut self.local_registry,
            &mut self.image_pull_secret,
            &mut self.service_account,
            &mut self.resources.requests.cpu,
            &mut self.resources.requests.memory,
            &mut self.resources.limits.cpu,
            &mut self.resources.limits.memory,
        ] {
            *field = field
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string);
        }
        for field in [
            &mut self.storage_class,
            &mut self.namespace,
            &mut self.pvc_storage_request,
        ] {
            let trimmed = field.trim();
            if trimmed.len() != field.len() {
                *field = trimmed.to_string();
            }
        }
        if self.namespace.is_empty() {
            self.namespace = default_namespace();
        }
        if self.pvc_storage_request.is_empty() {
            self.pvc_storage_request = default_pvc_storage_request();
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage_class.trim().is_empty() {
            return Err(ConfigError::MissingStorageClass);
        }

        if self.image_pull_secret.is_some() && self.local_registry.is_none() {
            return Err(ConfigError::PullSecretWithoutRegistry);
        }

        let quantities = [
            ("pvc storage request", Some(&self.pvc_storage_request)),
            ("cpu request", self.resources.requests.cpu.as_ref()),
            ("memory request", self.resources.requests.memory.as_ref()),
            ("cpu limit", self.resources.limits.cpu.as_ref()),
            ("memory limit", self.resources.limits.memory.as_ref()),
        ];
        for (field, value) in quantities {
            if let Some(value) = value {
                if parse_quantity(value).is_none() {
                    return Err(ConfigError::InvalidQuantity {
                        field,
                        value: value.clone(),
                    });
                }
            }
        }

        let pairs = [
            (
                "cpu",
                &self.resources.requests.cpu,
                &self.resources.limits.cpu,
            ),
            (
                "memory",
                &self.resources.requests.memory,
                &self.resources.limits.memory,
            ),
        ];
        for (resource, request, limit) in pairs {
            if let (Some(request), Some(limit)) = (request, limit) {
                let (r, l) = (parse_quantity(request), parse_quantity(limit));
                if let (Some(r), Some(l)) = (r, l) {
                    if r > l {
                        return Err(ConfigError::RequestExceedsLimit {
                            resource,
                            request: request.clone(),
                            limit: limit.clone(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Log the effective options in a banner
    pub fn log_options(&self) {
        let show = |v: &Option<String>| v.clone().unwrap_or_default();
        info!("====PREFLIGHT RUN OPTIONS====");
        info!("NAMESPACE=\"{}\"", self.namespace);
        info!("STORAGE-CLASS=\"{}\"", self.storage_class);
        info!("VOLUME-SNAPSHOT-CLASS=\"{}\"", show(&self.snapshot_class));
        info!("LOCAL-REGISTRY=\"{}\"", show(&self.local_registry));
        info!("IMAGE-PULL-SECRET=\"{}\"", show(&self.image_pull_secret));
        info!("SERVICE-ACCOUNT=\"{}\"", show(&self.service_account));
        info!("CLEANUP-ON-FAILURE=\"{}\"", self.cleanup_on_failure);
        info!("POD CPU REQUEST=\"{}\"", show(&self.resources.requests.cpu));
        info!("POD MEMORY REQUEST=\"{}\"", show(&self.resources.requests.memory));
        info!("POD CPU LIMIT=\"{}\"", show(&self.resources.limits.cpu));
        info!("POD MEMORY LIMIT=\"{}\"", show(&self.resources.limits.memory));
        info!("PVC STORAGE REQUEST=\"{}\"", self.pvc_storage_request);
        info!("====PREFLIGHT RUN OPTIONS END====");
    }

    /// Generate an example configuration file
    pub fn example() -> Self {
        Self {
            storage_class: "csi-hostpath-sc".to_string(),
            snapshot_class: Some("csi-hostpath-snapclass".to_string()),
            resources: PodResources {
                requests: ResourceValues {
                    cpu: Some("250m".to_string()),
                    memory: Some("64Mi".to_string()),
                },
                limits: ResourceValues {
                    cpu: Some("500m".to_string()),
                    memory: Some("128Mi".to_string()),
                },
            },
            ..Self::default()
        }
    }
}
