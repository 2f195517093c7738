/// Specifications of the ephemeral objects a preflight run creates
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use super::dynamic::{volume_snapshot_gvk, SNAPSHOT_GROUP, VOLUME_SNAPSHOT_KIND};
use super::naming::{resource_name, DNS_POD_PREFIX, SOURCE_POD_PREFIX, SOURCE_PVC_PREFIX};
use crate::config::RunConfig;

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "k8s-preflight";
pub const RUN_UID_LABEL: &str = "preflight.k8s.io/run-uid";

pub const BUSYBOX_IMAGE: &str = "busybox:1.36";
pub const DNSUTILS_IMAGE: &str = "registry.k8s.io/e2e-test-images/jessie-dnsutils:1.3";
pub const DNS_CONTAINER_NAME: &str = "dnsutils";
pub const BUSYBOX_CONTAINER_NAME: &str = "busybox";

pub const DATA_MOUNT_PATH: &str = "/demo/data";
pub const DATA_FILE: &str = "/demo/data/sample-file.txt";
pub const DATA_CONTENT: &str = "preflight-snapshot-data";
const DATA_VOLUME_NAME: &str = "source-data";
const SLEEP_SECONDS: &str = "3600";

/// Label selector matching everything any preflight run created
pub fn managed_selector() -> String {
    format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY)
}

/// Label selector matching the objects of a single run
pub fn run_selector(uid: &str) -> String {
    format!("{},{}={}", managed_selector(), RUN_UID_LABEL, uid)
}

/// Command that succeeds only if the restored volume holds the marker file
pub fn restore_data_check_command() -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!(
            "dat=$(cat \"{}\"); echo \"${{dat}}\"; test \"${{dat}}\" = \"{}\"",
            DATA_FILE, DATA_CONTENT
        ),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Pod,
    PersistentVolumeClaim,
    VolumeSnapshot,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Pod => write!(f, "pod"),
            ResourceKind::PersistentVolumeClaim => write!(f, "pvc"),
            ResourceKind::VolumeSnapshot => write!(f, "volume snapshot"),
        }
    }
}

/// An ephemeral object created during a check
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,
    pub created_at: DateTime<Utc>,
    /// Snapshot API version the object was created at
    pub api_version: Option<String>,
}

impl ResourceHandle {
    pub fn new(kind: ResourceKind, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: namespace.into(),
            created_at: Utc::now(),
            api_version: None,
        }
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Builds object specs from the run configuration and UID
pub struct SpecBuilder<'a> {
    config: &'a RunConfig,
    uid: &'a str,
}

impl<'a> SpecBuilder<'a> {
    pub fn new(config: &'a RunConfig, uid: &'a str) -> Self {
        Self { config, uid }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        [
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
            (RUN_UID_LABEL.to_string(), self.uid.to_string()),
        ]
        .into_iter()
        .collect()
    }

    fn metadata(&self, name: &str) -> Value {
        json!({
            "name": name,
            "namespace": self.config.namespace,
            "labels": self.labels(),
        })
    }

    /// Image reference, rewritten to the local registry when one is set
    pub fn image(&self, image: &str) -> String {
        match &self.config.local_registry {
            Some(registry) => {
                let short = image.rsplit('/').next().unwrap_or(image);
                format!("{}/{}", registry.trim_end_matches('/'), short)
            }
            None => image.to_string(),
        }
    }

    /// Requests/limits, emitting only the values that are configured
    fn resources(&self) -> Value {
        let mut resources = Map::new();
        for (key, values) in [
            ("requests", &self.config.resources.requests),
            ("limits", &self.config.resources.limits),
        ] {
            if !values.is_empty() {
                let list: Map<String, Value> = values
                    .entries()
                    .map(|(k, v)| (k.to_string(), Value::from(v)))
                    .collect();
                resources.insert(key.to_string(), Value::Object(list));
            }
        }
        Value::Object(resources)
    }

    fn pod(&self, name: &str, container: Value, claim: Option<&str>) -> Result<Pod> {
        let mut spec = json!({
            "restartPolicy": "Never",
            "containers": [container],
        });
        if let Some(claim) = claim {
            spec["volumes"] = json!([{
                "name": DATA_VOLUME_NAME,
                "persistentVolumeClaim": { "claimName": claim, "readOnly": false },
            }]);
        }
        if let Some(secret) = &self.config.image_pull_secret {
            spec["imagePullSecrets"] = json!([{ "name": secret }]);
        }
        if let Some(account) = &self.config.service_account {
            spec["serviceAccountName"] = json!(account);
        }
        if !self.config.node_selector.is_empty() {
            spec["nodeSelector"] = json!(self.config.node_selector);
        }

        from_manifest(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": self.metadata(name),
            "spec": spec,
        }))
        .with_context(|| format!("Failed to build pod spec {}", name))
    }

    fn busybox_container(&self, command: Vec<String>, readiness: Option<Vec<String>>) -> Value {
        let mut container = json!({
            "name": BUSYBOX_CONTAINER_NAME,
            "image": self.image(BUSYBOX_IMAGE),
            "command": command,
            "resources": self.resources(),
            "volumeMounts": [{ "name": DATA_VOLUME_NAME, "mountPath": DATA_MOUNT_PATH }],
        });
        if let Some(probe) = readiness {
            container["readinessProbe"] = json!({
                "exec": { "command": probe },
                "initialDelaySeconds": 2,
                "periodSeconds": 2,
            });
        }
        container
    }

    /// Disposable pod used for in-cluster DNS lookups
    pub fn dns_pod(&self) -> Result<Pod> {
        let container = json!({
            "name": DNS_CONTAINER_NAME,
            "image": self.image(DNSUTILS_IMAGE),
            "command": ["sleep", SLEEP_SECONDS],
            "resources": self.resources(),
        });
        self.pod(&resource_name(DNS_POD_PREFIX, self.uid), container, None)
    }

    /// Pod writing the marker file onto the source PVC
    ///
    /// Becomes Ready only once the file exists, so a snapshot taken after
    /// the readiness wait always contains it.
    pub fn source_pod(&self, pvc: &str) -> Result<Pod> {
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "echo '{}' > {} && sync && sleep {}",
                DATA_CONTENT, DATA_FILE, SLEEP_SECONDS
            ),
        ];
        let readiness = vec!["cat".to_string(), DATA_FILE.to_string()];
        let container = self.busybox_container(command, Some(readiness));
        self.pod(&resource_name(SOURCE_POD_PREFIX, self.uid), container, Some(pvc))
    }

    /// Idle pod mounting a restored PVC; data is verified by exec
    pub fn restore_pod(&self, name: &str, pvc: &str) -> Result<Pod> {
        let command = vec!["sleep".to_string(), SLEEP_SECONDS.to_string()];
        let container = self.busybox_container(command, None);
        self.pod(name, container, Some(pvc))
    }

    fn pvc(&self, name: &str, data_source: Option<&str>) -> Result<PersistentVolumeClaim> {
        let mut spec = json!({
            "accessModes": ["ReadWriteOnce"],
            "storageClassName": self.config.storage_class,
            "resources": { "requests": { "storage": self.config.pvc_storage_request } },
        });
        if let Some(snapshot) = data_source {
            spec["dataSource"] = json!({
                "apiGroup": SNAPSHOT_GROUP,
                "kind": VOLUME_SNAPSHOT_KIND,
                "name": snapshot,
            });
        }

        from_manifest(json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": self.metadata(name),
            "spec": spec,
        }))
        .with_context(|| format!("Failed to build pvc spec {}", name))
    }

    pub fn source_pvc(&self) -> Result<PersistentVolumeClaim> {
        self.pvc(&resource_name(SOURCE_PVC_PREFIX, self.uid), None)
    }

    /// PVC provisioned from a volume snapshot
    pub fn restore_pvc(&self, name: &str, snapshot: &str) -> Result<PersistentVolumeClaim> {
        self.pvc(name, Some(snapshot))
    }

    /// Volume snapshot of `pvc` at the given snapshot API version
    pub fn volume_snapshot(
        &self,
        name: &str,
        snapshot_class: &str,
        pvc: &str,
        version: &str,
    ) -> DynamicObject {
        let resource = ApiResource::from_gvk(&volume_snapshot_gvk(version));
        let mut snapshot = DynamicObject::new(name, &resource).within(&self.config.namespace);
        snapshot.metadata.labels = Some(self.labels());
        snapshot.data = json!({
            "spec": {
                "volumeSnapshotClassName": snapshot_class,
                "source": { "persistentVolumeClaimName": pvc },
            }
        });
        snapshot
    }
}

fn from_manifest<T: DeserializeOwned>(manifest: Value) -> Result<T> {
    Ok(serde_json::from_value(manifest)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PodResources, ResourceValues};
    use crate::k8s::dynamic::{field_str, name_of};
    use crate::k8s::naming::RESTORE_PVC_PREFIX;

    fn config() -> RunConfig {
        RunConfig {
            storage_class: "standard".to_string(),
            namespace: "preflight".to_string(),
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_pvc_requests_storage_class_and_size() {
        let mut cfg = config();
        cfg.pvc_storage_request = "2Gi".to_string();
        let pvc = SpecBuilder::new(&cfg, "abc123").source_pvc().unwrap();

        assert_eq!(pvc.metadata.name.as_deref(), Some("source-pvc-abc123"));
        assert_eq!(pvc.metadata.namespace.as_deref(), Some("preflight"));
        let spec = pvc.spec.unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("standard"));
        let requests = spec.resources.unwrap().requests.unwrap();
        assert_eq!(requests["storage"].0, "2Gi");
        assert!(spec.data_source.is_none());
    }

    #[test]
    fn test_restore_pvc_uses_snapshot_data_source() {
        let cfg = config();
        let name = resource_name(RESTORE_PVC_PREFIX, "abc123");
        let pvc = SpecBuilder::new(&cfg, "abc123")
            .restore_pvc(&name, "snapshot-source-pvc-abc123")
            .unwrap();

        let source = pvc.spec.unwrap().data_source.unwrap();
        assert_eq!(source.kind, "VolumeSnapshot");
        assert_eq!(source.name, "snapshot-source-pvc-abc123");
        assert_eq!(source.api_group.as_deref(), Some(SNAPSHOT_GROUP));
    }

    #[test]
    fn test_pod_without_resources_leaves_them_unset() {
        let cfg = config();
        let pod = SpecBuilder::new(&cfg, "abc123").dns_pod().unwrap();
        let spec = pod.spec.unwrap();
        let container = &spec.containers[0];

        assert_eq!(container.name, DNS_CONTAINER_NAME);
        assert_eq!(container.image.as_deref(), Some(DNSUTILS_IMAGE));
        let resources = container.resources.clone().unwrap_or_default();
        assert!(resources.requests.is_none());
        assert!(resources.limits.is_none());
        assert!(spec.image_pull_secrets.is_none());
        assert!(spec.service_account_name.is_none());
    }

    #[test]
    fn test_pod_applies_configured_options() {
        let mut cfg = config();
        cfg.local_registry = Some("registry.local:5000/".to_string());
        cfg.image_pull_secret = Some("regcred".to_string());
        cfg.service_account = Some("preflight-sa".to_string());
        cfg.resources = PodResources {
            requests: ResourceValues {
                cpu: Some("250m".to_string()),
                memory: None,
            },
            limits: ResourceValues {
                cpu: None,
                memory: Some("128Mi".to_string()),
            },
        };
        cfg.node_selector.insert("disk".to_string(), "ssd".to_string());

        let pod = SpecBuilder::new(&cfg, "abc123")
            .source_pod("source-pvc-abc123")
            .unwrap();
        let spec = pod.spec.unwrap();
        let container = &spec.containers[0];

        assert_eq!(container.image.as_deref(), Some("registry.local:5000/busybox:1.36"));
        let resources = container.resources.clone().unwrap();
        let requests = resources.requests.unwrap();
        let limits = resources.limits.unwrap();
        assert_eq!(requests["cpu"].0, "250m");
        assert!(!requests.contains_key("memory"));
        assert_eq!(limits["memory"].0, "128Mi");
        assert!(!limits.contains_key("cpu"));

        assert_eq!(spec.service_account_name.as_deref(), Some("preflight-sa"));
        assert_eq!(spec.image_pull_secrets.unwrap().len(), 1);
        assert_eq!(spec.node_selector.unwrap()["disk"], "ssd");

        let volume = &spec.volumes.unwrap()[0];
        assert_eq!(
            volume.persistent_volume_claim.as_ref().unwrap().claim_name,
            "source-pvc-abc123"
        );
        assert!(container.readiness_probe.is_some());
    }

    #[test]
    fn test_local_registry_rewrites_nested_image_path() {
        let mut cfg = config();
        cfg.local_registry = Some("mirror.internal".to_string());
        let specs = SpecBuilder::new(&cfg, "abc123");
        assert_eq!(
            specs.image(DNSUTILS_IMAGE),
            "mirror.internal/jessie-dnsutils:1.3"
        );
    }

    #[test]
    fn test_volume_snapshot_spec() {
        let cfg = config();
        let snap = SpecBuilder::new(&cfg, "abc123").volume_snapshot(
            "snapshot-source-pvc-abc123",
            "csi-snapclass",
            "source-pvc-abc123",
            "v1beta1",
        );

        assert_eq!(name_of(&snap), "snapshot-source-pvc-abc123");
        assert_eq!(snap.metadata.namespace.as_deref(), Some("preflight"));
        let types = snap.types.clone().unwrap();
        assert_eq!(types.api_version, "snapshot.storage.k8s.io/v1beta1");
        assert_eq!(types.kind, "VolumeSnapshot");
        assert_eq!(
            field_str(&snap, &["spec", "volumeSnapshotClassName"]),
            Some("csi-snapclass")
        );
        assert_eq!(
            field_str(&snap, &["spec", "source", "persistentVolumeClaimName"]),
            Some("source-pvc-abc123")
        );
        assert_eq!(
            snap.metadata.labels.unwrap()[RUN_UID_LABEL],
            "abc123"
        );
    }

    #[test]
    fn test_every_object_is_labelled() {
        let cfg = config();
        let specs = SpecBuilder::new(&cfg, "zz99yy");
        let pod = specs.dns_pod().unwrap();
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels[MANAGED_BY_LABEL], MANAGED_BY);
        assert_eq!(labels[RUN_UID_LABEL], "zz99yy");
    }

    #[test]
    fn test_restore_check_command_compares_marker() {
        let cmd = restore_data_check_command();
        assert_eq!(cmd[0], "sh");
        assert!(cmd[2].contains(DATA_FILE));
        assert!(cmd[2].contains(DATA_CONTENT));
    }
}
