/// Create, wait on and delete ephemeral resources
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::DynamicObject;
use tracing::{info, warn};

use super::dynamic::{field_bool, field_str, name_of, volume_snapshot_gvk, SNAPSHOT_GROUP};
use super::gateway::{ClusterGateway, GatewayError};
use super::resources::{ResourceHandle, ResourceKind, SpecBuilder};
use crate::config::RunConfig;
use crate::utils::cancel::CancelSignal;
use crate::utils::polling::{wait_for, Backoff, ProbeError, WaitOutcome};

/// Resource lifecycle operations for one run
pub struct ResourceManager<'a> {
    gateway: &'a dyn ClusterGateway,
    namespace: &'a str,
    specs: SpecBuilder<'a>,
    backoff: &'a Backoff,
    cancel: &'a CancelSignal,
}

impl<'a> ResourceManager<'a> {
    pub fn new(
        gateway: &'a dyn ClusterGateway,
        config: &'a RunConfig,
        uid: &'a str,
        backoff: &'a Backoff,
        cancel: &'a CancelSignal,
    ) -> Self {
        Self {
            gateway,
            namespace: &config.namespace,
            specs: SpecBuilder::new(config, uid),
            backoff,
            cancel,
        }
    }

    pub fn specs(&self) -> &SpecBuilder<'a> {
        &self.specs
    }

    pub fn gateway(&self) -> &'a dyn ClusterGateway {
        self.gateway
    }

    pub fn cancel(&self) -> &'a CancelSignal {
        self.cancel
    }

    pub async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<ResourceHandle> {
        let name = pvc.metadata.name.clone().unwrap_or_default();
        info!("Creating pvc {}", name);
        self.cancel
            .guard(self.gateway.create_pvc(self.namespace, pvc))
            .await?
            .with_context(|| format!("Failed to create pvc {}", name))?;
        info!("✓ Created pvc {}", name);
        Ok(ResourceHandle::new(ResourceKind::PersistentVolumeClaim, name, self.namespace))
    }

    pub async fn create_pod(&self, pod: &Pod) -> Result<ResourceHandle> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        info!("Creating pod {}", name);
        self.cancel
            .guard(self.gateway.create_pod(self.namespace, pod))
            .await?
            .with_context(|| format!("Failed to create pod {}", name))?;
        info!("✓ Created pod {}", name);
        Ok(ResourceHandle::new(ResourceKind::Pod, name, self.namespace))
    }

    /// Snapshot `pvc` at the snapshot group's preferred version
    pub async fn create_snapshot(
        &self,
        name: &str,
        snapshot_class: &str,
        pvc: &str,
    ) -> Result<ResourceHandle> {
        let version = self
            .cancel
            .guard(self.gateway.preferred_version(SNAPSHOT_GROUP))
            .await?
            .context("Failed to discover the volume snapshot API version")?;
        let snapshot = self
            .specs
            .volume_snapshot(name, snapshot_class, pvc, &version);

        info!("Creating volume snapshot {} of pvc {} ({})", name, pvc, version);
        let gvk = volume_snapshot_gvk(&version);
        self.cancel
            .guard(self.gateway.create_dynamic(&gvk, self.namespace, &snapshot))
            .await?
            .with_context(|| format!("Failed to create volume snapshot {}", name))?;
        info!("✓ Created volume snapshot {}", name);
        Ok(
            ResourceHandle::new(ResourceKind::VolumeSnapshot, name, self.namespace)
                .with_api_version(version),
        )
    }

    pub async fn wait_pod_ready(&self, handle: &ResourceHandle) -> WaitOutcome {
        let gateway = self.gateway;
        let description = format!("Waiting for pod {} to become ready", handle.name);
        wait_for(&description, self.backoff, self.cancel, move || async move {
            match gateway.get_pod(&handle.namespace, &handle.name).await {
                Ok(pod) => pod_readiness(&pod),
                Err(e) if e.is_not_found() => Err(ProbeError::permanent(e)),
                Err(e) => Err(ProbeError::transient(e)),
            }
        })
        .await
    }

    pub async fn wait_snapshot_ready(&self, handle: &ResourceHandle) -> WaitOutcome {
        let version = handle.api_version.clone().unwrap_or_else(|| "v1".to_string());
        let gvk = &volume_snapshot_gvk(&version);
        let gateway = self.gateway;
        let description = format!("Waiting for volume snapshot {} to become ready-to-use", handle.name);
        wait_for(&description, self.backoff, self.cancel, move || async move {
            match gateway.get_dynamic(gvk, &handle.namespace, &handle.name).await {
                Ok(snapshot) => snapshot_readiness(&snapshot),
                Err(e) if e.is_not_found() => Err(ProbeError::permanent(e)),
                Err(e) => Err(ProbeError::transient(e)),
            }
        })
        .await
    }

    /// Log the node a pod was scheduled on
    pub async fn log_pod_schedule(&self, handle: &ResourceHandle) -> Result<()> {
        let pod = self
            .cancel
            .guard(self.gateway.get_pod(&handle.namespace, &handle.name))
            .await?
            .with_context(|| format!("Failed to get pod {}", handle.name))?;
        let node = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .unwrap_or("<unscheduled>");
        info!("Pod {} scheduled on node {}", handle.name, node);
        Ok(())
    }

    pub async fn delete(&self, handle: &ResourceHandle) -> Result<(), GatewayError> {
        delete_resource(self.gateway, handle).await
    }
}

/// Delete the object behind `handle`; an already missing object counts as deleted
pub async fn delete_resource(
    gateway: &dyn ClusterGateway,
    handle: &ResourceHandle,
) -> Result<(), GatewayError> {
    let result = match handle.kind {
        ResourceKind::Pod => gateway.delete_pod(&handle.namespace, &handle.name).await,
        ResourceKind::PersistentVolumeClaim => {
            gateway.delete_pvc(&handle.namespace, &handle.name).await
        }
        ResourceKind::VolumeSnapshot => {
            let version = handle.api_version.as_deref().unwrap_or("v1");
            gateway
                .delete_dynamic(&volume_snapshot_gvk(version), &handle.namespace, &handle.name)
                .await
        }
    };

    match result {
        Ok(()) => {
            info!(
                "Deleted {} (created {})",
                handle,
                handle.created_at.format("%Y-%m-%d %H:%M:%S")
            );
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            info!("{} already gone", handle);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Ready condition of a pod; terminated pods can never become ready
fn pod_readiness(pod: &Pod) -> Result<bool, ProbeError> {
    let status = match &pod.status {
        Some(status) => status,
        None => return Ok(false),
    };

    if let Some(phase @ ("Failed" | "Succeeded")) = status.phase.as_deref() {
        return Err(ProbeError::permanent(anyhow::anyhow!(
            "pod {} terminated in phase {}",
            pod.metadata.name.as_deref().unwrap_or_default(),
            phase
        )));
    }

    Ok(status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True"))
}

fn snapshot_readiness(snapshot: &DynamicObject) -> Result<bool, ProbeError> {
    if field_bool(snapshot, &["status", "readyToUse"]) == Some(true) {
        return Ok(true);
    }

    if let Some(message) = field_str(snapshot, &["status", "error", "message"]) {
        warn!("Volume snapshot {} reports an error: {}", name_of(snapshot), message);
        return Err(ProbeError::transient(anyhow::anyhow!(
            "volume snapshot {} error: {}",
            name_of(snapshot),
            message
        )));
    }

    Ok(false)
}
