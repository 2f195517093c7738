/// Removal of ephemeral preflight resources
use anyhow::Result;
use tracing::{info, warn};

use crate::k8s::dynamic::{name_of, volume_snapshot_gvk, SNAPSHOT_GROUP};
use crate::k8s::gateway::{ClusterGateway, GatewayError};
use crate::k8s::lifecycle::delete_resource;
use crate::k8s::naming::{is_valid_run_uid, UID_LENGTH};
use crate::k8s::resources::{managed_selector, run_selector, ResourceHandle, ResourceKind};

/// Delete the preflight resources of run `uid`, or of every run when `uid` is `None`
///
/// Objects are selected by label, never by name. Pods go first so their
/// volumes are released, then snapshots, then PVCs. Every deletion is
/// attempted; failures are collected into one error.
pub async fn cleanup_by_uid(
    gateway: &dyn ClusterGateway,
    namespace: &str,
    uid: Option<&str>,
) -> Result<()> {
    if let Some(uid) = uid.filter(|uid| !is_valid_run_uid(uid)) {
        anyhow::bail!(
            "invalid run UID '{}': expected {} lowercase letters or digits",
            uid,
            UID_LENGTH
        );
    }

    match uid {
        Some(uid) => info!("Cleaning up preflight resources with UID {} in namespace {}", uid, namespace),
        None => info!("Cleaning up all preflight resources in namespace {}", namespace),
    }

    let selector = uid.map_or_else(managed_selector, run_selector);
    let mut handles = Vec::new();
    let mut failures = Vec::new();

    match gateway.list_pods(namespace, &selector).await {
        Ok(pods) => handles.extend(
            pods.iter()
                .filter_map(|p| p.metadata.name.as_deref())
                .map(|name| ResourceHandle::new(ResourceKind::Pod, name, namespace)),
        ),
        Err(e) => failures.push(format!("listing pods: {}", e)),
    }

    match gateway.preferred_version(SNAPSHOT_GROUP).await {
        Ok(version) => match gateway
            .list_dynamic(&volume_snapshot_gvk(&version), namespace, &selector)
            .await
        {
            Ok(snapshots) => handles.extend(
                snapshots
                    .iter()
                    .map(name_of)
                    .map(|name| {
                        ResourceHandle::new(ResourceKind::VolumeSnapshot, name, namespace)
                            .with_api_version(version.clone())
                    }),
            ),
            Err(e) => failures.push(format!("listing volume snapshots: {}", e)),
        },
        Err(GatewayError::GroupNotFound(group)) => {
            warn!("API group {} not served; skipping volume snapshot cleanup", group)
        }
        Err(e) => failures.push(format!("discovering volume snapshot version: {}", e)),
    }

    match gateway.list_pvcs(namespace, &selector).await {
        Ok(pvcs) => handles.extend(
            pvcs.iter()
                .filter_map(|p| p.metadata.name.as_deref())
                .map(|name| ResourceHandle::new(ResourceKind::PersistentVolumeClaim, name, namespace)),
        ),
        Err(e) => failures.push(format!("listing pvcs: {}", e)),
    }

    let mut deleted = 0usize;
    for handle in &handles {
        match delete_resource(gateway, handle).await {
            Ok(()) => deleted += 1,
            Err(e) => {
                warn!("Failed to delete {} :: {}", handle, e);
                failures.push(format!("{}: {}", handle, e));
            }
        }
    }

    if failures.is_empty() {
        info!("✓ Cleaned up {} preflight resources", deleted);
        return Ok(());
    }
    anyhow::bail!(
        "cleanup incomplete ({} of {} deleted): {}",
        deleted,
        handles.len(),
        failures.join("; ")
    )
}
