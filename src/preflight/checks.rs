/// Individual preflight checks
///
/// Each check returns an optional detail on success and an error describing
/// the unmet precondition otherwise. None of them retries on its own; waits go
/// through the poll engine inside the resource manager.
use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::config::RunConfig;
use crate::k8s::dynamic::{
    crd_gvk, field_str, is_default_snapshot_class, name_of, volume_snapshot_class_gvk,
    API_EXTENSIONS_GROUP, SNAPSHOT_GROUP,
};
use crate::k8s::exec::{exec_in_pod, ExecOptions};
use crate::k8s::gateway::{ApiGroupInfo, ClusterGateway, GatewayError};
use crate::k8s::naming::{
    resource_name, RESTORE_POD_PREFIX, RESTORE_PVC_PREFIX, SNAPSHOT_PREFIX,
    UNMOUNTED_RESTORE_POD_PREFIX, UNMOUNTED_RESTORE_PVC_PREFIX, UNMOUNTED_SNAPSHOT_PREFIX,
};
use crate::k8s::resources::{
    restore_data_check_command, ResourceHandle, BUSYBOX_CONTAINER_NAME, DNS_CONTAINER_NAME,
};
use crate::k8s::ResourceManager;
use crate::utils::cancel::CancelSignal;
use crate::utils::command::{find_executable, CommandBuilder};
use crate::utils::polling::Backoff;
use crate::utils::version::Version;

pub const KUBECTL_BINARY: &str = "kubectl";
pub const HELM_BINARY: &str = "helm";

pub const MIN_HELM_VERSION: &str = "3.0.0";
pub const MIN_K8S_VERSION: &str = "1.18.0";

pub const OPENSHIFT_GROUP: &str = "security.openshift.io";
pub const OPENSHIFT_VERSION: &str = "v1";

pub const RBAC_GROUP: &str = "rbac.authorization.k8s.io";
pub const RBAC_VERSION: &str = "v1";

pub const CSI_CRDS: [&str; 3] = [
    "volumesnapshotclasses.snapshot.storage.k8s.io",
    "volumesnapshotcontents.snapshot.storage.k8s.io",
    "volumesnapshots.snapshot.storage.k8s.io",
];

pub const DNS_LOOKUP_TARGET: &str = "kubernetes.default";

/// Everything a check may touch during a run
pub struct CheckContext<'a> {
    pub gateway: &'a dyn ClusterGateway,
    pub config: &'a RunConfig,
    pub uid: &'a str,
    pub backoff: &'a Backoff,
    pub cancel: &'a CancelSignal,
}

impl<'a> CheckContext<'a> {
    fn resources(&self) -> ResourceManager<'a> {
        ResourceManager::new(self.gateway, self.config, self.uid, self.backoff, self.cancel)
    }
}

pub async fn check_kubectl() -> Result<Option<String>> {
    let path = find_executable(KUBECTL_BINARY)?;
    info!("kubectl found at path - {}", path.display());
    Ok(Some(path.display().to_string()))
}

pub async fn check_cluster_access(ctx: &CheckContext<'_>) -> Result<Option<String>> {
    let namespace = &ctx.config.namespace;
    ctx.gateway
        .get_namespace(namespace)
        .await
        .with_context(|| format!("unable to access namespace {} of cluster", namespace))?;
    Ok(None)
}

/// API groups served by the cluster, tolerating partial discovery
async fn discovered_groups(gateway: &dyn ClusterGateway) -> Result<Vec<ApiGroupInfo>> {
    match gateway.server_groups().await {
        Ok(groups) => Ok(groups),
        Err(GatewayError::PartialDiscovery { groups, message }) => {
            warn!(
                "The Kubernetes server has an orphaned API service. Server reports: {}",
                message
            );
            warn!("To fix this, kubectl delete api service <service-name>");
            Ok(groups)
        }
        Err(e) => {
            error!("Unable to fetch groups from server :: {}", e);
            Err(e.into())
        }
    }
}

fn serves(groups: &[ApiGroupInfo], group: &str, version: &str) -> bool {
    let wanted = format!("{}/{}", group, version);
    groups.iter().flat_map(|g| g.group_versions()).any(|gv| gv == wanted)
}

/// OpenShift clusters are recognised by their security API group
pub async fn is_openshift(gateway: &dyn ClusterGateway) -> bool {
    match discovered_groups(gateway).await {
        Ok(groups) => serves(&groups, OPENSHIFT_GROUP, OPENSHIFT_VERSION),
        Err(_) => false,
    }
}

pub async fn check_helm_version(ctx: &CheckContext<'_>) -> Result<Option<String>> {
    if is_openshift(ctx.gateway).await {
        info!("✓ Running OCP cluster. Helm not needed for OCP clusters");
        return Ok(Some("not required on OpenShift".to_string()));
    }
    info!(
        "APIVersion - {}/{} not found on cluster, not an OCP cluster",
        OPENSHIFT_GROUP, OPENSHIFT_VERSION
    );

    let path = find_executable(HELM_BINARY)?;
    info!("helm found at path - {}", path.display());

    let helm = CommandBuilder::new(&path)
        .args(["version", "--template", "{{.Version}}"])
        .context("Failed to get helm version");
    let version = ctx.cancel.guard(helm.run()).await??;
    let version = validate_helm_version(version.trim())?;
    info!("✓ Helm version {} meets required version", version);
    Ok(Some(version.to_string()))
}

pub fn validate_helm_version(current: &str) -> Result<Version> {
    let min: Version = MIN_HELM_VERSION.parse()?;
    let current: Version = current
        .parse()
        .context("Failed to parse helm version")?;
    if current < min {
        anyhow::bail!(
            "helm does not meet minimum version requirement. Upgrade helm to minimum version - {}",
            MIN_HELM_VERSION
        );
    }
    Ok(current)
}

pub async fn check_kubernetes_version(ctx: &CheckContext<'_>) -> Result<Option<String>> {
    let git_version = ctx
        .gateway
        .server_version()
        .await
        .context("Failed to get kubernetes server version")?;
    let version = validate_kubernetes_version(&git_version)?;
    info!("Kubernetes server version {}", git_version);
    Ok(Some(version.to_string()))
}

pub fn validate_kubernetes_version(git_version: &str) -> Result<Version> {
    let min: Version = MIN_K8S_VERSION.parse()?;
    let current: Version = git_version
        .parse()
        .context("Failed to parse kubernetes server version")?;
    if current < min {
        anyhow::bail!(
            "kubernetes server version {} does not meet minimum requirements (>= {})",
            git_version,
            MIN_K8S_VERSION
        );
    }
    Ok(current)
}

pub async fn check_rbac(ctx: &CheckContext<'_>) -> Result<Option<String>> {
    let groups = discovered_groups(ctx.gateway).await?;
    if !serves(&groups, RBAC_GROUP, RBAC_VERSION) {
        anyhow::bail!("not enabled kubernetes RBAC");
    }
    info!("✓ Kubernetes RBAC is enabled");
    Ok(None)
}

/// Match the storage class provisioner against a volume snapshot class driver
///
/// Returns the name of the snapshot class the round trip should use.
pub async fn check_storage_snapshot_class(ctx: &CheckContext<'_>) -> Result<Option<String>> {
    let storage_class_name = &ctx.config.storage_class;
    let storage_class = match ctx.gateway.get_storage_class(storage_class_name).await {
        Ok(class) => class,
        Err(e) if e.is_not_found() => {
            anyhow::bail!("not found storageclass - {} on cluster", storage_class_name)
        }
        Err(e) => return Err(e).context("Failed to get storage class"),
    };
    let provisioner = storage_class.provisioner;
    info!("✓ Storageclass - {} found on cluster", storage_class_name);

    let class = match &ctx.config.snapshot_class {
        None => {
            let class = find_snapshot_class_for_provisioner(ctx.gateway, &provisioner).await?;
            info!("✓ Extracted volume snapshot class - {} found in cluster", class);
            info!(
                "✓ Volume snapshot class - {} driver matches with given StorageClass's provisioner={}",
                class, provisioner
            );
            class
        }
        Some(name) => {
            let version = ctx
                .gateway
                .preferred_version(SNAPSHOT_GROUP)
                .await
                .context("Failed to discover the volume snapshot API version")?;
            let class = match ctx
                .gateway
                .get_dynamic(&volume_snapshot_class_gvk(&version), "", name)
                .await
            {
                Ok(class) => class,
                Err(e) if e.is_not_found() => {
                    anyhow::bail!("volume snapshot class - {} not found on cluster", name)
                }
                Err(e) => return Err(e).context("Failed to get volume snapshot class"),
            };
            let driver = field_str(&class, &["driver"]).unwrap_or_default();
            if driver != provisioner {
                anyhow::bail!(
                    "volume snapshot class - {} driver {} does not match with storage class - {} provisioner {}",
                    name,
                    driver,
                    storage_class_name,
                    provisioner
                );
            }
            info!(
                "✓ Volume snapshot class - {} driver matches with given storage class provisioner",
                name
            );
            name.clone()
        }
    };

    Ok(Some(class))
}

/// Pick the snapshot class whose driver is `provisioner`, preferring the
/// cluster default
pub async fn find_snapshot_class_for_provisioner(
    gateway: &dyn ClusterGateway,
    provisioner: &str,
) -> Result<String> {
    let version = gateway
        .preferred_version(SNAPSHOT_GROUP)
        .await
        .context("Failed to discover the volume snapshot API version")?;
    let classes = gateway
        .list_dynamic(&volume_snapshot_class_gvk(&version), "", "")
        .await
        .context("Failed to list volume snapshot classes")?;
    if classes.is_empty() {
        anyhow::bail!(
            "no volume snapshot class for APIVersion - {}/{} found on cluster",
            SNAPSHOT_GROUP,
            version
        );
    }

    let matching: Vec<_> = classes
        .iter()
        .filter(|c| field_str(c, &["driver"]) == Some(provisioner))
        .collect();
    let chosen = matching
        .iter()
        .find(|c| is_default_snapshot_class(c))
        .or_else(|| matching.first())
        .with_context(|| {
            format!(
                "no matching volume snapshot class having driver same as provisioner - {}",
                provisioner
            )
        })?;

    info!(
        "volume snapshot class having driver same as provisioner - {} found: {}",
        provisioner,
        name_of(chosen)
    );
    Ok(name_of(chosen).to_string())
}

pub async fn check_csi(ctx: &CheckContext<'_>) -> Result<Option<String>> {
    let version = ctx
        .gateway
        .preferred_version(API_EXTENSIONS_GROUP)
        .await
        .context("Failed to discover the API extensions version")?;
    let gvk = crd_gvk(&version);

    let mut missing = Vec::new();
    for crd in CSI_CRDS {
        match ctx.gateway.get_dynamic(&gvk, "", crd).await {
            Ok(_) => info!("✓ Found CSI API - {} on cluster", crd),
            Err(e) if e.is_not_found() => {
                error!("✗ Not found CSI API - {}", crd);
                missing.push(crd);
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to get CRD {}", crd)),
        }
    }

    let found = CSI_CRDS.len() - missing.len();
    if found != CSI_CRDS.len() {
        anyhow::bail!(
            "some CSI APIs not found in cluster ({}/{} found), missing: {}",
            found,
            CSI_CRDS.len(),
            missing.join(", ")
        );
    }
    Ok(Some(format!("{}/{} CSI APIs found", found, CSI_CRDS.len())))
}

/// Resolve the cluster DNS name from inside a pod
///
/// The pod is deleted only on success and otherwise left for diagnosis.
pub async fn check_dns_resolution(ctx: &CheckContext<'_>) -> Result<Option<String>> {
    let resources = ctx.resources();
    let pod = resources.specs().dns_pod()?;
    let handle = resources.create_pod(&pod).await?;

    let what = format!("DNS pod {}", handle.name);
    resources.wait_pod_ready(&handle).await.into_result(&what)?;

    let opts = ExecOptions {
        namespace: handle.namespace.clone(),
        pod_name: handle.name.clone(),
        container_name: DNS_CONTAINER_NAME.to_string(),
        command: vec!["nslookup".to_string(), DNS_LOOKUP_TARGET.to_string()],
    };
    exec_in_pod(ctx.gateway, &opts, ctx.cancel).await.with_context(|| {
        format!(
            "not able to resolve DNS '{}' service inside pods",
            DNS_LOOKUP_TARGET
        )
    })?;

    match resources.delete(&handle).await {
        Ok(()) => info!("Deleted DNS pod - '{}' successfully", handle.name),
        Err(e) => warn!(
            "Problem occurred deleting DNS pod - '{}' :: {}",
            handle.name, e
        ),
    }
    Ok(None)
}

/// Snapshot a PVC and restore it twice: once while the source is mounted,
/// once after its pod is gone
///
/// Created objects are left for cleanup; any failed step ends the check.
pub async fn check_volume_snapshot(
    ctx: &CheckContext<'_>,
    snapshot_class: &str,
) -> Result<Option<String>> {
    let resources = ctx.resources();
    let uid = ctx.uid;

    let pvc = resources
        .create_pvc(&resources.specs().source_pvc()?)
        .await?;
    let source_pod = resources
        .create_pod(&resources.specs().source_pod(&pvc.name)?)
        .await?;
    resources
        .wait_pod_ready(&source_pod)
        .await
        .into_result(&format!("source pod {}", source_pod.name))?;
    resources.log_pod_schedule(&source_pod).await?;

    let snapshot = snapshot_and_restore(
        &resources,
        &pvc,
        snapshot_class,
        &resource_name(SNAPSHOT_PREFIX, uid),
        &resource_name(RESTORE_PVC_PREFIX, uid),
        &resource_name(RESTORE_POD_PREFIX, uid),
    )
    .await?;
    info!("Restored pod - {} has expected data", resource_name(RESTORE_POD_PREFIX, uid));

    info!("Deleting source pod - {}", source_pod.name);
    ctx.cancel
        .guard(resources.delete(&source_pod))
        .await?
        .with_context(|| format!("Failed to delete source pod {}", source_pod.name))?;
    info!("Deleted source pod - {}", source_pod.name);

    snapshot_and_restore(
        &resources,
        &pvc,
        snapshot_class,
        &resource_name(UNMOUNTED_SNAPSHOT_PREFIX, uid),
        &resource_name(UNMOUNTED_RESTORE_PVC_PREFIX, uid),
        &resource_name(UNMOUNTED_RESTORE_POD_PREFIX, uid),
    )
    .await?;
    info!("✓ restored pod from volume snapshot of unmounted pv has expected data");

    Ok(snapshot.api_version.map(|v| format!("{}/{}", SNAPSHOT_GROUP, v)))
}

/// Snapshot `pvc`, restore it into a new PVC and pod, and verify the data
async fn snapshot_and_restore(
    resources: &ResourceManager<'_>,
    pvc: &ResourceHandle,
    snapshot_class: &str,
    snapshot_name: &str,
    restore_pvc_name: &str,
    restore_pod_name: &str,
) -> Result<ResourceHandle> {
    let snapshot = resources
        .create_snapshot(snapshot_name, snapshot_class, &pvc.name)
        .await?;
    resources
        .wait_snapshot_ready(&snapshot)
        .await
        .into_result(&format!("volume snapshot {} to be ready-to-use", snapshot.name))?;
    info!("✓ volume snapshot - {} is ready-to-use", snapshot.name);

    let restore_pvc = resources
        .create_pvc(
            &resources
                .specs()
                .restore_pvc(restore_pvc_name, &snapshot.name)?,
        )
        .await?;
    info!(
        "Created restore pvc - {} from volume snapshot - {}",
        restore_pvc.name, snapshot.name
    );

    let restore_pod = resources
        .create_pod(
            &resources
                .specs()
                .restore_pod(restore_pod_name, &restore_pvc.name)?,
        )
        .await?;
    resources
        .wait_pod_ready(&restore_pod)
        .await
        .into_result(&format!("restore pod {}", restore_pod.name))?;
    info!("✓ Restore pod - {} has reached into ready state", restore_pod.name);

    let opts = ExecOptions {
        namespace: restore_pod.namespace.clone(),
        pod_name: restore_pod.name.clone(),
        container_name: BUSYBOX_CONTAINER_NAME.to_string(),
        command: restore_data_check_command(),
    };
    exec_in_pod(resources.gateway(), &opts, resources.cancel())
        .await
        .with_context(|| format!("restored pod {} does not have the expected data", restore_pod.name))?;

    Ok(snapshot)
}
