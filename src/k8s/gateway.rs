/// Cluster gateway: the single handle through which the checks reach the cluster
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, AttachParams, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::{Client, Config};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Errors returned by the cluster gateway
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    #[error("API group {0} is not served by the cluster")]
    GroupNotFound(String),

    /// Discovery succeeded only partly; `groups` holds what was returned
    #[error("unable to retrieve the complete list of server APIs: {message}")]
    PartialDiscovery {
        groups: Vec<ApiGroupInfo>,
        message: String,
    },

    #[error("exec in pod '{pod}' failed: {message}")]
    Exec { pod: String, message: String },

    #[error("failed to build kubernetes client: {0}")]
    Connect(String),

    #[error(transparent)]
    Api(#[from] kube::Error),
}

impl GatewayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound { .. })
    }
}

/// One API group as reported by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiGroupInfo {
    pub name: String,
    pub versions: Vec<String>,
    pub preferred_version: Option<String>,
}

impl ApiGroupInfo {
    /// `group/version` strings; the core group yields bare versions
    pub fn group_versions(&self) -> impl Iterator<Item = String> + '_ {
        self.versions.iter().map(move |v| {
            if self.name.is_empty() {
                v.clone()
            } else {
                format!("{}/{}", self.name, v)
            }
        })
    }
}

/// Captured result of a command run inside a container
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    /// Failure message reported by the exec status, if any
    pub message: Option<String>,
}

/// Trait abstracting every cluster operation the preflight run needs
///
/// Implemented by [`KubeGateway`] for real clusters and mocked in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Fetch a namespace, proving read access to the cluster
    async fn get_namespace(&self, name: &str) -> Result<(), GatewayError>;

    /// Server `gitVersion`, e.g. `v1.27.3`
    async fn server_version(&self) -> Result<String, GatewayError>;

    /// All API groups served, the core group included under the empty name
    async fn server_groups(&self) -> Result<Vec<ApiGroupInfo>, GatewayError>;

    /// Preferred version of an API group
    async fn preferred_version(&self, group: &str) -> Result<String, GatewayError>;

    async fn get_storage_class(&self, name: &str) -> Result<StorageClass, GatewayError>;

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, GatewayError>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, GatewayError>;

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, GatewayError>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), GatewayError>;

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, GatewayError>;

    async fn list_pvcs(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, GatewayError>;

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), GatewayError>;

    /// Get an object addressed by GVK; an empty `namespace` addresses
    /// cluster-scoped kinds
    async fn get_dynamic(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, GatewayError>;

    async fn list_dynamic(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>, GatewayError>;

    async fn create_dynamic(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, GatewayError>;

    async fn delete_dynamic(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), GatewayError>;

    /// Run `command` in a container and wait for it to exit
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput, GatewayError>;
}

/// Real gateway backed by a kube client
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
}

impl KubeGateway {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from an explicit kubeconfig, or the default chain
    /// (`$KUBECONFIG`, `~/.kube/config`, in-cluster) when none is given
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self, GatewayError> {
        let config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| GatewayError::Connect(e.to_string()))?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| GatewayError::Connect(e.to_string()))?
            }
            None => Config::infer()
                .await
                .map_err(|e| GatewayError::Connect(e.to_string()))?,
        };
        let client = Client::try_from(config).map_err(|e| GatewayError::Connect(e.to_string()))?;
        Ok(Self::new(client))
    }

    fn dynamic_api(&self, gvk: &GroupVersionKind, namespace: &str) -> Api<DynamicObject> {
        let resource = ApiResource::from_gvk(gvk);
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), &resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &resource)
        }
    }
}

/// Map a kube error, turning 404s into `NotFound`
fn classify(kind: &str, name: &str) -> impl FnOnce(kube::Error) -> GatewayError {
    let (kind, name) = (kind.to_string(), name.to_string());
    move |err| match err {
        kube::Error::Api(ae) if ae.code == 404 => GatewayError::NotFound { kind, name },
        other => GatewayError::Api(other),
    }
}

fn list_params(selector: &str) -> ListParams {
    if selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(selector)
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn get_namespace(&self, name: &str) -> Result<(), GatewayError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.get(name).await.map_err(classify("Namespace", name))?;
        Ok(())
    }

    async fn server_version(&self) -> Result<String, GatewayError> {
        let info = self.client.apiserver_version().await?;
        Ok(info.git_version)
    }

    async fn server_groups(&self) -> Result<Vec<ApiGroupInfo>, GatewayError> {
        let group_list = self.client.list_api_groups().await?;
        let mut groups: Vec<ApiGroupInfo> = group_list
            .groups
            .into_iter()
            .map(|g| ApiGroupInfo {
                name: g.name,
                versions: g.versions.into_iter().map(|v| v.version).collect(),
                preferred_version: g.preferred_version.map(|v| v.version),
            })
            .collect();

        // The legacy core group lives under /api, not /apis
        match self.client.list_core_api_versions().await {
            Ok(core) => {
                let preferred_version = core.versions.first().cloned();
                groups.insert(
                    0,
                    ApiGroupInfo {
                        name: String::new(),
                        versions: core.versions,
                        preferred_version,
                    },
                );
                Ok(groups)
            }
            Err(e) => Err(GatewayError::PartialDiscovery {
                groups,
                message: e.to_string(),
            }),
        }
    }

    async fn preferred_version(&self, group: &str) -> Result<String, GatewayError> {
        let group_list = self.client.list_api_groups().await?;
        group_list
            .groups
            .into_iter()
            .find(|g| g.name == group)
            .and_then(|g| {
                g.preferred_version
                    .map(|v| v.version)
                    .or_else(|| g.versions.into_iter().next().map(|v| v.version))
            })
            .ok_or_else(|| GatewayError::GroupNotFound(group.to_string()))
    }

    async fn get_storage_class(&self, name: &str) -> Result<StorageClass, GatewayError> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        api.get(name).await.map_err(classify("StorageClass", name))
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, GatewayError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), pod).await?)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, GatewayError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(classify("Pod", name))
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, GatewayError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&list_params(selector)).await?.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), GatewayError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(classify("Pod", name))?;
        Ok(())
    }

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, GatewayError> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), pvc).await?)
    }

    async fn list_pvcs(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, GatewayError> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&list_params(selector)).await?.items)
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), GatewayError> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(classify("PersistentVolumeClaim", name))?;
        Ok(())
    }

    async fn get_dynamic(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, GatewayError> {
        self.dynamic_api(gvk, namespace)
            .get(name)
            .await
            .map_err(classify(&gvk.kind, name))
    }

    async fn list_dynamic(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>, GatewayError> {
        let list = self
            .dynamic_api(gvk, namespace)
            .list(&list_params(selector))
            .await?;
        Ok(list.items)
    }

    async fn create_dynamic(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, GatewayError> {
        Ok(self
            .dynamic_api(gvk, namespace)
            .create(&PostParams::default(), object)
            .await?)
    }

    async fn delete_dynamic(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), GatewayError> {
        self.dynamic_api(gvk, namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(classify(&gvk.kind, name))?;
        Ok(())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput, GatewayError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        debug!("exec in {}/{} [{}]: {:?}", namespace, pod, container, command);
        let mut attached = api
            .exec(pod, command.to_vec(), &params)
            .await
            .map_err(classify("Pod", pod))?;

        let exec_err = |e: std::io::Error| GatewayError::Exec {
            pod: pod.to_string(),
            message: e.to_string(),
        };

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();

        let read_stdout = async move {
            let mut out = String::new();
            if let Some(mut reader) = stdout {
                reader.read_to_string(&mut out).await?;
            }
            Ok::<_, std::io::Error>(out)
        };
        let read_stderr = async move {
            let mut out = String::new();
            if let Some(mut reader) = stderr {
                reader.read_to_string(&mut out).await?;
            }
            Ok::<_, std::io::Error>(out)
        };
        let (stdout, stderr) = futures::try_join!(read_stdout, read_stderr).map_err(exec_err)?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        attached.join().await.map_err(|e| GatewayError::Exec {
            pod: pod.to_string(),
            message: e.to_string(),
        })?;

        let success = status
            .as_ref()
            .and_then(|s| s.status.as_deref())
            .map(|s| s == "Success")
            .unwrap_or(false);
        let message = status.and_then(|s| s.message);

        Ok(ExecOutput {
            stdout,
            stderr,
            success,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_versions() {
        let rbac = ApiGroupInfo {
            name: "rbac.authorization.k8s.io".to_string(),
            versions: vec!["v1".to_string(), "v1beta1".to_string()],
            preferred_version: Some("v1".to_string()),
        };
        let core = ApiGroupInfo {
            name: String::new(),
            versions: vec!["v1".to_string()],
            preferred_version: Some("v1".to_string()),
        };

        assert_eq!(
            rbac.group_versions().collect::<Vec<_>>(),
            vec!["rbac.authorization.k8s.io/v1", "rbac.authorization.k8s.io/v1beta1"]
        );
        assert_eq!(core.group_versions().collect::<Vec<_>>(), vec!["v1"]);
    }

    #[test]
    fn test_not_found_classification() {
        let err = GatewayError::NotFound {
            kind: "Pod".to_string(),
            name: "dns-abc123".to_string(),
        };
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Pod 'dns-abc123' not found");
        assert!(!GatewayError::GroupNotFound("x".to_string()).is_not_found());
    }

    #[test]
    fn test_list_params_selector() {
        assert!(list_params("").label_selector.is_none());
        assert_eq!(
            list_params("app=x").label_selector.as_deref(),
            Some("app=x")
        );
    }
}
