/// In-memory cluster for scenario tests
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, PodCondition, PodStatus};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use super::dynamic::{
    crd_gvk, volume_snapshot_class_gvk, API_EXTENSIONS_GROUP, DEFAULT_SNAPSHOT_CLASS_ANNOTATION,
    SNAPSHOT_GROUP, VOLUME_SNAPSHOT_KIND,
};
use super::gateway::{ApiGroupInfo, ClusterGateway, ExecOutput, GatewayError};

type DynamicKey = (String, String, String);

#[derive(Default)]
struct State {
    storage_classes: BTreeMap<String, StorageClass>,
    pods: BTreeMap<(String, String), Pod>,
    pvcs: BTreeMap<(String, String), PersistentVolumeClaim>,
    dynamic: BTreeMap<DynamicKey, DynamicObject>,
    groups: Vec<ApiGroupInfo>,
    exec_calls: Vec<(String, Vec<String>)>,
    deleted: Vec<String>,
    failing_deletes: BTreeSet<String>,
}

/// Cluster double honouring names, namespaces and label selectors
pub struct FakeCluster {
    state: Mutex<State>,
    server_version: String,
    pods_ready: bool,
    snapshots_ready: bool,
    exec_success: bool,
    exec_stalls: bool,
    reachable: bool,
}

fn dynamic_key(gvk: &GroupVersionKind, namespace: &str, name: &str) -> DynamicKey {
    (gvk.kind.clone(), namespace.to_string(), name.to_string())
}

fn group(name: &str, versions: &[&str]) -> ApiGroupInfo {
    ApiGroupInfo {
        name: name.to_string(),
        versions: versions.iter().map(|v| v.to_string()).collect(),
        preferred_version: versions.first().map(|v| v.to_string()),
    }
}

/// Match `k=v,k2=v2` selectors against a label map
fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.and_then(|l| l.get(key)).is_some_and(|v| v == value),
            None => labels.is_some_and(|l| l.contains_key(term)),
        })
}

fn not_found(kind: &str, name: &str) -> GatewayError {
    GatewayError::NotFound {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

impl FakeCluster {
    /// A cluster serving the core, RBAC, snapshot (v1) and API-extensions groups
    pub fn new() -> Self {
        let state = State {
            groups: vec![
                group("", &["v1"]),
                group("apps", &["v1"]),
                group("rbac.authorization.k8s.io", &["v1"]),
                group(SNAPSHOT_GROUP, &["v1"]),
                group(API_EXTENSIONS_GROUP, &["v1"]),
            ],
            ..State::default()
        };
        Self {
            state: Mutex::new(state),
            server_version: "v1.27.3".to_string(),
            pods_ready: true,
            snapshots_ready: true,
            exec_success: true,
            exec_stalls: false,
            reachable: true,
        }
    }

    pub fn with_server_version(mut self, version: &str) -> Self {
        self.server_version = version.to_string();
        self
    }

    pub fn with_pods_ready(mut self, ready: bool) -> Self {
        self.pods_ready = ready;
        self
    }

    pub fn with_snapshots_ready(mut self, ready: bool) -> Self {
        self.snapshots_ready = ready;
        self
    }

    pub fn with_exec_success(mut self, success: bool) -> Self {
        self.exec_success = success;
        self
    }

    /// Exec streams that never produce a result
    pub fn with_exec_stalled(mut self) -> Self {
        self.exec_stalls = true;
        self
    }

    pub fn with_unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    /// Serve the snapshot group at `version` only
    pub fn with_snapshot_version(self, version: &str) -> Self {
        self.set_group(group(SNAPSHOT_GROUP, &[version]));
        self
    }

    pub fn with_group(self, name: &str, versions: &[&str]) -> Self {
        self.set_group(group(name, versions));
        self
    }

    pub fn without_group(self, name: &str) -> Self {
        self.lock().groups.retain(|g| g.name != name);
        self
    }

    pub fn with_storage_class(self, name: &str, provisioner: &str) -> Self {
        let class: StorageClass = serde_json::from_value(json!({
            "apiVersion": "storage.k8s.io/v1",
            "kind": "StorageClass",
            "metadata": { "name": name },
            "provisioner": provisioner,
        }))
        .unwrap();
        self.lock().storage_classes.insert(name.to_string(), class);
        self
    }

    pub fn with_snapshot_class(self, name: &str, driver: &str, default: bool) -> Self {
        let gvk = volume_snapshot_class_gvk("v1");
        let mut class = DynamicObject::new(name, &ApiResource::from_gvk(&gvk));
        class.data = json!({ "driver": driver, "deletionPolicy": "Delete" });
        if default {
            class.metadata.annotations = Some(
                [(DEFAULT_SNAPSHOT_CLASS_ANNOTATION.to_string(), "true".to_string())]
                    .into_iter()
                    .collect(),
            );
        }
        self.lock().dynamic.insert(dynamic_key(&gvk, "", name), class);
        self
    }

    pub fn with_crds(self, names: &[&str]) -> Self {
        let gvk = crd_gvk("v1");
        {
            let mut state = self.lock();
            for name in names {
                let crd = DynamicObject::new(name, &ApiResource::from_gvk(&gvk));
                state.dynamic.insert(dynamic_key(&gvk, "", name), crd);
            }
        }
        self
    }

    /// Make deletion of every object whose name starts with `prefix` fail
    pub fn with_failing_delete(self, prefix: &str) -> Self {
        self.lock().failing_deletes.insert(prefix.to_string());
        self
    }

    fn set_group(&self, info: ApiGroupInfo) {
        let mut state = self.lock();
        state.groups.retain(|g| g.name != info.name);
        state.groups.push(info);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.lock().pods.keys().map(|(_, n)| n.clone()).collect()
    }

    pub fn pvc_names(&self) -> Vec<String> {
        self.lock().pvcs.keys().map(|(_, n)| n.clone()).collect()
    }

    pub fn snapshot_names(&self) -> Vec<String> {
        self.lock()
            .dynamic
            .keys()
            .filter(|(kind, _, _)| kind == VOLUME_SNAPSHOT_KIND)
            .map(|(_, _, n)| n.clone())
            .collect()
    }

    /// Names of deleted objects, in deletion order
    pub fn deleted(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    /// `(pod, command)` of every exec call
    pub fn exec_calls(&self) -> Vec<(String, Vec<String>)> {
        self.lock().exec_calls.clone()
    }

    /// Whether any object was created or any exec was issued
    pub fn touched(&self) -> bool {
        let state = self.lock();
        !state.pods.is_empty() || !state.pvcs.is_empty() || !state.exec_calls.is_empty()
    }

    fn check_delete(&self, state: &State, kind: &str, name: &str) -> Result<(), GatewayError> {
        if state.failing_deletes.iter().any(|p| name.starts_with(p.as_str())) {
            return Err(GatewayError::Api(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: format!("injected delete failure for {} {}", kind, name),
                reason: "InternalError".to_string(),
                code: 500,
            })));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterGateway for FakeCluster {
    async fn get_namespace(&self, name: &str) -> Result<(), GatewayError> {
        if self.reachable {
            Ok(())
        } else {
            Err(GatewayError::Connect(format!("namespace {}: connection refused", name)))
        }
    }

    async fn server_version(&self) -> Result<String, GatewayError> {
        Ok(self.server_version.clone())
    }

    async fn server_groups(&self) -> Result<Vec<ApiGroupInfo>, GatewayError> {
        Ok(self.lock().groups.clone())
    }

    async fn preferred_version(&self, group: &str) -> Result<String, GatewayError> {
        self.lock()
            .groups
            .iter()
            .find(|g| g.name == group)
            .and_then(|g| g.preferred_version.clone())
            .ok_or_else(|| GatewayError::GroupNotFound(group.to_string()))
    }

    async fn get_storage_class(&self, name: &str) -> Result<StorageClass, GatewayError> {
        self.lock()
            .storage_classes
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("StorageClass", name))
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, GatewayError> {
        let mut pod = pod.clone();
        let name = pod.metadata.name.clone().unwrap_or_default();
        pod.metadata.namespace = Some(namespace.to_string());
        if self.pods_ready {
            if let Some(spec) = pod.spec.as_mut() {
                spec.node_name = Some("node-1".to_string());
            }
            pod.status = Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..PodCondition::default()
                }]),
                ..PodStatus::default()
            });
        } else {
            pod.status = Some(PodStatus {
                phase: Some("Pending".to_string()),
                ..PodStatus::default()
            });
        }
        self.lock()
            .pods
            .insert((namespace.to_string(), name), pod.clone());
        Ok(pod)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, GatewayError> {
        self.lock()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found("Pod", name))
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, GatewayError> {
        Ok(self
            .lock()
            .pods
            .iter()
            .filter(|((ns, _), pod)| {
                ns == namespace && matches_selector(pod.metadata.labels.as_ref(), selector)
            })
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), GatewayError> {
        let mut state = self.lock();
        self.check_delete(&state, "pod", name)?;
        state
            .pods
            .remove(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| not_found("Pod", name))?;
        state.deleted.push(name.to_string());
        Ok(())
    }

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, GatewayError> {
        let mut pvc = pvc.clone();
        pvc.metadata.namespace = Some(namespace.to_string());
        let name = pvc.metadata.name.clone().unwrap_or_default();
        self.lock()
            .pvcs
            .insert((namespace.to_string(), name), pvc.clone());
        Ok(pvc)
    }

    async fn list_pvcs(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, GatewayError> {
        Ok(self
            .lock()
            .pvcs
            .iter()
            .filter(|((ns, _), pvc)| {
                ns == namespace && matches_selector(pvc.metadata.labels.as_ref(), selector)
            })
            .map(|(_, pvc)| pvc.clone())
            .collect())
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), GatewayError> {
        let mut state = self.lock();
        self.check_delete(&state, "pvc", name)?;
        state
            .pvcs
            .remove(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| not_found("PersistentVolumeClaim", name))?;
        state.deleted.push(name.to_string());
        Ok(())
    }

    async fn get_dynamic(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, GatewayError> {
        self.lock()
            .dynamic
            .get(&dynamic_key(gvk, namespace, name))
            .cloned()
            .ok_or_else(|| not_found(&gvk.kind, name))
    }

    async fn list_dynamic(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>, GatewayError> {
        Ok(self
            .lock()
            .dynamic
            .iter()
            .filter(|((kind, ns, _), obj)| {
                *kind == gvk.kind
                    && ns == namespace
                    && matches_selector(obj.metadata.labels.as_ref(), selector)
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create_dynamic(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, GatewayError> {
        let mut object = object.clone();
        let name = object.metadata.name.clone().unwrap_or_default();
        if gvk.kind == VOLUME_SNAPSHOT_KIND {
            object.data["status"] = json!({ "readyToUse": self.snapshots_ready });
        }
        self.lock()
            .dynamic
            .insert(dynamic_key(gvk, namespace, &name), object.clone());
        Ok(object)
    }

    async fn delete_dynamic(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), GatewayError> {
        let mut state = self.lock();
        self.check_delete(&state, &gvk.kind, name)?;
        state
            .dynamic
            .remove(&dynamic_key(gvk, namespace, name))
            .ok_or_else(|| not_found(&gvk.kind, name))?;
        state.deleted.push(name.to_string());
        Ok(())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        _container: &str,
        command: &[String],
    ) -> Result<ExecOutput, GatewayError> {
        {
            let mut state = self.lock();
            if !state
                .pods
                .contains_key(&(namespace.to_string(), pod.to_string()))
            {
                return Err(not_found("Pod", pod));
            }
            state.exec_calls.push((pod.to_string(), command.to_vec()));
        }
        if self.exec_stalls {
            std::future::pending::<()>().await;
        }
        Ok(ExecOutput {
            stdout: String::new(),
            stderr: if self.exec_success {
                String::new()
            } else {
                "command failed".to_string()
            },
            success: self.exec_success,
            message: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_matching() {
        let labels: BTreeMap<String, String> = [
            ("app".to_string(), "x".to_string()),
            ("run".to_string(), "abc".to_string()),
        ]
        .into_iter()
        .collect();

        assert!(matches_selector(Some(&labels), ""));
        assert!(matches_selector(Some(&labels), "app=x"));
        assert!(matches_selector(Some(&labels), "app=x,run=abc"));
        assert!(!matches_selector(Some(&labels), "app=y"));
        assert!(matches_selector(Some(&labels), "run"));
        assert!(!matches_selector(None, "app=x"));
    }
}
