/// Dynamic access to cluster-installed kinds (volume snapshots, CRDs)
///
/// Their schema is not compiled in: the version is discovered at runtime and
/// fields are read through a loosely typed accessor.
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use serde_json::Value;

pub const SNAPSHOT_GROUP: &str = "snapshot.storage.k8s.io";
pub const VOLUME_SNAPSHOT_KIND: &str = "VolumeSnapshot";
pub const VOLUME_SNAPSHOT_CLASS_KIND: &str = "VolumeSnapshotClass";

pub const API_EXTENSIONS_GROUP: &str = "apiextensions.k8s.io";
pub const CRD_KIND: &str = "CustomResourceDefinition";

pub const DEFAULT_SNAPSHOT_CLASS_ANNOTATION: &str = "snapshot.storage.kubernetes.io/is-default-class";

pub fn volume_snapshot_gvk(version: &str) -> GroupVersionKind {
    GroupVersionKind::gvk(SNAPSHOT_GROUP, version, VOLUME_SNAPSHOT_KIND)
}

pub fn volume_snapshot_class_gvk(version: &str) -> GroupVersionKind {
    GroupVersionKind::gvk(SNAPSHOT_GROUP, version, VOLUME_SNAPSHOT_CLASS_KIND)
}

pub fn crd_gvk(version: &str) -> GroupVersionKind {
    GroupVersionKind::gvk(API_EXTENSIONS_GROUP, version, CRD_KIND)
}

/// Walk `path` through the object's non-metadata fields
pub fn field<'a>(object: &'a DynamicObject, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(&object.data, |value, key| value.get(*key))
}

pub fn field_str<'a>(object: &'a DynamicObject, path: &[&str]) -> Option<&'a str> {
    field(object, path).and_then(Value::as_str)
}

pub fn field_bool(object: &DynamicObject, path: &[&str]) -> Option<bool> {
    field(object, path).and_then(Value::as_bool)
}

pub fn name_of(object: &DynamicObject) -> &str {
    object.metadata.name.as_deref().unwrap_or_default()
}

/// Whether a snapshot class is annotated as the cluster default
pub fn is_default_snapshot_class(object: &DynamicObject) -> bool {
    object
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(DEFAULT_SNAPSHOT_CLASS_ANNOTATION))
        .is_some_and(|v| v == "true")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::discovery::ApiResource;
    use serde_json::json;

    fn snapshot_class(name: &str, driver: &str, default: bool) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &ApiResource::from_gvk(&volume_snapshot_class_gvk("v1")));
        obj.data = json!({ "driver": driver, "deletionPolicy": "Delete" });
        if default {
            obj.metadata.annotations = Some(
                [(DEFAULT_SNAPSHOT_CLASS_ANNOTATION.to_string(), "true".to_string())]
                    .into_iter()
                    .collect(),
            );
        }
        obj
    }

    #[test]
    fn test_field_accessors() {
        let mut snap = DynamicObject::new("snap", &ApiResource::from_gvk(&volume_snapshot_gvk("v1")));
        snap.data = json!({ "status": { "readyToUse": true, "restoreSize": "1Gi" } });

        assert_eq!(field_bool(&snap, &["status", "readyToUse"]), Some(true));
        assert_eq!(field_str(&snap, &["status", "restoreSize"]), Some("1Gi"));
        assert_eq!(field_str(&snap, &["status", "missing"]), None);
        assert_eq!(field_bool(&snap, &["status", "restoreSize"]), None);
    }

    #[test]
    fn test_default_class_annotation() {
        assert!(is_default_snapshot_class(&snapshot_class("a", "csi.example.com", true)));
        assert!(!is_default_snapshot_class(&snapshot_class("b", "csi.example.com", false)));
        assert_eq!(
            field_str(&snapshot_class("a", "csi.example.com", true), &["driver"]),
            Some("csi.example.com")
        );
    }

    #[test]
    fn test_gvk_plural_resolution() {
        let resource = ApiResource::from_gvk(&volume_snapshot_class_gvk("v1beta1"));
        assert_eq!(resource.plural, "volumesnapshotclasses");
        assert_eq!(resource.api_version, "snapshot.storage.k8s.io/v1beta1");
        assert_eq!(ApiResource::from_gvk(&crd_gvk("v1")).plural, "customresourcedefinitions");
    }
}
