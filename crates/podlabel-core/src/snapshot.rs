use crate::types::{Labels, PodKey, ResourceVersion, DEFAULT_NAMESPACE};
use k8s_openapi::api::core::v1::Pod;

/// Read-only view of a Pod at a point in time.
///
/// A snapshot is never updated in place; fetching or decoding the object again
/// produces a new one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectSnapshot {
    pub name: String,
    pub namespace: String,
    /// Version token for optimistic concurrency. Absent on objects that have
    /// not been persisted yet (admission time).
    pub resource_version: Option<ResourceVersion>,
    /// Owner reference kinds, in declaration order
    pub owner_kinds: Vec<String>,
    /// Current labels; `None` when the object has no label map at all
    pub labels: Option<Labels>,
    pub pod_ip: Option<String>,
    pub node_name: Option<String>,
}

impl ObjectSnapshot {
    /// Build a snapshot from whatever fields the Pod currently carries.
    ///
    /// Empty strings for the address and host are treated as absent.
    pub fn from_pod(pod: &Pod) -> Self {
        let metadata = &pod.metadata;

        let owner_kinds = metadata
            .owner_references
            .as_ref()
            .map(|refs| refs.iter().map(|r| r.kind.clone()).collect())
            .unwrap_or_default();

        let pod_ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .filter(|ip| !ip.is_empty());

        let node_name = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .filter(|n| !n.is_empty());

        Self {
            name: metadata.name.clone().unwrap_or_default(),
            namespace: metadata
                .namespace
                .clone()
                .filter(|ns| !ns.is_empty())
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            resource_version: metadata
                .resource_version
                .clone()
                .filter(|v| !v.is_empty())
                .map(ResourceVersion::new),
            owner_kinds,
            labels: metadata.labels.clone(),
            pod_ip,
            node_name,
        }
    }

    /// Key of the snapshotted object, if it has a name
    pub fn key(&self) -> Option<PodKey> {
        PodKey::from_parts(Some(&self.namespace), Some(&self.name))
    }

    /// Both the address and the host have been assigned
    pub fn is_resolved(&self) -> bool {
        self.pod_ip.is_some() && self.node_name.is_some()
    }

    /// Names of the placement attributes that are still unassigned
    pub fn missing_attributes(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.pod_ip.is_none() {
            missing.push("podIP");
        }
        if self.node_name.is_none() {
            missing.push("nodeName");
        }
        missing
    }
}

impl From<&Pod> for ObjectSnapshot {
    fn from(pod: &Pod) -> Self {
        Self::from_pod(pod)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn owner(kind: &str) -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: kind.to_string(),
            name: "owner".to_string(),
            uid: "1234".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_snapshot_from_unscheduled_pod() {
        let mut pod = Pod::default();
        pod.metadata.name = Some("nginx".to_string());

        let snapshot = ObjectSnapshot::from_pod(&pod);

        assert_eq!(snapshot.name, "nginx");
        assert_eq!(snapshot.namespace, "default");
        assert!(snapshot.resource_version.is_none());
        assert!(snapshot.owner_kinds.is_empty());
        assert!(snapshot.labels.is_none());
        assert!(!snapshot.is_resolved());
        assert_eq!(snapshot.missing_attributes(), vec!["podIP", "nodeName"]);
    }

    #[test]
    fn test_snapshot_from_scheduled_pod() {
        let mut pod = Pod::default();
        pod.metadata.name = Some("web-0".to_string());
        pod.metadata.namespace = Some("apps".to_string());
        pod.metadata.resource_version = Some("42".to_string());
        pod.metadata.owner_references = Some(vec![owner("StatefulSet"), owner("Job")]);
        pod.spec = Some(PodSpec {
            node_name: Some("node-1".to_string()),
            ..Default::default()
        });
        pod.status = Some(PodStatus {
            pod_ip: Some("10.0.0.5".to_string()),
            ..Default::default()
        });

        let snapshot = ObjectSnapshot::from(&pod);

        assert_eq!(snapshot.key(), Some(PodKey::new("apps", "web-0")));
        assert_eq!(snapshot.resource_version, Some(ResourceVersion::new("42")));
        assert_eq!(snapshot.owner_kinds, vec!["StatefulSet", "Job"]);
        assert_eq!(snapshot.pod_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(snapshot.node_name.as_deref(), Some("node-1"));
        assert!(snapshot.is_resolved());
        assert!(snapshot.missing_attributes().is_empty());
    }

    #[test]
    fn test_empty_strings_are_absent() {
        let mut pod = Pod::default();
        pod.metadata.name = Some("nginx".to_string());
        pod.spec = Some(PodSpec {
            node_name: Some(String::new()),
            ..Default::default()
        });
        pod.status = Some(PodStatus {
            pod_ip: Some(String::new()),
            ..Default::default()
        });

        let snapshot = ObjectSnapshot::from_pod(&pod);
        assert!(snapshot.pod_ip.is_none());
        assert!(snapshot.node_name.is_none());
    }

    #[test]
    fn test_empty_label_map_is_distinct_from_missing() {
        let mut pod = Pod::default();
        pod.metadata.labels = Some(Labels::new());

        let snapshot = ObjectSnapshot::from_pod(&pod);
        assert_eq!(snapshot.labels, Some(Labels::new()));
        assert_eq!(snapshot.key(), None);
    }
}
