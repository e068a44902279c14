//! Desired label computation.
//!
//! Every write path (admission patch, convergence poller, reconciler) derives
//! its target state from [`compute_desired_labels`], so the three paths can
//! interleave freely and still agree on the end result.

use crate::snapshot::ObjectSnapshot;
use crate::types::Labels;

pub const ENVIRONMENT_LABEL: &str = "environment";
pub const OWNING_RESOURCE_LABEL: &str = "owningResource";
pub const IP_ADDRESS_LABEL: &str = "ipAddress";
pub const NODE_NAME_LABEL: &str = "nodeName";
pub const MISSING_VALUES_LABEL: &str = "missingLabelsValues";

/// Every key this system owns, in patch order
pub const MANAGED_LABELS: [&str; 5] = [
    ENVIRONMENT_LABEL,
    OWNING_RESOURCE_LABEL,
    IP_ADDRESS_LABEL,
    NODE_NAME_LABEL,
    MISSING_VALUES_LABEL,
];

pub const ENVIRONMENT_VALUE: &str = "production";
pub const PENDING_VALUE: &str = "pending";
pub const NO_OWNER_VALUE: &str = "None";
pub const MISSING_VALUES_FLAG: &str = "true";

/// Owner kinds reported verbatim; anything else maps to `"None"`
pub const TRACKED_OWNER_KINDS: [&str; 3] = ["ReplicaSet", "StatefulSet", "Job"];

/// Desired values for the managed label keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredLabelSet {
    labels: Labels,
}

impl DesiredLabelSet {
    /// Value for a managed key, `None` when the key must be absent
    pub fn get(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.labels.contains_key(key)
    }

    /// Whether the address or host is still a placeholder
    pub fn is_pending(&self) -> bool {
        self.contains(MISSING_VALUES_LABEL)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn as_map(&self) -> &Labels {
        &self.labels
    }

    pub fn into_map(self) -> Labels {
        self.labels
    }
}

/// Resolve the `owningResource` value from the first owner reference only
pub fn owning_resource(owner_kinds: &[String]) -> &str {
    owner_kinds
        .first()
        .map(String::as_str)
        .filter(|kind| TRACKED_OWNER_KINDS.contains(kind))
        .unwrap_or(NO_OWNER_VALUE)
}

/// Compute the desired labels for a snapshot.
///
/// Depends only on the owner references, the pod IP and the node name; the
/// current labels never feed back into the result.
pub fn compute_desired_labels(snapshot: &ObjectSnapshot) -> DesiredLabelSet {
    let ip_address = snapshot.pod_ip.as_deref().unwrap_or(PENDING_VALUE);
    let node_name = snapshot.node_name.as_deref().unwrap_or(PENDING_VALUE);

    let mut labels = Labels::new();
    labels.insert(ENVIRONMENT_LABEL.to_string(), ENVIRONMENT_VALUE.to_string());
    labels.insert(
        OWNING_RESOURCE_LABEL.to_string(),
        owning_resource(&snapshot.owner_kinds).to_string(),
    );
    labels.insert(IP_ADDRESS_LABEL.to_string(), ip_address.to_string());
    labels.insert(NODE_NAME_LABEL.to_string(), node_name.to_string());

    if ip_address == PENDING_VALUE || node_name == PENDING_VALUE {
        labels.insert(
            MISSING_VALUES_LABEL.to_string(),
            MISSING_VALUES_FLAG.to_string(),
        );
    }

    DesiredLabelSet { labels }
}
