use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Label mapping as carried in `metadata.labels`
pub type Labels = BTreeMap<String, String>;

/// Namespace assumed when an object does not carry one
pub const DEFAULT_NAMESPACE: &str = "default";

/// PodKey uniquely identifies a Pod instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodKey {
    /// Namespace of the pod
    pub namespace: String,
    /// Pod name
    pub name: String,
}

impl PodKey {
    /// Create a new PodKey
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build a key from optional metadata fields, defaulting the namespace.
    ///
    /// Returns `None` when the name is missing or empty.
    pub fn from_parts(namespace: Option<&str>, name: Option<&str>) -> Option<Self> {
        let name = name.filter(|n| !n.is_empty())?;
        let namespace = namespace
            .filter(|ns| !ns.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE);
        Some(Self::new(namespace, name))
    }

    /// API path of the pod relative to the server root
    pub fn api_path(&self) -> String {
        format!("api/v1/namespaces/{}/pods/{}", self.namespace, self.name)
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// ResourceVersion is the opaque token used for optimistic concurrency
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceVersion(pub String);

impl ResourceVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
