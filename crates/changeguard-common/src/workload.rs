//! Workload kinds the operator understands
//!
//! Deployments and StatefulSets can be protected; ReplicaSets only appear as
//! intermediate owners between a Deployment and its pods. Kind-specific
//! behaviour lives here so the resolver, reconcilers and webhooks never branch
//! on kind themselves.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};

use crate::brief::ExecutionBrief;
use crate::{Error, POD_TEMPLATE_HASH_LABEL};

/// Supported workload kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 StatefulSet
    StatefulSet,
    /// apps/v1 ReplicaSet (owner walk only)
    ReplicaSet,
}

impl WorkloadKind {
    /// API group of every supported kind
    pub const GROUP: &'static str = "apps";

    /// API version of every supported kind
    pub const API_VERSION: &'static str = "apps/v1";

    /// Parse a group/kind pair
    pub fn from_group_kind(group: &str, kind: &str) -> Option<Self> {
        if group != Self::GROUP {
            return None;
        }
        match kind {
            "Deployment" => Some(WorkloadKind::Deployment),
            "StatefulSet" => Some(WorkloadKind::StatefulSet),
            "ReplicaSet" => Some(WorkloadKind::ReplicaSet),
            _ => None,
        }
    }

    /// Parse an owner reference's apiVersion/kind
    pub fn from_owner(owner: &OwnerReference) -> Option<Self> {
        let group = owner
            .api_version
            .split_once('/')
            .map(|(g, _)| g)
            .unwrap_or("");
        Self::from_group_kind(group, &owner.kind)
    }

    /// Whether a ChangeDefense may target this kind
    pub fn is_target(self) -> bool {
        matches!(self, WorkloadKind::Deployment | WorkloadKind::StatefulSet)
    }

    /// Kind name
    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::ReplicaSet => "ReplicaSet",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fetched workload object
#[derive(Clone, Debug)]
pub enum Workload {
    /// Deployment
    Deployment(Deployment),
    /// StatefulSet
    StatefulSet(StatefulSet),
    /// ReplicaSet
    ReplicaSet(ReplicaSet),
}

impl Workload {
    /// Decode an object of a known kind from JSON (e.g. an admission payload)
    pub fn from_value(kind: WorkloadKind, value: serde_json::Value) -> Result<Self, Error> {
        let decoded = match kind {
            WorkloadKind::Deployment => serde_json::from_value(value).map(Workload::Deployment),
            WorkloadKind::StatefulSet => serde_json::from_value(value).map(Workload::StatefulSet),
            WorkloadKind::ReplicaSet => serde_json::from_value(value).map(Workload::ReplicaSet),
        };
        decoded.map_err(|e| Error::serialization_for_kind(kind.as_str(), e.to_string()))
    }

    /// Kind of this workload
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Workload::Deployment(_) => WorkloadKind::Deployment,
            Workload::StatefulSet(_) => WorkloadKind::StatefulSet,
            Workload::ReplicaSet(_) => WorkloadKind::ReplicaSet,
        }
    }

    /// Object metadata
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Workload::Deployment(d) => &d.metadata,
            Workload::StatefulSet(s) => &s.metadata,
            Workload::ReplicaSet(r) => &r.metadata,
        }
    }

    /// Object name
    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    /// Object namespace
    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    /// Object UID
    pub fn uid(&self) -> Option<&str> {
        self.meta().uid.as_deref()
    }

    /// `kind namespace/name` for logs and errors
    pub fn key(&self) -> String {
        format!("{} {}/{}", self.kind(), self.namespace(), self.name())
    }

    /// Pod label selector
    pub fn selector(&self) -> Option<&LabelSelector> {
        match self {
            Workload::Deployment(d) => d.spec.as_ref().map(|s| &s.selector),
            Workload::StatefulSet(s) => s.spec.as_ref().map(|s| &s.selector),
            Workload::ReplicaSet(r) => r.spec.as_ref().map(|s| &s.selector),
        }
    }

    /// Pod template
    pub fn template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Workload::Deployment(d) => d.spec.as_ref().map(|s| &s.template),
            Workload::StatefulSet(s) => s.spec.as_ref().map(|s| &s.template),
            Workload::ReplicaSet(r) => r.spec.as_ref().and_then(|s| s.template.as_ref()),
        }
    }

    /// Desired replica count (Kubernetes defaults an unset value to 1)
    pub fn replicas(&self) -> i32 {
        let replicas = match self {
            Workload::Deployment(d) => d.spec.as_ref().and_then(|s| s.replicas),
            Workload::StatefulSet(s) => s.spec.as_ref().and_then(|s| s.replicas),
            Workload::ReplicaSet(r) => r.spec.as_ref().and_then(|s| s.replicas),
        };
        replicas.unwrap_or(1)
    }

    /// Template revision recorded on the object itself.
    ///
    /// StatefulSets record their update revision in status and ReplicaSets
    /// carry their template hash as a label. Deployments record nothing: their
    /// revision is the hash of the newest owned ReplicaSet.
    pub fn template_hash(&self) -> Option<&str> {
        match self {
            Workload::Deployment(_) => None,
            Workload::StatefulSet(s) => s.status.as_ref().and_then(|st| st.update_revision.as_deref()),
            Workload::ReplicaSet(r) => r
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(POD_TEMPLATE_HASH_LABEL))
                .map(String::as_str),
        }
    }

    /// The owner reference marked as controller, if any
    pub fn controller_owner(&self) -> Option<&OwnerReference> {
        controller_owner(self.meta())
    }

    /// Annotations, or an empty map
    pub fn annotations(&self) -> &BTreeMap<String, String> {
        static EMPTY: BTreeMap<String, String> = BTreeMap::new();
        self.meta().annotations.as_ref().unwrap_or(&EMPTY)
    }

    /// Execution brief carried by this workload
    pub fn brief(&self) -> Result<Option<ExecutionBrief>, Error> {
        ExecutionBrief::from_annotations(self.annotations())
    }
}

/// The owner reference marked as controller, if any
pub fn controller_owner(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|o| o.controller == Some(true))
}

/// Render a label selector in the Kubernetes selector string syntax.
///
/// An empty selector would match every pod in the namespace, so it is
/// rejected.
pub fn selector_string(selector: &LabelSelector) -> Result<String, Error> {
    let mut terms: Vec<String> = Vec::new();

    if let Some(labels) = &selector.match_labels {
        terms.extend(labels.iter().map(|(k, v)| format!("{k}={v}")));
    }

    for expr in selector.match_expressions.iter().flatten() {
        let values = expr.values.clone().unwrap_or_default().join(",");
        let term = match expr.operator.as_str() {
            "In" => format!("{} in ({})", expr.key, values),
            "NotIn" => format!("{} notin ({})", expr.key, values),
            "Exists" => expr.key.clone(),
            "DoesNotExist" => format!("!{}", expr.key),
            other => {
                return Err(Error::validation(format!(
                    "unsupported selector operator {other} on {}",
                    expr.key
                )))
            }
        };
        terms.push(term);
    }

    if terms.is_empty() {
        return Err(Error::validation("label selector is empty"));
    }
    Ok(terms.join(","))
}
