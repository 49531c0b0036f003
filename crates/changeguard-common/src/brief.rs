//! Execution brief: the annotation linking a workload to its current review
//!
//! The brief is written by the admission webhook into the same patch that
//! admits a template change, so it is a plain value with its own JSON
//! encoding rather than an object reference. Every component that needs to
//! resolve a workload (or one of its pods) back to an execution reads it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, BRIEF_ANNOTATION_KEY};

/// `{expected next generation, execution id, policy name}`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionBrief {
    /// Generation the workload will have once the update is persisted
    pub generation: i64,
    /// Review-service execution id
    pub defense_exec_id: String,
    /// Name of the ChangeDefense that triggered the review
    pub change_defense_name: String,
}

impl ExecutionBrief {
    /// Create a brief for a freshly triggered execution
    pub fn new(
        generation: i64,
        defense_exec_id: impl Into<String>,
        change_defense_name: impl Into<String>,
    ) -> Self {
        Self {
            generation,
            defense_exec_id: defense_exec_id.into(),
            change_defense_name: change_defense_name.into(),
        }
    }

    /// Name of the execution object this brief points at
    pub fn execution_name(&self) -> String {
        execution_name(&self.change_defense_name, &self.defense_exec_id)
    }

    /// Encode as the annotation value
    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self)
            .map_err(|e| Error::serialization_for_kind("ExecutionBrief", e.to_string()))
    }

    /// Decode an annotation value
    pub fn decode(raw: &str) -> Result<Self, Error> {
        serde_json::from_str(raw)
            .map_err(|e| Error::serialization_for_kind("ExecutionBrief", e.to_string()))
    }

    /// Read the brief from an object's annotations, if present
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Result<Option<Self>, Error> {
        annotations
            .get(BRIEF_ANNOTATION_KEY)
            .map(|raw| Self::decode(raw))
            .transpose()
    }

    /// True if an annotation map carries a brief
    pub fn is_present(annotations: &BTreeMap<String, String>) -> bool {
        annotations.contains_key(BRIEF_ANNOTATION_KEY)
    }
}

/// Execution object name for a policy and execution id
pub fn execution_name(change_defense_name: &str, defense_exec_id: &str) -> String {
    format!("{}-{}", change_defense_name, defense_exec_id)
}
