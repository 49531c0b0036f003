//! Wire types for the review-service protocol
//!
//! Field names are camelCase on the wire. Outbound requests are built by
//! [`crate::ReviewClient`]; callers only see the response `domain` payloads
//! and the callback types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Platform identifier sent in the header and in every request body
pub const DEFAULT_PLATFORM: &str = "kubernetes";
/// Shared secret mixed into request signatures
pub const DEFAULT_SECRET: &str = "altershield-operator";
/// Change scene registered for rolling updates
pub const DEFAULT_CHANGE_SCENE: &str = "com.alipay.altershield.kubernetes.rollingupdate";
/// The single change phase a rollout runs in
pub const DEFAULT_CHANGE_PHASE: &str = "prod_phase";
/// Scenario code attached to change orders
pub const DEFAULT_SCENARIO_CODE: &str = "rollingupdate";
/// Tenant all changes are filed under
pub const DEFAULT_TENANT: &str = "default";
/// Creator of change orders
pub const DEFAULT_CREATOR: &str = "operator";
/// Executor of batches
pub const DEFAULT_EXECUTOR: &str = "system";
/// Effective target type of every batch
pub const TARGET_TYPE_POD: &str = "pass.pod";

/// Review-service actions, the last path segment of `/openapi/v1/exe/{action}`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReviewAction {
    /// Register an application-level change order
    SubmitChangeExecOrder,
    /// Start the order-level pre-check
    SubmitChangeExecOrderStartNotify,
    /// Announce a batch and request its pre-check
    SubmitChangeExecBatchStartNotify,
    /// Report a batch as rolled out and request its post-check
    SubmitChangeFinishNotify,
}

impl ReviewAction {
    /// Action name as it appears in the URL
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SubmitChangeExecOrder => "submitChangeExecOrder",
            Self::SubmitChangeExecOrderStartNotify => "submitChangeExecOrderStartNotify",
            Self::SubmitChangeExecBatchStartNotify => "submitChangeExecBatchStartNotify",
            Self::SubmitChangeFinishNotify => "submitChangeFinishNotify",
        }
    }

    /// Request path relative to the service endpoint
    pub fn path(self) -> String {
        format!("/openapi/v1/exe/{}", self.as_str())
    }
}

impl std::fmt::Display for ReviewAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Responses
// =============================================================================

/// Response envelope shared by every action
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    /// Application-level success flag
    pub success: bool,
    /// Service result code
    #[serde(default)]
    pub result_code: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub msg: Option<String>,
    /// Action-specific payload
    pub domain: Option<T>,
}

/// Domain of a submitted change order
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSubmitted {
    /// Service-side order id
    #[serde(default)]
    pub order_id: String,
    /// Link to the order in the review console
    #[serde(default)]
    pub url: String,
}

/// Domain of start and finish notifications
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAssignment {
    /// Session id correlating this check with its callback
    #[serde(default)]
    pub node_id: String,
    /// Whether the service decided to skip the check
    #[serde(default)]
    pub skip_check: bool,
    /// Link to the check in the review console
    #[serde(default)]
    pub url: String,
}

// =============================================================================
// Requests
// =============================================================================

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChangeContentType {
    pub type_name: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChangeContent {
    pub content_type: ChangeContentType,
    pub instance_name: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubmitChangeExecOrderRequest {
    pub biz_exec_order_id: String,
    pub platform: String,
    pub change_scene_key: String,
    pub change_apps: Vec<String>,
    pub change_param_json: String,
    pub change_phases: Vec<String>,
    pub change_scenario_code: String,
    pub change_title: String,
    pub change_url: String,
    pub creator: String,
    pub change_contents: Vec<ChangeContent>,
    pub tenant_code: String,
}

impl SubmitChangeExecOrderRequest {
    pub fn new(platform: &str, execution_id: &str, app_name: &str) -> Self {
        Self {
            biz_exec_order_id: execution_id.to_string(),
            platform: platform.to_string(),
            change_scene_key: DEFAULT_CHANGE_SCENE.to_string(),
            change_apps: vec![app_name.to_string()],
            change_param_json: "{}".to_string(),
            change_phases: vec![DEFAULT_CHANGE_PHASE.to_string()],
            change_scenario_code: DEFAULT_SCENARIO_CODE.to_string(),
            change_title: format!("{app_name}-{execution_id}"),
            change_url: String::new(),
            creator: DEFAULT_CREATOR.to_string(),
            change_contents: vec![ChangeContent {
                content_type: ChangeContentType {
                    type_name: TARGET_TYPE_POD.to_string(),
                },
                instance_name: String::new(),
            }],
            tenant_code: DEFAULT_TENANT.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubmitChangeExecOrderStartNotifyRequest {
    pub executor: String,
    pub tenant_code: String,
    pub platform: String,
    pub change_scene_key: String,
    pub biz_exec_order_id: String,
}

impl SubmitChangeExecOrderStartNotifyRequest {
    pub fn new(platform: &str, execution_id: &str) -> Self {
        Self {
            executor: DEFAULT_EXECUTOR.to_string(),
            tenant_code: DEFAULT_TENANT.to_string(),
            platform: platform.to_string(),
            change_scene_key: DEFAULT_CHANGE_SCENE.to_string(),
            biz_exec_order_id: execution_id.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubmitChangeExecBatchStartNotifyRequest {
    pub change_phase: String,
    pub is_last_batch_in_change_phase_tag: String,
    pub total_batch_num_in_change_phase: u32,
    pub batch_no: u32,
    pub executor: String,
    pub total_batch_num: String,
    pub effective_target_type: String,
    pub effective_target_locations: Vec<String>,
    pub ext_info: BTreeMap<String, String>,
    pub biz_exec_order_id: String,
    pub platform: String,
    pub change_scene_key: String,
    pub tenant_code: String,
}

impl SubmitChangeExecBatchStartNotifyRequest {
    pub fn new(platform: &str, batch: &crate::BatchStart) -> Self {
        let last = batch.batch >= batch.total_batches;
        let ext_info = BTreeMap::from([
            ("namespace".to_string(), batch.namespace.clone()),
            ("workloadName".to_string(), batch.workload_name.clone()),
            ("workloadType".to_string(), batch.workload_kind.clone()),
        ]);
        Self {
            change_phase: DEFAULT_CHANGE_PHASE.to_string(),
            is_last_batch_in_change_phase_tag: if last { "last" } else { "not_last" }.to_string(),
            total_batch_num_in_change_phase: 1,
            batch_no: batch.batch,
            executor: DEFAULT_EXECUTOR.to_string(),
            total_batch_num: batch.total_batches.to_string(),
            effective_target_type: TARGET_TYPE_POD.to_string(),
            effective_target_locations: Vec::new(),
            ext_info,
            biz_exec_order_id: batch.execution_id.clone(),
            platform: platform.to_string(),
            change_scene_key: DEFAULT_CHANGE_SCENE.to_string(),
            tenant_code: DEFAULT_TENANT.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubmitChangeFinishNotifyRequest {
    pub node_id: String,
    pub success: bool,
    pub service_result: String,
    pub biz_exec_order_id: String,
    pub platform: String,
    pub change_scene_key: String,
    pub tenant_code: String,
}

impl SubmitChangeFinishNotifyRequest {
    pub fn new(platform: &str, execution_id: &str, node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            success: true,
            service_result: "{}".to_string(),
            biz_exec_order_id: execution_id.to_string(),
            platform: platform.to_string(),
            change_scene_key: DEFAULT_CHANGE_SCENE.to_string(),
            tenant_code: DEFAULT_TENANT.to_string(),
        }
    }
}

// =============================================================================
// Callbacks
// =============================================================================

/// Which object a callback verdict is about
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeCheckType {
    /// Order-level pre-check, resolved against the policy
    #[serde(rename = "CHANGE_ORDER")]
    ChangeOrder,
    /// Batch-level check, resolved against the execution
    #[serde(rename = "CHANGE_BATCH")]
    ChangeBatch,
}

/// Whether a verdict is for the check before or after a batch rolls out
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DefenseStage {
    /// Pre-check
    Pre,
    /// Post-check
    Post,
}

/// Outcome of a check
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictKind {
    /// Check passed
    Pass,
    /// Check failed
    Fail,
}

impl VerdictKind {
    /// True for [`VerdictKind::Pass`]
    pub fn passed(self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// Verdict carried by a callback
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeCheckVerdict {
    /// Pass or fail
    pub verdict: VerdictKind,
    /// Reviewer's message
    #[serde(default)]
    pub msg: String,
    /// Session id the verdict belongs to
    #[serde(default)]
    pub node_id: String,
}

/// Body of a verdict callback
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeCheckCallbackRequest {
    /// Session id the check was started under
    #[serde(default)]
    pub node_id: String,
    /// Change scene of the order
    #[serde(default)]
    pub change_scene_key: String,
    /// Execution id the verdict is for
    pub biz_exec_order_id: String,
    /// The verdict
    pub verdict: ChangeCheckVerdict,
    /// Pre- or post-check
    pub defense_stage_enum: DefenseStage,
}

/// Callback wrapper posted by the review service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeCheckCallback {
    /// Order or batch check
    pub change_check_type: ChangeCheckType,
    /// The callback body
    pub callback_request: ChangeCheckCallbackRequest,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BatchStart;
    use serde_json::json;

    fn batch(batch: u32, total_batches: u32) -> BatchStart {
        BatchStart {
            execution_id: "prod-web-2-abcde".into(),
            batch,
            total_batches,
            namespace: "prod".into(),
            workload_name: "web".into(),
            workload_kind: "Deployment".into(),
        }
    }

    #[test]
    fn final_batch_is_tagged_last() {
        let first = SubmitChangeExecBatchStartNotifyRequest::new("kubernetes", &batch(1, 3));
        let last = SubmitChangeExecBatchStartNotifyRequest::new("kubernetes", &batch(3, 3));
        assert_eq!(first.is_last_batch_in_change_phase_tag, "not_last");
        assert_eq!(last.is_last_batch_in_change_phase_tag, "last");
    }

    #[test]
    fn batch_start_wire_shape() {
        let req = SubmitChangeExecBatchStartNotifyRequest::new("kubernetes", &batch(2, 3));
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["batchNo"], 2);
        assert_eq!(value["totalBatchNum"], "3");
        assert_eq!(value["bizExecOrderId"], "prod-web-2-abcde");
        assert_eq!(value["effectiveTargetType"], "pass.pod");
        assert_eq!(value["extInfo"]["workloadType"], "Deployment");
        assert_eq!(value["isLastBatchInChangePhaseTag"], "not_last");
    }

    #[test]
    fn change_order_title_joins_app_and_execution() {
        let req = SubmitChangeExecOrderRequest::new("kubernetes", "prod-web-2-abcde", "prod-web");
        assert_eq!(req.change_title, "prod-web-prod-web-2-abcde");
        assert_eq!(req.change_apps, vec!["prod-web"]);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["changeContents"][0]["contentType"]["typeName"], "pass.pod");
    }

    #[test]
    fn callback_parses_from_the_wire() {
        let body = json!({
            "changeCheckType": "CHANGE_BATCH",
            "callbackRequest": {
                "nodeId": "node-1",
                "changeSceneKey": DEFAULT_CHANGE_SCENE,
                "bizExecOrderId": "prod-web-2-abcde",
                "defenseStageEnum": "POST",
                "verdict": {"verdict": "fail", "msg": "error rate up"}
            }
        });
        let callback: ChangeCheckCallback = serde_json::from_value(body).unwrap();
        assert_eq!(callback.change_check_type, ChangeCheckType::ChangeBatch);
        assert_eq!(callback.callback_request.defense_stage_enum, DefenseStage::Post);
        assert!(!callback.callback_request.verdict.verdict.passed());
        assert_eq!(callback.callback_request.verdict.msg, "error rate up");
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let body = json!({
            "changeCheckType": "CHANGE_ORDER",
            "callbackRequest": {
                "bizExecOrderId": "x",
                "defenseStageEnum": "DURING",
                "verdict": {"verdict": "pass"}
            }
        });
        assert!(serde_json::from_value::<ChangeCheckCallback>(body).is_err());
    }

    #[test]
    fn envelope_without_domain_parses() {
        let envelope: Envelope<NodeAssignment> =
            serde_json::from_value(json!({"success": false, "resultCode": "E01", "msg": "denied"}))
                .unwrap();
        assert!(!envelope.success);
        assert!(envelope.domain.is_none());
        assert_eq!(envelope.msg.as_deref(), Some("denied"));
    }

    #[test]
    fn action_paths() {
        assert_eq!(
            ReviewAction::SubmitChangeFinishNotify.path(),
            "/openapi/v1/exe/submitChangeFinishNotify"
        );
    }
}
