//! Admission webhook registration
//!
//! Registers the admission trigger for Deployment/StatefulSet updates and
//! the deletion guard for pods, both pointing at the operator's webhook
//! Service. The CA bundle is read from the serving certificate directory.

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    ValidatingWebhook, ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;

use changeguard_common::FIELD_MANAGER;
use changeguard_webhook::{MUTATE_PATH, VALIDATE_PATH};

/// Name of both webhook configuration objects
const CONFIGURATION_NAME: &str = "changeguard";

/// API server timeout for one admission call; must exceed the pre-check wait
const WEBHOOK_TIMEOUT_SECONDS: i32 = 15;

/// Where the API server reaches the webhooks
#[derive(Clone, Debug)]
pub struct WebhookTarget {
    /// Namespace of the webhook Service
    pub namespace: String,
    /// Name of the webhook Service
    pub service: String,
    /// PEM CA bundle, if serving certs are issued by a private CA
    pub ca_bundle: Option<Vec<u8>>,
}

impl WebhookTarget {
    fn client_config(&self, path: &str) -> WebhookClientConfig {
        WebhookClientConfig {
            ca_bundle: self.ca_bundle.clone().map(ByteString),
            service: Some(ServiceReference {
                name: self.service.clone(),
                namespace: self.namespace.clone(),
                path: Some(path.to_string()),
                port: Some(443),
            }),
            url: None,
        }
    }
}

fn rule(api_group: &str, resources: &str, operation: &str) -> RuleWithOperations {
    RuleWithOperations {
        api_groups: Some(vec![api_group.to_string()]),
        api_versions: Some(vec!["v1".to_string()]),
        operations: Some(vec![operation.to_string()]),
        resources: Some(resources.split(',').map(str::to_string).collect()),
        scope: Some("Namespaced".to_string()),
    }
}

/// Admission trigger registration
pub fn mutating_webhook_configuration(target: &WebhookTarget) -> MutatingWebhookConfiguration {
    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(CONFIGURATION_NAME.to_string()),
            ..Default::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: "workloads.changeguard.dev".to_string(),
            admission_review_versions: vec!["v1".to_string()],
            client_config: target.client_config(MUTATE_PATH),
            failure_policy: Some("Fail".to_string()),
            rules: Some(vec![rule("apps", "deployments,statefulsets", "UPDATE")]),
            side_effects: "NoneOnDryRun".to_string(),
            timeout_seconds: Some(WEBHOOK_TIMEOUT_SECONDS),
            ..Default::default()
        }]),
    }
}

/// Deletion guard registration
pub fn validating_webhook_configuration(target: &WebhookTarget) -> ValidatingWebhookConfiguration {
    ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(CONFIGURATION_NAME.to_string()),
            ..Default::default()
        },
        webhooks: Some(vec![ValidatingWebhook {
            name: "pods.changeguard.dev".to_string(),
            admission_review_versions: vec!["v1".to_string()],
            client_config: target.client_config(VALIDATE_PATH),
            failure_policy: Some("Fail".to_string()),
            rules: Some(vec![rule("", "pods", "DELETE")]),
            side_effects: "None".to_string(),
            timeout_seconds: Some(WEBHOOK_TIMEOUT_SECONDS),
            ..Default::default()
        }]),
    }
}

/// Install or update both webhook configurations
pub async fn ensure_webhooks_installed(client: &Client, target: &WebhookTarget) -> anyhow::Result<()> {
    let params = PatchParams::apply(FIELD_MANAGER).force();

    let mutating: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    mutating
        .patch(
            CONFIGURATION_NAME,
            &params,
            &Patch::Apply(&mutating_webhook_configuration(target)),
        )
        .await
        .map_err(|e| anyhow::anyhow!("failed to install mutating webhook: {}", e))?;

    let validating: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    validating
        .patch(
            CONFIGURATION_NAME,
            &params,
            &Patch::Apply(&validating_webhook_configuration(target)),
        )
        .await
        .map_err(|e| anyhow::anyhow!("failed to install validating webhook: {}", e))?;

    tracing::info!(
        service = %target.service,
        namespace = %target.namespace,
        ca_bundle = target.ca_bundle.is_some(),
        "Webhook configurations installed/updated"
    );
    Ok(())
}
