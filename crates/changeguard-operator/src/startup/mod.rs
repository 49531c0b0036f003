//! Startup utilities for the changeguard operator

mod crds;
mod webhooks;

pub use crds::{crd_yaml, ensure_crds_installed};
pub use webhooks::{
    ensure_webhooks_installed, mutating_webhook_configuration, validating_webhook_configuration,
    WebhookTarget,
};
