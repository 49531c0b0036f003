//! Runtime tuning shared by reconcilers and webhooks
//!
//! Readers hold a [`ConfigHandle`] and take an `Arc` snapshot per use. A single
//! owner publishes new snapshots, typically the ConfigMap watcher in the
//! operator binary. Nothing else mutates configuration.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::Error;

/// Tunables for the defense engine
#[derive(Clone, Debug, PartialEq)]
pub struct DefenseConfig {
    /// Cadence at which admission polls the policy for a pre-check verdict
    pub precheck_poll_interval: Duration,
    /// Upper bound on how long admission waits for that verdict
    pub precheck_timeout: Duration,
    /// Requeue delay while an observation window is still open
    pub observe_requeue: Duration,
    /// Safety requeue while waiting for a batch to roll out
    pub progressing_requeue: Duration,
    /// Requeue delay after a reconcile error
    pub error_requeue: Duration,
    /// Concurrent deletions when recycling superseded executions
    pub stale_delete_concurrency: usize,
}

impl Default for DefenseConfig {
    fn default() -> Self {
        Self {
            precheck_poll_interval: Duration::from_secs(3),
            precheck_timeout: Duration::from_secs(9),
            observe_requeue: Duration::from_secs(5),
            progressing_requeue: Duration::from_secs(30),
            error_requeue: Duration::from_secs(30),
            stale_delete_concurrency: 8,
        }
    }
}

impl DefenseConfig {
    /// Build a config from ConfigMap data, defaulting absent keys
    pub fn from_config_map_data(data: &BTreeMap<String, String>) -> Result<Self, Error> {
        let mut config = Self::default();
        let secs = |key: &str, target: &mut Duration| -> Result<(), Error> {
            if let Some(raw) = data.get(key) {
                let value: u64 = raw.trim().parse().map_err(|e| {
                    Error::validation_for_field("ConfigMap", key, format!("{raw:?}: {e}"))
                })?;
                if value == 0 {
                    return Err(Error::validation_for_field(
                        "ConfigMap",
                        key,
                        "must be greater than zero",
                    ));
                }
                *target = Duration::from_secs(value);
            }
            Ok(())
        };

        secs("precheckPollIntervalSeconds", &mut config.precheck_poll_interval)?;
        secs("precheckTimeoutSeconds", &mut config.precheck_timeout)?;
        secs("observeRequeueSeconds", &mut config.observe_requeue)?;
        secs("progressingRequeueSeconds", &mut config.progressing_requeue)?;
        secs("errorRequeueSeconds", &mut config.error_requeue)?;

        if let Some(raw) = data.get("staleDeleteConcurrency") {
            config.stale_delete_concurrency = raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    Error::validation_for_field(
                        "ConfigMap",
                        "staleDeleteConcurrency",
                        format!("{raw:?} is not a positive integer"),
                    )
                })?;
        }

        if config.precheck_poll_interval > config.precheck_timeout {
            return Err(Error::validation_for_field(
                "ConfigMap",
                "precheckPollIntervalSeconds",
                "poll interval exceeds the pre-check timeout",
            ));
        }
        Ok(config)
    }
}

/// Read side of the configuration snapshot
#[derive(Clone, Debug)]
pub struct ConfigHandle {
    rx: watch::Receiver<Arc<DefenseConfig>>,
}

impl ConfigHandle {
    /// Current snapshot
    pub fn current(&self) -> Arc<DefenseConfig> {
        self.rx.borrow().clone()
    }

    /// A handle that always returns `config`
    pub fn fixed(config: DefenseConfig) -> Self {
        ConfigPublisher::new(config).handle()
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::fixed(DefenseConfig::default())
    }
}

/// Write side of the configuration snapshot; there is exactly one
#[derive(Debug)]
pub struct ConfigPublisher {
    tx: watch::Sender<Arc<DefenseConfig>>,
}

impl ConfigPublisher {
    /// Create a publisher seeded with `initial`
    pub fn new(initial: DefenseConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    /// A new reader of this publisher's snapshots
    pub fn handle(&self) -> ConfigHandle {
        ConfigHandle {
            rx: self.tx.subscribe(),
        }
    }

    /// Replace the snapshot; readers see it on their next `current()`
    pub fn publish(&self, config: DefenseConfig) {
        self.tx.send_if_modified(|current| {
            if **current == config {
                return false;
            }
            *current = Arc::new(config);
            true
        });
    }
}

/// Keep `publisher` in sync with a ConfigMap until the watch ends.
///
/// Invalid data is logged and the previous snapshot stays in effect. Deleting
/// the ConfigMap restores the defaults.
pub async fn watch_config_map(
    client: Client,
    namespace: &str,
    name: &str,
    publisher: ConfigPublisher,
) {
    let api: Api<ConfigMap> = Api::namespaced(client, namespace);
    let config = WatcherConfig::default().fields(&format!("metadata.name={name}"));

    let stream = watcher::watcher(api, config).default_backoff();
    futures::pin_mut!(stream);
    loop {
        match stream.try_next().await {
            Ok(Some(Event::Apply(cm) | Event::InitApply(cm))) => {
                apply_config_map(&publisher, cm.data.as_ref())
            }
            Ok(Some(Event::Delete(_))) => {
                info!(configmap = %name, "ConfigMap deleted, restoring defaults");
                publisher.publish(DefenseConfig::default());
            }
            Ok(Some(Event::Init | Event::InitDone)) => {}
            Ok(None) => break,
            Err(e) => warn!(error = %e, configmap = %name, "ConfigMap watch error"),
        }
    }
}

fn apply_config_map(publisher: &ConfigPublisher, data: Option<&BTreeMap<String, String>>) {
    let empty = BTreeMap::new();
    match DefenseConfig::from_config_map_data(data.unwrap_or(&empty)) {
        Ok(config) => {
            info!(?config, "Applying defense configuration");
            publisher.publish(config);
        }
        Err(e) => warn!(error = %e, "Ignoring invalid defense configuration"),
    }
}
