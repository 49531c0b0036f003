//! Signed HTTP client for the review service
//!
//! Every request carries the platform id, a unix-second timestamp and a
//! signature over timestamp, body and shared secret. Transport failures are
//! retried on a fixed cadence and re-signed each attempt; a non-2xx status,
//! an undecodable body, `success: false` or a missing `domain` end the call.

use std::time::Duration;

use async_trait::async_trait;
use aws_lc_rs::digest::{digest, SHA256};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument};

use changeguard_common::retry::{retry_if, RetryConfig};
use changeguard_common::Error;

use crate::types::{
    Envelope, NodeAssignment, OrderSubmitted, ReviewAction, SubmitChangeExecBatchStartNotifyRequest,
    SubmitChangeExecOrderRequest, SubmitChangeExecOrderStartNotifyRequest,
    SubmitChangeFinishNotifyRequest, DEFAULT_PLATFORM, DEFAULT_SECRET,
};

/// Header carrying the platform id
pub const HEADER_PLATFORM: &str = "X-Altershield-Platform";
/// Header carrying the unix-second timestamp
pub const HEADER_TIMESTAMP: &str = "X-Altershield-Timestamp";
/// Header carrying the request signature
pub const HEADER_SIGN: &str = "X-Altershield-Sign";

/// A batch being announced to the review service
#[derive(Clone, Debug, PartialEq)]
pub struct BatchStart {
    /// Execution id (review-service order id)
    pub execution_id: String,
    /// 1-based batch number
    pub batch: u32,
    /// Number of batches in the strategy
    pub total_batches: u32,
    /// Namespace of the target workload
    pub namespace: String,
    /// Name of the target workload
    pub workload_name: String,
    /// Kind of the target workload
    pub workload_kind: String,
}

/// Calls the operator makes to the review service
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait ReviewService: Send + Sync {
    /// Register a change order for an application
    async fn submit_change_exec_order(
        &self,
        execution_id: &str,
        app_name: &str,
    ) -> Result<OrderSubmitted, Error>;

    /// Start the order-level pre-check
    async fn submit_change_exec_order_start_notify(
        &self,
        execution_id: &str,
    ) -> Result<NodeAssignment, Error>;

    /// Announce a batch and request its pre-check
    async fn submit_change_exec_batch_start_notify(
        &self,
        batch: &BatchStart,
    ) -> Result<NodeAssignment, Error>;

    /// Report a batch as rolled out and request its post-check
    async fn submit_change_finish_notify(
        &self,
        execution_id: &str,
        node_id: &str,
    ) -> Result<NodeAssignment, Error>;
}

/// Sign a request body.
///
/// `upper(base64url_padded(sha256(timestamp + body + "&token=" + secret)))`
pub fn sign(timestamp: i64, body: &str, secret: &str) -> String {
    let input = format!("{timestamp}{body}&token={secret}");
    let hash = digest(&SHA256, input.as_bytes());
    URL_SAFE.encode(hash.as_ref()).to_uppercase()
}

/// Connection settings for [`ReviewClient`]
#[derive(Clone, Debug)]
pub struct ReviewClientConfig {
    /// Base URL; `http://` is assumed when no scheme is given
    pub endpoint: String,
    /// Shared signing secret
    pub secret: String,
    /// Platform id
    pub platform: String,
    /// Per-attempt request timeout
    pub timeout: Duration,
    /// Transport retry policy
    pub retry: RetryConfig,
}

impl ReviewClientConfig {
    /// Defaults for everything but the endpoint
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            secret: DEFAULT_SECRET.to_string(),
            platform: DEFAULT_PLATFORM.to_string(),
            timeout: Duration::from_secs(10),
            retry: RetryConfig::fixed(3, Duration::from_secs(1)),
        }
    }
}

/// [`ReviewService`] over HTTP
pub struct ReviewClient {
    http: reqwest::Client,
    base_url: String,
    config: ReviewClientConfig,
}

impl ReviewClient {
    /// Build a client from its configuration
    pub fn new(config: ReviewClientConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::internal_with_context("review-client", e.to_string()))?;

        let trimmed = config.endpoint.trim_end_matches('/');
        let base_url = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{trimmed}")
        };

        Ok(Self {
            http,
            base_url,
            config,
        })
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<Req, Resp>(&self, action: ReviewAction, request: &Req) -> Result<Resp, Error>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_string(request)?;
        retry_if(
            &self.config.retry,
            action.as_str(),
            || self.post_once(action, &body),
            Error::is_retryable,
        )
        .await
    }

    async fn post_once<Resp: DeserializeOwned>(
        &self,
        action: ReviewAction,
        body: &str,
    ) -> Result<Resp, Error> {
        let timestamp = chrono::Utc::now().timestamp();
        let url = format!("{}{}", self.base_url, action.path());

        let response = self
            .http
            .post(&url)
            .header(HEADER_PLATFORM, &self.config.platform)
            .header(HEADER_TIMESTAMP, timestamp.to_string())
            .header(HEADER_SIGN, sign(timestamp, body, &self.config.secret))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| Error::review_transport(action.as_str(), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::review(action.as_str(), format!("HTTP {status}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::review_transport(action.as_str(), e.to_string()))?;
        let envelope: Envelope<Resp> = serde_json::from_slice(&bytes).map_err(|e| {
            Error::review(action.as_str(), format!("undecodable response: {e}"))
        })?;

        if !envelope.success {
            return Err(Error::review(
                action.as_str(),
                format!(
                    "rejected ({}): {}",
                    envelope.result_code.as_deref().unwrap_or("no result code"),
                    envelope.msg.as_deref().unwrap_or("no message"),
                ),
            ));
        }
        debug!(%action, "Review service accepted request");
        envelope
            .domain
            .ok_or_else(|| Error::review(action.as_str(), "response carried no domain"))
    }
}

#[async_trait]
impl ReviewService for ReviewClient {
    #[instrument(skip(self))]
    async fn submit_change_exec_order(
        &self,
        execution_id: &str,
        app_name: &str,
    ) -> Result<OrderSubmitted, Error> {
        let request =
            SubmitChangeExecOrderRequest::new(&self.config.platform, execution_id, app_name);
        self.post(ReviewAction::SubmitChangeExecOrder, &request).await
    }

    #[instrument(skip(self))]
    async fn submit_change_exec_order_start_notify(
        &self,
        execution_id: &str,
    ) -> Result<NodeAssignment, Error> {
        let request =
            SubmitChangeExecOrderStartNotifyRequest::new(&self.config.platform, execution_id);
        self.post(ReviewAction::SubmitChangeExecOrderStartNotify, &request)
            .await
    }

    #[instrument(skip(self))]
    async fn submit_change_exec_batch_start_notify(
        &self,
        batch: &BatchStart,
    ) -> Result<NodeAssignment, Error> {
        let request = SubmitChangeExecBatchStartNotifyRequest::new(&self.config.platform, batch);
        self.post(ReviewAction::SubmitChangeExecBatchStartNotify, &request)
            .await
    }

    #[instrument(skip(self))]
    async fn submit_change_finish_notify(
        &self,
        execution_id: &str,
        node_id: &str,
    ) -> Result<NodeAssignment, Error> {
        let request =
            SubmitChangeFinishNotifyRequest::new(&self.config.platform, execution_id, node_id);
        self.post(ReviewAction::SubmitChangeFinishNotify, &request)
            .await
    }
}
