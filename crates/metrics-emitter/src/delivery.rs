// Copyright (c), Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Pushing registry snapshots to a Pushgateway.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::{header, Method, Url};
use serde::{Deserialize, Serialize};

use crate::registry::{Registry, RegistrySnapshot};

/// Content type of the text exposition format.
pub const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

/// How a push interacts with series already stored under the grouping key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PushMode {
    /// POST: only metrics with the same name are replaced, everything else
    /// under the grouping key is kept.
    Add,
    /// PUT: every series under the grouping key is replaced by this push.
    Replace,
}

impl PushMode {
    pub fn method(self) -> Method {
        match self {
            PushMode::Add => Method::POST,
            PushMode::Replace => Method::PUT,
        }
    }
}

/// Identifies which emitter a pushed batch belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupingKey {
    job: String,
    instance: String,
    labels: BTreeMap<String, String>,
}

impl GroupingKey {
    pub fn new(job: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            instance: instance.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Path segments below `/metrics`: `job/<job>/instance/<instance>/...`.
    ///
    /// Values the gateway cannot take verbatim in a path (empty, or containing
    /// `/`) use its `@base64` form.
    pub fn path_segments(&self) -> Vec<String> {
        let mut segments = Vec::with_capacity(4 + 2 * self.labels.len());
        push_segment(&mut segments, "job", &self.job);
        push_segment(&mut segments, "instance", &self.instance);
        for (name, value) in &self.labels {
            push_segment(&mut segments, name, value);
        }
        segments
    }
}

fn push_segment(segments: &mut Vec<String>, name: &str, value: &str) {
    if value.is_empty() {
        segments.push(format!("{name}@base64"));
        segments.push("=".to_owned());
    } else if value.contains('/') {
        segments.push(format!("{name}@base64"));
        segments.push(URL_SAFE.encode(value));
    } else {
        segments.push(name.to_owned());
        segments.push(value.to_owned());
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryFailure {
    #[error("unable to encode metrics: {0}")]
    Encode(#[from] prometheus::Error),
    #[error("invalid data point: {0}")]
    Build(#[from] aws_sdk_cloudwatch::error::BuildError),
    #[error("cloud monitoring request failed: {0}")]
    Cloud(String),
    #[error("invalid url `{url}`: {reason}")]
    Url { url: String, reason: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("metrics push failed: [{status}]:{body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Immutable snapshot of a registry, rendered and ready to push once.
#[derive(Clone, Debug)]
pub struct DeliveryBatch {
    grouping: GroupingKey,
    mode: PushMode,
    body: String,
    series: RegistrySnapshot,
    captured_at: DateTime<Utc>,
}

impl DeliveryBatch {
    pub fn capture(
        registry: &Registry,
        grouping: GroupingKey,
        mode: PushMode,
    ) -> Result<Self, DeliveryFailure> {
        let families = registry.gather();
        let body = prometheus::TextEncoder::new()
            .encode_to_string(&families)
            .inspect_err(|error| {
                tracing::warn!(?error, "unable to encode metric families");
            })?;
        Ok(Self {
            grouping,
            mode,
            body,
            series: RegistrySnapshot::from_families(&families),
            captured_at: Utc::now(),
        })
    }

    pub fn grouping(&self) -> &GroupingKey {
        &self.grouping
    }

    pub fn mode(&self) -> PushMode {
        self.mode
    }

    /// Text exposition of every series in the batch.
    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn series(&self) -> &RegistrySnapshot {
        &self.series
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

/// Sends a batch somewhere. Failures are returned, never raised past the caller.
pub trait Deliver {
    fn deliver(
        &self,
        batch: &DeliveryBatch,
    ) -> impl Future<Output = Result<(), DeliveryFailure>> + Send;
}

/// Pushgateway client.
#[derive(Clone, Debug)]
pub struct PushgatewayClient {
    client: reqwest::Client,
    url: Url,
    bearer_token: Option<String>,
}

impl PushgatewayClient {
    /// `timeout` bounds every push so a stalled gateway cannot wedge the loop.
    pub fn new(url: &str, timeout: Duration, user_agent: &str) -> Result<Self, DeliveryFailure> {
        let url = parse_base_url(url)?;
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url,
            bearer_token: None,
        })
    }

    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token;
        self
    }

    pub fn push_url(&self, grouping: &GroupingKey) -> Result<Url, DeliveryFailure> {
        let mut url = self.url.clone();
        url.path_segments_mut()
            .map_err(|_| DeliveryFailure::Url {
                url: self.url.to_string(),
                reason: "cannot be a base".to_owned(),
            })?
            .pop_if_empty()
            .push("metrics")
            .extend(grouping.path_segments());
        Ok(url)
    }
}

impl Deliver for PushgatewayClient {
    async fn deliver(&self, batch: &DeliveryBatch) -> Result<(), DeliveryFailure> {
        let push_url = self.push_url(batch.grouping())?;
        tracing::debug!(
            %push_url,
            mode = ?batch.mode(),
            series = batch.series_count(),
            captured_at = %batch.captured_at(),
            "pushing metrics to remote"
        );

        let mut request = self
            .client
            .request(batch.mode().method(), push_url.clone())
            .header(header::CONTENT_TYPE, TEXT_FORMAT)
            .body(batch.body().to_owned());
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = match response.text().await {
                Ok(body) => body,
                Err(error) => format!("couldn't decode response body; {error}"),
            };
            return Err(DeliveryFailure::Status { status, body });
        }
        tracing::debug!("successfully pushed metrics to {push_url}");
        Ok(())
    }
}

pub(crate) fn parse_base_url(url: &str) -> Result<Url, DeliveryFailure> {
    let parsed = Url::parse(url).map_err(|e| DeliveryFailure::Url {
        url: url.to_owned(),
        reason: e.to_string(),
    })?;
    if parsed.cannot_be_a_base() {
        return Err(DeliveryFailure::Url {
            url: url.to_owned(),
            reason: "cannot be a base".to_owned(),
        });
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::registry::MetricDefinition;

    fn client(url: &str) -> PushgatewayClient {
        PushgatewayClient::new(url, Duration::from_secs(1), "test").unwrap()
    }

    #[test]
    fn push_url_carries_grouping_key() {
        let key = GroupingKey::new("ecommerce_job", "i-001").with_label("region", "eu");
        assert_eq!(
            client("http://localhost:9091").push_url(&key).unwrap().as_str(),
            "http://localhost:9091/metrics/job/ecommerce_job/instance/i-001/region/eu"
        );
        // path prefixes and trailing slashes are kept as the base
        assert_eq!(
            client("http://gw.local/pushgateway/").push_url(&key).unwrap().path(),
            "/pushgateway/metrics/job/ecommerce_job/instance/i-001/region/eu"
        );
    }

    #[test]
    fn awkward_label_values_are_encoded() {
        let key = GroupingKey::new("demo", "host:9100")
            .with_label("path", "/var/tmp")
            .with_label("zone", "")
            .with_label("team", "a b");
        let segments = key.path_segments();
        assert_eq!(
            segments,
            vec![
                "job", "demo", "instance", "host:9100", "path@base64", "L3Zhci90bXA=", "team",
                "a b", "zone@base64", "=",
            ]
        );
        let url = client("http://localhost:9091").push_url(&key).unwrap();
        assert!(url.path().ends_with("/team/a%20b/zone@base64/="));
    }

    #[test]
    fn push_mode_selects_method() {
        assert_eq!(PushMode::Add.method(), Method::POST);
        assert_eq!(PushMode::Replace.method(), Method::PUT);
        let mode: PushMode = serde_yaml::from_str("replace").unwrap();
        assert_eq!(mode, PushMode::Replace);
    }

    #[test]
    fn invalid_base_urls_are_rejected() {
        for url in ["not a url", "mailto:ops@example.com"] {
            assert!(matches!(
                PushgatewayClient::new(url, Duration::from_secs(1), "test"),
                Err(DeliveryFailure::Url { .. })
            ));
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn push_logs_capture_time() {
        let gateway = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&gateway)
            .await;
        let batch =
            DeliveryBatch::capture(&Registry::new(), GroupingKey::new("demo", "i1"), PushMode::Add)
                .unwrap();
        client(&gateway.uri()).deliver(&batch).await.unwrap();
        assert!(logs_contain(&format!("captured_at={}", batch.captured_at())));
    }

    #[test]
    fn batch_is_a_snapshot() {
        let mut registry = Registry::new();
        let handle = registry
            .define(MetricDefinition::gauge("temperature", "temperature"))
            .unwrap();
        registry.set(&handle, &[], 23.4).unwrap();
        let before = Utc::now();
        let batch =
            DeliveryBatch::capture(&registry, GroupingKey::new("demo", "i1"), PushMode::Add)
                .unwrap();
        assert!(batch.captured_at() >= before && batch.captured_at() <= Utc::now());
        registry.set(&handle, &[], 99.0).unwrap();

        assert_eq!(batch.series_count(), 1);
        assert!(batch.body().contains("temperature 23.4"));
        assert_eq!(
            batch.series().value("temperature", &[]).and_then(|v| v.scalar()),
            Some(23.4)
        );
    }
}
