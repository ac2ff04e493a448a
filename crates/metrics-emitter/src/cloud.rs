// Copyright (c), Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! One-shot batches of synthetic data points for CloudWatch `PutMetricData`.
//!
//! Credentials and region resolve through the usual AWS chain (environment,
//! profile, instance role). `endpoint` overrides the regional endpoint, e.g.
//! for a local emulator.

use anyhow::Context;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_sdk_cloudwatch::config::Region;
use aws_sdk_cloudwatch::error::{BuildError, DisplayErrorContext};
use aws_sdk_cloudwatch::primitives::DateTime as AwsDateTime;
use aws_sdk_cloudwatch::types;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::CloudConfig;
use crate::delivery::DeliveryFailure;
use crate::error::EmitError;
use crate::sampler::Distribution;

/// Service limit on data points in a single request.
pub const MAX_DATUMS_PER_REQUEST: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StandardUnit {
    Seconds,
    Microseconds,
    Milliseconds,
    Bytes,
    Kilobytes,
    Megabytes,
    Gigabytes,
    Terabytes,
    Bits,
    Kilobits,
    Megabits,
    Gigabits,
    Terabits,
    Percent,
    Count,
    #[serde(rename = "Bytes/Second")]
    BytesPerSecond,
    #[serde(rename = "Kilobytes/Second")]
    KilobytesPerSecond,
    #[serde(rename = "Megabytes/Second")]
    MegabytesPerSecond,
    #[serde(rename = "Bits/Second")]
    BitsPerSecond,
    #[serde(rename = "Count/Second")]
    CountPerSecond,
    #[serde(rename = "None")]
    NoUnit,
}

impl StandardUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            StandardUnit::Seconds => "Seconds",
            StandardUnit::Microseconds => "Microseconds",
            StandardUnit::Milliseconds => "Milliseconds",
            StandardUnit::Bytes => "Bytes",
            StandardUnit::Kilobytes => "Kilobytes",
            StandardUnit::Megabytes => "Megabytes",
            StandardUnit::Gigabytes => "Gigabytes",
            StandardUnit::Terabytes => "Terabytes",
            StandardUnit::Bits => "Bits",
            StandardUnit::Kilobits => "Kilobits",
            StandardUnit::Megabits => "Megabits",
            StandardUnit::Gigabits => "Gigabits",
            StandardUnit::Terabits => "Terabits",
            StandardUnit::Percent => "Percent",
            StandardUnit::Count => "Count",
            StandardUnit::BytesPerSecond => "Bytes/Second",
            StandardUnit::KilobytesPerSecond => "Kilobytes/Second",
            StandardUnit::MegabytesPerSecond => "Megabytes/Second",
            StandardUnit::BitsPerSecond => "Bits/Second",
            StandardUnit::CountPerSecond => "Count/Second",
            StandardUnit::NoUnit => "None",
        }
    }
}

/// A name/value pair qualifying a data point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

impl Dimension {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Describes one data point of the batch; its value is drawn per invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatumTemplate {
    pub name: String,
    pub unit: StandardUnit,
    pub value: Distribution,
    /// Added after the batch-wide dimensions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dimensions: Vec<Dimension>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetricDatum {
    pub metric_name: String,
    pub dimensions: Vec<Dimension>,
    /// seconds since the epoch
    pub timestamp: i64,
    pub value: f64,
    pub unit: StandardUnit,
}

impl MetricDatum {
    fn to_sdk(&self) -> Result<types::MetricDatum, BuildError> {
        let dimensions = self
            .dimensions
            .iter()
            .map(|d| {
                types::Dimension::builder()
                    .name(&d.name)
                    .value(&d.value)
                    .build()
            })
            .collect::<Vec<_>>();
        Ok(types::MetricDatum::builder()
            .metric_name(&self.metric_name)
            .set_dimensions((!dimensions.is_empty()).then_some(dimensions))
            .timestamp(AwsDateTime::from_secs(self.timestamp))
            .value(self.value)
            .unit(types::StandardUnit::from(self.unit.as_str()))
            .build())
    }
}

/// Draw one data point per template, all sharing `timestamp`.
pub fn synthesize<R: Rng + ?Sized>(
    templates: &[DatumTemplate],
    shared: &[Dimension],
    timestamp: DateTime<Utc>,
    rng: &mut R,
) -> Result<Vec<MetricDatum>, EmitError> {
    templates
        .iter()
        .map(|template| {
            template
                .value
                .validate()
                .map_err(|reason| EmitError::InvalidPlan {
                    name: template.name.clone(),
                    reason,
                })?;
            Ok(MetricDatum {
                metric_name: template.name.clone(),
                dimensions: shared
                    .iter()
                    .chain(&template.dimensions)
                    .cloned()
                    .collect(),
                timestamp: timestamp.timestamp(),
                value: template.value.sample(&mut *rng),
                unit: template.unit,
            })
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct CloudMetricsClient {
    client: aws_sdk_cloudwatch::Client,
}

impl CloudMetricsClient {
    pub fn new(client: aws_sdk_cloudwatch::Client) -> Self {
        Self { client }
    }

    /// Resolve credentials from the environment; region, endpoint override
    /// and timeout come from `config`.
    pub async fn from_env(config: &CloudConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(config.timeout)
                    .build(),
            );
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        Self::new(aws_sdk_cloudwatch::Client::new(&loader.load().await))
    }

    /// Send `data` under `namespace`, split into as many requests as the
    /// service limit requires. Returns the number of requests made.
    pub async fn put_metric_data(
        &self,
        namespace: &str,
        data: &[MetricDatum],
    ) -> Result<usize, DeliveryFailure> {
        let mut requests = 0;
        for chunk in data.chunks(MAX_DATUMS_PER_REQUEST) {
            let metric_data = chunk
                .iter()
                .map(MetricDatum::to_sdk)
                .collect::<Result<Vec<_>, _>>()?;
            self.client
                .put_metric_data()
                .namespace(namespace)
                .set_metric_data(Some(metric_data))
                .send()
                .await
                .map_err(|error| DeliveryFailure::Cloud(DisplayErrorContext(error).to_string()))?;
            requests += 1;
            tracing::debug!(namespace, datums = chunk.len(), "put metric data");
        }
        Ok(requests)
    }
}

/// Build and send the batch described by `config`.
pub async fn put_batch(config: &CloudConfig) -> anyhow::Result<usize> {
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let data = synthesize(&config.data, &config.dimensions, Utc::now(), &mut rng)?;
    tracing::info!(
        namespace = %config.namespace,
        region = %config.region,
        endpoint = config.endpoint.as_deref().unwrap_or("default"),
        datums = data.len(),
        "sending metric data"
    );
    let client = CloudMetricsClient::from_env(config).await;
    client
        .put_metric_data(&config.namespace, &data)
        .await
        .with_context(|| format!("cannot put metric data to namespace `{}`", config.namespace))
}
