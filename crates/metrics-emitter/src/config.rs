// Copyright (c), Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::cloud::{DatumTemplate, Dimension};
use crate::delivery::{GroupingKey, PushMode};
use crate::registry::{MetricDefinition, MetricKind, Registry};
use crate::sampler::{Distribution, Generator, LabelPool, LabelSelection, SamplePlan};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EmitterConfig {
    /// Required for `push`, ignored when serving.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<PushConfig>,
    /// Fixed seed for reproducible values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub metrics: Vec<MetricSpec>,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct PushConfig {
    /// Pushgateway base url, e.g. `http://localhost:9091`.
    pub url: String,
    pub job: String,
    pub instance: String,
    /// `add` or `replace`, no default.
    pub mode: PushMode,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "interval-secs", default = "push_interval")]
    pub interval: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "timeout-secs", default = "push_timeout")]
    pub timeout: Duration,
    /// Extra grouping labels beside job and instance.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

/// the default time between two pushes
pub fn push_interval() -> Duration {
    Duration::from_secs(15)
}

/// the default bound on a single push request
pub fn push_timeout() -> Duration {
    Duration::from_secs(crate::var!("PUSH_CLIENT_TIMEOUT", 10))
}

impl PushConfig {
    pub fn grouping_key(&self) -> GroupingKey {
        self.labels
            .iter()
            .fold(GroupingKey::new(&self.job, &self.instance), |key, (k, v)| {
                key.with_label(k, v)
            })
    }

    pub fn validate(&self) -> Result<()> {
        if self.job.is_empty() {
            bail!("push job must not be empty");
        }
        if self.interval.is_zero() {
            bail!("push interval must be at least one second");
        }
        if self.timeout.is_zero() {
            bail!("push timeout must be at least one second");
        }
        for reserved in ["job", "instance"] {
            if self.labels.contains_key(reserved) {
                bail!("`{reserved}` is set through its own field, not through labels");
            }
        }
        Ok(())
    }
}

/// One metric and how to fill it.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct MetricSpec {
    pub name: String,
    /// Defaults to the metric name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    pub kind: MetricKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<LabelPool>,
    #[serde(default)]
    pub select: LabelSelection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buckets: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quantiles: Vec<f64>,
    pub value: Distribution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
}

impl MetricSpec {
    pub fn definition(&self) -> MetricDefinition {
        let mut definition = MetricDefinition::new(
            self.kind,
            self.name.clone(),
            self.help.clone().unwrap_or_else(|| self.name.clone()),
        )
        .with_labels(self.labels.iter().map(|pool| pool.name.clone()))
        .with_quantiles(self.quantiles.clone());
        if let Some(buckets) = &self.buckets {
            definition = definition.with_buckets(buckets.clone());
        }
        definition
    }
}

impl EmitterConfig {
    pub fn push(&self) -> Result<&PushConfig> {
        let push = self
            .push
            .as_ref()
            .context("config has no `push` section")?;
        push.validate()?;
        Ok(push)
    }

    /// Register every metric in a fresh registry and build the generator
    /// that fills them.
    pub fn build(&self) -> Result<(Registry, Generator)> {
        let mut registry = Registry::new();
        let mut generator = match self.seed {
            Some(seed) => Generator::seeded(seed),
            None => Generator::from_entropy(),
        };
        for spec in &self.metrics {
            let handle = registry
                .define(spec.definition())
                .with_context(|| format!("cannot define metric `{}`", spec.name))?;
            let mut plan = SamplePlan::new(handle, spec.value.clone())
                .with_pools(spec.labels.clone())?
                .with_selection(spec.select.clone());
            if let Some(p) = spec.probability {
                plan = plan.with_probability(p);
            }
            generator
                .add_plan(plan)
                .with_context(|| format!("cannot plan metric `{}`", spec.name))?;
        }
        debug!(metrics = registry.len(), "built metric registry");
        Ok((registry, generator))
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CloudConfig {
    #[serde(default = "cloud_region_default")]
    pub region: String,
    /// Overrides the regional endpoint, e.g. for a local emulator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub namespace: String,
    /// Dimensions shared by every data point.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dimensions: Vec<Dimension>,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "timeout-secs", default = "cloud_timeout_default")]
    pub timeout: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub data: Vec<DatumTemplate>,
}

fn cloud_region_default() -> String {
    "us-east-1".to_string()
}

fn cloud_timeout_default() -> Duration {
    Duration::from_secs(crate::var!("CLOUD_CLIENT_TIMEOUT", 30))
}

/// load our config file from a path
pub fn load<P: AsRef<std::path::Path>, T: DeserializeOwned + Serialize>(path: P) -> Result<T> {
    let path = path.as_ref();
    debug!("Reading config from {:?}", path);
    Ok(serde_yaml::from_reader(
        std::fs::File::open(path).context(format!("cannot open {:?}", path))?,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SeriesValue;

    const ECOMMERCE: &str = include_str!("../config/ecommerce.yaml");
    const CLOUD: &str = include_str!("../config/cloud-metrics.yaml");

    #[test]
    fn sample_emitter_config_builds() {
        let config: EmitterConfig = serde_yaml::from_str(ECOMMERCE).unwrap();
        let push = config.push().unwrap();
        assert_eq!(push.mode, PushMode::Add);
        assert_eq!(push.grouping_key().job(), "ecommerce_job");

        let (registry, mut generator) = config.build().unwrap();
        assert_eq!(registry.len(), config.metrics.len());
        let stats = generator.tick(&registry).unwrap();
        assert!(stats.sampled > 0);
        assert!(!registry.snapshot().is_empty());
    }

    #[test]
    fn sample_cloud_config_parses() {
        let config: CloudConfig = serde_yaml::from_str(CLOUD).unwrap();
        assert_eq!(config.data.len(), 20);
        assert_eq!(config.timeout, cloud_timeout_default());
        assert_eq!(config.region, "us-east-1");
        // the SDK resolves the regional endpoint unless overridden
        assert_eq!(config.endpoint, None);
    }

    #[test]
    fn push_mode_is_required() {
        let yaml = "push:\n  url: http://localhost:9091\n  job: demo\n  instance: i1\nmetrics: []\n";
        let err = serde_yaml::from_str::<EmitterConfig>(yaml).unwrap_err();
        assert!(err.to_string().contains("mode"), "{err}");
    }

    #[test]
    fn push_defaults_and_grouping_labels() {
        let yaml = r#"
push:
  url: http://localhost:9091
  job: demo
  instance: i1
  mode: replace
  labels:
    region: eu
metrics: []
"#;
        let config: EmitterConfig = serde_yaml::from_str(yaml).unwrap();
        let push = config.push().unwrap();
        assert_eq!(push.interval, Duration::from_secs(15));
        assert_eq!(
            push.grouping_key(),
            GroupingKey::new("demo", "i1").with_label("region", "eu")
        );
    }

    #[test]
    fn reserved_grouping_labels_are_rejected() {
        let yaml = r#"
push: { url: "http://gw", job: demo, instance: i1, mode: add, labels: { job: other } }
metrics: []
"#;
        let config: EmitterConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.push().is_err());
        let config: EmitterConfig = serde_yaml::from_str("metrics: []").unwrap();
        assert!(config.push().is_err());
    }

    #[test]
    fn metric_specs_map_to_definitions_and_plans() {
        let yaml = r#"
seed: 3
metrics:
  - name: bank_transactions_total_count
    help: Processed transactions total
    kind: counter
    labels:
      - { name: type, values: [deposit, withdrawal, transfer, payment] }
    select: { mode: pick, count: 1 }
    value: { dist: uniform-int, low: 0, high: 30 }
  - name: bank_transaction_latency_seconds_histogram
    kind: histogram
    buckets: [0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1, 2, 5]
    value: { dist: exponential, mean: 0.08 }
  - name: bank_fraud_attempts_total
    kind: counter
    probability: 0
    value: { dist: constant, value: 1 }
"#;
        let config: EmitterConfig = serde_yaml::from_str(yaml).unwrap();
        let histogram = config.metrics[1].definition();
        assert_eq!(histogram.help, "bank_transaction_latency_seconds_histogram");
        assert_eq!(histogram.buckets.as_ref().map(Vec::len), Some(9));

        let (registry, mut generator) = config.build().unwrap();
        let stats = generator.tick(&registry).unwrap();
        assert_eq!(stats.sampled, 2);
        assert_eq!(stats.skipped, 1);
        let snapshot = registry.snapshot();
        let counters = snapshot
            .series
            .iter()
            .filter(|s| s.name == "bank_transactions_total_count")
            .count();
        assert_eq!(counters, 1);
        assert!(matches!(
            snapshot.value("bank_transaction_latency_seconds_histogram", &[]),
            Some(SeriesValue::Histogram { count: 1, .. })
        ));
    }

    #[test]
    fn duplicate_metric_names_fail_the_build() {
        let yaml = r#"
metrics:
  - { name: temperature, kind: gauge, value: { dist: constant, value: 1 } }
  - { name: temperature, kind: gauge, value: { dist: constant, value: 2 } }
"#;
        let config: EmitterConfig = serde_yaml::from_str(yaml).unwrap();
        let err = config.build().unwrap_err();
        assert!(format!("{err:#}").contains("already registered"), "{err:#}");
    }
}
