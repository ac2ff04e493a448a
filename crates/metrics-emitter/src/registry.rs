// Copyright (c), Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Metric catalog and the registry that owns every series.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use prometheus::core::Collector;
use prometheus::proto::{MetricFamily, MetricType};
use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, TextEncoder};
use serde::{Deserialize, Serialize};

use crate::error::{EmitError, Result};
use crate::summary::{SummaryVec, DEFAULT_WINDOW};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetricKind {
    Gauge,
    Counter,
    Histogram,
    Summary,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gauge => f.write_str("gauge"),
            Self::Counter => f.write_str("counter"),
            Self::Histogram => f.write_str("histogram"),
            Self::Summary => f.write_str("summary"),
        }
    }
}

/// Static identity of a metric: everything fixed at registration time.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricDefinition {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    /// Every observation must supply one value per name, in this order.
    pub label_names: Vec<String>,
    /// Histogram upper bounds. `None` uses the prometheus defaults.
    pub buckets: Option<Vec<f64>>,
    /// Summary objectives in `[0, 1]`. Empty exposes only `_count` and `_sum`.
    pub quantiles: Vec<f64>,
}

impl MetricDefinition {
    pub fn new(kind: MetricKind, name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            kind,
            label_names: Vec::new(),
            buckets: None,
            quantiles: Vec::new(),
        }
    }

    pub fn gauge(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self::new(MetricKind::Gauge, name, help)
    }

    pub fn counter(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self::new(MetricKind::Counter, name, help)
    }

    pub fn histogram(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self::new(MetricKind::Histogram, name, help)
    }

    pub fn summary(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self::new(MetricKind::Summary, name, help)
    }

    pub fn with_labels<I, S>(mut self, label_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.label_names = label_names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = Some(buckets);
        self
    }

    pub fn with_quantiles(mut self, quantiles: Vec<f64>) -> Self {
        self.quantiles = quantiles;
        self
    }

    fn invalid(&self, reason: impl Into<String>) -> EmitError {
        EmitError::InvalidDefinition {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.help.is_empty() {
            return Err(self.invalid("help text must not be empty"));
        }
        let mut seen = HashSet::new();
        for label in &self.label_names {
            if !seen.insert(label.as_str()) {
                return Err(self.invalid(format!("label `{label}` is listed twice")));
            }
        }
        if self.buckets.is_some() && self.kind != MetricKind::Histogram {
            return Err(self.invalid("buckets are only valid for histograms"));
        }
        if let Some(buckets) = &self.buckets {
            if buckets.is_empty() {
                return Err(self.invalid("histogram needs at least one bucket"));
            }
            if buckets.iter().any(|b| !b.is_finite()) {
                return Err(self.invalid("bucket boundaries must be finite"));
            }
            if buckets.windows(2).any(|w| w[0] >= w[1]) {
                return Err(self.invalid("bucket boundaries must be strictly increasing"));
            }
        }
        if !self.quantiles.is_empty() && self.kind != MetricKind::Summary {
            return Err(self.invalid("quantiles are only valid for summaries"));
        }
        if self.quantiles.iter().any(|q| !(0.0..=1.0).contains(q)) {
            return Err(self.invalid("quantiles must lie in [0, 1]"));
        }
        Ok(())
    }
}

#[derive(Clone)]
enum Series {
    Gauge(GaugeVec),
    Counter(CounterVec),
    Histogram(HistogramVec),
    Summary(SummaryVec),
}

impl Series {
    fn build(definition: &MetricDefinition) -> prometheus::Result<Self> {
        let labels: Vec<&str> = definition.label_names.iter().map(String::as_str).collect();
        let opts = Opts::new(definition.name.clone(), definition.help.clone());
        Ok(match definition.kind {
            MetricKind::Gauge => Series::Gauge(GaugeVec::new(opts, &labels)?),
            MetricKind::Counter => Series::Counter(CounterVec::new(opts, &labels)?),
            MetricKind::Histogram => {
                let mut opts = HistogramOpts::from(opts);
                if let Some(buckets) = &definition.buckets {
                    opts = opts.buckets(buckets.clone());
                }
                Series::Histogram(HistogramVec::new(opts, &labels)?)
            }
            MetricKind::Summary => Series::Summary(SummaryVec::new(
                &definition.name,
                &definition.help,
                &labels,
                definition.quantiles.clone(),
                DEFAULT_WINDOW,
            )?),
        })
    }

    fn collector(&self) -> Box<dyn Collector> {
        match self {
            Series::Gauge(v) => Box::new(v.clone()),
            Series::Counter(v) => Box::new(v.clone()),
            Series::Histogram(v) => Box::new(v.clone()),
            Series::Summary(v) => Box::new(v.clone()),
        }
    }
}

/// Cheap, clonable reference to a registered metric.
#[derive(Clone)]
pub struct MetricHandle {
    definition: Arc<MetricDefinition>,
    series: Series,
}

impl fmt::Debug for MetricHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricHandle")
            .field("definition", &self.definition)
            .finish()
    }
}

impl MetricHandle {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn kind(&self) -> MetricKind {
        self.definition.kind
    }

    pub fn label_names(&self) -> &[String] {
        &self.definition.label_names
    }

    pub fn definition(&self) -> &MetricDefinition {
        &self.definition
    }

    fn check_labels(&self, label_values: &[&str]) -> Result<()> {
        let expected = self.definition.label_names.len();
        if label_values.len() != expected {
            return Err(EmitError::LabelMismatch {
                name: self.definition.name.clone(),
                expected,
                got: label_values.len(),
            });
        }
        Ok(())
    }

    fn kind_mismatch(&self, op: &'static str) -> EmitError {
        EmitError::KindMismatch {
            name: self.definition.name.clone(),
            kind: self.definition.kind,
            op,
        }
    }

    fn check_finite(&self, value: f64) -> Result<()> {
        if value.is_finite() {
            Ok(())
        } else {
            Err(EmitError::InvalidValue {
                name: self.definition.name.clone(),
                value,
            })
        }
    }
}

/// Owns metric definitions and their series for a single emitter.
///
/// There is no process-wide instance; every emitter builds its own.
pub struct Registry {
    inner: prometheus::Registry,
    handles: BTreeMap<String, MetricHandle>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("metrics", &self.handles.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: prometheus::Registry::new(),
            handles: BTreeMap::new(),
        }
    }

    /// Register a metric. The registry is left untouched on any error.
    pub fn define(&mut self, definition: MetricDefinition) -> Result<MetricHandle> {
        if self.handles.contains_key(&definition.name) {
            return Err(EmitError::DuplicateName(definition.name));
        }
        definition.validate()?;
        let series = Series::build(&definition).map_err(|e| definition.invalid(e.to_string()))?;
        match self.inner.register(series.collector()) {
            Ok(()) => {}
            Err(prometheus::Error::AlreadyReg) => {
                return Err(EmitError::DuplicateName(definition.name))
            }
            Err(e) => return Err(e.into()),
        }

        let handle = MetricHandle {
            definition: Arc::new(definition),
            series,
        };
        self.handles
            .insert(handle.name().to_owned(), handle.clone());
        tracing::debug!(name = handle.name(), kind = %handle.kind(), "registered metric");
        Ok(handle)
    }

    pub fn get(&self, name: &str) -> Option<&MetricHandle> {
        self.handles.get(name)
    }

    pub fn handles(&self) -> impl Iterator<Item = &MetricHandle> {
        self.handles.values()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Handles from another registry would silently write to series that are
    /// never gathered here.
    fn owned<'a>(&self, handle: &'a MetricHandle) -> Result<&'a MetricHandle> {
        match self.handles.get(handle.name()) {
            Some(own) if Arc::ptr_eq(&own.definition, &handle.definition) => Ok(handle),
            _ => Err(EmitError::UnknownMetric(handle.name().to_owned())),
        }
    }

    /// Overwrite a gauge series.
    pub fn set(&self, handle: &MetricHandle, label_values: &[&str], value: f64) -> Result<()> {
        let handle = self.owned(handle)?;
        handle.check_labels(label_values)?;
        handle.check_finite(value)?;
        match &handle.series {
            Series::Gauge(vec) => {
                vec.get_metric_with_label_values(label_values)?.set(value);
                Ok(())
            }
            _ => Err(handle.kind_mismatch("set")),
        }
    }

    /// Add a non-negative delta to a counter series.
    pub fn add(&self, handle: &MetricHandle, label_values: &[&str], delta: f64) -> Result<()> {
        let handle = self.owned(handle)?;
        handle.check_labels(label_values)?;
        if !delta.is_finite() || delta < 0.0 {
            return Err(EmitError::InvalidDelta {
                name: handle.name().to_owned(),
                delta,
            });
        }
        match &handle.series {
            Series::Counter(vec) => {
                vec.get_metric_with_label_values(label_values)?.inc_by(delta);
                Ok(())
            }
            _ => Err(handle.kind_mismatch("add")),
        }
    }

    /// Record one observation into a histogram or summary series.
    pub fn observe(&self, handle: &MetricHandle, label_values: &[&str], value: f64) -> Result<()> {
        let handle = self.owned(handle)?;
        handle.check_labels(label_values)?;
        handle.check_finite(value)?;
        match &handle.series {
            Series::Histogram(vec) => {
                vec.get_metric_with_label_values(label_values)?.observe(value);
                Ok(())
            }
            Series::Summary(vec) => Ok(vec.observe(label_values, value)?),
            _ => Err(handle.kind_mismatch("observe")),
        }
    }

    /// Apply `value` with the semantics of the handle's kind.
    pub fn record(&self, handle: &MetricHandle, label_values: &[&str], value: f64) -> Result<()> {
        match handle.kind() {
            MetricKind::Gauge => self.set(handle, label_values, value),
            MetricKind::Counter => self.add(handle, label_values, value),
            MetricKind::Histogram | MetricKind::Summary => {
                self.observe(handle, label_values, value)
            }
        }
    }

    /// Metric families for every series observed so far.
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.inner.gather()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot::from_families(&self.gather())
    }

    /// Text exposition of the current state.
    pub fn encode_text(&self) -> prometheus::Result<String> {
        TextEncoder::new().encode_to_string(&self.gather())
    }
}

/// Current value of one series.
#[derive(Clone, Debug, PartialEq)]
pub enum SeriesValue {
    Gauge(f64),
    Counter(f64),
    Histogram {
        count: u64,
        sum: f64,
        /// `(upper_bound, cumulative_count)`, `+Inf` excluded.
        buckets: Vec<(f64, u64)>,
    },
    Summary {
        count: u64,
        sum: f64,
        quantiles: Vec<(f64, f64)>,
    },
    Untyped(f64),
}

impl SeriesValue {
    /// Per-bucket counts for a histogram, with the trailing `+Inf` overflow
    /// bucket appended. They always add up to the observation count.
    pub fn bucket_counts(&self) -> Option<Vec<u64>> {
        let SeriesValue::Histogram { count, buckets, .. } = self else {
            return None;
        };
        let mut previous = 0;
        let mut counts: Vec<u64> = buckets
            .iter()
            .map(|&(_, cumulative)| {
                let n = cumulative - previous;
                previous = cumulative;
                n
            })
            .collect();
        counts.push(count - previous);
        Some(counts)
    }

    /// The scalar value for gauges and counters.
    pub fn scalar(&self) -> Option<f64> {
        match self {
            SeriesValue::Gauge(v) | SeriesValue::Counter(v) | SeriesValue::Untyped(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SeriesSnapshot {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: SeriesValue,
}

/// Typed, comparable view of gathered metric families.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistrySnapshot {
    pub series: Vec<SeriesSnapshot>,
}

impl RegistrySnapshot {
    pub fn from_families(families: &[MetricFamily]) -> Self {
        let mut series = Vec::new();
        for family in families {
            for metric in family.get_metric() {
                let labels = metric
                    .get_label()
                    .iter()
                    .map(|pair| (pair.get_name().to_owned(), pair.get_value().to_owned()))
                    .collect();
                let value = match family.get_field_type() {
                    MetricType::GAUGE => SeriesValue::Gauge(metric.get_gauge().get_value()),
                    MetricType::COUNTER => SeriesValue::Counter(metric.get_counter().get_value()),
                    MetricType::HISTOGRAM => {
                        let h = metric.get_histogram();
                        SeriesValue::Histogram {
                            count: h.get_sample_count(),
                            sum: h.get_sample_sum(),
                            buckets: h
                                .get_bucket()
                                .iter()
                                .filter(|b| b.get_upper_bound().is_finite())
                                .map(|b| (b.get_upper_bound(), b.get_cumulative_count()))
                                .collect(),
                        }
                    }
                    MetricType::SUMMARY => {
                        let s = metric.get_summary();
                        SeriesValue::Summary {
                            count: s.get_sample_count(),
                            sum: s.get_sample_sum(),
                            quantiles: s
                                .get_quantile()
                                .iter()
                                .map(|q| (q.get_quantile(), q.get_value()))
                                .collect(),
                        }
                    }
                    MetricType::UNTYPED => SeriesValue::Untyped(metric.get_untyped().get_value()),
                };
                series.push(SeriesSnapshot {
                    name: family.get_name().to_owned(),
                    labels,
                    value,
                });
            }
        }
        Self { series }
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Find the series of `name` carrying exactly `labels`.
    pub fn find(&self, name: &str, labels: &[(&str, &str)]) -> Option<&SeriesSnapshot> {
        self.series.iter().find(|s| {
            s.name == name
                && s.labels.len() == labels.len()
                && labels
                    .iter()
                    .all(|(k, v)| s.labels.get(*k).map(String::as_str) == Some(*v))
        })
    }

    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> Option<&SeriesValue> {
        self.find(name, labels).map(|s| &s.value)
    }
}
