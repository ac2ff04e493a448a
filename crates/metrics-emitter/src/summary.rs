// Copyright (c), Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Client-side quantile summaries.
//!
//! The `prometheus` crate encodes summaries but ships no collector for them, so
//! this is a small [`Collector`] that keeps cumulative `_count`/`_sum` per label
//! combination plus a bounded window of recent observations from which the
//! configured quantiles are computed at collection time.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use prometheus::core::{Collector, Desc};
use prometheus::proto::{LabelPair, Metric, MetricFamily, MetricType, Quantile, Summary};

/// Observations kept per series for quantile estimation.
pub const DEFAULT_WINDOW: usize = 1024;

#[derive(Debug, Default)]
struct SeriesState {
    count: u64,
    sum: f64,
    recent: VecDeque<f64>,
}

impl SeriesState {
    fn observe(&mut self, value: f64, window: usize) {
        self.count += 1;
        self.sum += value;
        if self.recent.len() == window {
            self.recent.pop_front();
        }
        self.recent.push_back(value);
    }

    /// nearest-rank quantiles over the window, NaN while it is empty
    fn quantiles(&self, objectives: &[f64]) -> Vec<(f64, f64)> {
        let mut sorted: Vec<f64> = self.recent.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        objectives
            .iter()
            .map(|&q| {
                if sorted.is_empty() {
                    return (q, f64::NAN);
                }
                let rank = (q * sorted.len() as f64).ceil() as usize;
                (q, sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
            })
            .collect()
    }
}

struct SummaryCore {
    desc: Desc,
    name: String,
    help: String,
    label_names: Vec<String>,
    quantiles: Vec<f64>,
    window: usize,
    series: Mutex<BTreeMap<Vec<String>, SeriesState>>,
}

/// A labelled family of summaries, registrable in a [`prometheus::Registry`].
#[derive(Clone)]
pub struct SummaryVec {
    core: Arc<SummaryCore>,
}

impl SummaryVec {
    pub fn new(
        name: &str,
        help: &str,
        label_names: &[&str],
        quantiles: Vec<f64>,
        window: usize,
    ) -> prometheus::Result<Self> {
        let desc = Desc::new(
            name.to_owned(),
            help.to_owned(),
            label_names.iter().map(|l| l.to_string()).collect(),
            HashMap::new(),
        )?;
        Ok(Self {
            core: Arc::new(SummaryCore {
                desc,
                name: name.to_owned(),
                help: help.to_owned(),
                label_names: label_names.iter().map(|l| l.to_string()).collect(),
                quantiles,
                window: window.max(1),
                series: Mutex::new(BTreeMap::new()),
            }),
        })
    }

    pub fn observe(&self, label_values: &[&str], value: f64) -> prometheus::Result<()> {
        if label_values.len() != self.core.label_names.len() {
            return Err(prometheus::Error::InconsistentCardinality {
                expect: self.core.label_names.len(),
                got: label_values.len(),
            });
        }
        let key = label_values.iter().map(|v| v.to_string()).collect();
        self.core
            .series
            .lock()
            .entry(key)
            .or_default()
            .observe(value, self.core.window);
        Ok(())
    }

    pub fn quantiles(&self) -> &[f64] {
        &self.core.quantiles
    }
}

impl Collector for SummaryVec {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.core.desc]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let series = self.core.series.lock();
        let mut metrics = Vec::with_capacity(series.len());
        for (values, state) in series.iter() {
            let mut labels: Vec<LabelPair> = self
                .core
                .label_names
                .iter()
                .zip(values)
                .map(|(name, value)| {
                    let mut pair = LabelPair::default();
                    pair.set_name(name.clone());
                    pair.set_value(value.clone());
                    pair
                })
                .collect();
            labels.sort_by(|a, b| a.get_name().cmp(b.get_name()));

            let quantiles: Vec<Quantile> = state
                .quantiles(&self.core.quantiles)
                .into_iter()
                .map(|(q, v)| {
                    let mut quantile = Quantile::default();
                    quantile.set_quantile(q);
                    quantile.set_value(v);
                    quantile
                })
                .collect();

            let mut summary = Summary::default();
            summary.set_sample_count(state.count);
            summary.set_sample_sum(state.sum);
            summary.set_quantile(quantiles.into());

            let mut metric = Metric::default();
            metric.set_label(labels.into());
            metric.set_summary(summary);
            metrics.push(metric);
        }

        let mut family = MetricFamily::default();
        family.set_name(self.core.name.clone());
        family.set_help(self.core.help.clone());
        family.set_field_type(MetricType::SUMMARY);
        family.set_metric(metrics.into());
        vec![family]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary_of(family: &MetricFamily, index: usize) -> &Summary {
        family.get_metric()[index].get_summary()
    }

    #[test]
    fn quantiles_use_nearest_rank() {
        let summary = SummaryVec::new("latency", "latency", &[], vec![0.5, 0.9, 1.0], 100).unwrap();
        for v in 1..=10 {
            summary.observe(&[], v as f64).unwrap();
        }
        let families = summary.collect();
        let s = summary_of(&families[0], 0);
        assert_eq!(s.get_sample_count(), 10);
        assert_eq!(s.get_sample_sum(), 55.0);
        let got: Vec<(f64, f64)> = s
            .get_quantile()
            .iter()
            .map(|q| (q.get_quantile(), q.get_value()))
            .collect();
        assert_eq!(got, vec![(0.5, 5.0), (0.9, 9.0), (1.0, 10.0)]);
    }

    #[test]
    fn window_bounds_quantiles_but_not_totals() {
        let summary = SummaryVec::new("latency", "latency", &[], vec![0.0], 3).unwrap();
        for v in [100.0, 1.0, 2.0, 3.0] {
            summary.observe(&[], v).unwrap();
        }
        let families = summary.collect();
        let s = summary_of(&families[0], 0);
        assert_eq!(s.get_sample_count(), 4);
        assert_eq!(s.get_sample_sum(), 106.0);
        // 100.0 fell out of the window
        assert_eq!(s.get_quantile()[0].get_value(), 1.0);
    }

    #[test]
    fn series_are_created_per_label_combination() {
        let summary = SummaryVec::new("amount", "amount", &["kind"], vec![], 10).unwrap();
        summary.observe(&["deposit"], 10.0).unwrap();
        summary.observe(&["withdrawal"], 20.0).unwrap();
        summary.observe(&["deposit"], 5.0).unwrap();

        let families = summary.collect();
        assert_eq!(families[0].get_field_type(), MetricType::SUMMARY);
        assert_eq!(families[0].get_metric().len(), 2);
        let deposit = &families[0].get_metric()[0];
        assert_eq!(deposit.get_label()[0].get_value(), "deposit");
        assert_eq!(deposit.get_summary().get_sample_count(), 2);
        assert!(deposit.get_summary().get_quantile().is_empty());
    }

    #[test]
    fn wrong_label_count_is_rejected() {
        let summary = SummaryVec::new("amount", "amount", &["kind"], vec![], 10).unwrap();
        assert!(matches!(
            summary.observe(&[], 1.0),
            Err(prometheus::Error::InconsistentCardinality { expect: 1, got: 0 })
        ));
        assert!(summary.collect()[0].get_metric().is_empty());
    }
}
