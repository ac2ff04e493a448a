// Copyright (c), Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Synthetic value generation.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{EmitError, Result};
use crate::registry::{MetricHandle, MetricKind, Registry};

/// A bounded distribution values are drawn from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dist", rename_all = "kebab-case")]
pub enum Distribution {
    Constant { value: f64 },
    /// float in `[low, high)`
    Uniform { low: f64, high: f64 },
    /// integer in `[low, high]`
    UniformInt { low: i64, high: i64 },
    Exponential { mean: f64 },
    /// draw from one of `choices`, picked uniformly
    OneOf { choices: Vec<Distribution> },
}

impl Distribution {
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Distribution::Constant { value } if !value.is_finite() => {
                Err(format!("constant {value} is not finite"))
            }
            Distribution::Uniform { low, high }
                if !low.is_finite() || !high.is_finite() || low > high =>
            {
                Err(format!("uniform range [{low}, {high}) is invalid"))
            }
            Distribution::Uniform { low, high } if !(high - low).is_finite() => {
                Err(format!("uniform range [{low}, {high}) is too wide"))
            }
            Distribution::UniformInt { low, high } if low > high => {
                Err(format!("integer range [{low}, {high}] is empty"))
            }
            Distribution::Exponential { mean } if !mean.is_finite() || *mean <= 0.0 => {
                Err(format!("exponential mean {mean} must be positive"))
            }
            Distribution::OneOf { choices } if choices.is_empty() => {
                Err("one-of needs at least one choice".to_owned())
            }
            Distribution::OneOf { choices } => choices.iter().try_for_each(Distribution::validate),
            _ => Ok(()),
        }
    }

    /// Smallest value a draw can take.
    pub fn lower_bound(&self) -> f64 {
        match self {
            Distribution::Constant { value } => *value,
            Distribution::Uniform { low, .. } => *low,
            Distribution::UniformInt { low, .. } => *low as f64,
            Distribution::Exponential { .. } => 0.0,
            Distribution::OneOf { choices } => choices
                .iter()
                .map(Distribution::lower_bound)
                .fold(f64::INFINITY, f64::min),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self {
            Distribution::Constant { value } => *value,
            Distribution::Uniform { low, high } if low == high => *low,
            Distribution::Uniform { low, high } => rng.gen_range(*low..*high),
            Distribution::UniformInt { low, high } => rng.gen_range(*low..=*high) as f64,
            Distribution::Exponential { mean } => {
                let u: f64 = rng.gen();
                -mean * (1.0 - u).ln()
            }
            Distribution::OneOf { choices } => match choices.choose(rng) {
                Some(choice) => choice.sample(rng),
                None => 0.0,
            },
        }
    }
}

/// The values a label takes on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelPool {
    pub name: String,
    pub values: Vec<String>,
}

impl LabelPool {
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Which label combinations are sampled on each tick.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum LabelSelection {
    /// every combination of the pools
    #[default]
    Each,
    /// `count` distinct combinations chosen at random
    Pick { count: usize },
}

/// How one metric is filled on each tick.
#[derive(Clone, Debug)]
pub struct SamplePlan {
    handle: MetricHandle,
    distribution: Distribution,
    /// one pool per label name, in definition order
    pools: Vec<Vec<String>>,
    selection: LabelSelection,
    probability: Option<f64>,
}

impl SamplePlan {
    /// A plan for a metric without labels; use [`SamplePlan::with_pools`] otherwise.
    pub fn new(handle: MetricHandle, distribution: Distribution) -> Self {
        Self {
            handle,
            distribution,
            pools: Vec::new(),
            selection: LabelSelection::Each,
            probability: None,
        }
    }

    /// Attach label pools. Every label of the metric needs exactly one pool;
    /// pools may be listed in any order.
    pub fn with_pools(mut self, pools: Vec<LabelPool>) -> Result<Self> {
        let mut ordered = Vec::with_capacity(self.handle.label_names().len());
        for label in self.handle.label_names() {
            let pool = pools
                .iter()
                .find(|p| &p.name == label)
                .ok_or_else(|| self.invalid(format!("no values given for label `{label}`")))?;
            if pool.values.is_empty() {
                return Err(self.invalid(format!("label `{label}` has no values")));
            }
            ordered.push(pool.values.clone());
        }
        if let Some(extra) = pools
            .iter()
            .find(|p| !self.handle.label_names().contains(&p.name))
        {
            return Err(self.invalid(format!("`{}` is not a label of this metric", extra.name)));
        }
        self.pools = ordered;
        Ok(self)
    }

    pub fn with_selection(mut self, selection: LabelSelection) -> Self {
        self.selection = selection;
        self
    }

    /// Sample each selected series only with probability `p`.
    pub fn with_probability(mut self, p: f64) -> Self {
        self.probability = Some(p);
        self
    }

    pub fn handle(&self) -> &MetricHandle {
        &self.handle
    }

    pub fn distribution(&self) -> &Distribution {
        &self.distribution
    }

    fn invalid(&self, reason: impl Into<String>) -> EmitError {
        EmitError::InvalidPlan {
            name: self.handle.name().to_owned(),
            reason: reason.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        self.distribution.validate().map_err(|r| self.invalid(r))?;
        if self.handle.kind() == MetricKind::Counter && self.distribution.lower_bound() < 0.0 {
            return Err(self.invalid(format!(
                "counter deltas must not be negative, distribution reaches {}",
                self.distribution.lower_bound()
            )));
        }
        if self.pools.len() != self.handle.label_names().len() {
            return Err(EmitError::LabelMismatch {
                name: self.handle.name().to_owned(),
                expected: self.handle.label_names().len(),
                got: self.pools.len(),
            });
        }
        if let Some(p) = self.probability {
            if !(0.0..=1.0).contains(&p) {
                return Err(self.invalid(format!("probability {p} is outside [0, 1]")));
            }
        }
        if let LabelSelection::Pick { count: 0 } = self.selection {
            return Err(self.invalid("pick count must be at least 1"));
        }
        Ok(())
    }

    /// Cartesian product of the pools.
    fn combinations(&self) -> Vec<Vec<&str>> {
        self.pools.iter().fold(vec![Vec::new()], |acc, pool| {
            acc.iter()
                .flat_map(|prefix| {
                    pool.iter().map(move |value| {
                        let mut combo = prefix.clone();
                        combo.push(value.as_str());
                        combo
                    })
                })
                .collect()
        })
    }

    fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<Vec<&str>> {
        let combinations = self.combinations();
        match self.selection {
            LabelSelection::Each => combinations,
            LabelSelection::Pick { count } => combinations
                .choose_multiple(rng, count)
                .cloned()
                .collect(),
        }
    }

    fn draw<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        registry: &Registry,
        label_values: &[&str],
    ) -> Result<f64> {
        let value = self.distribution.sample(rng);
        registry.record(&self.handle, label_values, value)?;
        Ok(value)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickStats {
    /// series that received a value
    pub sampled: usize,
    /// series passed over by their plan's probability
    pub skipped: usize,
}

/// Fills a registry with synthetic values according to a set of plans.
#[derive(Debug)]
pub struct Generator<R = StdRng> {
    rng: R,
    plans: Vec<SamplePlan>,
}

impl Generator<StdRng> {
    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> Generator<R> {
    pub fn new(rng: R) -> Self {
        Self {
            rng,
            plans: Vec::new(),
        }
    }

    pub fn add_plan(&mut self, plan: SamplePlan) -> Result<()> {
        plan.validate()?;
        self.plans.push(plan);
        Ok(())
    }

    pub fn plans(&self) -> &[SamplePlan] {
        &self.plans
    }

    /// Draw one value for `metric` and record it under `label_values`.
    ///
    /// Gauges take the value as is, counters add it as a delta (negative draws
    /// fail with [`EmitError::InvalidDelta`]), histograms and summaries observe it.
    pub fn sample(
        &mut self,
        registry: &Registry,
        metric: &str,
        label_values: &[&str],
    ) -> Result<f64> {
        let plan = self
            .plans
            .iter()
            .find(|p| p.handle.name() == metric)
            .ok_or_else(|| EmitError::UnknownMetric(metric.to_owned()))?;
        plan.draw(&mut self.rng, registry, label_values)
    }

    /// Run every plan once.
    pub fn tick(&mut self, registry: &Registry) -> Result<TickStats> {
        let mut stats = TickStats::default();
        for plan in &self.plans {
            for labels in plan.select(&mut self.rng) {
                if let Some(p) = plan.probability {
                    if !self.rng.gen_bool(p) {
                        stats.skipped += 1;
                        continue;
                    }
                }
                plan.draw(&mut self.rng, registry, &labels)?;
                stats.sampled += 1;
            }
        }
        Ok(stats)
    }
}
