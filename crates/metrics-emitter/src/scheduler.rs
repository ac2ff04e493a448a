// Copyright (c), Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The generate → deliver → sleep cycle.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::delivery::{Deliver, DeliveryBatch, GroupingKey, PushMode};
use crate::error::Result;
use crate::registry::Registry;
use crate::sampler::{Generator, TickStats};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Generating,
    Delivering,
    Sleeping,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeliveryOutcome {
    Delivered { series: usize },
    Failed { cause: String },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

/// What happened during one tick.
#[derive(Clone, Debug, PartialEq)]
pub struct TickReport {
    /// 1-based
    pub tick: u64,
    pub stats: TickStats,
    pub outcome: DeliveryOutcome,
}

/// Drives one emitter: owns its registry, generator and delivery client.
///
/// `step` performs exactly one state transition so the cycle can be tested
/// without wall-clock sleeps; `run` loops until cancelled.
pub struct Scheduler<D, R = StdRng> {
    registry: Registry,
    generator: Generator<R>,
    delivery: D,
    grouping: GroupingKey,
    mode: PushMode,
    interval: Duration,
    state: SchedulerState,
    pending: TickStats,
    ticks: u64,
    failures: u64,
}

impl<D: Deliver, R: Rng> Scheduler<D, R> {
    pub fn new(
        registry: Registry,
        generator: Generator<R>,
        delivery: D,
        grouping: GroupingKey,
        mode: PushMode,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            generator,
            delivery,
            grouping,
            mode,
            interval,
            state: SchedulerState::Idle,
            pending: TickStats::default(),
            ticks: 0,
            failures: 0,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn delivery(&self) -> &D {
        &self.delivery
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Completed ticks.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Ticks whose delivery failed.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Advance one transition. Returns the report when a delivery completes.
    ///
    /// Leaving `Sleeping` does not wait: the caller owns the sleep.
    pub async fn step(&mut self) -> Result<Option<TickReport>> {
        match self.state {
            SchedulerState::Idle | SchedulerState::Sleeping => {
                self.state = SchedulerState::Generating;
                Ok(None)
            }
            SchedulerState::Generating => {
                // a generator error is a schema error, the run stops here
                self.pending = self.generator.tick(&self.registry)?;
                self.state = SchedulerState::Delivering;
                Ok(None)
            }
            SchedulerState::Delivering => {
                let outcome = self.deliver().await;
                self.ticks += 1;
                if !outcome.is_delivered() {
                    self.failures += 1;
                }
                self.state = SchedulerState::Sleeping;
                Ok(Some(TickReport {
                    tick: self.ticks,
                    stats: std::mem::take(&mut self.pending),
                    outcome,
                }))
            }
        }
    }

    /// Step until the current tick has been delivered; ends in `Sleeping`.
    pub async fn tick(&mut self) -> Result<TickReport> {
        loop {
            if let Some(report) = self.step().await? {
                return Ok(report);
            }
        }
    }

    async fn deliver(&mut self) -> DeliveryOutcome {
        let batch = match DeliveryBatch::capture(&self.registry, self.grouping.clone(), self.mode)
        {
            Ok(batch) => batch,
            Err(error) => {
                tracing::warn!(?error, "unable to snapshot metrics");
                return DeliveryOutcome::Failed {
                    cause: error.to_string(),
                };
            }
        };
        match self.delivery.deliver(&batch).await {
            Ok(()) => DeliveryOutcome::Delivered {
                series: batch.series_count(),
            },
            Err(error) => {
                tracing::warn!(?error, "unable to push metrics");
                DeliveryOutcome::Failed {
                    cause: error.to_string(),
                }
            }
        }
    }

    /// Tick forever, sleeping `interval` between ticks, until `cancel` fires.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        tracing::info!(
            job = self.grouping.job(),
            instance = self.grouping.instance(),
            mode = ?self.mode,
            interval = ?self.interval,
            "starting metrics push"
        );
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let report = self.tick().await?;
            match &report.outcome {
                DeliveryOutcome::Delivered { series } => tracing::debug!(
                    tick = report.tick,
                    sampled = report.stats.sampled,
                    series,
                    "metrics pushed successfully"
                ),
                DeliveryOutcome::Failed { .. } => tracing::debug!(
                    tick = report.tick,
                    failures = self.failures,
                    "push failed, continuing with next tick"
                ),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = cancel.cancelled() => break,
            }
        }
        tracing::info!(ticks = self.ticks, "received cancellation request, shutting down metrics push");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use rand::SeedableRng;
    use tracing_test::traced_test;

    use super::*;
    use crate::delivery::DeliveryFailure;
    use crate::error::EmitError;
    use crate::registry::{MetricDefinition, SeriesValue};
    use crate::sampler::{Distribution, SamplePlan};

    /// Records every batch; the first `fail` deliveries are refused.
    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<DeliveryBatch>>,
        fail: AtomicUsize,
    }

    impl Recorder {
        fn failing(n: usize) -> Self {
            Self {
                fail: AtomicUsize::new(n),
                ..Default::default()
            }
        }
    }

    impl Deliver for Recorder {
        async fn deliver(&self, batch: &DeliveryBatch) -> Result<(), DeliveryFailure> {
            let remaining = self.fail.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail.store(remaining - 1, Ordering::SeqCst);
                return Err(DeliveryFailure::Status {
                    status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                    body: "gateway down".to_owned(),
                });
            }
            self.batches.lock().push(batch.clone());
            Ok(())
        }
    }

    fn scheduler(recorder: Recorder, counter_step: f64) -> Scheduler<Recorder> {
        let mut registry = Registry::new();
        let temperature = registry
            .define(MetricDefinition::gauge("temperature", "temperature"))
            .unwrap();
        let requests = registry
            .define(MetricDefinition::counter("requests_total", "requests"))
            .unwrap();
        let mut generator = Generator::new(StdRng::seed_from_u64(1));
        generator
            .add_plan(SamplePlan::new(
                temperature,
                Distribution::Uniform { low: 20.0, high: 35.0 },
            ))
            .unwrap();
        generator
            .add_plan(SamplePlan::new(
                requests,
                Distribution::Constant { value: counter_step },
            ))
            .unwrap();
        Scheduler::new(
            registry,
            generator,
            recorder,
            GroupingKey::new("demo", "i1"),
            PushMode::Add,
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn steps_through_states_in_order() {
        let mut scheduler = scheduler(Recorder::default(), 1.0);
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        assert!(scheduler.step().await.unwrap().is_none());
        assert_eq!(scheduler.state(), SchedulerState::Generating);
        assert!(scheduler.registry().snapshot().is_empty());

        assert!(scheduler.step().await.unwrap().is_none());
        assert_eq!(scheduler.state(), SchedulerState::Delivering);
        // everything is sampled before anything is delivered
        assert_eq!(scheduler.registry().snapshot().len(), 2);
        assert!(scheduler.delivery().batches.lock().is_empty());

        let report = scheduler.step().await.unwrap().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Sleeping);
        assert_eq!(report.tick, 1);
        assert_eq!(report.stats.sampled, 2);
        assert_eq!(report.outcome, DeliveryOutcome::Delivered { series: 2 });

        assert!(scheduler.step().await.unwrap().is_none());
        assert_eq!(scheduler.state(), SchedulerState::Generating);
    }

    #[tokio::test]
    async fn counters_accumulate_across_ticks() {
        let mut scheduler = scheduler(Recorder::default(), 3.0);
        for _ in 0..4 {
            scheduler.tick().await.unwrap();
        }
        let batches = scheduler.delivery().batches.lock();
        assert_eq!(batches.len(), 4);
        assert_eq!(
            batches[3].series().value("requests_total", &[]),
            Some(&SeriesValue::Counter(12.0))
        );
        assert_eq!(batches[3].grouping(), &GroupingKey::new("demo", "i1"));
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_delivery_keeps_state_and_loop_going() {
        let mut scheduler = scheduler(Recorder::failing(1), 2.0);
        scheduler.step().await.unwrap();
        scheduler.step().await.unwrap();
        let before = scheduler.registry().snapshot();

        let report = scheduler.step().await.unwrap().unwrap();
        assert!(matches!(report.outcome, DeliveryOutcome::Failed { ref cause } if cause.contains("503")));
        assert_eq!(scheduler.state(), SchedulerState::Sleeping);
        assert_eq!(scheduler.registry().snapshot(), before);
        assert_eq!(scheduler.failures(), 1);
        assert!(logs_contain("unable to push metrics"));

        // the next tick carries the accumulated counter forward
        let report = scheduler.tick().await.unwrap();
        assert!(report.outcome.is_delivered());
        assert_eq!(scheduler.ticks(), 2);
        let batches = scheduler.delivery().batches.lock();
        assert_eq!(
            batches[0].series().value("requests_total", &[]),
            Some(&SeriesValue::Counter(4.0))
        );
    }

    #[tokio::test]
    async fn generator_errors_abort() {
        let mut other = Registry::new();
        let stray = other
            .define(MetricDefinition::gauge("stray", "registered elsewhere"))
            .unwrap();
        let mut generator = Generator::new(StdRng::seed_from_u64(1));
        generator
            .add_plan(SamplePlan::new(stray, Distribution::Constant { value: 1.0 }))
            .unwrap();
        let mut scheduler = Scheduler::new(
            Registry::new(),
            generator,
            Recorder::default(),
            GroupingKey::new("demo", "i1"),
            PushMode::Add,
            Duration::from_secs(10),
        );
        assert!(matches!(
            scheduler.tick().await,
            Err(EmitError::UnknownMetric(name)) if name == "stray"
        ));
        assert!(scheduler.delivery().batches.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_ticks_on_interval_until_cancelled() {
        let mut scheduler = scheduler(Recorder::failing(2), 1.0);
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(45)).await;
            stopper.cancel();
        });

        scheduler.run(cancel).await.unwrap();
        // ticks at t = 0, 10, 20, 30, 40
        assert_eq!(scheduler.ticks(), 5);
        assert_eq!(scheduler.failures(), 2);
        assert_eq!(scheduler.delivery().batches.lock().len(), 3);
    }

    #[tokio::test]
    async fn run_returns_immediately_when_already_cancelled() {
        let mut scheduler = scheduler(Recorder::default(), 1.0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        scheduler.run(cancel).await.unwrap();
        assert_eq!(scheduler.ticks(), 0);
    }
}
