// Copyright (c), Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;

use crate::delivery::TEXT_FORMAT;
use crate::error::Result;
use crate::registry::Registry;
use crate::sampler::Generator;

pub const METRICS_ROUTE: &str = "/metrics";

struct Emitter {
    registry: Registry,
    generator: Generator,
}

/// Registry and generator shared by every scrape.
///
/// The lock is only held while generating and encoding, never across an await.
#[derive(Clone)]
pub struct ScrapeState {
    emitter: Arc<Mutex<Emitter>>,
}

impl ScrapeState {
    pub fn new(registry: Registry, generator: Generator) -> Self {
        Self {
            emitter: Arc::new(Mutex::new(Emitter {
                registry,
                generator,
            })),
        }
    }

    /// Run one generator tick, then render the registry.
    pub fn scrape(&self) -> Result<String> {
        let mut emitter = self.emitter.lock();
        let Emitter {
            registry,
            generator,
        } = &mut *emitter;
        generator.tick(registry)?;
        Ok(registry.encode_text()?)
    }
}

pub async fn metrics(Extension(state): Extension<ScrapeState>) -> Response {
    match state.scrape() {
        Ok(metrics) => ([(header::CONTENT_TYPE, TEXT_FORMAT)], metrics).into_response(),
        Err(error) => {
            tracing::error!(?error, "unable to generate metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("unable to generate metrics: {error}"),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MetricDefinition;
    use crate::sampler::{Distribution, SamplePlan};

    #[test]
    fn each_scrape_regenerates() {
        let mut registry = Registry::new();
        let handle = registry
            .define(MetricDefinition::counter("scrapes_total", "scrapes"))
            .unwrap();
        let mut generator = Generator::seeded(1);
        generator
            .add_plan(SamplePlan::new(handle, Distribution::Constant { value: 1.0 }))
            .unwrap();
        let state = ScrapeState::new(registry, generator);

        assert!(state.scrape().unwrap().contains("scrapes_total 1"));
        assert!(state.clone().scrape().unwrap().contains("scrapes_total 2"));
    }
}
