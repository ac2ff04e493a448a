// Copyright (c), Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Synthetic metrics emitter.
//!
//! A [`registry::Registry`] owns a set of metric definitions and their series.
//! A [`sampler::Generator`] fills those series with bounded random values once
//! per tick, and a [`delivery::Deliver`] implementation pushes a snapshot of the
//! registry to a collector. The [`scheduler::Scheduler`] ties the three together
//! as an explicit state machine so the loop can be single-stepped in tests.
//!
//! Two side channels reuse the same pieces: [`runtime`] serves the registry for
//! scraping, regenerating values on every request, and [`cloud`] sends a single
//! batch of data points to a cloud monitoring API.

pub mod cloud;
pub mod config;
pub mod delivery;
pub mod error;
pub mod registry;
pub mod runtime;
pub mod sampler;
pub mod scheduler;
pub mod server;
pub mod summary;

pub use delivery::{Deliver, DeliveryBatch, DeliveryFailure, GroupingKey, PushMode};
pub use error::{EmitError, Result};
pub use registry::{MetricDefinition, MetricHandle, MetricKind, Registry};
pub use sampler::{Distribution, Generator, SamplePlan};
pub use scheduler::{Scheduler, SchedulerState, TickReport};

/// Read an environment variable, falling back to `$default` when it is unset
/// or does not parse as the default's type.
#[macro_export]
macro_rules! var {
    ($key:expr) => {
        match std::env::var($key) {
            Ok(val) => Some(val),
            Err(_) => None,
        }
    };
    ($key:expr, $default:expr) => {
        match std::env::var($key) {
            Ok(val) => val.parse::<_>().unwrap_or($default),
            Err(_) => $default,
        }
    };
}

/// Defines `GIT_REVISION` and `VERSION` consts in the calling binary.
#[macro_export]
macro_rules! bin_version {
    () => {
        const GIT_REVISION: &str = {
            if let Some(revision) = option_env!("GIT_REVISION") {
                revision
            } else {
                $crate::_hidden::git_version::git_version!(
                    args = ["--always", "--abbrev=12", "--dirty", "--exclude", "*"],
                    fallback = ""
                )
            }
        };
        const VERSION: &str = {
            if GIT_REVISION.is_empty() {
                env!("CARGO_PKG_VERSION")
            } else {
                $crate::_hidden::const_str::concat!(env!("CARGO_PKG_VERSION"), "-", GIT_REVISION)
            }
        };
    };
}

#[doc(hidden)]
pub mod _hidden {
    pub use const_str;
    pub use git_version;
}
