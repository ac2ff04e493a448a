// Copyright (c), Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::registry::MetricKind;

/// Errors raised while defining metrics or recording values into them.
///
/// All of these point at a misconfigured metric schema and abort the run.
/// Delivery problems are reported separately through
/// [`DeliveryFailure`](crate::delivery::DeliveryFailure).
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("metric `{0}` is already registered")]
    DuplicateName(String),

    #[error("metric `{name}` expects {expected} label values, got {got}")]
    LabelMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("counter `{name}` cannot be incremented by {delta}")]
    InvalidDelta { name: String, delta: f64 },

    #[error("metric `{name}` cannot record non-finite value {value}")]
    InvalidValue { name: String, value: f64 },

    #[error("metric `{name}` is a {kind}, it does not support `{op}`")]
    KindMismatch {
        name: String,
        kind: MetricKind,
        op: &'static str,
    },

    #[error("invalid definition for metric `{name}`: {reason}")]
    InvalidDefinition { name: String, reason: String },

    #[error("invalid sample plan for metric `{name}`: {reason}")]
    InvalidPlan { name: String, reason: String },

    #[error("metric `{0}` is not registered here")]
    UnknownMetric(String),

    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
}

pub type Result<T, E = EmitError> = std::result::Result<T, E>;
