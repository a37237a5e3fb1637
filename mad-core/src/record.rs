// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Inbound samples: `Record`, `Metric`, and the dimension `Key` they route by.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use hashbrown::HashMap;
use tracing::warn;

use crate::error::{DropReason, RecordError};
use crate::rate_limit::rate_limited;
use crate::unit::Quantity;

/// Process-wide count of records rejected by [`Record::new`] for carrying a non-finite metric
/// value.
///
/// Rejection happens at the ingestion boundary, before a record is routed to any per-key
/// worker, so there's no `WorkerStats` to carry this one — it lives here instead.
static REJECTED_NON_FINITE: AtomicU64 = AtomicU64::new(0);

/// Number of records rejected so far for carrying a non-finite metric value.
pub fn rejected_non_finite_count() -> u64 {
    REJECTED_NON_FINITE.load(Ordering::Relaxed)
}

/// Selects which statistic set a metric's samples are aggregated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    Counter,
    Gauge,
    Timer,
}

/// One named measurement within a [`Record`]: a type tag plus an ordered sequence of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub r#type: MetricType,
    pub values: Vec<Quantity>,
}

impl Metric {
    pub fn new(r#type: MetricType, values: Vec<Quantity>) -> Self {
        Self { r#type, values }
    }
}

/// The routing identity of a [`Record`]: the content of its dimension map.
///
/// Two records with equal dimension maps route to the same [`crate::period_worker::PeriodWorker`]
/// set. `Key` stores dimensions in a `BTreeMap` so that equality and hashing are order-independent
/// and don't depend on the caller's insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key(BTreeMap<String, String>);

impl Key {
    pub fn from_dimensions(dimensions: &HashMap<String, String>) -> Self {
        Key(dimensions.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

/// A single ingested sample: identity, timestamps, dimensions, and the metrics it carries.
///
/// Immutable after construction; [`Record::new`] is the only way to build one, and it enforces
/// the ingestion-boundary precondition from the aggregator's `observe` contract (finite values,
/// non-empty dimension keys).
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub timestamp: SystemTime,
    pub dimensions: HashMap<String, String>,
    pub metrics: HashMap<String, Metric>,
    pub request_time: SystemTime,
}

impl Record {
    /// Validate and construct a `Record`.
    ///
    /// Rejects non-finite metric values and empty dimension keys; both are the caller's
    /// responsibility to fix, not the engine's to tolerate.
    pub fn new(
        id: impl Into<String>,
        timestamp: SystemTime,
        dimensions: HashMap<String, String>,
        metrics: HashMap<String, Metric>,
        request_time: SystemTime,
    ) -> Result<Self, RecordError> {
        if dimensions.keys().any(|k| k.is_empty()) {
            return Err(RecordError::EmptyKey);
        }
        for (name, metric) in &metrics {
            for q in &metric.values {
                if !q.value.is_finite() {
                    REJECTED_NON_FINITE.fetch_add(1, Ordering::Relaxed);
                    rate_limited!(
                        Duration::from_secs(1),
                        warn!(
                            metric = name.as_str(),
                            reason = %DropReason::NonFinite,
                            "rejecting record: non-finite metric value"
                        )
                    );
                    return Err(RecordError::NonFiniteValue { metric: name.clone() });
                }
            }
        }
        Ok(Self {
            id: id.into(),
            timestamp,
            dimensions,
            metrics,
            request_time,
        })
    }

    pub fn key(&self) -> Key {
        Key::from_dimensions(&self.dimensions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::check;

    fn dims(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn rejects_non_finite_value() {
        let mut metrics = HashMap::new();
        metrics.insert(
            "latency".to_string(),
            Metric::new(MetricType::Timer, vec![Quantity::scalar(f64::NAN)]),
        );
        let before = rejected_non_finite_count();
        let err = Record::new(
            "r1",
            SystemTime::UNIX_EPOCH,
            dims(&[("host", "a")]),
            metrics,
            SystemTime::UNIX_EPOCH,
        )
        .unwrap_err();
        check!(err == RecordError::NonFiniteValue { metric: "latency".to_string() });
        check!(rejected_non_finite_count() == before + 1);
    }

    #[test]
    fn rejects_empty_dimension_key() {
        let err = Record::new(
            "r1",
            SystemTime::UNIX_EPOCH,
            dims(&[("", "a")]),
            HashMap::new(),
            SystemTime::UNIX_EPOCH,
        )
        .unwrap_err();
        check!(err == RecordError::EmptyKey);
    }

    #[test]
    fn key_is_order_independent() {
        let a = Key::from_dimensions(&dims(&[("host", "a"), ("region", "us")]));
        let b = Key::from_dimensions(&dims(&[("region", "us"), ("host", "a")]));
        check!(a == b);
    }
}
