// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The emission contract: `PeriodicData`/`AggregatedData`, and the `Sink` trait downstream
//! collaborators implement.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::record::Key;
use crate::unit::Quantity;

/// One `(metricName, statistic, quantity, supportingData?)` entry within a [`PeriodicData`]
/// emission.
#[derive(Clone)]
pub struct AggregatedData {
    pub metric_name: String,
    pub statistic: String,
    pub quantity: Quantity,
    pub supporting_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for AggregatedData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatedData")
            .field("metric_name", &self.metric_name)
            .field("statistic", &self.statistic)
            .field("quantity", &self.quantity)
            .field("has_supporting_data", &self.supporting_data.is_some())
            .finish()
    }
}

/// The result of closing one [`crate::bucket::Bucket`]: everything a sink needs to emit a
/// periodic summary for one `(key, periodStart)`.
#[derive(Debug, Clone)]
pub struct PeriodicData {
    pub period: Duration,
    pub period_start: SystemTime,
    pub key: Key,
    pub data: Vec<AggregatedData>,
}

/// Downstream collaborator that consumes finalized periods.
///
/// Must be safe for concurrent invocation — multiple `PeriodWorker`s across multiple keys and
/// periods all call `record` on the same shared sink. Failures are the sink's own problem to
/// buffer or retry; a `record` call that returns is treated as delivered (at-most-once, per
/// §7's "sink failures are logged, not retried" contract).
pub trait Sink: Send + Sync {
    fn record(&self, data: PeriodicData);
}

/// In-memory sink for tests: collects every `PeriodicData` it receives.
#[derive(Default)]
pub struct VecSink {
    data: std::sync::Mutex<Vec<PeriodicData>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<PeriodicData> {
        std::mem::take(&mut self.data.lock().expect("VecSink poisoned"))
    }

    pub fn len(&self) -> usize {
        self.data.lock().expect("VecSink poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Sink for VecSink {
    fn record(&self, data: PeriodicData) {
        self.data.lock().expect("VecSink poisoned").push(data);
    }
}
