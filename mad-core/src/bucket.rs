// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! One (key, period-start) aggregation window.

use std::time::{Duration, SystemTime};

use hashbrown::HashMap;
use tracing::warn;

use crate::error::{AccumulateError, DropReason};
use crate::rate_limit::rate_limited;
use crate::record::{Key, MetricType};
use crate::sink::{AggregatedData, PeriodicData};
use crate::statistic::{Accumulator, DepMap, StatisticRef};
use crate::unit::Quantity;

/// Per-metric aggregation state: the accumulators a bucket has instantiated for one metric name.
///
/// `specified` holds accumulators whose value is emitted at close; `dependent` holds accumulators
/// instantiated only because a specified statistic depends on them — per the bucket invariant,
/// every dependency of a specified statistic has an accumulator in one map or the other.
struct MetricAggregationState {
    r#type: MetricType,
    specified: HashMap<String, Box<dyn Accumulator>>,
    dependent: HashMap<String, Box<dyn Accumulator>>,
}

impl MetricAggregationState {
    fn new(r#type: MetricType, specified: &[StatisticRef], dependent: &[StatisticRef]) -> Self {
        let specified_map = specified
            .iter()
            .map(|s| (s.name().to_string(), s.create_calculator()))
            .collect();
        let specified_names: hashbrown::HashSet<&str> =
            specified.iter().map(|s| s.name()).collect();
        let dependent_map = dependent
            .iter()
            .filter(|s| !specified_names.contains(s.name()))
            .map(|s| (s.name().to_string(), s.create_calculator()))
            .collect();
        Self { r#type, specified: specified_map, dependent: dependent_map }
    }

    #[allow(dead_code)]
    fn metric_type(&self) -> MetricType {
        self.r#type
    }

    /// Feeds `value` to every accumulator for this metric, returning how many of them dropped it
    /// for an inconsistent unit — the caller rolls this into its own drop counter.
    fn accumulate(&mut self, metric_name: &str, value: &Quantity) -> usize {
        let mut dropped = 0;
        for (stat_name, accum) in self.specified.iter_mut().chain(self.dependent.iter_mut()) {
            if let Err(AccumulateError::InconsistentUnit { expected, found }) =
                accum.accumulate(value)
            {
                dropped += 1;
                rate_limited!(
                    Duration::from_secs(1),
                    warn!(
                        metric = metric_name,
                        statistic = stat_name.as_str(),
                        ?expected,
                        ?found,
                        reason = %DropReason::InconsistentUnit,
                        "dropping sample: inconsistent unit"
                    )
                );
            }
        }
        dropped
    }

    fn calculate_all(&self, metric_name: &str) -> Vec<AggregatedData> {
        let mut deps: DepMap<'_> = DepMap::new();
        for (name, accum) in self.specified.iter() {
            deps.insert(name.as_str(), accum.as_ref() as &dyn crate::statistic::Calculator);
        }
        for (name, accum) in self.dependent.iter() {
            deps.insert(name.as_str(), accum.as_ref() as &dyn crate::statistic::Calculator);
        }
        self.specified
            .iter()
            .map(|(stat_name, accum)| {
                let calculated = accum.calculate(&deps);
                AggregatedData {
                    metric_name: metric_name.to_string(),
                    statistic: stat_name.clone(),
                    quantity: calculated.value,
                    supporting_data: calculated.data,
                }
            })
            .collect()
    }
}

/// Resolves which statistics apply to a metric, given its name and type — the callback a
/// [`crate::period_worker::PeriodWorker`] threads through from the
/// [`crate::aggregator::Aggregator`]'s pattern/type-default resolution.
pub trait StatisticResolver: Send + Sync {
    fn specified_for(&self, metric_name: &str, metric_type: MetricType) -> Vec<StatisticRef>;
    fn dependent_for(&self, metric_name: &str, metric_type: MetricType) -> Vec<StatisticRef>;
}

/// One period's worth of aggregation state for one dimension-key.
///
/// Mutated only on its owning [`crate::period_worker::PeriodWorker`] thread; `close` consumes
/// `self` by value, which is what makes "a bucket's close is called exactly once" a property the
/// type system enforces rather than a runtime check.
pub struct Bucket {
    key: Key,
    period_start: SystemTime,
    period: Duration,
    metric_states: HashMap<String, MetricAggregationState>,
}

impl Bucket {
    pub fn new(key: Key, period_start: SystemTime, period: Duration) -> Self {
        Self { key, period_start, period, metric_states: HashMap::new() }
    }

    pub fn period_start(&self) -> SystemTime {
        self.period_start
    }

    /// Idempotent per-quantity ingestion for one metric's samples.
    ///
    /// Resolves and lazily creates the metric's accumulators on first touch, then feeds every
    /// quantity to every accumulator (specified and dependent alike). Returns how many
    /// (accumulator, quantity) pairs were dropped for an inconsistent unit, so the caller can
    /// fold it into a drop counter.
    pub fn record(
        &mut self,
        metric_name: &str,
        metric_type: MetricType,
        quantities: &[Quantity],
        resolver: &dyn StatisticResolver,
    ) -> usize {
        let state = self.metric_states.entry_ref(metric_name).or_insert_with(|| {
            let specified = resolver.specified_for(metric_name, metric_type);
            let dependent = resolver.dependent_for(metric_name, metric_type);
            MetricAggregationState::new(metric_type, &specified, &dependent)
        });
        let mut dropped = 0;
        for quantity in quantities {
            dropped += state.accumulate(metric_name, quantity);
        }
        dropped
    }

    /// Finalize this bucket: calculate every specified statistic for every metric, in whatever
    /// order — each `calculate` call recomputes its dependencies' values directly, so no
    /// separate scheduling pass is needed to satisfy the "dependencies calculated first"
    /// invariant.
    pub fn close(self) -> PeriodicData {
        let mut data = Vec::new();
        for (metric_name, state) in &self.metric_states {
            data.extend(state.calculate_all(metric_name));
        }
        PeriodicData { period: self.period, period_start: self.period_start, key: self.key, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statistic::Registry;
    use assert2::check;

    struct FixedResolver {
        registry: Registry,
        specified: Vec<&'static str>,
    }

    impl StatisticResolver for FixedResolver {
        fn specified_for(&self, _metric_name: &str, _metric_type: MetricType) -> Vec<StatisticRef> {
            self.specified.iter().map(|n| self.registry.resolve(n).unwrap()).collect()
        }
        fn dependent_for(&self, _metric_name: &str, _metric_type: MetricType) -> Vec<StatisticRef> {
            let mut seen = hashbrown::HashSet::new();
            let mut out = Vec::new();
            for s in self.specified_for(_metric_name, _metric_type) {
                for dep in s.dependencies() {
                    if seen.insert(dep.name().to_string()) {
                        out.push(dep.clone());
                    }
                }
            }
            out.into_iter().filter(|d| !self.specified.contains(&d.name())).collect()
        }
    }

    #[test]
    fn max_accumulator_scenario() {
        let resolver = FixedResolver { registry: Registry::new(), specified: vec!["max"] };
        let mut bucket = Bucket::new(
            Key::from_dimensions(&Default::default()),
            SystemTime::UNIX_EPOCH,
            Duration::from_secs(60),
        );
        bucket.record(
            "latency",
            MetricType::Timer,
            &[Quantity::scalar(12.0), Quantity::scalar(18.0), Quantity::scalar(5.0)],
            &resolver,
        );
        let periodic = bucket.close();
        check!(periodic.data.len() == 1);
        check!(periodic.data[0].statistic == "max");
        check!(periodic.data[0].quantity.value == 18.0);
    }

    #[test]
    fn dependency_resolution_emits_tp99_not_histogram() {
        let resolver = FixedResolver { registry: Registry::new(), specified: vec!["tp99"] };
        let mut bucket = Bucket::new(
            Key::from_dimensions(&Default::default()),
            SystemTime::UNIX_EPOCH,
            Duration::from_secs(60),
        );
        let quantities: Vec<Quantity> = (1..=100).map(|v| Quantity::scalar(v as f64)).collect();
        bucket.record("latency", MetricType::Timer, &quantities, &resolver);
        let periodic = bucket.close();
        check!(periodic.data.len() == 1);
        check!(periodic.data[0].statistic == "tp99");
    }
}
