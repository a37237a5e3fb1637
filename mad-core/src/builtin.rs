// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Built-in statistics: the leaf accumulators (`min`, `max`, `sum`, `count`, `histogram`) and the
//! pass-through dependents that derive their value from other accumulators (`mean`, `tpN`).

use std::sync::Arc;

use crate::error::AccumulateError;
use crate::histogram::{Histogram, HistogramSupportingData};
use crate::statistic::{new_statistic, Accumulator, CalculatedValue, Calculator, DepMap, StatisticRef};
use crate::unit::{Quantity, Unit};

/// Latches the first observed unit and converts (or rejects) every subsequent sample against it.
/// Shared by every leaf accumulator that compares or combines raw values.
#[derive(Debug, Default)]
struct UnitLatch(Option<Unit>);

impl UnitLatch {
    /// Returns the sample's value converted into the latched unit, latching on first use.
    fn reconcile(&mut self, value: &Quantity) -> Result<f64, AccumulateError> {
        let sample_unit = value.unit.unwrap_or(Unit::None);
        match self.0 {
            None => {
                self.0 = Some(sample_unit);
                Ok(value.value)
            }
            Some(latched) => sample_unit.convert(value.value, latched).map_err(|_| {
                AccumulateError::InconsistentUnit { expected: latched, found: sample_unit }
            }),
        }
    }
}

pub(crate) fn min_statistic() -> StatisticRef {
    new_statistic("min", vec![], || Box::new(MinAccumulator::default()))
}
pub(crate) fn max_statistic() -> StatisticRef {
    new_statistic("max", vec![], || Box::new(MaxAccumulator::default()))
}
pub(crate) fn sum_statistic() -> StatisticRef {
    new_statistic("sum", vec![], || Box::new(SumAccumulator::default()))
}
pub(crate) fn count_statistic() -> StatisticRef {
    new_statistic("count", vec![], || Box::new(CountAccumulator::default()))
}
pub(crate) fn histogram_statistic() -> StatisticRef {
    new_statistic("histogram", vec![], || Box::new(HistogramAccumulator::default()))
}
pub(crate) fn mean_statistic() -> StatisticRef {
    let deps = vec![sum_statistic(), count_statistic()];
    new_statistic("mean", deps, || Box::new(MeanAccumulator))
}

/// Build (or fetch from the registry's memoization table) the `tpN` statistic for percentile
/// `n` (e.g. `n = 99.9` for `tp99.9`).
pub(crate) fn percentile_statistic(n: f64, histogram: StatisticRef) -> StatisticRef {
    let name = format_percentile_name(n);
    new_statistic(name, vec![histogram], move || Box::new(PercentileAccumulator { percentile: n }))
}

fn format_percentile_name(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("tp{}", n as i64)
    } else {
        format!("tp{n}")
    }
}

#[derive(Debug, Default)]
struct MinAccumulator {
    unit: UnitLatch,
    value: Option<f64>,
}
impl Calculator for MinAccumulator {
    fn calculate(&self, _deps: &DepMap<'_>) -> CalculatedValue {
        CalculatedValue::new(Quantity::new(self.value.unwrap_or(0.0), self.unit.0))
    }
}
impl Accumulator for MinAccumulator {
    fn accumulate(&mut self, value: &Quantity) -> Result<(), AccumulateError> {
        let v = self.unit.reconcile(value)?;
        self.value = Some(self.value.map_or(v, |cur| cur.min(v)));
        Ok(())
    }
    fn accumulate_calculated(&mut self, value: &CalculatedValue) -> Result<(), AccumulateError> {
        self.accumulate(&value.value)
    }
}

#[derive(Debug, Default)]
struct MaxAccumulator {
    unit: UnitLatch,
    value: Option<f64>,
}
impl Calculator for MaxAccumulator {
    fn calculate(&self, _deps: &DepMap<'_>) -> CalculatedValue {
        CalculatedValue::new(Quantity::new(self.value.unwrap_or(0.0), self.unit.0))
    }
}
impl Accumulator for MaxAccumulator {
    fn accumulate(&mut self, value: &Quantity) -> Result<(), AccumulateError> {
        let v = self.unit.reconcile(value)?;
        self.value = Some(self.value.map_or(v, |cur| cur.max(v)));
        Ok(())
    }
    fn accumulate_calculated(&mut self, value: &CalculatedValue) -> Result<(), AccumulateError> {
        self.accumulate(&value.value)
    }
}

#[derive(Debug, Default)]
struct SumAccumulator {
    unit: UnitLatch,
    total: f64,
}
impl Calculator for SumAccumulator {
    fn calculate(&self, _deps: &DepMap<'_>) -> CalculatedValue {
        CalculatedValue::new(Quantity::new(self.total, self.unit.0))
    }
}
impl Accumulator for SumAccumulator {
    fn accumulate(&mut self, value: &Quantity) -> Result<(), AccumulateError> {
        let v = self.unit.reconcile(value)?;
        self.total += v;
        Ok(())
    }
    fn accumulate_calculated(&mut self, value: &CalculatedValue) -> Result<(), AccumulateError> {
        self.accumulate(&value.value)
    }
}

/// Counts samples observed, irrespective of unit — counting "how many" never requires the
/// samples to share a unit.
#[derive(Debug, Default)]
struct CountAccumulator {
    count: i64,
}
impl Calculator for CountAccumulator {
    fn calculate(&self, _deps: &DepMap<'_>) -> CalculatedValue {
        CalculatedValue::new(Quantity::new(self.count as f64, Some(Unit::Count)))
    }
}
impl Accumulator for CountAccumulator {
    fn accumulate(&mut self, _value: &Quantity) -> Result<(), AccumulateError> {
        self.count += 1;
        Ok(())
    }
    fn accumulate_calculated(&mut self, _value: &CalculatedValue) -> Result<(), AccumulateError> {
        self.count += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct HistogramAccumulator {
    unit: UnitLatch,
    histogram: Histogram,
}
impl Calculator for HistogramAccumulator {
    fn calculate(&self, _deps: &DepMap<'_>) -> CalculatedValue {
        let snapshot = self.histogram.snapshot();
        let value = Quantity::new(snapshot.entries_count() as f64, self.unit.0);
        CalculatedValue::with_data(
            value,
            Arc::new(HistogramSupportingData { snapshot, unit: self.unit.0 }),
        )
    }
}
impl Accumulator for HistogramAccumulator {
    fn accumulate(&mut self, value: &Quantity) -> Result<(), AccumulateError> {
        let v = self.unit.reconcile(value)?;
        self.histogram.record_value(v, 1);
        Ok(())
    }
    fn accumulate_calculated(&mut self, value: &CalculatedValue) -> Result<(), AccumulateError> {
        self.accumulate(&value.value)
    }
}

/// Thin pass-through: `mean` never accumulates directly, it derives `sum / count` from its
/// dependencies' calculators at `calculate` time.
#[derive(Debug)]
struct MeanAccumulator;
impl Calculator for MeanAccumulator {
    fn calculate(&self, deps: &DepMap<'_>) -> CalculatedValue {
        let empty = DepMap::new();
        let sum = deps.get("sum").expect("mean requires a sum dependency").calculate(&empty);
        let count = deps.get("count").expect("mean requires a count dependency").calculate(&empty);
        let mean = if count.value.value != 0.0 { sum.value.value / count.value.value } else { 0.0 };
        CalculatedValue::new(Quantity::new(mean, sum.value.unit))
    }
}
impl Accumulator for MeanAccumulator {
    fn accumulate(&mut self, _value: &Quantity) -> Result<(), AccumulateError> {
        Ok(())
    }
    fn accumulate_calculated(&mut self, _value: &CalculatedValue) -> Result<(), AccumulateError> {
        Ok(())
    }
}

/// Thin pass-through: reads the histogram dependency's snapshot and asks for the value at this
/// statistic's configured percentile.
#[derive(Debug)]
struct PercentileAccumulator {
    percentile: f64,
}
impl Calculator for PercentileAccumulator {
    fn calculate(&self, deps: &DepMap<'_>) -> CalculatedValue {
        let empty = DepMap::new();
        let histogram = deps
            .get("histogram")
            .expect("percentile statistic requires a histogram dependency")
            .calculate(&empty);
        let supporting = histogram
            .data
            .as_ref()
            .and_then(|d| d.downcast_ref::<HistogramSupportingData>().cloned());
        match supporting {
            Some(data) => {
                let value = data.snapshot.value_at_percentile(self.percentile);
                CalculatedValue::new(Quantity::new(value, data.unit))
            }
            None => CalculatedValue::new(Quantity::scalar(0.0)),
        }
    }
}
impl Accumulator for PercentileAccumulator {
    fn accumulate(&mut self, _value: &Quantity) -> Result<(), AccumulateError> {
        Ok(())
    }
    fn accumulate_calculated(&mut self, _value: &CalculatedValue) -> Result<(), AccumulateError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_tracks_running_maximum() {
        let mut acc = MaxAccumulator::default();
        for v in [12.0, 18.0, 5.0] {
            acc.accumulate(&Quantity::scalar(v)).unwrap();
        }
        let result = acc.calculate(&DepMap::new());
        assert_eq!(result.value.value, 18.0);
    }

    #[test]
    fn sum_rejects_inconsistent_unit() {
        let mut acc = SumAccumulator::default();
        acc.accumulate(&Quantity::new(1.0, Some(Unit::Second))).unwrap();
        let err = acc.accumulate(&Quantity::new(1.0, Some(Unit::Byte))).unwrap_err();
        assert_eq!(
            err,
            AccumulateError::InconsistentUnit { expected: Unit::Second, found: Unit::Byte }
        );
    }

    #[test]
    fn sum_accepts_convertible_unit() {
        let mut acc = SumAccumulator::default();
        acc.accumulate(&Quantity::new(1.0, Some(Unit::Second))).unwrap();
        acc.accumulate(&Quantity::new(500.0, Some(Unit::Millisecond))).unwrap();
        let result = acc.calculate(&DepMap::new());
        assert!((result.value.value - 1.5).abs() < 1e-9);
    }

    #[test]
    fn mean_derives_from_sum_and_count() {
        let mut sum = SumAccumulator::default();
        let mut count = CountAccumulator::default();
        for v in [10.0, 20.0, 30.0] {
            sum.accumulate(&Quantity::scalar(v)).unwrap();
            count.accumulate(&Quantity::scalar(v)).unwrap();
        }
        let mean = MeanAccumulator;
        let mut deps: DepMap<'_> = DepMap::new();
        deps.insert("sum", &sum);
        deps.insert("count", &count);
        let result = mean.calculate(&deps);
        assert_eq!(result.value.value, 20.0);
    }

    #[test]
    fn percentile_reads_histogram_snapshot() {
        let mut hist = HistogramAccumulator::default();
        for v in 1..=100 {
            hist.accumulate(&Quantity::scalar(v as f64)).unwrap();
        }
        let tp99 = PercentileAccumulator { percentile: 99.0 };
        let mut deps: DepMap<'_> = DepMap::new();
        deps.insert("histogram", &hist);
        let result = tp99.calculate(&deps);
        assert!(result.data.is_none());
        let expected = hist.calculate(&DepMap::new());
        let expected_supporting =
            expected.data.unwrap().downcast_ref::<HistogramSupportingData>().unwrap().snapshot.clone();
        assert_eq!(result.value.value, expected_supporting.value_at_percentile(99.0));
    }
}
