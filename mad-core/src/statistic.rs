// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The statistic algebra: identity, dependency declarations, and the calculator/accumulator
//! protocol that ties a `Statistic` to the state it needs to compute itself.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use hashbrown::HashMap;

use crate::error::AccumulateError;
use crate::unit::Quantity;

/// A statistic's identity, dependency declarations, and the factory that creates a fresh
/// accumulator instance for it.
///
/// Equality and hashing are by `name` alone, per §4.2 — two `Statistic`s with the same name are
/// the same statistic even if (hypothetically) constructed separately; in practice the
/// [`Registry`] guarantees a single shared instance per name.
pub struct Statistic {
    name: Box<str>,
    dependencies: Vec<StatisticRef>,
    factory: Box<dyn Fn() -> Box<dyn Accumulator> + Send + Sync>,
}

/// Shared handle to a [`Statistic`]; this is what flows through dependency lists, bucket
/// configuration, and the registry's memoization table.
pub type StatisticRef = Arc<Statistic>;

impl Statistic {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[StatisticRef] {
        &self.dependencies
    }

    pub fn create_calculator(&self) -> Box<dyn Accumulator> {
        (self.factory)()
    }
}

impl fmt::Debug for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statistic").field("name", &self.name).finish()
    }
}

impl PartialEq for Statistic {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}
impl Eq for Statistic {}

impl Hash for Statistic {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// The value a [`Calculator`] produces: a scalar plus an optional, statistic-specific payload.
///
/// `data` is type-erased (`Arc<dyn Any>`) because each statistic's supporting data differs —
/// only the histogram statistic's consumer (percentile statistics) knows to downcast it to
/// [`crate::histogram::HistogramSupportingData`].
#[derive(Clone)]
pub struct CalculatedValue {
    pub value: Quantity,
    pub data: Option<Arc<dyn Any + Send + Sync>>,
}

impl CalculatedValue {
    pub fn new(value: Quantity) -> Self {
        Self { value, data: None }
    }

    pub fn with_data(value: Quantity, data: Arc<dyn Any + Send + Sync>) -> Self {
        Self { value, data: Some(data) }
    }
}

impl fmt::Debug for CalculatedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalculatedValue")
            .field("value", &self.value)
            .field("has_data", &self.data.is_some())
            .finish()
    }
}

/// Map from a dependency's statistic name to its calculator instance, as required by a
/// dependent's `calculate`. Dependents receive calculators, not pre-extracted values, so a
/// percentile statistic can read the histogram's full distribution rather than a bare scalar.
pub type DepMap<'a> = HashMap<&'a str, &'a dyn Calculator>;

/// An operation that produces a [`CalculatedValue`] from whatever state it has accumulated,
/// given its declared dependencies' calculators.
pub trait Calculator: Send {
    fn calculate(&self, deps: &DepMap<'_>) -> CalculatedValue;
}

/// A [`Calculator`] that also ingests samples: raw quantities observed directly, or precomputed
/// values merged in from an upstream aggregation stage.
pub trait Accumulator: Calculator {
    fn accumulate(&mut self, value: &Quantity) -> Result<(), AccumulateError>;
    fn accumulate_calculated(&mut self, value: &CalculatedValue) -> Result<(), AccumulateError>;
}

/// Process-wide, read-mostly catalog resolving statistic names to [`StatisticRef`]s.
///
/// Built-in statistics are registered once at construction. Parametric percentile statistics
/// (`tp50`, `tp99.9`, …) are created on first lookup and memoized, so repeated lookups of the
/// same name return the identical `Arc`.
pub struct Registry {
    builtins: HashMap<String, StatisticRef>,
    percentiles: std::sync::Mutex<HashMap<String, StatisticRef>>,
    histogram: StatisticRef,
}

impl Registry {
    pub fn new() -> Self {
        let histogram = crate::builtin::histogram_statistic();
        let mut builtins = HashMap::new();
        for stat in [
            crate::builtin::min_statistic(),
            crate::builtin::max_statistic(),
            crate::builtin::sum_statistic(),
            crate::builtin::count_statistic(),
            crate::builtin::mean_statistic(),
            histogram.clone(),
        ] {
            builtins.insert(stat.name().to_string(), stat);
        }
        for n in [50.0, 75.0, 90.0, 95.0, 99.0, 99.9] {
            let stat = crate::builtin::percentile_statistic(n, histogram.clone());
            builtins.insert(stat.name().to_string(), stat);
        }
        Self {
            builtins,
            percentiles: std::sync::Mutex::new(HashMap::new()),
            histogram,
        }
    }

    /// Resolve a statistic by name, creating and memoizing a parametric percentile statistic
    /// (`tpN` for arbitrary `N`) on first lookup.
    pub fn resolve(&self, name: &str) -> Option<StatisticRef> {
        if let Some(stat) = self.builtins.get(name) {
            return Some(stat.clone());
        }
        if let Some(pct) = name.strip_prefix("tp").and_then(|rest| rest.parse::<f64>().ok()) {
            let mut cache = self.percentiles.lock().expect("percentile cache poisoned");
            if let Some(stat) = cache.get(name) {
                return Some(stat.clone());
            }
            let stat = crate::builtin::percentile_statistic(pct, self.histogram.clone());
            cache.insert(name.to_string(), stat.clone());
            return Some(stat);
        }
        None
    }

    pub fn histogram(&self) -> StatisticRef {
        self.histogram.clone()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn new_statistic(
    name: impl Into<Box<str>>,
    dependencies: Vec<StatisticRef>,
    factory: impl Fn() -> Box<dyn Accumulator> + Send + Sync + 'static,
) -> StatisticRef {
    Arc::new(Statistic {
        name: name.into(),
        dependencies,
        factory: Box::new(factory),
    })
}
