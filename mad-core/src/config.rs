// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration: periods, per-type default statistic sets, per-metric pattern overrides,
//! and the tunables governing lateness and bucket lifetime.
//!
//! This is the in-process configuration surface only — reading it from a file or environment is
//! an external collaborator's job.

use std::collections::HashMap as StdHashMap;
use std::time::Duration;

use regex_lite::Regex;

use crate::record::MetricType;
use crate::statistic::StatisticRef;

/// A compiled `(pattern, statistics)` override: the first pattern whose full match accepts a
/// metric name wins, in configured order.
pub struct PatternOverride {
    pattern: Regex,
    statistics: Vec<StatisticRef>,
}

impl PatternOverride {
    fn matches(&self, metric_name: &str) -> bool {
        self.pattern.is_match(metric_name)
    }
}

/// Engine-wide configuration. Build with [`Config::builder`].
pub struct Config {
    pub periods: Vec<Duration>,
    pub counter_statistics: Vec<StatisticRef>,
    pub gauge_statistics: Vec<StatisticRef>,
    pub timer_statistics: Vec<StatisticRef>,
    pub pattern_statistics: Vec<PatternOverride>,
    pub lateness_horizon: Duration,
    pub close_delay: StdHashMap<Duration, Duration>,
    pub worker_mailbox_capacity: usize,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Metric-type default statistic set, before any pattern override is considered.
    pub fn default_statistics_for(&self, metric_type: MetricType) -> &[StatisticRef] {
        match metric_type {
            MetricType::Counter => &self.counter_statistics,
            MetricType::Gauge => &self.gauge_statistics,
            MetricType::Timer => &self.timer_statistics,
        }
    }

    /// First pattern (in insertion order) whose full match accepts `metric_name`.
    pub fn pattern_override_for(&self, metric_name: &str) -> Option<&[StatisticRef]> {
        self.pattern_statistics
            .iter()
            .find(|p| p.matches(metric_name))
            .map(|p| p.statistics.as_slice())
    }

    /// Grace period a bucket for `period` stays open past its nominal end before closing.
    pub fn close_delay_for(&self, period: Duration) -> Duration {
        self.close_delay.get(&period).copied().unwrap_or(period)
    }
}

#[derive(Default)]
pub struct ConfigBuilder {
    periods: Vec<Duration>,
    counter_statistics: Vec<StatisticRef>,
    gauge_statistics: Vec<StatisticRef>,
    timer_statistics: Vec<StatisticRef>,
    pattern_statistics: Vec<(String, Vec<StatisticRef>)>,
    lateness_horizon: Option<Duration>,
    close_delay: StdHashMap<Duration, Duration>,
    worker_mailbox_capacity: Option<usize>,
}

impl ConfigBuilder {
    pub fn period(mut self, period: Duration) -> Self {
        self.periods.push(period);
        self
    }

    pub fn counter_statistics(mut self, statistics: Vec<StatisticRef>) -> Self {
        self.counter_statistics = statistics;
        self
    }

    pub fn gauge_statistics(mut self, statistics: Vec<StatisticRef>) -> Self {
        self.gauge_statistics = statistics;
        self
    }

    pub fn timer_statistics(mut self, statistics: Vec<StatisticRef>) -> Self {
        self.timer_statistics = statistics;
        self
    }

    /// Append a pattern override. Patterns are tried in the order they're added; the first
    /// full-match wins.
    pub fn pattern_statistics(mut self, pattern: impl Into<String>, statistics: Vec<StatisticRef>) -> Self {
        self.pattern_statistics.push((pattern.into(), statistics));
        self
    }

    pub fn lateness_horizon(mut self, horizon: Duration) -> Self {
        self.lateness_horizon = Some(horizon);
        self
    }

    pub fn close_delay(mut self, period: Duration, delay: Duration) -> Self {
        self.close_delay.insert(period, delay);
        self
    }

    pub fn worker_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.worker_mailbox_capacity = Some(capacity);
        self
    }

    /// Compile pattern strings and apply defaults: `lateness_horizon = 2 * max(periods)`,
    /// `worker_mailbox_capacity = 1024`. Panics if a pattern fails to compile or no periods were
    /// configured — both are programmer errors in the caller's static configuration, not runtime
    /// conditions.
    pub fn build(self) -> Config {
        assert!(!self.periods.is_empty(), "at least one period must be configured");
        let max_period = self.periods.iter().copied().max().unwrap();
        let pattern_statistics = self
            .pattern_statistics
            .into_iter()
            .map(|(pattern, statistics)| PatternOverride {
                pattern: Regex::new(&format!("^{pattern}$")).expect("invalid metric-name pattern"),
                statistics,
            })
            .collect();
        Config {
            periods: self.periods,
            counter_statistics: self.counter_statistics,
            gauge_statistics: self.gauge_statistics,
            timer_statistics: self.timer_statistics,
            pattern_statistics,
            lateness_horizon: self.lateness_horizon.unwrap_or(max_period * 2),
            close_delay: self.close_delay,
            worker_mailbox_capacity: self.worker_mailbox_capacity.unwrap_or(1024),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statistic::Registry;
    use assert2::check;

    #[test]
    fn lateness_horizon_defaults_to_twice_max_period() {
        let config = Config::builder()
            .period(Duration::from_secs(60))
            .period(Duration::from_secs(300))
            .build();
        check!(config.lateness_horizon == Duration::from_secs(600));
    }

    #[test]
    fn close_delay_defaults_to_period() {
        let config = Config::builder().period(Duration::from_secs(60)).build();
        check!(config.close_delay_for(Duration::from_secs(60)) == Duration::from_secs(60));
    }

    #[test]
    fn first_matching_pattern_wins() {
        let registry = Registry::new();
        let max = registry.resolve("max").unwrap();
        let min = registry.resolve("min").unwrap();
        let config = Config::builder()
            .period(Duration::from_secs(60))
            .pattern_statistics("latency_.*", vec![max.clone()])
            .pattern_statistics("latency_p50", vec![min.clone()])
            .build();
        let resolved = config.pattern_override_for("latency_p50").unwrap();
        check!(resolved[0].name() == "max");
    }
}
