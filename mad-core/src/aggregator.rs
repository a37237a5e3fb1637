// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Front-end routing: maps incoming records to per-key `PeriodWorker`s and resolves which
//! statistics apply to which metric.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hashbrown::HashMap;
use mad_timesource::TimeSource;
use tracing::{info, warn};

use crate::bucket::StatisticResolver;
use crate::config::Config;
use crate::period_worker::{self, PeriodWorkerHandle};
use crate::record::{Key, MetricType, Record};
use crate::sink::Sink;
use crate::statistic::StatisticRef;

/// Default bound on how long `shutdown` waits for in-flight workers to drain before abandoning
/// stragglers, per §5's "Shutdown awaits at most 10s then proceeds."
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves the effective statistic set for a metric, with insertion-ordered pattern overrides
/// taking priority over type defaults, and memoizes both the specified and the derived dependent
/// set per metric name.
struct Resolver {
    config: Arc<Config>,
    specified_cache: Mutex<HashMap<String, Vec<StatisticRef>>>,
    dependent_cache: Mutex<HashMap<String, Vec<StatisticRef>>>,
}

impl Resolver {
    fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            specified_cache: Mutex::new(HashMap::new()),
            dependent_cache: Mutex::new(HashMap::new()),
        }
    }
}

impl StatisticResolver for Resolver {
    fn specified_for(&self, metric_name: &str, metric_type: MetricType) -> Vec<StatisticRef> {
        let mut cache = self.specified_cache.lock().expect("specified cache poisoned");
        if let Some(hit) = cache.get(metric_name) {
            return hit.clone();
        }
        let resolved = self
            .config
            .pattern_override_for(metric_name)
            .map(|s| s.to_vec())
            .unwrap_or_else(|| self.config.default_statistics_for(metric_type).to_vec());
        cache.insert(metric_name.to_string(), resolved.clone());
        resolved
    }

    fn dependent_for(&self, metric_name: &str, metric_type: MetricType) -> Vec<StatisticRef> {
        let mut cache = self.dependent_cache.lock().expect("dependent cache poisoned");
        if let Some(hit) = cache.get(metric_name) {
            return hit.clone();
        }
        let specified = self.specified_for(metric_name, metric_type);
        let specified_names: hashbrown::HashSet<&str> =
            specified.iter().map(|s| s.name()).collect();
        let mut seen = hashbrown::HashSet::new();
        let mut dependents = Vec::new();
        for stat in &specified {
            for dep in stat.dependencies() {
                if !specified_names.contains(dep.name()) && seen.insert(dep.name().to_string()) {
                    dependents.push(dep.clone());
                }
            }
        }
        cache.insert(metric_name.to_string(), dependents.clone());
        dependents
    }
}

/// Routes incoming records to per-key period workers and owns their lifecycle.
pub struct Aggregator {
    config: Arc<Config>,
    resolver: Arc<Resolver>,
    sink: Arc<dyn Sink>,
    time_source: TimeSource,
    keyed_workers: Mutex<HashMap<Key, Vec<PeriodWorkerHandle>>>,
}

impl Aggregator {
    pub fn new(config: Config, sink: Arc<dyn Sink>, time_source: TimeSource) -> Self {
        let config = Arc::new(config);
        Self {
            resolver: Arc::new(Resolver::new(config.clone())),
            config,
            sink,
            time_source,
            keyed_workers: Mutex::new(HashMap::new()),
        }
    }

    /// Prepares the engine to accept records. No worker threads are started here — the pool is
    /// elastic and lazy, one `PeriodWorker` set spawned per key on that key's first record.
    pub fn launch(&self) {
        info!(periods = self.config.periods.len(), "aggregator launched");
    }

    /// Route `record` to every `PeriodWorker` for its dimension key, spawning the worker set
    /// (one worker per configured period) on first observation of that key.
    pub fn observe(&self, record: Record) {
        let key = record.key();
        let mut workers = self.keyed_workers.lock().expect("keyed workers lock poisoned");
        let handles = workers.entry(key.clone()).or_insert_with(|| {
            info!(?key, "spawning period workers for new key");
            self.config
                .periods
                .iter()
                .map(|&period| {
                    period_worker::spawn(
                        key.clone(),
                        period,
                        self.config.lateness_horizon,
                        self.config.close_delay_for(period),
                        self.config.worker_mailbox_capacity,
                        self.resolver.clone() as Arc<dyn StatisticResolver>,
                        self.sink.clone(),
                        self.time_source.clone(),
                    )
                })
                .collect()
        });
        for (metric_name, metric) in &record.metrics {
            for handle in handles.iter() {
                handle.send_record(
                    metric_name.clone(),
                    metric.r#type,
                    metric.values.clone(),
                    record.timestamp,
                );
            }
        }
    }

    /// Signal every worker to close its remaining buckets and exit; wait up to
    /// [`SHUTDOWN_TIMEOUT`] total across all of them, abandoning any stragglers still running
    /// after the deadline.
    pub fn shutdown(&self) {
        let mut handles: Vec<PeriodWorkerHandle> = {
            let mut workers = self.keyed_workers.lock().expect("keyed workers lock poisoned");
            workers.drain().flat_map(|(_, handles)| handles).collect()
        };
        for handle in &handles {
            handle.shutdown();
        }
        let deadline = std::time::Instant::now() + SHUTDOWN_TIMEOUT;
        let mut abandoned = 0;
        for handle in handles.iter_mut() {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if let Some(join) = handle.take_join_handle() {
                if !join_with_timeout(join, remaining) {
                    abandoned += 1;
                }
            }
        }
        if abandoned > 0 {
            warn!(abandoned, "shutdown grace period elapsed; abandoning stragglers");
        }
        info!("aggregator shutdown complete");
    }
}

/// Join `handle` with a bound on how long to wait, leaving it to finish in the background (and
/// leaking a watcher thread) if it doesn't make the deadline.
fn join_with_timeout(handle: std::thread::JoinHandle<()>, timeout: Duration) -> bool {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = handle.join();
        let _ = tx.send(());
    });
    rx.recv_timeout(timeout).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Metric, MetricType};
    use crate::statistic::Registry;
    use crate::sink::VecSink;
    use crate::unit::Quantity;
    use mad_timesource::fakes::ManuallyAdvancedTimeSource;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn registry_statistics(names: &[&str]) -> Vec<StatisticRef> {
        let registry = Registry::new();
        names.iter().map(|n| registry.resolve(n).unwrap()).collect()
    }

    fn dims(pairs: &[(&str, &str)]) -> hashbrown::HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn per_key_isolation() {
        let config = Config::builder()
            .period(Duration::from_secs(60))
            .timer_statistics(registry_statistics(&["max"]))
            .build();
        let sink = Arc::new(VecSink::new());
        let fake = ManuallyAdvancedTimeSource::at_time(UNIX_EPOCH);
        let aggregator = Aggregator::new(config, sink.clone(), TimeSource::custom(fake.clone()));
        aggregator.launch();

        for (host, value) in [("a", 10.0), ("b", 20.0), ("a", 30.0)] {
            let mut metrics = HashMap::new();
            metrics.insert(
                "latency".to_string(),
                Metric::new(MetricType::Timer, vec![Quantity::scalar(value)]),
            );
            let record = Record::new(
                "id",
                UNIX_EPOCH,
                dims(&[("host", host)]),
                metrics,
                UNIX_EPOCH,
            )
            .unwrap();
            aggregator.observe(record);
        }

        {
            let workers = aggregator.keyed_workers.lock().unwrap();
            assert_eq!(workers.len(), 2);
            for handles in workers.values() {
                handles[0].sync();
            }
        }

        fake.update_time(UNIX_EPOCH + Duration::from_secs(180));
        {
            let workers = aggregator.keyed_workers.lock().unwrap();
            for handles in workers.values() {
                for handle in handles {
                    handle.tick();
                    handle.sync();
                }
            }
        }

        aggregator.shutdown();

        let emitted = sink.drain();
        assert_eq!(emitted.len(), 2);
        for periodic in &emitted {
            let max = periodic.data.iter().find(|d| d.statistic == "max").unwrap();
            let expected = if periodic.key.as_map().get("host").map(String::as_str) == Some("a") {
                30.0
            } else {
                20.0
            };
            assert_eq!(max.quantity.value, expected);
        }
    }
}
