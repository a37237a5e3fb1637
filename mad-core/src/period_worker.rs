// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Owns the timeline for one `(key, period)`: rotates buckets on period boundaries and emits to
//! the sink.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mad_timesource::TimeSource;
use tracing::{debug, info, trace, warn};

use crate::bucket::{Bucket, StatisticResolver};
use crate::error::DropReason;
use crate::rate_limit::rate_limited;
use crate::record::{Key, MetricType};
use crate::sink::Sink;
use crate::unit::Quantity;

fn floor_to_period(timestamp: SystemTime, period: Duration) -> SystemTime {
    let since_epoch = timestamp.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    let period_nanos = period.as_nanos().max(1);
    let floored_nanos = (since_epoch.as_nanos() / period_nanos) * period_nanos;
    UNIX_EPOCH + Duration::from_nanos(floored_nanos as u64)
}

enum WorkerMessage {
    Record { metric_name: String, metric_type: MetricType, quantities: Vec<Quantity>, timestamp: SystemTime },
    /// Forces the worker to re-evaluate close-eligibility against the current time source
    /// reading, without waiting for the next `recv_timeout` deadline. Used by production's
    /// background ticker and, in tests, to advance a fake time source deterministically.
    Tick,
    /// Round-trips through the mailbox: lets a caller wait until every message sent before this
    /// one has been processed, without sleeping in real time.
    Sync(mpsc::Sender<()>),
    Shutdown,
}

/// Drop counters exposed for observability and tests; mirrors the "increment a drop counter"
/// language throughout §7 without pulling in a metrics-reporting dependency.
#[derive(Default)]
pub struct WorkerStats {
    pub dropped_too_late: AtomicU64,
    pub dropped_mailbox_full: AtomicU64,
    pub dropped_inconsistent_unit: AtomicU64,
}

impl WorkerStats {
    pub fn dropped_too_late(&self) -> u64 {
        self.dropped_too_late.load(Ordering::Relaxed)
    }
    pub fn dropped_mailbox_full(&self) -> u64 {
        self.dropped_mailbox_full.load(Ordering::Relaxed)
    }
    pub fn dropped_inconsistent_unit(&self) -> u64 {
        self.dropped_inconsistent_unit.load(Ordering::Relaxed)
    }
}

/// A handle to a running [`PeriodWorker`] thread: the sender half of its mailbox plus its join
/// handle and shared stats.
pub struct PeriodWorkerHandle {
    sender: SyncSender<WorkerMessage>,
    stats: Arc<WorkerStats>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl PeriodWorkerHandle {
    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    /// Enqueue a record's contribution to this worker's timeline. Drops (incrementing
    /// `dropped_mailbox_full`) if the bounded mailbox is full, per §5's backpressure policy:
    /// preserve the tick schedule under overload rather than block.
    pub fn send_record(
        &self,
        metric_name: impl Into<String>,
        metric_type: MetricType,
        quantities: Vec<Quantity>,
        timestamp: SystemTime,
    ) {
        let msg = WorkerMessage::Record {
            metric_name: metric_name.into(),
            metric_type,
            quantities,
            timestamp,
        };
        if self.sender.try_send(msg).is_err() {
            self.stats.dropped_mailbox_full.fetch_add(1, Ordering::Relaxed);
            rate_limited!(
                Duration::from_secs(1),
                warn!(reason = %DropReason::MailboxFull, "dropping record: worker mailbox full")
            );
        }
    }

    /// Force the worker to re-check close-eligibility now, without waiting for its next timer
    /// tick. Used by the production background ticker and by tests driving a fake time source.
    pub fn tick(&self) {
        let _ = self.sender.send(WorkerMessage::Tick);
    }

    /// Block until every message sent before this call has been processed by the worker thread.
    pub fn sync(&self) {
        let (tx, rx) = mpsc::channel();
        if self.sender.send(WorkerMessage::Sync(tx)).is_ok() {
            let _ = rx.recv();
        }
    }

    /// Signal the worker to close all remaining buckets and exit. Does not block; join via
    /// [`Self::take_join_handle`].
    pub fn shutdown(&self) {
        let _ = self.sender.send(WorkerMessage::Shutdown);
    }

    pub fn take_join_handle(&mut self) -> Option<std::thread::JoinHandle<()>> {
        self.join_handle.take()
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.as_ref().is_none_or(|h| h.is_finished())
    }
}

/// Spawn a new `PeriodWorker` thread for `(key, period)`.
///
/// Matches `metrique-aggregation::sink::worker::WorkerSink`'s background-thread model: a single
/// dedicated thread reading a bounded mailbox with `recv_timeout`, where the timeout *is* the
/// timer tick.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    key: Key,
    period: Duration,
    lateness_horizon: Duration,
    close_delay: Duration,
    mailbox_capacity: usize,
    resolver: Arc<dyn StatisticResolver>,
    sink: Arc<dyn Sink>,
    time_source: TimeSource,
) -> PeriodWorkerHandle {
    let (sender, receiver) = mpsc::sync_channel(mailbox_capacity);
    let stats = Arc::new(WorkerStats::default());
    let worker_stats = stats.clone();

    let join_handle = std::thread::Builder::new()
        .name(format!("mad-period-worker-{period:?}"))
        .spawn(move || {
            let span =
                tracing::span!(tracing::Level::TRACE, "period worker", key = ?key, period = ?period);
            let _entered = span.enter();
            info!("period worker started");
            let mut buckets: BTreeMap<SystemTime, Bucket> = BTreeMap::new();

            loop {
                match receiver.recv_timeout(period) {
                    Ok(WorkerMessage::Record { metric_name, metric_type, quantities, timestamp }) => {
                        handle_record(
                            &mut buckets,
                            &key,
                            period,
                            lateness_horizon,
                            &*resolver,
                            &time_source,
                            &worker_stats,
                            metric_name,
                            metric_type,
                            quantities,
                            timestamp,
                        );
                    }
                    Ok(WorkerMessage::Tick) | Err(RecvTimeoutError::Timeout) => {
                        close_eligible_buckets(&mut buckets, period, close_delay, &time_source, &sink);
                    }
                    Ok(WorkerMessage::Sync(ack)) => {
                        let _ = ack.send(());
                    }
                    Ok(WorkerMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                        debug!(remaining_buckets = buckets.len(), "period worker shutting down");
                        for (_, bucket) in std::mem::take(&mut buckets) {
                            sink.record(bucket.close());
                        }
                        break;
                    }
                }
            }
            info!("period worker stopped");
        })
        .expect("failed to spawn period worker thread");

    PeriodWorkerHandle { sender, stats, join_handle: Some(join_handle) }
}

#[allow(clippy::too_many_arguments)]
fn handle_record(
    buckets: &mut BTreeMap<SystemTime, Bucket>,
    key: &Key,
    period: Duration,
    lateness_horizon: Duration,
    resolver: &dyn StatisticResolver,
    time_source: &TimeSource,
    stats: &WorkerStats,
    metric_name: String,
    metric_type: MetricType,
    quantities: Vec<Quantity>,
    timestamp: SystemTime,
) {
    let period_start = floor_to_period(timestamp, period);
    if !buckets.contains_key(&period_start) {
        let now = time_source.system_time().as_std();
        let age = now.duration_since(period_start).unwrap_or(Duration::ZERO);
        if age > lateness_horizon {
            stats.dropped_too_late.fetch_add(1, Ordering::Relaxed);
            rate_limited!(
                Duration::from_secs(1),
                warn!(
                    metric = metric_name.as_str(),
                    ?period_start,
                    reason = %DropReason::TooLate,
                    "dropping record: beyond lateness horizon"
                )
            );
            return;
        }
        trace!(?period_start, "opening new bucket");
        buckets.insert(period_start, Bucket::new(key.clone(), period_start, period));
    }
    let bucket = buckets.get_mut(&period_start).expect("bucket just ensured present");
    let dropped = bucket.record(&metric_name, metric_type, &quantities, resolver);
    if dropped > 0 {
        stats.dropped_inconsistent_unit.fetch_add(dropped as u64, Ordering::Relaxed);
    }
}

fn close_eligible_buckets(
    buckets: &mut BTreeMap<SystemTime, Bucket>,
    period: Duration,
    close_delay: Duration,
    time_source: &TimeSource,
    sink: &Arc<dyn Sink>,
) {
    let now = time_source.system_time().as_std();
    let eligible: Vec<SystemTime> = buckets
        .keys()
        .copied()
        .take_while(|&period_start| period_start + period + close_delay <= now)
        .collect();
    for period_start in eligible {
        if let Some(bucket) = buckets.remove(&period_start) {
            debug!(?period_start, "closing bucket");
            sink.record(bucket.close());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MetricType;
    use crate::sink::VecSink;
    use crate::statistic::{Registry, StatisticRef};
    use mad_timesource::fakes::ManuallyAdvancedTimeSource;
    use std::sync::Arc;

    /// Resolver with a fixed specified set, dependents derived by closure over declared
    /// dependencies — enough to drive the end-to-end scenarios without a full `Config`.
    struct FixedResolver {
        specified: Vec<StatisticRef>,
    }

    impl StatisticResolver for FixedResolver {
        fn specified_for(&self, _metric_name: &str, _metric_type: MetricType) -> Vec<StatisticRef> {
            self.specified.clone()
        }
        fn dependent_for(&self, _metric_name: &str, _metric_type: MetricType) -> Vec<StatisticRef> {
            let specified: hashbrown::HashSet<&str> =
                self.specified.iter().map(|s| s.name()).collect();
            let mut seen = hashbrown::HashSet::new();
            let mut out = Vec::new();
            for s in &self.specified {
                for dep in s.dependencies() {
                    if !specified.contains(dep.name()) && seen.insert(dep.name().to_string()) {
                        out.push(dep.clone());
                    }
                }
            }
            out
        }
    }

    fn seconds(s: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(s)
    }

    fn max_resolver() -> Arc<dyn StatisticResolver> {
        let registry = Registry::new();
        let max = registry.resolve("max").unwrap();
        Arc::new(FixedResolver { specified: vec![max] })
    }

    #[test]
    fn period_rotation_emits_at_period_start_zero() {
        let sink = Arc::new(VecSink::new());
        let fake = ManuallyAdvancedTimeSource::at_time(seconds(0));
        let time_source = TimeSource::custom(fake.clone());

        let mut handle = spawn(
            Key::from_dimensions(&Default::default()),
            Duration::from_secs(60),
            Duration::from_secs(120),
            Duration::from_secs(60),
            1024,
            max_resolver(),
            sink.clone(),
            time_source,
        );

        for t in [0, 30, 59] {
            handle.send_record("latency", MetricType::Timer, vec![Quantity::scalar(t as f64)], seconds(t));
        }
        handle.send_record("latency", MetricType::Timer, vec![Quantity::scalar(60.0)], seconds(60));
        handle.sync();

        fake.update_time(seconds(120));
        handle.tick();
        handle.sync();

        handle.shutdown();
        if let Some(join) = handle.take_join_handle() {
            join.join().expect("worker thread panicked");
        }

        let emitted = sink.drain();
        assert!(!emitted.is_empty());
        assert_eq!(emitted[0].period_start, seconds(0));
    }

    #[test]
    fn late_record_within_close_delay_is_absorbed() {
        let sink = Arc::new(VecSink::new());
        let fake = ManuallyAdvancedTimeSource::at_time(seconds(30));
        let time_source = TimeSource::custom(fake.clone());

        let mut handle = spawn(
            Key::from_dimensions(&Default::default()),
            Duration::from_secs(60),
            Duration::from_secs(120),
            Duration::from_secs(60),
            1024,
            max_resolver(),
            sink.clone(),
            time_source,
        );

        fake.update_time(seconds(75));
        handle.send_record("latency", MetricType::Timer, vec![Quantity::scalar(5.0)], seconds(30));
        handle.tick();
        handle.sync();

        fake.update_time(seconds(120));
        handle.tick();
        handle.sync();

        handle.shutdown();
        if let Some(join) = handle.take_join_handle() {
            join.join().expect("worker thread panicked");
        }

        let emitted = sink.drain();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].period_start, seconds(0));
        assert_eq!(handle.stats().dropped_too_late(), 0);
    }

    #[test]
    fn late_record_beyond_horizon_is_dropped() {
        let sink = Arc::new(VecSink::new());
        let fake = ManuallyAdvancedTimeSource::at_time(seconds(150));
        let time_source = TimeSource::custom(fake.clone());

        let handle = spawn(
            Key::from_dimensions(&Default::default()),
            Duration::from_secs(60),
            Duration::from_secs(120),
            Duration::from_secs(60),
            1024,
            max_resolver(),
            sink.clone(),
            time_source,
        );

        handle.send_record("latency", MetricType::Timer, vec![Quantity::scalar(5.0)], seconds(30));
        handle.sync();

        assert_eq!(handle.stats().dropped_too_late(), 1);
        assert!(sink.is_empty());

        handle.shutdown();
    }

    #[test]
    fn inconsistent_unit_sample_increments_drop_counter() {
        let sink = Arc::new(VecSink::new());
        let fake = ManuallyAdvancedTimeSource::at_time(seconds(0));
        let time_source = TimeSource::custom(fake.clone());

        let handle = spawn(
            Key::from_dimensions(&Default::default()),
            Duration::from_secs(60),
            Duration::from_secs(120),
            Duration::from_secs(60),
            1024,
            max_resolver(),
            sink.clone(),
            time_source,
        );

        handle.send_record(
            "latency",
            MetricType::Timer,
            vec![Quantity::new(1.0, Some(crate::unit::Unit::Byte))],
            seconds(0),
        );
        handle.send_record(
            "latency",
            MetricType::Timer,
            vec![Quantity::new(1.0, Some(crate::unit::Unit::Second))],
            seconds(0),
        );
        handle.sync();

        assert_eq!(handle.stats().dropped_inconsistent_unit(), 1);

        handle.shutdown();
    }

    #[test]
    fn dependency_resolution_emits_tp99_not_histogram() {
        let registry = Registry::new();
        let tp99 = registry.resolve("tp99").unwrap();
        let resolver: Arc<dyn StatisticResolver> =
            Arc::new(FixedResolver { specified: vec![tp99] });
        let sink = Arc::new(VecSink::new());
        let fake = ManuallyAdvancedTimeSource::at_time(seconds(0));
        let time_source = TimeSource::custom(fake.clone());

        let mut handle = spawn(
            Key::from_dimensions(&Default::default()),
            Duration::from_secs(60),
            Duration::from_secs(120),
            Duration::from_secs(60),
            1024,
            resolver,
            sink.clone(),
            time_source,
        );

        for v in 1..=100 {
            handle.send_record("latency", MetricType::Timer, vec![Quantity::scalar(v as f64)], seconds(0));
        }
        handle.sync();

        fake.update_time(seconds(120));
        handle.tick();
        handle.sync();
        handle.shutdown();
        if let Some(join) = handle.take_join_handle() {
            join.join().expect("worker thread panicked");
        }

        let emitted = sink.drain();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].data.len(), 1);
        assert_eq!(emitted[0].data[0].statistic, "tp99");
    }
}
