// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Streaming metrics aggregation engine.
//!
//! Ingests individual metric samples tagged with dimensions, groups them into fixed-duration
//! time windows, computes configured statistics per `(dimension-key, metric, period)`, and
//! emits periodic summaries to a [`sink::Sink`].
//!
//! The entry points are [`aggregator::Aggregator::observe`] (ingestion) and [`sink::Sink::record`]
//! (emission); everything else — the statistic dependency graph, the histogram, per-key period
//! rotation — is internal machinery in service of that pipeline.
#![doc = include_str!("../README.md")]

pub mod aggregator;
pub mod builtin;
pub mod bucket;
pub mod config;
pub mod error;
pub mod histogram;
pub mod period_worker;
pub(crate) mod rate_limit;
pub mod record;
pub mod sink;
pub mod statistic;
pub mod unit;

pub use aggregator::Aggregator;
pub use config::Config;
pub use error::{AccumulateError, DropReason, RecordError};
pub use record::{Key, Metric, MetricType, Record};
pub use sink::{AggregatedData, PeriodicData, Sink, VecSink};
pub use statistic::{Accumulator, Calculator, CalculatedValue, Registry, Statistic, StatisticRef};
pub use unit::{Quantity, Unit};
