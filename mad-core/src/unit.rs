// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Quantities and the unit system they're expressed in.

use std::fmt;

/// A measurement unit, grouped by the dimension it belongs to.
///
/// Conversion is only defined between units of the same dimension (e.g. [`Unit::Byte`] to
/// [`Unit::Kilobyte`]); converting across dimensions (bytes to nanoseconds) fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Unit {
    /// No unit, a bare scalar.
    None,
    Byte,
    Kilobyte,
    Megabyte,
    Gigabyte,
    Nanosecond,
    Microsecond,
    Millisecond,
    Second,
    Count,
}

impl Unit {
    fn dimension(self) -> Dimension {
        match self {
            Unit::None => Dimension::None,
            Unit::Byte | Unit::Kilobyte | Unit::Megabyte | Unit::Gigabyte => Dimension::Bytes,
            Unit::Nanosecond | Unit::Microsecond | Unit::Millisecond | Unit::Second => {
                Dimension::Time
            }
            Unit::Count => Dimension::Count,
        }
    }

    /// Multiplier to convert a value in this unit to the dimension's base unit
    /// (bytes for the byte family, nanoseconds for the time family).
    fn base_factor(self) -> f64 {
        match self {
            Unit::None | Unit::Count => 1.0,
            Unit::Byte => 1.0,
            Unit::Kilobyte => 1_000.0,
            Unit::Megabyte => 1_000_000.0,
            Unit::Gigabyte => 1_000_000_000.0,
            Unit::Nanosecond => 1.0,
            Unit::Microsecond => 1_000.0,
            Unit::Millisecond => 1_000_000.0,
            Unit::Second => 1_000_000_000.0,
        }
    }

    /// Convert `value`, expressed in this unit, into `target`.
    ///
    /// Fails with [`UnitError::Incompatible`] if the two units belong to different dimensions.
    pub fn convert(self, value: f64, target: Unit) -> Result<f64, UnitError> {
        if self.dimension() != target.dimension() {
            return Err(UnitError::Incompatible { from: self, to: target });
        }
        Ok(value * self.base_factor() / target.base_factor())
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Unit::None => "None",
            Unit::Byte => "Bytes",
            Unit::Kilobyte => "Kilobytes",
            Unit::Megabyte => "Megabytes",
            Unit::Gigabyte => "Gigabytes",
            Unit::Nanosecond => "Nanoseconds",
            Unit::Microsecond => "Microseconds",
            Unit::Millisecond => "Milliseconds",
            Unit::Second => "Seconds",
            Unit::Count => "Count",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dimension {
    None,
    Bytes,
    Time,
    Count,
}

/// A unit was used where an incompatible one was expected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitError {
    pub from: Unit,
    pub to: Unit,
}

impl fmt::Display for UnitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot convert {} to {}: incompatible dimensions", self.from, self.to)
    }
}

impl std::error::Error for UnitError {}

/// A scalar measurement, optionally tagged with a [`Unit`].
///
/// Equality is by value and unit together: `Quantity::new(1.0, None) != Quantity::new(1.0,
/// Some(Unit::Count))`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantity {
    pub value: f64,
    pub unit: Option<Unit>,
}

impl Quantity {
    /// Create a new quantity. `value` must be finite; see [`crate::record::RecordError`] for the
    /// boundary check performed on ingestion.
    pub fn new(value: f64, unit: Option<Unit>) -> Self {
        Self { value, unit }
    }

    /// Create a unitless quantity.
    pub fn scalar(value: f64) -> Self {
        Self { value, unit: None }
    }
}
