/* This file is part of tsdb-plot-rust.
 *
 * Licensed under the Mozilla Public License Version 2.0
 * Fedora-License-Identifier: MPLv2.0
 * SPDX-2.0-License-Identifier: MPL-2.0
 * SPDX-3.0-License-Identifier: MPL-2.0
 *
 * tsdb-plot-rust is free software.
 * For more information on the license, see LICENSE.
 * For more information on free software, see <https://www.gnu.org/philosophy/free-sw.en.html>.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at <https://mozilla.org/MPL/2.0/>.
 */


//! Common types used throughout the program.

use lazy_static::lazy_static;
use num_derive::FromPrimitive;
use num_traits::cast::FromPrimitive;
use regex::Regex;
use serde::{
	de,
	Deserialize,
	Deserializer,
	Serialize,
	Serializer,
};
use std::{
	convert::TryFrom,
	fmt,
	str::FromStr,
};

use crate::error::Error;

/// Single sample of a series.
///
/// The timestamp unit (seconds or milliseconds) is decided by the query.
/// A `NAN` value marks an empty slot, as produced by fill policies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
	pub timestamp: i64,
	pub value: f64,
}
impl Point {
	pub fn new(timestamp: i64, value: f64) -> Self {
		Self { timestamp, value }
	}

	/// Whether this point is an empty-slot sentinel.
	pub fn is_empty(&self) -> bool {
		self.value.is_nan()
	}
}

/// Result of a plot query
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TimeSeries {
	/// Number of points in `data`
	pub count: usize,
	/// Number of raw points read from storage
	pub total: usize,
	pub data: Vec<Point>,
}

/// Aggregation vocabulary shared by downsample, merge and the flattener.
///
/// The discriminants are the numeric codes the flattener receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum Aggregator {
	Avg = 0,
	Sum = 1,
	Count = 2,
	Max = 3,
	Min = 4,
}

/// Ingest-side name of the aggregation vocabulary.
pub type FlatOperation = Aggregator;

impl Aggregator {
	/// Looks up an aggregator by its numeric code.
	pub fn from_code(code: u8) -> Result<Self, Error> {
		Self::from_u8(code).ok_or(Error::UnsupportedOperation(code))
	}

	pub fn to_static_str(&self) -> &'static str {
		match self {
			Aggregator::Avg => "avg",
			Aggregator::Sum => "sum",
			Aggregator::Count => "count",
			Aggregator::Max => "max",
			Aggregator::Min => "min",
		}
	}
}
impl From<Aggregator> for u8 {
	fn from(v: Aggregator) -> u8 {
		v as u8
	}
}
impl FromStr for Aggregator {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"avg" => Ok(Aggregator::Avg),
			"sum" => Ok(Aggregator::Sum),
			"count" => Ok(Aggregator::Count),
			"max" => Ok(Aggregator::Max),
			"min" => Ok(Aggregator::Min),
			_ => Err(format!("Unrecognized aggregator: {:?}", s)),
		}
	}
}
impl fmt::Display for Aggregator {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.to_static_str())
	}
}
impl Serialize for Aggregator {
	fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(self.to_static_str())
	}
}
impl<'de> Deserialize<'de> for Aggregator {
	fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
		let s = String::deserialize(d)?;
		s.parse().map_err(de::Error::custom)
	}
}
impl Default for Aggregator {
	fn default() -> Self {
		Aggregator::Sum
	}
}

/// Aggregated values over a group of points
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedPoint {
	/// Minimum value in the group
	pub min: f64,
	/// Maximum value in the group
	pub max: f64,
	/// Sum of all values in the group
	pub sum: f64,
	/// Number of values accumulated
	pub count: u64,
}
impl AggregatedPoint {
	/// Creates an empty accumulator.
	///
	/// min starts as +inf, max starts as -inf, and sum and count start as 0.
	pub fn new() -> Self {
		Self {
			min: std::f64::INFINITY,
			max: std::f64::NEG_INFINITY,
			sum: 0.,
			count: 0,
		}
	}

	/// Builds an accumulator over every value of an iterator.
	pub fn from_values<I: IntoIterator<Item = f64>>(values: I) -> Self {
		let mut point = Self::new();
		for value in values {
			point.add(value);
		}
		point
	}

	/// Adds a value to the point.
	pub fn add(&mut self, value: f64) {
		self.min = self.min.min(value);
		self.max = self.max.max(value);
		self.sum += value;
		self.count += 1;
	}

	/// Final value for an aggregator.
	///
	/// `None` when the aggregator has no meaning over zero values (avg, min, max).
	pub fn value(&self, aggregator: Aggregator) -> Option<f64> {
		match aggregator {
			Aggregator::Sum => Some(self.sum),
			Aggregator::Count => Some(self.count as f64),
			_ if self.count == 0 => None,
			Aggregator::Avg => Some(self.sum / self.count as f64),
			Aggregator::Min => Some(self.min),
			Aggregator::Max => Some(self.max),
		}
	}
}
impl Default for AggregatedPoint {
	fn default() -> Self {
		Self::new()
	}
}

/// Time units usable in query periods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeriodUnit {
	Day,
	Hour,
	Minute,
	Second,
	Millisecond,
}
impl PeriodUnit {
	/// Number of milliseconds in a single one of these units
	pub fn ms_multiplier(&self) -> i64 {
		match self {
			PeriodUnit::Day => 24 * 60 * 60 * 1000,
			PeriodUnit::Hour => 60 * 60 * 1000,
			PeriodUnit::Minute => 60 * 1000,
			PeriodUnit::Second => 1000,
			PeriodUnit::Millisecond => 1,
		}
	}

	pub fn to_static_str(&self) -> &'static str {
		match self {
			PeriodUnit::Day => "d",
			PeriodUnit::Hour => "h",
			PeriodUnit::Minute => "m",
			PeriodUnit::Second => "s",
			PeriodUnit::Millisecond => "ms",
		}
	}
}
impl FromStr for PeriodUnit {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"d" => Ok(PeriodUnit::Day),
			"h" => Ok(PeriodUnit::Hour),
			"m" => Ok(PeriodUnit::Minute),
			"s" => Ok(PeriodUnit::Second),
			"ms" => Ok(PeriodUnit::Millisecond),
			_ => Err(format!("Unrecognized time unit: {:?}", s)),
		}
	}
}
impl fmt::Display for PeriodUnit {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.to_static_str())
	}
}

lazy_static! {
	static ref RE_PERIOD: Regex = Regex::new(r"^(\d+)\s*(ms|s|m|h|d)$").unwrap();
}

/// Bucket width such as `1m` or `30s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Period {
	/// Number of units for this period. Never zero, and small enough for the period to
	/// fit in an `i64` of milliseconds.
	pub count: u64,
	pub unit: PeriodUnit,
}
impl Period {
	/// Gets the period in milliseconds, saturating at `i64::MAX`
	pub fn as_ms(&self) -> i64 {
		i64::try_from(self.count)
			.unwrap_or(std::i64::MAX)
			.saturating_mul(self.unit.ms_multiplier())
	}

	/// Gets the period in the timestamp unit of a query.
	///
	/// Sub-second periods round up to one second when timestamps are in seconds.
	pub fn interval(&self, ms: bool) -> i64 {
		if ms {
			self.as_ms()
		} else {
			(self.as_ms() / 1000).max(1)
		}
	}
}
impl FromStr for Period {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let caps = RE_PERIOD
			.captures(s.trim())
			.ok_or_else(|| format!("Invalid period: {:?}", s))?;
		let count = caps[1]
			.parse::<u64>()
			.map_err(|e| format!("Invalid period {:?}: {}", s, e))?;
		if count == 0 {
			return Err(format!("Period must not be zero: {:?}", s));
		}
		let unit: PeriodUnit = caps[2].parse()?;
		i64::try_from(count)
			.ok()
			.and_then(|count| count.checked_mul(unit.ms_multiplier()))
			.ok_or_else(|| format!("Period too long: {:?}", s))?;
		Ok(Period { count, unit })
	}
}
impl fmt::Display for Period {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}{}", self.count, self.unit)
	}
}
impl Serialize for Period {
	fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		s.collect_str(self)
	}
}
impl<'de> Deserialize<'de> for Period {
	fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
		let s = String::deserialize(d)?;
		s.parse().map_err(de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn aggregator_codes() {
		assert_eq!(Aggregator::from_code(0), Ok(Aggregator::Avg));
		assert_eq!(Aggregator::from_code(4), Ok(Aggregator::Min));
		assert_eq!(
			Aggregator::from_code(9),
			Err(Error::UnsupportedOperation(9))
		);
		assert_eq!(u8::from(Aggregator::Count), 2);
	}

	#[test]
	fn aggregated_point_values() {
		let point = AggregatedPoint::from_values(vec![3., 1., 2.]);
		assert_eq!(point.value(Aggregator::Avg), Some(2.));
		assert_eq!(point.value(Aggregator::Sum), Some(6.));
		assert_eq!(point.value(Aggregator::Count), Some(3.));
		assert_eq!(point.value(Aggregator::Min), Some(1.));
		assert_eq!(point.value(Aggregator::Max), Some(3.));

		let empty = AggregatedPoint::new();
		assert_eq!(empty.value(Aggregator::Avg), None);
		assert_eq!(empty.value(Aggregator::Max), None);
		assert_eq!(empty.value(Aggregator::Sum), Some(0.));
		assert_eq!(empty.value(Aggregator::Count), Some(0.));
	}

	#[test]
	fn period_parse() {
		let period: Period = "1m".parse().unwrap();
		assert_eq!(period.as_ms(), 60_000);
		assert_eq!(period.interval(false), 60);
		assert_eq!(period.interval(true), 60_000);
		assert_eq!(period.to_string(), "1m");

		let period: Period = "500ms".parse().unwrap();
		assert_eq!(period.interval(false), 1);

		assert!("0s".parse::<Period>().is_err());
		assert!("5w".parse::<Period>().is_err());
		assert!("m".parse::<Period>().is_err());

		let period: Period = "106751991167d".parse().unwrap();
		assert_eq!(period.as_ms(), 106_751_991_167 * 86_400_000);
		assert!("106751991168d".parse::<Period>().is_err());
		assert!("999999999999999d".parse::<Period>().is_err());
		assert!("18446744073709551615ms".parse::<Period>().is_err());
		assert!("99999999999999999999s".parse::<Period>().is_err());

		let built = Period {
			count: std::u64::MAX,
			unit: PeriodUnit::Day,
		};
		assert_eq!(built.as_ms(), std::i64::MAX);
		assert_eq!(built.interval(false), std::i64::MAX / 1000);
	}
}
