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


//! Operator configuration of a plot query.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{
	de,
	Deserialize,
	Deserializer,
	Serialize,
	Serializer,
};
use std::{
	fmt,
	str::FromStr,
};

use crate::{
	error::Error,
	types::{
		Aggregator,
		Period,
	},
};

/// Operators that can appear in an `OperatorList`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
	Downsample,
	/// Cross-series merge marker
	Aggregation,
	Rate,
	FilterValue,
}
impl Operation {
	pub fn to_static_str(&self) -> &'static str {
		match self {
			Operation::Downsample => "downsample",
			Operation::Aggregation => "aggregation",
			Operation::Rate => "rate",
			Operation::FilterValue => "filterValue",
		}
	}
}
impl FromStr for Operation {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"downsample" => Ok(Operation::Downsample),
			"aggregation" => Ok(Operation::Aggregation),
			"rate" => Ok(Operation::Rate),
			"filterValue" => Ok(Operation::FilterValue),
			_ => Err(format!("Unrecognized operation: {:?}", s)),
		}
	}
}
impl fmt::Display for Operation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.to_static_str())
	}
}
impl Serialize for Operation {
	fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(self.to_static_str())
	}
}
impl<'de> Deserialize<'de> for Operation {
	fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
		let s = String::deserialize(d)?;
		s.parse().map_err(de::Error::custom)
	}
}

/// Execution order of the operators of a query. Each operator appears at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct OperatorList(Vec<Operation>);
impl OperatorList {
	pub fn new() -> Self {
		Self(Vec::new())
	}

	/// Builds a list, rejecting repeated operators.
	pub fn from_vec(operations: Vec<Operation>) -> Result<Self, Error> {
		let mut list = Self::new();
		for op in operations {
			list.push(op)?;
		}
		Ok(list)
	}

	pub fn contains(&self, op: Operation) -> bool {
		self.0.contains(&op)
	}

	/// Puts an operator at the front of the list.
	pub fn prepend(&mut self, op: Operation) -> Result<(), Error> {
		if self.contains(op) {
			return Err(Error::DuplicateOperator(op.to_string()));
		}
		self.0.insert(0, op);
		Ok(())
	}

	/// Puts an operator at the back of the list.
	pub fn push(&mut self, op: Operation) -> Result<(), Error> {
		if self.contains(op) {
			return Err(Error::DuplicateOperator(op.to_string()));
		}
		self.0.push(op);
		Ok(())
	}

	pub fn iter(&self) -> std::slice::Iter<'_, Operation> {
		self.0.iter()
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}
impl<'de> Deserialize<'de> for OperatorList {
	fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
		let ops = Vec::<Operation>::deserialize(d)?;
		OperatorList::from_vec(ops).map_err(de::Error::custom)
	}
}

/// What to emit for a downsample bucket without points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FillPolicy {
	/// Omit the bucket, unless empties are kept
	None,
	/// Emit an empty-slot sentinel
	Null,
	/// Emit zero
	Zero,
}
impl FillPolicy {
	pub fn to_static_str(&self) -> &'static str {
		match self {
			FillPolicy::None => "none",
			FillPolicy::Null => "null",
			FillPolicy::Zero => "zero",
		}
	}
}
impl FromStr for FillPolicy {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"none" => Ok(FillPolicy::None),
			"null" => Ok(FillPolicy::Null),
			"zero" => Ok(FillPolicy::Zero),
			_ => Err(format!("Unrecognized fill policy: {:?}", s)),
		}
	}
}
impl fmt::Display for FillPolicy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.to_static_str())
	}
}
impl Serialize for FillPolicy {
	fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(self.to_static_str())
	}
}
impl<'de> Deserialize<'de> for FillPolicy {
	fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
		let s = String::deserialize(d)?;
		s.parse().map_err(de::Error::custom)
	}
}
impl Default for FillPolicy {
	fn default() -> Self {
		FillPolicy::None
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownsampleOptions {
	pub aggregator: Aggregator,
	pub period: Period,
	#[serde(default)]
	pub fill: FillPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownsampleConfig {
	pub enabled: bool,
	pub options: Option<DownsampleOptions>,
	/// Cap the final result to `total_points` points
	pub point_limit: bool,
	pub total_points: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateOptions {
	/// Treat the series as a monotonic counter
	pub counter: bool,
	/// Value at which the counter wraps around
	pub counter_max: Option<f64>,
	/// Rate reported for a counter reset when `counter_max` is unset
	pub reset_value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
	pub enabled: bool,
	pub options: RateOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparator {
	Greater,
	GreaterEqual,
	Less,
	LessEqual,
	Equal,
	NotEqual,
}
impl Comparator {
	pub fn compare(&self, lhs: f64, rhs: f64) -> bool {
		match self {
			Comparator::Greater => lhs > rhs,
			Comparator::GreaterEqual => lhs >= rhs,
			Comparator::Less => lhs < rhs,
			Comparator::LessEqual => lhs <= rhs,
			Comparator::Equal => lhs == rhs,
			Comparator::NotEqual => lhs != rhs,
		}
	}

	pub fn to_static_str(&self) -> &'static str {
		match self {
			Comparator::Greater => ">",
			Comparator::GreaterEqual => ">=",
			Comparator::Less => "<",
			Comparator::LessEqual => "<=",
			Comparator::Equal => "==",
			Comparator::NotEqual => "!=",
		}
	}
}

lazy_static! {
	static ref RE_FILTER: Regex = Regex::new(r"^(>=|<=|==|!=|>|<)\s*(\S+)$").unwrap();
}

/// Value predicate such as `>=5`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterValue {
	pub comparator: Comparator,
	pub value: f64,
}
impl FilterValue {
	pub fn matches(&self, value: f64) -> bool {
		self.comparator.compare(value, self.value)
	}
}
impl FromStr for FilterValue {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let caps = RE_FILTER
			.captures(s.trim())
			.ok_or_else(|| format!("Invalid filter: {:?}", s))?;
		let comparator = match &caps[1] {
			">" => Comparator::Greater,
			">=" => Comparator::GreaterEqual,
			"<" => Comparator::Less,
			"<=" => Comparator::LessEqual,
			"==" => Comparator::Equal,
			_ => Comparator::NotEqual,
		};
		let value = caps[2]
			.parse::<f64>()
			.map_err(|e| format!("Invalid filter value {:?}: {}", &caps[2], e))?;
		Ok(FilterValue { comparator, value })
	}
}
impl fmt::Display for FilterValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}{}", self.comparator.to_static_str(), self.value)
	}
}
impl Serialize for FilterValue {
	fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		s.collect_str(self)
	}
}
impl<'de> Deserialize<'de> for FilterValue {
	fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
		let s = String::deserialize(d)?;
		s.parse().map_err(de::Error::custom)
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterValueConfig {
	pub enabled: bool,
	pub filter: Option<FilterValue>,
}

/// Operators of a plot query, their options, and the order to run them in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataOperations {
	pub downsample: DownsampleConfig,
	/// Aggregator used when merging series
	pub merge: Aggregator,
	pub rate: RateConfig,
	pub filter_value: FilterValueConfig,
	pub order: OperatorList,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn operator_list_rejects_duplicates() {
		let mut list = OperatorList::new();
		list.prepend(Operation::Aggregation).unwrap();
		list.prepend(Operation::Downsample).unwrap();
		assert_eq!(
			list.prepend(Operation::Downsample),
			Err(Error::DuplicateOperator("downsample".into()))
		);
		assert_eq!(
			list.iter().copied().collect::<Vec<_>>(),
			vec![Operation::Downsample, Operation::Aggregation]
		);
	}

	#[test]
	fn filter_parse() {
		let filter: FilterValue = ">=5".parse().unwrap();
		assert_eq!(filter.comparator, Comparator::GreaterEqual);
		assert!(filter.matches(5.));
		assert!(!filter.matches(4.9));
		assert_eq!(filter.to_string(), ">=5");

		let filter: FilterValue = "!= 0.5".parse().unwrap();
		assert_eq!(filter.comparator, Comparator::NotEqual);
		assert!(filter.matches(1.));

		assert!("=>5".parse::<FilterValue>().is_err());
		assert!(">abc".parse::<FilterValue>().is_err());
	}

	#[test]
	fn data_operations_from_json() {
		let json = r#"{
			"downsample": {
				"enabled": true,
				"options": {"aggregator": "avg", "period": "1m", "fill": "zero"},
				"point_limit": true,
				"total_points": 100
			},
			"merge": "max",
			"filter_value": {"enabled": true, "filter": "<10"},
			"order": ["downsample", "aggregation", "filterValue"]
		}"#;
		let opers: DataOperations = serde_json::from_str(json).unwrap();
		let options = opers.downsample.options.unwrap();
		assert_eq!(options.aggregator, Aggregator::Avg);
		assert_eq!(options.period.as_ms(), 60_000);
		assert_eq!(options.fill, FillPolicy::Zero);
		assert_eq!(opers.merge, Aggregator::Max);
		assert!(!opers.rate.enabled);
		assert_eq!(opers.order.len(), 3);

		let dup = r#"{"order": ["rate", "rate"]}"#;
		assert!(serde_json::from_str::<DataOperations>(dup).is_err());
	}
}
