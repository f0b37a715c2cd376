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


//! Parser for the query function language.
//!
//! Expressions are nested function calls wrapping a series selector, for example
//! `merge(sum,downsample(avg,1m,none,query(cpu)))`. Parsing goes from the outside in;
//! every function puts its operator at the front of the `OperatorList`, so the
//! innermost function runs first.

use std::{
	fmt,
	str::FromStr,
};

use crate::{
	error::Error,
	query::{
		DataOperations,
		DownsampleConfig,
		DownsampleOptions,
		FilterValue,
		FilterValueConfig,
		Operation,
		OperatorList,
		RateConfig,
		RateOptions,
	},
	types::Aggregator,
};

/// Textual downsample settings, serialized as `op-period-fill`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownsampleDirective {
	pub aggregator: String,
	pub period: String,
	pub fill: String,
}
impl DownsampleDirective {
	/// Validates the directive into typed options.
	pub fn to_options(&self) -> Result<DownsampleOptions, Error> {
		let aggregator = self
			.aggregator
			.parse()
			.map_err(|e| Error::malformed("downsample", e))?;
		let period = self
			.period
			.parse()
			.map_err(|e| Error::malformed("downsample", e))?;
		let fill = self
			.fill
			.parse()
			.map_err(|e| Error::malformed("downsample", e))?;
		Ok(DownsampleOptions {
			aggregator,
			period,
			fill,
		})
	}
}
impl fmt::Display for DownsampleDirective {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}-{}-{}", self.aggregator, self.period, self.fill)
	}
}
impl FromStr for DownsampleDirective {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let info = s.split('-').collect::<Vec<_>>();
		match info.as_slice() {
			[aggregator, period] => Ok(Self {
				aggregator: String::from(*aggregator),
				period: String::from(*period),
				fill: String::from("none"),
			}),
			[aggregator, period, fill] => Ok(Self {
				aggregator: String::from(*aggregator),
				period: String::from(*period),
				fill: String::from(*fill),
			}),
			_ => Err(Error::malformed(
				"downsample",
				format!("invalid downsample directive {:?}", s),
			)),
		}
	}
}

/// Functions collected while parsing an expression
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedQuery {
	pub downsample: Option<DownsampleDirective>,
	pub merge: Option<Aggregator>,
	pub rate: Option<RateOptions>,
	pub filter: Option<FilterValue>,
	pub order: OperatorList,
}
impl ParsedQuery {
	/// Builds the pipeline configuration for this query.
	///
	/// `point_limit` caps the number of points returned.
	pub fn data_operations(&self, point_limit: Option<usize>) -> Result<DataOperations, Error> {
		let options = match self.downsample.as_ref() {
			Some(directive) => Some(directive.to_options()?),
			None => None,
		};
		Ok(DataOperations {
			downsample: DownsampleConfig {
				enabled: options.is_some(),
				options,
				point_limit: point_limit.is_some(),
				total_points: point_limit.unwrap_or(0),
			},
			merge: self.merge.unwrap_or_default(),
			rate: RateConfig {
				enabled: self.rate.is_some(),
				options: self.rate.clone().unwrap_or_default(),
			},
			filter_value: FilterValueConfig {
				enabled: self.filter.is_some(),
				filter: self.filter,
			},
			order: self.order.clone(),
		})
	}
}

/// Parses a whole expression, returning the innermost series selector and the functions
/// wrapped around it.
pub fn parse_expression(exp: &str) -> Result<(String, ParsedQuery), Error> {
	let mut query = ParsedQuery::default();
	let mut exp = String::from(exp.trim());
	loop {
		exp = match function_name(&exp) {
			Some("downsample") => parse_downsample(&exp, &mut query)?,
			Some("merge") => parse_merge(&exp, &mut query)?,
			Some("rate") => parse_rate(&exp, &mut query)?,
			Some("filter") => parse_filter(&exp, &mut query)?,
			_ => break,
		};
	}
	Ok((exp, query))
}

/// Inverse of `parse_expression`.
pub fn write_expression(terminal: &str, query: &ParsedQuery) -> String {
	let mut exp = String::from(terminal);
	for op in query.order.iter() {
		exp = match op {
			Operation::Downsample => match query.downsample.as_ref() {
				Some(directive) => write_downsample(&exp, &directive.to_string()),
				None => exp,
			},
			Operation::Aggregation => {
				format!("merge({},{})", query.merge.unwrap_or_default(), exp)
			}
			Operation::Rate => match query.rate.as_ref() {
				Some(options) => format!(
					"rate({},{},{},{})",
					options.counter,
					options
						.counter_max
						.map(|v| v.to_string())
						.unwrap_or_else(|| String::from("null")),
					options.reset_value,
					exp
				),
				None => exp,
			},
			Operation::FilterValue => match query.filter.as_ref() {
				Some(filter) => format!("filter(\"{}\",{})", filter, exp),
				None => exp,
			},
		};
	}
	exp
}

/// Parses `downsample(op,period,fill,expr)`, returning `expr`.
pub fn parse_downsample(exp: &str, query: &mut ParsedQuery) -> Result<String, Error> {
	let mut params = call_params("downsample", exp)?;
	if params.len() != 4 {
		return Err(Error::malformed(
			"downsample",
			format!(
				"downsample needs 4 parameters: downsample operation, downsample period, \
				 fill option and a function, but found {}: {:?}",
				params.len(),
				params
			),
		));
	}

	query.order.prepend(Operation::Downsample)?;
	query.downsample = Some(DownsampleDirective {
		aggregator: params[0].clone(),
		period: params[1].clone(),
		fill: params[2].clone(),
	});

	Ok(params.swap_remove(3))
}

/// Wraps an expression in a downsample call described by `ds_info` (`op-period[-fill]`).
///
/// An empty `ds_info` returns the expression unchanged.
pub fn write_downsample(exp: &str, ds_info: &str) -> String {
	if ds_info.is_empty() {
		return String::from(exp);
	}
	let mut info = ds_info.split('-').collect::<Vec<_>>();
	if info.len() == 2 {
		info.push("none");
	}
	format!("downsample({},{})", info.join(","), exp)
}

/// Parses `merge(op,expr)`, returning `expr`.
fn parse_merge(exp: &str, query: &mut ParsedQuery) -> Result<String, Error> {
	let mut params = call_params("merge", exp)?;
	if params.len() != 2 {
		return Err(Error::malformed(
			"merge",
			format!(
				"merge needs 2 parameters: merge operation and a function, but found {}",
				params.len()
			),
		));
	}

	let aggregator = params[0]
		.parse::<Aggregator>()
		.map_err(|e| Error::malformed("merge", e))?;
	query.order.prepend(Operation::Aggregation)?;
	query.merge = Some(aggregator);
	Ok(params.swap_remove(1))
}

/// Parses `rate(counter,counterMax,resetValue,expr)`, returning `expr`.
fn parse_rate(exp: &str, query: &mut ParsedQuery) -> Result<String, Error> {
	let mut params = call_params("rate", exp)?;
	if params.len() != 4 {
		return Err(Error::malformed(
			"rate",
			format!(
				"rate needs 4 parameters: counter, counter max value, reset value and a \
				 function, but found {}",
				params.len()
			),
		));
	}

	let counter = params[0]
		.parse::<bool>()
		.map_err(|e| Error::malformed("rate", format!("counter {:?}: {}", params[0], e)))?;
	let counter_max = match params[1].as_str() {
		"null" | "" => None,
		s => Some(s.parse::<f64>().map_err(|e| {
			Error::malformed("rate", format!("counter max value {:?}: {}", s, e))
		})?),
	};
	let reset_value = params[2]
		.parse::<f64>()
		.map_err(|e| Error::malformed("rate", format!("reset value {:?}: {}", params[2], e)))?;

	query.order.prepend(Operation::Rate)?;
	query.rate = Some(RateOptions {
		counter,
		counter_max,
		reset_value,
	});
	Ok(params.swap_remove(3))
}

/// Parses `filter("<cmp><value>",expr)`, returning `expr`.
fn parse_filter(exp: &str, query: &mut ParsedQuery) -> Result<String, Error> {
	let mut params = call_params("filter", exp)?;
	if params.len() != 2 {
		return Err(Error::malformed(
			"filter",
			format!(
				"filter needs 2 parameters: a comparison and a function, but found {}",
				params.len()
			),
		));
	}

	let filter = params[0]
		.trim_matches('"')
		.parse::<FilterValue>()
		.map_err(|e| Error::malformed("filter", e))?;
	query.order.prepend(Operation::FilterValue)?;
	query.filter = Some(filter);
	Ok(params.swap_remove(1))
}

/// Name of the function an expression calls, if it is a call at all.
fn function_name(exp: &str) -> Option<&str> {
	let end = exp.find('(')?;
	let name = &exp[..end];
	if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
		return None;
	}
	Some(name)
}

/// Parameters of a call to `func`.
fn call_params(func: &'static str, exp: &str) -> Result<Vec<String>, Error> {
	let rest = exp
		.trim_start()
		.strip_prefix(func)
		.ok_or_else(|| Error::malformed(func, format!("expected a call to {}", func)))?;
	parse_params(func, rest)
}

/// Splits `(a,b(c,d),"e,f")` into its top-level parameters.
///
/// Commas inside nested parentheses or double quotes do not split. The closing
/// parenthesis matching the first one must end the string.
fn parse_params(func: &'static str, exp: &str) -> Result<Vec<String>, Error> {
	let exp = exp.trim();
	if !exp.starts_with('(') {
		return Err(Error::malformed(
			func,
			format!("expected '(' after {}", func),
		));
	}

	let mut params = Vec::new();
	let mut current = String::new();
	let mut depth = 0usize;
	let mut in_quotes = false;
	let mut closed_at = None;
	for (i, c) in exp.char_indices() {
		match c {
			'"' => {
				in_quotes = !in_quotes;
				current.push(c);
			}
			_ if in_quotes => current.push(c),
			'(' => {
				if depth > 0 {
					current.push(c);
				}
				depth += 1;
			}
			')' => {
				depth = depth.checked_sub(1).ok_or_else(|| {
					Error::malformed(func, "unbalanced parentheses")
				})?;
				if depth == 0 {
					closed_at = Some(i);
					break;
				}
				current.push(c);
			}
			',' if depth == 1 => {
				params.push(String::from(current.trim()));
				current.clear();
			}
			_ => current.push(c),
		}
	}

	match closed_at {
		Some(i) if i == exp.len() - 1 => {}
		Some(_) => {
			return Err(Error::malformed(
				func,
				"unexpected characters after closing parenthesis",
			));
		}
		None => {
			return Err(Error::malformed(func, "unbalanced parentheses"));
		}
	}

	let last = current.trim();
	if !last.is_empty() || !params.is_empty() {
		params.push(String::from(last));
	}
	Ok(params)
}
