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


//! Plot executor, the part that fetches raw series and runs the operator pipeline over them.

use std::collections::HashMap;

use crate::{
	error::Error,
	operations,
	query::{
		DataOperations,
		Operation,
		OperatorList,
	},
	storage::{
		SeriesRequest,
		Storage,
	},
	types::{
		Point,
		TimeSeries,
	},
};

/// Operator order of a query split around the cross-series merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
	/// Operators run on each series before merging
	pub per_series: Vec<Operation>,
	/// Whether the series are merged
	pub merge: bool,
	/// Operators run on the merged series
	pub post_merge: Vec<Operation>,
}
impl ExecutionPlan {
	/// Splits an operator list at its `aggregation` marker.
	///
	/// Without the marker every operator runs per series and nothing is merged.
	pub fn new(order: &OperatorList) -> Self {
		let mut plan = Self {
			per_series: Vec::new(),
			merge: false,
			post_merge: Vec::new(),
		};
		for &op in order.iter() {
			match op {
				Operation::Aggregation => plan.merge = true,
				_ if plan.merge => plan.post_merge.push(op),
				_ => plan.per_series.push(op),
			}
		}
		plan
	}
}

/// Settings for the plot executor
#[derive(Debug, Clone)]
pub struct PlotSettings {
	/// Storage keyspace for each TTL bucket, in days
	pub keyspace_ttl_map: HashMap<i32, String>,
	/// Byte ceiling for one storage fetch
	pub max_bytes_limit: u32,
}

/// One plot query
#[derive(Debug, Clone)]
pub struct PlotQuery<'a> {
	pub ttl: i32,
	pub keys: &'a [String],
	pub start: i64,
	pub end: i64,
	pub opers: &'a DataOperations,
	/// Timestamps are in milliseconds rather than seconds
	pub ms: bool,
	/// Keep empty slots instead of dropping them
	pub keep_empties: bool,
	/// Skip the byte ceiling
	pub allow_full_fetch: bool,
	pub keyset: &'a str,
}

/// Runs plot queries against a storage backend.
///
/// Holds no per-query state, so one `Plot` can serve concurrent queries.
pub struct Plot<S: Storage> {
	settings: PlotSettings,
	storage: S,
}
impl<S: Storage> Plot<S> {
	pub fn new(settings: PlotSettings, storage: S) -> Self {
		Self { settings, storage }
	}

	pub fn storage(&self) -> &S {
		&self.storage
	}

	/// Fetches the requested series and runs the query's operators over them.
	///
	/// Returns the resulting series and the number of bytes read from storage.
	/// Storage errors are returned as they are, without partial results.
	pub fn get_time_series(&self, query: &PlotQuery) -> Result<(TimeSeries, u32), Error> {
		let keyspace = self
			.settings
			.keyspace_ttl_map
			.get(&query.ttl)
			.ok_or_else(|| Error::NotFound(format!("invalid ttl found: {}", query.ttl)))?;

		let plan = ExecutionPlan::new(&query.opers.order);
		debug!(
			"Querying {} series from keyspace {}, plan {:?}",
			query.keys.len(),
			keyspace,
			plan
		);

		let (series, num_bytes) = self.get_series(keyspace, query, &plan)?;

		let mut result = TimeSeries::default();
		let mut num_non_empty = 0;
		for ts in series {
			if ts.count > 0 {
				num_non_empty += 1;
				result.data.extend(ts.data);
				result.total += ts.total;
			}
		}

		if plan.merge {
			if num_non_empty > 1 {
				result.data.sort_by_key(|p| p.timestamp);
				result.data = operations::merge(
					query.opers.merge,
					query.keep_empties,
					num_non_empty,
					&result.data,
				);
			}
			for &op in plan.post_merge.iter() {
				result.data = apply(op, query, result.total, result.data);
			}
		}

		let downsample = &query.opers.downsample;
		if downsample.point_limit && result.data.len() > downsample.total_points {
			result.data = operations::basic(downsample.total_points, &result.data);
		}

		result.count = result.data.len();
		debug!(
			"Query read {} bytes, {} raw points, returning {} points",
			num_bytes, result.total, result.count
		);
		Ok((result, num_bytes))
	}

	/// Fetches raw series and runs the per-series part of the plan over each one.
	///
	/// Series come back ordered by key.
	fn get_series(
		&self,
		keyspace: &str,
		query: &PlotQuery,
		plan: &ExecutionPlan,
	) -> Result<(Vec<TimeSeries>, u32), Error> {
		let request = SeriesRequest {
			keyspace,
			keys: query.keys,
			start: query.start,
			end: query.end,
			ms: query.ms,
			allow_full_fetch: query.allow_full_fetch,
			max_bytes: self.settings.max_bytes_limit,
			keyset: query.keyset,
		};
		let (raw, num_bytes) = self.storage.get_series(&request)?;

		let mut raw = raw.into_iter().collect::<Vec<_>>();
		raw.sort_by(|a, b| a.0.cmp(&b.0));

		let series = raw
			.into_iter()
			.map(|(_key, points)| {
				let total = points.len();
				let mut data = points;
				for &op in plan.per_series.iter() {
					data = apply(op, query, total, data);
				}
				TimeSeries {
					count: data.len(),
					total,
					data,
				}
			})
			.collect();
		Ok((series, num_bytes))
	}
}

/// Runs one enabled operator over a series. `total` is the number of raw points behind it.
fn apply(op: Operation, query: &PlotQuery, total: usize, data: Vec<Point>) -> Vec<Point> {
	let opers = query.opers;
	match op {
		Operation::Downsample if opers.downsample.enabled && total > 0 => {
			match opers.downsample.options.as_ref() {
				Some(options) => operations::downsample(
					options,
					query.keep_empties,
					query.start,
					query.end,
					query.ms,
					&data,
				),
				None => data,
			}
		}
		Operation::Rate if opers.rate.enabled => operations::rate(&opers.rate.options, &data),
		Operation::FilterValue if opers.filter_value.enabled => {
			match opers.filter_value.filter.as_ref() {
				Some(filter) => operations::filter_values(filter, &data),
				None => data,
			}
		}
		_ => data,
	}
}
