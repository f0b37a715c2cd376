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


//! Transformations over ordered point sequences.
//!
//! Every function here is pure and accepts empty input. Points carrying a
//! `NAN` value are empty slots and never contribute to an aggregate.

use std::convert::TryFrom;

use crate::{
	query::{
		DownsampleOptions,
		FillPolicy,
		FilterValue,
		RateOptions,
	},
	types::{
		AggregatedPoint,
		Aggregator,
		Point,
	},
};

/// Most empty buckets a single `downsample` call fills in
pub const MAX_FILL_POINTS: usize = 1 << 20;

/// Buckets points into windows of the option's period, aligned on `start`.
///
/// Each non-empty bucket is reduced with the option's aggregator and stamped with the
/// bucket's start time. Buckets without values between `start` and `end` are emitted
/// according to the fill policy; `FillPolicy::None` omits them unless `keep_empties`
/// is set, in which case they become empty slots. At most `MAX_FILL_POINTS` buckets
/// are filled, and filling stops at the last bucket start representable as an `i64`.
pub fn downsample(
	options: &DownsampleOptions,
	keep_empties: bool,
	start: i64,
	end: i64,
	ms: bool,
	points: &[Point],
) -> Vec<Point> {
	if points.is_empty() {
		return Vec::new();
	}
	let interval = options.period.interval(ms);

	let fill_value = match options.fill {
		FillPolicy::None if !keep_empties => None,
		FillPolicy::None | FillPolicy::Null => Some(std::f64::NAN),
		FillPolicy::Zero => Some(0.),
	};

	let mut buckets: Vec<(i64, AggregatedPoint)> = Vec::new();
	for point in points {
		let bucket = match bucket_start(start, interval, point.timestamp) {
			Some(bucket) => bucket,
			None => continue,
		};
		if buckets.last().map_or(true, |&(last, _)| last != bucket) {
			buckets.push((bucket, AggregatedPoint::new()));
		}
		if point.is_empty() {
			continue;
		}
		if let Some((_, agg)) = buckets.last_mut() {
			agg.add(point.value);
		}
	}

	let mut result = Vec::with_capacity(buckets.len());
	let mut filler = fill_value.map(|value| Filler {
		value,
		interval,
		remaining: MAX_FILL_POINTS,
		exhausted: false,
	});
	let mut next = Some(start);
	for (bucket, agg) in buckets {
		if let Some(filler) = filler.as_mut() {
			filler.fill(&mut result, next, bucket, false);
		}
		match (agg.value(options.aggregator), fill_value) {
			(Some(value), _) if agg.count > 0 => result.push(Point::new(bucket, value)),
			(_, Some(fill)) => result.push(Point::new(bucket, fill)),
			_ => {}
		}
		next = bucket.checked_add(interval);
	}
	if let Some(filler) = filler.as_mut() {
		filler.fill(&mut result, next, end, true);
	}
	result
}

/// Start of the bucket holding `timestamp`, if it fits in an `i64`.
fn bucket_start(start: i64, interval: i64, timestamp: i64) -> Option<i64> {
	let (start, interval) = (i128::from(start), i128::from(interval));
	let bucket = start + (i128::from(timestamp) - start).div_euclid(interval) * interval;
	i64::try_from(bucket).ok()
}

/// Empty bucket emitter shared by the gaps of one `downsample` call
struct Filler {
	value: f64,
	interval: i64,
	/// Buckets left to fill before giving up
	remaining: usize,
	exhausted: bool,
}
impl Filler {
	/// Fills buckets from `from` up to `to`, which is included only with `inclusive`.
	fn fill(&mut self, result: &mut Vec<Point>, from: Option<i64>, to: i64, inclusive: bool) {
		let mut next = from;
		while let Some(timestamp) = next {
			if timestamp > to || (timestamp == to && !inclusive) {
				break;
			}
			if self.remaining == 0 {
				if !self.exhausted {
					warn!("Downsample fill limit of {} points reached", MAX_FILL_POINTS);
					self.exhausted = true;
				}
				return;
			}
			self.remaining -= 1;
			result.push(Point::new(timestamp, self.value));
			next = timestamp.checked_add(self.interval);
		}
	}
}

/// Folds points sharing a timestamp across `series_count` series.
///
/// `points` must be sorted by timestamp. A timestamp where fewer than `series_count`
/// series have a value is dropped, or kept as an empty slot with `keep_empties`.
pub fn merge(
	aggregator: Aggregator,
	keep_empties: bool,
	series_count: usize,
	points: &[Point],
) -> Vec<Point> {
	let mut result = Vec::new();
	let mut index = 0;
	while index < points.len() {
		let timestamp = points[index].timestamp;
		let group_end = points[index..]
			.iter()
			.position(|p| p.timestamp != timestamp)
			.map(|offset| index + offset)
			.unwrap_or(points.len());

		let agg = AggregatedPoint::from_values(
			points[index..group_end]
				.iter()
				.filter(|p| !p.is_empty())
				.map(|p| p.value),
		);
		index = group_end;

		if (agg.count as usize) < series_count || agg.count == 0 {
			if keep_empties {
				result.push(Point::new(timestamp, std::f64::NAN));
			}
			continue;
		}
		if let Some(value) = agg.value(aggregator) {
			result.push(Point::new(timestamp, value));
		}
	}
	result
}

/// Replaces each point after the first with its change per timestamp unit.
///
/// The first point has no predecessor and is dropped.
pub fn rate(options: &RateOptions, points: &[Point]) -> Vec<Point> {
	points
		.windows(2)
		.filter_map(|pair| {
			let (prev, cur) = (pair[0], pair[1]);
			let elapsed = cur.timestamp - prev.timestamp;
			if elapsed <= 0 {
				return None;
			}
			if prev.is_empty() || cur.is_empty() {
				return Some(Point::new(cur.timestamp, std::f64::NAN));
			}

			let mut delta = cur.value - prev.value;
			if options.counter && delta < 0. {
				match options.counter_max {
					Some(max) => delta = max - prev.value + cur.value,
					None => return Some(Point::new(cur.timestamp, options.reset_value)),
				}
			}
			Some(Point::new(cur.timestamp, delta / elapsed as f64))
		})
		.collect()
}

/// Keeps the points whose value satisfies the filter, in order.
pub fn filter_values(filter: &FilterValue, points: &[Point]) -> Vec<Point> {
	points
		.iter()
		.filter(|p| filter.matches(p.value))
		.copied()
		.collect()
}

/// Subsamples to at most `limit` points with a uniform stride.
///
/// The first and last points are kept whenever `limit` is at least 2.
pub fn basic(limit: usize, points: &[Point]) -> Vec<Point> {
	let len = points.len();
	if len <= limit {
		return points.to_vec();
	}
	match limit {
		0 => Vec::new(),
		1 => vec![points[0]],
		_ => (0..limit)
			.map(|i| {
				// Rounded so the last index lands exactly on len - 1
				let index = (i * (len - 1) + (limit - 1) / 2) / (limit - 1);
				points[index]
			})
			.collect(),
	}
}
