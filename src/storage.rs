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


//! Storage backends that supply raw points to the plot executor

use serde::Deserialize;
use std::{
	collections::HashMap,
	fs,
	io,
	path::Path,
};

use crate::{
	error::Error,
	types::Point,
};

/// Bytes accounted for each point read by `MemoryStorage`
pub const POINT_SIZE: u32 = 16;

/// Parameters of a raw series fetch
#[derive(Debug, Clone)]
pub struct SeriesRequest<'a> {
	pub keyspace: &'a str,
	pub keys: &'a [String],
	pub start: i64,
	pub end: i64,
	/// Timestamps are in milliseconds rather than seconds
	pub ms: bool,
	/// Ignore `max_bytes`
	pub allow_full_fetch: bool,
	pub max_bytes: u32,
	pub keyset: &'a str,
}

/// Raw points of each requested series, by series key.
pub type SeriesMap = HashMap<String, Vec<Point>>;

/// Source of raw points.
pub trait Storage {
	/// Fetches the points of every requested series in `[start, end]`, sorted by timestamp.
	///
	/// Must fail with `Error::ByteCeilingExceeded` rather than return a truncated read when
	/// `max_bytes` is exceeded and `allow_full_fetch` is not set.
	fn get_series(&self, request: &SeriesRequest) -> Result<(SeriesMap, u32), Error>;
}

/// Storage backed by in-memory maps of keyspace to series key to points.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct MemoryStorage {
	keyspaces: HashMap<String, HashMap<String, Vec<Point>>>,
}
impl MemoryStorage {
	pub fn new() -> Self {
		Default::default()
	}

	/// Stores the points of a series, keeping them sorted by timestamp.
	pub fn insert(&mut self, keyspace: &str, key: &str, mut points: Vec<Point>) {
		points.sort_by_key(|p| p.timestamp);
		points.dedup_by_key(|p| p.timestamp);
		self.keyspaces
			.entry(String::from(keyspace))
			.or_insert_with(HashMap::new)
			.insert(String::from(key), points);
	}

	/// Loads storage from a JSON file of `{keyspace: {series key: [points]}}`.
	pub fn read(path: &Path) -> Result<Self, String> {
		let reader = io::BufReader::new(
			fs::File::open(path)
				.map_err(|e| format!("Could not read {}: {}", path.display(), e))?,
		);
		let loaded: MemoryStorage = serde_json::from_reader(reader)
			.map_err(|e| format!("Could not parse {}: {}", path.display(), e))?;

		let mut storage = Self::new();
		for (keyspace, series) in loaded.keyspaces {
			for (key, points) in series {
				storage.insert(&keyspace, &key, points);
			}
		}
		Ok(storage)
	}
}
impl Storage for MemoryStorage {
	fn get_series(&self, request: &SeriesRequest) -> Result<(SeriesMap, u32), Error> {
		let series = self.keyspaces.get(request.keyspace);

		let mut result = SeriesMap::new();
		let mut bytes: u32 = 0;
		for key in request.keys {
			let points = series
				.and_then(|s| s.get(key))
				.map(|points| {
					points
						.iter()
						.filter(|p| p.timestamp >= request.start && p.timestamp <= request.end)
						.copied()
						.collect::<Vec<_>>()
				})
				.unwrap_or_default();

			bytes = bytes.saturating_add((points.len() as u32).saturating_mul(POINT_SIZE));
			if !request.allow_full_fetch && bytes > request.max_bytes {
				return Err(Error::ByteCeilingExceeded {
					limit: request.max_bytes,
					read: bytes,
				});
			}
			result.insert(key.clone(), points);
		}
		Ok((result, bytes))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn request<'a>(keys: &'a [String], max_bytes: u32, allow_full_fetch: bool) -> SeriesRequest<'a> {
		SeriesRequest {
			keyspace: "one_day",
			keys,
			start: 10,
			end: 30,
			ms: false,
			allow_full_fetch,
			max_bytes,
			keyset: "ks",
		}
	}

	fn storage() -> MemoryStorage {
		let mut storage = MemoryStorage::new();
		storage.insert(
			"one_day",
			"a",
			vec![
				Point::new(30, 3.),
				Point::new(0, 0.),
				Point::new(10, 1.),
				Point::new(20, 2.),
				Point::new(40, 4.),
			],
		);
		storage
	}

	#[test]
	fn filters_range_and_sorts() {
		let keys = vec![String::from("a"), String::from("missing")];
		let (series, bytes) = storage().get_series(&request(&keys, 1000, false)).unwrap();
		assert_eq!(
			series["a"],
			vec![Point::new(10, 1.), Point::new(20, 2.), Point::new(30, 3.)]
		);
		assert!(series["missing"].is_empty());
		assert_eq!(bytes, 3 * POINT_SIZE);
	}

	#[test]
	fn byte_ceiling() {
		let keys = vec![String::from("a")];
		assert_eq!(
			storage().get_series(&request(&keys, 20, false)),
			Err(Error::ByteCeilingExceeded {
				limit: 20,
				read: 48
			})
		);
		let (_, bytes) = storage().get_series(&request(&keys, 20, true)).unwrap();
		assert_eq!(bytes, 48);
	}

	#[test]
	fn from_json() {
		let storage: MemoryStorage = serde_json::from_str(
			r#"{"one_day": {"a": [{"timestamp": 10, "value": 1.5}]}}"#,
		)
		.unwrap();
		let keys = vec![String::from("a")];
		let (series, _) = storage.get_series(&request(&keys, 1000, false)).unwrap();
		assert_eq!(series["a"], vec![Point::new(10, 1.5)]);
	}
}
