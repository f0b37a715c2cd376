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


//! Cache-aside lookups for keyspace and series existence

use dashmap::DashMap;

use crate::error::Error;

/// Bucket holding known keyspaces
pub const KEYSPACE_BUCKET: &str = "keyspace";

/// Key-value cache storing raw bytes under a bucket and key.
pub trait CacheBackend: Send + Sync {
	fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, Error>;

	fn put(&self, bucket: &str, key: &str, value: Vec<u8>) -> Result<(), Error>;
}

/// In-process `CacheBackend`
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
	entries: DashMap<(String, String), Vec<u8>>,
}
impl MemoryCacheBackend {
	pub fn new() -> Self {
		Default::default()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}
impl CacheBackend for MemoryCacheBackend {
	fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, Error> {
		Ok(self
			.entries
			.get(&(String::from(bucket), String::from(key)))
			.map(|v| v.value().clone()))
	}

	fn put(&self, bucket: &str, key: &str, value: Vec<u8>) -> Result<(), Error> {
		self.entries
			.insert((String::from(bucket), String::from(key)), value);
		Ok(())
	}
}

/// Read-through existence cache in front of a slower check.
///
/// Only positive answers are cached, so a series or keyspace created after a miss is
/// found on the next lookup.
pub struct SeriesCache<B> {
	backend: B,
}
impl<B: CacheBackend> SeriesCache<B> {
	pub fn new(backend: B) -> Self {
		Self { backend }
	}

	pub fn backend(&self) -> &B {
		&self.backend
	}

	/// Whether `key` exists, asking `check` on a cache miss.
	///
	/// A `NotFound` from `check` counts as a negative answer. Other errors are returned.
	pub fn lookup<F>(&self, bucket: &str, key: &str, check: F) -> Result<bool, Error>
	where
		F: FnOnce(&str) -> Result<bool, Error>,
	{
		if self.backend.get(bucket, key)?.is_some() {
			return Ok(true);
		}

		let found = match check(key) {
			Ok(found) => found,
			Err(Error::NotFound(_)) => false,
			Err(e) => return Err(e),
		};
		if found {
			trace!("Caching {}/{}", bucket, key);
			self.backend.put(bucket, key, Vec::new())?;
		}
		Ok(found)
	}

	/// Value stored for a keyspace, asking `check` on a cache miss.
	pub fn get_keyspace<F>(&self, key: &str, check: F) -> Result<Option<String>, Error>
	where
		F: FnOnce(&str) -> Result<Option<String>, Error>,
	{
		if let Some(value) = self.backend.get(KEYSPACE_BUCKET, key)? {
			let value = String::from_utf8(value)
				.map_err(|e| Error::CacheFailure(format!("invalid keyspace value: {}", e)))?;
			return Ok(Some(value));
		}

		let value = match check(key) {
			Ok(Some(value)) => value,
			Ok(None) | Err(Error::NotFound(_)) => return Ok(None),
			Err(e) => return Err(e),
		};
		self.backend
			.put(KEYSPACE_BUCKET, key, value.clone().into_bytes())?;
		Ok(Some(value))
	}
}
