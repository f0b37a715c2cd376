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


//! Ingest-time flattener.
//!
//! Folds the raw points of each series key into one aggregated point per flush cycle,
//! then hands the result to a `Transport`.

use crossbeam_channel::{
	self as cbc,
	select,
};
use dashmap::{
	mapref::entry::Entry,
	DashMap,
};
use parking_lot::{
	Mutex,
	RwLock,
};
use std::{
	fmt::Debug,
	hash::Hash,
	sync::{
		atomic,
		Arc,
	},
	thread,
	time::{
		Duration,
		Instant,
	},
};

use crate::{
	error::Error,
	transport::Transport,
	types::{
		Aggregator,
		FlatOperation,
	},
};

/// Settings for a `Flattener`
#[derive(Debug, Clone)]
pub struct FlattenerSettings {
	/// Number of idle value buffers kept for reuse
	pub pool_size: usize,
	/// Initial capacity of a new value buffer
	pub buffer_capacity: usize,
}
impl Default for FlattenerSettings {
	fn default() -> Self {
		Self {
			pool_size: 1024,
			buffer_capacity: 16,
		}
	}
}

/// Bounded pool of value buffers.
///
/// Buffers released while the pool is full are dropped.
pub struct BufferPool {
	sender: cbc::Sender<Vec<f64>>,
	receiver: cbc::Receiver<Vec<f64>>,
	buffer_capacity: usize,
}
impl BufferPool {
	pub fn new(pool_size: usize, buffer_capacity: usize) -> Self {
		let (sender, receiver) = cbc::bounded(pool_size);
		Self {
			sender,
			receiver,
			buffer_capacity,
		}
	}

	/// Takes an empty buffer from the pool, allocating one if the pool is empty.
	pub fn acquire(&self) -> Vec<f64> {
		self.receiver
			.try_recv()
			.unwrap_or_else(|_| Vec::with_capacity(self.buffer_capacity))
	}

	pub fn release(&self, mut buffer: Vec<f64>) {
		buffer.clear();
		if self.sender.try_send(buffer).is_err() {
			trace!("Buffer pool full, dropping buffer");
		}
	}

	/// Number of idle buffers in the pool
	pub fn len(&self) -> usize {
		self.receiver.len()
	}

	pub fn is_empty(&self) -> bool {
		self.receiver.is_empty()
	}
}

/// Accumulated values of one series key.
///
/// The metadata of the point that created the entry is kept; later points only add values.
pub struct FlattenerEntry<C> {
	operation: u8,
	timestamp: i64,
	context: C,
	values: Mutex<Vec<f64>>,
}
impl<C> FlattenerEntry<C> {
	pub fn new(operation: u8, timestamp: i64, context: C, values: Vec<f64>) -> Self {
		Self {
			operation,
			timestamp,
			context,
			values: Mutex::new(values),
		}
	}

	pub fn push(&self, value: f64) {
		self.values.lock().push(value);
	}

	pub fn len(&self) -> usize {
		self.values.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.values.lock().is_empty()
	}

	pub fn timestamp(&self) -> i64 {
		self.timestamp
	}

	pub fn context(&self) -> &C {
		&self.context
	}

	/// Computes the final value of the entry.
	///
	/// The operation code is only validated here, not when values are added.
	/// Min and max fold from the first value, so a NaN first value stays the result.
	pub fn flatten(&self) -> Result<(FlatOperation, f64), Error> {
		let operation = Aggregator::from_code(self.operation)?;
		let values = self.values.lock();
		let (&first, rest) = values.split_first().ok_or(Error::EmptyAccumulation)?;
		let value = match operation {
			Aggregator::Avg => values.iter().sum::<f64>() / values.len() as f64,
			Aggregator::Sum => values.iter().sum(),
			Aggregator::Count => values.len() as f64,
			Aggregator::Min => rest
				.iter()
				.fold(first, |acc, &v| if v < acc { v } else { acc }),
			Aggregator::Max => rest
				.iter()
				.fold(first, |acc, &v| if v > acc { v } else { acc }),
		};
		Ok((operation, value))
	}
}

/// One aggregated point, ready for transport
#[derive(Debug, Clone, PartialEq)]
pub struct FlattenedPoint<K, C> {
	pub key: K,
	pub operation: FlatOperation,
	pub timestamp: i64,
	pub value: f64,
	pub context: C,
}

/// Counters added to by the flattener.
///
/// The flush loop reads and resets them after each cycle.
#[derive(Debug, Default)]
pub struct FlattenerStats {
	/// Number of points added
	pub added: atomic::AtomicUsize,
	/// Number of entries emitted to the transport
	pub flushed: atomic::AtomicUsize,
	/// Number of entries dropped because flattening or transport failed
	pub failed: atomic::AtomicUsize,
}
impl FlattenerStats {
	/// Reads and resets all counters.
	pub fn take(&self) -> StatsSnapshot {
		StatsSnapshot {
			added: self.added.swap(0, atomic::Ordering::Relaxed),
			flushed: self.flushed.swap(0, atomic::Ordering::Relaxed),
			failed: self.failed.swap(0, atomic::Ordering::Relaxed),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
	pub added: usize,
	pub flushed: usize,
	pub failed: usize,
}

/// Result of one flush cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
	pub flushed: usize,
	pub failed: usize,
}

/// Concurrent accumulation map of series key to `FlattenerEntry`.
///
/// Adds to different keys never contend on a global lock. Adds to one key serialize on the
/// entry's own lock, taken while the map shard is read-locked, so removing an entry waits
/// for in-flight adds to it and no value is lost or counted twice.
pub struct Flattener<K, C, T> {
	entries: DashMap<K, FlattenerEntry<C>>,
	transport: T,
	pool: BufferPool,
	stats: FlattenerStats,
	/// Cleared once the flattener is stopped
	open: RwLock<bool>,
}
impl<K, C, T> Flattener<K, C, T>
where
	K: Eq + Hash + Clone + Debug,
	T: Transport<K, C>,
{
	pub fn new(settings: FlattenerSettings, transport: T) -> Self {
		Self {
			entries: DashMap::new(),
			transport,
			pool: BufferPool::new(settings.pool_size, settings.buffer_capacity),
			stats: FlattenerStats::default(),
			open: RwLock::new(true),
		}
	}

	/// Adds a point to the entry of `key`, creating the entry if there is none.
	///
	/// `operation`, `timestamp` and `context` only matter for the point that creates the entry.
	/// Fails with `Error::Closed` once the flattener has been stopped.
	pub fn add<O: Into<u8>>(
		&self,
		key: K,
		operation: O,
		timestamp: i64,
		value: f64,
		context: C,
	) -> Result<(), Error> {
		let open = self.open.read();
		if !*open {
			return Err(Error::Closed);
		}

		let appended = match self.entries.get(&key) {
			Some(entry) => {
				entry.push(value);
				true
			}
			None => false,
		};
		if !appended {
			match self.entries.entry(key) {
				Entry::Occupied(entry) => entry.get().push(value),
				Entry::Vacant(entry) => {
					let mut values = self.pool.acquire();
					values.push(value);
					entry.insert(FlattenerEntry::new(operation.into(), timestamp, context, values));
				}
			}
		}

		self.stats.added.fetch_add(1, atomic::Ordering::Relaxed);
		Ok(())
	}

	/// Removes an entry from the map. Adds to its key afterwards start a new entry.
	pub fn remove_entry(&self, key: &K) -> Option<(K, FlattenerEntry<C>)> {
		self.entries.remove(key)
	}

	/// Flattens an entry removed from the map and emits it.
	///
	/// The entry's buffer goes back to the pool whatever the outcome. Failures are logged,
	/// counted, and the entry is dropped. Returns whether the point was emitted.
	pub fn process_map_entry(&self, key: K, entry: FlattenerEntry<C>) -> bool {
		let flattened = entry.flatten();
		let FlattenerEntry {
			timestamp,
			context,
			values,
			..
		} = entry;
		self.pool.release(values.into_inner());

		let (operation, value) = match flattened {
			Ok(v) => v,
			Err(e) => {
				error!("Could not flatten entry {:?}: {}", key, e);
				self.stats.failed.fetch_add(1, atomic::Ordering::Relaxed);
				return false;
			}
		};

		let name = key.clone();
		let point = FlattenedPoint {
			key,
			operation,
			timestamp,
			value,
			context,
		};
		let res = self
			.transport
			.to_channel_item(point)
			.and_then(|item| self.transport.emit(item));
		match res {
			Ok(()) => {
				self.stats.flushed.fetch_add(1, atomic::Ordering::Relaxed);
				true
			}
			Err(e) => {
				error!("Could not emit entry {:?}: {}", name, e);
				self.stats.failed.fetch_add(1, atomic::Ordering::Relaxed);
				false
			}
		}
	}

	/// Removes and processes every entry currently in the map.
	pub fn flush_all(&self) -> FlushSummary {
		let keys = self
			.entries
			.iter()
			.map(|entry| entry.key().clone())
			.collect::<Vec<_>>();

		let mut summary = FlushSummary::default();
		for key in keys {
			if let Some((key, entry)) = self.remove_entry(&key) {
				if self.process_map_entry(key, entry) {
					summary.flushed += 1;
				} else {
					summary.failed += 1;
				}
			}
		}
		summary
	}

	/// Closes the flattener to new points and flushes what is left.
	pub fn stop(&self) -> FlushSummary {
		*self.open.write() = false;
		self.flush_all()
	}

	pub fn is_open(&self) -> bool {
		*self.open.read()
	}

	/// Number of series keys currently accumulating
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn stats(&self) -> &FlattenerStats {
		&self.stats
	}

	pub fn pool(&self) -> &BufferPool {
		&self.pool
	}

	pub fn transport(&self) -> &T {
		&self.transport
	}
}
impl<K, C, T> Flattener<K, C, T>
where
	K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
	C: Send + Sync + 'static,
	T: Transport<K, C> + 'static,
{
	/// Spawns a thread flushing the flattener every `interval`.
	pub fn start(this: Arc<Self>, interval: Duration) -> Result<FlattenerHandle<K, C, T>, String> {
		let (quit_sender, quit_receiver) = cbc::bounded(1);
		let flattener = Arc::clone(&this);
		let thread = thread::Builder::new()
			.name(String::from("flattener"))
			.spawn(move || {
				flattener.run(quit_receiver, cbc::tick(interval));
			})
			.map_err(|e| format!("Could not spawn flattener thread: {}", e))?;

		Ok(FlattenerHandle {
			flattener: this,
			quit_sender,
			thread,
		})
	}

	fn run(&self, quit_channel: cbc::Receiver<()>, ticker_channel: cbc::Receiver<Instant>) {
		loop {
			select! {
				recv(quit_channel) -> _ => { break; },
				recv(ticker_channel) -> _instant => {
					let summary = self.flush_all();
					let stats = self.stats.take();
					debug!(
						"Flushed {} entries ({} failed), {} points added since last cycle, {} pooled buffers",
						summary.flushed,
						summary.failed,
						stats.added,
						self.pool.len()
					);
				},
			}
		}
	}
}

/// Running flush thread of a `Flattener`
pub struct FlattenerHandle<K, C, T> {
	flattener: Arc<Flattener<K, C, T>>,
	quit_sender: cbc::Sender<()>,
	thread: thread::JoinHandle<()>,
}
impl<K, C, T> FlattenerHandle<K, C, T>
where
	K: Eq + Hash + Clone + Debug,
	T: Transport<K, C>,
{
	pub fn flattener(&self) -> &Arc<Flattener<K, C, T>> {
		&self.flattener
	}

	/// Stops the flush thread, closes the flattener and runs a final flush.
	pub fn stop(self) -> FlushSummary {
		let _ = self.quit_sender.send(());
		if self.thread.join().is_err() {
			error!("Flattener thread panicked");
		}
		self.flattener.stop()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::{
		seq::SliceRandom,
		thread_rng,
	};

	/// Records flattened points instead of sending them anywhere
	struct RecordingTransport {
		points: Mutex<Vec<FlattenedPoint<String, u32>>>,
		fail: bool,
	}
	impl Transport<String, u32> for RecordingTransport {
		type Item = FlattenedPoint<String, u32>;

		fn to_channel_item(
			&self,
			point: FlattenedPoint<String, u32>,
		) -> Result<Self::Item, Error> {
			Ok(point)
		}

		fn emit(&self, item: Self::Item) -> Result<(), Error> {
			if self.fail {
				return Err(Error::TransportFailure(String::from("sink down")));
			}
			self.points.lock().push(item);
			Ok(())
		}
	}

	fn flattener(fail: bool) -> Flattener<String, u32, RecordingTransport> {
		Flattener::new(
			FlattenerSettings::default(),
			RecordingTransport {
				points: Mutex::new(Vec::new()),
				fail,
			},
		)
	}

	fn emitted(f: &Flattener<String, u32, RecordingTransport>) -> Vec<FlattenedPoint<String, u32>> {
		let mut points = f.transport().points.lock().clone();
		points.sort_by(|a, b| a.key.cmp(&b.key));
		points
	}

	#[test]
	fn concurrent_adds() {
		let f = Arc::new(flattener(false));

		let mut values = (1..=400).map(|v| v as f64).collect::<Vec<_>>();
		values.shuffle(&mut thread_rng());
		let threads = values
			.chunks(50)
			.map(|chunk| {
				let f = Arc::clone(&f);
				let chunk = chunk.to_vec();
				thread::spawn(move || {
					for v in chunk {
						f.add(String::from("avg"), Aggregator::Avg, 10, v, 1).unwrap();
						f.add(String::from("count"), Aggregator::Count, 10, v, 2).unwrap();
						f.add(String::from("sum"), Aggregator::Sum, 10, v, 3).unwrap();
					}
				})
			})
			.collect::<Vec<_>>();
		for t in threads {
			t.join().unwrap();
		}

		assert_eq!(f.len(), 3);
		assert_eq!(f.stats().take().added, 1200);
		assert_eq!(
			f.flush_all(),
			FlushSummary {
				flushed: 3,
				failed: 0
			}
		);
		assert!(f.is_empty());

		let points = emitted(&f);
		assert_eq!(points.len(), 3);
		assert_eq!(points[0].key, "avg");
		assert_eq!(points[0].value, 200.5);
		assert_eq!(points[1].key, "count");
		assert_eq!(points[1].value, 400.);
		assert_eq!(points[1].context, 2);
		assert_eq!(points[2].key, "sum");
		assert_eq!(points[2].value, 80200.);
	}

	#[test]
	fn adds_during_flush_are_not_lost() {
		let f = Arc::new(flattener(false));
		let writer = {
			let f = Arc::clone(&f);
			thread::spawn(move || {
				for v in 0..2000 {
					f.add(String::from("k"), Aggregator::Count, 0, v as f64, 0).unwrap();
				}
			})
		};
		for _ in 0..20 {
			f.flush_all();
		}
		writer.join().unwrap();
		f.flush_all();

		let total = f.transport().points.lock().iter().map(|p| p.value).sum::<f64>();
		assert_eq!(total, 2000.);
	}

	#[test]
	fn first_point_metadata_wins() {
		let f = flattener(false);
		f.add(String::from("k"), Aggregator::Max, 100, 1., 7).unwrap();
		f.add(String::from("k"), Aggregator::Min, 200, 5., 8).unwrap();
		f.flush_all();
		assert_eq!(
			emitted(&f),
			vec![FlattenedPoint {
				key: String::from("k"),
				operation: Aggregator::Max,
				timestamp: 100,
				value: 5.,
				context: 7,
			}]
		);
	}

	#[test]
	fn unknown_operation_fails_at_flush() {
		let f = flattener(false);
		f.add(String::from("k"), 42u8, 0, 1., 0).unwrap();
		assert_eq!(f.len(), 1);

		let (key, entry) = f.remove_entry(&String::from("k")).unwrap();
		assert_eq!(entry.flatten(), Err(Error::UnsupportedOperation(42)));
		assert!(!f.process_map_entry(key, entry));
		assert!(emitted(&f).is_empty());
		assert_eq!(f.stats().take().failed, 1);
		assert_eq!(f.pool().len(), 1);
	}

	#[test]
	fn add_always_seeds() {
		let f = flattener(false);
		f.add(String::from("k"), Aggregator::Avg, 0, 3., 0).unwrap();
		let (_, entry) = f.remove_entry(&String::from("k")).unwrap();
		assert_eq!(entry.len(), 1);
		assert_eq!(entry.flatten(), Ok((Aggregator::Avg, 3.)));
	}

	#[test]
	fn flatten_operations() {
		let entry = |op: Aggregator, values: &[f64]| {
			FlattenerEntry::new(op.into(), 0, (), values.to_vec()).flatten()
		};
		let values = [4., 1., 7., 2.];
		assert_eq!(entry(Aggregator::Min, &values), Ok((Aggregator::Min, 1.)));
		assert_eq!(entry(Aggregator::Max, &values), Ok((Aggregator::Max, 7.)));
		assert_eq!(entry(Aggregator::Avg, &values), Ok((Aggregator::Avg, 3.5)));
		assert_eq!(entry(Aggregator::Sum, &values), Ok((Aggregator::Sum, 14.)));
		assert_eq!(entry(Aggregator::Count, &values), Ok((Aggregator::Count, 4.)));
		assert_eq!(entry(Aggregator::Min, &[5.]), Ok((Aggregator::Min, 5.)));
	}

	#[test]
	fn flatten_nan_first_value() {
		let nan_first = [std::f64::NAN, 1., 7.];
		for &op in [Aggregator::Min, Aggregator::Max].iter() {
			let entry = FlattenerEntry::new(op.into(), 0, (), nan_first.to_vec());
			match entry.flatten() {
				Ok((flat_op, value)) => {
					assert_eq!(flat_op, op);
					assert!(value.is_nan());
				}
				other => panic!("unexpected result: {:?}", other),
			}
		}

		// A later NaN never wins the comparison
		let entry = FlattenerEntry::new(Aggregator::Min.into(), 0, (), vec![3., std::f64::NAN, 2.]);
		assert_eq!(entry.flatten(), Ok((Aggregator::Min, 2.)));
	}

	#[test]
	fn min_entry_through_flush() {
		let f = flattener(false);
		for &v in [5., -2., 9.].iter() {
			f.add(String::from("k"), Aggregator::Min, 0, v, 0).unwrap();
		}
		f.flush_all();
		assert_eq!(emitted(&f)[0].value, -2.);
		assert_eq!(emitted(&f)[0].operation, Aggregator::Min);
	}

	#[test]
	fn empty_entry() {
		for &op in [Aggregator::Avg, Aggregator::Min, Aggregator::Sum].iter() {
			let entry = FlattenerEntry::new(op.into(), 0, (), Vec::new());
			assert_eq!(entry.flatten(), Err(Error::EmptyAccumulation));
		}
	}

	#[test]
	fn transport_failure_drops_entry() {
		let f = flattener(true);
		f.add(String::from("k"), Aggregator::Sum, 0, 1., 0).unwrap();
		assert_eq!(
			f.flush_all(),
			FlushSummary {
				flushed: 0,
				failed: 1
			}
		);
		assert!(f.is_empty());
		assert_eq!(f.flush_all(), FlushSummary::default());
		assert_eq!(f.pool().len(), 1);
	}

	#[test]
	fn pool_reuses_buffers() {
		let pool = BufferPool::new(1, 4);
		let mut buffer = pool.acquire();
		buffer.extend_from_slice(&[1., 2.]);
		pool.release(buffer);
		pool.release(Vec::new());
		assert_eq!(pool.len(), 1);
		let buffer = pool.acquire();
		assert!(buffer.is_empty());
		assert!(buffer.capacity() >= 2);
		assert!(pool.is_empty());
	}

	#[test]
	fn closed_after_stop() {
		let f = flattener(false);
		f.add(String::from("k"), Aggregator::Sum, 0, 1., 0).unwrap();
		assert_eq!(
			f.stop(),
			FlushSummary {
				flushed: 1,
				failed: 0
			}
		);
		assert!(!f.is_open());
		assert_eq!(
			f.add(String::from("k"), Aggregator::Sum, 0, 1., 0),
			Err(Error::Closed)
		);
		assert!(f.is_empty());
	}

	#[test]
	fn start_and_stop() {
		let f = Arc::new(flattener(false));
		let handle = Flattener::start(Arc::clone(&f), Duration::from_secs(3600)).unwrap();
		handle
			.flattener()
			.add(String::from("k"), Aggregator::Sum, 0, 2., 0)
			.unwrap();
		let summary = handle.stop();
		assert_eq!(summary.flushed, 1);
		assert_eq!(emitted(&f)[0].value, 2.);
		assert!(!f.is_open());
	}
}
