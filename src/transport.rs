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


//! Sinks for flattened points

use crossbeam_channel as cbc;
use serde::{
	Deserialize,
	Serialize,
};
use std::collections::BTreeMap;

use crate::{
	error::Error,
	flattener::FlattenedPoint,
	types::Aggregator,
};

/// Destination of the points a `Flattener` emits.
///
/// Converting and emitting are separate steps so a failure of either can be reported
/// against the entry it came from.
pub trait Transport<K, C>: Send + Sync {
	type Item;

	/// Converts a flattened point into the item sent downstream.
	fn to_channel_item(&self, point: FlattenedPoint<K, C>) -> Result<Self::Item, Error>;

	/// Sends an item downstream. Must not block.
	fn emit(&self, item: Self::Item) -> Result<(), Error>;
}

/// Series identity carried through the flattener for `ChannelTransport`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointContext {
	pub metric: String,
	#[serde(default)]
	pub tags: BTreeMap<String, String>,
}
impl PointContext {
	/// Series key in `metric{k=v,...}` form, tags sorted by name.
	pub fn series_key(&self) -> String {
		let tags = self
			.tags
			.iter()
			.map(|(k, v)| format!("{}={}", k, v))
			.collect::<Vec<_>>()
			.join(",");
		format!("{}{{{}}}", self.metric, tags)
	}
}

/// Helper struct for serializing into OpenTSDB json format
#[derive(Debug, Serialize)]
struct OpenTsdbEntry<'a> {
	pub metric: &'a str,
	pub timestamp: i64,
	pub value: serde_json::Value,
	pub tags: &'a BTreeMap<String, String>,
	pub aggregator: &'static str,
}

fn opentsdb_aggregator(op: Aggregator) -> &'static str {
	match op {
		Aggregator::Avg => "AVG",
		Aggregator::Sum => "SUM",
		Aggregator::Count => "COUNT",
		Aggregator::Max => "MAX",
		Aggregator::Min => "MIN",
	}
}

/// Transport serializing points to JSON and sending them into a bounded channel.
pub struct ChannelTransport {
	sender: cbc::Sender<Vec<u8>>,
}
impl ChannelTransport {
	pub fn new(sender: cbc::Sender<Vec<u8>>) -> Self {
		Self { sender }
	}

	/// Creates a transport and the receiving end of its channel.
	pub fn bounded(capacity: usize) -> (Self, cbc::Receiver<Vec<u8>>) {
		let (sender, receiver) = cbc::bounded(capacity);
		(Self::new(sender), receiver)
	}
}
impl<K> Transport<K, PointContext> for ChannelTransport {
	type Item = Vec<u8>;

	fn to_channel_item(&self, point: FlattenedPoint<K, PointContext>) -> Result<Vec<u8>, Error> {
		let entry = OpenTsdbEntry {
			metric: &point.context.metric,
			timestamp: point.timestamp,
			value: if point.operation == Aggregator::Count {
				serde_json::Value::from(point.value as u64)
			} else {
				serde_json::Value::from(point.value)
			},
			tags: &point.context.tags,
			aggregator: opentsdb_aggregator(point.operation),
		};
		serde_json::to_vec(&entry).map_err(|e| Error::TransportFailure(e.to_string()))
	}

	fn emit(&self, item: Vec<u8>) -> Result<(), Error> {
		self.sender.try_send(item).map_err(|e| match e {
			cbc::TrySendError::Full(_) => Error::TransportFailure(String::from("channel full")),
			cbc::TrySendError::Disconnected(_) => {
				Error::TransportFailure(String::from("channel disconnected"))
			}
		})
	}
}
