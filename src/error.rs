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


//! Error type shared by the query pipeline and the flattener.

use thiserror::Error;

/// Errors produced by the parser, the plot executor, the flattener and their collaborators.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
	/// A function was called with the wrong number or shape of parameters.
	#[error("{func}: {message}")]
	MalformedArguments { func: &'static str, message: String },

	/// An operator appeared twice in one query.
	#[error("function {0} can only be used once")]
	DuplicateOperator(String),

	/// Unknown TTL or keyspace.
	#[error("not found: {0}")]
	NotFound(String),

	/// The storage read more bytes than allowed.
	#[error("query read {read} bytes, above the limit of {limit} bytes")]
	ByteCeilingExceeded { limit: u32, read: u32 },

	/// Flattener entry carries an operation code outside the known set.
	#[error("operation id {0} is not mapped")]
	UnsupportedOperation(u8),

	/// Flattener entry reached flush without any values.
	#[error("no values accumulated for flatten operation")]
	EmptyAccumulation,

	/// Storage collaborator failure, passed through verbatim.
	#[error("storage failure: {0}")]
	StorageFailure(String),

	/// Transport adaptation or emission failure.
	#[error("transport failure: {0}")]
	TransportFailure(String),

	/// Series-existence cache failure.
	#[error("cache failure: {0}")]
	CacheFailure(String),

	/// The flattener has been stopped and no longer accepts points.
	#[error("flattener is stopped")]
	Closed,
}

impl Error {
	pub fn malformed<S: Into<String>>(func: &'static str, message: S) -> Self {
		Error::MalformedArguments {
			func,
			message: message.into(),
		}
	}
}
