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


#[macro_use]
extern crate log;

use serde::{
	Deserialize,
	Serialize,
};
use std::{
	borrow::Cow,
	collections::{
		BTreeMap,
		HashMap,
	},
	io::{
		self,
		BufRead,
	},
	panic,
	path::PathBuf,
	sync::Arc,
	thread,
	time::Duration,
};
use structopt::StructOpt;

use tsdb_plot_rust::{
	transport::Transport,
	*,
};

#[derive(Debug, StructOpt)]
#[structopt(rename_all = "kebab-case")]
struct Args {
	/// Turn on debug logging
	#[structopt(short = "v", long)]
	verbose: bool,

	/// Log file destination. Default is stderr
	#[structopt(short = "L", long, parse(try_from_str))]
	log_file: Option<PathBuf>,

	#[structopt(subcommand)]
	command: Command,
}

#[derive(Debug, StructOpt)]
#[structopt(rename_all = "kebab-case")]
enum Command {
	/// Run a query expression over points loaded from a JSON file
	Query(QueryArgs),
	/// Flatten JSON-lines points read from stdin, writing OpenTSDB JSON records to stdout
	Flatten(FlattenArgs),
}

#[derive(Debug, StructOpt)]
#[structopt(rename_all = "kebab-case")]
struct QueryArgs {
	/// JSON file of points, in format `{"keyspace": {"series key": [{"timestamp": 0, "value": 1.0}]}}`
	#[structopt(parse(try_from_str))]
	points: PathBuf,

	/// Query expression, like `rate(false,null,0,merge(sum,downsample(avg,1m,none,cpu)))`.
	///
	/// The innermost argument is the series key, unless keys are given with `--key`.
	expression: String,

	/// Series keys to query
	#[structopt(short = "k", long = "key", value_name = "key", number_of_values = 1)]
	keys: Vec<String>,

	/// Start of the time range, inclusive
	#[structopt(short = "s", long, default_value = "0")]
	start: i64,

	/// End of the time range, inclusive. Default is now
	#[structopt(short = "e", long)]
	end: Option<i64>,

	/// TTL of the series, in days
	#[structopt(short = "t", long, default_value = "1")]
	ttl: i32,

	/// Keyspace of each TTL, in format `ttl1=keyspace1,ttl2=keyspace2,...`
	#[structopt(
		long,
		default_value = "1=one_day,3=three_days,7=one_week",
		parse(try_from_str = util::parse_keyspace_map)
	)]
	keyspaces: HashMap<i32, String>,

	/// Keyset the series belong to
	#[structopt(long, default_value = "")]
	keyset: String,

	/// Timestamps are in milliseconds
	#[structopt(long)]
	ms: bool,

	/// Keep empty slots in the result as nulls
	#[structopt(long)]
	keep_empties: bool,

	/// Ignore the byte limit
	#[structopt(long)]
	allow_full_fetch: bool,

	/// Maximum number of bytes one query may read
	#[structopt(long, default_value = "52428800")]
	max_bytes: u32,

	/// Maximum number of points returned
	#[structopt(short = "n", long)]
	point_limit: Option<usize>,
}

#[derive(Debug, StructOpt)]
#[structopt(rename_all = "kebab-case")]
struct FlattenArgs {
	/// Flush interval, in ms
	#[structopt(short = "i", long, default_value = "10000")]
	flush_interval: u64,

	/// Size of the output queue
	#[structopt(long, default_value = "10240")]
	queue_size: usize,

	/// Number of idle value buffers kept for reuse
	#[structopt(long, default_value = "1024")]
	pool_size: usize,
}

/// Point as read by the `flatten` command
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct RawPoint {
	metric: String,
	#[serde(default)]
	tags: BTreeMap<String, String>,
	timestamp: i64,
	value: f64,
	#[serde(default)]
	operation: types::Aggregator,
}

#[derive(Debug, Serialize)]
struct QueryOutput {
	series: types::TimeSeries,
	bytes_read: u32,
}

fn configure_logging(args: &Args) -> std::io::Result<()> {
	let level_filter = if args.verbose {
		log::LevelFilter::Debug
	} else {
		log::LevelFilter::Info
	};

	let mut dispatch = fern::Dispatch::new()
		.format(|out, message, record| {
			let current_thread = thread::current();
			let thread_name = match current_thread.name() {
				Some(v) => Cow::from(v),
				None => Cow::from(format!("{:?}", current_thread.id())),
			};

			out.finish(format_args!(
				"{}[{}][{}][{}]: {}",
				chrono::Utc::now().to_rfc3339(),
				thread_name,
				record.target(),
				record.level(),
				message,
			))
		})
		.level(level_filter);

	if let Some(dest) = args.log_file.clone() {
		eprintln!("Logging to {}", dest.display());
		dispatch = dispatch.chain(fern::log_file(dest)?);
	} else {
		dispatch = dispatch.chain(std::io::stderr());
	}

	dispatch.apply().expect("Could not apply logging config");
	Ok(())
}

fn main() {
	let args = Args::from_args();

	if let Err(err) = configure_logging(&args) {
		eprintln!("Could not initialize logging: {}", err);
		::std::process::exit(1);
	}
	panic::set_hook(Box::new(logging_panic_hook));

	let res = match args.command {
		Command::Query(args) => run_query(args),
		Command::Flatten(args) => run_flatten(args),
	};
	if let Err(e) = res {
		error!("{}", e);
		::std::process::exit(1);
	}
}

fn run_query(args: QueryArgs) -> Result<(), String> {
	let storage = storage::MemoryStorage::read(&args.points)?;

	let (terminal, parsed) = parser::parse_expression(&args.expression)
		.map_err(|e| format!("Could not parse expression: {}", e))?;
	let opers = parsed
		.data_operations(args.point_limit)
		.map_err(|e| format!("Invalid expression: {}", e))?;
	let keys = if args.keys.is_empty() {
		vec![terminal]
	} else {
		args.keys
	};
	debug!("Parsed {:?} into {:?}", args.expression, opers);

	let ms = args.ms;
	let end = args.end.unwrap_or_else(|| {
		let now = chrono::Utc::now();
		if ms {
			now.timestamp_millis()
		} else {
			now.timestamp()
		}
	});

	let plot = plot::Plot::new(
		plot::PlotSettings {
			keyspace_ttl_map: args.keyspaces,
			max_bytes_limit: args.max_bytes,
		},
		storage,
	);
	let (series, bytes_read) = plot
		.get_time_series(&plot::PlotQuery {
			ttl: args.ttl,
			keys: &keys,
			start: args.start,
			end,
			opers: &opers,
			ms: args.ms,
			keep_empties: args.keep_empties,
			allow_full_fetch: args.allow_full_fetch,
			keyset: &args.keyset,
		})
		.map_err(|e| format!("Query failed: {}", e))?;

	let output = serde_json::to_string(&QueryOutput { series, bytes_read })
		.map_err(|e| format!("Could not serialize result: {}", e))?;
	println!("{}", output);
	Ok(())
}

fn run_flatten(args: FlattenArgs) -> Result<(), String> {
	let (sink, receiver) = transport::ChannelTransport::bounded(args.queue_size);
	let flat: Arc<flattener::Flattener<String, transport::PointContext, _>> =
		Arc::new(flattener::Flattener::new(
			flattener::FlattenerSettings {
				pool_size: args.pool_size,
				..Default::default()
			},
			sink,
		));

	let printer = thread::Builder::new()
		.name(String::from("printer"))
		.spawn(move || {
			for item in receiver.iter() {
				println!("{}", String::from_utf8_lossy(&item));
			}
		})
		.map_err(|e| format!("Could not spawn printer thread: {}", e))?;

	let stdin = io::stdin();
	let res = flatten_stream(
		stdin.lock(),
		&flat,
		Duration::from_millis(args.flush_interval),
	);

	// Drops the last sender so the printer sees the end of the channel
	drop(flat);
	if printer.join().is_err() {
		return Err(String::from("Printer thread panicked"));
	}
	res.map(|_| ())
}

/// Runs `input` through the flattener with a flush thread, stopping it with a final flush
/// even when reading fails.
fn flatten_stream<R: BufRead, T>(
	input: R,
	flat: &Arc<flattener::Flattener<String, transport::PointContext, T>>,
	flush_interval: Duration,
) -> Result<flattener::FlushSummary, String>
where
	T: Transport<String, transport::PointContext> + 'static,
{
	let handle = flattener::Flattener::start(Arc::clone(flat), flush_interval)?;
	let res = add_points(input, flat);

	let summary = handle.stop();
	info!(
		"Final flush emitted {} entries, {} failed",
		summary.flushed, summary.failed
	);
	res.map(|()| summary)
}

/// Feeds JSON-lines points into the flattener until EOF. Invalid lines are skipped.
fn add_points<R: BufRead, T>(
	input: R,
	flat: &flattener::Flattener<String, transport::PointContext, T>,
) -> Result<(), String>
where
	T: Transport<String, transport::PointContext>,
{
	for line in input.lines() {
		let line = line.map_err(|e| format!("Could not read stdin: {}", e))?;
		if line.trim().is_empty() {
			continue;
		}
		let point: RawPoint = match serde_json::from_str(&line) {
			Ok(v) => v,
			Err(e) => {
				warn!("Skipping invalid point {:?}: {}", line, e);
				continue;
			}
		};

		let context = transport::PointContext {
			metric: point.metric,
			tags: point.tags,
		};
		let key = context.series_key();
		flat.add(key, point.operation, point.timestamp, point.value, context)
			.map_err(|e| format!("Could not add point: {}", e))?;
	}
	Ok(())
}

fn logging_panic_hook(info: &panic::PanicInfo) {
	let payload = info.payload();
	let msg = if let Some(s) = payload.downcast_ref::<String>() {
		s.as_str()
	} else if let Some(s) = payload.downcast_ref::<&str>() {
		*s
	} else {
		"(non-string payload)"
	};
	error!("Thread panic: {}", msg);
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Read;

	#[test]
	fn raw_point_defaults() {
		let point: RawPoint =
			serde_json::from_str(r#"{"metric": "cpu", "timestamp": 10, "value": 1.5}"#).unwrap();
		assert_eq!(point.metric, "cpu");
		assert!(point.tags.is_empty());
		assert_eq!(point.operation, types::Aggregator::Sum);

		let point: RawPoint = serde_json::from_str(
			r#"{"metric": "cpu", "tags": {"host": "a"}, "timestamp": 10, "value": 1.5, "operation": "max"}"#,
		)
		.unwrap();
		assert_eq!(point.tags["host"], "a");
		assert_eq!(point.operation, types::Aggregator::Max);
	}

	/// Reader that fails once its data is used up
	struct BrokenReader(io::Cursor<Vec<u8>>);
	impl Read for BrokenReader {
		fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
			match self.0.read(buf)? {
				0 => Err(io::Error::new(io::ErrorKind::Other, "connection reset")),
				n => Ok(n),
			}
		}
	}

	#[test]
	fn read_error_still_flushes() {
		let input = concat!(
			r#"{"metric": "cpu", "tags": {"host": "a"}, "timestamp": 10, "value": 1.5}"#,
			"\n",
			"not json\n",
			r#"{"metric": "cpu", "tags": {"host": "a"}, "timestamp": 20, "value": 2.5}"#,
			"\n",
		);
		let (sink, receiver) = transport::ChannelTransport::bounded(16);
		let flat = Arc::new(flattener::Flattener::new(
			flattener::FlattenerSettings::default(),
			sink,
		));

		let res = flatten_stream(
			io::BufReader::new(BrokenReader(io::Cursor::new(input.as_bytes().to_vec()))),
			&flat,
			Duration::from_secs(3600),
		);
		assert!(res.is_err());
		assert!(!flat.is_open());
		assert!(flat.is_empty());

		let item = receiver.try_recv().unwrap();
		let json: serde_json::Value = serde_json::from_slice(&item).unwrap();
		assert_eq!(json["metric"], "cpu");
		assert_eq!(json["timestamp"], 10);
		assert_eq!(json["value"], 4.);
		assert!(receiver.try_recv().is_err());
	}

	#[test]
	fn args_parse() {
		let args = Args::from_iter_safe(&[
			"tsdb-plot-rust",
			"-v",
			"query",
			"points.json",
			"merge(sum,cpu)",
			"-k",
			"cpu.a",
			"-k",
			"cpu.b",
			"--keyspaces",
			"1=day",
		])
		.unwrap();
		assert!(args.verbose);
		match args.command {
			Command::Query(q) => {
				assert_eq!(q.keys, vec!["cpu.a", "cpu.b"]);
				assert_eq!(q.keyspaces[&1], "day");
				assert_eq!(q.ttl, 1);
				assert_eq!(q.point_limit, None);
			}
			other => panic!("unexpected command: {:?}", other),
		}
	}
}
