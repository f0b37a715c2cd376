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


//! Miscellaneous utility functions

use lazy_static::lazy_static;
use regex::Regex;
use std::{
	borrow::Cow,
	collections::{
		BTreeMap,
		HashMap,
	},
};

lazy_static! {
	static ref RE_UNESCAPE: Regex = Regex::new(r"\\(.)").unwrap();
	static ref RE_KV: Regex =
		Regex::new(r#"^([^"=,]+|"(?:[^"\\]|\\.)*")=([^"=,]+|"(?:[^"\\]|\\.)*")(?:,|\z)(.*)$"#)
			.unwrap();
}

/// Takes a quoted string with escapes in it and replaces escape sequences in it
/// with the real values. Or, if the string isn't quoted, returns `s` unchanged.
fn unescape_quoted<'a>(s: &'a str) -> Cow<'a, str> {
	if s.len() < 2 || !s.starts_with('"') || !s.ends_with('"') {
		return s.into();
	}
	let inner = &s[1..s.len() - 1];
	if !inner.contains('\\') {
		return inner.into();
	}
	RE_UNESCAPE.replace_all(inner, "$1").into()
}

/// Parses a string in the format `key1=value1,key2=value2,...`.
///
/// Keys and values may be double-quoted, with backslash escapes.
pub fn parse_kv_list(line: &str) -> Result<BTreeMap<String, String>, String> {
	let mut result = BTreeMap::new();
	let mut remaining = line.trim();
	while remaining != "" {
		let kv_match = RE_KV.captures(remaining).ok_or_else(|| {
			format!(
				"Could not parse key-value pair, starting at {:?}",
				remaining
			)
		})?;
		let key = unescape_quoted(kv_match[1].trim()).into_owned();
		let value = unescape_quoted(kv_match[2].trim()).into_owned();
		remaining = kv_match.get(3).map_or("", |m| m.as_str());
		result.insert(key, value);
	}
	Ok(result)
}

/// Parses the TTL to keyspace map, in the format `ttl1=keyspace1,ttl2=keyspace2,...`.
///
/// TTLs are in days.
pub fn parse_keyspace_map(line: &str) -> Result<HashMap<i32, String>, String> {
	let kvs = parse_kv_list(line)?;
	if kvs.is_empty() {
		return Err(String::from("No keyspaces given"));
	}

	kvs.into_iter()
		.map(|(ttl, keyspace)| {
			let ttl = ttl
				.parse::<i32>()
				.map_err(|e| format!("Invalid TTL {:?}: {}", ttl, e))?;
			if keyspace.is_empty() {
				return Err(format!("Empty keyspace for TTL {}", ttl));
			}
			Ok((ttl, keyspace))
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unescape() {
		assert_eq!(unescape_quoted("helloworld"), "helloworld");
		assert_eq!(unescape_quoted("\"helloworld\""), "helloworld");
		assert_eq!(unescape_quoted("\"hello world\""), "hello world");
		assert_eq!(
			unescape_quoted("\"hello \\\"world\\\"\""),
			"hello \"world\""
		);
		assert_eq!(unescape_quoted("\""), "\"");
	}

	fn kvs(kvs: &[(&str, &str)]) -> BTreeMap<String, String> {
		kvs.iter()
			.map(|&(k, v)| (String::from(k), String::from(v)))
			.collect()
	}

	#[test]
	fn parse_kvs() {
		assert_eq!(parse_kv_list(""), Ok(kvs(&[])));
		assert_eq!(parse_kv_list("host=web01"), Ok(kvs(&[("host", "web01")])));
		assert_eq!(
			parse_kv_list("host=web01,\"dc\"=\"east, \\\"2\\\"\""),
			Ok(kvs(&[("host", "web01"), ("dc", "east, \"2\"")]))
		);
		assert!(parse_kv_list("host").is_err());
		assert!(parse_kv_list("host=a=b").is_err());
	}

	#[test]
	fn keyspace_map() {
		let map = parse_keyspace_map("1=one_day,3=three_days,7=one_week").unwrap();
		assert_eq!(map.len(), 3);
		assert_eq!(map[&1], "one_day");
		assert_eq!(map[&3], "three_days");
		assert_eq!(map[&7], "one_week");

		assert!(parse_keyspace_map("").is_err());
		assert!(parse_keyspace_map("one=one_day").is_err());
		assert!(parse_keyspace_map("1=\"\"").is_err());
	}
}
