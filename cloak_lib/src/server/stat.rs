/**********************************************************************

Copyright (C) 2021 by reddal

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

**********************************************************************/

/*!
Traffic accounting.

Every identifier owns one [`Counter`]; clones of it are handed to both
splice directions of every connection for that user, so the totals the
manager reports include partial sums of in-flight sessions.
*/

use crate::prelude::*;
use std::{
	collections::HashMap,
	fmt,
	sync::{
		atomic::{AtomicU64, Ordering},
		Mutex,
	},
};

/// Shared handle to one cumulative byte count.
///
/// Clones share the same value. Monotone non-decreasing, relaxed
/// ordering is enough since readers only want an eventual snapshot.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
	#[inline]
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[inline]
	#[must_use]
	pub fn get(&self) -> u64 {
		self.0.load(Ordering::Relaxed)
	}

	#[inline]
	pub fn add(&self, n: u64) {
		self.0.fetch_add(n, Ordering::Relaxed);
	}
}

/// Human readable byte total for log lines.
pub struct BytesDisplay(pub u64);

impl fmt::Display for BytesDisplay {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
		if self.0 < 1024 {
			return write!(f, "{} B", self.0);
		}
		#[allow(clippy::cast_precision_loss)]
		let mut value = self.0 as f64;
		let mut unit = 0;
		while value >= 1024.0 && unit + 1 < UNITS.len() {
			value /= 1024.0;
			unit += 1;
		}
		write!(f, "{:.2} {}", value, UNITS[unit])
	}
}

/// Cumulative traffic per identifier.
#[derive(Default)]
pub struct Traffic {
	stats: Mutex<HashMap<Tag, Counter>>,
}

impl Traffic {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Get the counter handle for `id`, creating a zero entry if the
	/// identifier has not moved any bytes yet.
	#[must_use]
	pub fn get(&self, id: &Tag) -> Counter {
		self.stats
			.lock()
			.expect("traffic lock poisoned")
			.entry(id.clone())
			.or_default()
			.clone()
	}

	pub fn remove(&self, id: &str) {
		self.stats
			.lock()
			.expect("traffic lock poisoned")
			.remove(id);
	}

	/// Copy out all counters.
	#[must_use]
	pub fn snapshot(&self) -> HashMap<Tag, u64> {
		self.stats
			.lock()
			.expect("traffic lock poisoned")
			.iter()
			.map(|(k, v)| (k.clone(), v.get()))
			.collect()
	}
}
