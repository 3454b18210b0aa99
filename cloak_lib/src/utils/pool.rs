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
A leaky pool of fixed-size byte buffers.

Read/write paths of thousands of concurrent sockets churn through
buffers of the same size; the pool keeps up to [`MAX_NUM_BUF`] of them
around instead of hitting the allocator per connection. When the pool
is empty a fresh buffer is allocated, and when it is full a returned
buffer is simply dropped.
*/

use std::{
	ops::{Deref, DerefMut},
	sync::{Arc, Mutex},
};

/// Length of every pooled buffer in bytes.
pub const LBUF_SIZE: usize = 4108;
/// Maximum number of idle buffers kept in the pool.
pub const MAX_NUM_BUF: usize = 2048;

/// Cheaply cloneable handle, all clones share the same pool.
#[derive(Clone)]
pub struct LeakyBuf {
	inner: Arc<Inner>,
}

struct Inner {
	buf_size: usize,
	max_num: usize,
	free: Mutex<Vec<Vec<u8>>>,
}

impl LeakyBuf {
	#[must_use]
	pub fn new(max_num: usize, buf_size: usize) -> Self {
		Self {
			inner: Arc::new(Inner {
				buf_size,
				max_num,
				free: Mutex::new(Vec::new()),
			}),
		}
	}

	#[must_use]
	pub fn default_pool() -> Self {
		Self::new(MAX_NUM_BUF, LBUF_SIZE)
	}

	#[inline]
	#[must_use]
	pub fn buf_size(&self) -> usize {
		self.inner.buf_size
	}

	/// Take a buffer of `buf_size` bytes out of the pool.
	#[must_use]
	pub fn get(&self) -> PoolBuf {
		let buf = self
			.inner
			.free
			.lock()
			.expect("buffer pool lock poisoned")
			.pop()
			.unwrap_or_else(|| vec![0_u8; self.inner.buf_size]);
		PoolBuf {
			pool: self.clone(),
			buf,
		}
	}

	fn put(&self, buf: Vec<u8>) {
		if buf.len() != self.inner.buf_size {
			// Not one of ours, let it drop.
			return;
		}
		let mut free = self.inner.free.lock().expect("buffer pool lock poisoned");
		if free.len() < self.inner.max_num {
			free.push(buf);
		}
	}

	#[cfg(test)]
	fn idle_count(&self) -> usize {
		self.inner.free.lock().unwrap().len()
	}
}

/// A pooled buffer that returns itself to its pool when dropped.
///
/// Contents are not zeroed between uses.
pub struct PoolBuf {
	pool: LeakyBuf,
	buf: Vec<u8>,
}

impl Deref for PoolBuf {
	type Target = [u8];

	#[inline]
	fn deref(&self) -> &Self::Target {
		&self.buf
	}
}

impl DerefMut for PoolBuf {
	#[inline]
	fn deref_mut(&mut self) -> &mut Self::Target {
		&mut self.buf
	}
}

impl Drop for PoolBuf {
	fn drop(&mut self) {
		self.pool.put(std::mem::take(&mut self.buf));
	}
}
