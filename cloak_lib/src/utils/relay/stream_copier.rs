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

use crate::{prelude::*, server::stat::Counter, utils::pool::PoolBuf};
use std::{
	io,
	sync::atomic::{AtomicBool, Ordering},
};

/// Copy bytes from `r` to `w`.
pub(super) struct StreamCopier<R, W>
where
	R: AsyncRead + Unpin + Send + 'static,
	W: AsyncWrite + Unpin + Send + 'static,
{
	pub r: R,
	pub w: W,
	pub count: Counter,
	/// Extra counter shared with the opposite direction, attributing
	/// the whole connection to one owner.
	pub account: Option<Counter>,
	pub tag: Arc<str>,
	/// Set to true once this side's reader reached EOF, so the other
	/// direction can tell expected write failures from real ones.
	pub is_reading_stopped: Arc<AtomicBool>,
	/// Touched on every read and write, cleared by the inactivity
	/// guard.
	pub is_active: Arc<AtomicBool>,
	pub buffer: PoolBuf,
}

impl<R, W> StreamCopier<R, W>
where
	R: AsyncRead + Unpin + Send + 'static,
	W: AsyncWrite + Unpin + Send + 'static,
{
	pub async fn run(mut self) -> (R, W, io::Result<()>) {
		loop {
			trace!("{} Reading from read_half...", self.tag);
			let n = match self.r.read(&mut self.buffer).await {
				Ok(res) => res,
				Err(err) => return (self.r, self.w, Err(err)),
			};
			trace!("{} Done reading from read_half, n: {}", self.tag, n);
			self.is_active.store(true, Ordering::Relaxed);

			if n == 0 {
				debug!(
					"{} read_half reach EOF, shutting down write_half.",
					self.tag
				);
				self.is_reading_stopped.store(true, Ordering::Relaxed);
				let res = if let Err(err) = self.w.shutdown().await {
					debug!(
						"{} Error when trying to shutdown write_half ({})",
						self.tag, err
					);
					Err(err)
				} else {
					Ok(())
				};
				return (self.r, self.w, res);
			}

			let data = &self.buffer[..n];
			debug_assert!(!data.is_empty());

			let mut pos: usize = 0;
			while pos < data.len() {
				trace!("{} Writing into write_half...", self.tag);
				let n = match self.w.write(&data[pos..]).await {
					Ok(n) => n,
					Err(err) => {
						let res = if self.is_reading_stopped.load(Ordering::Relaxed) {
							debug!("{} Error occurred when trying to write data to write_half ({}), but ignored because other read_half is stopped", self.tag, err);
							Ok(())
						} else {
							debug!(
								"{} Error occurred when trying to write data to write_half ({})",
								self.tag, err
							);
							Err(err)
						};
						return (self.r, self.w, res);
					}
				};
				trace!("{} Done writing into write_half, n: {}", self.tag, n);
				self.is_active.store(true, Ordering::Relaxed);
				if n == 0 {
					return (self.r, self.w, Err(io::ErrorKind::WriteZero.into()));
				}
				pos += n;
				self.count.add(n as u64);
				if let Some(account) = &self.account {
					account.add(n as u64);
				}
			}
		}
	}
}
