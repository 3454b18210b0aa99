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

mod error;
pub mod manager;
mod serve;
pub mod stat;
pub mod users;

pub use error::Error;
pub use manager::{reload_users, Manager};

use crate::{prelude::*, utils::pool::LeakyBuf};
use stat::Traffic;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;
use users::UserTable;

pub const DEFAULT_PORT: u16 = 8088;

const LOG_CNT_DELTA: usize = 100;

/// The obfuscation relay server: one TCP listener shared by every
/// identifier.
pub struct Server {
	addr: SocketAddr,
	users: Arc<UserTable>,
	traffic: Arc<Traffic>,
	timeout_secs: usize,
	sanitize: bool,
	pool: LeakyBuf,
	conn_count: AtomicUsize,
	next_log_count: AtomicUsize,
}

impl Server {
	#[must_use]
	pub fn new(
		addr: SocketAddr,
		users: Arc<UserTable>,
		traffic: Arc<Traffic>,
		timeout_secs: usize,
		sanitize: bool,
	) -> Self {
		Self {
			addr,
			users,
			traffic,
			timeout_secs,
			sanitize,
			pool: LeakyBuf::default_pool(),
			conn_count: AtomicUsize::new(0),
			next_log_count: AtomicUsize::new(LOG_CNT_DELTA),
		}
	}

	/// Bind the listener and accept connections forever.
	///
	/// # Errors
	///
	/// Returns an [`Error`] if the listener cannot be bound. Session
	/// errors are only logged.
	pub async fn serve(self: Arc<Self>) -> Result<(), Error> {
		warn!("Serving obfuscation inbound on TCP {}", self.addr);
		let listener = TcpListener::bind(self.addr).await?;
		self.priv_serve(listener).await
	}

	/// Accept connections on an already bound listener.
	///
	/// # Errors
	///
	/// Session errors are only logged.
	pub async fn serve_listener(self: Arc<Self>, listener: TcpListener) -> Result<(), Error> {
		self.priv_serve(listener).await
	}

	fn sanitize_addr(&self, addr: &SocketAddr) -> String {
		if self.sanitize {
			"x.x.x.x:zzzz".into()
		} else {
			addr.to_string()
		}
	}

	fn log_conn_high_water(&self, count: usize) {
		// Approximate on purpose, a missed log line is cheaper than a
		// lock in the accept path.
		let next = self.next_log_count.load(Ordering::Relaxed);
		if count >= next {
			info!("Number of client connections reaches {}", next);
			self.next_log_count
				.store(next + LOG_CNT_DELTA, Ordering::Relaxed);
		}
	}
}
