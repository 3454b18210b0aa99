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

use super::{
	stat::{BytesDisplay, Counter},
	Error, Server,
};
use crate::{
	obfs::{parse_greeting, ObfsConn},
	prelude::*,
	protocol::ReadError,
	utils::relay::Relay,
};
use std::{
	io,
	sync::atomic::Ordering,
	time::{Duration, Instant},
};
use tokio::{
	net::{TcpListener, TcpStream},
	time::timeout,
};

// Process (EMFILE) and system (ENFILE) file descriptor limits get
// their own log line, everything else logs the dial target.
const EMFILE: i32 = 24;
const ENFILE: i32 = 23;

impl Server {
	pub(super) async fn priv_serve(self: Arc<Self>, listener: TcpListener) -> Result<(), Error> {
		loop {
			let (stream, peer) = match listener.accept().await {
				Ok(v) => v,
				Err(e) => {
					error!("accept connection error ({})", e);
					continue;
				}
			};
			// randomly generated connection ID
			let conn_id = rand::thread_rng().next_u64();
			let server = self.clone();
			tokio::spawn(async move {
				let count = server.conn_count.fetch_add(1, Ordering::Relaxed) + 1;
				server.log_conn_high_water(count);

				let peer_str = server.sanitize_addr(&peer);
				debug!("[{:#06x}] new client {}", conn_id, peer_str);
				if let Err(e) = server.handle_connection(stream, conn_id).await {
					if is_inactive(&e) {
						warn!(
							"[{:#06x}] connection from {} closed due to inactivity",
							conn_id, peer_str
						);
					} else {
						warn!(
							"[{:#06x}] connection from {} closed ({})",
							conn_id, peer_str, e
						);
					}
				}
				debug!("[{:#06x}] closed pipe with {}", conn_id, peer_str);
				server.conn_count.fetch_sub(1, Ordering::Relaxed);
			});
		}
	}

	async fn handle_connection(&self, stream: TcpStream, conn_id: u64) -> Result<(), Error> {
		let mut conn = ObfsConn::new(stream);
		let mut buf = self.pool.get();

		// --- greeting ---
		let read_timeout = Duration::from_secs(self.timeout_secs as u64);
		let n = match timeout(read_timeout, conn.read_greeting(&mut buf)).await {
			Err(_) => return reject(conn, Error::GreetingTimeout(self.timeout_secs)).await,
			Ok(Err(e)) => return reject(conn, e.into()).await,
			Ok(Ok(n)) => n,
		};
		let greeting = match parse_greeting(&buf[..n]) {
			Ok(g) => g,
			Err(e) => return reject(conn, e.into()).await,
		};
		let cipher = match self.users.lookup(&greeting.identifier) {
			Some(c) => c,
			None => return reject(conn, Error::UnknownIdentifier).await,
		};
		let id = greeting.identifier.clone();
		if !self.sanitize {
			debug!("[{:#06x}] identifier '{}' accepted", conn_id, id);
		}

		// --- decrypt the preamble ---
		// The client is authenticated from here on, failures close the
		// socket without the decoy.
		conn.set_cipher(cipher.make_conn());
		let iv_len = cipher.iv_len();

		let body = &buf[greeting.header_len + 4..n];
		let mut augmented = Vec::with_capacity(greeting.random_head.len() + body.len());
		augmented.extend_from_slice(&greeting.random_head);
		augmented.extend_from_slice(body);
		if augmented.len() < iv_len {
			return Err(ReadError::InvalidAddress("preamble shorter than IV".into()).into());
		}
		conn.init_decrypt(&augmented[..iv_len])?;
		let mut plain = vec![0_u8; augmented.len() - iv_len];
		conn.decrypt(&augmented[iv_len..], &mut plain)?;
		drop(buf);

		let (addr, consumed) = SocksAddr::read_from_bytes(&plain)?;
		let request_tail = &plain[usize::from(consumed.get())..];

		// --- dial ---
		let target = addr.to_string();
		debug!("[{:#06x}] connecting to {}", conn_id, target);
		let mut upstream = match TcpStream::connect(target.as_str()).await {
			Ok(s) => s,
			Err(e) => {
				if matches!(e.raw_os_error(), Some(EMFILE | ENFILE)) {
					error!("[{:#06x}] dial error ({})", conn_id, e);
				} else {
					error!("[{:#06x}] error connecting to {} ({})", conn_id, target, e);
				}
				return Err(e.into());
			}
		};
		if !request_tail.is_empty() {
			upstream.write_all(request_tail).await?;
		}

		// --- splice ---
		let recv = Counter::new();
		let send = Counter::new();
		let account = self.traffic.get(&id);
		let (ir, iw) = conn.into_split(&self.pool)?;
		let (or, ow) = upstream.into_split();

		let conn_id_str = format!("{:#06x}", conn_id);
		let start_time = Instant::now();
		let relay_result = Relay::new(&conn_id_str, self.pool.clone())
			.set_recv(recv.clone())
			.set_send(send.clone())
			.set_account(account)
			.set_timeout_secs(self.timeout_secs)
			.relay_stream(ir, iw, or, ow)
			.await;

		let msg = format!(
			"[{}] pipe to {} finished with {} received, {} sent and lasted {} secs.",
			conn_id_str,
			target,
			BytesDisplay(recv.get()),
			BytesDisplay(send.get()),
			start_time.elapsed().as_secs(),
		);
		if let Err(e) = relay_result {
			if e.kind() == io::ErrorKind::TimedOut {
				return Err(e.into());
			}
			warn!("{} But an error occurred ({}).", msg, e);
			return Err(e.into());
		}
		info!("{}", msg);
		Ok(())
	}
}

/// Answer like a misrouted web server, then report the real reason to
/// the caller.
async fn reject(conn: ObfsConn, err: Error) -> Result<(), Error> {
	debug!("rejecting connection ({})", err);
	if let Err(e) = conn.fake_response().await {
		debug!("error writing decoy response ({})", e);
	}
	Err(err)
}

fn is_inactive(e: &Error) -> bool {
	if let Error::Io(e) = e {
		e.kind() == io::ErrorKind::TimedOut
	} else {
		false
	}
}
