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
UDP control plane.

Datagram commands, in the style of the multi-user management protocol:

- `add: {"server_port": "u1", "password": "pw"}` registers a user;
- `remove: {"server_port": "u1"}` drops a user;
- `ping` answers `pong` and subscribes the sender to periodic
  `stat: {"u1": 1024, ...}` traffic reports;
- `ping-stop` answers `pong` and unsubscribes.

`server_port` may be a JSON integer or a numeric string; either form is
normalized to a decimal string used as the identifier.

A config reload task lives here as well. It is driven by a channel so
the binary can wire it to SIGHUP without the library touching signal
handling.
*/

use super::{stat::Traffic, users::UserTable, Error};
use crate::{config::Config, prelude::*};
use serde::Deserialize;
use std::{
	collections::HashSet,
	path::PathBuf,
	time::Duration,
};
use tokio::{net::UdpSocket, sync::mpsc};

const REPORT_INTERVAL: Duration = Duration::from_secs(10);
const STAT_PREFIX: &[u8] = b"stat: ";

const REPLY_OK: &[u8] = b"ok";
const REPLY_ERR: &[u8] = b"err";
const REPLY_PONG: &[u8] = b"pong";

pub struct Manager {
	addr: SocketAddr,
	users: Arc<UserTable>,
	traffic: Arc<Traffic>,
}

impl Manager {
	#[must_use]
	pub fn new(addr: SocketAddr, users: Arc<UserTable>, traffic: Arc<Traffic>) -> Self {
		Self {
			addr,
			users,
			traffic,
		}
	}

	/// Bind the manager address and serve commands forever.
	///
	/// # Errors
	///
	/// Returns an [`Error`] if the socket cannot be bound.
	pub async fn serve(self) -> Result<(), Error> {
		let socket = UdpSocket::bind(self.addr).await?;
		warn!("manager listening on UDP {}", self.addr);
		self.serve_socket(socket).await
	}

	/// Serve commands on an already bound socket.
	///
	/// # Errors
	///
	/// Currently never returns; IO problems are logged and the loop
	/// keeps going.
	pub async fn serve_socket(self, socket: UdpSocket) -> Result<(), Error> {
		let mut report_set: HashSet<SocketAddr> = HashSet::new();
		let mut report_timer = tokio::time::interval(REPORT_INTERVAL);
		let mut buf = [0_u8; 1024];
		loop {
			tokio::select! {
				_ = report_timer.tick() => {
					self.send_reports(&socket, &report_set).await;
				}
				res = socket.recv_from(&mut buf) => {
					let (n, remote) = match res {
						Ok(v) => v,
						Err(e) => {
							error!("failed to read manager msg ({})", e);
							continue;
						}
					};
					if let Some(reply) = self.handle_command(&buf[..n], remote, &mut report_set) {
						if let Err(e) = socket.send_to(reply, remote).await {
							error!("failed to write manager msg ({})", e);
						}
					}
				}
			}
		}
	}

	async fn send_reports(&self, socket: &UdpSocket, report_set: &HashSet<SocketAddr>) {
		if report_set.is_empty() {
			return;
		}
		let stats = self.traffic.snapshot();
		let mut payload = STAT_PREFIX.to_vec();
		match serde_json::to_vec(&stats) {
			Ok(json) => payload.extend_from_slice(&json),
			Err(e) => {
				error!("cannot serialize traffic stats ({})", e);
				return;
			}
		}
		for addr in report_set {
			if let Err(e) = socket.send_to(&payload, addr).await {
				debug!("failed to send stat report to {} ({})", addr, e);
			}
		}
	}

	/// Dispatch one datagram. Unknown commands are silently ignored.
	fn handle_command(
		&self,
		data: &[u8],
		remote: SocketAddr,
		report_set: &mut HashSet<SocketAddr>,
	) -> Option<&'static [u8]> {
		if let Some(payload) = data.strip_prefix(b"add:") {
			return Some(self.handle_add(trim_payload(payload)));
		}
		if let Some(payload) = data.strip_prefix(b"remove:") {
			return Some(self.handle_remove(trim_payload(payload)));
		}
		// "ping-stop" must be matched before its "ping" prefix.
		if data.starts_with(b"ping-stop") {
			report_set.remove(&remote);
			return Some(REPLY_PONG);
		}
		if data.starts_with(b"ping") {
			report_set.insert(remote);
			return Some(REPLY_PONG);
		}
		None
	}

	fn handle_add(&self, payload: &[u8]) -> &'static [u8] {
		let params: AddParams = match serde_json::from_slice(payload) {
			Ok(p) => p,
			Err(e) => {
				error!("failed to parse add request ({})", e);
				return REPLY_ERR;
			}
		};
		let password = match params.password {
			Some(p) if !p.is_empty() => p,
			_ => {
				error!("add request has no password");
				return REPLY_ERR;
			}
		};
		let id = match params.server_port.as_ref().and_then(PortNum::normalize) {
			Some(id) => id,
			None => {
				error!("add request has no usable server_port");
				return REPLY_ERR;
			}
		};
		self.users.insert(&id, &password);
		// Make the user visible in stat reports right away.
		let _ = self.traffic.get(&id);
		REPLY_OK
	}

	fn handle_remove(&self, payload: &[u8]) -> &'static [u8] {
		let params: RemoveParams = match serde_json::from_slice(payload) {
			Ok(p) => p,
			Err(e) => {
				error!("failed to parse remove request ({})", e);
				return REPLY_ERR;
			}
		};
		let id = match params.server_port.as_ref().and_then(PortNum::normalize) {
			Some(id) => id,
			None => {
				error!("remove request has no usable server_port");
				return REPLY_ERR;
			}
		};
		info!("removing user '{}'", id);
		self.users.remove(&id);
		self.traffic.remove(&id);
		REPLY_OK
	}
}

/// Re-read the config whenever the channel fires and diff it against
/// the live user table: new identifiers are added, missing ones are
/// removed, changed passphrases are swapped in. In-flight connections
/// keep their cloned cipher state.
pub async fn reload_users(
	mut rx: mpsc::Receiver<()>,
	config_path: PathBuf,
	users: Arc<UserTable>,
	traffic: Arc<Traffic>,
) {
	while rx.recv().await.is_some() {
		info!("updating users");
		let conf = match Config::read_file(&config_path) {
			Ok(c) => c,
			Err(e) => {
				error!(
					"error parsing config file {} to update users ({})",
					config_path.display(),
					e
				);
				continue;
			}
		};
		let new_users = match conf.unified_users() {
			Ok(u) => u,
			Err(e) => {
				error!("config file has no usable users ({})", e);
				continue;
			}
		};
		for (id, password) in &new_users {
			users.update(id, password);
		}
		for id in users.ids() {
			if !new_users.contains_key(&id) {
				info!("removing user '{}' as it's deleted", id);
				users.remove(&id);
				traffic.remove(&id);
			}
		}
		info!("users updated");
	}
}

/// The management protocol documents `server_port` as "string or
/// integer". Numeric values of either kind are folded into a canonical
/// decimal string; other non-empty strings are taken verbatim, since
/// the port field is really a user label here.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortNum {
	Int(i64),
	Str(String),
}

impl PortNum {
	fn normalize(&self) -> Option<Tag> {
		match self {
			PortNum::Int(v) => Some(Tag::new(v.to_string())),
			PortNum::Str(s) => {
				let s = s.trim();
				if s.is_empty() {
					return None;
				}
				match s.parse::<i64>() {
					Ok(0) => None,
					Ok(v) => Some(Tag::new(v.to_string())),
					Err(_) => Some(Tag::new(s)),
				}
			}
		}
	}
}

#[derive(Debug, Deserialize)]
struct AddParams {
	server_port: Option<PortNum>,
	password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoveParams {
	server_port: Option<PortNum>,
}

fn trim_payload(mut data: &[u8]) -> &[u8] {
	const TRIMMED: &[u8] = b"\x00\r\n ";
	while let [first, rest @ ..] = data {
		if TRIMMED.contains(first) {
			data = rest;
		} else {
			break;
		}
	}
	while let [rest @ .., last] = data {
		if TRIMMED.contains(last) {
			data = rest;
		} else {
			break;
		}
	}
	data
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::crypto::Method;

	fn make_manager() -> Manager {
		Manager::new(
			"127.0.0.1:0".parse().unwrap(),
			Arc::new(UserTable::new(Method::Aes256Cfb)),
			Arc::new(Traffic::new()),
		)
	}

	fn remote() -> SocketAddr {
		"127.0.0.1:12345".parse().unwrap()
	}

	#[test]
	fn test_add_and_remove() {
		let m = make_manager();
		let mut set = HashSet::new();

		let reply = m.handle_command(
			br#"add: {"server_port": "8001", "password": "pw"}"#,
			remote(),
			&mut set,
		);
		assert_eq!(reply, Some(REPLY_OK));
		assert!(m.users.lookup("8001").is_some());

		let reply = m.handle_command(br#"remove: {"server_port": 8001}"#, remote(), &mut set);
		assert_eq!(reply, Some(REPLY_OK));
		assert!(m.users.lookup("8001").is_none());
	}

	#[test]
	fn test_add_integer_port() {
		let m = make_manager();
		let mut set = HashSet::new();
		let reply = m.handle_command(
			br#"add:{"server_port": 8002, "password": "pw"}"#,
			remote(),
			&mut set,
		);
		assert_eq!(reply, Some(REPLY_OK));
		assert!(m.users.lookup("8002").is_some());
	}

	#[test]
	fn test_malformed_json_replies_err() {
		let m = make_manager();
		let mut set = HashSet::new();
		assert_eq!(
			m.handle_command(b"add:{not json}", remote(), &mut set),
			Some(REPLY_ERR)
		);
		assert_eq!(
			m.handle_command(br#"add:{"password": "pw"}"#, remote(), &mut set),
			Some(REPLY_ERR)
		);
		assert_eq!(
			m.handle_command(br#"add:{"server_port": "", "password": "pw"}"#, remote(), &mut set),
			Some(REPLY_ERR)
		);
	}

	#[test]
	fn test_add_label_port() {
		let m = make_manager();
		let mut set = HashSet::new();
		// The port field doubles as a user label and may be non-numeric.
		let reply = m.handle_command(
			br#"add:{"server_port": "u9", "password": "pp"}"#,
			remote(),
			&mut set,
		);
		assert_eq!(reply, Some(REPLY_OK));
		assert!(m.users.lookup("u9").is_some());
	}

	#[test]
	fn test_ping_registers_and_ping_stop_unregisters() {
		let m = make_manager();
		let mut set = HashSet::new();

		assert_eq!(
			m.handle_command(b"ping", remote(), &mut set),
			Some(REPLY_PONG)
		);
		assert!(set.contains(&remote()));

		assert_eq!(
			m.handle_command(b"ping-stop", remote(), &mut set),
			Some(REPLY_PONG)
		);
		assert!(set.is_empty());
	}

	#[test]
	fn test_unknown_command_ignored() {
		let m = make_manager();
		let mut set = HashSet::new();
		assert_eq!(m.handle_command(b"restart", remote(), &mut set), None);
	}

	#[test]
	fn test_trim_payload() {
		assert_eq!(trim_payload(b" {\"a\":1}\r\n\x00\x00"), b"{\"a\":1}");
		assert_eq!(trim_payload(b"\x00\x00"), b"");
	}

	#[test]
	fn test_port_num_normalize() {
		assert_eq!(PortNum::Int(8001).normalize(), Some(Tag::new("8001")));
		assert_eq!(
			PortNum::Str("08001".into()).normalize(),
			Some(Tag::new("8001"))
		);
		assert_eq!(PortNum::Str("0".into()).normalize(), None);
		assert_eq!(PortNum::Str("".into()).normalize(), None);
		assert_eq!(PortNum::Str("u9".into()).normalize(), Some(Tag::new("u9")));
	}
}
