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

use crate::{
	crypto::{Cipher, Method},
	prelude::*,
};
use std::{
	collections::HashMap,
	sync::RwLock,
};

struct User {
	password: String,
	cipher: Cipher,
}

/// Identifier to cipher-prototype table.
///
/// The accept loop reads it on every handshake; only the control plane
/// and the reload task write to it. Lookups clone the prototype under
/// the read lock, so in-flight connections are never affected by a
/// later [`remove`].
///
/// [`remove`]: UserTable::remove
pub struct UserTable {
	method: Method,
	users: RwLock<HashMap<Tag, User>>,
}

impl UserTable {
	#[must_use]
	pub fn new(method: Method) -> Self {
		Self {
			method,
			users: RwLock::new(HashMap::new()),
		}
	}

	#[inline]
	#[must_use]
	pub fn method(&self) -> Method {
		self.method
	}

	/// Register `id` with `password`.
	///
	/// Empty passwords are ignored with a log line, and an already
	/// known identifier is left untouched. Both mirror how the server
	/// treats user lists at startup: tolerate, log, keep serving.
	pub fn insert(&self, id: &str, password: &str) {
		if password.is_empty() {
			warn!("user '{}' has an empty password, ignored", id);
			return;
		}
		let mut users = self.users.write().expect("user table lock poisoned");
		if users.contains_key(id) {
			debug!("user '{}' already registered", id);
			return;
		}
		users.insert(
			Tag::new(id),
			User {
				password: password.into(),
				cipher: Cipher::new(self.method, password),
			},
		);
	}

	/// Register `id`, replacing the prototype if the password changed.
	///
	/// Used by config reload. Connections already running keep their
	/// cloned cipher state.
	pub fn update(&self, id: &str, password: &str) {
		if password.is_empty() {
			warn!("user '{}' has an empty password, ignored", id);
			return;
		}
		let mut users = self.users.write().expect("user table lock poisoned");
		if let Some(user) = users.get(id) {
			if user.password == password {
				return;
			}
			info!("updating password of user '{}'", id);
		} else {
			info!("new user '{}' added", id);
		}
		users.insert(
			Tag::new(id),
			User {
				password: password.into(),
				cipher: Cipher::new(self.method, password),
			},
		);
	}

	/// Returns whether the identifier was present.
	pub fn remove(&self, id: &str) -> bool {
		self.users
			.write()
			.expect("user table lock poisoned")
			.remove(id)
			.is_some()
	}

	/// Clone the prototype for `id`, if any. The lock is never held
	/// across IO.
	#[must_use]
	pub fn lookup(&self, id: &str) -> Option<Cipher> {
		self.users
			.read()
			.expect("user table lock poisoned")
			.get(id)
			.map(|u| u.cipher.clone())
	}

	#[must_use]
	pub fn ids(&self) -> Vec<Tag> {
		self.users
			.read()
			.expect("user table lock poisoned")
			.keys()
			.cloned()
			.collect()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.users.read().expect("user table lock poisoned").len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
