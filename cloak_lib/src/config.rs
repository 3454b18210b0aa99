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
JSON configuration.

```json
{
	"method": "aes-256-cfb",
	"timeout": 300,
	"port_password": {
		"8387": "foobar",
		"8388": "barfoo"
	}
}
```

`port_password` keys are identifier labels, not listen ports: every
client announces one of them in its greeting, and all of them share the
single obfuscation listener. A lone `server_port`/`password` pair is
accepted as a one-user shorthand.
*/

use crate::{crypto::Method, prelude::*};
use serde::Deserialize;
use std::{collections::HashMap, path::Path};

pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("cannot read config file ({0})")]
	Io(#[from] std::io::Error),
	#[error("cannot parse config ({0})")]
	Parse(#[from] serde_json::Error),
	#[error("unknown cipher method '{0}'")]
	UnknownMethod(String),
	#[error("must specify both port and password")]
	NotEnoughOptions,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
	pub server_port: Option<u16>,
	pub password: Option<String>,
	pub method: Option<String>,
	pub timeout: Option<u64>,
	pub port_password: Option<HashMap<String, String>>,
}

impl Config {
	/// # Errors
	///
	/// Returns a [`ConfigError`] if the file cannot be read or parsed.
	pub fn read_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let content = std::fs::read_to_string(path)?;
		Ok(serde_json::from_str(&content)?)
	}

	/// Overlay `cmd` on top of `self`: every field set in `cmd` wins.
	pub fn update_with(&mut self, cmd: &Config) {
		if cmd.server_port.is_some() {
			self.server_port = cmd.server_port;
		}
		if cmd.password.is_some() {
			self.password = cmd.password.clone();
		}
		if cmd.method.is_some() {
			self.method = cmd.method.clone();
		}
		if cmd.timeout.is_some() {
			self.timeout = cmd.timeout;
		}
		if cmd.port_password.is_some() {
			self.port_password = cmd.port_password.clone();
		}
	}

	/// Resolve the cipher method, defaulting to aes-256-cfb.
	///
	/// # Errors
	///
	/// Returns [`ConfigError::UnknownMethod`] for method names outside
	/// the supported set. This is checked once at startup and treated
	/// as fatal.
	pub fn method(&self) -> Result<Method, ConfigError> {
		match self.method.as_deref() {
			None | Some("") => Ok(Method::default()),
			Some(name) => {
				Method::new_from_str(name).ok_or_else(|| ConfigError::UnknownMethod(name.into()))
			}
		}
	}

	#[must_use]
	pub fn timeout_secs(&self) -> u64 {
		self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)
	}

	/// Collapse `server_port`/`password` and `port_password` into one
	/// identifier → passphrase map.
	///
	/// # Errors
	///
	/// Returns [`ConfigError::NotEnoughOptions`] when neither form is
	/// usable.
	pub fn unified_users(&self) -> Result<HashMap<Tag, String>, ConfigError> {
		match &self.port_password {
			Some(pp) if !pp.is_empty() => {
				if self.password.is_some() || self.server_port.is_some() {
					warn!("given port_password, ignore server_port and password option");
				}
				Ok(pp
					.iter()
					.map(|(port, pass)| (Tag::new(port), pass.clone()))
					.collect())
			}
			_ => {
				let port = self.server_port.ok_or(ConfigError::NotEnoughOptions)?;
				let password = self
					.password
					.as_ref()
					.filter(|p| !p.is_empty())
					.ok_or(ConfigError::NotEnoughOptions)?;
				let mut map = HashMap::new();
				map.insert(Tag::new(port.to_string()), password.clone());
				Ok(map)
			}
		}
	}
}
