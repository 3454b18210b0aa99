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

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::default_trait_access)]

use cloak_lib::{
	config::ConfigError,
	server::{manager, stat::Traffic, users::UserTable},
	Config, Manager, Server,
};
use logging::LogOutput;
use std::{io, net::SocketAddr, path::PathBuf, sync::Arc};
use structopt::StructOpt;
use tokio::runtime::Runtime;

type BoxStdErr = Box<dyn std::error::Error + Send + Sync>;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(StructOpt)]
#[structopt(name = "cloakd")]
pub struct AppOptions {
	/// Print version.
	#[structopt(long)]
	version: bool,

	/// Read config from file.
	#[structopt(short = "c", long, name = "CONF_PATH", default_value = "config.json")]
	config: String,

	/// Password of the single-user shorthand.
	#[structopt(short = "k", long, name = "PASSWORD")]
	password: Option<String>,

	/// User label of the single-user shorthand.
	#[structopt(short = "p", long, name = "SERVER_PORT")]
	server_port: Option<u16>,

	/// Idle timeout in seconds.
	#[structopt(short = "t", long, name = "TIMEOUT")]
	timeout: Option<u64>,

	/// Encryption method, default: aes-256-cfb.
	#[structopt(short = "m", long, name = "METHOD")]
	method: Option<String>,

	/// Listen port shared by all users.
	#[structopt(long, name = "GPORT", default_value = "8088")]
	gport: u16,

	/// Manager UDP listening address.
	#[structopt(long = "manager-address", name = "MANAGER_ADDR")]
	manager_address: Option<SocketAddr>,

	/// Print debug messages.
	#[structopt(short = "d", long)]
	debug: bool,

	/// Anonymize client addresses in all output.
	#[structopt(short = "A", long)]
	sanitize: bool,

	/// Set the log level. Must be one of ["debug", "info", "warn", "error"]
	#[structopt(long, name = "LOG_LEVEL")]
	log: Option<log::LevelFilter>,

	/// Set the output file for log.
	#[structopt(long, name = "LOG_FILE")]
	log_out: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum Error {
	#[error("[IO error] {0}")]
	Io(#[from] io::Error),
	#[error("[config] {0}")]
	Config(BoxStdErr),
	#[error("[runtime] {0}")]
	Runtime(BoxStdErr),
}

impl Error {
	#[inline]
	fn config(e: impl Into<BoxStdErr>) -> Self {
		Self::Config(e.into())
	}
}

fn main() -> Result<(), BoxStdErr> {
	let opts = AppOptions::from_args();
	if opts.version {
		println!("{}", VERSION);
		return Ok(());
	}
	serve(opts)?;
	Ok(())
}

fn serve(opts: AppOptions) -> Result<(), Error> {
	// ------ logging ------
	{
		let level = opts.log.unwrap_or(if opts.debug {
			log::LevelFilter::Debug
		} else {
			log::LevelFilter::Info
		});
		let output = match &opts.log_out {
			Some(s) => LogOutput::from_str(s),
			None => Some(LogOutput::Stdout),
		};
		logging::Log { level, output }
			.init_logger()
			.map_err(Error::Config)?;
	}

	// ------ configuration ------
	let cmd = Config {
		server_port: opts.server_port,
		password: opts.password.clone(),
		method: opts.method.clone(),
		timeout: opts.timeout,
		port_password: None,
	};
	let mut conf = match Config::read_file(&opts.config) {
		Ok(c) => c,
		Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
			log::warn!(
				"config file '{}' not found, using command line options only",
				opts.config
			);
			Config::default()
		}
		Err(e) => return Err(Error::config(e)),
	};
	conf.update_with(&cmd);

	// Unknown methods are fatal before any socket is opened.
	let method = conf.method().map_err(Error::config)?;
	let user_map = conf.unified_users().map_err(Error::config)?;
	let timeout_secs = usize::try_from(conf.timeout_secs()).map_err(Error::config)?;

	let users = Arc::new(UserTable::new(method));
	let traffic = Arc::new(Traffic::new());
	for (id, password) in &user_map {
		users.insert(id, password);
		let _ = traffic.get(id);
	}
	log::info!("{} users loaded, method {}", users.len(), method);

	let addr = SocketAddr::from(([0, 0, 0, 0], opts.gport));
	let server = Arc::new(Server::new(
		addr,
		users.clone(),
		traffic.clone(),
		timeout_secs,
		opts.sanitize,
	));

	let rt = Runtime::new()?;
	rt.block_on(async move {
		// Config reload on SIGHUP, delivered to the library through a
		// channel.
		let (reload_tx, reload_rx) = tokio::sync::mpsc::channel::<()>(1);
		tokio::spawn(manager::reload_users(
			reload_rx,
			PathBuf::from(&opts.config),
			users.clone(),
			traffic.clone(),
		));
		#[cfg(unix)]
		{
			use tokio::signal::unix::{signal, SignalKind};
			match signal(SignalKind::hangup()) {
				Ok(mut hup) => {
					tokio::spawn(async move {
						while hup.recv().await.is_some() {
							if reload_tx.send(()).await.is_err() {
								break;
							}
						}
					});
				}
				Err(e) => log::error!("cannot install SIGHUP handler ({})", e),
			}
		}

		let res = match opts.manager_address {
			Some(manager_addr) => {
				let daemon = Manager::new(manager_addr, users.clone(), traffic.clone());
				tokio::try_join!(server.serve(), daemon.serve()).map(|_| ())
			}
			None => server.serve().await,
		};
		res.map_err(|e| Error::Runtime(Box::new(e)))
	})
}

// ----------------------------------------------------------
//                          Logging
// ----------------------------------------------------------

mod logging {
	use crate::BoxStdErr;
	use fern::colors::{Color, ColoredLevelConfig};
	use log::{Level, LevelFilter};

	const STR_STDOUT: &str = "@stdout";
	const STR_STDERR: &str = "@stderr";
	const STR_NONE: &str = "@none";

	pub enum LogOutput {
		Stdout,
		Stderr,
		File(String),
	}

	impl LogOutput {
		pub fn is_colorful(&self) -> bool {
			matches!(self, Self::Stdout | Self::Stderr)
		}

		pub fn from_str(s: &str) -> Option<Self> {
			match s {
				STR_NONE => None,
				STR_STDOUT | "" => Some(LogOutput::Stdout),
				STR_STDERR => Some(LogOutput::Stderr),
				_ => Some(LogOutput::File(s.to_string())),
			}
		}
	}

	pub struct Log {
		pub level: LevelFilter,
		pub output: Option<LogOutput>,
	}

	impl Log {
		/// Initialize logger.
		///
		/// DO NOT call this function more than once!
		pub fn init_logger(&self) -> Result<(), BoxStdErr> {
			if let Some(output) = &self.output {
				let time_format = time::format_description::parse(
					"[year]-[month]-[day]T[hour]:[minute]:[second]Z",
				)
				.unwrap();
				let is_colorful = output.is_colorful();
				let colors = ColoredLevelConfig::new()
					.info(Color::Blue)
					.trace(Color::Magenta);
				let levels: &[String; 5] = {
					let strs = if is_colorful {
						[
							colors.color(Level::Error).to_string(),
							colors.color(Level::Warn).to_string(),
							colors.color(Level::Info).to_string(),
							colors.color(Level::Debug).to_string(),
							colors.color(Level::Trace).to_string(),
						]
					} else {
						[
							Level::Error.to_string(),
							Level::Warn.to_string(),
							Level::Info.to_string(),
							Level::Debug.to_string(),
							Level::Trace.to_string(),
						]
					};
					// This function should only be called once,
					// so it is ok to leak.
					Box::leak(Box::new(strs))
				};
				let dispatch =
					fern::Dispatch::new()
						.level(self.level)
						.format(move |out, message, record| {
							let time = time::OffsetDateTime::now_utc()
								.format(&time_format)
								.unwrap();
							let level = match record.level() {
								Level::Error => levels[0].as_str(),
								Level::Warn => levels[1].as_str(),
								Level::Info => levels[2].as_str(),
								Level::Debug => levels[3].as_str(),
								Level::Trace => levels[4].as_str(),
							};
							let target = record.target();
							out.finish(format_args!("[{time} {level} {target}] {message}"));
						});
				match &output {
					LogOutput::Stdout => dispatch.chain(std::io::stdout()),
					LogOutput::Stderr => dispatch.chain(std::io::stderr()),
					LogOutput::File(f) => dispatch.chain(fern::log_file(f)?),
				}
				.apply()?;
			}
			// Ignore empty output
			Ok(())
		}
	}
}
