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

mod metrics;

use keyport_lib::{ConfigSnapshot, Metrics, NopMetrics, Server};
use logging::{Log, LogOutput};
use metrics::PromMetrics;
use std::{io, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use structopt::StructOpt;
use tokio::runtime::Runtime;

type BoxStdErr = Box<dyn std::error::Error + Send + Sync>;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(StructOpt)]
#[structopt(name = "keyport")]
pub struct AppOptions {
	/// Read access keys from this YAML file.
	#[structopt(short, long, name = "CONF_PATH")]
	config: Option<PathBuf>,

	/// Expose Prometheus metrics over HTTP on this address.
	#[structopt(long, name = "METRICS_ADDR")]
	metrics: Option<SocketAddr>,

	/// UDP session idle timeout in seconds.
	#[structopt(long, name = "SECONDS", default_value = "300")]
	udp_timeout: u64,

	/// Set the log level. Must be one of ["debug", "info", "warn", "error"].
	#[structopt(long, name = "LOG_LEVEL")]
	log: Option<log::LevelFilter>,

	/// Set the output for log ('@stdout', '@stderr' or a file path).
	#[structopt(long, name = "LOG_FILE")]
	log_out: Option<String>,

	/// Print version.
	#[structopt(long)]
	version: bool,
}

#[derive(Debug, thiserror::Error)]
enum Error {
	#[error("[IO error] {0}")]
	Io(#[from] io::Error),
	#[error("[input] {0}")]
	Input(BoxStdErr),
	#[error("[config] {0}")]
	Config(BoxStdErr),
	#[error("[runtime] {0}")]
	Runtime(BoxStdErr),
}

impl Error {
	#[inline]
	fn input(s: impl Into<BoxStdErr>) -> Self {
		Self::Input(s.into())
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
	let conf_path = opts.config.ok_or_else(|| Error::input("missing --config"))?;

	Log {
		level: opts.log.unwrap_or(log::LevelFilter::Info),
		output: opts
			.log_out
			.as_deref()
			.map_or(LogOutput::Stdout, LogOutput::from_str),
	}
	.init_logger()
	.map_err(Error::Config)?;

	let loader = move || -> Result<ConfigSnapshot, BoxStdErr> {
		let text = std::fs::read_to_string(&conf_path)
			.map_err(|e| format!("cannot read config file ({})", e))?;
		let snapshot: ConfigSnapshot =
			serde_yaml::from_str(&text).map_err(|e| format!("cannot parse config file ({})", e))?;
		Ok(snapshot)
	};

	let rt = Runtime::new()?;
	rt.block_on(async move {
		let sink: Arc<dyn Metrics> = if let Some(addr) = opts.metrics {
			let prom = PromMetrics::new().map_err(Error::Config)?;
			// A bad metrics address is fatal at startup.
			let task = prom.serve(addr).map_err(Error::Config)?;
			tokio::spawn(task);
			log::info!("Metrics on http://{}/metrics", addr);
			Arc::new(prom)
		} else {
			Arc::new(NopMetrics)
		};

		let mut server = Server::new(sink);
		server.set_udp_session_timeout(Duration::from_secs(opts.udp_timeout));
		server.run(loader).await.map_err(Error::Runtime)
	})
}

// ----------------------------------------------------------
//                         Logging
// ----------------------------------------------------------

mod logging {
	use crate::BoxStdErr;
	use fern::colors::{Color, ColoredLevelConfig};
	use log::{Level, LevelFilter};

	const STR_STDOUT: &str = "@stdout";
	const STR_STDERR: &str = "@stderr";

	pub enum LogOutput {
		Stdout,
		Stderr,
		File(String),
	}

	impl LogOutput {
		pub fn is_colorful(&self) -> bool {
			matches!(self, Self::Stdout | Self::Stderr)
		}

		pub fn from_str(s: &str) -> Self {
			match s {
				STR_STDOUT | "" => LogOutput::Stdout,
				STR_STDERR => LogOutput::Stderr,
				_ => LogOutput::File(s.to_string()),
			}
		}
	}

	pub struct Log {
		pub level: LevelFilter,
		pub output: LogOutput,
	}

	impl Log {
		/// Initialize the logger.
		///
		/// DO NOT call this function more than once!
		pub fn init_logger(&self) -> Result<(), BoxStdErr> {
			let time_format = time::format_description::parse(
				"[year]-[month]-[day]T[hour]:[minute]:[second]Z",
			)?;
			let is_colorful = self.output.is_colorful();
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
			let dispatch = fern::Dispatch::new().level(self.level).format(
				move |out, message, record| {
					let time = time::OffsetDateTime::now_utc()
						.format(&time_format)
						.unwrap_or_default();
					let level = match record.level() {
						Level::Error => levels[0].as_str(),
						Level::Warn => levels[1].as_str(),
						Level::Info => levels[2].as_str(),
						Level::Debug => levels[3].as_str(),
						Level::Trace => levels[4].as_str(),
					};
					let target = record.target();
					out.finish(format_args!("[{time} {level} {target}] {message}"));
				},
			);
			match &self.output {
				LogOutput::Stdout => dispatch.chain(std::io::stdout()),
				LogOutput::Stderr => dispatch.chain(std::io::stderr()),
				LogOutput::File(f) => dispatch.chain(fern::log_file(f)?),
			}
			.apply()?;
			Ok(())
		}
	}

}
