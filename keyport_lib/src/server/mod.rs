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

pub mod auth;
mod port;
mod udp;

pub use auth::{find_access_key, AuthError, CipherEntry, KeySet, ProbeCache};
pub use port::{Port, StartError};

use crate::{
	config::ConfigSnapshot,
	prelude::*,
	stat::Metrics,
};
use std::{collections::HashMap, time::Duration};
use tokio::signal::unix::{signal, SignalKind};

pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
	#[error("invalid access key '{id}' ({reason})")]
	InvalidKey {
		id: String,
		reason: Cow<'static, str>,
	},
	#[error(transparent)]
	Bind(#[from] StartError),
}

/// The set of live ports, driven by configuration snapshots.
pub struct Server {
	metrics: Arc<dyn Metrics>,
	ports: HashMap<u16, Port>,
	udp_session_timeout: Duration,
}

impl Server {
	#[must_use]
	pub fn new(metrics: Arc<dyn Metrics>) -> Self {
		Self {
			metrics,
			ports: HashMap::new(),
			udp_session_timeout: DEFAULT_UDP_TIMEOUT,
		}
	}

	pub fn set_udp_session_timeout(&mut self, timeout: Duration) {
		self.udp_session_timeout = timeout;
	}

	pub fn port_numbers(&self) -> impl Iterator<Item = u16> + '_ {
		self.ports.keys().copied()
	}

	#[must_use]
	pub fn get_port(&self, number: u16) -> Option<&Port> {
		self.ports.get(&number)
	}

	/// Move the server to the state described by `snapshot`.
	///
	/// All ciphers are built and validated before any port is touched, so
	/// a bad key leaves the current state unchanged. Ports disappearing
	/// from the snapshot are stopped, new ones are started, and ports
	/// present in both have their key set swapped; in-flight connections
	/// on surviving ports are not disturbed.
	///
	/// # Errors
	///
	/// Returns an [`ApplyError`] on invalid keys, or on a bind failure
	/// (in which case ports already modified stay modified).
	pub async fn apply(&mut self, snapshot: &ConfigSnapshot) -> Result<(), ApplyError> {
		let mut desired: HashMap<u16, KeySet> = HashMap::new();
		for key in &snapshot.keys {
			if key.id.is_empty() {
				return Err(ApplyError::InvalidKey {
					id: key.id.clone(),
					reason: "id must not be empty".into(),
				});
			}
			if key.port == 0 {
				return Err(ApplyError::InvalidKey {
					id: key.id.clone(),
					reason: "port must be in 1..65535".into(),
				});
			}
			let entry = CipherEntry::new(key.id.as_str(), key.cipher, &key.secret);
			let set = desired.entry(key.port).or_default();
			if set.insert(entry).is_some() {
				warn!(
					"Duplicate access key '{}' on port {}, the later entry wins",
					key.id, key.port
				);
			}
		}

		let removed: Vec<u16> = self
			.ports
			.keys()
			.copied()
			.filter(|p| !desired.contains_key(p))
			.collect();
		for number in removed {
			if let Some(port) = self.ports.remove(&number) {
				port.stop();
				info!("Stopped TCP and UDP on port {}", number);
			}
		}

		for (number, set) in desired {
			let set = Arc::new(set);
			if let Some(port) = self.ports.get(&number) {
				port.replace_keys(set);
			} else {
				let port = Port::start(
					number,
					set,
					self.metrics.clone(),
					self.udp_session_timeout,
				)
				.await?;
				info!("Listening TCP and UDP on port {}", number);
				self.ports.insert(number, port);
			}
		}

		info!(
			"Loaded {} access keys on {} ports",
			snapshot.keys.len(),
			self.ports.len()
		);
		self.metrics
			.set_num_access_keys(snapshot.keys.len(), self.ports.len());
		Ok(())
	}

	/// Apply the initial configuration, then serve until terminated.
	///
	/// SIGHUP reloads the configuration through `load` and re-applies it;
	/// reload failures are logged and the previous state is kept. SIGINT
	/// and SIGTERM return cleanly.
	///
	/// # Errors
	///
	/// Returns an error if the initial load or apply fails, or if signal
	/// handlers cannot be installed.
	pub async fn run<L>(mut self, mut load: L) -> Result<(), BoxStdErr>
	where
		L: FnMut() -> Result<ConfigSnapshot, BoxStdErr> + Send,
	{
		self.apply(&load()?).await?;

		let mut hangup = signal(SignalKind::hangup())?;
		let mut terminate = signal(SignalKind::terminate())?;
		loop {
			tokio::select! {
				_ = hangup.recv() => {
					info!("Reloading configuration");
					match load() {
						Ok(snapshot) => {
							if let Err(e) = self.apply(&snapshot).await {
								error!("Could not apply new configuration ({})", e);
							}
						}
						Err(e) => error!("Could not reload configuration ({})", e),
					}
				}
				_ = terminate.recv() => {
					info!("Received SIGTERM, shutting down");
					break;
				}
				res = tokio::signal::ctrl_c() => {
					res?;
					info!("Received interrupt, shutting down");
					break;
				}
			}
		}

		for (_, port) in self.ports.drain() {
			port.stop();
		}
		Ok(())
	}
}
