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

mod metered;

pub use metered::{MeteredReadHalf, MeteredWriteHalf};

use std::{
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};

/// Wrapper for `Arc<AtomicU64>`.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
	#[inline]
	#[must_use]
	pub fn new(v: u64) -> Self {
		Self(Arc::new(AtomicU64::new(v)))
	}

	/// Returns the current value of the counter.
	#[inline]
	#[must_use]
	pub fn get(&self) -> u64 {
		self.0.load(Ordering::Relaxed)
	}

	/// Adds `v` into the counter and returns the old value.
	#[inline]
	pub fn add(&self, v: u64) -> u64 {
		self.0.fetch_add(v, Ordering::Relaxed)
	}
}

/// Terminal status of one TCP connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
	Ok,
	/// No access key matched the client handshake.
	ErrCipher,
	/// Target address parse failed after authentication.
	ErrReadAddress,
	/// Outbound TCP dial failed.
	ErrConnect,
	/// I/O error during relay.
	ErrRelay,
}

impl Status {
	#[inline]
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Status::Ok => "OK",
			Status::ErrCipher => "ERR_CIPHER",
			Status::ErrReadAddress => "ERR_READ_ADDRESS",
			Status::ErrConnect => "ERR_CONNECT",
			Status::ErrRelay => "ERR_RELAY",
		}
	}
}

impl std::fmt::Display for Status {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Direction of a relayed UDP packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
	ClientToTarget,
	TargetToClient,
}

impl Direction {
	#[inline]
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Direction::ClientToTarget => "client_to_target",
			Direction::TargetToClient => "target_to_client",
		}
	}
}

/// Byte counters of one TCP connection.
///
/// The client pair counts ciphertext on the wire; the target pair counts
/// plaintext on the upstream socket.
#[derive(Clone, Default)]
pub struct ProxyTraffic {
	pub client_proxy: Counter,
	pub proxy_client: Counter,
	pub proxy_target: Counter,
	pub target_proxy: Counter,
}

/// Sink for everything the proxy core wants to report.
///
/// Implementations must be cheap and safe to call from many tasks.
pub trait Metrics: Send + Sync {
	fn add_open_tcp_connection(&self);

	fn add_closed_tcp_connection(
		&self,
		key_id: &str,
		status: Status,
		traffic: &ProxyTraffic,
		duration: Duration,
	);

	fn add_udp_packet(&self, key_id: &str, direction: Direction, bytes: usize);

	fn add_udp_decrypt_failure(&self);

	fn set_num_access_keys(&self, key_count: usize, port_count: usize);
}

/// A sink that throws everything away.
pub struct NopMetrics;

impl Metrics for NopMetrics {
	fn add_open_tcp_connection(&self) {}

	fn add_closed_tcp_connection(
		&self,
		_key_id: &str,
		_status: Status,
		_traffic: &ProxyTraffic,
		_duration: Duration,
	) {
	}

	fn add_udp_packet(&self, _key_id: &str, _direction: Direction, _bytes: usize) {}

	fn add_udp_decrypt_failure(&self) {}

	fn set_num_access_keys(&self, _key_count: usize, _port_count: usize) {}
}
