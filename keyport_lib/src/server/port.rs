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
	auth::{find_access_key, KeySet, ProbeCache},
	udp,
};
use crate::{
	prelude::*,
	relay::Relay,
	stat::{Metrics, MeteredReadHalf, MeteredWriteHalf, ProxyTraffic, Status},
	utils::BytesCount,
};
use futures::FutureExt;
use std::{
	io,
	panic::AssertUnwindSafe,
	sync::RwLock,
	time::{Duration, Instant},
};
use tokio::{
	net::{TcpListener, TcpStream, UdpSocket},
	task::JoinHandle,
};

#[derive(Debug, thiserror::Error)]
pub enum StartError {
	#[error("failed to start TCP on port {port} ({source})")]
	BindTcp { port: u16, source: io::Error },
	#[error("failed to start UDP on port {port} ({source})")]
	BindUdp { port: u16, source: io::Error },
}

/// One listening endpoint: a TCP listener and a UDP socket on the same
/// port number, sharing a live key set.
///
/// The key set can be swapped at any time; handlers snapshot it when
/// their connection is accepted and keep that snapshot for their whole
/// lifetime.
pub struct Port {
	number: u16,
	keys: Arc<RwLock<Arc<KeySet>>>,
	tcp_task: JoinHandle<()>,
	udp_task: JoinHandle<()>,
}

impl Port {
	/// Bind TCP and UDP on `number` and start serving.
	///
	/// Port 0 binds an ephemeral port; TCP and UDP still share the same
	/// number.
	///
	/// # Errors
	///
	/// Returns a [`StartError`] if either socket cannot be bound.
	pub async fn start(
		number: u16,
		keys: Arc<KeySet>,
		metrics: Arc<dyn Metrics>,
		udp_session_timeout: Duration,
	) -> Result<Self, StartError> {
		let bind_addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), number);
		let listener = TcpListener::bind(bind_addr)
			.await
			.map_err(|source| StartError::BindTcp { port: number, source })?;
		let number = listener
			.local_addr()
			.map_err(|source| StartError::BindTcp { port: number, source })?
			.port();
		let socket = UdpSocket::bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), number))
			.await
			.map_err(|source| StartError::BindUdp { port: number, source })?;

		let keys = Arc::new(RwLock::new(keys));
		let tcp_task = tokio::spawn(serve_tcp(
			listener,
			number,
			keys.clone(),
			metrics.clone(),
		));
		let udp_task = tokio::spawn(udp::serve_socket(
			socket,
			number,
			keys.clone(),
			metrics,
			udp_session_timeout,
		));
		Ok(Self {
			number,
			keys,
			tcp_task,
			udp_task,
		})
	}

	#[inline]
	#[must_use]
	pub fn number(&self) -> u16 {
		self.number
	}

	/// Swap the live key set. Only newly accepted connections and newly
	/// received datagrams observe the new set.
	pub fn replace_keys(&self, new_keys: Arc<KeySet>) {
		*self.keys.write().expect("key set lock poisoned") = new_keys;
	}

	#[must_use]
	pub fn current_keys(&self) -> Arc<KeySet> {
		self.keys.read().expect("key set lock poisoned").clone()
	}

	/// Close both sockets. The accept loop and the UDP pump stop; handlers
	/// of connections already accepted run to completion.
	pub fn stop(&self) {
		self.tcp_task.abort();
		self.udp_task.abort();
	}
}

impl Drop for Port {
	fn drop(&mut self) {
		self.stop();
	}
}

async fn serve_tcp(
	listener: TcpListener,
	number: u16,
	keys: Arc<RwLock<Arc<KeySet>>>,
	metrics: Arc<dyn Metrics>,
) {
	let cache = Arc::new(ProbeCache::default());
	loop {
		let (stream, peer) = match listener.accept().await {
			Ok(v) => v,
			Err(e) => {
				error!("Failed to accept on port {} ({})", number, e);
				continue;
			}
		};
		metrics.add_open_tcp_connection();
		let keys = keys.read().expect("key set lock poisoned").clone();
		let cache = cache.clone();
		let metrics = metrics.clone();
		tokio::spawn(handle_conn(stream, peer, keys, cache, metrics));
	}
}

async fn handle_conn(
	stream: TcpStream,
	peer: SocketAddr,
	keys: Arc<KeySet>,
	cache: Arc<ProbeCache>,
	metrics: Arc<dyn Metrics>,
) {
	let start = Instant::now();
	let traffic = ProxyTraffic::default();

	let result = AssertUnwindSafe(serve_conn(stream, peer, &keys, &cache, &traffic))
		.catch_unwind()
		.await;
	let (key_id, status) = match result {
		Ok((key_id, Ok(()))) => (key_id, Status::Ok),
		Ok((key_id, Err(e))) => {
			warn!("[TCP {}] closed with {} ({})", peer, e.status, e.source);
			(key_id, e.status)
		}
		Err(payload) => {
			error!("Panic in TCP handler: {}", panic_message(payload.as_ref()));
			(Tag::default(), Status::ErrRelay)
		}
	};

	let duration = start.elapsed();
	debug!(
		"[TCP {}] done with status {}, {} received, {} sent, lasted {} secs",
		peer,
		status,
		BytesCount(traffic.client_proxy.get()),
		BytesCount(traffic.proxy_client.get()),
		duration.as_secs()
	);
	metrics.add_closed_tcp_connection(&key_id, status, &traffic, duration);
}

struct ConnError {
	status: Status,
	source: BoxStdErr,
}

impl ConnError {
	fn new(status: Status, source: impl Into<BoxStdErr>) -> Self {
		Self {
			status,
			source: source.into(),
		}
	}
}

async fn serve_conn(
	stream: TcpStream,
	peer: SocketAddr,
	keys: &KeySet,
	cache: &ProbeCache,
	traffic: &ProxyTraffic,
) -> (Tag, Result<(), ConnError>) {
	enable_keepalive(&stream);
	let (r, w) = stream.into_split();
	// Client leg counters see the wire (ciphertext) bytes.
	let r = MeteredReadHalf::new(r, traffic.client_proxy.clone());
	let w = MeteredWriteHalf::new(w, traffic.proxy_client.clone());

	let (key_id, mut cr, cw) = match find_access_key(r, w, peer.ip(), keys, cache).await {
		Ok(v) => v,
		Err(e) => {
			return (
				Tag::default(),
				Err(ConnError::new(Status::ErrCipher, e)),
			)
		}
	};

	let addr = match SocksAddr::async_read_from(&mut cr).await {
		Ok(a) => a,
		Err(e) => return (key_id, Err(ConnError::new(Status::ErrReadAddress, e))),
	};
	debug!("[TCP {}] key '{}' proxying to {}", peer, key_id, addr);

	let target = match TcpStream::connect(addr.to_string()).await {
		Ok(t) => t,
		Err(e) => return (key_id, Err(ConnError::new(Status::ErrConnect, e))),
	};
	enable_keepalive(&target);
	let (tr, tw) = target.into_split();
	// Target leg counters see the plaintext bytes.
	let tr = MeteredReadHalf::new(tr, traffic.target_proxy.clone());
	let tw = MeteredWriteHalf::new(tw, traffic.proxy_target.clone());

	let conn_tag = format!("{} -> {}", peer, addr);
	match Relay::new(&conn_tag).relay_stream(cr, cw, tr, tw).await {
		Ok(()) => (key_id, Ok(())),
		Err(e) => (key_id, Err(ConnError::new(Status::ErrRelay, e))),
	}
}

fn enable_keepalive(stream: &TcpStream) {
	if let Err(e) = socket2::SockRef::from(stream).set_keepalive(true) {
		debug!("Cannot enable TCP keepalive ({})", e);
	}
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
	if let Some(s) = payload.downcast_ref::<&str>() {
		s
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s
	} else {
		"unknown panic payload"
	}
}
