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
UDP relay for one port.

Every datagram is independent, so each one needs a key trial against the
port's key set; the session's key is tried first for clients with a live
NAT entry. Sessions map a client address to a dedicated outbound socket
with a return pump, and expire after a period of inactivity.
*/

use super::auth::{CipherEntry, KeySet};
use crate::{
	prelude::*,
	shadowsocks::udp::{open_datagram, seal_datagram},
	stat::{Direction, Metrics},
};
use futures::Future;
use std::{
	collections::HashMap,
	io,
	sync::{
		atomic::{AtomicBool, Ordering},
		RwLock,
	},
	time::{Duration, Instant},
};
use tokio::{net::UdpSocket, task::JoinHandle};

const UDP_BUFFER_SIZE: usize = 8 * 1024;
/// Interval between checking session timeout status.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

const STOPPED: bool = true;
const NOT_STOPPED: bool = !STOPPED;

type ArcMutex<T> = Arc<AsyncMutex<T>>;
type SessionMap = ArcMutex<HashMap<SocketAddr, Session>>;

/// NAT entry for one client address.
struct Session {
	entry: CipherEntry,
	socket: Arc<UdpSocket>,
	last_active: ArcMutex<Instant>,
	task: JoinHandle<()>,
}

impl Session {
	async fn expired(&self, now: Instant, max_idle: Duration) -> bool {
		now.saturating_duration_since(*self.last_active.lock().await) > max_idle
	}

	fn close(&mut self) {
		self.task.abort();
	}
}

/// The session table plus its sweep task.
///
/// Dropping the map stops the sweep task, which closes every remaining
/// session on its way out.
struct NatMap {
	sessions: SessionMap,
	stopped: Arc<AtomicBool>,
}

impl Drop for NatMap {
	fn drop(&mut self) {
		self.stopped.store(STOPPED, Ordering::Relaxed);
	}
}

impl NatMap {
	fn new(max_idle: Duration) -> (Self, impl Future<Output = ()>) {
		let sessions: SessionMap = Arc::new(AsyncMutex::new(HashMap::new()));
		let stopped = Arc::new(AtomicBool::new(NOT_STOPPED));
		let sweep_task = {
			let sessions = sessions.clone();
			let stopped = stopped.clone();
			async move {
				loop {
					if stopped.load(Ordering::Relaxed) == STOPPED {
						break;
					}
					tokio::time::sleep(SWEEP_INTERVAL).await;

					let mut sessions = sessions.lock().await;
					let now = Instant::now();
					let mut expired = Vec::new();
					for (client, sess) in sessions.iter() {
						if sess.expired(now, max_idle).await {
							expired.push(*client);
						}
					}
					for client in expired {
						if let Some(mut sess) = sessions.remove(&client) {
							debug!("UDP session for {} expired", client);
							sess.close();
						}
					}
				}
				// Clean up whatever is left.
				let mut sessions = sessions.lock().await;
				for (client, sess) in sessions.iter_mut() {
					trace!("Closing UDP session for {}", client);
					sess.close();
				}
				sessions.clear();
			}
		};
		(Self { sessions, stopped }, sweep_task)
	}

	/// Look up the session for `client`, refresh its activity and return
	/// its key id and outbound socket.
	async fn lookup(&self, client: &SocketAddr) -> Option<(Tag, Arc<UdpSocket>)> {
		let sessions = self.sessions.lock().await;
		if let Some(sess) = sessions.get(client) {
			*sess.last_active.lock().await = Instant::now();
			Some((sess.entry.id.clone(), sess.socket.clone()))
		} else {
			None
		}
	}

	async fn remove(&self, client: &SocketAddr) {
		if let Some(mut sess) = self.sessions.lock().await.remove(client) {
			sess.close();
		}
	}

	/// Allocate an outbound socket for `client`, spawn its return pump and
	/// register the session.
	async fn create_session(
		&self,
		main_socket: Arc<UdpSocket>,
		client: SocketAddr,
		entry: CipherEntry,
		metrics: Arc<dyn Metrics>,
	) -> io::Result<Arc<UdpSocket>> {
		let outbound =
			UdpSocket::bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)).await?;
		let outbound = Arc::new(outbound);
		let last_active = Arc::new(AsyncMutex::new(Instant::now()));

		debug!(
			"New UDP session for {} with key '{}' via {}",
			client,
			entry.id,
			outbound.local_addr()?
		);
		let task = tokio::spawn(return_pump(
			self.sessions.clone(),
			outbound.clone(),
			main_socket,
			client,
			entry.clone(),
			last_active.clone(),
			metrics,
		));
		self.sessions.lock().await.insert(
			client,
			Session {
				entry,
				socket: outbound.clone(),
				last_active,
				task,
			},
		);
		Ok(outbound)
	}
}

/// Serve one port's UDP socket until the task is aborted.
pub(super) async fn serve_socket(
	socket: UdpSocket,
	number: u16,
	keys: Arc<RwLock<Arc<KeySet>>>,
	metrics: Arc<dyn Metrics>,
	session_timeout: Duration,
) {
	let socket = Arc::new(socket);
	let (map, sweep_task) = NatMap::new(session_timeout);
	// The sweeper outlives an abort of this task so it can close the
	// remaining sessions.
	tokio::spawn(sweep_task);

	let mut buf = vec![0_u8; UDP_BUFFER_SIZE];
	loop {
		let (n, client) = match socket.recv_from(&mut buf).await {
			Ok(v) => v,
			Err(e) => {
				error!("UDP receive failed on port {} ({})", number, e);
				continue;
			}
		};

		let keys = keys.read().expect("key set lock poisoned").clone();
		let existing = map.lookup(&client).await;
		let hint = existing.as_ref().map(|(id, _)| id.clone());

		let (entry, target, payload) = match open_with_keys(&buf[..n], &keys, hint.as_ref()) {
			Some(v) => v,
			None => {
				metrics.add_udp_decrypt_failure();
				debug!(
					"Dropping undecryptable UDP datagram ({} bytes) from {}",
					n, client
				);
				continue;
			}
		};
		metrics.add_udp_packet(&entry.id, Direction::ClientToTarget, payload.len());

		let outbound = match existing {
			Some((_, socket)) => socket,
			None => {
				match map
					.create_session(socket.clone(), client, entry, metrics.clone())
					.await
				{
					Ok(s) => s,
					Err(e) => {
						error!("Cannot create UDP session for {} ({})", client, e);
						continue;
					}
				}
			}
		};

		trace!(
			"Forwarding UDP packet ({} bytes) from {} to {}",
			payload.len(),
			client,
			target
		);
		if let Err(e) = outbound.send_to(&payload, target.to_string()).await {
			error!(
				"Cannot forward UDP packet from {} to {} ({})",
				client, target, e
			);
			map.remove(&client).await;
		}
	}
}

/// Try every candidate key on a copy of `data` until one opens it.
fn open_with_keys(
	data: &[u8],
	keys: &KeySet,
	hint: Option<&Tag>,
) -> Option<(CipherEntry, SocksAddr, Vec<u8>)> {
	let mut scratch = Vec::with_capacity(data.len());
	for entry in keys.candidates(hint) {
		scratch.clear();
		scratch.extend_from_slice(data);
		match open_datagram(entry.algo(), entry.master_key(), &mut scratch) {
			Ok((addr, payload)) => {
				let payload = payload.to_vec();
				return Some((entry.clone(), addr, payload));
			}
			Err(e) => {
				trace!("Key '{}' cannot open datagram ({})", entry.id, e);
			}
		}
	}
	None
}

/// Pump datagrams from the session's outbound socket back to the client,
/// sealed under the session's key with the source address prefixed.
async fn return_pump(
	sessions: SessionMap,
	outbound: Arc<UdpSocket>,
	main_socket: Arc<UdpSocket>,
	client: SocketAddr,
	entry: CipherEntry,
	last_active: ArcMutex<Instant>,
	metrics: Arc<dyn Metrics>,
) {
	let mut buf = vec![0_u8; UDP_BUFFER_SIZE];
	let mut wire = Vec::with_capacity(UDP_BUFFER_SIZE);
	loop {
		let (n, src) = match outbound.recv_from(&mut buf).await {
			Ok(v) => v,
			Err(e) => {
				debug!("UDP return socket for {} failed ({})", client, e);
				break;
			}
		};
		*last_active.lock().await = Instant::now();

		if let Err(e) = seal_datagram(
			entry.algo(),
			entry.master_key(),
			&SocksAddr::from(src),
			&buf[..n],
			&mut wire,
		) {
			error!("Cannot seal UDP response for {} ({})", client, e);
			continue;
		}
		if let Err(e) = main_socket.send_to(&wire, client).await {
			debug!("Cannot send UDP response to {} ({})", client, e);
			break;
		}
		metrics.add_udp_packet(&entry.id, Direction::TargetToClient, n);
	}
	// The session is dead; drop its entry. Aborting our own task handle
	// here is harmless, the pump is already done.
	if let Some(mut sess) = sessions.lock().await.remove(&client) {
		sess.close();
	}
}
