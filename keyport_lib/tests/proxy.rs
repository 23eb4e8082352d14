use keyport_lib::{
	config::{AccessKey, ConfigSnapshot},
	protocol::SocksAddr,
	server::{
		auth::{wrap_client, CipherEntry},
		KeySet, Port, Server,
	},
	shadowsocks::{self, Method},
	stat::{Direction, Metrics, ProxyTraffic, Status},
};
use std::{
	net::{Ipv4Addr, SocketAddr},
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};
use tokio::{
	io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
	net::{TcpListener, TcpStream, UdpSocket},
	task::JoinHandle,
};

const UDP_TIMEOUT: Duration = Duration::from_secs(300);

fn init_log() {
	let _ = env_logger::builder().is_test(true).try_init();
}

// ------------------------------------------------------------------
//                        recording metrics
// ------------------------------------------------------------------

struct ClosedConn {
	key_id: String,
	status: Status,
	client_proxy: u64,
	proxy_client: u64,
	proxy_target: u64,
	target_proxy: u64,
}

#[derive(Default)]
struct RecordingMetrics {
	opened: AtomicUsize,
	closed: Mutex<Vec<ClosedConn>>,
	udp_packets: Mutex<Vec<(String, Direction, usize)>>,
	udp_failures: AtomicUsize,
	key_counts: Mutex<Vec<(usize, usize)>>,
}

impl RecordingMetrics {
	fn closed_count(&self) -> usize {
		self.closed.lock().unwrap().len()
	}
}

impl Metrics for RecordingMetrics {
	fn add_open_tcp_connection(&self) {
		self.opened.fetch_add(1, Ordering::Relaxed);
	}

	fn add_closed_tcp_connection(
		&self,
		key_id: &str,
		status: Status,
		traffic: &ProxyTraffic,
		_duration: Duration,
	) {
		self.closed.lock().unwrap().push(ClosedConn {
			key_id: key_id.to_string(),
			status,
			client_proxy: traffic.client_proxy.get(),
			proxy_client: traffic.proxy_client.get(),
			proxy_target: traffic.proxy_target.get(),
			target_proxy: traffic.target_proxy.get(),
		});
	}

	fn add_udp_packet(&self, key_id: &str, direction: Direction, bytes: usize) {
		self.udp_packets
			.lock()
			.unwrap()
			.push((key_id.to_string(), direction, bytes));
	}

	fn add_udp_decrypt_failure(&self) {
		self.udp_failures.fetch_add(1, Ordering::Relaxed);
	}

	fn set_num_access_keys(&self, key_count: usize, port_count: usize) {
		self.key_counts.lock().unwrap().push((key_count, port_count));
	}
}

// ------------------------------------------------------------------
//                            helpers
// ------------------------------------------------------------------

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
	for _ in 0..500 {
		if cond() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("timed out waiting for {}", what);
}

/// TCP echo server on an ephemeral port; serves any number of
/// connections and records each peer address.
async fn spawn_echo_server() -> (SocketAddr, Arc<Mutex<Vec<SocketAddr>>>, JoinHandle<()>) {
	let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
	let addr = listener.local_addr().unwrap();
	let peers = Arc::new(Mutex::new(Vec::new()));
	let handle = {
		let peers = peers.clone();
		tokio::spawn(async move {
			loop {
				let (mut stream, peer) = match listener.accept().await {
					Ok(v) => v,
					Err(_) => return,
				};
				peers.lock().unwrap().push(peer);
				tokio::spawn(async move {
					let mut buffer = [0_u8; 4 * 1024];
					loop {
						let len = match stream.read(&mut buffer).await {
							Ok(0) | Err(_) => return,
							Ok(len) => len,
						};
						if stream.write_all(&buffer[..len]).await.is_err() {
							return;
						}
					}
				});
			}
		})
	};
	(addr, peers, handle)
}

/// Connect through the proxy with `entry` and send the target address.
async fn connect_client(
	proxy: SocketAddr,
	entry: &CipherEntry,
	target: SocketAddr,
) -> (
	impl AsyncRead + Unpin,
	impl AsyncWrite + Unpin,
) {
	let stream = TcpStream::connect(proxy).await.unwrap();
	let (r, w) = stream.into_split();
	let (cr, mut cw) = wrap_client(entry, r, w);
	let mut buf = Vec::new();
	SocksAddr::from(target).write_to(&mut buf);
	cw.write_all(&buf).await.unwrap();
	(cr, cw)
}

fn single_key_set(id: &str, method: Method, secret: &str) -> Arc<KeySet> {
	Arc::new([CipherEntry::new(id, method, secret)].into_iter().collect())
}

fn free_port() -> u16 {
	std::net::TcpListener::bind("127.0.0.1:0")
		.unwrap()
		.local_addr()
		.unwrap()
		.port()
}

fn access_key(id: &str, port: u16, cipher: &str, secret: &str) -> AccessKey {
	AccessKey {
		id: id.to_string(),
		port,
		cipher: Method::new_from_str(cipher).unwrap(),
		secret: secret.to_string(),
	}
}

// ------------------------------------------------------------------
//                              TCP
// ------------------------------------------------------------------

#[test]
fn single_key_happy_path() {
	init_log();
	let rt = tokio::runtime::Runtime::new().unwrap();
	rt.block_on(async {
		let metrics = Arc::new(RecordingMetrics::default());
		let keys = single_key_set("k", Method::Chacha20Poly1305, "abc");
		let port = Port::start(0, keys, metrics.clone(), UDP_TIMEOUT)
			.await
			.unwrap();
		let proxy = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port.number());
		let (echo_addr, _peers, _echo) = spawn_echo_server().await;

		let entry = CipherEntry::new("k", Method::Chacha20Poly1305, "abc");
		let (mut cr, mut cw) = connect_client(proxy, &entry, echo_addr).await;
		cw.write_all(b"HELLO").await.unwrap();
		let mut buf = [0_u8; 5];
		cr.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"HELLO");
		cw.shutdown().await.unwrap();
		let mut rest = Vec::new();
		cr.read_to_end(&mut rest).await.unwrap();
		assert!(rest.is_empty());

		wait_for("closed connection", || metrics.closed_count() == 1).await;
		assert_eq!(metrics.opened.load(Ordering::Relaxed), 1);
		let closed = metrics.closed.lock().unwrap();
		let conn = &closed[0];
		assert_eq!(conn.key_id, "k");
		assert_eq!(conn.status, Status::Ok);
		// Ciphertext on the client leg carries salt, length parts and tags
		// on top of the 5 payload bytes.
		assert!(conn.client_proxy > 5);
		assert!(conn.proxy_client > 5);
		// Plaintext on the target leg; the address prefix is consumed by
		// the proxy and never forwarded.
		assert_eq!(conn.proxy_target, 5);
		assert_eq!(conn.target_proxy, 5);

		port.stop();
	});
}

#[test]
fn two_tenant_probe_selects_right_key() {
	init_log();
	let rt = tokio::runtime::Runtime::new().unwrap();
	rt.block_on(async {
		let metrics = Arc::new(RecordingMetrics::default());
		let keys: Arc<KeySet> = Arc::new(
			[
				CipherEntry::new("k1", Method::Aes128Gcm, "secret1"),
				CipherEntry::new("k2", Method::Aes256Gcm, "secret2"),
			]
			.into_iter()
			.collect(),
		);
		let port = Port::start(0, keys, metrics.clone(), UDP_TIMEOUT)
			.await
			.unwrap();
		let proxy = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port.number());
		let (echo_addr, _peers, _echo) = spawn_echo_server().await;

		let entry = CipherEntry::new("k2", Method::Aes256Gcm, "secret2");
		let (mut cr, mut cw) = connect_client(proxy, &entry, echo_addr).await;
		cw.write_all(b"probe me").await.unwrap();
		let mut buf = [0_u8; 8];
		cr.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"probe me");
		cw.shutdown().await.unwrap();
		let mut rest = Vec::new();
		cr.read_to_end(&mut rest).await.unwrap();

		wait_for("closed connection", || metrics.closed_count() == 1).await;
		let closed = metrics.closed.lock().unwrap();
		assert_eq!(closed[0].key_id, "k2");
		assert_eq!(closed[0].status, Status::Ok);

		port.stop();
	});
}

#[test]
fn unknown_key_is_rejected_without_dialing() {
	init_log();
	let rt = tokio::runtime::Runtime::new().unwrap();
	rt.block_on(async {
		let metrics = Arc::new(RecordingMetrics::default());
		let keys: Arc<KeySet> = Arc::new(
			[
				CipherEntry::new("k1", Method::Aes128Gcm, "secret1"),
				CipherEntry::new("k2", Method::Aes256Gcm, "secret2"),
			]
			.into_iter()
			.collect(),
		);
		let port = Port::start(0, keys, metrics.clone(), UDP_TIMEOUT)
			.await
			.unwrap();
		let proxy = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port.number());
		let (echo_addr, peers, _echo) = spawn_echo_server().await;

		let stranger = CipherEntry::new("k1", Method::Aes128Gcm, "secret_wrong");
		let (mut cr, mut cw) = connect_client(proxy, &stranger, echo_addr).await;
		cw.write_all(b"anyone there?").await.unwrap();
		// The server closes the connection without a response.
		let mut rest = Vec::new();
		let _ = cr.read_to_end(&mut rest).await;
		assert!(rest.is_empty());

		wait_for("closed connection", || metrics.closed_count() == 1).await;
		let closed = metrics.closed.lock().unwrap();
		assert_eq!(closed[0].status, Status::ErrCipher);
		assert_eq!(closed[0].key_id, "");
		// The target was never dialed.
		assert!(peers.lock().unwrap().is_empty());

		port.stop();
	});
}

#[test]
fn replacing_keys_keeps_existing_connections() {
	init_log();
	let rt = tokio::runtime::Runtime::new().unwrap();
	rt.block_on(async {
		let metrics = Arc::new(RecordingMetrics::default());
		let port = Port::start(
			0,
			single_key_set("k1", Method::Aes128Gcm, "secret1"),
			metrics.clone(),
			UDP_TIMEOUT,
		)
		.await
		.unwrap();
		let proxy = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port.number());
		let (echo_addr, _peers, _echo) = spawn_echo_server().await;

		let k1 = CipherEntry::new("k1", Method::Aes128Gcm, "secret1");
		let (mut cr, mut cw) = connect_client(proxy, &k1, echo_addr).await;
		cw.write_all(b"one").await.unwrap();
		let mut buf = [0_u8; 3];
		cr.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"one");

		// Swap the key set under the live connection.
		port.replace_keys(Arc::new(
			[
				CipherEntry::new("k2", Method::Aes256Gcm, "secret2"),
				CipherEntry::new("k3", Method::Chacha20Poly1305, "secret3"),
			]
			.into_iter()
			.collect(),
		));

		// The in-flight connection still uses its original key set.
		cw.write_all(b"two").await.unwrap();
		cr.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"two");
		cw.shutdown().await.unwrap();
		let mut rest = Vec::new();
		cr.read_to_end(&mut rest).await.unwrap();

		// A new connection with the old key is rejected.
		let (mut cr, mut cw) = connect_client(proxy, &k1, echo_addr).await;
		cw.write_all(b"three").await.unwrap();
		let mut rest = Vec::new();
		let _ = cr.read_to_end(&mut rest).await;
		assert!(rest.is_empty());

		// A new connection with a new key works.
		let k2 = CipherEntry::new("k2", Method::Aes256Gcm, "secret2");
		let (mut cr, mut cw) = connect_client(proxy, &k2, echo_addr).await;
		cw.write_all(b"four").await.unwrap();
		let mut buf = [0_u8; 4];
		cr.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"four");
		cw.shutdown().await.unwrap();
		let mut rest = Vec::new();
		cr.read_to_end(&mut rest).await.unwrap();

		wait_for("closed connections", || metrics.closed_count() == 3).await;
		let statuses: Vec<Status> = {
			let closed = metrics.closed.lock().unwrap();
			closed.iter().map(|c| c.status).collect()
		};
		assert_eq!(
			statuses.iter().filter(|s| **s == Status::Ok).count(),
			2
		);
		assert_eq!(
			statuses.iter().filter(|s| **s == Status::ErrCipher).count(),
			1
		);

		port.stop();
	});
}

// ------------------------------------------------------------------
//                        server / reload
// ------------------------------------------------------------------

#[test]
fn apply_adds_removes_and_is_idempotent() {
	init_log();
	let rt = tokio::runtime::Runtime::new().unwrap();
	rt.block_on(async {
		let metrics = Arc::new(RecordingMetrics::default());
		let mut server = Server::new(metrics.clone());
		let (echo_addr, _peers, _echo) = spawn_echo_server().await;

		let port_a = free_port();
		let port_b = free_port();

		let snapshot_a = ConfigSnapshot {
			keys: vec![access_key("k1", port_a, "chacha20-ietf-poly1305", "s1")],
		};
		server.apply(&snapshot_a).await.unwrap();
		assert_eq!(server.port_numbers().collect::<Vec<_>>(), vec![port_a]);

		let k1 = CipherEntry::new("k1", Method::Chacha20Poly1305, "s1");
		let proxy_a = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port_a);
		let (mut cr, mut cw) = connect_client(proxy_a, &k1, echo_addr).await;
		cw.write_all(b"ping").await.unwrap();
		let mut buf = [0_u8; 4];
		cr.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"ping");

		// Reload with an extra port; the connection on A keeps working.
		let snapshot_ab = ConfigSnapshot {
			keys: vec![
				access_key("k1", port_a, "chacha20-ietf-poly1305", "s1"),
				access_key("k2", port_b, "aes-256-gcm", "s2"),
			],
		};
		server.apply(&snapshot_ab).await.unwrap();
		let mut ports: Vec<u16> = server.port_numbers().collect();
		ports.sort_unstable();
		let mut expected = vec![port_a, port_b];
		expected.sort_unstable();
		assert_eq!(ports, expected);

		cw.write_all(b"pong").await.unwrap();
		cr.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"pong");

		let k2 = CipherEntry::new("k2", Method::Aes256Gcm, "s2");
		let proxy_b = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port_b);
		let (mut br, mut bw) = connect_client(proxy_b, &k2, echo_addr).await;
		bw.write_all(b"on b").await.unwrap();
		br.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"on b");

		// Applying the same snapshot twice changes nothing.
		server.apply(&snapshot_ab).await.unwrap();
		let mut ports2: Vec<u16> = server.port_numbers().collect();
		ports2.sort_unstable();
		assert_eq!(ports, ports2);

		// Remove port B; the in-flight connection on it continues, new
		// connections are refused.
		server.apply(&snapshot_a).await.unwrap();
		assert_eq!(server.port_numbers().collect::<Vec<_>>(), vec![port_a]);

		bw.write_all(b"late").await.unwrap();
		br.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"late");

		// The listener is closed now.
		wait_for("port B refusing connections", || {
			std::net::TcpStream::connect_timeout(
				&proxy_b,
				Duration::from_millis(100),
			)
			.is_err()
		})
		.await;

		assert_eq!(
			metrics.key_counts.lock().unwrap().as_slice(),
			&[(1, 1), (2, 2), (2, 2), (1, 1)]
		);
	});
}

#[test]
fn apply_rejects_invalid_keys_atomically() {
	init_log();
	let rt = tokio::runtime::Runtime::new().unwrap();
	rt.block_on(async {
		let metrics = Arc::new(RecordingMetrics::default());
		let mut server = Server::new(metrics);
		let port_a = free_port();

		let good = ConfigSnapshot {
			keys: vec![access_key("k1", port_a, "aes-128-gcm", "s1")],
		};
		server.apply(&good).await.unwrap();

		// A snapshot with a bad key must not change anything.
		let bad = ConfigSnapshot {
			keys: vec![
				access_key("k1", free_port(), "aes-128-gcm", "s1"),
				AccessKey {
					id: String::new(),
					port: 1,
					cipher: Method::Aes128Gcm,
					secret: "s".to_string(),
				},
			],
		};
		assert!(server.apply(&bad).await.is_err());
		assert_eq!(server.port_numbers().collect::<Vec<_>>(), vec![port_a]);
	});
}

// ------------------------------------------------------------------
//                              UDP
// ------------------------------------------------------------------

async fn spawn_udp_echo() -> (SocketAddr, Arc<Mutex<Vec<SocketAddr>>>, JoinHandle<()>) {
	let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
	let addr = socket.local_addr().unwrap();
	let peers = Arc::new(Mutex::new(Vec::new()));
	let handle = {
		let peers = peers.clone();
		tokio::spawn(async move {
			let mut buf = [0_u8; 4 * 1024];
			loop {
				let (n, peer) = match socket.recv_from(&mut buf).await {
					Ok(v) => v,
					Err(_) => return,
				};
				peers.lock().unwrap().push(peer);
				let _ = socket.send_to(&buf[..n], peer).await;
			}
		})
	};
	(addr, peers, handle)
}

async fn udp_round_trip(
	client: &UdpSocket,
	proxy: SocketAddr,
	target: SocketAddr,
	method: Method,
	key: &[u8],
	payload: &[u8],
) -> (SocksAddr, Vec<u8>) {
	let mut wire = Vec::new();
	shadowsocks::udp::seal_datagram(
		method.algo(),
		key,
		&SocksAddr::from(target),
		payload,
		&mut wire,
	)
	.unwrap();
	client.send_to(&wire, proxy).await.unwrap();

	let mut buf = [0_u8; 4 * 1024];
	let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
		.await
		.expect("no UDP response in time")
		.unwrap();
	let (src, data) = shadowsocks::udp::open_datagram(method.algo(), key, &mut buf[..n]).unwrap();
	(src, data.to_vec())
}

#[test]
fn udp_echo_and_session_reuse() {
	init_log();
	let rt = tokio::runtime::Runtime::new().unwrap();
	rt.block_on(async {
		let metrics = Arc::new(RecordingMetrics::default());
		let method = Method::Chacha20Poly1305;
		let port = Port::start(
			0,
			single_key_set("ku", method, "udp secret"),
			metrics.clone(),
			UDP_TIMEOUT,
		)
		.await
		.unwrap();
		let proxy = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port.number());
		let (echo_addr, peers, _echo) = spawn_udp_echo().await;

		let key = shadowsocks::password_to_key(
			shadowsocks::salt_len(method.algo()),
			"udp secret",
		);
		let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();

		let (src, data) =
			udp_round_trip(&client, proxy, echo_addr, method, &key, b"ping").await;
		assert_eq!(src, SocksAddr::from(echo_addr));
		assert_eq!(data, b"ping");

		// A second datagram reuses the same outbound socket.
		let (_, data) =
			udp_round_trip(&client, proxy, echo_addr, method, &key, b"ping again").await;
		assert_eq!(data, b"ping again");
		{
			let peers = peers.lock().unwrap();
			assert_eq!(peers.len(), 2);
			assert_eq!(peers[0], peers[1]);
		}

		// Packets were counted in both directions.
		wait_for("udp packet metrics", || {
			metrics.udp_packets.lock().unwrap().len() == 4
		})
		.await;
		{
			let packets = metrics.udp_packets.lock().unwrap();
			assert!(packets
				.iter()
				.all(|(id, _, _)| id == "ku"));
			assert_eq!(
				packets
					.iter()
					.filter(|(_, dir, _)| *dir == Direction::ClientToTarget)
					.count(),
				2
			);
		}

		// An undecryptable datagram is dropped and counted.
		let bogus_key = shadowsocks::password_to_key(
			shadowsocks::salt_len(method.algo()),
			"wrong secret",
		);
		let mut wire = Vec::new();
		shadowsocks::udp::seal_datagram(
			method.algo(),
			&bogus_key,
			&SocksAddr::from(echo_addr),
			b"nope",
			&mut wire,
		)
		.unwrap();
		client.send_to(&wire, proxy).await.unwrap();
		wait_for("udp decrypt failure", || {
			metrics.udp_failures.load(Ordering::Relaxed) == 1
		})
		.await;

		port.stop();
	});
}

#[test]
fn udp_session_expires_after_timeout() {
	init_log();
	let rt = tokio::runtime::Runtime::new().unwrap();
	rt.block_on(async {
		let metrics = Arc::new(RecordingMetrics::default());
		let method = Method::Aes128Gcm;
		let port = Port::start(
			0,
			single_key_set("ku", method, "short lived"),
			metrics,
			Duration::from_secs(1),
		)
		.await
		.unwrap();
		let proxy = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port.number());
		let (echo_addr, peers, _echo) = spawn_udp_echo().await;

		let key = shadowsocks::password_to_key(
			shadowsocks::salt_len(method.algo()),
			"short lived",
		);
		let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();

		udp_round_trip(&client, proxy, echo_addr, method, &key, b"first").await;
		// Let the session idle past its timeout plus a sweep interval.
		tokio::time::sleep(Duration::from_millis(2500)).await;
		udp_round_trip(&client, proxy, echo_addr, method, &key, b"second").await;

		// The expired session's outbound socket was closed; the second
		// datagram arrived from a fresh one.
		let peers = peers.lock().unwrap();
		assert_eq!(peers.len(), 2);
		assert_ne!(peers[0], peers[1]);

		port.stop();
	});
}

// ------------------------------------------------------------------
//                     loopback round trips
// ------------------------------------------------------------------

#[test]
fn two_hop_proxy_round_trips() {
	init_log();
	let rt = tokio::runtime::Runtime::new().unwrap();
	rt.block_on(async {
		let metrics = Arc::new(RecordingMetrics::default());
		let hop1 = Port::start(
			0,
			single_key_set("hop1", Method::Aes128Gcm, "first hop"),
			metrics.clone(),
			UDP_TIMEOUT,
		)
		.await
		.unwrap();
		let hop2 = Port::start(
			0,
			single_key_set("hop2", Method::Chacha20Poly1305, "second hop"),
			metrics,
			UDP_TIMEOUT,
		)
		.await
		.unwrap();
		let hop1_addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), hop1.number());
		let hop2_addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), hop2.number());
		let (echo_addr, _peers, _echo) = spawn_echo_server().await;

		// Outer leg to hop 1, whose target is hop 2; the relayed plaintext
		// is itself a shadowsocks stream for hop 2.
		let outer = CipherEntry::new("hop1", Method::Aes128Gcm, "first hop");
		let (or, ow) = connect_client(hop1_addr, &outer, hop2_addr).await;
		let inner = CipherEntry::new("hop2", Method::Chacha20Poly1305, "second hop");
		let (mut cr, mut cw) = wrap_client(&inner, or, ow);
		let mut addr_buf = Vec::new();
		SocksAddr::from(echo_addr).write_to(&mut addr_buf);
		cw.write_all(&addr_buf).await.unwrap();

		let mut data = vec![0_u8; 32 * 1024];
		for (i, b) in data.iter_mut().enumerate() {
			*b = (i % 239) as u8;
		}
		cw.write_all(&data).await.unwrap();

		let mut out = vec![0_u8; data.len()];
		cr.read_exact(&mut out).await.unwrap();
		assert_eq!(out, data);

		cw.shutdown().await.unwrap();
		hop1.stop();
		hop2.stop();
	});
}

#[test]
fn relay_round_trips_arbitrary_bytes() {
	init_log();
	let rt = tokio::runtime::Runtime::new().unwrap();
	rt.block_on(async {
		let metrics = Arc::new(RecordingMetrics::default());
		let port = Port::start(
			0,
			single_key_set("k", Method::Aes128Gcm, "bytes"),
			metrics,
			UDP_TIMEOUT,
		)
		.await
		.unwrap();
		let proxy = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port.number());
		let (echo_addr, _peers, _echo) = spawn_echo_server().await;

		let entry = CipherEntry::new("k", Method::Aes128Gcm, "bytes");
		let (mut cr, mut cw) = connect_client(proxy, &entry, echo_addr).await;

		let mut data = vec![0_u8; 64 * 1024];
		for (i, b) in data.iter_mut().enumerate() {
			*b = (i % 251) as u8;
		}

		let writer = {
			let data = data.clone();
			tokio::spawn(async move {
				cw.write_all(&data).await.unwrap();
				cw.shutdown().await.unwrap();
			})
		};
		let mut out = Vec::new();
		cr.read_to_end(&mut out).await.unwrap();
		writer.await.unwrap();
		assert_eq!(out, data);

		port.stop();
	});
}
