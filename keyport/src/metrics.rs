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

use crate::BoxStdErr;
use hyper::{
	service::{make_service_fn, service_fn},
	Body, Request, Response, StatusCode,
};
use keyport_lib::stat::{Direction, Metrics, ProxyTraffic, Status};
use prometheus::{
	Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
	TextEncoder,
};
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

const NAMESPACE: &str = "keyport";

/// Prometheus-backed [`Metrics`] sink plus its `/metrics` HTTP endpoint.
#[derive(Clone)]
pub struct PromMetrics {
	registry: Arc<Registry>,
	tcp_open_connections: IntCounter,
	tcp_closed_connections: IntCounterVec,
	tcp_connection_duration: HistogramVec,
	tcp_data_bytes: IntCounterVec,
	udp_packets: IntCounterVec,
	udp_bytes: IntCounterVec,
	udp_decrypt_failures: IntCounter,
	access_keys: IntGauge,
	ports: IntGauge,
}

impl PromMetrics {
	pub fn new() -> Result<Self, BoxStdErr> {
		let registry = Arc::new(Registry::new());

		let tcp_open_connections = IntCounter::with_opts(
			Opts::new("tcp_connections_opened", "Total accepted TCP connections")
				.namespace(NAMESPACE),
		)?;
		registry.register(Box::new(tcp_open_connections.clone()))?;

		let tcp_closed_connections = IntCounterVec::new(
			Opts::new("tcp_connections_closed", "Total closed TCP connections")
				.namespace(NAMESPACE),
			&["status", "access_key"],
		)?;
		registry.register(Box::new(tcp_closed_connections.clone()))?;

		let tcp_connection_duration = HistogramVec::new(
			HistogramOpts::new(
				"tcp_connection_duration_seconds",
				"TCP connection duration in seconds",
			)
			.namespace(NAMESPACE)
			.buckets(vec![0.1, 1.0, 10.0, 60.0, 600.0, 3600.0]),
			&["status"],
		)?;
		registry.register(Box::new(tcp_connection_duration.clone()))?;

		let tcp_data_bytes = IntCounterVec::new(
			Opts::new("tcp_data_bytes", "Bytes relayed over TCP").namespace(NAMESPACE),
			&["dir", "access_key"],
		)?;
		registry.register(Box::new(tcp_data_bytes.clone()))?;

		let udp_packets = IntCounterVec::new(
			Opts::new("udp_packets", "Relayed UDP packets").namespace(NAMESPACE),
			&["dir", "access_key"],
		)?;
		registry.register(Box::new(udp_packets.clone()))?;

		let udp_bytes = IntCounterVec::new(
			Opts::new("udp_data_bytes", "Bytes relayed over UDP").namespace(NAMESPACE),
			&["dir", "access_key"],
		)?;
		registry.register(Box::new(udp_bytes.clone()))?;

		let udp_decrypt_failures = IntCounter::with_opts(
			Opts::new(
				"udp_decrypt_failures",
				"UDP datagrams dropped because no key could open them",
			)
			.namespace(NAMESPACE),
		)?;
		registry.register(Box::new(udp_decrypt_failures.clone()))?;

		let access_keys = IntGauge::with_opts(
			Opts::new("access_keys", "Number of provisioned access keys").namespace(NAMESPACE),
		)?;
		registry.register(Box::new(access_keys.clone()))?;

		let ports = IntGauge::with_opts(
			Opts::new("ports", "Number of listening ports").namespace(NAMESPACE),
		)?;
		registry.register(Box::new(ports.clone()))?;

		Ok(Self {
			registry,
			tcp_open_connections,
			tcp_closed_connections,
			tcp_connection_duration,
			tcp_data_bytes,
			udp_packets,
			udp_bytes,
			udp_decrypt_failures,
			access_keys,
			ports,
		})
	}

	/// Bind `addr` and return the future serving `/metrics`.
	///
	/// Binding happens here so a bad address fails startup instead of
	/// being logged away inside a task.
	pub fn serve(&self, addr: SocketAddr) -> Result<impl Future<Output = ()>, BoxStdErr> {
		let builder = hyper::Server::try_bind(&addr)?;
		let metrics = self.clone();
		let make_svc = make_service_fn(move |_conn| {
			let metrics = metrics.clone();
			async move {
				Ok::<_, hyper::Error>(service_fn(move |req| {
					let metrics = metrics.clone();
					async move { metrics.respond(&req) }
				}))
			}
		});
		let server = builder.serve(make_svc);
		Ok(async move {
			if let Err(e) = server.await {
				log::error!("Metrics server failed ({})", e);
			}
		})
	}

	#[allow(clippy::unnecessary_wraps)]
	fn respond(&self, req: &Request<Body>) -> Result<Response<Body>, hyper::Error> {
		if req.uri().path() != "/metrics" {
			return Ok(Response::builder()
				.status(StatusCode::NOT_FOUND)
				.body(Body::from("not found"))
				.expect("static response must build"));
		}
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		let mut buffer = Vec::new();
		if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
			log::error!("Failed to encode metrics ({})", e);
			return Ok(Response::builder()
				.status(StatusCode::INTERNAL_SERVER_ERROR)
				.body(Body::from("failed to encode metrics"))
				.expect("static response must build"));
		}
		Ok(Response::builder()
			.status(StatusCode::OK)
			.header("Content-Type", encoder.format_type())
			.body(Body::from(buffer))
			.expect("metrics response must build"))
	}
}

impl Metrics for PromMetrics {
	fn add_open_tcp_connection(&self) {
		self.tcp_open_connections.inc();
	}

	fn add_closed_tcp_connection(
		&self,
		key_id: &str,
		status: Status,
		traffic: &ProxyTraffic,
		duration: Duration,
	) {
		self.tcp_closed_connections
			.with_label_values(&[status.as_str(), key_id])
			.inc();
		self.tcp_connection_duration
			.with_label_values(&[status.as_str()])
			.observe(duration.as_secs_f64());
		let legs = [
			("client_proxy", traffic.client_proxy.get()),
			("proxy_client", traffic.proxy_client.get()),
			("proxy_target", traffic.proxy_target.get()),
			("target_proxy", traffic.target_proxy.get()),
		];
		for (dir, bytes) in legs {
			self.tcp_data_bytes
				.with_label_values(&[dir, key_id])
				.inc_by(bytes);
		}
	}

	fn add_udp_packet(&self, key_id: &str, direction: Direction, bytes: usize) {
		self.udp_packets
			.with_label_values(&[direction.as_str(), key_id])
			.inc();
		self.udp_bytes
			.with_label_values(&[direction.as_str(), key_id])
			.inc_by(bytes as u64);
	}

	fn add_udp_decrypt_failure(&self) {
		self.udp_decrypt_failures.inc();
	}

	fn set_num_access_keys(&self, key_count: usize, port_count: usize) {
		#[allow(clippy::cast_possible_wrap)]
		{
			self.access_keys.set(key_count as i64);
			self.ports.set(port_count as i64);
		}
	}
}
