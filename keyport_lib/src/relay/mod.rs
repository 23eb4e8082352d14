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

use crate::prelude::*;
use futures::future::{self, Either};
use std::io;

const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Copy bytes between two duplex streams until both directions finish.
///
/// When one direction reaches EOF, the EOF is propagated as a write
/// shutdown on the peer and the other direction keeps draining. An I/O
/// error closes both sides; the first error is returned.
pub struct Relay<'a> {
	pub conn_tag: &'a str,
	pub buffer_size: usize,
}

impl<'a> Relay<'a> {
	#[inline]
	#[must_use]
	pub fn new(conn_tag: &'a str) -> Self {
		Self {
			conn_tag,
			buffer_size: DEFAULT_BUFFER_SIZE,
		}
	}
}

impl Relay<'_> {
	/// Relay between the inbound stream (`ir`, `iw`) and the outbound
	/// stream (`or`, `ow`).
	///
	/// # Errors
	///
	/// Returns the first I/O error of either direction.
	pub async fn relay_stream<IR, IW, OR, OW>(
		&self,
		ir: IR,
		iw: IW,
		or: OR,
		ow: OW,
	) -> io::Result<()>
	where
		IR: AsyncRead + Unpin + Send + 'static,
		IW: AsyncWrite + Unpin + Send + 'static,
		OR: AsyncRead + Unpin + Send + 'static,
		OW: AsyncWrite + Unpin + Send + 'static,
	{
		let send_tag = Arc::<str>::from(format!("[{} send]", self.conn_tag));
		let recv_tag = Arc::<str>::from(format!("[{} recv]", self.conn_tag));

		// Inbound ---> Outbound
		let send_task = StreamCopier {
			r: ir,
			w: ow,
			tag: send_tag,
			buffer_size: self.buffer_size,
		}
		.run();
		// Inbound <--- Outbound
		let recv_task = StreamCopier {
			r: or,
			w: iw,
			tag: recv_tag,
			buffer_size: self.buffer_size,
		}
		.run();

		futures::pin_mut!(send_task);
		futures::pin_mut!(recv_task);
		let (first_res, rest) = match future::select(send_task, recv_task).await {
			Either::Left((res, recv_task)) => (res, Either::Left(recv_task)),
			Either::Right((res, send_task)) => (res, Either::Right(send_task)),
		};

		if let Err(e) = first_res {
			// Dropping the remaining copier closes its halves, which
			// closes both sides of the connection.
			return Err(e);
		}
		// First direction finished cleanly (EOF propagated); let the other
		// direction drain.
		match rest {
			Either::Left(task) => task.await,
			Either::Right(task) => task.await,
		}
	}
}

/// Copy bytes from `r` to `w`; on EOF shut down `w`.
struct StreamCopier<R, W>
where
	R: AsyncRead + Unpin + Send + 'static,
	W: AsyncWrite + Unpin + Send + 'static,
{
	r: R,
	w: W,
	tag: Arc<str>,
	buffer_size: usize,
}

impl<R, W> StreamCopier<R, W>
where
	R: AsyncRead + Unpin + Send + 'static,
	W: AsyncWrite + Unpin + Send + 'static,
{
	async fn run(mut self) -> io::Result<()> {
		let mut buffer = vec![0_u8; self.buffer_size];
		loop {
			let n = self.r.read(&mut buffer).await?;
			if n == 0 {
				debug!("{} read half reached EOF, shutting down write half", self.tag);
				if let Err(err) = self.w.shutdown().await {
					debug!("{} error when shutting down write half ({})", self.tag, err);
					return Err(err);
				}
				return Ok(());
			}
			self.w.write_all(&buffer[..n]).await?;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

	#[test]
	fn relay_and_half_close() {
		let task = async {
			let (mut client, proxy_client) = duplex(1024);
			let (proxy_target, mut target) = duplex(1024);

			let relay_task = tokio::spawn(async move {
				let (cr, cw) = tokio::io::split(proxy_client);
				let (tr, tw) = tokio::io::split(proxy_target);
				Relay::new("test").relay_stream(cr, cw, tr, tw).await
			});

			client.write_all(b"request").await.unwrap();
			let mut buf = [0_u8; 7];
			target.read_exact(&mut buf).await.unwrap();
			assert_eq!(&buf, b"request");

			target.write_all(b"response").await.unwrap();
			let mut buf = [0_u8; 8];
			client.read_exact(&mut buf).await.unwrap();
			assert_eq!(&buf, b"response");

			// Client half-closes; the target must see EOF but the return
			// direction must stay open.
			client.shutdown().await.unwrap();
			let mut buf = [0_u8; 16];
			assert_eq!(target.read(&mut buf).await.unwrap(), 0);

			target.write_all(b"late").await.unwrap();
			let mut buf = [0_u8; 4];
			client.read_exact(&mut buf).await.unwrap();
			assert_eq!(&buf, b"late");

			target.shutdown().await.unwrap();
			relay_task.await.unwrap().unwrap();
		};
		tokio::runtime::Runtime::new().unwrap().block_on(task);
	}
}
