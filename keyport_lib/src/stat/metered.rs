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

use super::Counter;
use futures::ready;
use std::{
	io,
	pin::Pin,
	task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A read half that counts every byte it delivers.
///
/// Install below any codec wrapper to meter the raw wire traffic.
pub struct MeteredReadHalf<R: AsyncRead + Unpin> {
	inner: R,
	count: Counter,
}

impl<R: AsyncRead + Unpin> MeteredReadHalf<R> {
	pub fn new(inner: R, count: Counter) -> Self {
		Self { inner, count }
	}
}

impl<R: AsyncRead + Unpin> AsyncRead for MeteredReadHalf<R> {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let me = self.get_mut();
		let before = buf.filled().len();
		ready!(Pin::new(&mut me.inner).poll_read(cx, buf))?;
		me.count.add((buf.filled().len() - before) as u64);
		Poll::Ready(Ok(()))
	}
}

/// A write half that counts every byte accepted by the inner writer.
pub struct MeteredWriteHalf<W: AsyncWrite + Unpin> {
	inner: W,
	count: Counter,
}

impl<W: AsyncWrite + Unpin> MeteredWriteHalf<W> {
	pub fn new(inner: W, count: Counter) -> Self {
		Self { inner, count }
	}
}

impl<W: AsyncWrite + Unpin> AsyncWrite for MeteredWriteHalf<W> {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		src: &[u8],
	) -> Poll<io::Result<usize>> {
		let me = self.get_mut();
		let n = ready!(Pin::new(&mut me.inner).poll_write(cx, src))?;
		me.count.add(n as u64);
		Poll::Ready(Ok(n))
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	#[test]
	fn counts_bytes_both_ways() {
		let task = async {
			let (a, b) = tokio::io::duplex(1024);
			let (br, bw) = tokio::io::split(b);

			let read_count = Counter::new(0);
			let write_count = Counter::new(0);
			let mut r = MeteredReadHalf::new(br, read_count.clone());
			let mut w = MeteredWriteHalf::new(bw, write_count.clone());

			let (mut ar, mut aw) = tokio::io::split(a);
			aw.write_all(b"12345").await.unwrap();
			aw.shutdown().await.unwrap();

			let mut out = Vec::new();
			r.read_to_end(&mut out).await.unwrap();
			assert_eq!(out, b"12345");
			assert_eq!(read_count.get(), 5);

			w.write_all(b"abc").await.unwrap();
			let mut buf = [0_u8; 3];
			ar.read_exact(&mut buf).await.unwrap();
			assert_eq!(write_count.get(), 3);
		};
		tokio::runtime::Runtime::new().unwrap().block_on(task);
	}
}
