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

use bytes::{Buf, Bytes};
use std::{io, pin::Pin};
use tokio::io::{AsyncRead, ReadBuf};

/// A read half that serves bytes from `buf` before polling `inner`.
///
/// Bytes consumed from a stream during access key probing are kept in a
/// buffer; attaching the selected cipher on top of this reader lets it
/// decode those bytes again as if they were never taken off the wire.
pub struct ReplayReader<R: AsyncRead + Unpin> {
	inner: R,
	buf: Option<Bytes>,
}

impl<R: AsyncRead + Unpin> ReplayReader<R> {
	pub fn new(inner: R, buf: impl Into<Bytes>) -> Self {
		let buf: Bytes = buf.into();
		Self {
			inner,
			buf: if buf.is_empty() { None } else { Some(buf) },
		}
	}
}

impl<R: AsyncRead + Unpin> AsyncRead for ReplayReader<R> {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		dst: &mut ReadBuf<'_>,
	) -> std::task::Poll<io::Result<()>> {
		let me = self.get_mut();
		if let Some(buf) = &mut me.buf {
			let len = std::cmp::min(buf.remaining(), dst.remaining());
			dst.put_slice(&buf[..len]);
			buf.advance(len);
			if buf.remaining() == 0 {
				me.buf = None;
			}
			Ok(()).into()
		} else {
			Pin::new(&mut me.inner).poll_read(cx, dst)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::ReplayReader;
	use tokio::io::AsyncReadExt;

	#[test]
	fn replay_before_inner() {
		let task = async {
			let inner = std::io::Cursor::new(b" world".to_vec());
			let mut r = ReplayReader::new(inner, b"hello".to_vec());
			let mut out = String::new();
			r.read_to_string(&mut out).await.unwrap();
			assert_eq!(out, "hello world");
		};
		tokio::runtime::Runtime::new().unwrap().block_on(task);
	}

	#[test]
	fn empty_prefix() {
		let task = async {
			let inner = std::io::Cursor::new(b"data".to_vec());
			let mut r = ReplayReader::new(inner, Vec::new());
			let mut out = Vec::new();
			r.read_to_end(&mut out).await.unwrap();
			assert_eq!(out, b"data");
		};
		tokio::runtime::Runtime::new().unwrap().block_on(task);
	}
}
