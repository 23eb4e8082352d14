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

use super::BUFFER_CAPACITY;
use crate::{prelude::*, utils::poll_write_all};
use futures::ready;
use std::{
	io,
	task::{Context, Poll},
};

pub trait Encode: Send + Sync + Unpin {
	fn encode_into(&mut self, src: &[u8], buf: &mut Vec<u8>) -> Result<(), BoxStdErr>;
}

#[derive(Debug, PartialEq, Eq)]
enum State {
	/// Encoding bytes from source into buffer.
	Encoding,
	/// Writing the buffer, starting from the contained position.
	Writing(usize),
	Closed,
}

/// A writer that encodes bytes with an [`Encode`] and writes them into
/// another [`AsyncWrite`].
///
/// To access the internal encoder or writer, use the `encoder` and `w`
/// fields directly.
pub struct FrameWriteHalf<E: Encode, W: AsyncWrite + Unpin> {
	buf: Vec<u8>,
	state: State,
	pub max_payload_len: usize,
	pub encoder: E,
	pub w: W,
}

impl<E, W> FrameWriteHalf<E, W>
where
	E: Encode,
	W: AsyncWrite + Unpin,
{
	/// Create a new [`FrameWriteHalf`].
	///
	/// If more than `max_payload_len` bytes are written at once, only
	/// `max_payload_len` bytes will be consumed.
	pub fn new(max_payload_len: usize, encoder: E, w: W) -> Self {
		Self {
			buf: Vec::with_capacity(BUFFER_CAPACITY),
			state: State::Encoding,
			max_payload_len,
			encoder,
			w,
		}
	}
}

impl<E, W> AsyncWrite for FrameWriteHalf<E, W>
where
	E: Encode,
	W: AsyncWrite + Unpin,
{
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		mut src: &[u8],
	) -> Poll<Result<usize, io::Error>> {
		let me = self.get_mut();
		if src.len() > me.max_payload_len {
			src = &src[..me.max_payload_len];
		}
		loop {
			match &mut me.state {
				State::Encoding => {
					if let Err(e) = me.encoder.encode_into(src, &mut me.buf) {
						me.state = State::Closed;
						return Err(io::Error::new(io::ErrorKind::InvalidData, e)).into();
					}
					me.state = State::Writing(0);
				}
				State::Writing(pos) => {
					ready!(poll_write_all(Pin::new(&mut me.w), cx, pos, &me.buf))?;
					// Clear the buffer so the encoder overwrites instead of
					// appending next time.
					me.buf.clear();
					me.state = State::Encoding;
					return Poll::Ready(Ok(src.len()));
				}
				State::Closed => {
					return Err(io::Error::new(
						io::ErrorKind::BrokenPipe,
						"frame writer already closed",
					))
					.into()
				}
			}
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
		let me = self.get_mut();
		Pin::new(&mut me.w).poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
		let me = self.get_mut();
		me.state = State::Closed;
		Pin::new(&mut me.w).poll_shutdown(cx)
	}
}
