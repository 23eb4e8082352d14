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
use crate::{prelude::*, utils::poll_read_exact};
use futures::ready;
use std::{
	io,
	num::NonZeroUsize,
	task::{Context, Poll},
};
use tokio::io::ReadBuf;

pub trait Decode: Send + Sync + Unpin {
	/// Number of bytes the decoder needs next.
	fn expected_len(&self) -> NonZeroUsize;

	/// Process exactly `expected_len` bytes in `buf` (or an empty `buf` on
	/// EOF).
	///
	/// Returns `Ok(true)` if `buf` now holds a decoded frame. An empty
	/// `buf` together with `Ok(true)` means a clean EOF.
	///
	/// Returns `Ok(false)` if more bytes are needed; `expected_len` will be
	/// asked again for the next read.
	fn decode_inplace(&mut self, buf: &mut Vec<u8>) -> Result<bool, BoxStdErr>;
}

enum State {
	/// Reading exactly `buf.len()` bytes from the inner reader.
	Filling { pos: usize },
	/// Handing the filled buffer to the decoder.
	Decoding,
	/// Copying decoded bytes out of the buffer.
	Serving { pos: usize },
	Eof,
	Closed,
}

/// A reader that takes bytes from another [`AsyncRead`] and decodes them
/// frame by frame with a [`Decode`].
///
/// To access the original [`AsyncRead`], use the `r` field directly.
pub struct FrameReadHalf<D: Decode, R: AsyncRead + Unpin> {
	pub r: R,
	decoder: D,
	buf: Vec<u8>,
	state: State,
}

impl<D, R> FrameReadHalf<D, R>
where
	D: Decode,
	R: AsyncRead + Unpin,
{
	pub fn new(decoder: D, r: R) -> Self {
		let mut buf = Vec::with_capacity(BUFFER_CAPACITY);
		buf.resize(decoder.expected_len().get(), 0);
		Self {
			r,
			decoder,
			buf,
			state: State::Filling { pos: 0 },
		}
	}
}

impl<D, R> AsyncRead for FrameReadHalf<D, R>
where
	D: Decode,
	R: AsyncRead + Unpin,
{
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		dst: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let me = self.get_mut();
		loop {
			match &mut me.state {
				State::Filling { pos } => {
					let n = match ready!(poll_read_exact(Pin::new(&mut me.r), cx, &mut me.buf, pos))
					{
						Ok(n) => n,
						Err(e) => {
							me.state = State::Closed;
							return Err(e).into();
						}
					};
					// An empty buffer tells the decoder an EOF was reached.
					me.buf.truncate(n);
					me.state = State::Decoding;
				}
				State::Decoding => {
					trace!("Decoding frame part ({} bytes)", me.buf.len());
					let done = match me.decoder.decode_inplace(&mut me.buf) {
						Ok(done) => done,
						Err(e) => {
							me.state = State::Closed;
							return Err(io::Error::new(io::ErrorKind::InvalidData, e)).into();
						}
					};
					if done {
						if me.buf.is_empty() {
							trace!("Frame reader reached EOF");
							me.state = State::Eof;
						} else {
							me.state = State::Serving { pos: 0 };
						}
					} else {
						me.buf.resize(me.decoder.expected_len().get(), 0);
						me.state = State::Filling { pos: 0 };
					}
				}
				State::Serving { pos } => {
					if *pos == me.buf.len() {
						// Frame fully consumed, start on the next one.
						me.buf.resize(me.decoder.expected_len().get(), 0);
						me.state = State::Filling { pos: 0 };
						continue;
					}
					let amt = std::cmp::min(me.buf.len() - *pos, dst.remaining());
					dst.put_slice(&me.buf[*pos..*pos + amt]);
					*pos += amt;
					return Ok(()).into();
				}
				State::Eof => return Ok(()).into(),
				State::Closed => {
					return Err(io::Error::new(
						io::ErrorKind::BrokenPipe,
						"frame reader already closed",
					))
					.into()
				}
			}
		}
	}
}
