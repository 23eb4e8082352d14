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
use futures::ready;
use std::{
	io,
	task::{Context, Poll},
};
use tokio::io::ReadBuf;

/// Poll read exactly `buf.len()` bytes into `buf`, keeping the current
/// progress in `pos`.
///
/// Returns `Err(UnexpectedEof)` if an EOF is reached when some bytes have
/// been read but the buffer is not yet full.
///
/// Returns `Ok(n)` otherwise, where `n` is `buf.len()` when the buffer is
/// full and 0 when an EOF is reached before anything was read.
pub fn poll_read_exact<R>(
	mut reader: Pin<&mut R>,
	cx: &mut Context<'_>,
	buf: &mut [u8],
	pos: &mut usize,
) -> Poll<io::Result<usize>>
where
	R: AsyncRead,
{
	let buf_len = buf.len();
	while *pos < buf_len {
		let mut read_buf = ReadBuf::new(&mut buf[*pos..]);
		ready!(reader.as_mut().poll_read(cx, &mut read_buf))?;

		let n = read_buf.filled().len();
		if n == 0 {
			if *pos == 0 {
				return Poll::Ready(Ok(0));
			}
			return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
		}
		*pos += n;
	}
	Poll::Ready(Ok(buf_len))
}

/// Poll write all bytes of `src` into `writer`, keeping the current
/// progress in `pos`.
pub fn poll_write_all<W>(
	mut writer: Pin<&mut W>,
	cx: &mut Context<'_>,
	pos: &mut usize,
	src: &[u8],
) -> Poll<io::Result<()>>
where
	W: AsyncWrite + Unpin,
{
	debug_assert!(*pos <= src.len());
	while *pos < src.len() {
		let n = ready!(writer.as_mut().poll_write(cx, &src[*pos..]))?;
		if n == 0 {
			return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
		}
		*pos += n;
	}
	Poll::Ready(Ok(()))
}
