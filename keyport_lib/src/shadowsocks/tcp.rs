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
Shadowsocks TCP stream framing.

An AEAD encrypted TCP stream starts with a randomly generated salt used to
derive the session key, followed by any number of payload chunks.

Each chunk has the following structure:
```not_rust
+------------------+------------+-------------+----------+
|    encrypted     |    length  |  encrypted  |  payload |
|  payload length  |     tag    |   payload   |    tag   |
+------------------+------------+-------------+----------+
|     2 bytes      |  16 bytes  |  n bytes    | 16 bytes |
+------------------+------------+-------------+----------+
```

The first decrypted payload starts with the target address in SOCKS5
address format.
*/

use super::{key_to_session_key, salt_len, Error};
use crate::{
	crypto::aead::{
		self,
		nonce::{CounterSequence, EMPTY as EMPTY_NONCE},
		Algorithm, Decryptor, Encryptor,
	},
	prelude::*,
	utils::{append_mut, append_u16_mut, codec},
};
use bytes::Bytes;
use std::num::{NonZeroU16, NonZeroUsize};

pub const MAX_PAYLOAD_SIZE: u16 = 16 * 1024 - 1;

/// The encrypted length prefix: 2 length bytes plus the tag.
const LEN_PART_SIZE: usize = 2 + aead::TAG_LEN;

const fn non_zero(n: usize) -> NonZeroUsize {
	match NonZeroUsize::new(n) {
		Some(v) => v,
		None => panic!("value must not be zero"),
	}
}

#[inline]
fn default_nonce() -> CounterSequence {
	CounterSequence::new(EMPTY_NONCE)
}

enum ReadState {
	Salt {
		key: Bytes,
	},
	Decrypt {
		dec: Box<Decryptor<CounterSequence>>,
		state: DecodeState,
	},
}

enum DecodeState {
	Length,
	Payload(NonZeroU16),
}

pub struct Decoder {
	state: ReadState,
	algo: Algorithm,
}

impl Decoder {
	#[must_use]
	pub fn new(algo: Algorithm, key: Bytes) -> Self {
		Self {
			algo,
			state: ReadState::Salt { key },
		}
	}
}

impl codec::Decode for Decoder {
	fn expected_len(&self) -> NonZeroUsize {
		match &self.state {
			ReadState::Salt { key: _ } => non_zero(salt_len(self.algo)),
			ReadState::Decrypt { dec: _, state } => match state {
				DecodeState::Length => non_zero(LEN_PART_SIZE),
				DecodeState::Payload(len) => non_zero(usize::from(len.get()) + aead::TAG_LEN),
			},
		}
	}

	fn decode_inplace(&mut self, buf: &mut Vec<u8>) -> Result<bool, BoxStdErr> {
		if buf.is_empty() {
			// EOF is only acceptable on a chunk boundary.
			return match &self.state {
				ReadState::Salt { key: _ } => Err("EOF while reading shadowsocks salt".into()),
				ReadState::Decrypt { dec: _, state } => match &state {
					DecodeState::Length => Ok(true),
					DecodeState::Payload(_) => {
						Err("EOF while reading shadowsocks payload".into())
					}
				},
			};
		}
		// A salt must be read from remote to build a session key before any
		// payload can be decoded.
		match &mut self.state {
			ReadState::Salt { ref key } => {
				trace!("Reading shadowsocks salt ({} bytes)", buf.len());
				debug_assert_eq!(salt_len(self.algo), buf.len());

				let session_key = key_to_session_key(key, buf, self.algo);
				let dec = Decryptor::new(&session_key, default_nonce());
				self.state = ReadState::Decrypt {
					dec: Box::new(dec),
					state: DecodeState::Length,
				};
				// Proceed to read the length part.
				Ok(false)
			}
			ReadState::Decrypt { dec, state } => match state {
				DecodeState::Length => {
					debug_assert_eq!(buf.len(), LEN_PART_SIZE);
					dec.open_inplace(buf, &[]).map_err(|e| {
						Error::FailedCrypto(
							format!("cannot decrypt shadowsocks length part ({})", e).into(),
						)
					})?;
					if let Some(len) = NonZeroU16::new(buf.as_slice().get_u16()) {
						trace!("Shadowsocks payload length: {}", len);
						*state = DecodeState::Payload(len);
						Ok(false)
					} else {
						Err(Error::EmptyPayload.into())
					}
				}
				DecodeState::Payload(len) => {
					let len = usize::from(len.get());
					let buf_len = buf.len();
					debug_assert_eq!(buf_len, len + aead::TAG_LEN);
					dec.open_inplace(buf, &[]).map_err(|e| {
						Error::FailedCrypto(
							format!(
								"cannot decrypt shadowsocks payload of {} bytes ({})",
								buf_len,
								e
							)
							.into(),
						)
					})?;
					buf.truncate(len);
					*state = DecodeState::Length;
					Ok(true)
				}
			},
		}
	}
}

pub struct Encoder {
	/// Bytes written before the first chunk, holding the local salt.
	lazy_buf: Vec<u8>,
	enc: Encryptor<CounterSequence>,
}

impl Encoder {
	#[must_use]
	pub fn new(algo: Algorithm, key: &[u8], local_salt: Vec<u8>) -> Self {
		let session_key = key_to_session_key(key, &local_salt, algo);
		Self {
			lazy_buf: local_salt,
			enc: Encryptor::new(&session_key, default_nonce()),
		}
	}

	fn priv_encode(
		enc: &mut Encryptor<CounterSequence>,
		src: &[u8],
		buf: &mut Vec<u8>,
	) -> Result<(), BoxStdErr> {
		let src_len = u16::try_from(src.len())
			.ok()
			.filter(|len| *len <= MAX_PAYLOAD_SIZE)
			.ok_or_else(|| {
				format!(
					"payload length too large ({}), must be at most {}",
					src.len(),
					MAX_PAYLOAD_SIZE
				)
			})?;

		if src_len == 0 {
			return Err("payload length cannot be zero".into());
		}

		buf.reserve(LEN_PART_SIZE + src.len() + aead::TAG_LEN);
		{
			// Payload length, 2 + TAG_LEN bytes.
			let len_buf = append_u16_mut(buf, src_len);
			let tag = enc.seal_inplace(len_buf, &[])?;
			buf.put_slice(&tag);
		}
		{
			// Payload, src.len() + TAG_LEN bytes.
			let payload_buf = append_mut(buf, src);
			let tag = enc.seal_inplace(payload_buf, &[])?;
			buf.put_slice(&tag);
		}
		Ok(())
	}
}

impl codec::Encode for Encoder {
	fn encode_into(&mut self, src: &[u8], buf: &mut Vec<u8>) -> Result<(), BoxStdErr> {
		buf.clear();

		if !self.lazy_buf.is_empty() {
			buf.put_slice(&self.lazy_buf);
			// Release memory.
			self.lazy_buf = Vec::new();
		}

		Self::priv_encode(&mut self.enc, src, buf)
	}
}
