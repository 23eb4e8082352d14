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
Shadowsocks UDP datagram framing.

Request and response (before encryption):
```not_rust
+------+----------+----------+----------+
| ATYP | DST.ADDR | DST.PORT |   DATA   |
+------+----------+----------+----------+
|  1   | Variable |    2     | Variable |
+------+----------+----------+----------+
```

On the wire every datagram is `salt ‖ ciphertext ‖ tag`, sealed under a
session key derived from the salt. Every datagram is independent.
*/

use super::{key_to_session_key, salt_len, Error};
use crate::{
	crypto::aead::{nonce::CounterSequence, Algorithm, Decryptor, Encryptor, TAG_LEN},
	prelude::*,
};
use rand::thread_rng;

const EMPTY_AAD: &[u8] = &[];

/// Seal `addr` and `payload` into `buf` as one shadowsocks datagram with a
/// freshly generated salt.
///
/// Existing content of `buf` is discarded.
///
/// # Errors
///
/// Returns an [`Error`] if sealing fails.
pub fn seal_datagram(
	algo: Algorithm,
	key: &[u8],
	addr: &SocksAddr,
	payload: &[u8],
	buf: &mut Vec<u8>,
) -> Result<(), Error> {
	buf.clear();
	buf.resize(salt_len(algo), 0);
	thread_rng().fill_bytes(buf);

	let mut enc = Encryptor::new(
		&key_to_session_key(key, buf, algo),
		CounterSequence::default(),
	);

	buf.reserve(addr.serialized_len_atyp() + payload.len() + TAG_LEN);
	let pos = buf.len();
	addr.write_to(buf);
	buf.put_slice(payload);

	enc.seal_inplace_append_tag(pos, buf, EMPTY_AAD)
		.map_err(Error::FailedCrypto)
}

/// Open one shadowsocks datagram in place and split it into the leading
/// address and the payload.
///
/// On failure the content of `buf` is unspecified; callers probing several
/// keys must hand in a copy per attempt.
///
/// # Errors
///
/// Returns an [`Error`] if the datagram is too small, the tag does not
/// verify, or the address cannot be parsed.
pub fn open_datagram<'a>(
	algo: Algorithm,
	key: &[u8],
	buf: &'a mut [u8],
) -> Result<(SocksAddr, &'a [u8]), Error> {
	let salt_len = salt_len(algo);
	if buf.len() <= salt_len + TAG_LEN {
		return Err(Error::DatagramTooSmall(buf.len()));
	}

	let (salt, body) = buf.split_at_mut(salt_len);
	let mut dec = Decryptor::new(
		&key_to_session_key(key, salt, algo),
		CounterSequence::default(),
	);
	let plain = dec.open_inplace(body, EMPTY_AAD).map_err(Error::FailedCrypto)?;

	let (addr, addr_len) = SocksAddr::read_from_bytes(plain)?;
	Ok((addr, &plain[usize::from(addr_len.get())..]))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::shadowsocks::password_to_key;
	use std::net::Ipv4Addr;

	#[test]
	fn datagram_round_trip() {
		for algo in [
			Algorithm::Aes128Gcm,
			Algorithm::Aes256Gcm,
			Algorithm::ChaCha20Poly1305,
		] {
			let key = password_to_key(salt_len(algo), "dg-password");
			let addr = SocksAddr::new(Ipv4Addr::new(10, 0, 0, 1).into(), 53);

			let mut wire = Vec::new();
			seal_datagram(algo, &key, &addr, b"query", &mut wire).unwrap();

			let (parsed, payload) = open_datagram(algo, &key, &mut wire).unwrap();
			assert_eq!(parsed, addr);
			assert_eq!(payload, b"query");
		}
	}

	#[test]
	fn wrong_key_fails() {
		let algo = Algorithm::ChaCha20Poly1305;
		let key = password_to_key(salt_len(algo), "right");
		let other = password_to_key(salt_len(algo), "wrong");
		let addr = SocksAddr::new(Ipv4Addr::LOCALHOST.into(), 7);

		let mut wire = Vec::new();
		seal_datagram(algo, &key, &addr, b"data", &mut wire).unwrap();
		assert!(open_datagram(algo, &other, &mut wire).is_err());
	}

	#[test]
	fn short_datagram_rejected() {
		let algo = Algorithm::Aes128Gcm;
		let key = password_to_key(salt_len(algo), "k");
		let mut wire = vec![0_u8; salt_len(algo) + TAG_LEN];
		assert!(matches!(
			open_datagram(algo, &key, &mut wire),
			Err(Error::DatagramTooSmall(_))
		));
	}
}
