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

use crate::prelude::BoxStdErr;
use ring::aead::{BoundKey, NonceSequence, OpeningKey, SealingKey, UnboundKey};

pub const TAG_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;

/// Every algorithm here is an AEAD.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Algorithm {
	Aes128Gcm,
	Aes256Gcm,
	ChaCha20Poly1305,
}

impl Algorithm {
	#[inline]
	#[must_use]
	pub fn key_size(self) -> usize {
		match self {
			Self::Aes128Gcm => 16,
			Self::Aes256Gcm | Self::ChaCha20Poly1305 => 32,
		}
	}
}

pub enum Key {
	Aes128Gcm([u8; 16]),
	Aes256Gcm([u8; 32]),
	ChaCha20Poly1305([u8; 32]),
}

impl Key {
	#[inline]
	pub fn as_slice(&self) -> &[u8] {
		match self {
			Key::Aes128Gcm(key) => key,
			Key::Aes256Gcm(key) | Key::ChaCha20Poly1305(key) => key,
		}
	}
}

impl AsRef<[u8]> for Key {
	#[inline]
	fn as_ref(&self) -> &[u8] {
		self.as_slice()
	}
}

struct NonceWrapper<N: nonce::Sequence>(N);

impl<N> NonceSequence for NonceWrapper<N>
where
	N: nonce::Sequence + Sized,
{
	fn advance(&mut self) -> Result<ring::aead::Nonce, ring::error::Unspecified> {
		let val = *self.0.curr();
		self.0.update();
		Ok(ring::aead::Nonce::assume_unique_for_key(val))
	}
}

pub struct Encryptor<N: nonce::Sequence> {
	key: SealingKey<NonceWrapper<N>>,
}

impl<N: nonce::Sequence> Encryptor<N> {
	pub fn new(key: &Key, nonce: N) -> Self {
		Self {
			key: SealingKey::new(get_unbound_key(key), NonceWrapper(nonce)),
		}
	}

	/// Encrypt `buf` in place and return the authentication tag.
	///
	/// # Errors
	///
	/// Returns an error if the underlying AEAD seal fails.
	pub fn seal_inplace(&mut self, buf: &mut [u8], aad: &[u8]) -> Result<[u8; TAG_LEN], BoxStdErr> {
		let tag = self
			.key
			.seal_in_place_separate_tag(ring::aead::Aad::from(aad), buf)
			.map_err(|_| "unable to seal AEAD plaintext")?;
		tag.as_ref()
			.try_into()
			.map_err(|_| "AEAD tag has unexpected length".into())
	}

	/// Encrypt `buf[start_pos..]` in place and append the tag to `buf`.
	///
	/// # Errors
	///
	/// Returns the same error as [`Self::seal_inplace`].
	pub fn seal_inplace_append_tag(
		&mut self,
		start_pos: usize,
		buf: &mut Vec<u8>,
		aad: &[u8],
	) -> Result<(), BoxStdErr> {
		let tag = self.seal_inplace(&mut buf[start_pos..], aad)?;
		buf.extend_from_slice(&tag);
		Ok(())
	}
}

pub struct Decryptor<N: nonce::Sequence> {
	key: OpeningKey<NonceWrapper<N>>,
}

impl<N: nonce::Sequence> Decryptor<N> {
	pub fn new(key: &Key, nonce: N) -> Self {
		Self {
			key: OpeningKey::new(get_unbound_key(key), NonceWrapper(nonce)),
		}
	}

	/// Decrypt `buf` (ciphertext followed by tag) in place.
	///
	/// Returns the plaintext part of `buf` on success.
	///
	/// # Errors
	///
	/// Returns an error if the authentication tag does not verify.
	pub fn open_inplace<'b>(&mut self, buf: &'b mut [u8], aad: &[u8]) -> Result<&'b [u8], BoxStdErr> {
		let plain_text = self
			.key
			.open_in_place(ring::aead::Aad::from(aad), buf)
			.map_err(|_| "unable to decrypt AEAD ciphertext")?;
		Ok(plain_text)
	}
}

fn get_unbound_key(key: &Key) -> UnboundKey {
	let (algo, key) = match &key {
		Key::Aes128Gcm(key) => (&ring::aead::AES_128_GCM, key.as_ref()),
		Key::Aes256Gcm(key) => (&ring::aead::AES_256_GCM, key.as_ref()),
		Key::ChaCha20Poly1305(key) => (&ring::aead::CHACHA20_POLY1305, key.as_ref()),
	};
	// Key length is guaranteed by the Key enum.
	UnboundKey::new(algo, key).expect("AEAD key has invalid length")
}

pub mod nonce {
	use super::NONCE_LEN;

	// Nonce with all 0s.
	pub const EMPTY: &[u8; NONCE_LEN] = &[0_u8; NONCE_LEN];

	#[allow(clippy::module_name_repetitions)]
	pub trait Sequence {
		fn curr(&self) -> &[u8; NONCE_LEN];
		fn update(&mut self);
	}

	/// A nonce sequence that treats the nonce as a small-endian unsigned
	/// integer and increases its value by 1 on every `update`.
	pub struct CounterSequence {
		nonce: [u8; NONCE_LEN],
	}

	impl CounterSequence {
		#[inline]
		#[must_use]
		pub fn new(nonce: &[u8; NONCE_LEN]) -> Self {
			Self { nonce: *nonce }
		}
	}

	impl Default for CounterSequence {
		fn default() -> Self {
			Self {
				nonce: [0_u8; NONCE_LEN],
			}
		}
	}

	impl Sequence for CounterSequence {
		#[inline]
		fn curr(&self) -> &[u8; NONCE_LEN] {
			&self.nonce
		}

		#[inline]
		fn update(&mut self) {
			increase(&mut self.nonce);
		}
	}

	#[inline]
	pub fn increase(nonce: &mut [u8; NONCE_LEN]) {
		for i in nonce {
			if u8::MAX == *i {
				*i = 0;
			} else {
				*i += 1;
				return;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::{
		nonce::{increase, CounterSequence},
		Algorithm, Decryptor, Encryptor, Key, NONCE_LEN,
	};

	#[test]
	fn nonce_increase() {
		let mut n = [0_u8; NONCE_LEN];
		increase(&mut n);
		assert_eq!(n[0], 1);

		let mut n = [0_u8; NONCE_LEN];
		n[0] = u8::MAX;
		increase(&mut n);
		assert_eq!(n[0], 0);
		assert_eq!(n[1], 1);
	}

	#[test]
	fn seal_open_round_trip() {
		for algo in [
			Algorithm::Aes128Gcm,
			Algorithm::Aes256Gcm,
			Algorithm::ChaCha20Poly1305,
		] {
			let key = match algo {
				Algorithm::Aes128Gcm => Key::Aes128Gcm([7_u8; 16]),
				Algorithm::Aes256Gcm => Key::Aes256Gcm([7_u8; 32]),
				Algorithm::ChaCha20Poly1305 => Key::ChaCha20Poly1305([7_u8; 32]),
			};
			let key2 = match algo {
				Algorithm::Aes128Gcm => Key::Aes128Gcm([7_u8; 16]),
				Algorithm::Aes256Gcm => Key::Aes256Gcm([7_u8; 32]),
				Algorithm::ChaCha20Poly1305 => Key::ChaCha20Poly1305([7_u8; 32]),
			};

			let mut enc = Encryptor::new(&key, CounterSequence::default());
			let mut buf = b"attack at dawn".to_vec();
			let tag = enc.seal_inplace(&mut buf, &[]).unwrap();
			buf.extend_from_slice(&tag);

			let mut dec = Decryptor::new(&key2, CounterSequence::default());
			let plain = dec.open_inplace(&mut buf, &[]).unwrap();
			assert_eq!(plain, b"attack at dawn");
		}
	}

	#[test]
	fn open_rejects_tampering() {
		let key = Key::Aes256Gcm([1_u8; 32]);
		let mut enc = Encryptor::new(&key, CounterSequence::default());
		let mut buf = b"payload".to_vec();
		let tag = enc.seal_inplace(&mut buf, &[]).unwrap();
		buf.extend_from_slice(&tag);
		buf[0] ^= 0xff;

		let key = Key::Aes256Gcm([1_u8; 32]);
		let mut dec = Decryptor::new(&key, CounterSequence::default());
		assert!(dec.open_inplace(&mut buf, &[]).is_err());
	}
}
