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
An implementation of the shadowsocks wire protocol.
See more at <https://shadowsocks.org/en/wiki/Protocol.html>

Only AEAD ciphers are supported.
*/

pub mod tcp;
pub mod udp;

use crate::{
	crypto::aead::{Algorithm, Key},
	prelude::*,
	protocol::socks_addr::ReadError,
};
use bytes::Bytes;
use hkdf::Hkdf;
use md5::{digest::Digest, Md5};
use sha1::Sha1;

const INFO: &[u8] = b"ss-subkey";

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("shadowsocks crypto error ({0})")]
	FailedCrypto(BoxStdErr),
	#[error("shadowsocks address error ({0})")]
	FailedAddressParsing(ReadError),
	#[error("shadowsocks datagram ({0} bytes) too small")]
	DatagramTooSmall(usize),
	#[error("empty payload")]
	EmptyPayload,
}

impl From<ReadError> for Error {
	fn from(e: ReadError) -> Self {
		Error::FailedAddressParsing(e)
	}
}

/// An AEAD cipher method a client may use.
///
/// This is the closed set of ciphers an access key can be provisioned
/// with; anything else is rejected when the configuration is read.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Deserialize)]
pub enum Method {
	#[serde(rename = "aes-128-gcm")]
	Aes128Gcm,
	#[serde(rename = "aes-256-gcm")]
	Aes256Gcm,
	#[serde(rename = "chacha20-ietf-poly1305")]
	Chacha20Poly1305,
}

impl Method {
	#[inline]
	#[must_use]
	pub fn new_from_str(s: &str) -> Option<Self> {
		Some(match s {
			"aes-128-gcm" => Method::Aes128Gcm,
			"aes-256-gcm" => Method::Aes256Gcm,
			"chacha20-ietf-poly1305" => Method::Chacha20Poly1305,
			_ => return None,
		})
	}

	#[inline]
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Method::Aes128Gcm => "aes-128-gcm",
			Method::Aes256Gcm => "aes-256-gcm",
			Method::Chacha20Poly1305 => "chacha20-ietf-poly1305",
		}
	}

	#[inline]
	#[must_use]
	pub fn algo(self) -> Algorithm {
		match self {
			Method::Aes128Gcm => Algorithm::Aes128Gcm,
			Method::Aes256Gcm => Algorithm::Aes256Gcm,
			Method::Chacha20Poly1305 => Algorithm::ChaCha20Poly1305,
		}
	}
}

impl std::fmt::Display for Method {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Expand a master password into a master key of `key_len` bytes with the
/// openssl EVP_BytesToKey MD5 construction.
pub fn password_to_key(key_len: usize, password: &str) -> Bytes {
	let digest_len = Md5::output_size();
	let mut result = Vec::with_capacity(std::cmp::max(key_len, digest_len) * 2);

	let mut m = None;
	let mut d = Md5::new();
	while result.len() < key_len {
		if let Some(ref rm) = m {
			d.update(rm);
		}
		d.update(password);
		let digest = d.finalize_reset();
		result.put(&*digest);

		m = Some(digest);
	}

	result.truncate(key_len);
	result.into()
}

/// Derive the per-connection session key from the master key and the salt
/// with HKDF-SHA1.
pub fn key_to_session_key(key: &[u8], salt: &[u8], algo: Algorithm) -> Key {
	debug_assert_eq!(salt.len(), salt_len(algo));
	let h = Hkdf::<Sha1>::new(Some(salt), key);
	match algo {
		Algorithm::Aes128Gcm => {
			let mut okm = [0_u8; 16];
			h.expand(INFO, &mut okm)
				.expect("invalid key length for hkdf expanding");
			Key::Aes128Gcm(okm)
		}
		Algorithm::Aes256Gcm => {
			let mut okm = [0_u8; 32];
			h.expand(INFO, &mut okm)
				.expect("invalid key length for hkdf expanding");
			Key::Aes256Gcm(okm)
		}
		Algorithm::ChaCha20Poly1305 => {
			let mut okm = [0_u8; 32];
			h.expand(INFO, &mut okm)
				.expect("invalid key length for hkdf expanding");
			Key::ChaCha20Poly1305(okm)
		}
	}
}

/// The shadowsocks salt is as long as the cipher key.
#[inline]
#[must_use]
pub fn salt_len(algo: Algorithm) -> usize {
	algo.key_size()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn method_names() {
		assert_eq!(Method::new_from_str("aes-128-gcm"), Some(Method::Aes128Gcm));
		assert_eq!(Method::new_from_str("aes-256-gcm"), Some(Method::Aes256Gcm));
		assert_eq!(
			Method::new_from_str("chacha20-ietf-poly1305"),
			Some(Method::Chacha20Poly1305)
		);
		// Non AEAD methods must be rejected.
		assert_eq!(Method::new_from_str("rc4-md5"), None);
		assert_eq!(Method::new_from_str("none"), None);
	}

	#[test]
	fn password_expansion() {
		let key = password_to_key(32, "hunter2");
		assert_eq!(key.len(), 32);
		// Stable across calls.
		assert_eq!(key, password_to_key(32, "hunter2"));
		assert_ne!(key[..16], password_to_key(16, "hunter3")[..]);
		// The first 16 bytes are a plain MD5 of the password.
		assert_eq!(key[..16], password_to_key(16, "hunter2")[..]);
	}
}
