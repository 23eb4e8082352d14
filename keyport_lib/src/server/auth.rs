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
Access key identification.

A shadowsocks AEAD stream carries no key id, so a port shared by several
access keys must discover the key by trial decryption. The first length
part of the stream (2 bytes plus tag) authenticates under exactly one
session key; verifying it proves possession of the matching secret while
reading only `salt_len + 18` bytes.

Bytes consumed by failed trials are kept in a replay buffer, so the wire
is read at most once and the selected cipher can decode the stream from
its very beginning.
*/

use crate::{
	crypto::aead::{self, nonce::CounterSequence, Algorithm, Decryptor},
	prelude::*,
	shadowsocks::{
		key_to_session_key, password_to_key, salt_len,
		tcp::{Decoder, Encoder, MAX_PAYLOAD_SIZE},
		Method,
	},
	utils::{
		codec::{FrameReadHalf, FrameWriteHalf},
		ReplayReader,
	},
};
use bytes::Bytes;
use rand::thread_rng;
use std::{collections::HashMap, io, sync::Mutex};

/// Bytes needed to authenticate one candidate: the salt plus the first
/// encrypted length part.
const LEN_PART_SIZE: usize = 2 + aead::TAG_LEN;

/// A named AEAD cipher bound to an access key id.
#[derive(Clone)]
pub struct CipherEntry {
	pub id: Tag,
	pub method: Method,
	master_key: Bytes,
}

impl CipherEntry {
	#[must_use]
	pub fn new(id: impl Into<Tag>, method: Method, secret: &str) -> Self {
		let master_key = password_to_key(salt_len(method.algo()), secret);
		Self {
			id: id.into(),
			method,
			master_key,
		}
	}

	#[inline]
	#[must_use]
	pub fn algo(&self) -> Algorithm {
		self.method.algo()
	}

	#[inline]
	#[must_use]
	pub fn salt_len(&self) -> usize {
		salt_len(self.algo())
	}

	#[inline]
	pub(crate) fn master_key(&self) -> &Bytes {
		&self.master_key
	}
}

/// The set of access keys live on one port.
///
/// Entries keep their declaration order; they are immutable once the set
/// is built.
#[derive(Default)]
pub struct KeySet {
	entries: Vec<CipherEntry>,
}

impl KeySet {
	/// Insert an entry, replacing any previous entry with the same id.
	///
	/// Returns the replaced entry, if any.
	pub fn insert(&mut self, entry: CipherEntry) -> Option<CipherEntry> {
		if let Some(pos) = self.position(&entry.id) {
			Some(std::mem::replace(&mut self.entries[pos], entry))
		} else {
			self.entries.push(entry);
			None
		}
	}

	#[inline]
	#[must_use]
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	#[inline]
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &CipherEntry> {
		self.entries.iter()
	}

	#[must_use]
	pub fn position(&self, id: &str) -> Option<usize> {
		self.entries.iter().position(|e| e.id == id)
	}

	/// Entries in probe order: the hinted id first (if present), then the
	/// rest in declaration order.
	pub(crate) fn candidates(&self, hint: Option<&Tag>) -> Vec<&CipherEntry> {
		let hint_pos = hint.and_then(|id| self.position(id));
		let mut result = Vec::with_capacity(self.entries.len());
		if let Some(pos) = hint_pos {
			result.push(&self.entries[pos]);
		}
		result.extend(
			self.entries
				.iter()
				.enumerate()
				.filter(|(i, _)| Some(*i) != hint_pos)
				.map(|(_, e)| e),
		);
		result
	}
}

impl FromIterator<CipherEntry> for KeySet {
	fn from_iter<T: IntoIterator<Item = CipherEntry>>(iter: T) -> Self {
		let mut set = Self::default();
		for entry in iter {
			set.insert(entry);
		}
		set
	}
}

/// Per-client-IP cache of the most recently successful key id.
///
/// Probing is O(|keys|) per new connection; trying the last known good
/// key first makes the common case O(1).
#[derive(Default)]
pub struct ProbeCache {
	map: Mutex<HashMap<IpAddr, Tag>>,
}

impl ProbeCache {
	#[must_use]
	pub fn hint(&self, ip: &IpAddr) -> Option<Tag> {
		self.map.lock().expect("probe cache lock poisoned").get(ip).cloned()
	}

	pub fn remember(&self, ip: IpAddr, id: &Tag) {
		self.map
			.lock()
			.expect("probe cache lock poisoned")
			.insert(ip, id.clone());
	}
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
	#[error("empty key set")]
	EmptyKeySet,
	#[error("could not find valid key")]
	NoValidKey,
	#[error("IO error while probing keys ({0})")]
	Io(#[from] io::Error),
}

pub type CryptReadHalf<R> = FrameReadHalf<Decoder, ReplayReader<R>>;
pub type CryptWriteHalf<W> = FrameWriteHalf<Encoder, W>;

/// Identify which access key of `keys` the client stream is encrypted
/// under, and wrap the stream with that key's framed reader and writer.
///
/// The returned reader yields the decrypted stream from its beginning;
/// no bytes consumed during probing are lost.
///
/// # Errors
///
/// - [`AuthError::EmptyKeySet`] if `keys` is empty; nothing is read.
/// - [`AuthError::NoValidKey`] if no key authenticates the stream.
/// - [`AuthError::Io`] if the stream fails with a non-EOF error.
pub async fn find_access_key<R, W>(
	mut r: R,
	w: W,
	peer: IpAddr,
	keys: &KeySet,
	cache: &ProbeCache,
) -> Result<(Tag, CryptReadHalf<R>, CryptWriteHalf<W>), AuthError>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	if keys.is_empty() {
		return Err(AuthError::EmptyKeySet);
	}
	if keys.len() == 1 {
		// A single tenant needs no probing. If the secret does not match,
		// the first framed read will fail instead.
		let entry = keys.candidates(None)[0];
		trace!("Single key '{}', skipping probe", entry.id);
		return Ok(wrap_entry(entry, Vec::new(), r, w));
	}

	// Bytes already read off the wire, replayable for every candidate.
	let mut buffer: Vec<u8> = Vec::new();
	let hint = cache.hint(&peer);
	for entry in keys.candidates(hint.as_ref()) {
		let need = entry.salt_len() + LEN_PART_SIZE;
		fill_buffer(&mut r, &mut buffer, need).await?;
		if buffer.len() < need {
			debug!("Key '{}' failed: client closed during handshake", entry.id);
			continue;
		}

		let (salt, rest) = buffer.split_at(entry.salt_len());
		let session_key = key_to_session_key(entry.master_key(), salt, entry.algo());
		let mut dec = Decryptor::new(&session_key, CounterSequence::default());
		// Trial decryption mangles its input, so work on a copy.
		let mut len_part = [0_u8; LEN_PART_SIZE];
		len_part.copy_from_slice(&rest[..LEN_PART_SIZE]);
		if dec.open_inplace(&mut len_part, &[]).is_ok() {
			debug!("Selected key '{}'", entry.id);
			cache.remember(peer, &entry.id);
			return Ok(wrap_entry(entry, buffer, r, w));
		}
		trace!("Key '{}' failed to authenticate", entry.id);
	}
	Err(AuthError::NoValidKey)
}

/// Read from `r` into `buf` until it holds at least `need` bytes or the
/// stream ends. Never reads past `need`.
async fn fill_buffer<R: AsyncRead + Unpin>(
	r: &mut R,
	buf: &mut Vec<u8>,
	need: usize,
) -> io::Result<()> {
	let mut chunk = [0_u8; aead::TAG_LEN + 2 + 32];
	while buf.len() < need {
		let want = std::cmp::min(need - buf.len(), chunk.len());
		let n = r.read(&mut chunk[..want]).await?;
		if n == 0 {
			// EOF; the caller checks whether enough arrived.
			return Ok(());
		}
		buf.extend_from_slice(&chunk[..n]);
	}
	Ok(())
}

fn wrap_entry<R, W>(
	entry: &CipherEntry,
	buffer: Vec<u8>,
	r: R,
	w: W,
) -> (Tag, CryptReadHalf<R>, CryptWriteHalf<W>)
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let local_salt = {
		let mut salt = vec![0_u8; entry.salt_len()];
		thread_rng().fill_bytes(&mut salt);
		salt
	};
	let decoder = Decoder::new(entry.algo(), entry.master_key().clone());
	let encoder = Encoder::new(entry.algo(), entry.master_key(), local_salt);
	(
		entry.id.clone(),
		FrameReadHalf::new(decoder, ReplayReader::new(r, buffer)),
		FrameWriteHalf::new(MAX_PAYLOAD_SIZE.into(), encoder, w),
	)
}

/// Client-side wrapping with a known entry; used by the UDP return path
/// tests and the integration tests.
#[doc(hidden)]
pub fn wrap_client<R, W>(
	entry: &CipherEntry,
	r: R,
	w: W,
) -> (CryptReadHalf<R>, CryptWriteHalf<W>)
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let (_, r, w) = wrap_entry(entry, Vec::new(), r, w);
	(r, w)
}
