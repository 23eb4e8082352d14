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

use crate::shadowsocks::Method;

/// One provisioned access key.
///
/// Several keys may share a port (multi-tenant); ids are expected to be
/// unique across a snapshot. Non-AEAD cipher names fail deserialization,
/// since [`Method`] only has AEAD variants.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AccessKey {
	pub id: String,
	pub port: u16,
	pub cipher: Method,
	pub secret: String,
}

/// A full configuration: the ordered list of access keys.
///
/// Snapshots are compared only by the port and key sets they induce.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ConfigSnapshot {
	#[serde(default)]
	pub keys: Vec<AccessKey>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_yaml_config() {
		let text = r#"
keys:
  - id: user-1
    port: 9000
    cipher: chacha20-ietf-poly1305
    secret: hunter2
  - id: user-2
    port: 9000
    cipher: aes-256-gcm
    secret: correct horse
"#;
		let snapshot: ConfigSnapshot = serde_yaml::from_str(text).unwrap();
		assert_eq!(snapshot.keys.len(), 2);
		assert_eq!(snapshot.keys[0].id, "user-1");
		assert_eq!(snapshot.keys[0].port, 9000);
		assert_eq!(snapshot.keys[0].cipher, Method::Chacha20Poly1305);
		assert_eq!(snapshot.keys[1].cipher, Method::Aes256Gcm);
		assert_eq!(snapshot.keys[1].secret, "correct horse");
	}

	#[test]
	fn non_aead_cipher_rejected() {
		let text = r#"
keys:
  - id: user-1
    port: 9000
    cipher: rc4-md5
    secret: hunter2
"#;
		assert!(serde_yaml::from_str::<ConfigSnapshot>(text).is_err());
	}

	#[test]
	fn empty_config() {
		let snapshot: ConfigSnapshot = serde_yaml::from_str("keys: []").unwrap();
		assert!(snapshot.keys.is_empty());
	}
}
