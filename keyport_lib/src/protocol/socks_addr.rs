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

use crate::{prelude::*, utils::ReadInt};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use smol_str::SmolStr;
use std::{
	fmt::{self, Display},
	io,
	num::NonZeroU16,
	str::FromStr,
};

const EMPTY_STRING: &str = "empty string";

// See more at <https://tools.ietf.org/html/rfc1928>
#[derive(Debug, Clone, Copy, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AddrType {
	Ipv4 = 1_u8,
	Name = 3_u8,
	Ipv6 = 4_u8,
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
	#[error("str is not utf8 ({0})")]
	StrNotUtf8(std::str::Utf8Error),
	#[error("unknown address type {0}")]
	UnknownAddressType(u8),
	#[error("invalid domain ({0})")]
	InvalidDomain(BoxStdErr),
	#[error("IO error ({0})")]
	Io(#[from] io::Error),
}

impl ReadError {
	#[must_use]
	pub fn into_io_err(self) -> io::Error {
		if let Self::Io(e) = self {
			e
		} else {
			io::Error::new(io::ErrorKind::InvalidData, self)
		}
	}
}

// -------------------------------------------------------
//                     SocksDestination
// -------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SocksDestination {
	/// Must be a valid domain name.
	Name(DomainName),
	Ip(IpAddr),
}

impl SocksDestination {
	#[inline]
	#[must_use]
	pub fn atyp(&self) -> AddrType {
		match self {
			SocksDestination::Name(_) => AddrType::Name,
			SocksDestination::Ip(IpAddr::V4(_)) => AddrType::Ipv4,
			SocksDestination::Ip(IpAddr::V6(_)) => AddrType::Ipv6,
		}
	}

	/// Creates a [`SocksDestination`] from address type `atyp` and byte
	/// stream `r`.
	///
	/// The format for each address type is:
	/// - [`AddrType::Ipv4`]: | 4 bytes |
	/// - [`AddrType::Ipv6`]: | 16 bytes |
	/// - [`AddrType::Name`]: | n, 1 byte | n bytes |
	///
	/// # Errors
	///
	/// A [`ReadError`] will be returned if reading or parsing fails.
	pub fn read_from_atyp<R>(r: &mut R, atyp: AddrType) -> Result<Self, ReadError>
	where
		R: std::io::Read,
	{
		Ok(match atyp {
			AddrType::Ipv4 => {
				let mut buf = [0_u8; 4];
				r.read_exact(&mut buf)?;
				Ipv4Addr::from(buf).into()
			}
			AddrType::Ipv6 => {
				let mut buf = [0_u8; 16];
				r.read_exact(&mut buf)?;
				Ipv6Addr::from(buf).into()
			}
			AddrType::Name => {
				let len = r.read_u8()?;
				if len == 0 {
					return Err(ReadError::InvalidDomain(EMPTY_STRING.into()));
				}
				// Domain length is a u8, which will never be larger than 256.
				let mut buffer = [0_u8; 256];
				let buffer = &mut buffer[..len as usize];
				r.read_exact(buffer)?;
				let name = std::str::from_utf8(buffer).map_err(ReadError::StrNotUtf8)?;
				SocksDestination::Name(DomainName(name.into()))
			}
		})
	}

	/// This is the async version of [`Self::read_from_atyp`].
	///
	/// # Errors
	///
	/// This function returns the same error as [`Self::read_from_atyp`].
	pub async fn async_read_from_atyp(
		r: &mut (impl AsyncRead + Unpin),
		atyp: AddrType,
	) -> Result<Self, ReadError> {
		Ok(match atyp {
			AddrType::Ipv4 => Ipv4Addr::from(r.read_u32().await?).into(),
			AddrType::Ipv6 => Ipv6Addr::from(r.read_u128().await?).into(),
			AddrType::Name => {
				let len = r.read_u8().await?;
				if len == 0 {
					return Err(ReadError::InvalidDomain(EMPTY_STRING.into()));
				}
				let mut buffer = [0_u8; 256];
				let buffer = &mut buffer[..len as usize];
				r.read_exact(buffer).await?;
				let name = std::str::from_utf8(buffer).map_err(ReadError::StrNotUtf8)?;
				SocksDestination::Name(DomainName(name.into()))
			}
		})
	}

	pub fn write_to_no_atyp(&self, buf: &mut impl BufMut) {
		match self {
			SocksDestination::Name(name) => {
				buf.put_u8(name.len());
				buf.put(name.as_str().as_bytes());
			}
			SocksDestination::Ip(ip) => match ip {
				IpAddr::V4(ipv4) => {
					buf.put(&ipv4.octets()[..]);
				}
				IpAddr::V6(ipv6) => {
					buf.put(&ipv6.octets()[..]);
				}
			},
		}
	}

	/// Get the minimal length of buffer needed to store the serialized data,
	/// including the ATYP byte.
	#[inline]
	#[must_use]
	pub fn serialized_len_atyp(&self) -> usize {
		// ATYP (1 byte) + ADDR
		1 + match self {
			SocksDestination::Ip(ip) => match ip {
				IpAddr::V4(_) => 4,
				IpAddr::V6(_) => 16,
			},
			// N (1 byte) + NAME (N bytes)
			SocksDestination::Name(name) => 1 + name.len() as usize,
		}
	}
}

impl From<Ipv4Addr> for SocksDestination {
	#[inline]
	fn from(ip: Ipv4Addr) -> Self {
		Self::Ip(ip.into())
	}
}

impl From<Ipv6Addr> for SocksDestination {
	#[inline]
	fn from(ip: Ipv6Addr) -> Self {
		Self::Ip(ip.into())
	}
}

impl From<IpAddr> for SocksDestination {
	#[inline]
	fn from(ip: IpAddr) -> Self {
		Self::Ip(ip)
	}
}

impl Display for SocksDestination {
	#[inline]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Ip(ip) => ip.fmt(f),
			Self::Name(name) => name.fmt(f),
		}
	}
}

// -------------------------------------------------------
//                       SocksAddr
// -------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SocksAddr {
	pub dest: SocksDestination,
	pub port: u16,
}

impl SocksAddr {
	#[inline]
	#[must_use]
	pub fn new(dest: SocksDestination, port: u16) -> Self {
		Self { dest, port }
	}

	/// Creates a [`SocksAddr`] from byte stream `r`.
	///
	/// The wire format is:
	/// ```not_rust
	/// +------+----------------+----------------+
	/// | ATYP |  Destination   |     Port       |
	/// +------+----------------+----------------+
	/// | u8   | various bytes  |   2 bytes      |
	/// |      |                | big endian u16 |
	/// +------+----------------+----------------+
	/// ```
	///
	/// # Errors
	///
	/// If there is any error, a [`ReadError`] will be returned.
	pub fn read_from<R>(r: &mut R) -> Result<Self, ReadError>
	where
		R: std::io::Read,
	{
		let atyp_num = r.read_u8()?;
		let atyp =
			AddrType::try_from(atyp_num).map_err(|_| ReadError::UnknownAddressType(atyp_num))?;
		let dest = SocksDestination::read_from_atyp(r, atyp)?;
		let port = r.read_u16()?;
		Ok(Self::new(dest, port))
	}

	/// Helper for reading from bytes instead of a stream.
	///
	/// Returns the address and the number of bytes it occupied in `buf`.
	///
	/// # Errors
	///
	/// This function returns the same error as [`Self::read_from`].
	pub fn read_from_bytes(buf: &[u8]) -> Result<(Self, NonZeroU16), ReadError> {
		let mut cur = std::io::Cursor::new(buf);
		let addr = Self::read_from(&mut cur)?;
		let n = u16::try_from(cur.position())
			.ok()
			.and_then(NonZeroU16::new)
			.ok_or_else(|| {
				ReadError::Io(io::Error::new(
					io::ErrorKind::InvalidData,
					"invalid serialized address length",
				))
			})?;
		Ok((addr, n))
	}

	/// This is the async version of [`Self::read_from`].
	///
	/// # Errors
	///
	/// This function returns the same error as [`Self::read_from`].
	pub async fn async_read_from<R>(r: &mut R) -> Result<Self, ReadError>
	where
		R: AsyncRead + Unpin,
	{
		let atyp_num = r.read_u8().await?;
		let atyp =
			AddrType::try_from(atyp_num).map_err(|_| ReadError::UnknownAddressType(atyp_num))?;
		let dest = SocksDestination::async_read_from_atyp(r, atyp).await?;
		let port = r.read_u16().await?;
		Ok(Self::new(dest, port))
	}

	/// Return the number of bytes it takes to store the serialized address.
	#[inline]
	#[must_use]
	pub fn serialized_len_atyp(&self) -> usize {
		// length of port (u16) plus the other parts
		self.dest.serialized_len_atyp() + 2
	}

	/// Write the address into `buf` in SOCKS5 address format
	/// (ATYP, destination, big endian port).
	#[inline]
	pub fn write_to<B: BufMut>(&self, buf: &mut B) {
		buf.put_u8(self.dest.atyp() as u8);
		self.dest.write_to_no_atyp(buf);
		buf.put_u16(self.port);
	}
}

impl Display for SocksAddr {
	#[inline]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.dest {
			SocksDestination::Name(name) => write!(f, "{}:{}", name, self.port),
			SocksDestination::Ip(ip) => SocketAddr::new(*ip, self.port).fmt(f),
		}
	}
}

impl From<SocketAddr> for SocksAddr {
	#[inline]
	fn from(addr: SocketAddr) -> Self {
		Self {
			dest: addr.ip().into(),
			port: addr.port(),
		}
	}
}

impl From<(IpAddr, u16)> for SocksAddr {
	#[inline]
	fn from((ip, port): (IpAddr, u16)) -> Self {
		Self {
			dest: SocksDestination::Ip(ip),
			port,
		}
	}
}

// -------------------------------------------------------
//                     DomainName
// -------------------------------------------------------

/// A domain string that's guaranteed to be at most 255 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DomainName(SmolStr);

impl DomainName {
	#[inline]
	#[must_use]
	pub fn as_str(&self) -> &str {
		self.0.as_str()
	}

	#[allow(clippy::cast_possible_truncation)]
	#[inline]
	#[must_use]
	pub fn len(&self) -> u8 {
		debug_assert!(self.0.len() <= 255);
		self.0.len() as u8
	}

	#[inline]
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl FromStr for DomainName {
	type Err = ReadError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.is_empty() {
			return Err(ReadError::InvalidDomain(EMPTY_STRING.into()));
		}
		if s.len() > 255 {
			return Err(ReadError::InvalidDomain(
				format!("domain of {} bytes is too long", s.len()).into(),
			));
		}
		Ok(Self(s.into()))
	}
}

impl Display for DomainName {
	#[inline]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn round_trip(addr: &SocksAddr) {
		let mut buf = Vec::new();
		addr.write_to(&mut buf);
		assert_eq!(buf.len(), addr.serialized_len_atyp());
		let (parsed, n) = SocksAddr::read_from_bytes(&buf).unwrap();
		assert_eq!(&parsed, addr);
		assert_eq!(usize::from(n.get()), buf.len());
	}

	#[test]
	fn ipv4_round_trip() {
		round_trip(&SocksAddr::new(Ipv4Addr::new(127, 0, 0, 1).into(), 8080));
	}

	#[test]
	fn ipv6_round_trip() {
		round_trip(&SocksAddr::new(Ipv6Addr::LOCALHOST.into(), 443));
	}

	#[test]
	fn domain_round_trip() {
		let dest = SocksDestination::Name("example.com".parse().unwrap());
		round_trip(&SocksAddr::new(dest, 80));
	}

	#[test]
	fn unknown_atyp() {
		let buf = [9_u8, 1, 2, 3, 4, 0, 80];
		let err = SocksAddr::read_from_bytes(&buf).unwrap_err();
		assert!(matches!(err, ReadError::UnknownAddressType(9)));
	}

	#[test]
	fn empty_domain_rejected() {
		let buf = [3_u8, 0, 0, 80];
		assert!(SocksAddr::read_from_bytes(&buf).is_err());
		assert!("".parse::<DomainName>().is_err());
	}
}
