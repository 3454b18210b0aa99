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

/// Only the low nibble of the address type byte is meaningful,
/// the high bits are reserved by some client implementations.
pub const ADDR_MASK: u8 = 0x0F;

// See more at <https://tools.ietf.org/html/rfc1928>
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AddrType {
	Ipv4 = 1_u8,
	Name = 3_u8,
	Ipv6 = 4_u8,
}

impl AddrType {
	#[inline]
	#[must_use]
	pub const fn val(self) -> u8 {
		self as u8
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
	#[error("unknown address type {0}")]
	UnknownAddressType(u8),
	#[error("invalid domain ({0})")]
	InvalidDomain(BoxStdErr),
	#[error("invalid address ({0})")]
	InvalidAddress(BoxStdErr),
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
	/// Create a new `SocksDestination` from [`str`].
	/// # Errors
	/// Return a [`ReadError`] if `value` is not a valid domain name.
	pub fn new_domain(value: impl AsRef<str>) -> Result<Self, ReadError> {
		DomainName::from_str(value.as_ref()).map(SocksDestination::Name)
	}

	#[inline]
	#[must_use]
	pub fn atyp(&self) -> AddrType {
		match self {
			SocksDestination::Name(_) => AddrType::Name,
			SocksDestination::Ip(IpAddr::V4(_)) => AddrType::Ipv4,
			SocksDestination::Ip(IpAddr::V6(_)) => AddrType::Ipv6,
		}
	}

	/// Creates a [`SocksDestination`] from address type `atyp` and byte stream `r`.
	///
	/// The format for each address type are as following:
	/// - [`AddrType::Ipv4`]: | 4 bytes |
	/// - [`AddrType::Ipv6`]: | 16 bytes |
	/// - [`AddrType::Name`]: | n, 1 byte | n bytes |
	///
	/// # Errors
	///
	/// [`ReadError`] will be returned if error occurred.
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
				let name = std::str::from_utf8(buffer)
					.map_err(|e| ReadError::InvalidDomain(e.into()))?;
				SocksDestination::Name(DomainName::from_str(name)?)
			}
		})
	}

	pub fn write_to_no_atyp(&self, buf: &mut impl BufMut) {
		match self {
			SocksDestination::Name(name) => {
				buf.put_u8(name.len());
				buf.put(name.as_bytes());
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

	#[inline]
	#[must_use]
	/// Get the minimal length of buffer needed to store the serialized data.
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

// --- Traits ---

impl FromStr for SocksDestination {
	type Err = ReadError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.is_empty() {
			return Err(ReadError::InvalidDomain(EMPTY_STRING.into()));
		}
		if let Ok(ip) = IpAddr::from_str(s) {
			return Ok(Self::Ip(ip));
		}
		DomainName::from_str(s).map(Self::Name)
	}
}

impl From<DomainName> for SocksDestination {
	#[inline]
	fn from(domain: DomainName) -> Self {
		Self::Name(domain)
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
	/// This function will try to read in the following format:
	/// ```not_rust
	/// +------+----------------+----------------+
	/// | ATYP |  Destination   |     Port       |
	/// +------+----------------+----------------+
	/// | u8   | various bytes  |   2 bytes      |
	/// |      |                | big endian u16 |
	/// +------+----------------+----------------+
	/// ```
	///
	/// Only the low nibble of ATYP is looked at; the high bits are
	/// masked off with [`ADDR_MASK`] before matching.
	///
	/// # Errors
	///
	/// If there is any error, a [`ReadError`] will be returned.
	pub fn read_from<R>(r: &mut R) -> Result<Self, ReadError>
	where
		R: std::io::Read,
	{
		let atyp_num = r.read_u8()? & ADDR_MASK;
		let atyp =
			AddrType::try_from(atyp_num).map_err(|_| ReadError::UnknownAddressType(atyp_num))?;
		let dest = SocksDestination::read_from_atyp(r, atyp)?;
		let port = r.read_u16()?;
		Ok(Self::new(dest, port))
	}

	/// This is a helper function for reading from bytes instead of a stream.
	///
	/// Returns the address and the number of bytes consumed, so that the
	/// caller can locate whatever trails the address record in `buf`.
	///
	/// # Errors
	///
	/// This function returns the same error as [`Self::read_from`].
	#[inline]
	pub fn read_from_bytes(buf: &[u8]) -> Result<(Self, NonZeroU16), ReadError> {
		let mut cur = std::io::Cursor::new(buf);
		let addr = Self::read_from(&mut cur)?;
		let n = u16::try_from(cur.position())
			.map_err(|_| ReadError::InvalidAddress("address record too long".into()))?;
		let n = NonZeroU16::new(n)
			.ok_or_else(|| ReadError::InvalidAddress("empty address record".into()))?;
		Ok((addr, n))
	}

	/// Return the number of bytes it will take to store the serialized address.
	#[inline]
	#[must_use]
	pub fn serialized_len_atyp(&self) -> usize {
		// length of port(u16) plus the other parts
		self.dest.serialized_len_atyp() + 2
	}

	/// Write the address into `buf` in [SOCKS5 address format].
	///
	/// [SOCKS5 address format]: https://tools.ietf.org/html/rfc1928#section-5
	#[inline]
	pub fn write_to<B: BufMut>(&self, buf: &mut B) {
		buf.put_u8(self.dest.atyp().val());
		self.dest.write_to_no_atyp(buf);
		buf.put_u16(self.port);
	}
}

// --- Traits ---

impl Display for SocksAddr {
	/// IPv6 addresses are bracketed (`[v6]:port`), IPv4 and domain
	/// names are joined bare (`host:port`).
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

impl From<(SocksDestination, u16)> for SocksAddr {
	#[inline]
	fn from((dest, port): (SocksDestination, u16)) -> Self {
		Self { dest, port }
	}
}

impl From<(Ipv4Addr, u16)> for SocksAddr {
	#[inline]
	fn from((ip, port): (Ipv4Addr, u16)) -> Self {
		Self {
			dest: SocksDestination::Ip(ip.into()),
			port,
		}
	}
}

impl From<(Ipv6Addr, u16)> for SocksAddr {
	#[inline]
	fn from((ip, port): (Ipv6Addr, u16)) -> Self {
		Self {
			dest: SocksDestination::Ip(ip.into()),
			port,
		}
	}
}

// -------------------------------------------------------
//                     DomainName
// -------------------------------------------------------

/// A domain string that's guaranteed to be non-empty, at most 255 bytes
/// and free of NUL bytes.
///
/// A NUL byte smuggled inside a domain can reach the OS resolver and
/// crash it on some platforms, so it is rejected here once and for all.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DomainName(SmolStr);

impl DomainName {
	#[inline]
	#[must_use]
	pub fn as_str(&self) -> &str {
		self.0.as_str()
	}

	#[inline]
	#[must_use]
	pub fn as_bytes(&self) -> &[u8] {
		self.0.as_bytes()
	}

	#[allow(clippy::cast_possible_truncation)]
	#[inline]
	#[must_use]
	pub fn len(&self) -> u8 {
		// Length is guaranteed to be u8
		self.0.len() as u8
	}

	#[inline]
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl std::str::FromStr for DomainName {
	type Err = ReadError;

	fn from_str(v: &str) -> Result<Self, ReadError> {
		if v.is_empty() {
			return Err(ReadError::InvalidDomain(EMPTY_STRING.into()));
		}
		if v.len() > 255 {
			return Err(ReadError::InvalidDomain("too long".into()));
		}
		if v.contains('\0') {
			return Err(ReadError::InvalidDomain("contains NUL byte".into()));
		}
		Ok(Self(SmolStr::new(v)))
	}
}

impl AsRef<str> for DomainName {
	#[inline]
	fn as_ref(&self) -> &str {
		self.0.as_ref()
	}
}

impl Display for DomainName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		Display::fmt(&self.0, f)
	}
}

// -------------------------------------------------------
//                          Tests
// -------------------------------------------------------
