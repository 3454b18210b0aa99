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

use super::{CryptoError, Method};
use md5::{digest::Digest, Md5};
use openssl::symm::{Cipher, Crypter, Mode};
use rc4::{consts::U16, Key, KeyInit, Rc4, StreamCipher};

pub use openssl::symm::Mode as CryptMode;

/// A stateful stream-cipher transform.
///
/// The keystream position advances with every [`update`] call, so one
/// crypter must be used for exactly one direction of one connection.
///
/// The AES-CFB family goes through openssl. RC4 is keyed per
/// connection with `MD5(key || iv)` and its XOR stream is symmetric,
/// so the same keystream serves both modes.
///
/// [`update`]: StreamCrypter::update
pub(super) enum StreamCrypter {
	Evp {
		crypter: Crypter,
		block_size: usize,
		tmp_buf: Vec<u8>,
	},
	Rc4(Box<Rc4<U16>>),
}

impl StreamCrypter {
	pub fn new(method: Method, key: &[u8], iv: &[u8], mode: Mode) -> Result<Self, CryptoError> {
		match method {
			Method::Aes128Cfb | Method::Aes192Cfb | Method::Aes256Cfb => {
				let cipher = match method {
					Method::Aes128Cfb => Cipher::aes_128_cfb128(),
					Method::Aes192Cfb => Cipher::aes_192_cfb128(),
					_ => Cipher::aes_256_cfb128(),
				};
				let crypter = Crypter::new(cipher, mode, key, Some(iv))?;
				Ok(Self::Evp {
					crypter,
					block_size: cipher.block_size(),
					tmp_buf: Vec::new(),
				})
			}
			Method::Rc4Md5 => {
				let mut d = Md5::new();
				d.update(key);
				d.update(iv);
				let session_key = d.finalize();
				let rc4 = Rc4::new(Key::<U16>::from_slice(session_key.as_slice()));
				Ok(Self::Rc4(Box::new(rc4)))
			}
		}
	}

	/// Transform `src` into `dst`. Lengths must match.
	pub fn update(&mut self, src: &[u8], dst: &mut [u8]) -> Result<(), CryptoError> {
		if src.len() != dst.len() {
			return Err(CryptoError::LengthMismatch {
				src_len: src.len(),
				dst_len: dst.len(),
			});
		}
		if src.is_empty() {
			return Ok(());
		}
		match self {
			Self::Evp {
				crypter,
				block_size,
				tmp_buf,
			} => {
				// openssl wants block_size bytes of slack in the output
				// buffer even for stream modes.
				tmp_buf.resize(src.len() + *block_size, 0);
				let n = crypter.update(src, tmp_buf)?;
				debug_assert_eq!(n, src.len());
				dst.copy_from_slice(&tmp_buf[..src.len()]);
			}
			Self::Rc4(rc4) => {
				dst.copy_from_slice(src);
				rc4.apply_keystream(dst);
			}
		}
		Ok(())
	}
}
