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
Stream-cipher layer.

A [`Cipher`] is an immutable prototype holding the method and the key
derived from a passphrase. One prototype lives in the user table per
identifier; every connection gets its own cheap clone turned into a
[`ConnCipher`] whose encrypt and decrypt keystreams are initialized
independently:

- the decrypt keystream starts once the IV has been recovered from the
  inbound greeting;
- the encrypt keystream starts lazily on the first outbound write, with
  a freshly generated IV that is prepended to that write.

After the handshake the two directions are split with
[`ConnCipher::split`] so each relay task owns exactly one keystream.
*/

mod stream;

use crate::prelude::*;
use bytes::Bytes;
use md5::{digest::Digest, Md5};
use rand::thread_rng;
use stream::{CryptMode, StreamCrypter};

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
	#[error("IV length mismatch (expected {expected}, got {got})")]
	IvLength { expected: usize, got: usize },
	#[error("cipher used before keystream initialization")]
	NotInitialized,
	#[error("source ({src_len} bytes) and destination ({dst_len} bytes) length mismatch")]
	LengthMismatch { src_len: usize, dst_len: usize },
	#[error("crypto backend error ({0})")]
	Backend(#[from] openssl::error::ErrorStack),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Method {
	Aes128Cfb,
	Aes192Cfb,
	Aes256Cfb,
	Rc4Md5,
}

impl Method {
	#[inline]
	#[must_use]
	pub fn new_from_str(s: &str) -> Option<Self> {
		Some(match s {
			"aes-128-cfb" => Method::Aes128Cfb,
			"aes-192-cfb" => Method::Aes192Cfb,
			"aes-256-cfb" => Method::Aes256Cfb,
			"rc4-md5" => Method::Rc4Md5,
			_ => return None,
		})
	}

	#[inline]
	#[must_use]
	pub fn name(self) -> &'static str {
		match self {
			Method::Aes128Cfb => "aes-128-cfb",
			Method::Aes192Cfb => "aes-192-cfb",
			Method::Aes256Cfb => "aes-256-cfb",
			Method::Rc4Md5 => "rc4-md5",
		}
	}

	#[inline]
	#[must_use]
	pub fn key_len(self) -> usize {
		match self {
			Method::Aes128Cfb | Method::Rc4Md5 => 16,
			Method::Aes192Cfb => 24,
			Method::Aes256Cfb => 32,
		}
	}

	#[inline]
	#[must_use]
	pub fn iv_len(self) -> usize {
		16
	}
}

impl Default for Method {
	#[inline]
	fn default() -> Self {
		Method::Aes256Cfb
	}
}

impl std::fmt::Display for Method {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.name())
	}
}

/// Derive a key of `key_len` bytes from `password`.
///
/// This is the OpenSSL `EVP_BytesToKey` construction with MD5 and no
/// salt, kept for compatibility with existing clients.
#[must_use]
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

/// Immutable cipher prototype: a method plus the key derived from the
/// passphrase. Cloning is cheap and shares the key bytes.
#[derive(Clone)]
pub struct Cipher {
	method: Method,
	key: Bytes,
}

impl Cipher {
	#[must_use]
	pub fn new(method: Method, password: &str) -> Self {
		Self {
			method,
			key: password_to_key(method.key_len(), password),
		}
	}

	#[inline]
	#[must_use]
	pub fn method(&self) -> Method {
		self.method
	}

	#[inline]
	#[must_use]
	pub fn iv_len(&self) -> usize {
		self.method.iv_len()
	}

	/// Create a fresh per-connection state. No keystream is set up yet.
	#[must_use]
	pub fn make_conn(&self) -> ConnCipher {
		ConnCipher {
			method: self.method,
			key: self.key.clone(),
			enc: None,
			dec: None,
		}
	}
}

impl std::fmt::Debug for Cipher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		// Key bytes stay out of debug output.
		f.debug_struct("Cipher").field("method", &self.method).finish()
	}
}

/// Per-connection cipher state. Owned by a single connection task.
pub struct ConnCipher {
	method: Method,
	key: Bytes,
	enc: Option<StreamCrypter>,
	dec: Option<StreamCrypter>,
}

impl ConnCipher {
	#[inline]
	#[must_use]
	pub fn iv_len(&self) -> usize {
		self.method.iv_len()
	}

	/// Set up the encrypt keystream with a freshly generated IV and
	/// return the IV so the caller can prepend it to the first write.
	///
	/// A second call is a no-op returning an empty IV.
	///
	/// # Errors
	///
	/// Returns a [`CryptoError`] if the backend rejects the key.
	pub fn init_encrypt(&mut self) -> Result<Vec<u8>, CryptoError> {
		if self.enc.is_some() {
			return Ok(Vec::new());
		}
		let mut iv = vec![0_u8; self.method.iv_len()];
		thread_rng().fill_bytes(&mut iv);
		self.enc = Some(StreamCrypter::new(
			self.method,
			&self.key,
			&iv,
			CryptMode::Encrypt,
		)?);
		Ok(iv)
	}

	/// Set up the decrypt keystream from an IV received from the peer.
	///
	/// A second call is a no-op.
	///
	/// # Errors
	///
	/// Returns [`CryptoError::IvLength`] if `iv` does not match the
	/// method's IV length.
	pub fn init_decrypt(&mut self, iv: &[u8]) -> Result<(), CryptoError> {
		if iv.len() != self.method.iv_len() {
			return Err(CryptoError::IvLength {
				expected: self.method.iv_len(),
				got: iv.len(),
			});
		}
		if self.dec.is_some() {
			return Ok(());
		}
		self.dec = Some(StreamCrypter::new(
			self.method,
			&self.key,
			iv,
			CryptMode::Decrypt,
		)?);
		Ok(())
	}

	/// # Errors
	///
	/// Fails if [`Self::init_encrypt`] has not been called, or if the
	/// buffer lengths differ.
	pub fn encrypt(&mut self, src: &[u8], dst: &mut [u8]) -> Result<(), CryptoError> {
		self.enc
			.as_mut()
			.ok_or(CryptoError::NotInitialized)?
			.update(src, dst)
	}

	/// # Errors
	///
	/// Fails if [`Self::init_decrypt`] has not been called, or if the
	/// buffer lengths differ.
	pub fn decrypt(&mut self, src: &[u8], dst: &mut [u8]) -> Result<(), CryptoError> {
		self.dec
			.as_mut()
			.ok_or(CryptoError::NotInitialized)?
			.update(src, dst)
	}

	/// Split into the two single-direction halves so each relay task
	/// owns its own keystream.
	#[must_use]
	pub fn split(self) -> (SendCipher, RecvCipher) {
		(
			SendCipher {
				method: self.method,
				key: self.key,
				enc: self.enc,
			},
			RecvCipher { dec: self.dec },
		)
	}
}

/// Encrypt-only half. The keystream may still be uninitialized, in
/// which case the first [`init_encrypt`] generates the IV.
///
/// [`init_encrypt`]: SendCipher::init_encrypt
pub struct SendCipher {
	method: Method,
	key: Bytes,
	enc: Option<StreamCrypter>,
}

impl SendCipher {
	/// Same contract as [`ConnCipher::init_encrypt`].
	///
	/// # Errors
	///
	/// Returns a [`CryptoError`] if the backend rejects the key.
	pub fn init_encrypt(&mut self) -> Result<Vec<u8>, CryptoError> {
		if self.enc.is_some() {
			return Ok(Vec::new());
		}
		let mut iv = vec![0_u8; self.method.iv_len()];
		thread_rng().fill_bytes(&mut iv);
		self.enc = Some(StreamCrypter::new(
			self.method,
			&self.key,
			&iv,
			CryptMode::Encrypt,
		)?);
		Ok(iv)
	}

	/// # Errors
	///
	/// Fails if [`Self::init_encrypt`] has not been called, or if the
	/// buffer lengths differ.
	pub fn encrypt(&mut self, src: &[u8], dst: &mut [u8]) -> Result<(), CryptoError> {
		self.enc
			.as_mut()
			.ok_or(CryptoError::NotInitialized)?
			.update(src, dst)
	}
}

/// Decrypt-only half.
pub struct RecvCipher {
	dec: Option<StreamCrypter>,
}

impl RecvCipher {
	/// # Errors
	///
	/// Fails if the decrypt keystream was never initialized, or if the
	/// buffer lengths differ.
	pub fn decrypt(&mut self, src: &[u8], dst: &mut [u8]) -> Result<(), CryptoError> {
		self.dec
			.as_mut()
			.ok_or(CryptoError::NotInitialized)?
			.update(src, dst)
	}
}
