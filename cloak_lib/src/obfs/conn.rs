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

use super::{FAKE_RESPONSE, OBFS_RESPONSE};
use crate::{
	crypto::{ConnCipher, CryptoError, RecvCipher, SendCipher},
	prelude::*,
	utils::{
		pool::{LeakyBuf, PoolBuf},
		poll_write_all,
	},
};
use futures::ready;
use std::{
	io,
	task::{Context, Poll},
};
use tokio::{
	io::ReadBuf,
	net::{
		tcp::{OwnedReadHalf, OwnedWriteHalf},
		TcpStream,
	},
};

/// A client connection before it starts streaming.
///
/// Freshly accepted sockets wait for the greeting. Once the handshake
/// installed a cipher and recovered the IV, [`into_split`] turns the
/// connection into one decrypting read half and one encrypting write
/// half. Rejected connections go through [`fake_response`] instead.
///
/// [`into_split`]: ObfsConn::into_split
/// [`fake_response`]: ObfsConn::fake_response
pub struct ObfsConn {
	stream: TcpStream,
	cipher: Option<ConnCipher>,
	greeting_received: bool,
	response_sent: bool,
}

impl ObfsConn {
	#[must_use]
	pub fn new(stream: TcpStream) -> Self {
		Self {
			stream,
			cipher: None,
			greeting_received: false,
			response_sent: false,
		}
	}

	/// # Errors
	///
	/// Returns the same error as [`TcpStream::peer_addr`].
	pub fn peer_addr(&self) -> io::Result<SocketAddr> {
		self.stream.peer_addr()
	}

	/// Read the first packet raw, without decryption, so the caller can
	/// inspect the HTTP-shaped greeting.
	///
	/// # Errors
	///
	/// Returns the underlying IO error.
	pub async fn read_greeting(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		let n = self.stream.read(buf).await?;
		self.greeting_received = true;
		Ok(n)
	}

	/// Install the per-connection cipher state picked for the greeting's
	/// identifier.
	pub fn set_cipher(&mut self, cipher: ConnCipher) {
		self.cipher = Some(cipher);
	}

	/// # Errors
	///
	/// Fails if no cipher has been installed or the IV length is wrong.
	pub fn init_decrypt(&mut self, iv: &[u8]) -> Result<(), CryptoError> {
		self.cipher
			.as_mut()
			.ok_or(CryptoError::NotInitialized)?
			.init_decrypt(iv)
	}

	/// # Errors
	///
	/// Fails if the decrypt keystream is not set up or lengths differ.
	pub fn decrypt(&mut self, src: &[u8], dst: &mut [u8]) -> Result<(), CryptoError> {
		self.cipher
			.as_mut()
			.ok_or(CryptoError::NotInitialized)?
			.decrypt(src, dst)
	}

	/// Answer like a misrouted web server and hang up.
	///
	/// # Errors
	///
	/// Returns the underlying IO error.
	pub async fn fake_response(mut self) -> io::Result<()> {
		self.stream.write_all(FAKE_RESPONSE).await?;
		self.stream.shutdown().await
	}

	/// Split into the streaming halves.
	///
	/// # Errors
	///
	/// Fails with [`CryptoError::NotInitialized`] if no cipher has been
	/// installed.
	pub fn into_split(
		self,
		pool: &LeakyBuf,
	) -> Result<(ObfsReadHalf<OwnedReadHalf>, ObfsWriteHalf<OwnedWriteHalf>), CryptoError> {
		debug_assert!(self.greeting_received);
		let cipher = self.cipher.ok_or(CryptoError::NotInitialized)?;
		let (send, recv) = cipher.split();
		let (r, w) = self.stream.into_split();
		Ok((
			ObfsReadHalf {
				r,
				cipher: recv,
				buf: pool.get(),
			},
			ObfsWriteHalf {
				w,
				cipher: send,
				response_sent: self.response_sent,
				buf: Vec::new(),
				state: WriteState::Encoding,
			},
		))
	}
}

/// Decrypting read half.
///
/// Ciphertext lands in a pooled scratch buffer and is decrypted into
/// the caller's buffer, at most one pool buffer worth per poll.
pub struct ObfsReadHalf<R: AsyncRead + Unpin> {
	r: R,
	cipher: RecvCipher,
	buf: PoolBuf,
}

impl<R: AsyncRead + Unpin> ObfsReadHalf<R> {
	#[cfg(test)]
	fn new(r: R, cipher: RecvCipher, pool: &LeakyBuf) -> Self {
		Self {
			r,
			cipher,
			buf: pool.get(),
		}
	}
}

impl<R: AsyncRead + Unpin> AsyncRead for ObfsReadHalf<R> {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		dst: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let me = self.get_mut();
		let want = std::cmp::min(dst.remaining(), me.buf.len());
		if want == 0 {
			return Poll::Ready(Ok(()));
		}
		let n = {
			let mut read_buf = ReadBuf::new(&mut me.buf[..want]);
			ready!(Pin::new(&mut me.r).poll_read(cx, &mut read_buf))?;
			read_buf.filled().len()
		};
		if n == 0 {
			// EOF
			return Poll::Ready(Ok(()));
		}
		let unfilled = dst.initialize_unfilled_to(n);
		me.cipher
			.decrypt(&me.buf[..n], &mut unfilled[..n])
			.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
		dst.advance(n);
		Poll::Ready(Ok(()))
	}
}

#[derive(Debug, PartialEq, Eq)]
enum WriteState {
	/// Encoding bytes from source into buffer.
	Encoding,
	/// Consuming buffer and writing its bytes.
	///
	/// Contains a usize as the current start position of
	/// the buffer's remaining.
	Writing(usize),
	Closed,
}

/// Encrypting write half.
///
/// The first write builds `[response header || IV || ciphertext]` and
/// sends it as one piece; later writes carry ciphertext only.
pub struct ObfsWriteHalf<W: AsyncWrite + Unpin> {
	w: W,
	cipher: SendCipher,
	response_sent: bool,
	buf: Vec<u8>,
	state: WriteState,
}

impl<W: AsyncWrite + Unpin> ObfsWriteHalf<W> {
	#[cfg(test)]
	fn new(w: W, cipher: SendCipher) -> Self {
		Self {
			w,
			cipher,
			response_sent: false,
			buf: Vec::new(),
			state: WriteState::Encoding,
		}
	}
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ObfsWriteHalf<W> {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		src: &[u8],
	) -> Poll<Result<usize, io::Error>> {
		// `src` is encoded into `self.buf` then written into `self.w`.
		let me = self.get_mut();
		loop {
			match &mut me.state {
				WriteState::Encoding => {
					me.buf.clear();
					if !me.response_sent {
						me.buf.extend_from_slice(OBFS_RESPONSE);
						me.response_sent = true;
					}
					let iv = me
						.cipher
						.init_encrypt()
						.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
					// Empty unless this is the first write.
					me.buf.extend_from_slice(&iv);
					let pos = me.buf.len();
					me.buf.resize(pos + src.len(), 0);
					me.cipher
						.encrypt(src, &mut me.buf[pos..])
						.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
					// Next goes to Writing.
					me.state = WriteState::Writing(0);
				}
				WriteState::Writing(pos) => {
					ready!(poll_write_all(Pin::new(&mut me.w), cx, pos, &me.buf))?;
					// Clear up buffer so the next encode pass does not
					// accidentally append to it.
					me.buf.clear();
					me.state = WriteState::Encoding;
					return Poll::Ready(Ok(src.len()));
				}
				WriteState::Closed => {
					return Err(io::Error::new(
						io::ErrorKind::BrokenPipe,
						"write half already closed",
					))
					.into()
				}
			}
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
		let me = self.get_mut();
		Pin::new(&mut me.w).poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
		let me = self.get_mut();
		me.state = WriteState::Closed;
		Pin::new(&mut me.w).poll_shutdown(cx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::crypto::{Cipher, Method};

	fn make_send_cipher(cipher: &Cipher) -> SendCipher {
		let (send, _) = cipher.make_conn().split();
		send
	}

	#[test]
	fn test_write_half_first_write_prepends_header_and_iv() {
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async move {
			let cipher = Cipher::new(Method::Aes256Cfb, "pw");
			let (client, server) = tokio::io::duplex(64 * 1024);
			let mut w = ObfsWriteHalf::new(server, make_send_cipher(&cipher));

			w.write_all(b"HELLO").await.unwrap();
			w.write_all(b" AGAIN").await.unwrap();
			w.shutdown().await.unwrap();

			let mut data = Vec::new();
			let mut client = client;
			client.read_to_end(&mut data).await.unwrap();

			// Fixed response header comes first, exactly once.
			assert!(data.starts_with(OBFS_RESPONSE));
			let rest = &data[OBFS_RESPONSE.len()..];
			let iv_len = cipher.iv_len();
			assert_eq!(rest.len(), iv_len + b"HELLO AGAIN".len());

			// Decrypting with the prepended IV yields both writes.
			let mut dec = cipher.make_conn();
			dec.init_decrypt(&rest[..iv_len]).unwrap();
			let mut plain = vec![0_u8; rest.len() - iv_len];
			dec.decrypt(&rest[iv_len..], &mut plain).unwrap();
			assert_eq!(&plain, b"HELLO AGAIN");
		});
	}

	#[test]
	fn test_read_half_decrypts() {
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async move {
			let cipher = Cipher::new(Method::Aes128Cfb, "pw");
			let pool = LeakyBuf::default_pool();

			// Remote encrypts with a known IV...
			let mut remote = cipher.make_conn();
			let iv = remote.init_encrypt().unwrap();
			let plain = b"stream of proxied bytes";
			let mut ct = vec![0_u8; plain.len()];
			remote.encrypt(plain, &mut ct).unwrap();

			let (mut client, server) = tokio::io::duplex(4096);
			// ...and the local read half decrypts transparently.
			let mut conn = cipher.make_conn();
			conn.init_decrypt(&iv).unwrap();
			let (_, recv) = conn.split();
			let mut r = ObfsReadHalf::new(server, recv, &pool);

			client.write_all(&ct).await.unwrap();
			client.shutdown().await.unwrap();

			let mut out = Vec::new();
			r.read_to_end(&mut out).await.unwrap();
			assert_eq!(&out, plain);
		});
	}
}
