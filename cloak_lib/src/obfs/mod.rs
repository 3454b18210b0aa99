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
HTTP-shaped traffic obfuscation.

The first client packet looks like a plain HTTP/1.1 request:

```not_rust
GET /%ab%cd%ef HTTP/1.1\r\n
Host: www.example.com\r\n
Cookie: cid=<identifier>; other=pairs\r\n
\r\n
<IV bytes><ciphertext>
```

Two pieces of information hide in the header block:

- the user identifier, carried as the `cid` value of the `Cookie` line;
- the random head, carried as `%`-separated hex pairs in the request
  path. Those bytes belong in front of the encrypted body, so clients
  may move a prefix of the IV (or all of it) into the URL.

Everything after the first blank line is ciphertext. The body may
itself contain `\r\n\r\n`, only the first occurrence terminates the
header block.
*/

mod conn;
pub use conn::{ObfsConn, ObfsReadHalf, ObfsWriteHalf};

use crate::{prelude::*, utils::find_pat};

/// Header line carrying the identifier.
const HIDDEN_IN: &str = "Cookie";
/// Cookie key whose value is the identifier.
const PASS_KEY: &str = "cid";

/// Response header sent in front of the first encrypted reply, so the
/// exchange looks like a completed HTTP request.
pub const OBFS_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\
Connection: keep-alive\r\n\
Content-Encoding: gzip\r\n\
Content-Type: text/html\r\n\
Server: nginx\r\n\
Vary: Accept-Encoding\r\n\
\r\n";

/// Decoy sent to connections that fail the handshake. Nothing about it
/// hints that the rejection is cryptographically motivated.
pub const FAKE_RESPONSE: &[u8] = b"HTTP/1.1 302 Found\r\n\
Location: http://cn.bing.com/\r\n\
Server: Microsoft-IIS/10.0\r\n\
Content-Length: 0\r\n\
\r\n\
<html><body>Redirecting...</body></html>";

#[derive(Debug, thiserror::Error)]
pub enum GreetingError {
	#[error("greeting has no header terminator")]
	NoHeaderEnd,
	#[error("greeting header is not text ({0})")]
	NotText(std::str::Utf8Error),
	#[error("greeting header has {0} lines while at least 2 expected")]
	TooFewLines(usize),
	#[error("cookie line splits into {0} fields while 2 expected")]
	BadCookieLine(usize),
	#[error("cookie item '{0}' is not a key=value pair")]
	BadCookieItem(String),
	#[error("no identifier in greeting")]
	NoIdentifier,
	#[error("invalid random head ({0})")]
	RandomHead(hex::FromHexError),
}

/// What the obfuscation layer recovered from the first packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
	pub identifier: Tag,
	pub random_head: Vec<u8>,
	/// Byte length of the header block. The encrypted body starts at
	/// `header_len + 4`.
	pub header_len: usize,
}

/// Parse the first inbound packet.
///
/// # Errors
///
/// Returns a [`GreetingError`] if `buf` is not shaped like a greeting
/// or carries no identifier. The caller should answer with
/// [`FAKE_RESPONSE`] in that case.
pub fn parse_greeting(buf: &[u8]) -> Result<Greeting, GreetingError> {
	let header_len = find_pat(buf, CRLF_2).ok_or(GreetingError::NoHeaderEnd)?;
	let header = std::str::from_utf8(&buf[..header_len]).map_err(GreetingError::NotText)?;

	let lines: Vec<&str> = header.split("\r\n").collect();
	if lines.len() < 2 {
		return Err(GreetingError::TooFewLines(lines.len()));
	}

	let random_head = parse_random_head(lines[0])?;

	let mut pass = "";
	for line in &lines {
		let line = line.trim();
		// find line like "Cookie: cid=892idj"
		if !line.starts_with(HIDDEN_IN) {
			continue;
		}
		let fields: Vec<&str> = line.split(':').collect();
		if fields.len() != 2 {
			return Err(GreetingError::BadCookieLine(fields.len()));
		}
		for item in fields[1].split(';') {
			let item = item.trim();
			let kv: Vec<&str> = item.split('=').collect();
			if kv.len() != 2 {
				return Err(GreetingError::BadCookieItem(item.into()));
			}
			if kv[0].trim() == PASS_KEY {
				pass = kv[1].trim();
			}
		}
	}
	if pass.is_empty() {
		return Err(GreetingError::NoIdentifier);
	}

	Ok(Greeting {
		identifier: Tag::new(pass),
		random_head,
		header_len,
	})
}

/// Recover the random head hidden in the request line.
///
/// The path is split on `%` and the leading `GET /` field is thrown
/// away. Every following field contributes one hex pair: a two
/// character field as is, a shorter one left-padded with `0` (and
/// nothing after it), a longer one truncated to its first two
/// characters (and nothing after it).
fn parse_random_head(request_line: &str) -> Result<Vec<u8>, GreetingError> {
	let mut byte_str: Vec<u8> = Vec::new();
	for chars in request_line.split('%').skip(1) {
		let chars = chars.as_bytes();
		if chars.len() < 2 {
			byte_str.push(b'0');
			byte_str.extend_from_slice(chars);
			break;
		} else if chars.len() > 2 {
			byte_str.extend_from_slice(&chars[..2]);
			break;
		}
		byte_str.extend_from_slice(chars);
	}
	hex::decode(&byte_str).map_err(GreetingError::RandomHead)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn build_greeting(id: &str, random_head: &[u8], body: &[u8]) -> Vec<u8> {
		let mut path = String::from("/");
		for b in random_head {
			path.push_str(&format!("%{:02x}", b));
		}
		let mut buf = format!(
			"GET {} HTTP/1.1\r\nHost: www.example.com\r\nCookie: cid={}; path=/\r\n\r\n",
			path, id
		)
		.into_bytes();
		buf.extend_from_slice(body);
		buf
	}

	#[test]
	fn test_parse_round_trip() {
		let body = b"\x01\x02\x03\r\n\r\n\x04";
		let buf = build_greeting("u1", &[0xab, 0xcd, 0xef], body);
		let g = parse_greeting(&buf).unwrap();
		assert_eq!(g.identifier, "u1");
		assert_eq!(g.random_head, vec![0xab, 0xcd, 0xef]);
		// Body sits right after the first CRLFCRLF, even though the
		// body itself contains one.
		assert_eq!(&buf[g.header_len + 4..], body);
	}

	#[test]
	fn test_parse_no_random_head() {
		let buf = build_greeting("892idj", &[], b"body");
		let g = parse_greeting(&buf).unwrap();
		assert_eq!(g.identifier, "892idj");
		assert!(g.random_head.is_empty());
	}

	#[test]
	fn test_random_head_short_field_padded() {
		let buf = b"GET /%ab%c HTTP/1.1\r\nCookie: cid=x\r\n\r\n";
		let g = parse_greeting(buf).unwrap();
		assert_eq!(g.random_head, vec![0xab, 0x0c]);
	}

	#[test]
	fn test_random_head_long_field_truncated() {
		let buf = b"GET /%abcd%ef HTTP/1.1\r\nCookie: cid=x\r\n\r\n";
		let g = parse_greeting(buf).unwrap();
		// "abcd" gives "ab" and stops the scan, "ef" is never reached.
		assert_eq!(g.random_head, vec![0xab]);
	}

	#[test]
	fn test_random_head_bad_hex() {
		let buf = b"GET /%zz HTTP/1.1\r\nCookie: cid=x\r\n\r\n";
		assert!(matches!(
			parse_greeting(buf).unwrap_err(),
			GreetingError::RandomHead(_)
		));
	}

	#[test]
	fn test_missing_header_end() {
		assert!(matches!(
			parse_greeting(b"not http").unwrap_err(),
			GreetingError::NoHeaderEnd
		));
		assert!(matches!(
			parse_greeting(b"GET / HTTP/1.1\r\nCookie: cid=x\r\n").unwrap_err(),
			GreetingError::NoHeaderEnd
		));
	}

	#[test]
	fn test_no_identifier() {
		let buf = b"GET / HTTP/1.1\r\nHost: www.example.com\r\n\r\nbody";
		assert!(matches!(
			parse_greeting(buf).unwrap_err(),
			GreetingError::NoIdentifier
		));
		// Empty cid value counts as missing.
		let buf = b"GET / HTTP/1.1\r\nCookie: cid=\r\n\r\nbody";
		assert!(matches!(
			parse_greeting(buf).unwrap_err(),
			GreetingError::NoIdentifier
		));
	}

	#[test]
	fn test_single_line_header_rejected() {
		let buf = b"GET / HTTP/1.1\r\n\r\nbody";
		assert!(matches!(
			parse_greeting(buf).unwrap_err(),
			GreetingError::TooFewLines(1)
		));
	}

	#[test]
	fn test_malformed_cookie() {
		let buf = b"GET / HTTP/1.1\r\nCookie: cid=x: y\r\n\r\nbody";
		assert!(matches!(
			parse_greeting(buf).unwrap_err(),
			GreetingError::BadCookieLine(3)
		));
		let buf = b"GET / HTTP/1.1\r\nCookie: cid\r\n\r\nbody";
		assert!(matches!(
			parse_greeting(buf).unwrap_err(),
			GreetingError::BadCookieItem(_)
		));
	}

	#[test]
	fn test_later_cid_wins() {
		let buf =
			b"GET / HTTP/1.1\r\nCookie: cid=first\r\nCookie: cid=second\r\n\r\nbody";
		let g = parse_greeting(buf).unwrap();
		assert_eq!(g.identifier, "second");
	}

	#[test]
	fn test_response_constants_shape() {
		assert!(OBFS_RESPONSE.starts_with(b"HTTP/1.1 200 OK\r\n"));
		assert!(OBFS_RESPONSE.ends_with(b"\r\n\r\n"));
		assert!(FAKE_RESPONSE.starts_with(b"HTTP/1.1 302 Found\r\n"));
	}
}
