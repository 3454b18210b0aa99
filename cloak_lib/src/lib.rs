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
Server side of an encrypted TCP relay disguised as plain HTTP traffic.

A client opens a TCP connection that looks like an ordinary HTTP/1.1
GET request. The user identifier travels in the `Cookie` header, extra
random bytes travel as percent-encoded pairs in the request path, and
everything after the blank line is stream-cipher ciphertext carrying a
SOCKS5-style target address followed by the proxied payload.

Connections that fail the handshake receive a fixed HTTP redirect so
the endpoint looks like a misconfigured web server instead of a relay.
*/

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]
#![allow(clippy::default_trait_access)]

mod prelude;
mod utils;

pub mod config;
pub mod crypto;
pub mod obfs;
pub mod protocol;
pub mod server;

pub use config::Config;
pub use server::{Manager, Server};
