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

use crate::{crypto::CryptoError, obfs::GreetingError, protocol::ReadError};
use std::io;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
	#[error("handshake error ({0})")]
	Handshake(#[from] GreetingError),
	#[error("unknown identifier")]
	UnknownIdentifier,
	#[error("greeting not received within {0} secs")]
	GreetingTimeout(usize),
	#[error("crypto error ({0})")]
	Crypto(#[from] CryptoError),
	#[error("address error ({0})")]
	Address(#[from] ReadError),
	#[error("IO error ({0})")]
	Io(#[from] io::Error),
}
