// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error taxonomy for the relay core.
//!
//! Kinds, not type names: a wire-format violation ([`CoreError::Protocol`],
//! which also covers cryptographic auth failures — they are
//! indistinguishable from framing errors to a caller), a clean short read
//! ([`CoreError::IncompleteRead`]), a length or accumulated-read cap
//! exceeded ([`CoreError::BufferOverflow`]), an OS/TLS bubble-up
//! ([`CoreError::Io`]), and a construction-time configuration problem
//! ([`CoreError::Config`]).

use std::fmt::{self, Display, Formatter};
use std::io;

/// Maximum bytes a single `read_until`/`read_at_least` call may accumulate.
pub const STREAM_BUFSIZE: usize = 4 * 1024 * 1024;

#[derive(Debug)]
pub enum CoreError {
    /// A wire-format violation, tagged with the layer that detected it.
    Protocol { layer: &'static str, detail: &'static str },
    /// The peer closed the connection before a requested amount of data
    /// arrived.
    IncompleteRead,
    /// A length field or accumulated read exceeded [`STREAM_BUFSIZE`].
    BufferOverflow,
    /// Bubbled up from the OS or the TLS stack.
    Io(io::Error),
    /// Invalid URL/scheme/material discovered at construction time. Never
    /// raised mid-session.
    Config(String),
}

impl CoreError {
    #[inline]
    pub fn protocol(layer: &'static str, detail: &'static str) -> Self {
        CoreError::Protocol { layer, detail }
    }
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Protocol { layer, detail } => {
                write!(f, "protocol error in {layer}: {detail}")
            }
            CoreError::IncompleteRead => f.write_str("incomplete read: peer closed mid-frame"),
            CoreError::BufferOverflow => f.write_str("buffer overflow: length cap exceeded"),
            CoreError::Io(e) => write!(f, "io error: {e}"),
            CoreError::Config(msg) => write!(f, "config error: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CoreError {
    fn from(e: io::Error) -> Self {
        CoreError::Io(e)
    }
}

impl From<CoreError> for io::Error {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Io(e) => e,
            CoreError::IncompleteRead => {
                io::Error::new(io::ErrorKind::UnexpectedEof, "incomplete read")
            }
            CoreError::BufferOverflow => {
                io::Error::new(io::ErrorKind::InvalidData, "buffer overflow")
            }
            CoreError::Protocol { layer, detail } => io::Error::new(
                io::ErrorKind::InvalidData,
                format!("protocol error in {layer}: {detail}"),
            ),
            CoreError::Config(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
