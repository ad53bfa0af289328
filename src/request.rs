// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The handoff value between an acceptor and the outbound dispatcher
//! (module M): the accepted stream, the destination it asked for, and any
//! payload bytes that arrived bundled with the request header.

use crate::addr::Addr;
use crate::error::CoreError;
use crate::stream::Stream;

/// An accepted inbound connection, already past its protocol handshake.
pub struct Request {
    pub stream: Box<dyn Stream>,
    pub addr: Addr,
    rest: Vec<u8>,
}

impl Request {
    pub fn new(stream: Box<dyn Stream>, addr: Addr, rest: Vec<u8>) -> Self {
        Request { stream, addr, rest }
    }

    /// The residual bytes captured during the handshake, without blocking.
    pub fn rest(&self) -> &[u8] {
        &self.rest
    }

    /// Guarantee at least one byte of residual payload, blocking on the
    /// stream if the handshake read didn't happen to include any — some
    /// connectors (Vmess) require a non-empty first write.
    pub async fn ensure_rest(&mut self) -> Result<(), CoreError> {
        if self.rest.is_empty() {
            self.rest = self.stream.read_at_least(1).await?;
        }
        Ok(())
    }

    pub fn into_parts(self) -> (Box<dyn Stream>, Addr, Vec<u8>) {
        (self.stream, self.addr, self.rest)
    }
}
