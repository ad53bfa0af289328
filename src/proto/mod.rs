// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Protocol acceptors and connectors: one module per wire format, each
//! exposing `accept(stream) -> Request` and/or `connect(stream, ...)` over
//! the shared [`crate::stream::Stream`]/[`crate::addr::Addr`] layer.

pub mod auto;
pub mod http;
pub mod password;
pub mod socks5;
pub mod trojan;
pub mod vmess;
