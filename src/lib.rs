// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A multi-protocol TCP-forwarding proxy core: HTTP CONNECT, SOCKS5 and
//! Trojan-over-TLS inbound acceptors, HTTP/SOCKS5/Trojan/Vmess outbound
//! connectors, all layered over a shared [`stream::Stream`] abstraction,
//! dispatched through a domain [`rules::RuleTable`] and a weighted
//! [`outbound::Outset`].
//!
//! Listener bring-up, config-file parsing and the CLI are external
//! collaborators (see `bin/relaycore.rs`) — this crate's entry points take
//! an already-open duplex channel and an already-built [`config::Config`].

pub mod addr;
pub mod config;
pub mod error;
pub mod outbound;
pub mod proto;
pub mod request;
pub mod rules;
pub mod stream;
pub mod tls;
