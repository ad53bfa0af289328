// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-disk configuration shape (ambient stack, spec.md §6).
//!
//! Grounded on the teacher's `TlsConfig` (`src/tls.rs`):
//! `#[derive(serde::Deserialize)]` structs with `#[serde(default)]` fields
//! throughout, so a near-empty config file is still valid. Reading the file
//! and parsing a CLI into one of these is out of scope per spec.md's
//! Non-goals — the core's entry point takes an already-built [`Config`].

use std::path::PathBuf;

use crate::outbound::{Outbox, Scheme, Transport};
use crate::rules::Rule;
use crate::tls::TlsConfig;

fn default_log_level() -> String {
    "info".to_string()
}

fn default_connect_attempts() -> usize {
    crate::outbound::CONNECT_ATTEMPTS
}

fn default_fallback_rule() -> Rule {
    Rule::Direct
}

#[derive(serde::Deserialize)]
pub struct Config {
    pub inboxes: Vec<InboxConfig>,
    #[serde(default)]
    pub outboxes: Vec<OutboxConfig>,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// One listening port and the protocol it speaks.
#[derive(serde::Deserialize)]
pub struct InboxConfig {
    pub name: String,
    pub listen: String,
    pub scheme: InboxScheme,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub transport: InboundTransport,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboxScheme {
    Http,
    Socks5,
    Trojan,
    Auto,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundTransport {
    #[default]
    Tcp,
    Tls,
    Ws,
    Wss,
}

/// One forwarding target, as read from disk; converted to an
/// [`Outbox`](crate::outbound::Outbox) by [`OutboxConfig::build`].
#[derive(serde::Deserialize)]
pub struct OutboxConfig {
    pub name: String,
    pub scheme: Scheme,
    #[serde(default)]
    pub transport: OutboxTransportConfig,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub ws_host: Option<String>,
    #[serde(default)]
    pub ws_path: Option<String>,
    #[serde(default)]
    pub tls_host: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxTransportConfig {
    #[default]
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl From<OutboxTransportConfig> for Transport {
    fn from(t: OutboxTransportConfig) -> Self {
        match t {
            OutboxTransportConfig::Tcp => Transport::Tcp,
            OutboxTransportConfig::Tls => Transport::Tls,
            OutboxTransportConfig::Ws => Transport::Ws,
            OutboxTransportConfig::Wss => Transport::Wss,
        }
    }
}

impl OutboxConfig {
    pub fn build(self) -> Result<Outbox, crate::error::CoreError> {
        let uuid = self
            .uuid
            .as_deref()
            .map(crate::proto::vmess::parse_uuid)
            .transpose()?;
        Ok(Outbox {
            name: self.name,
            scheme: self.scheme,
            transport: self.transport.into(),
            host: self.host,
            port: self.port,
            password: self.password,
            uuid,
            ws_host: self.ws_host,
            ws_path: self.ws_path,
            tls_host: self.tls_host,
            weight: crate::outbound::Weight::new(),
            delay: crate::outbound::Delay::new(),
        })
    }
}

/// Rule table source and fallback, per spec.md §6/§4.J. The rules-file
/// format itself is a Non-goal — this crate loads the plain `verb domain`
/// text format `src/rules.rs` already parses, not the original's richer
/// GeoIP/GFWList formats.
#[derive(serde::Deserialize)]
pub struct RulesConfig {
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default = "default_fallback_rule")]
    pub fallback: Rule,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: usize,
}

impl Default for RulesConfig {
    fn default() -> Self {
        RulesConfig {
            file: None,
            fallback: default_fallback_rule(),
            connect_attempts: default_connect_attempts(),
        }
    }
}

impl RulesConfig {
    pub fn build(&self) -> std::io::Result<crate::rules::RuleTable> {
        match &self.file {
            Some(path) => crate::rules::RuleTable::load(path, self.fallback),
            None => Ok(crate::rules::RuleTable::empty(self.fallback)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let json = r#"{
            "inboxes": [{"name": "in", "listen": "127.0.0.1:1080", "scheme": "socks5"}]
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.rules.connect_attempts, crate::outbound::CONNECT_ATTEMPTS);
        assert!(cfg.outboxes.is_empty());
    }

    #[test]
    fn outbox_config_builds_into_outbox() {
        let json = r#"{
            "name": "relay", "scheme": "trojan", "transport": "tls",
            "host": "relay.example", "port": 443, "password": "hunter2"
        }"#;
        let oc: OutboxConfig = serde_json::from_str(json).unwrap();
        let ob = oc.build().unwrap();
        assert_eq!(ob.name, "relay");
        assert_eq!(ob.scheme, Scheme::Trojan);
    }
}
