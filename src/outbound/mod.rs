// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Outbound selection, weighting and retry (module K).
//!
//! Grounded on `p3/server/outdispatcher.py`, `p3/server/outset.py` and
//! `p3/utils/weightable.py`/`pingable.py`. Weight and delay are tracked
//! with atomic-style compare-exchange loops rather than plain `f64`
//! fields: the reference implementation's single-threaded event loop made
//! a bare float safe to mutate between `await` points, but this core runs
//! on a multi-threaded Tokio runtime where several connections can retry
//! through, or probe, the same outbox concurrently (see DESIGN.md).

use std::sync::atomic::{AtomicU64, Ordering};

use rand::distributions::{Distribution, WeightedIndex};
use rand::thread_rng;

use crate::addr::Addr;
use crate::error::CoreError;
use crate::request::Request;
use crate::rules::{Rule, RuleTable};
use crate::stream::tcp::AsyncRwStream;
use crate::stream::{ws, Stream};
use crate::tls::TlsWrap;

pub const WEIGHT_INITIAL: f64 = 10.0;
pub const WEIGHT_MINIMAL: f64 = 1.0;
pub const WEIGHT_MAXIMAL: f64 = 100.0;
pub const WEIGHT_INCREASE_STEP: f64 = 1.0;
pub const WEIGHT_DECREASE_STEP: f64 = 1.0;
pub const CONNECT_ATTEMPTS: usize = 3;

/// A weight that several connections may read and update concurrently,
/// clamped to `[WEIGHT_MINIMAL, WEIGHT_MAXIMAL]` (or disabled: `<= 0`).
pub struct Weight(AtomicU64);

impl Weight {
    pub fn new() -> Self {
        Weight(AtomicU64::new(WEIGHT_INITIAL.to_bits()))
    }

    pub fn val(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn update(&self, f: impl Fn(f64) -> f64) {
        loop {
            let cur = self.0.load(Ordering::Relaxed);
            let next = f(f64::from_bits(cur)).to_bits();
            if self
                .0
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn increase(&self) {
        self.update(|w| (w + WEIGHT_INCREASE_STEP).min(WEIGHT_MAXIMAL));
    }

    pub fn decrease(&self) {
        self.update(|w| (w - WEIGHT_DECREASE_STEP).max(WEIGHT_MINIMAL));
    }

    pub fn reset(&self) {
        self.0.store(WEIGHT_INITIAL.to_bits(), Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.0.store((-1.0f64).to_bits(), Ordering::Relaxed);
    }

    pub fn enabled(&self) -> bool {
        self.val() > 0.0
    }
}

impl Default for Weight {
    fn default() -> Self {
        Weight::new()
    }
}

/// Last observed round-trip time, in seconds; `-1.0` means "never probed".
pub struct Delay(AtomicU64);

impl Delay {
    pub fn new() -> Self {
        Delay(AtomicU64::new((-1.0f64).to_bits()))
    }

    pub fn val(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, seconds: f64) {
        self.0.store(seconds.to_bits(), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.set(-1.0);
    }
}

impl Default for Delay {
    fn default() -> Self {
        Delay::new()
    }
}

/// The protocol an outbox's remote speaks. `Tcp`/`Direct` are bare
/// passthrough: the destination is the caller's own request, not a
/// configured remote.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Tcp,
    Direct,
    Http,
    Socks5,
    Trojan,
    Vmess,
    Null,
    Block,
}

/// The transport layer underneath the scheme's own framing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Tls,
    Ws,
    Wss,
}

/// One configured forwarding target.
pub struct Outbox {
    pub name: String,
    pub scheme: Scheme,
    pub transport: Transport,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub uuid: Option<[u8; 16]>,
    pub ws_host: Option<String>,
    pub ws_path: Option<String>,
    pub tls_host: Option<String>,
    pub weight: Weight,
    pub delay: Delay,
}

impl Outbox {
    /// A bare-TCP outbox connecting straight to the caller's requested
    /// destination, injected whenever an `Outset` would otherwise end up
    /// empty (see [`Outset::clean`]).
    pub fn direct(name: &str) -> Self {
        Outbox {
            name: name.to_string(),
            scheme: Scheme::Direct,
            transport: Transport::Tcp,
            host: String::new(),
            port: 0,
            password: None,
            uuid: None,
            ws_host: None,
            ws_path: None,
            tls_host: None,
            weight: Weight::new(),
            delay: Delay::new(),
        }
    }

    pub fn block(name: &str) -> Self {
        Outbox {
            scheme: Scheme::Block,
            ..Outbox::direct(name)
        }
    }

    fn sni(&self) -> String {
        self.tls_host.clone().unwrap_or_else(|| self.host.clone())
    }

    /// Open the raw transport to this outbox's configured remote: bare TCP,
    /// or TCP wrapped in TLS and/or WebSocket per `self.transport`.
    async fn open_transport(&self, tls_wrap: &TlsWrap) -> Result<Box<dyn Stream>, CoreError> {
        let tcp = tokio::net::TcpStream::connect((self.host.as_str(), self.port)).await?;
        tcp.set_nodelay(true).ok();

        let mut stream: Box<dyn Stream> = match self.transport {
            Transport::Tcp | Transport::Ws => Box::new(AsyncRwStream::new(tcp)),
            Transport::Tls | Transport::Wss => tls_wrap(tcp, self.sni()).await?,
        };

        if matches!(self.transport, Transport::Ws | Transport::Wss) {
            let host = self.ws_host.clone().unwrap_or_else(|| self.host.clone());
            let path = self.ws_path.clone().unwrap_or_else(|| "/".to_string());
            stream = ws::connect(stream, &host, &path).await?;
        }
        Ok(stream)
    }

    /// Connect to `dest` through this outbox, sending `rest` as the first
    /// bytes of payload (for schemes whose connector doesn't itself fold
    /// `rest` into the handshake write).
    pub async fn connect(
        &self,
        dest: &Addr,
        rest: &[u8],
        tls_wrap: &TlsWrap,
    ) -> Result<Box<dyn Stream>, CoreError> {
        match self.scheme {
            Scheme::Tcp | Scheme::Direct => {
                let tcp = dest.open_tcp().await?;
                let mut stream: Box<dyn Stream> = Box::new(AsyncRwStream::new(tcp));
                if !rest.is_empty() {
                    stream.write_drain(rest).await?;
                }
                Ok(stream)
            }
            Scheme::Null | Scheme::Block => Err(CoreError::protocol("outbound", "blocked")),
            Scheme::Http => {
                let mut stream = self.open_transport(tls_wrap).await?;
                crate::scoped_close!(stream, crate::proto::http::connect(stream.as_mut(), dest, rest))?;
                Ok(stream)
            }
            Scheme::Socks5 => {
                let mut stream = self.open_transport(tls_wrap).await?;
                crate::scoped_close!(
                    stream,
                    async {
                        crate::proto::socks5::connect(stream.as_mut(), dest).await?;
                        if !rest.is_empty() {
                            stream.write_drain(rest).await?;
                        }
                        Ok::<(), CoreError>(())
                    }
                )?;
                Ok(stream)
            }
            Scheme::Trojan => {
                let mut stream = self.open_transport(tls_wrap).await?;
                let password = self
                    .password
                    .as_deref()
                    .ok_or_else(|| CoreError::Config(format!("outbox {}: missing password", self.name)))?;
                crate::scoped_close!(
                    stream,
                    crate::proto::trojan::connect(stream.as_mut(), password, dest, rest)
                )?;
                Ok(stream)
            }
            Scheme::Vmess => {
                let stream = self.open_transport(tls_wrap).await?;
                let uuid = self
                    .uuid
                    .ok_or_else(|| CoreError::Config(format!("outbox {}: missing uuid", self.name)))?;
                // `vmess::connect` takes the stream by value and owns closing
                // it on its own error paths, unlike the `&mut dyn Stream`
                // connectors above.
                crate::proto::vmess::connect(stream, &uuid, dest, rest).await
            }
        }
    }
}

impl std::fmt::Display for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:>10} | {:>7.2}D | {:>7.2}W | {}",
            self.name,
            self.delay.val(),
            self.weight.val(),
            self.name
        )
    }
}

/// A pool of candidate outboxes the dispatcher retries through on failure.
pub struct Outset {
    pub outboxes: Vec<Outbox>,
    pub connect_attempts: usize,
}

impl Outset {
    pub fn new(outboxes: Vec<Outbox>, connect_attempts: usize) -> Self {
        Outset { outboxes, connect_attempts }
    }

    /// Drop disabled outboxes, then guarantee the pool is non-empty by
    /// auto-injecting a direct outbox (a misconfigured or all-dead pool
    /// must not silently blackhole every forwarded connection).
    pub fn clean(&mut self) {
        self.outboxes.retain(|o| o.weight.enabled());
        if self.outboxes.is_empty() {
            log::warn!("outset: all outboxes disabled, auto-adding direct outbox");
            self.outboxes.push(Outbox::direct("FORWARD"));
        }
        self.connect_attempts = self.connect_attempts.min(self.outboxes.len()).max(1);
    }

    /// Sample `connect_attempts` outboxes with replacement, weighted by
    /// current weight.
    pub fn choices(&self) -> Vec<&Outbox> {
        if self.outboxes.is_empty() {
            return Vec::new();
        }
        let weights: Vec<f64> = self.outboxes.iter().map(|o| o.weight.val().max(0.0)).collect();
        if weights.iter().all(|w| *w == 0.0) {
            return self.outboxes.iter().take(self.connect_attempts).collect();
        }
        let dist = match WeightedIndex::new(&weights) {
            Ok(dist) => dist,
            Err(_) => return self.outboxes.iter().take(self.connect_attempts).collect(),
        };
        let mut rng = thread_rng();
        (0..self.connect_attempts)
            .map(|_| &self.outboxes[dist.sample(&mut rng)])
            .collect()
    }

    /// Probe every outbox with a bare TCP connect, resetting weight on
    /// success and disabling it on failure, per `p3/utils/pingable.py`.
    pub async fn ping(&self) {
        for outbox in &self.outboxes {
            apply_ping(outbox).await;
        }
    }
}

async fn apply_ping(outbox: &Outbox) {
    if matches!(outbox.scheme, Scheme::Null | Scheme::Block) {
        return;
    }
    let target = if outbox.host.is_empty() {
        return;
    } else {
        (outbox.host.as_str(), outbox.port)
    };
    let started = std::time::Instant::now();
    match tokio::net::TcpStream::connect(target).await {
        Ok(_) => {
            outbox.delay.set(started.elapsed().as_secs_f64());
            outbox.weight.reset();
        }
        Err(_) => {
            outbox.delay.reset();
            outbox.weight.disable();
        }
    }
}

/// Maps a destination to the outboxes a connection should try, via the
/// rule table, and retries `Outset::connect_attempts` candidates on
/// failure with weight feedback.
pub struct Outdispatcher {
    pub rules: RuleTable,
    pub block: Outbox,
    pub direct: Outbox,
    pub forward: Outset,
    pub tls_wrap: TlsWrap,
}

impl Outdispatcher {
    pub async fn connect(&self, req: &mut Request) -> Result<Box<dyn Stream>, CoreError> {
        let rule = self.rules.lookup(&req.addr.host());

        match rule {
            Rule::Block => self.block.connect(&req.addr, req.rest(), &self.tls_wrap).await,
            Rule::Direct => self.direct.connect(&req.addr, req.rest(), &self.tls_wrap).await,
            Rule::Forward => {
                let mut last_err = None;
                for outbox in self.forward.choices() {
                    // Vmess's handshake must carry a non-empty first frame;
                    // other connectors are fine forwarding an empty `rest`
                    // and letting the far side speak first.
                    if outbox.scheme == Scheme::Vmess {
                        req.ensure_rest().await?;
                    }
                    match outbox.connect(&req.addr, req.rest(), &self.tls_wrap).await {
                        Ok(stream) => {
                            outbox.weight.increase();
                            return Ok(stream);
                        }
                        Err(e) => {
                            outbox.weight.decrease();
                            log::debug!("connect via {}: {e}", outbox.name);
                            last_err = Some(e);
                        }
                    }
                }
                Err(last_err.unwrap_or_else(|| CoreError::protocol("outbound", "no outboxes configured")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_clamps_to_bounds() {
        let w = Weight::new();
        for _ in 0..200 {
            w.increase();
        }
        assert_eq!(w.val(), WEIGHT_MAXIMAL);
        for _ in 0..200 {
            w.decrease();
        }
        assert_eq!(w.val(), WEIGHT_MINIMAL);
    }

    #[test]
    fn disable_makes_weight_not_enabled() {
        let w = Weight::new();
        w.disable();
        assert!(!w.enabled());
    }

    #[test]
    fn clean_auto_injects_direct_when_pool_empties() {
        let mut outset = Outset::new(vec![Outbox::block("dead")], 3);
        outset.outboxes[0].weight.disable();
        outset.clean();
        assert_eq!(outset.outboxes.len(), 1);
        assert_eq!(outset.outboxes[0].scheme, Scheme::Direct);
    }
}
