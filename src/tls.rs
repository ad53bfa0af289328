// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TLS configuration and the injectable `wrap(tcp, server_name) -> Stream`
//! function the core layers on top of a raw TCP stream (module C).
//!
//! The core itself never builds a `rustls` context from scratch — per
//! spec it "accepts a TLS wrapping function ... and uses it as a layer".
//! This module is the one place that constructs those functions, grounded
//! on the teacher's `TlsConfig`/`CertResolver` (previously duplicated
//! between `src/tls.rs` and `src/server/mod.rs`; consolidated here).

use std::collections::HashMap;
use std::fs::File;
use std::future::Future;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use tokio_rustls::rustls::server::{
    ClientHello, NoServerSessionStorage, ResolvesServerCert, ResolvesServerCertUsingSni,
    ServerSessionMemoryCache,
};
use tokio_rustls::rustls::sign::{any_supported_type, CertifiedKey};
use tokio_rustls::rustls::{Certificate, PrivateKey, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::stream::tcp::AsyncRwStream;
use crate::stream::Stream;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// `wrap(tcp_stream, server_name) -> Stream`, injected into an inbox or
/// outbox that needs a TLS layer.
pub type TlsWrap = Arc<
    dyn Fn(tokio::net::TcpStream, String) -> BoxFuture<'static, io::Result<Box<dyn Stream>>>
        + Send
        + Sync,
>;

#[derive(serde::Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub servers: HashMap<String, CertEntry>,
    #[serde(default)]
    pub prefer_server_cipher: bool,
    #[serde(default)]
    pub max_early_data: u32,
    #[serde(default)]
    pub session_cache_size: usize,
    #[serde(default)]
    pub alpn: Vec<String>,
    #[serde(default)]
    pub max_fragment_size: Option<usize>,
    /// Skip certificate verification on outbound TLS connections made by
    /// connectors (trojan/vmess over `tls`/`wss`). Off by default: unlike
    /// the reference implementation's outbound TLS context (which always
    /// disabled verification), this is an explicit opt-in so an operator
    /// who does mean to talk to a self-signed upstream has to say so.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(serde::Deserialize, Clone)]
pub struct CertEntry {
    pub cert_chain: PathBuf,
    pub priv_key: PathBuf,
}

impl CertEntry {
    fn build(self) -> io::Result<CertifiedKey> {
        let cert_file = File::open(self.cert_chain)?;
        let cert: Vec<Certificate> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .map(|x| x.into_iter().map(Certificate).collect())?;

        let key_file = File::open(self.priv_key)?;
        let key = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(key_file))
            .map(|mut keys| keys.pop().map(|key| any_supported_type(&PrivateKey(key))))?
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty private key"))?
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Ok(CertifiedKey {
            cert,
            key,
            ocsp: None,
            sct_list: None,
        })
    }
}

struct CertResolver {
    inner: ResolvesServerCertUsingSni,
    default: Option<Arc<CertifiedKey>>,
}

impl CertResolver {
    fn new(map: HashMap<String, CertEntry>) -> io::Result<CertResolver> {
        let mut inner = ResolvesServerCertUsingSni::new();
        let mut default = None;

        for (name, entry) in map {
            let certified_key = entry.build()?;
            if name == "default" {
                default = Some(Arc::new(certified_key));
            } else {
                inner
                    .add(&name, certified_key)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
        }

        Ok(CertResolver { inner, default })
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        if let Some(ck) = self.inner.resolve(client_hello) {
            return Some(ck);
        }
        self.default.as_ref().cloned()
    }
}

impl TlsConfig {
    fn server_config(&self) -> io::Result<Arc<ServerConfig>> {
        let cert_resolver = Arc::new(CertResolver::new(self.servers.clone())?);

        let mut ctx = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_cert_resolver(cert_resolver);

        ctx.max_early_data_size = self.max_early_data;
        ctx.max_fragment_size = self.max_fragment_size;
        ctx.ignore_client_order = self.prefer_server_cipher;
        ctx.alpn_protocols = self.alpn.iter().map(|s| s.clone().into_bytes()).collect();
        ctx.session_storage = if self.session_cache_size > 0 {
            ServerSessionMemoryCache::new(self.session_cache_size)
        } else {
            Arc::new(NoServerSessionStorage {})
        };

        Ok(Arc::new(ctx))
    }

    /// Build the `wrap(tcp, server_name) -> Stream` function used by
    /// inbound TLS-wrapped acceptors (trojan, https, socks5s, wss).
    pub fn build_server_wrap(&self) -> io::Result<TlsWrap> {
        let acceptor = TlsAcceptor::from(self.server_config()?);
        Ok(Arc::new(move |tcp, _server_name| {
            let acceptor = acceptor.clone();
            Box::pin(async move {
                let tls = acceptor.accept(tcp).await?;
                Ok(Box::new(AsyncRwStream::new(tls)) as Box<dyn Stream>)
            })
        }))
    }

    /// Build the `wrap(tcp, server_name) -> Stream` function used by
    /// outbound connectors that need to speak TLS to the next hop
    /// (trojan, vmess over `tls`/`wss`).
    pub fn build_client_wrap(&self) -> io::Result<TlsWrap> {
        let mut root_certs = RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs()? {
            root_certs
                .add(&Certificate(cert.0))
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        }

        let builder = tokio_rustls::rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_certs);

        let mut ctx = builder.with_no_client_auth();
        ctx.alpn_protocols = self.alpn.iter().map(|s| s.clone().into_bytes()).collect();
        ctx.max_fragment_size = self.max_fragment_size;
        ctx.enable_early_data = self.max_early_data > 0;

        if self.insecure_skip_verify {
            ctx.dangerous()
                .set_certificate_verifier(Arc::new(NoVerifier));
        }

        let connector = TlsConnector::from(Arc::new(ctx));
        Ok(Arc::new(move |tcp, server_name| {
            let connector = connector.clone();
            Box::pin(async move {
                let name = tokio_rustls::rustls::ServerName::try_from(server_name.as_str())
                    .map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidInput, "invalid server name")
                    })?;
                let tls = connector.connect(name, tcp).await?;
                Ok(Box::new(AsyncRwStream::new(tls)) as Box<dyn Stream>)
            })
        }))
    }
}

/// Accepts any certificate. Only reachable via the explicit
/// `insecure_skip_verify` config flag — see its doc comment.
struct NoVerifier;

impl tokio_rustls::rustls::client::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &tokio_rustls::rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<tokio_rustls::rustls::client::ServerCertVerified, tokio_rustls::rustls::Error>
    {
        Ok(tokio_rustls::rustls::client::ServerCertVerified::assertion())
    }
}
