// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thin entry point: load `Config`, wire up TLS wraps, the rule table and
//! the outbound dispatcher, then run one accept loop per inbox. Listener
//! bring-up and config-file reading live here, not in the library, per
//! spec.md's Non-goals.

use std::fs::File;
use std::io;
use std::str::FromStr;
use std::sync::Arc;

use log::LevelFilter;
use relaycore::config::{Config, InboundTransport, InboxScheme};
use relaycore::error::CoreError;
use relaycore::outbound::{Outbox, Outdispatcher, Outset};
use relaycore::request::Request;
use relaycore::stream::tcp::AsyncRwStream;
use relaycore::stream::{splice, Stream};

fn main() {
    let path = match std::env::args().nth(1) {
        Some(p) => p,
        None => {
            eprintln!("no config file path provided, using config.json");
            String::from("config.json")
        }
    };

    let cfg = match load_config(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load {path}: {e}");
            std::process::exit(1);
        }
    };

    let level = LevelFilter::from_str(&cfg.log_level).unwrap_or(LevelFilter::Info);
    simple_logger::SimpleLogger::new()
        .with_level(level)
        .init()
        .expect("logger already initialized");

    log::info!("relaycore starting, v{}", env!("CARGO_PKG_VERSION"));

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(run(cfg));
}

fn load_config(path: &str) -> io::Result<Config> {
    let file = File::open(path)?;
    serde_json::from_reader(file).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn run(cfg: Config) {
    let server_tls = cfg
        .tls
        .build_server_wrap()
        .expect("failed to build TLS server config");
    let client_tls = cfg
        .tls
        .build_client_wrap()
        .expect("failed to build TLS client config");

    let rules = cfg
        .rules
        .build()
        .expect("failed to load rules file");

    let mut forward = Outset::new(
        cfg.outboxes
            .into_iter()
            .map(|o| o.build().expect("invalid outbox config"))
            .collect(),
        cfg.rules.connect_attempts,
    );
    forward.clean();

    let dispatcher = Arc::new(Outdispatcher {
        rules,
        block: Outbox::block("BLOCK"),
        direct: Outbox::direct("DIRECT"),
        forward,
        tls_wrap: client_tls,
    });

    let mut listeners = Vec::new();
    for inbox in cfg.inboxes {
        let listener = tokio::net::TcpListener::bind(&inbox.listen)
            .await
            .unwrap_or_else(|e| panic!("failed to bind {}: {e}", inbox.listen));
        log::info!("{} listening on {} ({:?})", inbox.name, inbox.listen, inbox.scheme);
        listeners.push((listener, inbox));
    }

    let mut tasks = Vec::new();
    for (listener, inbox) in listeners {
        let dispatcher = dispatcher.clone();
        let server_tls = server_tls.clone();
        let password = inbox.password.clone();
        tasks.push(tokio::spawn(async move {
            accept_loop(listener, inbox.scheme, inbox.transport, password, server_tls, dispatcher).await;
        }));
    }

    tokio::signal::ctrl_c().await.ok();
    log::info!("shutting down");
    for task in tasks {
        task.abort();
    }
}

async fn accept_loop(
    listener: tokio::net::TcpListener,
    scheme: InboxScheme,
    transport: InboundTransport,
    password: Option<String>,
    server_tls: relaycore::tls::TlsWrap,
    dispatcher: Arc<Outdispatcher>,
) {
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("accept failed: {e}");
                continue;
            }
        };
        tcp.set_nodelay(true).ok();

        let password = password.clone();
        let server_tls = server_tls.clone();
        let dispatcher = dispatcher.clone();

        tokio::spawn(async move {
            if let Err(e) =
                serve_one(tcp, scheme, transport, password, server_tls, dispatcher).await
            {
                log::debug!("{peer}: session ended with {e}");
            }
        });
    }
}

async fn serve_one(
    tcp: tokio::net::TcpStream,
    scheme: InboxScheme,
    transport: InboundTransport,
    password: Option<String>,
    server_tls: relaycore::tls::TlsWrap,
    dispatcher: Arc<Outdispatcher>,
) -> Result<(), CoreError> {
    let mut stream: Box<dyn Stream> = match transport {
        InboundTransport::Tcp | InboundTransport::Ws => Box::new(AsyncRwStream::new(tcp)),
        InboundTransport::Tls | InboundTransport::Wss => {
            server_tls(tcp, String::new()).await?
        }
    };
    if matches!(transport, InboundTransport::Ws | InboundTransport::Wss) {
        stream = relaycore::stream::ws::accept(stream).await?;
    }

    let mut req: Request = match scheme {
        InboxScheme::Http => relaycore::proto::http::accept(stream).await?,
        InboxScheme::Socks5 => relaycore::proto::socks5::accept(stream).await?,
        InboxScheme::Trojan => {
            let password = password.ok_or_else(|| {
                CoreError::Config("trojan inbox requires a password".to_string())
            })?;
            let digest = relaycore::proto::password::digest(&password);
            relaycore::proto::trojan::accept(stream, &digest).await?
        }
        InboxScheme::Auto => relaycore::proto::auto::accept(stream).await?,
    };

    log::debug!("request for {}", req.addr);
    let outbound = dispatcher.connect(&mut req).await?;
    let (inbound, _addr, _rest) = req.into_parts();
    splice(inbound, outbound).await;
    Ok(())
}
