use std::convert::Infallible;

use flowgate_core::drain::DrainWatcher;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use crate::expr::TlsInfo;
use crate::proxy::httpproxy::HTTPProxy;
use crate::proxy::{tcpproxy, udpproxy};
use crate::telemetry::metrics::{ConnectionLabels, Protocol};
use crate::types::listener::{ListenerConfig, ListenerProtocol, TlsServerConfig};
use crate::*;

/// Binds every configured listener and serves until drained. Listener addresses are fixed for
/// the process lifetime; feature and route changes apply through the config snapshot each
/// request takes at entry.
pub struct Gateway {
	inputs: Arc<GatewayInputs>,
	drain: DrainWatcher,
}

impl Gateway {
	pub fn new(inputs: Arc<GatewayInputs>, drain: DrainWatcher) -> Gateway {
		Gateway { inputs, drain }
	}

	pub async fn run(self) -> anyhow::Result<()> {
		let snapshot = self.inputs.stores.snapshot();
		let mut js = JoinSet::new();

		let mut listeners = snapshot.config.listeners.clone();
		if listeners.is_empty() {
			// No explicit listeners: serve HTTP on the configured server port.
			listeners.push(ListenerConfig {
				id: "default".into(),
				address: format!("{}:{}", snapshot.config.server.host, snapshot.config.server.port),
				protocol: ListenerProtocol::Http,
				tls: None,
				http: Default::default(),
				udp: Default::default(),
			});
		}

		for listener in listeners {
			let listener = Arc::new(listener);
			let addr = listener.socket_addr()?;
			match listener.protocol {
				ListenerProtocol::Http => {
					let tls = listener
						.tls
						.as_ref()
						.map(build_tls_acceptor)
						.transpose()?;
					let proxy = HTTPProxy {
						inputs: self.inputs.clone(),
						listener: listener.clone(),
					};
					let drain = self.drain.clone();
					let inputs = self.inputs.clone();
					js.spawn(async move {
						if let Err(err) = run_http_listener(addr, listener, proxy, tls, inputs, drain).await {
							error!(%err, "http listener failed");
						}
					});
				},
				ListenerProtocol::Tcp => {
					let drain = self.drain.clone();
					let inputs = self.inputs.clone();
					js.spawn(async move {
						if let Err(err) = tcpproxy::run(addr, listener, inputs, drain).await {
							error!(%err, "tcp listener failed");
						}
					});
				},
				ListenerProtocol::Udp => {
					let drain = self.drain.clone();
					let inputs = self.inputs.clone();
					js.spawn(async move {
						if let Err(err) = udpproxy::run(addr, listener, inputs, drain).await {
							error!(%err, "udp listener failed");
						}
					});
				},
			}
		}

		while let Some(res) = js.join_next().await {
			if let Err(err) = res {
				warn!(%err, "listener task ended");
			}
		}
		Ok(())
	}
}

fn build_tls_acceptor(tls: &TlsServerConfig) -> anyhow::Result<TlsAcceptor> {
	let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(
		&tls.cert_file,
	)?))
	.collect::<Result<Vec<_>, _>>()?;
	let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(std::fs::File::open(
		&tls.key_file,
	)?))?
	.context("no private key found")?;
	let mut config = ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(certs, key)?;
	config.alpn_protocols = if tls.alpn.is_empty() {
		vec![b"h2".to_vec(), b"http/1.1".to_vec()]
	} else {
		tls.alpn.iter().map(|p| p.as_bytes().to_vec()).collect()
	};
	Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn run_http_listener(
	addr: SocketAddr,
	listener_cfg: Arc<ListenerConfig>,
	proxy: HTTPProxy,
	tls: Option<TlsAcceptor>,
	inputs: Arc<GatewayInputs>,
	drain: DrainWatcher,
) -> anyhow::Result<()> {
	let listener = TcpListener::bind(addr).await?;
	info!(listener = %listener_cfg.id, %addr, "started http listener");
	let labels = ConnectionLabels {
		listener: listener_cfg.id.to_string(),
		protocol: if tls.is_some() {
			Protocol::https
		} else {
			Protocol::http
		},
	};

	loop {
		let (stream, peer) = tokio::select! {
			accepted = listener.accept() => accepted?,
			_ = drain.signaled() => {
				info!(listener = %listener_cfg.id, "listener draining, no longer accepting");
				return Ok(());
			}
		};
		inputs
			.metrics
			.downstream_connections
			.get_or_create(&labels)
			.inc();
		let active = inputs.metrics.active_connections.get_or_create(&labels).clone();
		active.inc();

		let proxy = proxy.clone();
		let tls = tls.clone();
		let conn_drain = drain.clone();
		tokio::spawn(async move {
			let held = conn_drain.clone();
			serve_connection(stream, peer, proxy, tls).await;
			active.dec();
			drop(held);
		});
	}
}

async fn serve_connection(
	stream: TcpStream,
	peer: SocketAddr,
	proxy: HTTPProxy,
	tls: Option<TlsAcceptor>,
) {
	let _ = stream.set_nodelay(true);
	let builder = auto::Builder::new(TokioExecutor::new());

	match tls {
		Some(acceptor) => {
			let accepted = match acceptor.accept(stream).await {
				Ok(tls_stream) => tls_stream,
				Err(err) => {
					debug!(%peer, %err, "tls handshake failed");
					return;
				},
			};
			let (_, session) = accepted.get_ref();
			let info = TlsInfo {
				sni: session.server_name().map(|s| s.to_string()),
				peer_cn: None,
			};
			let service = service_fn(move |req| {
				let proxy = proxy.clone();
				let info = info.clone();
				async move { Ok::<_, Infallible>(proxy.proxy(peer, Some(info), req).await) }
			});
			if let Err(err) = builder
				.serve_connection_with_upgrades(TokioIo::new(accepted), service)
				.await
			{
				debug!(%peer, %err, "connection ended with error");
			}
		},
		None => {
			let service = service_fn(move |req| {
				let proxy = proxy.clone();
				async move { Ok::<_, Infallible>(proxy.proxy(peer, None, req).await) }
			});
			if let Err(err) = builder
				.serve_connection_with_upgrades(TokioIo::new(stream), service)
				.await
			{
				debug!(%peer, %err, "connection ended with error");
			}
		},
	}
}
