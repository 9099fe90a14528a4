use flowgate_core::drain::DrainWatcher;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};

use crate::client::Target;
use crate::types::listener::ListenerConfig;
use crate::types::route::TcpRouteConfig;
use crate::*;

/// Opaque TCP forwarding: match a route for the listener (SNI and/or source CIDR), pick a
/// backend by weight, and splice bytes both ways.
pub async fn run(
	addr: SocketAddr,
	listener_cfg: Arc<ListenerConfig>,
	inputs: Arc<GatewayInputs>,
	drain: DrainWatcher,
) -> anyhow::Result<()> {
	let listener = TcpListener::bind(addr).await?;
	info!(listener = %listener_cfg.id, %addr, "started tcp listener");

	loop {
		let (stream, peer) = tokio::select! {
			accepted = listener.accept() => accepted?,
			_ = drain.signaled() => {
				info!(listener = %listener_cfg.id, "tcp listener draining");
				return Ok(());
			}
		};
		let inputs = inputs.clone();
		let listener_cfg = listener_cfg.clone();
		let held = drain.clone();
		tokio::spawn(async move {
			if let Err(err) = handle(stream, peer, &listener_cfg, inputs).await {
				debug!(%peer, %err, "tcp session ended with error");
			}
			drop(held);
		});
	}
}

async fn handle(
	mut downstream: TcpStream,
	peer: SocketAddr,
	listener_cfg: &ListenerConfig,
	inputs: Arc<GatewayInputs>,
) -> anyhow::Result<()> {
	let snapshot = inputs.stores.snapshot();
	let routes: Vec<TcpRouteConfig> = snapshot
		.config
		.tcp_routes
		.iter()
		.filter(|r| r.listener == listener_cfg.id)
		.cloned()
		.collect();
	anyhow::ensure!(!routes.is_empty(), "no tcp routes for listener");

	// SNI is sniffed (not consumed) only when some route matches on it.
	let needs_sni = routes
		.iter()
		.any(|r| r.matches.as_ref().is_some_and(|m| !m.sni.is_empty()));
	let sni = if needs_sni {
		peek_sni(&downstream).await
	} else {
		None
	};

	let route = routes
		.iter()
		.find(|r| {
			let Some(m) = &r.matches else { return true };
			if !m.cidrs.is_empty() && !m.cidrs.iter().any(|net| net.contains(&peer.ip())) {
				return false;
			}
			if !m.sni.is_empty() {
				let Some(sni) = &sni else { return false };
				return m.sni.iter().any(|want| {
					want == sni
						|| (want.starts_with("*.") && sni.ends_with(want.trim_start_matches('*')))
				});
			}
			true
		})
		.context("no tcp route matched")?;

	let backend = pick_backend(route)?;
	let target_addr = resolve(&backend).await?;
	debug!(%peer, route = %route.id, backend = %backend, "tcp session opened");

	let mut upstream = TcpStream::connect(target_addr).await?;
	let _ = upstream.set_nodelay(true);
	let (down, up) = tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await?;
	debug!(%peer, route = %route.id, down, up, "tcp session closed");
	Ok(())
}

fn pick_backend(route: &TcpRouteConfig) -> anyhow::Result<Target> {
	let total: usize = route.backends.iter().map(|b| b.weight.max(1)).sum();
	anyhow::ensure!(total > 0, "tcp route has no backends");
	let mut roll = rand::rng().random_range(0..total);
	for b in &route.backends {
		let w = b.weight.max(1);
		if roll < w {
			let (target, _) = Target::parse_url(&b.url)?;
			return Ok(target);
		}
		roll -= w;
	}
	unreachable!("roll is bounded by the weight sum")
}

async fn resolve(target: &Target) -> anyhow::Result<SocketAddr> {
	match target {
		Target::Address(addr) => Ok(*addr),
		Target::Hostname(host, port) => {
			let host = host.to_string();
			let port = *port;
			tokio::net::lookup_host((host.as_str(), port))
				.await?
				.next()
				.context("hostname resolved to no addresses")
		},
	}
}

/// Reads the TLS ClientHello SNI without consuming bytes from the stream.
async fn peek_sni(stream: &TcpStream) -> Option<String> {
	let mut buf = [0u8; 2048];
	let n = stream.peek(&mut buf).await.ok()?;
	parse_sni(&buf[..n])
}

/// Minimal ClientHello parser: enough to pull out the server_name extension.
fn parse_sni(data: &[u8]) -> Option<String> {
	// TLS record: type(1) version(2) length(2); handshake: type(1) length(3)
	if data.len() < 9 || data[0] != 0x16 || data[5] != 0x01 {
		return None;
	}
	let mut pos = 9; // past record + handshake headers
	pos += 2 + 32; // client version + random
	let session_len = *data.get(pos)? as usize;
	pos += 1 + session_len;
	let cipher_len = u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]) as usize;
	pos += 2 + cipher_len;
	let compression_len = *data.get(pos)? as usize;
	pos += 1 + compression_len;
	let extensions_len = u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]) as usize;
	pos += 2;
	let end = (pos + extensions_len).min(data.len());
	while pos + 4 <= end {
		let ext_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
		let ext_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
		pos += 4;
		if ext_type == 0x0000 {
			// server_name: list length(2) type(1) name length(2) name
			let name_len = u16::from_be_bytes([*data.get(pos + 3)?, *data.get(pos + 4)?]) as usize;
			let name = data.get(pos + 5..pos + 5 + name_len)?;
			return String::from_utf8(name.to_vec()).ok();
		}
		pos += ext_len;
	}
	None
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	use super::*;

	#[test]
	fn sni_parser_handles_garbage() {
		assert_eq!(parse_sni(b""), None);
		assert_eq!(parse_sni(b"GET / HTTP/1.1\r\n"), None);
		assert_eq!(parse_sni(&[0x16, 0x03, 0x01, 0x00, 0x05, 0x02]), None);
	}

	#[test]
	fn sni_parser_extracts_server_name() {
		// Handcrafted minimal ClientHello carrying SNI "example.com".
		let name = b"example.com";
		let mut hello: Vec<u8> = Vec::new();
		hello.extend([0x16, 0x03, 0x01, 0x00, 0x00]); // record header (len fixed up later)
		hello.extend([0x01, 0x00, 0x00, 0x00]); // handshake header
		hello.extend([0x03, 0x03]); // client version
		hello.extend([0u8; 32]); // random
		hello.push(0); // session id length
		hello.extend([0x00, 0x02, 0x13, 0x01]); // cipher suites
		hello.extend([0x01, 0x00]); // compression
		let sni_ext: Vec<u8> = {
			let mut e = Vec::new();
			e.extend([0x00, 0x00]); // extension type server_name
			let inner_len = (name.len() + 5) as u16;
			e.extend(inner_len.to_be_bytes()); // extension length
			e.extend(((name.len() + 3) as u16).to_be_bytes()); // server name list length
			e.push(0x00); // name type host
			e.extend((name.len() as u16).to_be_bytes());
			e.extend(name);
			e
		};
		hello.extend((sni_ext.len() as u16).to_be_bytes()); // extensions length
		hello.extend(sni_ext);

		assert_eq!(parse_sni(&hello), Some("example.com".to_string()));
	}

	#[tokio::test]
	async fn tcp_bytes_are_forwarded_opaquely() {
		// Backend that echoes one line back.
		let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let backend_addr = backend.local_addr().unwrap();
		tokio::spawn(async move {
			let (mut stream, _) = backend.accept().await.unwrap();
			let mut buf = [0u8; 64];
			let n = stream.read(&mut buf).await.unwrap();
			stream.write_all(&buf[..n]).await.unwrap();
		});

		let config: Config = crate::serdes::yamlviajson::from_str(&format!(
			r#"
listeners:
  - {{id: raw, address: "127.0.0.1:0", protocol: tcp}}
tcp_routes:
  - {{id: fwd, listener: raw, backends: [{{url: "http://{backend_addr}"}}]}}
"#
		))
		.unwrap();
		let stores =
			crate::store::Stores::new(Arc::new(config), crate::client::Client::for_tests(), None)
				.unwrap();
		let mut registry = prometheus_client::registry::Registry::default();
		let inputs = GatewayInputs::new(
			stores,
			&mut registry,
			crate::client::Client::for_tests(),
			Arc::new(
				crate::discovery::MemoryRegistry::new(&Default::default()).unwrap(),
			),
		);

		let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let front_addr = front.local_addr().unwrap();
		let listener_cfg = Arc::new(inputs.stores.snapshot().config.listeners[0].clone());
		let inputs2 = inputs.clone();
		tokio::spawn(async move {
			let (stream, peer) = front.accept().await.unwrap();
			let _ = handle(stream, peer, &listener_cfg, inputs2).await;
		});

		let mut client = TcpStream::connect(front_addr).await.unwrap();
		client.write_all(b"ping\n").await.unwrap();
		let mut buf = [0u8; 5];
		client.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"ping\n");
	}
}
