use std::collections::HashMap;

use flowgate_core::drain::DrainWatcher;
use rand::Rng;
use tokio::net::UdpSocket;

use crate::client::Target;
use crate::types::listener::ListenerConfig;
use crate::*;

/// Opaque UDP forwarding with per-peer sessions. Each downstream peer gets a bound upstream
/// socket; replies route back over the listener socket. Idle sessions expire after the
/// configured session timeout.
pub async fn run(
	addr: SocketAddr,
	listener_cfg: Arc<ListenerConfig>,
	inputs: Arc<GatewayInputs>,
	drain: DrainWatcher,
) -> anyhow::Result<()> {
	let socket = Arc::new(UdpSocket::bind(addr).await?);
	info!(listener = %listener_cfg.id, %addr, "started udp listener");

	let mut sessions: HashMap<SocketAddr, Session> = HashMap::new();
	let mut buf = vec![0u8; listener_cfg.udp.buffer_size];
	let timeout = listener_cfg.udp.session_timeout;
	let mut sweep = tokio::time::interval(timeout.max(Duration::from_secs(1)));

	loop {
		tokio::select! {
			received = socket.recv_from(&mut buf) => {
				let (n, peer) = received?;
				if !sessions.contains_key(&peer) {
					match open_session(&inputs, &listener_cfg, socket.clone(), peer).await {
						Ok(s) => {
							sessions.insert(peer, s);
						},
						Err(err) => {
							debug!(%peer, %err, "failed to open udp session");
							continue;
						},
					}
				}
				let forward_failed = {
					let session = sessions.get(&peer).expect("session just ensured");
					session.last_seen.store(now_unix(), std::sync::atomic::Ordering::Relaxed);
					session.upstream.send(&buf[..n]).await.is_err()
				};
				if forward_failed {
					debug!(%peer, "udp forward failed");
					if let Some(s) = sessions.remove(&peer) {
						s.reply_task.abort();
					}
				}
			}
			_ = sweep.tick() => {
				let cutoff = now_unix().saturating_sub(timeout.as_secs());
				sessions.retain(|peer, s| {
					let alive = s.last_seen.load(std::sync::atomic::Ordering::Relaxed) >= cutoff;
					if !alive {
						debug!(%peer, "udp session expired");
						s.reply_task.abort();
					}
					alive
				});
			}
			_ = drain.signaled() => {
				info!(listener = %listener_cfg.id, "udp listener draining");
				for (_, s) in sessions.drain() {
					s.reply_task.abort();
				}
				return Ok(());
			}
		}
	}
}

struct Session {
	upstream: Arc<UdpSocket>,
	last_seen: Arc<std::sync::atomic::AtomicU64>,
	reply_task: tokio::task::JoinHandle<()>,
}

async fn open_session(
	inputs: &Arc<GatewayInputs>,
	listener_cfg: &Arc<ListenerConfig>,
	downstream: Arc<UdpSocket>,
	peer: SocketAddr,
) -> anyhow::Result<Session> {
	let snapshot = inputs.stores.snapshot();
	let route = snapshot
		.config
		.udp_routes
		.iter()
		.find(|r| r.listener == listener_cfg.id)
		.context("no udp route for listener")?;

	let total: usize = route.backends.iter().map(|b| b.weight.max(1)).sum();
	anyhow::ensure!(total > 0, "udp route has no backends");
	let mut roll = rand::rng().random_range(0..total);
	let mut chosen = None;
	for b in &route.backends {
		let w = b.weight.max(1);
		if roll < w {
			chosen = Some(b);
			break;
		}
		roll -= w;
	}
	let backend = chosen.expect("roll is bounded by the weight sum");
	let (target, _) = Target::parse_url(&backend.url)?;
	let target_addr = match target {
		Target::Address(a) => a,
		Target::Hostname(host, port) => tokio::net::lookup_host((host.to_string(), port))
			.await?
			.next()
			.context("hostname resolved to no addresses")?,
	};

	let upstream = Arc::new(UdpSocket::bind(("0.0.0.0", 0)).await?);
	upstream.connect(target_addr).await?;
	debug!(%peer, backend = %target_addr, route = %route.id, "udp session opened");

	let last_seen = Arc::new(std::sync::atomic::AtomicU64::new(now_unix()));
	let reply_task = {
		let upstream = upstream.clone();
		let last_seen = last_seen.clone();
		let buffer_size = listener_cfg.udp.buffer_size;
		tokio::spawn(async move {
			let mut buf = vec![0u8; buffer_size];
			loop {
				match upstream.recv(&mut buf).await {
					Ok(n) => {
						last_seen.store(now_unix(), std::sync::atomic::Ordering::Relaxed);
						if downstream.send_to(&buf[..n], peer).await.is_err() {
							break;
						}
					},
					Err(_) => break,
				}
			}
		})
	};

	Ok(Session {
		upstream,
		last_seen,
		reply_task,
	})
}

fn now_unix() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn udp_datagrams_round_trip() {
		// Echo backend.
		let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let backend_addr = backend.local_addr().unwrap();
		tokio::spawn(async move {
			let mut buf = [0u8; 64];
			let (n, from) = backend.recv_from(&mut buf).await.unwrap();
			backend.send_to(&buf[..n], from).await.unwrap();
		});

		let config: Config = crate::serdes::yamlviajson::from_str(&format!(
			r#"
listeners:
  - {{id: dgram, address: "127.0.0.1:0", protocol: udp}}
udp_routes:
  - {{id: fwd, listener: dgram, backends: [{{url: "http://{backend_addr}"}}]}}
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
			Arc::new(crate::discovery::MemoryRegistry::new(&Default::default()).unwrap()),
		);

		let front = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
		let listener_cfg = Arc::new(inputs.stores.snapshot().config.listeners[0].clone());

		// The "client": replies from the backend land here via the front socket.
		let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let peer = client.local_addr().unwrap();

		let session = open_session(&inputs, &listener_cfg, front.clone(), peer)
			.await
			.unwrap();
		session.upstream.send(b"ping").await.unwrap();

		let mut buf = [0u8; 16];
		let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
			.await
			.unwrap()
			.unwrap();
		assert_eq!(&buf[..n], b"ping");
		session.reply_task.abort();
	}
}
