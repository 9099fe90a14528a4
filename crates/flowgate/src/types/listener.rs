use std::path::PathBuf;

use crate::*;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ListenerConfig {
	pub id: Strng,
	/// `host:port`; an empty host binds the wildcard address.
	pub address: String,
	#[serde(default)]
	pub protocol: ListenerProtocol,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tls: Option<TlsServerConfig>,
	#[serde(default)]
	pub http: HttpListenerConfig,
	#[serde(default)]
	pub udp: UdpListenerConfig,
}

impl ListenerConfig {
	pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
		let (host, port) = self
			.address
			.rsplit_once(':')
			.ok_or_else(|| anyhow::anyhow!("listener {}: address must be host:port", self.id))?;
		let port: u16 = port
			.parse()
			.with_context(|| format!("listener {}: invalid port", self.id))?;
		if host.is_empty() {
			return Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port));
		}
		Ok(SocketAddr::new(host.parse()?, port))
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerProtocol {
	#[default]
	Http,
	Tcp,
	Udp,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TlsServerConfig {
	pub cert_file: PathBuf,
	pub key_file: PathBuf,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub alpn: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct HttpListenerConfig {
	pub http2: bool,
	/// Advertises HTTP/3 via Alt-Svc on h1/h2 responses. QUIC serving itself is delegated.
	pub http3: bool,
	pub alt_svc_max_age: u32,
}

impl Default for HttpListenerConfig {
	fn default() -> Self {
		HttpListenerConfig {
			http2: true,
			http3: false,
			alt_svc_max_age: 2_592_000,
		}
	}
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct UdpListenerConfig {
	pub buffer_size: usize,
	#[serde(with = "serde_dur")]
	pub session_timeout: Duration,
}

impl Default for UdpListenerConfig {
	fn default() -> Self {
		UdpListenerConfig {
			buffer_size: 64 * 1024,
			session_timeout: Duration::from_secs(60),
		}
	}
}
