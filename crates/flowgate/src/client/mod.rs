pub mod redis;

use std::net::ToSocketAddrs;

use ::http::Uri;
use ::http::uri::Scheme;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::proxy::ProxyError;
use crate::types::config::TransportConfig;
use crate::types::features::SsrfConfig;
use crate::*;

/// A resolvable upstream target: a socket address or a hostname plus port.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum Target {
	Address(SocketAddr),
	Hostname(Strng, u16),
}

impl Target {
	pub fn parse_url(url: &str) -> anyhow::Result<(Target, bool)> {
		let uri: Uri = url.parse()?;
		let tls = uri.scheme() == Some(&Scheme::HTTPS);
		let port = uri
			.port_u16()
			.unwrap_or(if tls { 443 } else { 80 });
		let host = uri.host().context("backend url must have a host")?;
		let target = match host.parse::<IpAddr>() {
			Ok(ip) => Target::Address(SocketAddr::from((ip, port))),
			Err(_) => Target::Hostname(host.into(), port),
		};
		Ok((target, tls))
	}

	pub fn port(&self) -> u16 {
		match self {
			Target::Address(a) => a.port(),
			Target::Hostname(_, p) => *p,
		}
	}
}

impl std::fmt::Display for Target {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Target::Address(a) => write!(f, "{a}"),
			Target::Hostname(h, p) => write!(f, "{h}:{p}"),
		}
	}
}

/// Shared upstream HTTP client over a hyper connection pool. One client serves every backend;
/// per-upstream transport settings come from the pool configuration.
#[derive(Clone)]
pub struct Client {
	client: hyper_util::client::legacy::Client<
		hyper_rustls::HttpsConnector<HttpConnector>,
		crate::http::Body,
	>,
	ssrf: Option<SsrfConfig>,
}

impl Debug for Client {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Client").finish()
	}
}

impl Client {
	pub fn new(transport: &TransportConfig, ssrf: Option<SsrfConfig>) -> Client {
		let mut http = HttpConnector::new();
		http.enforce_http(false);
		http.set_connect_timeout(Some(transport.dial_timeout));
		http.set_nodelay(true);
		let https = hyper_rustls::HttpsConnectorBuilder::new()
			.with_native_roots()
			.expect("native roots must load")
			.https_or_http()
			.enable_http1()
			.enable_http2()
			.wrap_connector(http);
		let client = hyper_util::client::legacy::Client::builder(TokioExecutor::new())
			.pool_idle_timeout(transport.idle_conn_timeout)
			.pool_max_idle_per_host(transport.max_idle_conns_per_host)
			.timer(hyper_util::rt::tokio::TokioTimer::new())
			.build(https);
		Client {
			client,
			ssrf,
		}
	}

	#[cfg(any(test, feature = "testing"))]
	pub fn for_tests() -> Client {
		Client::new(&TransportConfig::default(), None)
	}

	/// Sends the request to the authority already present in its URI.
	pub async fn simple_call(
		&self,
		req: crate::http::Request,
	) -> Result<crate::http::Response, ProxyError> {
		let host = req
			.uri()
			.host()
			.ok_or(ProxyError::InvalidRequest)?
			.to_string();
		self.guard_ssrf(&host).await?;
		self.dispatch(req).await
	}

	/// Sends the request to an explicit target, rewriting the URI authority.
	pub async fn call(
		&self,
		mut req: crate::http::Request,
		target: &Target,
		tls: bool,
	) -> Result<crate::http::Response, ProxyError> {
		let authority = target.to_string();
		crate::http::modify_req_uri(&mut req, |parts| {
			parts.scheme = Some(if tls { Scheme::HTTPS } else { Scheme::HTTP });
			parts.authority = Some(authority.parse()?);
			if parts.path_and_query.is_none() {
				parts.path_and_query = Some("/".parse().expect("static path"));
			}
			Ok(())
		})
		.map_err(ProxyError::Processing)?;
		if let Target::Hostname(host, _) = target {
			self.guard_ssrf(host).await?;
		}
		self.dispatch(req).await
	}

	async fn dispatch(
		&self,
		req: crate::http::Request,
	) -> Result<crate::http::Response, ProxyError> {
		let start = Instant::now();
		let method = req.method().clone();
		let uri = req.uri().clone();
		let resp = self.client.request(req).await;
		let dur = format!("{}ms", start.elapsed().as_millis());
		tracing::event!(
			target: "upstream request",
			parent: None,
			tracing::Level::DEBUG,

			http.method = %method,
			http.uri = %uri,
			http.status = resp.as_ref().ok().map(|s| s.status().as_u16()),

			duration = dur,
		);
		match resp {
			Ok(resp) => Ok(resp.map(crate::http::Body::new)),
			Err(err) if err.is_connect() => Err(ProxyError::UpstreamCallFailed(err.to_string())),
			Err(err) => Err(ProxyError::UpstreamCallFailed(err.to_string())),
		}
	}

	/// SSRF protection: resolve the hostname and reject private/loopback/link-local results
	/// unless explicitly allowed.
	async fn guard_ssrf(&self, host: &str) -> Result<(), ProxyError> {
		let Some(ssrf) = &self.ssrf else {
			return Ok(());
		};
		if !ssrf.enabled {
			return Ok(());
		}
		let allow = ssrf.allow.clone();
		let host = host.to_string();
		let resolved = tokio::task::spawn_blocking(move || {
			(host.as_str(), 0u16)
				.to_socket_addrs()
				.map(|addrs| addrs.map(|a| a.ip()).collect::<Vec<_>>())
		})
		.await
		.map_err(|e| ProxyError::Processing(e.into()))?
		.map_err(|_| ProxyError::DnsResolution)?;

		for ip in resolved {
			if is_forbidden_ip(ip) && !allow.iter().any(|net| net.contains(&ip)) {
				return Err(ProxyError::Rejected {
					status: http::StatusCode::FORBIDDEN,
					message: "backend resolves to a forbidden address".to_string(),
				});
			}
		}
		Ok(())
	}
}

/// Per-route SSRF guard over an already-selected target. Hostnames are resolved and checked;
/// literal addresses are checked directly.
pub async fn verify_target(ssrf: &SsrfConfig, target: &Target) -> Result<(), ProxyError> {
	if !ssrf.enabled {
		return Ok(());
	}
	let ips: Vec<IpAddr> = match target {
		Target::Address(addr) => vec![addr.ip()],
		Target::Hostname(host, _) => {
			let host = host.to_string();
			tokio::task::spawn_blocking(move || {
				(host.as_str(), 0u16)
					.to_socket_addrs()
					.map(|addrs| addrs.map(|a| a.ip()).collect::<Vec<_>>())
			})
			.await
			.map_err(|e| ProxyError::Processing(e.into()))?
			.map_err(|_| ProxyError::DnsResolution)?
		},
	};
	for ip in ips {
		if is_forbidden_ip(ip) && !ssrf.allow.iter().any(|net| net.contains(&ip)) {
			return Err(ProxyError::Rejected {
				status: http::StatusCode::FORBIDDEN,
				message: "backend resolves to a forbidden address".to_string(),
			});
		}
	}
	Ok(())
}

pub fn is_forbidden_ip(ip: IpAddr) -> bool {
	match ip {
		IpAddr::V4(v4) => {
			v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
		},
		IpAddr::V6(v6) => {
			v6.is_loopback()
				|| v6.is_unspecified()
				|| (v6.segments()[0] & 0xfe00) == 0xfc00
				|| (v6.segments()[0] & 0xffc0) == 0xfe80
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_url_targets() {
		let (t, tls) = Target::parse_url("http://127.0.0.1:9000").unwrap();
		assert_eq!(t, Target::Address("127.0.0.1:9000".parse().unwrap()));
		assert!(!tls);

		let (t, tls) = Target::parse_url("https://api.example.com").unwrap();
		assert_eq!(t, Target::Hostname("api.example.com".into(), 443));
		assert!(tls);

		assert!(Target::parse_url("not a url").is_err());
	}

	#[test]
	fn forbidden_ranges() {
		assert!(is_forbidden_ip("127.0.0.1".parse().unwrap()));
		assert!(is_forbidden_ip("10.1.2.3".parse().unwrap()));
		assert!(is_forbidden_ip("169.254.1.1".parse().unwrap()));
		assert!(is_forbidden_ip("::1".parse().unwrap()));
		assert!(is_forbidden_ip("fe80::1".parse().unwrap()));
		assert!(!is_forbidden_ip("93.184.216.34".parse().unwrap()));
	}
}
