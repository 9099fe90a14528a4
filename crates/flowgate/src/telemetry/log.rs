use rand::Rng;
use tracing::event;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use crate::types::config::{LogFormat, LoggingConfig};
use crate::*;

/// Installs the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init(config: &LoggingConfig) {
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(config.level.clone()));
	match config.format {
		LogFormat::Text => {
			tracing_subscriber::registry()
				.with(filter)
				.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
				.init();
		},
		LogFormat::Json => {
			tracing_subscriber::registry()
				.with(filter)
				.with(
					tracing_subscriber::fmt::layer()
						.json()
						.flatten_event(true)
						.with_writer(std::io::stderr),
				)
				.init();
		},
	}
}

/// One access-log record. Filled in as the request progresses and emitted exactly once when
/// dropped, after the response body has completed.
#[derive(Debug)]
pub struct RequestLog {
	pub start: Instant,
	pub peer_addr: SocketAddr,
	pub listener: Option<Strng>,
	pub route: Option<Strng>,
	pub client_ip: Option<IpAddr>,
	pub client_id: Option<Strng>,
	pub host: Option<String>,
	pub method: Option<::http::Method>,
	pub path: Option<String>,
	pub version: Option<::http::Version>,
	pub status: Option<u16>,
	pub upstream_status: Option<u16>,
	pub backend: Option<String>,
	pub traffic_group: Option<Strng>,
	pub retry_attempt: u32,
	pub bytes_sent: u64,
	pub cache_hit: bool,
	pub coalesced: bool,
	pub error: Option<String>,
	pub request_id: Option<String>,

	enabled: bool,
	audit: bool,
	emitted: bool,
}

impl RequestLog {
	pub fn new(config: &LoggingConfig, peer_addr: SocketAddr) -> RequestLog {
		let audit = config.audit_sample_rate > 0.0
			&& rand::rng().random_bool(config.audit_sample_rate.clamp(0.0, 1.0));
		RequestLog {
			start: Instant::now(),
			peer_addr,
			listener: None,
			route: None,
			client_ip: None,
			client_id: None,
			host: None,
			method: None,
			path: None,
			version: None,
			status: None,
			upstream_status: None,
			backend: None,
			traffic_group: None,
			retry_attempt: 0,
			bytes_sent: 0,
			cache_hit: false,
			coalesced: false,
			error: None,
			request_id: None,
			enabled: config.access_log,
			audit,
			emitted: false,
		}
	}

	fn emit(&mut self) {
		if self.emitted {
			return;
		}
		self.emitted = true;
		if !self.enabled {
			return;
		}
		let duration = format!("{}ms", self.start.elapsed().as_millis());
		event!(
			target: "access",
			parent: None,
			tracing::Level::INFO,

			peer = %self.peer_addr,
			client.ip = self.client_ip.as_ref().map(tracing::field::display),
			client.id = self.client_id.as_deref(),

			listener = self.listener.as_deref(),
			route = self.route.as_deref(),

			http.host = self.host.as_deref(),
			http.method = self.method.as_ref().map(tracing::field::display),
			http.path = self.path.as_deref(),
			http.version = self.version.as_ref().map(tracing::field::debug),
			http.status = self.status,

			upstream.status = self.upstream_status,
			upstream.backend = self.backend.as_deref(),

			group = self.traffic_group.as_deref(),
			retries = self.retry_attempt,
			bytes = self.bytes_sent,
			cache = self.cache_hit,
			coalesced = self.coalesced,
			request_id = self.request_id.as_deref(),

			error = self.error.as_deref(),
			duration = duration,
		);
		if self.audit {
			event!(
				target: "audit",
				parent: None,
				tracing::Level::INFO,

				peer = %self.peer_addr,
				client.id = self.client_id.as_deref(),
				http.method = self.method.as_ref().map(tracing::field::display),
				http.path = self.path.as_deref(),
				http.status = self.status,
				request_id = self.request_id.as_deref(),
			);
		}
	}
}

impl Drop for RequestLog {
	fn drop(&mut self) {
		self.emit();
	}
}

/// Carries the log to the end of the response body so byte counts and stream completion are
/// recorded before emitting.
pub struct LogBody<B> {
	body: B,
	log: Option<RequestLog>,
}

impl<B> LogBody<B> {
	pub fn new(body: B, log: RequestLog) -> LogBody<B> {
		LogBody {
			body,
			log: Some(log),
		}
	}
}

impl<B> http_body::Body for LogBody<B>
where
	B: http_body::Body + Unpin,
	Self: Unpin,
{
	type Data = B::Data;
	type Error = B::Error;

	fn poll_frame(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		let this = self.as_mut().get_mut();
		let result = ready!(Pin::new(&mut this.body).poll_frame(cx));
		match result {
			Some(Ok(frame)) => {
				if let (Some(data), Some(log)) = (frame.data_ref(), this.log.as_mut()) {
					log.bytes_sent += bytes_len(data);
				}
				Poll::Ready(Some(Ok(frame)))
			},
			other => {
				// End of stream (or error): emit by dropping.
				this.log.take();
				Poll::Ready(other)
			},
		}
	}

	fn is_end_stream(&self) -> bool {
		self.body.is_end_stream()
	}

	fn size_hint(&self) -> http_body::SizeHint {
		self.body.size_hint()
	}
}

fn bytes_len<D: bytes::Buf>(data: &D) -> u64 {
	data.remaining() as u64
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn log_emits_once() {
		let config = LoggingConfig::default();
		let mut log = RequestLog::new(&config, "1.2.3.4:5".parse().unwrap());
		log.status = Some(200);
		log.emit();
		log.emit();
		drop(log);
	}
}
