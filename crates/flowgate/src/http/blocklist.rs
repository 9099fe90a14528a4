use std::collections::HashSet;
use std::net::IpAddr;

use arc_swap::ArcSwap;
use ipnet::IpNet;

use crate::client::Client;
use crate::http::Body;
use crate::types::config::{BlockAction, BlocklistConfig, FeedConfig, FeedFormat};
use crate::*;

/// In-process CIDR blocklist: an immutable static set plus an atomically swappable feed set
/// refreshed on its own schedule. Reads copy a pointer; refresh errors retain the previous
/// snapshot.
pub struct Blocklist {
	action: BlockAction,
	static_set: Vec<IpNet>,
	feed_set: ArcSwap<Vec<IpNet>>,
	feeds: Vec<FeedConfig>,
	/// Admin-added entries, optionally expiring.
	dynamic: parking_lot::RwLock<std::collections::HashMap<IpNet, Option<Instant>>>,
	log_hits: std::sync::atomic::AtomicU64,
}

impl Blocklist {
	pub fn new(config: &BlocklistConfig) -> Self {
		Blocklist {
			action: config.action,
			static_set: config.static_cidrs.clone(),
			feed_set: ArcSwap::from_pointee(Vec::new()),
			feeds: config.feeds.clone(),
			dynamic: Default::default(),
			log_hits: Default::default(),
		}
	}

	pub fn add(&self, net: IpNet, ttl: Option<Duration>) {
		self
			.dynamic
			.write()
			.insert(net, ttl.map(|t| Instant::now() + t));
	}

	pub fn remove(&self, net: &IpNet) -> bool {
		self.dynamic.write().remove(net).is_some()
	}

	pub fn action(&self) -> BlockAction {
		self.action
	}

	pub fn contains(&self, ip: IpAddr) -> bool {
		if self.static_set.iter().any(|net| net.contains(&ip)) {
			return true;
		}
		if self.feed_set.load().iter().any(|net| net.contains(&ip)) {
			return true;
		}
		let now = Instant::now();
		self
			.dynamic
			.read()
			.iter()
			.any(|(net, expiry)| expiry.is_none_or(|e| e > now) && net.contains(&ip))
	}

	pub fn gc(&self) {
		let now = Instant::now();
		self
			.dynamic
			.write()
			.retain(|_, expiry| expiry.is_none_or(|e| e > now));
	}

	/// A `log`-action hit passes through with a counter increment.
	pub fn record_log_hit(&self) {
		self
			.log_hits
			.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
	}

	pub fn log_hits(&self) -> u64 {
		self.log_hits.load(std::sync::atomic::Ordering::Relaxed)
	}

	pub fn snapshot(&self) -> BlocklistSnapshot {
		let now = Instant::now();
		BlocklistSnapshot {
			static_cidrs: self.static_set.clone(),
			feed: self.feed_set.load().as_ref().clone(),
			dynamic: self
				.dynamic
				.read()
				.iter()
				.filter(|(_, expiry)| expiry.is_none_or(|e| e > now))
				.map(|(net, expiry)| {
					(
						*net,
						expiry.map(|e| e.duration_since(now).as_secs()),
					)
				})
				.collect(),
			log_hits: self.log_hits(),
		}
	}

	/// Runs the feed refresh loop. Each feed refreshes on its own interval; all feeds merge
	/// into one swapped set.
	pub async fn run_refresher(self: Arc<Self>, client: Client) {
		if self.feeds.is_empty() {
			return;
		}
		let interval = self
			.feeds
			.iter()
			.map(|f| f.refresh_interval)
			.min()
			.expect("feeds is non-empty")
			.max(Duration::from_secs(1));
		loop {
			self.refresh_once(&client).await;
			tokio::time::sleep(interval).await;
		}
	}

	pub async fn refresh_once(&self, client: &Client) {
		let mut merged: HashSet<IpNet> = HashSet::new();
		let mut any_ok = false;
		for feed in &self.feeds {
			match fetch_feed(client, feed).await {
				Ok(nets) => {
					any_ok = true;
					merged.extend(nets);
				},
				Err(err) => {
					warn!(url = %feed.url, %err, "blocklist feed fetch failed, retaining previous snapshot");
				},
			}
		}
		if any_ok {
			let mut nets: Vec<IpNet> = merged.into_iter().collect();
			nets.sort();
			debug!(entries = nets.len(), "blocklist feed set refreshed");
			self.feed_set.store(Arc::new(nets));
		}
	}
}

#[derive(Debug, serde::Serialize)]
pub struct BlocklistSnapshot {
	pub static_cidrs: Vec<IpNet>,
	pub feed: Vec<IpNet>,
	/// net -> remaining ttl seconds (None = permanent)
	pub dynamic: Vec<(IpNet, Option<u64>)>,
	pub log_hits: u64,
}

async fn fetch_feed(client: &Client, feed: &FeedConfig) -> anyhow::Result<Vec<IpNet>> {
	let req = ::http::Request::builder()
		.uri(&feed.url)
		.body(Body::empty())?;
	let resp = client.simple_call(req).await?;
	if !resp.status().is_success() {
		anyhow::bail!("feed returned status {}", resp.status());
	}
	let bytes = axum::body::to_bytes(resp.into_body(), 8 << 20).await?;
	parse_feed(&bytes, feed.format)
}

/// `text` feeds are newline separated with `#` comments; `json` feeds are a string array.
/// Bare addresses parse as /32 (or /128) networks.
pub fn parse_feed(bytes: &[u8], format: FeedFormat) -> anyhow::Result<Vec<IpNet>> {
	let entries: Vec<String> = match format {
		FeedFormat::Text => String::from_utf8_lossy(bytes)
			.lines()
			.map(|l| l.trim())
			.filter(|l| !l.is_empty() && !l.starts_with('#'))
			.map(|l| l.to_string())
			.collect(),
		FeedFormat::Json => serde_json::from_slice(bytes)?,
	};
	let mut nets = Vec::with_capacity(entries.len());
	for entry in entries {
		match parse_net(&entry) {
			Some(net) => nets.push(net),
			None => debug!(entry, "skipping unparseable blocklist entry"),
		}
	}
	Ok(nets)
}

fn parse_net(s: &str) -> Option<IpNet> {
	if let Ok(net) = s.parse::<IpNet>() {
		return Some(net);
	}
	s.parse::<IpAddr>().ok().map(IpNet::from)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn blocklist(statics: &[&str]) -> Blocklist {
		Blocklist::new(&BlocklistConfig {
			static_cidrs: statics.iter().map(|s| s.parse().unwrap()).collect(),
			feeds: vec![],
			action: BlockAction::Block,
		})
	}

	#[test]
	fn static_cidrs_match() {
		let bl = blocklist(&["10.0.0.0/8"]);
		assert!(bl.contains("10.1.2.3".parse().unwrap()));
		assert!(!bl.contains("192.168.0.1".parse().unwrap()));
	}

	#[test]
	fn text_feed_parses_cidrs_and_bare_ips() {
		let feed = b"# bad actors\n1.2.3.0/24\n5.6.7.8\n\n# comment\n";
		let nets = parse_feed(feed, FeedFormat::Text).unwrap();
		assert_eq!(nets.len(), 2);
		let bl = blocklist(&[]);
		bl.feed_set.store(Arc::new(nets));
		assert!(bl.contains("1.2.3.4".parse().unwrap()));
		assert!(bl.contains("5.6.7.8".parse().unwrap()));
		assert!(!bl.contains("9.9.9.9".parse().unwrap()));
	}

	#[test]
	fn json_feed_parses_string_array() {
		let feed = br#"["1.2.3.0/24", "2001:db8::/32"]"#;
		let nets = parse_feed(feed, FeedFormat::Json).unwrap();
		assert_eq!(nets.len(), 2);
	}

	#[test]
	fn unparseable_entries_are_skipped() {
		let feed = b"1.2.3.0/24\nnot-an-ip\n5.6.7.8\n";
		let nets = parse_feed(feed, FeedFormat::Text).unwrap();
		assert_eq!(nets.len(), 2);
	}

	#[test]
	fn feed_swap_is_atomic_and_replaces() {
		let bl = blocklist(&[]);
		bl.feed_set
			.store(Arc::new(vec!["1.0.0.0/8".parse().unwrap()]));
		assert!(bl.contains("1.2.3.4".parse().unwrap()));
		bl.feed_set
			.store(Arc::new(vec!["2.0.0.0/8".parse().unwrap()]));
		assert!(!bl.contains("1.2.3.4".parse().unwrap()));
		assert!(bl.contains("2.2.3.4".parse().unwrap()));
	}
}
