use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::http::BufferedResponse;
use crate::proxy::ProxyError;
use crate::types::features::CoalesceConfig;
use crate::*;

type Slot = watch::Receiver<Option<Result<BufferedResponse, CoalesceError>>>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CoalesceError {
	#[error("coalesced leader failed: {0}")]
	LeaderFailed(String),
	#[error("coalesced leader dropped")]
	LeaderDropped,
}

/// Request coalescing (singleflight): while a request for a key is in flight, later requests
/// with the same key wait on the same result instead of dialing upstream. The leader
/// completes-before all waiters observe the response.
pub struct Coalescer {
	config: CoalesceConfig,
	inflight: Mutex<HashMap<String, Slot>>,
}

pub enum Outcome {
	/// This request dialed upstream.
	Leader(Result<BufferedResponse, ProxyError>),
	/// This request replayed the leader's response.
	Waiter(BufferedResponse),
}

impl Coalescer {
	pub fn new(config: CoalesceConfig) -> Self {
		Coalescer {
			config,
			inflight: Mutex::new(HashMap::new()),
		}
	}

	pub fn method_eligible(&self, method: &http::Method) -> bool {
		self
			.config
			.methods
			.iter()
			.any(|m| m.eq_ignore_ascii_case(method.as_str()))
	}

	pub async fn run<F>(&self, key: String, fut: F) -> Result<Outcome, ProxyError>
	where
		F: Future<Output = Result<BufferedResponse, ProxyError>>,
	{
		let existing = self.inflight.lock().get(&key).cloned();
		if let Some(mut rx) = existing {
			let wait = async move {
				loop {
					if let Some(result) = rx.borrow_and_update().clone() {
						return result;
					}
					if rx.changed().await.is_err() {
						return Err(CoalesceError::LeaderDropped);
					}
				}
			};
			return match tokio::time::timeout(self.config.timeout, wait).await {
				Ok(Ok(resp)) => Ok(Outcome::Waiter(resp)),
				Ok(Err(err)) => Err(ProxyError::CoalesceFailed(err.to_string())),
				Err(_) => Err(ProxyError::CoalesceTimeout),
			};
		}

		let (tx, rx) = watch::channel(None);
		self.inflight.lock().insert(key.clone(), rx);
		let result = fut.await;
		let shared = match &result {
			Ok(resp) => Ok(resp.clone()),
			Err(err) => Err(CoalesceError::LeaderFailed(err.to_string())),
		};
		// Publish before unregistering so late subscribers cannot miss the value.
		let _ = tx.send(Some(shared));
		self.inflight.lock().remove(&key);
		Ok(Outcome::Leader(result))
	}

	pub fn inflight_len(&self) -> usize {
		self.inflight.lock().len()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;
	use crate::http::{HeaderMap, StatusCode};

	fn coalescer() -> Arc<Coalescer> {
		Arc::new(Coalescer::new(CoalesceConfig::default()))
	}

	fn resp(body: &'static str) -> BufferedResponse {
		BufferedResponse {
			status: StatusCode::OK,
			headers: HeaderMap::new(),
			body: Bytes::from_static(body.as_bytes()),
		}
	}

	#[tokio::test]
	async fn concurrent_requests_share_one_call() {
		let c = coalescer();
		let calls = Arc::new(AtomicUsize::new(0));

		let mut tasks = Vec::new();
		for _ in 0..8 {
			let c = c.clone();
			let calls = calls.clone();
			tasks.push(tokio::spawn(async move {
				c.run("key".to_string(), async {
					calls.fetch_add(1, Ordering::SeqCst);
					tokio::time::sleep(Duration::from_millis(50)).await;
					Ok(resp("shared"))
				})
				.await
			}));
		}
		let mut leaders = 0;
		let mut waiters = 0;
		for t in tasks {
			match t.await.unwrap().unwrap() {
				Outcome::Leader(Ok(r)) => {
					leaders += 1;
					assert_eq!(&r.body[..], b"shared");
				},
				Outcome::Waiter(r) => {
					waiters += 1;
					assert_eq!(&r.body[..], b"shared");
				},
				Outcome::Leader(Err(e)) => panic!("leader failed: {e}"),
			}
		}
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert_eq!(leaders, 1);
		assert_eq!(waiters, 7);
	}

	#[tokio::test]
	async fn distinct_keys_do_not_coalesce() {
		let c = coalescer();
		let calls = Arc::new(AtomicUsize::new(0));
		let mut tasks = Vec::new();
		for i in 0..3 {
			let c = c.clone();
			let calls = calls.clone();
			tasks.push(tokio::spawn(async move {
				c.run(format!("key{i}"), async {
					calls.fetch_add(1, Ordering::SeqCst);
					tokio::time::sleep(Duration::from_millis(20)).await;
					Ok(resp("x"))
				})
				.await
			}));
		}
		for t in tasks {
			t.await.unwrap().unwrap();
		}
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn leader_failure_propagates_to_waiters() {
		let c = coalescer();
		let c2 = c.clone();
		let leader = tokio::spawn(async move {
			c2.run("key".to_string(), async {
				tokio::time::sleep(Duration::from_millis(50)).await;
				Err(ProxyError::UpstreamTimeout)
			})
			.await
		});
		tokio::time::sleep(Duration::from_millis(10)).await;
		let waiter = c
			.run("key".to_string(), async { Ok(resp("never")) })
			.await;
		assert!(matches!(waiter, Err(ProxyError::CoalesceFailed(_))));
		let leader = leader.await.unwrap().unwrap();
		assert!(matches!(leader, Outcome::Leader(Err(_))));
	}

	#[tokio::test]
	async fn inflight_map_is_cleaned_up() {
		let c = coalescer();
		c.run("key".to_string(), async { Ok(resp("x")) })
			.await
			.unwrap();
		assert_eq!(c.inflight_len(), 0);
	}
}
