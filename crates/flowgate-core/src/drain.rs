use std::time::Duration;

pub use internal::{
	DrainMode, ReleaseShutdown as DrainBlocker, Signal as DrainTrigger, Watch as DrainWatcher,
};
use tokio::sync::watch;
use tracing::{Instrument, debug, info, warn};

/// Constructs a new pair for draining.
/// * `DrainTrigger` starts a draining sequence and waits for it to complete.
/// * `DrainWatcher` should be held by anything that wants to participate in draining. It can be
///   cloned, and a drain will not complete until all outstanding watchers are dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	internal::channel()
}

/// Wraps a future with graceful shutdown/draining support.
///
/// The future is built from two arguments:
/// * `drain`: while held, the future blocks the server from shutting down. It can also be
///   observed (`wait_for_drain`) to learn when a graceful shutdown started.
/// * `force_shutdown`: when triggered, the graceful deadline has expired and all remaining work
///   must terminate immediately.
pub async fn run_with_drain<F, O>(
	component: String,
	drain: DrainWatcher,
	deadline: Duration,
	make_future: F,
) where
	F: AsyncFnOnce(DrainWatcher, watch::Receiver<()>) -> O,
	O: Send + 'static,
{
	let (sub_drain_signal, sub_drain) = new();
	let (trigger_force_shutdown, force_shutdown) = watch::channel(());
	let trigger_force_shutdown_cpy = trigger_force_shutdown.clone();
	let fut = make_future(sub_drain, force_shutdown).in_current_span();
	let watch = async move {
		let res = drain.wait_for_drain().await;
		if res.mode() == DrainMode::Graceful {
			info!(
				component,
				"drain started, waiting {:?} for connections to complete", deadline
			);
			if tokio::time::timeout(
				deadline,
				sub_drain_signal.start_drain_and_wait(DrainMode::Graceful),
			)
			.await
			.is_err()
			{
				warn!(
					component,
					"drain deadline expired with pending connections, forcefully shutting down"
				);
			}
		} else {
			debug!(component, "terminating");
		}
		let _ = trigger_force_shutdown.send(());
		info!(component, "shutdown complete");
	};
	tokio::select! {
		_ = fut => {
			let _ = trigger_force_shutdown_cpy.send(());
		},
		_ = watch => {}
	}
}

mod internal {
	use tokio::sync::{mpsc, watch};

	pub fn channel() -> (Signal, Watch) {
		let (signal_tx, signal_rx) = watch::channel(None);
		let (drained_tx, drained_rx) = mpsc::channel(1);

		(
			Signal {
				drained_rx,
				signal_tx,
			},
			Watch {
				drained_tx,
				signal_rx,
			},
		)
	}

	enum Never {}

	#[derive(Debug, Clone, Copy, PartialEq)]
	pub enum DrainMode {
		Immediate,
		Graceful,
	}

	/// Send a drain command to all watchers.
	pub struct Signal {
		drained_rx: mpsc::Receiver<Never>,
		signal_tx: watch::Sender<Option<DrainMode>>,
	}

	/// Watch for a drain command. All `Watch` instances must be dropped for a
	/// `start_drain_and_wait` call to complete.
	#[derive(Clone)]
	pub struct Watch {
		drained_tx: mpsc::Sender<Never>,
		signal_rx: watch::Receiver<Option<DrainMode>>,
	}

	#[must_use = "ReleaseShutdown should be dropped explicitly to release the runtime"]
	#[derive(Clone)]
	#[allow(dead_code)]
	pub struct ReleaseShutdown(mpsc::Sender<Never>, DrainMode);

	impl ReleaseShutdown {
		pub fn mode(&self) -> DrainMode {
			self.1
		}
	}

	impl Signal {
		/// Asynchronously signals all watchers to begin draining and waits for all handles to be
		/// dropped.
		pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
			let _ = self.signal_tx.send(Some(mode));
			match self.drained_rx.recv().await {
				None => {},
				Some(n) => match n {},
			}
		}
	}

	impl Watch {
		/// Observes a drain signal without consuming the drain hold. Intended for accept loops
		/// that must keep serving until told otherwise.
		pub async fn signaled(&self) -> DrainMode {
			let mut rx = self.signal_rx.clone();
			rx.wait_for(Option::is_some)
				.await
				.map(|mode| mode.expect("checked is_some"))
				.unwrap_or(DrainMode::Immediate)
		}

		/// Returns a `ReleaseShutdown` handle after the drain has been signaled. The handle must
		/// be dropped to unblock graceful shutdown.
		pub async fn wait_for_drain(mut self) -> ReleaseShutdown {
			let mode = self
				.signal_rx
				.wait_for(Option::is_some)
				.await
				.map(|mode| mode.expect("checked is_some"))
				// If the signal was dropped entirely, graceful shutdown is not required.
				.unwrap_or(DrainMode::Immediate);
			ReleaseShutdown(self.drained_tx, mode)
		}
	}

	impl std::fmt::Debug for Signal {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("Signal").finish_non_exhaustive()
		}
	}

	impl std::fmt::Debug for Watch {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("Watch").finish_non_exhaustive()
		}
	}

	impl std::fmt::Debug for ReleaseShutdown {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("ReleaseShutdown").finish_non_exhaustive()
		}
	}
}

#[cfg(test)]
mod test {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::DrainMode::Graceful;
	use crate::drain;

	#[tokio::test]
	async fn drain_waits_for_all_watchers() {
		let (trigger, watcher) = drain::new();
		let done = Arc::new(AtomicUsize::new(0));
		let (release_tx, _) = tokio::sync::broadcast::channel::<()>(1);

		for _ in 0..3 {
			let watcher = watcher.clone();
			let done = done.clone();
			let mut release_rx = release_tx.subscribe();
			tokio::spawn(async move {
				let held = watcher.wait_for_drain().await;
				let _ = release_rx.recv().await;
				done.fetch_add(1, Ordering::SeqCst);
				drop(held);
			});
		}
		drop(watcher);

		let wait = trigger.start_drain_and_wait(Graceful);
		tokio::pin!(wait);
		tokio::select! {
			_ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {},
			_ = &mut wait => panic!("drain completed while watchers are held"),
		}
		release_tx.send(()).unwrap();
		tokio::select! {
			_ = tokio::time::sleep(std::time::Duration::from_millis(200)) => panic!("timeout"),
			_ = &mut wait => {
				assert_eq!(done.load(Ordering::SeqCst), 3);
			}
		}
	}

	#[tokio::test]
	async fn signaled_does_not_release() {
		let (trigger, watcher) = drain::new();
		let observer = watcher.clone();
		let task = tokio::spawn(async move {
			let mode = observer.signaled().await;
			assert_eq!(mode, Graceful);
			// Holding `observer` does not block the drain once dropped here.
			drop(observer);
		});
		drop(watcher);
		trigger.start_drain_and_wait(Graceful).await;
		task.await.unwrap();
	}
}
