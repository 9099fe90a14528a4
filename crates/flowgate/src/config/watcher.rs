use std::path::{Path, PathBuf};

use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, new_debouncer};
use tokio::sync::broadcast;

use crate::config::loader;
use crate::*;

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Watches the config file's directory and republishes successfully loaded configs on a
/// broadcast channel. Receivers subscribe at construction; a failed reload keeps the
/// previously accepted config.
pub struct ConfigWatcher {
	path: PathBuf,
	debounce: Duration,
	tx: broadcast::Sender<Arc<Config>>,
}

impl ConfigWatcher {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self::with_debounce(path, DEFAULT_DEBOUNCE)
	}

	pub fn with_debounce(path: impl Into<PathBuf>, debounce: Duration) -> Self {
		let (tx, _) = broadcast::channel(16);
		ConfigWatcher {
			path: path.into(),
			debounce,
			tx,
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Arc<Config>> {
		self.tx.subscribe()
	}

	/// Runs until the process exits. Watches the parent directory; editors commonly replace the
	/// file, so events for the directory are filtered down to the base filename.
	pub async fn run(self) -> anyhow::Result<()> {
		let dir = self
			.path
			.parent()
			.map(Path::to_path_buf)
			.unwrap_or_else(|| PathBuf::from("."));
		let file_name = self
			.path
			.file_name()
			.map(|n| n.to_os_string())
			.context("config path has no file name")?;

		let (event_tx, mut event_rx) = tokio::sync::mpsc::channel::<()>(16);
		let watched_name = file_name.clone();
		let mut debouncer = new_debouncer(
			self.debounce,
			None,
			move |result: DebounceEventResult| match result {
				Ok(events) => {
					let relevant = events.iter().any(|ev| {
						matches!(ev.kind, EventKind::Create(_) | EventKind::Modify(_))
							&& ev
								.paths
								.iter()
								.any(|p| p.file_name() == Some(watched_name.as_os_str()))
					});
					if relevant {
						let _ = event_tx.blocking_send(());
					}
				},
				Err(errors) => {
					for err in errors {
						warn!(?err, "config watch error");
					}
				},
			},
		)?;
		debouncer.watch(&dir, RecursiveMode::NonRecursive)?;
		info!(path = %self.path.display(), "watching config");

		while event_rx.recv().await.is_some() {
			// Collapse bursts that survived debouncing.
			while event_rx.try_recv().is_ok() {}
			match loader::load_file(&self.path) {
				Ok(config) => {
					info!(path = %self.path.display(), "config reloaded");
					// Callbacks run concurrently on the receiver side; the watcher does not wait.
					let _ = self.tx.send(Arc::new(config));
				},
				Err(err) => {
					warn!(%err, "config reload failed, keeping previous config");
				},
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	#[tokio::test]
	async fn reload_publishes_new_config() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("gateway.yaml");
		std::fs::write(&path, "server:\n  port: 8080\n").unwrap();

		let watcher = ConfigWatcher::with_debounce(&path, Duration::from_millis(50));
		let mut rx = watcher.subscribe();
		tokio::spawn(watcher.run());
		// Give the watcher time to register.
		tokio::time::sleep(Duration::from_millis(200)).await;

		let mut f = std::fs::File::create(&path).unwrap();
		writeln!(f, "server:").unwrap();
		writeln!(f, "  port: 9090").unwrap();
		drop(f);

		let config = tokio::time::timeout(Duration::from_secs(5), rx.recv())
			.await
			.expect("timed out waiting for reload")
			.unwrap();
		assert_eq!(config.server.port, 9090);
	}

	#[tokio::test]
	async fn invalid_reload_is_not_published() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("gateway.yaml");
		std::fs::write(&path, "server:\n  port: 8080\n").unwrap();

		let watcher = ConfigWatcher::with_debounce(&path, Duration::from_millis(50));
		let mut rx = watcher.subscribe();
		tokio::spawn(watcher.run());
		tokio::time::sleep(Duration::from_millis(200)).await;

		// Duplicate route ids fail validation; nothing should be published.
		std::fs::write(
			&path,
			"routes:\n  - {id: a, path: /, echo: true}\n  - {id: a, path: /, echo: true}\n",
		)
		.unwrap();

		let res = tokio::time::timeout(Duration::from_millis(800), rx.recv()).await;
		assert!(res.is_err(), "invalid config must not be published");
	}
}
