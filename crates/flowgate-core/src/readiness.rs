use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::info;

/// Ready tracks whether the process is ready to serve.
#[derive(Clone, Debug, Default)]
pub struct Ready(Arc<Mutex<HashSet<String>>>);

impl Ready {
	pub fn new() -> Ready {
		Ready(Default::default())
	}

	/// Adds a dependency that must complete before the process is marked "ready".
	pub fn register_task(&self, name: &str) -> BlockReady {
		self.0.lock().unwrap().insert(name.to_string());
		BlockReady {
			parent: self.to_owned(),
			name: name.to_string(),
		}
	}

	pub fn pending(&self) -> HashSet<String> {
		self.0.lock().unwrap().clone()
	}

	pub fn is_ready(&self) -> bool {
		self.0.lock().unwrap().is_empty()
	}
}

/// BlockReady blocks readiness until it is dropped.
pub struct BlockReady {
	parent: Ready,
	name: String,
}

impl BlockReady {
	pub fn subtask(&self, name: &str) -> BlockReady {
		self.parent.register_task(name)
	}
}

impl Drop for BlockReady {
	fn drop(&mut self) {
		let mut pending = self.parent.0.lock().unwrap();
		let removed = pending.remove(&self.name);
		debug_assert!(removed);
		let left = pending.len();
		if left == 0 {
			info!("task '{}' complete, marking server ready", self.name);
		} else {
			info!("task '{}' complete, still awaiting {left} tasks", self.name);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ready_after_all_tasks_drop() {
		let ready = Ready::new();
		assert!(ready.is_ready());
		let a = ready.register_task("a");
		let b = ready.register_task("b");
		assert!(!ready.is_ready());
		drop(a);
		assert!(!ready.is_ready());
		drop(b);
		assert!(ready.is_ready());
	}
}
