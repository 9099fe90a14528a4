use std::collections::HashMap;

use arc_swap::ArcSwap;

use crate::*;

/// A keyed registry with copy-on-write map semantics. Lookups are lock-free pointer loads;
/// reloads reconcile against the new key set, keeping entries whose key survives so runtime
/// state (counters, windows, breaker states) carries across config reloads.
pub struct Registry<T> {
	entries: ArcSwap<HashMap<Strng, Arc<T>>>,
}

impl<T> Default for Registry<T> {
	fn default() -> Self {
		Registry {
			entries: ArcSwap::from_pointee(HashMap::new()),
		}
	}
}

impl<T> Registry<T> {
	pub fn get(&self, key: &str) -> Option<Arc<T>> {
		self.entries.load().get(key).cloned()
	}

	pub fn len(&self) -> usize {
		self.entries.load().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.load().is_empty()
	}

	pub fn keys(&self) -> Vec<Strng> {
		self.entries.load().keys().cloned().collect()
	}

	pub fn for_each(&self, mut f: impl FnMut(&Strng, &Arc<T>)) {
		for (k, v) in self.entries.load().iter() {
			f(k, v);
		}
	}

	/// Replaces the key set. `build` is called for keys that are new; surviving keys keep
	/// their existing value; dropped keys are discarded wholesale.
	pub fn reconcile<E>(
		&self,
		keys: impl IntoIterator<Item = Strng>,
		mut build: impl FnMut(&Strng) -> Result<Arc<T>, E>,
	) -> Result<(), E> {
		let old = self.entries.load();
		let mut next = HashMap::new();
		for key in keys {
			let value = match old.get(&key) {
				Some(existing) => existing.clone(),
				None => build(&key)?,
			};
			next.insert(key, value);
		}
		self.entries.store(Arc::new(next));
		Ok(())
	}

	/// Rebuilds every entry, discarding existing values. For derived artifacts that must track
	/// config edits exactly.
	pub fn replace_all<E>(
		&self,
		keys: impl IntoIterator<Item = Strng>,
		mut build: impl FnMut(&Strng) -> Result<Arc<T>, E>,
	) -> Result<(), E> {
		let mut next = HashMap::new();
		for key in keys {
			let value = build(&key)?;
			next.insert(key, value);
		}
		self.entries.store(Arc::new(next));
		Ok(())
	}
}
