// ---------------------------------------------------------------------------
// LRU recommendation cache
// ---------------------------------------------------------------------------
//
// Memoizes hydrated recommendation outcomes per (tenant, user, k). Any write
// to a tenant's model makes its cached outcomes stale, so invalidation is by
// tenant rather than by key.
//
// Each tenant also carries a generation that every invalidation bumps. A
// reader notes the generation before computing an outcome and stores it
// with `put_at`; if a write landed in between, the insert is dropped.
// ---------------------------------------------------------------------------

use std::collections::HashMap;

use crate::types::RecommendOutcome;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
	pub tenant_id: String,
	pub user: usize,
	pub k: usize,
}

impl CacheKey {
	pub fn new(tenant_id: &str, user: usize, k: usize) -> Self {
		Self {
			tenant_id: tenant_id.to_string(),
			user,
			k,
		}
	}
}

/// Entry-count bounded LRU.
///
/// Uses a `Vec<(CacheKey, RecommendOutcome)>` for ordering (oldest first) and
/// a `HashMap<CacheKey, usize>` for lookups by key.
pub struct RecommendationCache {
	max_entries: usize,
	entries: Vec<(CacheKey, RecommendOutcome)>,
	index: HashMap<CacheKey, usize>,
	generations: HashMap<String, u64>,
	/// Added to every tenant's generation; bumped by `clear`.
	epoch: u64,
	hits: u64,
	misses: u64,
}

impl RecommendationCache {
	/// A capacity of 0 disables caching.
	pub fn new(max_entries: usize) -> Self {
		Self {
			max_entries,
			entries: Vec::new(),
			index: HashMap::new(),
			generations: HashMap::new(),
			epoch: 0,
			hits: 0,
			misses: 0,
		}
	}

	fn rebuild_index(&mut self) {
		self.index.clear();
		for (i, (key, _)) in self.entries.iter().enumerate() {
			self.index.insert(key.clone(), i);
		}
	}

	fn evict(&mut self) {
		if self.entries.len() > self.max_entries {
			let excess = self.entries.len() - self.max_entries;
			self.entries.drain(..excess);
		}
		self.rebuild_index();
	}

	/// On hit, promotes the entry to most-recently-used.
	pub fn get(&mut self, key: &CacheKey) -> Option<RecommendOutcome> {
		let Some(idx) = self.index.get(key).copied() else {
			self.misses += 1;
			return None;
		};
		self.hits += 1;
		let entry = self.entries.remove(idx);
		let value = entry.1.clone();
		self.entries.push(entry);
		self.rebuild_index();
		Some(value)
	}

	pub fn put(&mut self, key: CacheKey, value: RecommendOutcome) {
		if self.max_entries == 0 {
			return;
		}
		if let Some(idx) = self.index.remove(&key) {
			self.entries.remove(idx);
		}
		self.entries.push((key, value));
		self.evict();
	}

	/// Current write generation of `tenant_id`.
	pub fn generation(&self, tenant_id: &str) -> u64 {
		self.epoch + self.generations.get(tenant_id).copied().unwrap_or(0)
	}

	/// `put`, unless the tenant was invalidated after `generation` was read.
	/// Returns whether the entry was stored.
	pub fn put_at(&mut self, key: CacheKey, value: RecommendOutcome, generation: u64) -> bool {
		if self.generation(&key.tenant_id) != generation {
			tracing::trace!(tenant = %key.tenant_id, "Dropped outcome computed before a write");
			return false;
		}
		self.put(key, value);
		true
	}

	/// Drop every entry for `tenant_id` and advance its generation. Returns
	/// how many entries were removed.
	pub fn invalidate_tenant(&mut self, tenant_id: &str) -> usize {
		*self.generations.entry(tenant_id.to_string()).or_insert(0) += 1;
		let before = self.entries.len();
		self.entries.retain(|(key, _)| key.tenant_id != tenant_id);
		let removed = before - self.entries.len();
		if removed > 0 {
			self.rebuild_index();
			tracing::debug!(tenant = tenant_id, removed, "Invalidated cached recommendations");
		}
		removed
	}

	pub fn clear(&mut self) {
		self.entries.clear();
		self.index.clear();
		self.epoch += 1;
	}

	pub fn size(&self) -> usize {
		self.entries.len()
	}

	pub fn stats(&self) -> (u64, u64) {
		(self.hits, self.misses)
	}
}

impl Default for RecommendationCache {
	fn default() -> Self {
		Self::new(1024)
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
