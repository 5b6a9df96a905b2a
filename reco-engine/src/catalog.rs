// ---------------------------------------------------------------------------
// Catalog lookup
// ---------------------------------------------------------------------------
//
// The catalog is an external, read-only collaborator. The engine only needs
// to resolve a stable item id into display metadata. `InMemoryCatalog` backs
// the trait with a JSON array file.
// ---------------------------------------------------------------------------

use std::collections::HashMap;
use std::path::Path;

use crate::error::RecoError;
use crate::persistence::{decompress, is_gzipped};
use crate::types::CatalogItem;

pub trait CatalogLookup: Send + Sync {
	fn lookup(&self, item_id: &str) -> Option<CatalogItem>;

	/// `(title, index)` pairs for catalog entries addressed by a plain item
	/// index below `rows`. Catalogs that cannot enumerate return nothing.
	fn indexed_titles(&self, _rows: usize) -> Vec<(String, usize)> {
		Vec::new()
	}
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
	items: HashMap<String, CatalogItem>,
}

impl InMemoryCatalog {
	/// Later entries with the same id replace earlier ones.
	pub fn new(items: Vec<CatalogItem>) -> Self {
		let items = items
			.into_iter()
			.map(|item| (item.item_id.clone(), item))
			.collect();
		Self { items }
	}

	/// Load a JSON array of catalog items, gzipped or plain.
	pub fn load(path: &Path) -> Result<Self, RecoError> {
		let raw = std::fs::read(path)?;
		let bytes = if is_gzipped(&raw) { decompress(&raw)? } else { raw };
		let items: Vec<CatalogItem> = serde_json::from_slice(&bytes).map_err(|e| {
			RecoError::Serialization(format!("Invalid catalog file {}: {}", path.display(), e))
		})?;
		tracing::info!(path = %path.display(), items = items.len(), "Loaded catalog");
		Ok(Self::new(items))
	}

	pub fn len(&self) -> usize {
		self.items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}
}

impl CatalogLookup for InMemoryCatalog {
	fn lookup(&self, item_id: &str) -> Option<CatalogItem> {
		self.items.get(item_id).cloned()
	}

	fn indexed_titles(&self, rows: usize) -> Vec<(String, usize)> {
		let mut titled: Vec<(String, usize)> = self
			.items
			.values()
			.filter_map(|item| {
				let index = item.item_id.parse::<usize>().ok()?;
				let title = item.title.as_deref()?.trim();
				(index < rows && !title.is_empty()).then(|| (title.to_string(), index))
			})
			.collect();
		titled.sort_by_key(|(_, index)| *index);
		titled
	}
}
