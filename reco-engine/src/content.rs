// ---------------------------------------------------------------------------
// ContentSimilarityIndex — cosine neighbours over precomputed embeddings
// ---------------------------------------------------------------------------
//
// The embedding artifact is produced offline. Each row is the concatenation
// of a description embedding and (optionally) a category embedding. The
// index is immutable once built; queries are a linear cosine scan with
// magnitudes precomputed per row.
// ---------------------------------------------------------------------------

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogLookup, InMemoryCatalog};
use crate::cosine::{cosine_similarity_with_magnitude, magnitude};
use crate::error::RecoError;
use crate::persistence::{decompress, is_gzipped};
use crate::types::SimilarItem;

/// On-disk embedding artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingSource {
	pub item_ids: Vec<String>,
	pub description_embeddings: Vec<Vec<f32>>,
	#[serde(default)]
	pub category_embeddings: Option<Vec<Vec<f32>>>,
	/// Display metadata joined at build time, keyed by `item_id`.
	#[serde(default)]
	pub metadata: Vec<crate::types::CatalogItem>,
}

impl EmbeddingSource {
	pub fn load(path: &Path) -> Result<Self, RecoError> {
		let raw = std::fs::read(path)?;
		let bytes = if is_gzipped(&raw) { decompress(&raw)? } else { raw };
		serde_json::from_slice(&bytes).map_err(|e| {
			RecoError::Serialization(format!("Invalid embedding file {}: {}", path.display(), e))
		})
	}
}

pub struct ContentSimilarityIndex {
	item_ids: Vec<String>,
	positions: HashMap<String, usize>,
	rows: Vec<Vec<f32>>,
	magnitudes: Vec<f64>,
	metadata: InMemoryCatalog,
}

impl ContentSimilarityIndex {
	pub fn build(source: EmbeddingSource) -> Result<Self, RecoError> {
		let EmbeddingSource {
			item_ids,
			description_embeddings,
			category_embeddings,
			metadata,
		} = source;

		if description_embeddings.len() != item_ids.len() {
			return Err(RecoError::Data(format!(
				"{} description embeddings for {} item ids",
				description_embeddings.len(),
				item_ids.len()
			)));
		}
		if let Some(categories) = &category_embeddings {
			if categories.len() != item_ids.len() {
				return Err(RecoError::Data(format!(
					"{} category embeddings for {} item ids",
					categories.len(),
					item_ids.len()
				)));
			}
		}

		let mut rows = description_embeddings;
		if let Some(categories) = category_embeddings {
			for (row, category) in rows.iter_mut().zip(categories) {
				row.extend(category);
			}
		}

		let dim = rows.first().map_or(0, Vec::len);
		if !rows.is_empty() && dim == 0 {
			return Err(RecoError::Data("embeddings must not be empty vectors".into()));
		}
		if let Some((row, bad)) = rows.iter().enumerate().find(|(_, r)| r.len() != dim) {
			return Err(RecoError::Data(format!(
				"embedding row {} has dimension {}, expected {}",
				row,
				bad.len(),
				dim
			)));
		}

		let mut positions = HashMap::with_capacity(item_ids.len());
		for (row, id) in item_ids.iter().enumerate() {
			if positions.insert(id.clone(), row).is_some() {
				return Err(RecoError::Data(format!("duplicate embedding item id '{}'", id)));
			}
		}

		let magnitudes = rows.iter().map(|r| magnitude(r)).collect();
		tracing::info!(rows = rows.len(), dim, "Built content similarity index");
		Ok(Self {
			item_ids,
			positions,
			rows,
			magnitudes,
			metadata: InMemoryCatalog::new(metadata),
		})
	}

	pub fn load(path: &Path) -> Result<Self, RecoError> {
		Self::build(EmbeddingSource::load(path)?)
	}

	pub fn len(&self) -> usize {
		self.rows.len()
	}

	pub fn is_empty(&self) -> bool {
		self.rows.is_empty()
	}

	pub fn dim(&self) -> usize {
		self.rows.first().map_or(0, Vec::len)
	}

	/// Up to `k` items most similar to `item_id`. The query row itself and
	/// exact duplicates (similarity 1.0) are never returned. Neighbours with
	/// no metadata in the artifact or the catalog are dropped after ranking.
	pub fn query(
		&self,
		item_id: &str,
		k: usize,
		catalog: &dyn CatalogLookup,
	) -> Result<Vec<SimilarItem>, RecoError> {
		let target = *self
			.positions
			.get(item_id)
			.ok_or_else(|| RecoError::NotFound(format!("item '{}' has no embedding", item_id)))?;

		let query = &self.rows[target];
		let query_mag = self.magnitudes[target];
		let mut scored: Vec<(usize, f64)> = self
			.rows
			.iter()
			.zip(&self.magnitudes)
			.enumerate()
			.filter(|(row, _)| *row != target)
			.map(|(row, (v, &mag))| {
				(row, cosine_similarity_with_magnitude(query, v, query_mag, mag))
			})
			.filter(|(_, sim)| *sim < 1.0)
			.collect();

		scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
		scored.truncate(k);

		Ok(scored
			.into_iter()
			.filter_map(|(row, similarity)| {
				let id = &self.item_ids[row];
				let meta = self.metadata.lookup(id).or_else(|| catalog.lookup(id))?;
				Some(SimilarItem {
					item_id: id.clone(),
					similarity,
					title: meta.title,
					category: meta.category,
					description: meta.description,
				})
			})
			.collect())
	}

	/// One entry per distinct id; failures stay per id.
	pub fn batch_query(
		&self,
		item_ids: &[String],
		k: usize,
		catalog: &dyn CatalogLookup,
	) -> BTreeMap<String, Result<Vec<SimilarItem>, RecoError>> {
		item_ids
			.iter()
			.map(|id| (id.clone(), self.query(id, k, catalog)))
			.collect()
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::CatalogItem;

	fn meta(id: &str, title: &str) -> CatalogItem {
		CatalogItem {
			item_id: id.into(),
			title: Some(title.into()),
			category: Some("film".into()),
			description: None,
		}
	}

	fn source() -> EmbeddingSource {
		EmbeddingSource {
			item_ids: vec!["10".into(), "11".into(), "12".into(), "13".into(), "14".into()],
			description_embeddings: vec![
				vec![3.0, 0.0],
				vec![3.0, 1.0],
				vec![0.0, 1.0],
				vec![6.0, 0.0],
				vec![1.0, 1.0],
			],
			// Row "13" is exactly twice row "10" once concatenated.
			category_embeddings: Some(vec![
				vec![4.0],
				vec![4.0],
				vec![0.0],
				vec![8.0],
				vec![1.0],
			]),
			metadata: vec![
				meta("10", "Heat"),
				meta("11", "Ronin"),
				meta("12", "Alien"),
				meta("13", "Heat (Remaster)"),
			],
		}
	}

	#[test]
	fn query_excludes_self_and_exact_duplicates() {
		let index = ContentSimilarityIndex::build(source()).unwrap();
		assert_eq!(index.dim(), 3);
		let catalog = InMemoryCatalog::default();
		let results = index.query("10", 10, &catalog).unwrap();
		let ids: Vec<&str> = results.iter().map(|r| r.item_id.as_str()).collect();
		assert!(!ids.contains(&"10"));
		assert!(!ids.contains(&"13"));
		assert!(results.iter().all(|r| r.similarity < 1.0));
		assert_eq!(ids[0], "11");
		for pair in results.windows(2) {
			assert!(pair[0].similarity >= pair[1].similarity);
		}
	}

	#[test]
	fn missing_metadata_falls_back_to_catalog() {
		let index = ContentSimilarityIndex::build(source()).unwrap();
		let empty = InMemoryCatalog::default();
		let without: Vec<String> = index
			.query("11", 10, &empty)
			.unwrap()
			.into_iter()
			.map(|r| r.item_id)
			.collect();
		assert!(!without.contains(&"14".to_string()));

		let catalog = InMemoryCatalog::new(vec![meta("14", "Thief")]);
		let with = index.query("11", 10, &catalog).unwrap();
		let thief = with.iter().find(|r| r.item_id == "14").unwrap();
		assert_eq!(thief.title.as_deref(), Some("Thief"));
	}

	#[test]
	fn k_bounds_results() {
		let index = ContentSimilarityIndex::build(source()).unwrap();
		let catalog = InMemoryCatalog::default();
		assert_eq!(index.query("10", 1, &catalog).unwrap().len(), 1);
		assert!(index.query("10", 0, &catalog).unwrap().is_empty());
	}

	#[test]
	fn unknown_id_is_not_found() {
		let index = ContentSimilarityIndex::build(source()).unwrap();
		let catalog = InMemoryCatalog::default();
		assert!(matches!(
			index.query("99", 5, &catalog),
			Err(RecoError::NotFound(_))
		));
	}

	#[test]
	fn batch_isolates_failures() {
		let index = ContentSimilarityIndex::build(source()).unwrap();
		let catalog = InMemoryCatalog::default();
		let results = index.batch_query(&["10".into(), "99".into()], 3, &catalog);
		assert!(results["10"].is_ok());
		assert!(matches!(results["99"], Err(RecoError::NotFound(_))));
	}

	#[test]
	fn build_rejects_inconsistent_shapes() {
		let mut bad = source();
		bad.description_embeddings.pop();
		assert!(matches!(
			ContentSimilarityIndex::build(bad),
			Err(RecoError::Data(_))
		));

		let mut bad = source();
		bad.description_embeddings[2] = vec![1.0, 2.0, 3.0];
		assert!(matches!(
			ContentSimilarityIndex::build(bad),
			Err(RecoError::Data(_))
		));

		let mut bad = source();
		bad.item_ids[1] = "10".into();
		assert!(matches!(
			ContentSimilarityIndex::build(bad),
			Err(RecoError::Data(_))
		));
	}

	#[test]
	fn loads_gzipped_artifact() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("embeddings.json.gz");
		let json = serde_json::to_vec(&source()).unwrap();
		std::fs::write(&path, crate::persistence::compress(&json).unwrap()).unwrap();
		let index = ContentSimilarityIndex::load(&path).unwrap();
		assert_eq!(index.len(), 5);
	}
}
