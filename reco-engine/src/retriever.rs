// ---------------------------------------------------------------------------
// Retriever — top-k scoring and catalog hydration
// ---------------------------------------------------------------------------

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::catalog::CatalogLookup;
use crate::error::RecoError;
use crate::factors::{dot, FactorStore};
use crate::model::Model;
use crate::types::{CatalogItem, EntityKind, Recommendation, RecommendOutcome, ScoredItem};

/// Descending score, ties by ascending index.
fn rank_order(a: &ScoredItem, b: &ScoredItem) -> Ordering {
	b.score
		.total_cmp(&a.score)
		.then_with(|| a.index.cmp(&b.index))
}

/// The `k` highest-scoring items for `user`. Read only.
pub fn top_k(store: &FactorStore, user: usize, k: usize) -> Result<Vec<ScoredItem>, RecoError> {
	if user >= store.user_count() {
		return Err(RecoError::NotFound(format!(
			"user {} is outside the model's {} user rows",
			user,
			store.user_count()
		)));
	}
	if k == 0 || store.item_count() == 0 {
		return Ok(Vec::new());
	}

	let p_u = store.user_factors().row(user);
	let items = store.item_factors();
	let mut scored: Vec<ScoredItem> = (0..items.rows())
		.map(|index| ScoredItem {
			index,
			score: dot(p_u, items.row(index)),
		})
		.collect();

	if k < scored.len() {
		scored.select_nth_unstable_by(k - 1, rank_order);
		scored.truncate(k);
	}
	scored.sort_by(rank_order);
	Ok(scored)
}

/// Rank, hydrate through the catalog, and drop untitled or repeated titles.
pub fn recommend(
	model: &Model,
	catalog: &dyn CatalogLookup,
	user: usize,
	k: usize,
) -> RecommendOutcome {
	let ranked = match top_k(model.store(), user, k) {
		Ok(ranked) => ranked,
		Err(_) => {
			tracing::debug!(user, tenant = model.tenant_id(), "Recommendation for unknown user");
			return RecommendOutcome::unknown_index(user, model.store().user_count());
		}
	};
	if ranked.is_empty() {
		return RecommendOutcome::Ranked {
			recommendations: Vec::new(),
		};
	}

	let mut seen = HashSet::new();
	let recommendations: Vec<Recommendation> = ranked
		.into_iter()
		.filter_map(|scored| {
			let item = hydrate(model, catalog, scored.index)?;
			let title = item.title.as_deref()?.trim();
			if title.is_empty() || !seen.insert(title.to_string()) {
				return None;
			}
			Some(Recommendation {
				index: scored.index,
				score: scored.score,
				item,
			})
		})
		.collect();

	if recommendations.is_empty() {
		RecommendOutcome::NoMatches
	} else {
		RecommendOutcome::Ranked { recommendations }
	}
}

fn hydrate(model: &Model, catalog: &dyn CatalogLookup, index: usize) -> Option<CatalogItem> {
	let item_id = model.item_catalog_id(index);
	if let Some(item) = catalog.lookup(&item_id) {
		return Some(item);
	}
	// Onboarded items are keyed by title and may have no catalog entry.
	model
		.registry()
		.key_of(index, EntityKind::Item)
		.map(|title| CatalogItem {
			item_id,
			title: Some(title.to_string()),
			category: None,
			description: None,
		})
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::catalog::InMemoryCatalog;
	use crate::entity::EntityRegistry;
	use crate::factors::FactorMatrix;
	use crate::sparse::InteractionSet;
	use crate::types::Hyperparameters;

	fn hand_built() -> FactorStore {
		let users = FactorMatrix::from_rows(&[
			vec![1.0, 0.0, 0.0, 0.0],
			vec![0.0, 1.0, 0.0, 0.0],
			vec![0.5, 0.5, 0.0, 1.0],
		])
		.unwrap();
		let items = FactorMatrix::from_rows(&[
			vec![0.9, 0.1, 0.0, 0.0],
			vec![0.2, 0.8, 0.0, 0.0],
			vec![0.9, 0.0, 0.0, 0.5],
			vec![0.0, 0.0, 1.0, 0.0],
			vec![0.1, 0.9, 0.0, 0.2],
		])
		.unwrap();
		let hyper = Hyperparameters {
			factors: 4,
			..Default::default()
		};
		FactorStore::from_parts(hyper, users, items, vec![0.2; 5], InteractionSet::with_shape(3, 5))
			.unwrap()
	}

	fn indices(items: &[ScoredItem]) -> Vec<usize> {
		items.iter().map(|s| s.index).collect()
	}

	#[test]
	fn top_k_on_hand_built_model() {
		let store = hand_built();
		// Items 0 and 2 tie at 0.9 for user 0; the lower index wins.
		assert_eq!(indices(&top_k(&store, 0, 3).unwrap()), vec![0, 2, 1]);
		assert_eq!(indices(&top_k(&store, 1, 3).unwrap()), vec![4, 1, 0]);
		let top = top_k(&store, 2, 2).unwrap();
		assert_eq!(indices(&top), vec![2, 4]);
		assert!((top[0].score - 0.95).abs() < 1e-12);
		assert!((top[1].score - 0.7).abs() < 1e-12);
	}

	#[test]
	fn top_k_edges() {
		let store = hand_built();
		assert!(top_k(&store, 0, 0).unwrap().is_empty());
		assert_eq!(top_k(&store, 0, 50).unwrap().len(), 5);
		assert!(matches!(top_k(&store, 3, 5), Err(RecoError::NotFound(_))));
	}

	#[test]
	fn full_ranking_is_sorted() {
		let store = hand_built();
		let all = top_k(&store, 2, 5).unwrap();
		for pair in all.windows(2) {
			assert!(rank_order(&pair[0], &pair[1]) != Ordering::Greater);
		}
	}

	fn catalog_item(id: &str, title: Option<&str>) -> CatalogItem {
		CatalogItem {
			item_id: id.into(),
			title: title.map(str::to_string),
			category: None,
			description: None,
		}
	}

	#[test]
	fn recommend_dedups_titles_and_drops_untitled() {
		let model = Model::new("base", hand_built(), EntityRegistry::new()).unwrap();
		let catalog = InMemoryCatalog::new(vec![
			catalog_item("0", Some("Heat")),
			catalog_item("1", Some("Ronin")),
			catalog_item("2", Some("Heat")),
			catalog_item("3", None),
		]);
		match recommend(&model, &catalog, 0, 5) {
			RecommendOutcome::Ranked { recommendations } => {
				let got: Vec<usize> = recommendations.iter().map(|r| r.index).collect();
				assert_eq!(got, vec![0, 1]);
			}
			other => panic!("unexpected outcome {:?}", other),
		}
	}

	#[test]
	fn recommend_unknown_user_is_structured() {
		let model = Model::new("base", hand_built(), EntityRegistry::new()).unwrap();
		let catalog = InMemoryCatalog::default();
		assert_eq!(
			recommend(&model, &catalog, 7, 5),
			RecommendOutcome::unknown_index(7, 3)
		);
	}

	#[test]
	fn recommend_without_catalog_matches() {
		let model = Model::new("base", hand_built(), EntityRegistry::new()).unwrap();
		let catalog = InMemoryCatalog::default();
		assert_eq!(recommend(&model, &catalog, 0, 5), RecommendOutcome::NoMatches);
	}

	#[test]
	fn registered_titles_hydrate_without_catalog_entry() {
		let mut registry = EntityRegistry::new();
		registry.bind("Ronin", EntityKind::Item, 1).unwrap();
		let model = Model::new("t1", hand_built(), registry).unwrap();
		let catalog = InMemoryCatalog::new(vec![catalog_item("4", Some("Heat"))]);
		match recommend(&model, &catalog, 1, 2) {
			RecommendOutcome::Ranked { recommendations } => {
				assert_eq!(recommendations.len(), 2);
				assert_eq!(recommendations[0].item.title.as_deref(), Some("Heat"));
				assert_eq!(recommendations[1].item.item_id, "Ronin");
				assert_eq!(recommendations[1].item.title.as_deref(), Some("Ronin"));
			}
			other => panic!("unexpected outcome {:?}", other),
		}
	}
}
