// ---------------------------------------------------------------------------
// OnlineUpdater — absorb one interaction without a retrain
// ---------------------------------------------------------------------------
//
// Records the pair, then refreshes only the touched user row and item row
// with the same closed-form coordinate solve the trainer uses. The Gram
// caches are patched incrementally (drop the old outer product, add the new
// one), so the cost depends on F and on the two rows' neighbour counts, not
// on the size of the catalog or user base.
// ---------------------------------------------------------------------------

use crate::error::RecoError;
use crate::factors::{add_outer, FactorStore};
use crate::trainer::{solve_item_row, solve_user_row};

pub struct OnlineUpdater;

impl OnlineUpdater {
	/// Apply `(user, item)` with the training-time observed weight.
	pub fn update(store: &mut FactorStore, user: usize, item: usize) -> Result<(), RecoError> {
		let weight = store.hyperparameters().observed_weight;
		Self::update_weighted(store, user, item, weight)
	}

	/// Apply `(user, item, weight)`. Out-of-range indices fail with
	/// `RecoError::Index` and leave the store untouched; growing the matrices is
	/// the caller's job.
	pub fn update_weighted(
		store: &mut FactorStore,
		user: usize,
		item: usize,
		weight: f64,
	) -> Result<(), RecoError> {
		if user >= store.user_count() {
			return Err(RecoError::Index(format!(
				"user {} is outside the model's {} user rows",
				user,
				store.user_count()
			)));
		}
		if item >= store.item_count() {
			return Err(RecoError::Index(format!(
				"item {} is outside the model's {} item rows",
				item,
				store.item_count()
			)));
		}
		if !weight.is_finite() || weight <= 0.0 {
			return Err(RecoError::Data(format!("invalid interaction weight {}", weight)));
		}

		let mut parts = store.solver_parts();
		parts.interactions.upsert(user, item, weight);
		let regularization = parts.hyper.regularization;
		let c_i = parts.item_weights[item];

		for _ in 0..parts.hyper.online_iterations.max(1) {
			let mut p_u = parts.users.row(user).to_vec();
			add_outer(parts.user_gram, &p_u, -1.0);
			solve_user_row(
				&mut p_u,
				parts.interactions.user_row(user),
				parts.items,
				parts.item_weights,
				parts.item_gram,
				regularization,
			);
			add_outer(parts.user_gram, &p_u, 1.0);
			parts.users.row_mut(user).copy_from_slice(&p_u);

			let mut q_i = parts.items.row(item).to_vec();
			add_outer(parts.item_gram, &q_i, -c_i);
			solve_item_row(
				&mut q_i,
				parts.interactions.item_column(item),
				parts.users,
				c_i,
				parts.user_gram,
				regularization,
			);
			add_outer(parts.item_gram, &q_i, c_i);
			parts.items.row_mut(item).copy_from_slice(&q_i);
		}

		tracing::debug!(user, item, weight, "Applied online update");
		Ok(())
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
