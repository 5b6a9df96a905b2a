// ---------------------------------------------------------------------------
// Trainer — element-wise alternating least squares (eALS)
// ---------------------------------------------------------------------------
//
// Implicit-feedback objective:
//
//   Σ_{(u,i)∈R} w_ui (1 − p_u·q_i)²  +  Σ_u Σ_{i∉R_u} c_i (p_u·q_i)²
//     + λ (‖P‖² + ‖Q‖²)
//
// Each pass recomputes every user row and then every item row one coordinate
// at a time with a closed-form solve. The unobserved mass is folded into the
// Gram caches, so a row update only walks that row's observed neighbours.
// The fit works on private matrices and hands back a complete store, so a
// cancelled or failed fit never leaves anything half-written.
// ---------------------------------------------------------------------------

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::error::RecoError;
use crate::factors::{dot, gram, negative_weights, FactorMatrix, FactorStore};
use crate::sparse::InteractionSet;
use crate::types::{Hyperparameters, Interaction, TrainReport};

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag, checked between full passes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cancel(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

// ---------------------------------------------------------------------------
// Closed-form coordinate solves
// ---------------------------------------------------------------------------

/// Refresh one user row in place.
///
/// * `row` - p_u, overwritten
/// * `observed` - (item, w_ui) pairs for this user
/// * `items` - Q
/// * `item_weights` - c_i
/// * `item_gram` - Σ_i c_i q_i q_iᵀ
pub(crate) fn solve_user_row(
	row: &mut [f64],
	observed: &[(usize, f64)],
	items: &FactorMatrix,
	item_weights: &[f64],
	item_gram: &[f64],
	regularization: f64,
) {
	let dim = row.len();
	let mut predictions: Vec<f64> = observed
		.iter()
		.map(|&(item, _)| dot(row, items.row(item)))
		.collect();

	for f in 0..dim {
		let mut numer = 0.0;
		for k in 0..dim {
			if k != f {
				numer -= row[k] * item_gram[k * dim + f];
			}
		}
		let mut denom = item_gram[f * dim + f] + regularization;

		for (slot, &(item, weight)) in observed.iter().enumerate() {
			let q_if = items.row(item)[f];
			let c_i = item_weights[item];
			let partial = predictions[slot] - row[f] * q_if;
			numer += (weight - (weight - c_i) * partial) * q_if;
			denom += (weight - c_i) * q_if * q_if;
		}

		if denom <= 0.0 || !denom.is_finite() {
			continue;
		}
		let updated = numer / denom;
		if !updated.is_finite() {
			continue;
		}
		for (slot, &(item, _)) in observed.iter().enumerate() {
			predictions[slot] += (updated - row[f]) * items.row(item)[f];
		}
		row[f] = updated;
	}
}

/// Refresh one item row in place.
///
/// * `row` - q_i, overwritten
/// * `observed` - (user, w_ui) pairs for this item
/// * `users` - P
/// * `weight` - c_i for this item
/// * `user_gram` - Σ_u p_u p_uᵀ
pub(crate) fn solve_item_row(
	row: &mut [f64],
	observed: &[(usize, f64)],
	users: &FactorMatrix,
	weight: f64,
	user_gram: &[f64],
	regularization: f64,
) {
	let dim = row.len();
	let mut predictions: Vec<f64> = observed
		.iter()
		.map(|&(user, _)| dot(users.row(user), row))
		.collect();

	for f in 0..dim {
		let mut numer = 0.0;
		for k in 0..dim {
			if k != f {
				numer -= weight * row[k] * user_gram[k * dim + f];
			}
		}
		let mut denom = weight * user_gram[f * dim + f] + regularization;

		for (slot, &(user, w_ui)) in observed.iter().enumerate() {
			let p_uf = users.row(user)[f];
			let partial = predictions[slot] - row[f] * p_uf;
			numer += (w_ui - (w_ui - weight) * partial) * p_uf;
			denom += (w_ui - weight) * p_uf * p_uf;
		}

		if denom <= 0.0 || !denom.is_finite() {
			continue;
		}
		let updated = numer / denom;
		if !updated.is_finite() {
			continue;
		}
		for (slot, &(user, _)) in observed.iter().enumerate() {
			predictions[slot] += (updated - row[f]) * users.row(user)[f];
		}
		row[f] = updated;
	}
}

// ---------------------------------------------------------------------------
// Loss
// ---------------------------------------------------------------------------

/// Weighted reconstruction error plus L2 penalty.
pub fn weighted_loss(
	users: &FactorMatrix,
	items: &FactorMatrix,
	item_weights: &[f64],
	interactions: &InteractionSet,
	regularization: f64,
) -> f64 {
	let dim = users.dim();
	let item_gram = gram(items, Some(item_weights));
	let mut loss = regularization * (users.squared_norm() + items.squared_norm());

	for u in 0..users.rows() {
		let p_u = users.row(u);
		for &(item, weight) in interactions.user_row(u) {
			let prediction = dot(p_u, items.row(item));
			loss += weight * (1.0 - prediction).powi(2) - item_weights[item] * prediction.powi(2);
		}
		for a in 0..dim {
			for b in 0..dim {
				loss += p_u[a] * item_gram[a * dim + b] * p_u[b];
			}
		}
	}
	loss
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

pub struct Trainer {
	hyper: Hyperparameters,
	track_loss: bool,
}

impl Trainer {
	pub fn new(hyper: Hyperparameters) -> Self {
		Self {
			hyper,
			track_loss: true,
		}
	}

	/// Skip the per-pass loss computation.
	pub fn without_loss(mut self) -> Self {
		self.track_loss = false;
		self
	}

	pub fn fit(&self, interactions: &[Interaction]) -> Result<(FactorStore, TrainReport), RecoError> {
		self.fit_cancellable(interactions, &CancelToken::new())
	}

	/// Full batch fit. Returns `Cancelled` if `cancel` fires between passes.
	pub fn fit_cancellable(
		&self,
		interactions: &[Interaction],
		cancel: &CancelToken,
	) -> Result<(FactorStore, TrainReport), RecoError> {
		self.hyper.validate()?;
		let observed = InteractionSet::from_interactions(interactions)?;
		let hp = &self.hyper;
		let (user_count, item_count) = (observed.users(), observed.items());

		tracing::info!(
			users = user_count,
			items = item_count,
			interactions = observed.len(),
			factors = hp.factors,
			iterations = hp.iterations,
			"Starting batch fit"
		);

		let mut rng = StdRng::seed_from_u64(hp.seed);
		let mut users = FactorMatrix::random(user_count, hp.factors, hp.init_mean, hp.init_stdev, &mut rng);
		let mut items = FactorMatrix::random(item_count, hp.factors, hp.init_mean, hp.init_stdev, &mut rng);
		let item_weights = negative_weights(&observed.item_popularity(), hp.w0, hp.alpha);

		let mut loss_history = Vec::new();
		for pass in 0..hp.iterations {
			if cancel.is_cancelled() {
				tracing::warn!(pass, "Batch fit cancelled");
				return Err(RecoError::Cancelled);
			}

			let item_gram = gram(&items, Some(&item_weights));
			{
				let items_ref = &items;
				users
					.as_mut_slice()
					.par_chunks_mut(hp.factors)
					.enumerate()
					.for_each(|(u, row)| {
						solve_user_row(
							row,
							observed.user_row(u),
							items_ref,
							&item_weights,
							&item_gram,
							hp.regularization,
						);
					});
			}

			let user_gram = gram(&users, None);
			{
				let users_ref = &users;
				items
					.as_mut_slice()
					.par_chunks_mut(hp.factors)
					.enumerate()
					.for_each(|(i, row)| {
						solve_item_row(
							row,
							observed.item_column(i),
							users_ref,
							item_weights[i],
							&user_gram,
							hp.regularization,
						);
					});
			}

			if self.track_loss {
				let loss = weighted_loss(&users, &items, &item_weights, &observed, hp.regularization);
				tracing::debug!(pass = pass + 1, loss, "Completed pass");
				loss_history.push(loss);
			}
		}

		let report = TrainReport {
			users: user_count,
			items: item_count,
			interactions: observed.len(),
			iterations: hp.iterations,
			loss_history,
		};
		let store = FactorStore::from_parts(hp.clone(), users, items, item_weights, observed)?;
		tracing::info!(users = user_count, items = item_count, "Batch fit complete");
		Ok((store, report))
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
