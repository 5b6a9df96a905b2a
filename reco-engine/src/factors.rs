// ---------------------------------------------------------------------------
// FactorStore — latent factors and solver caches for one model version
// ---------------------------------------------------------------------------
//
// Factor matrices are row-major `Vec<f64>` buffers so they can be split into
// disjoint mutable rows for the parallel half-passes and encoded bit-exactly
// in snapshots. Alongside the factors the store keeps the per-item negative
// confidence weights, the observed interactions, and the two Gram caches the
// element-wise solver needs:
//
//   user_gram = Σ_u p_u p_uᵀ
//   item_gram = Σ_i c_i q_i q_iᵀ
// ---------------------------------------------------------------------------

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::RecoError;
use crate::sparse::InteractionSet;
use crate::types::{EntityKind, Hyperparameters};

// ---------------------------------------------------------------------------
// FactorMatrix
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct FactorMatrix {
	dim: usize,
	data: Vec<f64>,
}

impl FactorMatrix {
	pub fn zeros(rows: usize, dim: usize) -> Self {
		Self {
			dim,
			data: vec![0.0; rows * dim],
		}
	}

	/// Rebuild a matrix from a flat row-major buffer.
	pub fn from_raw(rows: usize, dim: usize, data: Vec<f64>) -> Result<Self, RecoError> {
		if dim == 0 {
			return Err(RecoError::Data("factor dimension must be at least 1".into()));
		}
		if data.len() != rows * dim {
			return Err(RecoError::Data(format!(
				"factor buffer holds {} values, expected {} x {}",
				data.len(),
				rows,
				dim
			)));
		}
		Ok(Self { dim, data })
	}

	/// Build a matrix from explicit rows. All rows must have the same length.
	pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, RecoError> {
		let dim = rows.first().map(Vec::len).unwrap_or(0);
		if rows.iter().any(|r| r.len() != dim) {
			return Err(RecoError::Data("factor rows have inconsistent lengths".into()));
		}
		Self::from_raw(rows.len(), dim, rows.concat())
	}

	/// Rows drawn from N(mean, stdev) using the given generator.
	pub fn random(rows: usize, dim: usize, mean: f64, stdev: f64, rng: &mut StdRng) -> Self {
		let data = (0..rows * dim)
			.map(|_| sample_normal(rng, mean, stdev))
			.collect();
		Self { dim, data }
	}

	pub fn rows(&self) -> usize {
		if self.dim == 0 {
			0
		} else {
			self.data.len() / self.dim
		}
	}

	pub fn dim(&self) -> usize {
		self.dim
	}

	pub fn row(&self, index: usize) -> &[f64] {
		&self.data[index * self.dim..(index + 1) * self.dim]
	}

	pub fn row_mut(&mut self, index: usize) -> &mut [f64] {
		&mut self.data[index * self.dim..(index + 1) * self.dim]
	}

	pub fn as_slice(&self) -> &[f64] {
		&self.data
	}

	pub(crate) fn as_mut_slice(&mut self) -> &mut [f64] {
		&mut self.data
	}

	pub fn push_row(&mut self, row: &[f64]) {
		debug_assert_eq!(row.len(), self.dim);
		self.data.extend_from_slice(row);
	}

	pub fn squared_norm(&self) -> f64 {
		self.data.iter().map(|v| v * v).sum()
	}
}

// ---------------------------------------------------------------------------
// Numeric helpers
// ---------------------------------------------------------------------------

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
	a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Box-Muller draw from N(mean, stdev).
pub(crate) fn sample_normal(rng: &mut StdRng, mean: f64, stdev: f64) -> f64 {
	let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
	let u2: f64 = rng.gen();
	mean + stdev * (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

/// `gram += scale * v vᵀ`
pub(crate) fn add_outer(gram: &mut [f64], v: &[f64], scale: f64) {
	let dim = v.len();
	for a in 0..dim {
		let va = v[a] * scale;
		if va == 0.0 {
			continue;
		}
		for b in 0..dim {
			gram[a * dim + b] += va * v[b];
		}
	}
}

/// `Σ_r w_r x_r x_rᵀ` over all rows; unit weights when `weights` is `None`.
pub fn gram(matrix: &FactorMatrix, weights: Option<&[f64]>) -> Vec<f64> {
	let dim = matrix.dim();
	let mut out = vec![0.0; dim * dim];
	for r in 0..matrix.rows() {
		let w = weights.map_or(1.0, |ws| ws[r]);
		add_outer(&mut out, matrix.row(r), w);
	}
	out
}

/// Per-item negative confidence: `w0 * pop_i^alpha / Σ_j pop_j^alpha`.
pub fn negative_weights(popularity: &[usize], w0: f64, alpha: f64) -> Vec<f64> {
	let powered: Vec<f64> = popularity.iter().map(|&p| (p as f64).powf(alpha)).collect();
	let total: f64 = powered.iter().sum();
	if total <= 0.0 {
		return vec![0.0; popularity.len()];
	}
	powered.into_iter().map(|p| w0 * p / total).collect()
}

/// Generator for a grown row, independent of how many rows were added before it.
fn row_rng(seed: u64, kind: EntityKind, index: usize) -> StdRng {
	let salt = match kind {
		EntityKind::User => 0x5851_F42D_4C95_7F2D,
		EntityKind::Item => 0x1405_7B7E_F767_814F,
	};
	StdRng::seed_from_u64(seed ^ salt ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

// ---------------------------------------------------------------------------
// FactorStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FactorStore {
	hyper: Hyperparameters,
	users: FactorMatrix,
	items: FactorMatrix,
	item_weights: Vec<f64>,
	interactions: InteractionSet,
	user_gram: Vec<f64>,
	item_gram: Vec<f64>,
}

impl FactorStore {
	/// Assemble a store from fitted or restored parts, recomputing the caches.
	pub fn from_parts(
		hyper: Hyperparameters,
		users: FactorMatrix,
		items: FactorMatrix,
		item_weights: Vec<f64>,
		mut interactions: InteractionSet,
	) -> Result<Self, RecoError> {
		if users.dim() != hyper.factors || items.dim() != hyper.factors {
			return Err(RecoError::Data(format!(
				"factor dimension mismatch: users {}, items {}, hyperparameters {}",
				users.dim(),
				items.dim(),
				hyper.factors
			)));
		}
		if item_weights.len() != items.rows() {
			return Err(RecoError::Data(format!(
				"{} item weights for {} item rows",
				item_weights.len(),
				items.rows()
			)));
		}
		if interactions.users() > users.rows() || interactions.items() > items.rows() {
			return Err(RecoError::Data(format!(
				"interactions cover {}x{} but factors only {}x{}",
				interactions.users(),
				interactions.items(),
				users.rows(),
				items.rows()
			)));
		}
		interactions.grow(users.rows(), items.rows());

		let user_gram = gram(&users, None);
		let item_gram = gram(&items, Some(&item_weights));
		Ok(Self {
			hyper,
			users,
			items,
			item_weights,
			interactions,
			user_gram,
			item_gram,
		})
	}

	pub fn hyperparameters(&self) -> &Hyperparameters {
		&self.hyper
	}

	pub fn dim(&self) -> usize {
		self.hyper.factors
	}

	pub fn user_factors(&self) -> &FactorMatrix {
		&self.users
	}

	pub fn item_factors(&self) -> &FactorMatrix {
		&self.items
	}

	pub fn item_weights(&self) -> &[f64] {
		&self.item_weights
	}

	pub fn interactions(&self) -> &InteractionSet {
		&self.interactions
	}

	pub fn user_count(&self) -> usize {
		self.users.rows()
	}

	pub fn item_count(&self) -> usize {
		self.items.rows()
	}

	pub fn user_gram(&self) -> &[f64] {
		&self.user_gram
	}

	pub fn item_gram(&self) -> &[f64] {
		&self.item_gram
	}

	pub fn score(&self, user: usize, item: usize) -> f64 {
		dot(self.users.row(user), self.items.row(item))
	}

	/// Append seeded rows until `index` is a valid user row. Returns the number
	/// of rows added.
	pub fn ensure_user_capacity(&mut self, index: usize) -> usize {
		let start = self.users.rows();
		if index < start {
			return 0;
		}
		for row in start..=index {
			let values = self.fresh_row(EntityKind::User, row);
			add_outer(&mut self.user_gram, &values, 1.0);
			self.users.push_row(&values);
		}
		self.interactions.grow(self.users.rows(), self.items.rows());
		let added = index + 1 - start;
		tracing::debug!(added, rows = self.users.rows(), "Grew user factors");
		added
	}

	/// Append seeded rows until `index` is a valid item row. New items get the
	/// mean negative weight of the existing catalog.
	pub fn ensure_item_capacity(&mut self, index: usize) -> usize {
		let start = self.items.rows();
		if index < start {
			return 0;
		}
		let weight = self.baseline_item_weight();
		for row in start..=index {
			let values = self.fresh_row(EntityKind::Item, row);
			add_outer(&mut self.item_gram, &values, weight);
			self.items.push_row(&values);
			self.item_weights.push(weight);
		}
		self.interactions.grow(self.users.rows(), self.items.rows());
		let added = index + 1 - start;
		tracing::debug!(added, rows = self.items.rows(), "Grew item factors");
		added
	}

	fn baseline_item_weight(&self) -> f64 {
		if self.item_weights.is_empty() {
			self.hyper.w0
		} else {
			self.item_weights.iter().sum::<f64>() / self.item_weights.len() as f64
		}
	}

	fn fresh_row(&self, kind: EntityKind, index: usize) -> Vec<f64> {
		let mut rng = row_rng(self.hyper.seed, kind, index);
		(0..self.hyper.factors)
			.map(|_| sample_normal(&mut rng, self.hyper.init_mean, self.hyper.init_stdev))
			.collect()
	}

	/// Split borrows for the online updater.
	pub(crate) fn solver_parts(&mut self) -> SolverParts<'_> {
		SolverParts {
			hyper: &self.hyper,
			users: &mut self.users,
			items: &mut self.items,
			item_weights: &self.item_weights,
			interactions: &mut self.interactions,
			user_gram: &mut self.user_gram,
			item_gram: &mut self.item_gram,
		}
	}
}

pub(crate) struct SolverParts<'a> {
	pub hyper: &'a Hyperparameters,
	pub users: &'a mut FactorMatrix,
	pub items: &'a mut FactorMatrix,
	pub item_weights: &'a [f64],
	pub interactions: &'a mut InteractionSet,
	pub user_gram: &'a mut [f64],
	pub item_gram: &'a mut [f64],
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::Interaction;

	fn small_store() -> FactorStore {
		let hyper = Hyperparameters {
			factors: 2,
			w0: 1.0,
			..Default::default()
		};
		let users = FactorMatrix::from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
		let items = FactorMatrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
		let interactions = InteractionSet::from_interactions(&[Interaction::new(0, 1, 1.0)]).unwrap();
		FactorStore::from_parts(hyper, users, items, vec![0.5, 0.5], interactions).unwrap()
	}

	#[test]
	fn matrix_rows_and_shape() {
		let m = FactorMatrix::from_rows(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
		assert_eq!(m.rows(), 2);
		assert_eq!(m.dim(), 3);
		assert_eq!(m.row(1), &[4.0, 5.0, 6.0]);
		assert!(FactorMatrix::from_raw(2, 3, vec![0.0; 5]).is_err());
		assert!(FactorMatrix::from_rows(&[vec![1.0], vec![1.0, 2.0]]).is_err());
	}

	#[test]
	fn random_matrix_is_seed_deterministic() {
		let a = FactorMatrix::random(3, 4, 0.0, 0.01, &mut StdRng::seed_from_u64(7));
		let b = FactorMatrix::random(3, 4, 0.0, 0.01, &mut StdRng::seed_from_u64(7));
		let c = FactorMatrix::random(3, 4, 0.0, 0.01, &mut StdRng::seed_from_u64(8));
		assert_eq!(a, b);
		assert_ne!(a, c);
		assert!(a.as_slice().iter().all(|v| v.abs() < 0.1));
	}

	#[test]
	fn uniform_negative_weights_split_w0() {
		let weights = negative_weights(&[3, 0, 1, 7], 8.0, 0.0);
		assert_eq!(weights, vec![2.0, 2.0, 2.0, 2.0]);
	}

	#[test]
	fn popularity_weights_follow_alpha() {
		let weights = negative_weights(&[1, 3], 4.0, 1.0);
		assert!((weights[0] - 1.0).abs() < 1e-12);
		assert!((weights[1] - 3.0).abs() < 1e-12);
	}

	#[test]
	fn gram_caches_match_definition() {
		let store = small_store();
		// Σ p pᵀ over identity rows is the identity.
		assert_eq!(store.user_gram(), &[1.0, 0.0, 0.0, 1.0]);
		// 0.5 * ([1,2][1,2]ᵀ + [3,4][3,4]ᵀ)
		assert_eq!(store.item_gram(), &[5.0, 7.0, 7.0, 10.0]);
		assert_eq!(store.score(1, 1), 4.0);
	}

	#[test]
	fn from_parts_validates_shapes() {
		let hyper = Hyperparameters {
			factors: 3,
			..Default::default()
		};
		let users = FactorMatrix::zeros(1, 2);
		let items = FactorMatrix::zeros(1, 2);
		let set = InteractionSet::with_shape(1, 1);
		assert!(FactorStore::from_parts(hyper, users, items, vec![1.0], set).is_err());
	}

	#[test]
	fn capacity_growth_is_explicit_and_keeps_existing_rows() {
		let mut store = small_store();
		let before = store.user_factors().clone();
		assert_eq!(store.ensure_user_capacity(1), 0);
		assert_eq!(store.ensure_user_capacity(4), 3);
		assert_eq!(store.user_count(), 5);
		assert_eq!(store.user_factors().row(0), before.row(0));
		assert_eq!(store.user_factors().row(1), before.row(1));
		assert_eq!(store.interactions().users(), 5);

		assert_eq!(store.ensure_item_capacity(2), 1);
		assert_eq!(store.item_count(), 3);
		assert_eq!(store.item_weights(), &[0.5, 0.5, 0.5]);
	}

	#[test]
	fn grown_rows_are_small_and_reproducible() {
		let mut a = small_store();
		let mut b = small_store();
		a.ensure_item_capacity(3);
		b.ensure_item_capacity(2);
		b.ensure_item_capacity(3);
		assert_eq!(a.item_factors(), b.item_factors());
		assert!(a.item_factors().row(3).iter().all(|v| v.abs() < 0.1));
	}

	#[test]
	fn growth_keeps_gram_caches_consistent() {
		let mut store = small_store();
		store.ensure_user_capacity(3);
		store.ensure_item_capacity(3);
		let expected_users = gram(store.user_factors(), None);
		let expected_items = gram(store.item_factors(), Some(store.item_weights()));
		for (a, b) in store.user_gram().iter().zip(&expected_users) {
			assert!((a - b).abs() < 1e-12);
		}
		for (a, b) in store.item_gram().iter().zip(&expected_items) {
			assert!((a - b).abs() < 1e-12);
		}
	}
}
