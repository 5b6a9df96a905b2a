// ---------------------------------------------------------------------------
// Shared wire and domain types
// ---------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

use crate::error::RecoError;

/// Which side of the factorization an index or key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
	User,
	Item,
}

impl std::fmt::Display for EntityKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::User => write!(f, "user"),
			Self::Item => write!(f, "item"),
		}
	}
}

/// One implicit observation: `user` interacted with `item` with confidence `weight`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
	pub user: usize,
	pub item: usize,
	pub weight: f64,
}

impl Interaction {
	pub fn new(user: usize, item: usize, weight: f64) -> Self {
		Self { user, item, weight }
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Hyperparameters {
	/// Latent dimension F.
	pub factors: usize,
	pub iterations: usize,
	/// Rounds of user-then-item refresh per online update.
	pub online_iterations: usize,
	pub regularization: f64,
	/// Total negative confidence spread over the item catalog.
	pub w0: f64,
	/// Popularity exponent for the negative weights; 0 gives a uniform `w0 / items`.
	pub alpha: f64,
	/// Confidence assigned to an observed pair when the caller gives none.
	pub observed_weight: f64,
	pub init_mean: f64,
	pub init_stdev: f64,
	pub seed: u64,
}

impl Default for Hyperparameters {
	fn default() -> Self {
		Self {
			factors: 64,
			iterations: 5,
			online_iterations: 1,
			regularization: 0.01,
			w0: 10.0,
			alpha: 0.0,
			observed_weight: 1.0,
			init_mean: 0.0,
			init_stdev: 0.01,
			seed: 42,
		}
	}
}

impl Hyperparameters {
	pub fn validate(&self) -> Result<(), RecoError> {
		if self.factors == 0 {
			return Err(RecoError::Data("factors must be at least 1".into()));
		}
		if self.iterations == 0 {
			return Err(RecoError::Data("iterations must be at least 1".into()));
		}
		let non_negative = [
			("regularization", self.regularization),
			("w0", self.w0),
			("alpha", self.alpha),
			("initStdev", self.init_stdev),
		];
		for (name, value) in non_negative {
			if !value.is_finite() || value < 0.0 {
				return Err(RecoError::Data(format!(
					"{} must be a finite non-negative number, got {}",
					name, value
				)));
			}
		}
		if !self.observed_weight.is_finite() || self.observed_weight <= 0.0 {
			return Err(RecoError::Data(format!(
				"observedWeight must be positive, got {}",
				self.observed_weight
			)));
		}
		if !self.init_mean.is_finite() {
			return Err(RecoError::Data("initMean must be finite".into()));
		}
		Ok(())
	}
}

/// Display metadata returned by the catalog collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
	pub item_id: String,
	#[serde(default)]
	pub title: Option<String>,
	#[serde(default)]
	pub category: Option<String>,
	#[serde(default)]
	pub description: Option<String>,
}

/// A raw model score for one item index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoredItem {
	pub index: usize,
	pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
	pub index: usize,
	pub score: f64,
	pub item: CatalogItem,
}

/// Result of a recommendation request. Unknown users and empty hydration are
/// answers, not faults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum RecommendOutcome {
	Ranked {
		recommendations: Vec<Recommendation>,
	},
	/// Exactly one of `user` / `user_key` is set, depending on how the
	/// request addressed the user.
	#[serde(rename_all = "camelCase")]
	UnknownUser {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		user: Option<usize>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		user_key: Option<String>,
		known_users: usize,
	},
	NoMatches,
}

impl RecommendOutcome {
	pub fn unknown_index(user: usize, known_users: usize) -> Self {
		Self::UnknownUser {
			user: Some(user),
			user_key: None,
			known_users,
		}
	}

	pub fn unknown_key(user_key: impl Into<String>, known_users: usize) -> Self {
		Self::UnknownUser {
			user: None,
			user_key: Some(user_key.into()),
			known_users,
		}
	}

	pub fn message(&self) -> Option<String> {
		match self {
			Self::Ranked { .. } => None,
			Self::UnknownUser { user, user_key, .. } => {
				let who = match (user, user_key) {
					(_, Some(key)) => format!("user key '{}'", key),
					(Some(user), None) => format!("user {}", user),
					(None, None) => "user".to_string(),
				};
				Some(format!(
					"No recommendations: {} is unknown for this model version",
					who
				))
			}
			Self::NoMatches => Some("No matching catalog items found".into()),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarItem {
	pub item_id: String,
	pub similarity: f64,
	pub title: Option<String>,
	pub category: Option<String>,
	pub description: Option<String>,
}

/// Diagnostics from a batch fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainReport {
	pub users: usize,
	pub items: usize,
	pub interactions: usize,
	pub iterations: usize,
	/// Weighted loss after each completed pass.
	pub loss_history: Vec<f64>,
}

/// A training row addressed by natural keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyedInteraction {
	pub user_key: String,
	pub item_key: String,
	#[serde(default)]
	pub weight: Option<f64>,
}

/// One uploaded onboarding row, keyed by natural identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetRow {
	pub user_key: String,
	#[serde(default)]
	pub item_title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowFailure {
	pub row: usize,
	pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingReport {
	pub tenant_id: String,
	pub assigned_user_range: Option<(usize, usize)>,
	pub new_users: usize,
	pub new_items: usize,
	pub applied: usize,
	pub failures: Vec<RowFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantRecord {
	pub tenant_id: String,
	pub dataset_name: String,
	pub user_range: Option<(usize, usize)>,
	pub created_at: u64,
}
