// ---------------------------------------------------------------------------
// Model — one tenant's factors plus key maps
// ---------------------------------------------------------------------------

use crate::entity::EntityRegistry;
use crate::error::RecoError;
use crate::factors::FactorStore;
use crate::trainer::{CancelToken, Trainer};
use crate::types::{EntityKind, Hyperparameters, Interaction, KeyedInteraction, TrainReport};

/// One tenant's model version: factors plus the key maps that address them.
#[derive(Debug, Clone)]
pub struct Model {
	tenant_id: String,
	store: FactorStore,
	registry: EntityRegistry,
}

impl Model {
	/// Every key the registry has bound must address an existing row.
	pub fn new(
		tenant_id: impl Into<String>,
		store: FactorStore,
		registry: EntityRegistry,
	) -> Result<Self, RecoError> {
		let checks = [
			(EntityKind::User, store.user_count()),
			(EntityKind::Item, store.item_count()),
		];
		for (kind, rows) in checks {
			if let Some(max) = registry.map(kind).max_index() {
				if max >= rows {
					return Err(RecoError::Data(format!(
						"{} mapping references index {} but the model has {} rows",
						kind, max, rows
					)));
				}
			}
		}
		Ok(Self {
			tenant_id: tenant_id.into(),
			store,
			registry,
		})
	}

	/// Fit on index-addressed interactions. The registry starts empty.
	pub fn train(
		tenant_id: impl Into<String>,
		hyper: Hyperparameters,
		interactions: &[Interaction],
		cancel: &CancelToken,
	) -> Result<(Self, TrainReport), RecoError> {
		let (store, report) = Trainer::new(hyper).fit_cancellable(interactions, cancel)?;
		Ok((Self::new(tenant_id, store, EntityRegistry::new())?, report))
	}

	/// Fit on natural-key rows, allocating indices in first-seen order.
	pub fn train_keyed(
		tenant_id: impl Into<String>,
		hyper: Hyperparameters,
		rows: &[KeyedInteraction],
		cancel: &CancelToken,
	) -> Result<(Self, TrainReport), RecoError> {
		let mut registry = EntityRegistry::new();
		let mut interactions = Vec::with_capacity(rows.len());
		for (row, keyed) in rows.iter().enumerate() {
			let user_key = keyed.user_key.trim();
			let item_key = keyed.item_key.trim();
			if user_key.is_empty() || item_key.is_empty() {
				return Err(RecoError::Data(format!("row {} has an empty user or item key", row)));
			}
			let user = registry.get_or_create_index(user_key, EntityKind::User);
			let item = registry.get_or_create_index(item_key, EntityKind::Item);
			let weight = keyed.weight.unwrap_or(hyper.observed_weight);
			interactions.push(Interaction::new(user, item, weight));
		}
		let (store, report) = Trainer::new(hyper).fit_cancellable(&interactions, cancel)?;
		Ok((Self::new(tenant_id, store, registry)?, report))
	}

	pub fn tenant_id(&self) -> &str {
		&self.tenant_id
	}

	pub fn store(&self) -> &FactorStore {
		&self.store
	}

	pub fn store_mut(&mut self) -> &mut FactorStore {
		&mut self.store
	}

	pub fn registry(&self) -> &EntityRegistry {
		&self.registry
	}

	/// Give a clone its own identity.
	pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
		self.tenant_id = tenant_id.into();
		self
	}

	/// Forget every `kind` key. Rows stay addressable by index.
	pub fn forget_keys(&mut self, kind: EntityKind) {
		self.registry.clear(kind);
	}

	/// Resolve a natural key without allocating.
	pub fn resolve(&self, key: &str, kind: EntityKind) -> Result<usize, RecoError> {
		self.registry.index_of(key, kind).ok_or_else(|| {
			RecoError::NotFound(format!(
				"unknown {} key '{}' for tenant {}",
				kind, key, self.tenant_id
			))
		})
	}

	/// Bind a key to an index that already has a row.
	pub fn bind(&mut self, key: &str, kind: EntityKind, index: usize) -> Result<(), RecoError> {
		let rows = match kind {
			EntityKind::User => self.store.user_count(),
			EntityKind::Item => self.store.item_count(),
		};
		if index >= rows {
			return Err(RecoError::Index(format!(
				"cannot bind {} '{}' to index {}: only {} rows",
				kind, key, index, rows
			)));
		}
		self.registry.bind(key, kind, index)
	}

	/// Catalog id for an item row: its natural key if one is bound, else the
	/// decimal index.
	pub fn item_catalog_id(&self, item: usize) -> String {
		self.registry
			.key_of(item, EntityKind::Item)
			.map(str::to_string)
			.unwrap_or_else(|| item.to_string())
	}
}
