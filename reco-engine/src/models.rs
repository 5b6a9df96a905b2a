// ---------------------------------------------------------------------------
// ModelRegistry — per-tenant model handles
// ---------------------------------------------------------------------------
//
// Each loaded tenant model lives behind its own `Arc<RwLock<Model>>`.
// Queries take the read lock, online updates and growth take the write
// lock, and every acquisition gives up after the configured timeout.
//
// Retraining never blocks readers for the length of a fit: the interactions
// are copied out under a read lock and the fit runs on private matrices.
// The swap then takes the old model's write lock, replays every write that
// landed during the fit onto the new model, and replaces the handle in the
// map. Writers that were queued on the retired handle notice it is no
// longer current and retry against the new one. Readers that already hold
// the old `Arc` finish against the old version.
//
// Every completed write to a tenant clears that tenant's cached
// recommendations before the call returns, and outcomes computed against a
// version that has since been written to are never cached.
// ---------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::cache::{CacheKey, RecommendationCache};
use crate::catalog::CatalogLookup;
use crate::error::RecoError;
use crate::model::Model;
use crate::onboarding::{onboard, seed_shared_maps};
use crate::online::OnlineUpdater;
use crate::persistence::{now_millis, PersistenceError, SnapshotHandle, SnapshotStore};
use crate::retriever;
use crate::trainer::CancelToken;
use crate::types::{
	DatasetRow, EntityKind, Hyperparameters, Interaction, KeyedInteraction, OnboardingReport,
	RecommendOutcome, ScoredItem, TenantRecord, TrainReport,
};

// ---------------------------------------------------------------------------
// Config / inputs / outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RegistryConfig {
	pub base_tenant: String,
	pub hyperparameters: Hyperparameters,
	pub cache_capacity: usize,
	pub lock_timeout: Duration,
	pub max_onboarding_rows: usize,
	/// Upper bound on user or item rows reachable by training or growth.
	pub max_rows: usize,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self {
			base_tenant: "base".into(),
			hyperparameters: Hyperparameters::default(),
			cache_capacity: 1024,
			lock_timeout: Duration::from_millis(5_000),
			max_onboarding_rows: 100_000,
			max_rows: 1_000_000,
		}
	}
}

/// Training rows, either already index-addressed or keyed by natural ids.
#[derive(Debug, Clone)]
pub enum TrainInput {
	Indexed(Vec<Interaction>),
	Keyed(Vec<KeyedInteraction>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
	pub tenant_id: String,
	pub users: usize,
	pub items: usize,
	pub factors: usize,
	pub interactions: usize,
	pub mapped_users: usize,
	pub mapped_items: usize,
	pub hyperparameters: Hyperparameters,
}

impl ModelInfo {
	fn of(model: &Model) -> Self {
		let store = model.store();
		Self {
			tenant_id: model.tenant_id().to_string(),
			users: store.user_count(),
			items: store.item_count(),
			factors: store.dim(),
			interactions: store.interactions().len(),
			mapped_users: model.registry().map(EntityKind::User).len(),
			mapped_items: model.registry().map(EntityKind::Item).len(),
			hyperparameters: store.hyperparameters().clone(),
		}
	}
}

/// Tenant ids double as snapshot file names.
pub fn validate_tenant_id(tenant_id: &str) -> Result<(), RecoError> {
	let valid = !tenant_id.is_empty()
		&& tenant_id.len() <= 128
		&& tenant_id
			.chars()
			.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
	if valid {
		Ok(())
	} else {
		Err(RecoError::Data(format!(
			"tenant id '{}' must be 1-128 characters of [A-Za-z0-9_-]",
			tenant_id
		)))
	}
}

// ---------------------------------------------------------------------------
// Lock helpers
// ---------------------------------------------------------------------------

fn acquire<G>(
	timeout: Duration,
	what: &str,
	mut attempt: impl FnMut() -> Result<G, TryLockError<G>>,
) -> Result<G, RecoError> {
	let deadline = Instant::now() + timeout;
	loop {
		match attempt() {
			Ok(guard) => return Ok(guard),
			Err(TryLockError::Poisoned(_)) => {
				return Err(RecoError::Concurrency(format!("{} lock is poisoned", what)))
			}
			Err(TryLockError::WouldBlock) => {
				if Instant::now() >= deadline {
					return Err(RecoError::Concurrency(format!(
						"timed out after {:?} waiting for {} lock",
						timeout, what
					)));
				}
				std::thread::sleep(Duration::from_millis(1));
			}
		}
	}
}

type Handle = Arc<RwLock<Model>>;

/// State captured at the start of a retrain.
struct RetrainJob {
	handle: Handle,
	hyper: Hyperparameters,
	interactions: Vec<Interaction>,
}

// ---------------------------------------------------------------------------
// ModelRegistry
// ---------------------------------------------------------------------------

pub struct ModelRegistry {
	config: RegistryConfig,
	snapshots: SnapshotStore,
	catalog: Arc<dyn CatalogLookup>,
	models: RwLock<HashMap<String, Handle>>,
	cache: Mutex<RecommendationCache>,
	/// Serializes tenant-id allocation and shared key map updates.
	onboarding: Mutex<()>,
}

impl ModelRegistry {
	pub fn new(config: RegistryConfig, snapshots: SnapshotStore, catalog: Arc<dyn CatalogLookup>) -> Self {
		let cache = RecommendationCache::new(config.cache_capacity);
		Self {
			config,
			snapshots,
			catalog,
			models: RwLock::new(HashMap::new()),
			cache: Mutex::new(cache),
			onboarding: Mutex::new(()),
		}
	}

	pub fn config(&self) -> &RegistryConfig {
		&self.config
	}

	pub fn catalog(&self) -> &dyn CatalogLookup {
		self.catalog.as_ref()
	}

	// -- Locking -----------------------------------------------------------

	fn read<'a>(&self, handle: &'a Handle) -> Result<RwLockReadGuard<'a, Model>, RecoError> {
		acquire(self.config.lock_timeout, "model read", || handle.try_read())
	}

	fn write<'a>(&self, handle: &'a Handle) -> Result<RwLockWriteGuard<'a, Model>, RecoError> {
		acquire(self.config.lock_timeout, "model write", || handle.try_write())
	}

	fn invalidate(&self, tenant_id: &str) {
		match self.cache.lock() {
			Ok(mut cache) => {
				cache.invalidate_tenant(tenant_id);
			}
			Err(poisoned) => {
				// A panic mid-update may have left stale entries; start over.
				let mut cache = poisoned.into_inner();
				cache.clear();
			}
		}
	}

	fn install(&self, model: Model) -> Result<(), RecoError> {
		let tenant_id = model.tenant_id().to_string();
		{
			let mut models = acquire(self.config.lock_timeout, "registry", || self.models.try_write())?;
			models.insert(tenant_id.clone(), Arc::new(RwLock::new(model)));
		}
		self.invalidate(&tenant_id);
		Ok(())
	}

	/// The loaded handle for `tenant_id`, loading its snapshot on first use.
	fn handle(&self, tenant_id: &str) -> Result<Handle, RecoError> {
		{
			let models = acquire(self.config.lock_timeout, "registry", || self.models.try_read())?;
			if let Some(handle) = models.get(tenant_id) {
				return Ok(Arc::clone(handle));
			}
		}
		self.load(tenant_id)?;
		let models = acquire(self.config.lock_timeout, "registry", || self.models.try_read())?;
		models
			.get(tenant_id)
			.cloned()
			.ok_or_else(|| RecoError::NotFound(format!("model for tenant {} is not loaded", tenant_id)))
	}

	fn is_current(&self, tenant_id: &str, handle: &Handle) -> Result<bool, RecoError> {
		let models = acquire(self.config.lock_timeout, "registry", || self.models.try_read())?;
		Ok(models.get(tenant_id).is_some_and(|current| Arc::ptr_eq(current, handle)))
	}

	/// Run `f` under the write lock of the tenant's current model. A handle
	/// retired by a swap while this call waited is skipped.
	fn write_current<T>(
		&self,
		tenant_id: &str,
		f: impl FnOnce(&mut Model) -> Result<T, RecoError>,
	) -> Result<T, RecoError> {
		let deadline = Instant::now() + self.config.lock_timeout;
		loop {
			let handle = self.handle(tenant_id)?;
			let mut model = self.write(&handle)?;
			if self.is_current(tenant_id, &handle)? {
				return f(&mut model);
			}
			drop(model);
			if Instant::now() >= deadline {
				return Err(RecoError::Concurrency(format!(
					"model for tenant {} kept changing while waiting to write",
					tenant_id
				)));
			}
			tracing::debug!(tenant = tenant_id, "Write raced a model swap, retrying");
		}
	}

	fn check_row_limit(&self, kind: EntityKind, index: usize) -> Result<(), RecoError> {
		if index >= self.config.max_rows {
			return Err(RecoError::Index(format!(
				"{} index {} exceeds the limit of {} rows",
				kind, index, self.config.max_rows
			)));
		}
		Ok(())
	}

	// -- Lifecycle ---------------------------------------------------------

	/// (Re)load a tenant's snapshot from disk, replacing any loaded version.
	pub fn load(&self, tenant_id: &str) -> Result<ModelInfo, RecoError> {
		validate_tenant_id(tenant_id)?;
		let model = self.snapshots.load(tenant_id).map_err(|e| match e {
			PersistenceError::Missing(_) => {
				RecoError::NotFound(format!("no model for tenant {}", tenant_id))
			}
			other => other.into(),
		})?;
		let info = ModelInfo::of(&model);
		self.install(model)?;
		Ok(info)
	}

	/// Drop the in-memory model. The snapshot stays on disk.
	pub fn unload(&self, tenant_id: &str) -> Result<bool, RecoError> {
		let removed = {
			let mut models = acquire(self.config.lock_timeout, "registry", || self.models.try_write())?;
			models.remove(tenant_id).is_some()
		};
		self.invalidate(tenant_id);
		if removed {
			tracing::info!(tenant = tenant_id, "Unloaded model");
		}
		Ok(removed)
	}

	pub fn save(&self, tenant_id: &str) -> Result<SnapshotHandle, RecoError> {
		let handle = self.handle(tenant_id)?;
		let model = self.read(&handle)?;
		Ok(self.snapshots.save(&model)?)
	}

	pub fn info(&self, tenant_id: &str) -> Result<ModelInfo, RecoError> {
		let handle = self.handle(tenant_id)?;
		let model = self.read(&handle)?;
		Ok(ModelInfo::of(&model))
	}

	/// Tenant ids currently held in memory, sorted.
	pub fn loaded(&self) -> Result<Vec<String>, RecoError> {
		let models = acquire(self.config.lock_timeout, "registry", || self.models.try_read())?;
		let mut ids: Vec<String> = models.keys().cloned().collect();
		ids.sort();
		Ok(ids)
	}

	// -- Training ----------------------------------------------------------

	/// Fit a fresh model for `tenant_id`, persist it, then swap it in.
	pub fn train(
		&self,
		tenant_id: &str,
		hyper: Option<Hyperparameters>,
		input: TrainInput,
		cancel: &CancelToken,
	) -> Result<TrainReport, RecoError> {
		validate_tenant_id(tenant_id)?;
		let hyper = hyper.unwrap_or_else(|| self.config.hyperparameters.clone());
		if let TrainInput::Indexed(rows) = &input {
			let limit = self.config.max_rows;
			if let Some(row) = rows.iter().find(|r| r.user >= limit || r.item >= limit) {
				return Err(RecoError::Data(format!(
					"interaction ({}, {}) exceeds the limit of {} rows",
					row.user, row.item, limit
				)));
			}
		}
		let (model, report) = match &input {
			TrainInput::Indexed(rows) => Model::train(tenant_id, hyper, rows, cancel)?,
			TrainInput::Keyed(rows) => Model::train_keyed(tenant_id, hyper, rows, cancel)?,
		};
		self.snapshots.save(&model)?;
		self.install(model)?;
		tracing::info!(
			tenant = tenant_id,
			users = report.users,
			items = report.items,
			interactions = report.interactions,
			"Trained model"
		);
		Ok(report)
	}

	/// Refit a loaded model on its own interactions. Serving continues on the
	/// old version until the new one is persisted and swapped in; writes made
	/// during the fit are carried over.
	pub fn retrain(&self, tenant_id: &str, cancel: &CancelToken) -> Result<TrainReport, RecoError> {
		let job = self.begin_retrain(tenant_id)?;
		let (fitted, report) = Model::train(tenant_id, job.hyper.clone(), &job.interactions, cancel)?;
		self.finish_retrain(tenant_id, job, fitted)?;
		Ok(report)
	}

	fn begin_retrain(&self, tenant_id: &str) -> Result<RetrainJob, RecoError> {
		let handle = self.handle(tenant_id)?;
		let (hyper, interactions) = {
			let model = self.read(&handle)?;
			let store = model.store();
			(store.hyperparameters().clone(), store.interactions().to_triples())
		};
		Ok(RetrainJob {
			handle,
			hyper,
			interactions,
		})
	}

	/// Swap `fitted` in for the model `job` was taken from. Rows never
	/// shrink, the current key maps are kept, and interactions written since
	/// `begin_retrain` are applied to the new factors.
	fn finish_retrain(&self, tenant_id: &str, job: RetrainJob, fitted: Model) -> Result<(), RecoError> {
		let current = self.write(&job.handle)?;
		if !self.is_current(tenant_id, &job.handle)? {
			return Err(RecoError::Concurrency(format!(
				"model for tenant {} was replaced during retrain",
				tenant_id
			)));
		}

		let live = current.store();
		let mut store = fitted.store().clone();
		if live.user_count() > 0 {
			store.ensure_user_capacity(live.user_count() - 1);
		}
		if live.item_count() > 0 {
			store.ensure_item_capacity(live.item_count() - 1);
		}

		let fitted_on: HashMap<(usize, usize), f64> = job
			.interactions
			.iter()
			.map(|i| ((i.user, i.item), i.weight))
			.collect();
		let mut replayed = 0;
		for interaction in live.interactions().to_triples() {
			if fitted_on.get(&(interaction.user, interaction.item)) != Some(&interaction.weight) {
				OnlineUpdater::update_weighted(&mut store, interaction.user, interaction.item, interaction.weight)?;
				replayed += 1;
			}
		}

		let model = Model::new(tenant_id, store, current.registry().clone())?;
		self.snapshots.save(&model)?;
		self.install(model)?;
		drop(current);
		tracing::info!(tenant = tenant_id, replayed, "Retrained model");
		Ok(())
	}

	// -- Queries -----------------------------------------------------------

	pub fn recommend(&self, tenant_id: &str, user: usize, k: usize) -> Result<RecommendOutcome, RecoError> {
		let key = CacheKey::new(tenant_id, user, k);
		// Read before the model so a write racing this call voids the insert.
		let generation = match self.cache.lock() {
			Ok(mut cache) => {
				if let Some(hit) = cache.get(&key) {
					return Ok(hit);
				}
				Some(cache.generation(tenant_id))
			}
			Err(_) => None,
		};

		let handle = self.handle(tenant_id)?;
		let outcome = {
			let model = self.read(&handle)?;
			retriever::recommend(&model, self.catalog.as_ref(), user, k)
		};
		if let (Some(generation), Ok(mut cache)) = (generation, self.cache.lock()) {
			cache.put_at(key, outcome.clone(), generation);
		}
		Ok(outcome)
	}

	/// Recommend for a natural user key. An unmapped key is an
	/// `UnknownUser` answer, like an out-of-range index.
	pub fn recommend_by_key(
		&self,
		tenant_id: &str,
		user_key: &str,
		k: usize,
	) -> Result<RecommendOutcome, RecoError> {
		let resolved = {
			let handle = self.handle(tenant_id)?;
			let model = self.read(&handle)?;
			model
				.registry()
				.index_of(user_key, EntityKind::User)
				.ok_or_else(|| model.store().user_count())
		};
		match resolved {
			Ok(user) => self.recommend(tenant_id, user, k),
			Err(known_users) => {
				tracing::debug!(tenant = tenant_id, user_key, "Recommendation for unknown user key");
				Ok(RecommendOutcome::unknown_key(user_key, known_users))
			}
		}
	}

	pub fn top_k(&self, tenant_id: &str, user: usize, k: usize) -> Result<Vec<ScoredItem>, RecoError> {
		let handle = self.handle(tenant_id)?;
		let model = self.read(&handle)?;
		retriever::top_k(model.store(), user, k)
	}

	/// Resolve a natural user key for `tenant_id`.
	pub fn resolve_user(&self, tenant_id: &str, user_key: &str) -> Result<usize, RecoError> {
		let handle = self.handle(tenant_id)?;
		let model = self.read(&handle)?;
		model.resolve(user_key, EntityKind::User)
	}

	// -- Writes ------------------------------------------------------------

	/// Online update by index. Not persisted until `save`.
	pub fn update(
		&self,
		tenant_id: &str,
		user: usize,
		item: usize,
		weight: Option<f64>,
	) -> Result<(), RecoError> {
		self.write_current(tenant_id, |model| {
			let store = model.store_mut();
			let weight = weight.unwrap_or(store.hyperparameters().observed_weight);
			OnlineUpdater::update_weighted(store, user, item, weight)
		})?;
		self.invalidate(tenant_id);
		Ok(())
	}

	/// Interaction notice by natural keys. Unknown keys are an error; they
	/// never allocate rows.
	pub fn record_interaction(
		&self,
		tenant_id: &str,
		user_key: &str,
		item_key: &str,
		weight: Option<f64>,
	) -> Result<(usize, usize), RecoError> {
		let pair = self.write_current(tenant_id, |model| {
			let user = model.resolve(user_key, EntityKind::User)?;
			let item = match model.resolve(item_key, EntityKind::Item) {
				Ok(item) => item,
				// Unmapped catalog items are addressed by index.
				Err(e) => match item_key.parse::<usize>() {
					Ok(index) if model.registry().key_of(index, EntityKind::Item).is_none() => index,
					_ => return Err(e),
				},
			};
			let store = model.store_mut();
			let weight = weight.unwrap_or(store.hyperparameters().observed_weight);
			OnlineUpdater::update_weighted(store, user, item, weight)?;
			Ok((user, item))
		})?;
		self.invalidate(tenant_id);
		Ok(pair)
	}

	/// Make `user` / `item` valid row indices. Returns rows added per side.
	/// Indices at or above `max_rows` are refused before anything is allocated.
	pub fn grow(
		&self,
		tenant_id: &str,
		user: Option<usize>,
		item: Option<usize>,
	) -> Result<(usize, usize), RecoError> {
		if let Some(user) = user {
			self.check_row_limit(EntityKind::User, user)?;
		}
		if let Some(item) = item {
			self.check_row_limit(EntityKind::Item, item)?;
		}
		let added = self.write_current(tenant_id, |model| {
			let store = model.store_mut();
			let users = user.map_or(0, |u| store.ensure_user_capacity(u));
			let items = item.map_or(0, |i| store.ensure_item_capacity(i));
			Ok((users, items))
		})?;
		self.invalidate(tenant_id);
		Ok(added)
	}

	// -- Onboarding --------------------------------------------------------

	/// Derive and persist a new tenant model from the base model and `rows`.
	pub fn onboard(&self, rows: &[DatasetRow], dataset_name: &str) -> Result<OnboardingReport, RecoError> {
		let _serial = acquire(self.config.lock_timeout, "onboarding", || self.onboarding.try_lock())?;

		let base = {
			let handle = self.handle(&self.config.base_tenant)?;
			let model = self.read(&handle)?;
			model.clone()
		};

		let shared = match self.snapshots.load_key_maps()? {
			Some(maps) => maps,
			None => {
				let titles = self.catalog.indexed_titles(base.store().item_count());
				seed_shared_maps(&base, &titles)?
			}
		};
		let mut directory = self.snapshots.load_directory()?;
		let tenant_id = directory.allocate_id();

		let done = onboard(
			&base,
			&shared,
			rows,
			dataset_name,
			&tenant_id,
			self.config.max_onboarding_rows,
		)?;

		self.snapshots.save(&done.model)?;
		self.snapshots.save_key_maps(&done.shared_maps)?;
		directory.record(TenantRecord {
			tenant_id: tenant_id.clone(),
			dataset_name: dataset_name.to_string(),
			user_range: done.report.assigned_user_range,
			created_at: now_millis(),
		});
		self.snapshots.save_directory(&directory)?;
		self.install(done.model)?;
		Ok(done.report)
	}

	pub fn tenants(&self) -> Result<Vec<TenantRecord>, RecoError> {
		Ok(self.snapshots.load_directory()?.tenants().to_vec())
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
