// ---------------------------------------------------------------------------
// Snapshot persistence + data directory layout
// ---------------------------------------------------------------------------
//
// Layout under the data directory:
//
//   models/<tenant>.snap.gz   one gzipped JSON snapshot per tenant model
//   tenants.json              tenant id counter + one record per tenant
//   keymaps.json              shared title/user maps used by onboarding
//
// Snapshot format (v1): gzipped JSON
//   { formatVersion, tenantId, hyperparameters,
//     userFactors: { rows, dim, data }, itemFactors: { rows, dim, data },
//     itemWeights, interactions: { users, items, weights },
//     mappings, savedAt }
// where every float payload is base64 of little-endian f64 bytes, so a
// save/load cycle is bit-exact.
//
// Every file goes through `atomic_write`: unique temp file in the target
// directory, fsync, rename.
// ---------------------------------------------------------------------------

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entity::{EntityRegistry, RegistryData};
use crate::factors::{FactorMatrix, FactorStore};
use crate::model::Model;
use crate::sparse::InteractionSet;
use crate::types::{Hyperparameters, TenantRecord};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PersistenceError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	#[error("No snapshot for tenant {0}")]
	Missing(String),
	#[error("Corruption: {0}")]
	Corruption(String),
	#[error("Serialization: {0}")]
	Serialization(String),
}

pub const FORMAT_VERSION: u32 = 1;
const SNAPSHOT_SUFFIX: &str = ".snap.gz";
const TENANTS_FILE: &str = "tenants.json";
const KEYMAPS_FILE: &str = "keymaps.json";

// ---------------------------------------------------------------------------
// Float encode / decode
// ---------------------------------------------------------------------------

/// Base64 of f64 little-endian bytes.
pub fn encode_f64s(values: &[f64]) -> String {
	let bytes: Vec<u8> = values.iter().flat_map(|f| f.to_le_bytes()).collect();
	STANDARD.encode(&bytes)
}

pub fn decode_f64s(encoded: &str) -> Result<Vec<f64>, PersistenceError> {
	let bytes = STANDARD
		.decode(encoded)
		.map_err(|e| PersistenceError::Corruption(format!("Invalid base64: {}", e)))?;
	if bytes.len() % 8 != 0 {
		return Err(PersistenceError::Corruption(format!(
			"Float payload of {} bytes is not a multiple of 8",
			bytes.len()
		)));
	}
	let mut result = Vec::with_capacity(bytes.len() / 8);
	for chunk in bytes.chunks_exact(8) {
		let mut buf = [0u8; 8];
		buf.copy_from_slice(chunk);
		result.push(f64::from_le_bytes(buf));
	}
	Ok(result)
}

// ---------------------------------------------------------------------------
// Gzip compress / decompress
// ---------------------------------------------------------------------------

/// Gzip-compress a byte slice (level 6).
pub fn compress(data: &[u8]) -> Result<Vec<u8>, PersistenceError> {
	let mut encoder = GzEncoder::new(data, Compression::new(6));
	let mut compressed = Vec::new();
	encoder.read_to_end(&mut compressed)?;
	Ok(compressed)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, PersistenceError> {
	let mut decoder = GzDecoder::new(data);
	let mut decompressed = Vec::new();
	decoder
		.read_to_end(&mut decompressed)
		.map_err(|e| PersistenceError::Corruption(format!("Invalid gzip stream: {}", e)))?;
	Ok(decompressed)
}

/// Check if data starts with gzip magic bytes (0x1f, 0x8b).
pub fn is_gzipped(data: &[u8]) -> bool {
	data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

// ---------------------------------------------------------------------------
// Atomic write
// ---------------------------------------------------------------------------

/// Write `bytes` to `path` so that readers see either the old file or the
/// complete new one.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
	let dir = path.parent().unwrap_or_else(|| Path::new("."));
	fs::create_dir_all(dir)?;
	let file_name = path
		.file_name()
		.and_then(|n| n.to_str())
		.unwrap_or("snapshot");
	let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

	let written = (|| -> io::Result<()> {
		let mut file = fs::File::create(&tmp)?;
		file.write_all(bytes)?;
		file.sync_all()?;
		fs::rename(&tmp, path)
	})();
	if let Err(e) = written {
		let _ = fs::remove_file(&tmp);
		return Err(e.into());
	}
	Ok(())
}

pub fn now_millis() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Snapshot wire types
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatrixPayload {
	rows: usize,
	dim: usize,
	data: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InteractionPayload {
	users: Vec<usize>,
	items: Vec<usize>,
	weights: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
	format_version: u32,
	tenant_id: String,
	hyperparameters: Hyperparameters,
	user_factors: MatrixPayload,
	item_factors: MatrixPayload,
	item_weights: String,
	interactions: InteractionPayload,
	mappings: RegistryData,
	saved_at: u64,
}

fn encode_matrix(matrix: &FactorMatrix) -> MatrixPayload {
	MatrixPayload {
		rows: matrix.rows(),
		dim: matrix.dim(),
		data: encode_f64s(matrix.as_slice()),
	}
}

fn decode_matrix(payload: &MatrixPayload, what: &str) -> Result<FactorMatrix, PersistenceError> {
	let data = decode_f64s(&payload.data)?;
	FactorMatrix::from_raw(payload.rows, payload.dim, data)
		.map_err(|e| PersistenceError::Corruption(format!("{}: {}", what, e)))
}

fn encode_snapshot(model: &Model) -> Snapshot {
	let store = model.store();
	let triples = store.interactions().to_triples();
	let weights: Vec<f64> = triples.iter().map(|t| t.weight).collect();
	Snapshot {
		format_version: FORMAT_VERSION,
		tenant_id: model.tenant_id().to_string(),
		hyperparameters: store.hyperparameters().clone(),
		user_factors: encode_matrix(store.user_factors()),
		item_factors: encode_matrix(store.item_factors()),
		item_weights: encode_f64s(store.item_weights()),
		interactions: InteractionPayload {
			users: triples.iter().map(|t| t.user).collect(),
			items: triples.iter().map(|t| t.item).collect(),
			weights: encode_f64s(&weights),
		},
		mappings: model.registry().to_data(),
		saved_at: now_millis(),
	}
}

fn decode_snapshot(snapshot: Snapshot) -> Result<Model, PersistenceError> {
	if snapshot.format_version != FORMAT_VERSION {
		return Err(PersistenceError::Corruption(format!(
			"Unsupported snapshot format version {}",
			snapshot.format_version
		)));
	}
	let corrupt = |e: crate::error::RecoError| PersistenceError::Corruption(e.to_string());

	let users = decode_matrix(&snapshot.user_factors, "user factors")?;
	let items = decode_matrix(&snapshot.item_factors, "item factors")?;
	let item_weights = decode_f64s(&snapshot.item_weights)?;

	let payload = &snapshot.interactions;
	let weights = decode_f64s(&payload.weights)?;
	if payload.users.len() != weights.len() || payload.items.len() != weights.len() {
		return Err(PersistenceError::Corruption(format!(
			"Interaction columns disagree: {} users, {} items, {} weights",
			payload.users.len(),
			payload.items.len(),
			weights.len()
		)));
	}
	let mut interactions = InteractionSet::with_shape(users.rows(), items.rows());
	for ((&user, &item), &weight) in payload.users.iter().zip(&payload.items).zip(&weights) {
		if user >= users.rows() || item >= items.rows() {
			return Err(PersistenceError::Corruption(format!(
				"Interaction ({}, {}) outside {}x{} factors",
				user,
				item,
				users.rows(),
				items.rows()
			)));
		}
		interactions.upsert(user, item, weight);
	}

	let store = FactorStore::from_parts(
		snapshot.hyperparameters,
		users,
		items,
		item_weights,
		interactions,
	)
	.map_err(corrupt)?;
	let registry = EntityRegistry::from_data(snapshot.mappings).map_err(corrupt)?;
	Model::new(snapshot.tenant_id, store, registry).map_err(corrupt)
}

// ---------------------------------------------------------------------------
// Tenant directory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantDirectory {
	next_id: u64,
	tenants: Vec<TenantRecord>,
}

impl Default for TenantDirectory {
	fn default() -> Self {
		Self {
			next_id: 1,
			tenants: Vec::new(),
		}
	}
}

impl TenantDirectory {
	/// Reserve the next sequential tenant id.
	pub fn allocate_id(&mut self) -> String {
		let id = format!("tenant-{}", self.next_id);
		self.next_id += 1;
		id
	}

	pub fn record(&mut self, record: TenantRecord) {
		self.tenants.retain(|t| t.tenant_id != record.tenant_id);
		self.tenants.push(record);
	}

	pub fn tenants(&self) -> &[TenantRecord] {
		&self.tenants
	}

	pub fn get(&self, tenant_id: &str) -> Option<&TenantRecord> {
		self.tenants.iter().find(|t| t.tenant_id == tenant_id)
	}
}

// ---------------------------------------------------------------------------
// SnapshotStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotHandle {
	pub tenant_id: String,
	pub path: PathBuf,
	pub bytes: usize,
}

/// File-backed store rooted at the engine's data directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
	root: PathBuf,
}

impl SnapshotStore {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	fn models_dir(&self) -> PathBuf {
		self.root.join("models")
	}

	fn snapshot_path(&self, tenant_id: &str) -> Result<PathBuf, PersistenceError> {
		let valid = !tenant_id.is_empty()
			&& tenant_id
				.chars()
				.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
		if !valid {
			return Err(PersistenceError::Io(io::Error::new(
				io::ErrorKind::InvalidInput,
				format!("Invalid tenant id '{}'", tenant_id),
			)));
		}
		Ok(self
			.models_dir()
			.join(format!("{}{}", tenant_id, SNAPSHOT_SUFFIX)))
	}

	pub fn save(&self, model: &Model) -> Result<SnapshotHandle, PersistenceError> {
		let path = self.snapshot_path(model.tenant_id())?;
		let json = serde_json::to_vec(&encode_snapshot(model))
			.map_err(|e| PersistenceError::Serialization(e.to_string()))?;
		let compressed = compress(&json)?;
		atomic_write(&path, &compressed)?;
		tracing::info!(
			tenant = model.tenant_id(),
			bytes = compressed.len(),
			"Saved model snapshot"
		);
		Ok(SnapshotHandle {
			tenant_id: model.tenant_id().to_string(),
			path,
			bytes: compressed.len(),
		})
	}

	pub fn load(&self, tenant_id: &str) -> Result<Model, PersistenceError> {
		let path = self.snapshot_path(tenant_id)?;
		let raw = match fs::read(&path) {
			Ok(raw) => raw,
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				return Err(PersistenceError::Missing(tenant_id.to_string()))
			}
			Err(e) => return Err(e.into()),
		};
		if !is_gzipped(&raw) {
			return Err(PersistenceError::Corruption(format!(
				"Snapshot for {} is not gzip data",
				tenant_id
			)));
		}
		let json = decompress(&raw)?;
		let snapshot: Snapshot = serde_json::from_slice(&json)
			.map_err(|e| PersistenceError::Corruption(format!("Invalid snapshot JSON: {}", e)))?;
		if snapshot.tenant_id != tenant_id {
			return Err(PersistenceError::Corruption(format!(
				"Snapshot file for {} names tenant {}",
				tenant_id, snapshot.tenant_id
			)));
		}
		let model = decode_snapshot(snapshot)?;
		tracing::info!(tenant = tenant_id, "Loaded model snapshot");
		Ok(model)
	}

	pub fn exists(&self, tenant_id: &str) -> bool {
		self.snapshot_path(tenant_id)
			.map(|p| p.is_file())
			.unwrap_or(false)
	}

	/// Tenant ids with a snapshot on disk, sorted.
	pub fn list(&self) -> Result<Vec<String>, PersistenceError> {
		let dir = self.models_dir();
		if !dir.is_dir() {
			return Ok(Vec::new());
		}
		let mut ids: Vec<String> = fs::read_dir(&dir)?
			.filter_map(|entry| entry.ok())
			.filter_map(|entry| {
				entry
					.file_name()
					.to_str()
					.and_then(|name| name.strip_suffix(SNAPSHOT_SUFFIX))
					.filter(|id| !id.starts_with('.'))
					.map(str::to_string)
			})
			.collect();
		ids.sort();
		Ok(ids)
	}

	/// Returns whether a snapshot existed.
	pub fn delete(&self, tenant_id: &str) -> Result<bool, PersistenceError> {
		let path = self.snapshot_path(tenant_id)?;
		match fs::remove_file(&path) {
			Ok(()) => Ok(true),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
			Err(e) => Err(e.into()),
		}
	}

	// -- Tenant directory ------------------------------------------------

	pub fn load_directory(&self) -> Result<TenantDirectory, PersistenceError> {
		self.read_json(TENANTS_FILE)
			.map(|found| found.unwrap_or_default())
	}

	pub fn save_directory(&self, directory: &TenantDirectory) -> Result<(), PersistenceError> {
		self.write_json(TENANTS_FILE, directory)
	}

	// -- Shared onboarding key maps --------------------------------------

	/// `None` until the first onboarding batch has been persisted.
	pub fn load_key_maps(&self) -> Result<Option<EntityRegistry>, PersistenceError> {
		match self.read_json::<RegistryData>(KEYMAPS_FILE)? {
			Some(data) => EntityRegistry::from_data(data)
				.map(Some)
				.map_err(|e| PersistenceError::Corruption(e.to_string())),
			None => Ok(None),
		}
	}

	pub fn save_key_maps(&self, maps: &EntityRegistry) -> Result<(), PersistenceError> {
		self.write_json(KEYMAPS_FILE, &maps.to_data())
	}

	fn read_json<T: serde::de::DeserializeOwned>(
		&self,
		name: &str,
	) -> Result<Option<T>, PersistenceError> {
		let path = self.root.join(name);
		let raw = match fs::read(&path) {
			Ok(raw) => raw,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(e.into()),
		};
		serde_json::from_slice(&raw)
			.map(Some)
			.map_err(|e| PersistenceError::Corruption(format!("Invalid {}: {}", name, e)))
	}

	fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<(), PersistenceError> {
		let json = serde_json::to_vec_pretty(value)
			.map_err(|e| PersistenceError::Serialization(e.to_string()))?;
		atomic_write(&self.root.join(name), &json)
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
