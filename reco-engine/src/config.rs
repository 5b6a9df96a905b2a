// ---------------------------------------------------------------------------
// CLI / environment configuration
// ---------------------------------------------------------------------------

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::models::RegistryConfig;
use crate::types::Hyperparameters;

#[derive(Parser, Debug)]
#[command(name = "reco-engine", about = "Implicit-feedback recommendation engine over JSON-RPC 2.0 / NDJSON stdio")]
pub struct CliArgs {
	/// Directory holding model snapshots, the tenant directory and key maps
	#[arg(long, default_value = "./data", env = "RECO_DATA_DIR")]
	pub data_dir: PathBuf,

	/// Content embedding artifact (JSON, optionally gzipped)
	#[arg(long, env = "RECO_EMBEDDINGS")]
	pub embeddings: Option<PathBuf>,

	/// Catalog file: JSON array of { itemId, title, category, description }
	#[arg(long, env = "RECO_CATALOG")]
	pub catalog: Option<PathBuf>,

	/// Tenant id of the model onboarding derives from
	#[arg(long, default_value = "base", env = "RECO_BASE_TENANT")]
	pub base_tenant: String,

	/// Latent dimension for new fits
	#[arg(long, default_value = "64")]
	pub factors: usize,

	/// Training passes
	#[arg(long, default_value = "5")]
	pub iterations: usize,

	/// Refresh rounds per online update
	#[arg(long, default_value = "1")]
	pub online_iterations: usize,

	#[arg(long, default_value = "0.01")]
	pub regularization: f64,

	/// Total negative confidence spread over the catalog
	#[arg(long, default_value = "10.0")]
	pub w0: f64,

	/// Popularity exponent for negative weights (0 = uniform)
	#[arg(long, default_value = "0.0")]
	pub alpha: f64,

	#[arg(long, default_value = "1.0")]
	pub observed_weight: f64,

	#[arg(long, default_value = "0.01")]
	pub init_stdev: f64,

	#[arg(long, default_value = "42", env = "RECO_SEED")]
	pub seed: u64,

	/// Recommendations returned when a request gives no k
	#[arg(long, default_value = "20", env = "RECO_DEFAULT_K")]
	pub default_k: usize,

	/// Similar items returned when a request gives no k
	#[arg(long, default_value = "10", env = "RECO_SIMILAR_K")]
	pub similar_k: usize,

	/// Cached recommendation outcomes (0 disables the cache)
	#[arg(long, default_value = "1024", env = "RECO_CACHE_CAPACITY")]
	pub cache_capacity: usize,

	/// Give up on a model lock after this many milliseconds
	#[arg(long, default_value = "5000", env = "RECO_LOCK_TIMEOUT_MS")]
	pub lock_timeout_ms: u64,

	/// Largest accepted onboarding upload
	#[arg(long, default_value = "100000", env = "RECO_MAX_ONBOARDING_ROWS")]
	pub max_onboarding_rows: usize,

	/// Row limit per model side; training and growth past it are refused
	#[arg(long, default_value = "1000000", env = "RECO_MAX_ROWS")]
	pub max_rows: usize,

	/// Log level (trace, debug, info, warn, error)
	#[arg(long, default_value = "info", env = "RECO_LOG_LEVEL")]
	pub log_level: String,
}

impl CliArgs {
	pub fn hyperparameters(&self) -> Hyperparameters {
		Hyperparameters {
			factors: self.factors,
			iterations: self.iterations,
			online_iterations: self.online_iterations,
			regularization: self.regularization,
			w0: self.w0,
			alpha: self.alpha,
			observed_weight: self.observed_weight,
			init_stdev: self.init_stdev,
			seed: self.seed,
			..Default::default()
		}
	}

	pub fn registry_config(&self) -> RegistryConfig {
		RegistryConfig {
			base_tenant: self.base_tenant.clone(),
			hyperparameters: self.hyperparameters(),
			cache_capacity: self.cache_capacity,
			lock_timeout: Duration::from_millis(self.lock_timeout_ms),
			max_onboarding_rows: self.max_onboarding_rows,
			max_rows: self.max_rows,
		}
	}
}
