use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use reco_engine::catalog::{CatalogLookup, InMemoryCatalog};
use reco_engine::config::CliArgs;
use reco_engine::content::ContentSimilarityIndex;
use reco_engine::models::ModelRegistry;
use reco_engine::persistence::SnapshotStore;
use reco_engine::server::{RecoServer, ServerConfig};
use reco_engine::transport::NdjsonTransport;

fn main() -> Result<()> {
	let args = CliArgs::parse();

	// Logs go to stderr; stdout carries the JSON-RPC stream
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
		)
		.init();

	let catalog: Arc<dyn CatalogLookup> = match &args.catalog {
		Some(path) => Arc::new(InMemoryCatalog::load(path)?),
		None => Arc::new(InMemoryCatalog::default()),
	};

	let content = match &args.embeddings {
		Some(path) => Some(ContentSimilarityIndex::load(path)?),
		None => {
			tracing::warn!("No embeddings given, content/similar is unavailable");
			None
		}
	};

	std::fs::create_dir_all(&args.data_dir)?;
	let snapshots = SnapshotStore::new(&args.data_dir);
	tracing::info!(data_dir = %args.data_dir.display(), "Snapshot store ready");
	let registry = ModelRegistry::new(args.registry_config(), snapshots, catalog);

	let config = ServerConfig {
		default_k: args.default_k,
		similar_k: args.similar_k,
	};
	let mut server = RecoServer::new(config, registry, content, NdjsonTransport::new());

	tracing::info!("reco-engine ready");
	server.run()?;
	Ok(())
}
