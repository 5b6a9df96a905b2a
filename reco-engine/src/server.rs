// ---------------------------------------------------------------------------
// RecoServer — JSON-RPC dispatcher
// ---------------------------------------------------------------------------
//
// Routes incoming JSON-RPC 2.0 requests (NDJSON over stdin) to the model
// registry and the content index: a main `run()` loop, a `dispatch()` match,
// and free-standing handler functions for each method.
// ---------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::io::{self, BufRead};

use serde_json::{json, Value};

use crate::content::ContentSimilarityIndex;
use crate::error::RecoError;
use crate::models::{ModelRegistry, TrainInput};
use crate::protocol::*;
use crate::trainer::CancelToken;
use crate::transport::NdjsonTransport;
use crate::types::{Interaction, RecommendOutcome};

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub default_k: usize,
	pub similar_k: usize,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			default_k: 20,
			similar_k: 10,
		}
	}
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct RecoServer {
	transport: NdjsonTransport,
	registry: ModelRegistry,
	content: Option<ContentSimilarityIndex>,
	config: ServerConfig,
}

impl RecoServer {
	pub fn new(
		config: ServerConfig,
		registry: ModelRegistry,
		content: Option<ContentSimilarityIndex>,
		transport: NdjsonTransport,
	) -> Self {
		Self {
			transport,
			registry,
			content,
			config,
		}
	}

	/// Main loop: read JSON-RPC messages from stdin, dispatch to handlers.
	pub fn run(&mut self) -> Result<(), RecoError> {
		let stdin = io::stdin();
		let reader = stdin.lock();

		for line_result in reader.lines() {
			let line = line_result?;
			if line.trim().is_empty() {
				continue;
			}

			let request: JsonRpcRequest = match serde_json::from_str(&line) {
				Ok(r) => r,
				Err(e) => {
					tracing::error!("Failed to parse request: {}", e);
					continue;
				}
			};

			self.dispatch(request);
		}

		Ok(())
	}

	// ── Dispatch ──────────────────────────────────────────────────────────

	fn dispatch(&mut self, req: JsonRpcRequest) {
		let id = req.id;
		tracing::debug!(id, method = %req.method, "Dispatching request");
		match self.handle(&req.method, req.params) {
			Some(Ok(value)) => self.transport.write_response(id, value),
			Some(Err(e)) => {
				let code = match e {
					RecoError::Serialization(_) => INVALID_PARAMS,
					_ => RECO_ERROR,
				};
				self.transport
					.write_error(id, code, e.to_string(), Some(e.to_json_rpc_error()))
			}
			None => self.transport.write_error(
				id,
				METHOD_NOT_FOUND,
				format!("Unknown method: {}", req.method),
				None,
			),
		}
	}

	/// `None` for an unknown method.
	pub fn handle(&self, method: &str, params: Value) -> Option<Result<Value, RecoError>> {
		let registry = &self.registry;
		let result = match method {
			// -- Model lifecycle -------------------------------------------
			"model/train" => handle_train(registry, params),
			"model/retrain" => handle_retrain(registry, params),
			"model/load" => self.with_tenant(params, |tenant| {
				Ok(json!(registry.load(&tenant)?))
			}),
			"model/unload" => self.with_tenant(params, |tenant| {
				Ok(json!({ "unloaded": registry.unload(&tenant)? }))
			}),
			"model/save" => self.with_tenant(params, |tenant| {
				let handle = registry.save(&tenant)?;
				Ok(json!({
					"tenantId": handle.tenant_id,
					"path": handle.path.display().to_string(),
					"bytes": handle.bytes,
				}))
			}),
			"model/info" => self.with_tenant(params, |tenant| Ok(json!(registry.info(&tenant)?))),

			// -- Recommendation --------------------------------------------
			"model/recommend" => self.handle_recommend(params),
			"model/update" => handle_update(registry, params),
			"model/grow" => handle_grow(registry, params),
			"events/interaction" => handle_interaction_event(registry, params),

			// -- Content similarity ----------------------------------------
			"content/similar" => self.handle_similar(params),
			"content/similarBatch" => self.handle_similar_batch(params),

			// -- Tenants ---------------------------------------------------
			"dataset/upload" => handle_upload(registry, params),
			"tenants/list" => registry.tenants().and_then(|tenants| {
				Ok(json!({ "tenants": tenants, "loaded": registry.loaded()? }))
			}),

			_ => return None,
		};
		Some(result)
	}

	fn tenant_or_base(&self, tenant_id: Option<String>) -> String {
		tenant_id.unwrap_or_else(|| self.registry.config().base_tenant.clone())
	}

	fn with_tenant<F>(&self, params: Value, f: F) -> Result<Value, RecoError>
	where
		F: FnOnce(String) -> Result<Value, RecoError>,
	{
		let p: TenantParams = parse_params(params)?;
		f(self.tenant_or_base(p.tenant_id))
	}

	// ── Handlers needing server config ────────────────────────────────────

	fn handle_recommend(&self, params: Value) -> Result<Value, RecoError> {
		let p: RecommendParams = parse_params(params)?;
		let tenant = self.tenant_or_base(p.tenant_id);
		let k = p.k.unwrap_or(self.config.default_k);
		let outcome = match (p.user_id, p.user_key.as_deref()) {
			(Some(user), _) => self.registry.recommend(&tenant, user, k)?,
			(None, Some(key)) => self.registry.recommend_by_key(&tenant, key, k)?,
			(None, None) => {
				return Err(RecoError::Serialization(
					"Invalid params: userId or userKey is required".into(),
				))
			}
		};
		Ok(outcome_json(&tenant, &outcome))
	}

	fn content(&self) -> Result<&ContentSimilarityIndex, RecoError> {
		self.content
			.as_ref()
			.ok_or_else(|| RecoError::NotFound("no content embeddings are loaded".into()))
	}

	fn handle_similar(&self, params: Value) -> Result<Value, RecoError> {
		let p: SimilarParams = parse_params(params)?;
		let k = p.k.unwrap_or(self.config.similar_k);
		let items = self.content()?.query(&p.item_id, k, self.registry.catalog())?;
		Ok(json!({ "itemId": p.item_id, "items": items }))
	}

	fn handle_similar_batch(&self, params: Value) -> Result<Value, RecoError> {
		let p: SimilarBatchParams = parse_params(params)?;
		let k = p.k.unwrap_or(self.config.similar_k);
		let results: BTreeMap<String, Value> = self
			.content()?
			.batch_query(&p.item_ids, k, self.registry.catalog())
			.into_iter()
			.map(|(id, result)| {
				let value = match result {
					Ok(items) => json!({ "items": items }),
					Err(e) => json!({ "error": e.to_json_rpc_error() }),
				};
				(id, value)
			})
			.collect();
		Ok(json!({ "results": results }))
	}
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, RecoError> {
	// A request without params behaves like one with `{}`.
	let params = if params.is_null() { json!({}) } else { params };
	serde_json::from_value(params)
		.map_err(|e| RecoError::Serialization(format!("Invalid params: {}", e)))
}

fn outcome_json(tenant: &str, outcome: &RecommendOutcome) -> Value {
	let mut value = json!(outcome);
	if let Some(obj) = value.as_object_mut() {
		obj.insert("tenantId".into(), json!(tenant));
		if let Some(message) = outcome.message() {
			obj.insert("message".into(), json!(message));
		}
	}
	value
}

fn handle_train(registry: &ModelRegistry, params: Value) -> Result<Value, RecoError> {
	let p: TrainParams = parse_params(params)?;
	let tenant = p
		.tenant_id
		.unwrap_or_else(|| registry.config().base_tenant.clone());
	let hyper = p.hyperparameters;
	let observed_weight = hyper
		.as_ref()
		.unwrap_or(&registry.config().hyperparameters)
		.observed_weight;

	let input = match (p.interactions, p.rows) {
		(Some(rows), None) => TrainInput::Indexed(
			rows.into_iter()
				.map(|r| Interaction::new(r.user, r.item, r.weight.unwrap_or(observed_weight)))
				.collect(),
		),
		(None, Some(rows)) => TrainInput::Keyed(rows),
		_ => {
			return Err(RecoError::Serialization(
				"Invalid params: exactly one of interactions or rows is required".into(),
			))
		}
	};

	let report = registry.train(&tenant, hyper, input, &CancelToken::new())?;
	Ok(json!({ "tenantId": tenant, "report": report }))
}

fn handle_retrain(registry: &ModelRegistry, params: Value) -> Result<Value, RecoError> {
	let p: TenantParams = parse_params(params)?;
	let tenant = p
		.tenant_id
		.unwrap_or_else(|| registry.config().base_tenant.clone());
	let report = registry.retrain(&tenant, &CancelToken::new())?;
	Ok(json!({ "tenantId": tenant, "report": report }))
}

fn handle_update(registry: &ModelRegistry, params: Value) -> Result<Value, RecoError> {
	let p: UpdateParams = parse_params(params)?;
	let tenant = p
		.tenant_id
		.unwrap_or_else(|| registry.config().base_tenant.clone());
	registry.update(&tenant, p.user_id, p.item_id, p.weight)?;
	Ok(json!({ "message": "Model updated successfully", "userId": p.user_id, "itemId": p.item_id }))
}

fn handle_grow(registry: &ModelRegistry, params: Value) -> Result<Value, RecoError> {
	let p: GrowParams = parse_params(params)?;
	let tenant = p
		.tenant_id
		.unwrap_or_else(|| registry.config().base_tenant.clone());
	let (added_users, added_items) = registry.grow(&tenant, p.user_id, p.item_id)?;
	let info = registry.info(&tenant)?;
	Ok(json!({
		"addedUsers": added_users,
		"addedItems": added_items,
		"users": info.users,
		"items": info.items,
	}))
}

fn handle_interaction_event(registry: &ModelRegistry, params: Value) -> Result<Value, RecoError> {
	let p: InteractionEventParams = parse_params(params)?;
	let tenant = p
		.tenant_id
		.unwrap_or_else(|| registry.config().base_tenant.clone());
	let (user, item) = registry.record_interaction(&tenant, &p.user_key, &p.item_key, p.weight)?;
	Ok(json!({ "userId": user, "itemId": item }))
}

fn handle_upload(registry: &ModelRegistry, params: Value) -> Result<Value, RecoError> {
	let p: UploadParams = parse_params(params)?;
	let report = registry.onboard(&p.rows, &p.dataset_name)?;
	Ok(json!(report))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
