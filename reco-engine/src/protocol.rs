// ---------------------------------------------------------------------------
// JSON-RPC 2.0 framing and request params
// ---------------------------------------------------------------------------

use serde::Deserialize;

use crate::types::{DatasetRow, Hyperparameters, KeyedInteraction};

// ── JSON-RPC 2.0 error codes ────────────────────────────────────────────────

pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const RECO_ERROR: i32 = -32000;

// ── Incoming request ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
	pub id: u64,
	pub method: String,
	#[serde(default)]
	pub params: serde_json::Value,
}

// ── Params ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantParams {
	pub tenant_id: Option<String>,
}

/// Index-addressed training row; `weight` falls back to the observed weight.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionParams {
	pub user: usize,
	pub item: usize,
	pub weight: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainParams {
	pub tenant_id: Option<String>,
	pub hyperparameters: Option<Hyperparameters>,
	pub interactions: Option<Vec<InteractionParams>>,
	pub rows: Option<Vec<KeyedInteraction>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendParams {
	pub tenant_id: Option<String>,
	pub user_id: Option<usize>,
	pub user_key: Option<String>,
	pub k: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateParams {
	pub tenant_id: Option<String>,
	pub user_id: usize,
	pub item_id: usize,
	pub weight: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrowParams {
	pub tenant_id: Option<String>,
	pub user_id: Option<usize>,
	pub item_id: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionEventParams {
	pub tenant_id: Option<String>,
	pub user_key: String,
	pub item_key: String,
	pub weight: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarParams {
	pub item_id: String,
	pub k: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarBatchParams {
	pub item_ids: Vec<String>,
	pub k: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadParams {
	pub dataset_name: String,
	pub rows: Vec<DatasetRow>,
}
