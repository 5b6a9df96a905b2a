// ---------------------------------------------------------------------------
// Integration tests for the reco-engine JSON-RPC 2.0 / NDJSON protocol
// ---------------------------------------------------------------------------
//
// Each test spawns a fresh reco-engine binary over a temporary data
// directory and talks to it via stdin/stdout.
// ---------------------------------------------------------------------------

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helper
// ---------------------------------------------------------------------------

struct RecoProcess {
	child: Child,
	reader: BufReader<std::process::ChildStdout>,
	next_id: AtomicU64,
}

impl RecoProcess {
	fn spawn(dir: &Path) -> Self {
		write_fixtures(dir);
		let bin = env!("CARGO_BIN_EXE_reco-engine");
		let mut child = Command::new(bin)
			.arg("--data-dir")
			.arg(dir.join("data"))
			.arg("--catalog")
			.arg(dir.join("catalog.json"))
			.arg("--embeddings")
			.arg(dir.join("embeddings.json"))
			.args(["--factors", "4", "--w0", "1", "--init-stdev", "0.1"])
			.env_remove("RUST_LOG")
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.spawn()
			.expect("failed to spawn reco-engine");

		let stdout = child.stdout.take().expect("no stdout");
		let reader = BufReader::new(stdout);

		Self {
			child,
			reader,
			next_id: AtomicU64::new(1),
		}
	}

	fn send(&mut self, method: &str, params: Value) -> RpcResponse {
		let id = self.next_id.fetch_add(1, Ordering::SeqCst);
		let request = json!({
			"jsonrpc": "2.0",
			"id": id,
			"method": method,
			"params": params,
		});

		let stdin = self.child.stdin.as_mut().expect("no stdin");
		let mut line = serde_json::to_string(&request).unwrap();
		line.push('\n');
		stdin.write_all(line.as_bytes()).unwrap();
		stdin.flush().unwrap();

		loop {
			let mut buf = String::new();
			let bytes_read = self
				.reader
				.read_line(&mut buf)
				.expect("failed to read from stdout");
			if bytes_read == 0 {
				panic!("unexpected EOF while waiting for response to id={}", id);
			}
			let buf = buf.trim();
			if buf.is_empty() {
				continue;
			}
			let parsed: Value = serde_json::from_str(buf)
				.unwrap_or_else(|e| panic!("invalid JSON from engine: {e}\nline: {buf}"));
			let resp_id = parsed["id"].as_u64().expect("response id is not u64");
			assert_eq!(resp_id, id, "response id mismatch");
			if let Some(error) = parsed.get("error") {
				return RpcResponse::Error(error.clone());
			}
			return RpcResponse::Ok(parsed.get("result").cloned().unwrap_or(Value::Null));
		}
	}

	fn call(&mut self, method: &str, params: Value) -> Value {
		match self.send(method, params) {
			RpcResponse::Ok(v) => v,
			RpcResponse::Error(e) => panic!("expected success, got error: {e}"),
		}
	}

	fn call_err(&mut self, method: &str, params: Value) -> Value {
		match self.send(method, params) {
			RpcResponse::Error(e) => e,
			RpcResponse::Ok(v) => panic!("expected error, got success: {v}"),
		}
	}

	/// Train the base tenant on a small 3 user x 4 item history.
	fn train_base(&mut self) -> Value {
		self.call(
			"model/train",
			json!({ "interactions": [
				{ "user": 0, "item": 0 },
				{ "user": 0, "item": 1 },
				{ "user": 1, "item": 1 },
				{ "user": 1, "item": 2 },
				{ "user": 2, "item": 2 },
				{ "user": 2, "item": 3 },
			]}),
		)
	}
}

impl Drop for RecoProcess {
	fn drop(&mut self) {
		drop(self.child.stdin.take());
		let _ = self.child.wait();
	}
}

#[derive(Debug)]
enum RpcResponse {
	Ok(Value),
	Error(Value),
}

fn write_fixtures(dir: &Path) {
	let catalog = json!([
		{ "itemId": "0", "title": "Heat", "category": "crime" },
		{ "itemId": "1", "title": "Ronin", "category": "crime" },
		{ "itemId": "2", "title": "Alien", "category": "horror" },
		{ "itemId": "3", "title": "Thief", "category": "crime" },
	]);
	std::fs::write(dir.join("catalog.json"), catalog.to_string()).unwrap();

	let embeddings = json!({
		"itemIds": ["0", "1", "2", "3"],
		"descriptionEmbeddings": [[3.0, 0.0], [0.8, 0.6], [0.0, 1.0], [6.0, 0.0]],
		"categoryEmbeddings": [[4.0], [1.0], [0.0], [8.0]],
	});
	std::fs::write(dir.join("embeddings.json"), embeddings.to_string()).unwrap();
}

fn reco_code(error: &Value) -> &str {
	error["data"]["recoCode"].as_str().unwrap_or("")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn train_and_recommend() {
	let dir = TempDir::new().unwrap();
	let mut proc = RecoProcess::spawn(dir.path());

	let trained = proc.train_base();
	assert_eq!(trained["tenantId"], "base");
	assert_eq!(trained["report"]["users"], 3);
	assert_eq!(trained["report"]["items"], 4);

	let result = proc.call("model/recommend", json!({ "userId": 0, "k": 2 }));
	assert_eq!(result["status"], "ranked");
	let recs = result["recommendations"].as_array().unwrap();
	assert!(!recs.is_empty() && recs.len() <= 2);
	assert!(recs[0]["item"]["title"].is_string());
	assert!(dir.path().join("data/models/base.snap.gz").exists());
}

#[test]
fn unknown_user_is_an_answer() {
	let dir = TempDir::new().unwrap();
	let mut proc = RecoProcess::spawn(dir.path());
	proc.train_base();

	let result = proc.call("model/recommend", json!({ "userId": 9 }));
	assert_eq!(result["status"], "unknownUser");
	assert_eq!(result["knownUsers"], 3);
	assert!(result["message"].is_string());
}

#[test]
fn unknown_user_key_is_an_answer() {
	let dir = TempDir::new().unwrap();
	let mut proc = RecoProcess::spawn(dir.path());
	proc.train_base();

	let result = proc.call("model/recommend", json!({ "userKey": "ghost" }));
	assert_eq!(result["status"], "unknownUser");
	assert_eq!(result["userKey"], "ghost");
	assert_eq!(result["knownUsers"], 3);
}

#[test]
fn update_requires_growth() {
	let dir = TempDir::new().unwrap();
	let mut proc = RecoProcess::spawn(dir.path());
	proc.train_base();

	let err = proc.call_err("model/update", json!({ "userId": 3, "itemId": 0 }));
	assert_eq!(err["code"], -32000);
	assert_eq!(reco_code(&err), "RECO_INDEX_OUT_OF_RANGE");

	let grown = proc.call("model/grow", json!({ "userId": 3 }));
	assert_eq!(grown["addedUsers"], 1);
	proc.call("model/update", json!({ "userId": 3, "itemId": 0 }));

	let result = proc.call("model/recommend", json!({ "userId": 3, "k": 3 }));
	assert_eq!(result["status"], "ranked");
}

#[test]
fn snapshots_survive_restart() {
	let dir = TempDir::new().unwrap();
	{
		let mut proc = RecoProcess::spawn(dir.path());
		proc.train_base();
	}
	let mut proc = RecoProcess::spawn(dir.path());
	let info = proc.call("model/info", json!({ "tenantId": "base" }));
	assert_eq!(info["users"], 3);
	assert_eq!(info["interactions"], 6);

	let err = proc.call_err("model/info", json!({ "tenantId": "ghost" }));
	assert_eq!(reco_code(&err), "RECO_NOT_FOUND");
}

#[test]
fn dataset_upload_creates_tenant() {
	let dir = TempDir::new().unwrap();
	let mut proc = RecoProcess::spawn(dir.path());
	proc.train_base();

	let report = proc.call(
		"dataset/upload",
		json!({ "datasetName": "shop.tsv", "rows": [
			{ "userKey": "alice", "itemTitle": "Heat" },
			{ "userKey": "alice", "itemTitle": "Inception" },
			{ "userKey": "bob" },
		]}),
	);
	assert_eq!(report["tenantId"], "tenant-1");
	assert_eq!(report["assignedUserRange"], json!([3, 3]));
	assert_eq!(report["applied"], 2);
	assert_eq!(report["failures"][0]["row"], 2);

	let result = proc.call(
		"model/recommend",
		json!({ "tenantId": "tenant-1", "userKey": "alice", "k": 3 }),
	);
	assert_eq!(result["status"], "ranked");

	let listed = proc.call("tenants/list", json!({}));
	assert_eq!(listed["tenants"][0]["tenantId"], "tenant-1");

	let base = proc.call("model/info", json!({}));
	assert_eq!(base["users"], 3);
}

#[test]
fn similar_items() {
	let dir = TempDir::new().unwrap();
	let mut proc = RecoProcess::spawn(dir.path());

	let result = proc.call("content/similar", json!({ "itemId": "0", "k": 5 }));
	let ids: Vec<&str> = result["items"]
		.as_array()
		.unwrap()
		.iter()
		.map(|i| i["itemId"].as_str().unwrap())
		.collect();
	// "3" points the same way as "0" and is dropped as a duplicate.
	assert_eq!(ids, vec!["1", "2"]);
	assert_eq!(result["items"][0]["title"], "Ronin");

	let err = proc.call_err("content/similar", json!({ "itemId": "99" }));
	assert_eq!(reco_code(&err), "RECO_NOT_FOUND");
}

#[test]
fn unknown_method_and_bad_params() {
	let dir = TempDir::new().unwrap();
	let mut proc = RecoProcess::spawn(dir.path());

	let err = proc.call_err("model/explode", json!({}));
	assert_eq!(err["code"], -32601);

	let err = proc.call_err("model/update", json!({ "userId": "zero" }));
	assert_eq!(err["code"], -32602);
}
