// ---------------------------------------------------------------------------
// NDJSON transport
// ---------------------------------------------------------------------------

use std::io::{self, Write};

use serde::Serialize;

#[derive(Serialize)]
struct JsonRpcResponse<'a> {
	jsonrpc: &'a str,
	id: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	result: Option<serde_json::Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	error: Option<JsonRpcErrorBody>,
}

#[derive(Serialize)]
struct JsonRpcErrorBody {
	code: i32,
	message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	data: Option<serde_json::Value>,
}

/// Writes one JSON-RPC message per line, to stdout unless told otherwise.
pub struct NdjsonTransport {
	out: Box<dyn Write + Send>,
}

impl Default for NdjsonTransport {
	fn default() -> Self {
		Self::new()
	}
}

impl NdjsonTransport {
	pub fn new() -> Self {
		Self::with_writer(io::stdout())
	}

	pub fn with_writer(out: impl Write + Send + 'static) -> Self {
		Self { out: Box::new(out) }
	}

	pub fn write_response(&mut self, id: u64, result: serde_json::Value) {
		self.write_line(&JsonRpcResponse {
			jsonrpc: "2.0",
			id,
			result: Some(result),
			error: None,
		});
	}

	pub fn write_error(
		&mut self,
		id: u64,
		code: i32,
		message: impl Into<String>,
		data: Option<serde_json::Value>,
	) {
		self.write_line(&JsonRpcResponse {
			jsonrpc: "2.0",
			id,
			result: None,
			error: Some(JsonRpcErrorBody {
				code,
				message: message.into(),
				data,
			}),
		});
	}

	fn write_line(&mut self, value: &impl Serialize) {
		let line = match serde_json::to_vec(value) {
			Ok(line) => line,
			Err(e) => {
				tracing::error!("Failed to serialize: {}", e);
				return;
			}
		};
		let written = self
			.out
			.write_all(&line)
			.and_then(|()| self.out.write_all(b"\n"))
			.and_then(|()| self.out.flush());
		if let Err(e) = written {
			tracing::error!("Failed to write response: {}", e);
		}
	}
}
