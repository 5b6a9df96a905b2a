// ---------------------------------------------------------------------------
// RecoError
// ---------------------------------------------------------------------------

use thiserror::Error;

use crate::persistence::PersistenceError;

#[derive(Debug, Error)]
pub enum RecoError {
	#[error("Invalid data: {0}")]
	Data(String),
	#[error("Index out of range: {0}")]
	Index(String),
	#[error("Not found: {0}")]
	NotFound(String),
	#[error("Mapping conflict: {0}")]
	Duplicate(String),
	#[error("Persistence error: {0}")]
	Persistence(#[from] PersistenceError),
	#[error("Concurrency error: {0}")]
	Concurrency(String),
	#[error("Operation cancelled")]
	Cancelled,
	#[error("Serialization error: {0}")]
	Serialization(String),
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
}

impl RecoError {
	pub fn code(&self) -> &str {
		match self {
			Self::Data(_) => "RECO_DATA",
			Self::Index(_) => "RECO_INDEX_OUT_OF_RANGE",
			Self::NotFound(_) => "RECO_NOT_FOUND",
			Self::Duplicate(_) => "RECO_DUPLICATE_MAPPING",
			Self::Persistence(_) => "RECO_PERSISTENCE",
			Self::Concurrency(_) => "RECO_CONCURRENCY",
			Self::Cancelled => "RECO_CANCELLED",
			Self::Serialization(_) => "RECO_SERIALIZATION",
			Self::Io(_) => "RECO_IO",
		}
	}

	pub fn to_json_rpc_error(&self) -> serde_json::Value {
		serde_json::json!({
			"recoCode": self.code(),
			"message": self.to_string(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn codes_are_stable() {
		assert_eq!(RecoError::Data("x".into()).code(), "RECO_DATA");
		assert_eq!(RecoError::Index("x".into()).code(), "RECO_INDEX_OUT_OF_RANGE");
		assert_eq!(RecoError::Cancelled.code(), "RECO_CANCELLED");
		let err: RecoError = PersistenceError::Missing("t1".into()).into();
		assert_eq!(err.code(), "RECO_PERSISTENCE");
	}

	#[test]
	fn json_rpc_payload_carries_code_and_message() {
		let err = RecoError::NotFound("item 42".into());
		let value = err.to_json_rpc_error();
		assert_eq!(value["recoCode"], "RECO_NOT_FOUND");
		assert_eq!(value["message"], "Not found: item 42");
	}
}
