//! JSON-RPC envelopes.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Request identifier. The pump only ever assigns numbers, but peers may use strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
	/// Numeric id.
	Number(i64),
	/// String id.
	String(String),
}

impl fmt::Display for RequestId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Number(n) => write!(f, "{n}"),
			Self::String(s) => write!(f, "{s:?}"),
		}
	}
}

/// A request with an untyped payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyRequest {
	/// Correlation id, assigned by the pump for outbound requests.
	pub id: RequestId,
	/// Method name.
	pub method: String,
	/// Parameters.
	#[serde(default)]
	pub params: JsonValue,
}

/// A notification with an untyped payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyNotification {
	/// Method name.
	pub method: String,
	/// Parameters.
	#[serde(default)]
	pub params: JsonValue,
}

/// A response to a previously sent request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyResponse {
	/// Id of the request this answers.
	pub id: RequestId,
	/// Result payload on success.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<JsonValue>,
	/// Error payload on failure.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<ResponseError>,
}

impl AnyResponse {
	/// Converts the response into a `Result`, treating a missing result as `null`.
	pub fn into_result(self) -> Result<JsonValue, ResponseError> {
		match self.error {
			Some(err) => Err(err),
			None => Ok(self.result.unwrap_or(JsonValue::Null)),
		}
	}
}

/// Standard JSON-RPC error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
	/// Invalid JSON was received.
	pub const PARSE_ERROR: Self = Self(-32700);
	/// The JSON sent is not a valid request object.
	pub const INVALID_REQUEST: Self = Self(-32600);
	/// The method does not exist or is not available.
	pub const METHOD_NOT_FOUND: Self = Self(-32601);
	/// Invalid method parameters.
	pub const INVALID_PARAMS: Self = Self(-32602);
	/// Internal JSON-RPC error.
	pub const INTERNAL_ERROR: Self = Self(-32603);
}

impl fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ResponseError {
	/// Error code.
	pub code: ErrorCode,
	/// Human readable message.
	pub message: String,
	/// Optional structured details.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<JsonValue>,
}

impl ResponseError {
	/// Creates an error without extra data.
	pub fn new(code: ErrorCode, message: impl fmt::Display) -> Self {
		Self {
			code,
			message: message.to_string(),
			data: None,
		}
	}
}
