//! `Content-Length` framed JSON-RPC messages.

use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::JSONRPC_VERSION;
use crate::types::{AnyNotification, AnyRequest, AnyResponse};
use crate::{Error, Result};

const CONTENT_LENGTH: &str = "content-length";

/// Largest body [`Message::read`] accepts.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// One decoded JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
	/// A request expecting a response.
	Request(AnyRequest),
	/// A response to an earlier request.
	Response(AnyResponse),
	/// A fire-and-forget notification.
	Notification(AnyNotification),
}

impl Message {
	/// Classifies a raw JSON object.
	///
	/// `method` + `id` is a request, `method` alone a notification and `id` alone a response.
	/// Anything else, including an error reply with a null `id`, is [`Error::Unroutable`].
	pub fn from_value(value: JsonValue) -> Result<Self> {
		let has_method = value.get("method").is_some();
		let has_id = value.get("id").is_some_and(|id| !id.is_null());
		match (has_method, has_id) {
			(true, true) => Ok(Self::Request(serde_json::from_value(value)?)),
			(true, false) => Ok(Self::Notification(serde_json::from_value(value)?)),
			(false, true) => Ok(Self::Response(serde_json::from_value(value)?)),
			(false, false) => Err(Error::Unroutable(match value.get("error") {
				Some(error) => format!("error reply without an id: {error}"),
				None => "message has neither `method` nor `id`".into(),
			})),
		}
	}

	/// Renders the message as a JSON-RPC 2.0 object.
	pub fn to_value(&self) -> JsonValue {
		match self {
			Self::Request(req) => serde_json::json!({
				"jsonrpc": JSONRPC_VERSION,
				"id": req.id,
				"method": req.method,
				"params": req.params,
			}),
			Self::Notification(notif) => serde_json::json!({
				"jsonrpc": JSONRPC_VERSION,
				"method": notif.method,
				"params": notif.params,
			}),
			Self::Response(resp) => match &resp.error {
				Some(err) => serde_json::json!({
					"jsonrpc": JSONRPC_VERSION,
					"id": resp.id,
					"error": err,
				}),
				None => serde_json::json!({
					"jsonrpc": JSONRPC_VERSION,
					"id": resp.id,
					"result": resp.result.clone().unwrap_or(JsonValue::Null),
				}),
			},
		}
	}

	/// Reads one framed message.
	///
	/// Returns `Ok(None)` on a clean EOF before any header byte.
	pub async fn read(input: &mut (impl AsyncBufRead + Unpin)) -> Result<Option<Self>> {
		let mut line = String::new();
		let mut content_length: Option<usize> = None;
		let mut saw_header = false;

		loop {
			line.clear();
			if input.read_line(&mut line).await? == 0 {
				if saw_header {
					return Err(Error::Protocol("unexpected EOF inside message headers".into()));
				}
				return Ok(None);
			}

			let trimmed = line.trim();
			if trimmed.is_empty() {
				if saw_header {
					break;
				}
				continue;
			}

			saw_header = true;
			let Some((name, value)) = trimmed.split_once(':') else {
				return Err(Error::Protocol(format!("malformed header line: {trimmed:?}")));
			};
			if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
				let len = value
					.trim()
					.parse()
					.map_err(|_| Error::Protocol(format!("invalid Content-Length: {:?}", value.trim())))?;
				content_length = Some(len);
			}
		}

		let length = content_length.ok_or_else(|| Error::Protocol("missing Content-Length".into()))?;
		if length > MAX_FRAME_LEN {
			return Err(Error::Protocol(format!("Content-Length {length} exceeds {MAX_FRAME_LEN}")));
		}
		let mut body = vec![0u8; length];
		input.read_exact(&mut body).await?;

		let value: JsonValue = serde_json::from_slice(&body)?;
		Self::from_value(value).map(Some)
	}

	/// Writes one framed message and flushes the stream.
	pub async fn write(&self, output: &mut (impl AsyncWrite + Unpin)) -> Result<()> {
		let json = serde_json::to_string(&self.to_value())?;
		let header = format!("Content-Length: {}\r\n\r\n", json.len());
		output.write_all(header.as_bytes()).await?;
		output.write_all(json.as_bytes()).await?;
		output.flush().await?;
		Ok(())
	}
}
