//! JSON-RPC 2.0 message pump for talking to a child process over a byte stream.
//!
//! The crate is split into three layers:
//! * [`types`]: request, response and notification envelopes.
//! * [`message`]: `Content-Length` framed encoding of a single [`Message`].
//! * [`connection`]: a [`Connection`] handle backed by one pump task that serializes
//!   outbound writes, correlates responses to requests and forwards inbound notifications.
//!
//! Framing follows the header convention shared with LSP:
//!
//! ```text
//! Content-Length: 52\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":0,"method":"ping","params":{}}
//! ```

#![warn(missing_docs)]

use std::io;

pub mod connection;
pub mod message;
pub mod protocol;
pub mod types;

pub use connection::{Connection, NotificationReceiver};
pub use message::Message;
pub use protocol::CounterIdGen;
pub use types::{AnyNotification, AnyRequest, AnyResponse, ErrorCode, RequestId, ResponseError};

/// A convenient type alias for `Result` with `E` = [`enum@crate::Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Possible errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// The pump task stopped, either because the peer hung up or the connection was disposed.
	#[error("service stopped")]
	ServiceStopped,
	/// The peer sent undecodable JSON, or a payload could not be encoded.
	#[error("deserialization failed: {0}")]
	Deserialize(#[from] serde_json::Error),
	/// The peer replied with an error object.
	#[error("{0}")]
	Response(#[from] ResponseError),
	/// The peer violated the framing or message conventions.
	#[error("protocol error: {0}")]
	Protocol(String),
	/// A well-framed message that cannot be routed, such as an error reply with a null `id`.
	#[error("unroutable message: {0}")]
	Unroutable(String),
	/// Input/output errors from the underlying stream.
	#[error("{0}")]
	Io(#[from] io::Error),
	/// No response arrived within the caller's deadline.
	#[error("request timed out: {0}")]
	RequestTimeout(String),
}
