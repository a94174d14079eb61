//! Method names and id generation shared by both sides of a connection.

use crate::types::RequestId;

/// JSON-RPC version tag written on every outbound message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Simple counter-based ID generator.
///
/// Owned by the pump task, so ids are unique per connection and assigned in write order.
#[derive(Debug, Default, Clone, Copy)]
pub struct CounterIdGen(pub i64);

impl CounterIdGen {
	/// Creates a new counter starting at 0.
	#[must_use]
	pub const fn new() -> Self {
		Self(0)
	}

	/// Generates the next unique ID and increments the counter.
	#[allow(clippy::should_implement_trait, reason = "convention")]
	pub fn next(&mut self) -> RequestId {
		let id = self.0;
		self.0 += 1;
		RequestId::Number(id)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ids_are_sequential() {
		let mut ids = CounterIdGen::new();
		assert_eq!(ids.next(), RequestId::Number(0));
		assert_eq!(ids.next(), RequestId::Number(1));
		assert_eq!(ids.next(), RequestId::Number(2));
	}
}
