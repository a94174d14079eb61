use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
	System,
	Human,
	Assistant,
	Tool,
}

impl Role {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::System => "system",
			Self::Human => "human",
			Self::Assistant => "assistant",
			Self::Tool => "tool",
		}
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub role: Role,
	pub content: String,
}

impl ChatMessage {
	pub fn new(role: Role, content: impl Into<String>) -> Self {
		Self {
			role,
			content: content.into(),
		}
	}
}

/// One entry of a message list, in any of the accepted spellings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageLike {
	Message(ChatMessage),
	/// `["human", "text"]`
	Tuple(Role, String),
	/// Bare text, read as a human message.
	Text(String),
}

impl MessageLike {
	fn into_message(self) -> ChatMessage {
		match self {
			Self::Message(msg) => msg,
			Self::Tuple(role, content) => ChatMessage { role, content },
			Self::Text(content) => ChatMessage::new(Role::Human, content),
		}
	}
}

/// Everything a model call may be invoked with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelInput {
	Text(String),
	Message(ChatMessage),
	Messages(Vec<MessageLike>),
}

impl ModelInput {
	/// Reduces the input to its canonical message list.
	///
	/// Inputs that mean the same conversation normalize to equal lists and therefore share a key.
	pub fn normalize(&self) -> Vec<ChatMessage> {
		match self {
			Self::Text(text) => vec![ChatMessage::new(Role::Human, text.clone())],
			Self::Message(msg) => vec![msg.clone()],
			Self::Messages(items) => items.iter().cloned().map(MessageLike::into_message).collect(),
		}
	}
}

impl From<&str> for ModelInput {
	fn from(text: &str) -> Self {
		Self::Text(text.to_owned())
	}
}

impl From<String> for ModelInput {
	fn from(text: String) -> Self {
		Self::Text(text)
	}
}

impl From<Vec<ChatMessage>> for ModelInput {
	fn from(messages: Vec<ChatMessage>) -> Self {
		Self::Messages(messages.into_iter().map(MessageLike::Message).collect())
	}
}

const KEY_LEN: usize = 16;

/// Hex prefix of the SHA-256 digest of a normalized input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
	pub fn for_input(input: &ModelInput) -> Self {
		Self::for_messages(&input.normalize())
	}

	pub fn for_messages(messages: &[ChatMessage]) -> Self {
		// A Vec of plain structs always serializes.
		let json = serde_json::to_vec(messages).unwrap_or_default();
		let mut key = format!("{:x}", Sha256::digest(&json));
		key.truncate(KEY_LEN);
		Self(key)
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for CacheKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn every_spelling_normalizes_to_messages() {
		let input: ModelInput = serde_json::from_value(serde_json::json!([
			{ "role": "system", "content": "be brief" },
			["assistant", "ok"],
			"hello",
		]))
		.unwrap();

		assert_eq!(
			input.normalize(),
			vec![
				ChatMessage::new(Role::System, "be brief"),
				ChatMessage::new(Role::Assistant, "ok"),
				ChatMessage::new(Role::Human, "hello"),
			]
		);
	}

	#[test]
	fn plain_text_parses_as_text() {
		let input: ModelInput = serde_json::from_value(serde_json::json!("hello")).unwrap();
		assert_eq!(input, ModelInput::Text("hello".into()));

		let input: ModelInput = serde_json::from_value(serde_json::json!({ "role": "tool", "content": "{}" })).unwrap();
		assert_eq!(input, ModelInput::Message(ChatMessage::new(Role::Tool, "{}")));
	}

	#[test]
	fn key_is_sha256_prefix_of_normalized_json() {
		assert_eq!(CacheKey::for_input(&"hello".into()).as_str(), "311004f03743b668");

		let convo = ModelInput::Messages(vec![
			MessageLike::Tuple(Role::System, "be brief".into()),
			MessageLike::Text("hello".into()),
		]);
		assert_eq!(CacheKey::for_input(&convo).to_string(), "b1b1ff6746e13ab8");
	}

	#[test]
	fn equivalent_inputs_share_a_key() {
		let text = ModelInput::from("hello");
		let tuple = ModelInput::Messages(vec![MessageLike::Tuple(Role::Human, "hello".into())]);
		let message = ModelInput::Message(ChatMessage::new(Role::Human, "hello"));

		assert_eq!(CacheKey::for_input(&text), CacheKey::for_input(&tuple));
		assert_eq!(CacheKey::for_input(&text), CacheKey::for_input(&message));
		assert_ne!(CacheKey::for_input(&text), CacheKey::for_input(&"hello!".into()));
	}
}
