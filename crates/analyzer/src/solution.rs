use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::analysis::Incident;

/// How hard the solver may work on a fix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffortLevel {
	#[default]
	Low,
	Medium,
	High,
	Maximum,
}

/// Solver limits derived from an [`EffortLevel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffortLimits {
	pub max_priority: u32,
	pub max_depth: u32,
	pub max_iterations: u32,
}

impl EffortLevel {
	pub const ALL: [Self; 4] = [Self::Low, Self::Medium, Self::High, Self::Maximum];

	pub const fn limits(self) -> EffortLimits {
		let (max_priority, max_depth, max_iterations) = match self {
			Self::Low => (0, 0, 1),
			Self::Medium => (0, 1, 2),
			Self::High => (1, 2, 4),
			Self::Maximum => (2, 3, 8),
		};
		EffortLimits {
			max_priority,
			max_depth,
			max_iterations,
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Low => "low",
			Self::Medium => "medium",
			Self::High => "high",
			Self::Maximum => "maximum",
		}
	}
}

impl fmt::Display for EffortLevel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown effort level {0:?} (expected low, medium, high or maximum)")]
pub struct ParseEffortError(String);

impl FromStr for EffortLevel {
	type Err = ParseEffortError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::ALL
			.into_iter()
			.find(|level| level.as_str().eq_ignore_ascii_case(s))
			.ok_or_else(|| ParseEffortError(s.to_owned()))
	}
}

/// What to fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionParams {
	pub file_path: PathBuf,
	pub incidents: Vec<Incident>,
}

/// Parameters of `getCodeplanAgentSolution`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionRequest {
	pub file_path: PathBuf,
	pub incidents: Vec<Incident>,
	pub max_priority: u32,
	pub max_depth: u32,
	pub max_iterations: u32,
	/// Correlates `my_progress` notifications with this request.
	pub chat_token: String,
}

impl SolutionRequest {
	pub fn new(params: SolutionParams, effort: EffortLevel, chat_token: impl Into<String>) -> Self {
		let limits = effort.limits();
		Self {
			file_path: params.file_path,
			incidents: params.incidents,
			max_priority: limits.max_priority,
			max_depth: limits.max_depth,
			max_iterations: limits.max_iterations,
			chat_token: chat_token.into(),
		}
	}
}

/// Result of `getCodeplanAgentSolution`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Solution {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub diff: Option<String>,
	#[serde(default)]
	pub modified_files: Vec<String>,
	#[serde(default)]
	pub encountered_errors: Vec<String>,
	#[serde(flatten)]
	pub extra: Map<String, JsonValue>,
}

/// One `my_progress` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
	#[serde(default, alias = "chatToken", skip_serializing_if = "Option::is_none")]
	pub chat_token: Option<String>,
	#[serde(default)]
	pub kind: String,
	#[serde(default)]
	pub value: JsonValue,
}

impl ProgressEvent {
	/// Returns true if the event belongs to the request with `chat_token`, or to no request.
	pub fn belongs_to(&self, chat_token: &str) -> bool {
		self.chat_token.as_deref().is_none_or(|token| token == chat_token)
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn effort_limits_grow_with_level() {
		let iterations: Vec<_> = EffortLevel::ALL.iter().map(|l| l.limits().max_iterations).collect();
		assert_eq!(iterations, vec![1, 2, 4, 8]);
		assert_eq!(
			EffortLevel::High.limits(),
			EffortLimits {
				max_priority: 1,
				max_depth: 2,
				max_iterations: 4
			}
		);
	}

	#[test]
	fn effort_parses_case_insensitively() {
		assert_eq!("Maximum".parse::<EffortLevel>(), Ok(EffortLevel::Maximum));
		assert_eq!("low".parse::<EffortLevel>(), Ok(EffortLevel::Low));
		assert!("extreme".parse::<EffortLevel>().is_err());
	}

	#[test]
	fn request_wire_shape() {
		let incident: Incident = serde_json::from_value(serde_json::json!({
			"uri": "file:///w/A.java",
			"message": "Replace javax",
			"lineNumber": 4,
		}))
		.unwrap();
		let request = SolutionRequest::new(
			SolutionParams {
				file_path: "/w/A.java".into(),
				incidents: vec![incident],
			},
			EffortLevel::Medium,
			"tok-1",
		);

		assert_eq!(
			serde_json::to_value(&request).unwrap(),
			serde_json::json!({
				"file_path": "/w/A.java",
				"incidents": [{ "uri": "file:///w/A.java", "message": "Replace javax", "lineNumber": 4 }],
				"max_priority": 0,
				"max_depth": 1,
				"max_iterations": 2,
				"chat_token": "tok-1",
			})
		);
	}

	#[test]
	fn progress_accepts_both_token_spellings() {
		let camel: ProgressEvent = serde_json::from_value(serde_json::json!({ "chatToken": "a", "kind": "LLMResponseChunk", "value": "x" })).unwrap();
		let snake: ProgressEvent = serde_json::from_value(serde_json::json!({ "chat_token": "a", "kind": "LLMResponseChunk", "value": "x" })).unwrap();
		assert_eq!(camel, snake);
		assert!(camel.belongs_to("a"));
		assert!(!camel.belongs_to("b"));

		let untagged: ProgressEvent = serde_json::from_value(serde_json::json!({ "kind": "Status" })).unwrap();
		assert!(untagged.belongs_to("b"));
	}

	#[test]
	fn solution_keeps_unknown_fields() {
		let solution: Solution = serde_json::from_value(serde_json::json!({
			"diff": "--- a/A.java\n+++ b/A.java",
			"modified_files": ["A.java"],
			"encountered_errors": [],
			"scores": { "A.java": 0.9 },
		}))
		.unwrap();
		assert_eq!(solution.modified_files, vec!["A.java"]);
		assert_eq!(solution.extra["scores"]["A.java"], 0.9);
	}
}
