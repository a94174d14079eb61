//! Analysis request and result model.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::{Error, Result};

/// Parameters of `analysis_engine.Analyze`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
	pub label_selector: String,
	/// Restricts the run to these files. `None` analyzes the whole workspace.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub included_paths: Option<BTreeSet<PathBuf>>,
	#[serde(default)]
	pub reset_cache: bool,
}

impl AnalysisRequest {
	pub fn full(label_selector: impl Into<String>) -> Self {
		Self {
			label_selector: label_selector.into(),
			included_paths: None,
			reset_cache: false,
		}
	}

	pub fn partial(label_selector: impl Into<String>, paths: impl IntoIterator<Item = PathBuf>) -> Self {
		Self {
			label_selector: label_selector.into(),
			included_paths: Some(paths.into_iter().collect()),
			reset_cache: false,
		}
	}

	pub fn with_reset_cache(mut self, reset_cache: bool) -> Self {
		self.reset_cache = reset_cache;
		self
	}

	pub fn is_partial(&self) -> bool {
		self.included_paths.is_some()
	}
}

/// Result of `analysis_engine.Analyze`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
	#[serde(rename = "Rulesets")]
	pub rulesets: Vec<RuleSet>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
	pub name: String,
	#[serde(default)]
	pub violations: BTreeMap<String, Violation>,
	#[serde(flatten)]
	pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Violation {
	#[serde(default)]
	pub description: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub category: Option<String>,
	#[serde(default)]
	pub incidents: Vec<Incident>,
	#[serde(flatten)]
	pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
	pub uri: String,
	#[serde(default)]
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub line_number: Option<u32>,
	#[serde(flatten)]
	pub extra: Map<String, JsonValue>,
}

impl Incident {
	/// Local file the incident points at, if its URI is a `file:` URL.
	pub fn path(&self) -> Option<PathBuf> {
		let url = url::Url::parse(&self.uri).ok()?;
		if url.scheme() != "file" {
			return None;
		}
		url.to_file_path().ok()
	}

	fn is_in(&self, paths: &BTreeSet<PathBuf>) -> bool {
		self.path().is_some_and(|p| paths.contains(&p))
	}
}

impl AnalysisResponse {
	/// Decodes a raw result, rejecting anything that is not `{"Rulesets": [...]}`.
	///
	/// A `null` ruleset list is read as empty.
	pub fn from_value(value: JsonValue) -> Result<Self> {
		let JsonValue::Object(mut object) = value else {
			return Err(Error::MalformedResponse(format!("expected an object, got {}", type_name(&value))));
		};
		let rulesets = match object.remove("Rulesets") {
			None => return Err(Error::MalformedResponse("missing `Rulesets`".into())),
			Some(JsonValue::Null) => Vec::new(),
			Some(rulesets @ JsonValue::Array(_)) => {
				serde_json::from_value(rulesets).map_err(|e| Error::MalformedResponse(format!("invalid ruleset: {e}")))?
			}
			Some(other) => {
				return Err(Error::MalformedResponse(format!("`Rulesets` must be a list, got {}", type_name(&other))));
			}
		};
		Ok(Self { rulesets })
	}

	/// Counts incidents, optionally only those in `paths`.
	pub fn count_incidents(&self, paths: Option<&BTreeSet<PathBuf>>) -> usize {
		self.incidents().filter(|incident| paths.is_none_or(|paths| incident.is_in(paths))).count()
	}

	pub fn incidents(&self) -> impl Iterator<Item = &Incident> {
		self.rulesets
			.iter()
			.flat_map(|rs| rs.violations.values())
			.flat_map(|v| v.incidents.iter())
	}

	/// Incidents in one file.
	pub fn incidents_for(&self, path: &Path) -> Vec<&Incident> {
		self.incidents().filter(|i| i.path().as_deref() == Some(path)).collect()
	}

	/// Replaces every incident in `paths` with the incidents from `partial`.
	///
	/// Violations left without incidents are dropped; rulesets and violations only present in
	/// `partial` are added.
	pub fn merge_partial(&mut self, partial: &AnalysisResponse, paths: &BTreeSet<PathBuf>) {
		for ruleset in &mut self.rulesets {
			for violation in ruleset.violations.values_mut() {
				violation.incidents.retain(|incident| !incident.is_in(paths));
			}
			ruleset.violations.retain(|_, violation| !violation.incidents.is_empty());
		}

		for update in &partial.rulesets {
			let index = match self.rulesets.iter().position(|rs| rs.name == update.name) {
				Some(index) => index,
				None => {
					self.rulesets.push(RuleSet {
						name: update.name.clone(),
						violations: BTreeMap::new(),
						extra: update.extra.clone(),
					});
					self.rulesets.len() - 1
				}
			};
			let target = &mut self.rulesets[index];
			for (id, violation) in &update.violations {
				if violation.incidents.is_empty() {
					continue;
				}
				target
					.violations
					.entry(id.clone())
					.or_insert_with(|| Violation {
						incidents: Vec::new(),
						..violation.clone()
					})
					.incidents
					.extend(violation.incidents.iter().cloned());
			}
		}
	}
}

fn type_name(value: &JsonValue) -> &'static str {
	match value {
		JsonValue::Null => "null",
		JsonValue::Bool(_) => "a boolean",
		JsonValue::Number(_) => "a number",
		JsonValue::String(_) => "a string",
		JsonValue::Array(_) => "a list",
		JsonValue::Object(_) => "an object",
	}
}

/// Incident counts for the files of a partial run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartialSummary {
	/// Incidents in these files according to the previous results.
	pub before: usize,
	/// Incidents in these files after this run.
	pub after: usize,
	pub paths: BTreeSet<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
	pub response: AnalysisResponse,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub partial: Option<PartialSummary>,
}

/// How an analysis run ended from the caller's side.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
	Completed(AnalysisReport),
	/// The caller stopped waiting. The analyzer may still finish the run.
	Cancelled,
}

impl AnalysisOutcome {
	pub fn report(&self) -> Option<&AnalysisReport> {
		match self {
			Self::Completed(report) => Some(report),
			Self::Cancelled => None,
		}
	}
}
