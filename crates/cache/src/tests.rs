use std::sync::atomic::{AtomicUsize, Ordering};

use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};

use super::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Answer {
	diff: String,
	score: u32,
}

fn conversation() -> ModelInput {
	ModelInput::Messages(vec![
		MessageLike::Tuple(Role::System, "You fix Java code.".into()),
		MessageLike::Text("Replace javax with jakarta".into()),
	])
}

#[tokio::test]
async fn json_cache_misses_then_hits() {
	let dir = tempfile::tempdir().unwrap();
	let cache = JsonCache::new(dir.path());
	let input = conversation();
	let output = serde_json::json!({ "diff": "--- a\n+++ b", "score": 3 });

	assert_eq!(cache.lookup(&input, "get_solution").await, None);

	let entry = cache.update(&input, "get_solution", &output).await.unwrap();
	assert_eq!(entry, dir.path().join("get_solution").join(CacheKey::for_input(&input).as_str()));
	assert_eq!(cache.lookup(&input, "get_solution").await, Some(output));

	// Namespaces are separate.
	assert_eq!(cache.lookup(&input, "other").await, None);
}

#[tokio::test]
async fn json_cache_layout() {
	let dir = tempfile::tempdir().unwrap();
	let cache = JsonCache::new(dir.path());
	let input = ModelInput::from("hello");

	let entry = cache.update(&input, "ns", &serde_json::json!("world")).await.unwrap();
	assert_eq!(entry, dir.path().join("ns").join("311004f03743b668"));

	let stored_input: serde_json::Value = serde_json::from_slice(&std::fs::read(entry.join("input.json")).unwrap()).unwrap();
	assert_eq!(stored_input, serde_json::json!([{ "role": "human", "content": "hello" }]));

	let stored_output: serde_json::Value = serde_json::from_slice(&std::fs::read(entry.join("output.json")).unwrap()).unwrap();
	assert_eq!(stored_output["output"], serde_json::json!("world"));
	assert!(stored_output["cached_at"].is_string());

	let leftovers: Vec<_> = std::fs::read_dir(&entry)
		.unwrap()
		.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
		.filter(|name| name.ends_with(".tmp"))
		.collect();
	assert!(leftovers.is_empty(), "temporary files left behind: {leftovers:?}");
}

#[tokio::test]
async fn equivalent_inputs_hit_the_same_entry() {
	let dir = tempfile::tempdir().unwrap();
	let cache = JsonCache::new(dir.path());

	cache.update(&"hello".into(), "ns", &serde_json::json!(1)).await.unwrap();
	let tuple = ModelInput::Messages(vec![MessageLike::Tuple(Role::Human, "hello".into())]);
	assert_eq!(cache.lookup(&tuple, "ns").await, Some(serde_json::json!(1)));
}

#[tokio::test]
async fn corrupt_entry_reads_as_miss() {
	let dir = tempfile::tempdir().unwrap();
	let cache = JsonCache::new(dir.path());
	let input = ModelInput::from("hello");

	let entry = cache.update(&input, "ns", &serde_json::json!(1)).await.unwrap();
	std::fs::write(entry.join("output.json"), b"{ not json").unwrap();
	assert_eq!(cache.lookup(&input, "ns").await, None);

	// A fresh update repairs it.
	cache.update(&input, "ns", &serde_json::json!(2)).await.unwrap();
	assert_eq!(cache.lookup(&input, "ns").await, Some(serde_json::json!(2)));
}

#[tokio::test]
async fn path_like_namespaces_are_rejected() {
	let dir = tempfile::tempdir().unwrap();
	let cache = JsonCache::new(dir.path().join("cache"));
	let input = ModelInput::from("hello");

	for namespace in ["", "..", "a/b", "a\\b"] {
		assert_eq!(cache.update(&input, namespace, &serde_json::json!(1)).await, None, "{namespace:?}");
		assert_eq!(cache.lookup(&input, namespace).await, None);
	}
	assert!(!dir.path().join("cache").exists());
}

#[tokio::test]
async fn unwritable_base_dir_is_not_fatal() {
	let dir = tempfile::tempdir().unwrap();
	let blocker = dir.path().join("file");
	std::fs::write(&blocker, b"").unwrap();
	let cache = JsonCache::new(&blocker);

	assert_eq!(cache.update(&"hello".into(), "ns", &serde_json::json!(1)).await, None);
	assert_eq!(cache.lookup(&"hello".into(), "ns").await, None);
}

#[tokio::test]
async fn noop_cache_never_stores() {
	let input = ModelInput::from("hello");
	assert_eq!(NoopCache.update(&input, "ns", &serde_json::json!(1)).await, None);
	assert_eq!(NoopCache.lookup(&input, "ns").await, None);
}

#[tokio::test]
async fn trace_cache_writes_text_and_never_hits() {
	let dir = tempfile::tempdir().unwrap();
	let tracer = TraceCache::new(dir.path());
	let input = conversation();

	let entry = tracer.update(&input, "get_solution", &serde_json::json!({ "score": 1 })).await.unwrap();
	let rendered_input = std::fs::read_to_string(entry.join("input.txt")).unwrap();
	assert_eq!(rendered_input, "[system]\nYou fix Java code.\n\n[human]\nReplace javax with jakarta\n\n");
	let rendered_output = std::fs::read_to_string(entry.join("output.txt")).unwrap();
	assert_eq!(rendered_output, "{\n  \"score\": 1\n}");

	assert_eq!(tracer.lookup(&input, "get_solution").await, None);
}

#[tokio::test]
async fn lookup_as_treats_shape_mismatch_as_miss() {
	let dir = tempfile::tempdir().unwrap();
	let cache = JsonCache::new(dir.path());
	let input = ModelInput::from("hello");

	cache.update(&input, "ns", &serde_json::json!({ "diff": "x", "score": 1 })).await.unwrap();
	let hit: Option<Answer> = lookup_as(&cache, &input, "ns").await;
	assert_eq!(hit, Some(Answer { diff: "x".into(), score: 1 }));

	cache.update(&input, "ns", &serde_json::json!("just text")).await.unwrap();
	let miss: Option<Answer> = lookup_as(&cache, &input, "ns").await;
	assert_eq!(miss, None);
}

#[tokio::test]
async fn get_or_compute_runs_compute_once() {
	let dir = tempfile::tempdir().unwrap();
	let cache = JsonCache::new(dir.path());
	let input = conversation();
	let calls = AtomicUsize::new(0);

	for _ in 0..2 {
		let answer = get_or_compute(&cache, &input, "get_solution", || async {
			calls.fetch_add(1, Ordering::SeqCst);
			Ok::<_, std::io::Error>(Answer { diff: "+jakarta".into(), score: 7 })
		})
		.await
		.unwrap();
		assert_eq!(answer.score, 7);
	}
	assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn get_or_compute_passes_errors_through_and_stores_nothing() {
	let dir = tempfile::tempdir().unwrap();
	let cache = JsonCache::new(dir.path());
	let input = ModelInput::from("hello");

	let result: Result<Answer, &str> = get_or_compute(&cache, &input, "ns", || async { Err("backend down") }).await;
	assert_eq!(result, Err("backend down"));
	assert_eq!(cache.lookup(&input, "ns").await, None);
}

#[tokio::test]
async fn cache_set_follows_config() {
	let dir = tempfile::tempdir().unwrap();
	let config: CacheConfig = serde_json::from_value(serde_json::json!({
		"enabled": true,
		"dir": dir.path().join("cache"),
	}))
	.unwrap();
	assert!(!config.trace_enabled);
	assert_eq!(config.trace_dir, CacheConfig::default().trace_dir);

	let set = CacheSet::from_config(&config);
	let input = ModelInput::from("hello");
	set.cache.update(&input, "ns", &serde_json::json!(1)).await.unwrap();
	assert_eq!(set.cache.lookup(&input, "ns").await, Some(serde_json::json!(1)));
	assert_eq!(set.tracer.update(&input, "ns", &serde_json::json!(1)).await, None);

	let disabled = CacheSet::disabled();
	assert_eq!(disabled.cache.update(&input, "ns", &serde_json::json!(1)).await, None);
}
