//! End-to-end registry behavior against the in-memory store.

use std::sync::Arc;

use corral_resilience::{CircuitBreaker, CircuitBreakerConfig, RetryConfig};
use corral_schema::{
    CompatibilityMode, DataCategory, FieldSchema, FieldType, Schema, SchemaRegistry,
};
use corral_protocol::CoreError;
use corral_store::{MemoryBackend, Store};
use serde_json::json;

fn test_store() -> Store {
    Store::with_breaker(
        Arc::new(MemoryBackend::new()),
        Arc::new(CircuitBreaker::new(
            "registry-test",
            CircuitBreakerConfig::default(),
        )),
        RetryConfig {
            max_retries: 0,
            ..Default::default()
        },
    )
}

fn v1_schema() -> Schema {
    Schema::new(vec![
        FieldSchema::new("title", FieldType::String).required(),
        FieldSchema::new("content", FieldType::String),
    ])
}

#[tokio::test]
async fn backward_compatible_addition_bumps_version() {
    let registry = SchemaRegistry::new(test_store());

    let (v1, _) = registry
        .register("src1", v1_schema(), "ops", "initial", CompatibilityMode::Backward, vec![])
        .await
        .unwrap();
    assert_eq!(v1.version, 1);

    let mut v2_schema = v1_schema();
    v2_schema
        .add_field(FieldSchema::new("author", FieldType::String).with_default(json!(null)))
        .unwrap();

    let (v2, result) = registry
        .register("src1", v2_schema, "ops", "add author", CompatibilityMode::Backward, vec![])
        .await
        .unwrap();

    assert_eq!(v2.version, 2);
    assert!(result.is_compatible);
    assert!(result.errors().is_empty());
}

#[tokio::test]
async fn incompatible_schema_is_rejected_without_write() {
    let registry = SchemaRegistry::new(test_store());
    registry
        .register("src1", v1_schema(), "ops", "initial", CompatibilityMode::Backward, vec![])
        .await
        .unwrap();

    let mut bad = v1_schema();
    bad.add_field(FieldSchema::new("author", FieldType::String).required())
        .unwrap();

    let err = registry
        .register("src1", bad, "ops", "bad", CompatibilityMode::Backward, vec![])
        .await
        .unwrap_err();

    match err {
        CoreError::SchemaIncompatible { mode, issues } => {
            assert_eq!(mode, "backward");
            assert!(issues.iter().any(|i| i.starts_with("author:")));
        }
        other => panic!("unexpected error: {other}"),
    }

    // No new version was inserted
    let versions = registry.get_versions("src1", true).await.unwrap();
    assert_eq!(versions.len(), 1);
}

#[tokio::test]
async fn identical_content_reuses_the_existing_version() {
    let registry = SchemaRegistry::new(test_store());
    let (v1, _) = registry
        .register("src1", v1_schema(), "ops", "initial", CompatibilityMode::Backward, vec![])
        .await
        .unwrap();

    let (again, result) = registry
        .register("src1", v1_schema(), "ops", "same", CompatibilityMode::Backward, vec![])
        .await
        .unwrap();

    assert_eq!(again.version, v1.version);
    assert!(result.issues.is_empty());
    assert_eq!(registry.get_versions("src1", true).await.unwrap().len(), 1);
}

#[tokio::test]
async fn versions_stay_contiguous_across_sources_and_deprecation() {
    let registry = SchemaRegistry::new(test_store());

    for (i, extra) in ["a", "b", "c"].iter().enumerate() {
        let mut schema = v1_schema();
        schema
            .add_field(FieldSchema::new(*extra, FieldType::String))
            .unwrap();
        let (version, _) = registry
            .register("src1", schema, "ops", "grow", CompatibilityMode::Backward, vec![])
            .await
            .unwrap();
        assert_eq!(version.version, (i + 1) as u32);
    }

    // Other sources number independently
    let (other, _) = registry
        .register("src2", v1_schema(), "ops", "initial", CompatibilityMode::Backward, vec![])
        .await
        .unwrap();
    assert_eq!(other.version, 1);

    // Deprecating the latest does not make numbering reuse it
    assert!(registry.deprecate("src1", 3, "superseded").await.unwrap());
    let mut schema = v1_schema();
    schema
        .add_field(FieldSchema::new("d", FieldType::String))
        .unwrap();
    let (next, _) = registry
        .register("src1", schema, "ops", "after deprecate", CompatibilityMode::Backward, vec![])
        .await
        .unwrap();
    assert_eq!(next.version, 4);

    let versions = registry.get_versions("src1", true).await.unwrap();
    let numbers: Vec<u32> = versions.iter().map(|v| v.version).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn get_prefers_highest_active_version() {
    let registry = SchemaRegistry::new(test_store());
    registry
        .register("src1", v1_schema(), "ops", "v1", CompatibilityMode::Backward, vec![])
        .await
        .unwrap();
    let mut grown = v1_schema();
    grown
        .add_field(FieldSchema::new("author", FieldType::String))
        .unwrap();
    registry
        .register("src1", grown, "ops", "v2", CompatibilityMode::Backward, vec![])
        .await
        .unwrap();

    registry.deprecate("src1", 2, "bad rollout").await.unwrap();

    let current = registry.get("src1", None).await.unwrap().unwrap();
    assert_eq!(current.version, 1);

    let explicit = registry.get("src1", Some(2)).await.unwrap().unwrap();
    assert!(!explicit.is_active);
    assert_eq!(explicit.deprecated_reason.as_deref(), Some("bad rollout"));
}

#[tokio::test]
async fn drift_detection_flags_type_changes() {
    let registry = SchemaRegistry::new(test_store());
    registry
        .register("src1", v1_schema(), "ops", "v1", CompatibilityMode::Backward, vec![])
        .await
        .unwrap();

    // Live data drifted: title became numeric, content disappeared
    let sample: Vec<serde_json::Value> = (0..20)
        .map(|i| json!({"title": i, "extra": "x"}))
        .collect();

    let drift = registry.detect_drift("src1", &sample).await.unwrap();
    assert!(!drift.is_compatible);
    assert!(drift
        .issues
        .iter()
        .any(|i| i.field_name == "title"));
}

#[tokio::test]
async fn category_registration_and_compare() {
    let registry = SchemaRegistry::new(test_store());
    registry
        .register_for_category("src1", DataCategory::NewsArticle, "ops", vec![])
        .await
        .unwrap();

    let mut grown = corral_schema::default_schema(DataCategory::NewsArticle);
    grown
        .add_field(FieldSchema::new("sentiment", FieldType::Float))
        .unwrap();
    registry
        .register("src1", grown, "ops", "add sentiment", CompatibilityMode::Backward, vec![])
        .await
        .unwrap();

    let diff = registry.compare("src1", 1, 2).await.unwrap();
    assert_eq!(diff["changes"]["added_fields"][0], "sentiment");
    assert!(diff["changes"]["removed_fields"].as_array().unwrap().is_empty());
}
