//! Catalog and lineage behavior against the in-memory store.

use std::sync::Arc;

use corral_catalog::{
    DataCatalog, DatasetStatus, DatasetType, LineageService, NewDataset, QualityMetrics,
    RelationshipType, TagCategory,
};
use corral_protocol::collections as col;
use corral_protocol::CoreError;
use corral_resilience::{CircuitBreaker, CircuitBreakerConfig, RetryConfig};
use corral_store::{MemoryBackend, Store};
use serde_json::json;

fn test_store() -> Store {
    Store::with_breaker(
        Arc::new(MemoryBackend::new()),
        Arc::new(CircuitBreaker::new(
            "catalog-test",
            CircuitBreakerConfig::default(),
        )),
        RetryConfig {
            max_retries: 0,
            ..Default::default()
        },
    )
}

fn services(store: &Store) -> (Arc<DataCatalog>, LineageService) {
    let catalog = Arc::new(DataCatalog::new(store.clone()));
    let lineage = LineageService::new(store.clone(), catalog.clone());
    (catalog, lineage)
}

async fn make_dataset(catalog: &DataCatalog, name: &str) -> String {
    catalog
        .create_dataset(NewDataset::new(name, DatasetType::Transformed))
        .await
        .unwrap()
        .id
        .unwrap()
        .to_hex()
}

#[tokio::test]
async fn duplicate_dataset_name_rejected() {
    let store = test_store();
    let (catalog, _lineage) = services(&store);

    make_dataset(&catalog, "news").await;
    let err = catalog
        .create_dataset(NewDataset::new("news", DatasetType::Final))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::DuplicateName(_)));
}

#[tokio::test]
async fn columns_stay_in_sync_between_embedded_and_rows() {
    let store = test_store();
    let (catalog, _lineage) = services(&store);

    let mut new = NewDataset::new("prices", DatasetType::Final);
    new.columns = vec![
        corral_catalog::Column::new("_id", corral_catalog::ColumnType::String).primary_key(),
        corral_catalog::Column::new("price", corral_catalog::ColumnType::Float),
    ];
    let dataset = catalog.create_dataset(new).await.unwrap();
    let id = dataset.id.unwrap().to_hex();

    let rows = catalog.get_columns(&id).await.unwrap();
    assert_eq!(rows.len(), 2);

    catalog
        .add_column(
            &id,
            corral_catalog::Column::new("volume", corral_catalog::ColumnType::Integer),
        )
        .await
        .unwrap();

    let embedded = catalog.get_dataset(&id).await.unwrap().unwrap();
    assert_eq!(embedded.columns.len(), 3);
    assert_eq!(catalog.get_columns(&id).await.unwrap().len(), 3);

    // Duplicate column names are refused
    let err = catalog
        .add_column(
            &id,
            corral_catalog::Column::new("price", corral_catalog::ColumnType::Float),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::DuplicateField(_)));
}

#[tokio::test]
async fn tag_usage_counts_only_ever_grow() {
    let store = test_store();
    let (catalog, _lineage) = services(&store);
    let a = make_dataset(&catalog, "a").await;
    let b = make_dataset(&catalog, "b").await;

    catalog
        .create_tag("verified", TagCategory::Quality, "passed review", "ops")
        .await
        .unwrap();

    catalog
        .add_tags_to_dataset(&a, &["verified".to_string()])
        .await
        .unwrap();
    catalog
        .add_tags_to_dataset(&b, &["verified".to_string()])
        .await
        .unwrap();
    assert_eq!(catalog.get_tag("verified").await.unwrap().unwrap().usage_count, 2);

    // Detach does not decrement
    catalog
        .remove_tags_from_dataset(&a, &["verified".to_string()])
        .await
        .unwrap();
    assert_eq!(catalog.get_tag("verified").await.unwrap().unwrap().usage_count, 2);

    let dataset = catalog.get_dataset(&a).await.unwrap().unwrap();
    assert!(dataset.tags.is_empty());
}

#[tokio::test]
async fn quality_metrics_overall_recomputed_on_write() {
    let store = test_store();
    let (catalog, _lineage) = services(&store);
    let id = make_dataset(&catalog, "scored").await;

    let metrics = QualityMetrics {
        completeness: 1.0,
        accuracy: 1.0,
        consistency: 1.0,
        timeliness: 1.0,
        uniqueness: 1.0,
        validity: 1.0,
        overall_score: 0.0, // ignored, recomputed
        evaluated_at: None,
    };
    catalog.update_quality_metrics(&id, metrics).await.unwrap();

    let dataset = catalog.get_dataset(&id).await.unwrap().unwrap();
    assert_eq!(dataset.quality.unwrap().overall_score, 1.0);
}

#[tokio::test]
async fn register_existing_collections_infers_columns() {
    let store = test_store();
    let (catalog, _lineage) = services(&store);

    // A staging collection with mixed types and an occasional null
    for i in 0..10 {
        let price = if i == 3 { json!(null) } else { json!(100.5 + i as f64) };
        store
            .create(
                "staging_news",
                json!({"title": format!("t{i}"), "price": price}),
            )
            .await
            .unwrap();
    }

    let registered = catalog.register_existing_collections().await.unwrap();
    assert!(registered.iter().any(|d| d.collection_name == "staging_news"));

    let dataset = catalog
        .get_dataset_by_collection("staging_news")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dataset.dataset_type, DatasetType::Staging);

    let id_col = dataset.get_column("_id").unwrap();
    assert!(id_col.is_primary_key);
    let price = dataset.get_column("price").unwrap();
    assert!(price.nullable);
    let title = dataset.get_column("title").unwrap();
    assert!(!title.nullable);

    // Idempotent: nothing new on a second pass
    let again = catalog.register_existing_collections().await.unwrap();
    assert!(again.iter().all(|d| d.collection_name != "staging_news"));
}

#[tokio::test]
async fn dataset_status_transitions() {
    let store = test_store();
    let (catalog, _lineage) = services(&store);
    let id = make_dataset(&catalog, "lifecycle").await;

    let created = catalog.get_dataset(&id).await.unwrap().unwrap();
    assert_eq!(created.status, DatasetStatus::Draft);

    catalog
        .update_dataset_status(&id, DatasetStatus::Active)
        .await
        .unwrap();
    catalog
        .update_dataset_status(&id, DatasetStatus::Deprecated)
        .await
        .unwrap();
    let final_state = catalog.get_dataset(&id).await.unwrap().unwrap();
    assert_eq!(final_state.status, DatasetStatus::Deprecated);
}

#[tokio::test]
async fn self_loop_edges_rejected() {
    let store = test_store();
    let (catalog, lineage) = services(&store);
    let a = make_dataset(&catalog, "a").await;

    let err = lineage
        .create_edge(&a, &a, RelationshipType::DerivesFrom, None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::DatabaseOperation(_)));
}

#[tokio::test]
async fn edge_upsert_replaces_instead_of_duplicating() {
    let store = test_store();
    let (catalog, lineage) = services(&store);
    let a = make_dataset(&catalog, "a").await;
    let b = make_dataset(&catalog, "b").await;

    lineage
        .create_edge(&a, &b, RelationshipType::Copies, None, None, None)
        .await
        .unwrap();
    let updated = lineage
        .create_edge(&a, &b, RelationshipType::Aggregates, None, None, Some("job-7"))
        .await
        .unwrap();
    assert_eq!(updated.relationship, RelationshipType::Aggregates);

    assert_eq!(store.count(col::LINEAGE_EDGES, &json!({})).await.unwrap(), 1);

    // Dataset refs replaced, not appended
    let source = catalog.get_dataset(&a).await.unwrap().unwrap();
    assert_eq!(source.downstream.len(), 1);
    assert_eq!(source.downstream[0].relationship, "aggregates");
    let target = catalog.get_dataset(&b).await.unwrap().unwrap();
    assert_eq!(target.upstream.len(), 1);
}

#[tokio::test]
async fn impact_analysis_walks_downstream_chain() {
    let store = test_store();
    let (catalog, lineage) = services(&store);
    let a = make_dataset(&catalog, "a").await;
    let b = make_dataset(&catalog, "b").await;
    let c = make_dataset(&catalog, "c").await;

    lineage
        .create_edge(&a, &b, RelationshipType::DerivesFrom, None, None, None)
        .await
        .unwrap();
    lineage
        .create_edge(&b, &c, RelationshipType::Aggregates, None, None, None)
        .await
        .unwrap();

    let impact = lineage.analyze_impact(&a, false, 10).await.unwrap();
    assert_eq!(impact.total_affected, 2);

    let depth_of = |id: &str| {
        impact
            .affected_datasets
            .iter()
            .find(|d| d["id"] == id)
            .and_then(|d| d["depth"].as_u64())
            .unwrap()
    };
    assert_eq!(depth_of(&b), 1);
    assert_eq!(depth_of(&c), 2);

    assert_eq!(impact.critical_paths.len(), 1);
    assert_eq!(impact.critical_paths[0], vec![a.clone(), b.clone(), c.clone()]);
}

#[tokio::test]
async fn impact_analysis_handles_cycles() {
    let store = test_store();
    let (catalog, lineage) = services(&store);
    let a = make_dataset(&catalog, "a").await;
    let b = make_dataset(&catalog, "b").await;

    lineage
        .create_edge(&a, &b, RelationshipType::DerivesFrom, None, None, None)
        .await
        .unwrap();
    // Operators can create cycles; the walkers must not loop
    lineage
        .create_edge(&b, &a, RelationshipType::DerivesFrom, None, None, None)
        .await
        .unwrap();

    let impact = lineage.analyze_impact(&a, false, 10).await.unwrap();
    assert_eq!(impact.total_affected, 1);
    // No dataset id appears twice among the affected
    let ids: Vec<&str> = impact
        .affected_datasets
        .iter()
        .filter_map(|d| d["id"].as_str())
        .collect();
    let mut deduped = ids.clone();
    deduped.dedup();
    assert_eq!(ids.len(), deduped.len());
}

#[tokio::test]
async fn column_impacts_surface_mappings() {
    let store = test_store();
    let (catalog, lineage) = services(&store);
    let a = make_dataset(&catalog, "a").await;
    let b = make_dataset(&catalog, "b").await;

    let mut mappings = serde_json::Map::new();
    mappings.insert("total".into(), json!(["price", "quantity"]));
    lineage
        .create_edge(&a, &b, RelationshipType::Transforms, None, Some(mappings), None)
        .await
        .unwrap();

    let impact = lineage.analyze_impact(&a, true, 10).await.unwrap();
    assert_eq!(impact.column_impacts.len(), 1);
    assert_eq!(impact.column_impacts[0]["column"], "total");
    assert_eq!(impact.column_impacts[0]["dataset_id"], b.as_str());
}

#[tokio::test]
async fn paths_and_roots_and_leaves() {
    let store = test_store();
    let (catalog, lineage) = services(&store);
    let a = make_dataset(&catalog, "a").await;
    let b = make_dataset(&catalog, "b").await;
    let c = make_dataset(&catalog, "c").await;
    let d = make_dataset(&catalog, "d").await;

    // a -> b -> d and a -> c -> d
    for (src, tgt) in [(&a, &b), (&b, &d), (&a, &c), (&c, &d)] {
        lineage
            .create_edge(src, tgt, RelationshipType::DerivesFrom, None, None, None)
            .await
            .unwrap();
    }

    let paths = lineage.find_paths(&a, &d, 10).await.unwrap();
    assert_eq!(paths.len(), 2);
    assert!(paths.iter().all(|p| p.len() == 3));

    let shortest = lineage.shortest_path(&a, &d).await.unwrap().unwrap();
    assert_eq!(shortest.len(), 3);

    assert_eq!(lineage.find_root_sources(&d).await.unwrap(), vec![a.clone()]);
    assert_eq!(lineage.find_leaf_targets(&a).await.unwrap(), vec![d.clone()]);
    assert!(lineage.shortest_path(&d, &a).await.unwrap().is_none());
}

#[tokio::test]
async fn column_origin_traces_transitively() {
    let store = test_store();
    let (catalog, lineage) = services(&store);
    let raw = make_dataset(&catalog, "raw").await;
    let mid = make_dataset(&catalog, "mid").await;
    let report = make_dataset(&catalog, "report").await;

    lineage
        .create_column_lineage(&mid, "amount", &raw, &["price".to_string()], None)
        .await
        .unwrap();
    lineage
        .create_column_lineage(&report, "total", &mid, &["amount".to_string()], None)
        .await
        .unwrap();

    let origins = lineage.trace_column_origin(&report, "total", 10).await.unwrap();
    assert_eq!(origins.len(), 1);
    assert_eq!(origins[0]["dataset_id"], raw.as_str());
    assert_eq!(origins[0]["column"], "price");
    assert_eq!(origins[0]["depth"], 2);
}

#[tokio::test]
async fn etl_detection_infers_relationship_from_target_name() {
    let store = test_store();
    let (catalog, lineage) = services(&store);

    let mut src = NewDataset::new("crawl_raw", DatasetType::Source);
    src.collection_name = "crawl_raw".into();
    catalog.create_dataset(src).await.unwrap();

    let mut stg = NewDataset::new("staging_news_ds", DatasetType::Staging);
    stg.collection_name = "staging_news".into();
    catalog.create_dataset(stg).await.unwrap();

    let mut agg = NewDataset::new("summary_daily", DatasetType::Aggregated);
    agg.collection_name = "summary_daily".into();
    catalog.create_dataset(agg).await.unwrap();

    let copies = lineage
        .detect_lineage_from_etl("crawl_raw", "staging_news", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(copies.relationship, RelationshipType::Copies);

    let aggregates = lineage
        .detect_lineage_from_etl("staging_news", "summary_daily", Some("job-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(aggregates.relationship, RelationshipType::Aggregates);
    assert_eq!(aggregates.job_id.as_deref(), Some("job-1"));

    // Unknown collections produce no edge
    assert!(lineage
        .detect_lineage_from_etl("ghost", "staging_news", None)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn lineage_graph_layout_positions() {
    let store = test_store();
    let (catalog, lineage) = services(&store);
    let a = make_dataset(&catalog, "a").await;
    let b = make_dataset(&catalog, "b").await;

    lineage
        .create_edge(&a, &b, RelationshipType::DerivesFrom, None, None, None)
        .await
        .unwrap();

    let graph = lineage.build_lineage_graph(&a, "downstream", 5).await.unwrap();
    assert_eq!(graph.nodes.len(), 2);
    assert_eq!(graph.edges.len(), 1);
    assert_eq!(graph.nodes[0]["position"]["x"], 0);
    assert_eq!(graph.nodes[1]["position"]["x"], 200);
    assert_eq!(graph.nodes[1]["position"]["y"], 100);
}
