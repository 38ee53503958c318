//! Lineage graph over catalog datasets.
//!
//! Edges are directed `(source, target, relationship)` rows in
//! `data_lineage`-style storage (`source_id`/`target_id` here refer to
//! datasets, not crawl sources), unique per ordered pair. Traversals build
//! adjacency on demand from the edge collection; visited sets prevent
//! cycles from looping the walkers.

use chrono::{DateTime, Utc};
use corral_protocol::collections as col;
use corral_protocol::{CoreError, CoreResult};
use corral_store::{FindOptions, Store};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::info;

use crate::catalog::DataCatalog;
use crate::model::Dataset;

/// How a target dataset relates to its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    DerivesFrom,
    Copies,
    Aggregates,
    Transforms,
    Joins,
    Filters,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::DerivesFrom => "derives_from",
            RelationshipType::Copies => "copies",
            RelationshipType::Aggregates => "aggregates",
            RelationshipType::Transforms => "transforms",
            RelationshipType::Joins => "joins",
            RelationshipType::Filters => "filters",
        }
    }
}

/// One directed edge between datasets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageEdge {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<corral_ids::IdRef>,
    pub source_id: String,
    pub target_id: String,
    pub relationship: RelationshipType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformation_logic: Option<String>,
    /// `target_column -> [source_columns]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_mappings: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Graph snapshot for rendering.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LineageGraph {
    pub root_id: String,
    pub nodes: Vec<Value>,
    pub edges: Vec<Value>,
}

/// Downstream impact report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImpactAnalysis {
    pub dataset_id: String,
    pub total_affected: u64,
    pub affected_datasets: Vec<Value>,
    pub column_impacts: Vec<Value>,
    pub critical_paths: Vec<Vec<String>>,
}

/// Lineage over catalog datasets.
pub struct LineageService {
    store: Store,
    catalog: Arc<DataCatalog>,
}

impl LineageService {
    pub fn new(store: Store, catalog: Arc<DataCatalog>) -> Self {
        Self { store, catalog }
    }

    // ---- Edges ------------------------------------------------------------

    /// Create or update the edge for `(source, target)`. Self-loops are
    /// rejected; both datasets' embedded upstream/downstream refs are kept
    /// in sync.
    pub async fn create_edge(
        &self,
        source_id: &str,
        target_id: &str,
        relationship: RelationshipType,
        transformation_logic: Option<&str>,
        column_mappings: Option<Map<String, Value>>,
        job_id: Option<&str>,
    ) -> CoreResult<LineageEdge> {
        if source_id == target_id {
            return Err(CoreError::DatabaseOperation(
                "Lineage edges may not be self-loops".into(),
            ));
        }

        let now = Utc::now();
        let mut set = json!({
            "relationship": relationship.as_str(),
            "updated_at": now.to_rfc3339(),
        });
        if let Some(logic) = transformation_logic {
            set["transformation_logic"] = json!(logic);
        }
        if let Some(mappings) = &column_mappings {
            set["column_mappings"] = Value::Object(mappings.clone());
        }
        if let Some(job_id) = job_id {
            set["job_id"] = json!(job_id);
        }

        self.store
            .upsert_one(
                col::LINEAGE_EDGES,
                &json!({"source_id": source_id, "target_id": target_id}),
                &json!({
                    "$set": set,
                    "$setOnInsert": {"created_at": now.to_rfc3339()},
                }),
            )
            .await?;

        self.sync_dataset_refs(source_id, target_id, relationship)
            .await?;

        let edge = self
            .get_edge(source_id, target_id)
            .await?
            .ok_or_else(|| CoreError::internal("edge vanished after upsert"))?;
        info!(source_id, target_id, relationship = relationship.as_str(), "lineage edge upserted");
        Ok(edge)
    }

    /// Replace the matching upstream/downstream entry on both datasets.
    async fn sync_dataset_refs(
        &self,
        source_id: &str,
        target_id: &str,
        relationship: RelationshipType,
    ) -> CoreResult<()> {
        let source_name = self.dataset_name(source_id).await?;
        let target_name = self.dataset_name(target_id).await?;

        if let Some(source) = self.catalog.get_dataset(source_id).await? {
            let mut downstream: Vec<Value> = source
                .downstream
                .iter()
                .filter(|r| r.dataset_id != target_id)
                .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
                .collect();
            downstream.push(json!({
                "dataset_id": target_id,
                "dataset_name": target_name,
                "relationship": relationship.as_str(),
            }));
            self.store
                .update_by_id(
                    col::DATA_CATALOG,
                    source_id,
                    &json!({"$set": {"downstream": downstream}}),
                )
                .await?;
        }

        if let Some(target) = self.catalog.get_dataset(target_id).await? {
            let mut upstream: Vec<Value> = target
                .upstream
                .iter()
                .filter(|r| r.dataset_id != source_id)
                .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
                .collect();
            upstream.push(json!({
                "dataset_id": source_id,
                "dataset_name": source_name,
                "relationship": relationship.as_str(),
            }));
            self.store
                .update_by_id(
                    col::DATA_CATALOG,
                    target_id,
                    &json!({"$set": {"upstream": upstream}}),
                )
                .await?;
        }
        Ok(())
    }

    async fn dataset_name(&self, dataset_id: &str) -> CoreResult<String> {
        Ok(self
            .catalog
            .get_dataset(dataset_id)
            .await?
            .map(|d| d.name)
            .unwrap_or_else(|| dataset_id.to_string()))
    }

    pub async fn get_edge(
        &self,
        source_id: &str,
        target_id: &str,
    ) -> CoreResult<Option<LineageEdge>> {
        let doc = self
            .store
            .find_one(
                col::LINEAGE_EDGES,
                &json!({"source_id": source_id, "target_id": target_id}),
            )
            .await?;
        doc.map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    pub async fn outgoing_edges(&self, dataset_id: &str) -> CoreResult<Vec<LineageEdge>> {
        let docs = self
            .store
            .find(
                col::LINEAGE_EDGES,
                &json!({"source_id": dataset_id}),
                FindOptions::sorted("target_id", 1),
            )
            .await?;
        docs.into_iter()
            .map(|d| serde_json::from_value(d).map_err(Into::into))
            .collect()
    }

    pub async fn incoming_edges(&self, dataset_id: &str) -> CoreResult<Vec<LineageEdge>> {
        let docs = self
            .store
            .find(
                col::LINEAGE_EDGES,
                &json!({"target_id": dataset_id}),
                FindOptions::sorted("source_id", 1),
            )
            .await?;
        docs.into_iter()
            .map(|d| serde_json::from_value(d).map_err(Into::into))
            .collect()
    }

    pub async fn delete_edge(&self, source_id: &str, target_id: &str) -> CoreResult<bool> {
        let deleted = self
            .store
            .delete_one(
                col::LINEAGE_EDGES,
                &json!({"source_id": source_id, "target_id": target_id}),
            )
            .await?;
        Ok(deleted > 0)
    }

    // ---- Column lineage ---------------------------------------------------

    /// Record that `target.column` is computed from source columns.
    pub async fn create_column_lineage(
        &self,
        target_dataset_id: &str,
        target_column: &str,
        source_dataset_id: &str,
        source_columns: &[String],
        job_id: Option<&str>,
    ) -> CoreResult<()> {
        self.store
            .upsert_one(
                col::COLUMN_LINEAGE,
                &json!({
                    "target_dataset_id": target_dataset_id,
                    "target_column": target_column,
                    "source_dataset_id": source_dataset_id,
                }),
                &json!({"$set": {
                    "source_columns": source_columns,
                    "job_id": job_id,
                    "updated_at": Utc::now().to_rfc3339(),
                }}),
            )
            .await?;
        Ok(())
    }

    /// Walk `column_lineage` transitively upstream; every chain that
    /// terminates yields an origin entry `{dataset_id, column, path, depth}`.
    pub async fn trace_column_origin(
        &self,
        dataset_id: &str,
        column: &str,
        max_depth: usize,
    ) -> CoreResult<Vec<Value>> {
        let mut origins = Vec::new();
        let mut stack: Vec<(String, String, Vec<Value>, usize)> =
            vec![(dataset_id.to_string(), column.to_string(), Vec::new(), 0)];
        let mut visited: HashSet<(String, String)> = HashSet::new();

        while let Some((ds, column, path, depth)) = stack.pop() {
            if depth >= max_depth || !visited.insert((ds.clone(), column.clone())) {
                continue;
            }

            let parents = self
                .store
                .find(
                    col::COLUMN_LINEAGE,
                    &json!({"target_dataset_id": ds, "target_column": column}),
                    FindOptions::default(),
                )
                .await?;

            if parents.is_empty() {
                if depth > 0 {
                    origins.push(json!({
                        "dataset_id": ds,
                        "column": column,
                        "path": path,
                        "depth": depth,
                    }));
                }
                continue;
            }

            for parent in parents {
                let source_ds = parent
                    .get("source_dataset_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let source_columns: Vec<String> = parent
                    .get("source_columns")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();

                for source_column in source_columns {
                    let mut next_path = path.clone();
                    next_path.push(json!({
                        "dataset_id": ds,
                        "column": column,
                    }));
                    stack.push((source_ds.clone(), source_column, next_path, depth + 1));
                }
            }
        }

        Ok(origins)
    }

    // ---- Graph building ---------------------------------------------------

    /// BFS out from `root`. `direction` is `upstream`, `downstream`, or
    /// `both`; positions lay nodes out left-to-right by depth.
    pub async fn build_lineage_graph(
        &self,
        root_id: &str,
        direction: &str,
        max_depth: usize,
    ) -> CoreResult<LineageGraph> {
        let mut graph = LineageGraph {
            root_id: root_id.to_string(),
            ..Default::default()
        };
        let mut visited: HashSet<String> = HashSet::new();
        let mut edge_keys: HashSet<(String, String)> = HashSet::new();
        let mut queue: VecDeque<(String, i64)> = VecDeque::new();
        queue.push_back((root_id.to_string(), 0));

        while let Some((dataset_id, depth)) = queue.pop_front() {
            if !visited.insert(dataset_id.clone()) {
                continue;
            }
            if let Some(dataset) = self.catalog.get_dataset(&dataset_id).await? {
                graph.nodes.push(graph_node(&dataset, depth, graph.nodes.len()));
            }
            if depth.unsigned_abs() as usize >= max_depth {
                continue;
            }

            if direction == "downstream" || direction == "both" {
                for edge in self.outgoing_edges(&dataset_id).await? {
                    if edge_keys.insert((edge.source_id.clone(), edge.target_id.clone())) {
                        graph.edges.push(graph_edge(&edge));
                    }
                    queue.push_back((edge.target_id, depth + 1));
                }
            }
            if direction == "upstream" || direction == "both" {
                for edge in self.incoming_edges(&dataset_id).await? {
                    if edge_keys.insert((edge.source_id.clone(), edge.target_id.clone())) {
                        graph.edges.push(graph_edge(&edge));
                    }
                    queue.push_back((edge.source_id, depth - 1));
                }
            }
        }

        Ok(graph)
    }

    // ---- Impact analysis --------------------------------------------------

    /// DFS downstream from `dataset_id`, collecting affected datasets,
    /// per-column impacts, and the longest root-to-leaf paths.
    pub async fn analyze_impact(
        &self,
        dataset_id: &str,
        include_columns: bool,
        max_depth: usize,
    ) -> CoreResult<ImpactAnalysis> {
        let mut analysis = ImpactAnalysis {
            dataset_id: dataset_id.to_string(),
            ..Default::default()
        };
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(dataset_id.to_string());

        let mut critical_paths: Vec<Vec<String>> = Vec::new();
        let mut stack: Vec<(String, usize, Vec<String>)> =
            vec![(dataset_id.to_string(), 0, vec![dataset_id.to_string()])];

        while let Some((current, depth, path)) = stack.pop() {
            if depth >= max_depth {
                critical_paths.push(path);
                continue;
            }

            let edges = self.outgoing_edges(&current).await?;
            if edges.is_empty() {
                // Leaf: this path is complete
                if path.len() > 1 {
                    critical_paths.push(path);
                }
                continue;
            }

            for edge in edges {
                if include_columns {
                    if let Some(mappings) = &edge.column_mappings {
                        for (target_column, source_columns) in mappings {
                            analysis.column_impacts.push(json!({
                                "dataset_id": edge.target_id,
                                "column": target_column,
                                "derived_from": source_columns,
                                "via": edge.source_id,
                            }));
                        }
                    }
                }

                if visited.insert(edge.target_id.clone()) {
                    analysis.affected_datasets.push(json!({
                        "id": edge.target_id,
                        "depth": depth + 1,
                        "impact_type": edge.relationship.as_str(),
                    }));
                }

                // A target already on the path is a cycle; stop this branch
                if path.contains(&edge.target_id) {
                    continue;
                }
                let mut next_path = path.clone();
                next_path.push(edge.target_id.clone());
                stack.push((edge.target_id, depth + 1, next_path));
            }
        }

        // Longest paths are the most fragile chains; keep the top 10
        critical_paths.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        critical_paths.truncate(10);

        analysis.total_affected = analysis.affected_datasets.len() as u64;
        analysis.critical_paths = critical_paths;
        Ok(analysis)
    }

    // ---- Path finding -----------------------------------------------------

    /// Every path from `source` to `target` over outgoing edges.
    pub async fn find_paths(
        &self,
        source_id: &str,
        target_id: &str,
        max_depth: usize,
    ) -> CoreResult<Vec<Vec<String>>> {
        let mut paths = Vec::new();
        let mut stack: Vec<(String, Vec<String>)> =
            vec![(source_id.to_string(), vec![source_id.to_string()])];

        while let Some((current, path)) = stack.pop() {
            if current == target_id {
                paths.push(path);
                continue;
            }
            if path.len() > max_depth {
                continue;
            }
            for edge in self.outgoing_edges(&current).await? {
                if path.contains(&edge.target_id) {
                    continue;
                }
                let mut next = path.clone();
                next.push(edge.target_id.clone());
                stack.push((edge.target_id, next));
            }
        }
        Ok(paths)
    }

    /// Shortest path by BFS, or `None` when unreachable.
    pub async fn shortest_path(
        &self,
        source_id: &str,
        target_id: &str,
    ) -> CoreResult<Option<Vec<String>>> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<Vec<String>> = VecDeque::new();
        queue.push_back(vec![source_id.to_string()]);
        visited.insert(source_id.to_string());

        while let Some(path) = queue.pop_front() {
            let current = path.last().expect("paths are never empty");
            if current == target_id {
                return Ok(Some(path));
            }
            for edge in self.outgoing_edges(current).await? {
                if visited.insert(edge.target_id.clone()) {
                    let mut next = path.clone();
                    next.push(edge.target_id);
                    queue.push_back(next);
                }
            }
        }
        Ok(None)
    }

    /// Datasets with no incoming edges, reachable upstream of `dataset_id`.
    pub async fn find_root_sources(&self, dataset_id: &str) -> CoreResult<Vec<String>> {
        let mut roots = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack = vec![dataset_id.to_string()];

        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let incoming = self.incoming_edges(&current).await?;
            if incoming.is_empty() {
                if current != dataset_id {
                    roots.push(current);
                }
                continue;
            }
            for edge in incoming {
                stack.push(edge.source_id);
            }
        }
        roots.sort();
        Ok(roots)
    }

    /// Datasets with no outgoing edges, reachable downstream of
    /// `dataset_id`.
    pub async fn find_leaf_targets(&self, dataset_id: &str) -> CoreResult<Vec<String>> {
        let mut leaves = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack = vec![dataset_id.to_string()];

        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let outgoing = self.outgoing_edges(&current).await?;
            if outgoing.is_empty() {
                if current != dataset_id {
                    leaves.push(current);
                }
                continue;
            }
            for edge in outgoing {
                stack.push(edge.target_id);
            }
        }
        leaves.sort();
        Ok(leaves)
    }

    // ---- ETL detection ----------------------------------------------------

    /// Infer and record an edge from an observed ETL hop. The relationship
    /// comes from the target name: `staging_*` copies, `agg_*`/`summary_*`
    /// aggregates, everything else derives.
    pub async fn detect_lineage_from_etl(
        &self,
        source_collection: &str,
        target_collection: &str,
        job_id: Option<&str>,
    ) -> CoreResult<Option<LineageEdge>> {
        let Some(source) = self.catalog.get_dataset_by_collection(source_collection).await? else {
            return Ok(None);
        };
        let Some(target) = self.catalog.get_dataset_by_collection(target_collection).await? else {
            return Ok(None);
        };

        let relationship = if target_collection.starts_with("staging_") {
            RelationshipType::Copies
        } else if target_collection.starts_with("agg_") || target_collection.starts_with("summary_")
        {
            RelationshipType::Aggregates
        } else {
            RelationshipType::DerivesFrom
        };

        let source_id = source.id.expect("stored dataset has an id").to_hex();
        let target_id = target.id.expect("stored dataset has an id").to_hex();
        let edge = self
            .create_edge(&source_id, &target_id, relationship, None, None, job_id)
            .await?;
        Ok(Some(edge))
    }
}

fn graph_node(dataset: &Dataset, depth: i64, order: usize) -> Value {
    json!({
        "id": dataset.id.as_ref().map(|i| i.to_hex()),
        "name": dataset.name,
        "display_name": dataset.display_name,
        "node_type": dataset.dataset_type.as_str(),
        "domain": dataset.domain,
        "quality_score": dataset.quality.as_ref().map(|q| q.overall_score),
        "record_count": dataset.record_count,
        "position": {"x": depth * 200, "y": (order as i64) * 100},
    })
}

fn graph_edge(edge: &LineageEdge) -> Value {
    json!({
        "source": edge.source_id,
        "target": edge.target_id,
        "relationship": edge.relationship.as_str(),
        "has_column_mappings": edge.column_mappings.is_some(),
    })
}
