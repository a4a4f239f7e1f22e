//! # Pipeline topology
//!
//! Immutable description of the stage DAG: replica counts, downstream edges,
//! and which stages need key-stable (sharded) delivery. Built once at process
//! start and shared by reference with every component.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use itertools::Itertools;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Name of a stage.
pub type StageName = String;

/// Declaration of a single stage as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Stage name
    pub name: StageName,
    /// Number of worker replicas
    pub replicas: usize,
    /// Whether replicas own disjoint key partitions
    #[serde(default)]
    pub sharded: bool,
    /// Downstream stages, in publish order
    #[serde(default)]
    pub next: Vec<StageName>,
}

impl StageSpec {
    /// Declare an unsharded stage.
    pub fn new(name: impl Into<StageName>, replicas: usize) -> Self {
        Self {
            name: name.into(),
            replicas,
            sharded: false,
            next: Vec::new(),
        }
    }

    /// Mark the stage as sharded.
    #[must_use]
    pub const fn sharded(mut self) -> Self {
        self.sharded = true;
        self
    }

    /// Add a downstream stage.
    #[must_use]
    pub fn to(mut self, stage: impl Into<StageName>) -> Self {
        self.next.push(stage.into());
        self
    }
}

/// Static pipeline configuration, usually loaded from TOML.
///
/// ```toml
/// [[stage]]
/// name = "parser"
/// replicas = 2
/// next = ["join"]
///
/// [[stage]]
/// name = "join"
/// replicas = 3
/// sharded = true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Stage declarations
    #[serde(rename = "stage", default)]
    pub stages: Vec<StageSpec>,
}

impl TopologyConfig {
    /// Create an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stage declaration.
    #[must_use]
    pub fn with_stage(mut self, stage: StageSpec) -> Self {
        self.stages.push(stage);
        self
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTopology` if the document is not valid TOML or does not
    /// match the expected shape.
    pub fn from_toml(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| Error::invalid_topology(e.to_string()))
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `FileReadFailed` if the file cannot be read, or
    /// `InvalidTopology` if it cannot be parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;
        Self::from_toml(&source)
    }
}

#[derive(Debug, Clone)]
struct StageInfo {
    replicas: usize,
    sharded: bool,
    next: Vec<StageName>,
    expected_upstream: usize,
}

/// Validated, read-only pipeline topology.
#[derive(Debug, Clone)]
pub struct Topology {
    graph: DiGraph<StageName, ()>,
    node_map: HashMap<StageName, NodeIndex>,
    stages: BTreeMap<StageName, StageInfo>,
}

impl Topology {
    /// Validate a configuration and derive fan-in counts.
    ///
    /// # Errors
    ///
    /// - `InvalidTopology` for duplicate names, zero replicas, or cycles
    /// - `UnknownStage` when a downstream entry names an undeclared stage
    pub fn from_config(config: &TopologyConfig) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut node_map = HashMap::new();
        let mut stages = BTreeMap::new();

        for spec in &config.stages {
            if spec.replicas == 0 {
                return Err(Error::invalid_topology(format!(
                    "stage '{}' must have at least one replica",
                    spec.name
                )));
            }
            if !spec.next.iter().all_unique() {
                return Err(Error::invalid_topology(format!(
                    "stage '{}' lists a downstream stage more than once",
                    spec.name
                )));
            }
            if node_map.contains_key(&spec.name) {
                return Err(Error::invalid_topology(format!(
                    "stage '{}' declared twice",
                    spec.name
                )));
            }
            node_map.insert(spec.name.clone(), graph.add_node(spec.name.clone()));
            stages.insert(
                spec.name.clone(),
                StageInfo {
                    replicas: spec.replicas,
                    sharded: spec.sharded,
                    next: spec.next.clone(),
                    expected_upstream: 0,
                },
            );
        }

        let mut fan_in: HashMap<&str, usize> = HashMap::new();
        for spec in &config.stages {
            let from = node_map
                .get(&spec.name)
                .copied()
                .ok_or_else(|| Error::unknown_stage(&spec.name))?;
            for target in &spec.next {
                let to = node_map
                    .get(target)
                    .copied()
                    .ok_or_else(|| Error::unknown_stage(target))?;
                graph.add_edge(from, to, ());
                let count = fan_in.entry(target.as_str()).or_insert(0);
                *count = count.saturating_add(spec.replicas);
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            let stage = graph
                .node_weight(cycle.node_id())
                .cloned()
                .unwrap_or_default();
            return Err(Error::invalid_topology(format!(
                "cycle detected through stage '{stage}'"
            )));
        }

        for (name, info) in &mut stages {
            info.expected_upstream = fan_in.get(name.as_str()).copied().unwrap_or(0);
        }

        Ok(Self {
            graph,
            node_map,
            stages,
        })
    }

    /// Load, parse and validate a TOML topology file.
    ///
    /// # Errors
    ///
    /// Propagates read, parse and validation errors.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_config(&TopologyConfig::load(path)?)
    }

    fn info(&self, stage: &str) -> Result<&StageInfo> {
        self.stages
            .get(stage)
            .ok_or_else(|| Error::unknown_stage(stage))
    }

    /// Downstream stages of `stage`, in declaration order.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` if `stage` is not declared.
    pub fn downstream_of(&self, stage: &str) -> Result<&[StageName]> {
        self.info(stage).map(|info| info.next.as_slice())
    }

    /// Number of replicas of `stage`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` if `stage` is not declared.
    pub fn replica_count(&self, stage: &str) -> Result<usize> {
        self.info(stage).map(|info| info.replicas)
    }

    /// Whether `stage` requires sharded delivery.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` if `stage` is not declared.
    pub fn is_sharded(&self, stage: &str) -> Result<bool> {
        self.info(stage).map(|info| info.sharded)
    }

    /// Sum of replica counts over every stage feeding `stage`.
    ///
    /// Zero for source stages.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` if `stage` is not declared.
    pub fn expected_upstream(&self, stage: &str) -> Result<usize> {
        self.info(stage).map(|info| info.expected_upstream)
    }

    /// Stages feeding `stage`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` if `stage` is not declared.
    pub fn upstream_of(&self, stage: &str) -> Result<Vec<&str>> {
        let index = self
            .node_map
            .get(stage)
            .copied()
            .ok_or_else(|| Error::unknown_stage(stage))?;
        let mut upstream: Vec<&str> = self
            .graph
            .neighbors_directed(index, petgraph::Direction::Incoming)
            .filter_map(|n| self.graph.node_weight(n).map(String::as_str))
            .collect();
        upstream.sort_unstable();
        upstream.dedup();
        Ok(upstream)
    }

    /// Whether `stage` is declared.
    #[must_use]
    pub fn contains(&self, stage: &str) -> bool {
        self.stages.contains_key(stage)
    }

    /// Whether `to` is a direct downstream of `from`.
    #[must_use]
    pub fn is_edge(&self, from: &str, to: &str) -> bool {
        self.stages
            .get(from)
            .is_some_and(|info| info.next.iter().any(|n| n == to))
    }

    /// All stage names in sorted order.
    pub fn stages(&self) -> impl Iterator<Item = &str> {
        self.stages.keys().map(String::as_str)
    }

    /// Stages in an order where every stage precedes its downstream.
    #[must_use]
    pub fn topological_order(&self) -> Vec<&str> {
        toposort(&self.graph, None)
            .map(|order| {
                order
                    .into_iter()
                    .filter_map(|n| self.graph.node_weight(n).map(String::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of declared stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether no stages are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    fn chain() -> TopologyConfig {
        TopologyConfig::new()
            .with_stage(StageSpec::new("a", 2).to("b"))
            .with_stage(StageSpec::new("b", 1).to("c"))
            .with_stage(StageSpec::new("c", 1))
    }

    #[test]
    fn expected_upstream_sums_replicas_of_feeders() {
        let config = TopologyConfig::new()
            .with_stage(StageSpec::new("answers", 2).to("join").to("score"))
            .with_stage(StageSpec::new("questions", 3).to("join"))
            .with_stage(StageSpec::new("join", 2).sharded())
            .with_stage(StageSpec::new("score", 1));
        let topology = Topology::from_config(&config).expect("valid topology");

        assert_eq!(topology.expected_upstream("join").ok(), Some(5));
        assert_eq!(topology.expected_upstream("score").ok(), Some(2));
        assert_eq!(topology.expected_upstream("answers").ok(), Some(0));
        assert_eq!(topology.is_sharded("join").ok(), Some(true));
        assert_eq!(topology.upstream_of("join").ok(), Some(vec!["answers", "questions"]));
    }

    #[test]
    fn chain_scenario_fan_in() {
        let topology = Topology::from_config(&chain()).expect("valid topology");
        assert_eq!(topology.expected_upstream("b").ok(), Some(2));
        assert_eq!(topology.expected_upstream("c").ok(), Some(1));
        assert_eq!(topology.downstream_of("a").ok(), Some(&["b".to_string()][..]));
        assert_eq!(topology.topological_order(), vec!["a", "b", "c"]);
    }

    #[test]
    fn unknown_downstream_is_rejected() {
        let config = TopologyConfig::new().with_stage(StageSpec::new("a", 1).to("ghost"));
        let result = Topology::from_config(&config);
        assert!(matches!(result, Err(Error::UnknownStage { ref stage }) if stage == "ghost"));
    }

    #[test]
    fn zero_replicas_is_rejected() {
        let config = TopologyConfig::new().with_stage(StageSpec::new("a", 0));
        assert!(matches!(
            Topology::from_config(&config),
            Err(Error::InvalidTopology { .. })
        ));
    }

    #[test]
    fn cycles_are_rejected() {
        let config = TopologyConfig::new()
            .with_stage(StageSpec::new("a", 1).to("b"))
            .with_stage(StageSpec::new("b", 1).to("a"));
        assert!(matches!(
            Topology::from_config(&config),
            Err(Error::InvalidTopology { .. })
        ));
    }

    #[test]
    fn duplicate_stage_is_rejected() {
        let config = TopologyConfig::new()
            .with_stage(StageSpec::new("a", 1))
            .with_stage(StageSpec::new("a", 2));
        assert!(Topology::from_config(&config).is_err());
    }

    #[test]
    fn lookups_of_undeclared_stage_fail() {
        let topology = Topology::from_config(&chain()).expect("valid topology");
        assert!(topology.replica_count("nope").is_err());
        assert!(topology.downstream_of("nope").is_err());
        assert!(!topology.contains("nope"));
        assert!(topology.is_edge("a", "b"));
        assert!(!topology.is_edge("a", "c"));
    }

    #[test]
    fn parses_toml() {
        let source = r#"
            [[stage]]
            name = "parser"
            replicas = 2
            next = ["join"]

            [[stage]]
            name = "join"
            replicas = 3
            sharded = true
        "#;
        let config = TopologyConfig::from_toml(source).expect("parses");
        let topology = Topology::from_config(&config).expect("valid");
        assert_eq!(topology.len(), 2);
        assert_eq!(topology.replica_count("join").ok(), Some(3));
        assert_eq!(topology.expected_upstream("join").ok(), Some(2));
    }

    #[test]
    fn loads_toml_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[stage]]\nname = \"solo\"\nreplicas = 1").unwrap();
        let topology = Topology::load(file.path()).expect("loads");
        assert!(topology.contains("solo"));
    }
}
