//! Explicit name -> graph registry, built at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use pipewright_types::workflow::GraphDefinition;

use super::GraphError;
use super::definition::validate_graph;

#[derive(Debug, Clone, Default)]
pub struct GraphCatalog {
    graphs: BTreeMap<String, Arc<GraphDefinition>>,
}

impl GraphCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a graph, replacing any graph with the same name.
    pub fn insert(&mut self, graph: GraphDefinition) -> Result<(), GraphError> {
        validate_graph(&graph)?;
        if self.graphs.contains_key(&graph.name) {
            tracing::warn!(graph = %graph.name, "replacing graph definition");
        }
        self.graphs.insert(graph.name.clone(), Arc::new(graph));
        Ok(())
    }

    pub fn with(mut self, graph: GraphDefinition) -> Result<Self, GraphError> {
        self.insert(graph)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Result<Arc<GraphDefinition>, GraphError> {
        self.graphs
            .get(name)
            .cloned()
            .ok_or_else(|| GraphError::UnknownGraph(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.graphs.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }

    /// Every graph of a tenant's sequence must be registered.
    pub fn validate_sequence(&self, sequence: &[String]) -> Result<(), GraphError> {
        if sequence.is_empty() {
            return Err(GraphError::Invalid("graph sequence is empty".to_string()));
        }
        for name in sequence {
            self.get(name)?;
        }
        Ok(())
    }
}
