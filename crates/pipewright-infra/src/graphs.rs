//! Graph file discovery.
//!
//! Graphs live as `.yaml`/`.yml` files under the configured graphs directory.
//! Discovery is recursive; each file holds one graph.

use std::path::{Path, PathBuf};

use pipewright_core::graph::{GraphCatalog, GraphError, parse_graph_yaml};
use pipewright_types::workflow::GraphDefinition;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphLoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {source}")]
    Graph {
        path: PathBuf,
        #[source]
        source: GraphError,
    },
}

/// Load and validate one graph file.
pub fn load_graph_file(path: &Path) -> Result<GraphDefinition, GraphLoadError> {
    let content = std::fs::read_to_string(path).map_err(|source| GraphLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_graph_yaml(&content).map_err(|source| GraphLoadError::Graph {
        path: path.to_path_buf(),
        source,
    })
}

/// Every parseable graph file under `base_dir`, sorted by path.
///
/// Files that fail to parse are logged and skipped. A missing directory
/// yields nothing.
pub fn discover_graphs(base_dir: &Path) -> Result<Vec<(PathBuf, GraphDefinition)>, GraphLoadError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(dir: &Path, results: &mut Vec<(PathBuf, GraphDefinition)>) -> Result<(), GraphLoadError> {
    let io_err = |source| GraphLoadError::Io {
        path: dir.to_path_buf(),
        source,
    };
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if !is_yaml {
            continue;
        }
        match load_graph_file(&path) {
            Ok(graph) => results.push((path, graph)),
            Err(err) => tracing::warn!(?path, error = %err, "skipping unparseable graph file"),
        }
    }
    Ok(())
}

/// Build a catalog from every graph under `base_dir`.
///
/// When two files define the same graph name, the later path wins.
pub fn load_catalog(base_dir: &Path) -> Result<GraphCatalog, GraphLoadError> {
    let mut catalog = GraphCatalog::new();
    for (path, graph) in discover_graphs(base_dir)? {
        let name = graph.name.clone();
        catalog
            .insert(graph)
            .map_err(|source| GraphLoadError::Graph { path, source })?;
        tracing::debug!(graph = %name, "graph registered");
    }
    tracing::info!(count = catalog.len(), dir = %base_dir.display(), "graphs loaded");
    Ok(catalog)
}
