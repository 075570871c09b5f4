//! The shipped demo data directory loads cleanly.

use std::path::PathBuf;

use pipewright_core::graph::definition::referenced_units;
use pipewright_infra::config::{graphs_dir, read_config};
use pipewright_infra::graphs::load_catalog;
use pipewright_infra::unit::build_registry;

fn demo_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../demos")
}

#[tokio::test]
async fn demo_config_and_graphs_are_consistent() {
    let dir = demo_dir();
    let config = read_config(&dir).await.unwrap();
    let catalog = load_catalog(&graphs_dir(&dir, &config)).unwrap();
    let registry = build_registry(&config).unwrap();

    assert_eq!(catalog.len(), 3);
    catalog.validate_sequence(&config.defaults.graph_sequence).unwrap();
    for tenant in config.tenants.values() {
        catalog.validate_sequence(&tenant.graph_sequence).unwrap();
    }

    for name in catalog.names() {
        let graph = catalog.get(name).unwrap();
        for step in &graph.steps {
            for unit in referenced_units(&step.kind) {
                assert!(registry.contains(unit), "graph '{name}' uses unregistered unit '{unit}'");
            }
        }
    }
}
