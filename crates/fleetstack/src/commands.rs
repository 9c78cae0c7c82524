pub mod deploy;
pub mod names;
pub mod outputs;
pub mod plan;

use anyhow::Context;
use fleetstack_core::StackGraph;
use std::path::Path;

/// Read a pre-parsed stack graph
pub fn load_graph(path: &Path) -> anyhow::Result<StackGraph> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let graph: StackGraph = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    tracing::debug!(stacks = graph.stacks.len(), "Loaded stack graph");
    Ok(graph)
}
