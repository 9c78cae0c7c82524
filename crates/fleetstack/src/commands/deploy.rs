use colored::Colorize;
use fleetstack_cloud::{MemoryEngine, ResourceState, ResourceStatus, StateManager};
use fleetstack_config::Settings;
use fleetstack_deploy::{Deployer, ProvisionContext, Registry, StackOutcome};
use std::path::Path;
use std::sync::Arc;

pub async fn handle(settings: Settings, graph_path: &Path, simulate: bool) -> anyhow::Result<()> {
    if !simulate {
        anyhow::bail!(
            "no provisioning engine is configured; run with --simulate to deploy against the simulated engine"
        );
    }
    let graph = super::load_graph(graph_path)?;

    let state = Arc::new(StateManager::with_state_dir(&settings.state_dir));
    let engine = MemoryEngine::new(&settings.project);
    let ctx = ProvisionContext::new(Arc::new(engine), state.clone(), settings);
    let deployer = Deployer::new(Registry::with_defaults(), ctx);

    let signal = deployer.cancel_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    println!(
        "{}",
        format!("Deploying {} stacks (simulated)...", graph.stacks.len()).blue()
    );
    let report = deployer.deploy(&graph).await?;

    for stack in &report.stacks {
        match &stack.result {
            Ok(outcome) => {
                println!("{} {}", "✓".green(), stack.reference.to_string().bold());
                for resource in &outcome.resources {
                    let action = resource
                        .action
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "    {} {} ({})",
                        action.dimmed(),
                        resource.derived_name.cyan(),
                        resource.resource_type
                    );
                }
                if !outcome.exports.is_empty() {
                    println!("    {} exports published", outcome.exports.len());
                }
                record(&state, outcome).await?;
            }
            Err(e) => {
                println!("{} {}", "✗".red(), stack.reference.to_string().bold());
                println!("    {}", e.to_string().red());
            }
        }
    }

    let failed = report.failures().len();
    if failed > 0 {
        anyhow::bail!("{} of {} stacks failed", failed, report.stacks.len());
    }
    println!();
    println!("{}", "✓ Deploy finished".green().bold());
    Ok(())
}

async fn record(state: &StateManager, outcome: &StackOutcome) -> anyhow::Result<()> {
    let resources = outcome
        .resources
        .iter()
        .filter_map(|r| {
            let (urn, action) = r.urn.as_ref().zip(r.action)?;
            let resource = ResourceState::new(urn, &r.resource_type, &r.derived_name, action)
                .with_status(ResourceStatus::Ready);
            Some((r.name.clone(), resource))
        })
        .collect();
    state.record_resources(&outcome.reference, resources).await?;
    Ok(())
}
