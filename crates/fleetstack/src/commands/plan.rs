use colored::Colorize;
use fleetstack_cloud::MemoryEngine;
use fleetstack_config::Settings;
use fleetstack_core::{MemoryOutputBackend, ProvisionAction};
use fleetstack_deploy::{Deployer, ProvisionContext, Registry};
use std::path::Path;
use std::sync::Arc;

pub fn handle(settings: &Settings, graph_path: &Path, json: bool) -> anyhow::Result<()> {
    let graph = super::load_graph(graph_path)?;

    // Planning never reaches the engine
    let ctx = ProvisionContext::new(
        Arc::new(MemoryEngine::new(&settings.project)),
        Arc::new(MemoryOutputBackend::new()),
        settings.clone(),
    );
    let deployer = Deployer::new(Registry::with_defaults(), ctx);
    let plan = deployer.plan(&graph)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    for stack in &plan.stacks {
        match &stack.parent {
            Some(parent) => println!(
                "{} {}",
                stack.reference.to_string().bold(),
                format!("(parent {})", parent).dimmed()
            ),
            None => println!("{}", stack.reference.to_string().bold()),
        }
        for resource in &stack.resources {
            let action = match resource.action {
                ProvisionAction::Create => "+ create".green(),
                ProvisionAction::Adopt => "~ adopt ".yellow(),
            };
            println!(
                "  {} {} [{}] → {}",
                action,
                resource.name,
                resource.resource_type.dimmed(),
                resource.derived_name.cyan()
            );
            for key in &resource.export_keys {
                println!("      {} {}", "export".dimmed(), key);
            }
        }
        if let Some(workload) = &stack.workload {
            println!("  {} {}", "workload".blue(), workload);
            for consumer in &stack.consumes {
                println!(
                    "      {} {} [{}] from {}",
                    "wires".dimmed(),
                    consumer.key,
                    consumer.resource_type.dimmed(),
                    consumer.owner
                );
            }
        }
    }

    println!();
    println!("{}", plan.summary().to_string().bold());
    Ok(())
}
