use colored::Colorize;
use fleetstack_cloud::StateManager;
use fleetstack_config::Settings;
use fleetstack_core::{OutputBackend, StackReference};

const MASK: &str = "********";

pub async fn handle(settings: &Settings, stack: &str, env: &str) -> anyhow::Result<()> {
    let state = StateManager::with_state_dir(&settings.state_dir);
    let reference = StackReference::new(stack, env);
    let outputs = state.list_outputs(&reference).await?;

    if outputs.is_empty() {
        println!("{}", format!("No exports published for {}", reference).yellow());
        return Ok(());
    }

    println!("{}", format!("Exports of {}", reference).bold());
    for export in outputs {
        let value = if export.secret {
            MASK.dimmed().to_string()
        } else {
            export.value
        };
        println!("  {} = {}", export.key.cyan(), value);
    }
    Ok(())
}
