mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleetstack")]
#[command(about = "Compose cloud resources across stacks and wire them into workloads", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show what a deploy of the graph would do
    Plan {
        /// Stack graph (JSON)
        graph: PathBuf,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Deploy every stack of the graph
    Deploy {
        /// Stack graph (JSON)
        graph: PathBuf,
        /// Run against the simulated engine
        #[arg(long)]
        simulate: bool,
    },
    /// List the published exports of a stack
    Outputs {
        /// Stack name
        stack: String,
        /// Environment
        env: String,
    },
    /// Print the derived name of a resource
    Names {
        /// Stack name
        stack: String,
        /// Environment
        env: String,
        /// Resource name
        resource: String,
        /// Environment of the parent stack the resources are shared with
        #[arg(long)]
        parent_env: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        // Naming needs neither settings nor state
        Commands::Names {
            stack,
            env,
            resource,
            parent_env,
        } => {
            commands::names::handle(&stack, &env, parent_env.as_deref(), &resource);
            Ok(())
        }
        Commands::Plan { graph, json } => {
            let settings = fleetstack_config::load_settings()?;
            commands::plan::handle(&settings, &graph, json)
        }
        Commands::Deploy { graph, simulate } => {
            let settings = fleetstack_config::load_settings()?;
            commands::deploy::handle(settings, &graph, simulate).await
        }
        Commands::Outputs { stack, env } => {
            let settings = fleetstack_config::load_settings()?;
            commands::outputs::handle(&settings, &stack, &env).await
        }
    }
}
