//! Waypoint CLI entry point.
//!
//! Binary name: `wpt`
//!
//! Parses arguments, sets up tracing, then dispatches to the workflow
//! command handlers. Offline commands never open the database.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands, workflow};
use state::AppState;
use waypoint_observe::{TracingOptions, init_tracing, shutdown_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&TracingOptions {
        verbosity: cli.verbose,
        json: cli.log_json,
        otel: cli.otel,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(shell, &mut cmd, "wpt", &mut std::io::stdout());
            Ok(())
        }
        Commands::Workflow { action } if workflow::is_offline(&action) => {
            workflow::handle_offline_command(action, cli.json).await
        }
        Commands::Workflow { action } => {
            let state = AppState::init(cli.max_steps).await?;
            workflow::handle_workflow_command(action, &state, cli.json).await
        }
    }
}
