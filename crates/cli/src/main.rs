// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::error;

use crew::agent::{exit_code_for, AgentApp, AgentConfig};
use crew::bus::nats::NatsBus;
use crew::bus::Bus;
use crew::config::{AgentArgs, ConsoleArgs};
use crew::console::ConsoleApp;
use crew::logging::init_tracing;
use crew::orchestrator::OrchestratorService;
use crew::secrets::Redactor;

#[derive(Parser)]
#[command(name = "crew", version, about = "Multi-agent LLM runtime: agents and console on one bus.")]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run an agent process (distributed or --standalone).
    Agent(AgentArgs),
    /// Run the interactive console.
    Console(ConsoleArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.subcommand {
        Commands::Agent(args) => std::process::exit(run_agent(args).await),
        Commands::Console(args) => std::process::exit(run_console(args).await),
    }
}

async fn run_agent(args: AgentArgs) -> i32 {
    init_tracing(&args.log_level, &args.log_format);
    if let Err(e) = args.validate() {
        eprintln!("error: {e}");
        return 2;
    }

    let bus: Option<Arc<dyn Bus>> = match args.bus_url() {
        Some(url) => match NatsBus::connect(&url).await {
            Ok(bus) => Some(Arc::new(bus)),
            Err(e) => {
                error!("bus connection failed: {e}");
                return 1;
            }
        },
        None => None,
    };

    let mut config = AgentConfig::new(args.workdir());
    config.name_override = args.name.clone();
    config.project_override = args.project.clone();
    config.model_id = args.model.clone();

    let app = match AgentApp::bootstrap(config, bus, None).await {
        Ok(app) => app,
        Err(e) => {
            error!("bootstrap failed: {e}");
            return exit_code_for(&e);
        }
    };

    match app.run_until_signal().await {
        Ok(()) => 0,
        Err(e) => {
            error!("shutdown failed: {e}");
            1
        }
    }
}

async fn run_console(args: ConsoleArgs) -> i32 {
    init_tracing(&args.log_level, &args.log_format);

    let bus: Arc<dyn Bus> = match NatsBus::connect(&args.bus).await {
        Ok(bus) => Arc::new(bus),
        Err(e) => {
            eprintln!("error: cannot reach bus at {}: {e}", args.bus);
            return 1;
        }
    };

    // The console hosts the orchestrator service so /agent and /offload
    // work without a separate daemon.
    let orchestrator =
        OrchestratorService::start(bus.clone(), args.orchestrator_root(), args.bus.clone()).await;
    let mut orchestrator = match orchestrator {
        Ok(service) => service,
        Err(e) => {
            eprintln!("error: orchestrator startup failed: {e}");
            return 1;
        }
    };

    let mut console = ConsoleApp::new(
        bus,
        args.takeover,
        Duration::from_secs(args.grace_timeout),
        Redactor::from_env(),
    );
    let code = match console.run().await {
        Ok(()) => 0,
        Err(e) => {
            error!("console failed: {e}");
            1
        }
    };
    orchestrator.stop().await;
    code
}
