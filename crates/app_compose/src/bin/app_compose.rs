//! app_compose CLI
//!
//! Usage:
//!   app_compose
//!   app_compose dev.yaml --remove-containers
//!   app_compose dev.yaml --validate

use app_compose::runtime::{install_interrupt_handler, ShutdownCoordinator, EXIT_FORCED};
use app_compose::{ComposeArgs, ComposeFile, Orchestrator, OrchestratorConfig};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args: ComposeArgs = argh::from_env();

    let env = env_logger::Env::default().default_filter_or(args.log_filter());
    env_logger::init_from_env(env);

    log::info!("Loading compose file: {}", args.compose_file);
    let compose = match ComposeFile::from_file(&args.compose_file) {
        Ok(compose) => compose,
        Err(e) => {
            log::error!("Failed to load compose file: {}", e);
            std::process::exit(EXIT_FORCED);
        }
    };

    if args.validate {
        println!("Compose file '{}' is valid", args.compose_file);
        println!("  Apps: {}", compose.apps.len());
        println!("  Containers: {}", compose.container_apps().join(", "));
        return;
    }

    let working_dir = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            log::error!("Failed to get current directory: {}", e);
            std::process::exit(EXIT_FORCED);
        }
    };
    let config = OrchestratorConfig {
        working_dir,
        project: args.project,
        remove_containers: args.remove_containers,
        ..Default::default()
    };
    let timeouts = config.shutdown;

    let mut orchestrator = Orchestrator::new(compose, config);
    let registry = match orchestrator.create_processes() {
        Ok(registry) => registry,
        Err(e) => {
            log::error!("Failed to create apps: {}", e);
            std::process::exit(EXIT_FORCED);
        }
    };

    // Installed before anything starts so no interrupt is lost
    let interrupts = match install_interrupt_handler() {
        Ok(rx) => rx,
        Err(e) => {
            log::error!("Error setting Ctrl+C handler: {}", e);
            std::process::exit(EXIT_FORCED);
        }
    };

    if let Err(e) = orchestrator.start_processes() {
        log::error!("Launch failed: {}", e);
        std::process::exit(EXIT_FORCED);
    }

    let coordinator = ShutdownCoordinator::new(registry, timeouts);
    let code = coordinator.supervise(interrupts).await;
    orchestrator.dispose();

    log::info!("app_compose exiting");
    std::process::exit(code);
}
