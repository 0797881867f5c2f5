mod docker;
mod launcher;
mod monitor;
mod orchestrator;
mod probe;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stackup_core::instance::ServiceResult;
use stackup_core::stack::ServiceStack;

use docker::DockerRuntime;
use monitor::HealthMonitor;
use orchestrator::Orchestrator;

/// Stack file names probed in the working directory, in order
const STACK_FILES: &[&str] = &["stackup.yaml", "stackup.yml", ".stackup.yaml"];

#[derive(Parser)]
#[command(name = "stackup", version)]
#[command(about = "Start, stop and watch a local stack of services", long_about = None)]
struct Cli {
    /// Stack file (defaults to stackup.yaml in the current directory)
    #[arg(short = 'f', long, global = true)]
    file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start services in dependency order (all of them by default)
    Up {
        services: Vec<String>,
        /// Build container images before running them
        #[arg(long)]
        build: bool,
        /// Stay in the foreground, monitor health, stop on ctrl-c
        #[arg(long)]
        watch: bool,
    },
    /// Stop services in reverse dependency order
    Down { services: Vec<String> },
    /// Stop and start one service
    Restart {
        service: String,
        #[arg(long)]
        build: bool,
    },
    /// Show the status of every configured service
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Load the stack file and report whether it is well formed
    Validate,
}

fn stack_file(explicit: Option<PathBuf>) -> Result<PathBuf, String> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path);
        }
        return Err(format!("stack file not found: {}", path.display()));
    }

    STACK_FILES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .ok_or_else(|| format!("no stack file found (looked for {})", STACK_FILES.join(", ")))
}

fn print_results(results: &BTreeMap<String, ServiceResult>) {
    for (name, result) in results {
        if result.success {
            println!("  {}: ok", name);
        } else {
            println!(
                "  {}: failed ({})",
                name,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
}

fn all_ok(results: &BTreeMap<String, ServiceResult>) -> ExitCode {
    if results.values().all(|r| r.success) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stackup=info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let path = stack_file(cli.file)?;
    let stack = ServiceStack::load(&path)?;

    if let Commands::Validate = cli.command {
        println!("{}: ok ({} services)", path.display(), stack.services.len());
        return Ok(ExitCode::SUCCESS);
    }

    let runtime = Arc::new(DockerRuntime::new());
    let orchestrator = Orchestrator::new(stack, runtime);
    // Containers may have survived a previous invocation
    orchestrator.rediscover().await;

    match cli.command {
        Commands::Up {
            services,
            build,
            watch,
        } => {
            let results = orchestrator.start_stack(&services, build).await?;
            print_results(&results);
            let code = all_ok(&results);

            if watch {
                let monitor = HealthMonitor::new(orchestrator.instances());
                let handle = tokio::spawn(monitor.run());
                info!("watching stack, press ctrl-c to stop it");
                tokio::signal::ctrl_c().await?;
                handle.abort();

                let results = orchestrator.stop_stack(&services).await?;
                print_results(&results);
                return Ok(all_ok(&results));
            }

            Ok(code)
        }

        Commands::Down { services } => {
            let results = orchestrator.stop_stack(&services).await?;
            print_results(&results);
            Ok(all_ok(&results))
        }

        Commands::Restart { service, build } => {
            let result = orchestrator.restart_service(&service, build).await;
            let mut results = BTreeMap::new();
            results.insert(service, result);
            print_results(&results);
            Ok(all_ok(&results))
        }

        Commands::Status { json } => {
            let snapshots = orchestrator.status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshots)?);
            } else {
                println!(
                    "{:<20} {:<10} {:<24} {:>8} {:>9}",
                    "SERVICE", "STATUS", "HEALTH", "UPTIME", "RESTARTS"
                );
                for (name, snap) in &snapshots {
                    println!(
                        "{:<20} {:<10} {:<24} {:>7}s {:>9}",
                        name,
                        snap.status.to_string(),
                        snap.health.to_string(),
                        snap.uptime_secs,
                        snap.restart_count
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Validate => unreachable!("handled before the runtime is created"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn explicit_missing_stack_file_is_an_error() {
        let err = stack_file(Some(PathBuf::from("/nonexistent/stack.yaml"))).unwrap_err();
        assert!(err.contains("not found"));
    }
}
