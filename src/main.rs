//! Fleet Bootstrap CLI
//!
//! Entry point for the `fleetboot` command-line tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::{self, Command, Stdio};

use fleet_bootstrap::builder::{command_builder_for_mode, DOCKER_CONTAINER_MODE};
use fleet_bootstrap::manifest;
use fleet_bootstrap::runner::{DeploymentRunner, Settings};
use fleet_bootstrap::Location;

#[derive(Parser)]
#[command(name = "fleetboot")]
#[command(about = "Fleet deployment bootstrapper", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render every deployment named by the fleet manifest
    Deploy {
        /// Configuration root holding fleet.json (default: current directory)
        #[arg(long, short = 'p')]
        path: Option<PathBuf>,
    },

    /// Validate, prepare, and execute one deployment
    Run {
        #[arg(long, short = 'a')]
        application: String,

        #[arg(long, short = 's')]
        stripe: String,

        #[arg(long, short = 'i')]
        instance: String,

        /// Hostname to decode environment and data center from
        #[arg(long, conflicts_with_all = ["environment", "data_center"])]
        hostname: Option<String>,

        /// Explicit environment (requires --data-center)
        #[arg(long, short = 'e', requires = "data_center")]
        environment: Option<String>,

        /// Explicit data center (requires --environment)
        #[arg(long, short = 'd', requires = "environment")]
        data_center: Option<String>,

        #[arg(long, short = 'm', default_value = DOCKER_CONTAINER_MODE)]
        mode: String,

        /// Skip rendered-tree validation
        #[arg(long)]
        skip_validation: bool,

        /// Settings file (default: fleetboot.toml under the root)
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Configuration root (default: current directory)
        #[arg(long, short = 'p')]
        path: Option<PathBuf>,
    },

    /// Stop and remove a running container
    Stop {
        #[arg(long, short = 'a')]
        application: String,

        #[arg(long, short = 's')]
        stripe: String,

        #[arg(long, short = 'i')]
        instance: String,
    },

    /// Print the assembled command line without executing
    ShowCommand {
        #[arg(long, short = 'a')]
        application: String,

        #[arg(long, short = 's')]
        stripe: String,

        #[arg(long, short = 'i')]
        instance: String,

        #[arg(long, short = 'e')]
        environment: Option<String>,

        #[arg(long, short = 'd')]
        data_center: Option<String>,

        #[arg(long, short = 'm')]
        mode: String,

        /// Configuration root (default: current directory)
        #[arg(long, short = 'p')]
        path: Option<PathBuf>,
    },
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Deploy { path } => run_deploy(path),
        Commands::Run {
            application,
            stripe,
            instance,
            hostname,
            environment,
            data_center,
            mode,
            skip_validation,
            settings,
            path,
        } => run_run(
            &application,
            &stripe,
            &instance,
            hostname,
            environment.zip(data_center),
            &mode,
            skip_validation,
            settings,
            path,
        ),
        Commands::Stop {
            application,
            stripe,
            instance,
        } => {
            stop_container(&format!("{}-{}-{}", application, stripe, instance));
        }
        Commands::ShowCommand {
            application,
            stripe,
            instance,
            environment,
            data_center,
            mode,
            path,
        } => run_show_command(
            &application,
            &stripe,
            &instance,
            environment,
            data_center,
            &mode,
            path,
        ),
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

fn configuration_root(path: Option<PathBuf>) -> PathBuf {
    path.unwrap_or_else(|| match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Error resolving current directory: {}", e);
            process::exit(1);
        }
    })
}

fn run_deploy(path: Option<PathBuf>) {
    let root = configuration_root(path);
    if !root.is_dir() {
        eprintln!("Configuration root is not a directory: {}", root.display());
        process::exit(1);
    }

    let deployments_dir = root.join("deployments");
    if deployments_dir.is_dir() {
        if let Err(e) = std::fs::remove_dir_all(&deployments_dir) {
            eprintln!("Error clearing {}: {}", deployments_dir.display(), e);
            process::exit(1);
        }
    }

    let deployments = match manifest::load_fleet(&root) {
        Ok(deployments) => deployments,
        Err(e) => {
            eprintln!("Error loading fleet manifest: {}", e);
            process::exit(1);
        }
    };

    for deployment in &deployments {
        if let Err(e) = deployment.create() {
            eprintln!(
                "Error rendering {}: {}",
                deployment.identity().short_name(),
                e
            );
            process::exit(1);
        }
    }
    println!("Rendered {} deployment(s) under {}", deployments.len(), deployments_dir.display());
}

#[allow(clippy::too_many_arguments)]
fn run_run(
    application: &str,
    stripe: &str,
    instance: &str,
    hostname: Option<String>,
    pair: Option<(String, String)>,
    mode: &str,
    skip_validation: bool,
    settings_path: Option<PathBuf>,
    path: Option<PathBuf>,
) {
    let root = configuration_root(path);
    let location = match (hostname, pair) {
        (Some(hostname), _) => match Location::from_hostname(hostname) {
            Ok(location) => location,
            Err(e) => {
                eprintln!("Error resolving location: {}", e);
                process::exit(1);
            }
        },
        (None, Some((environment, data_center))) => Location::from_pair(environment, data_center),
        (None, None) => {
            eprintln!("Specify either --hostname or --environment with --data-center");
            process::exit(1);
        }
    };

    let settings = match settings_path {
        Some(ref path) => Settings::load(path),
        None => Settings::load_or_default(&root),
    };
    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error loading settings: {}", e);
            process::exit(1);
        }
    };
    let runner = DeploymentRunner::new(root, settings);

    let entry = match runner.find_entry(&location, application, stripe, instance) {
        Ok(entry) => entry,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    if mode == DOCKER_CONTAINER_MODE {
        let name = entry.identity.short_name();
        if let Err(e) = ctrlc::set_handler(move || {
            eprintln!("Interrupted; stopping container {}", name);
            stop_container(&name);
            process::exit(130);
        }) {
            tracing::warn!("failed to install interrupt handler: {}", e);
        }
    }

    match runner.run(&entry, mode, skip_validation) {
        Ok(status) => process::exit(status.code().unwrap_or(1)),
        Err(e) => {
            eprintln!("Error running {}: {}", entry.identity.short_name(), e);
            process::exit(1);
        }
    }
}

fn run_show_command(
    application: &str,
    stripe: &str,
    instance: &str,
    environment: Option<String>,
    data_center: Option<String>,
    mode: &str,
    path: Option<PathBuf>,
) {
    let root = configuration_root(path);
    let runner = DeploymentRunner::new(root, Settings::default());

    let entries = match runner.entries() {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("Error loading fleet manifest: {}", e);
            process::exit(1);
        }
    };
    let matches: Vec<_> = entries
        .into_iter()
        .filter(|entry| {
            entry.identity.application == application
                && entry.identity.stripe == stripe
                && entry.identity.instance == instance
                && environment
                    .as_deref()
                    .map_or(true, |e| entry.identity.environment == e)
                && data_center
                    .as_deref()
                    .map_or(true, |d| entry.identity.data_center == d)
        })
        .collect();

    let entry = match matches.as_slice() {
        [entry] => entry,
        [] => {
            eprintln!("No matching deployment in the fleet manifest.");
            process::exit(1);
        }
        _ => {
            eprintln!("Multiple deployments match; narrow with --environment/--data-center.");
            process::exit(1);
        }
    };

    let builder = match command_builder_for_mode(mode) {
        Some(builder) => builder,
        None => {
            eprintln!("Unknown mode '{}'", mode);
            process::exit(1);
        }
    };
    let deployment = match runner.deployment(entry) {
        Ok(deployment) => deployment,
        Err(e) => {
            eprintln!("Error constructing deployment: {}", e);
            process::exit(1);
        }
    };
    match builder.assemble(&deployment) {
        Ok(command) => println!("{}", command),
        Err(e) => {
            eprintln!("Error assembling command: {}", e);
            process::exit(1);
        }
    }
}

/// Stop and remove a container by name
fn stop_container(name: &str) {
    let filter = format!("name={}", name);
    let running = Command::new("docker")
        .args(["ps", "--all", "--filter", filter.as_str(), "--quiet"])
        .stderr(Stdio::null())
        .output();

    match running {
        Ok(output) if !output.stdout.is_empty() => {
            let _ = Command::new("docker")
                .args(["stop", name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            let _ = Command::new("docker")
                .args(["rm", name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            println!("Stopped {}", name);
        }
        Ok(_) => println!("No container named {}", name),
        Err(e) => {
            eprintln!("Error querying container runtime: {}", e);
            process::exit(1);
        }
    }
}
