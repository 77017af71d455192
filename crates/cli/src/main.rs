use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use mixattn_cli::config::DriverConfig;
use mixattn_cli::logging;
use mixattn_cli::scenario::{run_scenario, workspace_report, Scenario};

#[derive(Parser)]
#[command(name = "mixattn", about = "Mixed context/generation attention driver")]
struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect the driver configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print the workspace sizes for a batch
    Workspace {
        /// Sequences in the batch
        #[arg(long, default_value_t = 8)]
        batch_size: usize,

        /// Config file (defaults to the user config path)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Build a synthetic batch and run the engine once on CPU
    Run {
        #[arg(long, value_enum, default_value_t = Scenario::Mixed)]
        scenario: Scenario,

        /// Config file (defaults to the user config path)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Seed for synthetic lengths and activations
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the default configuration as TOML
    Dump,
    /// Print the default config file location
    Path,
}

/// Config file given on the command line, else the user config, else defaults.
fn load_config(path: Option<&PathBuf>) -> anyhow::Result<DriverConfig> {
    match path {
        Some(path) => DriverConfig::load_from(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(DriverConfig::load()),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref());

    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Dump => {
                print!("{}", toml::to_string_pretty(&DriverConfig::with_defaults())?);
            }
            ConfigAction::Path => match DriverConfig::default_path() {
                Some(path) => println!("{}", path.display()),
                None => anyhow::bail!("no config directory available on this platform"),
            },
        },
        Command::Workspace { batch_size, config } => {
            let settings = load_config(config.as_ref())?.resolve();
            let report = workspace_report(&settings, batch_size)?;
            println!("context:    {} bytes", report.context_bytes);
            println!("generation: {} bytes", report.generation_bytes);
            println!("required:   {} bytes", report.required_bytes);
        }
        Command::Run {
            scenario,
            config,
            seed,
        } => {
            let mut file_config = load_config(config.as_ref())?;
            file_config.merge(&DriverConfig {
                seed,
                ..Default::default()
            });
            let settings = file_config.resolve();
            let report = run_scenario(scenario, &settings)?;
            println!(
                "{:?}: {} context requests ({} tokens), {} generation requests, output {:?}, workspace {} bytes, max |out| {:.4}",
                report.scenario,
                report.partition.num_context_requests,
                report.partition.context_token_count,
                report.partition.num_generation_requests,
                report.output_shape,
                report.workspace_bytes,
                report.output_max_abs,
            );
        }
    }
    Ok(())
}
