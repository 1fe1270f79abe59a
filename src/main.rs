mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use lyra::config::{ConfigOverrides, QuantizationMode};
use lyra::system::recommend::SizeCategory;

#[derive(Parser)]
#[command(name = "lyra", version, about = "Resource-aware model placement for the Lyra assistant")]
struct Cli {
    /// Placement configuration document (TOML or JSON). Falls back to
    /// LYRA_MODEL_CONFIG, then the default search locations.
    #[arg(long, global = true)]
    model_config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `lyra=trace`. Defaults to LYRA_LOG_LEVEL or `info`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Override the workload (model) identifier.
    #[arg(long, global = true)]
    model_id: Option<String>,

    /// Override quantization: none, eight_bit, four_bit.
    #[arg(long, global = true)]
    quantization: Option<QuantizationMode>,

    /// Layers to keep on the accelerator in a partial split.
    #[arg(long, global = true)]
    gpu_layers: Option<usize>,

    /// Never retry a failed load with a degraded placement.
    #[arg(long, global = true)]
    no_fallback: bool,

    /// Pick model, budgets and quantization from detected resources.
    #[arg(long, global = true)]
    auto_select: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect or write the placement configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Dry-run progressive loading against simulated memory limits
    Plan {
        /// Free accelerator memory in GB (detected when omitted)
        #[arg(long)]
        vram_gb: Option<f64>,
        /// Free host memory in GB (detected when omitted)
        #[arg(long)]
        ram_gb: Option<f64>,
        /// Model size in billions of parameters (catalog value when omitted)
        #[arg(long)]
        params_b: Option<f64>,
        /// Print the attempt history as JSON
        #[arg(long)]
        json: bool,
    },
    /// Report detected resources and the suggested configuration
    Doctor,
    /// List catalog models suited to this machine
    Recommend {
        #[arg(long)]
        ram_gb: Option<f64>,
        #[arg(long)]
        vram_gb: Option<f64>,
        /// Prefer the smallest suitable model
        #[arg(long)]
        smallest: bool,
        /// Only list models of this size category
        #[arg(long)]
        category: Option<SizeCategory>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the resolved configuration as TOML
    Show,
    /// Write the resolved configuration to a file
    Init {
        /// Destination (default: config/model_config.toml)
        path: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the JSON Schema of the configuration document
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Log to stderr so stdout carries only command output.
    let level = cli
        .log_level
        .clone()
        .or_else(|| std::env::var("LYRA_LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".into());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let request = cli::ConfigRequest {
        path: cli
            .model_config
            .clone()
            .or_else(|| std::env::var_os("LYRA_MODEL_CONFIG").map(PathBuf::from)),
        overrides: ConfigOverrides {
            workload_identifier: cli.model_id.clone(),
            quantization_mode: cli.quantization,
            accelerator_layer_fallback_count: cli.gpu_layers,
            disable_fallback: cli.no_fallback,
        }
        .with_env()?,
        auto_select: cli.auto_select,
    };

    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Show => cli::config::show(&request)?,
            ConfigAction::Init { path, force } => cli::config::init(&request, path, force)?,
            ConfigAction::Schema => cli::config::schema()?,
        },
        Command::Plan {
            vram_gb,
            ram_gb,
            params_b,
            json,
        } => {
            let options = cli::plan::PlanOptions {
                vram_gb,
                ram_gb,
                params_b,
                json,
            };
            cli::plan::plan(&request, options).await?;
        }
        Command::Doctor => cli::doctor::doctor(&request)?,
        Command::Recommend {
            ram_gb,
            vram_gb,
            smallest,
            category,
        } => cli::recommend::recommend(ram_gb, vram_gb, smallest, category)?,
    }

    Ok(())
}
