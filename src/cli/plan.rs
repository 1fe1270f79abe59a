//! CLI `plan` command: dry-run the progressive loader against a simulated
//! machine to see which placement tier a workload would land on.

use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use lyra::config::PlacementConfig;
use lyra::loader::{AttemptOutcome, LoadAttempt, ProgressiveLoader, ResourceExhausted};
use lyra::placement::planner::primary_accelerator;
use lyra::placement::{Device, PlacementAssignment, WorkloadLayout};
use lyra::system::{self, recommend};

use super::{format_gb, ConfigRequest};

/// Parameter count assumed for workloads missing from the catalog.
const DEFAULT_PARAMS_B: f64 = 7.0;

pub struct PlanOptions {
    pub vram_gb: Option<f64>,
    pub ram_gb: Option<f64>,
    pub params_b: Option<f64>,
    pub json: bool,
}

/// Estimated weight sizes per component, in GB.
#[derive(Debug, Clone, Copy)]
struct Footprint {
    per_layer_gb: f64,
    embedding_gb: f64,
    head_gb: f64,
}

impl Footprint {
    /// Embedding and head take 5% each; layers share the rest evenly.
    fn estimate(params_b: f64, config: &PlacementConfig) -> Self {
        let total_gb = params_b * config.quantization_mode.bytes_per_parameter();
        let layers = config.layer_count.max(1) as f64;
        Self {
            per_layer_gb: total_gb * 0.9 / layers,
            embedding_gb: total_gb * 0.05,
            head_gb: total_gb * 0.05,
        }
    }

    fn component_gb(&self, layout: &WorkloadLayout, component: &str) -> f64 {
        if component == layout.input_embedding {
            self.embedding_gb
        } else if component == layout.output_head {
            self.head_gb
        } else if component == layout.output_norm {
            0.0
        } else {
            self.per_layer_gb
        }
    }
}

/// Where the simulated weights ended up.
#[derive(Debug, Clone, Copy)]
struct Placed {
    accelerator_gb: f64,
    host_gb: f64,
}

#[derive(Debug, Clone)]
struct SimulatedMachine {
    layout: WorkloadLayout,
    footprint: Footprint,
    vram_gb: f64,
    ram_gb: f64,
}

impl SimulatedMachine {
    /// Load the workload with `assignment`, failing the way a real runtime
    /// would when a device runs out of memory.
    fn load(&self, assignment: &PlacementAssignment, config: &PlacementConfig) -> Result<Placed> {
        let mut placed = Placed {
            accelerator_gb: 0.0,
            host_gb: 0.0,
        };

        for component in self.layout.components() {
            let gb = self.footprint.component_gb(&self.layout, component);
            // Automatic placement tries to fit everything on the accelerator.
            let device = match assignment {
                PlacementAssignment::Automatic { .. } => primary_accelerator(config),
                _ => assignment.device_for(component).unwrap_or(Device::Host),
            };
            if device.is_host() {
                placed.host_gb += gb;
            } else {
                placed.accelerator_gb += gb;
            }
        }

        if placed.accelerator_gb > self.vram_gb {
            return Err(ResourceExhausted::new(
                primary_accelerator(config),
                format!(
                    "tried to allocate {:.1} GB with {:.1} GB free",
                    placed.accelerator_gb, self.vram_gb
                ),
            )
            .into());
        }
        if placed.host_gb > self.ram_gb {
            return Err(ResourceExhausted::new(
                Device::Host,
                format!(
                    "tried to allocate {:.1} GB with {:.1} GB free",
                    placed.host_gb, self.ram_gb
                ),
            )
            .into());
        }
        Ok(placed)
    }
}

/// Run the progressive loader against simulated memory limits and print
/// every attempt.
pub async fn plan(request: &ConfigRequest, options: PlanOptions) -> Result<()> {
    let config = request.resolve()?;

    let detected = if options.vram_gb.is_none() || options.ram_gb.is_none() {
        Some(system::detect())
    } else {
        None
    };
    let vram_gb = options
        .vram_gb
        .or(detected.map(|r| r.vram_gb))
        .unwrap_or(0.0);
    let ram_gb = options
        .ram_gb
        .or(detected.map(|r| r.ram_gb))
        .unwrap_or(0.0);

    let params_b = options
        .params_b
        .or_else(|| recommend::model_info(&config.workload_identifier).map(|m| m.parameters_b))
        .unwrap_or(DEFAULT_PARAMS_B);

    let loader = ProgressiveLoader::for_config(&config);
    let machine = SimulatedMachine {
        layout: loader.planner().layout().clone(),
        footprint: Footprint::estimate(params_b, &config),
        vram_gb,
        ram_gb,
    };

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("  {spinner} {msg}")
            .context("invalid spinner template")?,
    );
    spinner.enable_steady_tick(Duration::from_millis(100));

    let run = loader
        .load_async_traced(&config, |assignment, config| {
            spinner.set_message(format!("loading: {}", assignment.summary()));
            let machine = machine.clone();
            async move {
                let placed =
                    tokio::task::spawn_blocking(move || machine.load(&assignment, &config)).await??;
                Ok::<_, anyhow::Error>(placed)
            }
        })
        .await;
    spinner.finish_and_clear();

    if options.json {
        let json = serde_json::to_string_pretty(&run.attempts).context("failed to render attempts")?;
        println!("{json}");
    } else {
        println!("Placement plan for {}", config.workload_identifier);
        println!("{}", "=".repeat(40));
        println!("  Parameters:        {params_b:.1}B ({})", config.quantization_mode);
        println!("  Layers:            {}", config.layer_count);
        println!("  Accelerator free:  {}", format_gb(vram_gb));
        println!("  Host free:         {}", format_gb(ram_gb));
        println!();
        for attempt in &run.attempts {
            print_attempt(attempt);
        }
        println!();
    }

    match run.result {
        Ok(placed) => {
            if !options.json {
                println!(
                    "Loaded: {} on accelerator, {} on host",
                    format_gb(placed.accelerator_gb),
                    format_gb(placed.host_gb)
                );
            }
            Ok(())
        }
        Err(e) => Err(anyhow!("simulated load failed after {} attempt(s): {e:#}", run.attempts.len())),
    }
}

fn print_attempt(attempt: &LoadAttempt) {
    let status = match attempt.outcome {
        AttemptOutcome::Success => "ok",
        AttemptOutcome::RecoverableFailure => "out of memory",
        AttemptOutcome::FatalFailure => "fatal",
    };
    println!(
        "  {}. [{}] {} -> {}",
        attempt.number,
        attempt.tier(),
        attempt.assignment.summary(),
        status
    );
    if let Some(ref failure) = attempt.failure {
        println!("     {failure}");
    }
}
