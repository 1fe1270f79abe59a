//! CLI `doctor` command: detect resources and print a placement report.

use anyhow::Result;

use lyra::config::DocumentFormat;
use lyra::placement::DeviceMapMode;
use lyra::system::{self, recommend};

use super::{format_gb, ConfigRequest};

/// Print detected resources, the resolved configuration and a suggestion.
pub fn doctor(request: &ConfigRequest) -> Result<()> {
    let resources = system::detect();
    let config = request.resolve()?;

    println!("Lyra Placement Report");
    println!("=====================");
    println!();
    println!("Resources:");
    println!("  Host RAM free:     {}", format_gb(resources.ram_gb));
    if resources.vram_gb > 0.0 {
        println!("  GPU VRAM free:     {}", format_gb(resources.vram_gb));
    } else {
        println!("  GPU VRAM free:     (no accelerator detected)");
    }
    println!("  Memory tier:       {}", system::memory_tier(resources));
    println!();

    println!("Configuration:");
    match request.path {
        Some(ref path) => println!("  Source:            {}", path.display()),
        None => println!("  Source:            default search"),
    }
    println!("  Workload:          {}", config.workload_identifier);
    println!("  Task:              {}", config.task);
    match config.device_map_mode {
        DeviceMapMode::Automatic => println!("  Device map:        auto"),
        DeviceMapMode::Host => println!("  Device map:        cpu"),
        DeviceMapMode::Explicit(ref map) => {
            println!("  Device map:        explicit ({} components)", map.len())
        }
    }
    println!("  Quantization:      {}", config.quantization_mode);
    println!(
        "  Fallback:          {}",
        if config.progressive_fallback_enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    if let Some(count) = config.accelerator_layer_fallback_count {
        println!("  GPU layers:        {count} of {}", config.layer_count);
    }
    println!();

    let suggested = system::suggested_budgets(resources);
    println!("Suggested budgets:");
    for (device, budget) in &suggested {
        println!("  {:<18} {}", format!("{device}:"), budget);
    }
    if config.memory_budgets.is_empty() {
        println!("  (none configured; pass --auto-select to apply these)");
    } else if config.memory_budgets != suggested {
        println!("  NOTE: configured budgets differ from the suggestion.");
    }
    println!();

    match recommend::recommend(resources, true) {
        Some(model) => {
            println!(
                "Recommended model:   {} ({}B, {})",
                model.model_id, model.parameters_b, model.category
            );
            if model.model_id != config.workload_identifier {
                println!("  Run `lyra --auto-select config init` to write a tuned configuration.");
            }
        }
        None => println!("Recommended model:   none fits the available memory"),
    }

    if tracing::enabled!(tracing::Level::DEBUG) {
        println!();
        print!("{}", config.to_document(DocumentFormat::Toml)?);
    }

    Ok(())
}
