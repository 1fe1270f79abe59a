use anyhow::Result;

use lyra::system::recommend::{self, ModelInfo, SizeCategory};
use lyra::system::{self, SystemResources};

/// List catalog models and the recommendation for the given (or detected) resources.
pub fn recommend(
    ram_gb: Option<f64>,
    vram_gb: Option<f64>,
    smallest: bool,
    category: Option<SizeCategory>,
) -> Result<()> {
    let resources = match (ram_gb, vram_gb) {
        (Some(ram_gb), Some(vram_gb)) => SystemResources { ram_gb, vram_gb },
        _ => {
            let detected = system::detect();
            SystemResources {
                ram_gb: ram_gb.unwrap_or(detected.ram_gb),
                vram_gb: vram_gb.unwrap_or(detected.vram_gb),
            }
        }
    };

    println!(
        "Models for {:.1} GB RAM / {:.1} GB VRAM",
        resources.ram_gb, resources.vram_gb
    );
    println!("{}", "=".repeat(40));

    let models: Vec<&ModelInfo> = match category {
        Some(category) => recommend::models_by_category(category).collect(),
        None => recommend::CATALOG.iter().collect(),
    };
    for model in models {
        let fits = if resources.ram_gb < model.min_ram_gb {
            "needs more RAM"
        } else if resources.vram_gb >= model.recommended_vram_gb {
            "full GPU"
        } else if resources.vram_gb >= model.min_vram_gb {
            "GPU, quantized"
        } else {
            "partial / CPU"
        };
        println!(
            "  {:<42} {:>5.1}B  {:<7} {}",
            model.model_id, model.parameters_b, model.category, fits
        );
    }
    println!();

    match recommend::recommend(resources, !smallest) {
        Some(model) => println!("Recommended: {} ({})", model.model_id, model.license),
        None => println!("No catalog model fits these resources."),
    }
    Ok(())
}
