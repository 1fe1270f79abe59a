//! Model catalog and resource-based auto-selection.

use serde::Serialize;
use tracing::{info, warn};

use super::{suggested_budgets, SystemResources};
use crate::config::{PlacementConfig, QuantizationMode};
use crate::placement::DeviceMapMode;

/// Size category of a catalog model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeCategory {
    Small,
    Medium,
    Large,
}

impl SizeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

impl std::fmt::Display for SizeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SizeCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            _ => Err(format!("unknown size category: {s}")),
        }
    }
}

/// Resource requirements of a known model. Memory figures are in GB.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model_id: &'static str,
    pub category: SizeCategory,
    /// Parameters, in billions.
    pub parameters_b: f64,
    pub min_ram_gb: f64,
    pub min_vram_gb: f64,
    pub recommended_ram_gb: f64,
    pub recommended_vram_gb: f64,
    pub quantization: &'static [QuantizationMode],
    pub license: &'static str,
}

impl ModelInfo {
    pub fn supports(&self, mode: QuantizationMode) -> bool {
        mode == QuantizationMode::None || self.quantization.contains(&mode)
    }
}

const BOTH: &[QuantizationMode] = &[QuantizationMode::EightBit, QuantizationMode::FourBit];

/// Catalog of instruction-tuned models.
pub const CATALOG: &[ModelInfo] = &[
    ModelInfo {
        model_id: "Qwen/Qwen2.5-7B-Instruct",
        category: SizeCategory::Small,
        parameters_b: 7.0,
        min_ram_gb: 6.0,
        min_vram_gb: 4.0,
        recommended_ram_gb: 12.0,
        recommended_vram_gb: 8.0,
        quantization: BOTH,
        license: "Apache 2.0",
    },
    ModelInfo {
        model_id: "meta-llama/Llama-3.2-3B-Instruct",
        category: SizeCategory::Small,
        parameters_b: 3.0,
        min_ram_gb: 4.0,
        min_vram_gb: 2.0,
        recommended_ram_gb: 8.0,
        recommended_vram_gb: 4.0,
        quantization: BOTH,
        license: "Llama 3.2",
    },
    ModelInfo {
        model_id: "microsoft/Phi-3.5-mini-instruct",
        category: SizeCategory::Small,
        parameters_b: 3.8,
        min_ram_gb: 4.0,
        min_vram_gb: 2.5,
        recommended_ram_gb: 8.0,
        recommended_vram_gb: 5.0,
        quantization: BOTH,
        license: "MIT",
    },
    ModelInfo {
        model_id: "google/gemma-2-9b-it",
        category: SizeCategory::Small,
        parameters_b: 9.0,
        min_ram_gb: 8.0,
        min_vram_gb: 5.0,
        recommended_ram_gb: 16.0,
        recommended_vram_gb: 10.0,
        quantization: BOTH,
        license: "Gemma",
    },
    ModelInfo {
        model_id: "HuggingFaceTB/SmolLM-1.7B-Instruct",
        category: SizeCategory::Small,
        parameters_b: 1.7,
        min_ram_gb: 2.0,
        min_vram_gb: 1.0,
        recommended_ram_gb: 4.0,
        recommended_vram_gb: 2.0,
        quantization: BOTH,
        license: "Apache 2.0",
    },
    ModelInfo {
        model_id: "meta-llama/Meta-Llama-3.1-8B-Instruct",
        category: SizeCategory::Medium,
        parameters_b: 8.0,
        min_ram_gb: 8.0,
        min_vram_gb: 4.0,
        recommended_ram_gb: 16.0,
        recommended_vram_gb: 8.0,
        quantization: BOTH,
        license: "Llama 3.1",
    },
    ModelInfo {
        model_id: "mistralai/Mistral-Nemo-Instruct-2407",
        category: SizeCategory::Medium,
        parameters_b: 12.0,
        min_ram_gb: 12.0,
        min_vram_gb: 6.0,
        recommended_ram_gb: 24.0,
        recommended_vram_gb: 12.0,
        quantization: BOTH,
        license: "Apache 2.0",
    },
    ModelInfo {
        model_id: "Qwen/Qwen2.5-14B-Instruct",
        category: SizeCategory::Medium,
        parameters_b: 14.0,
        min_ram_gb: 16.0,
        min_vram_gb: 8.0,
        recommended_ram_gb: 28.0,
        recommended_vram_gb: 16.0,
        quantization: BOTH,
        license: "Apache 2.0",
    },
    ModelInfo {
        model_id: "google/gemma-2-27b-it",
        category: SizeCategory::Medium,
        parameters_b: 27.0,
        min_ram_gb: 32.0,
        min_vram_gb: 16.0,
        recommended_ram_gb: 48.0,
        recommended_vram_gb: 24.0,
        quantization: BOTH,
        license: "Gemma",
    },
    ModelInfo {
        model_id: "Qwen/Qwen2.5-32B-Instruct",
        category: SizeCategory::Medium,
        parameters_b: 32.0,
        min_ram_gb: 32.0,
        min_vram_gb: 16.0,
        recommended_ram_gb: 64.0,
        recommended_vram_gb: 32.0,
        quantization: BOTH,
        license: "Apache 2.0",
    },
    ModelInfo {
        model_id: "mistralai/Mixtral-8x7B-Instruct-v0.1",
        category: SizeCategory::Large,
        parameters_b: 46.7,
        min_ram_gb: 48.0,
        min_vram_gb: 20.0,
        recommended_ram_gb: 96.0,
        recommended_vram_gb: 40.0,
        quantization: BOTH,
        license: "Apache 2.0",
    },
    ModelInfo {
        model_id: "meta-llama/Llama-3.3-70B-Instruct",
        category: SizeCategory::Large,
        parameters_b: 70.0,
        min_ram_gb: 64.0,
        min_vram_gb: 32.0,
        recommended_ram_gb: 128.0,
        recommended_vram_gb: 64.0,
        quantization: BOTH,
        license: "Llama 3.3",
    },
    ModelInfo {
        model_id: "Qwen/Qwen2.5-72B-Instruct",
        category: SizeCategory::Large,
        parameters_b: 72.0,
        min_ram_gb: 64.0,
        min_vram_gb: 32.0,
        recommended_ram_gb: 144.0,
        recommended_vram_gb: 72.0,
        quantization: BOTH,
        license: "Apache 2.0",
    },
];

pub fn model_info(model_id: &str) -> Option<&'static ModelInfo> {
    CATALOG.iter().find(|m| m.model_id == model_id)
}

pub fn models_by_category(category: SizeCategory) -> impl Iterator<Item = &'static ModelInfo> {
    CATALOG.iter().filter(move |m| m.category == category)
}

/// Best catalog model for the given resources.
///
/// A model qualifies when its host minimum is met and it either fits the
/// accelerator, runs host-only (no accelerator), or can be quantized.
/// Candidates are ranked by category then size: largest first when
/// `prefer_performance`, smallest first otherwise.
pub fn recommend(resources: SystemResources, prefer_performance: bool) -> Option<&'static ModelInfo> {
    let mut suitable: Vec<&'static ModelInfo> = CATALOG
        .iter()
        .filter(|m| resources.ram_gb >= m.min_ram_gb)
        .filter(|m| {
            resources.vram_gb >= m.min_vram_gb
                || resources.vram_gb == 0.0
                || !m.quantization.is_empty()
        })
        .collect();

    if suitable.is_empty() {
        warn!(
            "no suitable models for {:.1}GB RAM, {:.1}GB VRAM",
            resources.ram_gb, resources.vram_gb
        );
        return None;
    }

    suitable.sort_by(|a, b| {
        a.category
            .cmp(&b.category)
            .then(a.parameters_b.total_cmp(&b.parameters_b))
    });
    let chosen = if prefer_performance {
        suitable.last().copied()
    } else {
        suitable.first().copied()
    };

    if let Some(model) = chosen {
        info!(model = model.model_id, parameters_b = model.parameters_b, "recommended model");
    }
    chosen
}

/// Configuration tuned to the detected resources.
///
/// Picks the recommended model, suggested budgets and quantization, and
/// places everything on the host when the accelerator has 1GB or less free.
/// Returns `base` unchanged when nothing in the catalog qualifies.
pub fn auto_select(base: &PlacementConfig, resources: SystemResources) -> PlacementConfig {
    let Some(model) = recommend(resources, true) else {
        warn!("could not auto-select a model, keeping configuration");
        return base.clone();
    };

    let mut config = base.clone();
    config.workload_identifier = model.model_id.to_string();
    config.memory_budgets = suggested_budgets(resources);
    config.progressive_fallback_enabled = true;

    if resources.vram_gb < model.min_vram_gb && model.supports(QuantizationMode::FourBit) {
        config.quantization_mode = QuantizationMode::FourBit;
        info!("enabled 4-bit quantization due to very limited VRAM");
    } else if resources.vram_gb < model.recommended_vram_gb
        && model.supports(QuantizationMode::EightBit)
    {
        config.quantization_mode = QuantizationMode::EightBit;
        info!("enabled 8-bit quantization due to limited VRAM");
    }

    config.device_map_mode = if resources.vram_gb > 1.0 {
        DeviceMapMode::Automatic
    } else {
        info!("using host-only placement due to insufficient VRAM");
        DeviceMapMode::Host
    };

    info!(model = model.model_id, "auto-selected model");
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::Device;

    fn resources(ram_gb: f64, vram_gb: f64) -> SystemResources {
        SystemResources { ram_gb, vram_gb }
    }

    #[test]
    fn lookup_by_id_and_category() {
        assert_eq!(model_info("google/gemma-2-9b-it").unwrap().parameters_b, 9.0);
        assert!(model_info("nope/nope").is_none());
        assert!(models_by_category(SizeCategory::Large).all(|m| m.category == SizeCategory::Large));
        assert_eq!(models_by_category(SizeCategory::Small).count(), 5);
    }

    #[test]
    fn recommends_nothing_below_smallest_host_minimum() {
        assert!(recommend(resources(1.0, 0.0), true).is_none());
    }

    #[test]
    fn prefers_largest_fitting_model() {
        let model = recommend(resources(20.0, 8.0), true).unwrap();
        assert_eq!(model.model_id, "Qwen/Qwen2.5-14B-Instruct");
    }

    #[test]
    fn smallest_first_when_not_preferring_performance() {
        let model = recommend(resources(20.0, 8.0), false).unwrap();
        assert_eq!(model.model_id, "HuggingFaceTB/SmolLM-1.7B-Instruct");
    }

    #[test]
    fn auto_select_quantizes_under_minimum_vram() {
        let config = auto_select(&PlacementConfig::default(), resources(20.0, 4.0));
        assert_eq!(config.workload_identifier, "Qwen/Qwen2.5-14B-Instruct");
        assert_eq!(config.quantization_mode, QuantizationMode::FourBit);
        assert_eq!(config.device_map_mode, DeviceMapMode::Automatic);
        assert_eq!(config.memory_budgets[&Device::Accelerator(0)], "3GB");
    }

    #[test]
    fn auto_select_without_accelerator_goes_host_only() {
        let config = auto_select(&PlacementConfig::default(), resources(10.0, 0.0));
        assert_eq!(config.device_map_mode, DeviceMapMode::Host);
        assert!(!config.memory_budgets.contains_key(&Device::Accelerator(0)));
    }
}
