//! Placement configuration.
//!
//! [`PlacementConfig`] describes how a workload should be loaded. It is read
//! from a TOML or JSON document by the [`resolver`], optionally adjusted with
//! [`ConfigOverrides`], and treated as read-only afterwards.

pub mod resolver;

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::placement::{deserialize_budgets, Device, DeviceMapMode, MemoryBudgets};

pub use resolver::{ConfigError, ConfigResolver};

/// Default number of transformer layers assumed for a workload.
pub const DEFAULT_LAYER_COUNT: usize = 32;

/// Weight quantization requested from the load operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum QuantizationMode {
    #[default]
    None,
    #[serde(alias = "8bit")]
    EightBit,
    #[serde(alias = "4bit")]
    FourBit,
}

impl QuantizationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::EightBit => "eight_bit",
            Self::FourBit => "four_bit",
        }
    }

    /// Bytes per parameter for fp16 weights at this quantization.
    pub fn bytes_per_parameter(&self) -> f64 {
        match self {
            Self::None => 2.0,
            Self::EightBit => 1.0,
            Self::FourBit => 0.5,
        }
    }
}

impl std::fmt::Display for QuantizationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QuantizationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "eight_bit" | "8bit" => Ok(Self::EightBit),
            "four_bit" | "4bit" => Ok(Self::FourBit),
            _ => Err(format!("unknown quantization mode: {s}")),
        }
    }
}

/// Loading intent for one workload. Absent document fields take the
/// defaults from [`PlacementConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "ConfigDocument")]
pub struct PlacementConfig {
    /// Opaque identifier of the workload to load.
    pub workload_identifier: String,

    /// How the workload will be used, e.g. `"text-generation"`.
    pub task: String,

    /// `"auto"`, `"cpu"` or an explicit component → device table.
    pub device_map_mode: DeviceMapMode,

    /// Advisory per-device budgets, e.g. `{ "0" = "8GB", cpu = "16GB" }`.
    pub memory_budgets: MemoryBudgets,

    /// Ask the load operation to minimise transient memory while loading.
    pub low_resident_memory_mode: bool,

    /// Leading layers kept on the accelerator in a partial split.
    /// Half the layers when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accelerator_layer_fallback_count: Option<usize>,

    /// When false, the first failure is never retried.
    pub progressive_fallback_enabled: bool,

    pub quantization_mode: QuantizationMode,

    /// Passed through to the load operation unmodified.
    pub extra_load_options: serde_json::Map<String, serde_json::Value>,

    /// Number of layers in the workload.
    pub layer_count: usize,
}

/// On-disk form of [`PlacementConfig`].
///
/// Every field is optional and `null` means "use the default", so documents
/// written by older tools (legacy names, `null` placeholders and the
/// `load_in_8bit`/`load_in_4bit` flags) still load.
#[derive(Debug, Default, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
struct ConfigDocument {
    #[serde(alias = "model_id")]
    workload_identifier: Option<String>,
    task: Option<String>,
    #[serde(alias = "device_map")]
    device_map_mode: Option<DeviceMapMode>,
    #[serde(alias = "max_memory", deserialize_with = "deserialize_budgets")]
    #[schemars(with = "Option<BTreeMap<String, String>>")]
    memory_budgets: Option<MemoryBudgets>,
    #[serde(alias = "low_cpu_mem_usage")]
    low_resident_memory_mode: Option<bool>,
    #[serde(alias = "gpu_layers_fallback")]
    accelerator_layer_fallback_count: Option<usize>,
    #[serde(alias = "enable_progressive_fallback")]
    progressive_fallback_enabled: Option<bool>,
    quantization_mode: Option<QuantizationMode>,
    load_in_8bit: Option<bool>,
    load_in_4bit: Option<bool>,
    #[serde(alias = "pipeline_kwargs")]
    extra_load_options: Option<serde_json::Map<String, serde_json::Value>>,
    layer_count: Option<usize>,
}

impl ConfigDocument {
    /// `quantization_mode`, or the mode named by a legacy `load_in_*` flag.
    fn quantization(&self) -> Result<Option<QuantizationMode>, String> {
        let legacy = match (
            self.load_in_8bit.unwrap_or(false),
            self.load_in_4bit.unwrap_or(false),
        ) {
            (true, true) => return Err("load_in_8bit and load_in_4bit are both set".into()),
            (true, false) => Some(QuantizationMode::EightBit),
            (false, true) => Some(QuantizationMode::FourBit),
            (false, false) => None,
        };
        match (self.quantization_mode, legacy) {
            (Some(mode), Some(flag)) if mode != flag => Err(format!(
                "quantization_mode = {mode} conflicts with load_in_* = {flag}"
            )),
            (Some(mode), _) => Ok(Some(mode)),
            (None, flag) => Ok(flag),
        }
    }
}

impl TryFrom<ConfigDocument> for PlacementConfig {
    type Error = String;

    fn try_from(doc: ConfigDocument) -> Result<Self, Self::Error> {
        let defaults = PlacementConfig::default();
        let quantization_mode = doc.quantization()?.unwrap_or(defaults.quantization_mode);
        Ok(Self {
            workload_identifier: doc
                .workload_identifier
                .unwrap_or(defaults.workload_identifier),
            task: doc.task.unwrap_or(defaults.task),
            device_map_mode: doc.device_map_mode.unwrap_or(defaults.device_map_mode),
            memory_budgets: doc.memory_budgets.unwrap_or(defaults.memory_budgets),
            low_resident_memory_mode: doc
                .low_resident_memory_mode
                .unwrap_or(defaults.low_resident_memory_mode),
            accelerator_layer_fallback_count: doc.accelerator_layer_fallback_count,
            progressive_fallback_enabled: doc
                .progressive_fallback_enabled
                .unwrap_or(defaults.progressive_fallback_enabled),
            quantization_mode,
            extra_load_options: doc
                .extra_load_options
                .unwrap_or(defaults.extra_load_options),
            layer_count: doc.layer_count.unwrap_or(defaults.layer_count),
        })
    }
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            workload_identifier: "Qwen/Qwen2.5-7B-Instruct".into(),
            task: "text-generation".into(),
            device_map_mode: DeviceMapMode::Automatic,
            memory_budgets: MemoryBudgets::new(),
            low_resident_memory_mode: true,
            accelerator_layer_fallback_count: None,
            progressive_fallback_enabled: true,
            quantization_mode: QuantizationMode::None,
            extra_load_options: serde_json::Map::new(),
            layer_count: DEFAULT_LAYER_COUNT,
        }
    }
}

/// Returns `~/.lyra/`
pub fn default_lyra_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".lyra"))
}

/// Document format, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Toml,
    Json,
}

impl DocumentFormat {
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Toml,
        }
    }
}

impl PlacementConfig {
    /// Parse a document in the given format.
    pub fn from_document(contents: &str, format: DocumentFormat) -> Result<Self, String> {
        match format {
            DocumentFormat::Toml => toml::from_str(contents).map_err(|e| e.to_string()),
            DocumentFormat::Json => serde_json::from_str(contents).map_err(|e| e.to_string()),
        }
    }

    /// Render as a document in the given format.
    pub fn to_document(&self, format: DocumentFormat) -> Result<String> {
        match format {
            DocumentFormat::Toml => {
                toml::to_string_pretty(self).context("failed to serialize config as TOML")
            }
            DocumentFormat::Json => {
                serde_json::to_string_pretty(self).context("failed to serialize config as JSON")
            }
        }
    }

    /// Write the configuration to `path`, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let contents = self.to_document(DocumentFormat::for_path(path))?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write config to {}", path.display()))?;
        info!(path = %path.display(), "saved placement configuration");
        Ok(())
    }

    /// Keyword options for the load operation.
    ///
    /// Never contains `device_map`; placement comes from each attempt's
    /// assignment.
    pub fn load_options(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut options = serde_json::Map::new();

        if !self.memory_budgets.is_empty() {
            let budgets = self
                .memory_budgets
                .iter()
                .map(|(device, budget)| (budget_key(*device), budget.clone().into()))
                .collect();
            options.insert("max_memory".into(), serde_json::Value::Object(budgets));
        }
        if self.low_resident_memory_mode {
            options.insert("low_cpu_mem_usage".into(), true.into());
        }
        match self.quantization_mode {
            QuantizationMode::None => {}
            QuantizationMode::EightBit => {
                options.insert("load_in_8bit".into(), true.into());
            }
            QuantizationMode::FourBit => {
                options.insert("load_in_4bit".into(), true.into());
            }
        }

        for (key, value) in &self.extra_load_options {
            if key == "device_map" {
                warn!("ignoring device_map in extra_load_options; placement comes from the planner");
                continue;
            }
            options.insert(key.clone(), value.clone());
        }

        options
    }
}

fn budget_key(device: Device) -> String {
    match device {
        Device::Accelerator(index) => index.to_string(),
        Device::Host => "cpu".into(),
    }
}

/// Field overrides applied on top of a resolved configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub workload_identifier: Option<String>,
    pub quantization_mode: Option<QuantizationMode>,
    pub accelerator_layer_fallback_count: Option<usize>,
    pub disable_fallback: bool,
}

impl ConfigOverrides {
    /// Fill unset fields from `LYRA_MODEL_ID`, `LYRA_QUANTIZATION` and
    /// `LYRA_GPU_LAYERS`. Values already set are kept.
    pub fn with_env(mut self) -> Result<Self> {
        if self.workload_identifier.is_none() {
            self.workload_identifier = std::env::var("LYRA_MODEL_ID").ok();
        }
        if self.quantization_mode.is_none() {
            if let Ok(val) = std::env::var("LYRA_QUANTIZATION") {
                let mode: QuantizationMode = val.parse().map_err(anyhow::Error::msg)?;
                self.quantization_mode = Some(mode);
            }
        }
        if self.accelerator_layer_fallback_count.is_none() {
            if let Ok(val) = std::env::var("LYRA_GPU_LAYERS") {
                let count: usize = val
                    .parse()
                    .with_context(|| format!("LYRA_GPU_LAYERS must be a non-negative integer, got {val:?}"))?;
                self.accelerator_layer_fallback_count = Some(count);
            }
        }
        Ok(self)
    }

    /// Produce a new configuration with the overrides applied.
    pub fn apply(&self, base: &PlacementConfig) -> PlacementConfig {
        let mut config = base.clone();
        if let Some(ref id) = self.workload_identifier {
            config.workload_identifier = id.clone();
        }
        if let Some(mode) = self.quantization_mode {
            config.quantization_mode = mode;
        }
        if let Some(count) = self.accelerator_layer_fallback_count {
            config.accelerator_layer_fallback_count = Some(count);
        }
        if self.disable_fallback {
            config.progressive_fallback_enabled = false;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = PlacementConfig::default();
        assert_eq!(config.task, "text-generation");
        assert_eq!(config.device_map_mode, DeviceMapMode::Automatic);
        assert!(config.progressive_fallback_enabled);
        assert!(config.low_resident_memory_mode);
        assert_eq!(config.quantization_mode, QuantizationMode::None);
        assert_eq!(config.accelerator_layer_fallback_count, None);
        assert_eq!(config.layer_count, DEFAULT_LAYER_COUNT);
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
workload_identifier = "microsoft/phi-2"
accelerator_layer_fallback_count = 16
quantization_mode = "eight_bit"

[memory_budgets]
"0" = "8GB"
cpu = "16GB"
"#;
        let config: PlacementConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.workload_identifier, "microsoft/phi-2");
        assert_eq!(config.accelerator_layer_fallback_count, Some(16));
        assert_eq!(config.quantization_mode, QuantizationMode::EightBit);
        assert_eq!(config.memory_budgets[&Device::Accelerator(0)], "8GB");
        assert_eq!(config.memory_budgets[&Device::Host], "16GB");
        // defaults still apply for unset fields
        assert!(config.progressive_fallback_enabled);
        assert_eq!(config.task, "text-generation");
    }

    #[test]
    fn legacy_json_field_names_are_accepted() {
        let json = r#"{
            "model_id": "microsoft/phi-2",
            "device_map": "auto",
            "max_memory": {"0": "6GB", "cpu": "12GB"},
            "gpu_layers_fallback": 8,
            "enable_progressive_fallback": false
        }"#;
        let config = PlacementConfig::from_document(json, DocumentFormat::Json).unwrap();
        assert_eq!(config.workload_identifier, "microsoft/phi-2");
        assert_eq!(config.accelerator_layer_fallback_count, Some(8));
        assert!(!config.progressive_fallback_enabled);
        assert_eq!(config.memory_budgets.len(), 2);
    }

    /// `asdict(ModelConfig())` as written by the previous Python tooling.
    const LEGACY_DEFAULT_DOCUMENT: &str = r#"{
  "model_id": "Qwen/Qwen2.5-7B-Instruct",
  "task": "text-generation",
  "device_map": null,
  "max_memory": null,
  "low_cpu_mem_usage": true,
  "gpu_layers_fallback": null,
  "enable_progressive_fallback": true,
  "load_in_8bit": false,
  "load_in_4bit": false,
  "pipeline_kwargs": null
}"#;

    #[test]
    fn legacy_default_document_loads_as_defaults() {
        let config =
            PlacementConfig::from_document(LEGACY_DEFAULT_DOCUMENT, DocumentFormat::Json).unwrap();
        assert_eq!(config, PlacementConfig::default());
    }

    #[test]
    fn legacy_cpu_device_map_and_quantization_flags() {
        let json = r#"{
            "model_id": "microsoft/phi-2",
            "device_map": "cpu",
            "max_memory": {"cpu": "12GB"},
            "load_in_8bit": false,
            "load_in_4bit": true
        }"#;
        let config = PlacementConfig::from_document(json, DocumentFormat::Json).unwrap();
        assert_eq!(config.device_map_mode, DeviceMapMode::Host);
        assert_eq!(config.quantization_mode, QuantizationMode::FourBit);
        assert_eq!(config.memory_budgets[&Device::Host], "12GB");

        let eight = PlacementConfig::from_document(r#"{"load_in_8bit": true}"#, DocumentFormat::Json)
            .unwrap();
        assert_eq!(eight.quantization_mode, QuantizationMode::EightBit);
    }

    #[test]
    fn conflicting_quantization_settings_are_rejected() {
        let both = r#"{"load_in_8bit": true, "load_in_4bit": true}"#;
        assert!(PlacementConfig::from_document(both, DocumentFormat::Json).is_err());

        let mismatch = r#"{"quantization_mode": "four_bit", "load_in_8bit": true}"#;
        let err = PlacementConfig::from_document(mismatch, DocumentFormat::Json).unwrap_err();
        assert!(err.contains("conflicts"), "{err}");

        let agree = r#"{"quantization_mode": "eight_bit", "load_in_8bit": true}"#;
        let config = PlacementConfig::from_document(agree, DocumentFormat::Json).unwrap();
        assert_eq!(config.quantization_mode, QuantizationMode::EightBit);
    }

    #[test]
    fn duplicate_budget_device_is_rejected() {
        let json = r#"{"memory_budgets": {"0": "8GB", "cuda:0": "2GB"}}"#;
        let err = PlacementConfig::from_document(json, DocumentFormat::Json).unwrap_err();
        assert!(err.contains("duplicate memory budget"), "{err}");
    }

    #[test]
    fn wrong_field_type_is_rejected() {
        let err = PlacementConfig::from_document(
            "progressive_fallback_enabled = \"yes\"",
            DocumentFormat::Toml,
        );
        assert!(err.is_err());
    }

    #[test]
    fn unknown_field_is_rejected() {
        assert!(PlacementConfig::from_document("load_in_3bit = true", DocumentFormat::Toml).is_err());
    }

    #[test]
    fn toml_document_round_trips() {
        let mut config = PlacementConfig {
            accelerator_layer_fallback_count: Some(12),
            quantization_mode: QuantizationMode::FourBit,
            ..PlacementConfig::default()
        };
        config.memory_budgets.insert(Device::Accelerator(0), "8GB".into());
        config
            .extra_load_options
            .insert("trust_remote_code".into(), true.into());

        let doc = config.to_document(DocumentFormat::Toml).unwrap();
        let parsed = PlacementConfig::from_document(&doc, DocumentFormat::Toml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn load_options_never_carry_device_map() {
        let mut config = PlacementConfig {
            quantization_mode: QuantizationMode::EightBit,
            ..PlacementConfig::default()
        };
        config.memory_budgets.insert(Device::Accelerator(0), "8GB".into());
        config.memory_budgets.insert(Device::Host, "16GB".into());
        config
            .extra_load_options
            .insert("device_map".into(), "auto".into());
        config
            .extra_load_options
            .insert("max_new_tokens".into(), 256.into());

        let options = config.load_options();
        assert!(!options.contains_key("device_map"));
        assert_eq!(options["max_memory"]["0"], "8GB");
        assert_eq!(options["max_memory"]["cpu"], "16GB");
        assert_eq!(options["load_in_8bit"], true);
        assert_eq!(options["low_cpu_mem_usage"], true);
        assert_eq!(options["max_new_tokens"], 256);
    }

    #[test]
    fn overrides_produce_new_config() {
        let base = PlacementConfig::default();
        let overrides = ConfigOverrides {
            workload_identifier: Some("microsoft/phi-2".into()),
            quantization_mode: Some(QuantizationMode::FourBit),
            accelerator_layer_fallback_count: Some(4),
            disable_fallback: true,
        };
        let config = overrides.apply(&base);
        assert_eq!(config.workload_identifier, "microsoft/phi-2");
        assert_eq!(config.quantization_mode, QuantizationMode::FourBit);
        assert_eq!(config.accelerator_layer_fallback_count, Some(4));
        assert!(!config.progressive_fallback_enabled);
        // base untouched
        assert!(base.progressive_fallback_enabled);
    }

    #[test]
    fn env_overrides_fill_unset_fields() {
        std::env::set_var("LYRA_MODEL_ID", "env-model");
        std::env::set_var("LYRA_GPU_LAYERS", "6");

        let overrides = ConfigOverrides {
            workload_identifier: Some("flag-model".into()),
            ..ConfigOverrides::default()
        }
        .with_env()
        .unwrap();

        assert_eq!(overrides.workload_identifier.as_deref(), Some("flag-model"));
        assert_eq!(overrides.accelerator_layer_fallback_count, Some(6));

        // Clean up
        std::env::remove_var("LYRA_MODEL_ID");
        std::env::remove_var("LYRA_GPU_LAYERS");
    }
}
