//! Device placement vocabulary.
//!
//! Defines [`Device`] (an accelerator index or the host), [`DeviceMapMode`]
//! (automatic or an explicit component table), [`WorkloadLayout`] (the
//! components a workload is made of), and [`PlacementAssignment`] (the
//! concrete placement used for one load attempt). The [`planner`] module
//! turns a configuration into assignments.

pub mod planner;

use std::borrow::Cow;
use std::collections::BTreeMap;

use schemars::{json_schema, JsonSchema, Schema, SchemaGenerator};
use serde::{Deserialize, Serialize};

/// Component name → device.
pub type DeviceMap = BTreeMap<String, Device>;

/// Device identifier → advisory memory budget (e.g. `"8GB"`).
///
/// Budgets are passed through to the load operation untouched; nothing in
/// this crate enforces them.
pub type MemoryBudgets = BTreeMap<Device, String>;

/// Deserialize budgets keyed by device spelling (`"0"`, `"cuda:0"`, `"cpu"`).
///
/// Two keys naming the same device are an error. A `null` document value
/// yields no budgets.
pub fn deserialize_budgets<'de, D>(deserializer: D) -> Result<Option<MemoryBudgets>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let Some(raw) = Option::<BTreeMap<String, String>>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let mut budgets = MemoryBudgets::new();
    for (key, budget) in raw {
        let device: Device = key.parse().map_err(D::Error::custom)?;
        if budgets.insert(device, budget).is_some() {
            return Err(D::Error::custom(format!(
                "duplicate memory budget for {device} (key `{key}`)"
            )));
        }
    }
    Ok(Some(budgets))
}

/// A placement target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "DeviceRepr", into = "String")]
pub enum Device {
    /// Accelerator with its own memory pool, by index.
    Accelerator(u32),
    /// General-purpose system memory.
    Host,
}

impl Device {
    pub fn is_host(&self) -> bool {
        matches!(self, Self::Host)
    }

    /// Value form used in device maps handed to the load operation:
    /// accelerators as bare indices, the host as `"cpu"`.
    pub fn to_map_value(self) -> serde_json::Value {
        match self {
            Self::Accelerator(index) => serde_json::Value::from(index),
            Self::Host => serde_json::Value::from("cpu"),
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accelerator(index) => write!(f, "cuda:{index}"),
            Self::Host => f.write_str("cpu"),
        }
    }
}

impl std::str::FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "cpu" | "host" => return Ok(Self::Host),
            _ => {}
        }
        let index = s
            .strip_prefix("cuda:")
            .or_else(|| s.strip_prefix("gpu:"))
            .unwrap_or(s);
        index
            .parse::<u32>()
            .map(Self::Accelerator)
            .map_err(|_| format!("unknown device: {s}"))
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

/// Accepts both `0` and `"cuda:0"` in documents.
#[derive(Deserialize)]
#[serde(untagged)]
enum DeviceRepr {
    Index(u32),
    Name(String),
}

impl TryFrom<DeviceRepr> for Device {
    type Error = String;

    fn try_from(repr: DeviceRepr) -> Result<Self, Self::Error> {
        match repr {
            DeviceRepr::Index(index) => Ok(Self::Accelerator(index)),
            DeviceRepr::Name(name) => name.parse(),
        }
    }
}

impl JsonSchema for Device {
    fn schema_name() -> Cow<'static, str> {
        "Device".into()
    }

    fn json_schema(_generator: &mut SchemaGenerator) -> Schema {
        json_schema!({
            "description": "Accelerator index (0, \"0\", \"cuda:0\") or the host (\"cpu\")",
            "anyOf": [
                { "type": "integer", "minimum": 0 },
                { "type": "string" }
            ]
        })
    }
}

/// How the workload should be spread across devices on the first attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "DeviceMapRepr", into = "DeviceMapRepr")]
pub enum DeviceMapMode {
    /// Delegate to the load operation's own placement heuristic.
    #[default]
    Automatic,
    /// Fixed component → device table.
    Explicit(DeviceMap),
    /// Every component on the host (`"cpu"`).
    Host,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum DeviceMapRepr {
    Keyword(String),
    Table(DeviceMap),
}

impl TryFrom<DeviceMapRepr> for DeviceMapMode {
    type Error = String;

    fn try_from(repr: DeviceMapRepr) -> Result<Self, Self::Error> {
        match repr {
            DeviceMapRepr::Keyword(word) => match word.as_str() {
                "auto" | "automatic" => Ok(Self::Automatic),
                "cpu" | "host" => Ok(Self::Host),
                other => Err(format!(
                    "unsupported device map `{other}`: use \"auto\", \"cpu\" or a component table"
                )),
            },
            DeviceMapRepr::Table(map) => Ok(Self::Explicit(map)),
        }
    }
}

impl From<DeviceMapMode> for DeviceMapRepr {
    fn from(mode: DeviceMapMode) -> Self {
        match mode {
            DeviceMapMode::Automatic => Self::Keyword("auto".into()),
            DeviceMapMode::Host => Self::Keyword("cpu".into()),
            DeviceMapMode::Explicit(map) => Self::Table(map),
        }
    }
}

impl JsonSchema for DeviceMapMode {
    fn schema_name() -> Cow<'static, str> {
        "DeviceMapMode".into()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        let device = generator.subschema_for::<Device>();
        json_schema!({
            "description": "\"auto\", \"cpu\" or a table mapping component names to devices",
            "anyOf": [
                { "type": "string", "enum": ["auto", "automatic", "cpu", "host"] },
                { "type": "object", "additionalProperties": device }
            ]
        })
    }
}

/// Named components of a layered workload, in activation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadLayout {
    pub input_embedding: String,
    pub layers: Vec<String>,
    pub output_norm: String,
    pub output_head: String,
}

impl WorkloadLayout {
    /// Standard decoder-only layout with `layer_count` transformer blocks.
    pub fn decoder(layer_count: usize) -> Self {
        Self {
            input_embedding: "model.embed_tokens".into(),
            layers: (0..layer_count).map(|i| format!("model.layers.{i}")).collect(),
            output_norm: "model.norm".into(),
            output_head: "lm_head".into(),
        }
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Every component, embedding first and head last.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.input_embedding.as_str())
            .chain(self.layers.iter().map(String::as_str))
            .chain([self.output_norm.as_str(), self.output_head.as_str()])
    }

    /// Every component mapped to the host.
    pub fn all_host(&self) -> DeviceMap {
        self.components()
            .map(|name| (name.to_string(), Device::Host))
            .collect()
    }
}

/// One of the three progressively more conservative strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Automatic or configured placement, accelerator first.
    #[serde(rename = "accelerator")]
    Full,
    /// Leading layers on the accelerator, the rest on the host.
    Partial,
    /// Everything on the host.
    Host,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "accelerator",
            Self::Partial => "partial",
            Self::Host => "host",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The placement used for a single load attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlacementAssignment {
    /// Defer to automatic placement within the configured budgets.
    Automatic { budgets: MemoryBudgets },
    /// The configured explicit device map, verbatim.
    Explicit { map: DeviceMap },
    /// Leading `accelerator_layers` layers on `accelerator`, the rest on the host.
    Partial {
        accelerator: Device,
        accelerator_layers: usize,
        map: DeviceMap,
    },
    /// Every component on the host.
    AllHost { map: DeviceMap },
}

impl PlacementAssignment {
    pub fn tier(&self) -> Tier {
        match self {
            Self::Automatic { .. } | Self::Explicit { .. } => Tier::Full,
            Self::Partial { .. } => Tier::Partial,
            Self::AllHost { .. } => Tier::Host,
        }
    }

    /// The component table, or `None` for automatic placement.
    pub fn device_map(&self) -> Option<&DeviceMap> {
        match self {
            Self::Automatic { .. } => None,
            Self::Explicit { map } | Self::Partial { map, .. } | Self::AllHost { map } => Some(map),
        }
    }

    /// Budgets to hand to the load operation. Only automatic placement has any.
    pub fn budgets(&self) -> Option<&MemoryBudgets> {
        match self {
            Self::Automatic { budgets } => Some(budgets),
            _ => None,
        }
    }

    /// Device a component is placed on, if the assignment names it.
    pub fn device_for(&self, component: &str) -> Option<Device> {
        self.device_map()
            .and_then(|map| map.get(component))
            .copied()
    }

    /// True when every mapped component sits on the host.
    pub fn is_all_host(&self) -> bool {
        match self {
            Self::Automatic { .. } => false,
            Self::AllHost { .. } => true,
            Self::Explicit { map } | Self::Partial { map, .. } => {
                !map.is_empty() && map.values().all(Device::is_host)
            }
        }
    }

    /// `"auto"` or a component → device object, as the load operation expects it.
    pub fn to_device_map_value(&self) -> serde_json::Value {
        match self.device_map() {
            None => serde_json::Value::from("auto"),
            Some(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(name, device)| (name.clone(), device.to_map_value()))
                    .collect(),
            ),
        }
    }

    /// One-line description for logs and attempt history.
    pub fn summary(&self) -> String {
        match self {
            Self::Automatic { budgets } if budgets.is_empty() => "automatic".into(),
            Self::Automatic { budgets } => {
                let budgets: Vec<String> =
                    budgets.iter().map(|(d, b)| format!("{d}={b}")).collect();
                format!("automatic ({})", budgets.join(", "))
            }
            Self::Explicit { map } => format!("explicit ({} components)", map.len()),
            Self::Partial {
                accelerator,
                accelerator_layers,
                map,
            } => {
                let layers = map.len().saturating_sub(3);
                format!("partial ({accelerator_layers}/{layers} layers on {accelerator})")
            }
            Self::AllHost { .. } => "all host".into(),
        }
    }
}

/// Static contradictions in a configured placement. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("device map places `{component}` on {device}, which has no memory budget")]
    UnknownDevice { component: String, device: Device },
    #[error("explicit device map is empty")]
    EmptyDeviceMap,
}
