//! Placement planner: initial assignment and progressive degradation.
//!
//! Degradation walks three tiers: full accelerator (automatic or the
//! configured map), a partial split with the leading layers on the primary
//! accelerator, and finally everything on the host. Output depends only on
//! the configuration, the workload layout and the previous assignment.

use tracing::debug;

use super::{Device, DeviceMap, DeviceMapMode, PlacementAssignment, PlacementError, WorkloadLayout};
use crate::config::PlacementConfig;

/// Produces the assignment for each load attempt of one workload.
#[derive(Debug, Clone)]
pub struct Planner {
    layout: WorkloadLayout,
}

impl Planner {
    pub fn new(layout: WorkloadLayout) -> Self {
        Self { layout }
    }

    /// Planner for the standard decoder layout sized by `config.layer_count`.
    pub fn for_config(config: &PlacementConfig) -> Self {
        Self::new(WorkloadLayout::decoder(config.layer_count))
    }

    pub fn layout(&self) -> &WorkloadLayout {
        &self.layout
    }

    /// Assignment for the first attempt.
    ///
    /// An explicit device map is returned verbatim once every device it
    /// references is either the host or has a memory budget. Host mode
    /// starts on the all-host tier.
    pub fn initial_plan(&self, config: &PlacementConfig) -> Result<PlacementAssignment, PlacementError> {
        match &config.device_map_mode {
            DeviceMapMode::Automatic => Ok(PlacementAssignment::Automatic {
                budgets: config.memory_budgets.clone(),
            }),
            DeviceMapMode::Explicit(map) => {
                validate_explicit(map, config)?;
                Ok(PlacementAssignment::Explicit { map: map.clone() })
            }
            DeviceMapMode::Host => Ok(self.all_host()),
        }
    }

    /// Next, more conservative assignment after `previous` failed, or `None`
    /// when there is nothing left to try.
    pub fn degrade(
        &self,
        config: &PlacementConfig,
        previous: &PlacementAssignment,
        attempt: u32,
    ) -> Option<PlacementAssignment> {
        if !config.progressive_fallback_enabled {
            debug!(attempt, "progressive fallback disabled");
            return None;
        }

        match previous {
            PlacementAssignment::AllHost { .. } => None,
            PlacementAssignment::Partial { .. } => Some(self.all_host()),
            // A configured map that already keeps everything on the host
            // has no cheaper tier below it.
            PlacementAssignment::Explicit { .. } if previous.is_all_host() => None,
            PlacementAssignment::Automatic { .. } | PlacementAssignment::Explicit { .. } => {
                Some(self.partial(config))
            }
        }
    }

    /// Leading layers on the primary accelerator; the remaining layers,
    /// output norm and head on the host.
    pub fn partial(&self, config: &PlacementConfig) -> PlacementAssignment {
        let total = self.layout.layer_count();
        let accelerator_layers = config
            .accelerator_layer_fallback_count
            .unwrap_or(total / 2)
            .min(total);
        let accelerator = primary_accelerator(config);

        let mut map = DeviceMap::new();
        // Embedding follows the first layer so activations stay on one device.
        let embedding_device = if accelerator_layers > 0 {
            accelerator
        } else {
            Device::Host
        };
        map.insert(self.layout.input_embedding.clone(), embedding_device);

        for (i, layer) in self.layout.layers.iter().enumerate() {
            let device = if i < accelerator_layers {
                accelerator
            } else {
                Device::Host
            };
            map.insert(layer.clone(), device);
        }

        map.insert(self.layout.output_norm.clone(), Device::Host);
        map.insert(self.layout.output_head.clone(), Device::Host);

        PlacementAssignment::Partial {
            accelerator,
            accelerator_layers,
            map,
        }
    }

    pub fn all_host(&self) -> PlacementAssignment {
        PlacementAssignment::AllHost {
            map: self.layout.all_host(),
        }
    }
}

/// Lowest-indexed accelerator with a budget, else accelerator 0.
pub fn primary_accelerator(config: &PlacementConfig) -> Device {
    config
        .memory_budgets
        .keys()
        .copied()
        .find(|device| !device.is_host())
        .unwrap_or(Device::Accelerator(0))
}

fn validate_explicit(map: &DeviceMap, config: &PlacementConfig) -> Result<(), PlacementError> {
    if map.is_empty() {
        return Err(PlacementError::EmptyDeviceMap);
    }
    for (component, device) in map {
        if !device.is_host() && !config.memory_budgets.contains_key(device) {
            return Err(PlacementError::UnknownDevice {
                component: component.clone(),
                device: *device,
            });
        }
    }
    Ok(())
}
