#![allow(dead_code)]

use std::cell::RefCell;
use std::path::PathBuf;

use anyhow::Result;
use lyra::config::PlacementConfig;
use lyra::loader::ResourceExhausted;
use lyra::placement::{Device, PlacementAssignment};
use tempfile::TempDir;

/// Write `contents` to `name` inside `dir` and return the full path.
pub fn write_config(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, contents).unwrap();
    path
}

/// Configuration with `layers` layers and an optional partial-split count.
pub fn test_config(layers: usize, fallback_count: Option<usize>) -> PlacementConfig {
    PlacementConfig {
        workload_identifier: "test/model".into(),
        layer_count: layers,
        accelerator_layer_fallback_count: fallback_count,
        ..PlacementConfig::default()
    }
}

/// An accelerator out-of-memory failure as a runtime would raise it.
pub fn accelerator_oom(attempt: usize) -> anyhow::Error {
    ResourceExhausted::new(
        Device::Accelerator(0),
        format!("attempt {attempt}: tried to allocate 2.00 GiB"),
    )
    .into()
}

/// Load operation that records every assignment it is called with and
/// fails with accelerator OOM until `succeed_on` (1-based), if any.
pub struct ScriptedLoad {
    pub succeed_on: Option<usize>,
    pub calls: RefCell<Vec<PlacementAssignment>>,
}

impl ScriptedLoad {
    pub fn always_oom() -> Self {
        Self {
            succeed_on: None,
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn succeed_on(attempt: usize) -> Self {
        Self {
            succeed_on: Some(attempt),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn call(&self, assignment: &PlacementAssignment, _config: &PlacementConfig) -> Result<String> {
        let mut calls = self.calls.borrow_mut();
        calls.push(assignment.clone());
        let attempt = calls.len();
        if self.succeed_on == Some(attempt) {
            Ok(format!("loaded on attempt {attempt}"))
        } else {
            Err(accelerator_oom(attempt))
        }
    }

    pub fn calls(&self) -> Vec<PlacementAssignment> {
        self.calls.borrow().clone()
    }
}
