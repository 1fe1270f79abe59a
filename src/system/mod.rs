//! Host and accelerator memory detection.
//!
//! Provides [`detect`] for the running machine, plus the pure helpers used to
//! turn a [`SystemResources`] snapshot into a memory tier and suggested
//! per-device budgets.

pub mod recommend;

use std::io::{self, Read};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::placement::{Device, MemoryBudgets};

/// Host memory assumed when `/proc/meminfo` cannot be read.
const FALLBACK_RAM_GB: f64 = 8.0;

/// Upper bound on how long `nvidia-smi` may take before it is killed.
const NVIDIA_SMI_TIMEOUT: Duration = Duration::from_secs(5);

/// Available memory at detection time, in GB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SystemResources {
    pub ram_gb: f64,
    /// Free memory on the first accelerator; 0 when none was found.
    pub vram_gb: f64,
}

/// Coarse size class of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    Small,
    Medium,
    Large,
}

impl MemoryTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

impl std::fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detect available host and accelerator memory.
pub fn detect() -> SystemResources {
    let ram_gb = match std::fs::read_to_string("/proc/meminfo") {
        Ok(contents) => parse_meminfo(&contents).unwrap_or_else(|| {
            warn!("MemAvailable missing from /proc/meminfo, assuming {FALLBACK_RAM_GB}GB");
            FALLBACK_RAM_GB
        }),
        Err(e) => {
            warn!("could not read /proc/meminfo: {e}, assuming {FALLBACK_RAM_GB}GB");
            FALLBACK_RAM_GB
        }
    };
    info!("detected {ram_gb:.1}GB available system RAM");

    let vram_gb = detect_vram_gb().unwrap_or(0.0);
    SystemResources { ram_gb, vram_gb }
}

fn detect_vram_gb() -> Option<f64> {
    let mut command = Command::new("nvidia-smi");
    command.args(["--query-gpu=memory.free", "--format=csv,noheader,nounits"]);
    let output = output_with_timeout(&mut command, NVIDIA_SMI_TIMEOUT);

    match output {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let vram = parse_nvidia_smi(&stdout);
            match vram {
                Some(gb) => info!("detected {gb:.1}GB available GPU VRAM"),
                None => debug!(output = %stdout, "unparseable nvidia-smi output"),
            }
            vram
        }
        Ok(_) => {
            info!("no NVIDIA GPU detected");
            None
        }
        Err(e) => {
            info!("could not detect GPU VRAM: {e}");
            None
        }
    }
}

/// Run `command` to completion, killing it once `timeout` has elapsed.
fn output_with_timeout(command: &mut Command, timeout: Duration) -> io::Result<Output> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            // Reap the child; an error here means it already exited.
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("timed out after {}s", timeout.as_secs()),
            ));
        }
        thread::sleep(Duration::from_millis(25));
    };

    let mut stdout = Vec::new();
    if let Some(mut pipe) = child.stdout.take() {
        pipe.read_to_end(&mut stdout)?;
    }
    Ok(Output {
        status,
        stdout,
        stderr: Vec::new(),
    })
}

/// `MemAvailable` from `/proc/meminfo` contents, in GB.
pub fn parse_meminfo(contents: &str) -> Option<f64> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb as f64 / (1024.0 * 1024.0))
}

/// Free memory of the first GPU from `nvidia-smi` CSV output (MiB), in GB.
pub fn parse_nvidia_smi(output: &str) -> Option<f64> {
    output
        .lines()
        .next()
        .and_then(|line| line.trim().parse::<u64>().ok())
        .map(|mb| mb as f64 / 1024.0)
}

/// Accelerator memory counts double towards the tier.
pub fn memory_tier(resources: SystemResources) -> MemoryTier {
    let total = resources.ram_gb + resources.vram_gb * 2.0;
    if total >= 32.0 {
        MemoryTier::Large
    } else if total >= 16.0 {
        MemoryTier::Medium
    } else {
        MemoryTier::Small
    }
}

/// Budgets leaving 1GB of accelerator memory and 4GB of host memory free.
///
/// The accelerator is only budgeted when more than 1GB is free.
pub fn suggested_budgets(resources: SystemResources) -> MemoryBudgets {
    let mut budgets = MemoryBudgets::new();
    if resources.vram_gb > 1.0 {
        let usable = (resources.vram_gb - 1.0).max(1.0);
        budgets.insert(Device::Accelerator(0), format!("{usable:.0}GB"));
    }
    let usable = (resources.ram_gb - 4.0).max(4.0);
    budgets.insert(Device::Host, format!("{usable:.0}GB"));
    budgets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn slow_command_is_killed_at_timeout() {
        let started = Instant::now();
        let err = output_with_timeout(Command::new("sleep").arg("10"), Duration::from_millis(200))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn fast_command_output_is_captured() {
        let output = output_with_timeout(Command::new("echo").arg("8192"), Duration::from_secs(5))
            .unwrap();
        assert!(output.status.success());
        assert_eq!(parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout)), Some(8.0));
    }

    #[test]
    fn parses_mem_available() {
        let meminfo = "MemTotal:       32768000 kB\nMemFree:         1000000 kB\nMemAvailable:   16777216 kB\n";
        assert_eq!(parse_meminfo(meminfo), Some(16.0));
        assert_eq!(parse_meminfo("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn parses_first_gpu_only() {
        assert_eq!(parse_nvidia_smi("8192\n4096\n"), Some(8.0));
        assert_eq!(parse_nvidia_smi("N/A\n"), None);
        assert_eq!(parse_nvidia_smi(""), None);
    }

    #[test]
    fn memory_tiers() {
        let tier = |ram_gb, vram_gb| memory_tier(SystemResources { ram_gb, vram_gb });
        assert_eq!(tier(32.0, 0.0), MemoryTier::Large);
        assert_eq!(tier(16.0, 8.0), MemoryTier::Large);
        assert_eq!(tier(8.0, 4.0), MemoryTier::Medium);
        assert_eq!(tier(8.0, 0.0), MemoryTier::Small);
    }

    #[test]
    fn budgets_reserve_headroom() {
        let budgets = suggested_budgets(SystemResources {
            ram_gb: 32.0,
            vram_gb: 12.0,
        });
        assert_eq!(budgets[&Device::Accelerator(0)], "11GB");
        assert_eq!(budgets[&Device::Host], "28GB");
    }

    #[test]
    fn budgets_skip_tiny_accelerators_and_floor_host() {
        let budgets = suggested_budgets(SystemResources {
            ram_gb: 6.0,
            vram_gb: 0.5,
        });
        assert!(!budgets.contains_key(&Device::Accelerator(0)));
        assert_eq!(budgets[&Device::Host], "4GB");
    }
}
