//! Failure classification for load attempts.
//!
//! A load operation signals accelerator memory exhaustion by returning a
//! [`ResourceExhausted`] error. Failures from opaque runtimes that carry no
//! tag fall back to matching known out-of-memory messages anywhere in the
//! error chain.

use crate::config::ConfigError;
use crate::placement::{Device, PlacementError};

/// Message fragments (lowercase) that identify accelerator memory exhaustion.
const OOM_SIGNATURES: &[&str] = &[
    "cuda out of memory",
    "cuda error: out of memory",
    "cuda_error_out_of_memory",
    "outofmemoryerror",
    "hiperroroutofmemory",
    "hip out of memory",
    "gpu out of memory",
    "vram out of memory",
    "out of device memory",
    "failed to allocate device memory",
    "mps backend out of memory",
    "xpu out of memory",
    "_alloc_failed",
];

/// Fragments that tie a bare "out of memory" to the host allocator.
const HOST_ALLOCATOR_MARKERS: &[&str] = &[
    "cpu",
    "host memory",
    "system memory",
    "cannot allocate memory",
    "os error 12",
];

/// Whether a failed attempt may be retried with a more conservative placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Recoverable,
    Fatal,
}

/// Memory ran out on `device` while loading.
#[derive(Debug, thiserror::Error)]
#[error("{device} out of memory: {message}")]
pub struct ResourceExhausted {
    pub device: Device,
    pub message: String,
}

impl ResourceExhausted {
    pub fn new(device: Device, message: impl Into<String>) -> Self {
        Self {
            device,
            message: message.into(),
        }
    }
}

/// Classify a load failure. Pure: the error is only inspected.
///
/// Tagged errors decide first: accelerator exhaustion is recoverable, host
/// exhaustion and configuration or placement errors are fatal. Untagged
/// errors are recoverable only when a message in the chain matches a known
/// accelerator out-of-memory signature.
pub fn classify(failure: &anyhow::Error) -> Classification {
    for cause in failure.chain() {
        if let Some(exhausted) = cause.downcast_ref::<ResourceExhausted>() {
            return if exhausted.device.is_host() {
                Classification::Fatal
            } else {
                Classification::Recoverable
            };
        }
        if cause.is::<PlacementError>() || cause.is::<ConfigError>() {
            return Classification::Fatal;
        }
    }

    let matched = failure.chain().any(|cause| is_oom_message(&cause.to_string()));
    if matched {
        Classification::Recoverable
    } else {
        Classification::Fatal
    }
}

/// True when `message` reads like an accelerator out-of-memory report.
///
/// A bare "out of memory" counts unless the message names the host
/// allocator.
pub fn is_oom_message(message: &str) -> bool {
    let message = message.to_lowercase();
    if OOM_SIGNATURES.iter().any(|sig| message.contains(sig)) {
        return true;
    }
    message.contains("out of memory")
        && !HOST_ALLOCATOR_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
}
