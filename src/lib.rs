//! Resource-aware model placement.
//!
//! Lyra decides where the pieces of a large model go before it is loaded,
//! and keeps trying cheaper placements when the accelerator runs out of
//! memory:
//!
//! | Tier | Placement | Entered when |
//! |------|-----------|--------------|
//! | **Accelerator** | Runtime-automatic (or an explicit map) with per-device budgets | First attempt |
//! | **Partial** | First N layers on the accelerator, the rest on host | Tier 1 ran out of memory |
//! | **Host** | Every component on host | Tier 2 ran out of memory |
//!
//! Failures that are not accelerator memory exhaustion stop the sequence
//! immediately and are returned unchanged.
//!
//! # Modules
//!
//! - [`config`]: placement document, resolution order, environment overrides
//! - [`placement`]: devices, device maps, assignments, and the tier planner
//! - [`loader`]: the progressive loader and failure classification
//! - [`system`]: memory detection and the model recommendation catalog

pub mod config;
pub mod loader;
pub mod placement;
pub mod system;
