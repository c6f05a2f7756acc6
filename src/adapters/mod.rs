//! Low-rank deltas injected into backbone projections.

pub mod lora;
