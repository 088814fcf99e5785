//! ClearVolume core: per-source boost chains with clipping protection

pub mod domain;

pub use domain::*;
