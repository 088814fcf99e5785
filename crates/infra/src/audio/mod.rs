//! Platform-specific audio backend implementations using CPAL
//!
//! This module provides cross-platform device output through CPAL, which abstracts
//! platform-specific APIs:
//! - Windows: WASAPI
//! - Linux: ALSA/PulseAudio
//! - macOS: CoreAudio

pub mod cpal_backend;
pub mod lockfree_buffer;

pub use cpal_backend::*;
pub use lockfree_buffer::*;
