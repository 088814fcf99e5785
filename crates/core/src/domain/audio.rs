//! Audio subsystem abstractions and domain models
//!
//! This module defines the platform-agnostic pieces every pipeline is built on:
//! media sources (the raw signal producers), the device output sink, and the
//! shared audio context that hands out pipeline capacity. Device-backed
//! implementations live in the `infra` crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur in the audio subsystem
#[derive(Debug, Error)]
pub enum AudioError {
    /// The audio subsystem could not be initialized for a source
    #[error("Audio initialization failed: {0}")]
    AudioInitFailed(String),

    /// Requested output device was not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Error in audio stream creation or processing
    #[error("Stream error: {0}")]
    StreamError(String),

    /// A notification found no receiver
    #[error("Notification delivery failed: {0}")]
    NotificationDeliveryFailed(String),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Stable identity token of one media source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(u64);

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

impl SourceId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocate a process-unique identity
    pub fn next() -> Self {
        Self(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source-{}", self.0)
    }
}

/// Audio sample rate in Hz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleRate {
    Hz44100,
    Hz48000,
    Hz96000,
    Custom(u32),
}

impl SampleRate {
    pub fn hz(&self) -> u32 {
        match self {
            SampleRate::Hz44100 => 44100,
            SampleRate::Hz48000 => 48000,
            SampleRate::Hz96000 => 96000,
            SampleRate::Custom(hz) => *hz,
        }
    }

    pub fn from_hz(hz: u32) -> Self {
        match hz {
            44100 => SampleRate::Hz44100,
            48000 => SampleRate::Hz48000,
            96000 => SampleRate::Hz96000,
            hz => SampleRate::Custom(hz),
        }
    }
}

/// Number of audio channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelCount {
    Mono,
    Stereo,
}

impl ChannelCount {
    pub fn count(&self) -> u16 {
        match self {
            ChannelCount::Mono => 1,
            ChannelCount::Stereo => 2,
        }
    }

    pub fn from_count(count: u16) -> Option<Self> {
        match count {
            1 => Some(ChannelCount::Mono),
            2 => Some(ChannelCount::Stereo),
            _ => None,
        }
    }
}

/// Configuration for the device output stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub sample_rate: SampleRate,
    pub channels: ChannelCount,
    pub buffer_size: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: SampleRate::Hz48000,
            channels: ChannelCount::Stereo,
            buffer_size: 512,
        }
    }
}

/// One playable element (audio or video) observed by the host
///
/// The core never owns a source: pipelines keep a `Weak` reference and must
/// tolerate the source disappearing at any time.
pub trait MediaSource: Send + Sync {
    /// Stable identity of this source
    fn id(&self) -> SourceId;

    /// Human-readable label for logs
    fn label(&self) -> String {
        self.id().to_string()
    }

    /// Whether the source is currently playing
    fn is_playing(&self) -> bool;

    /// Whether the source has a resolvable output route
    fn has_output_route(&self) -> bool;

    /// Pull raw interleaved samples, returning the number written
    fn read(&self, out: &mut [f32]) -> usize;
}

/// Device output sink that receives the processed signal
pub trait OutputSink: Send {
    /// Write interleaved samples, returning the number accepted
    fn write(&mut self, samples: &[f32]) -> Result<usize>;
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn write(&mut self, samples: &[f32]) -> Result<usize> {
        Ok(samples.len())
    }
}

/// Sink that keeps everything written to it in memory
#[derive(Debug, Default, Clone)]
pub struct CaptureSink {
    samples: Vec<f32>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl OutputSink for CaptureSink {
    fn write(&mut self, samples: &[f32]) -> Result<usize> {
        self.samples.extend_from_slice(samples);
        Ok(samples.len())
    }
}

/// Parameters the shared audio context is created with
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextSettings {
    pub sample_rate: SampleRate,
    pub channels: ChannelCount,
    /// Analyzer block length in samples
    pub analyzer_block: usize,
    /// Maximum number of live pipelines
    pub max_pipelines: usize,
}

impl ContextSettings {
    pub const MIN_ANALYZER_BLOCK: usize = 32;
    pub const MAX_ANALYZER_BLOCK: usize = 32768;
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            sample_rate: SampleRate::Hz48000,
            channels: ChannelCount::Stereo,
            analyzer_block: 2048,
            max_pipelines: 32,
        }
    }
}

/// Shared audio subsystem handle
///
/// Created lazily on the first attach. Every live pipeline holds one slot;
/// running out of slots is reported as `AudioInitFailed`.
#[derive(Debug)]
pub struct AudioContext {
    settings: ContextSettings,
    live: usize,
}

impl AudioContext {
    /// Initialize the audio context
    pub fn new(settings: ContextSettings) -> Result<Self> {
        if settings.sample_rate.hz() == 0 {
            return Err(AudioError::AudioInitFailed(
                "sample rate must be non-zero".to_string(),
            ));
        }
        let block = settings.analyzer_block;
        if !block.is_power_of_two()
            || !(ContextSettings::MIN_ANALYZER_BLOCK..=ContextSettings::MAX_ANALYZER_BLOCK)
                .contains(&block)
        {
            return Err(AudioError::AudioInitFailed(format!(
                "analyzer block {} must be a power of two in [{}, {}]",
                block,
                ContextSettings::MIN_ANALYZER_BLOCK,
                ContextSettings::MAX_ANALYZER_BLOCK
            )));
        }
        if settings.max_pipelines == 0 {
            return Err(AudioError::AudioInitFailed(
                "context has no pipeline capacity".to_string(),
            ));
        }

        info!(
            sample_rate = settings.sample_rate.hz(),
            channels = settings.channels.count(),
            "Audio context initialized"
        );
        Ok(Self { settings, live: 0 })
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    pub fn sample_rate(&self) -> u32 {
        self.settings.sample_rate.hz()
    }

    pub fn channels(&self) -> u16 {
        self.settings.channels.count()
    }

    /// Number of pipelines currently holding a slot
    pub fn live(&self) -> usize {
        self.live
    }

    /// Reserve a slot for a new pipeline
    pub fn acquire(&mut self) -> Result<()> {
        if self.live >= self.settings.max_pipelines {
            return Err(AudioError::AudioInitFailed(format!(
                "pipeline capacity exhausted ({} live)",
                self.live
            )));
        }
        self.live += 1;
        debug!(live = self.live, "Context slot acquired");
        Ok(())
    }

    /// Give back a slot
    pub fn release(&mut self) {
        self.live = self.live.saturating_sub(1);
        debug!(live = self.live, "Context slot released");
    }
}
