//! Domain entities and business rules

pub mod audio;
pub mod chain;
pub mod config;
pub mod dsp;
pub mod events;
pub mod monitor;
pub mod registry;
pub mod settings;

#[cfg(test)]
pub(crate) mod testing;

// Re-export specific items to avoid ambiguous glob imports
pub use audio::{
    AudioContext, AudioError, CaptureSink, ChannelCount, ContextSettings, MediaSource, NullSink,
    OutputSink, SampleRate, SourceId, StreamConfig,
};
pub use chain::{ChainLayout, SignalChain};
pub use config::{
    ClearVolumeConfig, Command, CommandExecutor, CommandResult, ConfigError, ConfigManager,
};
pub use events::{ClippingDetected, NotificationHub, Notifier};
pub use monitor::{ClippingMonitor, MonitorSettings, MonitorState, StopReason, TickOutcome};
pub use registry::{
    AttachOutcome, PipelineHandle, PipelineRegistry, RegistryOptions, Status, TickSummary,
};
pub use settings::{EqualizerSettings, SettingsState};
