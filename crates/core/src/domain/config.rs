//! Configuration management for ClearVolume
//!
//! This module provides:
//! - Configuration structs for the engine, clipping protection, startup defaults and output
//! - TOML load/save and a manager for the per-user config file
//! - Command bus pattern for runtime state management

use crate::domain::audio::{ChannelCount, ContextSettings, MediaSource, SampleRate, SourceId, StreamConfig};
use crate::domain::monitor::MonitorSettings;
use crate::domain::registry::{RegistryOptions, Status};
use crate::domain::settings::{percent_to_gain, EqualizerSettings, SettingsState};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Processing engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Output channel count (1 or 2)
    pub channels: u16,

    /// Analyzer block length in samples (power of two)
    pub analyzer_block: usize,

    /// Maximum number of simultaneously processed sources
    pub max_pipelines: usize,

    /// Monitor ticks per second
    pub frame_rate_hz: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            analyzer_block: 2048,
            max_pipelines: 32,
            frame_rate_hz: 60,
        }
    }
}

/// Clipping protection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    /// Normalized peak above which gain is reduced
    pub clip_threshold: f32,

    /// Gain multiplier per detection
    pub attenuation: f32,

    /// Length of the volume ramp in milliseconds
    pub boost_ramp_ms: u32,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            clip_threshold: 0.9,
            attenuation: 0.95,
            boost_ramp_ms: 50,
        }
    }
}

/// Settings every run starts from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Volume in percent (100 = unity, up to 600)
    pub volume_percent: f32,

    /// Mid band gain in dB
    pub mid_db: f32,

    /// Treble shelf gain in dB
    pub treble_db: f32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        let eq = EqualizerSettings::default();
        Self {
            volume_percent: 100.0,
            mid_db: eq.mid,
            treble_db: eq.treble,
        }
    }
}

/// Device output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output device name (empty = system default)
    pub device: String,

    /// Device buffer size in frames
    pub buffer_frames: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            buffer_frames: 512,
        }
    }
}

impl OutputConfig {
    /// Requested device name, `None` for the system default
    pub fn device_name(&self) -> Option<&str> {
        let name = self.device.trim();
        (!name.is_empty()).then_some(name)
    }
}

/// Complete ClearVolume configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClearVolumeConfig {
    pub engine: EngineConfig,
    pub protection: ProtectionConfig,
    pub defaults: DefaultsConfig,
    pub output: OutputConfig,
}

impl ClearVolumeConfig {
    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }

    /// Create factory default configuration
    pub fn factory_default() -> Self {
        Self::default()
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.sample_rate == 0 {
            return Err(ConfigError::Invalid("engine.sample_rate must be non-zero".to_string()));
        }
        if ChannelCount::from_count(engine.channels).is_none() {
            return Err(ConfigError::Invalid(format!(
                "engine.channels must be 1 or 2, got {}",
                engine.channels
            )));
        }
        let block = engine.analyzer_block;
        if !block.is_power_of_two()
            || !(ContextSettings::MIN_ANALYZER_BLOCK..=ContextSettings::MAX_ANALYZER_BLOCK).contains(&block)
        {
            return Err(ConfigError::Invalid(format!(
                "engine.analyzer_block must be a power of two in [{}, {}], got {}",
                ContextSettings::MIN_ANALYZER_BLOCK,
                ContextSettings::MAX_ANALYZER_BLOCK,
                block
            )));
        }
        if engine.max_pipelines == 0 {
            return Err(ConfigError::Invalid("engine.max_pipelines must be at least 1".to_string()));
        }
        if engine.frame_rate_hz == 0 || engine.frame_rate_hz > 1000 {
            return Err(ConfigError::Invalid(format!(
                "engine.frame_rate_hz must be in [1, 1000], got {}",
                engine.frame_rate_hz
            )));
        }

        let protection = &self.protection;
        if !(protection.clip_threshold > 0.0 && protection.clip_threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "protection.clip_threshold must be in (0, 1], got {}",
                protection.clip_threshold
            )));
        }
        if !(protection.attenuation > 0.0 && protection.attenuation < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "protection.attenuation must be in (0, 1), got {}",
                protection.attenuation
            )));
        }

        let defaults = &self.defaults;
        for (key, value) in [
            ("defaults.volume_percent", defaults.volume_percent),
            ("defaults.mid_db", defaults.mid_db),
            ("defaults.treble_db", defaults.treble_db),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::Invalid(format!("{} must be a finite number, got {}", key, value)));
            }
        }

        if self.output.buffer_frames == 0 {
            return Err(ConfigError::Invalid("output.buffer_frames must be non-zero".to_string()));
        }

        Ok(())
    }

    /// Startup settings, clamped to their ranges
    pub fn initial_settings(&self) -> SettingsState {
        SettingsState::new(
            percent_to_gain(self.defaults.volume_percent),
            self.defaults.mid_db,
            self.defaults.treble_db,
        )
    }

    /// Shared context parameters
    pub fn context_settings(&self) -> ContextSettings {
        ContextSettings {
            sample_rate: SampleRate::from_hz(self.engine.sample_rate),
            channels: ChannelCount::from_count(self.engine.channels).unwrap_or(ChannelCount::Stereo),
            analyzer_block: self.engine.analyzer_block,
            max_pipelines: self.engine.max_pipelines,
        }
    }

    /// Device stream parameters
    pub fn stream_config(&self) -> StreamConfig {
        let context = self.context_settings();
        StreamConfig {
            sample_rate: context.sample_rate,
            channels: context.channels,
            buffer_size: self.output.buffer_frames,
        }
    }

    /// Frames rendered per monitor tick
    pub fn frames_per_tick(&self) -> usize {
        (self.engine.sample_rate / self.engine.frame_rate_hz.max(1)).max(1) as usize
    }
}

impl From<&ClearVolumeConfig> for RegistryOptions {
    fn from(config: &ClearVolumeConfig) -> Self {
        Self {
            context: config.context_settings(),
            monitor: MonitorSettings {
                clip_threshold: config.protection.clip_threshold,
                attenuation: config.protection.attenuation,
            },
            boost_ramp_ms: config.protection.boost_ramp_ms,
            initial: config.initial_settings(),
        }
    }
}

/// Command types for runtime state management
#[derive(Clone)]
pub enum Command {
    /// Start processing a newly observed source
    Attach { source: Arc<dyn MediaSource> },
    /// Stop processing a source
    Detach { id: SourceId },
    /// Set the boost as a percentage (100 = unity)
    SetVolume { percent: f32 },
    /// Set the boost as a linear gain
    SetBoost { gain: f32 },
    SetEqualizer { mid_db: f32, treble_db: f32 },
    GetStatus,
    /// Drop pipelines whose source went away
    Prune,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Attach { source } => f.debug_struct("Attach").field("source", &source.id()).finish(),
            Command::Detach { id } => f.debug_struct("Detach").field("id", id).finish(),
            Command::SetVolume { percent } => f.debug_struct("SetVolume").field("percent", percent).finish(),
            Command::SetBoost { gain } => f.debug_struct("SetBoost").field("gain", gain).finish(),
            Command::SetEqualizer { mid_db, treble_db } => f
                .debug_struct("SetEqualizer")
                .field("mid_db", mid_db)
                .field("treble_db", treble_db)
                .finish(),
            Command::GetStatus => f.write_str("GetStatus"),
            Command::Prune => f.write_str("Prune"),
        }
    }
}

/// Result of command execution
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Ok,
    Attached { id: SourceId },
    AlreadyAttached { id: SourceId },
    Skipped { id: SourceId },
    Detached { id: SourceId, existed: bool },
    VolumeChanged { boost_gain: f32, volume_percent: f32 },
    EqualizerChanged { equalizer: EqualizerSettings },
    Status(Status),
    Pruned { count: usize },
    Error(String),
}

/// Trait for command execution
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: Command) -> CommandResult;
}

/// Configuration manager
///
/// Manages the main configuration file at `~/.config/clearvolume/config.toml`.
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a manager for `config_dir/config.toml`
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("config.toml");
        Self {
            config_dir,
            config_path,
        }
    }

    /// Manager for an explicit file path
    pub fn for_file(config_path: PathBuf) -> Self {
        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            config_dir,
            config_path,
        }
    }

    /// Get the default config directory path
    ///
    /// Returns `~/.config/clearvolume` on Linux, the platform equivalent elsewhere
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("clearvolume"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from file
    ///
    /// If the config file doesn't exist, writes and returns the factory default.
    /// If the config file is corrupt, backs it up and returns the factory default.
    #[instrument(skip(self))]
    pub async fn load(&self) -> ClearVolumeConfig {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, creating factory default"
            );

            let config = ClearVolumeConfig::factory_default();
            if let Err(e) = config.save_to_file(&self.config_path).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save factory default config"
                );
            }

            return config;
        }

        match ClearVolumeConfig::load_from_file(&self.config_path).await {
            Ok(config) => config,
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load config, using factory default"
                );

                let backup_path = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt config"
                    );
                }

                ClearVolumeConfig::factory_default()
            }
        }
    }

    /// Save configuration to file
    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &ClearVolumeConfig) -> Result<()> {
        fs::create_dir_all(&self.config_dir).await?;
        config.save_to_file(&self.config_path).await
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::settings::{BOOST_MAX, EQ_DB_MAX};
    use tempfile::TempDir;

    #[test]
    fn test_config_serialization() {
        let config = ClearVolumeConfig::factory_default();

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: ClearVolumeConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.engine.sample_rate, parsed.engine.sample_rate);
        assert_eq!(config.protection.attenuation, parsed.protection.attenuation);
        assert_eq!(config.defaults.mid_db, parsed.defaults.mid_db);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: ClearVolumeConfig = toml::from_str(
            r#"
            [defaults]
            volume_percent = 250.0
            "#,
        )
        .unwrap();

        assert_eq!(parsed.engine.analyzer_block, 2048);
        assert_eq!(parsed.protection.clip_threshold, 0.9);
        assert_eq!(parsed.initial_settings().boost_gain(), 2.5);
        assert_eq!(parsed.initial_settings().mid_gain_db(), 3.0);
    }

    #[test]
    fn test_initial_settings_are_clamped() {
        let mut config = ClearVolumeConfig::default();
        config.defaults.volume_percent = 1000.0;
        config.defaults.treble_db = -40.0;

        let settings = config.initial_settings();
        assert_eq!(settings.boost_gain(), BOOST_MAX);
        assert_eq!(settings.treble_gain_db(), -EQ_DB_MAX);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ClearVolumeConfig::default();
        assert!(config.validate().is_ok());

        config.engine.sample_rate = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = ClearVolumeConfig::default();
        config.engine.analyzer_block = 1500;
        assert!(config.validate().is_err());

        let mut config = ClearVolumeConfig::default();
        config.protection.attenuation = 1.0;
        assert!(config.validate().is_err());

        let mut config = ClearVolumeConfig::default();
        config.protection.clip_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = ClearVolumeConfig::default();
        config.engine.channels = 6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_finite_defaults() {
        let config: ClearVolumeConfig = toml::from_str("[defaults]\nvolume_percent = nan\n").unwrap();
        assert!(config.defaults.volume_percent.is_nan());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = ClearVolumeConfig::default();
        config.defaults.treble_db = f32::INFINITY;
        assert!(config.validate().is_err());

        // Unvalidated values still never reach a chain as NaN
        let mut config = ClearVolumeConfig::default();
        config.defaults.volume_percent = f32::NAN;
        config.defaults.mid_db = f32::NAN;
        assert_eq!(config.initial_settings(), SettingsState::default());
    }

    #[tokio::test]
    async fn test_manager_falls_back_on_nan_default() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        tokio::fs::write(&path, "[defaults]\nvolume_percent = nan\n").await.unwrap();

        assert!(matches!(
            ClearVolumeConfig::load_from_file(&path).await,
            Err(ConfigError::Invalid(_))
        ));
        let config = ConfigManager::for_file(path).load().await;
        assert_eq!(config.initial_settings().boost_gain(), 1.0);
    }

    #[test]
    fn test_registry_options_from_config() {
        let mut config = ClearVolumeConfig::default();
        config.protection.attenuation = 0.8;
        config.engine.sample_rate = 44100;

        let options = RegistryOptions::from(&config);
        assert_eq!(options.monitor.attenuation, 0.8);
        assert_eq!(options.context.sample_rate, SampleRate::Hz44100);
        assert_eq!(options.boost_ramp_ms, 50);
        assert_eq!(options.initial, SettingsState::default());
        assert_eq!(config.frames_per_tick(), 735);
    }

    #[test]
    fn test_output_device_name() {
        let mut output = OutputConfig::default();
        assert_eq!(output.device_name(), None);
        output.device = "  Speakers ".to_string();
        assert_eq!(output.device_name(), Some("Speakers"));
    }

    #[tokio::test]
    async fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let mut config = ClearVolumeConfig::factory_default();
        config.defaults.volume_percent = 180.0;
        config.save_to_file(&config_path).await.unwrap();

        assert!(config_path.exists());

        let loaded = ClearVolumeConfig::load_from_file(&config_path).await.unwrap();
        assert_eq!(loaded.defaults.volume_percent, 180.0);
        assert_eq!(loaded.engine.max_pipelines, config.engine.max_pipelines);
    }

    #[tokio::test]
    async fn test_manager_creates_factory_default() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(temp_dir.path().join("clearvolume"));
        assert!(!manager.exists());

        let config = manager.load().await;
        assert_eq!(config.engine.sample_rate, 48000);
        assert!(manager.exists());
    }

    #[tokio::test]
    async fn test_manager_backs_up_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        tokio::fs::write(&path, "engine = [not toml").await.unwrap();

        let manager = ConfigManager::for_file(path.clone());
        let config = manager.load().await;

        assert_eq!(config.defaults.volume_percent, 100.0);
        assert!(path.with_extension("toml.corrupt").exists());
    }

    #[tokio::test]
    async fn test_manager_rejects_invalid_values() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        tokio::fs::write(&path, "[protection]\nattenuation = 2.0\n").await.unwrap();

        assert!(matches!(
            ClearVolumeConfig::load_from_file(&path).await,
            Err(ConfigError::Invalid(_))
        ));
        let config = ConfigManager::for_file(path).load().await;
        assert_eq!(config.protection.attenuation, 0.95);
    }

    #[test]
    fn test_command_debug_hides_source_internals() {
        let command = Command::Detach { id: SourceId::new(4) };
        assert!(format!("{:?}", command).contains("Detach"));
        assert_eq!(format!("{:?}", Command::GetStatus), "GetStatus");
    }
}
