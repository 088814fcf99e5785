//! Process-wide volume and equalizer settings
//!
//! `SettingsState` is the single record of what the user asked for. It is
//! owned by the pipeline registry and copied into every new chain, so chains
//! initialize consistently with the ones already running.

use serde::{Deserialize, Serialize};

/// Lowest boost gain (0%)
pub const BOOST_MIN: f32 = 0.0;
/// Highest boost gain (600%)
pub const BOOST_MAX: f32 = 6.0;
/// Unity boost (100%)
pub const DEFAULT_BOOST: f32 = 1.0;

pub const EQ_DB_MIN: f32 = -12.0;
pub const EQ_DB_MAX: f32 = 12.0;
pub const DEFAULT_MID_DB: f32 = 3.0;
pub const DEFAULT_TREBLE_DB: f32 = -3.0;

/// Clamp a boost gain to its documented range
#[inline]
pub fn clamp_boost(gain: f32) -> f32 {
    gain.clamp(BOOST_MIN, BOOST_MAX)
}

/// Clamp an equalizer band gain to its documented range
#[inline]
pub fn clamp_eq_db(gain_db: f32) -> f32 {
    gain_db.clamp(EQ_DB_MIN, EQ_DB_MAX)
}

/// Convert a volume percentage (100 = unity) to a boost gain
#[inline]
pub fn percent_to_gain(percent: f32) -> f32 {
    percent / 100.0
}

/// Two-band equalizer settings in dB
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EqualizerSettings {
    pub mid: f32,
    pub treble: f32,
}

impl EqualizerSettings {
    /// Create settings, clamping each band independently
    ///
    /// A NaN band falls back to its default.
    pub fn new(mid: f32, treble: f32) -> Self {
        let defaults = Self::default();
        Self {
            mid: if mid.is_nan() { defaults.mid } else { clamp_eq_db(mid) },
            treble: if treble.is_nan() { defaults.treble } else { clamp_eq_db(treble) },
        }
    }
}

impl Default for EqualizerSettings {
    fn default() -> Self {
        Self {
            mid: DEFAULT_MID_DB,
            treble: DEFAULT_TREBLE_DB,
        }
    }
}

/// Current global volume/EQ configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SettingsState {
    boost_gain: f32,
    equalizer: EqualizerSettings,
}

impl SettingsState {
    /// Clamped settings; NaN values fall back to the defaults
    pub fn new(boost_gain: f32, mid_db: f32, treble_db: f32) -> Self {
        let mut state = Self::default();
        state.set_boost(boost_gain);
        state.set_equalizer(mid_db, treble_db);
        state
    }

    pub fn boost_gain(&self) -> f32 {
        self.boost_gain
    }

    /// Boost expressed as a percentage of the original volume
    pub fn volume_percent(&self) -> f32 {
        self.boost_gain * 100.0
    }

    pub fn equalizer(&self) -> EqualizerSettings {
        self.equalizer
    }

    pub fn mid_gain_db(&self) -> f32 {
        self.equalizer.mid
    }

    pub fn treble_gain_db(&self) -> f32 {
        self.equalizer.treble
    }

    /// Store a new boost, clamped. NaN leaves the value unchanged.
    pub fn set_boost(&mut self, gain: f32) -> f32 {
        if !gain.is_nan() {
            self.boost_gain = clamp_boost(gain);
        }
        self.boost_gain
    }

    /// Store new band gains, each clamped. NaN leaves that band unchanged.
    pub fn set_equalizer(&mut self, mid_db: f32, treble_db: f32) -> EqualizerSettings {
        if !mid_db.is_nan() {
            self.equalizer.mid = clamp_eq_db(mid_db);
        }
        if !treble_db.is_nan() {
            self.equalizer.treble = clamp_eq_db(treble_db);
        }
        self.equalizer
    }
}

impl Default for SettingsState {
    fn default() -> Self {
        Self {
            boost_gain: DEFAULT_BOOST,
            equalizer: EqualizerSettings::default(),
        }
    }
}
