//! Per-source signal chain
//!
//! A chain runs one source's raw output through a fixed sequence of stages:
//!
//! ```text
//! source -> compressor -> limiter -> mid EQ -> treble EQ -> gain -> analyzer -> sink
//! ```
//!
//! Dynamics act on the unequalized signal, the EQ shapes the spectrum before the
//! user gain scales it, and the analyzer sees exactly what is sent to the sink.
//! The order is fixed at creation and never reconnected.

use crate::domain::audio::{AudioContext, AudioError, MediaSource, Result, SourceId};
use crate::domain::dsp::{Compressor, CompressorParams, Effect, EqBand, GainStage, LevelAnalyzer};
use crate::domain::settings::{clamp_boost, clamp_eq_db, EqualizerSettings, SettingsState};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Center frequency of the mid band (Hz)
pub const MID_EQ_FREQUENCY: f32 = 2000.0;
/// Corner frequency of the treble shelf (Hz)
pub const TREBLE_EQ_FREQUENCY: f32 = 8000.0;
/// Default length of the boost ramp (ms)
pub const DEFAULT_BOOST_RAMP_MS: u32 = 50;

/// Shape of the buffers a chain processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLayout {
    pub sample_rate: u32,
    pub channels: u16,
    pub analyzer_block: usize,
    pub boost_ramp_ms: u32,
}

impl ChainLayout {
    pub fn from_context(context: &AudioContext, boost_ramp_ms: u32) -> Self {
        Self {
            sample_rate: context.sample_rate(),
            channels: context.channels(),
            analyzer_block: context.settings().analyzer_block,
            boost_ramp_ms,
        }
    }

    /// Boost ramp length in frames
    pub fn ramp_frames(&self) -> u32 {
        (u64::from(self.sample_rate) * u64::from(self.boost_ramp_ms) / 1000) as u32
    }
}

impl Default for ChainLayout {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            analyzer_block: 2048,
            boost_ramp_ms: DEFAULT_BOOST_RAMP_MS,
        }
    }
}

/// Stages of a live chain, in processing order
#[derive(Debug)]
struct Stages {
    compressor: Compressor,
    limiter: Compressor,
    mid_eq: EqBand,
    treble_eq: EqBand,
    gain: GainStage,
    analyzer: LevelAnalyzer,
}

impl Stages {
    fn ordered(&mut self) -> [&mut dyn Effect; 6] {
        [
            &mut self.compressor,
            &mut self.limiter,
            &mut self.mid_eq,
            &mut self.treble_eq,
            &mut self.gain,
            &mut self.analyzer,
        ]
    }
}

/// Processing chain bound to one media source
///
/// Holds only a weak reference to its source. Once disposed, every operation
/// is a no-op.
pub struct SignalChain {
    source_id: SourceId,
    source: Option<Weak<dyn MediaSource>>,
    layout: ChainLayout,
    boost_target: f32,
    equalizer: EqualizerSettings,
    stages: Option<Stages>,
}

impl SignalChain {
    /// Build the stage graph for `source`, seeded with `initial`
    pub fn create(
        source: &Arc<dyn MediaSource>,
        initial: SettingsState,
        layout: &ChainLayout,
    ) -> Result<Self> {
        if !source.has_output_route() {
            return Err(AudioError::AudioInitFailed(format!(
                "{} has no output route",
                source.label()
            )));
        }
        if layout.sample_rate == 0 || layout.channels == 0 || layout.analyzer_block == 0 {
            return Err(AudioError::AudioInitFailed(format!(
                "unusable chain layout: {:?}",
                layout
            )));
        }

        let sr = layout.sample_rate;
        let ch = layout.channels;
        let eq = initial.equalizer();
        let stages = Stages {
            compressor: Compressor::new(sr, ch, CompressorParams::leveling()),
            limiter: Compressor::limiter(sr, ch, CompressorParams::limiting()),
            mid_eq: EqBand::peaking(sr, ch, MID_EQ_FREQUENCY, eq.mid),
            treble_eq: EqBand::high_shelf(sr, ch, TREBLE_EQ_FREQUENCY, eq.treble),
            gain: GainStage::new(ch, initial.boost_gain()),
            analyzer: LevelAnalyzer::new(layout.analyzer_block, ch),
        };

        debug!(
            source = %source.id(),
            boost = initial.boost_gain(),
            mid_db = eq.mid,
            treble_db = eq.treble,
            "Signal chain created"
        );

        Ok(Self {
            source_id: source.id(),
            source: Some(Arc::downgrade(source)),
            layout: *layout,
            boost_target: initial.boost_gain(),
            equalizer: eq,
            stages: Some(stages),
        })
    }

    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    pub fn layout(&self) -> &ChainLayout {
        &self.layout
    }

    /// Upgrade the weak source reference, if the source is still alive
    pub fn source(&self) -> Option<Arc<dyn MediaSource>> {
        self.source.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_disposed(&self) -> bool {
        self.stages.is_none()
    }

    /// Ramp the gain stage to a new boost, clamped to [0, 6]
    ///
    /// Returns the clamped target. NaN keeps the current target.
    pub fn set_boost(&mut self, gain: f32) -> f32 {
        if !gain.is_nan() {
            self.boost_target = clamp_boost(gain);
        }
        let target = self.boost_target;
        let frames = self.layout.ramp_frames();
        if let Some(stages) = self.stages.as_mut() {
            stages.gain.ramp_to(target, frames);
            trace!(source = %self.source_id, target, frames, "Boost ramp started");
        }
        target
    }

    /// Apply new band gains immediately, each clamped to [-12, 12] dB
    pub fn set_equalizer(&mut self, mid_db: f32, treble_db: f32) -> EqualizerSettings {
        if !mid_db.is_nan() {
            self.equalizer.mid = clamp_eq_db(mid_db);
        }
        if !treble_db.is_nan() {
            self.equalizer.treble = clamp_eq_db(treble_db);
        }
        if let Some(stages) = self.stages.as_mut() {
            stages.mid_eq.set_gain(self.equalizer.mid);
            stages.treble_eq.set_gain(self.equalizer.treble);
        }
        self.equalizer
    }

    /// Live gain-stage value, mid-ramp values included; 0.0 once disposed
    pub fn current_gain(&self) -> f32 {
        self.stages.as_ref().map_or(0.0, |s| s.gain.value())
    }

    /// Gain value the stage is heading to
    pub fn boost_target(&self) -> f32 {
        self.boost_target
    }

    /// Set the live gain without a ramp
    ///
    /// A boost ramp in flight is kept: it continues from the new value and
    /// still arrives at `boost_target`.
    pub fn set_gain_immediate(&mut self, gain: f32) {
        if let Some(stages) = self.stages.as_mut() {
            stages.gain.set_value(clamp_boost(gain));
        }
    }

    pub fn equalizer(&self) -> EqualizerSettings {
        self.equalizer
    }

    /// Live band gains as configured on the stages
    pub fn band_gains(&self) -> Option<(f32, f32)> {
        self.stages
            .as_ref()
            .map(|s| (s.mid_eq.gain_db(), s.treble_eq.gain_db()))
    }

    pub fn analyzer(&self) -> Option<&LevelAnalyzer> {
        self.stages.as_ref().map(|s| &s.analyzer)
    }

    /// Analyzer access for hosts that measure the output themselves
    pub fn analyzer_mut(&mut self) -> Option<&mut LevelAnalyzer> {
        self.stages.as_mut().map(|s| &mut s.analyzer)
    }

    /// Stage names in processing order; empty once disposed
    pub fn stage_names(&self) -> Vec<String> {
        match self.stages.as_ref() {
            Some(s) => vec![
                s.compressor.name().to_string(),
                s.limiter.name().to_string(),
                s.mid_eq.name().to_string(),
                s.treble_eq.name().to_string(),
                s.gain.name().to_string(),
                s.analyzer.name().to_string(),
            ],
            None => Vec::new(),
        }
    }

    /// Run one interleaved block through every stage in order
    pub fn process(&mut self, buffer: &mut [f32]) -> Result<()> {
        let Some(stages) = self.stages.as_mut() else {
            return Ok(());
        };
        for stage in stages.ordered() {
            stage.process(buffer)?;
        }
        Ok(())
    }

    /// Pull a block from the source and process it
    ///
    /// Returns `false` with a silent buffer when the chain is disposed or the
    /// source is gone or paused.
    pub fn pull(&mut self, buffer: &mut [f32]) -> Result<bool> {
        buffer.fill(0.0);
        if self.is_disposed() {
            return Ok(false);
        }
        let Some(source) = self.source() else {
            return Ok(false);
        };
        if !source.is_playing() {
            return Ok(false);
        }

        let read = source.read(buffer).min(buffer.len());
        buffer[read..].fill(0.0);
        self.process(buffer)?;
        Ok(true)
    }

    /// Detach all stages. Safe to call repeatedly and after the source vanished.
    pub fn dispose(&mut self) {
        if self.stages.take().is_some() {
            self.source = None;
            debug!(source = %self.source_id, "Signal chain disposed");
        }
    }
}

impl std::fmt::Debug for SignalChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalChain")
            .field("source_id", &self.source_id)
            .field("boost_target", &self.boost_target)
            .field("equalizer", &self.equalizer)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
