//! Digital Signal Processing stages for the boost chain
//!
//! This module provides the building blocks of a signal chain:
//! - Biquad-based equalizer bands (peaking and high shelf)
//! - Feed-forward dynamics processor, used both as compressor and limiter
//! - Gain stage with linear ramping
//! - Level analyzer keeping the most recent block of output samples
//!
//! All stages process interleaved f32 buffers normalized to [-1.0, 1.0] in
//! place, and never allocate in the hot path.

use crate::domain::audio::Result;
use tracing::trace;

/// Core trait for all processing stages
pub trait Effect: Send {
    /// Process a buffer of interleaved samples in-place
    fn process(&mut self, buffer: &mut [f32]) -> Result<()>;

    /// Stage name for debugging/display
    fn name(&self) -> &str;
}

/// Parameter constraints for DSP stages
pub mod params {
    /// Floor used when converting silence to dB
    pub const DB_FLOOR: f32 = -100.0;

    /// Dynamics threshold range (dB)
    pub const THRESHOLD_MIN: f32 = -100.0;
    pub const THRESHOLD_MAX: f32 = 0.0;

    /// Dynamics ratio range (1:1 to 20:1)
    pub const RATIO_MIN: f32 = 1.0;
    pub const RATIO_MAX: f32 = 20.0;

    /// Attack/Release time ranges in seconds
    pub const ATTACK_MIN: f32 = 0.0;
    pub const ATTACK_MAX: f32 = 1.0;
    pub const RELEASE_MIN: f32 = 0.0;
    pub const RELEASE_MAX: f32 = 1.0;

    /// Makeup gain range (dB)
    pub const MAKEUP_MAX: f32 = 24.0;

    /// Equalizer band gain range (dB)
    pub const EQ_GAIN_MIN: f32 = -12.0;
    pub const EQ_GAIN_MAX: f32 = 12.0;

    /// Lowest usable band frequency (Hz)
    pub const FREQ_MIN: f32 = 10.0;
    /// Highest usable band frequency as a fraction of the sample rate
    pub const FREQ_MAX_RATIO: f32 = 0.45;
}

/// Convert decibels to a linear amplitude factor
#[inline]
pub fn db_to_gain(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Convert a linear amplitude factor to decibels (with floor)
#[inline]
pub fn gain_to_db(level: f32) -> f32 {
    if level < 1e-5 {
        params::DB_FLOOR
    } else {
        20.0 * level.log10()
    }
}

/// Peak absolute amplitude of a block
#[inline]
pub fn peak_amplitude(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0_f32, |peak, s| peak.max(s.abs()))
}

// ============================================================================
// BIQUAD FILTER
// ============================================================================

/// Biquad filter coefficients (a0 normalized to 1.0)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f32,
    pub b1: f32,
    pub b2: f32,
    pub a1: f32,
    pub a2: f32,
}

impl Default for BiquadCoeffs {
    fn default() -> Self {
        // Unity gain (no filtering)
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }
}

impl BiquadCoeffs {
    /// Coefficients for a high shelf filter
    ///
    /// Boosts or cuts frequencies above the corner frequency.
    #[must_use]
    pub fn high_shelf(sample_rate: f32, freq: f32, gain_db: f32, q: f32) -> Self {
        let a = 10.0_f32.powf(gain_db / 40.0);
        let w0 = 2.0 * std::f32::consts::PI * freq / sample_rate;
        let cos_w0 = w0.cos();
        let sin_w0 = w0.sin();
        let alpha = sin_w0 / (2.0 * q);

        let b0 = a * ((a + 1.0) + (a - 1.0) * cos_w0 + 2.0 * a.sqrt() * alpha);
        let b1 = -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w0);
        let b2 = a * ((a + 1.0) + (a - 1.0) * cos_w0 - 2.0 * a.sqrt() * alpha);

        let a0 = (a + 1.0) - (a - 1.0) * cos_w0 + 2.0 * a.sqrt() * alpha;
        let a1 = 2.0 * ((a - 1.0) - (a + 1.0) * cos_w0);
        let a2 = (a + 1.0) - (a - 1.0) * cos_w0 - 2.0 * a.sqrt() * alpha;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// Coefficients for a peaking filter
    ///
    /// Boosts or cuts frequencies around a center frequency.
    #[must_use]
    pub fn peaking(sample_rate: f32, freq: f32, gain_db: f32, q: f32) -> Self {
        let a = 10.0_f32.powf(gain_db / 40.0);
        let w0 = 2.0 * std::f32::consts::PI * freq / sample_rate;
        let cos_w0 = w0.cos();
        let sin_w0 = w0.sin();
        let alpha = sin_w0 / (2.0 * q);

        let b0 = 1.0 + alpha * a;
        let b1 = -2.0 * cos_w0;
        let b2 = 1.0 - alpha * a;

        let a0 = 1.0 + alpha / a;
        let a1 = -2.0 * cos_w0;
        let a2 = 1.0 - alpha / a;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }
}

/// Stateful biquad filter using Direct Form I
#[derive(Debug, Clone, PartialEq)]
pub struct BiquadFilter {
    coeffs: BiquadCoeffs,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl BiquadFilter {
    pub fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    /// Update filter coefficients, keeping the filter history
    pub fn set_coeffs(&mut self, coeffs: BiquadCoeffs) {
        self.coeffs = coeffs;
    }

    #[inline]
    fn process_sample(&mut self, x: f32) -> f32 {
        // y[n] = b0*x[n] + b1*x[n-1] + b2*x[n-2] - a1*y[n-1] - a2*y[n-2]
        let y = self.coeffs.b0 * x + self.coeffs.b1 * self.x1 + self.coeffs.b2 * self.x2
            - self.coeffs.a1 * self.y1
            - self.coeffs.a2 * self.y2;

        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;

        y
    }

    /// Process a mono buffer
    pub fn process(&mut self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            *sample = self.process_sample(*sample);
        }
    }

    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }
}

// ============================================================================
// EQUALIZER BAND
// ============================================================================

/// Shape of an equalizer band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EqKind {
    Peaking,
    HighShelf,
}

/// Single equalizer band with one filter per channel
#[derive(Debug, Clone)]
pub struct EqBand {
    kind: EqKind,
    sample_rate: f32,
    frequency: f32,
    gain_db: f32,
    q: f32,
    filters: Vec<BiquadFilter>,
}

impl EqBand {
    /// Q of a peaking band
    pub const PEAKING_Q: f32 = 1.0;
    /// Q of a shelving band (slope of 1)
    pub const SHELF_Q: f32 = std::f32::consts::FRAC_1_SQRT_2;

    pub fn new(kind: EqKind, sample_rate: u32, channels: u16, frequency: f32, gain_db: f32, q: f32) -> Self {
        let sample_rate = sample_rate as f32;
        let frequency = frequency.clamp(params::FREQ_MIN, sample_rate * params::FREQ_MAX_RATIO);
        let mut band = Self {
            kind,
            sample_rate,
            frequency,
            gain_db: gain_db.clamp(params::EQ_GAIN_MIN, params::EQ_GAIN_MAX),
            q: q.max(0.1),
            filters: vec![BiquadFilter::new(BiquadCoeffs::default()); channels.max(1) as usize],
        };
        band.update_coefficients();
        band
    }

    pub fn peaking(sample_rate: u32, channels: u16, frequency: f32, gain_db: f32) -> Self {
        Self::new(EqKind::Peaking, sample_rate, channels, frequency, gain_db, Self::PEAKING_Q)
    }

    pub fn high_shelf(sample_rate: u32, channels: u16, frequency: f32, gain_db: f32) -> Self {
        Self::new(EqKind::HighShelf, sample_rate, channels, frequency, gain_db, Self::SHELF_Q)
    }

    pub fn kind(&self) -> EqKind {
        self.kind
    }

    pub fn frequency(&self) -> f32 {
        self.frequency
    }

    pub fn gain_db(&self) -> f32 {
        self.gain_db
    }

    /// Set the band gain, clamped to +/- 12 dB
    pub fn set_gain(&mut self, gain_db: f32) {
        self.gain_db = gain_db.clamp(params::EQ_GAIN_MIN, params::EQ_GAIN_MAX);
        self.update_coefficients();
    }

    fn update_coefficients(&mut self) {
        let coeffs = match self.kind {
            EqKind::Peaking => BiquadCoeffs::peaking(self.sample_rate, self.frequency, self.gain_db, self.q),
            EqKind::HighShelf => {
                BiquadCoeffs::high_shelf(self.sample_rate, self.frequency, self.gain_db, self.q)
            }
        };
        for filter in &mut self.filters {
            filter.set_coeffs(coeffs);
        }

        trace!(
            "EQ band {:?} updated: {:.1}dB@{:.0}Hz",
            self.kind,
            self.gain_db,
            self.frequency
        );
    }
}

impl Effect for EqBand {
    fn process(&mut self, buffer: &mut [f32]) -> Result<()> {
        let channels = self.filters.len();
        for frame in buffer.chunks_mut(channels) {
            for (sample, filter) in frame.iter_mut().zip(self.filters.iter_mut()) {
                *sample = filter.process_sample(*sample);
            }
        }

        Ok(())
    }

    fn name(&self) -> &str {
        match self.kind {
            EqKind::Peaking => "PeakingEq",
            EqKind::HighShelf => "HighShelfEq",
        }
    }
}

// ============================================================================
// DYNAMICS (COMPRESSOR / LIMITER)
// ============================================================================

/// Dynamics processor parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressorParams {
    pub threshold_db: f32,
    pub ratio: f32,
    pub attack_sec: f32,
    pub release_sec: f32,
    pub makeup_gain_db: f32,
    /// Add the make-up gain that restores a full-scale input
    pub auto_makeup: bool,
}

impl CompressorParams {
    /// Leveling compressor that evens out the source before boosting
    pub fn leveling() -> Self {
        Self {
            threshold_db: -50.0,
            ratio: 12.0,
            attack_sec: 0.0,
            release_sec: 0.25,
            makeup_gain_db: 0.0,
            auto_makeup: true,
        }
    }

    /// Limiter catching the peaks the compressor lets through
    pub fn limiting() -> Self {
        Self {
            threshold_db: -10.0,
            ratio: 20.0,
            attack_sec: 0.0,
            release_sec: 0.1,
            makeup_gain_db: 0.0,
            auto_makeup: true,
        }
    }
}

impl Default for CompressorParams {
    fn default() -> Self {
        Self {
            threshold_db: -18.0,
            ratio: 4.0,
            attack_sec: 0.005,
            release_sec: 0.1,
            makeup_gain_db: 0.0,
            auto_makeup: false,
        }
    }
}

/// Feed-forward dynamics processor
///
/// Attenuates signal above the threshold by the ratio, following the level
/// with a peak envelope. An attack time of zero reacts on the same sample.
#[derive(Debug, Clone)]
pub struct Compressor {
    label: &'static str,
    sample_rate: f32,
    params: CompressorParams,
    attack_coeff: f32,
    release_coeff: f32,
    makeup_gain: f32,
    envelopes: Vec<f32>,
}

impl Compressor {
    pub fn new(sample_rate: u32, channels: u16, params: CompressorParams) -> Self {
        let mut comp = Self {
            label: "Compressor",
            sample_rate: sample_rate as f32,
            params,
            attack_coeff: 0.0,
            release_coeff: 0.0,
            makeup_gain: 1.0,
            envelopes: vec![0.0; channels.max(1) as usize],
        };
        comp.set_params(params);
        comp
    }

    /// Same processor, reported under the limiter name
    pub fn limiter(sample_rate: u32, channels: u16, params: CompressorParams) -> Self {
        let mut comp = Self::new(sample_rate, channels, params);
        comp.label = "Limiter";
        comp
    }

    pub fn params(&self) -> CompressorParams {
        self.params
    }

    /// Set all parameters at once
    pub fn set_params(&mut self, params: CompressorParams) {
        self.params = CompressorParams {
            threshold_db: params.threshold_db.clamp(params::THRESHOLD_MIN, params::THRESHOLD_MAX),
            ratio: params.ratio.clamp(params::RATIO_MIN, params::RATIO_MAX),
            attack_sec: params.attack_sec.clamp(params::ATTACK_MIN, params::ATTACK_MAX),
            release_sec: params.release_sec.clamp(params::RELEASE_MIN, params::RELEASE_MAX),
            makeup_gain_db: params.makeup_gain_db.clamp(0.0, params::MAKEUP_MAX),
            auto_makeup: params.auto_makeup,
        };
        self.update_coefficients();
    }

    /// Total make-up gain in dB, including the automatic part
    pub fn makeup_db(&self) -> f32 {
        let auto = if self.params.auto_makeup {
            // 0.6 of the reduction a full-scale signal would receive
            0.6 * -self.params.threshold_db * (1.0 - 1.0 / self.params.ratio)
        } else {
            0.0
        };
        self.params.makeup_gain_db + auto
    }

    fn update_coefficients(&mut self) {
        self.attack_coeff = Self::time_to_coeff(self.params.attack_sec, self.sample_rate);
        self.release_coeff = Self::time_to_coeff(self.params.release_sec, self.sample_rate);
        self.makeup_gain = db_to_gain(self.makeup_db());
    }

    #[inline]
    fn time_to_coeff(time_sec: f32, sample_rate: f32) -> f32 {
        if time_sec <= 0.0 {
            0.0
        } else {
            (-1.0 / (time_sec * sample_rate)).exp()
        }
    }

    /// Linear gain to apply for a given envelope level (1.0 = no reduction)
    #[inline]
    fn calculate_gain(&self, input_level_db: f32) -> f32 {
        if input_level_db <= self.params.threshold_db {
            return 1.0;
        }

        let over_threshold = input_level_db - self.params.threshold_db;
        let gain_reduction_db = over_threshold * (1.0 - 1.0 / self.params.ratio);

        db_to_gain(-gain_reduction_db)
    }

    #[inline]
    fn update_envelope(&self, input_sample: f32, envelope: f32) -> f32 {
        let input_level = input_sample.abs();

        let coeff = if input_level > envelope {
            self.attack_coeff
        } else {
            self.release_coeff
        };

        coeff * envelope + (1.0 - coeff) * input_level
    }
}

impl Effect for Compressor {
    fn process(&mut self, buffer: &mut [f32]) -> Result<()> {
        let channels = self.envelopes.len();
        for frame in buffer.chunks_mut(channels) {
            for (ch, sample) in frame.iter_mut().enumerate() {
                let envelope = self.update_envelope(*sample, self.envelopes[ch]);
                self.envelopes[ch] = envelope;
                let gain = self.calculate_gain(gain_to_db(envelope));
                *sample *= gain * self.makeup_gain;
            }
        }

        Ok(())
    }

    fn name(&self) -> &str {
        self.label
    }
}

// ============================================================================
// GAIN STAGE
// ============================================================================

/// Gain stage with optional linear ramping
///
/// The ramp advances once per frame so all channels of a frame share one
/// gain value.
#[derive(Debug, Clone)]
pub struct GainStage {
    channels: usize,
    current: f32,
    target: f32,
    step: f32,
    remaining: u32,
}

impl GainStage {
    pub fn new(channels: u16, gain: f32) -> Self {
        Self {
            channels: channels.max(1) as usize,
            current: gain,
            target: gain,
            step: 0.0,
            remaining: 0,
        }
    }

    /// Live gain value, including any in-flight ramp position
    pub fn value(&self) -> f32 {
        self.current
    }

    /// Value the gain is heading to
    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn is_ramping(&self) -> bool {
        self.remaining > 0
    }

    /// Jump to a value, cancelling any ramp in progress
    pub fn set_immediate(&mut self, gain: f32) {
        self.current = gain;
        self.target = gain;
        self.step = 0.0;
        self.remaining = 0;
    }

    /// Move the current value without dropping a ramp in progress
    ///
    /// A running ramp continues from the new value and still ends at its
    /// target after the remaining frames.
    pub fn set_value(&mut self, gain: f32) {
        self.current = gain;
        if self.remaining == 0 {
            self.target = gain;
        } else {
            self.step = (self.target - gain) / self.remaining as f32;
        }
    }

    /// Ramp linearly from the current value to `gain` over `frames` frames
    pub fn ramp_to(&mut self, gain: f32, frames: u32) {
        if frames == 0 {
            self.set_immediate(gain);
            return;
        }
        self.target = gain;
        self.step = (gain - self.current) / frames as f32;
        self.remaining = frames;
    }

    #[inline]
    fn advance(&mut self) {
        if self.remaining == 0 {
            return;
        }
        self.remaining -= 1;
        if self.remaining == 0 {
            self.current = self.target;
        } else {
            self.current += self.step;
        }
    }
}

impl Effect for GainStage {
    fn process(&mut self, buffer: &mut [f32]) -> Result<()> {
        for frame in buffer.chunks_mut(self.channels) {
            self.advance();
            let gain = self.current;
            for sample in frame.iter_mut() {
                *sample *= gain;
            }
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "Gain"
    }
}

// ============================================================================
// LEVEL ANALYZER
// ============================================================================

/// Pass-through stage that keeps the most recent block of output
///
/// Frames are folded to one value per frame by keeping the sample with the
/// largest magnitude, so a clipping channel is never averaged away.
#[derive(Debug, Clone)]
pub struct LevelAnalyzer {
    channels: usize,
    ring: Vec<f32>,
    write_pos: usize,
}

impl LevelAnalyzer {
    pub fn new(block_size: usize, channels: u16) -> Self {
        Self {
            channels: channels.max(1) as usize,
            ring: vec![0.0; block_size.max(1)],
            write_pos: 0,
        }
    }

    /// Number of samples in one analysis block
    pub fn block_size(&self) -> usize {
        self.ring.len()
    }

    /// Record interleaved output samples
    pub fn capture(&mut self, interleaved: &[f32]) {
        let len = self.ring.len();
        for frame in interleaved.chunks(self.channels) {
            let extreme = frame
                .iter()
                .copied()
                .fold(0.0_f32, |acc, s| if s.abs() > acc.abs() { s } else { acc });
            self.ring[self.write_pos] = extreme;
            self.write_pos = (self.write_pos + 1) % len;
        }
    }

    /// Copy the most recent samples into `out`, oldest first
    ///
    /// Returns the number of samples copied (at most one block).
    pub fn time_domain_data(&self, out: &mut [f32]) -> usize {
        let len = self.ring.len();
        let count = out.len().min(len);
        let start = (self.write_pos + len - count) % len;
        for (i, slot) in out.iter_mut().take(count).enumerate() {
            *slot = self.ring[(start + i) % len];
        }
        count
    }

    /// Peak absolute amplitude over the current block
    pub fn peak(&self) -> f32 {
        peak_amplitude(&self.ring)
    }
}

impl Effect for LevelAnalyzer {
    fn process(&mut self, buffer: &mut [f32]) -> Result<()> {
        self.capture(buffer);
        Ok(())
    }

    fn name(&self) -> &str {
        "Analyzer"
    }
}

// ============================================================================
// TESTS
// ============================================================================
