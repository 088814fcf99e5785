//! Synthetic media sources

use clearvolume_core::domain::audio::{MediaSource, SourceId};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Frequency and amplitude of a test tone
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToneSpec {
    pub frequency: f32,
    pub amplitude: f32,
}

impl Default for ToneSpec {
    fn default() -> Self {
        Self {
            frequency: 440.0,
            amplitude: 0.5,
        }
    }
}

/// Sine generator standing in for a playing media element
///
/// The same signal is written to every channel. Playback position advances
/// only while the source is playing.
#[derive(Debug)]
pub struct ToneSource {
    id: SourceId,
    spec: ToneSpec,
    sample_rate: u32,
    channels: u16,
    position: AtomicU64,
    playing: AtomicBool,
    routed: bool,
}

impl ToneSource {
    pub fn new(spec: ToneSpec, sample_rate: u32, channels: u16) -> Self {
        Self {
            id: SourceId::next(),
            spec,
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
            position: AtomicU64::new(0),
            playing: AtomicBool::new(true),
            routed: true,
        }
    }

    /// Same tone, but without an output route
    pub fn unrouted(mut self) -> Self {
        self.routed = false;
        self
    }

    pub fn spec(&self) -> ToneSpec {
        self.spec
    }

    pub fn pause(&self) {
        self.playing.store(false, Ordering::Relaxed);
    }

    pub fn play(&self) {
        self.playing.store(true, Ordering::Relaxed);
    }

    /// Frames produced so far
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }
}

impl MediaSource for ToneSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn label(&self) -> String {
        format!("tone {:.0}Hz ({})", self.spec.frequency, self.id)
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    fn has_output_route(&self) -> bool {
        self.routed
    }

    fn read(&self, out: &mut [f32]) -> usize {
        if !self.is_playing() {
            out.fill(0.0);
            return 0;
        }

        let channels = self.channels as usize;
        let frames = out.len() / channels;
        let start = self.position.fetch_add(frames as u64, Ordering::Relaxed);
        let step = TAU * f64::from(self.spec.frequency) / f64::from(self.sample_rate);

        for (i, frame) in out.chunks_exact_mut(channels).enumerate() {
            let value = ((start + i as u64) as f64 * step).sin() as f32 * self.spec.amplitude;
            frame.fill(value);
        }

        frames * channels
    }
}
