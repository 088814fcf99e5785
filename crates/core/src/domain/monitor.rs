//! Clipping feedback loop
//!
//! A `ClippingMonitor` is ticked once per frame opportunity. Each tick scans the
//! most recent analyzer block of its chain and, when the peak crosses the
//! threshold, multiplies the chain's live gain by the attenuation factor.
//!
//! The monitor only ever lowers gain. Detections compound from the current
//! value, so a sustained overload converges geometrically. Once stopped it
//! never runs again for the same chain.

use crate::domain::chain::SignalChain;
use crate::domain::dsp::peak_amplitude;
use crate::domain::events::{ClippingDetected, Notifier};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Detection parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Normalized peak above which a block counts as clipping
    pub clip_threshold: f32,
    /// Gain multiplier applied per detection
    pub attenuation: f32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            clip_threshold: 0.9,
            attenuation: 0.95,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Stopped,
    Sampling,
}

/// Why a monitor stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Disposed,
    Paused,
    SourceGone,
}

/// Result of one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    /// Monitor was not running; nothing was read or written
    Skipped,
    /// Block evaluated; keep sampling
    Continue { peak: f32, attenuated: bool },
    /// Monitor stopped during this tick
    Stopped {
        reason: StopReason,
        attenuated: bool,
    },
}

impl TickOutcome {
    pub fn attenuated(&self) -> bool {
        matches!(
            self,
            TickOutcome::Continue { attenuated: true, .. } | TickOutcome::Stopped { attenuated: true, .. }
        )
    }
}

/// Per-chain clipping detector
#[derive(Debug)]
pub struct ClippingMonitor {
    settings: MonitorSettings,
    state: MonitorState,
    started: bool,
    stop_reason: Option<StopReason>,
    detections: u64,
    block: Vec<f32>,
}

impl ClippingMonitor {
    pub fn new(settings: MonitorSettings, block_size: usize) -> Self {
        Self {
            settings,
            state: MonitorState::Stopped,
            started: false,
            stop_reason: None,
            detections: 0,
            block: vec![0.0; block_size.max(1)],
        }
    }

    /// Begin sampling. Returns `false` if this monitor already ran.
    pub fn start(&mut self) -> bool {
        if self.started {
            return false;
        }
        self.started = true;
        self.state = MonitorState::Sampling;
        true
    }

    /// Stop permanently
    pub fn stop(&mut self, reason: StopReason) {
        if self.state == MonitorState::Sampling {
            self.state = MonitorState::Stopped;
            self.stop_reason = Some(reason);
            debug!(?reason, detections = self.detections, "Clipping monitor stopped");
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == MonitorState::Sampling
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// Number of clipping detections so far
    pub fn detections(&self) -> u64 {
        self.detections
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Evaluate the chain's latest output block once
    pub fn tick(&mut self, chain: &mut SignalChain, notifier: &dyn Notifier) -> TickOutcome {
        if !self.is_running() {
            return TickOutcome::Skipped;
        }

        let Some(analyzer) = chain.analyzer() else {
            self.stop(StopReason::Disposed);
            return TickOutcome::Stopped {
                reason: StopReason::Disposed,
                attenuated: false,
            };
        };

        let read = analyzer.time_domain_data(&mut self.block);
        let peak = peak_amplitude(&self.block[..read]);

        let attenuated = peak > self.settings.clip_threshold;
        if attenuated {
            let previous_gain = chain.current_gain();
            let new_gain = previous_gain * self.settings.attenuation;
            chain.set_gain_immediate(new_gain);
            self.detections += 1;

            warn!(
                source = %chain.source_id(),
                peak,
                new_gain,
                "Clipping detected, reducing volume"
            );

            let event = ClippingDetected::new(chain.source_id(), peak, previous_gain, new_gain);
            if let Err(e) = notifier.publish(event) {
                debug!(error = %e, "Clipping notification dropped");
            }
        }

        let stop = match chain.source() {
            None => Some(StopReason::SourceGone),
            Some(source) if !source.is_playing() => Some(StopReason::Paused),
            Some(_) => None,
        };

        match stop {
            Some(reason) => {
                self.stop(reason);
                TickOutcome::Stopped { reason, attenuated }
            }
            None => TickOutcome::Continue { peak, attenuated },
        }
    }
}
