//! Process-wide pipeline registry
//!
//! Maps each media source to exactly one signal chain and its clipping
//! monitor. Pipelines live in a slot arena; callers get a generation-checked
//! `PipelineHandle` back from `attach`, so a stale handle never reaches a slot
//! that has since been reused.
//!
//! The registry also owns the global `SettingsState`. New chains are seeded with
//! a copy of it and later changes reach them only through `apply_boost` and
//! `apply_equalizer`.

use crate::domain::audio::{
    AudioContext, AudioError, ContextSettings, MediaSource, OutputSink, Result, SourceId,
};
use crate::domain::chain::{ChainLayout, SignalChain, DEFAULT_BOOST_RAMP_MS};
use crate::domain::events::Notifier;
use crate::domain::monitor::{ClippingMonitor, MonitorSettings, MonitorState, StopReason, TickOutcome};
use crate::domain::settings::{percent_to_gain, EqualizerSettings, SettingsState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Registration handle returned by `attach`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle {
    index: usize,
    generation: u32,
}

impl PipelineHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// What `attach` did with a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// A new pipeline was created
    Attached(PipelineHandle),
    /// The source already had a pipeline; nothing changed
    AlreadyAttached(PipelineHandle),
    /// The source cannot be routed to the output; left unprocessed
    NoOutputRoute,
}

impl AttachOutcome {
    pub fn handle(&self) -> Option<PipelineHandle> {
        match self {
            AttachOutcome::Attached(h) | AttachOutcome::AlreadyAttached(h) => Some(*h),
            AttachOutcome::NoOutputRoute => None,
        }
    }
}

/// Snapshot returned by `status`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub boost_gain: f32,
    pub volume_percent: f32,
    pub equalizer: EqualizerSettings,
    pub active_count: usize,
    pub processing_active: bool,
}

/// Counters for one frame of monitor ticks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Monitors that evaluated a block
    pub sampled: usize,
    /// Blocks that triggered attenuation
    pub detections: usize,
    /// Monitors that stopped during this frame
    pub stopped: usize,
}

/// Registry construction parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistryOptions {
    pub context: ContextSettings,
    pub monitor: MonitorSettings,
    pub boost_ramp_ms: u32,
    pub initial: SettingsState,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            context: ContextSettings::default(),
            monitor: MonitorSettings::default(),
            boost_ramp_ms: DEFAULT_BOOST_RAMP_MS,
            initial: SettingsState::default(),
        }
    }
}

/// One source's chain and monitor
#[derive(Debug)]
struct Pipeline {
    chain: SignalChain,
    monitor: ClippingMonitor,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    pipeline: Option<Pipeline>,
}

/// Tracker of every live pipeline
pub struct PipelineRegistry {
    options: RegistryOptions,
    context: Option<AudioContext>,
    settings: SettingsState,
    slots: Vec<Slot>,
    free: Vec<usize>,
    index: HashMap<SourceId, PipelineHandle>,
    notifier: Arc<dyn Notifier>,
    mix: Vec<f32>,
    scratch: Vec<f32>,
}

impl PipelineRegistry {
    pub fn new(options: RegistryOptions, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            options,
            context: None,
            settings: options.initial,
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            notifier,
            mix: Vec::new(),
            scratch: Vec::new(),
        }
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Shared audio context, once the first attach created it
    pub fn context(&self) -> Option<&AudioContext> {
        self.context.as_ref()
    }

    pub fn settings(&self) -> SettingsState {
        self.settings
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn handle(&self, id: SourceId) -> Option<PipelineHandle> {
        self.index.get(&id).copied()
    }

    /// Identities of every tracked source, in no particular order
    pub fn source_ids(&self) -> Vec<SourceId> {
        self.index.keys().copied().collect()
    }

    pub fn chain(&self, id: SourceId) -> Option<&SignalChain> {
        let handle = self.handle(id)?;
        self.get(handle).map(|p| &p.chain)
    }

    pub fn chain_mut(&mut self, id: SourceId) -> Option<&mut SignalChain> {
        let handle = self.handle(id)?;
        self.get_mut(handle).map(|p| &mut p.chain)
    }

    /// Resolve a handle; `None` if its pipeline was detached
    pub fn chain_by_handle(&self, handle: PipelineHandle) -> Option<&SignalChain> {
        self.get(handle).map(|p| &p.chain)
    }

    pub fn monitor_state(&self, id: SourceId) -> Option<MonitorState> {
        let handle = self.handle(id)?;
        self.get(handle).map(|p| p.monitor.state())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Create a pipeline for `source` unless it already has one
    ///
    /// Construction failures are logged and returned once; the registry keeps
    /// serving every other source.
    pub fn attach(&mut self, source: &Arc<dyn MediaSource>) -> Result<AttachOutcome> {
        let id = source.id();
        if let Some(handle) = self.handle(id) {
            debug!(source = %id, "Source already attached");
            return Ok(AttachOutcome::AlreadyAttached(handle));
        }
        if !source.has_output_route() {
            debug!(source = %id, "Source has no output route, skipping");
            return Ok(AttachOutcome::NoOutputRoute);
        }

        let layout = match self.reserve_slot() {
            Ok(layout) => layout,
            Err(e) => {
                error!(source = %id, error = %e, "Failed to attach audio processing");
                return Err(e);
            }
        };

        let chain = match SignalChain::create(source, self.settings, &layout) {
            Ok(chain) => chain,
            Err(e) => {
                self.release_slot();
                error!(source = %id, error = %e, "Failed to attach audio processing");
                return Err(e);
            }
        };

        let mut monitor = ClippingMonitor::new(self.options.monitor, layout.analyzer_block);
        monitor.start();

        let handle = self.insert(Pipeline { chain, monitor });
        self.index.insert(id, handle);

        info!(source = %id, label = %source.label(), "Processed media element");
        Ok(AttachOutcome::Attached(handle))
    }

    /// Attach every source, returning how many new pipelines were created
    pub fn attach_all<'a, I>(&mut self, sources: I) -> usize
    where
        I: IntoIterator<Item = &'a Arc<dyn MediaSource>>,
    {
        sources
            .into_iter()
            .filter(|source| matches!(self.attach(source), Ok(AttachOutcome::Attached(_))))
            .count()
    }

    /// Dispose the pipeline of `id`. Returns whether one existed.
    pub fn detach(&mut self, id: SourceId) -> bool {
        let Some(handle) = self.index.remove(&id) else {
            return false;
        };
        let Some(mut pipeline) = self.remove(handle) else {
            return false;
        };

        pipeline.chain.dispose();
        pipeline.monitor.stop(StopReason::Disposed);
        self.release_slot();

        info!(source = %id, "Pipeline detached");
        true
    }

    /// Detach every pipeline whose source has been dropped
    pub fn prune(&mut self) -> usize {
        let gone: Vec<SourceId> = self
            .index
            .iter()
            .filter(|(_, handle)| {
                self.get(**handle)
                    .map_or(true, |p| p.chain.source().is_none())
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &gone {
            self.detach(*id);
        }
        if !gone.is_empty() {
            debug!(count = gone.len(), "Pruned pipelines of vanished sources");
        }
        gone.len()
    }

    // ------------------------------------------------------------------------
    // Global settings
    // ------------------------------------------------------------------------

    /// Store a new boost and ramp every live chain to it
    pub fn apply_boost(&mut self, gain: f32) -> f32 {
        let gain = self.settings.set_boost(gain);
        for pipeline in self.pipelines_mut() {
            pipeline.chain.set_boost(gain);
        }
        info!("Volume updated to {:.0}%", self.settings.volume_percent());
        gain
    }

    /// `apply_boost` with the boost given as a percentage (100 = unity)
    pub fn apply_volume_percent(&mut self, percent: f32) -> f32 {
        self.apply_boost(percent_to_gain(percent))
    }

    /// Store new band gains and apply them to every live chain
    pub fn apply_equalizer(&mut self, mid_db: f32, treble_db: f32) -> EqualizerSettings {
        let eq = self.settings.set_equalizer(mid_db, treble_db);
        for pipeline in self.pipelines_mut() {
            pipeline.chain.set_equalizer(eq.mid, eq.treble);
        }
        info!(mid_db = eq.mid, treble_db = eq.treble, "Equalizer updated");
        eq
    }

    pub fn status(&self) -> Status {
        let active_count = self.len();
        Status {
            boost_gain: self.settings.boost_gain(),
            volume_percent: self.settings.volume_percent(),
            equalizer: self.settings.equalizer(),
            active_count,
            processing_active: active_count > 0,
        }
    }

    // ------------------------------------------------------------------------
    // Frame processing
    // ------------------------------------------------------------------------

    /// Run one monitor tick for every pipeline
    pub fn tick(&mut self) -> TickSummary {
        let notifier = Arc::clone(&self.notifier);
        let mut summary = TickSummary::default();

        for pipeline in self.pipelines_mut() {
            let outcome = pipeline.monitor.tick(&mut pipeline.chain, notifier.as_ref());
            if outcome.attenuated() {
                summary.detections += 1;
            }
            match outcome {
                TickOutcome::Skipped => {}
                TickOutcome::Continue { .. } => summary.sampled += 1,
                TickOutcome::Stopped { .. } => {
                    summary.sampled += 1;
                    summary.stopped += 1;
                }
            }
        }

        summary
    }

    /// Render `frames` frames from every playing source into `sink`
    ///
    /// Each source is processed by its own chain; the outputs are summed.
    pub fn render(&mut self, sink: &mut dyn OutputSink, frames: usize) -> Result<usize> {
        let channels = self
            .context
            .as_ref()
            .map_or(self.options.context.channels.count(), AudioContext::channels) as usize;
        let len = frames * channels;

        self.mix.clear();
        self.mix.resize(len, 0.0);
        self.scratch.resize(len, 0.0);

        for slot in &mut self.slots {
            let Some(pipeline) = slot.pipeline.as_mut() else {
                continue;
            };
            match pipeline.chain.pull(&mut self.scratch[..len]) {
                Ok(true) => {
                    for (out, sample) in self.mix.iter_mut().zip(&self.scratch[..len]) {
                        *out += *sample;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(source = %pipeline.chain.source_id(), error = %e, "Chain processing failed");
                }
            }
        }

        sink.write(&self.mix)
    }

    // ------------------------------------------------------------------------
    // Arena
    // ------------------------------------------------------------------------

    fn reserve_slot(&mut self) -> Result<ChainLayout> {
        if self.context.is_none() {
            self.context = Some(AudioContext::new(self.options.context)?);
        }
        let ramp_ms = self.options.boost_ramp_ms;
        let Some(context) = self.context.as_mut() else {
            return Err(AudioError::AudioInitFailed("audio context unavailable".to_string()));
        };
        context.acquire()?;
        Ok(ChainLayout::from_context(context, ramp_ms))
    }

    fn release_slot(&mut self) {
        if let Some(context) = self.context.as_mut() {
            context.release();
        }
    }

    fn insert(&mut self, pipeline: Pipeline) -> PipelineHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.pipeline = Some(pipeline);
            return PipelineHandle {
                index,
                generation: slot.generation,
            };
        }

        self.slots.push(Slot {
            generation: 0,
            pipeline: Some(pipeline),
        });
        PipelineHandle {
            index: self.slots.len() - 1,
            generation: 0,
        }
    }

    fn remove(&mut self, handle: PipelineHandle) -> Option<Pipeline> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        let pipeline = slot.pipeline.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(pipeline)
    }

    fn get(&self, handle: PipelineHandle) -> Option<&Pipeline> {
        self.slots
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.pipeline.as_ref())
    }

    fn get_mut(&mut self, handle: PipelineHandle) -> Option<&mut Pipeline> {
        self.slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.pipeline.as_mut())
    }

    fn pipelines_mut(&mut self) -> impl Iterator<Item = &mut Pipeline> {
        self.slots.iter_mut().filter_map(|slot| slot.pipeline.as_mut())
    }
}

impl std::fmt::Debug for PipelineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRegistry")
            .field("settings", &self.settings)
            .field("pipelines", &self.len())
            .field("context", &self.context)
            .finish()
    }
}
