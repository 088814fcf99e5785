//! Test doubles shared by the domain unit tests

use crate::domain::audio::{AudioError, MediaSource, Result, SourceId};
use crate::domain::events::{ClippingDetected, Notifier};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Source producing a constant sample value on every channel
pub struct StubSource {
    id: SourceId,
    level: AtomicU32,
    playing: AtomicBool,
    routed: bool,
}

impl StubSource {
    pub fn new(level: f32) -> Arc<Self> {
        Arc::new(Self {
            id: SourceId::next(),
            level: AtomicU32::new(level.to_bits()),
            playing: AtomicBool::new(true),
            routed: true,
        })
    }

    pub fn unrouted() -> Arc<Self> {
        Arc::new(Self {
            id: SourceId::next(),
            level: AtomicU32::new(0.0f32.to_bits()),
            playing: AtomicBool::new(true),
            routed: false,
        })
    }

    pub fn pause(&self) {
        self.playing.store(false, Ordering::Relaxed);
    }
}

impl MediaSource for StubSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    fn has_output_route(&self) -> bool {
        self.routed
    }

    fn read(&self, out: &mut [f32]) -> usize {
        out.fill(f32::from_bits(self.level.load(Ordering::Relaxed)));
        out.len()
    }
}

/// Erase the concrete type the way the registry stores sources
pub fn as_source(source: &Arc<StubSource>) -> Arc<dyn MediaSource> {
    source.clone()
}

/// Notifier that remembers every event it was handed
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<ClippingDetected>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<ClippingDetected> {
        self.events.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn publish(&self, event: ClippingDetected) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Notifier whose deliveries always fail
pub struct FailingNotifier;

impl Notifier for FailingNotifier {
    fn publish(&self, _event: ClippingDetected) -> Result<()> {
        Err(AudioError::NotificationDeliveryFailed(
            "receiver went away".to_string(),
        ))
    }
}
