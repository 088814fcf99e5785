//! Integration tests for the boost pipeline
//!
//! These tests drive the whole attach -> render -> tick -> notify flow with
//! synthetic tone sources, both directly through the registry and through the
//! pipeline service task.

use clearvolume_core::domain::audio::{
    AudioError, CaptureSink, ContextSettings, MediaSource, SourceId,
};
use clearvolume_core::domain::config::{ClearVolumeConfig, Command, CommandResult, ConfigManager};
use clearvolume_core::domain::events::{ClippingDetected, NotificationHub, CLIPPING_ACTION};
use clearvolume_core::domain::monitor::MonitorState;
use clearvolume_core::domain::registry::{AttachOutcome, PipelineRegistry, RegistryOptions};
use clearvolume_core::domain::settings::EqualizerSettings;
use clearvolume_infra::{PipelineService, ToneSource, ToneSpec};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const BLOCK: usize = 256;
const SAMPLE_RATE: u32 = 48000;
const CHANNELS: u16 = 2;

fn test_options() -> RegistryOptions {
    RegistryOptions {
        context: ContextSettings {
            analyzer_block: BLOCK,
            ..ContextSettings::default()
        },
        boost_ramp_ms: 0,
        ..RegistryOptions::default()
    }
}

fn create_test_registry() -> (PipelineRegistry, Arc<NotificationHub>) {
    let hub = Arc::new(NotificationHub::default());
    let registry = PipelineRegistry::new(test_options(), hub.clone());
    (registry, hub)
}

fn create_test_tone(frequency: f32, amplitude: f32) -> Arc<ToneSource> {
    Arc::new(ToneSource::new(
        ToneSpec {
            frequency,
            amplitude,
        },
        SAMPLE_RATE,
        CHANNELS,
    ))
}

fn as_source(tone: &Arc<ToneSource>) -> Arc<dyn MediaSource> {
    tone.clone()
}

fn attach(registry: &mut PipelineRegistry, tone: &Arc<ToneSource>) -> SourceId {
    let outcome = registry.attach(&as_source(tone)).unwrap();
    assert!(matches!(outcome, AttachOutcome::Attached(_)));
    tone.id()
}

/// Overwrite the analyzer window of one pipeline with a flat block
fn feed_peak(registry: &mut PipelineRegistry, id: SourceId, peak: f32) {
    let block = vec![peak; BLOCK * CHANNELS as usize];
    registry
        .chain_mut(id)
        .and_then(|chain| chain.analyzer_mut())
        .unwrap()
        .capture(&block);
}

fn drain(receiver: &mut broadcast::Receiver<ClippingDetected>) -> Vec<ClippingDetected> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

// ============================================================================
// ATTACH / DETACH
// ============================================================================

#[test]
fn test_attach_uses_initial_settings() {
    let (mut registry, _hub) = create_test_registry();
    let tone = create_test_tone(440.0, 0.2);
    let id = attach(&mut registry, &tone);

    let chain = registry.chain(id).unwrap();
    assert_eq!(chain.current_gain(), 1.0);
    assert_eq!(chain.band_gains(), Some((3.0, -3.0)));
    assert_eq!(registry.monitor_state(id), Some(MonitorState::Sampling));
}

#[test]
fn test_attach_is_idempotent() {
    let (mut registry, _hub) = create_test_registry();
    let tone = create_test_tone(440.0, 0.2);
    let id = attach(&mut registry, &tone);

    let again = registry.attach(&as_source(&tone)).unwrap();
    assert_eq!(again, AttachOutcome::AlreadyAttached(registry.handle(id).unwrap()));
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_unrouted_source_is_skipped() {
    let (mut registry, _hub) = create_test_registry();
    let source: Arc<dyn MediaSource> =
        Arc::new(ToneSource::new(ToneSpec::default(), SAMPLE_RATE, CHANNELS).unrouted());

    assert_eq!(registry.attach(&source).unwrap(), AttachOutcome::NoOutputRoute);
    assert!(registry.is_empty());
    assert!(registry.context().is_none());
}

#[test]
fn test_capacity_failure_does_not_affect_others() {
    let options = RegistryOptions {
        context: ContextSettings {
            analyzer_block: BLOCK,
            max_pipelines: 1,
            ..ContextSettings::default()
        },
        ..test_options()
    };
    let mut registry = PipelineRegistry::new(options, Arc::new(NotificationHub::default()));

    let first = create_test_tone(440.0, 0.2);
    let second = create_test_tone(880.0, 0.2);
    let first_id = attach(&mut registry, &first);

    let err = registry.attach(&as_source(&second)).unwrap_err();
    assert!(matches!(err, AudioError::AudioInitFailed(_)));
    assert!(registry.contains(first_id));
    assert!(!registry.contains(second.id()));

    // Freeing a slot lets the failed source attach on a later request
    assert!(registry.detach(first_id));
    attach(&mut registry, &second);
    assert_eq!(registry.source_ids(), vec![second.id()]);
}

#[test]
fn test_detach_then_tick() {
    let (mut registry, hub) = create_test_registry();
    let mut events = hub.subscribe();
    let tone = create_test_tone(440.0, 1.0);
    let id = attach(&mut registry, &tone);
    registry.apply_boost(6.0);

    assert!(registry.detach(id));
    assert!(!registry.detach(id));

    let mut sink = CaptureSink::new();
    registry.render(&mut sink, BLOCK).unwrap();
    let summary = registry.tick();

    assert_eq!(summary.sampled, 0);
    assert_eq!(summary.detections, 0);
    assert!(sink.samples().iter().all(|s| *s == 0.0));
    assert!(registry.chain(id).is_none());
    assert!(drain(&mut events).is_empty());
}

// ============================================================================
// SETTINGS BROADCAST
// ============================================================================

#[test]
fn test_boost_broadcast_reaches_every_chain() {
    let (mut registry, _hub) = create_test_registry();
    let tones: Vec<Arc<ToneSource>> = (0..3)
        .map(|i| create_test_tone(220.0 * (i + 1) as f32, 0.1))
        .collect();
    let sources: Vec<Arc<dyn MediaSource>> = tones.iter().map(as_source).collect();
    assert_eq!(registry.attach_all(&sources), 3);

    assert_eq!(registry.apply_boost(2.0), 2.0);

    for tone in &tones {
        let chain = registry.chain(tone.id()).unwrap();
        assert_eq!(chain.boost_target(), 2.0);
        assert_eq!(chain.current_gain(), 2.0);
    }
    assert_eq!(registry.status().volume_percent, 200.0);
}

#[test]
fn test_settings_are_clamped() {
    let (mut registry, _hub) = create_test_registry();
    let tone = create_test_tone(440.0, 0.1);
    let id = attach(&mut registry, &tone);

    assert_eq!(registry.apply_volume_percent(900.0), 6.0);
    assert_eq!(
        registry.apply_equalizer(-40.0, 40.0),
        EqualizerSettings::new(-12.0, 12.0)
    );
    assert_eq!(registry.chain(id).unwrap().band_gains(), Some((-12.0, 12.0)));
}

#[test]
fn test_new_source_inherits_current_settings() {
    let (mut registry, _hub) = create_test_registry();
    registry.apply_boost(3.5);
    registry.apply_equalizer(6.0, 1.0);

    let tone = create_test_tone(440.0, 0.1);
    let id = attach(&mut registry, &tone);

    let chain = registry.chain(id).unwrap();
    assert_eq!(chain.current_gain(), 3.5);
    assert_eq!(chain.band_gains(), Some((6.0, 1.0)));
}

// ============================================================================
// CLIPPING PROTECTION
// ============================================================================

#[test]
fn test_quiet_tone_is_left_alone() {
    let (mut registry, hub) = create_test_registry();
    let mut events = hub.subscribe();
    let tone = create_test_tone(440.0, 0.3);
    let id = attach(&mut registry, &tone);

    let mut sink = CaptureSink::new();
    for _ in 0..4 {
        registry.render(&mut sink, BLOCK).unwrap();
        assert_eq!(registry.tick().detections, 0);
    }

    assert_eq!(registry.chain(id).unwrap().current_gain(), 1.0);
    assert!(sink.samples().iter().any(|s| *s != 0.0));
    assert!(drain(&mut events).is_empty());
}

#[test]
fn test_loud_tone_is_attenuated() {
    let (mut registry, hub) = create_test_registry();
    let mut events = hub.subscribe();
    let tone = create_test_tone(440.0, 1.0);
    let id = attach(&mut registry, &tone);
    registry.apply_boost(6.0);

    let mut sink = CaptureSink::new();
    registry.render(&mut sink, BLOCK).unwrap();
    let summary = registry.tick();

    assert_eq!(summary.detections, 1);
    assert!((registry.chain(id).unwrap().current_gain() - 5.7).abs() < 1e-5);

    let events = drain(&mut events);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].source, id);
    assert!(events[0].peak > 0.9);
    assert!(events[0].to_relay_json().contains(CLIPPING_ACTION));
}

#[test]
fn test_three_clipping_ticks() {
    let (mut registry, hub) = create_test_registry();
    let mut events = hub.subscribe();
    let tone = create_test_tone(440.0, 0.1);
    let id = attach(&mut registry, &tone);
    registry.apply_boost(2.0);

    for _ in 0..3 {
        feed_peak(&mut registry, id, 0.95);
        registry.tick();
    }

    let gain = registry.chain(id).unwrap().current_gain();
    assert!((gain - 1.714_75).abs() < 1e-4);
    // The stored setting is not touched by attenuation
    assert_eq!(registry.settings().boost_gain(), 2.0);

    let events = drain(&mut events);
    assert_eq!(events.len(), 3);
    assert_eq!(events[2].previous_gain, events[1].new_gain);
}

#[test]
fn test_gain_never_rises_between_ticks() {
    let (mut registry, _hub) = create_test_registry();
    let tone = create_test_tone(440.0, 0.1);
    let id = attach(&mut registry, &tone);
    registry.apply_boost(4.0);

    let mut previous = registry.chain(id).unwrap().current_gain();
    for peak in [0.95, 0.2, 1.0, 0.5, 0.91] {
        feed_peak(&mut registry, id, peak);
        registry.tick();
        let gain = registry.chain(id).unwrap().current_gain();
        assert!(gain <= previous);
        previous = gain;
    }
    assert!((previous - 4.0 * 0.95f32.powi(3)).abs() < 1e-4);
}

#[test]
fn test_clipping_during_ramp_still_reaches_boost() {
    let options = RegistryOptions {
        boost_ramp_ms: 50,
        ..test_options()
    };
    let hub = Arc::new(NotificationHub::default());
    let mut events = hub.subscribe();
    let mut registry = PipelineRegistry::new(options, hub.clone());
    let tone = create_test_tone(440.0, 0.1);
    let id = attach(&mut registry, &tone);
    registry.apply_boost(2.0);

    feed_peak(&mut registry, id, 0.95);
    assert_eq!(registry.tick().detections, 1);
    assert!(registry.chain(id).unwrap().current_gain() < 1.0);

    // 50 ms at 48 kHz is 2400 frames
    let mut sink = CaptureSink::new();
    for _ in 0..12 {
        registry.render(&mut sink, BLOCK).unwrap();
        registry.tick();
    }

    assert_eq!(registry.chain(id).unwrap().current_gain(), 2.0);
    assert_eq!(registry.status().boost_gain, 2.0);
    assert_eq!(drain(&mut events).len(), 1);
}

#[test]
fn test_sources_are_isolated() {
    let (mut registry, hub) = create_test_registry();
    let mut events = hub.subscribe();
    let loud = create_test_tone(440.0, 0.1);
    let quiet = create_test_tone(880.0, 0.1);
    let loud_id = attach(&mut registry, &loud);
    let quiet_id = attach(&mut registry, &quiet);
    registry.apply_boost(3.0);

    feed_peak(&mut registry, loud_id, 0.99);
    feed_peak(&mut registry, quiet_id, 0.1);
    let summary = registry.tick();

    assert_eq!(summary.sampled, 2);
    assert_eq!(summary.detections, 1);
    assert!((registry.chain(loud_id).unwrap().current_gain() - 2.85).abs() < 1e-5);
    assert_eq!(registry.chain(quiet_id).unwrap().current_gain(), 3.0);

    let events = drain(&mut events);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].source, loud_id);
}

#[test]
fn test_detection_without_observers() {
    let mut registry = PipelineRegistry::new(test_options(), Arc::new(NotificationHub::default()));
    let tone = create_test_tone(440.0, 0.1);
    let id = attach(&mut registry, &tone);
    registry.apply_boost(2.0);

    feed_peak(&mut registry, id, 0.95);
    assert_eq!(registry.tick().detections, 1);
    assert_eq!(registry.monitor_state(id), Some(MonitorState::Sampling));
}

// ============================================================================
// SOURCE LIFETIME
// ============================================================================

#[test]
fn test_paused_source_stops_monitor() {
    let (mut registry, _hub) = create_test_registry();
    let tone = create_test_tone(440.0, 0.5);
    let id = attach(&mut registry, &tone);

    tone.pause();
    let mut sink = CaptureSink::new();
    registry.render(&mut sink, BLOCK).unwrap();
    let summary = registry.tick();

    assert_eq!(summary.stopped, 1);
    assert!(sink.samples().iter().all(|s| *s == 0.0));
    assert_eq!(registry.monitor_state(id), Some(MonitorState::Stopped));
    // The pipeline stays tracked and keeps following settings
    assert!(registry.contains(id));
    registry.apply_boost(2.0);
    assert_eq!(registry.chain(id).unwrap().boost_target(), 2.0);
}

#[test]
fn test_vanished_source_is_pruned() {
    let (mut registry, _hub) = create_test_registry();
    let kept = create_test_tone(440.0, 0.5);
    let dropped = create_test_tone(880.0, 0.5);
    let kept_id = attach(&mut registry, &kept);
    let dropped_id = attach(&mut registry, &dropped);

    drop(dropped);
    let summary = registry.tick();
    assert_eq!(summary.stopped, 1);
    assert_eq!(registry.monitor_state(dropped_id), Some(MonitorState::Stopped));

    assert_eq!(registry.prune(), 1);
    assert_eq!(registry.source_ids(), vec![kept_id]);
    assert_eq!(registry.status().active_count, 1);
}

// ============================================================================
// SERVICE
// ============================================================================

#[tokio::test]
async fn test_service_protects_loud_tone() {
    let hub = Arc::new(NotificationHub::default());
    let mut events = hub.subscribe();
    let (handle, task) =
        PipelineService::from_config(&ClearVolumeConfig::default(), hub.clone(), Box::new(CaptureSink::new()))
            .spawn();

    handle.send(Command::SetVolume { percent: 600.0 }).await.unwrap();
    let tone = create_test_tone(440.0, 1.0);
    let id = tone.id();
    assert_eq!(
        handle.send(Command::Attach { source: as_source(&tone) }).await.unwrap(),
        CommandResult::Attached { id }
    );

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no clipping notification")
        .unwrap();
    assert_eq!(event.source, id);
    assert!(event.new_gain < event.previous_gain);

    let status = handle.status().await.unwrap();
    assert_eq!(status.volume_percent, 600.0);
    assert_eq!(status.active_count, 1);

    drop(handle);
    let service = task.await.unwrap();
    assert!(service.registry().chain(id).unwrap().current_gain() < 6.0);
}

#[tokio::test]
async fn test_service_starts_from_saved_config() {
    let dir = tempfile::tempdir().unwrap();
    let manager = ConfigManager::new(dir.path().to_path_buf());

    let mut config = manager.load().await;
    assert!(manager.exists());
    config.defaults.volume_percent = 250.0;
    config.defaults.mid_db = 0.0;
    manager.save(&config).await.unwrap();

    let config = manager.load().await;
    let (handle, task) = PipelineService::from_config(
        &config,
        Arc::new(NotificationHub::default()),
        Box::new(CaptureSink::new()),
    )
    .spawn();

    let tone = create_test_tone(440.0, 0.2);
    handle.send(Command::Attach { source: as_source(&tone) }).await.unwrap();
    let status = handle.status().await.unwrap();

    assert_eq!(status.boost_gain, 2.5);
    assert_eq!(status.equalizer, EqualizerSettings::new(0.0, -3.0));

    drop(handle);
    let service = task.await.unwrap();
    assert_eq!(service.registry().chain(tone.id()).unwrap().band_gains(), Some((0.0, -3.0)));
}

#[tokio::test]
async fn test_service_detach_and_prune() {
    let (handle, task) = PipelineService::from_config(
        &ClearVolumeConfig::default(),
        Arc::new(NotificationHub::default()),
        Box::new(CaptureSink::new()),
    )
    .spawn();

    let kept = create_test_tone(440.0, 0.2);
    let gone = create_test_tone(880.0, 0.2);
    handle.send(Command::Attach { source: as_source(&kept) }).await.unwrap();
    handle.send(Command::Attach { source: as_source(&gone) }).await.unwrap();

    let kept_id = kept.id();
    assert_eq!(
        handle.send(Command::Detach { id: kept_id }).await.unwrap(),
        CommandResult::Detached { id: kept_id, existed: true }
    );

    drop(gone);
    assert_eq!(
        handle.send(Command::Prune).await.unwrap(),
        CommandResult::Pruned { count: 1 }
    );

    let status = handle.status().await.unwrap();
    assert_eq!(status.active_count, 0);
    assert!(!status.processing_active);

    drop(handle);
    task.await.unwrap();
}
