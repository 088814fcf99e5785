//! Pipeline service: the single owner of the registry
//!
//! All registry mutations arrive as `Command`s over one mpsc queue and run to
//! completion in order. Between commands the task renders audio and ticks the
//! clipping monitors on a fixed frame interval, so a detach can never land in
//! the middle of a monitor tick.

use async_trait::async_trait;
use clearvolume_core::domain::audio::OutputSink;
use clearvolume_core::domain::config::{ClearVolumeConfig, Command, CommandExecutor, CommandResult};
use clearvolume_core::domain::events::Notifier;
use clearvolume_core::domain::registry::{
    AttachOutcome, PipelineRegistry, RegistryOptions, Status, TickSummary,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Depth of the command queue
const COMMAND_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Pipeline service has stopped")]
    Closed,
}

struct Envelope {
    command: Command,
    reply: oneshot::Sender<CommandResult>,
}

/// Registry plus the sink it renders into
pub struct PipelineService {
    registry: PipelineRegistry,
    sink: Box<dyn OutputSink>,
    frames_per_tick: usize,
    frame_period: Duration,
}

impl PipelineService {
    pub fn new(
        registry: PipelineRegistry,
        sink: Box<dyn OutputSink>,
        frames_per_tick: usize,
        frame_rate_hz: u32,
    ) -> Self {
        Self {
            registry,
            sink,
            frames_per_tick: frames_per_tick.max(1),
            frame_period: Duration::from_secs_f64(1.0 / f64::from(frame_rate_hz.max(1))),
        }
    }

    /// Build a service from a loaded configuration
    pub fn from_config(
        config: &ClearVolumeConfig,
        notifier: std::sync::Arc<dyn Notifier>,
        sink: Box<dyn OutputSink>,
    ) -> Self {
        let registry = PipelineRegistry::new(RegistryOptions::from(config), notifier);
        Self::new(
            registry,
            sink,
            config.frames_per_tick(),
            config.engine.frame_rate_hz,
        )
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    pub fn frames_per_tick(&self) -> usize {
        self.frames_per_tick
    }

    /// Execute one command against the registry
    pub fn execute(&mut self, command: Command) -> CommandResult {
        debug!(?command, "Executing command");
        match command {
            Command::Attach { source } => {
                let id = source.id();
                match self.registry.attach(&source) {
                    Ok(AttachOutcome::Attached(_)) => CommandResult::Attached { id },
                    Ok(AttachOutcome::AlreadyAttached(_)) => CommandResult::AlreadyAttached { id },
                    Ok(AttachOutcome::NoOutputRoute) => CommandResult::Skipped { id },
                    Err(e) => CommandResult::Error(e.to_string()),
                }
            }
            Command::Detach { id } => CommandResult::Detached {
                id,
                existed: self.registry.detach(id),
            },
            Command::SetVolume { percent } => {
                self.registry.apply_volume_percent(percent);
                self.volume_changed()
            }
            Command::SetBoost { gain } => {
                self.registry.apply_boost(gain);
                self.volume_changed()
            }
            Command::SetEqualizer { mid_db, treble_db } => CommandResult::EqualizerChanged {
                equalizer: self.registry.apply_equalizer(mid_db, treble_db),
            },
            Command::GetStatus => CommandResult::Status(self.registry.status()),
            Command::Prune => CommandResult::Pruned {
                count: self.registry.prune(),
            },
        }
    }

    fn volume_changed(&self) -> CommandResult {
        let settings = self.registry.settings();
        CommandResult::VolumeChanged {
            boost_gain: settings.boost_gain(),
            volume_percent: settings.volume_percent(),
        }
    }

    /// Render one frame into the sink, then tick every monitor
    pub fn frame(&mut self) -> TickSummary {
        if let Err(e) = self.registry.render(self.sink.as_mut(), self.frames_per_tick) {
            warn!(error = %e, "Failed to write to output");
        }
        self.registry.tick()
    }

    /// Run the service on the current tokio runtime
    ///
    /// The task ends once every `ServiceHandle` is dropped and hands the
    /// service back through the join handle.
    pub fn spawn(self) -> (ServiceHandle, JoinHandle<PipelineService>) {
        let (sender, receiver) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let task = tokio::spawn(self.run(receiver));
        (ServiceHandle { sender }, task)
    }

    async fn run(mut self, mut receiver: mpsc::Receiver<Envelope>) -> Self {
        let mut interval = tokio::time::interval(self.frame_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            frames_per_tick = self.frames_per_tick,
            period_ms = self.frame_period.as_millis() as u64,
            "Pipeline service started"
        );

        loop {
            tokio::select! {
                envelope = receiver.recv() => match envelope {
                    Some(Envelope { command, reply }) => {
                        let result = self.execute(command);
                        // The caller may have given up waiting
                        let _ = reply.send(result);
                    }
                    None => break,
                },
                _ = interval.tick() => {
                    let summary = self.frame();
                    if summary.detections > 0 {
                        debug!(?summary, "Frame attenuated pipelines");
                    }
                }
            }
        }

        info!("Pipeline service stopped");
        self
    }
}

/// Cloneable sender side of a running service
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    sender: mpsc::Sender<Envelope>,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope").field("command", &self.command).finish()
    }
}

impl ServiceHandle {
    /// Queue a command and wait for its result
    pub async fn send(&self, command: Command) -> Result<CommandResult, ServiceError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Envelope { command, reply })
            .await
            .map_err(|_| ServiceError::Closed)?;
        response.await.map_err(|_| ServiceError::Closed)
    }

    pub async fn status(&self) -> Result<Status, ServiceError> {
        match self.send(Command::GetStatus).await? {
            CommandResult::Status(status) => Ok(status),
            _ => Err(ServiceError::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[async_trait]
impl CommandExecutor for ServiceHandle {
    async fn execute(&self, command: Command) -> CommandResult {
        self.send(command)
            .await
            .unwrap_or_else(|e| CommandResult::Error(e.to_string()))
    }
}
