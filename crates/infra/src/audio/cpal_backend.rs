//! CPAL-based device output
//!
//! Opens an output stream on the configured (or default) device. Processed
//! audio reaches the device callback through a `SampleQueue`; the callback
//! plays silence whenever the queue runs dry.

use super::lockfree_buffer::SampleQueue;
use clearvolume_core::domain::audio::{AudioError, OutputSink, Result, StreamConfig};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig as CpalStreamConfig};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Number of device buffers the queue can hold ahead of the callback
const QUEUE_DEPTH_BUFFERS: usize = 8;

/// Names of every output device on the default host
pub fn output_device_names() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

    #[allow(deprecated)]
    let names: Vec<String> = devices.filter_map(|d| d.name().ok()).collect();
    info!("Found {} output devices", names.len());
    Ok(names)
}

fn find_output_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device> {
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string())),
        Some(name) => {
            #[allow(deprecated)]
            let device = host
                .output_devices()
                .map_err(|e| AudioError::StreamError(e.to_string()))?
                .find(|d| d.name().ok().as_deref() == Some(name));
            device.ok_or_else(|| AudioError::DeviceNotFound(name.to_string()))
        }
    }
}

/// Running output stream
///
/// Keep this alive for as long as audio should play. The stream handle is not
/// `Send`, so it stays on the thread that opened it while the paired
/// `CpalSink` moves to the render task.
pub struct CpalOutput {
    _stream: Stream,
    device_name: String,
    config: StreamConfig,
    queue: Arc<SampleQueue>,
}

impl CpalOutput {
    /// Open and start an output stream
    pub fn open(config: &StreamConfig, device: Option<&str>) -> Result<(Self, CpalSink)> {
        let host = cpal::default_host();
        debug!("Using audio host: {:?}", host.id());

        let cpal_device = find_output_device(&host, device)?;
        #[allow(deprecated)]
        let device_name = cpal_device
            .name()
            .unwrap_or_else(|_| "Unknown Device".to_string());

        info!(
            "Creating output stream: device={}, config={:?}",
            device_name, config
        );

        let channels = config.channels.count() as usize;
        let capacity = config.buffer_size as usize * channels * QUEUE_DEPTH_BUFFERS;
        let queue = Arc::new(SampleQueue::with_capacity(capacity));
        let callback_queue = Arc::clone(&queue);

        let cpal_config = CpalStreamConfig {
            channels: config.channels.count(),
            sample_rate: config.sample_rate.hz(),
            buffer_size: cpal::BufferSize::Fixed(config.buffer_size),
        };

        let stream = cpal_device
            .build_output_stream(
                &cpal_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    callback_queue.pop_into(data);
                },
                |err| error!("Output stream error: {}", err),
                None,
            )
            .map_err(|e| AudioError::StreamError(format!("Failed to build stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamError(format!("Failed to start stream: {}", e)))?;

        let sink = CpalSink {
            queue: Arc::clone(&queue),
        };

        Ok((
            Self {
                _stream: stream,
                device_name,
                config: config.clone(),
                queue,
            },
            sink,
        ))
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Samples dropped because the render side ran ahead of the device
    pub fn dropped(&self) -> usize {
        self.queue.dropped()
    }

    /// Samples of silence played because the render side fell behind
    pub fn underrun(&self) -> usize {
        self.queue.underrun()
    }
}

impl fmt::Debug for CpalOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpalOutput")
            .field("device_name", &self.device_name)
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish()
    }
}

/// Producer side of a device stream
#[derive(Debug, Clone)]
pub struct CpalSink {
    queue: Arc<SampleQueue>,
}

impl CpalSink {
    /// Sink writing into an existing queue
    pub fn from_queue(queue: Arc<SampleQueue>) -> Self {
        Self { queue }
    }
}

impl OutputSink for CpalSink {
    fn write(&mut self, samples: &[f32]) -> Result<usize> {
        let written = self.queue.push_slice(samples);
        if written < samples.len() {
            warn!(
                dropped = samples.len() - written,
                "Output queue full, dropping samples"
            );
        }
        Ok(written)
    }
}
