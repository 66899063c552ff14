//! Audio IO: connects the render thread to the system audio device

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};

use crate::context::AudioContextOptions;
use crate::graph::RenderThread;

/// Selects an output device and builds the realtime stream around a
/// [`RenderThread`].
pub(crate) struct OutputBuilder {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
}

impl OutputBuilder {
    pub fn new(options: &AudioContextOptions) -> Self {
        let host = cpal::default_host();

        let device = match options.device_index {
            Some(index) => host
                .output_devices()
                .expect("cannot enumerate output devices")
                .nth(index)
                .expect("output device index out of range"),
            None => host
                .default_output_device()
                .expect("no output device available"),
        };

        let supported = device
            .default_output_config()
            .expect("no default output stream config");
        let sample_format = supported.sample_format();

        let mut config: StreamConfig = supported.config();
        if let Some(channels) = options.desired_channels {
            config.channels = channels;
        }
        if let Some(sample_rate) = options.desired_sample_rate {
            config.sample_rate = cpal::SampleRate(sample_rate);
        }

        Self {
            device,
            config,
            sample_format,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Build and start the output stream.
    ///
    /// A callback that takes longer than its own wallclock budget is counted
    /// as an underrun; the device played whatever was in the buffer (i.e.
    /// silence or stale samples) and rendering simply continues.
    pub fn build(self, render: RenderThread, underrun_count: Arc<AtomicU64>) -> Stream {
        let channels = self.config.channels as usize;
        let sample_rate = self.config.sample_rate.0 as f64;

        let err_fn = |err| log::error!("output stream error: {}", err);

        let stream = match self.sample_format {
            SampleFormat::F32 => {
                let mut render = render;
                self.device.build_output_stream(
                    &self.config,
                    move |data: &mut [f32], _| {
                        let deadline = watchdog(data.len(), channels, sample_rate);
                        render.render(data);
                        deadline.check(&underrun_count);
                    },
                    err_fn,
                )
            }
            SampleFormat::I16 => {
                let mut render = render;
                let mut buffer: Vec<f32> = vec![];
                self.device.build_output_stream(
                    &self.config,
                    move |data: &mut [i16], _| {
                        let deadline = watchdog(data.len(), channels, sample_rate);
                        buffer.resize(data.len(), 0.);
                        render.render(&mut buffer);
                        for (out, sample) in data.iter_mut().zip(buffer.iter()) {
                            *out = cpal::Sample::from::<f32>(sample);
                        }
                        deadline.check(&underrun_count);
                    },
                    err_fn,
                )
            }
            SampleFormat::U16 => {
                let mut render = render;
                let mut buffer: Vec<f32> = vec![];
                self.device.build_output_stream(
                    &self.config,
                    move |data: &mut [u16], _| {
                        let deadline = watchdog(data.len(), channels, sample_rate);
                        buffer.resize(data.len(), 0.);
                        render.render(&mut buffer);
                        for (out, sample) in data.iter_mut().zip(buffer.iter()) {
                            *out = cpal::Sample::from::<f32>(sample);
                        }
                        deadline.check(&underrun_count);
                    },
                    err_fn,
                )
            }
        }
        .expect("failed to build output stream");

        stream.play().expect("failed to start output stream");

        stream
    }
}

struct Watchdog {
    started: Instant,
    budget: Duration,
}

fn watchdog(samples: usize, channels: usize, sample_rate: f64) -> Watchdog {
    let frames = (samples / channels) as f64;
    Watchdog {
        started: Instant::now(),
        budget: Duration::from_secs_f64(frames / sample_rate),
    }
}

impl Watchdog {
    fn check(self, underrun_count: &AtomicU64) {
        let elapsed = self.started.elapsed();
        if elapsed > self.budget {
            underrun_count.fetch_add(1, Ordering::SeqCst);
            log::warn!(
                "render callback missed its deadline: {:?} > {:?}",
                elapsed,
                self.budget
            );
        }
    }
}
