use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer::{ChannelConfig, ChannelConfigOptions};
use crate::bus::AudioBus;
use crate::context::{AsBaseAudioContext, AudioContextRegistration};
use crate::process::{AudioParamValues, AudioProcessor};
use crate::{AudioGraphError, SampleRate};

use super::AudioNode;

/// Options for constructing a RecorderNode
#[derive(Default)]
pub struct RecorderOptions {
    /// Record a mono mixdown instead of all input channels
    pub mix_to_mono: bool,
    pub channel_config: ChannelConfigOptions,
}

struct RecorderShared {
    recording: AtomicBool,
    mix_to_mono: AtomicBool,
    /// interleaved samples, or mono when mixing down
    data: Mutex<Vec<f32>>,
    /// channel count of the captured data
    channels: AtomicUsize,
    sample_rate: SampleRate,
}

/// Inspector node capturing the signal flowing through it. Audio passes
/// through unchanged.
///
/// Captured samples can be written to a 32-bit float WAV file. When nothing
/// consumes its output, register it with
/// [`AsBaseAudioContext::add_automatic_pull_node`] so it keeps capturing.
pub struct RecorderNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
    shared: Arc<RecorderShared>,
}

impl AudioNode for RecorderNode {
    fn registration(&self) -> &AudioContextRegistration {
        &self.registration
    }

    fn channel_config_raw(&self) -> &ChannelConfig {
        &self.channel_config
    }

    fn number_of_inputs(&self) -> u32 {
        1
    }
    fn number_of_outputs(&self) -> u32 {
        1
    }
}

impl RecorderNode {
    pub fn new<C: AsBaseAudioContext>(context: &C, options: RecorderOptions) -> Self {
        let sample_rate = context.base().sample_rate();

        context.base().register(move |registration| {
            let shared = Arc::new(RecorderShared {
                recording: AtomicBool::new(false),
                mix_to_mono: AtomicBool::new(options.mix_to_mono),
                data: Mutex::new(vec![]),
                channels: AtomicUsize::new(1),
                sample_rate,
            });

            let render = RecorderRenderer {
                shared: shared.clone(),
            };

            let node = RecorderNode {
                registration,
                channel_config: options.channel_config.into(),
                shared,
            };

            (node, Box::new(render))
        })
    }

    pub fn start_recording(&self) {
        self.shared.recording.store(true, Ordering::SeqCst);
    }

    pub fn stop_recording(&self) {
        self.shared.recording.store(false, Ordering::SeqCst);
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::SeqCst)
    }

    pub fn mix_to_mono(&self) -> bool {
        self.shared.mix_to_mono.load(Ordering::SeqCst)
    }

    pub fn set_mix_to_mono(&self, mix_to_mono: bool) {
        self.shared.mix_to_mono.store(mix_to_mono, Ordering::SeqCst);
    }

    /// Number of captured sample-frames.
    pub fn recorded_frames(&self) -> usize {
        let channels = self.shared.channels.load(Ordering::SeqCst).max(1);
        self.shared.data.lock().unwrap().len() / channels
    }

    /// Take the captured interleaved samples, leaving the recorder empty.
    pub fn take_recording(&self) -> Vec<f32> {
        std::mem::take(&mut *self.shared.data.lock().unwrap())
    }

    /// Write the captured samples as 32-bit float PCM WAV and clear the
    /// recording.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), AudioGraphError> {
        let channels = self.shared.channels.load(Ordering::SeqCst).max(1);
        let data = self.take_recording();

        let spec = hound::WavSpec {
            channels: channels as u16,
            sample_rate: self.shared.sample_rate.0,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };

        let mut writer = hound::WavWriter::create(path, spec)
            .map_err(|e| AudioGraphError::Encoder(e.to_string()))?;

        for sample in data {
            writer
                .write_sample(sample)
                .map_err(|e| AudioGraphError::Encoder(e.to_string()))?;
        }

        writer
            .finalize()
            .map_err(|e| AudioGraphError::Encoder(e.to_string()))
    }
}

struct RecorderRenderer {
    shared: Arc<RecorderShared>,
}

impl AudioProcessor for RecorderRenderer {
    fn process(
        &mut self,
        inputs: &[AudioBus],
        outputs: &mut [AudioBus],
        _params: AudioParamValues,
        _timestamp: f64,
        _sample_rate: SampleRate,
    ) {
        let input = &inputs[0];
        let output = &mut outputs[0];

        // pass through unchanged
        output.copy_from(input);

        if !self.shared.recording.load(Ordering::SeqCst) {
            return;
        }

        // a reader holding the mutex costs us this quantum of capture, but
        // never blocks the audio thread
        let mut data = match self.shared.data.try_lock() {
            Ok(data) => data,
            Err(_) => {
                log::debug!("recorder buffer contended, dropping one quantum");
                return;
            }
        };

        let channels = input.number_of_channels();
        let frames = crate::RENDER_QUANTUM_SIZE;

        if self.shared.mix_to_mono.load(Ordering::SeqCst) {
            self.shared.channels.store(1, Ordering::SeqCst);
            data.reserve(frames);

            let scale = 1. / channels as f32;
            for i in 0..frames {
                let mut value = 0.;
                for channel in 0..channels {
                    value += input.channel_data(channel).as_slice()[i];
                }
                data.push(value * scale);
            }
        } else {
            self.shared.channels.store(channels, Ordering::SeqCst);
            data.reserve(frames * channels);

            for i in 0..frames {
                for channel in 0..channels {
                    data.push(input.channel_data(channel).as_slice()[i]);
                }
            }
        }
    }

    fn propagates_silence(&self, _now: f64, _last_non_silent: f64) -> bool {
        // silence is part of a recording too
        false
    }
}
