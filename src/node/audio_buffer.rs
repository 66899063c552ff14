use std::sync::{Arc, Mutex};

use crate::buffer::{AudioBuffer, ChannelConfig, ChannelConfigOptions};
use crate::bus::AudioBus;
use crate::context::{AsBaseAudioContext, AudioContextRegistration, AudioParamId};
use crate::control::{Controller, PlaybackState, Scheduler};
use crate::param::{AudioParam, AudioParamOptions};
use crate::process::{AudioParamValues, AudioProcessor};
use crate::{SampleRate, RENDER_QUANTUM_SIZE};

use super::{AudioControllableSourceNode, AudioNode, AudioScheduledSourceNode};

/// Options for constructing an AudioBufferSourceNode
#[derive(Default)]
pub struct AudioBufferSourceNodeOptions {
    pub buffer: Option<AudioBuffer>,
    pub channel_config: ChannelConfigOptions,
}

/// Scheduled source playing back a memory-resident sample buffer with
/// linear-interpolated resampling, optional looping and a variable playback
/// rate.
pub struct AudioBufferSourceNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
    controller: Controller,
    gain: AudioParam,
    playback_rate: AudioParam,
    buffer: Arc<Mutex<BufferSlot>>,
}

#[derive(Default)]
struct BufferSlot {
    pending: Option<AudioBuffer>,
}

impl AudioNode for AudioBufferSourceNode {
    fn registration(&self) -> &AudioContextRegistration {
        &self.registration
    }

    fn channel_config_raw(&self) -> &ChannelConfig {
        &self.channel_config
    }

    fn number_of_inputs(&self) -> u32 {
        0
    }
    fn number_of_outputs(&self) -> u32 {
        1
    }
}

impl AudioScheduledSourceNode for AudioBufferSourceNode {
    fn scheduler(&self) -> &Scheduler {
        self.controller.scheduler()
    }
}

impl AudioControllableSourceNode for AudioBufferSourceNode {
    fn controller(&self) -> &Controller {
        &self.controller
    }
}

impl AudioBufferSourceNode {
    pub fn new<C: AsBaseAudioContext>(context: &C, options: AudioBufferSourceNodeOptions) -> Self {
        context.base().register(move |registration| {
            let id = registration.id();

            let (gain, gain_proc) = context.base().create_audio_param(
                AudioParamOptions {
                    min_value: 0.,
                    max_value: 10_000.,
                    default_value: 1.,
                },
                id,
            );
            let (playback_rate, playback_rate_proc) = context.base().create_audio_param(
                AudioParamOptions {
                    min_value: 0.,
                    max_value: 1_024.,
                    default_value: 1.,
                },
                id,
            );

            let controller = Controller::new();
            let slot = Arc::new(Mutex::new(BufferSlot {
                pending: options.buffer,
            }));

            let render = AudioBufferRenderer {
                gain: gain_proc,
                playback_rate: playback_rate_proc,
                controller: controller.clone(),
                slot: slot.clone(),
                buffer: None,
                position: 0.,
            };

            let node = AudioBufferSourceNode {
                registration,
                channel_config: options.channel_config.into(),
                controller,
                gain,
                playback_rate,
                buffer: slot,
            };

            (node, Box::new(render))
        })
    }

    pub fn gain(&self) -> &AudioParam {
        &self.gain
    }

    pub fn playback_rate(&self) -> &AudioParam {
        &self.playback_rate
    }

    /// Provide the sample data to play. Takes effect at the next render
    /// quantum and rewinds playback to the start.
    pub fn set_buffer(&self, buffer: AudioBuffer) {
        self.buffer.lock().unwrap().pending = Some(buffer);
    }
}

struct AudioBufferRenderer {
    gain: AudioParamId,
    playback_rate: AudioParamId,
    controller: Controller,
    slot: Arc<Mutex<BufferSlot>>,
    buffer: Option<AudioBuffer>,
    /// playhead in buffer frames (buffer sample rate)
    position: f64,
}

impl AudioProcessor for AudioBufferRenderer {
    fn process(
        &mut self,
        _inputs: &[AudioBus],
        outputs: &mut [AudioBus],
        params: AudioParamValues,
        timestamp: f64,
        sample_rate: SampleRate,
    ) {
        let output = &mut outputs[0];

        if let Ok(mut slot) = self.slot.try_lock() {
            if let Some(buffer) = slot.pending.take() {
                self.buffer = Some(buffer);
                self.position = 0.;
            }
        }

        let scheduler = self.controller.scheduler();
        let window = match scheduler.quantum_window(timestamp, RENDER_QUANTUM_SIZE, sample_rate) {
            Some(window) => window,
            None => {
                output.make_silent();
                return;
            }
        };

        let buffer = match &self.buffer {
            Some(buffer) => buffer,
            None => {
                // no sample data (or the decoder failed): play silence
                output.make_silent();
                if window.ends {
                    scheduler.finish();
                }
                return;
            }
        };

        if window.count == 0 {
            output.make_silent();
            if window.ends {
                scheduler.finish();
            }
            return;
        }

        if let Some(seek) = self.controller.should_seek() {
            self.position = seek.max(0.) * buffer.sample_rate().0 as f64;
        }

        let buffer_len = buffer.sample_len() as f64;
        let buffer_rate = buffer.sample_rate().0 as f64;
        let rate_scale = buffer_rate / sample_rate.0 as f64;

        let loop_ = self.controller.loop_();
        let loop_start = self.controller.loop_start() * buffer_rate;
        let loop_end = (self.controller.loop_end() * buffer_rate).min(buffer_len);

        let gain = params.get(&self.gain);
        let playback_rate = params.get(&self.playback_rate);
        let channels = buffer.number_of_channels();

        output.set_number_of_channels(channels);
        for channel in 0..channels {
            output
                .channel_data_mut(channel)
                .as_mut_slice()
                .iter_mut()
                .for_each(|s| *s = 0.);
        }

        let mut position = self.position;
        let mut exhausted = false;

        for i in window.offset..window.offset + window.count {
            if loop_ && loop_end > loop_start && position >= loop_end {
                position = loop_start + (position - loop_end);
            }
            if position >= buffer_len {
                exhausted = true;
                break;
            }

            let index = position as usize;
            let fraction = (position - index as f64) as f32;

            for channel in 0..channels {
                let data = buffer.channel_data(channel).as_slice();
                let s0 = data[index];
                let s1 = if index + 1 < data.len() {
                    data[index + 1]
                } else if loop_ {
                    data[(loop_start as usize).min(data.len() - 1)]
                } else {
                    0.
                };
                let sample = (s0 + fraction * (s1 - s0)) * gain[i];
                output.channel_data_mut(channel).as_mut_slice()[i] = sample;
            }

            position += playback_rate[i] as f64 * rate_scale;
        }

        self.position = position;

        if exhausted || window.ends {
            scheduler.finish();
        }
    }

    fn propagates_silence(&self, _now: f64, _last_non_silent: f64) -> bool {
        matches!(
            self.controller.scheduler().playback_state(),
            PlaybackState::Unscheduled | PlaybackState::Finished
        )
    }

    fn finished(&self) -> bool {
        self.controller.scheduler().has_finished()
    }
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use super::*;
    use crate::buffer::ChannelData;
    use crate::context::{AsBaseAudioContext, OfflineAudioContext};
    use crate::node::AudioControllableSourceNode;

    fn ramp_buffer(len: usize, sample_rate: u32) -> AudioBuffer {
        let data: Vec<f32> = (0..len).map(|i| i as f32).collect();
        AudioBuffer::from_channels(vec![ChannelData::from(data)], SampleRate(sample_rate))
    }

    #[test]
    fn test_buffer_playback_and_finish() {
        let mut context = OfflineAudioContext::new(1, 256, SampleRate(44_100));

        let source = context.create_buffer_source();
        source.set_buffer(ramp_buffer(100, 44_100));
        source.connect(&context.destination());
        source.start();

        let buffer = context.start_rendering();
        let samples = buffer.channel_data(0).as_slice();

        assert_float_eq!(samples[0], 0., abs_all <= 0.);
        assert_float_eq!(samples[50], 50., abs_all <= 1e-6);
        assert_float_eq!(samples[99], 99., abs_all <= 1e-6);
        // sample data exhausted, the source finished and went silent
        assert_float_eq!(samples[100], 0., abs_all <= 0.);
        assert_eq!(source.playback_state(), PlaybackState::Finished);
    }

    #[test]
    fn test_buffer_looping() {
        let mut context = OfflineAudioContext::new(1, 256, SampleRate(44_100));

        let source = context.create_buffer_source();
        source.set_buffer(ramp_buffer(10, 44_100));
        source.set_loop(true);
        source.set_loop_start(0.);
        source.set_loop_end(10. / 44_100.);

        source.connect(&context.destination());
        source.start();

        let buffer = context.start_rendering();
        let samples = buffer.channel_data(0).as_slice();

        // the 10-frame ramp repeats
        assert_float_eq!(samples[3], 3., abs_all <= 1e-6);
        assert_float_eq!(samples[13], 3., abs_all <= 1e-6);
        assert_float_eq!(samples[203], 3., abs_all <= 1e-6);
    }

    #[test]
    fn test_playback_rate_resamples() {
        let mut context = OfflineAudioContext::new(1, 128, SampleRate(44_100));

        let source = context.create_buffer_source();
        source.set_buffer(ramp_buffer(300, 44_100));
        source.playback_rate().set_value_at_time(2., 0.).unwrap();

        source.connect(&context.destination());
        source.start();

        let buffer = context.start_rendering();
        let samples = buffer.channel_data(0).as_slice();

        // double speed: output frame n reads buffer frame 2n
        assert_float_eq!(samples[10], 20., abs_all <= 1e-5);
        assert_float_eq!(samples[60], 120., abs_all <= 1e-4);
    }
}
