use crate::buffer::{ChannelConfig, ChannelConfigOptions};
use crate::bus::AudioBus;
use crate::context::{AsBaseAudioContext, AudioContextRegistration, AudioParamId};
use crate::param::{AudioParam, AudioParamOptions};
use crate::process::{AudioParamValues, AudioProcessor};
use crate::{SampleRate, RENDER_QUANTUM_SIZE};

use super::AudioNode;

/// Options for constructing a DelayNode
pub struct DelayOptions {
    /// Upper bound for the `delay_time` parameter, determines the internal
    /// buffer size
    pub max_delay_time: f32,
    pub delay_time: f32,
    pub channel_config: ChannelConfigOptions,
}

impl Default for DelayOptions {
    fn default() -> Self {
        Self {
            max_delay_time: 1.,
            delay_time: 0.,
            channel_config: ChannelConfigOptions::default(),
        }
    }
}

/// AudioNode delaying its input, with a linearly interpolated fractional
/// delay time.
pub struct DelayNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
    delay_time: AudioParam,
    max_delay_time: f32,
}

impl AudioNode for DelayNode {
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

impl DelayNode {
    pub fn new<C: AsBaseAudioContext>(context: &C, options: DelayOptions) -> Self {
        let max_delay_time = options.max_delay_time;
        assert!(max_delay_time.is_finite() && max_delay_time > 0.);

        let sample_rate = context.base().sample_rate();

        context.base().register(move |registration| {
            let param_opts = AudioParamOptions {
                min_value: 0.,
                max_value: max_delay_time,
                default_value: 0.,
            };
            let (param, proc) = context
                .base()
                .create_audio_param(param_opts, registration.id());

            param.set_value(options.delay_time);

            // one extra frame so a full max_delay read interpolates validly
            let capacity = (max_delay_time as f64 * sample_rate.0 as f64).ceil() as usize
                + RENDER_QUANTUM_SIZE;

            let render = DelayRenderer {
                delay_time: proc,
                ring: vec![],
                capacity,
                write_index: 0,
                max_delay_time: max_delay_time as f64,
            };

            let node = DelayNode {
                registration,
                channel_config: options.channel_config.into(),
                delay_time: param,
                max_delay_time,
            };

            (node, Box::new(render))
        })
    }

    pub fn delay_time(&self) -> &AudioParam {
        &self.delay_time
    }

    pub fn max_delay_time(&self) -> f32 {
        self.max_delay_time
    }
}

struct DelayRenderer {
    delay_time: AudioParamId,
    /// one ring buffer per channel
    ring: Vec<Vec<f32>>,
    capacity: usize,
    write_index: usize,
    max_delay_time: f64,
}

impl AudioProcessor for DelayRenderer {
    fn process(
        &mut self,
        inputs: &[AudioBus],
        outputs: &mut [AudioBus],
        params: AudioParamValues,
        _timestamp: f64,
        sample_rate: SampleRate,
    ) {
        let input = &inputs[0];
        let output = &mut outputs[0];

        let channels = input.number_of_channels();
        if self.ring.len() != channels {
            // channel layout changed, the tail is abandoned
            self.ring = vec![vec![0.; self.capacity]; channels];
        }

        output.set_number_of_channels(channels);

        let rate = sample_rate.0 as f64;
        let max_delay_frames = (self.max_delay_time * rate) as f32;
        let delay_values = params.get(&self.delay_time);
        let capacity = self.capacity;

        let mut next_write_index = self.write_index;
        for (channel, ring) in (0..channels).zip(self.ring.iter_mut()) {
            let mut write_index = self.write_index;

            let input_data = input.channel_data(channel).as_slice();
            let output_data = output.channel_data_mut(channel).as_mut_slice();

            for (i, (out, &sample)) in output_data.iter_mut().zip(input_data).enumerate() {
                ring[write_index] = sample;

                let delay_frames =
                    (delay_values[i] * rate as f32).clamp(0., max_delay_frames);
                let read_position =
                    write_index as f32 - delay_frames + capacity as f32;
                let read_index = read_position as usize;
                let fraction = read_position - read_index as f32;

                let s0 = ring[read_index % capacity];
                let s1 = ring[(read_index + 1) % capacity];
                *out = s0 + fraction * (s1 - s0);

                write_index = (write_index + 1) % capacity;
            }

            next_write_index = write_index;
        }
        self.write_index = next_write_index;

        // the line outputs zeros long after the input went quiet; re-check
        // so silence propagation can eventually skip this node
        output.update_silence_hint();
    }

    fn reset(&mut self) {
        for ring in self.ring.iter_mut() {
            ring.iter_mut().for_each(|s| *s = 0.);
        }
    }

    fn tail_time(&self) -> f64 {
        self.max_delay_time
    }
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use crate::context::{AsBaseAudioContext, OfflineAudioContext};
    use crate::node::{AudioNode, AudioScheduledSourceNode};
    use crate::SampleRate;

    #[test]
    fn test_unit_impulse_is_delayed() {
        let mut context = OfflineAudioContext::new(1, 512, SampleRate(44_100));

        // unit impulse at frame 0
        let mut fired = false;
        let source = context.create_function(1, move |data, _channel, when| {
            if !fired && when == 0. {
                data[0] = 1.;
                fired = true;
            }
        });

        let delay = context.create_delay(0.02);
        delay.delay_time().set_value_at_time(0.01, 0.).unwrap();

        source.connect(&delay);
        delay.connect(&context.destination());
        source.start();

        let buffer = context.start_rendering();
        let samples = buffer.channel_data(0).as_slice();

        // 0.01 s at 44100 Hz = 441 frames
        let peak = samples
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert!((peak as i64 - 441).abs() <= 1);
        assert_float_eq!(samples[0], 0., abs_all <= 0.);
        assert_float_eq!(samples[peak], 1., abs_all <= 1e-6);
    }

    #[test]
    fn test_zero_delay_passes_through() {
        let mut context = OfflineAudioContext::new(1, 128, SampleRate(44_100));

        let source = context.create_constant_source();
        let delay = context.create_delay(1.);

        source.connect(&delay);
        delay.connect(&context.destination());
        source.start();

        let buffer = context.start_rendering();
        assert_float_eq!(
            buffer.channel_data(0).as_slice(),
            &[1.; 128][..],
            abs_all <= 1e-7
        );
    }
}
