use crate::buffer::{ChannelConfig, ChannelConfigOptions};
use crate::bus::AudioBus;
use crate::context::{AsBaseAudioContext, AudioContextRegistration, AudioParamId};
use crate::param::{AudioParam, AudioParamOptions};
use crate::process::{AudioParamValues, AudioProcessor};
use crate::SampleRate;

use super::AudioNode;

/// Options for constructing a GainNode
pub struct GainOptions {
    pub gain: f32,
    pub channel_config: ChannelConfigOptions,
}

impl Default for GainOptions {
    fn default() -> Self {
        Self {
            gain: 1.,
            channel_config: ChannelConfigOptions::default(),
        }
    }
}

/// AudioNode for volume control
pub struct GainNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
    gain: AudioParam,
}

impl AudioNode for GainNode {
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

impl GainNode {
    pub fn new<C: AsBaseAudioContext>(context: &C, options: GainOptions) -> Self {
        context.base().register(move |registration| {
            let param_opts = AudioParamOptions {
                min_value: 0.,
                max_value: 10_000.,
                default_value: 1.,
            };
            let (param, proc) = context
                .base()
                .create_audio_param(param_opts, registration.id());

            param.set_value(options.gain);

            let render = GainRenderer { gain: proc };

            let node = GainNode {
                registration,
                channel_config: options.channel_config.into(),
                gain: param,
            };

            (node, Box::new(render))
        })
    }

    pub fn gain(&self) -> &AudioParam {
        &self.gain
    }
}

struct GainRenderer {
    gain: AudioParamId,
}

impl AudioProcessor for GainRenderer {
    fn process(
        &mut self,
        inputs: &[AudioBus],
        outputs: &mut [AudioBus],
        params: AudioParamValues,
        _timestamp: f64,
        _sample_rate: SampleRate,
    ) {
        let input = &inputs[0];
        let output = &mut outputs[0];

        if input.is_silent() {
            output.make_silent();
            return;
        }

        // per-sample multiplication; the param processor already de-zippers
        // direct sets and evaluates automation sample-accurately
        let gain = params.get(&self.gain);

        output.set_number_of_channels(input.number_of_channels());
        for (input_channel, output_channel) in input.channels().iter().zip(output.channels_mut()) {
            output_channel
                .as_mut_slice()
                .iter_mut()
                .zip(input_channel.as_slice())
                .zip(gain)
                .for_each(|((o, i), g)| *o = i * g);
        }
    }
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use crate::context::{AsBaseAudioContext, OfflineAudioContext};
    use crate::node::{AudioNode, AudioScheduledSourceNode};
    use crate::SampleRate;

    #[test]
    fn test_gain_scales_dc_input() {
        let mut context = OfflineAudioContext::new(1, 256, SampleRate(44_100));

        let source = context.create_constant_source();
        let gain = context.create_gain();
        gain.gain().set_value_at_time(0.5, 0.).unwrap();

        source.connect(&gain);
        gain.connect(&context.destination());
        source.start();

        let buffer = context.start_rendering();
        assert_float_eq!(
            buffer.channel_data(0).as_slice(),
            &[0.5; 256][..],
            abs_all <= 1e-7
        );
    }

    #[test]
    fn test_gain_param_accepts_modulators() {
        let mut context = OfflineAudioContext::new(1, 256, SampleRate(44_100));

        let source = context.create_constant_source();
        let gain = context.create_gain();
        gain.gain().set_value_at_time(0.25, 0.).unwrap();

        // audio-rate modulator summed on top of the timeline value
        let modulator = context.create_constant_source();
        modulator.offset().set_value_at_time(0.5, 0.).unwrap();
        modulator.connect(gain.gain());

        source.connect(&gain);
        gain.connect(&context.destination());
        source.start();
        modulator.start();

        let buffer = context.start_rendering();
        assert_float_eq!(
            buffer.channel_data(0).as_slice(),
            &[0.75; 256][..],
            abs_all <= 1e-6
        );
    }

    #[test]
    fn test_gain_linear_ramp_on_dc() {
        // gain ramps linearly 0 -> 1 over one second on a DC 1.0 input,
        // so the output at frame n is n / 44100
        let sample_rate = 44_100;
        let mut context = OfflineAudioContext::new(1, sample_rate, SampleRate(sample_rate as u32));

        let source = context.create_constant_source();
        let gain = context.create_gain();
        gain.gain().set_value_at_time(0., 0.).unwrap();
        gain.gain().linear_ramp_to_value_at_time(1., 1.).unwrap();

        source.connect(&gain);
        gain.connect(&context.destination());
        source.start();

        let buffer = context.start_rendering();
        let samples = buffer.channel_data(0).as_slice();

        for &n in [0usize, 1, 441, 4_410, 22_050, 44_099].iter() {
            assert_float_eq!(samples[n], n as f32 / sample_rate as f32, ulps <= 2);
        }
    }
}
