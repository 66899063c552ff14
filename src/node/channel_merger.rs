use crate::buffer::{ChannelConfig, ChannelConfigOptions, ChannelCountMode, ChannelInterpretation};
use crate::bus::AudioBus;
use crate::context::{AsBaseAudioContext, AudioContextRegistration};
use crate::process::{AudioParamValues, AudioProcessor};
use crate::SampleRate;

use super::AudioNode;

/// Options for constructing a ChannelMergerNode
pub struct ChannelMergerOptions {
    pub number_of_inputs: u32,
    pub channel_config: ChannelConfigOptions,
}

impl Default for ChannelMergerOptions {
    fn default() -> Self {
        Self {
            number_of_inputs: 6,
            channel_config: ChannelConfigOptions {
                count: 1, // each input is mixed down to mono
                mode: ChannelCountMode::Explicit,
                interpretation: ChannelInterpretation::Speakers,
            },
        }
    }
}

/// AudioNode for combining mono streams into a single multi-channel stream.
///
/// Input `i` becomes channel `i` of the output; unconnected inputs
/// contribute silent channels.
pub struct ChannelMergerNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
    number_of_inputs: u32,
}

impl AudioNode for ChannelMergerNode {
    fn registration(&self) -> &AudioContextRegistration {
        &self.registration
    }

    fn channel_config_raw(&self) -> &ChannelConfig {
        &self.channel_config
    }
    fn set_channel_count(&self, _v: usize) {
        panic!("Cannot edit channel count of ChannelMergerNode")
    }
    fn set_channel_count_mode(&self, _v: ChannelCountMode) {
        panic!("Cannot edit channel count mode of ChannelMergerNode")
    }

    fn number_of_inputs(&self) -> u32 {
        self.number_of_inputs
    }
    fn number_of_outputs(&self) -> u32 {
        1
    }
}

impl ChannelMergerNode {
    pub fn new<C: AsBaseAudioContext>(context: &C, mut options: ChannelMergerOptions) -> Self {
        assert!(
            options.number_of_inputs >= 1
                && options.number_of_inputs as usize <= crate::MAX_CHANNELS
        );

        context.base().register(move |registration| {
            options.channel_config.count = 1;
            options.channel_config.mode = ChannelCountMode::Explicit;

            let node = ChannelMergerNode {
                registration,
                channel_config: options.channel_config.into(),
                number_of_inputs: options.number_of_inputs,
            };

            let render = ChannelMergerRenderer {
                number_of_inputs: options.number_of_inputs as usize,
            };

            (node, Box::new(render))
        })
    }
}

#[derive(Debug)]
struct ChannelMergerRenderer {
    number_of_inputs: usize,
}

impl AudioProcessor for ChannelMergerRenderer {
    fn process(
        &mut self,
        inputs: &[AudioBus],
        outputs: &mut [AudioBus],
        _params: AudioParamValues,
        _timestamp: f64,
        _sample_rate: SampleRate,
    ) {
        let output = &mut outputs[0];

        if inputs.iter().all(|input| input.is_silent()) {
            output.set_number_of_channels(self.number_of_inputs);
            output.make_silent();
            return;
        }

        output.set_number_of_channels(self.number_of_inputs);
        for (i, input) in inputs.iter().enumerate() {
            // each input junction has already mixed down to mono
            *output.channel_data_mut(i) = input.channel_data(0).clone();
        }
    }
}
