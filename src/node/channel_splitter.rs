use crate::buffer::{ChannelConfig, ChannelConfigOptions, ChannelCountMode, ChannelInterpretation};
use crate::bus::AudioBus;
use crate::context::{AsBaseAudioContext, AudioContextRegistration};
use crate::process::{AudioParamValues, AudioProcessor};
use crate::SampleRate;

use super::AudioNode;

/// Options for constructing a ChannelSplitterNode
pub struct ChannelSplitterOptions {
    pub number_of_outputs: u32,
    pub channel_config: ChannelConfigOptions,
}

impl Default for ChannelSplitterOptions {
    fn default() -> Self {
        Self {
            number_of_outputs: 6,
            channel_config: ChannelConfigOptions {
                // one output per input channel, discrete so the junction
                // never speaker-mixes on the way in
                count: 6,
                mode: ChannelCountMode::Explicit,
                interpretation: ChannelInterpretation::Discrete,
            },
        }
    }
}

/// Fans the channels of one stream out to separate mono outputs.
///
/// Output port `i` carries input channel `i`; ports beyond the input's
/// channel count stay silent. The number of outputs is fixed at
/// construction, as is the channel configuration.
pub struct ChannelSplitterNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
}

impl AudioNode for ChannelSplitterNode {
    fn registration(&self) -> &AudioContextRegistration {
        &self.registration
    }

    fn channel_config_raw(&self) -> &ChannelConfig {
        &self.channel_config
    }
    fn set_channel_count(&self, _v: usize) {
        panic!("the channel count of a ChannelSplitterNode is fixed")
    }
    fn set_channel_count_mode(&self, _v: ChannelCountMode) {
        panic!("the channel count mode of a ChannelSplitterNode is fixed")
    }
    fn set_channel_interpretation(&self, _v: ChannelInterpretation) {
        panic!("the channel interpretation of a ChannelSplitterNode is fixed")
    }

    fn number_of_inputs(&self) -> u32 {
        1
    }
    fn number_of_outputs(&self) -> u32 {
        self.channel_count() as _
    }
}

impl ChannelSplitterNode {
    pub fn new<C: AsBaseAudioContext>(context: &C, mut options: ChannelSplitterOptions) -> Self {
        assert!(
            options.number_of_outputs >= 1
                && options.number_of_outputs as usize <= crate::MAX_CHANNELS
        );

        context.base().register(move |registration| {
            // the channel count doubles as the output count
            options.channel_config.count = options.number_of_outputs as usize;

            let node = ChannelSplitterNode {
                registration,
                channel_config: options.channel_config.into(),
            };

            (node, Box::new(ChannelSplitterRenderer {}))
        })
    }
}

#[derive(Debug)]
struct ChannelSplitterRenderer {}

impl AudioProcessor for ChannelSplitterRenderer {
    fn process(
        &mut self,
        inputs: &[AudioBus],
        outputs: &mut [AudioBus],
        _params: AudioParamValues,
        _timestamp: f64,
        _sample_rate: SampleRate,
    ) {
        let input = &inputs[0];

        // route channel i to output i, sharing the data; ports the input
        // cannot fill go silent
        for (channel, output) in outputs.iter_mut().enumerate() {
            output.force_mono();

            match input.channels().get(channel) {
                Some(data) if !input.is_silent() => {
                    *output.channel_data_mut(0) = data.clone();
                }
                _ => output.make_silent(),
            }
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
    fn test_outputs_carry_single_channels() {
        let mut context = OfflineAudioContext::new(1, 128, SampleRate(44_100));

        // stereo source with distinct channel content
        let source = context.create_function(2, |data, channel, _when| {
            let value = if channel == 0 { 0.1 } else { 0.9 };
            data.iter_mut().for_each(|s| *s = value);
        });

        let splitter = context.create_channel_splitter(2);
        source.connect(&splitter);

        // listen to output 1 only
        splitter.connect_at(&context.destination(), 1, 0).unwrap();
        source.start();

        let buffer = context.start_rendering();

        assert_float_eq!(
            buffer.channel_data(0).as_slice(),
            &[0.9; 128][..],
            abs_all <= 0.
        );
    }

    #[test]
    fn test_unfilled_outputs_are_silent() {
        let mut context = OfflineAudioContext::new(1, 128, SampleRate(44_100));

        // mono source into a 4-way splitter
        let source = context.create_constant_source();
        let splitter = context.create_channel_splitter(4);

        source.connect(&splitter);
        splitter.connect_at(&context.destination(), 2, 0).unwrap();
        source.start();

        let buffer = context.start_rendering();

        // the input has no third channel, so output 2 is silence
        assert_float_eq!(
            buffer.channel_data(0).as_slice(),
            &[0.; 128][..],
            abs_all <= 0.
        );
    }
}
