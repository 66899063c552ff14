use crate::buffer::ChannelConfig;
use crate::bus::AudioBus;
use crate::context::{AudioContextRegistration, BaseAudioContext};
use crate::process::{AudioParamValues, AudioProcessor};
use crate::SampleRate;

use super::AudioNode;

/// The final destination of the audio graph: its single input junction mixes
/// to the hardware channel count and its output feeds the device buffer (or
/// the offline target).
pub struct DestinationNode {
    pub(crate) registration: AudioContextRegistration,
    pub(crate) channel_count: usize,
}

impl AudioNode for DestinationNode {
    fn registration(&self) -> &AudioContextRegistration {
        &self.registration
    }

    fn channel_config_raw(&self) -> &ChannelConfig {
        // the config is owned by the context so every handle observes it
        self.registration.context().destination_channel_config()
    }

    fn number_of_inputs(&self) -> u32 {
        1
    }
    fn number_of_outputs(&self) -> u32 {
        1
    }
}

impl DestinationNode {
    pub(crate) fn new(context: &BaseAudioContext, channel_count: usize) -> Self {
        context.register(move |registration| {
            let node = Self {
                registration,
                channel_count,
            };
            let render = DestinationRenderer {};

            (node, Box::new(render))
        })
    }

    /// Number of channels of the audio hardware (or the offline buffer).
    pub fn max_channels_count(&self) -> usize {
        self.channel_count
    }
}

#[derive(Debug)]
struct DestinationRenderer {}

impl AudioProcessor for DestinationRenderer {
    fn process(
        &mut self,
        inputs: &[AudioBus],
        outputs: &mut [AudioBus],
        _params: AudioParamValues,
        _timestamp: f64,
        _sample_rate: SampleRate,
    ) {
        // the summing junction has already mixed to the hardware channel
        // count, pass through without a copy
        outputs[0].copy_from(&inputs[0]);
    }
}
