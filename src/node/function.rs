use crate::buffer::{ChannelConfig, ChannelConfigOptions};
use crate::bus::AudioBus;
use crate::context::{AsBaseAudioContext, AudioContextRegistration};
use crate::control::{PlaybackState, Scheduler};
use crate::process::{AudioParamValues, AudioProcessor};
use crate::{SampleRate, RENDER_QUANTUM_SIZE};

use super::{AudioNode, AudioScheduledSourceNode};

/// Signature of the sample generator: fills one channel's window of samples,
/// given the channel index and the time of the first sample.
pub type RenderFunction = dyn FnMut(&mut [f32], usize, f64) + Send;

/// Scheduled source node that renders a user-provided callback, for
/// procedural signals and quick experiments.
pub struct FunctionNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
    channels: usize,
    scheduler: Scheduler,
}

impl AudioNode for FunctionNode {
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

impl AudioScheduledSourceNode for FunctionNode {
    fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl FunctionNode {
    pub fn new<C, F>(context: &C, channels: usize, function: F) -> Self
    where
        C: AsBaseAudioContext,
        F: FnMut(&mut [f32], usize, f64) + Send + 'static,
    {
        assert!(channels >= 1 && channels <= crate::MAX_CHANNELS);

        context.base().register(move |registration| {
            let scheduler = Scheduler::new();

            let render = FunctionRenderer {
                function: Box::new(function),
                channels,
                scheduler: scheduler.clone(),
            };

            let node = FunctionNode {
                registration,
                channel_config: ChannelConfigOptions::default().into(),
                channels,
                scheduler,
            };

            (node, Box::new(render))
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}

struct FunctionRenderer {
    function: Box<RenderFunction>,
    channels: usize,
    scheduler: Scheduler,
}

impl AudioProcessor for FunctionRenderer {
    fn process(
        &mut self,
        _inputs: &[AudioBus],
        outputs: &mut [AudioBus],
        _params: AudioParamValues,
        timestamp: f64,
        sample_rate: SampleRate,
    ) {
        let output = &mut outputs[0];
        output.set_number_of_channels(self.channels);

        let window = match self
            .scheduler
            .quantum_window(timestamp, RENDER_QUANTUM_SIZE, sample_rate)
        {
            Some(window) => window,
            None => {
                output.make_silent();
                return;
            }
        };

        if window.count == 0 {
            output.make_silent();
            if window.ends {
                self.scheduler.finish();
            }
            return;
        }

        let window_start = timestamp + window.offset as f64 / sample_rate.0 as f64;

        for index in 0..self.channels {
            let channel = output.channel_data_mut(index).as_mut_slice();
            channel.iter_mut().for_each(|s| *s = 0.);

            let window_slice = &mut channel[window.offset..window.offset + window.count];
            (self.function)(window_slice, index, window_start);
        }

        if window.ends {
            self.scheduler.finish();
        }
    }

    fn propagates_silence(&self, _now: f64, _last_non_silent: f64) -> bool {
        matches!(
            self.scheduler.playback_state(),
            PlaybackState::Unscheduled | PlaybackState::Finished
        )
    }

    fn finished(&self) -> bool {
        self.scheduler.has_finished()
    }
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use crate::context::{AsBaseAudioContext, OfflineAudioContext};
    use crate::node::{AudioNode, AudioScheduledSourceNode};
    use crate::SampleRate;

    #[test]
    fn test_function_node_renders_callback() {
        let mut context = OfflineAudioContext::new(2, 256, SampleRate(44_100));

        // left ramps, right holds
        let node = context.create_function(2, |data, channel, _when| {
            for (i, sample) in data.iter_mut().enumerate() {
                *sample = if channel == 0 { i as f32 } else { 0.25 };
            }
        });
        node.connect(&context.destination());
        node.start();

        let buffer = context.start_rendering();

        assert_float_eq!(buffer.channel_data(0).as_slice()[3], 3., abs_all <= 0.);
        assert_float_eq!(buffer.channel_data(1).as_slice()[100], 0.25, abs_all <= 0.);
    }
}
