use crate::buffer::{ChannelConfig, ChannelConfigOptions};
use crate::bus::AudioBus;
use crate::context::{AsBaseAudioContext, AudioContextRegistration, AudioParamId};
use crate::control::{PlaybackState, Scheduler};
use crate::param::{AudioParam, AudioParamOptions};
use crate::process::{AudioParamValues, AudioProcessor};
use crate::{SampleRate, RENDER_QUANTUM_SIZE};

use super::{AudioNode, AudioScheduledSourceNode};

/// Options for constructing a ConstantSourceNode
pub struct ConstantSourceOptions {
    pub offset: f32,
    pub channel_config: ChannelConfigOptions,
}

impl Default for ConstantSourceOptions {
    fn default() -> Self {
        Self {
            offset: 1.,
            channel_config: ChannelConfigOptions::default(),
        }
    }
}

/// Scheduled source of a constant (but automatable) value. Useful as a DC
/// offset, or to drive several params from one automated value.
pub struct ConstantSourceNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
    offset: AudioParam,
    scheduler: Scheduler,
}

impl AudioNode for ConstantSourceNode {
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

impl AudioScheduledSourceNode for ConstantSourceNode {
    fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl ConstantSourceNode {
    pub fn new<C: AsBaseAudioContext>(context: &C, options: ConstantSourceOptions) -> Self {
        context.base().register(move |registration| {
            let param_opts = AudioParamOptions {
                min_value: f32::MIN,
                max_value: f32::MAX,
                default_value: 1.,
            };
            let (param, proc) = context
                .base()
                .create_audio_param(param_opts, registration.id());

            param.set_value(options.offset);

            let scheduler = Scheduler::new();

            let render = ConstantSourceRenderer {
                offset: proc,
                scheduler: scheduler.clone(),
            };

            let node = ConstantSourceNode {
                registration,
                channel_config: options.channel_config.into(),
                offset: param,
                scheduler,
            };

            (node, Box::new(render))
        })
    }

    pub fn offset(&self) -> &AudioParam {
        &self.offset
    }
}

struct ConstantSourceRenderer {
    offset: AudioParamId,
    scheduler: Scheduler,
}

impl AudioProcessor for ConstantSourceRenderer {
    fn process(
        &mut self,
        _inputs: &[AudioBus],
        outputs: &mut [AudioBus],
        params: AudioParamValues,
        timestamp: f64,
        sample_rate: SampleRate,
    ) {
        let output = &mut outputs[0];
        output.force_mono();

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

        let offset = params.get(&self.offset);
        let channel = output.channel_data_mut(0).as_mut_slice();

        channel.iter_mut().for_each(|s| *s = 0.);
        for i in window.offset..window.offset + window.count {
            channel[i] = offset[i];
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
    fn test_constant_source_scheduling_is_frame_accurate() {
        let mut context = OfflineAudioContext::new(1, 384, SampleRate(44_100));

        let source = context.create_constant_source();
        source.connect(&context.destination());

        // start at frame 100, stop at frame 300
        source.start_at(100. / 44_100.);
        source.stop_at(300. / 44_100.);

        let buffer = context.start_rendering();
        let samples = buffer.channel_data(0).as_slice();

        assert_float_eq!(samples[99], 0., abs_all <= 0.);
        assert_float_eq!(samples[100], 1., abs_all <= 0.);
        assert_float_eq!(samples[299], 1., abs_all <= 0.);
        assert_float_eq!(samples[300], 0., abs_all <= 0.);
    }

    #[test]
    fn test_constant_source_fires_on_ended() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let mut context = OfflineAudioContext::new(1, 256, SampleRate(44_100));

        let source = context.create_constant_source();
        source.connect(&context.destination());

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        source.set_on_ended(move || flag.store(true, Ordering::SeqCst));

        source.start_at(0.);
        source.stop_at(100. / 44_100.);

        let _ = context.start_rendering();
        assert!(fired.load(Ordering::SeqCst));
    }
}
