use std::sync::Arc;

use crate::buffer::{ChannelConfig, ChannelConfigOptions, ChannelCountMode, ChannelInterpretation};
use crate::bus::AudioBus;
use crate::context::{AsBaseAudioContext, AudioContextRegistration, AudioParamId};
use crate::param::{AtomicF32, AudioParam, AudioParamOptions};
use crate::process::{AudioParamValues, AudioProcessor};
use crate::SampleRate;

use super::AudioNode;

/// Options for constructing a DynamicsCompressorNode
pub struct DynamicsCompressorOptions {
    pub threshold: f32,
    pub knee: f32,
    pub ratio: f32,
    pub attack: f32,
    pub release: f32,
    pub channel_config: ChannelConfigOptions,
}

impl Default for DynamicsCompressorOptions {
    fn default() -> Self {
        Self {
            threshold: -24.,
            knee: 30.,
            ratio: 12.,
            attack: 0.003,
            release: 0.25,
            channel_config: ChannelConfigOptions {
                count: 2,
                mode: ChannelCountMode::ClampedMax,
                interpretation: ChannelInterpretation::Speakers,
            },
        }
    }
}

/// Dynamics compressor: envelope follower, soft-knee gain computer,
/// attack/release smoothing and automatic makeup gain.
pub struct DynamicsCompressorNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
    threshold: AudioParam,
    knee: AudioParam,
    ratio: AudioParam,
    attack: AudioParam,
    release: AudioParam,
    reduction: Arc<AtomicF32>,
}

impl AudioNode for DynamicsCompressorNode {
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

impl DynamicsCompressorNode {
    pub fn new<C: AsBaseAudioContext>(context: &C, options: DynamicsCompressorOptions) -> Self {
        context.base().register(move |registration| {
            let id = registration.id();

            let (threshold, threshold_proc) = context.base().create_audio_param(
                AudioParamOptions {
                    min_value: -100.,
                    max_value: 0.,
                    default_value: -24.,
                },
                id,
            );
            let (knee, knee_proc) = context.base().create_audio_param(
                AudioParamOptions {
                    min_value: 0.,
                    max_value: 40.,
                    default_value: 30.,
                },
                id,
            );
            let (ratio, ratio_proc) = context.base().create_audio_param(
                AudioParamOptions {
                    min_value: 1.,
                    max_value: 20.,
                    default_value: 12.,
                },
                id,
            );
            let (attack, attack_proc) = context.base().create_audio_param(
                AudioParamOptions {
                    min_value: 0.,
                    max_value: 1.,
                    default_value: 0.003,
                },
                id,
            );
            let (release, release_proc) = context.base().create_audio_param(
                AudioParamOptions {
                    min_value: 0.,
                    max_value: 1.,
                    default_value: 0.25,
                },
                id,
            );

            threshold.set_value(options.threshold);
            knee.set_value(options.knee);
            ratio.set_value(options.ratio);
            attack.set_value(options.attack);
            release.set_value(options.release);

            let reduction = Arc::new(AtomicF32::new(0.));

            let render = CompressorRenderer {
                threshold: threshold_proc,
                knee: knee_proc,
                ratio: ratio_proc,
                attack: attack_proc,
                release: release_proc,
                reduction: reduction.clone(),
                envelope: 0.,
                release_tail: 0.25,
            };

            let node = DynamicsCompressorNode {
                registration,
                channel_config: options.channel_config.into(),
                threshold,
                knee,
                ratio,
                attack,
                release,
                reduction,
            };

            (node, Box::new(render))
        })
    }

    pub fn threshold(&self) -> &AudioParam {
        &self.threshold
    }
    pub fn knee(&self) -> &AudioParam {
        &self.knee
    }
    pub fn ratio(&self) -> &AudioParam {
        &self.ratio
    }
    pub fn attack(&self) -> &AudioParam {
        &self.attack
    }
    pub fn release(&self) -> &AudioParam {
        &self.release
    }

    /// Current amount of gain reduction applied, in dB (`<= 0`). Read-only,
    /// written by the render thread for metering.
    pub fn reduction(&self) -> f32 {
        self.reduction.load()
    }
}

/// Soft-knee gain computer, result in dB (`<= 0`).
fn gain_reduction_db(level_db: f32, threshold: f32, knee: f32, ratio: f32) -> f32 {
    let over = level_db - threshold;
    let slope = 1. / ratio - 1.;

    if knee <= 0. {
        if over <= 0. {
            0.
        } else {
            slope * over
        }
    } else if 2. * over <= -knee {
        0.
    } else if 2. * over < knee {
        let x = over + knee / 2.;
        slope * x * x / (2. * knee)
    } else {
        slope * over
    }
}

struct CompressorRenderer {
    threshold: AudioParamId,
    knee: AudioParamId,
    ratio: AudioParamId,
    attack: AudioParamId,
    release: AudioParamId,
    reduction: Arc<AtomicF32>,
    /// smoothed detector level, linear
    envelope: f32,
    release_tail: f64,
}

impl AudioProcessor for CompressorRenderer {
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

        if input.is_silent() {
            self.envelope = 0.;
            self.reduction.store(0.);
            output.make_silent();
            return;
        }

        // control-rate parameters
        let threshold = params.get(&self.threshold)[0];
        let knee = params.get(&self.knee)[0];
        let ratio = params.get(&self.ratio)[0].max(1.);
        let attack = params.get(&self.attack)[0].max(0.);
        let release = params.get(&self.release)[0].max(0.);
        self.release_tail = release as f64;

        let rate = sample_rate.0 as f32;
        let attack_coeff = if attack > 0. {
            (-1. / (attack * rate)).exp()
        } else {
            0.
        };
        let release_coeff = if release > 0. {
            (-1. / (release * rate)).exp()
        } else {
            0.
        };

        // makeup targets unity for a full-scale input
        let full_range_gain = 10f32.powf(gain_reduction_db(0., threshold, knee, ratio) / 20.);
        let makeup = full_range_gain.powf(-0.6);

        let channels = input.number_of_channels();
        output.set_number_of_channels(channels);

        let frames = crate::RENDER_QUANTUM_SIZE;
        let mut max_reduction_db = 0f32;

        for i in 0..frames {
            // peak detector over all channels
            let mut peak = 0f32;
            for channel in 0..channels {
                peak = peak.max(input.channel_data(channel).as_slice()[i].abs());
            }

            let coeff = if peak > self.envelope {
                attack_coeff
            } else {
                release_coeff
            };
            self.envelope = coeff * self.envelope + (1. - coeff) * peak;

            let level_db = 20. * self.envelope.max(1e-6).log10();
            let reduction_db = gain_reduction_db(level_db, threshold, knee, ratio);
            max_reduction_db = max_reduction_db.min(reduction_db);

            let gain = 10f32.powf(reduction_db / 20.) * makeup;

            for channel in 0..channels {
                let sample = input.channel_data(channel).as_slice()[i];
                output.channel_data_mut(channel).as_mut_slice()[i] = sample * gain;
            }
        }

        self.reduction.store(max_reduction_db);
    }

    fn reset(&mut self) {
        self.envelope = 0.;
        self.reduction.store(0.);
    }

    fn tail_time(&self) -> f64 {
        self.release_tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AsBaseAudioContext, OfflineAudioContext};
    use crate::node::{AudioNode, AudioScheduledSourceNode};

    #[test]
    fn test_gain_computer_regions() {
        // below the knee: no reduction
        assert_eq!(gain_reduction_db(-60., -24., 30., 12.), 0.);

        // far above the knee: the hard ratio applies
        let over = gain_reduction_db(0., -24., 0., 12.);
        float_eq::assert_float_eq!(over, (1. / 12. - 1.) * 24., abs <= 1e-5);

        // inside the knee: between the two
        let kneed = gain_reduction_db(-24., -24., 30., 12.);
        assert!(kneed < 0. && kneed > (1. / 12. - 1.) * 15.);
    }

    #[test]
    fn test_loud_signal_is_compressed() {
        let mut context = OfflineAudioContext::new(1, 44_100, SampleRate(44_100));

        let source = context.create_constant_source();
        let compressor = context.create_dynamics_compressor();

        source.connect(&compressor);
        compressor.connect(&context.destination());
        source.start();

        let buffer = context.start_rendering();
        let samples = buffer.channel_data(0).as_slice();

        // a 0 dB DC input sits far above the -24 dB threshold: after the
        // attack settles the output is attenuated (makeup notwithstanding)
        let settled = samples[44_099];
        assert!(settled < 0.9, "expected compression, got {}", settled);
        assert!(settled > 0.1);

        // the reduction meter reports negative dB
        assert!(compressor.reduction() < -3.);
    }
}
