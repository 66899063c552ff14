use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::buffer::{ChannelConfig, ChannelConfigOptions};
use crate::bus::AudioBus;
use crate::context::{AsBaseAudioContext, AudioContextRegistration};
use crate::control::{PlaybackState, Scheduler};
use crate::process::{AudioParamValues, AudioProcessor};
use crate::{SampleRate, RENDER_QUANTUM_SIZE};

use super::{AudioNode, AudioScheduledSourceNode};

/// Number of update rows of the pink noise generator.
const PINK_ROWS: usize = 16;
/// Fixed generator seed: two runs of the same graph produce identical noise.
const NOISE_SEED: u64 = 0x5eed_ba5e_d00d;

/// Color of the generated noise
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NoiseType {
    White,
    Pink,
    Brown,
}

impl From<u32> for NoiseType {
    fn from(i: u32) -> Self {
        use NoiseType::*;

        match i {
            0 => White,
            1 => Pink,
            2 => Brown,
            _ => unreachable!(),
        }
    }
}

/// Options for constructing a NoiseNode
pub struct NoiseOptions {
    pub type_: NoiseType,
    pub channel_config: ChannelConfigOptions,
}

impl Default for NoiseOptions {
    fn default() -> Self {
        Self {
            type_: NoiseType::White,
            channel_config: ChannelConfigOptions::default(),
        }
    }
}

/// Scheduled mono noise source.
///
/// Pink noise uses the Voss-McCartney multirate algorithm; brown noise is a
/// leaky integrator over white noise with gain compensation.
pub struct NoiseNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
    type_: Arc<AtomicU32>,
    scheduler: Scheduler,
}

impl AudioNode for NoiseNode {
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

impl AudioScheduledSourceNode for NoiseNode {
    fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl NoiseNode {
    pub fn new<C: AsBaseAudioContext>(context: &C, options: NoiseOptions) -> Self {
        context.base().register(move |registration| {
            let type_ = Arc::new(AtomicU32::new(options.type_ as u32));
            let scheduler = Scheduler::new();

            let render = NoiseRenderer {
                type_: type_.clone(),
                scheduler: scheduler.clone(),
                rng: SmallRng::seed_from_u64(NOISE_SEED),
                pink_rows: [0.; PINK_ROWS],
                pink_running_sum: 0.,
                pink_counter: 0,
                brown: 0.,
            };

            let node = NoiseNode {
                registration,
                channel_config: options.channel_config.into(),
                type_,
                scheduler,
            };

            (node, Box::new(render))
        })
    }

    pub fn type_(&self) -> NoiseType {
        self.type_.load(Ordering::SeqCst).into()
    }

    pub fn set_type(&self, type_: NoiseType) {
        self.type_.store(type_ as u32, Ordering::SeqCst);
    }
}

struct NoiseRenderer {
    type_: Arc<AtomicU32>,
    scheduler: Scheduler,
    rng: SmallRng,
    pink_rows: [f32; PINK_ROWS],
    pink_running_sum: f32,
    pink_counter: u32,
    brown: f32,
}

impl NoiseRenderer {
    fn white(&mut self) -> f32 {
        self.rng.gen_range(-1.0..1.0)
    }

    /// Voss-McCartney: each row updates at half the rate of the previous
    /// one, their sum has a 1/f spectrum.
    fn pink(&mut self) -> f32 {
        self.pink_counter = self.pink_counter.wrapping_add(1);
        let row = self.pink_counter.trailing_zeros() as usize % PINK_ROWS;

        self.pink_running_sum -= self.pink_rows[row];
        self.pink_rows[row] = self.white();
        self.pink_running_sum += self.pink_rows[row];

        (self.pink_running_sum + self.white()) / (PINK_ROWS as f32 / 4.)
    }

    fn brown(&mut self) -> f32 {
        let white = self.white();
        self.brown = (self.brown + 0.02 * white) / 1.02;
        // roughly compensate for the integrator's gain loss
        self.brown * 3.5
    }
}

impl AudioProcessor for NoiseRenderer {
    fn process(
        &mut self,
        _inputs: &[AudioBus],
        outputs: &mut [AudioBus],
        _params: AudioParamValues,
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

        let type_: NoiseType = self.type_.load(Ordering::SeqCst).into();

        let channel = output.channel_data_mut(0).as_mut_slice();
        channel.iter_mut().for_each(|s| *s = 0.);

        for i in window.offset..window.offset + window.count {
            channel[i] = match type_ {
                NoiseType::White => self.white(),
                NoiseType::Pink => self.pink(),
                NoiseType::Brown => self.brown(),
            };
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
    use super::*;
    use crate::context::{AsBaseAudioContext, OfflineAudioContext};
    use crate::node::AudioNode;

    fn render_noise(type_: NoiseType, frames: usize) -> Vec<f32> {
        let mut context = OfflineAudioContext::new(1, frames, SampleRate(44_100));

        let noise = context.create_noise();
        noise.set_type(type_);
        noise.connect(&context.destination());
        noise.start();

        let buffer = context.start_rendering();
        buffer.channel_data(0).as_slice().to_vec()
    }

    #[test]
    fn test_white_noise_statistics() {
        let samples = render_noise(NoiseType::White, 44_100);

        assert!(samples.iter().all(|s| s.abs() <= 1.));

        let mean: f32 = samples.iter().sum::<f32>() / samples.len() as f32;
        assert!(mean.abs() < 0.02);

        // uniform noise in [-1, 1] has RMS 1/sqrt(3)
        let rms = (samples.iter().map(|&s| s * s).sum::<f32>() / samples.len() as f32).sqrt();
        assert!((rms - 0.577).abs() < 0.02);
    }

    #[test]
    fn test_noise_is_deterministic() {
        let a = render_noise(NoiseType::Pink, 4_410);
        let b = render_noise(NoiseType::Pink, 4_410);
        assert_eq!(a, b);
    }

    #[test]
    fn test_brown_noise_is_low_frequency_heavy() {
        let samples = render_noise(NoiseType::Brown, 44_100);

        // consecutive samples of an integrated signal are strongly
        // correlated, unlike white noise
        let mut correlation = 0.;
        let mut energy = 0.;
        for pair in samples.windows(2) {
            correlation += pair[0] * pair[1];
            energy += pair[0] * pair[0];
        }
        assert!(correlation / energy > 0.9);
    }
}
