use std::sync::Arc;

use crate::buffer::{ChannelConfig, ChannelConfigOptions};
use crate::bus::AudioBus;
use crate::context::{AsBaseAudioContext, AudioContextRegistration};
use crate::param::AtomicF32;
use crate::process::{AudioParamValues, AudioProcessor};
use crate::{AtomicF64, SampleRate};

use super::AudioNode;

/// Options for constructing an AdsrNode
pub struct AdsrOptions {
    pub attack_time: f32,
    pub attack_level: f32,
    pub hold_time: f32,
    pub decay_time: f32,
    pub sustain_level: f32,
    pub release_time: f32,
    pub channel_config: ChannelConfigOptions,
}

impl Default for AdsrOptions {
    fn default() -> Self {
        Self {
            attack_time: 0.1,
            attack_level: 1.,
            hold_time: 0.,
            decay_time: 0.05,
            sustain_level: 0.75,
            release_time: 0.0625,
            channel_config: ChannelConfigOptions::default(),
        }
    }
}

/// Envelope settings and note timing shared between the control handle and
/// the renderer.
struct AdsrShared {
    attack_time: AtomicF32,
    attack_level: AtomicF32,
    hold_time: AtomicF32,
    decay_time: AtomicF32,
    sustain_level: AtomicF32,
    release_time: AtomicF32,
    /// absolute context time of the last note on; MAX when idle
    note_on_time: AtomicF64,
    /// absolute context time of the pending note off; MAX while held
    note_off_time: AtomicF64,
}

impl AdsrShared {
    /// Envelope level at absolute time `t`, ignoring release.
    fn held_level(&self, t: f64) -> f32 {
        let on = self.note_on_time.load();
        if t < on {
            return 0.;
        }

        let attack = self.attack_time.load().max(0.) as f64;
        let attack_level = self.attack_level.load();
        let hold = self.hold_time.load().max(0.) as f64;
        let decay = self.decay_time.load().max(0.) as f64;
        let sustain = self.sustain_level.load();

        let dt = t - on;
        if dt < attack {
            return attack_level * (dt / attack) as f32;
        }
        if dt < attack + hold {
            return attack_level;
        }
        if dt < attack + hold + decay {
            let progress = ((dt - attack - hold) / decay) as f32;
            return attack_level + (sustain - attack_level) * progress;
        }

        sustain
    }

    /// Envelope level at absolute time `t`. Linear ramps throughout, so the
    /// shape is exact regardless of quantum boundaries.
    fn level(&self, t: f64) -> f32 {
        let off = self.note_off_time.load();
        if t < off {
            return self.held_level(t);
        }

        let release = self.release_time.load().max(0.) as f64;
        if release <= 0. || t >= off + release {
            return 0.;
        }

        let from = self.held_level(off);
        from * (1. - (t - off) / release) as f32
    }

    fn finished(&self, now: f64) -> bool {
        let off = self.note_off_time.load();
        off != f64::MAX && now > off + self.release_time.load().max(0.) as f64
    }
}

/// Gain envelope with note on/off semantics.
///
/// The envelope ramps linearly Off → Attack → Hold → Decay → Sustain and,
/// after `note_off`, Release → Off, and multiplies the input signal.
pub struct AdsrNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
    shared: Arc<AdsrShared>,
}

impl AudioNode for AdsrNode {
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

impl AdsrNode {
    pub fn new<C: AsBaseAudioContext>(context: &C, options: AdsrOptions) -> Self {
        context.base().register(move |registration| {
            let shared = Arc::new(AdsrShared {
                attack_time: AtomicF32::new(options.attack_time),
                attack_level: AtomicF32::new(options.attack_level),
                hold_time: AtomicF32::new(options.hold_time),
                decay_time: AtomicF32::new(options.decay_time),
                sustain_level: AtomicF32::new(options.sustain_level),
                release_time: AtomicF32::new(options.release_time),
                note_on_time: AtomicF64::new(f64::MAX),
                note_off_time: AtomicF64::new(f64::MAX),
            });

            let render = AdsrRenderer {
                shared: shared.clone(),
            };

            let node = AdsrNode {
                registration,
                channel_config: options.channel_config.into(),
                shared,
            };

            (node, Box::new(render))
        })
    }

    /// Begin the envelope at context time `when` (seconds). Retriggering
    /// restarts the attack.
    pub fn note_on(&self, when: f64) {
        self.shared.note_off_time.store(f64::MAX);
        self.shared.note_on_time.store(when.max(0.));
    }

    /// Enter the release phase at context time `when` (seconds).
    pub fn note_off(&self, when: f64) {
        self.shared.note_off_time.store(when.max(0.));
    }

    /// True once the release has completed.
    pub fn finished(&self) -> bool {
        self.shared.finished(self.context().current_time())
    }

    pub fn set_attack_time(&self, v: f32) {
        self.shared.attack_time.store(v.max(0.));
    }
    pub fn set_attack_level(&self, v: f32) {
        self.shared.attack_level.store(v);
    }
    pub fn set_hold_time(&self, v: f32) {
        self.shared.hold_time.store(v.max(0.));
    }
    pub fn set_decay_time(&self, v: f32) {
        self.shared.decay_time.store(v.max(0.));
    }
    pub fn set_sustain_level(&self, v: f32) {
        self.shared.sustain_level.store(v);
    }
    pub fn set_release_time(&self, v: f32) {
        self.shared.release_time.store(v.max(0.));
    }

    pub fn attack_time(&self) -> f32 {
        self.shared.attack_time.load()
    }
    pub fn attack_level(&self) -> f32 {
        self.shared.attack_level.load()
    }
    pub fn hold_time(&self) -> f32 {
        self.shared.hold_time.load()
    }
    pub fn decay_time(&self) -> f32 {
        self.shared.decay_time.load()
    }
    pub fn sustain_level(&self) -> f32 {
        self.shared.sustain_level.load()
    }
    pub fn release_time(&self) -> f32 {
        self.shared.release_time.load()
    }
}

struct AdsrRenderer {
    shared: Arc<AdsrShared>,
}

impl AudioProcessor for AdsrRenderer {
    fn process(
        &mut self,
        inputs: &[AudioBus],
        outputs: &mut [AudioBus],
        _params: AudioParamValues,
        timestamp: f64,
        sample_rate: SampleRate,
    ) {
        let input = &inputs[0];
        let output = &mut outputs[0];

        if input.is_silent() {
            output.make_silent();
            return;
        }

        let channels = input.number_of_channels();
        output.set_number_of_channels(channels);

        let rate = sample_rate.0 as f64;

        for channel in 0..channels {
            let input_data = input.channel_data(channel).as_slice();
            let output_data = output.channel_data_mut(channel).as_mut_slice();

            for (i, (out, &sample)) in output_data.iter_mut().zip(input_data).enumerate() {
                let t = timestamp + i as f64 / rate;
                *out = sample * self.shared.level(t);
            }
        }

        output.update_silence_hint();
    }
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use crate::context::{AsBaseAudioContext, OfflineAudioContext};
    use crate::node::{AudioNode, AudioScheduledSourceNode};
    use crate::SampleRate;

    #[test]
    fn test_envelope_shape() {
        let sample_rate = 44_100;
        let mut context = OfflineAudioContext::new(1, 33_000, SampleRate(sample_rate));

        // DC input exposes the raw envelope
        let source = context.create_constant_source();
        let adsr = context.create_adsr();
        adsr.set_attack_time(0.1);
        adsr.set_decay_time(0.1);
        adsr.set_sustain_level(0.5);
        adsr.set_release_time(0.2);

        source.connect(&adsr);
        adsr.connect(&context.destination());
        source.start();

        adsr.note_on(0.);
        adsr.note_off(0.5);

        let buffer = context.start_rendering();
        let samples = buffer.channel_data(0).as_slice();

        // attack peaks at 0.1 s
        assert_float_eq!(samples[4_410], 1., abs <= 1e-3);
        // decay reaches the sustain level at 0.2 s
        assert_float_eq!(samples[8_820], 0.5, abs <= 1e-3);
        // sustain holds
        assert_float_eq!(samples[20_000], 0.5, abs <= 1e-6);
        // release starts at 0.5 s and is over at 0.7 s
        assert!(samples[22_051] < 0.5);
        assert_float_eq!(samples[30_870], 0., abs <= 1e-3);
        assert_float_eq!(samples[32_000], 0., abs <= 0.);
    }

    #[test]
    fn test_finished_reports_after_release() {
        let mut context = OfflineAudioContext::new(1, 4_410, SampleRate(44_100));

        let source = context.create_constant_source();
        let adsr = context.create_adsr();
        adsr.set_release_time(0.01);

        source.connect(&adsr);
        adsr.connect(&context.destination());
        source.start();

        adsr.note_on(0.);
        adsr.note_off(0.02);
        assert!(!adsr.finished());

        let _ = context.start_rendering();

        // 0.1 s have elapsed, well past note off + release
        assert!(adsr.finished());
    }
}
