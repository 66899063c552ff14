use std::sync::{Arc, Mutex};

use crate::buffer::{ChannelConfig, ChannelConfigOptions};
use crate::bus::AudioBus;
use crate::context::{AsBaseAudioContext, AudioContextRegistration};
use crate::process::{AudioParamValues, AudioProcessor};
use crate::{AudioGraphError, SampleRate};

use super::AudioNode;

/// Options for constructing a WaveShaperNode
#[derive(Default)]
pub struct WaveShaperOptions {
    pub curve: Option<Vec<f32>>,
    pub channel_config: ChannelConfigOptions,
}

/// Nonlinear distortion: maps each input sample through a lookup curve.
///
/// An input sample `x` in `[-1, 1]` maps to `curve[round((x + 1) * (K - 1) / 2)]`;
/// out-of-range inputs are clamped. Without a curve the node passes audio
/// through unchanged.
pub struct WaveShaperNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
    curve: Arc<Mutex<CurveSlot>>,
}

#[derive(Default)]
struct CurveSlot {
    curve: Option<Arc<Vec<f32>>>,
    dirty: bool,
}

impl AudioNode for WaveShaperNode {
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

impl WaveShaperNode {
    pub fn new<C: AsBaseAudioContext>(context: &C, options: WaveShaperOptions) -> Self {
        context.base().register(move |registration| {
            let slot = Arc::new(Mutex::new(CurveSlot {
                curve: options.curve.map(Arc::new),
                dirty: true,
            }));

            let render = WaveShaperRenderer {
                slot: slot.clone(),
                curve: None,
            };

            let node = WaveShaperNode {
                registration,
                channel_config: options.channel_config.into(),
                curve: slot,
            };

            (node, Box::new(render))
        })
    }

    /// Replace the shaping curve. The new curve takes effect at the next
    /// render quantum.
    pub fn set_curve(&self, curve: Vec<f32>) -> Result<(), AudioGraphError> {
        if curve.is_empty() {
            return Err(AudioGraphError::InvalidArgument(
                "waveshaper curve must not be empty",
            ));
        }
        if curve.iter().any(|v| !v.is_finite()) {
            return Err(AudioGraphError::InvalidArgument(
                "waveshaper curve values must be finite",
            ));
        }

        let mut slot = self.curve.lock().unwrap();
        slot.curve = Some(Arc::new(curve));
        slot.dirty = true;
        Ok(())
    }
}

struct WaveShaperRenderer {
    slot: Arc<Mutex<CurveSlot>>,
    curve: Option<Arc<Vec<f32>>>,
}

impl AudioProcessor for WaveShaperRenderer {
    fn process(
        &mut self,
        inputs: &[AudioBus],
        outputs: &mut [AudioBus],
        _params: AudioParamValues,
        _timestamp: f64,
        _sample_rate: SampleRate,
    ) {
        // pick up a replaced curve; on lock contention keep the current one
        if let Ok(mut slot) = self.slot.try_lock() {
            if slot.dirty {
                self.curve = slot.curve.clone();
                slot.dirty = false;
            }
        }

        let input = &inputs[0];
        let output = &mut outputs[0];

        if input.is_silent() && self.curve.is_none() {
            output.make_silent();
            return;
        }

        let curve = match &self.curve {
            Some(curve) => curve,
            None => {
                output.copy_from(input);
                return;
            }
        };

        let scale = (curve.len() - 1) as f32 / 2.;

        output.set_number_of_channels(input.number_of_channels());
        for (input_channel, output_channel) in input.channels().iter().zip(output.channels_mut()) {
            output_channel
                .as_mut_slice()
                .iter_mut()
                .zip(input_channel.as_slice())
                .for_each(|(out, &sample)| {
                    let x = sample.clamp(-1., 1.);
                    let index = ((x + 1.) * scale).round() as usize;
                    *out = curve[index.min(curve.len() - 1)];
                });
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
    fn test_curve_mapping_and_clamping() {
        let mut context = OfflineAudioContext::new(1, 128, SampleRate(44_100));

        // DC of 2.0 must clamp to 1.0 and map to the last curve point
        let source = context.create_constant_source();
        source.offset().set_value_at_time(2., 0.).unwrap();

        let shaper = context.create_wave_shaper();
        shaper.set_curve(vec![-0.5, 0., 0.5]).unwrap();

        source.connect(&shaper);
        shaper.connect(&context.destination());
        source.start();

        let buffer = context.start_rendering();
        assert_float_eq!(
            buffer.channel_data(0).as_slice(),
            &[0.5; 128][..],
            abs_all <= 0.
        );
    }

    #[test]
    fn test_empty_curve_rejected() {
        let context = OfflineAudioContext::new(1, 128, SampleRate(44_100));
        let shaper = context.create_wave_shaper();
        assert!(shaper.set_curve(vec![]).is_err());
        assert!(shaper.set_curve(vec![0., f32::NAN]).is_err());
    }
}
