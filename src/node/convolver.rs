use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

use crate::buffer::{AudioBuffer, ChannelConfig, ChannelConfigOptions};
use crate::bus::AudioBus;
use crate::context::{AsBaseAudioContext, AudioContextRegistration};
use crate::process::{AudioParamValues, AudioProcessor};
use crate::{AudioGraphError, SampleRate, RENDER_QUANTUM_SIZE};

use super::AudioNode;

/// Partition length: one render quantum per partition keeps the convolver
/// latency-free at the cost of more FFTs for long responses.
const BLOCK_SIZE: usize = RENDER_QUANTUM_SIZE;
const FFT_SIZE: usize = 2 * BLOCK_SIZE;
const BINS: usize = FFT_SIZE / 2 + 1;

/// Level matching applied when `normalize` is enabled, so that responses of
/// different energies produce comparable output loudness.
const GAIN_CALIBRATION: f32 = -58.8;
const GAIN_CALIBRATION_SAMPLE_RATE: f32 = 44_100.;

/// Options for constructing a ConvolverNode
pub struct ConvolverOptions {
    pub buffer: Option<AudioBuffer>,
    pub normalize: bool,
    pub channel_config: ChannelConfigOptions,
}

impl Default for ConvolverOptions {
    fn default() -> Self {
        Self {
            buffer: None,
            normalize: true,
            channel_config: ChannelConfigOptions::default(),
        }
    }
}

/// A prepared impulse response: per-channel partition spectra.
///
/// Built on the control thread, swapped into the renderer at a quantum
/// boundary.
struct ConvolverKernel {
    /// `[ir_channel][partition][bin]`
    partitions: Vec<Vec<Vec<Complex32>>>,
    ir_channels: usize,
    num_partitions: usize,
    scale: f32,
    tail: f64,
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
}

fn normalization_scale(buffer: &AudioBuffer, sample_rate: SampleRate) -> f32 {
    let channels = buffer.number_of_channels();
    let length = buffer.sample_len();
    if length == 0 {
        return 1.;
    }

    let energy: f32 = buffer
        .channels()
        .iter()
        .map(|c| c.as_slice().iter().map(|&x| x * x).sum::<f32>())
        .sum();
    let power = (energy / (channels * length) as f32).sqrt().max(1e-12);

    let mut scale = 1. / power;
    scale *= 10f32.powf(GAIN_CALIBRATION * 0.05);
    scale *= GAIN_CALIBRATION_SAMPLE_RATE / sample_rate.0 as f32;
    scale
}

fn build_kernel(
    buffer: &AudioBuffer,
    normalize: bool,
    sample_rate: SampleRate,
) -> ConvolverKernel {
    let mut planner = RealFftPlanner::<f32>::new();
    let forward = planner.plan_fft_forward(FFT_SIZE);
    let inverse = planner.plan_fft_inverse(FFT_SIZE);

    let ir_channels = buffer.number_of_channels();
    let length = buffer.sample_len();
    let num_partitions = (length + BLOCK_SIZE - 1) / BLOCK_SIZE;

    let scale = if normalize {
        normalization_scale(buffer, sample_rate)
    } else {
        1.
    };

    let mut partitions = Vec::with_capacity(ir_channels);
    for channel in buffer.channels() {
        let data = channel.as_slice();
        let mut channel_partitions = Vec::with_capacity(num_partitions);

        for p in 0..num_partitions {
            let start = p * BLOCK_SIZE;
            let end = (start + BLOCK_SIZE).min(length);

            let mut block = forward.make_input_vec();
            block[..end - start].copy_from_slice(&data[start..end]);

            let mut spectrum = forward.make_output_vec();
            // the input block is scratch space, errors cannot occur for
            // matching lengths
            let _ = forward.process(&mut block, &mut spectrum);

            channel_partitions.push(spectrum);
        }

        partitions.push(channel_partitions);
    }

    ConvolverKernel {
        partitions,
        ir_channels,
        num_partitions,
        scale,
        tail: length as f64 / buffer.sample_rate().0 as f64,
        forward,
        inverse,
    }
}

#[derive(Default)]
struct KernelSlot {
    pending: Option<Arc<ConvolverKernel>>,
}

/// Convolution reverb: convolves the input with an impulse response using
/// uniformly partitioned FFT convolution.
pub struct ConvolverNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
    normalize: AtomicBool,
    slot: Arc<Mutex<KernelSlot>>,
}

impl AudioNode for ConvolverNode {
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

impl ConvolverNode {
    pub fn new<C: AsBaseAudioContext>(context: &C, options: ConvolverOptions) -> Self {
        let sample_rate = context.base().sample_rate();

        context.base().register(move |registration| {
            let slot = Arc::new(Mutex::new(KernelSlot::default()));

            if let Some(buffer) = &options.buffer {
                slot.lock().unwrap().pending =
                    Some(Arc::new(build_kernel(buffer, options.normalize, sample_rate)));
            }

            let render = ConvolverRenderer {
                slot: slot.clone(),
                kernel: None,
                history: vec![],
                previous_block: vec![],
                head: 0,
            };

            let node = ConvolverNode {
                registration,
                channel_config: options.channel_config.into(),
                normalize: AtomicBool::new(options.normalize),
                slot,
            };

            (node, Box::new(render))
        })
    }

    pub fn normalize(&self) -> bool {
        self.normalize.load(Ordering::SeqCst)
    }

    /// Whether to level-match the impulse response. Takes effect at the
    /// next [`ConvolverNode::set_buffer`] call.
    pub fn set_normalize(&self, normalize: bool) {
        self.normalize.store(normalize, Ordering::SeqCst);
    }

    /// Set the impulse response.
    ///
    /// The spectra are prepared here on the control thread; the renderer
    /// swaps the new response in atomically at a quantum boundary.
    pub fn set_buffer(&self, buffer: AudioBuffer) -> Result<(), AudioGraphError> {
        if buffer.sample_len() == 0 {
            return Err(AudioGraphError::InvalidArgument(
                "impulse response must not be empty",
            ));
        }
        if buffer.number_of_channels() > 2 {
            return Err(AudioGraphError::InvalidArgument(
                "impulse responses with more than two channels are not supported",
            ));
        }

        let kernel = build_kernel(
            &buffer,
            self.normalize(),
            self.registration.context().sample_rate(),
        );

        self.slot.lock().unwrap().pending = Some(Arc::new(kernel));
        Ok(())
    }
}

struct ConvolverRenderer {
    slot: Arc<Mutex<KernelSlot>>,
    kernel: Option<Arc<ConvolverKernel>>,
    /// frequency-domain delay line, `[input_channel][partition][bin]`
    history: Vec<Vec<Vec<Complex32>>>,
    /// previous quantum of input, `[input_channel][BLOCK_SIZE]`
    previous_block: Vec<Vec<f32>>,
    /// ring position of the newest spectrum in `history`
    head: usize,
}

impl ConvolverRenderer {
    fn reset_state(&mut self, channels: usize, num_partitions: usize) {
        self.history =
            vec![vec![vec![Complex32::new(0., 0.); BINS]; num_partitions.max(1)]; channels];
        self.previous_block = vec![vec![0.; BLOCK_SIZE]; channels];
        self.head = 0;
    }
}

impl AudioProcessor for ConvolverRenderer {
    fn process(
        &mut self,
        inputs: &[AudioBus],
        outputs: &mut [AudioBus],
        _params: AudioParamValues,
        _timestamp: f64,
        _sample_rate: SampleRate,
    ) {
        let input = &inputs[0];
        let output = &mut outputs[0];

        // pick up a freshly prepared response
        let pending = self
            .slot
            .try_lock()
            .ok()
            .and_then(|mut slot| slot.pending.take());
        if let Some(kernel) = pending {
            self.reset_state(input.number_of_channels(), kernel.num_partitions);
            self.kernel = Some(kernel);
        }

        let kernel = match &self.kernel {
            Some(kernel) => kernel,
            None => {
                // no impulse response yet
                output.make_silent();
                return;
            }
        };

        let in_channels = input.number_of_channels();
        if self.history.len() != in_channels {
            self.history = vec![
                vec![vec![Complex32::new(0., 0.); BINS]; kernel.num_partitions.max(1)];
                in_channels
            ];
            self.previous_block = vec![vec![0.; BLOCK_SIZE]; in_channels];
            self.head = 0;
        }

        let num_partitions = kernel.num_partitions.max(1);
        self.head = (self.head + 1) % num_partitions;
        let head = self.head;

        // forward transform of [previous, current] per input channel
        for channel in 0..in_channels {
            let mut block = kernel.forward.make_input_vec();
            block[..BLOCK_SIZE].copy_from_slice(&self.previous_block[channel]);
            block[BLOCK_SIZE..].copy_from_slice(input.channel_data(channel).as_slice());

            self.previous_block[channel]
                .copy_from_slice(input.channel_data(channel).as_slice());

            let _ = kernel
                .forward
                .process(&mut block, &mut self.history[channel][head]);
        }

        // output layout: stereo response on mono input widens to stereo
        let out_channels = in_channels.max(kernel.ir_channels);
        output.set_number_of_channels(out_channels);

        let inverse_scale = kernel.scale / FFT_SIZE as f32;

        for channel in 0..out_channels {
            let x_channel = channel.min(in_channels - 1);
            let h_channel = channel.min(kernel.ir_channels - 1);

            // multiply-accumulate over the frequency-domain delay line
            let mut acc = vec![Complex32::new(0., 0.); BINS];
            for p in 0..kernel.num_partitions {
                let slot = (head + num_partitions - p) % num_partitions;
                let x = &self.history[x_channel][slot];
                let h = &kernel.partitions[h_channel][p];
                for ((a, &x), &h) in acc.iter_mut().zip(x).zip(h) {
                    *a += x * h;
                }
            }

            let mut time = kernel.inverse.make_output_vec();
            let _ = kernel.inverse.process(&mut acc, &mut time);

            // overlap-save: the second half is the valid output block
            output
                .channel_data_mut(channel)
                .as_mut_slice()
                .iter_mut()
                .zip(&time[BLOCK_SIZE..])
                .for_each(|(out, &s)| *out = s * inverse_scale);
        }

        output.update_silence_hint();
    }

    fn reset(&mut self) {
        let channels = self.history.len();
        let partitions = self
            .kernel
            .as_ref()
            .map(|k| k.num_partitions)
            .unwrap_or(1);
        self.reset_state(channels, partitions);
    }

    fn tail_time(&self) -> f64 {
        self.kernel.as_ref().map(|k| k.tail).unwrap_or(0.)
    }
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use super::*;
    use crate::buffer::ChannelData;
    use crate::context::{AsBaseAudioContext, OfflineAudioContext};
    use crate::node::AudioScheduledSourceNode;

    fn impulse_response(taps: &[(usize, f32)], len: usize) -> AudioBuffer {
        let mut data = vec![0.; len];
        for &(at, value) in taps {
            data[at] = value;
        }
        AudioBuffer::from_channels(vec![ChannelData::from(data)], SampleRate(44_100))
    }

    #[test]
    fn test_identity_response_passes_signal() {
        let mut context = OfflineAudioContext::new(1, 256, SampleRate(44_100));

        let source = context.create_constant_source();
        source.offset().set_value_at_time(0.5, 0.).unwrap();

        let convolver = context.create_convolver();
        convolver.set_normalize(false);
        convolver.set_buffer(impulse_response(&[(0, 1.)], 1)).unwrap();

        source.connect(&convolver);
        convolver.connect(&context.destination());
        source.start();

        let buffer = context.start_rendering();

        // convolving with a unit impulse is the identity
        assert_float_eq!(
            buffer.channel_data(0).as_slice(),
            &[0.5; 256][..],
            abs_all <= 1e-5
        );
    }

    #[test]
    fn test_delayed_tap_shifts_signal_across_partitions() {
        let mut context = OfflineAudioContext::new(1, 512, SampleRate(44_100));

        // single tap at 300 frames: past the second partition boundary
        let mut fired = false;
        let source = context.create_function(1, move |data, _channel, _when| {
            if !fired {
                data[0] = 1.;
                fired = true;
            }
        });

        let convolver = context.create_convolver();
        convolver.set_normalize(false);
        convolver
            .set_buffer(impulse_response(&[(300, 0.8)], 301))
            .unwrap();

        source.connect(&convolver);
        convolver.connect(&context.destination());
        source.start();

        let buffer = context.start_rendering();
        let samples = buffer.channel_data(0).as_slice();

        let peak = samples
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert_eq!(peak, 300);
        assert_float_eq!(samples[300], 0.8, abs <= 1e-4);
        assert_float_eq!(samples[0], 0., abs <= 1e-5);
    }

    #[test]
    fn test_set_buffer_validation() {
        let context = OfflineAudioContext::new(1, 128, SampleRate(44_100));
        let convolver = context.create_convolver();

        let empty = AudioBuffer::new(1, 0, SampleRate(44_100));
        assert!(convolver.set_buffer(empty).is_err());

        let wide = AudioBuffer::new(4, 10, SampleRate(44_100));
        assert!(convolver.set_buffer(wide).is_err());
    }
}
