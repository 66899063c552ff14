use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::analysis::{Spectrum, TimeDomainRing, MAX_FFT_SIZE, MIN_FFT_SIZE};
use crate::buffer::{ChannelConfig, ChannelConfigOptions};
use crate::bus::AudioBus;
use crate::context::{AsBaseAudioContext, AudioContextRegistration};
use crate::param::AtomicF32;
use crate::process::{AudioParamValues, AudioProcessor};
use crate::{AudioGraphError, SampleRate};

use super::AudioNode;

/// Options for constructing an AnalyserNode
pub struct AnalyserOptions {
    pub fft_size: usize,
    pub min_decibels: f32,
    pub max_decibels: f32,
    pub smoothing_time_constant: f32,
    pub channel_config: ChannelConfigOptions,
}

impl Default for AnalyserOptions {
    fn default() -> Self {
        Self {
            fft_size: 2_048,
            min_decibels: -100.,
            max_decibels: -30.,
            smoothing_time_constant: 0.8,
            channel_config: ChannelConfigOptions::default(),
        }
    }
}

fn validate_fft_size(fft_size: usize) -> Result<(), AudioGraphError> {
    if !fft_size.is_power_of_two() || fft_size < MIN_FFT_SIZE || fft_size > MAX_FFT_SIZE {
        return Err(AudioGraphError::InvalidArgument(
            "fft size must be a power of two between 32 and 32768",
        ));
    }
    Ok(())
}

/// Inspector node providing frequency- and time-domain snapshots of the
/// signal flowing through it. Audio passes through unchanged.
///
/// When nothing consumes its output, register it with
/// [`AsBaseAudioContext::add_automatic_pull_node`] so it keeps capturing.
pub struct AnalyserNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
    ring: Arc<Mutex<TimeDomainRing>>,
    spectrum: Mutex<Spectrum>,
    fft_size: AtomicUsize,
    min_decibels: AtomicF32,
    max_decibels: AtomicF32,
    smoothing_time_constant: AtomicF32,
    /// scratch frame for on-demand analysis
    frame: Mutex<Vec<f32>>,
}

impl AudioNode for AnalyserNode {
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

impl AnalyserNode {
    pub fn new<C: AsBaseAudioContext>(context: &C, options: AnalyserOptions) -> Self {
        validate_fft_size(options.fft_size).unwrap();
        assert!(options.min_decibels < options.max_decibels);

        context.base().register(move |registration| {
            let ring = Arc::new(Mutex::new(TimeDomainRing::new()));

            let render = AnalyserRenderer { ring: ring.clone() };

            let node = AnalyserNode {
                registration,
                channel_config: options.channel_config.into(),
                ring,
                spectrum: Mutex::new(Spectrum::new(options.fft_size)),
                fft_size: AtomicUsize::new(options.fft_size),
                min_decibels: AtomicF32::new(options.min_decibels),
                max_decibels: AtomicF32::new(options.max_decibels),
                smoothing_time_constant: AtomicF32::new(options.smoothing_time_constant),
                frame: Mutex::new(vec![0.; options.fft_size]),
            };

            (node, Box::new(render))
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size.load(Ordering::SeqCst)
    }

    /// Change the FFT frame size. Must be a power of two in `32..=32768`.
    pub fn set_fft_size(&self, fft_size: usize) -> Result<(), AudioGraphError> {
        validate_fft_size(fft_size)?;

        self.fft_size.store(fft_size, Ordering::SeqCst);
        *self.spectrum.lock().unwrap() = Spectrum::new(fft_size);
        *self.frame.lock().unwrap() = vec![0.; fft_size];
        Ok(())
    }

    /// Half the FFT size: the number of frequency bins produced.
    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size() / 2
    }

    pub fn min_decibels(&self) -> f32 {
        self.min_decibels.load()
    }

    pub fn max_decibels(&self) -> f32 {
        self.max_decibels.load()
    }

    /// Set the dB range used for byte quantization of frequency data.
    pub fn set_decibel_range(&self, min: f32, max: f32) -> Result<(), AudioGraphError> {
        if min >= max {
            return Err(AudioGraphError::InvalidArgument(
                "min decibels must be below max decibels",
            ));
        }
        self.min_decibels.store(min);
        self.max_decibels.store(max);
        Ok(())
    }

    pub fn smoothing_time_constant(&self) -> f32 {
        self.smoothing_time_constant.load()
    }

    pub fn set_smoothing_time_constant(&self, value: f32) -> Result<(), AudioGraphError> {
        if !(0. ..=1.).contains(&value) {
            return Err(AudioGraphError::InvalidArgument(
                "smoothing time constant must lie in [0, 1]",
            ));
        }
        self.smoothing_time_constant.store(value);
        Ok(())
    }

    /// Copy the most recent time-domain samples into `dest` (up to
    /// `fft_size` samples, oldest first).
    pub fn get_float_time_domain_data(&self, dest: &mut [f32]) {
        self.ring.lock().unwrap().read_latest(dest);
    }

    /// As [`AnalyserNode::get_float_time_domain_data`], quantized so that
    /// -1.0 maps to 0 and +1.0 maps to 255.
    pub fn get_byte_time_domain_data(&self, dest: &mut [u8]) {
        let mut frame = self.frame.lock().unwrap();
        let len = dest.len().min(frame.len());
        self.ring.lock().unwrap().read_latest(&mut frame[..len]);

        for (byte, &sample) in dest.iter_mut().zip(frame.iter()) {
            *byte = (128. * (1. + sample)).clamp(0., 255.) as u8;
        }
    }

    /// Fill `dest` with the current smoothed spectrum in dB, one value per
    /// frequency bin.
    pub fn get_float_frequency_data(&self, dest: &mut [f32]) {
        let min_db = self.min_decibels();
        let spectrum = self.analyse();

        for (value, &magnitude) in dest.iter_mut().zip(spectrum.iter()) {
            *value = if magnitude > 0. {
                20. * magnitude.log10()
            } else {
                min_db
            };
        }
    }

    /// As [`AnalyserNode::get_float_frequency_data`], quantized into the
    /// configured dB range.
    pub fn get_byte_frequency_data(&self, dest: &mut [u8]) {
        let min_db = self.min_decibels();
        let max_db = self.max_decibels();
        let range = max_db - min_db;

        let spectrum = self.analyse();

        for (byte, &magnitude) in dest.iter_mut().zip(spectrum.iter()) {
            let db = if magnitude > 0. {
                20. * magnitude.log10()
            } else {
                min_db
            };
            let scaled = 255. * (db - min_db) / range;
            *byte = scaled.clamp(0., 255.) as u8;
        }
    }

    /// Run the FFT over the latest time-domain frame and return the
    /// smoothed magnitudes.
    fn analyse(&self) -> Vec<f32> {
        let mut spectrum = self.spectrum.lock().unwrap();
        let mut frame = self.frame.lock().unwrap();

        self.ring.lock().unwrap().read_latest(&mut frame[..]);
        spectrum.analyse(&frame, self.smoothing_time_constant());

        spectrum.magnitudes().to_vec()
    }
}

struct AnalyserRenderer {
    ring: Arc<Mutex<TimeDomainRing>>,
}

impl AudioProcessor for AnalyserRenderer {
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

        // pass through unchanged
        output.copy_from(input);

        // capture a mono mixdown; skip the quantum when the control thread
        // holds the ring (a reader can live with a small gap, the audio
        // thread cannot block)
        if let Ok(mut ring) = self.ring.try_lock() {
            let channels = input.number_of_channels() as f32;
            let mut mono = [0f32; crate::RENDER_QUANTUM_SIZE];

            for channel in input.channels() {
                for (acc, &sample) in mono.iter_mut().zip(channel.as_slice()) {
                    *acc += sample;
                }
            }
            mono.iter_mut().for_each(|s| *s /= channels);

            ring.push(&mono);
        }
    }

    fn propagates_silence(&self, _now: f64, _last_non_silent: f64) -> bool {
        // keep capturing even when the input goes quiet
        false
    }
}

#[cfg(test)]
mod tests {
    use crate::context::{AsBaseAudioContext, OfflineAudioContext};
    use crate::node::{AudioNode, AudioScheduledSourceNode};
    use crate::{AudioGraphError, SampleRate};

    #[test]
    fn test_fft_size_validation() {
        let context = OfflineAudioContext::new(1, 128, SampleRate(44_100));
        let analyser = context.create_analyser();

        assert!(matches!(
            analyser.set_fft_size(1_000),
            Err(AudioGraphError::InvalidArgument(_))
        ));
        assert!(matches!(
            analyser.set_fft_size(16),
            Err(AudioGraphError::InvalidArgument(_))
        ));
        assert!(analyser.set_fft_size(512).is_ok());
        assert_eq!(analyser.frequency_bin_count(), 256);
    }

    #[test]
    fn test_time_domain_capture() {
        let mut context = OfflineAudioContext::new(1, 512, SampleRate(44_100));

        let source = context.create_constant_source();
        source.offset().set_value_at_time(0.5, 0.).unwrap();

        let analyser = context.create_analyser();
        source.connect(&analyser);
        analyser.connect(&context.destination());
        source.start();

        let _ = context.start_rendering();

        let mut data = [0.; 32];
        analyser.get_float_time_domain_data(&mut data);
        assert!(data.iter().all(|&s| (s - 0.5).abs() < 1e-6));

        let mut bytes = [0; 32];
        analyser.get_byte_time_domain_data(&mut bytes);
        assert!(bytes.iter().all(|&b| b == 192));
    }

    #[test]
    fn test_frequency_peak_detection() {
        let sample_rate = 44_100u32;
        let mut context = OfflineAudioContext::new(1, 8_192, SampleRate(sample_rate));

        let osc = context.create_oscillator();
        osc.frequency().set_value_at_time(4_000., 0.).unwrap();

        let analyser = context.create_analyser();
        osc.connect(&analyser);
        analyser.connect(&context.destination());
        osc.start();

        let _ = context.start_rendering();

        let mut data = vec![0.; analyser.frequency_bin_count()];
        analyser.get_float_frequency_data(&mut data);

        let peak_bin = data
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;

        let expected = (4_000. * analyser.fft_size() as f32 / sample_rate as f32).round() as usize;
        assert!((peak_bin as i64 - expected as i64).abs() <= 1);
    }

    #[test]
    fn test_unconnected_analyser_with_automatic_pull() {
        let mut context = OfflineAudioContext::new(1, 512, SampleRate(44_100));

        let source = context.create_constant_source();
        let analyser = context.create_analyser();

        // the analyser output feeds nothing; pull it explicitly
        source.connect(&analyser);
        context.add_automatic_pull_node(&analyser);
        source.start();

        let _ = context.start_rendering();

        let mut data = [0.; 16];
        analyser.get_float_time_domain_data(&mut data);
        assert!(data.iter().all(|&s| (s - 1.).abs() < 1e-6));
    }
}

