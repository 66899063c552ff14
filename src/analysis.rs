//! Windowed FFT analysis shared by inspector nodes

use std::sync::Arc;

use num_complex::Complex32;
use realfft::{RealFftPlanner, RealToComplex};

/// Smallest admissible FFT frame.
pub const MIN_FFT_SIZE: usize = 32;
/// Largest admissible FFT frame.
pub const MAX_FFT_SIZE: usize = 32_768;

/// A ring of the most recent time-domain samples, large enough to serve the
/// biggest FFT frame.
pub(crate) struct TimeDomainRing {
    buffer: Vec<f32>,
    write_index: usize,
}

impl TimeDomainRing {
    pub fn new() -> Self {
        Self {
            buffer: vec![0.; MAX_FFT_SIZE],
            write_index: 0,
        }
    }

    pub fn push(&mut self, samples: &[f32]) {
        for &sample in samples {
            self.buffer[self.write_index] = sample;
            self.write_index = (self.write_index + 1) % self.buffer.len();
        }
    }

    /// Copy the most recent `dest.len()` samples, oldest first.
    pub fn read_latest(&self, dest: &mut [f32]) {
        let len = self.buffer.len();
        let count = dest.len().min(len);
        let start = (self.write_index + len - count) % len;
        for (i, slot) in dest.iter_mut().take(count).enumerate() {
            *slot = self.buffer[(start + i) % len];
        }
    }
}

/// Windowed magnitude spectrum with exponential time smoothing.
pub(crate) struct Spectrum {
    fft: Arc<dyn RealToComplex<f32>>,
    fft_size: usize,
    window: Vec<f32>,
    input: Vec<f32>,
    output: Vec<Complex32>,
    /// smoothed magnitudes, one per frequency bin
    magnitudes: Vec<f32>,
}

impl Spectrum {
    /// `fft_size` must be a power of two within `MIN_FFT_SIZE..=MAX_FFT_SIZE`
    /// (validated by the caller).
    pub fn new(fft_size: usize) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);

        let input = fft.make_input_vec();
        let output = fft.make_output_vec();

        Self {
            fft,
            fft_size,
            window: blackman(fft_size),
            input,
            output,
            magnitudes: vec![0.; fft_size / 2],
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Number of frequency bins produced, `fft_size / 2`.
    pub fn frequency_bin_count(&self) -> usize {
        self.magnitudes.len()
    }

    /// Transform one frame of time-domain samples (length `fft_size`) and
    /// fold the normalized magnitudes into the smoothed spectrum:
    /// `mag = smoothing * prev + (1 - smoothing) * |X| / N`.
    pub fn analyse(&mut self, time_data: &[f32], smoothing: f32) {
        debug_assert_eq!(time_data.len(), self.fft_size);

        for ((input, &sample), &window) in self
            .input
            .iter_mut()
            .zip(time_data)
            .zip(self.window.iter())
        {
            *input = sample * window;
        }

        if self.fft.process(&mut self.input, &mut self.output).is_err() {
            return; // leave the previous spectrum in place
        }

        let scale = 1. / self.fft_size as f32;
        let smoothing = smoothing.clamp(0., 1.);
        for (magnitude, bin) in self.magnitudes.iter_mut().zip(self.output.iter()) {
            let value = bin.norm() * scale;
            // ignore NaN/Inf contributions from degenerate input
            if value.is_finite() {
                *magnitude = smoothing * *magnitude + (1. - smoothing) * value;
            }
        }
    }

    pub fn magnitudes(&self) -> &[f32] {
        &self.magnitudes
    }
}

/// Blackman window, the standard analysis window for spectrum inspectors.
fn blackman(len: usize) -> Vec<f32> {
    let alpha = 0.16;
    let a0 = (1. - alpha) / 2.;
    let a1 = 0.5;
    let a2 = alpha / 2.;

    (0..len)
        .map(|i| {
            let x = i as f32 / len as f32;
            a0 - a1 * (2. * std::f32::consts::PI * x).cos()
                + a2 * (4. * std::f32::consts::PI * x).cos()
        })
        .collect()
}
