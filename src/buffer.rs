//! Sample assets held in memory, and per-node channel configuration

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::bus::AudioBus;
use crate::{SampleRate, RENDER_QUANTUM_SIZE};

/// A fully decoded block of audio held in memory: sample playback data,
/// impulse responses, offline render results.
///
/// Stored as planar channels of arbitrary length, tagged with the rate the
/// samples were produced at. Channel data sits behind shared pointers, so
/// cloning a buffer is cheap and mutation copies lazily.
#[derive(Clone, Debug)]
pub struct AudioBuffer {
    channels: Vec<ChannelData>,
    sample_rate: SampleRate,
}

impl AudioBuffer {
    /// A buffer of silence with the given dimensions.
    pub fn new(channels: usize, len: usize, sample_rate: SampleRate) -> Self {
        Self {
            channels: vec![ChannelData::new(len); channels],
            sample_rate,
        }
    }

    /// Assemble a buffer from per-channel sample data.
    pub fn from_channels(channels: Vec<ChannelData>, sample_rate: SampleRate) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }

    pub fn number_of_channels(&self) -> usize {
        self.channels.len()
    }

    /// Frames per channel.
    pub fn sample_len(&self) -> usize {
        match self.channels.first() {
            Some(channel) => channel.len(),
            None => 0,
        }
    }

    /// Rate the samples were produced at, in Hertz.
    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    /// Playing time of the buffer, in seconds.
    pub fn duration(&self) -> f64 {
        self.sample_len() as f64 / self.sample_rate.0 as f64
    }

    pub fn channels(&self) -> &[ChannelData] {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut [ChannelData] {
        &mut self.channels
    }

    /// Samples of one channel.
    ///
    /// Panics when the channel does not exist.
    pub fn channel_data(&self, index: usize) -> &ChannelData {
        &self.channels[index]
    }

    /// Samples of one channel, writable.
    ///
    /// Panics when the channel does not exist.
    pub fn channel_data_mut(&mut self, index: usize) -> &mut ChannelData {
        &mut self.channels[index]
    }

    /// Append the contents of another buffer.
    ///
    /// Panics when the sample rates or channel counts differ.
    pub fn extend(&mut self, other: &Self) {
        assert_eq!(self.sample_rate, other.sample_rate);
        assert_eq!(self.number_of_channels(), other.number_of_channels());

        for (channel, more) in self.channels.iter_mut().zip(other.channels.iter()) {
            channel.append(more.as_slice());
        }
    }

    /// Append one render quantum from an [`AudioBus`].
    ///
    /// No mixing is applied: channels the bus does not carry receive
    /// silence, surplus bus channels are ignored. Assumes matching sample
    /// rates.
    pub fn extend_from_bus(&mut self, bus: &AudioBus) {
        for (index, channel) in self.channels.iter_mut().enumerate() {
            if index < bus.number_of_channels() {
                channel.append(bus.channel_data(index).as_slice());
            } else {
                channel.append_silence(RENDER_QUANTUM_SIZE);
            }
        }
    }

    /// Truncate to `keep` frames and return the cut-off remainder as its
    /// own buffer.
    pub fn split_off(&mut self, keep: usize) -> AudioBuffer {
        let tail = self
            .channels
            .iter_mut()
            .map(|channel| channel.split_off(keep))
            .collect();

        AudioBuffer::from_channels(tail, self.sample_rate)
    }

    /// Convert the buffer to another sample rate.
    ///
    /// Nearest-neighbor lookup, which is enough for assets that get
    /// interpolated again at playback time. The frame count changes
    /// proportionally.
    ///
    /// ```
    /// use soundgraph::SampleRate;
    /// use soundgraph::buffer::{AudioBuffer, ChannelData};
    ///
    /// let samples = ChannelData::from(vec![0., 1., 2., 3.]);
    /// let mut buffer = AudioBuffer::from_channels(vec![samples], SampleRate(11_025));
    ///
    /// // doubling the rate repeats every frame
    /// buffer.resample(SampleRate(22_050));
    ///
    /// assert_eq!(buffer.sample_len(), 8);
    /// assert_eq!(
    ///     buffer.channel_data(0).as_slice(),
    ///     &[0., 0., 1., 1., 2., 2., 3., 3.]
    /// );
    /// ```
    pub fn resample(&mut self, sample_rate: SampleRate) {
        if sample_rate == self.sample_rate {
            return;
        }

        let rate = sample_rate.0 as f32 / self.sample_rate.0 as f32;

        for channel in self.channels.iter_mut() {
            let source = channel.as_slice();
            let target_len = (source.len() as f32 * rate) as usize;

            let resampled: Vec<f32> = (0..target_len)
                .map(|frame| {
                    // nearest source frame that has fully elapsed
                    let position = ((frame + 1) as f32 / rate).ceil() as usize;
                    source[position.saturating_sub(1).min(source.len() - 1)]
                })
                .collect();

            *channel = ChannelData::from(resampled);
        }

        self.sample_rate = sample_rate;
    }
}

/// Planar samples of a single channel, shared behind an `Arc`.
///
/// Cloning is cheap; writing through [`ChannelData::as_mut_slice`] copies
/// only while the data is shared.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelData {
    samples: Arc<Vec<f32>>,
}

impl ChannelData {
    /// `length` frames of silence.
    pub fn new(length: usize) -> Self {
        Self {
            samples: Arc::new(vec![0.; length]),
        }
    }

    pub fn from(samples: Vec<f32>) -> Self {
        Self {
            samples: Arc::new(samples),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.samples
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        Arc::make_mut(&mut self.samples).as_mut_slice()
    }

    fn append(&mut self, more: &[f32]) {
        Arc::make_mut(&mut self.samples).extend_from_slice(more);
    }

    fn append_silence(&mut self, frames: usize) {
        let total = self.samples.len() + frames;
        Arc::make_mut(&mut self.samples).resize(total, 0.);
    }

    fn split_off(&mut self, keep: usize) -> ChannelData {
        ChannelData::from(Arc::make_mut(&mut self.samples).split_off(keep))
    }
}

/// How a node sizes its input summing junctions.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ChannelCountMode {
    /// Use the largest channel count among the live connections; the node's
    /// `channel_count` is ignored.
    Max,
    /// As `Max`, but never more channels than the node's `channel_count`.
    ClampedMax,
    /// Always exactly the node's `channel_count`.
    Explicit,
}

impl From<u32> for ChannelCountMode {
    fn from(i: u32) -> Self {
        use ChannelCountMode::*;

        match i {
            0 => Max,
            1 => ClampedMax,
            2 => Explicit,
            _ => unreachable!(),
        }
    }
}

/// What the channels of a bus mean, which picks the up/down-mix rules.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ChannelInterpretation {
    /// Standard speaker layouts, mixed with the usual AC-3 coefficients.
    Speakers,
    /// Plain numbered channels: copied by index, truncated or zero-padded.
    Discrete,
}

impl From<u32> for ChannelInterpretation {
    fn from(i: u32) -> Self {
        use ChannelInterpretation::*;

        match i {
            0 => Speakers,
            1 => Discrete,
            _ => unreachable!(),
        }
    }
}

/// Initial values for a node's [`ChannelConfig`].
#[derive(Clone, Debug)]
pub struct ChannelConfigOptions {
    pub count: usize,
    pub mode: ChannelCountMode,
    pub interpretation: ChannelInterpretation,
}

impl Default for ChannelConfigOptions {
    fn default() -> Self {
        Self {
            count: 2,
            mode: ChannelCountMode::Max,
            interpretation: ChannelInterpretation::Speakers,
        }
    }
}

/// A node's channel mixing setup.
///
/// One copy is shared between the control-side handle and the render
/// thread; changes are plain atomic stores and take effect at the next
/// render quantum.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    inner: Arc<ChannelConfigInner>,
}

#[derive(Debug)]
struct ChannelConfigInner {
    count: AtomicUsize,
    mode: AtomicU32,
    interpretation: AtomicU32,
}

impl ChannelConfig {
    /// How the node's input junctions pick their channel count.
    pub fn count_mode(&self) -> ChannelCountMode {
        self.inner.mode.load(Ordering::SeqCst).into()
    }
    pub fn set_count_mode(&self, v: ChannelCountMode) {
        self.inner.mode.store(v as u32, Ordering::SeqCst)
    }

    /// Mixing semantics applied when the node's inputs up- or down-mix.
    pub fn interpretation(&self) -> ChannelInterpretation {
        self.inner.interpretation.load(Ordering::SeqCst).into()
    }
    pub fn set_interpretation(&self, v: ChannelInterpretation) {
        self.inner.interpretation.store(v as u32, Ordering::SeqCst)
    }

    /// Channel count used by the `ClampedMax` and `Explicit` modes.
    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }
    pub fn set_count(&self, v: usize) {
        assert!(v >= 1 && v <= crate::MAX_CHANNELS);
        self.inner.count.store(v, Ordering::SeqCst)
    }
}

impl From<ChannelConfigOptions> for ChannelConfig {
    fn from(opts: ChannelConfigOptions) -> Self {
        ChannelConfig {
            inner: Arc::new(ChannelConfigInner {
                count: AtomicUsize::new(opts.count),
                mode: AtomicU32::new(opts.mode as u32),
                interpretation: AtomicU32::new(opts.interpretation as u32),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use super::*;

    #[test]
    fn test_silent_buffer() {
        let buffer = AudioBuffer::new(2, 10, SampleRate(44_100));

        assert_eq!(buffer.number_of_channels(), 2);
        assert_eq!(buffer.sample_len(), 10);
        assert_eq!(buffer.sample_rate().0, 44_100);
        for channel in buffer.channels() {
            assert_float_eq!(channel.as_slice(), &[0.; 10][..], ulps_all <= 0);
        }
        assert!(buffer.channels().get(2).is_none());
    }

    #[test]
    fn test_extend_and_split() {
        let mut buffer = AudioBuffer::new(2, 5, SampleRate(44_100));
        buffer.extend(&AudioBuffer::new(2, 5, SampleRate(44_100)));
        assert_eq!(buffer.sample_len(), 10);

        let ones = ChannelData::from(vec![1.; 5]);
        buffer.extend(&AudioBuffer::from_channels(
            vec![ones; 2],
            SampleRate(44_100),
        ));
        assert_eq!(buffer.sample_len(), 15);

        let tail = buffer.split_off(10);
        assert_eq!(buffer.sample_len(), 10);
        assert_eq!(tail.sample_len(), 5);
        assert_float_eq!(tail.channel_data(0).as_slice(), &[1.; 5][..], ulps_all <= 0);
        assert_float_eq!(
            buffer.channel_data(1).as_slice(),
            &[0.; 10][..],
            ulps_all <= 0
        );
    }

    #[test]
    fn test_extend_from_bus_pads_missing_channels() {
        let mut buffer = AudioBuffer::new(2, 0, SampleRate(44_100));

        let mut bus = crate::bus::AudioBus::new(1);
        bus.channel_data_mut(0).as_mut_slice().fill(0.5);

        buffer.extend_from_bus(&bus);

        assert_eq!(buffer.sample_len(), crate::RENDER_QUANTUM_SIZE);
        assert_float_eq!(buffer.channel_data(0).as_slice()[7], 0.5, abs <= 0.);
        // the bus had no second channel, silence was appended instead
        assert_float_eq!(buffer.channel_data(1).as_slice()[7], 0., abs <= 0.);
    }

    #[test]
    fn test_resample_to_double_rate() {
        let samples = ChannelData::from(vec![1., 2., 3., 4., 5.]);
        let mut buffer = AudioBuffer::from_channels(vec![samples], SampleRate(100));

        buffer.resample(SampleRate(200));

        assert_eq!(buffer.sample_rate().0, 200);
        assert_float_eq!(
            buffer.channel_data(0).as_slice(),
            &[1., 1., 2., 2., 3., 3., 4., 4., 5., 5.][..],
            ulps_all <= 0
        );
    }

    #[test]
    fn test_resample_to_half_rate() {
        let samples = ChannelData::from(vec![1., 2., 3., 4., 5.]);
        let mut buffer = AudioBuffer::from_channels(vec![samples], SampleRate(200));

        buffer.resample(SampleRate(100));

        assert_eq!(buffer.sample_rate().0, 100);
        assert_float_eq!(
            buffer.channel_data(0).as_slice(),
            &[2., 4.][..],
            ulps_all <= 0
        );
    }

    #[test]
    fn test_channel_data_copy_on_write() {
        let mut a = ChannelData::from(vec![1., 2.]);
        let b = a.clone();

        a.as_mut_slice()[0] = 9.;

        assert_float_eq!(a.as_slice(), &[9., 2.][..], ulps_all <= 0);
        assert_float_eq!(b.as_slice(), &[1., 2.][..], ulps_all <= 0);
    }
}
