//! Fixed-size audio buses passed between nodes during rendering
//!
//! An [`AudioBus`] carries one render quantum of samples. Channel data has
//! copy-on-write semantics so fan-out and pass-through never copy samples,
//! and a silence hint lets downstream nodes skip work entirely.

use std::sync::Arc;

use arrayvec::ArrayVec;
use lazy_static::lazy_static;

use crate::buffer::ChannelInterpretation;
use crate::{MAX_CHANNELS, RENDER_QUANTUM_SIZE};

lazy_static! {
    // all-zero channel shared by every silent bus
    static ref SILENT_CHANNEL: ChannelData = ChannelData {
        data: Arc::new([0.; RENDER_QUANTUM_SIZE]),
    };
}

/// One render quantum of samples for a single channel.
///
/// Cheap to clone; mutation copies only when the data is shared.
#[derive(Clone, Debug)]
pub struct ChannelData {
    data: Arc<[f32; RENDER_QUANTUM_SIZE]>,
}

impl ChannelData {
    pub fn new() -> Self {
        SILENT_CHANNEL.clone()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data[..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut Arc::make_mut(&mut self.data)[..]
    }

    pub fn copy_from_slice(&mut self, src: &[f32]) {
        self.as_mut_slice().copy_from_slice(src)
    }

    fn is_zero(&self) -> bool {
        Arc::ptr_eq(&self.data, &SILENT_CHANNEL.data)
    }
}

impl Default for ChannelData {
    fn default() -> Self {
        Self::new()
    }
}

/// A render quantum's worth of multi-channel audio.
///
/// Semantic container: an ordered sequence of channels, each an ordered
/// sequence of `RENDER_QUANTUM_SIZE` samples. A bus always has at least one
/// channel. The silence hint is conservative: when `is_silent()` returns
/// true every sample is guaranteed zero, when it returns false the data may
/// still happen to be zero.
#[derive(Clone, Debug)]
pub struct AudioBus {
    channels: ArrayVec<ChannelData, MAX_CHANNELS>,
    silent: bool,
}

impl AudioBus {
    /// Create a silent bus with the given number of channels.
    ///
    /// Panics when `channels` is zero or exceeds [`MAX_CHANNELS`].
    pub fn new(channels: usize) -> Self {
        assert!(channels >= 1 && channels <= MAX_CHANNELS);

        let mut data = ArrayVec::new();
        for _ in 0..channels {
            data.push(ChannelData::new());
        }

        Self {
            channels: data,
            silent: true,
        }
    }

    pub fn number_of_channels(&self) -> usize {
        self.channels.len()
    }

    /// Truncate or zero-pad to the desired channel count.
    pub fn set_number_of_channels(&mut self, count: usize) {
        assert!(count >= 1 && count <= MAX_CHANNELS);

        self.channels.truncate(count);
        while self.channels.len() < count {
            self.channels.push(ChannelData::new());
        }
    }

    /// Drop all channels but the first.
    pub fn force_mono(&mut self) {
        self.channels.truncate(1);
    }

    pub fn channel_data(&self, index: usize) -> &ChannelData {
        &self.channels[index]
    }

    pub fn channel_data_mut(&mut self, index: usize) -> &mut ChannelData {
        self.silent = false;
        &mut self.channels[index]
    }

    pub fn channels(&self) -> &[ChannelData] {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut [ChannelData] {
        self.silent = false;
        &mut self.channels
    }

    /// Conservative silence hint, see the type-level docs.
    pub fn is_silent(&self) -> bool {
        self.silent
    }

    /// Zero the bus. All channels revert to the shared silent block, so this
    /// is constant-time regardless of channel count.
    pub fn make_silent(&mut self) {
        for channel in self.channels.iter_mut() {
            *channel = ChannelData::new();
        }
        self.silent = true;
    }

    /// Re-establish the silence hint by inspecting the channel data.
    ///
    /// Cheap when channels still alias the shared silent block; otherwise
    /// scans samples once.
    pub fn update_silence_hint(&mut self) {
        self.silent = self
            .channels
            .iter()
            .all(|c| c.is_zero() || c.as_slice().iter().all(|&s| s == 0.));
    }

    /// Become a copy of `other` (channel data is shared, not copied).
    pub fn copy_from(&mut self, other: &Self) {
        self.channels.clear();
        for channel in other.channels.iter() {
            self.channels.push(channel.clone());
        }
        self.silent = other.silent;
    }

    /// Up- or down-mix in place to `computed_channels`.
    ///
    /// `Speakers` interpretation follows the standard AC-3 mixing rules for
    /// the mono/stereo/quad/5.1 layouts; other channel combinations fall
    /// back to discrete behavior. `Discrete` copies by channel index,
    /// truncating or zero-padding.
    pub fn mix(&mut self, computed_channels: usize, interpretation: ChannelInterpretation) {
        assert!(computed_channels >= 1 && computed_channels <= MAX_CHANNELS);

        let current = self.number_of_channels();
        if current == computed_channels {
            return;
        }

        if self.silent {
            self.set_number_of_channels(computed_channels);
            return;
        }

        match interpretation {
            ChannelInterpretation::Discrete => self.set_number_of_channels(computed_channels),
            ChannelInterpretation::Speakers => match (current, computed_channels) {
                (1, 2) => {
                    let mono = self.channels[0].clone();
                    self.channels.push(mono);
                }
                (1, 4) => {
                    let mono = self.channels[0].clone();
                    self.channels.push(mono);
                    self.channels.push(ChannelData::new());
                    self.channels.push(ChannelData::new());
                }
                (2, 1) => {
                    let right = self.channels.pop().unwrap();
                    let left = &mut self.channels[0];
                    left.as_mut_slice()
                        .iter_mut()
                        .zip(right.as_slice())
                        .for_each(|(l, r)| *l = 0.5 * (*l + r));
                }
                (2, 4) => {
                    self.channels.push(ChannelData::new());
                    self.channels.push(ChannelData::new());
                }
                (4, 2) => {
                    let back_right = self.channels.pop().unwrap();
                    let back_left = self.channels.pop().unwrap();
                    self.channels[0]
                        .as_mut_slice()
                        .iter_mut()
                        .zip(back_left.as_slice())
                        .for_each(|(f, b)| *f += 0.5 * b);
                    self.channels[1]
                        .as_mut_slice()
                        .iter_mut()
                        .zip(back_right.as_slice())
                        .for_each(|(f, b)| *f += 0.5 * b);
                }
                (6, 2) => {
                    // L = FL + 0.707 * (C + BL), R = FR + 0.707 * (C + BR), LFE dropped
                    let back_right = self.channels.pop().unwrap();
                    let back_left = self.channels.pop().unwrap();
                    let _lfe = self.channels.pop().unwrap();
                    let center = self.channels.pop().unwrap();
                    self.channels[0]
                        .as_mut_slice()
                        .iter_mut()
                        .zip(center.as_slice())
                        .zip(back_left.as_slice())
                        .for_each(|((f, c), b)| *f += 0.707 * (c + b));
                    self.channels[1]
                        .as_mut_slice()
                        .iter_mut()
                        .zip(center.as_slice())
                        .zip(back_right.as_slice())
                        .for_each(|((f, c), b)| *f += 0.707 * (c + b));
                }
                _ => {
                    log::debug!(
                        "no speaker mix rule for {} -> {} channels, using discrete",
                        current,
                        computed_channels
                    );
                    self.set_number_of_channels(computed_channels);
                }
            },
        }
    }

    /// Unity-gain sum of `other` into this bus, mixing `other` to this bus'
    /// channel count first.
    ///
    /// Summing into a silent bus aliases the source channels, so the single
    /// connection case is zero-copy.
    pub fn sum_from(&mut self, other: &Self, interpretation: ChannelInterpretation) {
        if other.is_silent() {
            return;
        }

        let channels = self.number_of_channels();

        if self.silent {
            let mut aliased = other.clone();
            aliased.mix(channels, interpretation);
            *self = aliased;
            return;
        }

        let mut mixed = other.clone();
        mixed.mix(channels, interpretation);

        self.silent = false;
        self.channels
            .iter_mut()
            .zip(mixed.channels.iter())
            .for_each(|(dst, src)| {
                dst.as_mut_slice()
                    .iter_mut()
                    .zip(src.as_slice())
                    .for_each(|(d, s)| *d += s);
            });
    }
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use super::*;

    fn bus_with(values: &[f32]) -> AudioBus {
        let mut bus = AudioBus::new(values.len());
        for (i, &v) in values.iter().enumerate() {
            bus.channel_data_mut(i).as_mut_slice().fill(v);
        }
        bus
    }

    fn first_samples(bus: &AudioBus) -> Vec<f32> {
        bus.channels().iter().map(|c| c.as_slice()[0]).collect()
    }

    #[test]
    fn test_silence_hint() {
        let mut bus = AudioBus::new(2);
        assert!(bus.is_silent());

        bus.channel_data_mut(0).as_mut_slice()[0] = 1.;
        assert!(!bus.is_silent());

        bus.make_silent();
        assert!(bus.is_silent());
        assert_float_eq!(bus.channel_data(0).as_slice()[0], 0., abs_all <= 0.);
    }

    #[test]
    fn test_upmix_mono_to_stereo_shares_data() {
        let mut bus = bus_with(&[1.]);
        bus.mix(2, ChannelInterpretation::Speakers);

        assert_eq!(bus.number_of_channels(), 2);
        assert_float_eq!(first_samples(&bus)[..], [1., 1.][..], abs_all <= 0.);
    }

    #[test]
    fn test_downmix_stereo_to_mono() {
        let mut bus = bus_with(&[1., 0.5]);
        bus.mix(1, ChannelInterpretation::Speakers);

        assert_eq!(bus.number_of_channels(), 1);
        assert_float_eq!(first_samples(&bus)[..], [0.75][..], abs_all <= 0.);
    }

    #[test]
    fn test_downmix_quad_to_stereo() {
        let mut bus = bus_with(&[1., 0.8, 0.5, 0.25]);
        bus.mix(2, ChannelInterpretation::Speakers);

        assert_float_eq!(first_samples(&bus)[..], [1.25, 0.925][..], abs_all <= 1e-6);
    }

    #[test]
    fn test_downmix_5_1_to_stereo() {
        let mut bus = bus_with(&[1., 1., 0.5, 0.9, 0.2, 0.4]);
        bus.mix(2, ChannelInterpretation::Speakers);

        // L = FL + 0.707 * (C + BL), R = FR + 0.707 * (C + BR), LFE dropped
        assert_float_eq!(
            first_samples(&bus)[..],
            [1. + 0.707 * 0.7, 1. + 0.707 * 0.9][..],
            abs_all <= 1e-6
        );
    }

    #[test]
    fn test_discrete_mix_pads_and_truncates() {
        let mut bus = bus_with(&[1., 2., 3.]);
        bus.mix(5, ChannelInterpretation::Discrete);
        assert_float_eq!(
            first_samples(&bus)[..],
            [1., 2., 3., 0., 0.][..],
            abs_all <= 0.
        );

        bus.mix(2, ChannelInterpretation::Discrete);
        assert_float_eq!(first_samples(&bus)[..], [1., 2.][..], abs_all <= 0.);
    }

    #[test]
    fn test_sum_single_connection_aliases() {
        let src = bus_with(&[1., 2.]);
        let mut junction = AudioBus::new(2);
        junction.sum_from(&src, ChannelInterpretation::Speakers);

        assert!(!junction.is_silent());
        assert_float_eq!(first_samples(&junction)[..], [1., 2.][..], abs_all <= 0.);
    }

    #[test]
    fn test_sum_multiple_connections() {
        let a = bus_with(&[1., 2.]);
        let b = bus_with(&[0.5]);

        let mut junction = AudioBus::new(2);
        junction.sum_from(&a, ChannelInterpretation::Speakers);
        junction.sum_from(&b, ChannelInterpretation::Speakers);

        // mono upmixes to both channels before the sum
        assert_float_eq!(first_samples(&junction)[..], [1.5, 2.5][..], abs_all <= 0.);
    }

    #[test]
    fn test_sum_from_silent_is_noop() {
        let mut junction = bus_with(&[1.]);
        junction.sum_from(&AudioBus::new(1), ChannelInterpretation::Speakers);
        assert_float_eq!(first_samples(&junction)[..], [1.][..], abs_all <= 0.);
    }

    #[test]
    fn test_copy_on_write() {
        let mut a = bus_with(&[1.]);
        let b = a.clone();

        a.channel_data_mut(0).as_mut_slice()[0] = 2.;

        assert_float_eq!(a.channel_data(0).as_slice()[0], 2., abs_all <= 0.);
        assert_float_eq!(b.channel_data(0).as_slice()[0], 1., abs_all <= 0.);
    }
}
