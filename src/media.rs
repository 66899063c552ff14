//! Decoding of audio assets into [`AudioBuffer`]s
//!
//! Decoding is the job of an external collaborator; this module provides the
//! reference implementation for WAV files. A failed decode surfaces as
//! [`AudioGraphError::Decoder`]; nodes that are handed no buffer simply play
//! silence.

use std::path::Path;

use crate::buffer::{AudioBuffer, ChannelData};
use crate::{AudioGraphError, SampleRate, MAX_CHANNELS};

/// Decode a WAV file into an [`AudioBuffer`], resampled to `sample_rate`.
///
/// Accepts integer PCM of any bit depth and 32-bit float PCM.
pub fn load_wav_file<P: AsRef<Path>>(
    path: P,
    sample_rate: SampleRate,
) -> Result<AudioBuffer, AudioGraphError> {
    let reader = hound::WavReader::open(path.as_ref())
        .map_err(|e| AudioGraphError::Decoder(e.to_string()))?;
    let spec = reader.spec();

    let channels = spec.channels as usize;
    if channels == 0 || channels > MAX_CHANNELS {
        return Err(AudioGraphError::InvalidArgument(
            "decoded file has an unsupported channel count",
        ));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| AudioGraphError::Decoder(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = 1. / (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()
                .map_err(|e| AudioGraphError::Decoder(e.to_string()))?
        }
    };

    // de-interleave into per-channel data
    let frames = interleaved.len() / channels;
    let mut data = vec![Vec::with_capacity(frames); channels];
    for frame in interleaved.chunks_exact(channels) {
        for (channel, &sample) in data.iter_mut().zip(frame) {
            channel.push(sample);
        }
    }

    let mut buffer = AudioBuffer::from_channels(
        data.into_iter().map(ChannelData::from).collect(),
        SampleRate(spec.sample_rate),
    );
    buffer.resample(sample_rate);

    log::debug!(
        "decoded {:?}: {} channels, {} frames",
        path.as_ref(),
        buffer.number_of_channels(),
        buffer.sample_len()
    );

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use super::*;

    fn temp_wav_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("soundgraph-test-{}-{}", std::process::id(), name));
        path
    }

    #[test]
    fn test_wav_float_round_trip() {
        let path = temp_wav_path("float.wav");

        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 44_100,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        let signal: Vec<f32> = (0..441)
            .map(|n| (2. * std::f32::consts::PI * 440. * n as f32 / 44_100.).sin())
            .collect();
        for &sample in signal.iter() {
            writer.write_sample(sample).unwrap(); // left
            writer.write_sample(-sample).unwrap(); // right
        }
        writer.finalize().unwrap();

        let buffer = load_wav_file(&path, SampleRate(44_100)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(buffer.number_of_channels(), 2);
        assert_eq!(buffer.sample_len(), 441);
        assert_eq!(buffer.sample_rate().0, 44_100);

        // float WAV round-trips bit-exact
        assert_float_eq!(
            buffer.channel_data(0).as_slice(),
            &signal[..],
            ulps_all <= 0
        );
    }

    #[test]
    fn test_wav_int_is_scaled() {
        let path = temp_wav_path("int.wav");

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 22_050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        writer.write_sample(i16::MAX).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.write_sample(i16::MIN).unwrap();
        writer.finalize().unwrap();

        let buffer = load_wav_file(&path, SampleRate(22_050)).unwrap();
        std::fs::remove_file(&path).unwrap();

        let samples = buffer.channel_data(0).as_slice();
        assert_float_eq!(samples[0], 1., abs <= 1e-4);
        assert_float_eq!(samples[1], 0., abs <= 0.);
        assert_float_eq!(samples[2], -1., abs <= 0.);
    }

    #[test]
    fn test_missing_file_is_decoder_error() {
        let result = load_wav_file("/definitely/not/here.wav", SampleRate(44_100));
        assert!(matches!(result, Err(AudioGraphError::Decoder(_))));
    }
}
