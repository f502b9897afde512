use std::path::Path;

use anyhow::Context;
use hound::{SampleFormat, WavReader};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// Reads a WAV file as mono samples in [-1, 1] at `sample_rate`.
pub fn read_raw_audio(path: &Path, sample_rate: u32) -> anyhow::Result<Vec<f32>> {
    let mut reader = WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 || spec.channels == 0 {
        anyhow::bail!("Invalid WAV header in {}", path.display());
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .with_context(|| format!("Failed to decode samples: {}", path.display()))?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|sample| sample.map(|value| value as f32 / scale))
                .collect::<Result<_, _>>()
                .with_context(|| format!("Failed to decode samples: {}", path.display()))?
        }
    };

    let channels = usize::from(spec.channels);
    let mono: Vec<f32> = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    if mono.is_empty() {
        anyhow::bail!("WAV file has no samples: {}", path.display());
    }

    resample(&mono, spec.sample_rate, sample_rate)
}

/// Band-limited sinc resampling. Input above the new Nyquist rate is
/// filtered out rather than folded back into the band.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> anyhow::Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, samples.len(), 1)
        .with_context(|| format!("Failed to create resampler {from_rate} Hz -> {to_rate} Hz"))?;

    let delay = resampler.output_delay();
    let expected_len = (samples.len() as f64 * ratio).round() as usize;

    let mut output = resampler
        .process(&[samples], None)
        .context("Resampling failed")?
        .remove(0);
    // Flush the filter tail so the delayed output covers the whole input.
    let tail = resampler
        .process_partial(None::<&[&[f32]]>, None)
        .context("Resampling failed")?;
    output.extend_from_slice(&tail[0]);

    output.drain(..delay.min(output.len()));
    output.resize(expected_len, 0.0);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    fn write_wav(path: &Path, spec: WavSpec, samples: &[i16]) {
        let mut writer = WavWriter::create(path, spec).unwrap();
        for sample in samples {
            writer.write_sample(*sample).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn reads_int16_and_scales_to_unit_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        write_wav(&path, spec, &[0, 16384, -32768]);

        let samples = read_raw_audio(&path, 16000).unwrap();
        assert_eq!(samples, vec![0.0, 0.5, -1.0]);
    }

    #[test]
    fn stereo_is_averaged_to_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        write_wav(&path, spec, &[16384, 0, -16384, -16384]);

        let samples = read_raw_audio(&path, 16000).unwrap();
        assert_eq!(samples, vec![0.25, -0.5]);
    }

    fn sine(freq: f32, rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|t| (2.0 * std::f32::consts::PI * freq * t as f32 / rate as f32).sin())
            .collect()
    }

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|x| x * x).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn downsampling_keeps_in_band_tone() {
        let out = resample(&sine(1000.0, 48000, 9600), 48000, 16000).unwrap();
        assert_eq!(out.len(), 3200);
        let level = rms(&out[400..2800]);
        assert!((level - std::f32::consts::FRAC_1_SQRT_2).abs() < 0.05, "rms {level}");
    }

    #[test]
    fn downsampling_removes_tone_above_nyquist() {
        // 12 kHz would alias to 4 kHz at 16 kHz without filtering.
        let out = resample(&sine(12000.0, 48000, 9600), 48000, 16000).unwrap();
        assert_eq!(out.len(), 3200);
        assert!(rms(&out[400..2800]) < 0.05);
    }

    #[test]
    fn same_rate_is_passthrough() {
        let samples = vec![0.1, -0.2, 0.3];
        assert_eq!(resample(&samples, 16000, 16000).unwrap(), samples);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(read_raw_audio(Path::new("/nonexistent.wav"), 16000).is_err());
    }
}
