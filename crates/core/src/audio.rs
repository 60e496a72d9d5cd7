//! PCM16 helpers shared by the audio-handling stages.

use bytes::Bytes;
use std::io::Cursor;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("PCM16 payload has odd length {0}")]
    OddLength(usize),
    #[error("wav encoding failed: {0}")]
    Wav(#[from] hound::Error),
}

/// Interprets little-endian PCM16 bytes as samples.
pub fn pcm16_samples(bytes: &[u8]) -> Result<Vec<i16>, AudioError> {
    if bytes.len() % 2 != 0 {
        return Err(AudioError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}

pub fn pcm16_bytes(samples: &[i16]) -> Bytes {
    samples
        .iter()
        .flat_map(|sample| sample.to_le_bytes())
        .collect::<Vec<u8>>()
        .into()
}

/// Root-mean-square level of PCM16 bytes, normalized to `0.0..=1.0`.
pub fn rms(bytes: &[u8]) -> f32 {
    let count = bytes.len() / 2;
    if count == 0 {
        return 0.0;
    }
    let sum: f64 = bytes
        .chunks_exact(2)
        .map(|chunk| {
            let v = i16::from_le_bytes([chunk[0], chunk[1]]) as f64 / 32768.0;
            v * v
        })
        .sum();
    (sum / count as f64).sqrt() as f32
}

/// Wraps mono PCM16 bytes in a WAV container.
pub fn encode_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>, AudioError> {
    let samples = pcm16_samples(pcm)?;
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}
