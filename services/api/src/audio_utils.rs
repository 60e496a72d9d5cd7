use base64::Engine;
use bytes::Bytes;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Rate the conversation pipeline consumes.
pub const PIPELINE_SAMPLE_RATE: u32 = 16000;
/// Rate assumed for client audio when `init` does not name one.
pub const DEFAULT_CLIENT_SAMPLE_RATE: u32 = 16000;
const RESAMPLER_CHUNK_SIZE: usize = 512;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )?;
    Ok(resampler)
}

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Base64 of raw PCM16 LE bytes, as carried by `audio_chunk` messages.
pub fn encode_pcm16(pcm: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(pcm)
}

/// Converts client PCM16 to the pipeline rate.
///
/// Input that does not fill a whole resampler chunk is kept for the next call,
/// so arbitrary frame sizes from the client are fine. A trailing odd byte is
/// carried over too.
pub struct InboundResampler {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
    odd_byte: Option<u8>,
}

impl InboundResampler {
    pub fn new(client_rate: u32) -> anyhow::Result<Self> {
        anyhow::ensure!(client_rate > 0, "sample rate must be positive");
        let inner = if client_rate == PIPELINE_SAMPLE_RATE {
            None
        } else {
            Some(create_resampler(
                client_rate as f64,
                PIPELINE_SAMPLE_RATE as f64,
                RESAMPLER_CHUNK_SIZE,
            )?)
        };
        Ok(Self {
            inner,
            pending: Vec::new(),
            odd_byte: None,
        })
    }

    /// Feeds one binary frame; returns whatever PCM16 at the pipeline rate is ready.
    pub fn push(&mut self, data: &[u8]) -> anyhow::Result<Bytes> {
        let mut bytes = Vec::with_capacity(data.len() + 1);
        bytes.extend(self.odd_byte.take());
        bytes.extend_from_slice(data);
        if bytes.len() % 2 != 0 {
            self.odd_byte = bytes.pop();
        }

        let Some(resampler) = self.inner.as_mut() else {
            return Ok(Bytes::from(bytes));
        };

        let pcm_i16: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        self.pending.extend(convert_i16_to_f32(&pcm_i16));

        let mut resampled = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let out = resampler.process(&[&self.pending[..needed]], None)?;
            resampled.extend_from_slice(&out[0]);
            self.pending.drain(..needed);
        }

        Ok(convert_f32_to_i16(&resampled)
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_create_resampler() {
        assert!(create_resampler(48000.0, 16000.0, 512).is_ok());
        assert!(create_resampler(8000.0, 16000.0, 512).is_ok());
    }

    #[test]
    fn test_convert_f32_to_i16() {
        let input = vec![1.0f32, -1.0f32, 0.0f32, 0.5f32];
        let result = convert_f32_to_i16(&input);

        assert_eq!(result[0], i16::MAX);
        // -1.0 * 32767 = -32767, not i16::MIN (-32768)
        assert_eq!(result[1], -32767);
        assert_eq!(result[2], 0);
        assert_eq!(result[3], (0.5 * i16::MAX as f32) as i16);

        let clamped = convert_f32_to_i16(&[2.0, -2.0]);
        assert_eq!(clamped, vec![i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_convert_i16_to_f32() {
        let result = convert_i16_to_f32(&[i16::MIN, 0, 16384]);
        assert_abs_diff_eq!(result[0], -1.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[1], 0.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[2], 0.5, epsilon = 0.0001);
    }

    #[test]
    fn test_encode_pcm16() {
        assert_eq!(encode_pcm16(&[0x00, 0x40]), "AEA=");
        assert_eq!(encode_pcm16(&[]), "");
    }

    #[test]
    fn test_pipeline_rate_passes_through_and_carries_odd_bytes() {
        let mut resampler = InboundResampler::new(PIPELINE_SAMPLE_RATE).unwrap();
        assert_eq!(resampler.push(&[1, 2, 3]).unwrap(), Bytes::from_static(&[1, 2]));
        assert_eq!(
            resampler.push(&[4, 5, 6]).unwrap(),
            Bytes::from_static(&[3, 4, 5, 6])
        );
    }

    #[test]
    fn test_downsampling_yields_a_third_of_the_samples() {
        let mut resampler = InboundResampler::new(48000).unwrap();
        let mut produced = 0usize;
        // One second of a 0.25 amplitude signal in 20 ms frames.
        let frame: Vec<u8> = [8192i16; 960].iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut last = Bytes::new();
        for _ in 0..50 {
            let out = resampler.push(&frame).unwrap();
            assert_eq!(out.len() % 2, 0);
            produced += out.len() / 2;
            if !out.is_empty() {
                last = out;
            }
        }

        // Whatever is still buffered is less than one resampler chunk.
        let expected = 16000usize;
        assert!(produced.abs_diff(expected) < RESAMPLER_CHUNK_SIZE);

        let tail = i16::from_le_bytes([last[last.len() - 2], last[last.len() - 1]]);
        assert_abs_diff_eq!(tail as f32 / 32768.0, 0.25, epsilon = 0.01);
    }

    #[test]
    fn test_zero_rate_is_rejected() {
        assert!(InboundResampler::new(0).is_err());
    }
}
