use std::io::Cursor;

/// Telephony narrowband rate (Twilio mu-law).
pub const MULAW_SAMPLE_RATE: u32 = 8000;
/// Bytes per linear16 sample.
pub const LINEAR16_BYTES: usize = 2;

const MULAW_BIAS: i16 = 0x84;
const MULAW_CLIP: i16 = 32635;

/// Allowed deviation between the expected and actual decoded length, in samples.
/// Linear resampling can lose one sample to flooring at the tail of a frame.
const LENGTH_TOLERANCE_SAMPLES: usize = 1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid sample rate {from} -> {to}")]
    InvalidRate { from: u32, to: u32 },
    #[error("invalid WAV payload: {0}")]
    Wav(String),
    #[error("unsupported WAV format: {0}")]
    Unsupported(String),
}

/// Decode a single mu-law byte to 16-bit PCM sample.
pub fn mulaw_to_pcm(mulaw: u8) -> i16 {
    // Invert all bits per ITU-T G.711
    let mulaw = !mulaw;

    let sign = (mulaw & 0x80) as i16;
    let exponent = ((mulaw >> 4) & 0x07) as i16;
    let mantissa = (mulaw & 0x0F) as i16;

    let mut sample = ((mantissa << 3) + MULAW_BIAS) << exponent;
    sample -= MULAW_BIAS;

    if sign != 0 {
        -sample
    } else {
        sample
    }
}

/// Encode a 16-bit PCM sample to mu-law byte.
pub fn pcm_to_mulaw(sample: i16) -> u8 {
    let sign: u8 = if sample < 0 { 0x80 } else { 0 };
    // i16::MIN has no positive counterpart
    let mut sample = sample.saturating_abs().min(MULAW_CLIP);
    sample += MULAW_BIAS;

    let exponent = compress_table((sample >> 7) as u8);
    let mantissa = ((sample >> (exponent + 3)) & 0x0F) as u8;

    !(sign | (exponent << 4) | mantissa)
}

fn compress_table(val: u8) -> u8 {
    match val {
        0..=1 => 0,
        2..=3 => 1,
        4..=7 => 2,
        8..=15 => 3,
        16..=31 => 4,
        32..=63 => 5,
        64..=127 => 6,
        _ => 7,
    }
}

/// Interpret little-endian linear16 bytes as samples. A trailing odd byte is dropped.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    if bytes.len() % LINEAR16_BYTES != 0 {
        tracing::warn!(len = bytes.len(), "Odd-length linear16 buffer, dropping last byte");
    }
    bytes
        .chunks_exact(LINEAR16_BYTES)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Serialize samples as little-endian linear16 bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Multiply every sample by `factor`, clipping at the i16 range instead of wrapping.
pub fn apply_gain(samples: &[i16], factor: f32) -> Vec<i16> {
    if !factor.is_finite() || factor == 1.0 {
        return samples.to_vec();
    }
    samples
        .iter()
        .map(|&s| ((s as f32) * factor).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Resample audio using linear interpolation.
///
/// Output length is `len * to_rate / from_rate`, computed in integers so the
/// common telephony ratios (x6, x3) are exact.
pub fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let ratio = from_rate as f64 / to_rate as f64;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            let a = samples[idx] as f64;
            let b = samples[idx + 1] as f64;
            (a + (b - a) * frac).round() as i16
        } else {
            samples[idx.min(samples.len() - 1)]
        };

        output.push(sample);
    }

    output
}

/// Generic linear16 resampler shared by the Twilio (8k) and Vonage (16k) paths.
pub fn resample_linear16(bytes: &[u8], src_rate: u32, dst_rate: u32) -> Result<Vec<u8>, CodecError> {
    if src_rate == 0 || dst_rate == 0 {
        return Err(CodecError::InvalidRate {
            from: src_rate,
            to: dst_rate,
        });
    }
    let samples = bytes_to_samples(bytes);
    Ok(samples_to_bytes(&resample_linear(&samples, src_rate, dst_rate)))
}

/// mu-law (8kHz) to linear16 at `dst_rate`, boosted by `boost_factor` before resampling.
///
/// Never fails: a bad rate pair degrades to the 8kHz buffer with a warning, and
/// the result is empty only when the input was.
pub fn decode_mulaw_to_linear16(bytes: &[u8], boost_factor: f32, src_rate: u32, dst_rate: u32) -> Vec<u8> {
    if bytes.is_empty() {
        return Vec::new();
    }

    let pcm: Vec<i16> = bytes.iter().map(|&b| mulaw_to_pcm(b)).collect();
    let boosted = apply_gain(&pcm, boost_factor);
    let boosted = samples_to_bytes(&boosted);

    let converted = match resample_linear16(&boosted, src_rate, dst_rate) {
        Ok(out) => out,
        Err(e) => {
            tracing::warn!("Resample failed, keeping source rate: {e}");
            return boosted;
        }
    };

    let expected = expected_len(bytes.len() * LINEAR16_BYTES, src_rate, dst_rate);
    if converted.len().abs_diff(expected) > LENGTH_TOLERANCE_SAMPLES * LINEAR16_BYTES {
        tracing::warn!(
            input = bytes.len(),
            expected,
            actual = converted.len(),
            "Decoded audio length mismatch"
        );
    }

    converted
}

/// linear16 at `src_rate` to 8-bit mu-law at `dst_rate`.
pub fn encode_linear16_to_mulaw(bytes: &[u8], src_rate: u32, dst_rate: u32) -> Vec<u8> {
    let samples = bytes_to_samples(bytes);
    let resampled = if src_rate == 0 || dst_rate == 0 {
        tracing::warn!(src_rate, dst_rate, "Invalid rate for mu-law encode, keeping source rate");
        samples
    } else {
        resample_linear(&samples, src_rate, dst_rate)
    };
    resampled.iter().map(|&s| pcm_to_mulaw(s)).collect()
}

/// Time-compress linear16 audio by `factor` (> 1.0 plays faster). Pitch is not preserved.
pub fn speed_up_linear16(bytes: &[u8], factor: f32) -> Vec<u8> {
    if !factor.is_finite() || factor <= 1.0 {
        return bytes.to_vec();
    }
    let samples = bytes_to_samples(bytes);
    let out_len = (samples.len() as f64 / factor as f64).floor() as usize;
    let stretched: Vec<i16> = (0..out_len)
        .map(|i| {
            let idx = ((i as f64) * factor as f64) as usize;
            samples[idx.min(samples.len() - 1)]
        })
        .collect();
    samples_to_bytes(&stretched)
}

/// Byte length of `ms` milliseconds of audio.
pub fn chunk_size_for(ms: u32, sample_rate: u32, bytes_per_sample: usize) -> usize {
    ((sample_rate as u64 * ms as u64 / 1000) as usize * bytes_per_sample).max(1)
}

/// Fixed-size frames over a borrowed buffer. Cloning restarts the sequence.
#[derive(Debug, Clone)]
pub struct AudioChunks<'a> {
    buf: &'a [u8],
    chunk_size: usize,
}

impl<'a> Iterator for AudioChunks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        let take = self.chunk_size.min(self.buf.len());
        let (head, tail) = self.buf.split_at(take);
        self.buf = tail;
        Some(head)
    }
}

/// Split outbound audio into playback frames; the final frame may be short.
pub fn chunk_audio(bytes: &[u8], chunk_size: usize) -> AudioChunks<'_> {
    AudioChunks {
        buf: bytes,
        chunk_size: chunk_size.max(1),
    }
}

/// Audio received from the voice AI, normalised to mono linear16.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceAudio {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
}

/// Decode a voice-AI `audio_output` payload.
///
/// The provider sends WAV containers; anything without a RIFF header is taken
/// as raw linear16 at `fallback_rate`.
pub fn decode_voice_audio(bytes: &[u8], fallback_rate: u32) -> Result<VoiceAudio, CodecError> {
    if !bytes.starts_with(b"RIFF") {
        return Ok(VoiceAudio {
            pcm: bytes[..bytes.len() - bytes.len() % LINEAR16_BYTES].to_vec(),
            sample_rate: fallback_rate,
        });
    }

    let reader = hound::WavReader::new(Cursor::new(bytes)).map_err(|e| CodecError::Wav(e.to_string()))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader.into_samples::<i16>().filter_map(|s| s.ok()).collect(),
        (hound::SampleFormat::Float, 32) => reader
            .into_samples::<f32>()
            .filter_map(|s| s.ok())
            .map(|s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
            .collect(),
        (format, bits) => {
            return Err(CodecError::Unsupported(format!("{format:?} {bits}-bit")));
        }
    };

    // Downmix to mono
    let mono: Vec<i16> = if channels > 1 {
        samples
            .chunks(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / frame.len() as i32) as i16
            })
            .collect()
    } else {
        samples
    };

    Ok(VoiceAudio {
        pcm: samples_to_bytes(&mono),
        sample_rate: spec.sample_rate,
    })
}

fn expected_len(input_bytes: usize, src_rate: u32, dst_rate: u32) -> usize {
    if src_rate == 0 {
        return input_bytes;
    }
    (input_bytes as u64 * dst_rate as u64 / src_rate as u64) as usize
}
