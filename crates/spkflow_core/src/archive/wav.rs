//! RIFF/WAVE blobs embedded in archive streams.
//!
//! Only mono integer PCM at 16 or 32 bits is produced or accepted.
//! The RIFF size field makes the blob self-delimiting inside a stream.

use std::io::Cursor;

use super::error::{FormatError, FormatResult};
use super::types::{AudioBlob, SampleScaling};

/// Bytes in front of the `data` payload of a canonical header.
const HEADER_LEN: usize = 44;

/// Encode an audio blob as a complete RIFF/WAVE file image.
pub fn encode(key: &str, blob: &AudioBlob) -> FormatResult<Vec<u8>> {
    let bytes_per_sample: u32 = match blob.bits_per_sample {
        16 => 2,
        32 => 4,
        other => {
            return Err(FormatError::bad_audio(
                key,
                format!("unsupported bit depth {}", other),
            ))
        }
    };
    if blob.sample_rate == 0 {
        return Err(FormatError::bad_audio(key, "sample rate is zero"));
    }
    // The header carries sample_rate * block_align as a u32.
    blob.sample_rate
        .checked_mul(bytes_per_sample)
        .ok_or_else(|| FormatError::bad_audio(key, "sample rate too large"))?;

    let data_len = blob
        .samples
        .len()
        .checked_mul(bytes_per_sample as usize)
        .and_then(|n| u32::try_from(n).ok())
        .filter(|n| n.checked_add(HEADER_LEN as u32).is_some())
        .ok_or_else(|| FormatError::bad_audio(key, "too many samples for a RIFF file"))?;

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: blob.sample_rate,
        bits_per_sample: blob.bits_per_sample,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(HEADER_LEN + data_len as usize));
    let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(|e| audio_error(key, e))?;

    let full_scale = full_scale(blob.bits_per_sample);
    for &sample in &blob.samples {
        let value = match blob.scaling {
            SampleScaling::FullScale => sample.clamp(-1.0, 1.0) * full_scale,
            SampleScaling::Verbatim => sample,
        };
        let value = value.round().clamp(-full_scale - 1.0, full_scale);
        let written = if blob.bits_per_sample == 16 {
            writer.write_sample(value as i16)
        } else {
            writer.write_sample(value as i32)
        };
        written.map_err(|e| audio_error(key, e))?;
    }
    writer.finalize().map_err(|e| audio_error(key, e))?;

    Ok(cursor.into_inner())
}

/// Decode a complete RIFF/WAVE image, starting at the `RIFF` tag.
///
/// Decoded samples are in integer units, so the blob comes back as
/// [`SampleScaling::Verbatim`].
pub fn decode(key: &str, riff: &[u8]) -> FormatResult<AudioBlob> {
    let mut reader = hound::WavReader::new(Cursor::new(riff)).map_err(|e| audio_error(key, e))?;
    let spec = reader.spec();

    if spec.sample_format != hound::SampleFormat::Int {
        return Err(FormatError::bad_audio(key, "samples are not integer PCM"));
    }
    if spec.channels != 1 {
        return Err(FormatError::bad_audio(
            key,
            format!("{} channels, only mono is supported", spec.channels),
        ));
    }
    if spec.bits_per_sample != 16 && spec.bits_per_sample != 32 {
        return Err(FormatError::bad_audio(
            key,
            format!("unsupported bit depth {}", spec.bits_per_sample),
        ));
    }

    let samples = reader
        .samples::<i32>()
        .map(|s| s.map(f64::from))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| audio_error(key, e))?;

    Ok(AudioBlob {
        samples,
        sample_rate: spec.sample_rate,
        bits_per_sample: spec.bits_per_sample,
        scaling: SampleScaling::Verbatim,
    })
}

fn audio_error(key: &str, err: hound::Error) -> FormatError {
    FormatError::bad_audio(key, err.to_string())
}

fn full_scale(bits: u16) -> f64 {
    if bits == 16 {
        f64::from(i16::MAX)
    } else {
        f64::from(i32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32_at(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn sixteen_bit_header_is_canonical() {
        let blob = AudioBlob::new(vec![0.0, 1.0, -1.0], 16000);
        let bytes = encode("abc", &blob).unwrap();

        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(u32_at(&bytes, 4), 36 + 6);
        assert_eq!(&bytes[8..16], b"WAVEfmt ");
        assert_eq!(u32_at(&bytes, 24), 16000);
        assert_eq!(u32_at(&bytes, 28), 32000);
        assert_eq!(&bytes[36..40], b"data");
        assert_eq!(bytes.len(), HEADER_LEN + 6);
    }

    #[test]
    fn riff_size_delimits_the_image() {
        let blob = AudioBlob::new(vec![1.0; 7], 8000).with_bits(32);
        let bytes = encode("abc", &blob).unwrap();
        assert_eq!(u32_at(&bytes, 4) as usize + 8, bytes.len());
    }

    #[test]
    fn full_scale_maps_unit_range_onto_int16() {
        let blob = AudioBlob::full_scale(vec![1.0, -1.0, 0.5, 2.0], 8000);
        let bytes = encode("abc", &blob).unwrap();
        let decoded = decode("abc", &bytes).unwrap();

        assert_eq!(decoded.samples, vec![32767.0, -32767.0, 16384.0, 32767.0]);
        assert_eq!(decoded.scaling, SampleScaling::Verbatim);
    }

    #[test]
    fn verbatim_rounds_and_clamps() {
        let blob = AudioBlob::new(vec![12.4, -7.6, 40000.0, -40000.0], 8000);
        let bytes = encode("abc", &blob).unwrap();
        let decoded = decode("abc", &bytes).unwrap();

        assert_eq!(decoded.samples, vec![12.0, -8.0, 32767.0, -32768.0]);
    }

    #[test]
    fn thirty_two_bit_survives() {
        let blob = AudioBlob::new(vec![100000.0, -5.0], 44100).with_bits(32);
        let bytes = encode("abc", &blob).unwrap();
        let decoded = decode("abc", &bytes).unwrap();

        assert_eq!(decoded.bits_per_sample, 32);
        assert_eq!(decoded.sample_rate, 44100);
        assert_eq!(decoded.samples, vec![100000.0, -5.0]);
    }

    #[test]
    fn rejects_unsupported_depth() {
        let blob = AudioBlob::new(vec![0.0], 8000).with_bits(24);
        assert!(matches!(
            encode("abc", &blob),
            Err(FormatError::BadAudio { .. })
        ));
    }

    #[test]
    fn huge_sample_rate_is_rejected() {
        let blob = AudioBlob::new(vec![0.0], 2_000_000_000).with_bits(32);
        let err = encode("k", &blob).unwrap_err();
        assert!(matches!(
            err,
            FormatError::BadAudio { ref detail, .. } if detail == "sample rate too large"
        ));
    }

    #[test]
    fn rejects_stereo() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        writer.write_sample(1i16).unwrap();
        writer.write_sample(2i16).unwrap();
        writer.finalize().unwrap();

        assert!(matches!(
            decode("abc", &cursor.into_inner()),
            Err(FormatError::BadAudio { .. })
        ));
    }

    #[test]
    fn garbage_is_bad_audio() {
        assert!(matches!(
            decode("abc", b"RIFF\x04\x00\x00\x00JUNK"),
            Err(FormatError::BadAudio { .. })
        ));
    }

    #[test]
    fn skips_unknown_chunks() {
        let blob = AudioBlob::new(vec![3.0, 4.0], 8000);
        let bytes = encode("abc", &blob).unwrap();

        // RIFF header, then a LIST chunk ahead of the original fmt/data chunks.
        let mut riff = b"RIFF".to_vec();
        riff.extend_from_slice(&(u32_at(&bytes, 4) + 12).to_le_bytes());
        riff.extend_from_slice(b"WAVE");
        riff.extend_from_slice(b"LIST");
        riff.extend_from_slice(&4u32.to_le_bytes());
        riff.extend_from_slice(&[1, 2, 3, 4]);
        riff.extend_from_slice(&bytes[12..]);

        let decoded = decode("abc", &riff).unwrap();
        assert_eq!(decoded.samples, vec![3.0, 4.0]);
    }
}
