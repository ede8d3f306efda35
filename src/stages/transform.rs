//! Content transformation applied by the processing stage
//!
//! The transform is a pure function artifact -> artifact that may reject
//! malformed content. Artifacts are little-endian `f32` sample arrays.

/// Why a transform rejected its input
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QcFault {
    #[error("artifact length {0} is not a whole number of samples")]
    Malformed(usize),

    #[error("sensor fault: {count} invalid samples, first at index {first_index}")]
    SensorFault { count: usize, first_index: usize },

    #[error("artifact is empty")]
    Empty,
}

/// Pure artifact transformation
pub trait Transform: Send + Sync {
    /// Processing level label recorded after a successful transform
    fn level(&self) -> &str;

    fn apply(&self, artifact: &[u8]) -> Result<Vec<u8>, QcFault>;
}

/// Size of one sample in bytes
pub const SAMPLE_SIZE: usize = 4;

/// Decode little-endian `f32` samples
pub fn decode_samples(bytes: &[u8]) -> Result<Vec<f32>, QcFault> {
    if bytes.is_empty() {
        return Err(QcFault::Empty);
    }
    if bytes.len() % SAMPLE_SIZE != 0 {
        return Err(QcFault::Malformed(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(SAMPLE_SIZE)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Encode samples as little-endian bytes
pub fn encode_samples(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Level-0 -> Level-1 radiometric scaling: every sample divided by a gain.
/// Any NaN or infinite sample is a sensor fault.
#[derive(Debug, Clone)]
pub struct RadiometricScaling {
    pub gain: f32,
}

impl Default for RadiometricScaling {
    fn default() -> Self {
        Self { gain: 255.0 }
    }
}

impl Transform for RadiometricScaling {
    fn level(&self) -> &str {
        "L1"
    }

    fn apply(&self, artifact: &[u8]) -> Result<Vec<u8>, QcFault> {
        let samples = decode_samples(artifact)?;

        let mut invalid = samples.iter().enumerate().filter(|(_, s)| !s.is_finite());
        if let Some((first_index, _)) = invalid.next() {
            return Err(QcFault::SensorFault {
                count: 1 + invalid.count(),
                first_index,
            });
        }

        let scaled: Vec<f32> = samples.iter().map(|s| s / self.gain).collect();
        Ok(encode_samples(&scaled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaling() {
        let input = encode_samples(&[255.0, 0.0, 51.0]);
        let output = RadiometricScaling::default().apply(&input).unwrap();
        assert_eq!(decode_samples(&output).unwrap(), vec![1.0, 0.0, 0.2]);
    }

    #[test]
    fn test_nan_is_sensor_fault() {
        let input = encode_samples(&[0.5, f32::NAN, 0.1, f32::NAN]);
        let err = RadiometricScaling::default().apply(&input).unwrap_err();
        assert_eq!(
            err,
            QcFault::SensorFault {
                count: 2,
                first_index: 1
            }
        );
    }

    #[test]
    fn test_ragged_length_is_malformed() {
        let err = RadiometricScaling::default().apply(&[0u8; 7]).unwrap_err();
        assert_eq!(err, QcFault::Malformed(7));
    }

    #[test]
    fn test_empty() {
        assert_eq!(
            RadiometricScaling::default().apply(&[]).unwrap_err(),
            QcFault::Empty
        );
    }

    #[test]
    fn test_unit_gain_is_identity() {
        let input = encode_samples(&[0.25, 0.75]);
        let output = RadiometricScaling { gain: 1.0 }.apply(&input).unwrap();
        assert_eq!(output, input);
    }
}
