//! uint8 quantization of stored embeddings.
//!
//! Each vector is mapped linearly from `[min, max]` onto `[0, 255]`, so
//! `value ≈ byte * scale + offset`.

use ndarray::Array1;

#[derive(Debug, Clone, PartialEq)]
pub struct Quantized {
    pub bytes: Vec<u8>,
    pub scale: f32,
    pub offset: f32,
}

impl Quantized {
    pub fn encode(vector: &Array1<f32>) -> Self {
        let min = vector.iter().copied().fold(f32::INFINITY, f32::min);
        let max = vector.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        if vector.is_empty() || max - min < 1e-9 {
            return Self {
                bytes: vec![0; vector.len()],
                scale: 0.0,
                offset: if vector.is_empty() { 0.0 } else { min },
            };
        }

        let scale = (max - min) / 255.0;
        let bytes = vector
            .iter()
            .map(|&v| ((v - min) / scale).round().clamp(0.0, 255.0) as u8)
            .collect();
        Self {
            bytes,
            scale,
            offset: min,
        }
    }

    pub fn decode(&self) -> Array1<f32> {
        self.bytes
            .iter()
            .map(|&b| b as f32 * self.scale + self.offset)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_decode_is_close() {
        let original = array![0.1, 0.5, -0.3, 0.8, -0.1];
        let restored = Quantized::encode(&original).decode();
        for (a, b) in original.iter().zip(restored.iter()) {
            assert!((a - b).abs() < 0.01, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_constant_vector() {
        let q = Quantized::encode(&array![0.5, 0.5, 0.5]);
        assert_eq!(q.scale, 0.0);
        assert_eq!(q.decode(), array![0.5, 0.5, 0.5]);
    }
}
