//! Distance functions and the fixed-width vector codec.
//!
//! All three metrics follow the same convention: smaller is better. Cosine
//! distance is `1 - cos_sim`, L2 is the Euclidean distance and inner product
//! is negated so that a larger dot product sorts first.
//!
//! Vectors are persisted as packed little-endian `f64` values, 8 bytes per
//! component, with no header. The dimension is known by the reader.

use crate::error::CodecError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bytes used to encode a single vector component.
pub const BYTES_PER_COMPONENT: usize = std::mem::size_of::<f64>();

/// Distance metric used by a vector index instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceType {
    /// `1 - cos(a, b)`; 1.0 when either vector has zero norm.
    #[default]
    Cosine,
    /// Euclidean distance.
    L2,
    /// Negative dot product.
    InnerProduct,
}

impl DistanceType {
    /// Computes the distance between two vectors of equal length.
    ///
    /// Callers validate dimensions beforehand; extra components of the longer
    /// slice are ignored.
    #[inline]
    pub fn distance(self, a: &[f64], b: &[f64]) -> f64 {
        match self {
            DistanceType::Cosine => cosine_distance(a, b),
            DistanceType::L2 => l2_distance(a, b),
            DistanceType::InnerProduct => -dot(a, b),
        }
    }

    /// Converts a distance into a similarity score where higher is better.
    ///
    /// Used when vector results are reported or fused alongside text scores.
    pub fn similarity(self, distance: f64) -> f64 {
        match self {
            DistanceType::Cosine => 1.0 - distance,
            DistanceType::L2 => 1.0 / (1.0 + distance),
            DistanceType::InnerProduct => -distance,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DistanceType::Cosine => "cosine",
            DistanceType::L2 => "l2",
            DistanceType::InnerProduct => "inner_product",
        }
    }
}

impl fmt::Display for DistanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(DistanceType::Cosine),
            "l2" | "euclidean" => Ok(DistanceType::L2),
            "inner_product" | "ip" | "dot" => Ok(DistanceType::InnerProduct),
            other => Err(format!("unknown distance type: {}", other)),
        }
    }
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn cosine_distance(a: &[f64], b: &[f64]) -> f64 {
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }

    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn l2_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Serializes a vector to raw bytes.
///
/// Format: little-endian f64 values packed sequentially (8 bytes per value).
/// Endianness must match [`decode_vector`].
pub fn encode_vector(vector: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * BYTES_PER_COMPONENT);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Deserializes a vector previously written by [`encode_vector`].
///
/// Fails when the byte length is not exactly `dimension * 8`.
pub fn decode_vector(bytes: &[u8], dimension: usize) -> Result<Vec<f64>, CodecError> {
    let expected = dimension * BYTES_PER_COMPONENT;
    if bytes.len() != expected {
        return Err(CodecError::InvalidLength {
            expected,
            actual: bytes.len(),
        });
    }

    Ok(bytes
        .chunks_exact(BYTES_PER_COMPONENT)
        .map(|chunk| {
            let mut buf = [0u8; BYTES_PER_COMPONENT];
            buf.copy_from_slice(chunk);
            f64::from_le_bytes(buf)
        })
        .collect())
}
