//! Metric kernel (C1).
//!
//! Distance functions shared by every index adapter and by cosine
//! similarity used in the embedding cache and router. All vectors passed
//! to a cosine index must already be pre-normalised by the caller — no
//! adapter renormalises on a caller's behalf.

use serde::{Deserialize, Serialize};

/// Distance metric selectable per embedding model / shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cosine,
    L2,
    Dot,
    Manhattan,
}

impl Default for Metric {
    fn default() -> Self {
        Metric::Cosine
    }
}

/// Squared L2 distance, i.e. the sum of squared component differences.
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum::<f32>().sqrt()
}

/// Manhattan (L1) distance.
pub fn manhattan_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum()
}

/// Dot product.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine distance: `1 - cos(theta)`, in `[0, 2]`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let denom = norm(a) * norm(b);
    if denom < f32::EPSILON {
        return 1.0;
    }
    1.0 - (dot(a, b) / denom)
}

/// Compute the raw distance for a metric.
pub fn distance(metric: Metric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        Metric::Cosine => cosine_distance(a, b),
        Metric::L2 => l2_distance(a, b),
        Metric::Dot => -dot(a, b),
        Metric::Manhattan => manhattan_distance(a, b),
    }
}

/// Map a raw distance to a similarity in `[0, 1]` where `1.0` is most
/// similar, per §4.1:
///
/// - cosine: `1 - d/2`
/// - dot:    `-d`        (distance is already `-dot`, so similarity is `dot`)
/// - L2:     `1/(1+d)`
/// - manhattan: `1/(1+d)`
pub fn distance_to_similarity(metric: Metric, d: f32) -> f32 {
    let sim = match metric {
        Metric::Cosine => 1.0 - d / 2.0,
        Metric::Dot => -d,
        Metric::L2 => 1.0 / (1.0 + d),
        Metric::Manhattan => 1.0 / (1.0 + d),
    };
    sim.clamp(0.0, 1.0)
}

/// Euclidean norm. Returns `0.0` for the zero vector.
pub fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Normalise a vector to unit length in place. Zero-norm vectors are
/// clamped to the zero vector rather than producing NaNs.
pub fn normalize(v: &mut [f32]) {
    let n = norm(v);
    if n < f32::EPSILON {
        for x in v.iter_mut() {
            *x = 0.0;
        }
        return;
    }
    for x in v.iter_mut() {
        *x /= n;
    }
}

/// Return a normalised copy of `v`.
pub fn normalized(v: &[f32]) -> Vec<f32> {
    let mut out = v.to_vec();
    normalize(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical_is_similarity_one() {
        let v = vec![1.0, 2.0, 3.0];
        let d = cosine_distance(&v, &v);
        let sim = distance_to_similarity(Metric::Cosine, d);
        assert!((sim - 1.0).abs() < 1e-5);
    }

    #[test]
    fn cosine_orthogonal_is_similarity_half() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        let d = cosine_distance(&a, &b);
        let sim = distance_to_similarity(Metric::Cosine, d);
        assert!((sim - 0.5).abs() < 1e-5);
    }

    #[test]
    fn zero_norm_clamped_to_zero_vector() {
        let mut v = vec![0.0, 0.0, 0.0];
        normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn normalize_produces_unit_length() {
        let v = normalized(&[3.0, 4.0]);
        assert!((norm(&v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn similarity_always_in_unit_range() {
        let cases: Vec<(Metric, f32)> = vec![
            (Metric::Cosine, 0.0),
            (Metric::Cosine, 2.0),
            (Metric::L2, 0.0),
            (Metric::L2, 1000.0),
            (Metric::Dot, -1.0),
            (Metric::Manhattan, 50.0),
        ];
        for (m, d) in cases {
            let s = distance_to_similarity(m, d);
            assert!((0.0..=1.0).contains(&s), "{:?} {} -> {}", m, d, s);
        }
    }
}
