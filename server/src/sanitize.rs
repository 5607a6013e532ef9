//! Repair of raw embedding vectors.
//!
//! Every input, however malformed, is turned into a finite unit vector of
//! exactly the target dimension so a cosine-similarity consumer never sees
//! NaN, infinities, zero vectors or a dimension mismatch. Substitutions are
//! reported through [`Outcome::Degraded`].

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Outcome;
use crate::vector::{l2_norm, UNIT_TOLERANCE};

/// Half-width of the uniform range used for substitute vectors.
pub const FALLBACK_AMPLITUDE: f64 = 0.01;
/// Norms at or below this are treated as zero.
pub const NORM_EPSILON: f64 = 1e-10;

/// A finite, unit-norm vector of the embedder's configured dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmbeddingVector(Vec<f32>);

impl EmbeddingVector {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.0)
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }
}

/// Repairs `raw` into a unit vector of `target_dim` components.
pub fn sanitize(raw: Option<&[f64]>, target_dim: usize) -> EmbeddingVector {
    sanitize_outcome(raw, target_dim).into_value()
}

/// Same as [`sanitize`], reporting what had to be repaired.
pub fn sanitize_outcome(raw: Option<&[f64]>, target_dim: usize) -> Outcome<EmbeddingVector> {
    if target_dim == 0 {
        return Outcome::degraded(EmbeddingVector(Vec::new()), "target dimension is zero");
    }

    let mut reasons: Vec<String> = Vec::new();
    let mut values = match raw {
        None => {
            reasons.push("missing vector".to_string());
            random_vector(target_dim)
        }
        Some(r) if r.iter().any(|x| !x.is_finite()) => {
            reasons.push("non-finite component".to_string());
            random_vector(target_dim)
        }
        Some(r) => {
            if r.len() != target_dim {
                reasons.push(format!("dimension {} resized to {}", r.len(), target_dim));
            }
            let mut v = r.to_vec();
            v.resize(target_dim, 0.0);
            v
        }
    };

    let mut norm = scaled_norm(&values);
    if !(norm > NORM_EPSILON) {
        reasons.push("zero norm".to_string());
        values = random_vector(target_dim);
        norm = scaled_norm(&values);
    }

    let mut out: Vec<f32> = if norm > 0.0 {
        values.iter().map(|x| (x / norm) as f32).collect()
    } else {
        values.iter().map(|&x| x as f32).collect()
    };

    let final_norm = l2_norm(&out);
    if !final_norm.is_finite() || (final_norm - 1.0).abs() > UNIT_TOLERANCE {
        if final_norm.is_finite() && final_norm > 0.0 {
            out.iter_mut().for_each(|x| *x /= final_norm);
        } else {
            reasons.push("fell back to basis vector".to_string());
            out = basis_vector(target_dim);
        }
    }
    if out.iter().any(|x| !x.is_finite()) {
        reasons.push("fell back to basis vector".to_string());
        out = basis_vector(target_dim);
    }

    let vector = EmbeddingVector(out);
    if reasons.is_empty() {
        Outcome::Ok(vector)
    } else {
        Outcome::Degraded(vector, reasons.join("; "))
    }
}

/// Substitute vector: a normalized draw of small uniform values.
pub fn fallback_vector(target_dim: usize) -> EmbeddingVector {
    sanitize(None, target_dim)
}

fn random_vector(dim: usize) -> Vec<f64> {
    let mut rng = rand::thread_rng();
    (0..dim).map(|_| rng.gen_range(-FALLBACK_AMPLITUDE..=FALLBACK_AMPLITUDE)).collect()
}

fn basis_vector(dim: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dim];
    if let Some(first) = v.first_mut() {
        *first = 1.0;
    }
    v
}

// Scales by the largest magnitude first so huge components don't overflow.
fn scaled_norm(v: &[f64]) -> f64 {
    let scale = v.iter().fold(0.0f64, |m, x| m.max(x.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return scale;
    }
    scale * v.iter().map(|x| (x / scale) * (x / scale)).sum::<f64>().sqrt()
}
