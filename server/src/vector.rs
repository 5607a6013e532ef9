use serde::Serialize;

/// Norms within this distance of 1.0 count as unit length.
pub const UNIT_TOLERANCE: f32 = 0.01;

pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for i in 0..a.len().min(b.len()) {
        let x = a[i];
        let y = b[i];
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Quality report for a stored or freshly produced vector.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VectorReport {
    pub dimensions: usize,
    pub expected_dimensions: usize,
    pub norm: f32,
    pub non_finite: usize,
    pub is_zero: bool,
    pub is_unit: bool,
    pub issues: Vec<String>,
}

impl VectorReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Scans for the defects that break cosine similarity downstream: wrong
/// dimensionality, NaN/inf components, zero and non-unit norms.
pub fn inspect(v: &[f32], expected_dim: usize) -> VectorReport {
    let non_finite = v.iter().filter(|x| !x.is_finite()).count();
    let norm = if non_finite == 0 { l2_norm(v) } else { f32::NAN };
    let is_zero = non_finite == 0 && norm == 0.0;
    let is_unit = norm.is_finite() && (norm - 1.0).abs() <= UNIT_TOLERANCE;

    let mut issues = Vec::new();
    if v.len() != expected_dim {
        issues.push(format!("dimension {} != expected {}", v.len(), expected_dim));
    }
    if non_finite > 0 {
        issues.push(format!("{non_finite} non-finite components"));
    }
    if is_zero {
        issues.push("zero vector".to_string());
    } else if non_finite == 0 && !is_unit {
        issues.push(format!("norm {norm:.4} is not unit length"));
    }

    VectorReport { dimensions: v.len(), expected_dimensions: expected_dim, norm, non_finite, is_zero, is_unit, issues }
}
