//! Dense matrix/vector kernel for the learned transforms
//!
//! Everything here is pure and total except for the documented
//! dimension-mismatch failures, which indicate programming errors and fail
//! fast. Matrices are row-major `Vec<Vec<f32>>`; embeddings are `Vec<f32>`,
//! matching how the rest of the crate stores vectors.

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::errors::{MemoryError, Result};

/// Row-major dense matrix
pub type Matrix = Vec<Vec<f32>>;

/// Validate that a matrix is rectangular and non-empty, returning (rows, cols)
pub fn matrix_shape(m: &Matrix) -> Result<(usize, usize)> {
    if m.is_empty() || m[0].is_empty() {
        return Err(MemoryError::InvalidMatrix("matrix has zero dimension".to_string()));
    }
    let cols = m[0].len();
    if m.iter().any(|row| row.len() != cols) {
        return Err(MemoryError::InvalidMatrix("ragged rows".to_string()));
    }
    Ok((m.len(), cols))
}

/// Matrix-vector product `M·v`
pub fn matmul_vector(m: &Matrix, v: &[f32]) -> Result<Vec<f32>> {
    let (_, cols) = matrix_shape(m)?;
    if cols != v.len() {
        return Err(MemoryError::DimensionMismatch {
            expected: cols,
            actual: v.len(),
            context: "matmul_vector".to_string(),
        });
    }

    Ok(m.iter()
        .map(|row| row.iter().zip(v.iter()).map(|(a, b)| a * b).sum())
        .collect())
}

/// Matrix product `A·B`
pub fn matmul(a: &Matrix, b: &Matrix) -> Result<Matrix> {
    let (a_rows, a_cols) = matrix_shape(a)?;
    let (b_rows, b_cols) = matrix_shape(b)?;
    if a_cols != b_rows {
        return Err(MemoryError::DimensionMismatch {
            expected: a_cols,
            actual: b_rows,
            context: "matmul".to_string(),
        });
    }

    let mut out = vec![vec![0.0f32; b_cols]; a_rows];
    for i in 0..a_rows {
        for k in 0..a_cols {
            let aik = a[i][k];
            for j in 0..b_cols {
                out[i][j] += aik * b[k][j];
            }
        }
    }
    Ok(out)
}

/// Element-wise vector sum `a + b`
pub fn residual_add(a: &[f32], b: &[f32]) -> Result<Vec<f32>> {
    if a.len() != b.len() {
        return Err(MemoryError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
            context: "residual_add".to_string(),
        });
    }
    Ok(a.iter().zip(b.iter()).map(|(x, y)| x + y).collect())
}

/// Element-wise matrix sum, accumulated in place: `acc += delta`
pub fn matrix_add_assign(acc: &mut Matrix, delta: &Matrix) -> Result<()> {
    let (rows, cols) = matrix_shape(acc)?;
    let (d_rows, d_cols) = matrix_shape(delta)?;
    if rows != d_rows || cols != d_cols {
        return Err(MemoryError::DimensionMismatch {
            expected: rows * cols,
            actual: d_rows * d_cols,
            context: "matrix_add_assign".to_string(),
        });
    }
    for (acc_row, delta_row) in acc.iter_mut().zip(delta.iter()) {
        for (a, d) in acc_row.iter_mut().zip(delta_row.iter()) {
            *a += d;
        }
    }
    Ok(())
}

/// Outer product `a ⊗ b`, an `a.len() × b.len()` matrix
pub fn outer_product(a: &[f32], b: &[f32]) -> Matrix {
    a.iter()
        .map(|&x| b.iter().map(|&y| x * y).collect())
        .collect()
}

/// Zero matrix of the given shape
pub fn zero_matrix(rows: usize, cols: usize) -> Matrix {
    vec![vec![0.0f32; cols]; rows]
}

/// Matrix with each entry drawn independently from `N(mean, std²)`
pub fn initialize_matrix<R: Rng>(
    rng: &mut R,
    rows: usize,
    cols: usize,
    mean: f32,
    std: f32,
) -> Matrix {
    // std == 0 is a valid degenerate draw (constant matrix)
    let normal = Normal::new(mean, std.max(f32::EPSILON)).expect("std is finite and non-negative");
    (0..rows)
        .map(|_| (0..cols).map(|_| normal.sample(rng)).collect())
        .collect()
}

/// Frobenius norm `sqrt(Σ m_ij²)`
pub fn frobenius_norm(m: &Matrix) -> f32 {
    m.iter()
        .flat_map(|row| row.iter())
        .map(|x| x * x)
        .sum::<f32>()
        .sqrt()
}

/// Direction-preserving norm clip
///
/// If the Frobenius norm exceeds `max_norm`, every entry is scaled by
/// `max_norm / norm` so ratios between entries are unchanged; otherwise the
/// matrix is returned as-is.
pub fn clip_matrix_by_norm(m: Matrix, max_norm: f32) -> Matrix {
    let norm = frobenius_norm(&m);
    if !norm.is_finite() || norm <= max_norm || norm == 0.0 {
        return m;
    }

    let scale = max_norm / norm;
    m.into_iter()
        .map(|row| row.into_iter().map(|x| x * scale).collect())
        .collect()
}
