//! Dense solvers for the small normal-equation systems of the fitter.
//!
//! Gaussian elimination with partial pivoting, and Gauss-Jordan inversion for
//! the curvature matrix. Works for small fixed-size systems (N <= 6).

/// Pivots below this magnitude mark the matrix singular.
const SINGULAR_PIVOT: f64 = 1e-14;

/// Solve `a · x = b`. Returns `None` if the matrix is singular.
#[inline]
#[allow(clippy::needless_range_loop)]
pub fn solve<const N: usize>(a: &[[f64; N]; N], b: &[f64; N]) -> Option<[f64; N]> {
    let mut matrix = *a;
    let mut rhs = *b;

    for col in 0..N {
        let pivot = find_pivot(&matrix, col)?;
        if pivot != col {
            matrix.swap(col, pivot);
            rhs.swap(col, pivot);
        }

        for row in (col + 1)..N {
            let factor = matrix[row][col] / matrix[col][col];
            let pivot_row = matrix[col];
            for (j, m) in matrix[row].iter_mut().enumerate().skip(col) {
                *m -= factor * pivot_row[j];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0f64; N];
    for i in (0..N).rev() {
        let mut sum = rhs[i];
        for (j, &xj) in x.iter().enumerate().skip(i + 1) {
            sum -= matrix[i][j] * xj;
        }
        x[i] = sum / matrix[i][i];
    }

    Some(x)
}

/// Inverse of `a`. Returns `None` if the matrix is singular.
#[allow(clippy::needless_range_loop)]
pub fn invert<const N: usize>(a: &[[f64; N]; N]) -> Option<[[f64; N]; N]> {
    let mut matrix = *a;
    let mut inverse = [[0.0f64; N]; N];
    for (i, row) in inverse.iter_mut().enumerate() {
        row[i] = 1.0;
    }

    for col in 0..N {
        let pivot = find_pivot(&matrix, col)?;
        if pivot != col {
            matrix.swap(col, pivot);
            inverse.swap(col, pivot);
        }

        let scale = 1.0 / matrix[col][col];
        for j in 0..N {
            matrix[col][j] *= scale;
            inverse[col][j] *= scale;
        }

        for row in 0..N {
            if row == col {
                continue;
            }
            let factor = matrix[row][col];
            if factor == 0.0 {
                continue;
            }
            let pivot_row = matrix[col];
            let pivot_inv = inverse[col];
            for j in 0..N {
                matrix[row][j] -= factor * pivot_row[j];
                inverse[row][j] -= factor * pivot_inv[j];
            }
        }
    }

    Some(inverse)
}

/// Row of the largest magnitude entry in `col` at or below the diagonal.
#[inline]
fn find_pivot<const N: usize>(matrix: &[[f64; N]; N], col: usize) -> Option<usize> {
    let mut max_row = col;
    let mut max_val = matrix[col][col].abs();
    for (row, values) in matrix.iter().enumerate().skip(col + 1) {
        if values[col].abs() > max_val {
            max_val = values[col].abs();
            max_row = row;
        }
    }

    if max_val.is_nan() || max_val < SINGULAR_PIVOT {
        return None;
    }
    Some(max_row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solve_5x5_identity() {
        let mut a = [[0.0; 5]; 5];
        for (i, row) in a.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        let b = [1.0, 2.0, 3.0, 4.0, 5.0];

        let x = solve(&a, &b).unwrap();
        for i in 0..5 {
            assert!((x[i] - b[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_solve_5x5_diagonal() {
        let mut a = [[0.0; 5]; 5];
        for (i, row) in a.iter_mut().enumerate() {
            row[i] = (i + 2) as f64;
        }
        let b = [2.0, 6.0, 12.0, 20.0, 30.0];

        let x = solve(&a, &b).unwrap();
        for (i, xi) in x.iter().enumerate() {
            assert!((xi - (i + 1) as f64).abs() < 1e-12);
        }
    }

    #[test]
    fn test_solve_singular_returns_none() {
        let a = [[0.0; 6]; 6];
        let b = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert!(solve(&a, &b).is_none());
        assert!(invert(&a).is_none());
    }

    #[test]
    fn test_solve_6x6_needs_pivoting() {
        let a = [
            [0.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
        ];
        let b = [2.0, 1.0, 3.0, 4.0, 5.0, 6.0];

        let x = solve(&a, &b).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-12);
        assert!((x[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_solve_nan_returns_none() {
        let a = [[f64::NAN, 0.0], [0.0, 1.0]];
        assert!(solve(&a, &[1.0, 1.0]).is_none());
    }

    #[test]
    fn test_invert_symmetric_positive_definite() {
        let a = [[4.0, 1.0, 0.5], [1.0, 3.0, 0.25], [0.5, 0.25, 2.0]];
        let inv = invert(&a).unwrap();

        for i in 0..3 {
            for j in 0..3 {
                let product: f64 = (0..3).map(|k| a[i][k] * inv[k][j]).sum();
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((product - expected).abs() < 1e-12, "({i}, {j}) = {product}");
            }
        }
        // Inverse of a symmetric matrix is symmetric.
        assert!((inv[0][1] - inv[1][0]).abs() < 1e-12);
    }

    #[test]
    fn test_invert_needs_pivoting() {
        let a = [[0.0, 2.0], [4.0, 0.0]];
        let inv = invert(&a).unwrap();
        assert!((inv[0][1] - 0.25).abs() < 1e-12);
        assert!((inv[1][0] - 0.5).abs() < 1e-12);
        assert_eq!(inv[0][0], 0.0);
    }
}
