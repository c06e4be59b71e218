//! Symmetric positive definite sparse solvers used by the global step.

use faer::linalg::solvers::Solve;
use faer::reborrow::Reborrow;
use faer::sparse::linalg::solvers::{Llt, SymbolicLlt};
use faer::sparse::SparseColMat;
use faer::{ColMut, Side};
use log::trace;
use rayon::prelude::*;

use crate::error::{Result, SLIMError};

/// A solver for `matrix · x = rhs` where `matrix` is symmetric positive definite and keeps the
/// same sparsity pattern between calls.
pub trait SpdSolver {
    /// Overwrite `rhs` with the solution. Iterative solvers start from `guess`.
    fn solve(&self, matrix: &SparseColMat<usize, f64>, rhs: &mut [f64], guess: &[f64])
        -> Result<()>;
}

/// Sparse Cholesky factorization, with the symbolic analysis done once.
pub struct DirectSolver {
    symbolic: SymbolicLlt<usize>,
}

impl DirectSolver {
    /// Analyze the sparsity pattern of `matrix`. Its values are not read.
    pub fn new(matrix: &SparseColMat<usize, f64>) -> Result<Self> {
        let symbolic = SymbolicLlt::try_new(matrix.symbolic().rb(), Side::Lower)
            .map_err(|e| SLIMError::Factorization(format!("{e:?}")))?;
        Ok(Self { symbolic })
    }
}

impl SpdSolver for DirectSolver {
    fn solve(
        &self,
        matrix: &SparseColMat<usize, f64>,
        rhs: &mut [f64],
        _guess: &[f64],
    ) -> Result<()> {
        let llt = Llt::try_new_with_symbolic(self.symbolic.clone(), matrix.rb(), Side::Lower)
            .map_err(|e| SLIMError::Factorization(format!("{e:?}")))?;
        let x = ColMut::from_slice_mut(rhs);
        llt.solve_in_place(x.as_mat_mut());
        if rhs.iter().any(|v| !v.is_finite()) {
            return Err(SLIMError::NonFiniteSolution);
        }
        Ok(())
    }
}

/// Jacobi preconditioned conjugate gradient.
#[derive(Clone, Copy, Debug)]
pub struct ConjugateGradient {
    /// Stop once `‖b − A x‖ ≤ tolerance · ‖b‖`.
    pub tolerance: f64,
    pub max_iterations: usize,
}

// y = A x, using the symmetry of A to read columns as rows.
fn mul(matrix: &SparseColMat<usize, f64>, x: &[f64], y: &mut [f64]) {
    let symbolic = matrix.symbolic();
    let values = matrix.val();
    y.par_iter_mut().enumerate().for_each(|(j, y)| {
        *y = symbolic
            .row_idx_of_col_raw(j)
            .iter()
            .zip(&values[symbolic.col_range(j)])
            .map(|(&i, v)| v * x[i])
            .sum();
    });
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.par_iter().zip(b).map(|(a, b)| a * b).sum()
}

fn diagonal(matrix: &SparseColMat<usize, f64>) -> Vec<f64> {
    let symbolic = matrix.symbolic();
    let values = matrix.val();
    (0..matrix.ncols())
        .map(|j| {
            symbolic
                .row_idx_of_col_raw(j)
                .iter()
                .zip(&values[symbolic.col_range(j)])
                .filter(|(i, _)| **i == j)
                .map(|(_, v)| v)
                .sum()
        })
        .collect()
}

impl SpdSolver for ConjugateGradient {
    fn solve(
        &self,
        matrix: &SparseColMat<usize, f64>,
        rhs: &mut [f64],
        guess: &[f64],
    ) -> Result<()> {
        let n = rhs.len();
        let b_norm = dot(rhs, rhs).sqrt();
        if b_norm == 0. {
            rhs.fill(0.);
            return Ok(());
        }
        let inv_diag = diagonal(matrix)
            .into_iter()
            .map(|d| if d > 0. { Ok(1. / d) } else { Err(SLIMError::NotPositiveDefinite) })
            .collect::<Result<Vec<_>>>()?;

        let mut x = guess.to_vec();
        let mut r = vec![0.; n];
        mul(matrix, &x, &mut r);
        r.par_iter_mut().zip(&*rhs).for_each(|(r, b)| *r = b - *r);
        let mut z: Vec<f64> = r.iter().zip(&inv_diag).map(|(r, d)| r * d).collect();
        let mut p = z.clone();
        let mut ap = vec![0.; n];
        let mut rz = dot(&r, &z);
        let mut residual = dot(&r, &r).sqrt() / b_norm;

        for iteration in 0..self.max_iterations {
            if residual <= self.tolerance {
                trace!("conjugate gradient converged in {iteration} iterations");
                rhs.copy_from_slice(&x);
                return Ok(());
            }
            mul(matrix, &p, &mut ap);
            let p_ap = dot(&p, &ap);
            if !(p_ap > 0.) {
                return Err(SLIMError::NotPositiveDefinite);
            }
            let alpha = rz / p_ap;
            x.par_iter_mut().zip(&p).for_each(|(x, p)| *x += alpha * p);
            r.par_iter_mut().zip(&ap).for_each(|(r, ap)| *r -= alpha * ap);
            z.par_iter_mut()
                .zip(&r)
                .zip(&inv_diag)
                .for_each(|((z, r), d)| *z = r * d);
            let rz_next = dot(&r, &z);
            let beta = rz_next / rz;
            rz = rz_next;
            p.par_iter_mut().zip(&z).for_each(|(p, z)| *p = z + beta * *p);
            residual = dot(&r, &r).sqrt() / b_norm;
        }
        if residual <= self.tolerance {
            rhs.copy_from_slice(&x);
            return Ok(());
        }
        Err(SLIMError::NotConverged {
            iterations: self.max_iterations,
            residual,
        })
    }
}
