//! Global step: assembly and solution of the weighted proxy system.
//!
//! Unknowns are flattened axis by axis (`axis · #vertices + vertex`). The design matrix `A` has
//! one row per element and per entry `(a, b)` of the `d × d` weighted Jacobian, at index
//! `(a · d + b) · #elements + e`; its value on unknown `(k, v)` is `W[a][k] · D_b[e][v]`. The
//! solved system is
//!
//! ```text
//! (Aᵗ M A + p I + Σ_soft λ) x = Aᵗ M f + p x_prev + Σ_soft λ target
//! ```
//!
//! with `M` the flattened masses and `f = W · R` the weighted fit matrices. `Aᵗ M A` is never
//! formed as a product: every element contributes a dense block `m Bᵗ B` over its own unknowns,
//! and the blocks are summed into a sparsity pattern computed once.

use faer::sparse::{SparseColMat, SymbolicSparseColMat, Triplet};
use faer::Mat;
use rayon::prelude::*;

use crate::error::{Result, SLIMError};
use crate::operators::{Connectivity, DifferentialOperators};
use crate::solver::{ConjugateGradient, DirectSolver, SpdSolver};
use crate::{LinearSolver, SLIMOptions, SoftConstraint};

// 3 axes times 4 vertices for a tetrahedron.
const MAX_LOCAL: usize = 12;
const NO_CONTRIBUTION: usize = usize::MAX;

/// All `(row, col, value)` entries of a sparse matrix, column by column.
pub fn sparse_entries(m: &SparseColMat<usize, f64>) -> Vec<(usize, usize, f64)> {
    let symbolic = m.symbolic();
    let values = m.val();
    let mut entries = Vec::with_capacity(values.len());
    for j in 0..m.ncols() {
        let range = symbolic.col_range(j);
        for (&i, &value) in symbolic.row_idx_of_col_raw(j).iter().zip(&values[range]) {
            entries.push((i, j, value));
        }
    }
    entries
}

/// Build the design matrix `A` from the differential operators and the per-element weight
/// matrices (row-major, `d × d` per element).
pub fn design_matrix(
    operators: &[SparseColMat<usize, f64>],
    weights: &[f64],
    num_elements: usize,
    num_vertices: usize,
) -> Result<SparseColMat<usize, f64>> {
    let d = operators.len();
    let mut triplets = Vec::new();
    for (b, op) in operators.iter().enumerate() {
        for (e, v, value) in sparse_entries(op) {
            let w = &weights[e * d * d..(e + 1) * d * d];
            for a in 0..d {
                for k in 0..d {
                    triplets.push(Triplet::new(
                        (a * d + b) * num_elements + e,
                        k * num_vertices + v,
                        value * w[a * d + k],
                    ));
                }
            }
        }
    }
    SparseColMat::try_new_from_triplets(d * d * num_elements, d * num_vertices, &triplets)
        .map_err(|e| SLIMError::SparseStructure(format!("{e:?}")))
}

/// Where every element block entry lands in the value array of the system matrix.
struct SystemPattern {
    dim: usize,
    arity: usize,
    num_vertices: usize,
    // Element block entries summed into each stored value, delimited by `offsets`.
    order: Vec<usize>,
    offsets: Vec<usize>,
    // Position of each diagonal entry in the value array.
    diagonal: Vec<usize>,
}

impl SystemPattern {
    fn local_size(&self) -> usize {
        self.dim * self.arity
    }

    fn global_index(&self, vertices: &[usize], c: usize) -> usize {
        (c / self.arity) * self.num_vertices + vertices[c % self.arity]
    }
}

fn build_pattern(
    elements: &Connectivity,
    dim: usize,
) -> (SymbolicSparseColMat<usize>, SystemPattern) {
    let arity = elements.arity();
    let num_vertices = elements.num_vertices();
    let n = dim * num_vertices;
    let mut pattern = SystemPattern {
        dim,
        arity,
        num_vertices,
        order: Vec::new(),
        offsets: Vec::new(),
        diagonal: vec![0; n],
    };
    let ls = pattern.local_size();

    let mut keys = Vec::with_capacity(elements.len() * ls * ls + n);
    for (e, vertices) in elements.iter().enumerate() {
        for c1 in 0..ls {
            let row = pattern.global_index(vertices, c1);
            for c2 in 0..ls {
                let col = pattern.global_index(vertices, c2);
                keys.push(((col, row), e * ls * ls + c1 * ls + c2));
            }
        }
    }
    // The proximal term needs every diagonal entry, even for isolated vertices.
    keys.extend((0..n).map(|i| ((i, i), NO_CONTRIBUTION)));
    keys.sort_unstable();

    let mut col_ptr = vec![0_usize; n + 1];
    let mut row_idx = Vec::new();
    let mut order = Vec::with_capacity(elements.len() * ls * ls);
    let mut offsets = vec![0];
    let mut current = None;
    for ((col, row), id) in keys {
        if current != Some((col, row)) {
            if current.is_some() {
                offsets.push(order.len());
            }
            current = Some((col, row));
            if row == col {
                pattern.diagonal[col] = row_idx.len();
            }
            row_idx.push(row);
            col_ptr[col + 1] += 1;
        }
        if id != NO_CONTRIBUTION {
            order.push(id);
        }
    }
    offsets.push(order.len());
    for j in 0..n {
        col_ptr[j + 1] += col_ptr[j];
    }
    pattern.order = order;
    pattern.offsets = offsets;
    let symbolic = SymbolicSparseColMat::new_checked(n, n, col_ptr, None, row_idx);
    (symbolic, pattern)
}

/// The normal equations of the proxy, with buffers reused from one iteration to the next.
pub(crate) struct GlobalSystem {
    pattern: SystemPattern,
    matrix: SparseColMat<usize, f64>,
    rhs: Vec<f64>,
    blocks: Vec<f64>,
    block_rhs: Vec<f64>,
    solver: Box<dyn SpdSolver>,
}

impl GlobalSystem {
    pub(crate) fn new(elements: &Connectivity, options: &SLIMOptions) -> Result<Self> {
        let dim = elements.dimension();
        let (symbolic, pattern) = build_pattern(elements, dim);
        let nnz = pattern.offsets.len() - 1;
        let matrix = SparseColMat::<usize, f64>::new(symbolic, vec![0.; nnz]);
        let n = dim * elements.num_vertices();
        let solver: Box<dyn SpdSolver> = match (options.linear_solver, dim) {
            (LinearSolver::Direct, _) | (LinearSolver::Auto, 2) => {
                Box::new(DirectSolver::new(&matrix)?)
            }
            _ => Box::new(ConjugateGradient {
                tolerance: options.cg_tolerance,
                max_iterations: options
                    .cg_max_iterations
                    .unwrap_or_else(|| (2 * n).max(1000)),
            }),
        };
        let ls = pattern.local_size();
        Ok(Self {
            matrix,
            rhs: vec![0.; n],
            blocks: vec![0.; elements.len() * ls * ls],
            block_rhs: vec![0.; elements.len() * ls],
            pattern,
            solver,
        })
    }

    #[cfg(test)]
    pub(crate) fn matrix(&self) -> &SparseColMat<usize, f64> {
        &self.matrix
    }

    #[cfg(test)]
    pub(crate) fn rhs(&self) -> &[f64] {
        &self.rhs
    }

    /// Rebuild matrix and right hand side from the current weights and fit matrices.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        &mut self,
        operators: &DifferentialOperators,
        elements: &Connectivity,
        weights: &[f64],
        fits: &[f64],
        channel_masses: &[f64],
        positions: &Mat<f64>,
        proximal_penalty: f64,
        soft_constraints: &[SoftConstraint],
        soft_penalty: f64,
    ) {
        let d = self.pattern.dim;
        let arity = self.pattern.arity;
        let nv = self.pattern.num_vertices;
        let ne = elements.len();
        let ls = self.pattern.local_size();

        self.blocks
            .par_chunks_exact_mut(ls * ls)
            .zip(self.block_rhs.par_chunks_exact_mut(ls))
            .zip(operators.par_elements())
            .zip(weights.par_chunks_exact(d * d))
            .zip(fits.par_chunks_exact(d * d))
            .enumerate()
            .for_each(|(e, ((((block, block_rhs), g), w), r))| {
                block.fill(0.);
                block_rhs.fill(0.);
                for a in 0..d {
                    for b in 0..d {
                        let row = a * d + b;
                        let m = channel_masses[row * ne + e];
                        // Row of A on the element unknowns, and its target (W R)[a][b].
                        let mut coeffs = [0.; MAX_LOCAL];
                        for k in 0..d {
                            for i in 0..arity {
                                coeffs[k * arity + i] = w[a * d + k] * g[b * arity + i];
                            }
                        }
                        let target: f64 = (0..d).map(|k| w[a * d + k] * r[k * d + b]).sum();
                        for c1 in 0..ls {
                            block_rhs[c1] += m * coeffs[c1] * target;
                            for c2 in 0..ls {
                                block[c1 * ls + c2] += m * coeffs[c1] * coeffs[c2];
                            }
                        }
                    }
                }
            });

        let blocks = &self.blocks;
        let order = &self.pattern.order;
        self.matrix
            .val_mut()
            .par_iter_mut()
            .zip(self.pattern.offsets.par_windows(2))
            .for_each(|(value, range)| {
                *value = order[range[0]..range[1]].iter().map(|&i| blocks[i]).sum();
            });

        self.rhs.fill(0.);
        for (e, vertices) in elements.iter().enumerate() {
            for c in 0..ls {
                self.rhs[self.pattern.global_index(vertices, c)] += self.block_rhs[e * ls + c];
            }
        }

        let values = self.matrix.val_mut();
        for k in 0..d {
            for v in 0..nv {
                values[self.pattern.diagonal[k * nv + v]] += proximal_penalty;
                self.rhs[k * nv + v] += proximal_penalty * positions[(v, k)];
            }
        }
        for constraint in soft_constraints {
            for (k, target) in constraint.target.iter().enumerate() {
                let i = k * nv + constraint.vertex;
                values[self.pattern.diagonal[i]] += soft_penalty;
                self.rhs[i] += soft_penalty * target;
            }
        }
    }

    /// Solve the assembled system, starting iterative solvers from `positions`.
    pub(crate) fn solve(&mut self, positions: &Mat<f64>) -> Result<Mat<f64>> {
        let d = self.pattern.dim;
        let nv = self.pattern.num_vertices;
        let guess: Vec<f64> = (0..d)
            .flat_map(|k| (0..nv).map(move |v| positions[(v, k)]))
            .collect();
        let mut solution = self.rhs.clone();
        self.solver.solve(&self.matrix, &mut solution, &guess)?;
        if solution.iter().any(|x| !x.is_finite()) {
            return Err(SLIMError::NonFiniteSolution);
        }
        Ok(Mat::from_fn(nv, d, |v, k| solution[k * nv + v]))
    }
}
