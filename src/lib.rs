//! Rust implementation of
//! ["Scalable Locally Injective Mappings"](https://igl.ethz.ch/projects/slim/) (SLIM), computing
//! parameterizations of triangle meshes and deformations of tetrahedral meshes that never invert
//! an element.
//!
//! Every iteration alternates a local step (per element singular value decomposition, proxy
//! weights and fit matrices), a global step (a sparse weighted least squares system), and a
//! flip-avoiding line search on the true distortion energy. Triangle meshes are mapped to the
//! plane, tetrahedral meshes to space.
//!
//! Vertex positions given to the solver are always 3d; a flat input simply uses `z = 0`. The
//! initial guess must not invert any element, as the solver keeps it that way.
//!
//! Can be used the following way:
//! ```
//! use faer::Mat;
//! use slim_rs::{EnergyKind, SLIMOptions, SLIM};
//!
//! // Unit square made of two triangles, with a stretched corner.
//! let rest = [[0., 0., 0.], [1., 0., 0.], [1., 1., 0.], [0., 1., 0.]];
//! let triangles = [[0, 1, 2], [0, 2, 3]];
//! let initial = Mat::from_fn(4, 2, |i, j| [[0., 0.], [1., 0.], [1.2, 1.1], [0., 1.]][i][j]);
//! let options = SLIMOptions {
//!     energy: EnergyKind::SymmetricDirichlet,
//!     ..Default::default()
//! };
//! let mut slim = SLIM::new(&rest, &triangles, initial, vec![], options)?;
//! let start = {
//!     slim.precompute()?;
//!     slim.energy()
//! };
//! let report = slim.solve(10)?;
//! assert!(report.energy <= start);
//! // `slim.positions()` now holds the improved parameterization.
//! # Ok::<(), slim_rs::SLIMError>(())
//! ```
use faer::sparse::SparseColMat;
use faer::Mat;
use log::{debug, info, warn};
use pulp::Arch;
use rayon::prelude::*;

pub mod decomp;
pub mod energy;
pub mod error;
pub mod global;
pub mod local;
pub mod operators;
pub mod solver;
pub mod utils;

pub use energy::EnergyKind;
pub use error::{Result, SLIMError};
pub use operators::ReferenceShape;
pub use utils::{flip_avoiding_line_search, StepOutcome};

use global::GlobalSystem;
use operators::{element_masses, Connectivity, DifferentialOperators};

/// Penalty pulling `vertex` towards `target` (one coordinate per output axis).
#[derive(Clone, Debug, PartialEq)]
pub struct SoftConstraint {
    pub vertex: usize,
    pub target: Vec<f64>,
}

/// Linear solver used by the global step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LinearSolver {
    /// Sparse Cholesky for triangle meshes, conjugate gradient for tetrahedral meshes.
    #[default]
    Auto,
    /// Sparse Cholesky, the symbolic factorization is computed once.
    Direct,
    /// Jacobi preconditioned conjugate gradient, started from the current positions.
    ConjugateGradient,
}

/// User values for the SLIM solver
#[derive(Clone, Debug)]
pub struct SLIMOptions {
    /// Distortion energy to minimize
    pub energy: EnergyKind,
    /// Factor `k` of the exponential energies `exp(k · E)`
    pub exp_factor: f64,
    /// Weight shared by all soft constraints
    pub soft_penalty: f64,
    /// Weight of the term keeping the global step close to the current positions. Keeps the
    /// system positive definite, must be positive.
    pub proximal_penalty: f64,
    /// Shape distortion is measured against
    pub reference: ReferenceShape,
    pub linear_solver: LinearSolver,
    /// Relative residual at which the conjugate gradient stops
    pub cg_tolerance: f64,
    /// Iteration cap of the conjugate gradient, `max(2n, 1000)` for `n` unknowns by default
    pub cg_max_iterations: Option<usize>,
    /// Number of trial steps of the line search
    pub max_backtracking: usize,
}

impl Default for SLIMOptions {
    fn default() -> Self {
        SLIMOptions {
            energy: EnergyKind::SymmetricDirichlet,
            exp_factor: 1.,
            soft_penalty: 1e5,
            proximal_penalty: 1e-4,
            reference: ReferenceShape::Rest,
            linear_solver: LinearSolver::Auto,
            cg_tolerance: 1e-8,
            cg_max_iterations: None,
            max_backtracking: 10,
        }
    }
}

impl SLIMOptions {
    fn validate(&self) -> Result<()> {
        if !(self.exp_factor.is_finite() && self.exp_factor > 0.) {
            return Err(SLIMError::invalid_param("exp_factor", self.exp_factor, "must be positive"));
        }
        check_soft_penalty(self.soft_penalty)?;
        if !(self.proximal_penalty.is_finite() && self.proximal_penalty > 0.) {
            return Err(SLIMError::invalid_param(
                "proximal_penalty",
                self.proximal_penalty,
                "must be positive",
            ));
        }
        if !(self.cg_tolerance.is_finite() && self.cg_tolerance > 0.) {
            return Err(SLIMError::invalid_param(
                "cg_tolerance",
                self.cg_tolerance,
                "must be positive",
            ));
        }
        if self.max_backtracking == 0 {
            return Err(SLIMError::invalid_param(
                "max_backtracking",
                self.max_backtracking,
                "at least one trial step is needed",
            ));
        }
        Ok(())
    }
}

fn check_soft_penalty(penalty: f64) -> Result<()> {
    if !(penalty.is_finite() && penalty >= 0.) {
        return Err(SLIMError::invalid_param(
            "soft_penalty",
            penalty,
            "must be finite and non-negative",
        ));
    }
    Ok(())
}

/// Summary of [`SLIM::solve`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolveReport {
    /// Iterations run
    pub iterations: usize,
    /// Iterations where the line search found no decrease and positions were kept
    pub stalled: usize,
    /// Normalized energy at the end
    pub energy: f64,
}

/// SLIM solver. Holds the mesh, the working positions and everything reused across iterations.
///
/// Per-element matrices (Jacobians, weights, fits) are stored row-major, `d × d` per element,
/// where `d` is 2 for triangles and 3 for tetrahedra.
pub struct SLIM {
    options: SLIMOptions,
    rest: Vec<[f64; 3]>,
    elements: Connectivity,
    soft_constraints: Vec<SoftConstraint>,
    //Precomputed stuff
    operators: DifferentialOperators,
    operator_matrices: Vec<SparseColMat<usize, f64>>,
    masses: Vec<f64>,
    channel_masses: Vec<f64>,
    total_mass: f64,
    system: Option<GlobalSystem>,
    //State
    positions: Mat<f64>,
    jacobians: Vec<f64>,
    weights: Vec<f64>,
    fits: Vec<f64>,
    energy: f64,
    precomputed: bool,
}

impl SLIM {
    /// Validates the input. Nothing is precomputed yet, see [`SLIM::precompute`].
    ///
    /// Arguments :
    /// * `rest` : rest positions of the vertices
    /// * `elements` : triangles or tetrahedra, all with the same number of indices
    /// * `initial` : initial positions, `#vertices × 2` for triangles and `#vertices × 3` for
    ///   tetrahedra. No element should be inverted.
    /// * `soft_constraints` : positional targets, weighted by `options.soft_penalty`
    pub fn new<E: AsRef<[usize]>>(
        rest: &[[f64; 3]],
        elements: &[E],
        initial: Mat<f64>,
        soft_constraints: Vec<SoftConstraint>,
        options: SLIMOptions,
    ) -> Result<Self> {
        options.validate()?;
        let elements = Connectivity::new(elements, rest.len())?;
        let dim = elements.dimension();
        if initial.nrows() != rest.len() {
            return Err(SLIMError::DimensionMismatch {
                what: "initial positions rows",
                expected: rest.len(),
                found: initial.nrows(),
            });
        }
        if initial.ncols() != dim {
            return Err(SLIMError::DimensionMismatch {
                what: "initial positions columns",
                expected: dim,
                found: initial.ncols(),
            });
        }
        for c in &soft_constraints {
            if c.vertex >= rest.len() {
                return Err(SLIMError::InvalidConstraintVertex { vertex: c.vertex });
            }
            if c.target.len() != dim {
                return Err(SLIMError::DimensionMismatch {
                    what: "soft constraint target",
                    expected: dim,
                    found: c.target.len(),
                });
            }
        }
        Ok(Self {
            operators: DifferentialOperators::empty(&elements),
            options,
            rest: rest.to_vec(),
            elements,
            soft_constraints,
            operator_matrices: Vec::new(),
            masses: Vec::new(),
            channel_masses: Vec::new(),
            total_mass: 0.,
            system: None,
            positions: initial,
            jacobians: Vec::new(),
            weights: Vec::new(),
            fits: Vec::new(),
            energy: 0.,
            precomputed: false,
        })
    }

    /// Builds the operators, masses and the linear system structure, runs a first local step
    /// and evaluates the initial energy. Does nothing when already done.
    pub fn precompute(&mut self) -> Result<()> {
        if self.precomputed {
            return Ok(());
        }
        let d = self.dimension();
        let ne = self.elements.len();
        let operators =
            DifferentialOperators::build(&self.rest, &self.elements, self.options.reference)?;
        let operator_matrices = (0..d)
            .map(|axis| operators.to_sparse(&self.elements, axis))
            .collect::<Result<Vec<_>>>()?;
        let masses = element_masses(&self.rest, &self.elements);
        let system = GlobalSystem::new(&self.elements, &self.options)?;

        self.total_mass = masses.iter().sum();
        self.channel_masses = (0..d * d).flat_map(|_| masses.iter().copied()).collect();
        self.masses = masses;
        self.operators = operators;
        self.operator_matrices = operator_matrices;
        self.system = Some(system);
        self.jacobians = vec![0.; ne * d * d];
        self.weights = vec![0.; ne * d * d];
        self.fits = vec![0.; ne * d * d];
        self.precomputed = true;

        self.update_local();
        self.energy = self.compute_energy(&self.positions) / self.total_mass;
        info!(
            "precomputed {} elements over {} vertices in {}d, energy {:.6e}",
            ne,
            self.elements.num_vertices(),
            d,
            self.energy
        );
        Ok(())
    }

    fn update_local(&mut self) {
        self.operators
            .jacobians(&self.elements, &self.positions, &mut self.jacobians);
        local::update_weights_and_fits(
            self.dimension(),
            &self.jacobians,
            self.options.energy.formulas(),
            self.options.exp_factor,
            &mut self.weights,
            &mut self.fits,
        );
    }

    /// Recomputes the Jacobians, weight matrices and fit matrices from the working positions.
    pub fn local_step(&mut self) -> Result<()> {
        self.precompute()?;
        self.update_local();
        Ok(())
    }

    /// Assembles and solves the proxy system for the current weights and fit matrices. Returns
    /// the candidate positions, the working positions are left untouched.
    pub fn global_step(&mut self) -> Result<Mat<f64>> {
        self.precompute()?;
        let system = self.system.as_mut().ok_or(SLIMError::NotPrecomputed)?;
        system.assemble(
            &self.operators,
            &self.elements,
            &self.weights,
            &self.fits,
            &self.channel_masses,
            &self.positions,
            self.options.proximal_penalty,
            &self.soft_constraints,
            self.options.soft_penalty,
        );
        system.solve(&self.positions)
    }

    /// Mass weighted distortion of `positions` plus the soft constraint penalty, not normalized.
    ///
    /// Does not touch the solver state. Before [`SLIM::precompute`] only the soft constraint term
    /// is counted.
    pub fn compute_energy(&self, positions: &Mat<f64>) -> f64 {
        let d = self.dimension();
        let mut jacobians = vec![0.; self.jacobians.len()];
        self.operators
            .jacobians(&self.elements, positions, &mut jacobians);
        let formulas = self.options.energy.formulas();
        let exp_factor = self.options.exp_factor;
        let arch = Arch::new();
        let distortion: f64 = arch.dispatch(|| {
            jacobians
                .par_chunks_exact(d * d)
                .zip(self.masses.par_iter())
                .map(|(j, m)| {
                    let s = local::singular_values(d, j);
                    m * (formulas.density)(&s[..d], exp_factor)
                })
                .sum()
        });
        distortion + self.soft_constraint_energy(positions)
    }

    fn soft_constraint_energy(&self, positions: &Mat<f64>) -> f64 {
        self.soft_constraints
            .iter()
            .map(|c| {
                c.target
                    .iter()
                    .enumerate()
                    .map(|(k, t)| (t - positions[(c.vertex, k)]).powi(2))
                    .sum::<f64>()
            })
            .sum::<f64>()
            * self.options.soft_penalty
    }

    /// Runs `iterations` SLIM iterations and returns a summary.
    ///
    /// A failed linear solve aborts with the error, keeping the positions of the last completed
    /// iteration. An iteration where the line search finds no decrease leaves positions and
    /// energy unchanged and is counted in [`SolveReport::stalled`].
    pub fn solve(&mut self, iterations: usize) -> Result<SolveReport> {
        self.precompute()?;
        let mut report = SolveReport {
            iterations: 0,
            stalled: 0,
            energy: self.energy,
        };
        for iteration in 0..iterations {
            self.update_local();
            let candidate = self.global_step()?;
            let outcome = flip_avoiding_line_search(
                &self.elements,
                &self.positions,
                &candidate,
                |p| self.compute_energy(p),
                self.energy * self.total_mass,
                self.options.max_backtracking,
            );
            match outcome {
                StepOutcome::Accepted {
                    positions,
                    energy,
                    step,
                } => {
                    self.positions = positions;
                    self.energy = energy / self.total_mass;
                    debug!(
                        "iteration {}: step {:.3e}, energy {:.6e}",
                        iteration, step, self.energy
                    );
                }
                StepOutcome::Exhausted => {
                    report.stalled += 1;
                    warn!(
                        "iteration {}: no decrease along the search direction, positions kept",
                        iteration
                    );
                }
            }
            report.iterations += 1;
        }
        report.energy = self.energy;
        Ok(report)
    }

    /// Changes the weight of every soft constraint. The running energy is re-evaluated.
    pub fn set_soft_penalty(&mut self, penalty: f64) -> Result<()> {
        check_soft_penalty(penalty)?;
        self.options.soft_penalty = penalty;
        if self.precomputed {
            self.energy = self.compute_energy(&self.positions) / self.total_mass;
        }
        Ok(())
    }

    /// Explicit design matrix `A` of the global step for the current weight matrices, with
    /// `d² · #elements` rows and `d · #vertices` columns.
    pub fn design_matrix(&mut self) -> Result<SparseColMat<usize, f64>> {
        self.precompute()?;
        global::design_matrix(
            &self.operator_matrices,
            &self.weights,
            self.elements.len(),
            self.elements.num_vertices(),
        )
    }

    /// Working positions, one row per vertex.
    pub fn positions(&self) -> &Mat<f64> {
        &self.positions
    }

    pub fn into_positions(self) -> Mat<f64> {
        self.positions
    }

    /// Energy of the working positions divided by the total mass.
    pub fn energy(&self) -> f64 {
        self.energy
    }

    /// 2 for triangle meshes, 3 for tetrahedral meshes.
    pub fn dimension(&self) -> usize {
        self.elements.dimension()
    }

    pub fn options(&self) -> &SLIMOptions {
        &self.options
    }

    pub fn soft_constraints(&self) -> &[SoftConstraint] {
        &self.soft_constraints
    }

    pub fn is_precomputed(&self) -> bool {
        self.precomputed
    }

    pub fn total_mass(&self) -> f64 {
        self.total_mass
    }

    /// Area or volume of every element.
    pub fn masses(&self) -> &[f64] {
        &self.masses
    }

    fn element_matrix<'a>(&self, values: &'a [f64], e: usize) -> Option<&'a [f64]> {
        let n = self.dimension() * self.dimension();
        values.get(e * n..(e + 1) * n)
    }

    /// Weight matrix of element `e` from the last local step.
    pub fn weight_matrix(&self, e: usize) -> Option<&[f64]> {
        self.element_matrix(&self.weights, e)
    }

    /// Fit matrix (rotation or similarity) of element `e` from the last local step.
    pub fn fit_matrix(&self, e: usize) -> Option<&[f64]> {
        self.element_matrix(&self.fits, e)
    }

    /// Jacobian of element `e` from the last local step.
    pub fn jacobian(&self, e: usize) -> Option<&[f64]> {
        self.element_matrix(&self.jacobians, e)
    }

    /// Sparse `#elements × #vertices` derivative operators, one per axis.
    pub fn differential_operators(&self) -> &[SparseColMat<usize, f64>] {
        &self.operator_matrices
    }
}
