//! Element connectivity, per-element differential operators and masses.
//!
//! For every element we store the gradient of its linear hat functions in a local reference
//! frame: `d` rows (one per derivative direction) of `arity` coefficients. Applying row `b` to the
//! values of coordinate `a` at the element vertices gives the Jacobian entry `J[a][b]`.

use faer::sparse::{SparseColMat, Triplet};
use faer::Mat;
use pulp::Arch;
use rayon::prelude::*;

use crate::error::{Result, SLIMError};

/// Element indices with a fixed arity (3 for triangles, 4 for tetrahedra).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connectivity {
    arity: usize,
    num_vertices: usize,
    indices: Vec<usize>,
}

impl Connectivity {
    /// Validate and flatten `elements`, which must index into `num_vertices` vertices.
    pub fn new<E: AsRef<[usize]>>(elements: &[E], num_vertices: usize) -> Result<Self> {
        let first = elements.first().ok_or(SLIMError::EmptyMesh)?;
        let arity = first.as_ref().len();
        if arity != 3 && arity != 4 {
            return Err(SLIMError::UnsupportedArity { arity });
        }
        let mut indices = Vec::with_capacity(arity * elements.len());
        for (element, e) in elements.iter().enumerate() {
            let e = e.as_ref();
            if e.len() != arity {
                return Err(SLIMError::MixedArity {
                    element,
                    arity: e.len(),
                    expected: arity,
                });
            }
            if let Some(&vertex) = e.iter().find(|&&v| v >= num_vertices) {
                return Err(SLIMError::InvalidVertexIndex { element, vertex });
            }
            indices.extend_from_slice(e);
        }
        Ok(Self {
            arity,
            num_vertices,
            indices,
        })
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    /// 2 for triangles, 3 for tetrahedra.
    pub fn dimension(&self) -> usize {
        self.arity - 1
    }

    pub fn len(&self) -> usize {
        self.indices.len() / self.arity
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn num_vertices(&self) -> usize {
        self.num_vertices
    }

    pub fn element(&self, e: usize) -> &[usize] {
        &self.indices[e * self.arity..(e + 1) * self.arity]
    }

    pub fn iter(&self) -> std::slice::ChunksExact<'_, usize> {
        self.indices.chunks_exact(self.arity)
    }

    pub fn par_iter(&self) -> rayon::slice::ChunksExact<'_, usize> {
        self.indices.par_chunks_exact(self.arity)
    }
}

/// Shape the distortion is measured against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReferenceShape {
    /// The rest positions given to the solver.
    #[default]
    Rest,
    /// A regular triangle or tetrahedron with unit edges, whatever the rest shape. Useful to
    /// improve element quality rather than to preserve the input.
    Regular,
}

/// Per-element gradient operators.
#[derive(Clone, Debug)]
pub struct DifferentialOperators {
    dim: usize,
    arity: usize,
    num_vertices: usize,
    coefficients: Vec<f64>,
}

const REGULAR_TRIANGLE: [[f64; 3]; 3] = [
    [0., 0., 0.],
    [1., 0., 0.],
    [0.5, 0.866_025_403_784_438_6, 0.],
];

const REGULAR_TETRAHEDRON: [[f64; 3]; 4] = [
    [0., 0., 0.],
    [1., 0., 0.],
    [0.5, 0.866_025_403_784_438_6, 0.],
    [0.5, 0.288_675_134_594_812_9, 0.816_496_580_927_726],
];

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

// Triangle hat gradients in the frame (e1, e2) where e1 follows the first edge and the third
// vertex has a positive second coordinate.
fn triangle_gradient(p: [[f64; 3]; 3]) -> Option<[f64; 6]> {
    let e = sub(p[1], p[0]);
    let w = sub(p[2], p[0]);
    let x1 = dot(e, e).sqrt();
    if x1 == 0. {
        return None;
    }
    let x2 = dot(w, e) / x1;
    let y2 = dot(cross(e, w), cross(e, w)).sqrt() / x1;
    if !(y2 > f64::EPSILON * x1) {
        return None;
    }
    Some([
        -1. / x1,
        1. / x1,
        0.,
        (x2 / x1 - 1.) / y2,
        -x2 / (x1 * y2),
        1. / y2,
    ])
}

// Tetrahedron hat gradients: rows of the inverse edge matrix, plus minus their sum for the
// first vertex.
fn tetrahedron_gradient(p: [[f64; 3]; 4]) -> Option<[f64; 12]> {
    let e = na::Matrix3::from_fn(|i, j| p[j + 1][i] - p[0][i]);
    let scale = (0..3).map(|j| e.column(j).norm()).product::<f64>();
    if !(e.determinant().abs() > f64::EPSILON * scale) {
        return None;
    }
    let inv = e.try_inverse()?;
    let mut g = [0.; 12];
    for b in 0..3 {
        for i in 1..4 {
            g[b * 4 + i] = inv[(i - 1, b)];
        }
        g[b * 4] = -(inv[(0, b)] + inv[(1, b)] + inv[(2, b)]);
    }
    Some(g)
}

impl DifferentialOperators {
    /// Build the operators from the rest positions (or from regular elements).
    pub fn build(
        rest: &[[f64; 3]],
        elements: &Connectivity,
        reference: ReferenceShape,
    ) -> Result<Self> {
        let dim = elements.dimension();
        let arity = elements.arity();
        let coefficients: Vec<Option<Vec<f64>>> = elements
            .par_iter()
            .map(|e| match (arity, reference) {
                (3, ReferenceShape::Rest) => {
                    triangle_gradient([rest[e[0]], rest[e[1]], rest[e[2]]]).map(|g| g.to_vec())
                }
                (3, ReferenceShape::Regular) => {
                    triangle_gradient(REGULAR_TRIANGLE).map(|g| g.to_vec())
                }
                (_, ReferenceShape::Rest) => {
                    tetrahedron_gradient([rest[e[0]], rest[e[1]], rest[e[2]], rest[e[3]]])
                        .map(|g| g.to_vec())
                }
                (_, ReferenceShape::Regular) => {
                    tetrahedron_gradient(REGULAR_TETRAHEDRON).map(|g| g.to_vec())
                }
            })
            .collect();
        let mut flat = Vec::with_capacity(dim * arity * elements.len());
        for (element, g) in coefficients.into_iter().enumerate() {
            flat.extend(g.ok_or(SLIMError::DegenerateElement { element })?);
        }
        Ok(Self {
            dim,
            arity,
            num_vertices: elements.num_vertices(),
            coefficients: flat,
        })
    }

    // Placeholder holding no element, used before precomputation.
    pub(crate) fn empty(elements: &Connectivity) -> Self {
        Self {
            dim: elements.dimension(),
            arity: elements.arity(),
            num_vertices: elements.num_vertices(),
            coefficients: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn num_elements(&self) -> usize {
        self.coefficients.len() / (self.dim * self.arity)
    }

    /// Gradient rows of element `e`, `dimension × arity` row-major.
    pub fn element(&self, e: usize) -> &[f64] {
        let n = self.dim * self.arity;
        &self.coefficients[e * n..(e + 1) * n]
    }

    pub(crate) fn par_elements(&self) -> rayon::slice::ChunksExact<'_, f64> {
        self.coefficients.par_chunks_exact(self.dim * self.arity)
    }

    /// Sparse `#elements × #vertices` operator of the derivative along `axis`.
    pub fn to_sparse(
        &self,
        elements: &Connectivity,
        axis: usize,
    ) -> Result<SparseColMat<usize, f64>> {
        let triplets: Vec<_> = elements
            .iter()
            .enumerate()
            .flat_map(|(e, vertices)| {
                let g = &self.element(e)[axis * self.arity..(axis + 1) * self.arity];
                vertices
                    .iter()
                    .zip(g)
                    .map(move |(&v, &value)| Triplet::new(e, v, value))
            })
            .collect();
        SparseColMat::try_new_from_triplets(self.num_elements(), self.num_vertices, &triplets)
            .map_err(|e| SLIMError::SparseStructure(format!("{e:?}")))
    }

    /// Write the row-major `d × d` Jacobian of every element for `positions` into `out`.
    pub fn jacobians(&self, elements: &Connectivity, positions: &Mat<f64>, out: &mut [f64]) {
        let d = self.dim;
        let arity = self.arity;
        let arch = Arch::new();
        arch.dispatch(|| {
            out.par_chunks_exact_mut(d * d)
                .zip(elements.par_iter())
                .zip(self.par_elements())
                .for_each(|((j, vertices), g)| {
                    for a in 0..d {
                        for b in 0..d {
                            j[a * d + b] = vertices
                                .iter()
                                .zip(&g[b * arity..(b + 1) * arity])
                                .map(|(&v, c)| c * positions[(v, a)])
                                .sum();
                        }
                    }
                });
        });
    }
}

/// Area of every triangle or volume of every tetrahedron of the rest shape.
pub fn element_masses(rest: &[[f64; 3]], elements: &Connectivity) -> Vec<f64> {
    let mut masses = Vec::new();
    elements
        .par_iter()
        .map(|e| {
            if e.len() == 3 {
                let n = cross(sub(rest[e[1]], rest[e[0]]), sub(rest[e[2]], rest[e[0]]));
                0.5 * dot(n, n).sqrt()
            } else {
                let n = cross(sub(rest[e[2]], rest[e[0]]), sub(rest[e[3]], rest[e[0]]));
                dot(sub(rest[e[1]], rest[e[0]]), n).abs() / 6.
            }
        })
        .collect_into_vec(&mut masses);
    masses
}
