//! Flip-avoiding line search.
//!
//! The step towards the global step's candidate is first capped so that no element reaches zero
//! signed area (or volume), then halved until the energy decreases.

use faer::Mat;
use pulp::Arch;
use rayon::prelude::*;

use crate::operators::Connectivity;

/// Fraction of the first inversion step actually taken.
const SHRINK: f64 = 0.9;

/// Result of [`flip_avoiding_line_search`].
#[derive(Clone, Debug)]
pub enum StepOutcome {
    /// A step that lowers the energy was found.
    Accepted {
        positions: Mat<f64>,
        energy: f64,
        step: f64,
    },
    /// Every trial step failed to lower the energy. Positions should not change.
    Exhausted,
}

/// Smallest strictly positive root of `a t² + b t + c`, or infinity.
pub fn smallest_positive_quadratic_root(a: f64, b: f64, c: f64) -> f64 {
    if a == 0. {
        if b != 0. && -c / b > 0. {
            return -c / b;
        }
        return f64::INFINITY;
    }
    let delta = b * b - 4. * a * c;
    if delta < 0. {
        return f64::INFINITY;
    }
    // Stable form, avoids cancellation when a is small.
    let q = -0.5 * (b + b.signum() * delta.sqrt());
    let mut best = f64::INFINITY;
    let mut candidates = [q / a, f64::INFINITY];
    if q != 0. {
        candidates[1] = c / q;
    }
    for t in candidates {
        if t > 0. && t < best {
            best = t;
        }
    }
    best
}

/// Smallest strictly positive root of `a t³ + b t² + c t + d`, or infinity.
pub fn smallest_positive_cubic_root(a: f64, b: f64, c: f64, d: f64) -> f64 {
    if a.abs() <= 1e-12 * (b.abs() + c.abs() + d.abs()) {
        return smallest_positive_quadratic_root(b, c, d);
    }
    let (b, c, d) = (b / a, c / a, d / a);
    let q = (3. * c - b * b) / 9.;
    let r = (9. * b * c - 27. * d - 2. * b * b * b) / 54.;
    let disc = q * q * q + r * r;
    let mut roots = [f64::INFINITY; 3];
    if disc > 0. {
        let s = disc.sqrt();
        roots[0] = -b / 3. + (r + s).cbrt() + (r - s).cbrt();
    } else if q == 0. {
        roots[0] = -b / 3.;
    } else {
        let theta = (r / (-q * q * q).sqrt()).clamp(-1., 1.).acos();
        let m = 2. * (-q).sqrt();
        for (k, root) in roots.iter_mut().enumerate() {
            *root = m * ((theta + 2. * std::f64::consts::PI * k as f64) / 3.).cos() - b / 3.;
        }
    }
    roots
        .into_iter()
        .filter(|&t| t > 0.)
        .fold(f64::INFINITY, f64::min)
}

fn triangle_step(positions: &Mat<f64>, delta: &Mat<f64>, e: &[usize]) -> f64 {
    let edge = |m: &Mat<f64>, i: usize| [m[(e[i], 0)] - m[(e[0], 0)], m[(e[i], 1)] - m[(e[0], 1)]];
    let (p1, p2) = (edge(positions, 1), edge(positions, 2));
    let (d1, d2) = (edge(delta, 1), edge(delta, 2));
    let c = p1[0] * p2[1] - p1[1] * p2[0];
    let b = d1[0] * p2[1] + p1[0] * d2[1] - d1[1] * p2[0] - p1[1] * d2[0];
    let a = d1[0] * d2[1] - d1[1] * d2[0];
    smallest_positive_quadratic_root(a, b, c)
}

fn triple(x: [f64; 3], y: [f64; 3], z: [f64; 3]) -> f64 {
    x[0] * (y[1] * z[2] - y[2] * z[1]) - x[1] * (y[0] * z[2] - y[2] * z[0])
        + x[2] * (y[0] * z[1] - y[1] * z[0])
}

// det(E + t D) expanded by multilinearity in the edge columns.
fn tetrahedron_step(positions: &Mat<f64>, delta: &Mat<f64>, e: &[usize]) -> f64 {
    let edge = |m: &Mat<f64>, i: usize| {
        [
            m[(e[i], 0)] - m[(e[0], 0)],
            m[(e[i], 1)] - m[(e[0], 1)],
            m[(e[i], 2)] - m[(e[0], 2)],
        ]
    };
    let (p1, p2, p3) = (edge(positions, 1), edge(positions, 2), edge(positions, 3));
    let (d1, d2, d3) = (edge(delta, 1), edge(delta, 2), edge(delta, 3));
    let a = triple(d1, d2, d3);
    let b = triple(p1, d2, d3) + triple(d1, p2, d3) + triple(d1, d2, p3);
    let c = triple(d1, p2, p3) + triple(p1, d2, p3) + triple(p1, p2, d3);
    let d = triple(p1, p2, p3);
    smallest_positive_cubic_root(a, b, c, d)
}

/// Largest `t` such that no element degenerates on the way from `positions` to
/// `positions + t · delta` (infinity if none ever does).
pub fn compute_max_step(elements: &Connectivity, positions: &Mat<f64>, delta: &Mat<f64>) -> f64 {
    let arch = Arch::new();
    arch.dispatch(|| {
        elements
            .par_iter()
            .map(|e| match e.len() {
                3 => triangle_step(positions, delta, e),
                _ => tetrahedron_step(positions, delta, e),
            })
            .reduce(|| f64::INFINITY, f64::min)
    })
}

/// Move from `current` towards `candidate` without inverting any element.
///
/// The first trial step is `min(1, 0.9 · t_max)` where `t_max` is [`compute_max_step`]; it is
/// then halved at most `max_backtracking - 1` times. The first trial whose energy is strictly
/// below `baseline` is accepted.
///
/// Arguments :
/// * `elements` : connectivity, triangles or tetrahedra
/// * `current` : current positions, one row per vertex
/// * `candidate` : positions proposed by the global step
/// * `energy` : total energy of a set of positions
/// * `baseline` : energy of `current`
pub fn flip_avoiding_line_search<F: Fn(&Mat<f64>) -> f64>(
    elements: &Connectivity,
    current: &Mat<f64>,
    candidate: &Mat<f64>,
    energy: F,
    baseline: f64,
    max_backtracking: usize,
) -> StepOutcome {
    let delta = candidate - current;
    let max_step = compute_max_step(elements, current, &delta);
    let mut t = if max_step < 1. { SHRINK * max_step } else { 1. };
    for _ in 0..max_backtracking {
        let trial = Mat::from_fn(current.nrows(), current.ncols(), |i, j| {
            current[(i, j)] + t * delta[(i, j)]
        });
        let e = energy(&trial);
        if e < baseline {
            return StepOutcome::Accepted {
                positions: trial,
                energy: e,
                step: t,
            };
        }
        t *= 0.5;
    }
    StepOutcome::Exhausted
}
