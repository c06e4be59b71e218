//! Local step: per-element proxy weights and fit matrices.

use pulp::Arch;
use rayon::prelude::*;

use crate::decomp::{compose, from_flat, write_flat, PolarSvd, Small};
use crate::energy::{singular_value_weights, EnergyFormulas, FitPolicy};

/// Weight matrix `U · diag(w) · Uᵗ` and fit matrix of a single element, both row-major.
pub fn fit_element<const D: usize>(
    jacobian: &[f64],
    formulas: &EnergyFormulas,
    exp_factor: f64,
    weight: &mut [f64],
    fit: &mut [f64],
) where
    Small<D>: PolarSvd<D>,
{
    let j: Small<D> = from_flat(jacobian);
    let polar = j.polar_svd();
    let mut w = [0.; D];
    let mut t = [0.; D];
    singular_value_weights(formulas, &polar.s, exp_factor, &mut w, &mut t);
    write_flat(&compose(&polar.u, &w, &polar.u), weight);
    match formulas.fit {
        FitPolicy::Rotation => write_flat(&polar.rotation, fit),
        FitPolicy::Projection => write_flat(&compose(&polar.u, &t, &polar.v), fit),
    }
}

/// Rewrite the weight and fit matrices of every element from its Jacobian.
pub fn update_weights_and_fits(
    dim: usize,
    jacobians: &[f64],
    formulas: &EnergyFormulas,
    exp_factor: f64,
    weights: &mut [f64],
    fits: &mut [f64],
) {
    let n = dim * dim;
    let arch = Arch::new();
    arch.dispatch(|| {
        jacobians
            .par_chunks_exact(n)
            .zip(weights.par_chunks_exact_mut(n))
            .zip(fits.par_chunks_exact_mut(n))
            .for_each(|((j, w), r)| match dim {
                2 => fit_element::<2>(j, formulas, exp_factor, w, r),
                _ => fit_element::<3>(j, formulas, exp_factor, w, r),
            });
    });
}

/// Signed singular values of one element's Jacobian.
pub fn singular_values(dim: usize, jacobian: &[f64]) -> [f64; 3] {
    match dim {
        2 => {
            let s = from_flat::<2>(jacobian).polar_svd().s;
            [s[0], s[1], 0.]
        }
        _ => from_flat::<3>(jacobian).polar_svd().s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::EnergyKind;
    use approx::assert_abs_diff_eq;

    #[test]
    fn identity_gives_identity_weights() {
        for kind in EnergyKind::ALL {
            let mut w = [0.; 4];
            let mut r = [0.; 4];
            fit_element::<2>(&[1., 0., 0., 1.], kind.formulas(), 1., &mut w, &mut r);
            for (x, y) in w.iter().zip([1., 0., 0., 1.]) {
                assert_abs_diff_eq!(*x, y, epsilon = 1e-14);
            }
            for (x, y) in r.iter().zip([1., 0., 0., 1.]) {
                assert_abs_diff_eq!(*x, y, epsilon = 1e-14);
            }

            let mut w = [0.; 9];
            let mut r = [0.; 9];
            let id = [1., 0., 0., 0., 1., 0., 0., 0., 1.];
            fit_element::<3>(&id, kind.formulas(), 1., &mut w, &mut r);
            for ((x, y), z) in w.iter().zip(r.iter()).zip(id) {
                assert_abs_diff_eq!(*x, z, epsilon = 1e-12);
                assert_abs_diff_eq!(*y, z, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn weights_are_symmetric() {
        let j = [1.3, 0.4, -0.2, 0.2, 1.1, 0.3, 0.1, -0.1, 0.9];
        let mut w = [0.; 9];
        let mut r = [0.; 9];
        fit_element::<3>(&j, EnergyKind::SymmetricDirichlet.formulas(), 1., &mut w, &mut r);
        for a in 0..3 {
            for b in 0..3 {
                assert_abs_diff_eq!(w[a * 3 + b], w[b * 3 + a], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn rotation_fit_for_scaled_rotation() {
        let (sin, cos) = 0.4_f64.sin_cos();
        let j = [2. * cos, -2. * sin, 2. * sin, 2. * cos];
        let mut w = [0.; 4];
        let mut r = [0.; 4];
        fit_element::<2>(&j, EnergyKind::Isometric.formulas(), 1., &mut w, &mut r);
        for (x, y) in r.iter().zip([cos, -sin, sin, cos]) {
            assert_abs_diff_eq!(*x, y, epsilon = 1e-12);
        }
    }

    #[test]
    fn conformal_fit_is_the_closest_similarity() {
        // diag(2, 0.5) has geometric mean 1, so the conformal target is the identity.
        let mut w = [0.; 4];
        let mut r = [0.; 4];
        fit_element::<2>(&[2., 0., 0., 0.5], EnergyKind::Conformal.formulas(), 1., &mut w, &mut r);
        for (x, y) in r.iter().zip([1., 0., 0., 1.]) {
            assert_abs_diff_eq!(*x, y, epsilon = 1e-12);
        }

        // A uniform scaling is already conformal: the fit is the Jacobian itself.
        let j = [1.5, 0., 0., 0., 1.5, 0., 0., 0., 1.5];
        let mut w = [0.; 9];
        let mut r = [0.; 9];
        fit_element::<3>(&j, EnergyKind::Conformal.formulas(), 1., &mut w, &mut r);
        for (x, y) in r.iter().zip(j) {
            assert_abs_diff_eq!(*x, y, epsilon = 1e-12);
        }
    }

    #[test]
    fn parallel_update_matches_single_elements() {
        let jacobians = [1., 0., 0., 1., 1.2, 0.3, -0.1, 0.8, 0.6, 0., 0.2, 1.4];
        let mut w = vec![0.; 12];
        let mut r = vec![0.; 12];
        let formulas = EnergyKind::SymmetricDirichlet.formulas();
        update_weights_and_fits(2, &jacobians, formulas, 1., &mut w, &mut r);
        for e in 0..3 {
            let mut we = [0.; 4];
            let mut re = [0.; 4];
            fit_element::<2>(&jacobians[4 * e..4 * e + 4], formulas, 1., &mut we, &mut re);
            assert_eq!(&w[4 * e..4 * e + 4], &we);
            assert_eq!(&r[4 * e..4 * e + 4], &re);
        }
    }

    #[test]
    fn singular_values_are_sorted() {
        let s = singular_values(2, &[0.5, 0., 0., 2.]);
        assert_abs_diff_eq!(s[0], 2., epsilon = 1e-14);
        assert_abs_diff_eq!(s[1], 0.5, epsilon = 1e-14);
    }
}
