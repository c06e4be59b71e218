//! Signed polar/singular value decomposition of small square matrices.
//!
//! For a Jacobian `J` we compute `J = U · diag(s) · Vᵗ` where `U` and `V` are proper rotations
//! (determinant `+1`). When `J` reverses orientation the smallest singular value is negative
//! instead, so that `R = U · Vᵗ` is always the closest rotation to `J`.

/// Dense `D × D` matrix stored row-major.
pub type Small<const D: usize> = [[f64; D]; D];

/// Result of [`PolarSvd::polar_svd`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Polar<const D: usize> {
    /// Closest rotation `U · Vᵗ`.
    pub rotation: Small<D>,
    /// Left singular vectors (as columns).
    pub u: Small<D>,
    /// Right singular vectors (as columns).
    pub v: Small<D>,
    /// Singular values, decreasing in absolute value. Only the last one may be negative.
    pub s: [f64; D],
}

/// Signed SVD of a square matrix.
pub trait PolarSvd<const D: usize> {
    fn polar_svd(&self) -> Polar<D>;

    fn determinant(&self) -> f64;
}

fn rotation_2d(angle: f64) -> Small<2> {
    let (sin, cos) = angle.sin_cos();
    [[cos, -sin], [sin, cos]]
}

// Closed form, writing J = R(phi) · diag(q + r, q - r) · R(theta).
impl PolarSvd<2> for Small<2> {
    fn polar_svd(&self) -> Polar<2> {
        let m = self;
        let e = 0.5 * (m[0][0] + m[1][1]);
        let f = 0.5 * (m[0][0] - m[1][1]);
        let g = 0.5 * (m[1][0] + m[0][1]);
        let h = 0.5 * (m[1][0] - m[0][1]);
        let q = e.hypot(h);
        let r = f.hypot(g);
        let a1 = g.atan2(f);
        let a2 = h.atan2(e);
        let theta = 0.5 * (a2 - a1);
        let phi = 0.5 * (a2 + a1);
        Polar {
            rotation: rotation_2d(a2),
            u: rotation_2d(phi),
            v: rotation_2d(-theta),
            s: [q + r, q - r],
        }
    }

    fn determinant(&self) -> f64 {
        self[0][0] * self[1][1] - self[0][1] * self[1][0]
    }
}

impl PolarSvd<3> for Small<3> {
    fn polar_svd(&self) -> Polar<3> {
        let m = na::Matrix3::from_fn(|i, j| self[i][j]);
        let svd = m.svd(true, true);
        let mut u = svd.u.unwrap_or_else(na::Matrix3::identity);
        let mut v_t = svd.v_t.unwrap_or_else(na::Matrix3::identity);
        let mut s = svd.singular_values;
        // Each factor is made proper on its own, the sign lands on the smallest singular value.
        if u.determinant() < 0. {
            for i in 0..3 {
                u[(i, 2)] = -u[(i, 2)];
            }
            s[2] = -s[2];
        }
        if v_t.determinant() < 0. {
            for j in 0..3 {
                v_t[(2, j)] = -v_t[(2, j)];
            }
            s[2] = -s[2];
        }
        let rotation = u * v_t;
        Polar {
            rotation: std::array::from_fn(|i| std::array::from_fn(|j| rotation[(i, j)])),
            u: std::array::from_fn(|i| std::array::from_fn(|j| u[(i, j)])),
            v: std::array::from_fn(|i| std::array::from_fn(|j| v_t[(j, i)])),
            s: [s[0], s[1], s[2]],
        }
    }

    fn determinant(&self) -> f64 {
        let m = self;
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    }
}

/// `u · diag(d) · vᵗ`
pub fn compose<const D: usize>(u: &Small<D>, d: &[f64; D], v: &Small<D>) -> Small<D> {
    std::array::from_fn(|i| {
        std::array::from_fn(|j| (0..D).map(|k| u[i][k] * d[k] * v[j][k]).sum::<f64>())
    })
}

pub fn from_flat<const D: usize>(flat: &[f64]) -> Small<D> {
    std::array::from_fn(|i| std::array::from_fn(|j| flat[i * D + j]))
}

pub fn write_flat<const D: usize>(m: &Small<D>, flat: &mut [f64]) {
    for (i, row) in m.iter().enumerate() {
        flat[i * D..(i + 1) * D].copy_from_slice(row);
    }
}
