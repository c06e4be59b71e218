//! Distortion energies, expressed on the singular values of the element Jacobians.
//!
//! Each [`EnergyKind`] maps to a static [`EnergyFormulas`] entry holding three pure pieces: the
//! derivative of the energy density with respect to every singular value together with the
//! closest singular values `t`, the density itself, and how the fit matrix is built. The local
//! step turns them into the proxy weights `w = sqrt(E'(s) / (2 (s - t)))`.

/// Distortion energy minimized by the solver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EnergyKind {
    /// `Σ (s - 1)²`, also known as ARAP.
    Isometric,
    /// `Σ (s² + s⁻²)`
    #[default]
    SymmetricDirichlet,
    /// `Σ ln(s)²`
    LogIsometric,
    /// `Σ s² / (d · (Π s)^(2/d))`
    Conformal,
    /// `exp(k · conformal)`
    ExpConformal,
    /// `exp(k · symmetric Dirichlet)`
    ExpSymmetricDirichlet,
}

impl EnergyKind {
    pub const ALL: [EnergyKind; 6] = [
        EnergyKind::Isometric,
        EnergyKind::SymmetricDirichlet,
        EnergyKind::LogIsometric,
        EnergyKind::Conformal,
        EnergyKind::ExpConformal,
        EnergyKind::ExpSymmetricDirichlet,
    ];

    pub fn formulas(self) -> &'static EnergyFormulas {
        match self {
            EnergyKind::Isometric => &ISOMETRIC,
            EnergyKind::SymmetricDirichlet => &SYMMETRIC_DIRICHLET,
            EnergyKind::LogIsometric => &LOG_ISOMETRIC,
            EnergyKind::Conformal => &CONFORMAL,
            EnergyKind::ExpConformal => &EXP_CONFORMAL,
            EnergyKind::ExpSymmetricDirichlet => &EXP_SYMMETRIC_DIRICHLET,
        }
    }
}

/// What the global step steers every element towards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FitPolicy {
    /// The closest rotation `U · Vᵗ`.
    Rotation,
    /// `U · diag(t) · Vᵗ`, a similarity with the closest singular values.
    Projection,
}

/// Formulas of one energy kind. All functions take the singular values of one element
/// (2 or 3 of them) and the exponential factor, which only the exponential kinds read.
pub struct EnergyFormulas {
    /// Writes `∂E/∂sᵢ` into the first output and the closest singular values `tᵢ` into the
    /// second one.
    pub gradient: fn(&[f64], f64, &mut [f64], &mut [f64]),
    /// Energy density of one element (to be multiplied by its mass).
    pub density: fn(&[f64], f64) -> f64,
    pub fit: FitPolicy,
}

/// Below this distance to its target a singular value gets a unit weight.
pub const SINGULAR_EPSILON: f64 = 1e-8;

/// Proxy weights `wᵢ` and targets `tᵢ` for the singular values `s`.
pub fn singular_value_weights(
    formulas: &EnergyFormulas,
    s: &[f64],
    exp_factor: f64,
    weights: &mut [f64],
    targets: &mut [f64],
) {
    (formulas.gradient)(s, exp_factor, weights, targets);
    for ((w, &s), &t) in weights.iter_mut().zip(s).zip(targets.iter()) {
        *w = if (s - t).abs() < SINGULAR_EPSILON {
            1.
        } else {
            (*w / (2. * (s - t))).sqrt()
        };
    }
}

static ISOMETRIC: EnergyFormulas = EnergyFormulas {
    gradient: isometric_gradient,
    density: isometric_density,
    fit: FitPolicy::Rotation,
};

static SYMMETRIC_DIRICHLET: EnergyFormulas = EnergyFormulas {
    gradient: symmetric_dirichlet_gradient,
    density: symmetric_dirichlet_density,
    fit: FitPolicy::Rotation,
};

static LOG_ISOMETRIC: EnergyFormulas = EnergyFormulas {
    gradient: log_isometric_gradient,
    density: log_isometric_density,
    fit: FitPolicy::Rotation,
};

static CONFORMAL: EnergyFormulas = EnergyFormulas {
    gradient: conformal_gradient,
    density: conformal_density,
    fit: FitPolicy::Projection,
};

static EXP_CONFORMAL: EnergyFormulas = EnergyFormulas {
    gradient: exp_conformal_gradient,
    density: exp_conformal_density,
    fit: FitPolicy::Projection,
};

static EXP_SYMMETRIC_DIRICHLET: EnergyFormulas = EnergyFormulas {
    gradient: exp_symmetric_dirichlet_gradient,
    density: exp_symmetric_dirichlet_density,
    fit: FitPolicy::Rotation,
};

fn isometric_density(s: &[f64], _exp_factor: f64) -> f64 {
    s.iter().map(|s| (s - 1.).powi(2)).sum()
}

fn isometric_gradient(s: &[f64], _exp_factor: f64, grad: &mut [f64], target: &mut [f64]) {
    for ((g, t), s) in grad.iter_mut().zip(target.iter_mut()).zip(s) {
        *g = 2. * (s - 1.);
        *t = 1.;
    }
}

fn symmetric_dirichlet_density(s: &[f64], _exp_factor: f64) -> f64 {
    s.iter().map(|s| s.powi(2) + s.powi(-2)).sum()
}

fn symmetric_dirichlet_gradient(s: &[f64], _exp_factor: f64, grad: &mut [f64], target: &mut [f64]) {
    for ((g, t), s) in grad.iter_mut().zip(target.iter_mut()).zip(s) {
        *g = 2. * (s - s.powi(-3));
        *t = 1.;
    }
}

fn log_isometric_density(s: &[f64], _exp_factor: f64) -> f64 {
    s.iter().map(|s| s.abs().ln().powi(2)).sum()
}

fn log_isometric_gradient(s: &[f64], _exp_factor: f64, grad: &mut [f64], target: &mut [f64]) {
    for ((g, t), s) in grad.iter_mut().zip(target.iter_mut()).zip(s) {
        *g = 2. * s.abs().ln() / s;
        *t = 1.;
    }
}

fn conformal_density(s: &[f64], _exp_factor: f64) -> f64 {
    let d = s.len() as f64;
    let sum_sq: f64 = s.iter().map(|s| s * s).sum();
    let prod: f64 = s.iter().product();
    sum_sq / (d * prod.powf(2. / d))
}

// In 3D the shared target only looks at the largest and smallest singular values.
fn conformal_target(s: &[f64]) -> f64 {
    match s {
        [s1, s2] => (s1 * s2).sqrt(),
        _ => {
            let first = s[0];
            let last = s[s.len() - 1];
            ((first * first + last * last) / 2.).sqrt()
        }
    }
}

fn conformal_gradient(s: &[f64], _exp_factor: f64, grad: &mut [f64], target: &mut [f64]) {
    let d = s.len() as f64;
    let sum_sq: f64 = s.iter().map(|s| s * s).sum();
    let prod: f64 = s.iter().product();
    let scale = 2. / (d * prod.powf(2. / d));
    let closest = conformal_target(s);
    for ((g, t), s) in grad.iter_mut().zip(target.iter_mut()).zip(s) {
        *g = scale * (s - sum_sq / (d * s));
        *t = closest;
    }
}

fn exp_conformal_density(s: &[f64], exp_factor: f64) -> f64 {
    (exp_factor * conformal_density(s, exp_factor)).exp()
}

fn exp_conformal_gradient(s: &[f64], exp_factor: f64, grad: &mut [f64], target: &mut [f64]) {
    conformal_gradient(s, exp_factor, grad, target);
    let chain = exp_conformal_density(s, exp_factor) * exp_factor;
    for g in grad.iter_mut() {
        *g *= chain;
    }
}

fn exp_symmetric_dirichlet_density(s: &[f64], exp_factor: f64) -> f64 {
    (exp_factor * symmetric_dirichlet_density(s, exp_factor)).exp()
}

fn exp_symmetric_dirichlet_gradient(
    s: &[f64],
    exp_factor: f64,
    grad: &mut [f64],
    target: &mut [f64],
) {
    symmetric_dirichlet_gradient(s, exp_factor, grad, target);
    let chain = exp_symmetric_dirichlet_density(s, exp_factor) * exp_factor;
    for g in grad.iter_mut() {
        *g *= chain;
    }
}
