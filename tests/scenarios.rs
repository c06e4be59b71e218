use approx::assert_abs_diff_eq;
use faer::Mat;
use slim_rs::{
    EnergyKind, LinearSolver, ReferenceShape, SLIMError, SLIMOptions, SoftConstraint, SLIM,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn square() -> (Vec<[f64; 3]>, Vec<[usize; 3]>) {
    (
        vec![[0., 0., 0.], [1., 0., 0.], [1., 1., 0.], [0., 1., 0.]],
        vec![[0, 1, 2], [0, 2, 3]],
    )
}

fn flat(rest: &[[f64; 3]]) -> Mat<f64> {
    Mat::from_fn(rest.len(), 2, |i, j| rest[i][j])
}

fn signed_areas(p: &Mat<f64>, f: &[[usize; 3]]) -> Vec<f64> {
    f.iter()
        .map(|t| {
            let (a, b, c) = (t[0], t[1], t[2]);
            (p[(b, 0)] - p[(a, 0)]) * (p[(c, 1)] - p[(a, 1)])
                - (p[(b, 1)] - p[(a, 1)]) * (p[(c, 0)] - p[(a, 0)])
        })
        .collect()
}

fn isometric() -> SLIMOptions {
    SLIMOptions {
        energy: EnergyKind::Isometric,
        ..Default::default()
    }
}

#[test]
fn rest_pose_is_a_fixed_point() {
    init_logs();
    let (rest, f) = square();
    let mut slim = SLIM::new(&rest, &f, flat(&rest), vec![], isometric()).unwrap();
    slim.precompute().unwrap();
    assert_abs_diff_eq!(slim.energy(), 0., epsilon = 1e-10);
    for _ in 0..5 {
        slim.solve(1).unwrap();
        assert_abs_diff_eq!(slim.energy(), 0., epsilon = 1e-10);
    }
    for i in 0..4 {
        for j in 0..2 {
            assert_abs_diff_eq!(slim.positions()[(i, j)], rest[i][j], epsilon = 1e-6);
        }
    }
}

#[test]
fn rigid_motion_is_a_fixed_point_2d() {
    init_logs();
    let (rest, f) = square();
    let (sin, cos) = 2.3_f64.sin_cos();
    let moved = Mat::from_fn(4, 2, |i, j| {
        let [x, y, _] = rest[i];
        [cos * x - sin * y + 3., sin * x + cos * y - 1.][j]
    });
    let mut slim = SLIM::new(&rest, &f, moved.clone(), vec![], isometric()).unwrap();
    slim.precompute().unwrap();
    assert_abs_diff_eq!(slim.energy(), 0., epsilon = 1e-10);
    let report = slim.solve(5).unwrap();
    assert_eq!(report.iterations, 5);
    assert!(report.energy <= 1e-10);
    for i in 0..4 {
        for j in 0..2 {
            assert_abs_diff_eq!(slim.positions()[(i, j)], moved[(i, j)], epsilon = 1e-6);
        }
    }
}

#[test]
fn rigid_motion_is_a_fixed_point_3d() {
    init_logs();
    let rest = tetrahedron();
    // Quarter turn around z, then a shift.
    let moved = Mat::from_fn(4, 3, |i, j| {
        let [x, y, z] = rest[i];
        [-y + 0.5, x - 2., z + 1.][j]
    });
    let mut slim = SLIM::new(&rest, &[[0, 1, 2, 3]], moved.clone(), vec![], isometric()).unwrap();
    slim.precompute().unwrap();
    assert_abs_diff_eq!(slim.energy(), 0., epsilon = 1e-10);
    let report = slim.solve(5).unwrap();
    assert!(report.energy <= 1e-10);
    for i in 0..4 {
        for j in 0..3 {
            assert_abs_diff_eq!(slim.positions()[(i, j)], moved[(i, j)], epsilon = 1e-6);
        }
    }
}

#[test]
fn displaced_vertex_relaxes() {
    init_logs();
    let (rest, f) = square();
    let mut initial = flat(&rest);
    initial[(2, 0)] += 0.1;
    initial[(2, 1)] += 0.1;
    let mut slim = SLIM::new(&rest, &f, initial, vec![], isometric()).unwrap();
    slim.precompute().unwrap();
    let start = slim.energy();
    assert!(start > 0.);
    let mut previous = start;
    for _ in 0..10 {
        let report = slim.solve(1).unwrap();
        assert_eq!(report.iterations, 1);
        let energy = slim.energy();
        assert!(energy >= 0.);
        assert!(energy <= previous);
        if previous > 1e-10 {
            assert!(energy < previous, "{energy} should be below {previous}");
            assert_eq!(report.stalled, 0);
        }
        previous = energy;
    }
    assert!(previous < 0.1 * start);
    assert!(signed_areas(slim.positions(), &f).iter().all(|&a| a > 0.));
}

fn tetrahedron() -> Vec<[f64; 3]> {
    vec![
        [0., 0., 0.],
        [1., 0., 0.],
        [0.5, 0.866_025_403_784_438_6, 0.],
        [0.5, 0.288_675_134_594_812_9, 0.816_496_580_927_726],
    ]
}

#[test]
fn sheared_tetrahedron_relaxes() {
    init_logs();
    let rest = tetrahedron();
    let initial = Mat::from_fn(4, 3, |i, j| {
        if j == 0 {
            rest[i][0] + 0.5 * rest[i][2]
        } else {
            rest[i][j]
        }
    });
    let options = SLIMOptions {
        energy: EnergyKind::SymmetricDirichlet,
        ..Default::default()
    };
    let mut slim = SLIM::new(&rest, &[[0, 1, 2, 3]], initial, vec![], options).unwrap();
    assert_eq!(slim.dimension(), 3);
    slim.precompute().unwrap();
    let start = slim.energy();
    let mut previous = start;
    for _ in 0..5 {
        slim.solve(1).unwrap();
        let energy = slim.energy();
        assert!(energy.is_finite());
        assert!(energy <= previous);
        assert!(energy >= 6. - 1e-9);
        previous = energy;
    }
    assert!(previous < start);
    assert!(previous - 6. < 0.5 * (start - 6.));
}

#[test]
fn failed_linear_solve_keeps_the_last_iterate() {
    init_logs();
    let rest = tetrahedron();
    let initial = Mat::from_fn(4, 3, |i, j| {
        rest[i][j] + if j == 0 { 0.5 * rest[i][2] } else { 0. }
    });
    let options = SLIMOptions {
        linear_solver: LinearSolver::ConjugateGradient,
        cg_max_iterations: Some(1),
        cg_tolerance: 1e-300,
        ..Default::default()
    };
    let mut slim = SLIM::new(&rest, &[[0, 1, 2, 3]], initial.clone(), vec![], options).unwrap();
    slim.precompute().unwrap();
    let energy = slim.energy();
    let err = slim.solve(1).unwrap_err();
    assert!(matches!(err, SLIMError::NotConverged { iterations: 1, .. }), "{err:?}");
    assert_eq!(slim.positions(), &initial);
    assert_eq!(slim.energy(), energy);
}

#[test]
fn elongated_tetrahedron_moves_towards_regular() {
    init_logs();
    let rest = vec![[0., 0., 0.], [3., 0., 0.], [0., 1., 0.], [0., 0., 1.]];
    let initial = Mat::from_fn(4, 3, |i, j| rest[i][j]);
    let options = SLIMOptions {
        energy: EnergyKind::SymmetricDirichlet,
        reference: ReferenceShape::Regular,
        ..Default::default()
    };
    let mut slim = SLIM::new(&rest, &[[0, 1, 2, 3]], initial, vec![], options).unwrap();
    slim.precompute().unwrap();
    let start = slim.energy();
    // Distortion is measured against a regular tetrahedron, so the rest pose is far from optimal.
    assert!(start > 7.);
    let mut previous = start;
    for _ in 0..20 {
        slim.solve(1).unwrap();
        let energy = slim.energy();
        assert!(energy <= previous);
        assert!(energy >= 6. - 1e-9);
        previous = energy;
    }
    assert!(previous < start);
    assert!(previous < 6.5, "{previous}");
}

#[test]
fn soft_constraint_tightens_with_penalty() {
    init_logs();
    let (rest, f) = square();
    let target = [2., 1.];
    let mut distances = Vec::new();
    for penalty in [1., 10., 100.] {
        // Vertex 0 is held in place so that the mesh cannot just translate.
        let constraints = vec![
            SoftConstraint {
                vertex: 0,
                target: vec![0., 0.],
            },
            SoftConstraint {
                vertex: 2,
                target: target.to_vec(),
            },
        ];
        let options = SLIMOptions {
            soft_penalty: penalty,
            ..Default::default()
        };
        let mut slim = SLIM::new(&rest, &f, flat(&rest), constraints, options).unwrap();
        slim.solve(20).unwrap();
        let p = slim.positions();
        distances.push(((p[(2, 0)] - target[0]).powi(2) + (p[(2, 1)] - target[1]).powi(2)).sqrt());
        assert!(signed_areas(p, &f).iter().all(|&a| a > 0.));
    }
    assert!(distances[0] < 1.);
    assert!(distances[1] < distances[0], "{distances:?}");
    assert!(distances[2] < distances[1], "{distances:?}");
}

#[test]
fn set_soft_penalty_between_runs() {
    init_logs();
    let (rest, f) = square();
    let constraints = vec![
        SoftConstraint {
            vertex: 0,
            target: vec![0., 0.],
        },
        SoftConstraint {
            vertex: 2,
            target: vec![2., 1.],
        },
    ];
    let options = SLIMOptions {
        soft_penalty: 1.,
        ..Default::default()
    };
    let mut slim = SLIM::new(&rest, &f, flat(&rest), constraints, options).unwrap();
    slim.solve(20).unwrap();
    let before = slim.energy();
    slim.set_soft_penalty(100.).unwrap();
    assert!(slim.energy() > before);
    let raised = slim.energy();
    slim.solve(20).unwrap();
    assert!(slim.energy() < raised);
}

#[test]
fn every_energy_kind_descends() {
    init_logs();
    let (rest, f) = square();
    let initial = Mat::from_fn(4, 2, |i, j| [[0., 0.], [1.3, 0.1], [1.2, 0.9], [-0.1, 0.8]][i][j]);
    for energy in EnergyKind::ALL {
        let options = SLIMOptions {
            energy,
            ..Default::default()
        };
        let mut slim = SLIM::new(&rest, &f, initial.clone(), vec![], options).unwrap();
        slim.precompute().unwrap();
        let start = slim.energy();
        let report = slim.solve(5).unwrap();
        assert!(report.energy.is_finite(), "{energy:?}");
        assert!(report.energy <= start, "{energy:?}");
        assert!(signed_areas(slim.positions(), &f).iter().all(|&a| a > 0.), "{energy:?}");
    }
}

#[test]
fn mixed_arity_is_rejected() {
    let rest = tetrahedron();
    let elements = vec![vec![0, 1, 2], vec![0, 1, 2, 3]];
    let err = SLIM::new(&rest, &elements, Mat::zeros(4, 2), vec![], Default::default());
    assert!(matches!(err, Err(SLIMError::MixedArity { element: 1, .. })));
}

#[test]
fn tetrahedra_can_use_the_direct_solver() {
    init_logs();
    let rest = tetrahedron();
    let initial = Mat::from_fn(4, 3, |i, j| rest[i][j] * if j == 2 { 0.7 } else { 1. });
    let run = |linear_solver| {
        let options = SLIMOptions {
            linear_solver,
            cg_tolerance: 1e-12,
            ..Default::default()
        };
        let mut slim = SLIM::new(&rest, &[[0, 1, 2, 3]], initial.clone(), vec![], options).unwrap();
        slim.solve(3).unwrap();
        slim.energy()
    };
    assert_abs_diff_eq!(
        run(LinearSolver::Direct),
        run(LinearSolver::ConjugateGradient),
        epsilon = 1e-6
    );
}
