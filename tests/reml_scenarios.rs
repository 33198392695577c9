use approx::assert_abs_diff_eq;
use greml::constrain::constrain;
use greml::data::grm::GrmKind;
use greml::model::{FixedEffect, GeneticEffect, INTERCEPT};
use greml::observer::NoopObserver;
use greml::policy::UpdatePolicy;
use greml::{Estimator, EstimatorConfig, FreqModel, FreqState};
use ndarray::{Array1, Array2, array};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

/// Block-diagonal incidence product: samples `i` and `j` share a block when
/// `i / size == j / size`.
fn blocks(n: usize, size: usize) -> Array2<f64> {
    Array2::from_shape_fn((n, n), |(i, j)| if i / size == j / size { 1.0 } else { 0.0 })
}

/// Rescales `values` so that Σv² / df equals `mean_square`.
fn scale_to(values: &mut [f64], mean_square: f64, df: f64) {
    let ss: f64 = values.iter().map(|v| v * v).sum();
    let factor = (mean_square * df / ss).sqrt();
    values.iter_mut().for_each(|v| *v *= factor);
}

fn centre(values: &mut [f64]) {
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter_mut().for_each(|v| *v -= mean);
}

fn genetic(name: &str, kind: GrmKind, covariance: Array2<f64>) -> GeneticEffect {
    GeneticEffect {
        name: name.into(),
        kind,
        covariance,
    }
}

fn fit(model: &FreqModel, policy: UpdatePolicy) -> (FreqState, bool) {
    let estimator = Estimator::new(EstimatorConfig {
        policy,
        ..EstimatorConfig::default()
    });
    let mut state = FreqState::new(model);
    let result = estimator.fit(model, &mut state, &mut NoopObserver).unwrap();
    (state, result.summary.converged)
}

#[test]
fn identity_grm_recovers_the_total_variance() {
    let n = 100;
    let mut rng = StdRng::seed_from_u64(42);
    let g_dist = Normal::new(0.0, 0.6f64.sqrt()).unwrap();
    let e_dist = Normal::new(0.0, 0.4f64.sqrt()).unwrap();
    let y: Array1<f64> = (0..n)
        .map(|_| g_dist.sample(&mut rng) + e_dist.sample(&mut rng))
        .collect();

    let model = FreqModel::new(
        y.clone(),
        FixedEffect::intercept_only(n),
        vec![],
        vec![genetic("Additive", GrmKind::Additive, Array2::eye(n))],
    )
    .unwrap();
    let (state, converged) = fit(&model, UpdatePolicy::Ai);
    assert!(converged);

    // With K = I only σ²_g + σ²_e is identified; REML returns the unbiased variance.
    let mean = y.mean().unwrap();
    let sample_variance = y.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    let total = state.genetic[0].variance + state.residual.variance;
    assert_abs_diff_eq!(total, sample_variance, epsilon = 1e-5 * sample_variance);
    assert!(state.genetic[0].heritability.is_finite());
}

#[test]
fn balanced_one_way_design_recovers_the_generating_components() {
    let (groups, size) = (25, 4);
    let n = groups * size;
    let mut rng = StdRng::seed_from_u64(42);
    let normal = Normal::new(0.0, 1.0).unwrap();

    // Moment-matched so that the ANOVA (and REML) estimates are exactly (0.6, 0.4).
    let mut a: Vec<f64> = (0..groups).map(|_| normal.sample(&mut rng)).collect();
    centre(&mut a);
    scale_to(&mut a, 0.6 + 0.4 / size as f64, (groups - 1) as f64);
    let mut e: Vec<f64> = Vec::with_capacity(n);
    for _ in 0..groups {
        let mut block: Vec<f64> = (0..size).map(|_| normal.sample(&mut rng)).collect();
        centre(&mut block);
        e.extend(block);
    }
    scale_to(&mut e, 0.4, (groups * (size - 1)) as f64);
    let y: Array1<f64> = (0..n).map(|i| 1.0 + a[i / size] + e[i]).collect();

    let model = FreqModel::new(
        y,
        FixedEffect::intercept_only(n),
        vec![],
        vec![genetic("Additive", GrmKind::Additive, blocks(n, size))],
    )
    .unwrap();

    for policy in [UpdatePolicy::Ai, UpdatePolicy::FisherScoring] {
        let (state, converged) = fit(&model, policy);
        assert!(converged, "{policy} did not converge");
        assert_abs_diff_eq!(state.genetic[0].variance, 0.6, epsilon = 1e-4);
        assert_abs_diff_eq!(state.residual.variance, 0.4, epsilon = 1e-4);
        assert_abs_diff_eq!(state.genetic[0].heritability, 0.6, epsilon = 1e-4);
        assert!((state.genetic[0].variance - 0.6).abs() / 0.6 < 0.25);
        assert!(state.genetic[0].heritability_se > 0.0);
        assert_abs_diff_eq!(state.fixed.coeff[0], 1.0, epsilon = 1e-8);
    }
}

#[test]
fn fixed_effects_fall_within_four_standard_errors() {
    let (groups, size) = (25, 4);
    let n = groups * size;
    let mut rng = StdRng::seed_from_u64(42);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let g_dist = Normal::new(0.0, 0.6f64.sqrt()).unwrap();
    let e_dist = Normal::new(0.0, 0.4f64.sqrt()).unwrap();

    let z: Vec<f64> = (0..n).map(|_| normal.sample(&mut rng)).collect();
    let a: Vec<f64> = (0..groups).map(|_| g_dist.sample(&mut rng)).collect();
    let y: Array1<f64> = (0..n)
        .map(|i| 1.0 + 2.0 * z[i] + a[i / size] + e_dist.sample(&mut rng))
        .collect();

    let mut fixed = FixedEffect::intercept_only(n);
    fixed.x = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { 1.0 } else { z[i] });
    fixed.names = vec![INTERCEPT.to_string(), "z".to_string()];
    fixed.levels = vec![None, None];
    fixed.reference_levels = vec![None, None];

    let model = FreqModel::new(
        y,
        fixed,
        vec![],
        vec![genetic("Additive", GrmKind::Additive, blocks(n, size))],
    )
    .unwrap();
    let (state, _) = fit(&model, UpdatePolicy::Ai);

    let beta = &state.fixed.coeff;
    let se = &state.fixed.se;
    assert!(se.iter().all(|s| s.is_finite() && *s > 0.0));
    assert!((beta[0] - 1.0).abs() < 4.0 * se[0], "intercept {} ± {}", beta[0], se[0]);
    assert!((beta[1] - 2.0).abs() < 4.0 * se[1], "slope {} ± {}", beta[1], se[1]);
}

#[test]
fn nested_design_recovers_additive_and_dominance_components() {
    // Families of two subgroups of two: y = 1 + a_family + d_subgroup + e.
    let (families, per_family, per_subgroup) = (50, 4, 2);
    let n = families * per_family;
    let subgroups = n / per_subgroup;
    let mut rng = StdRng::seed_from_u64(42);
    let normal = Normal::new(0.0, 1.0).unwrap();

    let (sigma_a, sigma_d, sigma_e) = (0.3, 0.2, 0.5);
    let mut a: Vec<f64> = (0..families).map(|_| normal.sample(&mut rng)).collect();
    centre(&mut a);
    scale_to(&mut a, sigma_a + (sigma_d + sigma_e / 2.0) / 2.0, (families - 1) as f64);
    let mut d: Vec<f64> = (0..families)
        .flat_map(|_| {
            let x = normal.sample(&mut rng);
            [x, -x]
        })
        .collect();
    scale_to(&mut d, sigma_d + sigma_e / 2.0, families as f64);
    let mut e: Vec<f64> = (0..subgroups)
        .flat_map(|_| {
            let x = normal.sample(&mut rng);
            [x, -x]
        })
        .collect();
    scale_to(&mut e, sigma_e, subgroups as f64);

    let y: Array1<f64> = (0..n)
        .map(|i| 1.0 + a[i / per_family] + d[i / per_subgroup] + e[i])
        .collect();
    let model = FreqModel::new(
        y,
        FixedEffect::intercept_only(n),
        vec![],
        vec![
            genetic("Additive", GrmKind::Additive, blocks(n, per_family)),
            genetic("Dominance", GrmKind::Dominance, blocks(n, per_subgroup)),
        ],
    )
    .unwrap();
    let (state, converged) = fit(&model, UpdatePolicy::Ai);
    assert!(converged);

    let expected = [sigma_e, sigma_a, sigma_d];
    for (estimate, truth) in state.sigma().iter().zip(expected) {
        assert!((estimate - truth).abs() / truth < 0.3, "{estimate} vs {truth}");
        assert_abs_diff_eq!(*estimate, truth, epsilon = 1e-4);
    }
    for g in &state.genetic {
        assert!(g.heritability_se.is_finite() && g.heritability_se >= 0.0);
    }
    assert_abs_diff_eq!(state.genetic[0].heritability, 0.3, epsilon = 1e-4);
}

#[test]
fn constrainer_clamps_negatives_and_preserves_the_sum() {
    let mut sigma = array![-0.5, 20.0, -0.3, 40.0, 50.0];
    let before = sigma.sum();
    let outcome = constrain(&mut sigma, 100.0);
    assert_eq!(outcome.constrained, 2);
    assert!(sigma.iter().all(|&s| s >= 1e-4));
    assert_eq!(sigma[0], 1e-4);
    assert_eq!(sigma[2], 1e-4);
    assert_abs_diff_eq!(sigma.sum(), before, epsilon = 1e-9 * before.abs());
}
