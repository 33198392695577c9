//! Fixed-effect GLS solve, BLUPs and the per-marker back-solve of genomic BLUPs.

use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::{FactorizeC, InverseC, UPLO};

use crate::data::coding::VariantStats;
use crate::data::grm::GrmKind;
use crate::data::grm_builder::GrmMethod;
use crate::data::payload::GenotypeMatrix;
use crate::data::plink::PlinkDataset;
use crate::model::{FreqModel, FreqState};
use crate::predict::effects::SnpEffect;
use crate::shared::error::{Diagnostic, GremlError, Result};
use crate::state::OptimizerState;

/// β = (XᵀV⁻¹X)⁻¹ XᵀV⁻¹y with SE(βⱼ) = √((XᵀV⁻¹X)⁻¹)ⱼⱼ. `opt.v` must hold V⁻¹.
pub fn compute_fixed_effects(
    model: &FreqModel,
    state: &mut FreqState,
    opt: &OptimizerState,
) -> Result<()> {
    let x = model.x();
    let vinv_y = opt.v.dot(model.y());
    let rhs = x.t().dot(&vinv_y);
    let inverse = opt
        .tx_vinv_x
        .factorizec(UPLO::Lower)
        .and_then(|factor| factor.invc())
        .map_err(|e| GremlError::linalg("X'V^-1X is not positive definite", e))?;

    state.fixed.coeff = inverse.dot(&rhs);
    state.fixed.se = inverse
        .diag()
        .mapv(|v| if v >= 0.0 { v.sqrt() } else { f64::NAN });
    Ok(())
}

/// blupᵢ = Kᵢ·Py·σᵢ² for every random and genetic component.
pub fn compute_random_effects(model: &FreqModel, state: &mut FreqState, opt: &OptimizerState) {
    for (effect, effect_state) in model.random.iter().zip(state.random.iter_mut()) {
        effect_state.blup = effect.covariance.dot(&opt.proj_y) * effect_state.variance;
    }
    for (effect, effect_state) in model.genetic.iter().zip(state.genetic.iter_mut()) {
        effect_state.ebv = effect.covariance.dot(&opt.proj_y) * effect_state.variance;
    }
}

/// `V⁻¹(y − Xβ)`, available once fixed effects are solved.
pub fn residual_weighted(model: &FreqModel, state: &FreqState, opt: &OptimizerState) -> Array1<f64> {
    let residual = model.y() - &model.x().dot(&state.fixed.coeff);
    opt.v.dot(&residual)
}

/// Variance of the genetic component of `kind`. Additive falls back to the
/// first genetic component when none is tagged.
fn genetic_variance(model: &FreqModel, state: &FreqState, kind: GrmKind) -> Option<f64> {
    let tagged = model
        .genetic
        .iter()
        .zip(&state.genetic)
        .find(|(effect, _)| effect.kind == kind)
        .map(|(_, s)| s.variance);
    match (tagged, kind) {
        (Some(v), _) => Some(v),
        (None, GrmKind::Additive) => state.genetic.first().map(|s| s.variance),
        _ => None,
    }
}

/// Numerators zⱼᵀPy over the fitted rows and column sums of squares over every
/// `.fam` row, for one coding.
struct Projection {
    numerators: Vec<f64>,
    sum_squares: f64,
}

fn project_chunk(
    block: &Array2<f64>,
    method: GrmMethod,
    kind: GrmKind,
    rows: &[usize],
    proj_y: &Array1<f64>,
) -> Result<(Projection, Vec<VariantStats>)> {
    let mut coded = block.clone();
    let stats: Vec<VariantStats> = coded
        .axis_iter_mut(Axis(1))
        .into_par_iter()
        .map(|column| method.code(kind, column))
        .collect();
    let genotypes = GenotypeMatrix::owned(coded, stats)?;
    let view = genotypes.view()?;
    let fitted = view.select(Axis(0), rows);
    let numerators = fitted.t().dot(proj_y).to_vec();
    let sum_squares = view.iter().map(|v| v * v).sum();
    Ok((
        Projection {
            numerators,
            sum_squares,
        },
        genotypes.stats().to_vec(),
    ))
}

/// Per-marker effects reproducing the genomic BLUP: βⱼ = σ²_g · zⱼᵀPy / k.
///
/// The GRM was coded over every `.fam` sample, so z and k are too: each variant
/// is coded with whole-fileset allele frequencies, k is the trace/n of Σ zzᵀ over
/// all `.fam` rows, and only the projection zⱼᵀPy is restricted to the fitted
/// samples. `rows` maps the model's sample order onto `.fam` rows and `method`
/// must be the coding the GRM was built with. Only the `yang` coding is what the
/// predictor applies, so other methods are rejected.
pub fn compute_marker_effects(
    model: &FreqModel,
    state: &FreqState,
    opt: &OptimizerState,
    dataset: &PlinkDataset,
    rows: &[usize],
    method: GrmMethod,
    chunk_size: usize,
) -> Result<Vec<SnpEffect>> {
    if rows.len() != model.n() {
        return Err(GremlError::programmer(format!(
            "{} genotype rows for {} samples",
            rows.len(),
            model.n()
        )));
    }
    if method != GrmMethod::Yang {
        return Err(GremlError::value(
            format!(
                "marker effects are scored with the yang coding; a GRM built with {method} \
                 cannot be back-solved into them"
            ),
            Diagnostic::file(dataset.prefix()),
        ));
    }
    let Some(additive_variance) = genetic_variance(model, state, GrmKind::Additive) else {
        return Err(GremlError::value(
            "marker effects need at least one genetic component",
            Diagnostic::file(dataset.prefix()),
        ));
    };
    let dominance_variance = genetic_variance(model, state, GrmKind::Dominance);

    let n_fam = dataset.n_samples() as f64;
    let n_variants = dataset.n_variants();
    let mut additive = Vec::with_capacity(n_variants);
    let mut dominance = Vec::with_capacity(n_variants);
    let mut frequencies = Vec::with_capacity(n_variants);
    let (mut additive_ss, mut dominance_ss) = (0.0, 0.0);

    let all: Vec<usize> = (0..n_variants).collect();
    for chunk in all.chunks(chunk_size.max(1)) {
        let block = dataset.decode_block(chunk, None)?;
        let (projection, stats) =
            project_chunk(&block, method, GrmKind::Additive, rows, &opt.proj_y)?;
        additive_ss += projection.sum_squares;
        additive.extend(projection.numerators);
        frequencies.extend(stats.iter().map(|s| s.mean / 2.0));

        if dominance_variance.is_some() {
            let (projection, _) =
                project_chunk(&block, method, GrmKind::Dominance, rows, &opt.proj_y)?;
            dominance_ss += projection.sum_squares;
            dominance.extend(projection.numerators);
        }
    }

    let additive_k = additive_ss / n_fam;
    let dominance_k = dominance_ss / n_fam;
    if additive_k <= 0.0 {
        return Err(GremlError::value(
            "every variant is monomorphic",
            Diagnostic::file(dataset.prefix()),
        ));
    }

    let effects = dataset
        .variants()
        .iter()
        .enumerate()
        .map(|(j, variant)| SnpEffect {
            identifier: variant.identifier.clone(),
            chromosome: variant.chromosome.clone(),
            position: variant.position,
            allele1: variant.allele1.clone(),
            allele2: variant.allele2.clone(),
            frequency: frequencies[j],
            additive: additive_variance * additive[j] / additive_k,
            dominance: dominance_variance.map(|variance| {
                if dominance_k > 0.0 {
                    variance * dominance[j] / dominance_k
                } else {
                    0.0
                }
            }),
        })
        .collect();
    Ok(effects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::plink::{SampleRecord, VariantRecord, write_plink};
    use crate::model::{FixedEffect, GeneticEffect};
    use crate::variance::refresh;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    fn coded(dosages: &Array2<f64>, kind: GrmKind) -> Array2<f64> {
        let mut z = dosages.clone();
        for column in z.axis_iter_mut(Axis(1)) {
            GrmMethod::Yang.code(kind, column);
        }
        z
    }

    fn samples(n: usize) -> Vec<SampleRecord> {
        (0..n)
            .map(|i| SampleRecord {
                family_id: format!("f{i}"),
                individual_id: format!("i{i}"),
                paternal_id: "0".into(),
                maternal_id: "0".into(),
                sex: "0".into(),
                phenotype: "-9".into(),
            })
            .collect()
    }

    fn variants(m: usize) -> Vec<VariantRecord> {
        (0..m)
            .map(|j| VariantRecord {
                chromosome: "1".into(),
                identifier: format!("rs{j}"),
                genetic_distance: "0".into(),
                position: 1000 + j as u64,
                allele1: "A".into(),
                allele2: "G".into(),
            })
            .collect()
    }

    #[test]
    fn fixed_effects_match_ols_under_identity_v() {
        let x_col = array![0.0, 1.0, 2.0, 3.0, 4.0];
        let y = array![1.0, 3.1, 4.9, 7.2, 8.8];
        let mut fixed = FixedEffect::intercept_only(5);
        fixed.x = ndarray::stack![Axis(1), Array1::<f64>::ones(5), x_col];
        fixed.names.push("dose".into());
        fixed.levels.push(None);
        fixed.reference_levels.push(None);
        let model = FreqModel::new(y, fixed, vec![], vec![]).unwrap();
        let mut state = FreqState::new(&model);
        state.residual.variance = 1.0;
        let mut opt = OptimizerState::new(&model);
        refresh(&model, &state, &mut opt).unwrap();
        compute_fixed_effects(&model, &mut state, &opt).unwrap();

        // OLS: slope = Sxy/Sxx = 19.7/10, intercept = ybar - slope*2
        assert_abs_diff_eq!(state.fixed.coeff[1], 1.97, epsilon = 1e-10);
        assert_abs_diff_eq!(state.fixed.coeff[0], 5.0 - 1.97 * 2.0, epsilon = 1e-10);
        assert_abs_diff_eq!(state.fixed.se[1], (1.0f64 / 10.0).sqrt(), epsilon = 1e-10);

        let weighted = residual_weighted(&model, &state, &opt);
        assert_abs_diff_eq!(weighted.sum(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn marker_effects_reproduce_genomic_blup() {
        let (n, m) = (30, 60);
        let mut rng = StdRng::seed_from_u64(21);
        let dosages = Array2::from_shape_fn((n, m), |_| rng.gen_range(0..3) as f64);
        let y = Array1::from_shape_fn(n, |_| rng.gen_range(-1.0..1.0));

        let z_add = coded(&dosages, GrmKind::Additive);
        let z_dom = coded(&dosages, GrmKind::Dominance);
        let k_add = z_add.dot(&z_add.t()) / (z_add.iter().map(|v| v * v).sum::<f64>() / n as f64);
        let k_dom = z_dom.dot(&z_dom.t()) / (z_dom.iter().map(|v| v * v).sum::<f64>() / n as f64);

        let model = FreqModel::new(
            y,
            FixedEffect::intercept_only(n),
            vec![],
            vec![
                GeneticEffect {
                    name: "Additive".into(),
                    kind: GrmKind::Additive,
                    covariance: k_add,
                },
                GeneticEffect {
                    name: "Dominance".into(),
                    kind: GrmKind::Dominance,
                    covariance: k_dom,
                },
            ],
        )
        .unwrap();
        let mut state = FreqState::new(&model);
        state.set_sigma(array![0.5, 0.3, 0.2].view()).unwrap();
        let mut opt = OptimizerState::new(&model);
        refresh(&model, &state, &mut opt).unwrap();
        compute_random_effects(&model, &mut state, &opt);

        let dir = tempdir().unwrap();
        let prefix = dir.path().join("geno");
        write_plink(&prefix, &samples(n), &variants(m), &dosages).unwrap();
        let dataset = PlinkDataset::open(&prefix).unwrap();
        let rows: Vec<usize> = (0..n).collect();
        let effects = compute_marker_effects(&model, &state, &opt, &dataset, &rows, GrmMethod::Yang, 7)
                .unwrap();
        assert_eq!(effects.len(), m);

        let beta_add: Array1<f64> = effects.iter().map(|e| e.additive).collect();
        let beta_dom: Array1<f64> = effects.iter().map(|e| e.dominance.unwrap()).collect();
        assert_abs_diff_eq!(z_add.dot(&beta_add), state.genetic[0].ebv, epsilon = 1e-8);
        assert_abs_diff_eq!(z_dom.dot(&beta_dom), state.genetic[1].ebv, epsilon = 1e-8);

        let p0 = dosages.column(0).sum() / (2.0 * n as f64);
        assert_abs_diff_eq!(effects[0].frequency, p0, epsilon = 1e-12);
    }

    #[test]
    fn marker_effects_use_whole_fileset_coding_for_a_sample_subset() {
        let (n_fam, m) = (40, 50);
        let mut rng = StdRng::seed_from_u64(5);
        let dosages = Array2::from_shape_fn((n_fam, m), |(i, _)| {
            // The fitted half carries more copies than the rest, so subset
            // frequencies differ from whole-fileset ones.
            let bias = if i % 2 == 0 { 0.6 } else { 0.2 };
            f64::from(u8::from(rng.gen_bool(bias)) + u8::from(rng.gen_bool(bias)))
        });
        let rows: Vec<usize> = (0..n_fam).filter(|i| i % 2 == 0).rev().collect();
        let n = rows.len();

        let z_all = coded(&dosages, GrmKind::Additive);
        let k_all = z_all.iter().map(|v| v * v).sum::<f64>() / n_fam as f64;
        let z_fit = z_all.select(Axis(0), &rows);
        let kinship = z_fit.dot(&z_fit.t()) / k_all;

        let y = Array1::from_shape_fn(n, |_| rng.gen_range(-1.0..1.0));
        let model = FreqModel::new(
            y,
            FixedEffect::intercept_only(n),
            vec![],
            vec![GeneticEffect {
                name: "Additive".into(),
                kind: GrmKind::Additive,
                covariance: kinship,
            }],
        )
        .unwrap();
        let mut state = FreqState::new(&model);
        state.set_sigma(array![0.6, 0.4].view()).unwrap();
        let mut opt = OptimizerState::new(&model);
        refresh(&model, &state, &mut opt).unwrap();
        compute_random_effects(&model, &mut state, &opt);

        let dir = tempdir().unwrap();
        let prefix = dir.path().join("geno");
        write_plink(&prefix, &samples(n_fam), &variants(m), &dosages).unwrap();
        let dataset = PlinkDataset::open(&prefix).unwrap();
        let effects =
            compute_marker_effects(&model, &state, &opt, &dataset, &rows, GrmMethod::Yang, 9)
                .unwrap();

        let beta: Array1<f64> = effects.iter().map(|e| e.additive).collect();
        assert_abs_diff_eq!(z_fit.dot(&beta), state.genetic[0].ebv, epsilon = 1e-8);
        let p0 = dosages.column(0).sum() / (2.0 * n_fam as f64);
        assert_abs_diff_eq!(effects[0].frequency, p0, epsilon = 1e-12);

        let err = compute_marker_effects(&model, &state, &opt, &dataset, &rows, GrmMethod::Su, 9)
            .unwrap_err();
        assert!(err.to_string().contains("built with su"));
    }
}
