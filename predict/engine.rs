//! Scores target genotypes with stored marker effects and adds covariate predictions.

use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::data::coding::dominance_code;
use crate::data::ids::{IdForm, SampleIndex};
use crate::data::plink::PlinkDataset;
use crate::data::tables::{DiscreteTable, QuantitativeTable};
use crate::model::INTERCEPT;
use crate::predict::effects::{CovarEffects, SnpEffect, SnpEffects};
use crate::predict::matcher::match_variants;
use crate::shared::error::{Diagnostic, GremlError, Result};

/// Variance denominators below this are clamped to it.
pub const DENOMINATOR_FLOOR: f64 = 1e-10;

/// Sink for messages emitted while predicting.
pub trait PredictObserver {
    fn info(&mut self, message: &str) {
        let _ = message;
    }
    fn warn(&mut self, message: &str) {
        let _ = message;
    }
}

#[derive(Default)]
pub struct NoopPredictObserver;

impl PredictObserver for NoopPredictObserver {}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictConfig {
    pub id_form: IdForm,
    /// Variants decoded per block.
    pub chunk_size: usize,
}

impl Default for PredictConfig {
    fn default() -> Self {
        Self {
            id_form: IdForm::default(),
            chunk_size: 10_000,
        }
    }
}

/// `(g - 2p) / sqrt(2p(1-p)) * beta`; missing dosages contribute nothing.
pub fn additive_contribution(dosage: f64, p: f64, beta: f64) -> f64 {
    if dosage.is_nan() {
        return 0.0;
    }
    let denominator = (2.0 * p * (1.0 - p)).sqrt().max(DENOMINATOR_FLOOR);
    (dosage - 2.0 * p) / denominator * beta
}

/// `(enc - 2p^2) / (2p(1-p)) * beta` with enc in {0, 2p, 4p - 2}.
pub fn dominance_contribution(dosage: f64, p: f64, beta: f64) -> f64 {
    let Some(encoded) = dominance_code(dosage, p) else {
        return 0.0;
    };
    let denominator = (2.0 * p * (1.0 - p)).max(DENOMINATOR_FLOOR);
    (encoded - 2.0 * p * p) / denominator * beta
}

#[derive(Clone, Debug, PartialEq)]
pub struct GeneticScores {
    pub additive: Array1<f64>,
    pub dominance: Option<Array1<f64>>,
}

/// Scores an oriented (samples x markers) dosage block; column `j` uses `effects[j]`.
pub fn score_block(
    block: ArrayView2<f64>,
    effects: &[&SnpEffect],
    with_dominance: bool,
) -> Result<GeneticScores> {
    if block.ncols() != effects.len() {
        return Err(GremlError::programmer(format!(
            "{} genotype columns for {} marker effects",
            block.ncols(),
            effects.len()
        )));
    }
    let n = block.nrows();
    let zeros = || (Array1::<f64>::zeros(n), Array1::<f64>::zeros(n));
    let (additive, dominance) = block
        .axis_iter(Axis(1))
        .into_par_iter()
        .zip(effects.par_iter())
        .fold(zeros, |(mut add, mut dom), (column, effect)| {
            let p = effect.frequency;
            for ((a, d), &g) in add.iter_mut().zip(dom.iter_mut()).zip(column) {
                *a += additive_contribution(g, p, effect.additive);
                if let (true, Some(beta)) = (with_dominance, effect.dominance) {
                    *d += dominance_contribution(g, p, beta);
                }
            }
            (add, dom)
        })
        .reduce(zeros, |(a1, d1), (a2, d2)| (a1 + a2, d1 + d2));
    Ok(GeneticScores {
        additive,
        dominance: with_dominance.then_some(dominance),
    })
}

/// Covariate effects together with the tables holding the target samples' covariates.
#[derive(Clone, Copy, Debug)]
pub struct CovariateInputs<'a> {
    pub effects: &'a CovarEffects,
    pub quantitative: Option<&'a QuantitativeTable>,
    pub discrete: Option<&'a DiscreteTable>,
}

impl CovariateInputs<'_> {
    fn sample_sets(&self) -> Vec<&[String]> {
        let mut sets = Vec::new();
        if let Some(table) = self.quantitative {
            sets.push(table.ids.as_slice());
        }
        if let Some(table) = self.discrete {
            sets.push(table.ids.as_slice());
        }
        sets
    }

    /// Per-term contributions in canonical order: the intercept, then every
    /// continuous covariate, then every categorical covariate.
    pub fn predict(&self, index: &SampleIndex) -> Result<(Vec<String>, Array2<f64>)> {
        let n = index.len();
        let mut names = vec![INTERCEPT.to_string()];
        let mut columns = vec![Array1::from_elem(n, self.effects.intercept())];

        if let Some(table) = self.quantitative {
            let values = table.aligned(index)?;
            for (name, column) in table.names.iter().zip(values.axis_iter(Axis(1))) {
                let beta = self.effects.continuous(name)?;
                names.push(name.clone());
                columns.push(column.mapv(|v| v * beta));
            }
        }
        if let Some(table) = self.discrete {
            let labels = table.aligned(index)?;
            for (name, levels) in table.names.iter().zip(labels) {
                let contribution = levels
                    .iter()
                    .map(|level| self.effects.level(name, level))
                    .collect::<Result<Array1<f64>>>()?;
                names.push(name.clone());
                columns.push(contribution);
            }
        }

        let values = Array2::from_shape_fn((n, columns.len()), |(i, j)| columns[j][i]);
        Ok((names, values))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Predictions {
    pub samples: Vec<(String, String)>,
    pub covariate_names: Vec<String>,
    /// Samples x covariate terms.
    pub covariates: Array2<f64>,
    pub additive: Array1<f64>,
    pub dominance: Option<Array1<f64>>,
}

impl Predictions {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn total(&self) -> Array1<f64> {
        let mut total = self.covariates.sum_axis(Axis(1)) + &self.additive;
        if let Some(dominance) = &self.dominance {
            total += dominance;
        }
        total
    }
}

/// Predicts every target sample that also has complete covariates.
/// Samples are reported in canonical (sorted id) order.
pub fn predict(
    effects: &SnpEffects,
    covariates: Option<CovariateInputs<'_>>,
    dataset: &PlinkDataset,
    config: &PredictConfig,
    observer: &mut dyn PredictObserver,
) -> Result<Predictions> {
    let fam_ids = dataset.sample_ids(config.id_form);
    let mut sets: Vec<&[String]> = vec![fam_ids.as_slice()];
    if let Some(inputs) = &covariates {
        sets.extend(inputs.sample_sets());
    }
    let index = SampleIndex::intersect(sets);
    if index.is_empty() {
        return Err(GremlError::value(
            "no target sample has complete covariates",
            Diagnostic::file(dataset.prefix()),
        ));
    }
    if index.len() < fam_ids.len() {
        observer.warn(&format!(
            "{} of {} target samples lack covariates and are not predicted",
            fam_ids.len() - index.len(),
            fam_ids.len()
        ));
    }
    let rows = index
        .gather_rows(&fam_ids)
        .ok_or_else(|| GremlError::programmer("canonical sample missing from .fam"))?;
    let samples = rows
        .iter()
        .map(|&r| {
            let record = &dataset.samples()[r];
            (record.family_id.clone(), record.individual_id.clone())
        })
        .collect();

    let (matched, summary) = match_variants(effects.effects(), dataset.variants());
    observer.info(&format!(
        "{} markers matched ({} reversed), {} allele mismatches, {} absent from target",
        summary.kept + summary.reversed,
        summary.reversed,
        summary.allele_mismatch,
        summary.absent
    ));
    if matched.is_empty() {
        return Err(GremlError::value(
            "no marker effect matches a target variant",
            Diagnostic::file(dataset.prefix()),
        ));
    }

    let n = rows.len();
    let mut additive = Array1::<f64>::zeros(n);
    let mut dominance = effects.has_dominance().then(|| Array1::<f64>::zeros(n));
    for chunk in matched.chunks(config.chunk_size.max(1)) {
        let variants: Vec<usize> = chunk.iter().map(|m| m.variant).collect();
        let mut block = dataset.decode_block(&variants, Some(&rows))?;
        for (mut column, m) in block.axis_iter_mut(Axis(1)).zip(chunk) {
            if m.reversed {
                column.mapv_inplace(|g| 2.0 - g);
            }
        }
        let chunk_effects: Vec<&SnpEffect> = chunk
            .iter()
            .map(|m| &effects.effects()[m.effect])
            .collect();
        let scores = score_block(block.view(), &chunk_effects, dominance.is_some())?;
        additive += &scores.additive;
        if let (Some(total), Some(part)) = (dominance.as_mut(), scores.dominance.as_ref()) {
            *total += part;
        }
    }

    let (covariate_names, covariates) = match covariates {
        Some(inputs) => inputs.predict(&index)?,
        None => (Vec::new(), Array2::zeros((n, 0))),
    };
    Ok(Predictions {
        samples,
        covariate_names,
        covariates,
        additive,
        dominance,
    })
}
