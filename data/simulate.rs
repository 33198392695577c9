//! Simulates phenotypes from a PLINK fileset with known additive and dominance
//! heritabilities.

use std::fs::File;
use std::path::Path;

use ndarray::parallel::prelude::*;
use ndarray::{Array1, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::data::grm::GrmKind;
use crate::data::grm_builder::{DEFAULT_CHUNK_SIZE, GrmMethod};
use crate::data::plink::PlinkDataset;
use crate::shared::error::{Diagnostic, GremlError, Result};

/// One component of an effect-size mixture: a share of the variants whose
/// effects are drawn from N(0, variance).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EffectClass {
    pub proportion: f64,
    pub variance: f64,
}

impl EffectClass {
    /// Pairs `--*-var` values with `--*-prop` values.
    pub fn zip(variances: &[f64], proportions: &[f64], label: &str) -> Result<Vec<Self>> {
        if variances.len() != proportions.len() {
            return Err(GremlError::value(
                format!(
                    "{label} effect classes: {} variances but {} proportions",
                    variances.len(),
                    proportions.len()
                ),
                Diagnostic::default(),
            ));
        }
        Ok(variances
            .iter()
            .zip(proportions)
            .map(|(&variance, &proportion)| Self {
                proportion,
                variance,
            })
            .collect())
    }
}

fn validate_classes(classes: &[EffectClass], label: &str) -> Result<()> {
    let invalid = |message: String| Err(GremlError::value(message, Diagnostic::default()));
    if classes.is_empty() {
        return invalid(format!("{label} effect classes must not be empty"));
    }
    if classes.iter().any(|c| !(c.proportion > 0.0)) {
        return invalid(format!("{label} effect class proportions must be positive"));
    }
    if classes.iter().any(|c| !(c.variance >= 0.0)) {
        return invalid(format!("{label} effect class variances must be non-negative"));
    }
    let total: f64 = classes.iter().map(|c| c.proportion).sum();
    if (total - 1.0).abs() > 1e-6 {
        return invalid(format!(
            "{label} effect class proportions must sum to 1 (got {total})"
        ));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulateConfig {
    /// Additive share of phenotypic variance, in (0, 1).
    pub h2: f64,
    /// Dominance share of phenotypic variance, in [0, 1); 0 disables dominance.
    pub d2: f64,
    pub additive_classes: Vec<EffectClass>,
    pub dominance_classes: Vec<EffectClass>,
    pub intercept: f64,
    pub seed: u64,
    pub chunk_size: usize,
}

impl Default for SimulateConfig {
    fn default() -> Self {
        let single = vec![EffectClass {
            proportion: 1.0,
            variance: 0.01,
        }];
        Self {
            h2: 0.5,
            d2: 0.0,
            additive_classes: single.clone(),
            dominance_classes: single,
            intercept: 0.0,
            seed: 42,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl SimulateConfig {
    pub fn has_dominance(&self) -> bool {
        self.d2 > 0.0
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Err(GremlError::value(message, Diagnostic::default()));
        if !(self.h2 > 0.0 && self.h2 < 1.0) {
            return invalid("h2 must lie in (0, 1)");
        }
        if !(self.d2 >= 0.0 && self.d2 < 1.0) {
            return invalid("d2 must lie in [0, 1)");
        }
        if self.h2 + self.d2 >= 1.0 {
            return invalid("h2 + d2 must be below 1");
        }
        if self.chunk_size == 0 {
            return Err(GremlError::programmer("simulation chunk size must be positive"));
        }
        validate_classes(&self.additive_classes, "additive")?;
        if self.has_dominance() {
            validate_classes(&self.dominance_classes, "dominance")?;
        }
        Ok(())
    }
}

/// The true per-variant effects behind a simulated phenotype.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CausalEffect {
    pub additive: f64,
    pub dominance: f64,
    pub additive_class: usize,
    pub dominance_class: usize,
}

#[derive(Clone, Debug)]
pub struct Simulation {
    pub samples: Vec<(String, String)>,
    pub phenotypes: Array1<f64>,
    pub additive: Array1<f64>,
    /// Dominance values after rescaling to the requested d2; zeros without dominance.
    pub dominance: Array1<f64>,
    pub effects: Vec<CausalEffect>,
    pub realised_h2: f64,
    pub realised_d2: f64,
}

/// Sample variance with an n - 1 denominator.
fn variance(values: &Array1<f64>) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values.var(1.0)
}

/// Splits `count` variants into classes by proportion, rounding each class
/// and giving the remainder to the last, then shuffles the labels.
fn assign_classes(classes: &[EffectClass], count: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut labels = Vec::with_capacity(count);
    for (class, c) in classes.iter().enumerate() {
        let remaining = count - labels.len();
        let size = if class + 1 == classes.len() {
            remaining
        } else {
            ((count as f64 * c.proportion).round() as usize).min(remaining)
        };
        labels.extend(std::iter::repeat_n(class, size));
    }
    labels.shuffle(rng);
    labels
}

fn draw_effects(
    classes: &[EffectClass],
    labels: &[usize],
    rng: &mut StdRng,
) -> Result<Vec<f64>> {
    let normals = classes
        .iter()
        .map(|c| {
            Normal::new(0.0, c.variance.sqrt()).map_err(|e| {
                GremlError::value(
                    format!("effect class variance {}: {e}", c.variance),
                    Diagnostic::default(),
                )
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(labels
        .iter()
        .map(|&class| {
            if classes[class].variance == 0.0 {
                0.0
            } else {
                normals[class].sample(rng)
            }
        })
        .collect())
}

pub struct PhenotypeSimulator<'a> {
    dataset: &'a PlinkDataset,
    config: SimulateConfig,
}

impl<'a> PhenotypeSimulator<'a> {
    pub fn new(dataset: &'a PlinkDataset, config: SimulateConfig) -> Result<Self> {
        config.validate()?;
        if dataset.n_variants() == 0 || dataset.n_samples() < 2 {
            return Err(GremlError::shape(
                "simulation needs at least two samples and one variant",
                Diagnostic::file(dataset.prefix()),
            ));
        }
        Ok(Self { dataset, config })
    }

    pub fn config(&self) -> &SimulateConfig {
        &self.config
    }

    /// Draws every variant's effects, sums the coded genotypes into genetic
    /// values and adds residual noise sized so that the additive values
    /// explain h2 and the dominance values d2 of the phenotypic variance.
    pub fn run(&self) -> Result<Simulation> {
        let config = &self.config;
        let n_variants = self.dataset.n_variants();
        let mut rng = StdRng::seed_from_u64(config.seed);

        let additive_labels = assign_classes(&config.additive_classes, n_variants, &mut rng);
        let dominance_labels = if config.has_dominance() {
            assign_classes(&config.dominance_classes, n_variants, &mut rng)
        } else {
            vec![0; n_variants]
        };
        let additive_effects = draw_effects(&config.additive_classes, &additive_labels, &mut rng)?;
        let dominance_effects = if config.has_dominance() {
            draw_effects(&config.dominance_classes, &dominance_labels, &mut rng)?
        } else {
            vec![0.0; n_variants]
        };

        let n = self.dataset.n_samples();
        let mut additive = Array1::<f64>::zeros(n);
        let mut dominance = Array1::<f64>::zeros(n);
        let indices: Vec<usize> = (0..n_variants).collect();
        for chunk in indices.chunks(config.chunk_size) {
            let block = self.dataset.decode_block(chunk, None)?;
            let range = chunk[0]..chunk[0] + chunk.len();
            if config.has_dominance() {
                let mut coded = block.clone();
                coded
                    .axis_iter_mut(Axis(1))
                    .into_par_iter()
                    .for_each(|column| {
                        GrmMethod::Yang.code(GrmKind::Dominance, column);
                    });
                let beta = Array1::from(dominance_effects[range.clone()].to_vec());
                dominance += &coded.dot(&beta);
            }
            let mut coded = block;
            coded
                .axis_iter_mut(Axis(1))
                .into_par_iter()
                .for_each(|column| {
                    GrmMethod::Yang.code(GrmKind::Additive, column);
                });
            let beta = Array1::from(additive_effects[range].to_vec());
            additive += &coded.dot(&beta);
        }

        let genetic_variance = variance(&additive);
        if !(genetic_variance > 0.0) {
            return Err(GremlError::value(
                "simulated additive values have no variance; every variant is monomorphic or every effect is zero",
                Diagnostic::file(self.dataset.prefix()),
            ));
        }
        let (h2, d2) = (config.h2, config.d2);
        if config.has_dominance() {
            let raw = variance(&dominance);
            if raw > 0.0 {
                dominance *= (genetic_variance * d2 / h2 / raw).sqrt();
            } else {
                dominance.fill(0.0);
            }
        }
        let residual_variance = genetic_variance * (1.0 - h2 - d2) / h2;
        let residual = Normal::new(0.0, residual_variance.max(0.0).sqrt()).map_err(|e| {
            GremlError::numerical(format!("residual variance {residual_variance}: {e}"))
        })?;
        let noise: Array1<f64> = (0..n).map(|_| residual.sample(&mut rng)).collect();

        let phenotypes = &additive + &dominance + &noise + config.intercept;
        let phenotypic_variance = variance(&phenotypes);
        let realised_h2 = genetic_variance / phenotypic_variance;
        let realised_d2 = if config.has_dominance() {
            variance(&dominance) / phenotypic_variance
        } else {
            0.0
        };

        let effects = (0..n_variants)
            .map(|j| CausalEffect {
                additive: additive_effects[j],
                dominance: dominance_effects[j],
                additive_class: additive_labels[j],
                dominance_class: dominance_labels[j],
            })
            .collect();
        let samples = self
            .dataset
            .samples()
            .iter()
            .map(|s| (s.family_id.clone(), s.individual_id.clone()))
            .collect();

        Ok(Simulation {
            samples,
            phenotypes,
            additive,
            dominance,
            effects,
            realised_h2,
            realised_d2,
        })
    }
}

fn tab_writer(path: &Path) -> Result<csv::Writer<File>> {
    let file = File::create(path).map_err(|e| GremlError::io(path, e))?;
    Ok(csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(file))
}

/// `FID IID phenotype`, readable as a phenotype table.
pub fn write_phenotypes(path: &Path, simulation: &Simulation) -> Result<()> {
    let mut writer = tab_writer(path)?;
    writer.write_record(["FID", "IID", "phenotype"])?;
    for ((fid, iid), value) in simulation.samples.iter().zip(&simulation.phenotypes) {
        writer.write_record([fid.as_str(), iid.as_str(), value.to_string().as_str()])?;
    }
    writer.flush().map_err(|e| GremlError::io(path, e))
}

/// `SNP additive_effect dominance_effect add_class dom_class`, one row per variant.
pub fn write_causal_effects(
    path: &Path,
    dataset: &PlinkDataset,
    simulation: &Simulation,
) -> Result<()> {
    if simulation.effects.len() != dataset.n_variants() {
        return Err(GremlError::programmer(format!(
            "{} causal effects for {} variants",
            simulation.effects.len(),
            dataset.n_variants()
        )));
    }
    let mut writer = tab_writer(path)?;
    writer.write_record(["SNP", "additive_effect", "dominance_effect", "add_class", "dom_class"])?;
    for (variant, effect) in dataset.variants().iter().zip(&simulation.effects) {
        writer.write_record([
            variant.identifier.clone(),
            effect.additive.to_string(),
            effect.dominance.to_string(),
            effect.additive_class.to_string(),
            effect.dominance_class.to_string(),
        ])?;
    }
    writer.flush().map_err(|e| GremlError::io(path, e))
}
