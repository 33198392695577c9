//! Everything a finished fit writes to disk: the TOML report, per-sample
//! BLUPs, the fixed-effect table and per-marker effects.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::estimator::{EstimatorConfig, FitSummary};
use crate::model::{FreqModel, FreqState};
use crate::predict::effects::SnpEffect;
use crate::shared::error::{GremlError, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FixedRow {
    pub term: String,
    pub estimate: f64,
    pub se: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComponentRow {
    pub name: String,
    pub variance: f64,
    pub se: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heritability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heritability_se: Option<f64>,
}

/// A fit as persisted to `{out}.reml.toml`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemlReport {
    pub n_samples: usize,
    pub phenotype: String,
    pub config: EstimatorConfig,
    pub summary: FitSummary,
    pub fixed: Vec<FixedRow>,
    pub components: Vec<ComponentRow>,
}

impl RemlReport {
    pub fn from_fit(
        model: &FreqModel,
        state: &FreqState,
        config: &EstimatorConfig,
        summary: &FitSummary,
        phenotype: &str,
    ) -> Self {
        let fixed = model
            .fixed
            .names
            .iter()
            .zip(&state.fixed.coeff)
            .zip(&state.fixed.se)
            .map(|((term, &estimate), &se)| FixedRow {
                term: term.clone(),
                estimate,
                se,
            })
            .collect();

        let mut components = vec![ComponentRow {
            name: "e".to_string(),
            variance: state.residual.variance,
            se: state.residual.variance_se,
            heritability: None,
            heritability_se: None,
        }];
        components.extend(model.random.iter().zip(&state.random).map(|(effect, s)| {
            ComponentRow {
                name: effect.name.clone(),
                variance: s.variance,
                se: s.variance_se,
                heritability: None,
                heritability_se: None,
            }
        }));
        components.extend(model.genetic.iter().zip(&state.genetic).map(|(effect, s)| {
            ComponentRow {
                name: effect.name.clone(),
                variance: s.variance,
                se: s.variance_se,
                heritability: Some(s.heritability),
                heritability_se: Some(s.heritability_se),
            }
        }));

        Self {
            n_samples: model.n(),
            phenotype: phenotype.to_string(),
            config: config.clone(),
            summary: summary.clone(),
            fixed,
            components,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self)?;
        let file = fs::File::create(path).map_err(|e| GremlError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(toml_string.as_bytes())
            .and_then(|()| writer.flush())
            .map_err(|e| GremlError::io(path, e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let toml_string = fs::read_to_string(path).map_err(|e| GremlError::io(path, e))?;
        Ok(toml::from_str(&toml_string)?)
    }
}

fn tab_writer(path: &Path) -> Result<csv::Writer<fs::File>> {
    let file = fs::File::create(path).map_err(|e| GremlError::io(path, e))?;
    Ok(csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(file))
}

/// `FID IID {component...}`: one BLUP/EBV column per random and genetic component.
pub fn write_blup(
    path: &Path,
    samples: &[(String, String)],
    model: &FreqModel,
    state: &FreqState,
) -> Result<()> {
    if samples.len() != model.n() {
        return Err(GremlError::programmer(format!(
            "{} sample labels for {} samples",
            samples.len(),
            model.n()
        )));
    }
    let mut writer = tab_writer(path)?;
    let mut header = vec!["FID".to_string(), "IID".to_string()];
    header.extend(model.random.iter().map(|r| r.name.clone()));
    header.extend(model.genetic.iter().map(|g| g.name.clone()));
    writer.write_record(&header)?;

    for (i, (fid, iid)) in samples.iter().enumerate() {
        let mut record = vec![fid.clone(), iid.clone()];
        record.extend(state.random.iter().map(|r| r.blup[i].to_string()));
        record.extend(state.genetic.iter().map(|g| g.ebv[i].to_string()));
        writer.write_record(&record)?;
    }
    writer.flush().map_err(|e| GremlError::io(path, e))
}

/// `term mean se`; dropped reference levels are listed with zero effect.
pub fn write_param(path: &Path, model: &FreqModel, state: &FreqState) -> Result<()> {
    let mut writer = tab_writer(path)?;
    writer.write_record(["term", "mean", "se"])?;
    for ((term, coeff), se) in model
        .fixed
        .names
        .iter()
        .zip(&state.fixed.coeff)
        .zip(&state.fixed.se)
    {
        writer.write_record([term.clone(), coeff.to_string(), se.to_string()])?;
    }
    for term in model.fixed.reference_terms() {
        writer.write_record([term, "0".to_string(), "0".to_string()])?;
    }
    writer.flush().map_err(|e| GremlError::io(path, e))
}

/// `ID Chrom Position A1 A2 A1Freq Add [Dom]`.
pub fn write_snp_eff(path: &Path, effects: &[SnpEffect]) -> Result<()> {
    let with_dominance = effects.iter().any(|e| e.dominance.is_some());
    let mut writer = tab_writer(path)?;
    let mut header = vec!["ID", "Chrom", "Position", "A1", "A2", "A1Freq", "Add"];
    if with_dominance {
        header.push("Dom");
    }
    writer.write_record(&header)?;
    for effect in effects {
        let mut record = vec![
            effect.identifier.clone(),
            effect.chromosome.clone(),
            effect.position.to_string(),
            effect.allele1.clone(),
            effect.allele2.clone(),
            effect.frequency.to_string(),
            effect.additive.to_string(),
        ];
        if with_dominance {
            record.push(effect.dominance.unwrap_or(0.0).to_string());
        }
        writer.write_record(&record)?;
    }
    writer.flush().map_err(|e| GremlError::io(path, e))
}
