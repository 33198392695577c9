//! Loaders for `.snp.eff` marker effects and `.param` covariate effects.

use std::path::{Path, PathBuf};

use ahash::AHashMap;

use crate::model::INTERCEPT;
use crate::shared::error::{Diagnostic, GremlError, Result};
use crate::shared::files::{HeaderedTable, parse_number};

const SNP_EFF_COLUMNS: [&str; 7] = ["ID", "Chrom", "Position", "A1", "A2", "A1Freq", "Add"];

/// Effect of one marker, with `frequency` the A1 frequency in the training data.
#[derive(Clone, Debug, PartialEq)]
pub struct SnpEffect {
    pub identifier: String,
    pub chromosome: String,
    pub position: u64,
    pub allele1: String,
    pub allele2: String,
    pub frequency: f64,
    pub additive: f64,
    pub dominance: Option<f64>,
}

#[derive(Clone, Debug, Default)]
pub struct SnpEffects {
    effects: Vec<SnpEffect>,
    has_dominance: bool,
}

impl SnpEffects {
    pub fn new(effects: Vec<SnpEffect>) -> Self {
        let has_dominance = effects.iter().any(|e| e.dominance.is_some());
        Self {
            effects,
            has_dominance,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let table = HeaderedTable::read(path, SNP_EFF_COLUMNS.len())?;
        for (idx, expected) in SNP_EFF_COLUMNS.iter().enumerate() {
            if !table.header[idx].eq_ignore_ascii_case(expected) {
                return Err(GremlError::shape(
                    format!("expected column '{expected}' in position {}", idx + 1),
                    Diagnostic::at_line(path, 1)
                        .with_column(idx + 1)
                        .with_token(table.header[idx].as_str()),
                ));
            }
        }
        let has_dominance = table
            .header
            .get(7)
            .is_some_and(|name| name.eq_ignore_ascii_case("Dom"));

        let mut effects = Vec::with_capacity(table.rows.len());
        for row in &table.rows {
            let f = &row.fields;
            let position = f[2].parse::<u64>().map_err(|_| {
                GremlError::value(
                    "expected a base-pair position",
                    Diagnostic::at_line(path, row.line)
                        .with_column(3)
                        .with_token(f[2].as_str()),
                )
            })?;
            let frequency = parse_number(&f[5], path, row.line, 6)?;
            let additive = parse_number(&f[6], path, row.line, 7)?;
            let dominance = if has_dominance {
                Some(parse_number(&f[7], path, row.line, 8)?)
            } else {
                None
            };
            if !(0.0..=1.0).contains(&frequency) {
                return Err(GremlError::value(
                    "allele frequency must lie in [0, 1]",
                    Diagnostic::at_line(path, row.line)
                        .with_column(6)
                        .with_token(f[5].as_str()),
                ));
            }
            effects.push(SnpEffect {
                identifier: f[0].clone(),
                chromosome: f[1].clone(),
                position,
                allele1: f[3].clone(),
                allele2: f[4].clone(),
                frequency,
                additive,
                dominance,
            });
        }
        Ok(Self {
            effects,
            has_dominance,
        })
    }

    pub fn effects(&self) -> &[SnpEffect] {
        &self.effects
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn has_dominance(&self) -> bool {
        self.has_dominance
    }
}

/// Fixed-effect coefficients keyed by term name.
#[derive(Clone, Debug)]
pub struct CovarEffects {
    path: PathBuf,
    intercept: f64,
    terms: AHashMap<String, f64>,
}

impl CovarEffects {
    pub fn intercept_only(intercept: f64) -> Self {
        Self {
            path: PathBuf::new(),
            intercept,
            terms: AHashMap::new(),
        }
    }

    /// Reads `term value ...` rows after a header line. A missing intercept is fatal.
    pub fn load(path: &Path) -> Result<Self> {
        let table = HeaderedTable::read(path, 2)?;
        let mut intercept = None;
        let mut terms = AHashMap::with_capacity(table.rows.len());
        for row in &table.rows {
            let value = parse_number(&row.fields[1], path, row.line, 2)?;
            if row.fields[0] == INTERCEPT {
                intercept = Some(value);
            } else {
                terms.insert(row.fields[0].clone(), value);
            }
        }
        let Some(intercept) = intercept.filter(|v| v.is_finite()) else {
            return Err(GremlError::value(
                "no finite Intercept term",
                Diagnostic::file(path),
            ));
        };
        Ok(Self {
            path: path.to_path_buf(),
            intercept,
            terms,
        })
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    pub fn continuous(&self, variable: &str) -> Result<f64> {
        self.terms.get(variable).copied().ok_or_else(|| {
            GremlError::value(
                format!("Missing coefficient for continuous variable '{variable}'"),
                Diagnostic::file(&self.path),
            )
        })
    }

    pub fn level(&self, variable: &str, level: &str) -> Result<f64> {
        self.terms
            .get(&format!("{variable}_{level}"))
            .copied()
            .ok_or_else(|| {
                GremlError::value(
                    format!("Missing coefficient for level '{level}' of variable '{variable}'"),
                    Diagnostic::file(&self.path).with_token(level),
                )
            })
    }
}
