//! Assembles the fixed-effect design `[intercept | quantitative | one-hot]`.

use itertools::Itertools;
use ndarray::{Array2, Axis, s};

use crate::model::{FixedEffect, INTERCEPT};
use crate::shared::error::{Diagnostic, GremlError, Result};

/// Quantitative covariates aligned to the canonical index.
#[derive(Clone, Debug)]
pub struct QuantitativeBlock {
    pub names: Vec<String>,
    pub values: Array2<f64>,
}

/// Discrete covariates aligned to the canonical index, one label vector per variable.
#[derive(Clone, Debug)]
pub struct DiscreteBlock {
    pub names: Vec<String>,
    pub columns: Vec<Vec<String>>,
}

/// One categorical variable after level discovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CategoricalEncoding {
    pub name: String,
    /// Sorted distinct levels; the first is the dropped reference.
    pub levels: Vec<String>,
}

impl CategoricalEncoding {
    pub fn from_labels(name: &str, labels: &[String]) -> Self {
        Self {
            name: name.to_string(),
            levels: labels.iter().cloned().sorted().dedup().collect(),
        }
    }

    pub fn reference(&self) -> Option<&str> {
        self.levels.first().map(String::as_str)
    }

    /// Levels that receive an indicator column.
    pub fn encoded_levels(&self) -> &[String] {
        if self.levels.len() < 2 {
            &[]
        } else {
            &self.levels[1..]
        }
    }
}

#[derive(Debug, Default)]
pub struct FixedEffectBuilder {
    n: usize,
    quantitative: Option<QuantitativeBlock>,
    discrete: Option<DiscreteBlock>,
}

impl FixedEffectBuilder {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            ..Self::default()
        }
    }

    pub fn quantitative(mut self, block: QuantitativeBlock) -> Self {
        self.quantitative = Some(block);
        self
    }

    pub fn discrete(mut self, block: DiscreteBlock) -> Self {
        self.discrete = Some(block);
        self
    }

    pub fn build(self) -> Result<FixedEffect> {
        let n = self.n;
        let mut names = vec![INTERCEPT.to_string()];
        let mut levels = vec![None];
        let mut reference_levels = vec![None];

        if let Some(block) = &self.quantitative {
            if block.values.dim() != (n, block.names.len()) {
                return Err(GremlError::programmer(format!(
                    "quantitative block is {:?} for {n} samples and {} names",
                    block.values.dim(),
                    block.names.len()
                )));
            }
            if let Some(name) = block.names.iter().find(|name| *name == INTERCEPT) {
                return Err(GremlError::value(
                    "duplicate intercept column",
                    Diagnostic::default().with_token(name.as_str()),
                ));
            }
            for name in &block.names {
                names.push(name.clone());
                levels.push(None);
                reference_levels.push(None);
            }
        }

        let mut encodings = Vec::new();
        if let Some(block) = &self.discrete {
            if block.columns.len() != block.names.len() {
                return Err(GremlError::programmer(format!(
                    "{} discrete columns for {} names",
                    block.columns.len(),
                    block.names.len()
                )));
            }
            for (name, labels) in block.names.iter().zip(&block.columns) {
                if labels.len() != n {
                    return Err(GremlError::programmer(format!(
                        "discrete column '{name}' holds {} labels for {n} samples",
                        labels.len()
                    )));
                }
                let encoding = CategoricalEncoding::from_labels(name, labels);
                let reference = encoding.reference().map(str::to_string);
                for level in encoding.encoded_levels() {
                    names.push(format!("{name}_{level}"));
                    levels.push(Some(level.clone()));
                    reference_levels.push(reference.clone());
                }
                encodings.push((encoding, labels));
            }
        }

        let mut x = Array2::<f64>::zeros((n, names.len()));
        x.column_mut(0).fill(1.0);
        let mut col = 1;
        if let Some(block) = &self.quantitative {
            let width = block.names.len();
            x.slice_mut(s![.., col..col + width]).assign(&block.values);
            col += width;
        }
        for (encoding, labels) in encodings {
            for level in encoding.encoded_levels() {
                let mut column = x.index_axis_mut(Axis(1), col);
                for (slot, label) in column.iter_mut().zip(labels) {
                    if label == level {
                        *slot = 1.0;
                    }
                }
                col += 1;
            }
        }

        Ok(FixedEffect {
            names,
            levels,
            reference_levels,
            x,
        })
    }
}
