//! Resolves the common sample set across every input and materializes the
//! aligned `(y, X, K...)` of a [`FreqModel`].

use std::path::{Path, PathBuf};

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::data::fixed::{CategoricalEncoding, DiscreteBlock, FixedEffectBuilder, QuantitativeBlock};
use crate::data::grm::GrmFile;
use crate::data::ids::{IdForm, SampleIndex};
use crate::data::plink::PlinkDataset;
use crate::data::tables::{DiscreteTable, PhenotypeTable, QuantitativeTable, RowCounts};
use crate::data::transform::{DEFAULT_BLOM_OFFSET, PhenotypeTransformer, TransformKind};
use crate::model::{FixedEffect, FreqModel, GeneticEffect, RandomEffect};
use crate::observer::RemlObserver;
use crate::shared::error::{Diagnostic, GremlError, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    pub id_form: IdForm,
    /// 0-based column of the phenotype file; 2 is the first after FID and IID.
    pub pheno_column: usize,
    pub transform: TransformKind,
    pub blom_offset: f64,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            id_form: IdForm::Combined,
            pheno_column: 2,
            transform: TransformKind::None,
            blom_offset: DEFAULT_BLOM_OFFSET,
        }
    }
}

/// Aligned inputs ready for fitting.
#[derive(Debug)]
pub struct PreparedData {
    pub model: FreqModel,
    pub index: SampleIndex,
    /// (FID, IID) of every canonical sample.
    pub samples: Vec<(String, String)>,
    pub phenotype: String,
    pub genotype: Option<PlinkDataset>,
    /// `.fam` row of every canonical sample, present with `genotype`.
    pub genotype_rows: Option<Vec<usize>>,
}

pub struct DataPipe<'a> {
    config: PipeConfig,
    observer: &'a mut dyn RemlObserver,
    phenotype: Option<PhenotypeTable>,
    qcovariates: Option<QuantitativeTable>,
    dcovariates: Option<DiscreteTable>,
    random: Option<DiscreteTable>,
    grms: Vec<GrmFile>,
    genotype: Option<PlinkDataset>,
    index: Option<SampleIndex>,
}

impl<'a> DataPipe<'a> {
    pub fn new(config: PipeConfig, observer: &'a mut dyn RemlObserver) -> Self {
        Self {
            config,
            observer,
            phenotype: None,
            qcovariates: None,
            dcovariates: None,
            random: None,
            grms: Vec::new(),
            genotype: None,
            index: None,
        }
    }

    fn report_counts(&mut self, what: &str, path: &Path, counts: RowCounts) {
        self.observer.info(&format!(
            "{what} {}: {} rows read, {} skipped for missing values, {} kept",
            path.display(),
            counts.read,
            counts.skipped,
            counts.kept()
        ));
    }

    pub fn load_phenotypes(&mut self, path: &Path) -> Result<&mut Self> {
        let table = PhenotypeTable::load(path, self.config.pheno_column, self.config.id_form)
            .map_err(|e| e.in_file(path))?;
        self.report_counts("phenotype", path, table.counts);
        self.phenotype = Some(table);
        self.index = None;
        Ok(self)
    }

    pub fn load_qcovariates(&mut self, path: &Path) -> Result<&mut Self> {
        let table =
            QuantitativeTable::load(path, self.config.id_form).map_err(|e| e.in_file(path))?;
        self.report_counts("quantitative covariates", path, table.counts);
        self.qcovariates = Some(table);
        self.index = None;
        Ok(self)
    }

    pub fn load_dcovariates(&mut self, path: &Path) -> Result<&mut Self> {
        let table = DiscreteTable::load(path, self.config.id_form).map_err(|e| e.in_file(path))?;
        self.report_counts("discrete covariates", path, table.counts);
        self.dcovariates = Some(table);
        self.index = None;
        Ok(self)
    }

    /// Every column of `path` becomes a random effect whose covariance is the
    /// incidence product Z Zᵀ of its labels.
    pub fn load_random(&mut self, path: &Path) -> Result<&mut Self> {
        let table = DiscreteTable::load(path, self.config.id_form).map_err(|e| e.in_file(path))?;
        self.report_counts("random effects", path, table.counts);
        self.random = Some(table);
        self.index = None;
        Ok(self)
    }

    pub fn load_grms<P: AsRef<Path>>(&mut self, prefixes: &[P]) -> Result<&mut Self> {
        for prefix in prefixes {
            let grm = GrmFile::open(prefix.as_ref(), self.config.id_form)?;
            self.observer.info(&format!(
                "GRM {} ({}): {} samples",
                grm.prefix().display(),
                grm.effect_name(),
                grm.n_samples()
            ));
            self.grms.push(grm);
        }
        self.index = None;
        Ok(self)
    }

    pub fn load_genotypes(&mut self, bfile: &Path) -> Result<&mut Self> {
        let dataset = PlinkDataset::open(bfile)?;
        self.observer.info(&format!(
            "genotypes {}: {} samples, {} variants",
            dataset.prefix().display(),
            dataset.n_samples(),
            dataset.n_variants()
        ));
        self.genotype = Some(dataset);
        self.index = None;
        Ok(self)
    }

    fn phenotype_path(&self) -> PathBuf {
        self.phenotype
            .as_ref()
            .map(|p| p.path.clone())
            .unwrap_or_default()
    }

    /// Intersects the ids of every loaded source and freezes the result.
    pub fn intersect_samples(&mut self) -> Result<&SampleIndex> {
        let Some(phenotype) = &self.phenotype else {
            return Err(GremlError::programmer(
                "phenotypes must be loaded before intersecting samples",
            ));
        };
        let genotype_ids = self
            .genotype
            .as_ref()
            .map(|g| g.sample_ids(self.config.id_form));

        let mut sets: Vec<(&[String], PathBuf)> =
            vec![(phenotype.ids.as_slice(), phenotype.path.clone())];
        for table in [&self.qcovariates].into_iter().flatten() {
            sets.push((table.ids.as_slice(), table.path.clone()));
        }
        for table in [&self.dcovariates, &self.random].into_iter().flatten() {
            sets.push((table.ids.as_slice(), table.path.clone()));
        }
        for grm in &self.grms {
            sets.push((grm.ids(), grm.prefix().to_path_buf()));
        }
        if let (Some(ids), Some(dataset)) = (&genotype_ids, &self.genotype) {
            sets.push((ids.as_slice(), dataset.prefix().to_path_buf()));
        }

        let mut common = SampleIndex::default();
        for step in 1..=sets.len() {
            common = SampleIndex::intersect(sets[..step].iter().map(|(ids, _)| *ids));
            if common.is_empty() {
                return Err(GremlError::value(
                    "no samples in common with the previously loaded inputs",
                    Diagnostic::file(&sets[step - 1].1),
                ));
            }
        }

        self.observer.info(&format!(
            "{} samples retained after intersecting {} inputs",
            common.len(),
            sets.len()
        ));
        Ok(self.index.insert(common))
    }

    /// Materializes the model on the frozen index, applying the configured
    /// phenotype transform, and releases the loaders.
    pub fn finalize(mut self) -> Result<PreparedData> {
        let index = match self.index.take() {
            Some(index) => index,
            None => self.intersect_samples()?.clone(),
        };
        let pheno_path = self.phenotype_path();
        let Some(phenotype) = self.phenotype.take() else {
            return Err(GremlError::programmer("phenotypes were not loaded"));
        };
        let n = index.len();

        let mut y = phenotype.aligned(&index);
        if y.iter().any(|v| v.is_nan()) {
            return Err(GremlError::programmer(
                "canonical sample without a phenotype after intersection",
            ));
        }
        let samples = phenotype.aligned_pairs(&index)?;

        let mut builder = FixedEffectBuilder::new(n);
        if let Some(table) = &self.qcovariates {
            builder = builder.quantitative(QuantitativeBlock {
                names: table.names.clone(),
                values: table.aligned(&index)?,
            });
        }
        if let Some(table) = &self.dcovariates {
            builder = builder.discrete(DiscreteBlock {
                names: table.names.clone(),
                columns: table.aligned(&index)?,
            });
        }
        let mut fixed = builder.build().map_err(|e| e.in_file(&pheno_path))?;

        let transformer = PhenotypeTransformer::new(self.config.blom_offset);
        match self.config.transform {
            TransformKind::None => {}
            TransformKind::Dint => transformer.apply_dint(y.view_mut())?,
            TransformKind::Iint => {
                transformer.apply_iint(y.view_mut(), fixed.x.view())?;
                fixed = FixedEffect::intercept_only(n);
            }
        }
        if let Some(pos) = y.iter().position(|v| !v.is_finite()) {
            return Err(GremlError::value(
                "phenotype is not finite after transformation",
                Diagnostic::file(&pheno_path).with_token(index.ids()[pos].as_str()),
            ));
        }
        if n < fixed.n_columns() + 1 {
            return Err(GremlError::value(
                format!(
                    "{n} samples cannot identify {} fixed-effect columns",
                    fixed.n_columns()
                ),
                Diagnostic::file(&pheno_path),
            ));
        }

        let mut random = Vec::new();
        if let Some(table) = &self.random {
            for (name, labels) in table.names.iter().zip(table.aligned(&index)?) {
                random.push(incidence_effect(name, &labels));
            }
        }

        let mut genetic = Vec::with_capacity(self.grms.len());
        for grm in &self.grms {
            genetic.push(GeneticEffect {
                name: grm.effect_name(),
                kind: grm.kind(),
                covariance: grm.load(&index)?,
            });
        }

        let genotype = self.genotype.take();
        let genotype_rows = match &genotype {
            Some(dataset) => Some(
                index
                    .gather_rows(&dataset.sample_ids(self.config.id_form))
                    .ok_or_else(|| {
                        GremlError::programmer("canonical sample missing from the .fam file")
                    })?,
            ),
            None => None,
        };

        let model = FreqModel::new(y, fixed, random, genetic)?;
        Ok(PreparedData {
            model,
            index,
            samples,
            phenotype: phenotype.name,
            genotype,
            genotype_rows,
        })
    }
}

/// Random effect of a label column: `K[i, j] = 1` when samples share a level.
fn incidence_effect(name: &str, labels: &[String]) -> RandomEffect {
    let encoding = CategoricalEncoding::from_labels(name, labels);
    let n = labels.len();
    let mut z = Array2::<f64>::zeros((n, encoding.levels.len()));
    for (mut row, label) in z.axis_iter_mut(Axis(0)).zip(labels) {
        if let Ok(level) = encoding.levels.binary_search(label) {
            row[level] = 1.0;
        }
    }
    RandomEffect {
        name: name.to_string(),
        levels: encoding.levels,
        covariance: z.dot(&z.t()),
    }
}
