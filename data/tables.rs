//! Phenotype and covariate tables. All share the `FID IID ...` header layout
//! and whitespace-delimited rows.

use std::path::{Path, PathBuf};

use ahash::AHashSet;
use ndarray::{Array1, Array2};

use crate::data::ids::{IdForm, SampleIndex};
use crate::shared::error::{Diagnostic, GremlError, Result};
use crate::shared::files::{HeaderedTable, OwnedRecord, is_missing_token, parse_number};

/// Row bookkeeping reported for every loaded table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RowCounts {
    pub read: usize,
    pub skipped: usize,
}

impl RowCounts {
    pub fn kept(&self) -> usize {
        self.read - self.skipped
    }
}

/// One phenotype column keyed by sample id.
#[derive(Clone, Debug)]
pub struct PhenotypeTable {
    pub path: PathBuf,
    pub name: String,
    pub ids: Vec<String>,
    /// (FID, IID) as written in the file, parallel to `ids`.
    pub pairs: Vec<(String, String)>,
    pub values: Vec<f64>,
    pub counts: RowCounts,
}

impl PhenotypeTable {
    /// Loads column `column` (0-based, at least 2) of a phenotype file. Rows
    /// with a non-finite value are skipped and counted.
    pub fn load(path: &Path, column: usize, id_form: IdForm) -> Result<Self> {
        let table = HeaderedTable::read_samples(path, 3)?;
        if column < 2 || column >= table.header.len() {
            return Err(GremlError::shape(
                format!(
                    "phenotype column {column} is out of range; the file has columns 2..{}",
                    table.header.len() - 1
                ),
                Diagnostic::at_line(path, 1),
            ));
        }

        let mut seen = AHashSet::new();
        let mut ids = Vec::with_capacity(table.rows.len());
        let mut pairs = Vec::with_capacity(table.rows.len());
        let mut values = Vec::with_capacity(table.rows.len());
        let mut counts = RowCounts::default();
        for row in &table.rows {
            counts.read += 1;
            let value = parse_number(&row.fields[column], path, row.line, column + 1)?;
            if !value.is_finite() {
                counts.skipped += 1;
                continue;
            }
            let id = row_key(row, id_form);
            check_unique(&mut seen, &id, path, row.line)?;
            ids.push(id);
            pairs.push((row.fields[0].clone(), row.fields[1].clone()));
            values.push(value);
        }

        Ok(Self {
            path: path.to_path_buf(),
            name: table.header[column].clone(),
            ids,
            pairs,
            values,
            counts,
        })
    }

    /// Values in canonical order; ids absent from this table come back as NaN.
    pub fn aligned(&self, index: &SampleIndex) -> Array1<f64> {
        let mut out = Array1::from_elem(index.len(), f64::NAN);
        for (id, &value) in self.ids.iter().zip(&self.values) {
            if let Some(pos) = index.position(id) {
                out[pos] = value;
            }
        }
        out
    }

    /// (FID, IID) of every canonical sample, in canonical order.
    pub fn aligned_pairs(&self, index: &SampleIndex) -> Result<Vec<(String, String)>> {
        let rows = index.gather_rows(&self.ids).ok_or_else(|| {
            GremlError::programmer(format!(
                "{}: canonical sample missing from phenotypes",
                self.path.display()
            ))
        })?;
        Ok(rows.into_iter().map(|r| self.pairs[r].clone()).collect())
    }
}

/// Quantitative covariates: every column after IID is numeric.
#[derive(Clone, Debug)]
pub struct QuantitativeTable {
    pub path: PathBuf,
    pub names: Vec<String>,
    pub ids: Vec<String>,
    pub values: Array2<f64>,
    pub counts: RowCounts,
}

impl QuantitativeTable {
    pub fn load(path: &Path, id_form: IdForm) -> Result<Self> {
        let table = HeaderedTable::read_samples(path, 3)?;
        let names: Vec<String> = table.header[2..].to_vec();
        let width = names.len();

        let mut seen = AHashSet::new();
        let mut ids = Vec::with_capacity(table.rows.len());
        let mut flat = Vec::with_capacity(table.rows.len() * width);
        let mut counts = RowCounts::default();
        let mut row_values = Vec::with_capacity(width);
        for row in &table.rows {
            counts.read += 1;
            row_values.clear();
            for (offset, token) in row.fields[2..].iter().enumerate() {
                row_values.push(parse_number(token, path, row.line, offset + 3)?);
            }
            if row_values.iter().any(|v| !v.is_finite()) {
                counts.skipped += 1;
                continue;
            }
            let id = row_key(row, id_form);
            check_unique(&mut seen, &id, path, row.line)?;
            ids.push(id);
            flat.extend_from_slice(&row_values);
        }

        let values = Array2::from_shape_vec((ids.len(), width), flat)
            .map_err(|e| GremlError::programmer(format!("covariate block shape: {e}")))?;
        Ok(Self {
            path: path.to_path_buf(),
            names,
            ids,
            values,
            counts,
        })
    }

    /// Rows reordered to the canonical index. Every canonical id must be present.
    pub fn aligned(&self, index: &SampleIndex) -> Result<Array2<f64>> {
        let rows = index.gather_rows(&self.ids).ok_or_else(|| {
            GremlError::programmer(format!(
                "{}: canonical sample missing from quantitative covariates",
                self.path.display()
            ))
        })?;
        Ok(self.values.select(ndarray::Axis(0), &rows))
    }
}

/// Discrete covariates: every column after IID is a free-text label.
#[derive(Clone, Debug)]
pub struct DiscreteTable {
    pub path: PathBuf,
    pub names: Vec<String>,
    pub ids: Vec<String>,
    /// Row-major labels, one inner vector per retained sample.
    pub labels: Vec<Vec<String>>,
    pub counts: RowCounts,
}

impl DiscreteTable {
    pub fn load(path: &Path, id_form: IdForm) -> Result<Self> {
        let table = HeaderedTable::read_samples(path, 3)?;
        let names: Vec<String> = table.header[2..].to_vec();

        let mut seen = AHashSet::new();
        let mut ids = Vec::with_capacity(table.rows.len());
        let mut labels = Vec::with_capacity(table.rows.len());
        let mut counts = RowCounts::default();
        for row in &table.rows {
            counts.read += 1;
            let row_labels = &row.fields[2..];
            if row_labels.iter().any(|label| is_missing_token(label)) {
                counts.skipped += 1;
                continue;
            }
            let id = row_key(row, id_form);
            check_unique(&mut seen, &id, path, row.line)?;
            ids.push(id);
            labels.push(row_labels.to_vec());
        }

        Ok(Self {
            path: path.to_path_buf(),
            names,
            ids,
            labels,
            counts,
        })
    }

    /// Labels in canonical order, one vector per variable (column-major).
    pub fn aligned(&self, index: &SampleIndex) -> Result<Vec<Vec<String>>> {
        let rows = index.gather_rows(&self.ids).ok_or_else(|| {
            GremlError::programmer(format!(
                "{}: canonical sample missing from discrete covariates",
                self.path.display()
            ))
        })?;
        Ok((0..self.names.len())
            .map(|var| rows.iter().map(|&r| self.labels[r][var].clone()).collect())
            .collect())
    }
}

fn row_key(row: &OwnedRecord, id_form: IdForm) -> String {
    id_form.key(&row.fields[0], &row.fields[1])
}

fn check_unique(seen: &mut AHashSet<String>, id: &str, path: &Path, line: usize) -> Result<()> {
    if seen.insert(id.to_string()) {
        Ok(())
    } else {
        Err(GremlError::value(
            "duplicate sample id",
            Diagnostic::at_line(path, line).with_token(id),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn phenotype_rows_with_non_finite_values_are_skipped() {
        let file = write_temp("FID\tIID\tht\twt\nf1\ti1\t1.0\t5\nf2\ti2\tNaN\t6\nf3\ti3\tinf\t7\nf4\ti4\t4.0\t8\n");
        let table = PhenotypeTable::load(file.path(), 2, IdForm::Combined).unwrap();
        assert_eq!(table.name, "ht");
        assert_eq!(table.ids, vec!["f1_i1", "f4_i4"]);
        assert_eq!(table.values, vec![1.0, 4.0]);
        assert_eq!(table.counts, RowCounts { read: 4, skipped: 2 });

        let second = PhenotypeTable::load(file.path(), 3, IdForm::IidOnly).unwrap();
        assert_eq!(second.name, "wt");
        assert_eq!(second.ids, vec!["i1", "i2", "i3", "i4"]);

        let index = SampleIndex::from_ids(["f4_i4", "f1_i1"]);
        let pairs = table.aligned_pairs(&index).unwrap();
        assert_eq!(pairs[0], ("f1".to_string(), "i1".to_string()));
        assert_eq!(pairs[1], ("f4".to_string(), "i4".to_string()));
    }

    #[test]
    fn phenotype_column_must_follow_ids() {
        let file = write_temp("FID IID y\nf1 i1 1\n");
        assert!(matches!(
            PhenotypeTable::load(file.path(), 1, IdForm::Combined),
            Err(GremlError::InputShape { .. })
        ));
        assert!(matches!(
            PhenotypeTable::load(file.path(), 3, IdForm::Combined),
            Err(GremlError::InputShape { .. })
        ));
    }

    #[test]
    fn unparsable_phenotype_names_the_token() {
        let file = write_temp("FID IID y\nf1 i1 abc\n");
        let err = PhenotypeTable::load(file.path(), 2, IdForm::Combined).unwrap_err();
        assert!(matches!(err, GremlError::InputValue { .. }));
        assert!(err.to_string().contains("'abc'"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let file = write_temp("FID IID y\nf1 i1 1\nf1 i1 2\n");
        assert!(PhenotypeTable::load(file.path(), 2, IdForm::Combined).is_err());
    }

    #[test]
    fn quantitative_table_aligns_to_index() {
        let file = write_temp("FID IID age bmi\nf1 i1 30 20\nf2 i2 -inf 21\nf3 i3 50 22\n");
        let table = QuantitativeTable::load(file.path(), IdForm::IidOnly).unwrap();
        assert_eq!(table.names, vec!["age", "bmi"]);
        assert_eq!(table.counts.skipped, 1);
        let index = SampleIndex::from_ids(["i3", "i1"]);
        let aligned = table.aligned(&index).unwrap();
        assert_eq!(aligned, ndarray::array![[30.0, 20.0], [50.0, 22.0]]);
    }

    #[test]
    fn discrete_rows_with_missing_labels_are_skipped() {
        let file = write_temp("FID IID sex herd\nf1 i1 M h1\nf2 i2 F NaN\nf3 i3 F h2\nf4 i4 +Inf h1\n");
        let table = DiscreteTable::load(file.path(), IdForm::IidOnly).unwrap();
        assert_eq!(table.ids, vec!["i1", "i3"]);
        assert_eq!(table.counts, RowCounts { read: 4, skipped: 2 });
        let index = SampleIndex::from_ids(["i1", "i3"]);
        let columns = table.aligned(&index).unwrap();
        assert_eq!(columns[0], vec!["M", "F"]);
        assert_eq!(columns[1], vec!["h1", "h2"]);
    }

    #[test]
    fn discrete_table_needs_a_label_column() {
        let file = write_temp("FID IID\nf1 i1\n");
        assert!(matches!(
            DiscreteTable::load(file.path(), IdForm::Combined),
            Err(GremlError::InputShape { .. })
        ));
    }
}
