//! GCTA-style GRM files: `{prefix}.grm.bin` holds the lower triangle as
//! little-endian f32 in row-major `(i, j <= i)` order, `{prefix}.grm.id` one
//! `FID<TAB>IID` line per sample.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use memmap2::{Advice, Mmap};
use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::data::ids::{IdForm, SampleIndex};
use crate::shared::error::{Diagnostic, GremlError, Result};
use crate::shared::files::{LineReader, open_mmap};

/// Genetic effect class inferred from the GRM prefix.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GrmKind {
    Additive,
    Dominance,
    #[default]
    Unknown,
}

impl GrmKind {
    /// Looks for "add" or "dom" in the file name of `prefix`.
    pub fn from_prefix(prefix: &Path) -> Self {
        let text = prefix
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default();
        if text.contains("add") {
            Self::Additive
        } else if text.contains("dom") {
            Self::Dominance
        } else {
            Self::Unknown
        }
    }

    pub fn label(self) -> Option<&'static str> {
        match self {
            Self::Additive => Some("Additive"),
            Self::Dominance => Some("Dominance"),
            Self::Unknown => None,
        }
    }
}

fn bin_path(prefix: &Path) -> PathBuf {
    let mut raw = prefix.as_os_str().to_owned();
    raw.push(".grm.bin");
    PathBuf::from(raw)
}

fn id_path(prefix: &Path) -> PathBuf {
    let mut raw = prefix.as_os_str().to_owned();
    raw.push(".grm.id");
    PathBuf::from(raw)
}

/// Strips a trailing `.grm.bin`, `.grm.id` or `.grm` from a user-supplied path.
pub fn grm_prefix(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    for suffix in [".grm.bin", ".grm.id", ".grm"] {
        if let Some(stem) = text.strip_suffix(suffix) {
            return PathBuf::from(stem);
        }
    }
    path.to_path_buf()
}

#[inline]
fn lower_triangle_index(i: usize, j: usize) -> usize {
    let (row, col) = if i >= j { (i, j) } else { (j, i) };
    row * (row + 1) / 2 + col
}

/// A memory-mapped GRM and its sample ids.
#[derive(Debug)]
pub struct GrmFile {
    prefix: PathBuf,
    bin_path: PathBuf,
    kind: GrmKind,
    ids: Vec<String>,
    mmap: Mmap,
}

impl GrmFile {
    pub fn open(prefix: &Path, id_form: IdForm) -> Result<Self> {
        let prefix = grm_prefix(prefix);
        let ids = read_grm_ids(&id_path(&prefix), id_form)?;
        let bin_path = bin_path(&prefix);
        let mmap = open_mmap(&bin_path, Advice::Random)?;

        let n = ids.len() as u64;
        let expected = n * (n + 1) / 2 * 4;
        if mmap.len() as u64 != expected {
            return Err(GremlError::shape(
                format!(
                    "file size mismatch: expected {expected} bytes for {n} samples, found {}",
                    mmap.len()
                ),
                Diagnostic::file(&bin_path),
            ));
        }

        Ok(Self {
            kind: GrmKind::from_prefix(&prefix),
            prefix,
            bin_path,
            ids,
            mmap,
        })
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn kind(&self) -> GrmKind {
        self.kind
    }

    /// `Additive`, `Dominance`, or the file stem of the prefix.
    pub fn effect_name(&self) -> String {
        match self.kind.label() {
            Some(label) => label.to_string(),
            None => self
                .prefix
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.prefix.display().to_string()),
        }
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn n_samples(&self) -> usize {
        self.ids.len()
    }

    /// Stored value at file positions `(i, j)`, either triangle.
    pub fn value(&self, i: usize, j: usize) -> f32 {
        let offset = lower_triangle_index(i, j) * 4;
        f32::from_le_bytes([
            self.mmap[offset],
            self.mmap[offset + 1],
            self.mmap[offset + 2],
            self.mmap[offset + 3],
        ])
    }

    /// The stored matrix reordered to `index`: `G[a, b] = file[π(a), π(b)]`.
    pub fn load(&self, index: &SampleIndex) -> Result<Array2<f64>> {
        let positions = self.positions(index)?;
        let n = positions.len();
        let mut out = Array2::<f64>::zeros((n, n));
        out.axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(positions.par_iter())
            .for_each(|(mut row, &src_i)| {
                for (slot, &src_j) in row.iter_mut().zip(&positions) {
                    *slot = f64::from(self.value(src_i, src_j));
                }
            });
        Ok(out)
    }

    /// Same as [`GrmFile::load`] plus the trace/n of the subset.
    pub fn load_unnormalized(&self, index: &SampleIndex) -> Result<(Array2<f64>, f64)> {
        let matrix = self.load(index)?;
        let denominator = trace_denominator(matrix.view());
        Ok((matrix, denominator))
    }

    fn positions(&self, index: &SampleIndex) -> Result<Vec<usize>> {
        let lookup: AHashMap<&str, usize> = self
            .ids
            .iter()
            .enumerate()
            .map(|(pos, id)| (id.as_str(), pos))
            .collect();
        index
            .ids()
            .iter()
            .map(|id| {
                lookup.get(id.as_str()).copied().ok_or_else(|| {
                    GremlError::value(
                        format!("sample ID '{id}' not found in GRM file"),
                        Diagnostic::file(&self.bin_path).with_token(id.as_str()),
                    )
                })
            })
            .collect()
    }
}

/// trace(G) / n, or 0 for an empty matrix.
pub fn trace_denominator(matrix: ArrayView2<f64>) -> f64 {
    let n = matrix.nrows();
    if n == 0 {
        0.0
    } else {
        matrix.diag().sum() / n as f64
    }
}

fn read_grm_ids(path: &Path, id_form: IdForm) -> Result<Vec<String>> {
    let mut reader = LineReader::open(path)?;
    let mut ids = Vec::new();
    while let Some(record) = reader.next_record()? {
        let id = match record.fields[..] {
            [single] => id_form.key(single, single),
            [fid, iid, ..] => id_form.key(fid, iid),
            [] => continue,
        };
        ids.push(id);
    }
    if ids.is_empty() {
        return Err(GremlError::shape(
            "no sample IDs found",
            Diagnostic::file(path),
        ));
    }
    Ok(ids)
}

/// Writes `matrix` (symmetric, only the lower triangle is read) and its ids.
pub fn write_grm(prefix: &Path, matrix: ArrayView2<f64>, ids: &[(String, String)]) -> Result<()> {
    let n = matrix.nrows();
    if matrix.ncols() != n || ids.len() != n {
        return Err(GremlError::programmer(format!(
            "GRM is {:?} with {} ids",
            matrix.dim(),
            ids.len()
        )));
    }

    let bin = bin_path(prefix);
    let mut out = BufWriter::new(File::create(&bin).map_err(|e| GremlError::io(&bin, e))?);
    let mut row_bytes = Vec::with_capacity(n * 4);
    for i in 0..n {
        row_bytes.clear();
        for j in 0..=i {
            row_bytes.extend_from_slice(&(matrix[[i, j]] as f32).to_le_bytes());
        }
        out.write_all(&row_bytes)
            .map_err(|e| GremlError::io(&bin, e))?;
    }
    out.flush().map_err(|e| GremlError::io(&bin, e))?;

    let id = id_path(prefix);
    let mut out = BufWriter::new(File::create(&id).map_err(|e| GremlError::io(&id, e))?);
    for (fid, iid) in ids {
        writeln!(out, "{fid}\t{iid}").map_err(|e| GremlError::io(&id, e))?;
    }
    out.flush().map_err(|e| GremlError::io(&id, e))
}

/// Whole-genome GRM cached for leave-one-chromosome-out derivation.
#[derive(Debug)]
pub struct LocoGrm {
    index: SampleIndex,
    whole: Array2<f64>,
    denominator: f64,
}

impl LocoGrm {
    /// Loads the unnormalized whole-genome matrix subset to `index`.
    pub fn new(whole: &GrmFile, index: &SampleIndex) -> Result<Self> {
        let (whole, denominator) = whole.load_unnormalized(index)?;
        Ok(Self {
            index: index.clone(),
            whole,
            denominator,
        })
    }

    pub fn denominator(&self) -> f64 {
        self.denominator
    }

    pub fn n_samples(&self) -> usize {
        self.index.len()
    }

    /// `(G_w - G_c) / (k_w - k_c)` with the chromosome matrix subset by the same index.
    pub fn derive(&self, chromosome: &GrmFile) -> Result<Array2<f64>> {
        let (chr, chr_denominator) = chromosome.load_unnormalized(&self.index)?;
        let loco_denominator = self.denominator - chr_denominator;
        if loco_denominator <= 0.0 {
            return Err(GremlError::value(
                format!(
                    "LOCO denominator is not positive: chromosome trace/n {chr_denominator} \
                     is not below the whole-genome trace/n {}",
                    self.denominator
                ),
                Diagnostic::file(&bin_path(chromosome.prefix())),
            ));
        }
        Ok((&self.whole - &chr) / loco_denominator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use tempfile::tempdir;

    fn ids(n: usize) -> Vec<(String, String)> {
        (0..n).map(|i| (format!("f{i}"), format!("i{i}"))).collect()
    }

    #[test]
    fn kind_comes_from_the_prefix() {
        assert_eq!(GrmKind::from_prefix(Path::new("out/run.add")), GrmKind::Additive);
        assert_eq!(GrmKind::from_prefix(Path::new("run.dom")), GrmKind::Dominance);
        assert_eq!(GrmKind::from_prefix(Path::new("kinship")), GrmKind::Unknown);
        assert_eq!(GrmKind::from_prefix(Path::new("address/kinship")), GrmKind::Unknown);
        assert_eq!(grm_prefix(Path::new("a/b.grm.bin")), PathBuf::from("a/b"));
    }

    #[test]
    fn lower_triangle_indexing_is_row_major() {
        assert_eq!(lower_triangle_index(0, 0), 0);
        assert_eq!(lower_triangle_index(1, 0), 1);
        assert_eq!(lower_triangle_index(1, 1), 2);
        assert_eq!(lower_triangle_index(2, 1), 4);
        assert_eq!(lower_triangle_index(1, 2), 4);
    }

    #[test]
    fn written_grm_loads_back_in_canonical_order() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("toy");
        let g = array![[1.0, 0.1, 0.2], [0.1, 1.5, 0.3], [0.2, 0.3, 2.0]];
        write_grm(&prefix, g.view(), &ids(3)).unwrap();

        let file = GrmFile::open(&prefix, IdForm::Combined).unwrap();
        assert_eq!(file.n_samples(), 3);
        assert_eq!(file.effect_name(), "toy");

        let index = SampleIndex::from_ids(["f2_i2", "f0_i0"]);
        let loaded = file.load(&index).unwrap();
        // Canonical order is f0_i0, f2_i2.
        assert_abs_diff_eq!(loaded, array![[1.0, 0.2], [0.2, 2.0]], epsilon = 1e-6);

        let (same, k) = file.load_unnormalized(&index).unwrap();
        assert_eq!(same, loaded);
        assert_abs_diff_eq!(k, 1.5, epsilon = 1e-6);
    }

    #[test]
    fn unknown_sample_is_named_in_the_error() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("g");
        write_grm(&prefix, Array2::eye(2).view(), &ids(2)).unwrap();
        let file = GrmFile::open(&prefix, IdForm::Combined).unwrap();
        let err = file
            .load(&SampleIndex::from_ids(["f0_i0", "ghost"]))
            .unwrap_err();
        assert!(err.to_string().contains("sample ID 'ghost' not found in GRM file"));
    }

    #[test]
    fn truncated_binary_is_rejected() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("g");
        write_grm(&prefix, Array2::eye(3).view(), &ids(3)).unwrap();
        let bin = bin_path(&prefix);
        let bytes = std::fs::read(&bin).unwrap();
        std::fs::write(&bin, &bytes[..bytes.len() - 4]).unwrap();
        assert!(matches!(
            GrmFile::open(&prefix, IdForm::Combined),
            Err(GremlError::InputShape { .. })
        ));
    }

    #[test]
    fn loco_subtracts_the_chromosome_and_rescales() {
        let dir = tempdir().unwrap();
        let whole = array![[4.0, 1.0], [1.0, 6.0]];
        let chr = array![[1.0, 0.5], [0.5, 1.0]];
        write_grm(&dir.path().join("w"), whole.view(), &ids(2)).unwrap();
        write_grm(&dir.path().join("c"), chr.view(), &ids(2)).unwrap();

        let index = SampleIndex::from_ids(["f0_i0", "f1_i1"]);
        let w = GrmFile::open(&dir.path().join("w"), IdForm::Combined).unwrap();
        let c = GrmFile::open(&dir.path().join("c"), IdForm::Combined).unwrap();
        let loco = LocoGrm::new(&w, &index).unwrap();
        assert_abs_diff_eq!(loco.denominator(), 5.0);
        let derived = loco.derive(&c).unwrap();
        assert_abs_diff_eq!(derived, (&whole - &chr) / 4.0, epsilon = 1e-6);

        // A chromosome carrying the whole trace leaves nothing to divide by.
        let err = LocoGrm::new(&c, &index).unwrap().derive(&w).unwrap_err();
        assert!(matches!(err, GremlError::InputValue { .. }));
    }
}
