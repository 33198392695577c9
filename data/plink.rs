//! PLINK `.bed/.bim/.fam` access. Genotypes are decoded as A1 dosages:
//! `00 -> 2`, `01 -> missing`, `10 -> 1`, `11 -> 0`.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use memmap2::{Advice, Mmap};
use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayViewMut1, Axis, ShapeBuilder};

use crate::data::ids::IdForm;
use crate::shared::error::{Diagnostic, GremlError, Result};
use crate::shared::files::{LineReader, open_mmap, plink_prefix, with_suffix};

const PLINK_MAGIC: [u8; 3] = [0x6c, 0x1b, 0x01];
const PLINK_HEADER_LEN: usize = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleRecord {
    pub family_id: String,
    pub individual_id: String,
    pub paternal_id: String,
    pub maternal_id: String,
    pub sex: String,
    pub phenotype: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VariantRecord {
    pub chromosome: String,
    pub identifier: String,
    pub genetic_distance: String,
    pub position: u64,
    pub allele1: String,
    pub allele2: String,
}

/// A memory-mapped PLINK fileset.
#[derive(Debug)]
pub struct PlinkDataset {
    prefix: PathBuf,
    bed: Mmap,
    samples: Vec<SampleRecord>,
    variants: Vec<VariantRecord>,
    bytes_per_variant: usize,
}

impl PlinkDataset {
    /// Opens `{prefix}.bed/.bim/.fam`; a trailing `.bed` on the prefix is accepted.
    pub fn open(path: &Path) -> Result<Self> {
        let prefix = plink_prefix(path);
        let bed_path = with_suffix(&prefix, "bed");
        let bim_path = with_suffix(&prefix, "bim");
        let fam_path = with_suffix(&prefix, "fam");

        let samples = read_fam_records(&fam_path)?;
        if samples.is_empty() {
            return Err(GremlError::shape(
                "no samples found in .fam",
                Diagnostic::file(&fam_path),
            ));
        }
        let variants = read_bim_records(&bim_path)?;
        if variants.is_empty() {
            return Err(GremlError::shape(
                "no variants found in .bim",
                Diagnostic::file(&bim_path),
            ));
        }

        let bed = open_mmap(&bed_path, Advice::Sequential)?;
        validate_bed_header(&bed, &bed_path)?;

        let bytes_per_variant = samples.len().div_ceil(4);
        let expected = bytes_per_variant
            .checked_mul(variants.len())
            .and_then(|payload| payload.checked_add(PLINK_HEADER_LEN))
            .ok_or_else(|| {
                GremlError::shape("declared .bed size overflows", Diagnostic::file(&bed_path))
            })?;
        if bed.len() != expected {
            return Err(GremlError::shape(
                format!(
                    "expected {expected} bytes for {} samples x {} variants, found {}",
                    samples.len(),
                    variants.len(),
                    bed.len()
                ),
                Diagnostic::file(&bed_path),
            ));
        }

        Ok(Self {
            prefix,
            bed,
            samples,
            variants,
            bytes_per_variant,
        })
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn samples(&self) -> &[SampleRecord] {
        &self.samples
    }

    pub fn variants(&self) -> &[VariantRecord] {
        &self.variants
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn n_variants(&self) -> usize {
        self.variants.len()
    }

    /// Sample keys in `.fam` order.
    pub fn sample_ids(&self, id_form: IdForm) -> Vec<String> {
        self.samples
            .iter()
            .map(|s| id_form.key(&s.family_id, &s.individual_id))
            .collect()
    }

    fn variant_bytes(&self, variant: usize) -> &[u8] {
        let start = PLINK_HEADER_LEN + variant * self.bytes_per_variant;
        &self.bed[start..start + self.bytes_per_variant]
    }

    /// Decodes one variant into `dest`. With `rows`, `dest[k]` receives the
    /// genotype of `.fam` row `rows[k]`; otherwise all samples in `.fam` order.
    pub fn decode_variant(
        &self,
        variant: usize,
        rows: Option<&[usize]>,
        mut dest: ArrayViewMut1<f64>,
    ) -> Result<()> {
        if variant >= self.variants.len() {
            return Err(GremlError::programmer(format!(
                "variant {variant} out of range ({} variants)",
                self.variants.len()
            )));
        }
        let expected = rows.map_or(self.samples.len(), <[usize]>::len);
        if dest.len() != expected {
            return Err(GremlError::programmer(format!(
                "decode buffer holds {} values, expected {expected}",
                dest.len()
            )));
        }

        let bytes = self.variant_bytes(variant);
        let table = decode_table();
        match rows {
            Some(rows) => {
                for (slot, &row) in dest.iter_mut().zip(rows) {
                    *slot = table[bytes[row / 4] as usize][row % 4];
                }
            }
            None => {
                for (idx, slot) in dest.iter_mut().enumerate() {
                    *slot = table[bytes[idx / 4] as usize][idx % 4];
                }
            }
        }
        Ok(())
    }

    /// Decodes `variants` into a column-major (samples x variants) block in parallel.
    pub fn decode_block(&self, variants: &[usize], rows: Option<&[usize]>) -> Result<Array2<f64>> {
        let n_rows = rows.map_or(self.samples.len(), <[usize]>::len);
        let mut block = Array2::<f64>::zeros((n_rows, variants.len()).f());
        block
            .axis_iter_mut(Axis(1))
            .into_par_iter()
            .zip(variants.par_iter())
            .try_for_each(|(column, &variant)| self.decode_variant(variant, rows, column))?;
        Ok(block)
    }
}

fn decode_table() -> &'static [[f64; 4]; 256] {
    static TABLE: OnceLock<[[f64; 4]; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [[0.0f64; 4]; 256];
        for byte in 0u16..256 {
            for offset in 0..4 {
                let code = ((byte >> (offset * 2)) & 0b11) as u8;
                table[byte as usize][offset] = match code {
                    0b00 => 2.0,
                    0b01 => f64::NAN,
                    0b10 => 1.0,
                    _ => 0.0,
                };
            }
        }
        table
    })
}

fn validate_bed_header(bed: &[u8], path: &Path) -> Result<()> {
    match bed.get(..PLINK_HEADER_LEN) {
        Some(header) if header == PLINK_MAGIC => Ok(()),
        Some([0x6c, 0x1b, mode]) => Err(GremlError::shape(
            format!("unsupported mode byte {mode:#04x} (only variant-major mode is supported)"),
            Diagnostic::file(path),
        )),
        _ => Err(GremlError::shape(
            "missing PLINK magic bytes 0x6c 0x1b",
            Diagnostic::file(path),
        )),
    }
}

pub fn read_fam_records(path: &Path) -> Result<Vec<SampleRecord>> {
    let mut reader = LineReader::open(path)?;
    let mut records = Vec::new();
    while let Some(record) = reader.next_record()? {
        let [fid, iid, pid, mid, sex, phenotype] = record.fields[..] else {
            return Err(GremlError::shape(
                "expected 6 whitespace-delimited fields",
                Diagnostic::at_line(path, record.line),
            ));
        };
        records.push(SampleRecord {
            family_id: fid.to_string(),
            individual_id: iid.to_string(),
            paternal_id: pid.to_string(),
            maternal_id: mid.to_string(),
            sex: sex.to_string(),
            phenotype: phenotype.to_string(),
        });
    }
    Ok(records)
}

pub fn read_bim_records(path: &Path) -> Result<Vec<VariantRecord>> {
    let mut reader = LineReader::open(path)?;
    let mut records = Vec::new();
    while let Some(record) = reader.next_record()? {
        let [chr, id, cm, pos, a1, a2] = record.fields[..] else {
            return Err(GremlError::shape(
                "expected 6 whitespace-delimited fields",
                Diagnostic::at_line(path, record.line),
            ));
        };
        let position = pos.parse::<u64>().map_err(|_| {
            GremlError::value(
                "base-pair position is not an unsigned integer",
                Diagnostic::at_line(path, record.line)
                    .with_column(4)
                    .with_token(pos),
            )
        })?;
        records.push(VariantRecord {
            chromosome: chr.to_string(),
            identifier: id.to_string(),
            genetic_distance: cm.to_string(),
            position,
            allele1: a1.to_string(),
            allele2: a2.to_string(),
        });
    }
    Ok(records)
}

/// Packs dosages (0/1/2, NaN for missing) into one `.bed` variant record.
pub fn encode_variant(dosages: &[f64]) -> Vec<u8> {
    let mut bytes = vec![0u8; dosages.len().div_ceil(4)];
    for (idx, &dosage) in dosages.iter().enumerate() {
        let code: u8 = if dosage.is_nan() {
            0b01
        } else if dosage >= 1.5 {
            0b00
        } else if dosage >= 0.5 {
            0b10
        } else {
            0b11
        };
        bytes[idx / 4] |= code << ((idx % 4) * 2);
    }
    bytes
}

/// Writes a PLINK fileset; `genotypes` is samples x variants.
pub fn write_plink(
    prefix: &Path,
    samples: &[SampleRecord],
    variants: &[VariantRecord],
    genotypes: &Array2<f64>,
) -> Result<()> {
    use std::io::Write;

    if genotypes.dim() != (samples.len(), variants.len()) {
        return Err(GremlError::programmer(format!(
            "genotype matrix is {:?} but {} samples and {} variants were given",
            genotypes.dim(),
            samples.len(),
            variants.len()
        )));
    }

    let bed_path = with_suffix(prefix, "bed");
    let mut bed = Vec::with_capacity(PLINK_HEADER_LEN + variants.len() * samples.len().div_ceil(4));
    bed.extend_from_slice(&PLINK_MAGIC);
    for column in genotypes.axis_iter(Axis(1)) {
        let dosages: Vec<f64> = column.to_vec();
        bed.extend_from_slice(&encode_variant(&dosages));
    }
    std::fs::write(&bed_path, &bed).map_err(|e| GremlError::io(&bed_path, e))?;

    let fam_path = with_suffix(prefix, "fam");
    let mut fam = std::io::BufWriter::new(
        std::fs::File::create(&fam_path).map_err(|e| GremlError::io(&fam_path, e))?,
    );
    for s in samples {
        writeln!(
            fam,
            "{} {} {} {} {} {}",
            s.family_id, s.individual_id, s.paternal_id, s.maternal_id, s.sex, s.phenotype
        )
        .map_err(|e| GremlError::io(&fam_path, e))?;
    }
    fam.flush().map_err(|e| GremlError::io(&fam_path, e))?;

    let bim_path = with_suffix(prefix, "bim");
    let mut bim = std::io::BufWriter::new(
        std::fs::File::create(&bim_path).map_err(|e| GremlError::io(&bim_path, e))?,
    );
    for v in variants {
        writeln!(
            bim,
            "{}\t{}\t{}\t{}\t{}\t{}",
            v.chromosome, v.identifier, v.genetic_distance, v.position, v.allele1, v.allele2
        )
        .map_err(|e| GremlError::io(&bim_path, e))?;
    }
    bim.flush().map_err(|e| GremlError::io(&bim_path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, array};
    use tempfile::tempdir;

    fn samples(n: usize) -> Vec<SampleRecord> {
        (0..n)
            .map(|i| SampleRecord {
                family_id: format!("F{i}"),
                individual_id: format!("I{i}"),
                paternal_id: "0".into(),
                maternal_id: "0".into(),
                sex: "1".into(),
                phenotype: "-9".into(),
            })
            .collect()
    }

    fn variants(m: usize) -> Vec<VariantRecord> {
        (0..m)
            .map(|j| VariantRecord {
                chromosome: if j < 2 { "1".into() } else { "2".into() },
                identifier: format!("rs{j}"),
                genetic_distance: "0".into(),
                position: 100 * (j as u64 + 1),
                allele1: "A".into(),
                allele2: "G".into(),
            })
            .collect()
    }

    #[test]
    fn decode_table_follows_a1_dosage_convention() {
        let table = decode_table();
        // 0b11_10_01_00: samples hold codes 00, 01, 10, 11.
        let entry = table[0b1110_0100];
        assert_eq!(entry[0], 2.0);
        assert!(entry[1].is_nan());
        assert_eq!(entry[2], 1.0);
        assert_eq!(entry[3], 0.0);
    }

    #[test]
    fn write_then_open_recovers_genotypes() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("geno");
        let genotypes = array![
            [0.0, 1.0, 2.0],
            [2.0, f64::NAN, 0.0],
            [1.0, 1.0, 1.0],
            [0.0, 2.0, 2.0],
            [2.0, 0.0, 1.0]
        ];
        write_plink(&prefix, &samples(5), &variants(3), &genotypes).unwrap();

        let dataset = PlinkDataset::open(&prefix.with_extension("bed")).unwrap();
        assert_eq!(dataset.n_samples(), 5);
        assert_eq!(dataset.n_variants(), 3);
        assert_eq!(dataset.sample_ids(IdForm::Combined)[4], "F4_I4");

        let block = dataset.decode_block(&[0, 1, 2], None).unwrap();
        for ((i, j), &value) in genotypes.indexed_iter() {
            if value.is_nan() {
                assert!(block[[i, j]].is_nan());
            } else {
                assert_eq!(block[[i, j]], value);
            }
        }

        let mut column = Array1::zeros(2);
        dataset
            .decode_variant(2, Some(&[4usize, 0][..]), column.view_mut())
            .unwrap();
        assert_eq!(column, array![1.0, 2.0]);
    }

    #[test]
    fn truncated_bed_is_rejected() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("geno");
        let genotypes = Array2::<f64>::zeros((5, 3));
        write_plink(&prefix, &samples(5), &variants(3), &genotypes).unwrap();
        let bed_path = prefix.with_extension("bed");
        let bytes = std::fs::read(&bed_path).unwrap();
        std::fs::write(&bed_path, &bytes[..bytes.len() - 1]).unwrap();
        assert!(matches!(
            PlinkDataset::open(&prefix),
            Err(GremlError::InputShape { .. })
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("geno");
        write_plink(&prefix, &samples(4), &variants(1), &Array2::zeros((4, 1))).unwrap();
        std::fs::write(prefix.with_extension("bed"), [0x6c, 0x1b, 0x00, 0xff]).unwrap();
        let err = PlinkDataset::open(&prefix).unwrap_err();
        assert!(err.to_string().contains("mode byte"));
    }

    #[test]
    fn short_fam_line_reports_line_number() {
        let dir = tempdir().unwrap();
        let fam = dir.path().join("x.fam");
        std::fs::write(&fam, "F1 I1 0 0 1 -9\nF2 I2 0\n").unwrap();
        let err = read_fam_records(&fam).unwrap_err();
        assert!(err.to_string().contains("x.fam:2"));
    }
}
