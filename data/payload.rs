//! Dense column-major matrix cache with a fixed 32-byte header:
//!
//! | bytes  | field                              |
//! |--------|------------------------------------|
//! | 0..8   | magic `GELEXBW1`                   |
//! | 8..12  | version, u32 LE (1)                |
//! | 12..20 | rows, u64 LE                       |
//! | 20..28 | cols, u64 LE                       |
//! | 28     | dtype: 1 = u8, 2 = f32, 3 = f64    |
//! | 29..32 | zero padding                       |
//!
//! The payload follows immediately, column by column.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::{Advice, Mmap};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis, ShapeBuilder};

use crate::data::coding::{MONOMORPHIC_THRESHOLD, VariantStats};
use crate::shared::error::{Diagnostic, GremlError, Result};
use crate::shared::files::open_mmap;

pub const PAYLOAD_MAGIC: [u8; 8] = *b"GELEXBW1";
pub const PAYLOAD_VERSION: u32 = 1;
pub const PAYLOAD_HEADER_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadDtype {
    U8,
    F32,
    F64,
}

impl PayloadDtype {
    pub fn code(self) -> u8 {
        match self {
            Self::U8 => 1,
            Self::F32 => 2,
            Self::F64 => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::U8),
            2 => Some(Self::F32),
            3 => Some(Self::F64),
            _ => None,
        }
    }

    pub fn size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// Element types that can be stored in a payload.
pub trait PayloadElement: Copy {
    const DTYPE: PayloadDtype;
    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
    fn to_f64(self) -> f64;
}

impl PayloadElement for u8 {
    const DTYPE: PayloadDtype = PayloadDtype::U8;
    fn write_le(self, out: &mut Vec<u8>) {
        out.push(self);
    }
    fn read_le(bytes: &[u8]) -> Self {
        bytes[0]
    }
    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

impl PayloadElement for f32 {
    const DTYPE: PayloadDtype = PayloadDtype::F32;
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn read_le(bytes: &[u8]) -> Self {
        f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

impl PayloadElement for f64 {
    const DTYPE: PayloadDtype = PayloadDtype::F64;
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn read_le(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[..8]);
        f64::from_le_bytes(raw)
    }
    fn to_f64(self) -> f64 {
        self
    }
}

fn encode_header(rows: u64, cols: u64, dtype: PayloadDtype) -> [u8; PAYLOAD_HEADER_LEN] {
    let mut header = [0u8; PAYLOAD_HEADER_LEN];
    header[0..8].copy_from_slice(&PAYLOAD_MAGIC);
    header[8..12].copy_from_slice(&PAYLOAD_VERSION.to_le_bytes());
    header[12..20].copy_from_slice(&rows.to_le_bytes());
    header[20..28].copy_from_slice(&cols.to_le_bytes());
    header[28] = dtype.code();
    header
}

/// Writes `matrix` as a payload file, column by column.
pub fn write_payload<T: PayloadElement>(path: &Path, matrix: ArrayView2<T>) -> Result<()> {
    let (rows, cols) = matrix.dim();
    let file = File::create(path).map_err(|e| GremlError::io(path, e))?;
    let mut out = BufWriter::new(file);
    out.write_all(&encode_header(rows as u64, cols as u64, T::DTYPE))
        .map_err(|e| GremlError::io(path, e))?;

    let mut buffer = Vec::with_capacity(rows * T::DTYPE.size());
    for column in matrix.axis_iter(Axis(1)) {
        buffer.clear();
        for &value in column.iter() {
            value.write_le(&mut buffer);
        }
        out.write_all(&buffer).map_err(|e| GremlError::io(path, e))?;
    }
    out.flush().map_err(|e| GremlError::io(path, e))
}

/// A memory-mapped payload file.
#[derive(Debug)]
pub struct BinaryPayload {
    path: PathBuf,
    mmap: Mmap,
    rows: usize,
    cols: usize,
    dtype: PayloadDtype,
}

impl BinaryPayload {
    pub fn open(path: &Path) -> Result<Self> {
        let mmap = open_mmap(path, Advice::Sequential)?;
        let diag = || Diagnostic::file(path);
        if mmap.len() < PAYLOAD_HEADER_LEN {
            return Err(GremlError::shape(
                format!("file holds {} bytes, shorter than the 32-byte header", mmap.len()),
                diag(),
            ));
        }
        if mmap[0..8] != PAYLOAD_MAGIC {
            return Err(GremlError::shape("missing GELEXBW1 magic", diag()));
        }
        let version = u32::from_le_bytes([mmap[8], mmap[9], mmap[10], mmap[11]]);
        if version != PAYLOAD_VERSION {
            return Err(GremlError::value(
                format!("unsupported payload version {version}"),
                diag(),
            ));
        }
        let read_u64 = |offset: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&mmap[offset..offset + 8]);
            u64::from_le_bytes(raw)
        };
        let rows = read_u64(12);
        let cols = read_u64(20);
        let dtype = PayloadDtype::from_code(mmap[28]).ok_or_else(|| {
            GremlError::value(format!("unknown dtype code {}", mmap[28]), diag())
        })?;

        let expected = rows
            .checked_mul(cols)
            .and_then(|cells| cells.checked_mul(dtype.size() as u64))
            .and_then(|bytes| bytes.checked_add(PAYLOAD_HEADER_LEN as u64))
            .ok_or_else(|| GremlError::shape("declared dimensions overflow", diag()))?;
        if mmap.len() as u64 != expected {
            return Err(GremlError::shape(
                format!(
                    "expected {expected} bytes for a {rows} x {cols} payload, found {}",
                    mmap.len()
                ),
                diag(),
            ));
        }
        let rows = usize::try_from(rows)
            .map_err(|_| GremlError::shape("row count exceeds address space", diag()))?;
        let cols = usize::try_from(cols)
            .map_err(|_| GremlError::shape("column count exceeds address space", diag()))?;

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            rows,
            cols,
            dtype,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dim(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn dtype(&self) -> PayloadDtype {
        self.dtype
    }

    fn payload(&self) -> &[u8] {
        &self.mmap[PAYLOAD_HEADER_LEN..]
    }

    /// Zero-copy view of an f64 payload. The header keeps the payload 8-byte
    /// aligned relative to the page-aligned mapping.
    pub fn view_f64(&self) -> Result<ArrayView2<'_, f64>> {
        if self.dtype != PayloadDtype::F64 {
            return Err(GremlError::value(
                format!("payload holds {:?}, not f64", self.dtype),
                Diagnostic::file(&self.path),
            ));
        }
        let bytes = self.payload();
        if bytes.as_ptr().align_offset(std::mem::align_of::<f64>()) != 0 {
            return Err(GremlError::programmer("f64 payload is not 8-byte aligned"));
        }
        // Length was validated against rows * cols * 8 in `open`, alignment just above.
        let values = unsafe {
            std::slice::from_raw_parts(bytes.as_ptr().cast::<f64>(), self.rows * self.cols)
        };
        ArrayView2::from_shape((self.rows, self.cols).f(), values)
            .map_err(|e| GremlError::programmer(format!("payload view: {e}")))
    }

    /// Owned f64 copy regardless of the stored element type.
    pub fn load_copy(&self) -> Array2<f64> {
        let bytes = self.payload();
        match self.dtype {
            PayloadDtype::U8 => self.collect::<u8>(bytes),
            PayloadDtype::F32 => self.collect::<f32>(bytes),
            PayloadDtype::F64 => self.collect::<f64>(bytes),
        }
    }

    fn collect<T: PayloadElement>(&self, bytes: &[u8]) -> Array2<f64> {
        let size = T::DTYPE.size();
        let values: Vec<f64> = bytes
            .chunks_exact(size)
            .map(|chunk| T::read_le(chunk).to_f64())
            .collect();
        Array2::from_shape_vec((self.rows, self.cols).f(), values)
            .unwrap_or_else(|_| Array2::zeros((self.rows, self.cols)))
    }
}

/// Encoded genotypes (samples x variants), either owned or borrowed from a
/// mapped payload, with per-column statistics.
#[derive(Debug)]
pub enum GenotypeMatrix {
    Owned {
        values: Array2<f64>,
        stats: Vec<VariantStats>,
    },
    Mapped {
        payload: BinaryPayload,
        stats: Vec<VariantStats>,
    },
}

impl GenotypeMatrix {
    pub fn owned(values: Array2<f64>, stats: Vec<VariantStats>) -> Result<Self> {
        if stats.len() != values.ncols() {
            return Err(GremlError::programmer(format!(
                "{} column statistics for {} columns",
                stats.len(),
                values.ncols()
            )));
        }
        Ok(Self::Owned { values, stats })
    }

    /// Maps an f64 payload and derives column statistics from the stored values.
    pub fn mapped(payload: BinaryPayload) -> Result<Self> {
        let stats = payload
            .view_f64()?
            .axis_iter(Axis(1))
            .map(describe_column)
            .collect();
        Ok(Self::Mapped { payload, stats })
    }

    pub fn view(&self) -> Result<ArrayView2<'_, f64>> {
        match self {
            Self::Owned { values, .. } => Ok(values.view()),
            Self::Mapped { payload, .. } => payload.view_f64(),
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        match self {
            Self::Owned { values, .. } => values.dim(),
            Self::Mapped { payload, .. } => payload.dim(),
        }
    }

    pub fn stats(&self) -> &[VariantStats] {
        match self {
            Self::Owned { stats, .. } | Self::Mapped { stats, .. } => stats,
        }
    }

    pub fn mean(&self, column: usize) -> Option<f64> {
        self.stats().get(column).map(|s| s.mean)
    }

    pub fn stddev(&self, column: usize) -> Option<f64> {
        self.stats().get(column).map(|s| s.stddev)
    }

    pub fn is_monomorphic(&self, column: usize) -> Option<bool> {
        self.stats().get(column).map(|s| s.is_monomorphic)
    }
}

fn describe_column(column: ArrayView1<f64>) -> VariantStats {
    let n = column.len();
    let mean = if n == 0 { 0.0 } else { column.sum() / n as f64 };
    let stddev = if n < 2 {
        0.0
    } else {
        (column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
    };
    VariantStats {
        mean,
        stddev,
        is_monomorphic: !(stddev >= MONOMORPHIC_THRESHOLD),
    }
}
