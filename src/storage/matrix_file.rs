//! Binary file holding named numeric matrices.
//!
//! Used for exported codebooks (`codebook`) and for beat-chroma feature files
//! (`btchroma`, `barbts`).
//!
//! ## Format Layout
//!
//! ```text
//! +--------------------+
//! | Header (16 bytes)  |
//! +--------------------+
//! | Entry 0            |
//! +--------------------+
//! | ...                |
//! +--------------------+
//! ```
//!
//! ### Header (16 bytes)
//! - Magic number (4 bytes): "LMTX"
//! - Version (2 bytes)
//! - Reserved (2 bytes)
//! - Number of entries (4 bytes)
//! - Reserved (4 bytes)
//!
//! ### Entry
//! - Name length (2 bytes), name (UTF-8)
//! - Rows (8 bytes), columns (8 bytes)
//! - Row-major `f64` values, little-endian

use crate::error::{ListenerError, Result};
use crate::matrix::Matrix;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

/// Magic number for matrix files.
const MAGIC: &[u8; 4] = b"LMTX";

/// Current format version.
const VERSION: u16 = 1;

/// Header size in bytes.
const HEADER_SIZE: usize = 16;

/// Size of an entry with an empty name and no values.
const ENTRY_MIN_SIZE: usize = 18;

/// Reader/writer for named-matrix files.
pub struct MatrixFile;

impl MatrixFile {
    /// Writes the given named matrices to `path`, replacing any existing file.
    pub fn write<P: AsRef<Path>>(path: P, entries: &[(&str, &Matrix)]) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(MAGIC);
        header[4..6].copy_from_slice(&VERSION.to_le_bytes());
        header[8..12].copy_from_slice(&(entries.len() as u32).to_le_bytes());
        writer.write_all(&header)?;

        for (name, matrix) in entries {
            let name_bytes = name.as_bytes();
            if name_bytes.len() > u16::MAX as usize {
                return Err(ListenerError::InvalidMatrixFormat(format!(
                    "Matrix name too long: {} bytes",
                    name_bytes.len()
                )));
            }
            writer.write_all(&(name_bytes.len() as u16).to_le_bytes())?;
            writer.write_all(name_bytes)?;
            writer.write_all(&(matrix.rows() as u64).to_le_bytes())?;
            writer.write_all(&(matrix.cols() as u64).to_le_bytes())?;
            for v in matrix.as_slice() {
                writer.write_all(&v.to_le_bytes())?;
            }
        }

        writer.flush()?;
        Ok(())
    }

    /// Reads every named matrix in file order.
    pub fn read_all<P: AsRef<Path>>(path: P) -> Result<Vec<(String, Matrix)>> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        Self::parse(&bytes)
    }

    /// Reads the matrix called `name`.
    ///
    /// Fails with [`ListenerError::MissingMatrix`] if the file has no such entry.
    pub fn read<P: AsRef<Path>>(path: P, name: &str) -> Result<Matrix> {
        let path = path.as_ref();
        Self::read_all(path)?
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m)
            .ok_or_else(|| ListenerError::MissingMatrix {
                name: name.to_string(),
                path: path.to_path_buf(),
            })
    }

    fn parse(bytes: &[u8]) -> Result<Vec<(String, Matrix)>> {
        if bytes.len() < HEADER_SIZE {
            return Err(ListenerError::InvalidMatrixFormat("Header too short".to_string()));
        }
        if &bytes[0..4] != MAGIC {
            return Err(ListenerError::InvalidMatrixFormat("Invalid magic number".to_string()));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(ListenerError::InvalidMatrixFormat(format!(
                "Unsupported version {}",
                version
            )));
        }
        let count = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;

        let mut cursor = Cursor {
            bytes,
            pos: HEADER_SIZE,
        };
        let room = (bytes.len() - HEADER_SIZE) / ENTRY_MIN_SIZE;
        let mut entries = Vec::with_capacity(count.min(room));

        for _ in 0..count {
            let name_len = u16::from_le_bytes(cursor.take_array::<2>()?) as usize;
            let name = String::from_utf8(cursor.take(name_len)?.to_vec())
                .map_err(|e| ListenerError::InvalidMatrixFormat(e.to_string()))?;
            let rows = u64::from_le_bytes(cursor.take_array::<8>()?) as usize;
            let cols = u64::from_le_bytes(cursor.take_array::<8>()?) as usize;

            let len = rows
                .checked_mul(cols)
                .and_then(|n| n.checked_mul(8))
                .ok_or_else(|| {
                    ListenerError::InvalidMatrixFormat(format!("Matrix '{}' too large", name))
                })?;
            let data: Vec<f64> = cursor
                .take(len)?
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect();

            entries.push((name, Matrix::new(rows, cols, data)?));
        }

        Ok(entries)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| ListenerError::InvalidMatrixFormat("Truncated file".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}
