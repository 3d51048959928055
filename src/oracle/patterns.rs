//! Cutting a beat-synchronous chromagram into fixed-size patterns.
//!
//! A chromagram is a `12 x beats` matrix. Each pattern covers one or more bars
//! (or a fixed window of beats), is stretched to `pattern_size` beats and is
//! flattened chroma-major: value `(c, b)` lands at `c * pattern_size + b`.

use crate::config::{PatternSpec, CHROMA_BINS};
use crate::error::{ListenerError, Result};
use crate::matrix::Matrix;

/// Extracts patterns from a `12 x beats` chromagram.
///
/// `bar_beats` holds the beat index at which each bar starts. It is ignored
/// when `spec.bars == 0`, in which case windows of `pattern_size` beats are
/// used. Returns one flattened pattern per row.
pub fn extract_patterns(
    btchroma: &Matrix,
    bar_beats: Option<&[usize]>,
    spec: &PatternSpec,
) -> Result<Matrix> {
    if btchroma.rows() != CHROMA_BINS {
        return Err(ListenerError::DimensionMismatch {
            expected: CHROMA_BINS,
            found: btchroma.rows(),
        });
    }
    let p = spec.pattern_size;
    if p == 0 {
        return Err(ListenerError::Config("pattern size must be positive".to_string()));
    }

    let n_beats = btchroma.cols();
    let dim = spec.dimension();

    let chroma = if spec.song_key_invariance {
        rotate_to_strongest(btchroma)
    } else {
        btchroma.clone()
    };

    let (starts, group): (Vec<usize>, usize) = match bar_beats {
        Some(bars) if spec.bars > 0 => (
            bars.iter().copied().filter(|&b| b < n_beats).collect(),
            spec.bars,
        ),
        _ => ((0..n_beats - n_beats % p).step_by(p).collect(), 1),
    };

    let mut data = Vec::with_capacity(starts.len() * dim);
    let mut rows = 0;

    for (k, &bt1) in starts.iter().enumerate() {
        let bt2 = starts.get(k + group).copied().unwrap_or(n_beats);
        if bt2 <= bt1 {
            continue;
        }

        let segment = columns(&chroma, bt1, bt2);
        let mut pattern = if spec.resample {
            resample(&segment, p)
        } else {
            pad_crop(&segment, p)
        };
        if spec.key_invariance && !spec.song_key_invariance {
            pattern = rotate_to_strongest(&pattern);
        }

        data.extend(pattern.as_slice().iter().map(|&v| {
            if spec.positive && v < 0.0 {
                0.0
            } else {
                v
            }
        }));
        rows += 1;
    }

    Matrix::new(rows, dim, data)
}

fn columns(m: &Matrix, from: usize, to: usize) -> Matrix {
    let width = to - from;
    let mut out = Matrix::zeros(m.rows(), width);
    for r in 0..m.rows() {
        out.row_mut(r).copy_from_slice(&m.row(r)[from..to]);
    }
    out
}

/// Pads with zero columns or crops to `size` columns.
pub fn pad_crop(m: &Matrix, size: usize) -> Matrix {
    let keep = m.cols().min(size);
    let mut out = Matrix::zeros(m.rows(), size);
    for r in 0..m.rows() {
        out.row_mut(r)[..keep].copy_from_slice(&m.row(r)[..keep]);
    }
    out
}

/// Stretches or squeezes to `size` columns by linear interpolation.
///
/// A single output column is the mean of all input columns.
pub fn resample(m: &Matrix, size: usize) -> Matrix {
    let width = m.cols();
    let mut out = Matrix::zeros(m.rows(), size);
    if width == 0 || size == 0 {
        return out;
    }

    for r in 0..m.rows() {
        let src = m.row(r);
        let dst = out.row_mut(r);

        if size == 1 {
            dst[0] = src.iter().sum::<f64>() / width as f64;
        } else if width == 1 {
            dst.iter_mut().for_each(|v| *v = src[0]);
        } else {
            let scale = (width - 1) as f64 / (size - 1) as f64;
            for (j, v) in dst.iter_mut().enumerate() {
                let x = j as f64 * scale;
                let lo = x.floor() as usize;
                let hi = (lo + 1).min(width - 1);
                let frac = x - lo as f64;
                *v = src[lo] * (1.0 - frac) + src[hi] * frac;
            }
        }
    }

    out
}

/// Rolls rows so the row with the largest sum becomes row 0.
///
/// Relative pitch between rows is preserved.
pub fn rotate_to_strongest(m: &Matrix) -> Matrix {
    let n = m.rows();
    if n == 0 {
        return m.clone();
    }

    let mut strongest = 0;
    let mut best = f64::NEG_INFINITY;
    for (r, row) in m.iter_rows().enumerate() {
        let energy: f64 = row.iter().sum();
        if energy > best {
            best = energy;
            strongest = r;
        }
    }

    let mut out = Matrix::zeros(n, m.cols());
    for r in 0..n {
        out.row_mut(r).copy_from_slice(m.row((r + strongest) % n));
    }
    out
}
