//! Squared Euclidean distance kernels shared by the linear scan and the k-d tree.
//!
//! Both search paths must sum in the same order so that they report
//! bit-identical distances for the same codeword.

/// Squared Euclidean distance between two slices.
/// Unrolled by four for autovectorization.
#[inline]
pub fn distance_squared(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());

    let chunks = a.len() / 4;
    let remainder = a.len() % 4;

    let mut sum = 0.0f64;

    for i in 0..chunks {
        let base = i * 4;
        let d0 = a[base] - b[base];
        let d1 = a[base + 1] - b[base + 1];
        let d2 = a[base + 2] - b[base + 2];
        let d3 = a[base + 3] - b[base + 3];

        sum += d0 * d0 + d1 * d1 + d2 * d2 + d3 * d3;
    }

    let base = chunks * 4;
    for i in 0..remainder {
        let d = a[base + i] - b[base + i];
        sum += d * d;
    }

    sum
}

/// Linear scan for the closest codeword in a flat row-major codebook.
///
/// Returns `(index, squared distance)`. Ties go to the lowest index. If every
/// distance is NaN the distance returned is NaN.
#[inline]
pub fn nearest_linear(codewords: &[f64], query: &[f64], n_codes: usize, dim: usize) -> (usize, f64) {
    let mut best_idx = 0;
    let mut best_dist = f64::INFINITY;
    let mut found = false;

    for i in 0..n_codes {
        let offset = i * dim;
        let dist = distance_squared(&codewords[offset..offset + dim], query);

        if dist < best_dist {
            best_dist = dist;
            best_idx = i;
            found = true;
        }
    }

    if found {
        (best_idx, best_dist)
    } else {
        (0, f64::NAN)
    }
}
