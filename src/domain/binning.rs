// ============================================================
// Expression value binning
// ============================================================
// Maps the continuous expression values of one cell to integer
// bins using quantile edges computed on that cell alone.
//
//   row all zero        → every bin is 0
//   row has values <= 0 → zeros stay in bin 0, the non-zero
//                         entries are binned among themselves
//   row strictly > 0    → every entry is binned
//
// Edges are the n_bins - 1 evenly spaced quantiles. A value
// sitting exactly on one or more edges gets a digit drawn
// uniformly between its left and right digitization.

use rand::Rng;

/// Bins one cell's expression values into `[0, n_bins)`.
pub fn binning<R: Rng + ?Sized>(row: &[f32], n_bins: usize, rng: &mut R) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if row.is_empty() || max == 0.0 {
        tracing::warn!("binning a row of zeros; every value maps to bin 0");
        return vec![0.0; row.len()];
    }

    let min = row.iter().copied().fold(f32::INFINITY, f32::min);
    if min <= 0.0 {
        let non_zero: Vec<usize> = (0..row.len()).filter(|&i| row[i] != 0.0).collect();
        let values: Vec<f32> = non_zero.iter().map(|&i| row[i]).collect();
        let edges  = quantile_edges(&values, n_bins);
        let digits = digitize(&values, &edges, rng);

        let mut binned = vec![0.0; row.len()];
        for (&i, digit) in non_zero.iter().zip(digits) {
            binned[i] = digit as f32;
        }
        binned
    } else {
        let edges = quantile_edges(row, n_bins);
        digitize(row, &edges, rng).into_iter().map(|d| d as f32).collect()
    }
}

/// `n_bins - 1` linearly interpolated quantiles from 0 to 1.
fn quantile_edges(values: &[f32], n_bins: usize) -> Vec<f32> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let n_edges = n_bins.saturating_sub(1).max(1);
    (0..n_edges)
        .map(|k| {
            let q = if n_edges == 1 { 0.0 } else { k as f64 / (n_edges - 1) as f64 };
            quantile(&sorted, q)
        })
        .collect()
}

fn quantile(sorted: &[f32], q: f64) -> f32 {
    let pos  = q * (sorted.len() - 1) as f64;
    let lo   = pos.floor() as usize;
    let hi   = pos.ceil() as usize;
    let frac = (pos - lo as f64) as f32;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

fn digitize<R: Rng + ?Sized>(values: &[f32], edges: &[f32], rng: &mut R) -> Vec<i64> {
    values
        .iter()
        .map(|&x| {
            let left  = edges.iter().filter(|&&e| e <= x).count() as f64;
            let right = edges.iter().filter(|&&e| e < x).count() as f64;
            let r: f64 = rng.gen();
            (r * (right - left) + left).ceil() as i64
        })
        .collect()
}
