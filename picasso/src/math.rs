//! Robust statistics shared by detection, fitting and drift estimation.

/// For a normal distribution, σ ≈ 1.4826 × MAD.
pub const MAD_TO_SIGMA: f32 = 1.482_602_2;

/// Median and robust standard deviation of a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClippedStats {
    pub median: f32,
    pub sigma: f32,
}

/// Median of `data` via quickselect. Reorders the buffer.
#[inline]
pub fn median_f32_mut(data: &mut [f32]) -> f32 {
    debug_assert!(!data.is_empty());

    let len = data.len();
    let mid = len / 2;

    let (left, right_median, _) = data.select_nth_unstable_by(mid, f32::total_cmp);
    let right = *right_median;
    if len % 2 == 1 {
        right
    } else {
        let left = left.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        (left + right) / 2.0
    }
}

/// Median of `data` via quickselect. Reorders the buffer.
#[inline]
pub fn median_f64_mut(data: &mut [f64]) -> f64 {
    debug_assert!(!data.is_empty());

    let len = data.len();
    let (left, right_median, _) = data.select_nth_unstable_by(len / 2, f64::total_cmp);
    let right = *right_median;
    if len % 2 == 1 {
        right
    } else {
        let left = left.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (left + right) / 2.0
    }
}

/// Sigma-clipped median and MAD-based sigma.
///
/// Iteratively discards values farther than `kappa` sigma from the median.
/// `values` is reordered and `deviations` is scratch space.
pub fn sigma_clipped_stats(
    values: &mut [f32],
    deviations: &mut Vec<f32>,
    kappa: f32,
    iterations: usize,
) -> ClippedStats {
    if values.is_empty() {
        return ClippedStats {
            median: 0.0,
            sigma: 0.0,
        };
    }

    let mut len = values.len();

    for _ in 0..iterations {
        if len < 3 {
            break;
        }

        let stats = median_and_sigma(&mut values[..len], deviations);
        if stats.sigma < f32::EPSILON {
            return stats;
        }

        let threshold = kappa * stats.sigma;
        let mut write_idx = 0;
        for i in 0..len {
            if (values[i] - stats.median).abs() <= threshold {
                values[write_idx] = values[i];
                write_idx += 1;
            }
        }

        if write_idx == len {
            break;
        }
        len = write_idx;
    }

    median_and_sigma(&mut values[..len], deviations)
}

fn median_and_sigma(active: &mut [f32], deviations: &mut Vec<f32>) -> ClippedStats {
    if active.is_empty() {
        return ClippedStats {
            median: 0.0,
            sigma: 0.0,
        };
    }

    let median = median_f32_mut(active);
    deviations.clear();
    deviations.extend(active.iter().map(|v| (v - median).abs()));
    let mad = median_f32_mut(deviations);

    ClippedStats {
        median,
        sigma: mad * MAD_TO_SIGMA,
    }
}
