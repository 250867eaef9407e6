use std::cmp::Ordering;

pub const GRADE_MIN: f64 = 0.0;
pub const GRADE_MAX: f64 = 20.0;

/// Half-up rounding to 2 decimals, stored precision for averages.
///
/// The scaled value is first snapped to 6 decimals so that inputs such as
/// `12.345` (really `12.34499999...` in binary) still round up.
pub fn round_half_up_2(x: f64) -> f64 {
    let scaled = ((x * 100.0) * 1e6).round() / 1e6;
    (scaled + 0.5).floor() / 100.0
}

pub fn is_valid_grade_value(v: f64) -> bool {
    v.is_finite() && (GRADE_MIN..=GRADE_MAX).contains(&v)
}

/// `Σ(value·weight) / Σ(weight)` over entries with a positive weight.
/// Returns `None` when nothing contributes.
pub fn weighted_average<I>(entries: I) -> Option<f64>
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let mut sum = 0.0_f64;
    let mut denom = 0.0_f64;
    for (value, weight) in entries {
        if weight <= 0.0 {
            continue;
        }
        sum += value * weight;
        denom += weight;
    }
    if denom > 0.0 {
        Some(sum / denom)
    } else {
        None
    }
}

fn by_value_desc<K>(a: &(K, f64), b: &(K, f64)) -> Ordering {
    b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal)
}

/// Subject ranking: stable sort by value descending, rank is the 1-based
/// position. Tied values keep their input order and get distinct ranks.
pub fn positional_ranks<K: Copy>(entries: &[(K, f64)]) -> Vec<(K, f64, u32)> {
    let mut sorted = entries.to_vec();
    sorted.sort_by(by_value_desc);
    sorted
        .into_iter()
        .enumerate()
        .map(|(i, (k, v))| (k, v, (i + 1) as u32))
        .collect()
}

/// General-average ranking: standard competition ranking ("1224").
/// Equal values share a rank; the next distinct value resumes at its
/// 1-based position.
pub fn competition_ranks<K: Copy>(entries: &[(K, f64)]) -> Vec<(K, f64, u32)> {
    let mut sorted = entries.to_vec();
    sorted.sort_by(by_value_desc);

    let mut out = Vec::with_capacity(sorted.len());
    let mut rank = 1_u32;
    let mut last: Option<f64> = None;
    for (i, (k, v)) in sorted.into_iter().enumerate() {
        if let Some(prev) = last {
            if v < prev {
                rank = (i + 1) as u32;
            }
        }
        out.push((k, v, rank));
        last = Some(v);
    }
    out
}

/// Report-card remark for a general average.
pub fn appreciation(general_average: f64) -> &'static str {
    if general_average >= 16.0 {
        "Excellent work, congratulations!"
    } else if general_average >= 14.0 {
        "Very good term, keep it up."
    } else if general_average >= 12.0 {
        "Good work, consistent effort."
    } else if general_average >= 10.0 {
        "Satisfactory work, could do better."
    } else if general_average >= 8.0 {
        "Insufficient results, more effort is needed."
    } else {
        "Very weak results, serious work is essential."
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_half_up_handles_binary_drift() {
        assert_eq!(round_half_up_2(0.0), 0.0);
        assert_eq!(round_half_up_2(12.0), 12.0);
        assert_eq!(round_half_up_2(12.345), 12.35);
        assert_eq!(round_half_up_2(2.675), 2.68);
        assert_eq!(round_half_up_2(13.3333333), 13.33);
        assert_eq!(round_half_up_2(13.6666666), 13.67);
        assert_eq!(round_half_up_2(20.0), 20.0);
    }

    #[test]
    fn weighted_average_uses_coefficients() {
        // coefficient 2 on both grades: (10*2 + 14*2) / 4
        let avg = weighted_average([(10.0, 2.0), (14.0, 2.0)]).unwrap();
        assert!((avg - 12.0).abs() < 1e-9);

        let mixed = weighted_average([(10.0, 1.0), (16.0, 3.0)]).unwrap();
        assert!((mixed - 14.5).abs() < 1e-9);
    }

    #[test]
    fn weighted_average_empty_or_zero_weight_is_none() {
        assert_eq!(weighted_average(std::iter::empty()), None);
        assert_eq!(weighted_average([(12.0, 0.0)]), None);
    }

    #[test]
    fn positional_ranks_do_not_share_on_ties() {
        let ranked = positional_ranks(&[(1, 15.0), (2, 17.0), (3, 15.0), (4, 9.5)]);
        let ranks: Vec<(i32, u32)> = ranked.iter().map(|(k, _, r)| (*k, *r)).collect();
        assert_eq!(ranks, vec![(2, 1), (1, 2), (3, 3), (4, 4)]);
    }

    #[test]
    fn competition_ranks_share_and_skip() {
        let ranked = competition_ranks(&[(1, 15.0), (2, 17.0), (3, 15.0), (4, 9.5)]);
        let ranks: Vec<(i32, u32)> = ranked.iter().map(|(k, _, r)| (*k, *r)).collect();
        assert_eq!(ranks, vec![(2, 1), (1, 2), (3, 2), (4, 4)]);
    }

    #[test]
    fn appreciation_bands() {
        assert_eq!(appreciation(16.0), "Excellent work, congratulations!");
        assert_eq!(appreciation(15.99), "Very good term, keep it up.");
        assert_eq!(appreciation(12.0), "Good work, consistent effort.");
        assert_eq!(appreciation(10.0), "Satisfactory work, could do better.");
        assert_eq!(appreciation(8.5), "Insufficient results, more effort is needed.");
        assert_eq!(appreciation(0.0), "Very weak results, serious work is essential.");
    }

    #[test]
    fn grade_value_bounds() {
        assert!(is_valid_grade_value(0.0));
        assert!(is_valid_grade_value(20.0));
        assert!(!is_valid_grade_value(20.01));
        assert!(!is_valid_grade_value(-1.0));
        assert!(!is_valid_grade_value(f64::NAN));
    }
}
