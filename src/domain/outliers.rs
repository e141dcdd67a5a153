//! Outlier detection over a drug's price set.
//!
//! Two rules, applied in order: exact placeholder sentinels, then Tukey
//! fences over the remaining observations. Quartiles are taken by rank
//! (`sorted[n/4]`, `sorted[3n/4]`) rather than interpolation so a small
//! window of close prices with one stray high offer does not get fenced
//! away.

use crate::domain::normalizer::format_price_yuan;

/// Sentinel prices some suppliers publish when no real price is available,
/// in cents.
const PLACEHOLDER_CENTS: &[i64] = &[999_900, 9_999_900, 99_999_900];

/// Minimum non-placeholder observations before the statistical rule applies.
const MIN_OBSERVATIONS: usize = 4;

/// Annotation verdict for one price row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutlierFlag {
    Low,
    Normal,
    High,
    Placeholder,
}

impl OutlierFlag {
    pub fn as_i64(&self) -> i64 {
        match self {
            Self::Low => -1,
            Self::Normal => 0,
            Self::High => 1,
            Self::Placeholder => 2,
        }
    }
}

/// One verdict: row index into the input slice, flag, and human reason.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub flag: OutlierFlag,
    pub reason: Option<String>,
}

/// Tukey fences over a price set, in cents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fences {
    pub low: i64,
    pub high: i64,
}

/// Compute rank-quartile Tukey fences. Returns None when there are too few
/// observations or the window is degenerate (IQR of zero).
pub fn tukey_fences(prices_cents: &[i64]) -> Option<Fences> {
    let n = prices_cents.len();
    if n < MIN_OBSERVATIONS {
        return None;
    }
    let mut sorted = prices_cents.to_vec();
    sorted.sort_unstable();
    let q1 = sorted[n / 4];
    let q3 = sorted[(3 * n / 4).min(n - 1)];
    let iqr = q3 - q1;
    if iqr <= 0 {
        return None;
    }
    // 1.5 × IQR, kept in integer cents.
    let margin = iqr * 3 / 2;
    Some(Fences {
        low: q1 - margin,
        high: q3 + margin,
    })
}

pub fn is_placeholder(price_cents: i64) -> bool {
    PLACEHOLDER_CENTS.contains(&price_cents)
}

/// Judge every price in the set. The returned vector is index-aligned with
/// the input. Fences are computed over the non-placeholder subset only.
pub fn judge_prices(prices_cents: &[i64]) -> Vec<Verdict> {
    let real: Vec<i64> = prices_cents
        .iter()
        .copied()
        .filter(|p| !is_placeholder(*p))
        .collect();
    let fences = tukey_fences(&real);

    prices_cents
        .iter()
        .map(|&price| {
            if is_placeholder(price) {
                return Verdict {
                    flag: OutlierFlag::Placeholder,
                    reason: Some("placeholder".to_string()),
                };
            }
            if let Some(f) = fences {
                if price < f.low {
                    return Verdict {
                        flag: OutlierFlag::Low,
                        reason: Some(format!("low (<{})", format_price_yuan(f.low))),
                    };
                }
                if price > f.high {
                    return Verdict {
                        flag: OutlierFlag::High,
                        reason: Some(format!("high (>{})", format_price_yuan(f.high))),
                    };
                }
            }
            Verdict {
                flag: OutlierFlag::Normal,
                reason: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_sentinels() {
        assert!(is_placeholder(999_900));
        assert!(is_placeholder(9_999_900));
        assert!(is_placeholder(99_999_900));
        assert!(!is_placeholder(999_800));
        assert!(!is_placeholder(99));
    }

    #[test]
    fn seeded_scenario_marks_only_the_placeholder() {
        // 650, 650, 660, 830, 9999 (yuan)
        let prices = vec![65_000, 65_000, 66_000, 83_000, 999_900];
        let verdicts = judge_prices(&prices);
        assert_eq!(verdicts[4].flag, OutlierFlag::Placeholder);
        assert_eq!(verdicts[4].reason.as_deref(), Some("placeholder"));
        for v in &verdicts[..4] {
            assert_eq!(v.flag, OutlierFlag::Normal, "{v:?}");
        }
    }

    #[test]
    fn fewer_than_four_real_prices_skips_the_statistical_rule() {
        let prices = vec![100, 50_000, 999_900];
        let verdicts = judge_prices(&prices);
        assert_eq!(verdicts[0].flag, OutlierFlag::Normal);
        assert_eq!(verdicts[1].flag, OutlierFlag::Normal);
        assert_eq!(verdicts[2].flag, OutlierFlag::Placeholder);
    }

    #[test]
    fn extreme_rows_get_fenced() {
        // Tight cluster plus one far-out observation on each side.
        let prices = vec![10_000, 10_100, 10_200, 10_300, 10_400, 10_500, 95_000, 100];
        let verdicts = judge_prices(&prices);
        assert_eq!(verdicts[6].flag, OutlierFlag::High);
        assert!(verdicts[6].reason.as_deref().unwrap().starts_with("high (>"));
        assert_eq!(verdicts[7].flag, OutlierFlag::Low);
        assert!(verdicts[7].reason.as_deref().unwrap().starts_with("low (<"));
    }

    #[test]
    fn identical_prices_have_no_fences() {
        let prices = vec![5_000; 6];
        assert!(tukey_fences(&prices).is_none());
        assert!(judge_prices(&prices)
            .iter()
            .all(|v| v.flag == OutlierFlag::Normal));
    }

    #[test]
    fn every_verdict_is_in_the_closed_set() {
        let prices = vec![1, 999_900, 50, 70_000, 65_000, 64_000, 63_000];
        for v in judge_prices(&prices) {
            assert!([-1, 0, 1, 2].contains(&v.flag.as_i64()));
        }
    }
}
