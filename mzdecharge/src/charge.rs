//! Charge state bookkeeping: the log-space charge ladder and its harmonic aliases.

use std::cmp;

/// An inclusive range of absolute charge states, ordered by magnitude
pub type ChargeRange = (i32, i32);

/// The harmonic multiples tested when deciding whether a charge hypothesis is an alias
/// of a real charge ladder.
pub const HARMONIC_CHARGES: [i32; 5] = [2, 3, 5, 7, 11];

/// Charges at or below this value are confirmed by an adjacent isotope peak, while charges
/// above it are confirmed by a continuous charge ladder.
pub const LOW_CHARGE_THRESHOLD: i32 = 10;

/// The intensity ratio permitted between adjacent charge states of low charge ions.
///
/// This and [`charge_ratio_factor`] are empirically tuned and are expected to be
/// recalibrated rather than re-derived.
pub const LOW_CHARGE_RATIO_FACTOR: f32 = 10.0;

/// The limiting intensity ratio permitted between adjacent charge states as the charge grows
pub const HIGH_CHARGE_RATIO_FACTOR: f32 = 5.0;

/// The largest intensity ratio between two adjacent charge states of the same mass
/// before the charge ladder is considered broken.
///
/// The permitted ratio tapers from [`LOW_CHARGE_RATIO_FACTOR`] at [`LOW_CHARGE_THRESHOLD`]
/// towards [`HIGH_CHARGE_RATIO_FACTOR`] at very high charge.
#[inline]
pub fn charge_ratio_factor(abs_charge: i32) -> f32 {
    if abs_charge <= LOW_CHARGE_THRESHOLD {
        LOW_CHARGE_RATIO_FACTOR
    } else {
        HIGH_CHARGE_RATIO_FACTOR
            + (LOW_CHARGE_RATIO_FACTOR - HIGH_CHARGE_RATIO_FACTOR) * LOW_CHARGE_THRESHOLD as f32
                / abs_charge as f32
    }
}

/// The intensity ratio bound used when comparing a charge hypothesis with its harmonic alias
#[inline]
pub fn harmonic_ratio_factor(abs_charge: i32) -> f32 {
    charge_ratio_factor(abs_charge) / 2.0
}

/// Iterate over the absolute charge states in a [`ChargeRange`], inclusive of both ends.
#[derive(Debug, Clone)]
pub struct ChargeRangeIter {
    pub min: i32,
    pub max: i32,
    index: i32,
}

impl ChargeRangeIter {
    pub fn new(min: i32, max: i32) -> ChargeRangeIter {
        let low = cmp::min(min.abs(), max.abs());
        let high = cmp::max(min.abs(), max.abs());
        ChargeRangeIter {
            min: low,
            max: high,
            index: 0,
        }
    }
}

impl Iterator for ChargeRangeIter {
    type Item = i32;

    fn next(&mut self) -> Option<i32> {
        let z = self.min + self.index;
        if z > self.max {
            None
        } else {
            self.index += 1;
            Some(z)
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = (self.max - self.min - self.index + 1).max(0) as usize;
        (n, Some(n))
    }
}

impl From<ChargeRange> for ChargeRangeIter {
    fn from(pair: ChargeRange) -> ChargeRangeIter {
        ChargeRangeIter::new(pair.0, pair.1)
    }
}

/// The per-charge log-space shifts used to translate an uncharged log m/z into a log mass.
///
/// `charge_filter[i]` is `-ln(i + 1)`, so `log_mz - charge_filter[i]` is the log mass
/// of a peak observed at charge `i + 1`. The harmonic filters describe the fractional
/// charges `z - n / h` that a mass with a harmonic alias would appear at.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeFilters {
    pub charge_filter: Vec<f64>,
    pub harmonic_filter: Vec<Vec<f64>>,
}

impl ChargeFilters {
    pub fn new(max_abs_charge: usize) -> Self {
        let charge_filter: Vec<f64> = (0..max_abs_charge)
            .map(|i| -((i + 1) as f64).ln())
            .collect();

        let harmonic_filter = HARMONIC_CHARGES
            .iter()
            .map(|hc| {
                let n = (hc / 2) as f64;
                let hc = *hc as f64;
                (0..max_abs_charge)
                    .map(|i| {
                        let a = if i > 0 {
                            (-charge_filter[i - 1]).exp()
                        } else {
                            0.0
                        };
                        let b = (-charge_filter[i]).exp();
                        -(b - (b - a) * n / hc).ln()
                    })
                    .collect()
            })
            .collect();

        Self {
            charge_filter,
            harmonic_filter,
        }
    }

    pub fn max_abs_charge(&self) -> usize {
        self.charge_filter.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ratio_factor() {
        assert_eq!(charge_ratio_factor(1), 10.0);
        assert_eq!(charge_ratio_factor(10), 10.0);
        assert!((charge_ratio_factor(20) - 7.5).abs() < 1e-6);
        assert!(charge_ratio_factor(100) < charge_ratio_factor(20));
        assert!(charge_ratio_factor(1000) > HIGH_CHARGE_RATIO_FACTOR);
        assert!((harmonic_ratio_factor(20) - 3.75).abs() < 1e-6);
    }

    #[test]
    fn test_charge_range_iter() {
        let charges: Vec<_> = ChargeRangeIter::new(1, 5).collect();
        assert_eq!(charges, vec![1, 2, 3, 4, 5]);
        let charges: Vec<_> = ChargeRangeIter::new(-4, -2).collect();
        assert_eq!(charges, vec![2, 3, 4]);
        assert_eq!(ChargeRangeIter::from((3, 3)).count(), 1);
    }

    #[test]
    fn test_filters() {
        let filters = ChargeFilters::new(20);
        assert_eq!(filters.max_abs_charge(), 20);
        assert_eq!(filters.charge_filter[0], 0.0);
        assert!((filters.charge_filter[4] + 5f64.ln()).abs() < 1e-12);

        // The second harmonic of charge 5 sits half way between charges 4 and 5
        let h = &filters.harmonic_filter[0];
        assert!((h[4] + 4.5f64.ln()).abs() < 1e-12);
        // and the first charge aliases to 1/2
        assert!((h[0] + 0.5f64.ln()).abs() < 1e-12);

        // Third harmonic, n = 1
        let h = &filters.harmonic_filter[1];
        assert!((h[2] + (3.0f64 - 1.0 / 3.0).ln()).abs() < 1e-12);
    }
}
