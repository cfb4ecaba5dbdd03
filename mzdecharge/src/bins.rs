//! Discretization of the log m/z and log mass axes into tolerance-sized bins.
//!
//! A peak observed at uncharged log m/z `x` with charge `z` has log mass `x + ln(z)`, so once
//! both axes share a bin width, a whole charge hypothesis becomes a constant integer shift
//! between an m/z bin and a mass bin.

use tracing::trace;

use crate::averagine::PrecalculatedAveragine;
use crate::charge::ChargeFilters;
use crate::peaks::LogMzPeak;

/// The bin width is the mass tolerance divided by this factor
pub const TOLERANCE_DIVISION_FACTOR: f64 = 2.5;

/// Map `value` to its bin, clamping values below `min_value` to the first bin
#[inline]
pub fn bin_number(value: f64, min_value: f64, bin_mul_factor: f64) -> usize {
    if value < min_value {
        return 0;
    }
    ((value - min_value) * bin_mul_factor).round() as usize
}

/// The central value of `bin`, the inverse of [`bin_number`]
#[inline]
pub fn bin_value(bin: usize, min_value: f64, bin_mul_factor: f64) -> f64 {
    min_value + bin as f64 / bin_mul_factor
}

/// The number of bins per unit of log m/z for a relative tolerance (i.e. ppm * 1e-6)
#[inline]
pub fn bin_mul_factor(relative_tolerance: f64) -> f64 {
    TOLERANCE_DIVISION_FACTOR / relative_tolerance
}

const WORD_BITS: usize = u64::BITS as usize;

/// A fixed-size bit vector with ordered iteration over its set positions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u64>,
    len: usize,
}

impl BitSet {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn get(&self, index: usize) -> bool {
        index < self.len && self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Set the bit at `index`. Out of bounds positions are ignored.
    #[inline]
    pub fn set(&mut self, index: usize) {
        if index < self.len {
            self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
        }
    }

    #[inline]
    pub fn reset(&mut self, index: usize) {
        if index < self.len {
            self.words[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
        }
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn find_first(&self) -> Option<usize> {
        self.find_from(0)
    }

    /// The first set position strictly after `index`
    pub fn find_next(&self, index: usize) -> Option<usize> {
        self.find_from(index + 1)
    }

    fn find_from(&self, start: usize) -> Option<usize> {
        if start >= self.len {
            return None;
        }
        let mut word_index = start / WORD_BITS;
        let mut word = self.words[word_index] & (u64::MAX << (start % WORD_BITS));
        loop {
            if word != 0 {
                let i = word_index * WORD_BITS + word.trailing_zeros() as usize;
                return (i < self.len).then_some(i);
            }
            word_index += 1;
            if word_index >= self.words.len() {
                return None;
            }
            word = self.words[word_index];
        }
    }

    /// Iterate over the set positions in ascending order
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.find_first(), |i| self.find_next(*i))
    }
}

/// The per-spectrum binning geometry: bin resolution, the m/z and mass axes' origins,
/// per-charge offsets between them, and the occupied m/z bins with their summed intensity.
///
/// Built fresh for every spectrum, since the resolution depends on the spectrum's MS level.
#[derive(Debug, Clone)]
pub struct BinningIndex {
    pub bin_mul_factor: f64,
    pub mz_bin_min_value: f64,
    pub mass_bin_min_value: f64,
    pub mass_bin_max_value: f64,
    /// `mass_bin = mz_bin + bin_offsets[charge - 1]`
    pub bin_offsets: Vec<i64>,
    /// `harmonic_bin_offsets[k][charge - 1]` is the offset for the `k`th harmonic charge
    pub harmonic_bin_offsets: Vec<Vec<i64>>,
    pub mz_bins: BitSet,
    pub mz_bin_intensities: Vec<f32>,
    pub mass_bin_count: usize,
}

impl BinningIndex {
    /// Build the index over `peaks`, which must be sorted by m/z.
    ///
    /// Returns `None` when there are no peaks to bin.
    pub fn new(
        peaks: &[LogMzPeak],
        filters: &ChargeFilters,
        relative_tolerance: f64,
        min_support_peak_count: usize,
        averagine: &PrecalculatedAveragine,
        min_mass: f64,
        max_mass: f64,
    ) -> Option<Self> {
        let first = peaks.first()?;
        let last = peaks.last()?;
        let max_abs_charge = filters.max_abs_charge();
        if max_abs_charge == 0 {
            return None;
        }
        let bin_mul_factor = bin_mul_factor(relative_tolerance);

        let mz_bin_min_value = first.log_mz;
        let mz_bin_max_value = last.log_mz;

        let mass_bin_min_value = (min_mass - averagine.average_mass_delta(min_mass))
            .max(1.0)
            .ln();
        let support_charge_index = max_abs_charge
            .saturating_sub(min_support_peak_count)
            .min(max_abs_charge - 1);
        let mass_bin_max_value = (mz_bin_max_value
            - filters.charge_filter[support_charge_index])
            .min(
                (max_mass
                    + averagine.right_count_from_apex(max_mass) as f64
                        * averagine.isotope_da_distance()
                    + 1.0)
                    .ln(),
            );

        let offset_for = |filter: f64| -> i64 {
            ((mz_bin_min_value - filter - mass_bin_min_value) * bin_mul_factor).round() as i64
        };
        let bin_offsets: Vec<i64> = filters
            .charge_filter
            .iter()
            .map(|f| offset_for(*f))
            .collect();
        let harmonic_bin_offsets: Vec<Vec<i64>> = filters
            .harmonic_filter
            .iter()
            .map(|hf| hf.iter().map(|f| offset_for(*f)).collect())
            .collect();

        let mz_bin_count = bin_number(mz_bin_max_value, mz_bin_min_value, bin_mul_factor) + 1;
        let mut mz_bins = BitSet::new(mz_bin_count);
        let mut mz_bin_intensities = vec![0.0f32; mz_bin_count];
        for p in peaks {
            let bin = bin_number(p.log_mz, mz_bin_min_value, bin_mul_factor);
            mz_bins.set(bin);
            mz_bin_intensities[bin] += p.intensity;
        }

        let mass_bin_count = bin_number(mass_bin_max_value, mass_bin_min_value, bin_mul_factor) + 1;

        trace!(
            "Binned {} peaks into {} m/z bins, {mass_bin_count} mass bins",
            peaks.len(),
            mz_bins.count_ones(),
        );

        Some(Self {
            bin_mul_factor,
            mz_bin_min_value,
            mass_bin_min_value,
            mass_bin_max_value,
            bin_offsets,
            harmonic_bin_offsets,
            mz_bins,
            mz_bin_intensities,
            mass_bin_count,
        })
    }

    #[inline]
    pub fn mz_bin(&self, log_mz: f64) -> usize {
        bin_number(log_mz, self.mz_bin_min_value, self.bin_mul_factor)
    }

    #[inline]
    pub fn mass_bin(&self, log_mass: f64) -> usize {
        bin_number(log_mass, self.mass_bin_min_value, self.bin_mul_factor)
    }

    /// The mass bin an m/z bin maps to under the charge at `charge_index`, if it is in range
    #[inline]
    pub fn mass_bin_for(&self, mz_bin: usize, charge_index: usize) -> Option<usize> {
        let bin = mz_bin as i64 + self.bin_offsets[charge_index];
        (bin >= 0 && (bin as usize) < self.mass_bin_count).then_some(bin as usize)
    }

    /// The m/z bin a mass bin maps back to under the charge at `charge_index`, if it is in range
    #[inline]
    pub fn mz_bin_for(&self, mass_bin: usize, charge_index: usize) -> Option<usize> {
        let bin = mass_bin as i64 - self.bin_offsets[charge_index];
        (bin >= 0 && (bin as usize) < self.mz_bins.len()).then_some(bin as usize)
    }

    /// The log mass value at the center of `mass_bin`
    #[inline]
    pub fn mass_bin_value(&self, mass_bin: usize) -> f64 {
        bin_value(mass_bin, self.mass_bin_min_value, self.bin_mul_factor)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::isotopic_model::IsotopicModels;

    #[test]
    fn test_bin_round_trip() {
        let f = bin_mul_factor(10e-6);
        let min = 5.0f64.ln();
        for v in [min, 5.5, 6.0, 7.1234567, 9.99999, 11.5] {
            let bin = bin_number(v, min, f);
            let back = bin_value(bin, min, f);
            assert!((back - v).abs() <= 0.5 / f + 1e-12, "{v} -> {bin} -> {back}");
        }
        assert_eq!(bin_number(1.0, min, f), 0);
    }

    #[test]
    fn test_bin_monotonic() {
        let f = bin_mul_factor(5e-6);
        let mut last = 0;
        let mut v = 6.0;
        while v < 6.01 {
            let b = bin_number(v, 6.0, f);
            assert!(b >= last);
            last = b;
            v += 1e-7;
        }
    }

    #[test]
    fn test_bitset() {
        let mut bits = BitSet::new(200);
        assert_eq!(bits.find_first(), None);
        bits.set(3);
        bits.set(64);
        bits.set(130);
        bits.set(199);
        bits.set(500);
        assert_eq!(bits.count_ones(), 4);
        assert!(bits.get(64));
        assert!(!bits.get(65));
        assert!(!bits.get(500));
        assert_eq!(bits.find_first(), Some(3));
        assert_eq!(bits.find_next(3), Some(64));
        assert_eq!(bits.find_next(64), Some(130));
        assert_eq!(bits.find_next(199), None);
        let ones: Vec<_> = bits.iter_ones().collect();
        assert_eq!(ones, vec![3, 64, 130, 199]);
        bits.reset(64);
        assert_eq!(bits.find_next(3), Some(130));
        bits.clear();
        assert_eq!(bits.count_ones(), 0);
    }

    #[test]
    fn test_offsets_consistent() {
        let averagine = PrecalculatedAveragine::for_max_mass(5000.0, IsotopicModels::Peptide);
        let filters = ChargeFilters::new(10);
        let mass = 4000.0;
        let peaks: Vec<_> = (1..=10)
            .map(|z| {
                let mz = mass / z as f64 + crate::isotopic_model::PROTON;
                LogMzPeak::new(mz, 100.0, true, z as u32)
            })
            .rev()
            .collect();
        let index = BinningIndex::new(&peaks, &filters, 10e-6, 2, &averagine, 50.0, 5000.0)
            .unwrap();
        assert_eq!(index.mz_bins.count_ones(), 10);

        let expected_mass_bin = index.mass_bin(mass.ln());
        for p in peaks.iter() {
            let z = p.index as usize;
            let mz_bin = index.mz_bin(p.log_mz);
            let mass_bin = index.mass_bin_for(mz_bin, z - 1).unwrap();
            assert!(
                mass_bin.abs_diff(expected_mass_bin) <= 1,
                "{z}: {mass_bin} vs {expected_mass_bin}"
            );
            assert_eq!(index.mz_bin_for(mass_bin, z - 1), Some(mz_bin));
        }
    }

    #[test]
    fn test_empty() {
        let averagine = PrecalculatedAveragine::for_max_mass(1000.0, IsotopicModels::Peptide);
        let filters = ChargeFilters::new(10);
        assert!(BinningIndex::new(&[], &filters, 10e-6, 2, &averagine, 50.0, 1000.0).is_none());
    }
}
