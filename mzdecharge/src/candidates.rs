//! Candidate neutral mass discovery over the binned spectrum.
//!
//! Every occupied m/z bin votes for one mass bin per charge state. A mass bin becomes a
//! candidate when its votes form a continuous charge ladder with bounded intensity ratios
//! between neighboring charges, or, for low charges, when an adjacent isotope peak is present.
//! Votes that look like a harmonic alias of another charge ladder are withdrawn.

use std::collections::HashMap;

use identity_hash::BuildIdentityHasher;
use tracing::debug;

use crate::bins::{bin_number, bin_value, BinningIndex, BitSet, TOLERANCE_DIVISION_FACTOR};
use crate::charge::{
    charge_ratio_factor, harmonic_ratio_factor, HARMONIC_CHARGES, LOW_CHARGE_THRESHOLD,
};

/// How many charge states each m/z bin may nominate in [`CandidateMassGenerator::filter_mass_bins`]
pub const SELECT_TOP_N_CHARGES: usize = 2;

/// A charge index range, `(min, max)`, inclusive. Charge index `j` is charge `j + 1`.
pub type ChargeIndexRange = (usize, usize);

/// The mass bins that survived candidate generation and the charge indices that nominated each
#[derive(Debug, Clone, Default)]
pub struct CandidateMasses {
    pub mass_bins: BitSet,
    pub charge_ranges: HashMap<usize, ChargeIndexRange, BuildIdentityHasher<usize>>,
    pub mass_intensities: Vec<f32>,
}

impl CandidateMasses {
    pub fn charge_range(&self, mass_bin: usize) -> Option<ChargeIndexRange> {
        self.charge_ranges.get(&mass_bin).copied()
    }

    /// Candidate mass bins and their charge index ranges, in ascending mass order
    pub fn iter(&self) -> impl Iterator<Item = (usize, ChargeIndexRange)> + '_ {
        self.mass_bins
            .iter_ones()
            .filter_map(|bin| self.charge_range(bin).map(|r| (bin, r)))
    }

    pub fn len(&self) -> usize {
        self.mass_bins.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bins closer than the tolerance division factor resolve the same peak
#[inline]
fn is_same_peak(bin: i64, mz_bin: usize) -> bool {
    ((bin - mz_bin as i64).abs() as f64) < TOLERANCE_DIVISION_FACTOR
}

/// Finds supported mass bins in one spectrum's [`BinningIndex`]
#[derive(Debug, Clone, Copy)]
pub struct CandidateMassGenerator<'a> {
    pub index: &'a BinningIndex,
    pub min_support_peak_count: usize,
    pub isotope_da_distance: f64,
    pub ms_level: u8,
    /// Mass bins no candidate may occupy
    pub decoy_mask: Option<&'a BitSet>,
    /// Mass bins nominated whenever they carry any signal
    pub target_mass_bins: Option<&'a BitSet>,
}

impl<'a> CandidateMassGenerator<'a> {
    pub fn new(
        index: &'a BinningIndex,
        min_support_peak_count: usize,
        isotope_da_distance: f64,
        ms_level: u8,
    ) -> Self {
        Self {
            index,
            min_support_peak_count,
            isotope_da_distance,
            ms_level,
            decoy_mask: None,
            target_mass_bins: None,
        }
    }

    pub fn with_decoy_mask(mut self, decoy_mask: Option<&'a BitSet>) -> Self {
        self.decoy_mask = decoy_mask;
        self
    }

    pub fn with_target_mass_bins(mut self, target_mass_bins: Option<&'a BitSet>) -> Self {
        self.target_mass_bins = target_mass_bins;
        self
    }

    #[inline]
    fn max_charge_index(&self) -> usize {
        self.index.bin_offsets.len()
    }

    #[inline]
    fn is_masked(&self, mass_bin: usize) -> bool {
        self.decoy_mask.is_some_and(|m| m.get(mass_bin))
    }

    #[inline]
    fn skips_harmonic(&self, harmonic: i32, abs_charge: i32) -> bool {
        self.ms_level > 1 && (harmonic * abs_charge) as usize > self.max_charge_index()
    }

    #[inline]
    fn occupied_mz_bin(&self, bin: i64) -> Option<usize> {
        let in_range = bin >= 0 && (bin as usize) < self.index.mz_bins.len();
        (in_range && self.index.mz_bins.get(bin as usize)).then_some(bin as usize)
    }

    /// Run both candidate generation passes
    pub fn generate(&self) -> CandidateMasses {
        let (mass_bins, mass_intensities) = self.update_candidate_mass_bins();
        let candidates = self.filter_mass_bins(&mass_bins, mass_intensities);
        debug!(
            "{} supported mass bins, {} after charge selection",
            mass_bins.count_ones(),
            candidates.len()
        );
        candidates
    }

    /// Vote for supported mass bins, returning the supported bins and the intensity
    /// accumulated in every mass bin.
    ///
    /// m/z bins are visited from high to low m/z so that, for any one mass bin, charges
    /// are visited from low to high.
    pub fn update_candidate_mass_bins(&self) -> (BitSet, Vec<f32>) {
        let index = self.index;
        let n_mass_bins = index.mass_bin_count;
        let max_charge_index = self.max_charge_index();
        let mz_intensities = &index.mz_bin_intensities;
        let unset_charge = max_charge_index + 2;

        let mut support_peak_count = vec![0usize; n_mass_bins];
        let mut prev_charges = vec![unset_charge; n_mass_bins];
        let mut prev_intensities = vec![0.0f32; n_mass_bins];
        let mut mass_intensities = vec![0.0f32; n_mass_bins];
        let mut mass_bins = BitSet::new(n_mass_bins);
        let mut sub_max_harmonic_intensity = [0.0f32; HARMONIC_CHARGES.len()];

        let occupied: Vec<usize> = index.mz_bins.iter_ones().collect();
        for mz_bin in occupied.into_iter().rev() {
            let intensity = mz_intensities[mz_bin];
            let log_mz = bin_value(mz_bin, index.mz_bin_min_value, index.bin_mul_factor);
            let mz = log_mz.exp();

            for j in 0..max_charge_index {
                let mass_bin = mz_bin as i64 + index.bin_offsets[j];
                if mass_bin < 0 {
                    continue;
                }
                if mass_bin >= n_mass_bins as i64 {
                    break;
                }
                let mass_bin = mass_bin as usize;
                if self.is_masked(mass_bin) {
                    continue;
                }

                let abs_charge = (j + 1) as i32;
                let prev_intensity = prev_intensities[mass_bin];
                let prev_charge = prev_charges[mass_bin];
                let follows_previous_charge = prev_charge + 1 == j;
                let charge_not_continuous =
                    !follows_previous_charge && prev_charge <= max_charge_index;

                let factor = charge_ratio_factor(abs_charge);
                let hfactor = harmonic_ratio_factor(abs_charge);
                let mut intensity_ratio = if prev_intensity <= 0.0 {
                    factor + 1.0
                } else {
                    intensity / prev_intensity
                };
                if intensity_ratio < 1.0 {
                    intensity_ratio = 1.0 / intensity_ratio;
                }

                let mut support_peak_intensity = 0.0f32;
                let mut pass_first_check = false;
                sub_max_harmonic_intensity.fill(0.0);

                if charge_not_continuous || intensity_ratio > factor {
                    support_peak_count[mass_bin] = 0;
                } else {
                    pass_first_check = true;
                    if support_peak_count[mass_bin] == 0 && abs_charge > LOW_CHARGE_THRESHOLD {
                        support_peak_intensity = prev_intensity;
                    }
                }

                // Low charges need a neighboring isotope peak that is not itself explained
                // by a harmonic charge.
                if !pass_first_check && abs_charge <= LOW_CHARGE_THRESHOLD {
                    for d in [1.0, -1.0] {
                        let diff = d * self.isotope_da_distance / abs_charge as f64 / mz;
                        let center =
                            bin_number(log_mz + diff, index.mz_bin_min_value, index.bin_mul_factor)
                                as i64;
                        let mut next_isotope_bin: Option<usize> = None;
                        for t in -1..=1 {
                            let bin = center + t;
                            if is_same_peak(bin, mz_bin) || bin == 0 {
                                continue;
                            }
                            if let Some(bin) = self.occupied_mz_bin(bin) {
                                pass_first_check = true;
                                if next_isotope_bin
                                    .map_or(true, |b| mz_intensities[b] < mz_intensities[bin])
                                {
                                    next_isotope_bin = Some(bin);
                                }
                            }
                        }

                        let Some(next_isotope_bin) = next_isotope_bin else {
                            continue;
                        };

                        let threshold = intensity + mz_intensities[next_isotope_bin];
                        for (k, hc) in HARMONIC_CHARGES.iter().copied().enumerate() {
                            if self.skips_harmonic(hc, abs_charge) {
                                break;
                            }
                            let hdiff = diff / hc as f64 * (hc / 2) as f64;
                            let center = bin_number(
                                log_mz + hdiff,
                                index.mz_bin_min_value,
                                index.bin_mul_factor,
                            ) as i64;
                            let mut harmonic_count = 0;
                            for t in -1..=1 {
                                let bin = center + t;
                                if is_same_peak(bin, mz_bin) {
                                    continue;
                                }
                                if let Some(bin) = self.occupied_mz_bin(bin) {
                                    let hi = mz_intensities[bin];
                                    if hi > threshold / 2.0 && hi < threshold * 2.0 {
                                        harmonic_count += 1;
                                        sub_max_harmonic_intensity[k] += hi;
                                    }
                                }
                            }
                            if harmonic_count > 0 {
                                pass_first_check = false;
                            }
                        }
                        if pass_first_check {
                            support_peak_intensity += mz_intensities[next_isotope_bin];
                        }
                    }
                    pass_first_check &= sub_max_harmonic_intensity.iter().all(|v| *v <= 0.0);
                }

                if pass_first_check {
                    if follows_previous_charge {
                        let (min_intensity, max_intensity) = if prev_intensity <= 0.0 {
                            (intensity, intensity)
                        } else {
                            (prev_intensity.min(intensity), prev_intensity.max(intensity))
                        };
                        let high_threshold = max_intensity * hfactor;
                        let low_threshold = min_intensity / hfactor;

                        let mut is_harmonic = false;
                        for (k, hc) in HARMONIC_CHARGES.iter().copied().enumerate() {
                            if self.skips_harmonic(hc, abs_charge) {
                                break;
                            }
                            let center = mass_bin as i64 - index.harmonic_bin_offsets[k][j];
                            for t in -1..=1 {
                                let bin = center + t;
                                if bin <= 0 || bin == mz_bin as i64 {
                                    continue;
                                }
                                if let Some(bin) = self.occupied_mz_bin(bin) {
                                    let hi = mz_intensities[bin];
                                    if hi > low_threshold && hi < high_threshold {
                                        sub_max_harmonic_intensity[k] += hi;
                                        is_harmonic = true;
                                    }
                                }
                            }
                        }

                        if !is_harmonic {
                            mass_intensities[mass_bin] += intensity + support_peak_intensity;
                            if !mass_bins.get(mass_bin) {
                                support_peak_count[mass_bin] += 1;
                                let spc = support_peak_count[mass_bin];
                                if spc >= self.min_support_peak_count
                                    || spc >= (abs_charge / 2) as usize
                                {
                                    mass_bins.set(mass_bin);
                                }
                            }
                        } else {
                            mass_intensities[mass_bin] -= sub_max_harmonic_intensity
                                .iter()
                                .copied()
                                .fold(0.0f32, f32::max);
                            support_peak_count[mass_bin] =
                                support_peak_count[mass_bin].saturating_sub(1);
                        }
                    } else if abs_charge <= LOW_CHARGE_THRESHOLD {
                        mass_intensities[mass_bin] += intensity + support_peak_intensity;
                        if !mass_bins.get(mass_bin) {
                            support_peak_count[mass_bin] += 1;
                            mass_bins.set(mass_bin);
                        }
                    }
                }

                prev_intensities[mass_bin] = intensity;
                prev_charges[mass_bin] = j;
            }
        }
        (mass_bins, mass_intensities)
    }

    /// Let every m/z bin nominate at most [`SELECT_TOP_N_CHARGES`] of the supported mass bins it
    /// voted for, preferring the most intense, and record the charge index range each
    /// nominated mass bin was reached with.
    ///
    /// Target mass bins are nominated whenever they carry signal, supported or not.
    pub fn filter_mass_bins(
        &self,
        supported: &BitSet,
        mass_intensities: Vec<f32>,
    ) -> CandidateMasses {
        let index = self.index;
        let n_mass_bins = index.mass_bin_count;
        let mut mass_bins = BitSet::new(n_mass_bins);
        let mut charge_ranges: HashMap<usize, ChargeIndexRange, BuildIdentityHasher<usize>> =
            HashMap::default();

        for mz_bin in index.mz_bins.iter_ones() {
            let mut top: [Option<(usize, usize)>; SELECT_TOP_N_CHARGES] =
                [None; SELECT_TOP_N_CHARGES];
            let mut max_intensity = 0.0f32;

            for j in 0..self.max_charge_index() {
                let mass_bin = mz_bin as i64 + index.bin_offsets[j];
                if mass_bin < 0 {
                    continue;
                }
                if mass_bin >= n_mass_bins as i64 {
                    break;
                }
                let mass_bin = mass_bin as usize;
                if self.is_masked(mass_bin) {
                    continue;
                }
                let t = mass_intensities[mass_bin];
                if t == 0.0 {
                    continue;
                }

                if self.target_mass_bins.is_some_and(|b| b.get(mass_bin)) {
                    max_intensity = f32::MAX;
                } else {
                    if !supported.get(mass_bin) {
                        continue;
                    }
                    if !(max_intensity == 0.0 || max_intensity < t) {
                        continue;
                    }
                    max_intensity = t;
                }
                top.rotate_right(1);
                top[0] = Some((mass_bin, j));
            }

            for (mass_bin, j) in top.into_iter().flatten() {
                charge_ranges
                    .entry(mass_bin)
                    .and_modify(|(lo, hi)| {
                        *lo = (*lo).min(j);
                        *hi = (*hi).max(j);
                    })
                    .or_insert((j, j));
                mass_bins.set(mass_bin);
            }
        }

        CandidateMasses {
            mass_bins,
            charge_ranges,
            mass_intensities,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::averagine::PrecalculatedAveragine;
    use crate::charge::ChargeFilters;
    use crate::isotopic_model::{IsotopicModels, PROTON};
    use crate::peaks::LogMzPeak;

    fn envelope_peaks(
        averagine: &PrecalculatedAveragine,
        mass: f64,
        charges: std::ops::RangeInclusive<i32>,
    ) -> Vec<LogMzPeak> {
        let iso = averagine.isotope_da_distance();
        let dist = averagine.get(mass);
        let mut peaks = Vec::new();
        for z in charges {
            for (i, a) in dist.as_slice().iter().enumerate() {
                if *a < 0.05 {
                    continue;
                }
                let mz = (mass + i as f64 * iso) / z as f64 + PROTON;
                peaks.push(LogMzPeak::new(mz, (*a * 1e4) as f32, true, 0));
            }
        }
        peaks.sort_by(|a, b| a.mz.total_cmp(&b.mz));
        peaks
    }

    #[test_log::test]
    fn test_candidate_masses() {
        let averagine = PrecalculatedAveragine::for_max_mass(12000.0, IsotopicModels::Peptide);
        let mass = 10000.0;
        let peaks = envelope_peaks(&averagine, mass, 7..=12);
        let filters = ChargeFilters::new(20);
        let index =
            BinningIndex::new(&peaks, &filters, 10e-6, 2, &averagine, 50.0, 12000.0).unwrap();

        let generator =
            CandidateMassGenerator::new(&index, 2, averagine.isotope_da_distance(), 1);
        let candidates = generator.generate();
        assert!(!candidates.is_empty());

        let apex = averagine.apex_index(mass);
        let expected = index.mass_bin((mass + apex as f64 * averagine.isotope_da_distance()).ln());
        let found = candidates
            .iter()
            .find(|(bin, _)| bin.abs_diff(expected) <= 2)
            .map(|(_, r)| r);
        let (lo, hi) = found.expect("the apex mass should be a candidate");
        assert!(lo <= hi);
        assert!((6..=11).contains(&lo) || (6..=11).contains(&hi), "{lo} {hi}");

        // Every candidate carries a charge range and lies within the mass axis
        for (bin, (lo, hi)) in candidates.iter() {
            assert!(bin < index.mass_bin_count);
            assert!(lo <= hi && hi < filters.max_abs_charge());
        }
    }

    #[test]
    fn test_masked_bins_are_skipped() {
        let averagine = PrecalculatedAveragine::for_max_mass(12000.0, IsotopicModels::Peptide);
        let peaks = envelope_peaks(&averagine, 10000.0, 7..=12);
        let filters = ChargeFilters::new(20);
        let index =
            BinningIndex::new(&peaks, &filters, 10e-6, 2, &averagine, 50.0, 12000.0).unwrap();

        let mut mask = BitSet::new(index.mass_bin_count);
        for i in 0..index.mass_bin_count {
            mask.set(i);
        }
        let candidates = CandidateMassGenerator::new(&index, 2, averagine.isotope_da_distance(), 1)
            .with_decoy_mask(Some(&mask))
            .generate();
        assert!(candidates.is_empty());
    }
}
