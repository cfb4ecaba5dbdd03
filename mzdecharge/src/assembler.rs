//! Turn candidate mass bins into raw peak groups by collecting isotope envelopes
//! from the spectrum for each nominated charge state.

use tracing::debug;

use crate::averagine::PrecalculatedAveragine;
use crate::bins::{BinningIndex, BitSet, TOLERANCE_DIVISION_FACTOR};
use crate::candidates::CandidateMasses;
use crate::charge::HARMONIC_CHARGES;
use crate::peak_group::PeakGroup;
use crate::peaks::LogMzPeak;

/// The widest m/z error, in Daltons at charge 1, an isotope peak may have while its
/// envelope is being collected
pub const MAX_MASS_DALTON_TOLERANCE: f64 = 0.16;

/// Collects raw [`PeakGroup`]s for one spectrum
#[derive(Debug, Clone, Copy)]
pub struct PeakGroupAssembler<'a> {
    pub index: &'a BinningIndex,
    /// The spectrum's log m/z peaks, sorted by m/z
    pub peaks: &'a [LogMzPeak],
    pub averagine: &'a PrecalculatedAveragine,
    /// The relative tolerance of the spectrum's MS level
    pub relative_tolerance: f64,
    pub isotope_da_distance: f64,
    pub ms_level: u8,
    pub min_mass: f64,
    pub max_mass: f64,
    pub is_positive: bool,
    pub scan_number: u32,
    /// Mass bins no peak may be assigned into
    pub decoy_mask: Option<&'a BitSet>,
}

/// The running maximum of the current isotope, folded into a total whenever the isotope changes
#[derive(Debug, Default, Clone, Copy)]
struct IsotopeAccumulator {
    total: f64,
    current_max: f32,
    current: Option<i32>,
}

impl IsotopeAccumulator {
    fn add(&mut self, isotope: i32, intensity: f32) {
        if self.current != Some(isotope) {
            self.total += self.current_max as f64;
            self.current_max = 0.0;
        }
        self.current_max = self.current_max.max(intensity);
        self.current = Some(isotope);
    }

    fn finish(&mut self) -> f64 {
        self.total += self.current_max as f64;
        self.current_max = 0.0;
        self.current = None;
        self.total
    }
}

/// Per-harmonic intensity observed between the isotope positions of a charge state
#[derive(Debug, Default, Clone, Copy)]
struct HarmonicAccumulator {
    total: f64,
    current_max: f32,
    previous_isotope: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Right,
    Left,
}

impl<'a> PeakGroupAssembler<'a> {
    #[inline]
    fn bin_tolerance(&self) -> f64 {
        self.relative_tolerance / TOLERANCE_DIVISION_FACTOR
    }

    #[inline]
    fn max_charge_index(&self) -> usize {
        self.index.bin_offsets.len()
    }

    /// Build one raw peak group per candidate mass bin that has an isotope envelope
    /// which is not better explained by a harmonic charge.
    ///
    /// Mass bins are visited in ascending order, and each charge keeps a cursor into the
    /// peak list so the peaks are scanned once per charge.
    pub fn assemble_candidate_peak_groups(&self, candidates: &CandidateMasses) -> Vec<PeakGroup> {
        let index = self.index;
        let n_peaks = self.peaks.len();
        let peak_bins: Vec<usize> = self.peaks.iter().map(|p| index.mz_bin(p.log_mz)).collect();
        let mut cursors = vec![0usize; self.max_charge_index()];
        let mut groups = Vec::with_capacity(candidates.len());

        for (mass_bin, (lo, hi)) in candidates.iter() {
            let mass = index.mass_bin_value(mass_bin).exp();
            let left_count = self.averagine.left_count_from_apex(mass) as f64;
            let right_count = self.averagine.right_count_from_apex(mass) as f64;

            let mut collected: Vec<LogMzPeak> = Vec::new();
            let mut total_signal = 0.0;
            let mut total_harmonic = [0.0f64; HARMONIC_CHARGES.len()];

            for j in lo..=hi.min(self.max_charge_index().saturating_sub(1)) {
                let abs_charge = (j + 1) as i32;
                let bin_offset = index.bin_offsets[j];
                if (mass_bin as i64) < bin_offset {
                    continue;
                }
                let mz_bin = (mass_bin as i64 - bin_offset) as usize;

                let cursor = &mut cursors[j];
                let mut anchor: Option<usize> = None;
                let mut anchor_intensity = -1.0f32;
                while *cursor < n_peaks {
                    let bin = peak_bins[*cursor];
                    if bin == mz_bin {
                        if self.peaks[*cursor].intensity > anchor_intensity {
                            anchor_intensity = self.peaks[*cursor].intensity;
                            anchor = Some(*cursor);
                        }
                    } else if bin > mz_bin {
                        break;
                    }
                    *cursor += 1;
                }
                let Some(anchor) = anchor else {
                    continue;
                };

                // The anchor must be a local maximum
                if anchor > 0
                    && peak_bins[anchor - 1] + 1 == mz_bin
                    && self.peaks[anchor - 1].intensity > anchor_intensity
                {
                    continue;
                }
                if anchor + 1 < n_peaks
                    && peak_bins[anchor + 1] == mz_bin + 1
                    && self.peaks[anchor + 1].intensity > anchor_intensity
                {
                    continue;
                }

                let (signal, harmonic) = self.collect_envelope(
                    anchor,
                    abs_charge,
                    bin_offset,
                    &peak_bins,
                    (left_count, right_count),
                    &mut collected,
                );
                total_signal += signal;
                for (t, h) in total_harmonic.iter_mut().zip(harmonic) {
                    *t += h;
                }
            }

            let max_harmonic = total_harmonic.iter().copied().fold(0.0, f64::max);
            if collected.is_empty() || total_signal <= max_harmonic {
                continue;
            }
            if let Some(group) = self.recenter(collected) {
                groups.push(group);
            }
        }
        debug!(
            "Assembled {} raw peak groups from {} candidate masses",
            groups.len(),
            candidates.len()
        );
        groups
    }

    /// Walk out from `anchor` in both directions along the isotope ladder of `abs_charge`,
    /// pushing matching peaks into `collected`. Returns the summed per-isotope maximum
    /// intensity, and the same for peaks sitting on each harmonic ladder instead.
    fn collect_envelope(
        &self,
        anchor: usize,
        abs_charge: i32,
        bin_offset: i64,
        peak_bins: &[usize],
        (left_count, right_count): (f64, f64),
        collected: &mut Vec<LogMzPeak>,
    ) -> (f64, [f64; HARMONIC_CHARGES.len()]) {
        let anchor_mz = self.peaks[anchor].mz;
        let isotope_delta = self.isotope_da_distance / abs_charge as f64;
        let mz_delta = (MAX_MASS_DALTON_TOLERANCE / abs_charge as f64)
            .min(2.0 * self.bin_tolerance() * anchor_mz);
        let mut max_peak_intensity = self.peaks[anchor].intensity;

        let mut signal = 0.0;
        let mut harmonic_totals = [0.0f64; HARMONIC_CHARGES.len()];

        for direction in [Direction::Right, Direction::Left] {
            let mut isotopes = IsotopeAccumulator::default();
            let mut harmonics = [HarmonicAccumulator::default(); HARMONIC_CHARGES.len()];

            let indices: Box<dyn Iterator<Item = usize>> = match direction {
                Direction::Right => Box::new(anchor..self.peaks.len()),
                Direction::Left => Box::new((0..anchor).rev()),
            };
            let span = match direction {
                Direction::Right => right_count,
                Direction::Left => left_count,
            } * isotope_delta
                + mz_delta;

            for peak_index in indices {
                let peak = &self.peaks[peak_index];
                let mz_diff = peak.mz - anchor_mz;
                if mz_diff.abs() > span {
                    break;
                }
                let isotope = (mz_diff / isotope_delta).round() as i32;

                if (mz_diff - isotope as f64 * isotope_delta).abs() < mz_delta {
                    let bin = peak_bins[peak_index] as i64 + bin_offset;
                    let masked = self.decoy_mask.is_some_and(|m| m.get(bin as usize));
                    if bin >= 0 && (bin as usize) < self.index.mass_bin_count && !masked {
                        collected.push(peak.assigned(abs_charge, isotope));
                        max_peak_intensity = max_peak_intensity.max(peak.intensity);
                        isotopes.add(isotope, peak.intensity);
                    }
                    continue;
                }

                for (l, hc) in HARMONIC_CHARGES.iter().copied().enumerate() {
                    if self.ms_level > 1 && (hc * abs_charge) as usize > self.max_charge_index() {
                        break;
                    }
                    let harmonic_delta = isotope_delta / hc as f64;
                    let harmonic_isotope = (mz_diff / harmonic_delta).round() as i32;
                    let position = harmonic_isotope as f64 / hc as f64;
                    match direction {
                        Direction::Right => {
                            if position < isotope as f64 + MAX_MASS_DALTON_TOLERANCE {
                                continue;
                            }
                            if position >= (isotope + 1) as f64 - MAX_MASS_DALTON_TOLERANCE {
                                break;
                            }
                        }
                        Direction::Left => {
                            if position > isotope as f64 - MAX_MASS_DALTON_TOLERANCE {
                                continue;
                            }
                            if position <= (isotope - 1) as f64 + MAX_MASS_DALTON_TOLERANCE {
                                break;
                            }
                        }
                    }
                    let error = (mz_diff - harmonic_isotope as f64 * harmonic_delta).abs();
                    if error < mz_delta {
                        let h = &mut harmonics[l];
                        let harmonic_position = harmonic_isotope / hc;
                        if h.previous_isotope != harmonic_position {
                            h.total += match direction {
                                Direction::Right => max_peak_intensity.min(h.current_max),
                                Direction::Left => h.current_max,
                            } as f64;
                            h.current_max = 0.0;
                        }
                        h.current_max = h.current_max.max(peak.intensity);
                        h.previous_isotope = harmonic_position;
                    }
                }
            }

            signal += isotopes.finish();
            for (t, h) in harmonic_totals.iter_mut().zip(harmonics.iter()) {
                *t += h.total
                    + match direction {
                        Direction::Right => h.current_max,
                        Direction::Left => max_peak_intensity.min(h.current_max),
                    } as f64;
            }
        }
        (signal, harmonic_totals)
    }

    /// Re-index isotopes around the most intense collected peak, whose isotope index
    /// becomes the averagine apex index for its mass, and build the raw peak group.
    ///
    /// Peaks inconsistent with the most intense peak's mass are dropped, and so is the
    /// whole group if only one isotope index remains or its mass is out of range.
    fn recenter(&self, collected: Vec<LogMzPeak>) -> Option<PeakGroup> {
        let top = collected
            .iter()
            .copied()
            .reduce(|best, p| if p.intensity > best.intensity { p } else { best })?;
        let top_mass = top.uncharged_mass();
        let isotope_tolerance = self.bin_tolerance() * top_mass;
        let apex = self.averagine.apex_index(top_mass) as i32;

        let mut min_isotope = i32::MAX;
        let mut max_isotope = i32::MIN;
        let mut min_charge = i32::MAX;
        let mut max_charge = i32::MIN;
        let recentered: Vec<LogMzPeak> = collected
            .into_iter()
            .filter_map(|p| {
                let mass = p.uncharged_mass();
                let isotope = ((mass - top_mass) / self.isotope_da_distance).round() as i32;
                if (top_mass - mass + self.isotope_da_distance * isotope as f64).abs()
                    > isotope_tolerance
                {
                    return None;
                }
                let isotope = isotope + apex;
                min_isotope = min_isotope.min(isotope);
                max_isotope = max_isotope.max(isotope);
                min_charge = min_charge.min(p.abs_charge);
                max_charge = max_charge.max(p.abs_charge);
                Some(p.assigned(p.abs_charge, isotope))
            })
            .collect();

        if recentered.is_empty() || min_isotope == max_isotope {
            return None;
        }
        debug_assert!(min_charge >= 1 && max_charge as usize <= self.max_charge_index());

        let mut group = PeakGroup::from_peaks(
            recentered,
            min_charge,
            max_charge,
            self.is_positive,
            self.isotope_da_distance,
        );
        if group.monoisotopic_mass() < self.min_mass || group.monoisotopic_mass() > self.max_mass
        {
            return None;
        }
        group.scan_number = self.scan_number;
        Some(group)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::candidates::CandidateMassGenerator;
    use crate::charge::ChargeFilters;
    use crate::isotopic_model::{IsotopicModels, PROTON};

    #[test_log::test]
    fn test_assemble() {
        let averagine = PrecalculatedAveragine::for_max_mass(12000.0, IsotopicModels::Peptide);
        let iso = averagine.isotope_da_distance();
        let mass = 10000.0;
        let dist = averagine.get(mass);
        let mut peaks = Vec::new();
        for z in 7..=12 {
            for (i, a) in dist.as_slice().iter().enumerate() {
                if *a < 0.05 {
                    continue;
                }
                let mz = (mass + i as f64 * iso) / z as f64 + PROTON;
                peaks.push(LogMzPeak::new(mz, (*a * 1e4) as f32, true, 0));
            }
        }
        peaks.sort_by(|a, b| a.mz.total_cmp(&b.mz));
        for (i, p) in peaks.iter_mut().enumerate() {
            p.index = i as u32;
        }

        let filters = ChargeFilters::new(20);
        let index =
            BinningIndex::new(&peaks, &filters, 10e-6, 2, &averagine, 50.0, 12000.0).unwrap();
        let candidates = CandidateMassGenerator::new(&index, 2, iso, 1).generate();

        let assembler = PeakGroupAssembler {
            index: &index,
            peaks: &peaks,
            averagine: &averagine,
            relative_tolerance: 10e-6,
            isotope_da_distance: iso,
            ms_level: 1,
            min_mass: 50.0,
            max_mass: 12000.0,
            is_positive: true,
            scan_number: 3,
            decoy_mask: None,
        };
        let groups = assembler.assemble_candidate_peak_groups(&candidates);
        assert!(!groups.is_empty());

        let best = groups
            .iter()
            .min_by(|a, b| {
                (a.monoisotopic_mass() - mass)
                    .abs()
                    .total_cmp(&(b.monoisotopic_mass() - mass).abs())
            })
            .unwrap();
        assert!(
            (best.monoisotopic_mass() - mass).abs() < 0.05,
            "{}",
            best.monoisotopic_mass()
        );
        assert!(best.min_abs_charge() >= 7 && best.max_abs_charge() <= 12);
        assert_eq!(best.scan_number(), 3);
        for p in best.peaks() {
            assert!((best.min_abs_charge()..=best.max_abs_charge()).contains(&p.abs_charge));
        }
    }
}
