//! Decoy searches and target/decoy q-value estimation.
//!
//! Three kinds of decoy are supported, each the same search run against a perturbed
//! view of a spectrum that was already deconvolved as a target:
//!
//! - Noise decoys use a non-physical isotope spacing and ignore every peak the targets claimed.
//! - Charge decoys forbid the mass bins around every uncharged mass the target peaks implied.
//! - Isotope decoys rescore each target peak group at its best isotope offset that is not
//!   within the allowed isotope error of the true one.

use crate::bins::{BinningIndex, BitSet, TOLERANCE_DIVISION_FACTOR};
use crate::scorer::ScoreType;
use crate::spectrum::DeconvolvedSpectrum;

/// Scales the isotope spacing for noise decoys, `sqrt(7) / 2`, so that no real isotope
/// ladder can line up with it
pub const NOISE_DECOY_SPACING_FACTOR: f64 = 1.3228756555322954;

/// Whether a peak group came from the real search or one of the decoy searches
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TargetDecoyType {
    #[default]
    Target,
    NoiseDecoy,
    ChargeDecoy,
    IsotopeDecoy,
}

impl TargetDecoyType {
    pub fn is_decoy(&self) -> bool {
        !matches!(self, Self::Target)
    }
}

/// What a decoy search needs to know about the target search it perturbs
#[derive(Debug, Clone, Default)]
pub struct DecoyContext {
    pub kind: TargetDecoyType,
    /// Sorted m/z values of the peaks claimed by target peak groups, hidden from noise decoys
    pub excluded_peak_mzs: Vec<f64>,
    /// Sorted uncharged masses of the peaks claimed by target peak groups, which charge
    /// decoys may not reuse
    pub decoy_masses: Vec<f64>,
    /// The target spectrum, rescored by isotope decoys
    pub target: Option<DeconvolvedSpectrum>,
}

impl DecoyContext {
    /// The context for an ordinary target search
    pub fn target() -> Self {
        Self::default()
    }

    pub fn from_target_spectrum(kind: TargetDecoyType, target: &DeconvolvedSpectrum) -> Self {
        let mut this = Self {
            kind,
            ..Default::default()
        };
        match kind {
            TargetDecoyType::Target => {}
            TargetDecoyType::NoiseDecoy => {
                this.excluded_peak_mzs = target
                    .iter()
                    .flat_map(|pg| pg.peaks().iter().map(|p| p.mz))
                    .collect();
                this.excluded_peak_mzs.sort_by(|a, b| a.total_cmp(b));
                this.excluded_peak_mzs.dedup();
            }
            TargetDecoyType::ChargeDecoy => {
                this.decoy_masses = target
                    .iter()
                    .flat_map(|pg| pg.peaks().iter().map(|p| p.uncharged_mass()))
                    .filter(|m| *m > 0.0)
                    .collect();
                this.decoy_masses.sort_by(|a, b| a.total_cmp(b));
            }
            TargetDecoyType::IsotopeDecoy => {
                this.target = Some(target.clone());
            }
        }
        this
    }

    /// The isotope spacing this search runs with
    pub fn isotope_da_distance(&self, isotope_da_distance: f64) -> f64 {
        if self.kind == TargetDecoyType::NoiseDecoy {
            isotope_da_distance * NOISE_DECOY_SPACING_FACTOR
        } else {
            isotope_da_distance
        }
    }

    /// Mark the mass bins within a few bins of every forbidden charge decoy mass.
    ///
    /// Returns `None` when nothing is forbidden.
    pub fn mass_bin_mask(&self, index: &BinningIndex) -> Option<BitSet> {
        if self.kind != TargetDecoyType::ChargeDecoy || self.decoy_masses.is_empty() {
            return None;
        }
        let mut mask = BitSet::new(index.mass_bin_count);
        let radius = TOLERANCE_DIVISION_FACTOR.round() as usize;
        for mass in self.decoy_masses.iter().copied() {
            let bin = index.mass_bin(mass.ln());
            if bin >= radius && bin + radius + 1 < mask.len() {
                for b in bin - radius..=bin + radius {
                    mask.set(b);
                }
            }
        }
        Some(mask)
    }

    /// Whether `mass` lies within `relative_tolerance` of any forbidden charge decoy mass
    pub fn is_decoy_mass(&self, mass: f64, relative_tolerance: f64) -> bool {
        if self.kind != TargetDecoyType::ChargeDecoy {
            return false;
        }
        let delta = mass * relative_tolerance;
        let start = self.decoy_masses.partition_point(|m| *m <= mass - delta);
        self.decoy_masses[start..]
            .iter()
            .take_while(|m| **m < mass + delta)
            .any(|m| (m - mass).abs() < delta)
    }
}

/// Estimate q-values for every target peak group by target/decoy competition on Qscore.
///
/// For a score threshold `s`, the false discovery rate is the number of decoy groups scoring
/// at least `s` over the number of target groups scoring at least `s`. The q-value of a target
/// group is the smallest false discovery rate over all thresholds at or below its score,
/// capped at 1.
pub fn estimate_qvalues(targets: &mut [DeconvolvedSpectrum], decoys: &[DeconvolvedSpectrum]) {
    let mut scores: Vec<(ScoreType, bool)> = targets
        .iter()
        .flat_map(|s| s.iter().map(|pg| (pg.qscore(), false)))
        .chain(
            decoys
                .iter()
                .flat_map(|s| s.iter().map(|pg| (pg.qscore(), true))),
        )
        .collect();
    if scores.is_empty() {
        return;
    }
    scores.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

    // (score, fdr) at the last position of each distinct score
    let mut thresholds: Vec<(ScoreType, ScoreType)> = Vec::new();
    let mut n_target = 0usize;
    let mut n_decoy = 0usize;
    for (i, (score, is_decoy)) in scores.iter().enumerate() {
        if *is_decoy {
            n_decoy += 1;
        } else {
            n_target += 1;
        }
        let last_of_score = scores.get(i + 1).map(|(s, _)| s != score).unwrap_or(true);
        if last_of_score {
            let fdr = if n_target == 0 {
                1.0
            } else {
                (n_decoy as ScoreType / n_target as ScoreType).min(1.0)
            };
            thresholds.push((*score, fdr));
        }
    }
    for i in (0..thresholds.len().saturating_sub(1)).rev() {
        thresholds[i].1 = thresholds[i].1.min(thresholds[i + 1].1);
    }

    for spectrum in targets.iter_mut() {
        for pg in spectrum.peak_groups.iter_mut() {
            let i = thresholds.partition_point(|(s, _)| *s > pg.qscore());
            pg.qvalue = thresholds.get(i).map(|(_, q)| *q).unwrap_or(1.0);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use mzpeaks::CentroidPeak;

    use super::*;
    use crate::isotopic_model::PROTON;
    use crate::peak_group::PeakGroup;
    use crate::peaks::{LogMzPeak, RawSpectrum};

    fn spectrum_with_scores(scores: &[ScoreType]) -> DeconvolvedSpectrum {
        let raw = RawSpectrum::new(&[CentroidPeak::new(500.0, 10.0, 0)], 1);
        let mut spectrum = DeconvolvedSpectrum::new(Arc::new(raw), 1);
        for (i, s) in scores.iter().enumerate() {
            let mut pg = PeakGroup::with_mass(1000.0 + i as f64, 1, 2, true);
            pg.qscore = *s;
            spectrum.peak_groups.push(pg);
        }
        spectrum
    }

    #[test]
    fn test_qvalues() {
        let mut targets = vec![spectrum_with_scores(&[0.99, 0.95, 0.9, 0.6, 0.3])];
        let decoys = vec![spectrum_with_scores(&[0.7, 0.2])];
        estimate_qvalues(&mut targets, &decoys);
        let qvalues: Vec<_> = targets[0].iter().map(|pg| pg.qvalue()).collect();
        assert_eq!(qvalues[0], 0.0);
        assert_eq!(qvalues[1], 0.0);
        assert_eq!(qvalues[2], 0.0);
        // 0.6 takes the lower FDR reached further down the list
        assert!((qvalues[3] - 0.2).abs() < 1e-6);
        assert!((qvalues[4] - 0.2).abs() < 1e-6);
        assert!(qvalues.windows(2).all(|w| w[0] <= w[1]));

        targets[0].retain_qvalue(0.1);
        assert_eq!(targets[0].len(), 3);
    }

    #[test]
    fn test_noise_and_charge_contexts() {
        let mut target = spectrum_with_scores(&[]);
        let p = LogMzPeak::new(1001.0 + PROTON, 10.0, true, 0).assigned(1, 0);
        let q = LogMzPeak::new(501.0 + PROTON, 10.0, true, 1).assigned(2, 0);
        target
            .peak_groups
            .push(PeakGroup::from_peaks(vec![p, q], 1, 2, true, 1.002371));

        let noise = DecoyContext::from_target_spectrum(TargetDecoyType::NoiseDecoy, &target);
        assert_eq!(noise.excluded_peak_mzs.len(), 2);
        assert!(noise.excluded_peak_mzs[0] < noise.excluded_peak_mzs[1]);
        assert!((noise.isotope_da_distance(1.0) - 7f64.sqrt() / 2.0).abs() < 1e-12);

        let charge = DecoyContext::from_target_spectrum(TargetDecoyType::ChargeDecoy, &target);
        assert_eq!(charge.decoy_masses.len(), 2);
        assert!(charge.is_decoy_mass(1001.0 + 1001.0 * 5e-6, 10e-6));
        assert!(!charge.is_decoy_mass(1003.0, 10e-6));
        assert!(!noise.is_decoy_mass(1001.0, 10e-6));
        assert_eq!(charge.isotope_da_distance(1.0), 1.0);

        let target_ctx = DecoyContext::target();
        assert!(!target_ctx.kind.is_decoy());
    }
}
