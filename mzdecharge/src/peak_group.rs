//! Peak groups: the hypothesis that one neutral monoisotopic mass observed over a range
//! of charge states explains a set of spectrum peaks.
//!
//! Peak groups are treated as values. Every refinement round builds a new [`PeakGroup`] from
//! the previous one and the peaks it recruits, so each round can be inspected on its own.

use std::cmp::Ordering;

use tracing::trace;

use crate::averagine::PrecalculatedAveragine;
use crate::charge::{ChargeRange, ChargeRangeIter};
use crate::decoy::TargetDecoyType;
use crate::peaks::{charge_mass, nominal_mass, LogMzPeak};
use crate::scorer::{
    cosine, isotope_cosine_and_offset, isotope_cosine_at, IsotopeOffsetSearch, LogisticQScorer,
    QScoreFeatures, ScoreType, SignalNoise,
};

/// The most refinement rounds a candidate gets to settle its monoisotopic mass
pub const MAX_REFINEMENT_ITERATIONS: usize = 10;

/// Everything read-only that scoring a peak group against one spectrum needs
#[derive(Debug, Clone, Copy)]
pub struct ScoringContext<'a> {
    /// The spectrum's log m/z peaks, sorted by m/z
    pub peaks: &'a [LogMzPeak],
    pub averagine: &'a PrecalculatedAveragine,
    /// The relative m/z tolerance used when recruiting peaks
    pub relative_tolerance: f64,
    pub min_isotope_cosine: ScoreType,
    pub isotope_da_distance: f64,
    pub offset_search: IsotopeOffsetSearch,
    pub qscorer: LogisticQScorer,
    /// The largest charge any peak group may be extended to
    pub max_abs_charge: i32,
}

/// The peaks consistent with a mass hypothesis, and the power of the unmatched peaks
/// interleaved with them, per charge.
#[derive(Debug, Clone, Default)]
pub struct Recruitment {
    pub signal: Vec<LogMzPeak>,
    /// Unmatched peak power for each charge, indexed from `min_abs_charge`
    pub noise_power: Vec<f64>,
    /// The charge range that was searched
    pub min_abs_charge: i32,
    pub max_abs_charge: i32,
}

/// A candidate neutral mass and the peaks supporting it
#[derive(Debug, Clone, PartialEq)]
pub struct PeakGroup {
    pub(crate) peaks: Vec<LogMzPeak>,
    pub(crate) monoisotopic_mass: f64,
    pub(crate) intensity: f32,
    pub(crate) min_abs_charge: i32,
    pub(crate) max_abs_charge: i32,
    pub(crate) is_positive: bool,
    pub(crate) per_isotope_intensities: Vec<f32>,
    pub(crate) isotope_index_origin: i32,
    pub(crate) per_charge_snr: Vec<ScoreType>,
    pub(crate) isotope_cosine: ScoreType,
    pub(crate) snr: ScoreType,
    pub(crate) qscore: ScoreType,
    pub(crate) qvalue: ScoreType,
    pub(crate) representative_abs_charge: i32,
    pub(crate) target_decoy_type: TargetDecoyType,
    pub(crate) targeted: bool,
    pub(crate) scan_number: u32,
}

impl PeakGroup {
    /// An empty hypothesis over an absolute charge range
    pub fn new(min_abs_charge: i32, max_abs_charge: i32, is_positive: bool) -> Self {
        Self {
            peaks: Vec::new(),
            monoisotopic_mass: 0.0,
            intensity: 0.0,
            min_abs_charge: min_abs_charge.min(max_abs_charge),
            max_abs_charge: max_abs_charge.max(min_abs_charge),
            is_positive,
            per_isotope_intensities: Vec::new(),
            isotope_index_origin: 0,
            per_charge_snr: Vec::new(),
            isotope_cosine: 0.0,
            snr: 0.0,
            qscore: 0.0,
            qvalue: 1.0,
            representative_abs_charge: min_abs_charge,
            target_decoy_type: TargetDecoyType::Target,
            targeted: false,
            scan_number: 0,
        }
    }

    /// A hypothesis for `monoisotopic_mass` with no peaks yet, used to test a spectrum
    pub fn with_mass(
        monoisotopic_mass: f64,
        min_abs_charge: i32,
        max_abs_charge: i32,
        is_positive: bool,
    ) -> Self {
        let mut this = Self::new(min_abs_charge, max_abs_charge, is_positive);
        this.monoisotopic_mass = monoisotopic_mass;
        this
    }

    /// Build a group from charge and isotope labeled peaks, estimating the monoisotopic mass
    /// as the intensity weighted mean of each peak's implied monoisotopic mass.
    pub fn from_peaks(
        mut peaks: Vec<LogMzPeak>,
        min_abs_charge: i32,
        max_abs_charge: i32,
        is_positive: bool,
        isotope_da_distance: f64,
    ) -> Self {
        let mut this = Self::new(min_abs_charge, max_abs_charge, is_positive);
        if peaks.is_empty() {
            return this;
        }
        peaks.sort_by(|a, b| {
            a.mz.total_cmp(&b.mz)
                .then(a.abs_charge.cmp(&b.abs_charge))
                .then(a.isotope_index.cmp(&b.isotope_index))
        });
        peaks.dedup_by(|a, b| a.index == b.index && a.abs_charge == b.abs_charge);

        let origin = peaks
            .iter()
            .map(|p| p.isotope_index)
            .min()
            .unwrap_or_default()
            .min(0);
        let last = peaks
            .iter()
            .map(|p| p.isotope_index)
            .max()
            .unwrap_or_default()
            .max(0);

        let mut per_isotope = vec![0.0f32; (last - origin + 1) as usize];
        let mut weighted_mass = 0.0;
        let mut total = 0.0;
        for p in peaks.iter() {
            per_isotope[(p.isotope_index - origin) as usize] += p.intensity;
            let intensity = p.intensity as f64;
            weighted_mass +=
                intensity * (p.uncharged_mass() - p.isotope_index as f64 * isotope_da_distance);
            total += intensity;
        }

        this.monoisotopic_mass = if total > 0.0 {
            weighted_mass / total
        } else {
            0.0
        };
        this.intensity = total as f32;
        this.per_isotope_intensities = per_isotope;
        this.isotope_index_origin = origin;
        this.peaks = peaks;
        this
    }

    /// Copy the labels that identify where a group came from onto a rebuilt group
    fn carry_labels_from(mut self, other: &Self) -> Self {
        self.target_decoy_type = other.target_decoy_type;
        self.targeted = other.targeted;
        self.scan_number = other.scan_number;
        self.qvalue = other.qvalue;
        self
    }

    pub fn monoisotopic_mass(&self) -> f64 {
        self.monoisotopic_mass
    }

    pub fn nominal_mass(&self) -> i64 {
        nominal_mass(self.monoisotopic_mass)
    }

    pub fn intensity(&self) -> f32 {
        self.intensity
    }

    pub fn charge_range(&self) -> ChargeRange {
        (self.min_abs_charge, self.max_abs_charge)
    }

    pub fn min_abs_charge(&self) -> i32 {
        self.min_abs_charge
    }

    pub fn max_abs_charge(&self) -> i32 {
        self.max_abs_charge
    }

    pub fn is_positive(&self) -> bool {
        self.is_positive
    }

    pub fn peaks(&self) -> &[LogMzPeak] {
        &self.peaks
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    /// Summed intensity per isotope, starting from the monoisotopic peak
    pub fn per_isotope_intensities(&self) -> &[f32] {
        let skip = (-self.isotope_index_origin) as usize;
        self.per_isotope_intensities.get(skip..).unwrap_or_default()
    }

    pub fn isotope_cosine(&self) -> ScoreType {
        self.isotope_cosine
    }

    pub fn snr(&self) -> ScoreType {
        self.snr
    }

    /// The signal-to-noise ratio of one charge state, zero outside of the charge range
    pub fn charge_snr(&self, abs_charge: i32) -> ScoreType {
        if abs_charge < self.min_abs_charge {
            return 0.0;
        }
        self.per_charge_snr
            .get((abs_charge - self.min_abs_charge) as usize)
            .copied()
            .unwrap_or_default()
    }

    /// The charge state with the highest signal-to-noise ratio
    pub fn representative_abs_charge(&self) -> i32 {
        self.representative_abs_charge
    }

    pub fn qscore(&self) -> ScoreType {
        self.qscore
    }

    pub fn qvalue(&self) -> ScoreType {
        self.qvalue
    }

    pub fn target_decoy_type(&self) -> TargetDecoyType {
        self.target_decoy_type
    }

    pub fn is_targeted(&self) -> bool {
        self.targeted
    }

    pub fn scan_number(&self) -> u32 {
        self.scan_number
    }

    /// The m/z of the monoisotopic peak at `abs_charge`
    pub fn mono_mz(&self, abs_charge: i32) -> f64 {
        self.monoisotopic_mass / abs_charge as f64 + charge_mass(self.is_positive)
    }

    /// A copy of this group searching a different charge range
    pub fn with_charge_range(mut self, min_abs_charge: i32, max_abs_charge: i32) -> Self {
        self.min_abs_charge = min_abs_charge.min(max_abs_charge);
        self.max_abs_charge = max_abs_charge.max(min_abs_charge);
        self.per_charge_snr.clear();
        self
    }

    /// Collect every spectrum peak consistent with `monoisotopic_mass` at each charge in this
    /// group's range.
    ///
    /// For each charge the averagine isotope window for the mass, padded by the isotope
    /// offset search radius, is scanned. Peaks within the relative tolerance of an isotope
    /// position are signal, and unmatched peaks lying between the first and last signal
    /// peak of that charge count towards its noise.
    pub fn recruit_all_peaks(&self, ctx: &ScoringContext, monoisotopic_mass: f64) -> Recruitment {
        let n_charges = (self.max_abs_charge - self.min_abs_charge + 1).max(0) as usize;
        let mut recruitment = Recruitment {
            signal: Vec::new(),
            noise_power: vec![0.0; n_charges],
            min_abs_charge: self.min_abs_charge,
            max_abs_charge: self.max_abs_charge,
        };
        if monoisotopic_mass <= 0.0 || ctx.peaks.is_empty() {
            return recruitment;
        }

        let averagine = ctx.averagine.get(monoisotopic_mass);
        let apex = averagine.apex_index() as i64;
        let radius = apex / 4 + 1;
        let min_isotope = (apex - averagine.left_count_from_apex() as i64).min(0) - radius;
        let max_isotope = apex + averagine.right_count_from_apex() as i64 + radius;

        for (charge_index, z) in ChargeRangeIter::new(self.min_abs_charge, self.max_abs_charge)
            .enumerate()
        {
            let isotope_delta = ctx.isotope_da_distance / z as f64;
            let mono_mz = monoisotopic_mass / z as f64 + charge_mass(self.is_positive);
            let tolerance = mono_mz * ctx.relative_tolerance;
            let lowest = mono_mz + min_isotope as f64 * isotope_delta - tolerance;
            let highest = mono_mz + max_isotope as f64 * isotope_delta + tolerance;

            let start = ctx.peaks.partition_point(|p| p.mz < lowest);
            let mut noise = Vec::new();
            let mut first_signal_mz = f64::INFINITY;
            let mut last_signal_mz = f64::NEG_INFINITY;
            for p in ctx.peaks[start..].iter().take_while(|p| p.mz <= highest) {
                let k = ((p.mz - mono_mz) / isotope_delta).round();
                let error = (p.mz - mono_mz - k * isotope_delta).abs();
                if error <= p.mz * ctx.relative_tolerance {
                    recruitment.signal.push(p.assigned(z, k as i32));
                    first_signal_mz = first_signal_mz.min(p.mz);
                    last_signal_mz = last_signal_mz.max(p.mz);
                } else {
                    noise.push(*p);
                }
            }
            recruitment.noise_power[charge_index] = noise
                .iter()
                .filter(|p| p.mz > first_signal_mz && p.mz < last_signal_mz)
                .map(|p| (p.intensity as f64).powi(2))
                .sum();
        }
        recruitment
    }

    /// Build the next value of this group from recruited peaks and score it.
    ///
    /// The new group's charge range narrows to the charges that recruited any signal. Returns
    /// the new group and the isotope offset its monoisotopic mass should move by. When the
    /// context searches for second best offsets, the mass is scored where it stands and the
    /// offset is always zero. A group whose isotope cosine falls below the context's minimum
    /// gets a Qscore of zero.
    pub fn update_scores(&self, recruitment: Recruitment, ctx: &ScoringContext) -> (Self, i32) {
        let Recruitment {
            signal,
            noise_power,
            min_abs_charge,
            max_abs_charge,
        } = recruitment;

        let observed_min = signal.iter().map(|p| p.abs_charge).min();
        let observed_max = signal.iter().map(|p| p.abs_charge).max();
        let (Some(lo), Some(hi)) = (observed_min, observed_max) else {
            let next = Self::new(min_abs_charge, max_abs_charge, self.is_positive)
                .carry_labels_from(self);
            return (next, 0);
        };

        let mut next =
            Self::from_peaks(signal, lo, hi, self.is_positive, ctx.isotope_da_distance)
                .carry_labels_from(self);

        let theoretical = ctx.averagine.get(next.monoisotopic_mass);
        let width = next.per_isotope_intensities.len();
        let mut total = SignalNoise::default();
        let mut charges_with_signal = 0usize;
        let mut per_charge_snr = Vec::with_capacity((hi - lo + 1) as usize);

        for z in ChargeRangeIter::new(lo, hi) {
            let mut per_isotope = vec![0.0f32; width];
            for p in next.peaks.iter().filter(|p| p.abs_charge == z) {
                per_isotope[(p.isotope_index - next.isotope_index_origin) as usize] += p.intensity;
            }
            let isotope_power: f64 = per_isotope.iter().map(|v| (*v as f64).powi(2)).sum();
            if isotope_power <= 0.0 {
                per_charge_snr.push(0.0);
                continue;
            }
            charges_with_signal += 1;
            let charge_cosine = cosine(
                &per_isotope,
                theoretical,
                -(next.isotope_index_origin as i64),
                0,
            );
            let sn = SignalNoise::new(
                charge_cosine,
                isotope_power,
                noise_power
                    .get((z - min_abs_charge) as usize)
                    .copied()
                    .unwrap_or_default(),
            );
            per_charge_snr.push(sn.snr());
            total = total + sn;
        }

        next.per_charge_snr = per_charge_snr;
        next.snr = total.snr();
        next.representative_abs_charge = next
            .per_charge_snr
            .iter()
            .enumerate()
            .max_by(|(i, a), (j, b)| a.total_cmp(b).then(j.cmp(i)))
            .map(|(i, _)| lo + i as i32)
            .unwrap_or(lo);

        let (isotope_cosine, offset) = match ctx.offset_search {
            IsotopeOffsetSearch::Best => isotope_cosine_and_offset(
                next.monoisotopic_mass,
                &next.per_isotope_intensities,
                next.isotope_index_origin,
                ctx.averagine,
                IsotopeOffsetSearch::Best,
            ),
            // Decoy masses were already moved to the runner-up alignment
            IsotopeOffsetSearch::SecondBest { .. } => {
                let cosine = isotope_cosine_at(
                    next.monoisotopic_mass,
                    &next.per_isotope_intensities,
                    next.isotope_index_origin,
                    ctx.averagine,
                    0,
                );
                (cosine, 0)
            }
        };
        next.isotope_cosine = isotope_cosine;

        if isotope_cosine < ctx.min_isotope_cosine {
            next.qscore = 0.0;
            return (next, offset);
        }

        next.qscore = ctx.qscorer.score(&QScoreFeatures {
            isotope_cosine,
            representative_charge_snr: next.charge_snr(next.representative_abs_charge),
            snr: next.snr,
            charge_coverage: charges_with_signal as f32 / (hi - lo + 1) as f32,
        });
        (next, offset)
    }

    /// Iteratively settle this candidate's monoisotopic mass.
    ///
    /// Each round recruits every spectrum peak consistent with the current mass over the
    /// current charge range widened by one charge on each side, rescores, and shifts the mass
    /// by the best isotope offset. The loop ends when the offset reaches zero, or after a
    /// single round for isotope decoys, which move once to the second best offset.
    /// Candidates whose initial isotope cosine is below `min(min_isotope_cosine, 0.5)` and
    /// candidates that do not converge within
    /// [`MAX_REFINEMENT_ITERATIONS`] rounds yield `None`.
    pub fn refine(&self, ctx: &ScoringContext) -> Option<Self> {
        let (isotope_cosine, mut offset) = isotope_cosine_and_offset(
            self.monoisotopic_mass,
            &self.per_isotope_intensities,
            self.isotope_index_origin,
            ctx.averagine,
            ctx.offset_search,
        );
        if isotope_cosine < ctx.min_isotope_cosine.min(0.5) {
            trace!(
                "Rejected {:.3} with initial isotope cosine {isotope_cosine:.3}",
                self.monoisotopic_mass
            );
            return None;
        }

        let single_pass = matches!(ctx.offset_search, IsotopeOffsetSearch::SecondBest { .. });
        let mut current = self.clone();
        current.isotope_cosine = isotope_cosine;
        for _ in 0..MAX_REFINEMENT_ITERATIONS {
            let mass = current.monoisotopic_mass + offset as f64 * ctx.isotope_da_distance;
            let search = current.clone().with_charge_range(
                (current.min_abs_charge - 1).max(1),
                (current.max_abs_charge + 1).min(ctx.max_abs_charge.max(current.max_abs_charge)),
            );
            let recruitment = search.recruit_all_peaks(ctx, mass);
            let (next, next_offset) = current.update_scores(recruitment, ctx);
            if next.is_empty() {
                return None;
            }
            current = next;
            offset = next_offset;
            if offset == 0 || single_pass {
                return Some(current);
            }
        }
        trace!(
            "{:.3} did not converge after {MAX_REFINEMENT_ITERATIONS} rounds",
            current.monoisotopic_mass
        );
        None
    }

    /// Order by monoisotopic mass, then by charge range and signal-to-noise ratio
    pub fn mass_cmp(&self, other: &Self) -> Ordering {
        self.monoisotopic_mass
            .total_cmp(&other.monoisotopic_mass)
            .then(self.min_abs_charge.cmp(&other.min_abs_charge))
            .then(self.max_abs_charge.cmp(&other.max_abs_charge))
            .then(other.snr.total_cmp(&self.snr))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::isotopic_model::{IsotopicModels, PROTON};

    fn table() -> PrecalculatedAveragine {
        PrecalculatedAveragine::for_max_mass(12000.0, IsotopicModels::Peptide)
    }

    fn envelope(
        averagine: &PrecalculatedAveragine,
        mass: f64,
        charges: std::ops::RangeInclusive<i32>,
    ) -> Vec<LogMzPeak> {
        let iso = averagine.isotope_da_distance();
        let dist = averagine.get(mass);
        let mut peaks = Vec::new();
        for z in charges {
            for (i, a) in dist.as_slice().iter().enumerate() {
                if *a < 0.01 {
                    continue;
                }
                let mz = (mass + i as f64 * iso) / z as f64 + PROTON;
                peaks.push(LogMzPeak::new(mz, (*a * 1e5) as f32, true, 0));
            }
        }
        peaks.sort_by(|a, b| a.mz.total_cmp(&b.mz));
        for (i, p) in peaks.iter_mut().enumerate() {
            p.index = i as u32;
        }
        peaks
    }

    fn context<'a>(
        peaks: &'a [LogMzPeak],
        averagine: &'a PrecalculatedAveragine,
    ) -> ScoringContext<'a> {
        ScoringContext {
            peaks,
            averagine,
            relative_tolerance: 10e-6,
            min_isotope_cosine: 0.8,
            isotope_da_distance: averagine.isotope_da_distance(),
            offset_search: IsotopeOffsetSearch::Best,
            qscorer: LogisticQScorer::default(),
            max_abs_charge: 20,
        }
    }

    #[test]
    fn test_from_peaks() {
        let p = LogMzPeak::new(1001.0 + PROTON, 10.0, true, 0).assigned(1, 0);
        let q = LogMzPeak::new(1002.002371 + PROTON, 30.0, true, 1).assigned(1, 1);
        let group = PeakGroup::from_peaks(vec![q, p], 1, 1, true, 1.002371);
        assert!((group.monoisotopic_mass() - 1001.0).abs() < 1e-6);
        assert_eq!(group.per_isotope_intensities(), &[10.0, 30.0]);
        assert_eq!(group.intensity(), 40.0);
        assert_eq!(group.peaks()[0].index, 0);

        let r = LogMzPeak::new(1000.0 - 0.002371 + PROTON, 5.0, true, 2).assigned(1, -1);
        let group = PeakGroup::from_peaks(vec![q, p, r], 1, 1, true, 1.002371);
        assert_eq!(group.isotope_index_origin, -1);
        assert_eq!(group.per_isotope_intensities(), &[10.0, 30.0]);
        assert_eq!(group.per_isotope_intensities.len(), 3);
    }

    #[test]
    fn test_recruit_and_refine() {
        let averagine = table();
        let mass = 10000.0;
        let peaks = envelope(&averagine, mass, 8..=12);
        let ctx = context(&peaks, &averagine);

        let seed = PeakGroup::with_mass(mass, 8, 12, true);
        let recruitment = seed.recruit_all_peaks(&ctx, mass);
        assert_eq!(recruitment.signal.len(), peaks.len());
        assert!(recruitment.noise_power.iter().all(|v| *v == 0.0));

        let (scored, offset) = seed.update_scores(recruitment, &ctx);
        assert_eq!(offset, 0);
        assert!((scored.monoisotopic_mass() - mass).abs() < 1e-3);
        assert!(scored.isotope_cosine() > 0.99);
        assert!(scored.qscore() > 0.5);
        assert!(scored.snr() > 10.0);
        for z in 8..=12 {
            assert!(scored.charge_snr(z) > 1.0);
        }
        assert_eq!(scored.charge_snr(13), 0.0);

        // Starting one isotope too high still converges on the right mass
        let shifted = PeakGroup::with_mass(mass + averagine.isotope_da_distance(), 8, 12, true);
        let recruitment = shifted.recruit_all_peaks(&ctx, shifted.monoisotopic_mass());
        let (seeded, _) = shifted.update_scores(recruitment, &ctx);
        let refined = seeded.refine(&ctx).unwrap();
        assert!(
            (refined.monoisotopic_mass() - mass).abs() < 1e-3,
            "{}",
            refined.monoisotopic_mass()
        );
    }

    #[test]
    fn test_isotope_decoy_refinement() {
        let averagine = table();
        let iso = averagine.isotope_da_distance();
        let mass = 10000.0;
        let peaks = envelope(&averagine, mass, 8..=12);
        let ctx = context(&peaks, &averagine);

        let seed = PeakGroup::with_mass(mass, 8, 12, true);
        let (target, _) = seed.update_scores(seed.recruit_all_peaks(&ctx, mass), &ctx);

        let decoy_ctx = ScoringContext {
            offset_search: IsotopeOffsetSearch::SecondBest { excluded_radius: 1 },
            ..ctx
        };
        let decoy = target.refine(&decoy_ctx).unwrap();
        let shift = (decoy.monoisotopic_mass() - mass) / iso;
        assert!(shift.round().abs() >= 2.0, "{shift}");
        assert!((shift - shift.round()).abs() < 1e-3, "{shift}");
        assert!(
            decoy.isotope_cosine() < target.isotope_cosine() - 0.0026,
            "{} {}",
            decoy.isotope_cosine(),
            target.isotope_cosine()
        );
        assert!(decoy.isotope_cosine() >= 0.5);
        assert!(!decoy.is_empty());
    }

    #[test]
    fn test_harmonic_hypothesis_scores_lower() {
        let averagine = table();
        let mass = 10000.0;
        let peaks = envelope(&averagine, mass, 10..=10);
        let ctx = context(&peaks, &averagine);

        let real = PeakGroup::with_mass(mass, 10, 10, true);
        let (real, _) = real.update_scores(real.recruit_all_peaks(&ctx, mass), &ctx);

        let half = PeakGroup::with_mass(mass / 2.0, 5, 5, true);
        let (half, _) = half.update_scores(half.recruit_all_peaks(&ctx, mass / 2.0), &ctx);
        assert!(half.snr() < real.snr(), "{} {}", half.snr(), real.snr());
    }
}
