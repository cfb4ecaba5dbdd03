//! Isotopic pattern and peak group evaluation tools
use num_traits::Float;

use crate::averagine::{IsotopeDistribution, PrecalculatedAveragine};

pub type ScoreType = f32;

/// The fewest consecutive observed isotopes around the most intense isotope that a
/// pattern must have before it is compared to a theoretical distribution.
pub const MIN_ISOTOPE_RUN: usize = 2;

/// How far from the best offset a second best offset is looked for
pub const SECOND_BEST_OFFSET_RADIUS: i64 = 3;

/// Which alignment between an observed and theoretical isotopic pattern to report
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IsotopeOffsetSearch {
    /// The best scoring offset, ties broken towards zero
    #[default]
    Best,
    /// The best scoring offset within [`SECOND_BEST_OFFSET_RADIUS`] of the best offset,
    /// further than `excluded_radius` from it and scoring strictly lower. Used to build
    /// isotope decoys.
    SecondBest { excluded_radius: i32 },
}

/// The cosine similarity between an observed per-isotope intensity vector and a theoretical
/// distribution shifted right by `offset` isotopes.
///
/// ```math
/// \cos(a, b, o) = \frac{\sum_j a_j b_{j - o}}{\|a\| \|b\|}
/// ```
///
/// Observed isotope `j` is paired with theoretical isotope `j - offset`. Because the
/// theoretical vector already has unit norm and both vectors are non-negative, the result
/// lies in `[0, 1]`. When `min_isotope_run` is non-zero, the observed pattern must have that
/// many consecutive non-zero isotopes around its most intense isotope or it scores zero.
pub fn cosine<T: Float>(
    observed: &[T],
    theoretical: &IsotopeDistribution,
    offset: i64,
    min_isotope_run: usize,
) -> ScoreType {
    let observed: Vec<f64> = observed
        .iter()
        .map(|v| v.to_f64().unwrap_or_default().max(0.0))
        .collect();

    let Some((apex, _)) = observed
        .iter()
        .enumerate()
        .max_by(|(i, a), (j, b)| a.total_cmp(b).then(j.cmp(i)))
    else {
        return 0.0;
    };

    if min_isotope_run > 0 {
        let left = observed[..apex]
            .iter()
            .rev()
            .take_while(|v| **v > 0.0)
            .count();
        let right = observed[apex + 1..]
            .iter()
            .take_while(|v| **v > 0.0)
            .count();
        if left + right + 1 < min_isotope_run {
            return 0.0;
        }
    }

    let mut numerator = 0.0;
    let mut observed_norm = 0.0;
    for (j, a) in observed.iter().enumerate() {
        observed_norm += a * a;
        numerator += a * theoretical.get(j as i64 - offset);
    }
    if observed_norm <= 0.0 {
        return 0.0;
    }
    let score = numerator / observed_norm.sqrt();
    if score.is_finite() {
        score.clamp(0.0, 1.0) as ScoreType
    } else {
        0.0
    }
}

/// Offsets in the order they are tried: 0, -1, 1, -2, 2, ...
fn offsets_by_magnitude(left: i64, right: i64) -> impl Iterator<Item = i64> {
    let radius = left.max(right);
    std::iter::once(0).chain((1..=radius).flat_map(move |k| {
        [-k, k]
            .into_iter()
            .filter(move |o| (*o < 0 && -*o <= left) || (*o > 0 && *o <= right))
    }))
}

/// The cosine between `per_isotope_intensities` and the averagine distribution for
/// `mono_mass` with the monoisotopic mass moved up by `offset` isotopes.
///
/// `per_isotope_intensities[0]` holds isotope `index_origin` relative to `mono_mass`.
pub fn isotope_cosine_at(
    mono_mass: f64,
    per_isotope_intensities: &[f32],
    index_origin: i32,
    averagine: &PrecalculatedAveragine,
    offset: i32,
) -> ScoreType {
    let theoretical = averagine.get(mono_mass);
    if theoretical.is_empty() || per_isotope_intensities.is_empty() {
        return 0.0;
    }
    cosine(
        per_isotope_intensities,
        theoretical,
        offset as i64 - index_origin as i64,
        MIN_ISOTOPE_RUN,
    )
}

/// Find the isotope offset that best aligns `per_isotope_intensities` with the averagine
/// distribution for `mono_mass`, returning its cosine and the offset.
///
/// `per_isotope_intensities[0]` holds isotope `index_origin` relative to `mono_mass`, which
/// is zero or negative when peaks below the monoisotopic hypothesis were observed.
///
/// Offsets from `-(apex / 4 + 1)` to `apex / 4 + 1` are searched, where `apex` is the
/// averagine apex index for this mass. A positive offset means the monoisotopic mass
/// should move up by that many isotopes. With [`IsotopeOffsetSearch::SecondBest`] the
/// runner-up alignment is reported instead, or a zero cosine if there is none.
pub fn isotope_cosine_and_offset(
    mono_mass: f64,
    per_isotope_intensities: &[f32],
    index_origin: i32,
    averagine: &PrecalculatedAveragine,
    search: IsotopeOffsetSearch,
) -> (ScoreType, i32) {
    let theoretical = averagine.get(mono_mass);
    if theoretical.is_empty() || per_isotope_intensities.is_empty() {
        return (0.0, 0);
    }
    let radius = (averagine.apex_index(mono_mass) / 4 + 1) as i64;
    let score_at = |offset: i64| {
        cosine(
            per_isotope_intensities,
            theoretical,
            offset - index_origin as i64,
            MIN_ISOTOPE_RUN,
        )
    };

    let mut best_score: ScoreType = 0.0;
    let mut best_offset = 0i64;
    for (i, offset) in offsets_by_magnitude(radius, radius).enumerate() {
        let score = score_at(offset);
        if i == 0 || score > best_score {
            best_score = score;
            best_offset = offset;
        }
    }

    let IsotopeOffsetSearch::SecondBest { excluded_radius } = search else {
        return (best_score, best_offset as i32);
    };
    let mut second: Option<(ScoreType, i64)> = None;
    for delta in offsets_by_magnitude(SECOND_BEST_OFFSET_RADIUS, SECOND_BEST_OFFSET_RADIUS) {
        let offset = best_offset + delta;
        if delta.abs() <= excluded_radius as i64 || offset.abs() > radius {
            continue;
        }
        let score = score_at(offset);
        if score < best_score && second.map_or(true, |(s, _)| score > s) {
            second = Some((score, offset));
        }
    }
    second.map_or((0.0, 0), |(score, offset)| (score, offset as i32))
}

/// The signal and noise power attributed to one charge state of a peak group.
///
/// Signal is the part of the charge's isotope power explained by the averagine shape,
/// noise is the unexplained remainder plus the power of unmatched peaks inside the charge's
/// isotope window.
///
/// ```math
/// \begin{split}
///     S_z &= \cos^2_z \sum_i a_{z,i}^2 + 1 \\
///     N_z &= (1 - \cos^2_z) \sum_i a_{z,i}^2 + \sum_k n_{z,k}^2 + 1
/// \end{split}
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SignalNoise {
    pub signal: f64,
    pub noise: f64,
}

impl SignalNoise {
    pub fn new(cosine: ScoreType, isotope_power: f64, noise_power: f64) -> Self {
        let cos2 = (cosine as f64).powi(2);
        Self {
            signal: cos2 * isotope_power + 1.0,
            noise: (1.0 - cos2) * isotope_power + noise_power + 1.0,
        }
    }

    pub fn snr(&self) -> ScoreType {
        (self.signal / self.noise) as ScoreType
    }
}

impl std::ops::Add for SignalNoise {
    type Output = SignalNoise;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            signal: self.signal + rhs.signal,
            noise: self.noise + rhs.noise,
        }
    }
}

/// The features the Qscore is computed from
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct QScoreFeatures {
    pub isotope_cosine: ScoreType,
    pub representative_charge_snr: ScoreType,
    pub snr: ScoreType,
    /// The fraction of the charge range with observed signal
    pub charge_coverage: ScoreType,
}

/// A logistic model combining isotope shape agreement, signal-to-noise and charge
/// consistency into a probability-like confidence for a peak group.
///
/// ```math
/// Q = \frac{1}{1 + \exp(-(w_0 + w_c \cos + w_z \log_{10}(1 + \text{SNR}_z) + w_s \log_{10}(1 + \text{SNR}) + w_r r))}
/// ```
///
/// The default weights are tuned constants rather than derived values and may be recalibrated.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LogisticQScorer {
    pub intercept: f64,
    pub isotope_cosine_weight: f64,
    pub charge_snr_weight: f64,
    pub snr_weight: f64,
    pub charge_coverage_weight: f64,
}

impl Default for LogisticQScorer {
    fn default() -> Self {
        Self {
            intercept: -13.5,
            isotope_cosine_weight: 14.0,
            charge_snr_weight: 1.5,
            snr_weight: 0.5,
            charge_coverage_weight: 1.0,
        }
    }
}

impl LogisticQScorer {
    pub fn score(&self, features: &QScoreFeatures) -> ScoreType {
        let x = self.intercept
            + self.isotope_cosine_weight * features.isotope_cosine as f64
            + self.charge_snr_weight * (1.0 + features.representative_charge_snr as f64).log10()
            + self.snr_weight * (1.0 + features.snr as f64).log10()
            + self.charge_coverage_weight * features.charge_coverage as f64;
        (1.0 / (1.0 + (-x).exp())) as ScoreType
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::isotopic_model::IsotopicModels;

    fn table() -> PrecalculatedAveragine {
        PrecalculatedAveragine::for_max_mass(12000.0, IsotopicModels::Peptide)
    }

    #[test]
    fn test_cosine_exact() {
        let averagine = table();
        let dist = averagine.get(10000.0);
        let observed: Vec<f32> = dist.as_slice().iter().map(|v| (*v * 1e5) as f32).collect();
        let score = cosine(&observed, dist, 0, MIN_ISOTOPE_RUN);
        assert!(score > 0.99, "{score}");
        assert!(score <= 1.0);

        let shifted = cosine(&observed, dist, 2, MIN_ISOTOPE_RUN);
        assert!(shifted < score);
    }

    #[test]
    fn test_cosine_bounds() {
        let averagine = table();
        let dist = averagine.get(5000.0);
        let cases: Vec<Vec<f32>> = vec![
            vec![],
            vec![0.0, 0.0],
            vec![1.0],
            vec![5.0, 0.0, 5.0],
            vec![1.0, 1e9, 1.0, 1e-3, 7.0],
            vec![3.0; 40],
        ];
        for case in cases {
            for offset in -3..=3 {
                let score = cosine(&case, dist, offset, MIN_ISOTOPE_RUN);
                assert!((0.0..=1.0).contains(&score), "{case:?} {offset} {score}");
                let score = cosine(&case, dist, offset, 0);
                assert!((0.0..=1.0).contains(&score), "{case:?} {offset} {score}");
            }
        }
        // An isolated apex fails the run requirement
        assert_eq!(cosine(&[5.0f32, 0.0, 5.0], dist, 0, MIN_ISOTOPE_RUN), 0.0);
    }

    #[test]
    fn test_offset_search() {
        let averagine = table();
        let dist = averagine.get(10000.0);
        // Observed pattern indexed two isotopes below the true monoisotopic peak
        let mut observed = vec![0.0f32, 0.0];
        observed.extend(dist.as_slice().iter().map(|v| (*v * 1e5) as f32));

        let (score, offset) =
            isotope_cosine_and_offset(10000.0, &observed, 0, &averagine, IsotopeOffsetSearch::Best);
        assert_eq!(offset, 2);
        assert!(score > 0.99);

        // The runner-up sits two isotopes away from the best alignment, outside the
        // excluded radius, and is still a plausible envelope
        let (decoy_score, decoy_offset) = isotope_cosine_and_offset(
            10000.0,
            &observed,
            0,
            &averagine,
            IsotopeOffsetSearch::SecondBest { excluded_radius: 1 },
        );
        assert_eq!(decoy_offset, 0);
        assert!(decoy_score < score);
        assert!(decoy_score > 0.5, "{decoy_score}");
        let rescored = isotope_cosine_at(10000.0, &observed, 0, &averagine, decoy_offset);
        assert_eq!(rescored, decoy_score);

        // Nothing is left when every offset in reach is excluded
        let (none_score, none_offset) = isotope_cosine_and_offset(
            10000.0,
            &observed,
            0,
            &averagine,
            IsotopeOffsetSearch::SecondBest { excluded_radius: 3 },
        );
        assert_eq!((none_score, none_offset), (0.0, 0));

        // The same pattern indexed from isotope -2 is already aligned
        let (score, offset) = isotope_cosine_and_offset(
            10000.0,
            &observed,
            -2,
            &averagine,
            IsotopeOffsetSearch::Best,
        );
        assert_eq!(offset, 0);
        assert!(score > 0.99);
    }

    #[test]
    fn test_offset_order() {
        let offsets: Vec<_> = offsets_by_magnitude(2, 2).collect();
        assert_eq!(offsets, vec![0, -1, 1, -2, 2]);
    }

    #[test]
    fn test_qscore() {
        let scorer = LogisticQScorer::default();
        let good = scorer.score(&QScoreFeatures {
            isotope_cosine: 0.99,
            representative_charge_snr: 10.0,
            snr: 10.0,
            charge_coverage: 1.0,
        });
        let poor = scorer.score(&QScoreFeatures {
            isotope_cosine: 0.8,
            representative_charge_snr: 1.0,
            snr: 1.0,
            charge_coverage: 0.5,
        });
        assert!(good > 0.9, "{good}");
        assert!(poor < good);
        assert!(poor > 0.0 && good < 1.0);
    }

    #[test]
    fn test_signal_noise() {
        let clean = SignalNoise::new(1.0, 100.0, 0.0);
        let noisy = SignalNoise::new(0.9, 100.0, 50.0);
        assert!(clean.snr() > noisy.snr());
        let total = clean + noisy;
        assert!((total.signal - clean.signal - noisy.signal).abs() < 1e-9);
    }
}
