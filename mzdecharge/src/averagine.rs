//! A mass-indexed table of precomputed averagine isotopic distributions, shared read-only
//! by every stage of a deconvolution run.

use rayon::prelude::*;
use tracing::debug;

use crate::isotopic_model::{
    IsotopicModel, IsotopicModels, TheoreticalIsotope, ISOTOPE_MASS_DIFF_55K,
};

/// The smallest mass bucket in a [`PrecalculatedAveragine`]
pub const AVERAGINE_MIN_MASS: f64 = 50.0;
/// The width of each mass bucket in a [`PrecalculatedAveragine`]
pub const AVERAGINE_MASS_STEP: f64 = 25.0;
/// Isotopes past the apex less abundant than this fraction of the apex are dropped
pub const TRIM_RELATIVE_ABUNDANCE: f64 = 1e-4;
/// Isotopes at least this fraction of the apex abundance count towards the left and right
/// isotope spans of a distribution
pub const SPAN_RELATIVE_ABUNDANCE: f64 = 1e-2;

/// A theoretical isotopic distribution with unit L2 norm, indexed from the monoisotopic peak,
/// along with its geometry around the most abundant isotope.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IsotopeDistribution {
    abundances: Vec<f64>,
    apex_index: usize,
    left_count: usize,
    right_count: usize,
    most_abundant_mass_delta: f64,
    average_mass_delta: f64,
}

impl IsotopeDistribution {
    pub fn from_isotopes(isotopes: &[TheoreticalIsotope]) -> Self {
        let Some((apex_index, apex)) = isotopes
            .iter()
            .enumerate()
            .max_by(|(i, a), (j, b)| a.abundance.total_cmp(&b.abundance).then(j.cmp(i)))
        else {
            return Self::default();
        };
        let apex_abundance = apex.abundance;

        let last = isotopes
            .iter()
            .rposition(|p| p.abundance >= apex_abundance * TRIM_RELATIVE_ABUNDANCE)
            .unwrap_or(apex_index);
        let kept = &isotopes[..=last];

        let span_threshold = apex_abundance * SPAN_RELATIVE_ABUNDANCE;
        let first_in_span = kept
            .iter()
            .position(|p| p.abundance >= span_threshold)
            .unwrap_or(apex_index);
        let last_in_span = kept
            .iter()
            .rposition(|p| p.abundance >= span_threshold)
            .unwrap_or(apex_index);

        let mono_mass = kept[0].mass;
        let total: f64 = kept.iter().map(|p| p.abundance).sum();
        let average_mass_delta = if total > 0.0 {
            kept.iter().map(|p| (p.mass - mono_mass) * p.abundance).sum::<f64>() / total
        } else {
            0.0
        };

        let norm = kept.iter().map(|p| p.abundance.powi(2)).sum::<f64>().sqrt();
        let abundances = kept.iter().map(|p| p.abundance / norm).collect();

        Self {
            abundances,
            apex_index,
            left_count: apex_index - first_in_span,
            right_count: last_in_span - apex_index,
            most_abundant_mass_delta: kept[apex_index].mass - mono_mass,
            average_mass_delta,
        }
    }

    pub fn len(&self) -> usize {
        self.abundances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.abundances.is_empty()
    }

    /// The normalized abundance of isotope `index`, zero outside of the distribution
    #[inline]
    pub fn get(&self, index: i64) -> f64 {
        if index < 0 {
            0.0
        } else {
            self.abundances.get(index as usize).copied().unwrap_or_default()
        }
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.abundances
    }

    pub fn apex_index(&self) -> usize {
        self.apex_index
    }

    pub fn left_count_from_apex(&self) -> usize {
        self.left_count
    }

    pub fn right_count_from_apex(&self) -> usize {
        self.right_count
    }

    pub fn most_abundant_mass_delta(&self) -> f64 {
        self.most_abundant_mass_delta
    }

    pub fn average_mass_delta(&self) -> f64 {
        self.average_mass_delta
    }
}

/// Averagine distributions precomputed over fixed-width mass buckets from
/// [`AVERAGINE_MIN_MASS`] up to a maximum mass.
///
/// Queries outside of the covered range clamp to the nearest bucket, except
/// for non-positive masses which have no distribution at all.
#[derive(Debug, Clone)]
pub struct PrecalculatedAveragine {
    min_mass: f64,
    max_mass: f64,
    mass_step: f64,
    model: IsotopicModels,
    entries: Vec<IsotopeDistribution>,
    empty: IsotopeDistribution,
}

impl PrecalculatedAveragine {
    /// Build the table covering `min_mass` through `max_mass` in `mass_step` increments.
    ///
    /// Buckets are generated in parallel, each worker holding its own generator.
    pub fn new(min_mass: f64, max_mass: f64, mass_step: f64, model: IsotopicModels) -> Self {
        let max_mass = max_mass.max(min_mass);
        let n_entries = ((max_mass - min_mass) / mass_step).ceil() as usize + 1;
        let entries: Vec<_> = (0..n_entries)
            .into_par_iter()
            .map_init(
                || -> IsotopicModel<'static> { model.into() },
                |generator, i| {
                    let mass = min_mass + i as f64 * mass_step;
                    IsotopeDistribution::from_isotopes(&generator.isotopic_distribution(mass))
                },
            )
            .collect();
        debug!(
            "Built {} {model:?} averagine entries from {min_mass:.1} to {max_mass:.1} Da",
            entries.len()
        );
        Self {
            min_mass,
            max_mass,
            mass_step,
            model,
            entries,
            empty: IsotopeDistribution::default(),
        }
    }

    /// Build the table with the default bucket geometry up to `max_mass`
    pub fn for_max_mass(max_mass: f64, model: IsotopicModels) -> Self {
        Self::new(AVERAGINE_MIN_MASS, max_mass, AVERAGINE_MASS_STEP, model)
    }

    #[inline]
    fn index_for(&self, mass: f64) -> usize {
        let i = ((mass - self.min_mass) / self.mass_step).round();
        if i <= 0.0 {
            0
        } else {
            (i as usize).min(self.entries.len().saturating_sub(1))
        }
    }

    /// The isotopic distribution for the bucket nearest `mass`
    pub fn get(&self, mass: f64) -> &IsotopeDistribution {
        if mass <= 0.0 || self.entries.is_empty() {
            &self.empty
        } else {
            &self.entries[self.index_for(mass)]
        }
    }

    pub fn apex_index(&self, mass: f64) -> usize {
        self.get(mass).apex_index()
    }

    pub fn left_count_from_apex(&self, mass: f64) -> usize {
        self.get(mass).left_count_from_apex()
    }

    pub fn right_count_from_apex(&self, mass: f64) -> usize {
        self.get(mass).right_count_from_apex()
    }

    /// The mass difference between the most abundant isotope and the monoisotopic peak
    pub fn most_abundant_mass_delta(&self, mass: f64) -> f64 {
        self.get(mass).most_abundant_mass_delta()
    }

    /// The mass difference between the abundance-weighted average mass and the monoisotopic peak
    pub fn average_mass_delta(&self, mass: f64) -> f64 {
        self.get(mass).average_mass_delta()
    }

    /// The isotope spacing assumed for every distribution in this table
    pub fn isotope_da_distance(&self) -> f64 {
        ISOTOPE_MASS_DIFF_55K
    }

    pub fn max_mass(&self) -> f64 {
        self.max_mass
    }

    pub fn min_mass(&self) -> f64 {
        self.min_mass
    }

    pub fn model(&self) -> IsotopicModels {
        self.model
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
