/*! Average monomer models for generating theoretical isotopic distributions */
use std::collections::hash_map::{self, HashMap};
use std::hash;

#[doc(hidden)]
pub use chemical_elements::isotopic_pattern::{
    BafflingRecursiveIsotopicPatternGenerator, TheoreticalIsotopicPattern,
};

use chemical_elements::{ChemicalComposition, ElementSpecification, PROTON as _PROTON};
use serde::{Deserialize, Serialize};

/// The mass of H+, a hydrogen atom minus an electron
pub const PROTON: f64 = _PROTON;

/// The mean mass difference between adjacent isotopes of a ~55 kDa protein. This is the
/// isotope spacing the deconvolution search assumes for every mass.
pub const ISOTOPE_MASS_DIFF_55K: f64 = 1.002371;

/// A fractional elemental composition with non-ordinal element counts used to represent
/// "averaged" chemical compositions.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FractionalComposition<'a>(HashMap<ElementSpecification<'a>, f64>);

impl<'a> FromIterator<(ElementSpecification<'a>, f64)> for FractionalComposition<'a> {
    fn from_iter<T: IntoIterator<Item = (ElementSpecification<'a>, f64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FractionalComposition<'a> {
    #[inline]
    pub fn get<Q>(&self, k: &Q) -> Option<&f64>
    where
        ElementSpecification<'a>: std::borrow::Borrow<Q>,
        Q: hash::Hash + Eq + ?Sized,
    {
        self.0.get(k)
    }

    /// The monoisotopic element keyed by `symbol`, if the composition contains it
    pub fn element(&self, symbol: &str) -> Option<ElementSpecification<'a>> {
        self.0.get_key_value(symbol).map(|(k, _)| *k)
    }

    #[inline]
    pub fn iter(&self) -> hash_map::Iter<'_, ElementSpecification<'a>, f64> {
        self.0.iter()
    }

    /// The mass of one average monomer
    #[inline]
    pub fn mass(&self) -> f64 {
        self.iter()
            .map(|(e, c)| e.element.most_abundant_mass * *c)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A single theoretical isotope of a neutral averagine molecule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TheoreticalIsotope {
    /// The neutral mass of this isotope
    pub mass: f64,
    /// The relative abundance of this isotope, summing to 1 over the whole distribution
    pub abundance: f64,
}

/// A model for converting a neutral mass into a theoretical isotopic distribution
/// based upon an "average monomer" and linear extension.
///
/// This is an implementation of Senko's Averagine [^1]
///
/// # References
/// [^1]: Senko M, Beu S, McLafferty F: Determination of Monoisotopic Masses and Ion
///       Populations for Large Biomolecules from Resolved Isotopic Distributions.
///       Journal of the American Society for Mass Spectrometry 1995, 6:229-233
///       <https://doi.org/10.1016/1044-0305(95)00017-8>
#[derive(Debug, Clone)]
pub struct IsotopicModel<'lifespan> {
    /// The "average" monomer composition
    pub base_composition: FractionalComposition<'lifespan>,
    /// The mass of the average monomer to interpolate with
    pub base_mass: f64,
    /// Absorbs the rounding error when scaling, absent if the monomer has no hydrogen
    hydrogen: Option<ElementSpecification<'lifespan>>,
    generator: BafflingRecursiveIsotopicPatternGenerator<'lifespan>,
}

impl PartialEq for IsotopicModel<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.base_composition == other.base_composition
    }
}

/// Guess how many isotopes are needed to cover the distribution of a molecule of `mass`.
///
/// The mean heavy-isotope count grows linearly with mass and its spread with the square root
/// of mass, so this keeps several standard deviations past the mean.
fn estimate_isotope_count(mass: f64) -> i32 {
    let mean = (mass * 6e-4).max(0.0);
    (mean + 8.0 * mean.sqrt() + 10.0).ceil() as i32
}

impl<'lifespan: 'transient, 'transient> IsotopicModel<'lifespan> {
    /// Create a new [`IsotopicModel`] from a fractional composition
    pub fn new<C: Into<FractionalComposition<'lifespan>>>(base_composition: C) -> Self {
        let base_composition = base_composition.into();
        Self {
            base_mass: base_composition.mass(),
            hydrogen: base_composition.element("H"),
            base_composition,
            generator: BafflingRecursiveIsotopicPatternGenerator::new(),
        }
    }

    /// Scale the average monomer to an integral composition whose mass is close to `neutral_mass`,
    /// absorbing the rounding error with hydrogens.
    pub fn scale(&self, neutral_mass: f64) -> ChemicalComposition<'transient> {
        let scale = neutral_mass / self.base_mass;

        let mut scaled = ChemicalComposition::new();
        for (elt, count) in self.base_composition.iter() {
            scaled.set(*elt, (*count * scale).round() as i32);
        }
        let Some(hydrogen) = self.hydrogen else {
            return scaled;
        };
        let delta = (scaled.mass() - neutral_mass).round() as i32;
        if scaled[&hydrogen] > delta {
            scaled[&hydrogen] -= delta;
        } else {
            scaled[&hydrogen] = 0;
        }
        scaled
    }

    /// Generate the neutral isotopic distribution for `neutral_mass`, starting from the
    /// monoisotopic peak.
    pub fn isotopic_distribution(&mut self, neutral_mass: f64) -> Vec<TheoreticalIsotope> {
        if neutral_mass <= 0.0 {
            return Vec::new();
        }
        let composition = self.scale(neutral_mass);
        let peaks = self.generator.isotopic_variants(
            composition,
            estimate_isotope_count(neutral_mass),
            1,
            PROTON,
        );
        let pattern = TheoreticalIsotopicPattern::from(peaks);
        let total: f64 = pattern.peaks.iter().map(|p| p.intensity.max(0.0)).sum();
        if total <= 0.0 {
            return Vec::new();
        }
        pattern
            .peaks
            .iter()
            .map(|p| TheoreticalIsotope {
                mass: p.mz - PROTON,
                abundance: p.intensity.max(0.0) / total,
            })
            .collect()
    }
}

/// A set of named average monomer isotopic models for biomolecules.
/// Variants convert to [`IsotopicModel`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsotopicModels {
    #[default]
    Peptide,
    NucleicAcid,
}

impl IsotopicModels {
    /// Elemental counts of one average monomer
    pub const fn monomer(&self) -> &'static [(&'static str, f64)] {
        match self {
            Self::Peptide => &[
                ("C", 4.9384),
                ("H", 7.7583),
                ("N", 1.3577),
                ("O", 1.4773),
                ("S", 0.0417),
            ],
            Self::NucleicAcid => &[
                ("C", 9.5),
                ("H", 11.75),
                ("N", 3.75),
                ("O", 7.0),
                ("P", 1.0),
            ],
        }
    }
}

impl From<IsotopicModels> for IsotopicModel<'_> {
    fn from(source: IsotopicModels) -> IsotopicModel<'static> {
        let composition: FractionalComposition<'static> = source
            .monomer()
            .iter()
            .filter_map(|(symbol, count)| {
                symbol
                    .parse::<ElementSpecification>()
                    .ok()
                    .map(|e| (e, *count))
            })
            .collect();
        IsotopicModel::new(composition)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fc() {
        let model: IsotopicModel = IsotopicModels::Peptide.into();
        assert_eq!(model.base_composition.get("C").copied(), Some(4.9384));
        assert_eq!(model.base_composition.len(), 5);
        assert!((model.base_mass - 111.05).abs() < 0.5);

        assert!(model.base_composition.element("H").is_some());
        assert!(model.base_composition.element("Fe").is_none());

        let model: IsotopicModel = IsotopicModels::NucleicAcid.into();
        assert_eq!(model.base_composition.get("P").copied(), Some(1.0));
        assert!(model.base_mass > 300.0);
    }

    #[test]
    fn test_scale() {
        let model: IsotopicModel = IsotopicModels::Peptide.into();
        let comp = model.scale(10000.0);
        assert!((comp.mass() - 10000.0).abs() < 1.0, "{}", comp.mass());

        // Without hydrogen the rounding error stays in the scaled composition
        let carbon: FractionalComposition =
            [(ElementSpecification::parse("C").unwrap(), 1.0)].into_iter().collect();
        let model = IsotopicModel::new(carbon);
        let comp = model.scale(1200.0);
        assert!((comp.mass() - 1200.0).abs() < 12.0, "{}", comp.mass());
    }

    #[test]
    fn test_distribution() {
        let mut model: IsotopicModel = IsotopicModels::Peptide.into();
        let dist = model.isotopic_distribution(1000.0);
        let total: f64 = dist.iter().map(|p| p.abundance).sum();
        assert!((total - 1.0).abs() < 1e-6);
        // A 1 kDa peptide's monoisotopic peak is its most abundant
        let apex = dist
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.abundance.total_cmp(&b.1.abundance))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(apex, 0);
        assert!((dist[1].mass - dist[0].mass - 1.0).abs() < 0.01);

        let dist = model.isotopic_distribution(10000.0);
        let apex = dist
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.abundance.total_cmp(&b.1.abundance))
            .map(|(i, _)| i)
            .unwrap();
        assert!((4..=7).contains(&apex), "{apex}");

        assert!(model.isotopic_distribution(0.0).is_empty());
    }
}
