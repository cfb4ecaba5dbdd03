//! The result of deconvolving one spectrum
use std::ops::Index;
use std::slice;
use std::sync::Arc;

use crate::peak_group::PeakGroup;
use crate::peaks::{charge_mass, PrecursorIon, RawSpectrum};
use crate::scorer::ScoreType;

/// The neutral masses inferred from one spectrum, ordered by monoisotopic mass.
#[derive(Debug, Clone)]
pub struct DeconvolvedSpectrum {
    pub peak_groups: Vec<PeakGroup>,
    /// The spectrum these masses were inferred from
    pub original: Arc<RawSpectrum>,
    /// The precursor's peak group, for MSn spectra whose precursor was deconvolved or given
    pub precursor_peak_group: Option<PeakGroup>,
    pub scan_number: u32,
}

impl DeconvolvedSpectrum {
    pub fn new(original: Arc<RawSpectrum>, scan_number: u32) -> Self {
        Self {
            peak_groups: Vec::new(),
            original,
            precursor_peak_group: None,
            scan_number,
        }
    }

    pub fn ms_level(&self) -> u8 {
        self.original.ms_level
    }

    pub fn precursor(&self) -> Option<&PrecursorIon> {
        self.original.precursor.as_ref()
    }

    /// The precursor's signed charge, preferring the deconvolved precursor peak group
    pub fn precursor_charge(&self) -> Option<i32> {
        if let (Some(group), Some(precursor)) =
            (self.precursor_peak_group.as_ref(), self.precursor())
        {
            let uncharged_mz = precursor.mz - charge_mass(group.is_positive());
            if uncharged_mz > 0.0 {
                let z = (group.monoisotopic_mass() / uncharged_mz).round() as i32;
                return Some(if group.is_positive() { z } else { -z });
            }
        }
        self.precursor().and_then(|p| p.charge)
    }

    pub fn len(&self) -> usize {
        self.peak_groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peak_groups.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, PeakGroup> {
        self.peak_groups.iter()
    }

    pub fn get(&self, index: usize) -> Option<&PeakGroup> {
        self.peak_groups.get(index)
    }

    /// Sort the peak groups by monoisotopic mass
    pub fn sort(&mut self) {
        self.peak_groups.sort_by(|a, b| a.mass_cmp(b));
    }

    /// Drop every peak group whose q-value exceeds `max_qvalue`
    pub fn retain_qvalue(&mut self, max_qvalue: ScoreType) {
        self.peak_groups.retain(|pg| pg.qvalue() <= max_qvalue);
    }

    /// The monoisotopic masses of every peak group, in order
    pub fn monoisotopic_masses(&self) -> Vec<f64> {
        self.peak_groups
            .iter()
            .map(|pg| pg.monoisotopic_mass())
            .collect()
    }
}

impl Index<usize> for DeconvolvedSpectrum {
    type Output = PeakGroup;

    fn index(&self, index: usize) -> &Self::Output {
        &self.peak_groups[index]
    }
}

impl<'a> IntoIterator for &'a DeconvolvedSpectrum {
    type Item = &'a PeakGroup;
    type IntoIter = slice::Iter<'a, PeakGroup>;

    fn into_iter(self) -> Self::IntoIter {
        self.peak_groups.iter()
    }
}

#[cfg(test)]
mod test {
    use mzpeaks::CentroidPeak;

    use super::*;
    use crate::isotopic_model::PROTON;
    use crate::peaks::ActivationMethod;

    #[test]
    fn test_sort_and_retain() {
        let raw = RawSpectrum::new(&[CentroidPeak::new(500.0, 10.0, 0)], 1);
        let mut spectrum = DeconvolvedSpectrum::new(Arc::new(raw), 7);
        assert!(spectrum.is_empty());

        for (mass, qvalue) in [(3000.0, 0.5), (1000.0, 0.01), (2000.0, 0.05)] {
            let mut pg = PeakGroup::with_mass(mass, 1, 3, true);
            pg.qvalue = qvalue;
            spectrum.peak_groups.push(pg);
        }
        spectrum.sort();
        assert_eq!(spectrum.monoisotopic_masses(), vec![1000.0, 2000.0, 3000.0]);
        assert_eq!(spectrum[1].monoisotopic_mass(), 2000.0);

        spectrum.retain_qvalue(0.1);
        assert_eq!(spectrum.len(), 2);
        assert_eq!(spectrum.iter().count(), 2);
        assert_eq!(spectrum.scan_number, 7);
        assert_eq!(spectrum.ms_level(), 1);
    }

    #[test]
    fn test_precursor_charge() {
        let raw = RawSpectrum::new(&[CentroidPeak::new(500.0, 10.0, 0)], 2).with_precursor(
            PrecursorIon::new(1001.0, Some(3), vec![ActivationMethod::CID]),
        );
        let mut spectrum = DeconvolvedSpectrum::new(Arc::new(raw), 2);
        assert_eq!(spectrum.precursor_charge(), Some(3));
        spectrum.precursor_peak_group = Some(PeakGroup::with_mass(10000.0, 10, 10, true));
        assert_eq!(spectrum.precursor_charge(), Some(10));
    }

    #[test]
    fn test_precursor_charge_at_low_mz() {
        // A 2 kDa precursor at charge 40 sits at m/z ~51, where the proton is 2% of the m/z
        let mz = 2000.0 / 40.0 + PROTON;
        let raw = RawSpectrum::new(&[CentroidPeak::new(50.0, 10.0, 0)], 2)
            .with_precursor(PrecursorIon::new(mz, None, vec![ActivationMethod::ETD]));
        let mut spectrum = DeconvolvedSpectrum::new(Arc::new(raw), 3);
        spectrum.precursor_peak_group = Some(PeakGroup::with_mass(2000.0, 40, 40, true));
        assert_eq!(spectrum.precursor_charge(), Some(40));

        let mz = 2000.0 / 40.0 - PROTON;
        let raw = RawSpectrum::new(&[CentroidPeak::new(50.0, 10.0, 0)], 2)
            .with_precursor(PrecursorIon::new(mz, None, vec![ActivationMethod::ETD]));
        let mut spectrum = DeconvolvedSpectrum::new(Arc::new(raw), 3);
        spectrum.precursor_peak_group = Some(PeakGroup::with_mass(2000.0, 40, 40, false));
        assert_eq!(spectrum.precursor_charge(), Some(-40));
    }
}
