//! Log-m/z peaks, the working representation of spectrum peaks during deconvolution.

use mzpeaks::prelude::*;
use mzpeaks::{CentroidPeak, IndexType, MZPeakSetType};

use crate::isotopic_model::PROTON;

/// The mass added to a neutral molecule per unit charge
#[inline]
pub fn charge_mass(is_positive: bool) -> f64 {
    if is_positive {
        PROTON
    } else {
        -PROTON
    }
}

/// The natural logarithm of the uncharged m/z, `ln(mz - charge_mass)`
#[inline]
pub fn log_mz(mz: f64, is_positive: bool) -> f64 {
    (mz - charge_mass(is_positive)).ln()
}

/// The integral nominal mass nearest to `mass`, corrected for the mass defect of
/// an average biomolecule
#[inline]
pub fn nominal_mass(mass: f64) -> i64 {
    (mass * 0.999497 + 0.5).floor() as i64
}

/// A spectrum peak carrying its log-transformed uncharged m/z, along with the charge
/// and isotope index it is assigned to once it joins a peak group.
///
/// An unassigned peak has an `abs_charge` of zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogMzPeak {
    pub mz: f64,
    pub log_mz: f64,
    pub intensity: f32,
    pub abs_charge: i32,
    pub isotope_index: i32,
    pub is_positive: bool,
    /// The index of the source peak in its spectrum
    pub index: IndexType,
}

impl LogMzPeak {
    pub fn new(mz: f64, intensity: f32, is_positive: bool, index: IndexType) -> Self {
        Self {
            mz,
            log_mz: log_mz(mz, is_positive),
            intensity,
            abs_charge: 0,
            isotope_index: 0,
            is_positive,
            index,
        }
    }

    pub fn from_centroid<C: CentroidLike>(peak: &C, is_positive: bool) -> Self {
        Self::new(peak.mz(), peak.intensity(), is_positive, peak.get_index())
    }

    /// A copy of this peak assigned to `abs_charge` at `isotope_index`
    #[inline]
    pub fn assigned(&self, abs_charge: i32, isotope_index: i32) -> Self {
        Self {
            abs_charge,
            isotope_index,
            ..*self
        }
    }

    /// The neutral mass implied by the assigned charge, or zero if unassigned
    #[inline]
    pub fn uncharged_mass(&self) -> f64 {
        if self.abs_charge == 0 {
            0.0
        } else {
            (self.mz - charge_mass(self.is_positive)) * self.abs_charge as f64
        }
    }
}

/// Convert a centroided peak list into log m/z peaks sorted by m/z.
///
/// Peaks with non-positive intensity or whose m/z appears in `excluded_mzs` (which
/// must be sorted) are dropped.
pub fn log_mz_peaks<C: CentroidLike>(
    peaks: &[C],
    is_positive: bool,
    excluded_mzs: &[f64],
) -> Vec<LogMzPeak> {
    let mut log_peaks: Vec<LogMzPeak> = peaks
        .iter()
        .filter(|p| p.intensity() > 0.0)
        .filter(|p| {
            excluded_mzs.is_empty()
                || excluded_mzs
                    .binary_search_by(|x| x.total_cmp(&p.mz()))
                    .is_err()
        })
        .map(|p| LogMzPeak::from_centroid(p, is_positive))
        .filter(|p| p.log_mz.is_finite())
        .collect();
    log_peaks.sort_by(|a, b| a.mz.total_cmp(&b.mz));
    log_peaks
}

/// How a precursor ion was fragmented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ActivationMethod {
    CID,
    HCD,
    ETD,
    ECD,
    EThcD,
    UVPD,
    Other,
}

/// The precursor ion an MSn spectrum was acquired from
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PrecursorIon {
    pub mz: f64,
    /// The signed charge state, if the instrument reported one
    pub charge: Option<i32>,
    pub activation: Vec<ActivationMethod>,
}

impl PrecursorIon {
    pub fn new(mz: f64, charge: Option<i32>, activation: Vec<ActivationMethod>) -> Self {
        Self {
            mz,
            charge,
            activation,
        }
    }

    /// The first activation method listed
    pub fn activation_method(&self) -> Option<ActivationMethod> {
        self.activation.first().copied()
    }
}

/// A centroided spectrum as handed to the deconvolution engine
#[derive(Debug, Clone)]
pub struct RawSpectrum {
    pub peaks: MZPeakSetType<CentroidPeak>,
    pub ms_level: u8,
    pub precursor: Option<PrecursorIon>,
}

impl RawSpectrum {
    /// Copy `peaks` into a new spectrum, sorting them by m/z and re-indexing them
    pub fn new<C: CentroidLike>(peaks: &[C], ms_level: u8) -> Self {
        let peaks: Vec<CentroidPeak> = peaks
            .iter()
            .enumerate()
            .map(|(i, p)| CentroidPeak::new(p.mz(), p.intensity(), i as IndexType))
            .collect();
        Self {
            peaks: MZPeakSetType::new(peaks),
            ms_level,
            precursor: None,
        }
    }

    pub fn with_precursor(mut self, precursor: PrecursorIon) -> Self {
        self.precursor = Some(precursor);
        self
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    /// The log m/z peaks of this spectrum under a polarity, minus any excluded m/z values
    pub fn log_mz_peaks(&self, is_positive: bool, excluded_mzs: &[f64]) -> Vec<LogMzPeak> {
        log_mz_peaks(self.peaks.as_slice(), is_positive, excluded_mzs)
    }
}

#[cfg(test)]
mod test {
    use mzpeaks::CentroidPeak;

    use super::*;

    #[test]
    fn test_uncharged_mass() {
        let peak = LogMzPeak::new(1001.007276, 100.0, true, 0);
        assert_eq!(peak.uncharged_mass(), 0.0);
        assert!((peak.log_mz - 1000f64.ln()).abs() < 1e-6);

        let peak = peak.assigned(3, 1);
        assert!((peak.uncharged_mass() - 3000.0).abs() < 1e-3);
        assert_eq!(peak.isotope_index, 1);

        let neg = LogMzPeak::new(998.992724, 100.0, false, 0).assigned(2, 0);
        assert!((neg.uncharged_mass() - 2000.0).abs() < 1e-3);
    }

    #[test]
    fn test_preprocess() {
        let peaks = vec![
            CentroidPeak::new(500.0, 10.0, 0),
            CentroidPeak::new(400.0, 0.0, 1),
            CentroidPeak::new(300.0, 5.0, 2),
            CentroidPeak::new(600.0, -1.0, 3),
            CentroidPeak::new(700.0, 1.0, 4),
        ];
        let log_peaks = log_mz_peaks(&peaks, true, &[]);
        let mzs: Vec<_> = log_peaks.iter().map(|p| p.mz).collect();
        assert_eq!(mzs, vec![300.0, 500.0, 700.0]);
        assert!(log_peaks.windows(2).all(|w| w[0].log_mz < w[1].log_mz));

        let log_peaks = log_mz_peaks(&peaks, true, &[500.0, 700.0]);
        assert_eq!(log_peaks.len(), 1);
        assert_eq!(log_peaks[0].index, 2);
    }

    #[test]
    fn test_nominal_mass() {
        assert_eq!(nominal_mass(1000.5), 1000);
        assert_eq!(nominal_mass(1000.0), 999);
        assert_eq!(nominal_mass(10000.0), 9995);
    }

    #[test]
    fn test_raw_spectrum() {
        let peaks = vec![
            CentroidPeak::new(700.0, 1.0, 0),
            CentroidPeak::new(300.0, 5.0, 1),
            CentroidPeak::new(500.0, 0.0, 2),
        ];
        let spectrum = RawSpectrum::new(&peaks, 2).with_precursor(PrecursorIon::new(
            650.5,
            Some(2),
            vec![ActivationMethod::HCD],
        ));
        assert_eq!(spectrum.len(), 3);
        assert_eq!(spectrum.peaks[0].mz, 300.0);
        let log_peaks = spectrum.log_mz_peaks(true, &[]);
        assert_eq!(log_peaks.len(), 2);
        assert_eq!(
            spectrum.precursor.as_ref().and_then(|p| p.activation_method()),
            Some(ActivationMethod::HCD)
        );
    }
}
