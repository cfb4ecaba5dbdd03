//! High level APIs for running charge deconvolution
use std::sync::Arc;

use mzpeaks::CentroidLike;

use crate::averagine::PrecalculatedAveragine;
use crate::config::DeconvolutionParams;
use crate::deconvoluter::{
    expand_excluded_masses, expand_target_masses, DeconvolutionError, SpectrumDeconvoluter,
};
use crate::decoy::{estimate_qvalues, DecoyContext, TargetDecoyType};
use crate::peak_group::PeakGroup;
use crate::peaks::RawSpectrum;
use crate::scorer::LogisticQScorer;
use crate::spectrum::DeconvolvedSpectrum;

/// A single-shot charge deconvolution of the provided peak list.
///
/// # Arguments
/// - `peaks`: The centroided mass spectrum to process
/// - `ms_level`: The MS level of the spectrum, which selects the per-level parameters
/// - `params`: The deconvolution parameters, validated before use
///
/// # Note
/// Building the averagine table dominates the cost of this call. If you are deconvolving
/// many spectra with the same parameters, create a [`DeconvolutionEngine`] and call
/// [`DeconvolutionEngine::deconvolute`] instead so the table is built once.
///
/// # See also
/// [`DeconvolutionEngine::deconvolute`]
pub fn deconvolute_spectrum<C: CentroidLike>(
    peaks: &[C],
    ms_level: u8,
    params: DeconvolutionParams,
) -> Result<DeconvolvedSpectrum, DeconvolutionError> {
    let engine = DeconvolutionEngine::new(params)?;
    engine.deconvolute(RawSpectrum::new(peaks, ms_level), 0, None)
}

/// A state-manager for charge deconvolution holding validated parameters and the averagine
/// table derived from them.
///
/// The engine holds no per-spectrum state, so one instance may deconvolve any number of
/// spectra, from any number of threads.
#[derive(Debug, Clone)]
pub struct DeconvolutionEngine {
    params: DeconvolutionParams,
    averagine: Arc<PrecalculatedAveragine>,
    /// Sorted target masses, each followed by its next isotope
    target_masses: Vec<f64>,
    /// Sorted excluded masses over their isotope envelopes
    excluded_masses: Vec<f64>,
    qscorer: LogisticQScorer,
}

impl DeconvolutionEngine {
    /// Create a new [`DeconvolutionEngine`], validating `params` and building the averagine
    /// table up to its maximum mass.
    pub fn new(params: DeconvolutionParams) -> Result<Self, DeconvolutionError> {
        let params = params.validate()?;
        let averagine = Arc::new(PrecalculatedAveragine::for_max_mass(
            params.max_mass,
            params.averagine,
        ));
        Ok(Self::with_averagine(params, averagine))
    }

    /// Create a new [`DeconvolutionEngine`] sharing an already built averagine table.
    ///
    /// `params` are assumed to be valid.
    pub fn with_averagine(
        params: DeconvolutionParams,
        averagine: Arc<PrecalculatedAveragine>,
    ) -> Self {
        let target_masses =
            expand_target_masses(&params.target_masses, averagine.isotope_da_distance());
        let excluded_masses = expand_excluded_masses(&params.excluded_masses, &averagine);
        Self {
            params,
            averagine,
            target_masses,
            excluded_masses,
            qscorer: LogisticQScorer::default(),
        }
    }

    /// Replace the Qscore model
    pub fn with_qscorer(mut self, qscorer: LogisticQScorer) -> Self {
        self.qscorer = qscorer;
        self
    }

    pub fn params(&self) -> &DeconvolutionParams {
        &self.params
    }

    pub fn averagine(&self) -> &PrecalculatedAveragine {
        &self.averagine
    }

    pub fn target_masses(&self) -> &[f64] {
        &self.target_masses
    }

    pub fn excluded_masses(&self) -> &[f64] {
        &self.excluded_masses
    }

    fn run(
        &self,
        decoy: &DecoyContext,
        spectrum: Arc<RawSpectrum>,
        scan_number: u32,
        precursor_peak_group: Option<&PeakGroup>,
    ) -> Result<DeconvolvedSpectrum, DeconvolutionError> {
        SpectrumDeconvoluter::new(
            &self.params,
            &self.averagine,
            decoy,
            &self.target_masses,
            &self.excluded_masses,
        )
        .with_qscorer(self.qscorer)
        .deconvolute(spectrum, scan_number, precursor_peak_group)
    }

    /// Deconvolve `spectrum` into neutral monoisotopic masses.
    ///
    /// # Arguments
    /// - `spectrum`: The centroided spectrum to process
    /// - `scan_number`: An identifier carried onto the result and its peak groups
    /// - `precursor_peak_group`: For MSn spectra, the precursor's peak group found in the
    ///   prior MS1 spectrum. It bounds the charges and masses searched.
    ///
    /// An empty spectrum, or one with nothing passing the score gates, yields an empty
    /// [`DeconvolvedSpectrum`] rather than an error.
    pub fn deconvolute<S: Into<Arc<RawSpectrum>>>(
        &self,
        spectrum: S,
        scan_number: u32,
        precursor_peak_group: Option<&PeakGroup>,
    ) -> Result<DeconvolvedSpectrum, DeconvolutionError> {
        self.run(
            &DecoyContext::target(),
            spectrum.into(),
            scan_number,
            precursor_peak_group,
        )
    }

    /// Repeat the search that produced `target` as a decoy search of type `kind`.
    ///
    /// # Arguments
    /// - `target`: The result of [`DeconvolutionEngine::deconvolute`] on the same spectrum
    /// - `kind`: Which decoy to run. [`TargetDecoyType::Target`] simply repeats the search.
    ///
    /// Every returned peak group is labeled with `kind`.
    pub fn deconvolute_decoy(
        &self,
        target: &DeconvolvedSpectrum,
        kind: TargetDecoyType,
    ) -> Result<DeconvolvedSpectrum, DeconvolutionError> {
        let decoy = DecoyContext::from_target_spectrum(kind, target);
        self.run(
            &decoy,
            target.original.clone(),
            target.scan_number,
            target.precursor_peak_group.as_ref(),
        )
    }

    /// Estimate q-values for every target peak group from the decoy searches, then drop
    /// target peak groups above their MS level's maximum q-value.
    pub fn estimate_qvalues(
        &self,
        targets: &mut [DeconvolvedSpectrum],
        decoys: &[DeconvolvedSpectrum],
    ) {
        estimate_qvalues(targets, decoys);
        self.apply_qvalue_threshold(targets);
    }

    /// Drop peak groups above their MS level's maximum q-value
    pub fn apply_qvalue_threshold(&self, spectra: &mut [DeconvolvedSpectrum]) {
        for spectrum in spectra.iter_mut() {
            if let Some(max_qvalue) = self.params.max_qvalue(spectrum.ms_level()) {
                spectrum.retain_qvalue(max_qvalue);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use mzpeaks::CentroidPeak;

    use super::*;

    #[test]
    fn test_engine_construction() {
        let params = DeconvolutionParams {
            max_mass: 20000.0,
            target_masses: vec![5000.0],
            excluded_masses: vec![8000.0],
            ..Default::default()
        };
        let engine = DeconvolutionEngine::new(params).unwrap();
        assert_eq!(engine.target_masses().len(), 2);
        assert!(engine.excluded_masses().len() > 2);
        assert!(engine.averagine().max_mass() >= 20000.0);

        let bad = DeconvolutionParams {
            tolerance: vec![],
            ..Default::default()
        };
        assert!(matches!(
            DeconvolutionEngine::new(bad),
            Err(DeconvolutionError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_empty_spectrum() {
        let peaks: Vec<CentroidPeak> = Vec::new();
        let params = DeconvolutionParams {
            max_mass: 5000.0,
            ..Default::default()
        };
        let result = deconvolute_spectrum(&peaks, 1, params).unwrap();
        assert!(result.is_empty());
        assert_eq!(result.ms_level(), 1);
    }
}
