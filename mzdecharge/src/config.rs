//! Deconvolution parameters and how they are loaded.
//!
//! Parameters layer serialized defaults, an optional TOML file and `MZDECHARGE_` prefixed
//! environment variables, in that order.
use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::isotopic_model::IsotopicModels;
use crate::scorer::ScoreType;

/// The environment variable prefix read by [`DeconvolutionParams::load`]
pub const ENV_PREFIX: &str = "MZDECHARGE_";

/// The absolute cosine margin an isotope decoy must fall below its target by
pub const DEFAULT_ISOTOPE_DECOY_MARGIN: ScoreType = 0.0026;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Charge bounds must be non-zero, got ({0}, {1})")]
    InvalidChargeRange(i32, i32),
    #[error("Mass bounds must be positive, got ({0}, {1})")]
    InvalidMassRange(f64, f64),
    #[error("Tolerances must be positive, got {0} ppm")]
    InvalidTolerance(f64),
    #[error("{0} must have at least one entry")]
    EmptyParameterList(&'static str),
    #[error("Failed to read configuration: {0}")]
    Extraction(
        #[source]
        #[from]
        figment::Error,
    ),
}

/// Every tunable of the deconvolution engine.
///
/// Lists named per MS level are indexed by `ms_level - 1`, and MS levels past the end of a
/// list use its last entry. The sign of `min_charge` selects the polarity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeconvolutionParams {
    /// m/z tolerance in ppm per MS level
    pub tolerance: Vec<f64>,
    pub min_mass: f64,
    pub max_mass: f64,
    pub min_charge: i32,
    pub max_charge: i32,
    pub min_isotope_cosine: Vec<ScoreType>,
    pub min_snr: Vec<ScoreType>,
    pub max_qvalue: Vec<ScoreType>,
    /// How many isotopes an isotope decoy must be shifted by at least, minus one
    pub allowed_isotope_error: i32,
    pub min_support_peak_count: usize,
    /// A fixed signed precursor charge for MSn spectra, 0 when unset
    pub precursor_charge: i32,
    /// A precursor m/z overriding the spectrum's own, 0 when unset
    pub precursor_mz: f64,
    pub target_masses: Vec<f64>,
    pub excluded_masses: Vec<f64>,
    pub averagine: IsotopicModels,
    pub isotope_decoy_margin: ScoreType,
}

impl Default for DeconvolutionParams {
    fn default() -> Self {
        Self {
            tolerance: vec![10.0, 10.0],
            min_mass: 50.0,
            max_mass: 100000.0,
            min_charge: 1,
            max_charge: 100,
            min_isotope_cosine: vec![0.8, 0.8],
            min_snr: vec![1.0, 1.0],
            max_qvalue: vec![1.0, 1.0],
            allowed_isotope_error: 1,
            min_support_peak_count: 2,
            precursor_charge: 0,
            precursor_mz: 0.0,
            target_masses: Vec::new(),
            excluded_masses: Vec::new(),
            averagine: IsotopicModels::Peptide,
            isotope_decoy_margin: DEFAULT_ISOTOPE_DECOY_MARGIN,
        }
    }
}

fn per_level<T: Copy>(values: &[T], ms_level: u8) -> Option<T> {
    if ms_level == 0 {
        return None;
    }
    let i = (ms_level as usize - 1).min(values.len().checked_sub(1)?);
    values.get(i).copied()
}

impl DeconvolutionParams {
    /// Check the parameters, swapping inverted charge and mass bounds.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.min_charge == 0 || self.max_charge == 0 {
            return Err(ConfigError::InvalidChargeRange(
                self.min_charge,
                self.max_charge,
            ));
        }
        let sign = self.min_charge.signum();
        let (lo, hi) = (self.min_charge.abs(), self.max_charge.abs());
        self.min_charge = sign * lo.min(hi);
        self.max_charge = sign * lo.max(hi);

        if !(self.min_mass > 0.0 && self.max_mass > 0.0) {
            return Err(ConfigError::InvalidMassRange(self.min_mass, self.max_mass));
        }
        if self.min_mass > self.max_mass {
            std::mem::swap(&mut self.min_mass, &mut self.max_mass);
        }

        if self.tolerance.is_empty() {
            return Err(ConfigError::EmptyParameterList("tolerance"));
        }
        if let Some(bad) = self.tolerance.iter().find(|t| !(**t > 0.0)) {
            return Err(ConfigError::InvalidTolerance(*bad));
        }
        for (name, list) in [
            ("min_isotope_cosine", &self.min_isotope_cosine),
            ("min_snr", &self.min_snr),
            ("max_qvalue", &self.max_qvalue),
        ] {
            if list.is_empty() {
                return Err(ConfigError::EmptyParameterList(name));
            }
        }
        self.min_support_peak_count = self.min_support_peak_count.max(1);
        self.allowed_isotope_error = self.allowed_isotope_error.max(0);
        Ok(self)
    }

    /// Extract and validate parameters from an assembled [`Figment`]
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let params: Self = figment.extract()?;
        params.validate()
    }

    /// The default figment: defaults, then `path` if given, then the environment
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file_exact(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment(path))
    }

    pub fn is_positive(&self) -> bool {
        self.min_charge > 0
    }

    /// The absolute charge bounds, `(min, max)`
    pub fn abs_charge_range(&self) -> (i32, i32) {
        let (a, b) = (self.min_charge.abs(), self.max_charge.abs());
        (a.min(b), a.max(b))
    }

    /// The relative tolerance at `ms_level`, no longer in ppm
    pub fn relative_tolerance(&self, ms_level: u8) -> Option<f64> {
        per_level(&self.tolerance, ms_level).map(|t| t / 1e6)
    }

    pub fn min_isotope_cosine(&self, ms_level: u8) -> Option<ScoreType> {
        per_level(&self.min_isotope_cosine, ms_level)
    }

    pub fn min_snr(&self, ms_level: u8) -> Option<ScoreType> {
        per_level(&self.min_snr, ms_level)
    }

    pub fn max_qvalue(&self, ms_level: u8) -> Option<ScoreType> {
        per_level(&self.max_qvalue, ms_level)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let params = DeconvolutionParams::default().validate().unwrap();
        assert!(params.is_positive());
        assert_eq!(params.abs_charge_range(), (1, 100));
        assert_eq!(params.relative_tolerance(1), Some(10e-6));
        assert_eq!(params.relative_tolerance(3), Some(10e-6));
        assert_eq!(params.relative_tolerance(0), None);
    }

    #[test]
    fn test_normalize_bounds() {
        let params = DeconvolutionParams {
            min_charge: -30,
            max_charge: -2,
            min_mass: 5000.0,
            max_mass: 100.0,
            tolerance: vec![5.0, 20.0, 30.0],
            ..Default::default()
        }
        .validate()
        .unwrap();
        assert!(!params.is_positive());
        assert_eq!(params.abs_charge_range(), (2, 30));
        assert_eq!((params.min_mass, params.max_mass), (100.0, 5000.0));
        assert_eq!(params.relative_tolerance(2), Some(20e-6));
        assert_eq!(params.min_snr(5), Some(1.0));
    }

    #[test]
    fn test_invalid() {
        let bad_charge = DeconvolutionParams {
            min_charge: 0,
            ..Default::default()
        };
        assert!(matches!(
            bad_charge.validate(),
            Err(ConfigError::InvalidChargeRange(0, 100))
        ));

        let bad_tol = DeconvolutionParams {
            tolerance: vec![10.0, -1.0],
            ..Default::default()
        };
        assert!(matches!(
            bad_tol.validate(),
            Err(ConfigError::InvalidTolerance(_))
        ));

        let empty = DeconvolutionParams {
            min_snr: vec![],
            ..Default::default()
        };
        assert!(matches!(
            empty.validate(),
            Err(ConfigError::EmptyParameterList("min_snr"))
        ));

        let bad_mass = DeconvolutionParams {
            min_mass: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            bad_mass.validate(),
            Err(ConfigError::InvalidMassRange(..))
        ));
    }

    #[test]
    fn test_figment_layering() {
        let figment = Figment::from(Serialized::defaults(DeconvolutionParams::default())).merge(
            Toml::string(
                r#"
                tolerance = [5.0]
                max_charge = 40
                averagine = "NucleicAcid"
                target_masses = [12000.5]
                "#,
            ),
        );
        let params = DeconvolutionParams::from_figment(figment).unwrap();
        assert_eq!(params.tolerance, vec![5.0]);
        assert_eq!(params.relative_tolerance(2), Some(5e-6));
        assert_eq!(params.abs_charge_range(), (1, 40));
        assert_eq!(params.averagine, IsotopicModels::NucleicAcid);
        assert_eq!(params.target_masses, vec![12000.5]);
        assert_eq!(params.min_mass, 50.0);
    }

    #[test]
    fn test_figment_rejects_invalid() {
        let figment = Figment::from(Serialized::defaults(DeconvolutionParams::default()))
            .merge(Toml::string("tolerance = []"));
        assert!(matches!(
            DeconvolutionParams::from_figment(figment),
            Err(ConfigError::EmptyParameterList("tolerance"))
        ));
    }
}
