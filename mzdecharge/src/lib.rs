//! Charge state deconvolution of high resolution mass spectra into neutral monoisotopic masses.
//!
//! Peaks are moved onto a logarithmic m/z axis where every charge state is a fixed offset, so
//! candidate masses can be voted for bin by bin. Candidates are then collected into peak groups,
//! scored against an averagine isotopic model and pruned of overlaps, charge errors and
//! harmonics. Decoy searches support target/decoy q-value estimation.
//!
//! Start from [`DeconvolutionEngine`] or the single-shot [`deconvolute_spectrum`].
pub mod averagine;
pub mod bins;
pub mod charge;
pub mod isotopic_model;
pub mod peaks;
pub mod scorer;

pub mod assembler;
pub mod candidates;
pub mod filters;
pub mod peak_group;

pub mod config;
pub mod decoy;
pub mod spectrum;

pub mod api;
pub mod deconvoluter;

pub use crate::api::{deconvolute_spectrum, DeconvolutionEngine};
pub use crate::config::{ConfigError, DeconvolutionParams};
pub use crate::deconvoluter::DeconvolutionError;
pub use crate::decoy::TargetDecoyType;
pub use crate::isotopic_model::IsotopicModels;
pub use crate::peak_group::PeakGroup;
pub use crate::peaks::{ActivationMethod, PrecursorIon, RawSpectrum};
pub use crate::spectrum::DeconvolvedSpectrum;
