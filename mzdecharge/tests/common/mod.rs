#![allow(dead_code)]
use std::ops::RangeInclusive;

use mzpeaks::CentroidPeak;
use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;

use mzdecharge::averagine::PrecalculatedAveragine;
use mzdecharge::isotopic_model::PROTON;
use mzdecharge::{DeconvolutionParams, DeconvolvedSpectrum, PeakGroup};

pub fn params() -> DeconvolutionParams {
    DeconvolutionParams {
        max_mass: 25000.0,
        max_charge: 40,
        ..Default::default()
    }
}

/// The averagine isotope envelope of `mass` at every charge in `charges`
pub fn envelope(
    averagine: &PrecalculatedAveragine,
    mass: f64,
    charges: RangeInclusive<i32>,
    scale: f64,
) -> Vec<CentroidPeak> {
    let iso = averagine.isotope_da_distance();
    let dist = averagine.get(mass);
    let mut peaks = Vec::new();
    for z in charges {
        for (i, abundance) in dist.as_slice().iter().enumerate() {
            if *abundance < 0.02 {
                continue;
            }
            let mz = (mass + i as f64 * iso) / z as f64 + PROTON;
            peaks.push(CentroidPeak::new(mz, (abundance * scale) as f32, 0));
        }
    }
    peaks
}

/// Jitter intensities by a few percent and scatter weak noise peaks over `mz_range`
pub fn add_noise(peaks: &mut Vec<CentroidPeak>, n_noise: usize, mz_range: (f64, f64), seed: u64) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    for p in peaks.iter_mut() {
        p.intensity *= rng.gen_range(0.95..1.05);
    }
    for _ in 0..n_noise {
        peaks.push(CentroidPeak::new(
            rng.gen_range(mz_range.0..mz_range.1),
            rng.gen_range(10.0..200.0),
            0,
        ));
    }
}

pub fn find_mass(spectrum: &DeconvolvedSpectrum, mass: f64, ppm: f64) -> Option<&PeakGroup> {
    spectrum
        .iter()
        .filter(|pg| (pg.monoisotopic_mass() - mass).abs() <= mass * ppm * 1e-6)
        .max_by(|a, b| a.snr().total_cmp(&b.snr()))
}
