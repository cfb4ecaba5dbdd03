//! Deconvolve a synthetic spectrum made of two overlapping protein charge state envelopes
//! sitting on low level noise, then estimate q-values with a noise decoy search.
use std::collections::BTreeMap;
use std::io;

use mzpeaks::CentroidPeak;
use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::EnvFilter;

use mzdecharge::isotopic_model::PROTON;
use mzdecharge::{DeconvolutionEngine, DeconvolutionParams, RawSpectrum, TargetDecoyType};

fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let params = DeconvolutionParams {
        max_mass: 30000.0,
        max_charge: 40,
        ..Default::default()
    };
    let engine = DeconvolutionEngine::new(params).map_err(io::Error::other)?;
    let averagine = engine.averagine();
    let iso = averagine.isotope_da_distance();

    let mut rng = ChaCha8Rng::seed_from_u64(17);
    let mut peaks = Vec::new();
    for (mass, charges, scale) in [(12_345.6, 9..=18, 1e6), (23_456.7, 15..=28, 5e5)] {
        let dist = averagine.get(mass);
        for z in charges {
            for (i, abundance) in dist.as_slice().iter().enumerate() {
                if *abundance < 0.02 {
                    continue;
                }
                let mz = (mass + i as f64 * iso) / z as f64 + PROTON;
                let intensity = (abundance * scale * rng.gen_range(0.9..1.1)) as f32;
                peaks.push(CentroidPeak::new(mz, intensity, 0));
            }
        }
    }
    for _ in 0..500 {
        peaks.push(CentroidPeak::new(
            rng.gen_range(400.0..2500.0),
            rng.gen_range(10.0..1000.0),
            0,
        ));
    }

    let spectrum = RawSpectrum::new(&peaks, 1);
    let target = engine
        .deconvolute(spectrum, 1, None)
        .map_err(io::Error::other)?;
    let decoy = engine
        .deconvolute_decoy(&target, TargetDecoyType::NoiseDecoy)
        .map_err(io::Error::other)?;

    let mut targets = vec![target];
    engine.estimate_qvalues(&mut targets, &[decoy]);

    let mut by_charge: BTreeMap<i32, usize> = BTreeMap::new();
    for pg in targets[0].iter() {
        *by_charge.entry(pg.representative_abs_charge()).or_default() += 1;
        eprintln!(
            "{:.4} Da z={}-{} cos={:.3} SNR={:.2} Q={:.3} q={:.3}",
            pg.monoisotopic_mass(),
            pg.min_abs_charge(),
            pg.max_abs_charge(),
            pg.isotope_cosine(),
            pg.snr(),
            pg.qscore(),
            pg.qvalue()
        );
    }
    for (z, count) in by_charge {
        eprintln!("representative charge {z} => {count}");
    }
    eprintln!("{} raw peaks, {} masses", peaks.len(), targets[0].len());
    Ok(())
}
