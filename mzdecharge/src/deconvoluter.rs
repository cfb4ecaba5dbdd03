//! Per-spectrum orchestration of the charge deconvolution pipeline.
//!
//! A [`SpectrumDeconvoluter`] borrows everything that stays fixed between spectra and runs
//! one spectrum through preprocessing, binning, candidate mass generation, peak group
//! assembly, scoring and the pruning passes.
use std::sync::Arc;

use crossbeam_channel::unbounded;
use itertools::Itertools;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::assembler::PeakGroupAssembler;
use crate::averagine::PrecalculatedAveragine;
use crate::bins::{BinningIndex, BitSet};
use crate::candidates::CandidateMassGenerator;
use crate::charge::{ChargeFilters, LOW_CHARGE_THRESHOLD};
use crate::config::{ConfigError, DeconvolutionParams};
use crate::decoy::{DecoyContext, TargetDecoyType};
use crate::filters::{
    remove_charge_error_peak_groups, remove_excluded_masses, remove_harmonic_peak_groups,
    remove_overlapping_peak_groups,
};
use crate::peak_group::{PeakGroup, ScoringContext};
use crate::peaks::{charge_mass, RawSpectrum};
use crate::scorer::{isotope_cosine_and_offset, IsotopeOffsetSearch, LogisticQScorer, ScoreType};
use crate::spectrum::DeconvolvedSpectrum;

/// The furthest, in Daltons, refinement may move a candidate's monoisotopic mass
pub const MAX_REFINEMENT_MASS_SHIFT: f64 = 3.0;

/// An error that might occur during deconvolution
#[derive(Debug, Error)]
pub enum DeconvolutionError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(
        #[source]
        #[from]
        ConfigError,
    ),
    #[error("MS level {0} cannot be deconvolved")]
    InvalidMSLevel(u8),
}

/// Expand target masses to their monoisotopic and first isotope masses, sorted
pub fn expand_target_masses(masses: &[f64], isotope_da_distance: f64) -> Vec<f64> {
    masses
        .iter()
        .flat_map(|m| (0..=1).map(move |k| m + k as f64 * isotope_da_distance))
        .sorted_by(|a, b| a.total_cmp(b))
        .collect()
}

/// Expand excluded masses over every isotope up to just past the averagine span, sorted
pub fn expand_excluded_masses(masses: &[f64], averagine: &PrecalculatedAveragine) -> Vec<f64> {
    let iso = averagine.isotope_da_distance();
    masses
        .iter()
        .flat_map(|m| {
            let last = averagine.apex_index(*m) + averagine.right_count_from_apex(*m) + 1;
            (0..=last).map(move |k| m + k as f64 * iso)
        })
        .sorted_by(|a, b| a.total_cmp(b))
        .collect()
}

fn has_mass_within(sorted: &[f64], mass: f64, delta: f64) -> bool {
    let start = sorted.partition_point(|m| *m <= mass - delta);
    sorted[start..]
        .iter()
        .take_while(|m| **m < mass + delta)
        .next()
        .is_some()
}

/// The spectrum-level bounds one deconvolution runs under
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectrumBounds {
    pub ms_level: u8,
    pub relative_tolerance: f64,
    pub min_isotope_cosine: ScoreType,
    pub min_snr: ScoreType,
    pub max_qvalue: ScoreType,
    pub min_mass: f64,
    pub max_mass: f64,
    pub min_abs_charge: i32,
    pub max_abs_charge: i32,
    pub is_positive: bool,
}

/// Runs the deconvolution pipeline over one spectrum at a time
#[derive(Debug, Clone, Copy)]
pub struct SpectrumDeconvoluter<'a> {
    pub params: &'a DeconvolutionParams,
    pub averagine: &'a PrecalculatedAveragine,
    pub decoy: &'a DecoyContext,
    /// Sorted, expanded target masses
    pub target_masses: &'a [f64],
    /// Sorted, expanded excluded masses
    pub excluded_masses: &'a [f64],
    pub qscorer: LogisticQScorer,
}

impl<'a> SpectrumDeconvoluter<'a> {
    pub fn new(
        params: &'a DeconvolutionParams,
        averagine: &'a PrecalculatedAveragine,
        decoy: &'a DecoyContext,
        target_masses: &'a [f64],
        excluded_masses: &'a [f64],
    ) -> Self {
        Self {
            params,
            averagine,
            decoy,
            target_masses,
            excluded_masses,
            qscorer: LogisticQScorer::default(),
        }
    }

    pub fn with_qscorer(mut self, qscorer: LogisticQScorer) -> Self {
        self.qscorer = qscorer;
        self
    }

    #[inline]
    fn isotope_da_distance(&self) -> f64 {
        self.decoy
            .isotope_da_distance(self.averagine.isotope_da_distance())
    }

    /// A precursor peak group for a fixed precursor charge, if one is configured and the
    /// precursor m/z is known
    fn configured_precursor(&self, spectrum: &RawSpectrum) -> Option<PeakGroup> {
        let z = self.params.precursor_charge;
        if z == 0 {
            return None;
        }
        let mz = if self.params.precursor_mz > 0.0 {
            self.params.precursor_mz
        } else if let Some(precursor) = spectrum.precursor.as_ref() {
            precursor.mz
        } else {
            warn!("A fixed precursor charge was configured but the spectrum has no precursor m/z");
            return None;
        };
        let abs_charge = z.abs();
        let mass = (mz - charge_mass(z > 0)) * abs_charge as f64;
        let mut group = PeakGroup::with_mass(mass, 1, abs_charge, z > 0);
        group.snr = 1.0;
        group.qscore = 1.0;
        group.representative_abs_charge = abs_charge;
        group.per_charge_snr = vec![0.0; abs_charge as usize];
        group.per_charge_snr[abs_charge as usize - 1] = 1.0;
        Some(group)
    }

    /// Work out the MS level dependent bounds, narrowed by the precursor when there is one
    pub fn bounds_for(
        &self,
        ms_level: u8,
        precursor_mass_and_charge: Option<(f64, i32)>,
    ) -> Result<SpectrumBounds, DeconvolutionError> {
        let invalid = || DeconvolutionError::InvalidMSLevel(ms_level);
        let params = self.params;
        let (min_abs_charge, mut max_abs_charge) = params.abs_charge_range();
        let mut max_mass = params.max_mass;
        if let Some((mass, z)) = precursor_mass_and_charge {
            if mass > 0.0 {
                max_mass = max_mass.min(mass);
            }
            if z != 0 {
                max_abs_charge = max_abs_charge.min(z.abs());
            }
        }
        Ok(SpectrumBounds {
            ms_level,
            relative_tolerance: params.relative_tolerance(ms_level).ok_or_else(invalid)?,
            min_isotope_cosine: params.min_isotope_cosine(ms_level).ok_or_else(invalid)?,
            min_snr: params.min_snr(ms_level).ok_or_else(invalid)?,
            max_qvalue: params.max_qvalue(ms_level).ok_or_else(invalid)?,
            min_mass: params.min_mass,
            max_mass,
            min_abs_charge,
            max_abs_charge,
            is_positive: params.is_positive(),
        })
    }

    /// Deconvolve `spectrum` into a [`DeconvolvedSpectrum`].
    ///
    /// For MSn spectra, `precursor_peak_group` is the precursor's peak group from the prior
    /// MS1 spectrum, which bounds the charges and masses searched here. A fixed precursor
    /// charge in the parameters takes its place.
    #[tracing::instrument(skip_all, level = "debug", fields(scan_number = scan_number))]
    pub fn deconvolute(
        &self,
        spectrum: Arc<RawSpectrum>,
        scan_number: u32,
        precursor_peak_group: Option<&PeakGroup>,
    ) -> Result<DeconvolvedSpectrum, DeconvolutionError> {
        let ms_level = spectrum.ms_level;
        if ms_level == 0 {
            return Err(DeconvolutionError::InvalidMSLevel(ms_level));
        }
        let mut output = DeconvolvedSpectrum::new(spectrum.clone(), scan_number);
        if ms_level > 1 {
            output.precursor_peak_group = self
                .configured_precursor(&spectrum)
                .or_else(|| precursor_peak_group.cloned());
        }
        let precursor = output.precursor_peak_group.as_ref().map(|pg| {
            (
                pg.monoisotopic_mass(),
                output.precursor_charge().unwrap_or_default(),
            )
        });
        let bounds = self.bounds_for(ms_level, precursor)?;

        let peaks = spectrum.log_mz_peaks(bounds.is_positive, &self.decoy.excluded_peak_mzs);
        debug!(
            "Deconvolving {} peaks at MS level {ms_level} for charges {}-{} and masses up to {:.2}",
            peaks.len(),
            bounds.min_abs_charge,
            bounds.max_abs_charge,
            bounds.max_mass,
        );
        if peaks.is_empty() || bounds.max_abs_charge < 1 {
            return Ok(output);
        }

        let filters = ChargeFilters::new(bounds.max_abs_charge as usize);
        let Some(index) = BinningIndex::new(
            &peaks,
            &filters,
            bounds.relative_tolerance,
            self.params.min_support_peak_count,
            self.averagine,
            bounds.min_mass,
            bounds.max_mass,
        ) else {
            return Ok(output);
        };

        let isotope_da_distance = self.isotope_da_distance();
        let raw_groups = if self.decoy.kind == TargetDecoyType::IsotopeDecoy {
            self.decoy
                .target
                .as_ref()
                .map(|t| t.peak_groups.clone())
                .unwrap_or_default()
        } else {
            let decoy_mask = self.decoy.mass_bin_mask(&index);
            let target_bins = self.target_mass_bins(&index, isotope_da_distance);
            let candidates = CandidateMassGenerator::new(
                &index,
                self.params.min_support_peak_count,
                isotope_da_distance,
                ms_level,
            )
            .with_decoy_mask(decoy_mask.as_ref())
            .with_target_mass_bins(target_bins.as_ref())
            .generate();

            PeakGroupAssembler {
                index: &index,
                peaks: &peaks,
                averagine: self.averagine,
                relative_tolerance: bounds.relative_tolerance,
                isotope_da_distance,
                ms_level,
                min_mass: bounds.min_mass,
                max_mass: bounds.max_mass,
                is_positive: bounds.is_positive,
                scan_number,
                decoy_mask: decoy_mask.as_ref(),
            }
            .assemble_candidate_peak_groups(&candidates)
        };

        let ctx = ScoringContext {
            peaks: &peaks,
            averagine: self.averagine,
            relative_tolerance: bounds.relative_tolerance,
            min_isotope_cosine: bounds.min_isotope_cosine,
            isotope_da_distance,
            offset_search: if self.decoy.kind == TargetDecoyType::IsotopeDecoy {
                IsotopeOffsetSearch::SecondBest {
                    excluded_radius: self.params.allowed_isotope_error,
                }
            } else {
                IsotopeOffsetSearch::Best
            },
            qscorer: self.qscorer,
            max_abs_charge: bounds.max_abs_charge,
        };

        let selected = self.score_and_filter(raw_groups, &ctx, &bounds, scan_number);
        let groups = self.remove_redundant_peak_groups(selected, &ctx, &bounds);
        output.peak_groups = groups;
        output.sort();
        debug!("Reporting {} peak groups", output.len());
        Ok(output)
    }

    /// Mark the mass bins around the most abundant isotope of every target mass and its
    /// neighboring isotopes
    fn target_mass_bins(&self, index: &BinningIndex, isotope_da_distance: f64) -> Option<BitSet> {
        if self.target_masses.is_empty() {
            return None;
        }
        let mut bins = BitSet::new(index.mass_bin_count);
        for target in self.target_masses.iter().copied() {
            for offset in -1..=1 {
                let mass = target + offset as f64 * isotope_da_distance;
                if mass <= 0.0 {
                    continue;
                }
                let apex_mass = mass + self.averagine.most_abundant_mass_delta(mass);
                let j = index.mass_bin(apex_mass.ln());
                if j < 1 || j + 2 >= bins.len() {
                    continue;
                }
                bins.set(j - 1);
                bins.set(j);
                bins.set(j + 1);
            }
        }
        Some(bins)
    }

    fn is_targeted_mass(&self, mass: f64, relative_tolerance: f64) -> bool {
        !self.target_masses.is_empty()
            && has_mass_within(self.target_masses, mass, mass * relative_tolerance * 2.0)
    }

    /// Refine one raw peak group and decide whether it passes every gate
    pub fn score_peak_group(
        &self,
        raw: &PeakGroup,
        ctx: &ScoringContext,
        bounds: &SpectrumBounds,
        scan_number: u32,
    ) -> Option<PeakGroup> {
        let kind = self.decoy.kind;
        let mut seed = raw.clone();
        seed.target_decoy_type = kind;
        seed.scan_number = scan_number;
        seed.targeted = false;
        seed.qvalue = 1.0;
        let target_cosine = raw.isotope_cosine();

        let (_, initial_offset) = isotope_cosine_and_offset(
            seed.monoisotopic_mass,
            &seed.per_isotope_intensities,
            seed.isotope_index_origin,
            ctx.averagine,
            ctx.offset_search,
        );
        let initial_mass =
            seed.monoisotopic_mass + initial_offset as f64 * ctx.isotope_da_distance;

        let mut pg = seed.refine(ctx)?;
        let mass = pg.monoisotopic_mass();
        if pg.is_empty() || mass < bounds.min_mass || mass > bounds.max_mass {
            trace!("{mass:.4} is empty or out of bounds");
            return None;
        }
        if (initial_mass - mass).abs() > MAX_REFINEMENT_MASS_SHIFT {
            trace!("{mass:.4} moved too far from {initial_mass:.4} while refining");
            return None;
        }
        let (z1, z2) = pg.charge_range();
        if pg.representative_abs_charge() > LOW_CHARGE_THRESHOLD
            && ((z2 - z1) as usize) < self.params.min_support_peak_count
        {
            trace!("{mass:.4} spans too few charges ({z1}-{z2})");
            return None;
        }
        if kind == TargetDecoyType::IsotopeDecoy
            && pg.isotope_cosine() > target_cosine - self.params.isotope_decoy_margin
        {
            trace!("Isotope decoy at {mass:.4} scores too close to its target");
            return None;
        }

        pg.targeted = self.is_targeted_mass(mass, bounds.relative_tolerance);
        if !pg.targeted
            && (pg.qscore() <= 0.0
                || pg.qvalue() > bounds.max_qvalue
                || pg.snr() < bounds.min_snr)
        {
            trace!(
                "{mass:.4} failed the score gates: Q {:.3}, SNR {:.3}",
                pg.qscore(),
                pg.snr()
            );
            return None;
        }
        if self.decoy.is_decoy_mass(mass, bounds.relative_tolerance) {
            trace!("Charge decoy at {mass:.4} matches a target mass");
            return None;
        }
        Some(pg)
    }

    /// Score every raw peak group in parallel and keep those passing the gates, in their
    /// original order
    pub fn score_and_filter(
        &self,
        raw_groups: Vec<PeakGroup>,
        ctx: &ScoringContext,
        bounds: &SpectrumBounds,
        scan_number: u32,
    ) -> Vec<PeakGroup> {
        let (sender, receiver) = unbounded();
        raw_groups
            .par_iter()
            .enumerate()
            .for_each_with(sender, |sender, (i, raw)| {
                let verdict = self.score_peak_group(raw, ctx, bounds, scan_number);
                if sender.send((i, verdict)).is_err() {
                    warn!("Scoring verdict for candidate {i} was not received");
                }
            });

        let mut verdicts: Vec<Option<PeakGroup>> = vec![None; raw_groups.len()];
        for (i, verdict) in receiver.iter() {
            verdicts[i] = verdict;
        }
        let selected: Vec<PeakGroup> = verdicts.into_iter().flatten().collect();
        debug!(
            "{} of {} candidate peak groups passed scoring",
            selected.len(),
            raw_groups.len()
        );
        selected
    }

    /// Run the pruning passes in order
    pub fn remove_redundant_peak_groups(
        &self,
        groups: Vec<PeakGroup>,
        ctx: &ScoringContext,
        bounds: &SpectrumBounds,
    ) -> Vec<PeakGroup> {
        let groups = remove_overlapping_peak_groups(groups, 0.0);
        let groups = remove_overlapping_peak_groups(groups, bounds.relative_tolerance);
        let groups = remove_charge_error_peak_groups(
            groups,
            bounds.min_abs_charge,
            bounds.max_abs_charge,
            bounds.ms_level,
        );
        let groups =
            remove_excluded_masses(groups, self.excluded_masses, bounds.relative_tolerance);
        remove_harmonic_peak_groups(groups, ctx)
    }
}
